//! Command dispatcher
//!
//! Consumes command frames from the transport, routes them to the
//! subsystems and answers every command with exactly one acknowledgment
//! frame. Session validation, domain validation, start-permit evaluation
//! and the error-to-status mapping all live here, so the subsystems stay
//! free of wire-protocol concerns.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU16, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Instant;
use rand_core::RngCore;

use crate::bus::{Bus, Error as BusError};
use crate::gates::{Capability, ControllerProbe, GateId, GateInputs, SafetyGates, Subsystem, GATED_CONTROLLERS};
use crate::machine::{Error as MachineError, Machine, MachineState, RunMode, StopMode};
use crate::pid::{Error as PidError, PidManager};
use crate::relay::{ExpanderPort, RelayDriver, RelayState};
use crate::session::SessionManager;
use crate::settings::{Settings, SettingsStore};
use crate::telemetry::{Alarms, SnapshotSignal};
use crate::transport::{EventQueue, FrameSink, TxError};
use crate::wire::{self, detail, AckStatus, ByteReader, CommandId, Event, EventId, MsgType, Severity};

/// Frame-in, acks-and-side-effects-out command router.
pub struct Dispatcher<'a, E, B, R, F, S>
where
    E: ExpanderPort,
    B: Bus,
    R: RngCore,
    F: FrameSink,
    S: SettingsStore,
{
    session: &'a SessionManager,
    machine: &'a Machine<'a, E>,
    relays: &'a RelayDriver<E>,
    pid: &'a PidManager<'a, B>,
    gates: &'a SafetyGates,
    alarms: &'a Alarms,
    events: &'a EventQueue,
    store: &'a Mutex<CriticalSectionRawMutex, S>,
    sink: &'a F,
    snapshot_poke: &'a SnapshotSignal,
    persisted: BlockingMutex<CriticalSectionRawMutex, RefCell<Settings>>,
    rng: BlockingMutex<CriticalSectionRawMutex, RefCell<R>>,
    tx_seq: AtomicU16,
}

impl<'a, E, B, R, F, S> Dispatcher<'a, E, B, R, F, S>
where
    E: ExpanderPort,
    B: Bus,
    R: RngCore,
    F: FrameSink,
    S: SettingsStore,
{
    /// Wire up the dispatcher. `persisted` is the settings record loaded at
    /// boot; `rng` feeds session-id generation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: &'a SessionManager,
        machine: &'a Machine<'a, E>,
        relays: &'a RelayDriver<E>,
        pid: &'a PidManager<'a, B>,
        gates: &'a SafetyGates,
        alarms: &'a Alarms,
        events: &'a EventQueue,
        store: &'a Mutex<CriticalSectionRawMutex, S>,
        sink: &'a F,
        snapshot_poke: &'a SnapshotSignal,
        persisted: Settings,
        rng: R,
    ) -> Self {
        Self {
            session,
            machine,
            relays,
            pid,
            gates,
            alarms,
            events,
            store,
            sink,
            snapshot_poke,
            persisted: BlockingMutex::new(RefCell::new(persisted)),
            rng: BlockingMutex::new(RefCell::new(rng)),
            tx_seq: AtomicU16::new(0),
        }
    }

    fn post_event(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            warn!("event queue full, dropping event 0x{:04x}", event.id as u16);
        }
    }

    /// Transport connected: announce the client.
    pub fn on_connect(&self) {
        info!("client connected");
        self.post_event(Event::new(EventId::HmiConnected, Severity::Info));
    }

    /// Transport disconnected: the session dies with the link.
    pub fn on_disconnect(&self) {
        info!("client disconnected");
        self.session.force_expire();
        self.post_event(Event::new(EventId::HmiDisconnected, Severity::Warn));
    }

    async fn ack(&self, acked_seq: u16, cmd_id: u16, status: AckStatus, detail: u16, optional: &[u8]) {
        let mut frame = [0u8; 96];
        let seq = self.tx_seq.fetch_add(1, Ordering::Relaxed);
        let len = match wire::build_ack(&mut frame, seq, acked_seq, cmd_id, status, detail, optional) {
            Ok(len) => len,
            Err(e) => {
                error!("ack build failed: {:?}", e);
                return;
            }
        };

        // Critical commands prefer reliable delivery; everything else rides
        // a notification. Missing subscriptions never fail the command.
        let reliable = matches!(
            CommandId::from_raw(cmd_id),
            Some(CommandId::OpenSession | CommandId::StartRun | CommandId::StopRun)
        );
        match self.sink.send_ack(&frame[..len], reliable).await {
            Ok(()) | Err(TxError::NotSubscribed) | Err(TxError::NotConnected) => {}
            Err(e) => warn!("ack submit failed: {:?}", e),
        }
    }

    fn gate_inputs(&self) -> GateInputs {
        let mut controllers = [ControllerProbe::default(); GATED_CONTROLLERS];
        for (i, probe) in controllers.iter_mut().enumerate() {
            if let Some(ctrl) = self.pid.get(i) {
                probe.reachable = ctrl.state.reachable();
                probe.pv_x10 = ctrl.pv_x10();
            }
        }
        GateInputs {
            estop_active: self.machine.estop_active(),
            door_open: self.machine.door_open(),
            hmi_live: self.session.is_live(),
            controllers,
        }
    }

    fn controller_id_ok(&self, id: u8) -> bool {
        id >= 1 && usize::from(id) <= self.pid.count()
    }

    fn pid_failure(e: PidError) -> (AckStatus, u16) {
        match e {
            PidError::Bus(BusError::Busy) => (AckStatus::Busy, detail::NONE),
            PidError::Bus(_) => (AckStatus::Timeout, detail::BUS_TIMEOUT),
            PidError::VerifyMismatch(_) => (AckStatus::HwFault, detail::NONE),
            PidError::InvalidArg | PidError::Protected | PidError::NotFound => {
                (AckStatus::InvalidArgs, detail::OUT_OF_RANGE)
            }
        }
    }

    async fn persist(&self) {
        let snapshot = self.persisted.lock(|s| *s.borrow());
        let mut store = self.store.lock().await;
        if store.save(&snapshot).await.is_err() {
            warn!("settings persist failed");
        }
    }

    /// Parse the leading session id and check it against the live session.
    /// Acks REJECTED_POLICY on mismatch and returns `None`.
    async fn gated_session(&self, seq: u16, cmd_id: u16, reader: &mut ByteReader<'_>) -> Option<u32> {
        let Ok(id) = reader.u32() else {
            self.ack(seq, cmd_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
            return None;
        };
        if !self.session.is_valid(id) {
            warn!("command 0x{:04x} rejected: invalid session", cmd_id);
            self.ack(seq, cmd_id, AckStatus::RejectedPolicy, detail::INVALID_SESSION, &[]).await;
            return None;
        }
        Some(id)
    }

    /// Feed one received frame through parse, validation and routing.
    pub async fn on_frame(&self, bytes: &[u8], now: Instant) {
        let (header, payload) = match wire::parse_frame(bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Transient transport corruption surfaces nothing back.
                warn!("invalid frame ({} bytes): {:?}", bytes.len(), e);
                return;
            }
        };

        if header.msg_type != MsgType::Command {
            warn!("unexpected msg_type {:?}", header.msg_type);
            return;
        }
        if payload.len() < wire::CMD_HEADER_LEN {
            warn!("command payload too short");
            return;
        }

        let raw_id = u16::from_le_bytes([payload[0], payload[1]]);
        let body = &payload[wire::CMD_HEADER_LEN..];
        let seq = header.seq;

        let Some(cmd) = CommandId::from_raw(raw_id) else {
            warn!("unknown command 0x{:04x}", raw_id);
            self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
            return;
        };

        debug!("command 0x{:04x} seq={} body_len={}", raw_id, seq, body.len());

        // Any operator traffic except the automatic keepalive counts as
        // activity for the poller's idle timeout.
        if cmd != CommandId::Keepalive {
            self.pid.signal_activity(now);
        }

        let mut r = ByteReader::new(body);
        match cmd {
            CommandId::OpenSession => {
                let Ok(nonce) = r.u32() else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                let (session_id, lease_ms) = self.rng.lock(|rng| {
                    self.session.open(nonce, now, &mut *rng.borrow_mut())
                });
                let mut opt = [0u8; 6];
                opt[..4].copy_from_slice(&session_id.to_le_bytes());
                opt[4..].copy_from_slice(&lease_ms.to_le_bytes());
                self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &opt).await;
            }

            CommandId::Keepalive => {
                let Ok(id) = r.u32() else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                match self.session.keepalive(id, now) {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(_) => {
                        self.ack(seq, raw_id, AckStatus::RejectedPolicy, detail::INVALID_SESSION, &[]).await;
                    }
                }
            }

            CommandId::StartRun => {
                let Some(_) = self.gated_session(seq, raw_id, &mut r).await else {
                    return;
                };
                let (Ok(mode_raw), Ok(target), Ok(duration)) = (r.u8(), r.i16(), r.u32()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                let Some(mode) = RunMode::from_raw(mode_raw) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                };

                let permit = self.gates.can_start_run(&self.gate_inputs()).map_err(|g| g as u8);
                match self.machine.start_run(mode, target, duration, permit, now).await {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(MachineError::Interlocked) => {
                        let interlocks = self.machine.interlocks();
                        self.ack(seq, raw_id, AckStatus::RejectedPolicy, detail::INTERLOCKS, &[interlocks])
                            .await;
                    }
                    Err(_) => self.ack(seq, raw_id, AckStatus::NotReady, detail::NONE, &[]).await,
                }
            }

            CommandId::StopRun => {
                let Some(_) = self.gated_session(seq, raw_id, &mut r).await else {
                    return;
                };
                let Ok(mode_raw) = r.u8() else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                let Some(mode) = StopMode::from_raw(mode_raw) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                };
                match self.machine.stop_run(mode, now).await {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(_) => self.ack(seq, raw_id, AckStatus::NotReady, detail::NONE, &[]).await,
                }
            }

            CommandId::PauseRun | CommandId::ResumeRun => {
                let Some(_) = self.gated_session(seq, raw_id, &mut r).await else {
                    return;
                };
                let result = if cmd == CommandId::PauseRun {
                    self.machine.pause(now).await
                } else {
                    self.machine.resume(now).await
                };
                match result {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(_) => self.ack(seq, raw_id, AckStatus::NotReady, detail::NONE, &[]).await,
                }
            }

            CommandId::EnableService | CommandId::DisableService => {
                let Some(_) = self.gated_session(seq, raw_id, &mut r).await else {
                    return;
                };
                let result = if cmd == CommandId::EnableService {
                    self.machine.enter_service(now).await
                } else {
                    self.machine.exit_service(now).await
                };
                match result {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(_) => self.ack(seq, raw_id, AckStatus::NotReady, detail::NONE, &[]).await,
                }
            }

            CommandId::ClearEstop => {
                let Some(_) = self.gated_session(seq, raw_id, &mut r).await else {
                    return;
                };
                match self.machine.clear_estop(now).await {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(MachineError::ConditionActive) => {
                        self.ack(seq, raw_id, AckStatus::NotReady, detail::CONDITION_ACTIVE, &[]).await;
                    }
                    Err(_) => self.ack(seq, raw_id, AckStatus::NotReady, detail::NONE, &[]).await,
                }
            }

            CommandId::ClearFault | CommandId::ClearLatchedAlarms => {
                let Some(_) = self.gated_session(seq, raw_id, &mut r).await else {
                    return;
                };
                match self.machine.clear_fault(now).await {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(_) => self.ack(seq, raw_id, AckStatus::NotReady, detail::NONE, &[]).await,
                }
            }

            CommandId::SetRelay | CommandId::SetRelayMask => {
                // Manual relay control exists only in SERVICE, for a live HMI.
                if !self.session.is_live() {
                    self.ack(seq, raw_id, AckStatus::RejectedPolicy, detail::INVALID_SESSION, &[]).await;
                    return;
                }
                if self.machine.state() != MachineState::Service {
                    warn!("relay command outside SERVICE (state={})", self.machine.state().as_str());
                    self.ack(seq, raw_id, AckStatus::NotReady, detail::NONE, &[]).await;
                    return;
                }
                let (Ok(first), Ok(second)) = (r.u8(), r.u8()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };

                let result = if cmd == CommandId::SetRelay {
                    let Some(state) = RelayState::from_raw(second) else {
                        self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                        return;
                    };
                    if !(1..=8).contains(&first) {
                        self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                        return;
                    }
                    self.relays.set(first, state).await
                } else {
                    if first == 0 {
                        self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                        return;
                    }
                    self.relays.set_mask(first, second).await
                };

                match result {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(_) => self.ack(seq, raw_id, AckStatus::HwFault, detail::NONE, &[]).await,
                }
            }

            CommandId::SetSetpoint => {
                let (Ok(ctrl), Ok(sv_x10)) = (r.u8(), r.i16()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                match self.pid.set_setpoint(ctrl, f32::from(sv_x10) / 10.0).await {
                    Ok(()) => {
                        let _ = self.pid.force_poll(ctrl, now).await;
                        self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await;
                    }
                    Err(PidError::VerifyMismatch(readback)) => {
                        let mut opt = [0u8; 3];
                        opt[0] = ctrl;
                        opt[1..].copy_from_slice(&readback.to_le_bytes());
                        self.ack(seq, raw_id, AckStatus::HwFault, detail::NONE, &opt).await;
                    }
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::SetMode => {
                let (Ok(ctrl), Ok(mode)) = (r.u8(), r.u8()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                match self.pid.set_mode(ctrl, mode).await {
                    Ok(()) => {
                        let _ = self.pid.force_poll(ctrl, now).await;
                        self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await;
                    }
                    Err(PidError::VerifyMismatch(readback)) => {
                        let opt = [ctrl, readback as u8];
                        self.ack(seq, raw_id, AckStatus::HwFault, detail::NONE, &opt).await;
                    }
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::RequestRefresh => {
                let Ok(ctrl) = r.u8() else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                match self.pid.force_poll(ctrl, now).await {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::SetPidParams => {
                let (Ok(ctrl), Ok(p_x10), Ok(i_time), Ok(d_time)) = (r.u8(), r.i16(), r.u16(), r.u16()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                match self.pid.write_params(ctrl, f32::from(p_x10) / 10.0, i_time, d_time).await {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::ReadPidParams => {
                let Ok(ctrl) = r.u8() else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                match self.pid.read_params(ctrl).await {
                    Ok((p_gain, i_time, d_time)) => {
                        let mut opt = [0u8; 7];
                        opt[0] = ctrl;
                        let p_x10 = (p_gain * 10.0) as i16;
                        opt[1..3].copy_from_slice(&p_x10.to_le_bytes());
                        opt[3..5].copy_from_slice(&i_time.to_le_bytes());
                        opt[5..7].copy_from_slice(&d_time.to_le_bytes());
                        self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &opt).await;
                    }
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::StartAutotune | CommandId::StopAutotune => {
                let Ok(ctrl) = r.u8() else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                let result = if cmd == CommandId::StartAutotune {
                    self.pid.start_autotune(ctrl).await
                } else {
                    self.pid.stop_autotune(ctrl).await
                };
                match result {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::SetAlarmLimits => {
                let (Ok(ctrl), Ok(al1_x10), Ok(al2_x10)) = (r.u8(), r.i16(), r.i16()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                match self
                    .pid
                    .set_alarm_limits(ctrl, f32::from(al1_x10) / 10.0, f32::from(al2_x10) / 10.0)
                    .await
                {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::ReadAlarmLimits => {
                let Ok(ctrl) = r.u8() else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                match self.pid.read_alarm_limits(ctrl).await {
                    Ok((al1, al2)) => {
                        let mut opt = [0u8; 5];
                        opt[0] = ctrl;
                        opt[1..3].copy_from_slice(&((al1 * 10.0) as i16).to_le_bytes());
                        opt[3..5].copy_from_slice(&((al2 * 10.0) as i16).to_le_bytes());
                        self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &opt).await;
                    }
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::ReadRegisters => {
                let (Ok(ctrl), Ok(start), Ok(count)) = (r.u8(), r.u16(), r.u8()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) || count == 0 || count > 16 {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                let mut values = [0u16; 16];
                match self.pid.read_registers(ctrl, start, &mut values[..usize::from(count)]).await {
                    Ok(()) => {
                        let mut opt = [0u8; 4 + 32];
                        opt[0] = ctrl;
                        opt[1..3].copy_from_slice(&start.to_le_bytes());
                        opt[3] = count;
                        for (i, v) in values[..usize::from(count)].iter().enumerate() {
                            opt[4 + i * 2..6 + i * 2].copy_from_slice(&v.to_le_bytes());
                        }
                        let opt_len = 4 + usize::from(count) * 2;
                        self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &opt[..opt_len]).await;
                    }
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::WriteRegister => {
                let (Ok(ctrl), Ok(address), Ok(value)) = (r.u8(), r.u16(), r.u16()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                if !self.controller_id_ok(ctrl) {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                let mut opt = [0u8; 5];
                opt[0] = ctrl;
                opt[1..3].copy_from_slice(&address.to_le_bytes());
                match self.pid.write_register(ctrl, address, value).await {
                    Ok(verified) => {
                        opt[3..5].copy_from_slice(&verified.to_le_bytes());
                        self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &opt).await;
                    }
                    Err(PidError::VerifyMismatch(readback)) => {
                        opt[3..5].copy_from_slice(&readback.to_le_bytes());
                        self.ack(seq, raw_id, AckStatus::HwFault, detail::NONE, &opt).await;
                    }
                    Err(e) => {
                        let (status, d) = Self::pid_failure(e);
                        self.ack(seq, raw_id, status, d, &[]).await;
                    }
                }
            }

            CommandId::SetIdleTimeout => {
                let Ok(minutes) = r.u8() else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                self.pid.set_idle_timeout_min(minutes, now);
                self.persisted.lock(|s| s.borrow_mut().idle_timeout_min = minutes);
                self.persist().await;
                self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await;
            }

            CommandId::GetIdleTimeout => {
                let minutes = self.pid.idle_timeout_min();
                self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[minutes]).await;
            }

            CommandId::GetCapabilities => {
                let levels = self.gates.capabilities();
                let mut opt = [0u8; 1 + crate::gates::SUBSYSTEM_COUNT];
                opt[0] = crate::gates::SUBSYSTEM_COUNT as u8;
                opt[1..].copy_from_slice(&levels);
                self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &opt).await;
            }

            CommandId::SetCapability => {
                let (Ok(subsys_raw), Ok(level_raw)) = (r.u8(), r.u8()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                let (Some(subsystem), Some(level)) =
                    (Subsystem::from_raw(subsys_raw), Capability::from_raw(level_raw))
                else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                };
                if self.gates.set_capability(subsystem, level).is_err() {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                }
                self.persisted.lock(|s| s.borrow_mut().set_capability(subsystem, level));
                self.persist().await;
                self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await;
            }

            CommandId::GetGates => {
                let inputs = self.gate_inputs();
                let mut opt = [0u8; 4];
                opt[..2].copy_from_slice(&self.gates.enable_mask().to_le_bytes());
                opt[2..].copy_from_slice(&self.gates.status_mask(&inputs).to_le_bytes());
                self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &opt).await;
            }

            CommandId::SetGate => {
                let (Ok(gate_raw), Ok(enabled)) = (r.u8(), r.u8()) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::NONE, &[]).await;
                    return;
                };
                let Some(gate) = GateId::from_raw(gate_raw) else {
                    self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    return;
                };
                match self.gates.set_enabled(gate, enabled != 0) {
                    Ok(()) => self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await,
                    Err(_) => {
                        self.ack(seq, raw_id, AckStatus::InvalidArgs, detail::OUT_OF_RANGE, &[]).await;
                    }
                }
            }

            CommandId::SnapshotNow => {
                self.snapshot_poke.signal(());
                self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await;
            }

            CommandId::ClearWarnings => {
                self.alarms.clear_warnings();
                self.ack(seq, raw_id, AckStatus::Ok, detail::NONE, &[]).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU8, Ordering as StdOrdering};
    use std::sync::{Arc, Mutex as StdMutex};

    use embassy_futures::block_on;

    use super::*;
    use crate::pid::{reg, Config as PidConfig};
    use crate::relay::{Config as RelayConfig, Error as RelayError};
    use crate::settings::StoreError;
    use crate::wire::{build_frame, parse_frame, MAX_FRAME};

    #[derive(Clone, Default)]
    struct FakeExpander {
        outputs: Arc<AtomicU8>,
        inputs: Arc<AtomicU8>,
    }

    impl ExpanderPort for FakeExpander {
        async fn write_outputs(&mut self, bits: u8) -> Result<(), RelayError> {
            self.outputs.store(bits, StdOrdering::Relaxed);
            Ok(())
        }

        async fn read_outputs(&mut self) -> Result<u8, RelayError> {
            Ok(self.outputs.load(StdOrdering::Relaxed))
        }

        async fn read_inputs(&mut self) -> Result<u8, RelayError> {
            Ok(self.inputs.load(StdOrdering::Relaxed))
        }
    }

    #[derive(Default)]
    struct FakeBus {
        regs: StdMutex<std::collections::HashMap<(u8, u16), u16>>,
        write_skew: StdMutex<Option<u16>>,
    }

    impl FakeBus {
        fn set(&self, addr: u8, register: u16, value: u16) {
            self.regs.lock().unwrap().insert((addr, register), value);
        }

        fn skew(&self, value: Option<u16>) {
            *self.write_skew.lock().unwrap() = value;
        }
    }

    impl Bus for FakeBus {
        async fn read_holding(&self, addr: u8, start: u16, out: &mut [u16]) -> Result<(), BusError> {
            for (i, v) in out.iter_mut().enumerate() {
                *v = *self.regs.lock().unwrap().get(&(addr, start + i as u16)).unwrap_or(&0);
            }
            Ok(())
        }

        async fn write_single(&self, addr: u8, register: u16, value: u16) -> Result<(), BusError> {
            let stored = self.write_skew.lock().unwrap().unwrap_or(value);
            self.set(addr, register, stored);
            Ok(())
        }

        async fn write_multiple(&self, addr: u8, start: u16, values: &[u16]) -> Result<(), BusError> {
            for (i, v) in values.iter().enumerate() {
                self.set(addr, start + i as u16, *v);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSink {
        acks: StdMutex<Vec<(Vec<u8>, bool)>>,
    }

    impl FrameSink for FakeSink {
        async fn send_telemetry(&self, _frame: &[u8]) -> Result<(), TxError> {
            Ok(())
        }

        async fn send_ack(&self, frame: &[u8], reliable: bool) -> Result<(), TxError> {
            self.acks.lock().unwrap().push((frame.to_vec(), reliable));
            Ok(())
        }

        async fn send_event(&self, _frame: &[u8], _reliable: bool) -> Result<(), TxError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemStore(Option<Settings>);

    impl SettingsStore for MemStore {
        async fn load(&mut self) -> Settings {
            self.0.unwrap_or_default()
        }

        async fn save(&mut self, settings: &Settings) -> Result<(), StoreError> {
            self.0 = Some(*settings);
            Ok(())
        }
    }

    struct SeqRng(u32);

    impl RngCore for SeqRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(0x9E37_79B9);
            self.0
        }

        fn next_u64(&mut self) -> u64 {
            u64::from(self.next_u32())
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for b in dest {
                *b = self.next_u32() as u8;
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    type TestDispatcher =
        Dispatcher<'static, FakeExpander, FakeBus, SeqRng, FakeSink, MemStore>;

    struct Rig {
        expander: FakeExpander,
        bus: &'static FakeBus,
        sink: &'static FakeSink,
        machine: &'static Machine<'static, FakeExpander>,
        relays: &'static RelayDriver<FakeExpander>,
        store: &'static Mutex<CriticalSectionRawMutex, MemStore>,
        dispatcher: TestDispatcher,
    }

    fn at(ms: u64) -> Instant {
        Instant::from_ticks(0) + embassy_time::Duration::from_millis(ms)
    }

    fn rig() -> Rig {
        let expander = FakeExpander::default();
        expander.inputs.store(crate::relay::DI_SAFE_DEFAULT, StdOrdering::Relaxed);

        let bus: &'static FakeBus = Box::leak(Box::new(FakeBus::default()));
        // Healthy controllers 1..3.
        for addr in 1..=3u8 {
            bus.set(addr, reg::PV, (-1960i16) as u16);
            bus.set(addr, reg::SV, (-1900i16) as u16);
            bus.set(addr, reg::MODE, 2);
        }

        let events: &'static EventQueue = Box::leak(Box::new(EventQueue::new()));
        let session: &'static SessionManager = Box::leak(Box::new(SessionManager::new()));
        let relays: &'static RelayDriver<FakeExpander> =
            Box::leak(Box::new(RelayDriver::new(expander.clone(), RelayConfig::default())));
        block_on(relays.init()).unwrap();
        let pid: &'static PidManager<'static, FakeBus> =
            Box::leak(Box::new(PidManager::new(bus, events, PidConfig::default(), at(0))));
        let machine: &'static Machine<'static, FakeExpander> =
            Box::leak(Box::new(Machine::new(relays, session, pid, events, None, at(0))));
        let gates: &'static SafetyGates = Box::leak(Box::new(SafetyGates::new()));
        let alarms: &'static Alarms = Box::leak(Box::new(Alarms::new()));
        let store: &'static Mutex<CriticalSectionRawMutex, MemStore> =
            Box::leak(Box::new(Mutex::new(MemStore::default())));
        let sink: &'static FakeSink = Box::leak(Box::new(FakeSink::default()));
        let poke: &'static SnapshotSignal = Box::leak(Box::new(SnapshotSignal::new()));

        // Bring the controller fleet online.
        for i in 0..3 {
            block_on(pid.poll_index(i, at(0))).unwrap();
        }

        let dispatcher = Dispatcher::new(
            session,
            machine,
            relays,
            pid,
            gates,
            alarms,
            events,
            store,
            sink,
            poke,
            Settings::default(),
            SeqRng(1),
        );

        Rig {
            expander,
            bus,
            sink,
            machine,
            relays,
            store,
            dispatcher,
        }
    }

    fn command(seq: u16, cmd_id: u16, body: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&cmd_id.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(body);
        let mut frame = [0u8; MAX_FRAME];
        let len = build_frame(&mut frame, MsgType::Command, seq, &payload).unwrap();
        frame[..len].to_vec()
    }

    struct Ack {
        acked_seq: u16,
        cmd_id: u16,
        status: u8,
        detail: u16,
        body: Vec<u8>,
        reliable: bool,
    }

    fn last_ack(sink: &FakeSink) -> Ack {
        let acks = sink.acks.lock().unwrap();
        let (frame, reliable) = acks.last().expect("no ack emitted");
        let (header, payload) = parse_frame(frame).unwrap();
        assert_eq!(header.msg_type, MsgType::CommandAck);
        Ack {
            acked_seq: u16::from_le_bytes([payload[0], payload[1]]),
            cmd_id: u16::from_le_bytes([payload[2], payload[3]]),
            status: payload[4],
            detail: u16::from_le_bytes([payload[5], payload[6]]),
            body: payload[7..].to_vec(),
            reliable: *reliable,
        }
    }

    fn open_session(r: &Rig) -> u32 {
        block_on(r.dispatcher.on_frame(&command(1, 0x0100, &0xDEAD_BEEFu32.to_le_bytes()), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::Ok as u8);
        u32::from_le_bytes(ack.body[..4].try_into().unwrap())
    }

    #[test]
    fn open_and_keepalive_flow() {
        let r = rig();

        block_on(r.dispatcher.on_frame(&command(1, 0x0100, &0xDEAD_BEEFu32.to_le_bytes()), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.acked_seq, 1);
        assert_eq!(ack.cmd_id, 0x0100);
        assert_eq!(ack.status, AckStatus::Ok as u8);
        assert!(ack.reliable);
        let session_id = u32::from_le_bytes(ack.body[..4].try_into().unwrap());
        assert_ne!(session_id, 0);
        assert_eq!(u16::from_le_bytes(ack.body[4..6].try_into().unwrap()), 3000);

        block_on(r.dispatcher.on_frame(&command(2, 0x0101, &session_id.to_le_bytes()), at(100)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.acked_seq, 2);
        assert_eq!(ack.status, AckStatus::Ok as u8);
        assert!(!ack.reliable);
    }

    #[test]
    fn keepalive_with_wrong_id_is_rejected() {
        let r = rig();
        let id = open_session(&r);
        block_on(r.dispatcher.on_frame(&command(2, 0x0101, &(id ^ 1).to_le_bytes()), at(100)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::RejectedPolicy as u8);
        assert_eq!(ack.detail, detail::INVALID_SESSION);
    }

    #[test]
    fn corrupt_frame_is_dropped_silently() {
        let r = rig();
        let mut frame = command(1, 0x0100, &[0; 4]);
        let len = frame.len();
        frame[len - 1] ^= 0xFF;
        block_on(r.dispatcher.on_frame(&frame, at(0)));
        assert!(r.sink.acks.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_command_acks_invalid_args() {
        let r = rig();
        block_on(r.dispatcher.on_frame(&command(9, 0x7777, &[]), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.cmd_id, 0x7777);
        assert_eq!(ack.status, AckStatus::InvalidArgs as u8);
    }

    fn start_body(session_id: u32) -> Vec<u8> {
        let mut body = session_id.to_le_bytes().to_vec();
        body.push(0); // RunMode::Normal
        body.extend_from_slice(&(-500i16).to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body
    }

    #[test]
    fn start_run_with_invalid_session() {
        let r = rig();
        open_session(&r);
        block_on(r.dispatcher.on_frame(&command(3, 0x0102, &start_body(0x1234_5678)), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::RejectedPolicy as u8);
        assert_eq!(ack.detail, detail::INVALID_SESSION);
        assert_eq!(r.machine.state(), MachineState::Idle);
    }

    #[test]
    fn start_run_blocked_by_estop() {
        let r = rig();
        let id = open_session(&r);

        // E-Stop input low, machine tick caches it.
        r.expander
            .inputs
            .store(crate::relay::DI_SAFE_DEFAULT & !0x01, StdOrdering::Relaxed);
        block_on(r.machine.tick(at(50)));

        block_on(r.dispatcher.on_frame(&command(3, 0x0102, &start_body(id)), at(100)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::RejectedPolicy as u8);
        assert_eq!(ack.detail, detail::INTERLOCKS);
        assert_eq!(ack.body.len(), 1);
        assert_ne!(ack.body[0] & crate::machine::interlock::ESTOP, 0);
    }

    #[test]
    fn start_then_stop_run() {
        let r = rig();
        let id = open_session(&r);
        block_on(r.machine.tick(at(10)));

        block_on(r.dispatcher.on_frame(&command(3, 0x0102, &start_body(id)), at(20)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::Ok as u8);
        assert!(ack.reliable);
        assert_eq!(r.machine.state(), MachineState::Precool);

        let mut body = id.to_le_bytes().to_vec();
        body.push(1); // StopMode::Abort
        block_on(r.dispatcher.on_frame(&command(4, 0x0103, &body), at(30)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::Ok as u8);
        assert_eq!(r.machine.state(), MachineState::Idle);
    }

    #[test]
    fn relay_mask_in_service_mode() {
        let r = rig();
        let id = open_session(&r);

        // Outside SERVICE the relay commands are refused.
        block_on(r.dispatcher.on_frame(&command(3, 0x0002, &[0x0F, 0x05]), at(10)));
        assert_eq!(last_ack(r.sink).status, AckStatus::NotReady as u8);

        block_on(r.dispatcher.on_frame(&command(4, 0x0110, &id.to_le_bytes()), at(20)));
        assert_eq!(last_ack(r.sink).status, AckStatus::Ok as u8);
        assert_eq!(r.machine.state(), MachineState::Service);

        block_on(r.relays.set_all(0xF0)).unwrap();
        block_on(r.dispatcher.on_frame(&command(5, 0x0002, &[0x0F, 0x05]), at(30)));
        assert_eq!(last_ack(r.sink).status, AckStatus::Ok as u8);
        assert_eq!(r.relays.state(), 0xF5);

        // Zero mask is a domain error at the wire.
        block_on(r.dispatcher.on_frame(&command(6, 0x0002, &[0x00, 0x05]), at(40)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::InvalidArgs as u8);
        assert_eq!(ack.detail, detail::OUT_OF_RANGE);
    }

    #[test]
    fn relay_set_validates_domain() {
        let r = rig();
        let id = open_session(&r);
        block_on(r.dispatcher.on_frame(&command(2, 0x0110, &id.to_le_bytes()), at(0)));

        block_on(r.dispatcher.on_frame(&command(3, 0x0001, &[9, 1]), at(10)));
        assert_eq!(last_ack(r.sink).detail, detail::OUT_OF_RANGE);

        block_on(r.dispatcher.on_frame(&command(4, 0x0001, &[1, 3]), at(20)));
        assert_eq!(last_ack(r.sink).detail, detail::OUT_OF_RANGE);

        block_on(r.dispatcher.on_frame(&command(5, 0x0001, &[3, 1]), at(30)));
        assert_eq!(last_ack(r.sink).status, AckStatus::Ok as u8);
        assert_eq!(r.relays.state(), 0x04);
    }

    #[test]
    fn setpoint_write_and_verify() {
        let r = rig();
        let body = {
            let mut b = vec![1u8];
            b.extend_from_slice(&250i16.to_le_bytes());
            b
        };
        block_on(r.dispatcher.on_frame(&command(7, 0x0020, &body), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::Ok as u8);
    }

    #[test]
    fn setpoint_verify_mismatch_returns_readback() {
        let r = rig();
        r.bus.skew(Some(245));

        let body = {
            let mut b = vec![1u8];
            b.extend_from_slice(&250i16.to_le_bytes());
            b
        };
        block_on(r.dispatcher.on_frame(&command(7, 0x0020, &body), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::HwFault as u8);
        assert_eq!(ack.body[0], 1);
        assert_eq!(u16::from_le_bytes(ack.body[1..3].try_into().unwrap()), 245);
    }

    #[test]
    fn controller_id_out_of_range() {
        let r = rig();
        let mut body = vec![4u8];
        body.extend_from_slice(&250i16.to_le_bytes());
        block_on(r.dispatcher.on_frame(&command(7, 0x0020, &body), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::InvalidArgs as u8);
        assert_eq!(ack.detail, detail::OUT_OF_RANGE);
    }

    #[test]
    fn protected_register_write_refused() {
        let r = rig();
        let mut body = vec![1u8];
        body.extend_from_slice(&50u16.to_le_bytes());
        body.extend_from_slice(&7u16.to_le_bytes());
        block_on(r.dispatcher.on_frame(&command(8, 0x0031, &body), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::InvalidArgs as u8);
        assert_eq!(ack.detail, detail::OUT_OF_RANGE);
    }

    #[test]
    fn write_register_reports_verified_value() {
        let r = rig();
        let mut body = vec![2u8];
        body.extend_from_slice(&60u16.to_le_bytes());
        body.extend_from_slice(&0x1234u16.to_le_bytes());
        block_on(r.dispatcher.on_frame(&command(8, 0x0031, &body), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::Ok as u8);
        assert_eq!(ack.body[0], 2);
        assert_eq!(u16::from_le_bytes(ack.body[1..3].try_into().unwrap()), 60);
        assert_eq!(u16::from_le_bytes(ack.body[3..5].try_into().unwrap()), 0x1234);
    }

    #[test]
    fn read_registers_round_trip() {
        let r = rig();
        r.bus.set(1, 10, 0xAAAA);
        r.bus.set(1, 11, 0xBBBB);

        let mut body = vec![1u8];
        body.extend_from_slice(&10u16.to_le_bytes());
        body.push(2);
        block_on(r.dispatcher.on_frame(&command(9, 0x0030, &body), at(0)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::Ok as u8);
        assert_eq!(ack.body[3], 2);
        assert_eq!(u16::from_le_bytes(ack.body[4..6].try_into().unwrap()), 0xAAAA);
        assert_eq!(u16::from_le_bytes(ack.body[6..8].try_into().unwrap()), 0xBBBB);
    }

    #[test]
    fn idle_timeout_round_trip_persists() {
        let r = rig();
        block_on(r.dispatcher.on_frame(&command(5, 0x0040, &[25]), at(0)));
        assert_eq!(last_ack(r.sink).status, AckStatus::Ok as u8);

        block_on(r.dispatcher.on_frame(&command(6, 0x0041, &[]), at(10)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.body, vec![25]);

        let stored = block_on(async { r.store.lock().await.load().await });
        assert_eq!(stored.idle_timeout_min, 25);
    }

    #[test]
    fn capability_round_trip_persists() {
        let r = rig();
        block_on(r.dispatcher.on_frame(&command(5, 0x0071, &[Subsystem::DoorInput as u8, 0]), at(0)));
        assert_eq!(last_ack(r.sink).status, AckStatus::Ok as u8);

        block_on(r.dispatcher.on_frame(&command(6, 0x0070, &[]), at(10)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.body[0], crate::gates::SUBSYSTEM_COUNT as u8);
        assert_eq!(ack.body[1 + Subsystem::DoorInput as usize], 0);

        // E-Stop stays pinned.
        block_on(r.dispatcher.on_frame(&command(7, 0x0071, &[Subsystem::EstopInput as u8, 1]), at(20)));
        assert_eq!(last_ack(r.sink).status, AckStatus::InvalidArgs as u8);

        let stored = block_on(async { r.store.lock().await.load().await });
        assert_eq!(stored.gate_levels()[Subsystem::DoorInput as usize], Capability::NotPresent);
    }

    #[test]
    fn gate_bypass_round_trip() {
        let r = rig();
        block_on(r.dispatcher.on_frame(&command(5, 0x0073, &[GateId::DoorClosed as u8, 0]), at(0)));
        assert_eq!(last_ack(r.sink).status, AckStatus::Ok as u8);

        block_on(r.dispatcher.on_frame(&command(6, 0x0072, &[]), at(10)));
        let ack = last_ack(r.sink);
        let enable = u16::from_le_bytes(ack.body[..2].try_into().unwrap());
        assert_eq!(enable & (1 << GateId::DoorClosed as u16), 0);

        // The E-Stop gate refuses bypass.
        block_on(r.dispatcher.on_frame(&command(7, 0x0073, &[GateId::Estop as u8, 0]), at(20)));
        assert_eq!(last_ack(r.sink).status, AckStatus::InvalidArgs as u8);
    }

    #[test]
    fn clear_estop_while_active_is_not_ready() {
        let r = rig();
        let id = open_session(&r);

        r.expander
            .inputs
            .store(crate::relay::DI_SAFE_DEFAULT & !0x01, StdOrdering::Relaxed);
        block_on(r.machine.tick(at(10)));
        assert_eq!(r.machine.state(), MachineState::EStop);

        block_on(r.dispatcher.on_frame(&command(3, 0x0112, &id.to_le_bytes()), at(20)));
        let ack = last_ack(r.sink);
        assert_eq!(ack.status, AckStatus::NotReady as u8);
        assert_eq!(ack.detail, detail::CONDITION_ACTIVE);

        r.expander.inputs.store(crate::relay::DI_SAFE_DEFAULT, StdOrdering::Relaxed);
        block_on(r.machine.tick(at(30)));
        block_on(r.dispatcher.on_frame(&command(4, 0x0112, &id.to_le_bytes()), at(40)));
        assert_eq!(last_ack(r.sink).status, AckStatus::Ok as u8);
        assert_eq!(r.machine.state(), MachineState::Idle);
    }

    #[test]
    fn snapshot_now_pokes_emitter() {
        let r = rig();
        block_on(r.dispatcher.on_frame(&command(3, 0x00F0, &[]), at(0)));
        assert_eq!(last_ack(r.sink).status, AckStatus::Ok as u8);
        assert!(r.dispatcher.snapshot_poke.try_take().is_some());
    }

    #[test]
    fn truncated_body_acks_invalid_args() {
        let r = rig();
        block_on(r.dispatcher.on_frame(&command(3, 0x0100, &[0x01, 0x02]), at(0)));
        assert_eq!(last_ack(r.sink).status, AckStatus::InvalidArgs as u8);
    }
}
