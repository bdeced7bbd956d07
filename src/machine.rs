//! Machine state manager
//!
//! The authoritative process state machine. The HMI sends high-level
//! commands (start, stop, service) and observes state; sequencing, interlock
//! enforcement and safe-output handling happen here, so a run completes
//! safely even if the HMI link drops.
//!
//! State diagram:
//!   IDLE → PRECOOL → RUNNING → STOPPING → IDLE
//!   Any → E_STOP (immediate on E-Stop input)
//!   Any non-safe → FAULT (hardware fault, door breach)
//!   IDLE ↔ SERVICE (manual relay control)
//!
//! Collaborators are reached through one-way reads only: the HMI session via
//! [`HmiPresence`], the chamber temperature via [`ChamberProbe`]. The start
//! permit is evaluated by the dispatcher and passed into
//! [`Machine::start_run`], so no call path leads back out of this module.

use core::cell::Cell;
use core::sync::atomic::{AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Ticker};

use crate::relay::{ExpanderPort, RelayDriver, RelayState, DI_SAFE_DEFAULT};
use crate::telemetry::RunInfoSource;
use crate::transport::EventQueue;
use crate::wire::{Event, EventId, RunState, Severity};

/// State machine tick period.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Default precool target when the start command passes 0, ×10 °C.
pub const PRECOOL_DEFAULT_TARGET_X10: i16 = -500;
/// Tolerance around the precool target, ×10 °C.
pub const PRECOOL_TOLERANCE_X10: i16 = 50;
/// Precool advances with a warning after this long without reaching target.
pub const PRECOOL_TIMEOUT: Duration = Duration::from_secs(300);
/// Thermal-soak dwell in STOPPING before returning to IDLE.
pub const STOPPING_SOAK: Duration = Duration::from_secs(30);

/// Digital input channels, 1-based to match the panel labels.
pub mod di {
    /// E-Stop (low = pressed).
    pub const ESTOP: u8 = 1;
    /// Door position (low = open).
    pub const DOOR_CLOSED: u8 = 2;
    /// Coolant supply (high = present).
    pub const COOLANT_PRESENT: u8 = 3;
    /// Motor fault (high = fault). Plumbed; no fault source on current hardware.
    pub const MOTOR_FAULT: u8 = 4;
}

/// Relay output channels, 1-based to match the panel labels.
pub mod ro {
    /// Motor power circuit enable.
    pub const MAIN_CONTACTOR: u8 = 1;
    /// Axle bearing heater.
    pub const HEATER_1: u8 = 2;
    /// Orbital bearing heater.
    pub const HEATER_2: u8 = 3;
    /// Coolant solenoid valve.
    pub const COOLANT_VALVE: u8 = 4;
    /// Door lock solenoid.
    pub const DOOR_LOCK: u8 = 5;
    /// Chamber lighting.
    pub const CHAMBER_LIGHT: u8 = 6;
    /// Soft-starter run input.
    pub const MOTOR_START: u8 = 7;
}

/// Interlock bits reported in acks and telemetry.
pub mod interlock {
    /// E-Stop active.
    pub const ESTOP: u8 = 1 << 0;
    /// Door open.
    pub const DOOR_OPEN: u8 = 1 << 1;
    /// Coolant not present (warning, does not block).
    pub const COOLANT_ABSENT: u8 = 1 << 2;
    /// Motor fault.
    pub const MOTOR_FAULT: u8 = 1 << 3;
    /// HMI session not live.
    pub const HMI_STALE: u8 = 1 << 4;
}

/// Machine states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MachineState {
    /// Ready, outputs safe.
    Idle = 0,
    /// Driving chamber temperature toward target before motor start.
    Precool = 1,
    /// Motor engaged, process active.
    Running = 2,
    /// Controlled shutdown with thermal soak.
    Stopping = 3,
    /// Emergency stopped, outputs latched safe.
    EStop = 4,
    /// Hardware fault, outputs safe.
    Fault = 5,
    /// Manual relay control.
    Service = 6,
}

impl MachineState {
    /// Decode a stored discriminant.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Idle),
            1 => Some(Self::Precool),
            2 => Some(Self::Running),
            3 => Some(Self::Stopping),
            4 => Some(Self::EStop),
            5 => Some(Self::Fault),
            6 => Some(Self::Service),
            _ => None,
        }
    }

    /// State name for logging.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Precool => "PRECOOL",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::EStop => "E_STOP",
            Self::Fault => "FAULT",
            Self::Service => "SERVICE",
        }
    }
}

/// Run mode carried by the start command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RunMode {
    /// Full precool plus run cycle.
    Normal = 0,
    /// No high-power outputs; motor circuit stays de-energized.
    DryRun = 1,
    /// Stop after precool completes.
    PrecoolOnly = 2,
}

impl RunMode {
    /// Decode the wire encoding.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Normal),
            1 => Some(Self::DryRun),
            2 => Some(Self::PrecoolOnly),
            _ => None,
        }
    }
}

/// Stop mode carried by the stop command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum StopMode {
    /// Graceful stop through the thermal soak.
    Normal = 0,
    /// Straight to IDLE with safe outputs.
    Abort = 1,
}

impl StopMode {
    /// Decode the wire encoding.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Normal),
            1 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Entry-point errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The command is not valid in the current state.
    InvalidState,
    /// The safety gates refused the start; the ack carries the interlocks.
    Interlocked,
    /// The condition to clear is still present.
    ConditionActive,
}

/// Read-only view of HMI liveness.
pub trait HmiPresence: Sync {
    /// True while a live session exists.
    fn is_live(&self) -> bool;
}

/// Read-only view of the chamber temperature.
pub trait ChamberProbe: Sync {
    /// Last chamber temperature ×10, if the controller is online.
    fn chamber_temp_x10(&self) -> Option<i16>;
}

/// Called on every state transition, before events are queued.
pub type StateCallback = fn(MachineState, MachineState);

#[derive(Copy, Clone)]
struct Inner {
    state: MachineState,
    run_mode: RunMode,
    run_start: Option<Instant>,
    run_duration_ms: u32,
    target_temp_x10: i16,
    state_entered: Instant,
    paused: bool,
    pause_started: Option<Instant>,
}

/// The machine state manager.
pub struct Machine<'a, E: ExpanderPort> {
    relays: &'a RelayDriver<E>,
    hmi: &'a dyn HmiPresence,
    probe: &'a dyn ChamberProbe,
    events: &'a EventQueue,
    inner: Mutex<CriticalSectionRawMutex, Inner>,
    state_mirror: AtomicU8,
    di_bits: AtomicU8,
    snapshot: BlockingMutex<CriticalSectionRawMutex, Cell<Inner>>,
    callback: Option<StateCallback>,
}

fn estop_active(di: u8) -> bool {
    di & (1 << (di::ESTOP - 1)) == 0
}

fn door_open(di: u8) -> bool {
    di & (1 << (di::DOOR_CLOSED - 1)) == 0
}

fn coolant_present(di: u8) -> bool {
    di & (1 << (di::COOLANT_PRESENT - 1)) != 0
}

impl<'a, E: ExpanderPort> Machine<'a, E> {
    /// Create the state manager in IDLE.
    pub fn new(
        relays: &'a RelayDriver<E>,
        hmi: &'a dyn HmiPresence,
        probe: &'a dyn ChamberProbe,
        events: &'a EventQueue,
        callback: Option<StateCallback>,
        now: Instant,
    ) -> Self {
        let inner = Inner {
            state: MachineState::Idle,
            run_mode: RunMode::Normal,
            run_start: None,
            run_duration_ms: 0,
            target_temp_x10: 0,
            state_entered: now,
            paused: false,
            pause_started: None,
        };
        Self {
            relays,
            hmi,
            probe,
            events,
            inner: Mutex::new(inner),
            state_mirror: AtomicU8::new(MachineState::Idle as u8),
            di_bits: AtomicU8::new(DI_SAFE_DEFAULT),
            snapshot: BlockingMutex::new(Cell::new(inner)),
            callback,
        }
    }

    /// Current state, lock-free.
    #[must_use]
    pub fn state(&self) -> MachineState {
        MachineState::from_raw(self.state_mirror.load(Ordering::Relaxed)).unwrap_or(MachineState::Fault)
    }

    /// Cached digital-input bits from the last tick.
    #[must_use]
    pub fn di_bits(&self) -> u8 {
        self.di_bits.load(Ordering::Relaxed)
    }

    /// True while the cached E-Stop input is asserted.
    #[must_use]
    pub fn estop_active(&self) -> bool {
        estop_active(self.di_bits())
    }

    /// True while the cached door input reads open.
    #[must_use]
    pub fn door_open(&self) -> bool {
        door_open(self.di_bits())
    }

    fn motor_fault_active(&self) -> bool {
        // The input is wired through but the soft starter has no fault
        // output; this reads "no fault" until real hardware arrives.
        false
    }

    /// Interlock bits computed from the cached inputs and HMI liveness.
    #[must_use]
    pub fn interlocks(&self) -> u8 {
        let di = self.di_bits();
        let mut bits = 0;
        if estop_active(di) {
            bits |= interlock::ESTOP;
        }
        if door_open(di) {
            bits |= interlock::DOOR_OPEN;
        }
        if !coolant_present(di) {
            bits |= interlock::COOLANT_ABSENT;
        }
        if self.motor_fault_active() {
            bits |= interlock::MOTOR_FAULT;
        }
        if !self.hmi.is_live() {
            bits |= interlock::HMI_STALE;
        }
        bits
    }

    fn post_event(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            warn!("event queue full, dropping event 0x{:04x}", event.id as u16);
        }
    }

    fn publish(&self, inner: &Inner) {
        self.snapshot.lock(|cell| cell.set(*inner));
    }

    async fn relay_set(&self, channel: u8, state: RelayState) {
        if let Err(e) = self.relays.set(channel, state).await {
            error!("relay {} write failed: {:?}", channel, e);
        }
    }

    /// Motor off first, contactor second, then everything else off.
    async fn set_outputs_safe(&self) {
        info!("setting outputs to safe state");
        self.relay_set(ro::MOTOR_START, RelayState::Off).await;
        self.relay_set(ro::MAIN_CONTACTOR, RelayState::Off).await;
        if let Err(e) = self.relays.all_off().await {
            error!("all-off sweep failed: {:?}", e);
        }
    }

    async fn transition(&self, inner: &mut Inner, new_state: MachineState, now: Instant) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }

        info!("state transition: {} -> {}", old_state.as_str(), new_state.as_str());
        inner.state = new_state;
        inner.state_entered = now;
        self.state_mirror.store(new_state as u8, Ordering::Relaxed);

        match new_state {
            MachineState::Idle => {
                self.set_outputs_safe().await;
                inner.run_start = None;
                inner.paused = false;
            }
            MachineState::Precool => {
                self.relay_set(ro::DOOR_LOCK, RelayState::On).await;
                self.relay_set(ro::COOLANT_VALVE, RelayState::On).await;
                self.relay_set(ro::HEATER_1, RelayState::On).await;
                self.relay_set(ro::HEATER_2, RelayState::On).await;
                if inner.run_mode != RunMode::DryRun {
                    // Energize the motor circuit; the soft starter is not
                    // triggered until RUNNING.
                    self.relay_set(ro::MAIN_CONTACTOR, RelayState::On).await;
                }
            }
            MachineState::Running => {
                if inner.run_mode != RunMode::DryRun {
                    self.relay_set(ro::MOTOR_START, RelayState::On).await;
                }
            }
            MachineState::Stopping => {
                self.relay_set(ro::MOTOR_START, RelayState::Off).await;
                self.relay_set(ro::HEATER_1, RelayState::Off).await;
                self.relay_set(ro::HEATER_2, RelayState::Off).await;
                // Contactor and door lock stay on through the soak.
                self.relay_set(ro::COOLANT_VALVE, RelayState::Off).await;
            }
            MachineState::EStop | MachineState::Fault => {
                self.set_outputs_safe().await;
            }
            MachineState::Service => {}
        }

        if let Some(cb) = self.callback {
            cb(old_state, new_state);
        }

        let severity = match new_state {
            MachineState::EStop => Severity::Critical,
            MachineState::Fault => Severity::Alarm,
            MachineState::Stopping => Severity::Warn,
            _ => Severity::Info,
        };
        self.post_event(
            Event::new(EventId::StateChanged, severity).with_data(&[old_state as u8, new_state as u8]),
        );

        if new_state == MachineState::EStop {
            self.post_event(Event::new(EventId::EstopAsserted, Severity::Critical));
        } else if old_state == MachineState::EStop && new_state == MachineState::Idle {
            self.post_event(Event::new(EventId::EstopCleared, Severity::Info));
        }

        if old_state == MachineState::Idle && new_state == MachineState::Precool {
            self.post_event(Event::new(EventId::RunStarted, Severity::Info));
        } else if old_state == MachineState::Precool && new_state == MachineState::Running {
            self.post_event(Event::new(EventId::PrecoolComplete, Severity::Info));
        } else if new_state == MachineState::Idle
            && matches!(old_state, MachineState::Stopping | MachineState::Running)
        {
            self.post_event(Event::new(EventId::RunStopped, Severity::Info));
        } else if matches!(new_state, MachineState::Fault | MachineState::EStop)
            && matches!(old_state, MachineState::Running | MachineState::Precool)
        {
            self.post_event(Event::new(EventId::RunAborted, Severity::Alarm));
        }

        self.publish(inner);
    }

    async fn leave_precool(&self, inner: &mut Inner, now: Instant) {
        if inner.run_mode == RunMode::PrecoolOnly {
            self.transition(inner, MachineState::Stopping, now).await;
        } else {
            self.transition(inner, MachineState::Running, now).await;
        }
    }

    /// One 50 ms tick: refresh inputs, enforce interlocks, advance
    /// time-driven transitions.
    pub async fn tick(&self, now: Instant) {
        match self.relays.read_di().await {
            Ok(bits) => self.di_bits.store(bits, Ordering::Relaxed),
            Err(e) => warn!("DI read failed, keeping previous state: {:?}", e),
        }
        let di = self.di_bits();

        let mut inner = self.inner.lock().await;

        if estop_active(di) && inner.state != MachineState::EStop {
            error!("E-Stop activated");
            self.transition(&mut inner, MachineState::EStop, now).await;
        }

        if self.motor_fault_active()
            && !matches!(
                inner.state,
                MachineState::EStop | MachineState::Fault | MachineState::Idle | MachineState::Service
            )
        {
            error!("motor fault detected");
            self.transition(&mut inner, MachineState::Fault, now).await;
        }

        if door_open(di) && matches!(inner.state, MachineState::Running | MachineState::Precool) {
            error!("door opened during run");
            self.transition(&mut inner, MachineState::Fault, now).await;
        }

        let in_state = now.saturating_duration_since(inner.state_entered);

        match inner.state {
            MachineState::Precool => {
                if let Some(temp_x10) = self.probe.chamber_temp_x10() {
                    let diff = (i32::from(temp_x10) - i32::from(inner.target_temp_x10)).abs();
                    if diff <= i32::from(PRECOOL_TOLERANCE_X10) {
                        info!("precool target reached: pv={} target={}", temp_x10, inner.target_temp_x10);
                        self.leave_precool(&mut inner, now).await;
                    }
                }
                if inner.state == MachineState::Precool && in_state > PRECOOL_TIMEOUT {
                    warn!("precool timeout, proceeding anyway");
                    self.leave_precool(&mut inner, now).await;
                }
            }
            MachineState::Running => {
                if !inner.paused && inner.run_duration_ms > 0 {
                    if let Some(start) = inner.run_start {
                        let elapsed = now.saturating_duration_since(start);
                        if elapsed.as_millis() >= u64::from(inner.run_duration_ms) {
                            info!("run duration complete");
                            self.transition(&mut inner, MachineState::Stopping, now).await;
                        }
                    }
                }
                if inner.state == MachineState::Running && !self.hmi.is_live() {
                    warn!("HMI not live during run, safe stop");
                    self.transition(&mut inner, MachineState::Stopping, now).await;
                }
            }
            MachineState::Stopping => {
                if in_state > STOPPING_SOAK {
                    info!("thermal soak complete");
                    self.transition(&mut inner, MachineState::Idle, now).await;
                }
            }
            _ => {}
        }

        self.publish(&inner);
    }

    /// Periodic task body.
    pub async fn run(&self) -> ! {
        info!("machine state task started");
        let mut ticker = Ticker::every(TICK_INTERVAL);
        loop {
            self.tick(Instant::now()).await;
            ticker.next().await;
        }
    }

    /// Begin a run. The dispatcher has already validated the session and
    /// evaluated the start permit.
    pub async fn start_run(
        &self,
        mode: RunMode,
        target_temp_x10: i16,
        duration_ms: u32,
        permit: Result<(), u8>,
        now: Instant,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        // Gate refusals outrank the state check: an asserted E-Stop has
        // already forced the state machine out of IDLE, and the HMI needs
        // the interlock byte, not a bare wrong-state answer.
        if let Err(gate) = permit {
            warn!("start rejected: gate {} blocking", gate);
            return Err(Error::Interlocked);
        }
        if inner.state != MachineState::Idle {
            warn!("start rejected: not IDLE (state={})", inner.state.as_str());
            return Err(Error::InvalidState);
        }
        if !coolant_present(self.di_bits()) {
            warn!("coolant not present, cooling may be impaired");
        }

        inner.run_mode = mode;
        inner.target_temp_x10 = if target_temp_x10 != 0 {
            target_temp_x10
        } else {
            PRECOOL_DEFAULT_TARGET_X10
        };
        inner.run_duration_ms = duration_ms;
        inner.run_start = Some(now);
        inner.paused = false;

        self.transition(&mut inner, MachineState::Precool, now).await;
        info!(
            "run started: mode={} target_x10={} duration_ms={}",
            mode as u8, inner.target_temp_x10, duration_ms
        );
        Ok(())
    }

    /// Stop or abort the current run.
    pub async fn stop_run(&self, mode: StopMode, now: Instant) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;

        if !matches!(inner.state, MachineState::Precool | MachineState::Running) {
            warn!("stop ignored in state {}", inner.state.as_str());
            return Err(Error::InvalidState);
        }

        match mode {
            StopMode::Abort => {
                warn!("abort requested, immediate stop");
                self.set_outputs_safe().await;
                self.transition(&mut inner, MachineState::Idle, now).await;
            }
            StopMode::Normal => {
                self.transition(&mut inner, MachineState::Stopping, now).await;
            }
        }
        Ok(())
    }

    /// Hold the run: motor released, elapsed clock frozen. RUNNING only.
    pub async fn pause(&self, now: Instant) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state != MachineState::Running || inner.paused {
            return Err(Error::InvalidState);
        }
        self.relay_set(ro::MOTOR_START, RelayState::Off).await;
        inner.paused = true;
        inner.pause_started = Some(now);
        self.post_event(Event::new(EventId::RunPaused, Severity::Info));
        self.publish(&inner);
        info!("run paused");
        Ok(())
    }

    /// Resume a paused run; the run origin shifts by the pause duration.
    pub async fn resume(&self, now: Instant) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state != MachineState::Running || !inner.paused {
            return Err(Error::InvalidState);
        }
        if let (Some(start), Some(paused_at)) = (inner.run_start, inner.pause_started) {
            inner.run_start = Some(start + now.saturating_duration_since(paused_at));
        }
        inner.paused = false;
        inner.pause_started = None;
        if inner.run_mode != RunMode::DryRun {
            self.relay_set(ro::MOTOR_START, RelayState::On).await;
        }
        self.post_event(Event::new(EventId::RunResumed, Severity::Info));
        self.publish(&inner);
        info!("run resumed");
        Ok(())
    }

    /// Enter manual relay control. IDLE only.
    pub async fn enter_service(&self, now: Instant) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state != MachineState::Idle {
            warn!("cannot enter SERVICE: not IDLE");
            return Err(Error::InvalidState);
        }
        self.transition(&mut inner, MachineState::Service, now).await;
        Ok(())
    }

    /// Leave manual relay control; all relays turn off.
    pub async fn exit_service(&self, now: Instant) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state != MachineState::Service {
            return Err(Error::InvalidState);
        }
        if let Err(e) = self.relays.all_off().await {
            error!("relay sweep on service exit failed: {:?}", e);
        }
        self.transition(&mut inner, MachineState::Idle, now).await;
        Ok(())
    }

    /// Clear the E-Stop latch once the input has released.
    pub async fn clear_estop(&self, now: Instant) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state != MachineState::EStop {
            return Err(Error::InvalidState);
        }
        if self.estop_active() {
            warn!("cannot clear E-Stop: input still active");
            return Err(Error::ConditionActive);
        }
        self.transition(&mut inner, MachineState::Idle, now).await;
        info!("E-Stop cleared");
        Ok(())
    }

    /// Clear the fault latch once the fault condition has passed.
    pub async fn clear_fault(&self, now: Instant) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if inner.state != MachineState::Fault {
            return Err(Error::InvalidState);
        }
        if self.motor_fault_active() {
            warn!("cannot clear fault: still active");
            return Err(Error::ConditionActive);
        }
        self.transition(&mut inner, MachineState::Idle, now).await;
        info!("fault cleared");
        Ok(())
    }

    /// Force safe outputs and latch FAULT, for fatal subsystem errors.
    pub async fn force_safe(&self, now: Instant) {
        let mut inner = self.inner.lock().await;
        self.set_outputs_safe().await;
        self.transition(&mut inner, MachineState::Fault, now).await;
    }
}

impl<'a, E: ExpanderPort + Send> RunInfoSource for Machine<'a, E> {
    fn run_info(&self, now: Instant) -> Option<RunState> {
        let snap = self.snapshot.lock(|cell| cell.get());

        let mut elapsed_ms = 0u32;
        let mut remaining_ms = 0u32;
        if matches!(snap.state, MachineState::Precool | MachineState::Running) {
            if let Some(start) = snap.run_start {
                let end = if snap.paused {
                    snap.pause_started.unwrap_or(now)
                } else {
                    now
                };
                elapsed_ms = end.saturating_duration_since(start).as_millis().min(u64::from(u32::MAX)) as u32;
                if snap.run_duration_ms > 0 {
                    remaining_ms = snap.run_duration_ms.saturating_sub(elapsed_ms);
                }
            }
        }

        Some(RunState {
            state: snap.state as u8,
            elapsed_ms,
            remaining_ms,
            target_temp_x10: snap.target_temp_x10,
            recipe_step: 0,
            interlock_bits: self.interlocks(),
            lazy_poll: 0,
            idle_timeout_min: 0,
        })
    }
}
