//! End-to-end command flows through the public API: frames in, acks and
//! telemetry out, with fake hardware behind every seam.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use embassy_futures::block_on;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant};
use rand_core::RngCore;

use cryomill::bus::{Bus, Error as BusError};
use cryomill::dispatch::Dispatcher;
use cryomill::gates::SafetyGates;
use cryomill::machine::{interlock, Machine, MachineState};
use cryomill::pid::{reg, Config as PidConfig, PidManager};
use cryomill::relay::{Config as RelayConfig, Error as RelayError, ExpanderPort, RelayDriver, DI_SAFE_DEFAULT};
use cryomill::session::SessionManager;
use cryomill::settings::{Settings, SettingsStore, StoreError};
use cryomill::telemetry::{Alarms, Emitter, SnapshotSignal};
use cryomill::transport::{EventQueue, FrameSink, TxError};
use cryomill::wire::{self, alarm, AckStatus, MsgType};

#[derive(Clone, Default)]
struct FakeExpander {
    outputs: Arc<AtomicU8>,
    inputs: Arc<AtomicU8>,
}

impl ExpanderPort for FakeExpander {
    async fn write_outputs(&mut self, bits: u8) -> Result<(), RelayError> {
        self.outputs.store(bits, Ordering::Relaxed);
        Ok(())
    }

    async fn read_outputs(&mut self) -> Result<u8, RelayError> {
        Ok(self.outputs.load(Ordering::Relaxed))
    }

    async fn read_inputs(&mut self) -> Result<u8, RelayError> {
        Ok(self.inputs.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct FakeBus {
    regs: StdMutex<std::collections::HashMap<(u8, u16), u16>>,
}

impl FakeBus {
    fn set(&self, addr: u8, register: u16, value: u16) {
        self.regs.lock().unwrap().insert((addr, register), value);
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
        self.set(addr, register, value);
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
struct RecordingSink {
    acks: StdMutex<Vec<Vec<u8>>>,
    telemetry: StdMutex<Vec<Vec<u8>>>,
}

impl FrameSink for RecordingSink {
    async fn send_telemetry(&self, frame: &[u8]) -> Result<(), TxError> {
        self.telemetry.lock().unwrap().push(frame.to_vec());
        Ok(())
    }

    async fn send_ack(&self, frame: &[u8], _reliable: bool) -> Result<(), TxError> {
        self.acks.lock().unwrap().push(frame.to_vec());
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
        self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
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

struct Plant {
    expander: FakeExpander,
    sink: &'static RecordingSink,
    session: &'static SessionManager,
    machine: &'static Machine<'static, FakeExpander>,
    relays: &'static RelayDriver<FakeExpander>,
    emitter: Emitter<'static, FakeExpander, FakeBus>,
    dispatcher:
        Dispatcher<'static, FakeExpander, FakeBus, SeqRng, RecordingSink, MemStore>,
}

fn at(ms: u64) -> Instant {
    Instant::from_ticks(0) + Duration::from_millis(ms)
}

fn plant() -> Plant {
    let expander = FakeExpander::default();
    expander.inputs.store(DI_SAFE_DEFAULT, Ordering::Relaxed);

    let bus: &'static FakeBus = Box::leak(Box::new(FakeBus::default()));
    for addr in 1..=3u8 {
        bus.set(addr, reg::PV, (-1955i16) as u16);
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
    let sink: &'static RecordingSink = Box::leak(Box::new(RecordingSink::default()));
    let poke: &'static SnapshotSignal = Box::leak(Box::new(SnapshotSignal::new()));

    for i in 0..3 {
        block_on(pid.poll_index(i, at(0))).unwrap();
    }

    let emitter = Emitter::new(session, pid, relays, machine, alarms, events, poke);
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
        SeqRng(0xC0FF_EE00),
    );

    Plant {
        expander,
        sink,
        session,
        machine,
        relays,
        emitter,
        dispatcher,
    }
}

fn command(seq: u16, cmd_id: u16, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&cmd_id.to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(body);
    let mut frame = [0u8; wire::MAX_FRAME];
    let len = wire::build_frame(&mut frame, MsgType::Command, seq, &payload).unwrap();
    frame[..len].to_vec()
}

struct Ack {
    acked_seq: u16,
    cmd_id: u16,
    status: u8,
    detail: u16,
    body: Vec<u8>,
}

fn last_ack(sink: &RecordingSink) -> Ack {
    let acks = sink.acks.lock().unwrap();
    let frame = acks.last().expect("no ack emitted");
    let (header, payload) = wire::parse_frame(frame).unwrap();
    assert_eq!(header.msg_type, MsgType::CommandAck);
    Ack {
        acked_seq: u16::from_le_bytes([payload[0], payload[1]]),
        cmd_id: u16::from_le_bytes([payload[2], payload[3]]),
        status: payload[4],
        detail: u16::from_le_bytes([payload[5], payload[6]]),
        body: payload[7..].to_vec(),
    }
}

fn open_session(p: &Plant, seq: u16, now: Instant) -> u32 {
    block_on(p.dispatcher.on_frame(&command(seq, 0x0100, &0xDEAD_BEEFu32.to_le_bytes()), now));
    let ack = last_ack(p.sink);
    assert_eq!(ack.status, AckStatus::Ok as u8);
    u32::from_le_bytes(ack.body[..4].try_into().unwrap())
}

#[test]
fn open_session_then_keepalive() {
    let p = plant();

    block_on(p.dispatcher.on_frame(&command(1, 0x0100, &0xDEAD_BEEFu32.to_le_bytes()), at(0)));
    let ack = last_ack(p.sink);
    assert_eq!(ack.acked_seq, 1);
    assert_eq!(ack.cmd_id, 0x0100);
    assert_eq!(ack.status, AckStatus::Ok as u8);
    let session_id = u32::from_le_bytes(ack.body[..4].try_into().unwrap());
    let lease_ms = u16::from_le_bytes(ack.body[4..6].try_into().unwrap());
    assert_ne!(session_id, 0);
    assert_eq!(lease_ms, 3000);

    block_on(p.dispatcher.on_frame(&command(2, 0x0101, &session_id.to_le_bytes()), at(500)));
    let ack = last_ack(p.sink);
    assert_eq!(ack.acked_seq, 2);
    assert_eq!(ack.status, AckStatus::Ok as u8);
}

#[test]
fn start_run_blocked_by_estop_reports_interlocks() {
    let p = plant();
    let id = open_session(&p, 1, at(0));

    p.expander.inputs.store(DI_SAFE_DEFAULT & !0x01, Ordering::Relaxed);
    block_on(p.machine.tick(at(50)));
    assert_eq!(p.machine.state(), MachineState::EStop);

    let mut body = id.to_le_bytes().to_vec();
    body.push(0);
    body.extend_from_slice(&0i16.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    block_on(p.dispatcher.on_frame(&command(2, 0x0102, &body), at(100)));

    let ack = last_ack(p.sink);
    assert_eq!(ack.status, AckStatus::RejectedPolicy as u8);
    assert_eq!(ack.detail, 0x0002);
    assert_eq!(ack.body.len(), 1);
    assert_ne!(ack.body[0] & interlock::ESTOP, 0);
}

#[test]
fn relay_mask_update_shows_in_telemetry() {
    let p = plant();
    let id = open_session(&p, 1, at(0));

    block_on(p.dispatcher.on_frame(&command(2, 0x0110, &id.to_le_bytes()), at(10)));
    assert_eq!(last_ack(p.sink).status, AckStatus::Ok as u8);
    assert_eq!(p.machine.state(), MachineState::Service);

    block_on(p.relays.set_all(0xF0)).unwrap();
    block_on(p.dispatcher.on_frame(&command(3, 0x0002, &[0x0F, 0x05]), at(20)));
    assert_eq!(last_ack(p.sink).status, AckStatus::Ok as u8);
    assert_eq!(p.relays.state(), 0xF5);

    block_on(p.emitter.emit(p.sink, at(30)));
    let frames = p.sink.telemetry.lock().unwrap();
    let (_, body) = wire::parse_frame(frames.last().unwrap()).unwrap();
    let ro_bits = u16::from_le_bytes([body[6], body[7]]);
    assert_eq!(ro_bits, 0x00F5);
}

#[test]
fn disconnect_raises_hmi_alarm_in_telemetry() {
    let p = plant();
    open_session(&p, 1, at(0));

    block_on(p.emitter.emit(p.sink, at(50)));
    {
        let frames = p.sink.telemetry.lock().unwrap();
        let (_, body) = wire::parse_frame(frames.last().unwrap()).unwrap();
        let bits = u32::from_le_bytes(body[8..12].try_into().unwrap());
        assert_eq!(bits & alarm::HMI_NOT_LIVE, 0);
    }

    p.dispatcher.on_disconnect();
    assert!(!p.session.is_live());

    block_on(p.emitter.emit(p.sink, at(120)));
    let frames = p.sink.telemetry.lock().unwrap();
    let (_, body) = wire::parse_frame(frames.last().unwrap()).unwrap();
    let bits = u32::from_le_bytes(body[8..12].try_into().unwrap());
    assert_ne!(bits & alarm::HMI_NOT_LIVE, 0);
}

#[test]
fn full_run_cycle_over_the_wire() {
    let p = plant();
    let id = open_session(&p, 1, at(0));
    block_on(p.machine.tick(at(10)));

    // Start a 60 s run targeting -195.0 C; the fleet already reads -195.5.
    let mut body = id.to_le_bytes().to_vec();
    body.push(0);
    body.extend_from_slice(&(-1950i16).to_le_bytes());
    body.extend_from_slice(&60_000u32.to_le_bytes());
    block_on(p.dispatcher.on_frame(&command(2, 0x0102, &body), at(20)));
    assert_eq!(last_ack(p.sink).status, AckStatus::Ok as u8);
    assert_eq!(p.machine.state(), MachineState::Precool);

    // Precool target already within tolerance: one tick reaches RUNNING.
    block_on(p.machine.tick(at(70)));
    assert_eq!(p.machine.state(), MachineState::Running);

    // Keepalives hold the session while the run completes.
    block_on(p.dispatcher.on_frame(&command(3, 0x0101, &id.to_le_bytes()), at(59_000)));
    block_on(p.machine.tick(at(60_100)));
    assert_eq!(p.machine.state(), MachineState::Stopping);

    block_on(p.machine.tick(at(60_100 + 30_050)));
    assert_eq!(p.machine.state(), MachineState::Idle);
    assert_eq!(p.relays.state(), 0x00);

    // The extended telemetry block reports IDLE with no run clock.
    block_on(p.emitter.emit(p.sink, at(91_000)));
    let frames = p.sink.telemetry.lock().unwrap();
    let (_, tel) = wire::parse_frame(frames.last().unwrap()).unwrap();
    let controllers = usize::from(tel[12]);
    let ext = &tel[wire::TELEMETRY_FIXED_LEN + controllers * wire::CONTROLLER_DATA_LEN..];
    assert_eq!(ext[0], MachineState::Idle as u8);
    assert_eq!(u32::from_le_bytes(ext[1..5].try_into().unwrap()), 0);
}
