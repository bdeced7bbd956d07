//! Telemetry emitter
//!
//! Periodic snapshot frames composed from every subsystem: digital inputs,
//! relay outputs, the alarm word, reachable controllers, and (when the
//! machine state manager is wired in) the extended run-state block. Runs at
//! 10 Hz; a snapshot-now command shortcuts the period through a signal.

use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Instant, Ticker, Duration};

use crate::bus::Bus;
use crate::pid::PidManager;
use crate::relay::{ExpanderPort, RelayDriver};
use crate::session::SessionManager;
use crate::transport::{EventQueue, FrameSink, TxError};
use crate::wire::{self, alarm, Event, EventId, RunState, Severity};

/// Snapshot period.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Signal used by the snapshot-now command to shortcut the period.
pub type SnapshotSignal = Signal<CriticalSectionRawMutex, ()>;

/// Run-state provider for the extended telemetry block.
///
/// The machine state manager implements this; [`NoRunInfo`] stands in when
/// the machine is absent and keeps telemetry on the basic frame.
pub trait RunInfoSource: Sync {
    /// Current run state, or `None` to emit the basic frame.
    fn run_info(&self, now: Instant) -> Option<RunState>;
}

/// Stub provider: no machine state manager present.
pub struct NoRunInfo;

impl RunInfoSource for NoRunInfo {
    fn run_info(&self, _now: Instant) -> Option<RunState> {
        None
    }
}

/// Process-wide alarm word.
pub struct Alarms {
    bits: AtomicU32,
}

impl Alarms {
    /// All clear.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
        }
    }

    /// Current word.
    #[must_use]
    pub fn load(&self) -> u32 {
        self.bits.load(Ordering::Relaxed)
    }

    /// Set the given bits.
    pub fn set(&self, bits: u32) {
        self.bits.fetch_or(bits, Ordering::Relaxed);
    }

    /// Clear the given bits.
    pub fn clear(&self, bits: u32) {
        self.bits.fetch_and(!bits, Ordering::Relaxed);
    }

    /// Clear the non-latched warning bits.
    pub fn clear_warnings(&self) {
        self.clear(alarm::WARNING_MASK);
        info!("warning alarm bits cleared");
    }
}

impl Default for Alarms {
    fn default() -> Self {
        Self::new()
    }
}

/// The telemetry emitter task.
pub struct Emitter<'a, E: ExpanderPort, B: Bus> {
    session: &'a SessionManager,
    pid: &'a PidManager<'a, B>,
    relays: &'a RelayDriver<E>,
    run_info: &'a dyn RunInfoSource,
    alarms: &'a Alarms,
    events: &'a EventQueue,
    poke: &'a SnapshotSignal,
    seq: AtomicU16,
    reported_alarms: AtomicU32,
}

impl<'a, E: ExpanderPort, B: Bus> Emitter<'a, E, B> {
    /// Wire up the emitter.
    pub fn new(
        session: &'a SessionManager,
        pid: &'a PidManager<'a, B>,
        relays: &'a RelayDriver<E>,
        run_info: &'a dyn RunInfoSource,
        alarms: &'a Alarms,
        events: &'a EventQueue,
        poke: &'a SnapshotSignal,
    ) -> Self {
        Self {
            session,
            pid,
            relays,
            run_info,
            alarms,
            events,
            poke,
            seq: AtomicU16::new(0),
            reported_alarms: AtomicU32::new(0),
        }
    }

    fn post_event(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            warn!("event queue full, dropping event 0x{:04x}", event.id as u16);
        }
    }

    /// Compose and submit one snapshot.
    pub async fn emit<F: FrameSink>(&self, sink: &F, now: Instant) {
        if self.session.check_expiry(now) {
            warn!("session expired, HMI not live");
        }
        if self.session.is_live() {
            self.alarms.clear(alarm::HMI_NOT_LIVE);
        } else {
            self.alarms.set(alarm::HMI_NOT_LIVE);
        }

        if self.pid.any_alarm() {
            self.alarms.set(alarm::PID1_FAULT);
        } else {
            self.alarms.clear(alarm::PID1_FAULT | alarm::PID2_FAULT | alarm::PID3_FAULT);
        }

        let mut run_state = self.run_info.run_info(now);
        if let Some(rs) = run_state.as_mut() {
            rs.lazy_poll = u8::from(self.pid.is_lazy());
            rs.idle_timeout_min = self.pid.idle_timeout_min();

            if rs.interlock_bits & crate::machine::interlock::ESTOP != 0 {
                self.alarms.set(alarm::ESTOP_ACTIVE);
            } else {
                self.alarms.clear(alarm::ESTOP_ACTIVE);
            }
            if rs.interlock_bits & crate::machine::interlock::DOOR_OPEN != 0 {
                self.alarms.set(alarm::DOOR_INTERLOCK);
            } else {
                self.alarms.clear(alarm::DOOR_INTERLOCK);
            }
        }

        let alarm_bits = self.alarms.load();
        let previous = self.reported_alarms.swap(alarm_bits, Ordering::Relaxed);
        if alarm_bits & !previous != 0 {
            self.post_event(
                Event::new(EventId::AlarmLatched, Severity::Alarm).with_data(&alarm_bits.to_le_bytes()),
            );
        } else if previous & !alarm_bits != 0 {
            self.post_event(
                Event::new(EventId::AlarmCleared, Severity::Info).with_data(&alarm_bits.to_le_bytes()),
            );
        }

        let di_bits = match self.relays.read_di().await {
            Ok(bits) => u16::from(bits),
            Err(e) => {
                warn!("DI read failed in telemetry: {:?}", e);
                0
            }
        };
        let ro_bits = u16::from(self.relays.state());
        let (controllers, count) = self.pid.snapshots(now);

        let mut frame = [0u8; wire::MAX_FRAME];
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let built = wire::build_telemetry(
            &mut frame,
            seq,
            now.as_millis() as u32,
            di_bits,
            ro_bits,
            alarm_bits,
            &controllers[..count],
            run_state.as_ref(),
        );

        match built {
            Ok(len) => match sink.send_telemetry(&frame[..len]).await {
                Ok(()) | Err(TxError::NotSubscribed) | Err(TxError::NotConnected) => {}
                Err(e) => warn!("telemetry submit failed: {:?}", e),
            },
            Err(e) => error!("telemetry frame build failed: {:?}", e),
        }
    }

    /// Emitter task body.
    pub async fn run<F: FrameSink>(&self, sink: &F) -> ! {
        info!("telemetry task started ({}ms period)", TELEMETRY_INTERVAL.as_millis());
        let mut ticker = Ticker::every(TELEMETRY_INTERVAL);
        loop {
            match select(ticker.next(), self.poke.wait()).await {
                Either::First(()) | Either::Second(()) => {
                    self.emit(sink, Instant::now()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use embassy_futures::block_on;
    use rand_core::RngCore;

    use super::*;
    use crate::bus::Error as BusError;
    use crate::pid::Config as PidConfig;
    use crate::relay::{Config as RelayConfig, Error as RelayError};
    use crate::wire::{parse_frame, MsgType, TELEMETRY_FIXED_LEN, RUN_STATE_LEN};

    struct NullBus;

    impl Bus for NullBus {
        async fn read_holding(&self, _addr: u8, _start: u16, _out: &mut [u16]) -> Result<(), BusError> {
            Err(BusError::Timeout)
        }

        async fn write_single(&self, _addr: u8, _reg: u16, _value: u16) -> Result<(), BusError> {
            Err(BusError::Timeout)
        }

        async fn write_multiple(&self, _addr: u8, _start: u16, _values: &[u16]) -> Result<(), BusError> {
            Err(BusError::Timeout)
        }
    }

    #[derive(Clone, Default)]
    struct FakeExpander;

    impl ExpanderPort for FakeExpander {
        async fn write_outputs(&mut self, _bits: u8) -> Result<(), RelayError> {
            Ok(())
        }

        async fn read_outputs(&mut self) -> Result<u8, RelayError> {
            Ok(0)
        }

        async fn read_inputs(&mut self) -> Result<u8, RelayError> {
            Ok(0x07)
        }
    }

    #[derive(Default)]
    struct FakeSink {
        frames: StdMutex<Vec<Vec<u8>>>,
    }

    impl FrameSink for FakeSink {
        async fn send_telemetry(&self, frame: &[u8]) -> Result<(), TxError> {
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }

        async fn send_ack(&self, _frame: &[u8], _reliable: bool) -> Result<(), TxError> {
            Ok(())
        }

        async fn send_event(&self, _frame: &[u8], _reliable: bool) -> Result<(), TxError> {
            Ok(())
        }
    }

    struct StubRun(RunState);

    impl RunInfoSource for StubRun {
        fn run_info(&self, _now: Instant) -> Option<RunState> {
            Some(self.0)
        }
    }

    struct StepRng(u32);

    impl RngCore for StepRng {
        fn next_u32(&mut self) -> u32 {
            self.0 = self.0.wrapping_add(1);
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

    struct Rig {
        session: &'static SessionManager,
        events: &'static EventQueue,
        alarms: &'static Alarms,
        emitter: Emitter<'static, FakeExpander, NullBus>,
    }

    fn at(ms: u64) -> Instant {
        Instant::from_ticks(0) + Duration::from_millis(ms)
    }

    fn rig(run_info: &'static dyn RunInfoSource) -> Rig {
        let bus: &'static NullBus = Box::leak(Box::new(NullBus));
        let events: &'static EventQueue = Box::leak(Box::new(EventQueue::new()));
        let session: &'static SessionManager = Box::leak(Box::new(SessionManager::new()));
        let pid: &'static PidManager<'static, NullBus> =
            Box::leak(Box::new(PidManager::new(bus, events, PidConfig::default(), at(0))));
        let relays: &'static RelayDriver<FakeExpander> =
            Box::leak(Box::new(RelayDriver::new(FakeExpander, RelayConfig::default())));
        let alarms: &'static Alarms = Box::leak(Box::new(Alarms::new()));
        let poke: &'static SnapshotSignal = Box::leak(Box::new(Signal::new()));

        let emitter = Emitter::new(session, pid, relays, run_info, alarms, events, poke);
        Rig {
            session,
            events,
            alarms,
            emitter,
        }
    }

    fn alarm_bits_of(frame: &[u8]) -> u32 {
        let (header, body) = parse_frame(frame).unwrap();
        assert_eq!(header.msg_type, MsgType::Telemetry);
        u32::from_le_bytes([body[8], body[9], body[10], body[11]])
    }

    #[test]
    fn basic_frame_without_run_info() {
        let r = rig(&NoRunInfo);
        let sink = FakeSink::default();
        block_on(r.emitter.emit(&sink, at(0)));

        let frames = sink.frames.lock().unwrap();
        let (_, body) = parse_frame(&frames[0]).unwrap();
        assert_eq!(body.len(), TELEMETRY_FIXED_LEN);
        // No controllers polled yet.
        assert_eq!(body[12], 0);
    }

    #[test]
    fn extended_frame_carries_poller_state() {
        let run: &'static StubRun = Box::leak(Box::new(StubRun(RunState {
            state: 2,
            interlock_bits: 0,
            ..RunState::default()
        })));
        let r = rig(run);
        let sink = FakeSink::default();
        block_on(r.emitter.emit(&sink, at(0)));

        let frames = sink.frames.lock().unwrap();
        let (_, body) = parse_frame(&frames[0]).unwrap();
        assert_eq!(body.len(), TELEMETRY_FIXED_LEN + RUN_STATE_LEN);
        let ext = &body[TELEMETRY_FIXED_LEN..];
        assert_eq!(ext[0], 2);
        // Idle-timeout minutes patched in from the poller config.
        assert_eq!(ext[14], crate::pid::IDLE_TIMEOUT_DEFAULT_MIN);
    }

    #[test]
    fn expired_session_sets_hmi_alarm() {
        let r = rig(&NoRunInfo);
        let sink = FakeSink::default();

        let (_id, lease) = r.session.open(1, at(0), &mut StepRng(0));

        block_on(r.emitter.emit(&sink, at(100)));
        assert_eq!(alarm_bits_of(&sink.frames.lock().unwrap()[0]) & alarm::HMI_NOT_LIVE, 0);

        // Past lease + grace.
        block_on(r.emitter.emit(&sink, at(u64::from(lease) + 501)));
        assert_ne!(alarm_bits_of(&sink.frames.lock().unwrap()[1]) & alarm::HMI_NOT_LIVE, 0);
    }

    #[test]
    fn force_expire_shows_in_next_frame() {
        let r = rig(&NoRunInfo);
        let sink = FakeSink::default();
        r.session.open(1, at(0), &mut StepRng(0));

        block_on(r.emitter.emit(&sink, at(50)));
        assert_eq!(alarm_bits_of(&sink.frames.lock().unwrap()[0]) & alarm::HMI_NOT_LIVE, 0);

        // Transport dropped: the session dies immediately and the next
        // frame raises the alarm.
        r.session.force_expire();
        block_on(r.emitter.emit(&sink, at(150)));
        assert_ne!(alarm_bits_of(&sink.frames.lock().unwrap()[1]) & alarm::HMI_NOT_LIVE, 0);
    }

    #[test]
    fn alarm_transitions_emit_events() {
        let r = rig(&NoRunInfo);
        let sink = FakeSink::default();

        r.alarms.set(alarm::OVER_TEMP);
        block_on(r.emitter.emit(&sink, at(0)));
        let mut latched = false;
        while let Ok(ev) = r.events.try_receive() {
            latched |= ev.id == EventId::AlarmLatched;
        }
        assert!(latched);

        r.alarms.clear_warnings();
        block_on(r.emitter.emit(&sink, at(100)));
        let mut cleared = false;
        while let Ok(ev) = r.events.try_receive() {
            cleared |= ev.id == EventId::AlarmCleared;
        }
        assert!(cleared);
    }

    #[test]
    fn estop_interlock_sets_alarm_bit() {
        let run: &'static StubRun = Box::leak(Box::new(StubRun(RunState {
            state: 4,
            interlock_bits: crate::machine::interlock::ESTOP,
            ..RunState::default()
        })));
        let r = rig(run);
        let sink = FakeSink::default();
        block_on(r.emitter.emit(&sink, at(0)));
        assert_ne!(alarm_bits_of(&sink.frames.lock().unwrap()[0]) & alarm::ESTOP_ACTIVE, 0);
    }
}
