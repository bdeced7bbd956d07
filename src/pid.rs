//! Temperature-controller poller
//!
//! Abstracts a fleet of PID temperature controllers on the industrial bus
//! into a cached read/write model. A single poller task round-robins the
//! fleet, with an adaptive period: fast while an operator is around, slow
//! once the idle timeout lapses. Commanded writes go straight to the bus and
//! are verified by read-back.
//!
//! Register map of the LC108-class controller, 0-based.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_time::{Duration, Instant, Timer};

use crate::bus::{Bus, Error as BusError};
use crate::machine::ChamberProbe;
use crate::transport::EventQueue;
use crate::wire::{ControllerData, Event, EventId, Severity};

/// Maximum controllers on the bus.
pub const MAX_CONTROLLERS: usize = 3;
/// Bus address of the chamber (coolant) controller.
pub const CHAMBER_ADDR: u8 = 1;

/// Fast poll period per controller.
pub const POLL_INTERVAL_FAST: Duration = Duration::from_millis(300);
/// Slow poll period once the idle timeout has lapsed.
pub const POLL_INTERVAL_SLOW: Duration = Duration::from_millis(2000);
/// Data age beyond which an online record turns stale, fast mode.
pub const STALE_THRESHOLD: Duration = Duration::from_millis(2000);
/// Default idle timeout in minutes; 0 disables lazy polling.
pub const IDLE_TIMEOUT_DEFAULT_MIN: u8 = 10;
/// Consecutive poll failures before a controller is offline.
pub const OFFLINE_ERROR_COUNT: u32 = 3;

/// Controller holding registers.
pub mod reg {
    use core::ops::RangeInclusive;

    /// Process value, ×10.
    pub const PV: u16 = 0;
    /// Output 1 percentage, ×10.
    pub const MV1: u16 = 1;
    /// Output 2 percentage, ×10.
    pub const MV2: u16 = 2;
    /// Output feedback percentage, ×10.
    pub const MVFB: u16 = 3;
    /// Status bitfield.
    pub const STATUS: u16 = 4;
    /// Setpoint, ×10.
    pub const SV: u16 = 5;
    /// Auto-tune request (0 = off, 1 = on).
    pub const AT: u16 = 12;
    /// Control mode.
    pub const MODE: u16 = 13;
    /// Alarm 1 setpoint, ×10.
    pub const AL1: u16 = 14;
    /// Alarm 2 setpoint, ×10.
    pub const AL2: u16 = 15;
    /// P gain, ×10.
    pub const P1: u16 = 24;
    /// I time, seconds.
    pub const I1: u16 = 25;
    /// D time, seconds.
    pub const D1: u16 = 26;
    /// Setpoint lower limit, ×10.
    pub const SV_LOW: u16 = 68;
    /// Setpoint upper limit, ×10.
    pub const SV_HIGH: u16 = 69;
    /// Bus-configuration registers, protected from arbitrary writes.
    pub const COMM_PROTECTED: RangeInclusive<u16> = 49..=51;
}

/// Controller status register bits.
pub mod status {
    /// Alarm 1 active.
    pub const ALARM1: u16 = 1 << 0;
    /// Alarm 2 active.
    pub const ALARM2: u16 = 1 << 1;
    /// Output 1 energized.
    pub const OUTPUT1: u16 = 1 << 2;
    /// Output 2 energized.
    pub const OUTPUT2: u16 = 1 << 3;
    /// Auto-tune in progress.
    pub const AUTOTUNE: u16 = 1 << 4;
}

/// Highest accepted controller mode value.
pub const MODE_MAX: u8 = 3;

/// Write-verify tolerance for temperatures, °C.
pub const VERIFY_TOLERANCE_C: f32 = 0.15;

/// Controller reachability state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PidState {
    /// Never polled successfully.
    #[default]
    Unknown,
    /// Responding normally.
    Online,
    /// Last data valid but aging.
    Stale,
    /// Stopped responding.
    Offline,
}

impl PidState {
    /// Online or stale: the cached data is usable.
    #[must_use]
    pub fn reachable(self) -> bool {
        matches!(self, Self::Online | Self::Stale)
    }
}

/// Last data read from one controller.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LiveData {
    /// Process value, °C.
    pub pv: f32,
    /// Setpoint, °C.
    pub sv: f32,
    /// Output percentage.
    pub output_pct: f32,
    /// Raw status bitfield.
    pub status: u16,
    /// Control mode.
    pub mode: u8,
    /// Alarm 1 active.
    pub alarm1: bool,
    /// Alarm 2 active.
    pub alarm2: bool,
}

/// One controller record.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Controller {
    /// Bus address.
    pub addr: u8,
    /// Reachability.
    pub state: PidState,
    /// Latest data.
    pub data: LiveData,
    /// Timestamp of the last successful poll.
    pub last_update: Option<Instant>,
    /// Consecutive poll failures.
    pub error_count: u32,
    /// Total poll attempts.
    pub total_polls: u32,
    /// Total poll failures.
    pub total_errors: u32,
    seen_autotune: bool,
}

impl Controller {
    /// Last process value ×10, as carried on the wire.
    #[must_use]
    pub fn pv_x10(&self) -> i16 {
        encode_temp(self.data.pv)
    }
}

/// Poller configuration.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Bus addresses of the fitted controllers.
    pub addresses: [u8; MAX_CONTROLLERS],
    /// Number of fitted controllers.
    pub count: usize,
    /// Fast poll period.
    pub poll_interval: Duration,
    /// Idle timeout in minutes; 0 disables lazy polling.
    pub idle_timeout_min: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addresses: [1, 2, 3],
            count: MAX_CONTROLLERS,
            poll_interval: POLL_INTERVAL_FAST,
            idle_timeout_min: IDLE_TIMEOUT_DEFAULT_MIN,
        }
    }
}

/// Controller-layer errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Bus transaction failed.
    Bus(BusError),
    /// Write landed but the read-back disagreed; carries the raw read-back.
    VerifyMismatch(u16),
    /// Argument outside its domain.
    InvalidArg,
    /// Register is reserved for bus configuration.
    Protected,
    /// No controller with that address.
    NotFound,
}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

fn decode_temp(raw: u16) -> f32 {
    f32::from(raw as i16) / 10.0
}

fn encode_temp(celsius: f32) -> i16 {
    let scaled = celsius * 10.0;
    (if scaled >= 0.0 { scaled + 0.5 } else { scaled - 0.5 }) as i16
}

fn decode_percent(raw: u16) -> f32 {
    f32::from(raw as i16) / 10.0
}

/// Cached view of the controller fleet plus the poller state.
pub struct PidManager<'a, B: Bus> {
    bus: &'a B,
    events: &'a EventQueue,
    controllers: BlockingMutex<CriticalSectionRawMutex, RefCell<[Controller; MAX_CONTROLLERS]>>,
    count: usize,
    poll_interval: Duration,
    idle_timeout_min: AtomicU8,
    lazy_active: AtomicBool,
    last_activity: BlockingMutex<CriticalSectionRawMutex, Cell<Instant>>,
}

impl<'a, B: Bus> PidManager<'a, B> {
    /// Create the manager; records start out [`PidState::Unknown`].
    pub fn new(bus: &'a B, events: &'a EventQueue, config: Config, now: Instant) -> Self {
        let mut controllers = [Controller::default(); MAX_CONTROLLERS];
        let count = config.count.min(MAX_CONTROLLERS);
        for (i, c) in controllers.iter_mut().enumerate().take(count) {
            c.addr = config.addresses[i];
        }
        Self {
            bus,
            events,
            controllers: BlockingMutex::new(RefCell::new(controllers)),
            count,
            poll_interval: config.poll_interval,
            idle_timeout_min: AtomicU8::new(config.idle_timeout_min),
            lazy_active: AtomicBool::new(false),
            last_activity: BlockingMutex::new(Cell::new(now)),
        }
    }

    /// Number of fitted controllers.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Copy of a record by index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Controller> {
        if index >= self.count {
            return None;
        }
        Some(self.controllers.lock(|c| c.borrow()[index]))
    }

    /// Copy of a record by bus address.
    #[must_use]
    pub fn get_by_addr(&self, addr: u8) -> Option<Controller> {
        self.controllers.lock(|c| {
            c.borrow()[..self.count].iter().find(|ctrl| ctrl.addr == addr).copied()
        })
    }

    fn index_of(&self, addr: u8) -> Option<usize> {
        self.controllers.lock(|c| {
            c.borrow()[..self.count].iter().position(|ctrl| ctrl.addr == addr)
        })
    }

    /// True if any online controller reports an alarm.
    #[must_use]
    pub fn any_alarm(&self) -> bool {
        self.controllers.lock(|c| {
            c.borrow()[..self.count]
                .iter()
                .any(|ctrl| ctrl.state == PidState::Online && (ctrl.data.alarm1 || ctrl.data.alarm2))
        })
    }

    /// True while the given controller's status reports auto-tune running.
    #[must_use]
    pub fn is_autotuning(&self, addr: u8) -> bool {
        self.get_by_addr(addr)
            .is_some_and(|c| c.data.status & status::AUTOTUNE != 0)
    }

    /// Telemetry snapshot of all reachable controllers.
    pub fn snapshots(&self, now: Instant) -> ([ControllerData; MAX_CONTROLLERS], usize) {
        let mut out = [ControllerData::default(); MAX_CONTROLLERS];
        let mut n = 0;
        self.controllers.lock(|c| {
            for ctrl in c.borrow()[..self.count].iter() {
                if !ctrl.state.reachable() {
                    continue;
                }
                let age_ms = ctrl
                    .last_update
                    .map_or(u16::MAX, |t| now.saturating_duration_since(t).as_millis().min(u64::from(u16::MAX)) as u16);
                out[n] = ControllerData {
                    id: ctrl.addr,
                    pv_x10: encode_temp(ctrl.data.pv),
                    sv_x10: encode_temp(ctrl.data.sv),
                    output_x10: (ctrl.data.output_pct * 10.0) as u16,
                    mode: ctrl.data.mode,
                    age_ms,
                };
                n += 1;
            }
        });
        (out, n)
    }

    /// Note operator activity; the poller leaves lazy mode on the next cycle.
    pub fn signal_activity(&self, now: Instant) {
        self.last_activity.lock(|c| c.set(now));
    }

    /// Configured idle timeout in minutes.
    #[must_use]
    pub fn idle_timeout_min(&self) -> u8 {
        self.idle_timeout_min.load(Ordering::Relaxed)
    }

    /// Set the idle timeout and restart the activity clock.
    pub fn set_idle_timeout_min(&self, minutes: u8, now: Instant) {
        self.idle_timeout_min.store(minutes, Ordering::Relaxed);
        self.signal_activity(now);
        info!("idle timeout set to {} minutes", minutes);
    }

    /// True while the poller is in its slow period.
    #[must_use]
    pub fn is_lazy(&self) -> bool {
        self.lazy_active.load(Ordering::Relaxed)
    }

    fn lazy_at(&self, now: Instant) -> bool {
        let minutes = self.idle_timeout_min.load(Ordering::Relaxed);
        if minutes == 0 {
            return false;
        }
        let idle = now.saturating_duration_since(self.last_activity.lock(|c| c.get()));
        idle >= Duration::from_secs(u64::from(minutes) * 60)
    }

    /// Poll one controller by fleet index and fold the result into the cache.
    pub async fn poll_index(&self, index: usize, now: Instant) -> Result<(), Error> {
        if index >= self.count {
            return Err(Error::NotFound);
        }
        let (addr, prev_state, prev_seen) = self.controllers.lock(|c| {
            let c = c.borrow();
            (c[index].addr, c[index].state, c[index].seen_autotune)
        });

        // PV, MV1, MV2, MVFB, STATUS, SV in one transaction.
        let mut regs = [0u16; 6];
        let result = self.bus.read_holding(addr, reg::PV, &mut regs).await;

        if let Err(e) = result {
            self.controllers.lock(|c| {
                let mut c = c.borrow_mut();
                let ctrl = &mut c[index];
                ctrl.total_polls += 1;
                ctrl.error_count += 1;
                ctrl.total_errors += 1;
                if ctrl.error_count >= OFFLINE_ERROR_COUNT {
                    if ctrl.state.reachable() {
                        warn!("controller {} went offline: {:?}", addr, e);
                    }
                    if ctrl.state != PidState::Offline && ctrl.state != PidState::Unknown {
                        ctrl.state = PidState::Offline;
                        self.post_event(Event::from_controller(
                            EventId::BusDeviceOffline,
                            Severity::Warn,
                            addr,
                        ));
                    } else {
                        ctrl.state = PidState::Offline;
                    }
                } else if ctrl.state == PidState::Online {
                    ctrl.state = PidState::Stale;
                }
            });
            return Err(e.into());
        }

        // MODE lives apart from the main block; a failed read keeps the
        // previous mode without failing the poll.
        let mut mode_reg = [0u16; 1];
        let mode_ok = self.bus.read_holding(addr, reg::MODE, &mut mode_reg).await.is_ok();
        if !mode_ok {
            warn!("controller {} mode read failed", addr);
        }

        let autotune_now = regs[4] & status::AUTOTUNE != 0;

        self.controllers.lock(|c| {
            let mut c = c.borrow_mut();
            let ctrl = &mut c[index];
            ctrl.total_polls += 1;
            ctrl.data.pv = decode_temp(regs[0]);
            ctrl.data.output_pct = decode_percent(regs[1]);
            ctrl.data.status = regs[4];
            ctrl.data.sv = decode_temp(regs[5]);
            ctrl.data.alarm1 = regs[4] & status::ALARM1 != 0;
            ctrl.data.alarm2 = regs[4] & status::ALARM2 != 0;
            if mode_ok {
                ctrl.data.mode = (mode_reg[0] & 0xFF) as u8;
            }
            ctrl.last_update = Some(now);
            ctrl.error_count = 0;
            ctrl.state = PidState::Online;
            ctrl.seen_autotune = autotune_now;
        });

        if !prev_state.reachable() {
            info!("controller {} online", addr);
            self.post_event(Event::from_controller(EventId::BusDeviceOnline, Severity::Info, addr));
        }

        if prev_seen && !autotune_now {
            info!("controller {} auto-tune finished", addr);
            self.post_event(Event::from_controller(EventId::AutotuneComplete, Severity::Info, addr));
        }

        Ok(())
    }

    /// Immediate out-of-band poll, e.g. after a verified write.
    pub async fn force_poll(&self, addr: u8, now: Instant) -> Result<(), Error> {
        let index = self.index_of(addr).ok_or(Error::NotFound)?;
        self.poll_index(index, now).await
    }

    /// Demote online records whose data has outlived the stale threshold.
    pub fn mark_stale(&self, now: Instant, lazy: bool) {
        let threshold = if lazy { POLL_INTERVAL_SLOW * 3 } else { STALE_THRESHOLD };
        self.controllers.lock(|c| {
            let mut c = c.borrow_mut();
            for ctrl in c[..self.count].iter_mut() {
                if ctrl.state != PidState::Online {
                    continue;
                }
                let age = ctrl.last_update.map_or(Duration::from_ticks(0), |t| now.saturating_duration_since(t));
                if age > threshold {
                    warn!("controller {} data stale (age={}ms)", ctrl.addr, age.as_millis());
                    ctrl.state = PidState::Stale;
                }
            }
        });
    }

    fn post_event(&self, event: Event) {
        if self.events.try_send(event).is_err() {
            warn!("event queue full, dropping event 0x{:04x}", event.id as u16);
        }
    }

    /// Poller task body: round-robin with the adaptive period.
    pub async fn run(&self) -> ! {
        info!("controller poll task started, {} controllers", self.count);
        let mut index = 0usize;
        let mut was_lazy = false;

        loop {
            let now = Instant::now();
            let lazy = self.lazy_at(now);
            if lazy != was_lazy {
                if lazy {
                    info!("entering lazy polling ({}ms period)", POLL_INTERVAL_SLOW.as_millis());
                } else {
                    info!("resuming fast polling ({}ms period)", self.poll_interval.as_millis());
                }
                was_lazy = lazy;
            }
            self.lazy_active.store(lazy, Ordering::Relaxed);

            let interval = if lazy { POLL_INTERVAL_SLOW } else { self.poll_interval };
            Timer::after(interval).await;

            if self.count == 0 {
                continue;
            }
            let _ = self.poll_index(index, Instant::now()).await;
            index = (index + 1) % self.count;

            self.mark_stale(Instant::now(), lazy);
        }
    }

    /// Write a setpoint and verify by read-back within
    /// [`VERIFY_TOLERANCE_C`].
    pub async fn set_setpoint(&self, addr: u8, sv_celsius: f32) -> Result<(), Error> {
        let raw = encode_temp(sv_celsius) as u16;
        self.bus.write_single(addr, reg::SV, raw).await?;

        let mut readback = [0u16; 1];
        match self.bus.read_holding(addr, reg::SV, &mut readback).await {
            Err(e) => {
                // The write itself landed.
                warn!("setpoint verify read failed on addr {}: {:?}", addr, e);
            }
            Ok(()) => {
                let diff = sv_celsius - decode_temp(readback[0]);
                if !(-VERIFY_TOLERANCE_C..=VERIFY_TOLERANCE_C).contains(&diff) {
                    warn!("setpoint verify mismatch on addr {}: read {}", addr, readback[0]);
                    return Err(Error::VerifyMismatch(readback[0]));
                }
            }
        }
        info!("setpoint on addr {} verified", addr);
        Ok(())
    }

    /// Write the control mode and verify by read-back.
    pub async fn set_mode(&self, addr: u8, mode: u8) -> Result<(), Error> {
        if mode > MODE_MAX {
            return Err(Error::InvalidArg);
        }
        self.bus.write_single(addr, reg::MODE, u16::from(mode)).await?;

        let mut readback = [0u16; 1];
        match self.bus.read_holding(addr, reg::MODE, &mut readback).await {
            Err(e) => warn!("mode verify read failed on addr {}: {:?}", addr, e),
            Ok(()) => {
                if (readback[0] & 0xFF) as u8 != mode {
                    warn!("mode verify mismatch on addr {}: read {}", addr, readback[0]);
                    return Err(Error::VerifyMismatch(readback[0]));
                }
            }
        }
        info!("mode {} on addr {} verified", mode, addr);
        Ok(())
    }

    /// Write P, I and D in one transaction.
    pub async fn write_params(&self, addr: u8, p_gain: f32, i_time: u16, d_time: u16) -> Result<(), Error> {
        let raw_p = encode_temp(p_gain) as u16;
        self.bus.write_multiple(addr, reg::P1, &[raw_p, i_time, d_time]).await?;
        info!("PID params on addr {} written", addr);
        Ok(())
    }

    /// Read P, I and D.
    pub async fn read_params(&self, addr: u8) -> Result<(f32, u16, u16), Error> {
        let mut regs = [0u16; 3];
        self.bus.read_holding(addr, reg::P1, &mut regs).await?;
        Ok((decode_percent(regs[0]), regs[1], regs[2]))
    }

    /// Write both alarm setpoints.
    pub async fn set_alarm_limits(&self, addr: u8, alarm1_c: f32, alarm2_c: f32) -> Result<(), Error> {
        let regs = [encode_temp(alarm1_c) as u16, encode_temp(alarm2_c) as u16];
        self.bus.write_multiple(addr, reg::AL1, &regs).await?;
        info!("alarm limits on addr {} written", addr);
        Ok(())
    }

    /// Read both alarm setpoints.
    pub async fn read_alarm_limits(&self, addr: u8) -> Result<(f32, f32), Error> {
        let mut regs = [0u16; 2];
        self.bus.read_holding(addr, reg::AL1, &mut regs).await?;
        Ok((decode_temp(regs[0]), decode_temp(regs[1])))
    }

    /// Request auto-tune start.
    pub async fn start_autotune(&self, addr: u8) -> Result<(), Error> {
        self.bus.write_single(addr, reg::AT, 1).await?;
        info!("auto-tune started on addr {}", addr);
        self.post_event(Event::from_controller(EventId::AutotuneStarted, Severity::Info, addr));
        Ok(())
    }

    /// Request auto-tune stop.
    pub async fn stop_autotune(&self, addr: u8) -> Result<(), Error> {
        self.bus.write_single(addr, reg::AT, 0).await?;
        info!("auto-tune stopped on addr {}", addr);
        Ok(())
    }

    /// Raw register read, bounded to 16 registers per request.
    pub async fn read_registers(&self, addr: u8, start: u16, out: &mut [u16]) -> Result<(), Error> {
        if out.is_empty() || out.len() > 16 {
            return Err(Error::InvalidArg);
        }
        self.bus.read_holding(addr, start, out).await?;
        Ok(())
    }

    /// Raw register write with read-back verification. Returns the verified
    /// value; bus-configuration registers are refused.
    pub async fn write_register(&self, addr: u8, register: u16, value: u16) -> Result<u16, Error> {
        if reg::COMM_PROTECTED.contains(&register) {
            warn!("refusing write to protected register {}", register);
            return Err(Error::Protected);
        }
        self.bus.write_single(addr, register, value).await?;

        let mut readback = [0u16; 1];
        match self.bus.read_holding(addr, register, &mut readback).await {
            Err(e) => {
                warn!("register verify read failed on addr {} reg {}: {:?}", addr, register, e);
                Ok(value)
            }
            Ok(()) => {
                if readback[0] != value {
                    warn!(
                        "register verify mismatch on addr {} reg {}: wrote 0x{:04x}, read 0x{:04x}",
                        addr, register, value, readback[0]
                    );
                    Err(Error::VerifyMismatch(readback[0]))
                } else {
                    Ok(readback[0])
                }
            }
        }
    }
}

impl<'a, B: Bus + Sync> ChamberProbe for PidManager<'a, B> {
    fn chamber_temp_x10(&self) -> Option<i16> {
        let ctrl = self.get_by_addr(CHAMBER_ADDR)?;
        (ctrl.state == PidState::Online).then(|| encode_temp(ctrl.data.pv))
    }
}
