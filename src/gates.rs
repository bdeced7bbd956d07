//! Safety gate framework
//!
//! Configurable capability levels per subsystem plus bypassable gates that
//! decide whether a run may start. Gates evaluate a [`GateInputs`] snapshot
//! assembled by the caller; nothing here reads other subsystems directly.
//!
//! Capability levels persist across boots. Gate bypasses do not: the enable
//! mask resets to all-enabled at construction, and the E-Stop gate can never
//! be disabled.

use core::sync::atomic::{AtomicU16, AtomicU8, Ordering};

/// Probe over-range threshold (open sensor), ×10 °C.
pub const PROBE_HIGH_X10: i16 = 5000;
/// Probe under-range threshold (shorted sensor), ×10 °C. Not applied to the
/// liquid-coolant controller, which legitimately reads deep-cold.
pub const PROBE_LOW_X10: i16 = -3000;

/// Number of controllers covered by per-controller gates.
pub const GATED_CONTROLLERS: usize = 3;

/// Capability level assigned to a subsystem.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Capability {
    /// Not installed; ignored completely.
    NotPresent = 0,
    /// Present but advisory; faults warn only.
    Optional = 1,
    /// Mandatory; faults block start.
    Required = 2,
}

impl Capability {
    /// Decode the wire encoding.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::NotPresent),
            1 => Some(Self::Optional),
            2 => Some(Self::Required),
            _ => None,
        }
    }
}

/// Subsystems with a configurable capability level.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Subsystem {
    /// Temperature controller 1 (liquid coolant).
    Pid1 = 0,
    /// Temperature controller 2.
    Pid2 = 1,
    /// Temperature controller 3.
    Pid3 = 2,
    /// E-Stop input. Pinned to [`Capability::Required`].
    EstopInput = 3,
    /// Door position input.
    DoorInput = 4,
    /// Liquid-coolant presence input.
    CoolantInput = 5,
    /// Motor-fault input.
    MotorFaultInput = 6,
}

/// Number of subsystems.
pub const SUBSYSTEM_COUNT: usize = 7;

impl Subsystem {
    /// Decode the wire encoding.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Pid1),
            1 => Some(Self::Pid2),
            2 => Some(Self::Pid3),
            3 => Some(Self::EstopInput),
            4 => Some(Self::DoorInput),
            5 => Some(Self::CoolantInput),
            6 => Some(Self::MotorFaultInput),
            _ => None,
        }
    }
}

/// Safety gates, in start-permit priority order.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum GateId {
    /// E-Stop not active. Never bypassable.
    Estop = 0,
    /// Door closed.
    DoorClosed = 1,
    /// HMI session live.
    HmiLive = 2,
    /// Controller 1 responding on the bus.
    Pid1Online = 3,
    /// Controller 2 responding on the bus.
    Pid2Online = 4,
    /// Controller 3 responding on the bus.
    Pid3Online = 5,
    /// Controller 1 probe reading in range.
    Pid1ProbeOk = 6,
    /// Controller 2 probe reading in range.
    Pid2ProbeOk = 7,
    /// Controller 3 probe reading in range.
    Pid3ProbeOk = 8,
    /// Reserved for a future motor-fault gate.
    Reserved = 9,
}

/// Number of gates.
pub const GATE_COUNT: usize = 10;

impl GateId {
    /// Decode the wire encoding.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Estop),
            1 => Some(Self::DoorClosed),
            2 => Some(Self::HmiLive),
            3 => Some(Self::Pid1Online),
            4 => Some(Self::Pid2Online),
            5 => Some(Self::Pid3Online),
            6 => Some(Self::Pid1ProbeOk),
            7 => Some(Self::Pid2ProbeOk),
            8 => Some(Self::Pid3ProbeOk),
            9 => Some(Self::Reserved),
            _ => None,
        }
    }

    fn related_subsystem(self) -> Option<Subsystem> {
        match self {
            Self::DoorClosed => Some(Subsystem::DoorInput),
            Self::Pid1Online | Self::Pid1ProbeOk => Some(Subsystem::Pid1),
            Self::Pid2Online | Self::Pid2ProbeOk => Some(Subsystem::Pid2),
            Self::Pid3Online | Self::Pid3ProbeOk => Some(Subsystem::Pid3),
            _ => None,
        }
    }
}

/// Result of evaluating one gate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GateStatus {
    /// Condition met.
    Passing,
    /// Condition failed and the gate is enforced.
    Blocking,
    /// Gate disabled at runtime; treated as passing.
    Bypassed,
    /// Related subsystem not present; not evaluated.
    NotApplicable,
}

/// Gate configuration errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The E-Stop subsystem and gate cannot be reconfigured.
    EstopPinned,
}

/// Per-controller observation fed into gate evaluation.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControllerProbe {
    /// Controller was online or stale at snapshot time.
    pub reachable: bool,
    /// Last process value ×10.
    pub pv_x10: i16,
}

/// Snapshot of every condition the gates evaluate.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GateInputs {
    /// E-Stop input asserted.
    pub estop_active: bool,
    /// Door reported open.
    pub door_open: bool,
    /// HMI session live.
    pub hmi_live: bool,
    /// Per-controller state, index 0 = controller 1.
    pub controllers: [ControllerProbe; GATED_CONTROLLERS],
}

/// Capability levels and gate enable mask.
///
/// Mutated only by the command dispatcher; single-word atomics make the
/// read paths lock-free.
pub struct SafetyGates {
    caps: [AtomicU8; SUBSYSTEM_COUNT],
    enable_mask: AtomicU16,
}

const ALL_ENABLED: u16 = (1 << GATE_COUNT) - 1;

impl SafetyGates {
    /// Defaults for a fully fitted machine: coolant controller and coolant
    /// input advisory, bearing controllers and door mandatory, motor fault
    /// not connected.
    #[must_use]
    pub fn new() -> Self {
        Self {
            caps: [
                AtomicU8::new(Capability::Optional as u8),
                AtomicU8::new(Capability::Required as u8),
                AtomicU8::new(Capability::Required as u8),
                AtomicU8::new(Capability::Required as u8),
                AtomicU8::new(Capability::Required as u8),
                AtomicU8::new(Capability::Optional as u8),
                AtomicU8::new(Capability::NotPresent as u8),
            ],
            enable_mask: AtomicU16::new(ALL_ENABLED),
        }
    }

    /// Apply persisted capability levels. The E-Stop slot is forced to
    /// REQUIRED regardless of what was stored; the enable mask is left at
    /// all-enabled.
    pub fn apply_persisted(&self, levels: &[Capability]) {
        for (i, level) in levels.iter().enumerate().take(SUBSYSTEM_COUNT) {
            self.caps[i].store(*level as u8, Ordering::Relaxed);
        }
        self.caps[Subsystem::EstopInput as usize].store(Capability::Required as u8, Ordering::Relaxed);
    }

    /// Capability level of one subsystem.
    #[must_use]
    pub fn capability(&self, subsystem: Subsystem) -> Capability {
        Capability::from_raw(self.caps[subsystem as usize].load(Ordering::Relaxed))
            .unwrap_or(Capability::NotPresent)
    }

    /// Set a capability level. The E-Stop input cannot be changed.
    pub fn set_capability(&self, subsystem: Subsystem, level: Capability) -> Result<(), Error> {
        if subsystem == Subsystem::EstopInput {
            warn!("refusing to change E-Stop capability");
            return Err(Error::EstopPinned);
        }
        self.caps[subsystem as usize].store(level as u8, Ordering::Relaxed);
        info!("capability set: subsystem={} level={}", subsystem as u8, level as u8);
        Ok(())
    }

    /// All capability levels, indexed by [`Subsystem`] discriminant.
    #[must_use]
    pub fn capabilities(&self) -> [u8; SUBSYSTEM_COUNT] {
        let mut out = [0u8; SUBSYSTEM_COUNT];
        for (i, cap) in self.caps.iter().enumerate() {
            out[i] = cap.load(Ordering::Relaxed);
        }
        out
    }

    /// True when the gate is enforced (not bypassed).
    #[must_use]
    pub fn is_enabled(&self, gate: GateId) -> bool {
        self.enable_mask.load(Ordering::Relaxed) & (1 << gate as u16) != 0
    }

    /// Enable or bypass a gate. The E-Stop gate cannot be bypassed; bypasses
    /// are volatile.
    pub fn set_enabled(&self, gate: GateId, enabled: bool) -> Result<(), Error> {
        if gate == GateId::Estop && !enabled {
            warn!("refusing to bypass the E-Stop gate");
            return Err(Error::EstopPinned);
        }
        let bit = 1u16 << gate as u16;
        if enabled {
            self.enable_mask.fetch_or(bit, Ordering::Relaxed);
            info!("gate {} enabled", gate as u8);
        } else {
            self.enable_mask.fetch_and(!bit, Ordering::Relaxed);
            warn!("gate {} bypassed", gate as u8);
        }
        Ok(())
    }

    /// Gate enable bitmask, bit N = gate N enforced.
    #[must_use]
    pub fn enable_mask(&self) -> u16 {
        self.enable_mask.load(Ordering::Relaxed)
    }

    /// Probe-error check for controller index 0..=2. Over-range applies to
    /// every controller; under-range skips the coolant controller (index 0).
    #[must_use]
    pub fn probe_error(&self, index: usize, inputs: &GateInputs) -> bool {
        let Some(probe) = inputs.controllers.get(index) else {
            return false;
        };
        if !probe.reachable {
            // Offline is the online gate's concern.
            return false;
        }
        if probe.pv_x10 >= PROBE_HIGH_X10 {
            return true;
        }
        index != 0 && probe.pv_x10 <= PROBE_LOW_X10
    }

    fn condition_met(&self, gate: GateId, inputs: &GateInputs) -> bool {
        match gate {
            GateId::Estop => !inputs.estop_active,
            GateId::DoorClosed => !inputs.door_open,
            GateId::HmiLive => inputs.hmi_live,
            GateId::Pid1Online => inputs.controllers[0].reachable,
            GateId::Pid2Online => inputs.controllers[1].reachable,
            GateId::Pid3Online => inputs.controllers[2].reachable,
            GateId::Pid1ProbeOk => !self.probe_error(0, inputs),
            GateId::Pid2ProbeOk => !self.probe_error(1, inputs),
            GateId::Pid3ProbeOk => !self.probe_error(2, inputs),
            GateId::Reserved => true,
        }
    }

    /// Evaluate one gate against a snapshot.
    #[must_use]
    pub fn check(&self, gate: GateId, inputs: &GateInputs) -> GateStatus {
        if gate != GateId::Estop && !self.is_enabled(gate) {
            return GateStatus::Bypassed;
        }
        if let Some(subsystem) = gate.related_subsystem() {
            if self.capability(subsystem) == Capability::NotPresent {
                return GateStatus::NotApplicable;
            }
        }
        if self.condition_met(gate, inputs) {
            GateStatus::Passing
        } else {
            GateStatus::Blocking
        }
    }

    /// Pass/bypassed/NA state of every gate, one bit per gate. A set bit
    /// means the gate is not blocking.
    #[must_use]
    pub fn status_mask(&self, inputs: &GateInputs) -> u16 {
        let mut mask = 0u16;
        for raw in 0..GATE_COUNT as u8 {
            let gate = GateId::from_raw(raw).unwrap_or(GateId::Reserved);
            if self.check(gate, inputs) != GateStatus::Blocking {
                mask |= 1 << raw;
            }
        }
        mask
    }

    /// Start-permit decision: gates in priority order, first blocker wins.
    pub fn can_start_run(&self, inputs: &GateInputs) -> Result<(), GateId> {
        if self.check(GateId::Estop, inputs) == GateStatus::Blocking {
            return Err(GateId::Estop);
        }
        if self.check(GateId::DoorClosed, inputs) == GateStatus::Blocking {
            return Err(GateId::DoorClosed);
        }
        if self.check(GateId::HmiLive, inputs) == GateStatus::Blocking {
            return Err(GateId::HmiLive);
        }

        for idx in 0..GATED_CONTROLLERS {
            let subsystem = match idx {
                0 => Subsystem::Pid1,
                1 => Subsystem::Pid2,
                _ => Subsystem::Pid3,
            };
            if self.capability(subsystem) != Capability::Required {
                continue;
            }
            let online = GateId::from_raw(GateId::Pid1Online as u8 + idx as u8).unwrap_or(GateId::Reserved);
            if self.check(online, inputs) == GateStatus::Blocking {
                return Err(online);
            }
            let probe = GateId::from_raw(GateId::Pid1ProbeOk as u8 + idx as u8).unwrap_or(GateId::Reserved);
            if self.check(probe, inputs) == GateStatus::Blocking {
                return Err(probe);
            }
        }

        Ok(())
    }
}

impl Default for SafetyGates {
    fn default() -> Self {
        Self::new()
    }
}
