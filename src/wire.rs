//! Wire protocol frame codec
//!
//! Framed byte sequences carried over the HMI transport. Every frame is
//! `proto_ver (u8) | msg_type (u8) | seq (u16 LE) | payload_len (u16 LE) |
//! payload | crc16 (u16 LE)` with CRC-16/CCITT-FALSE computed over header
//! and payload. Encoders write fields explicitly in little-endian order;
//! nothing here relies on in-memory struct layout.

use crate::crc::crc16_ccitt;

/// Protocol version carried in every frame header.
pub const PROTO_VERSION: u8 = 0x01;
/// Frame header length: version, type, sequence, payload length.
pub const HEADER_LEN: usize = 6;
/// Trailing CRC length.
pub const CRC_LEN: usize = 2;
/// Maximum payload carried by one frame.
pub const MAX_PAYLOAD: usize = 512;
/// Maximum total frame length.
pub const MAX_FRAME: usize = HEADER_LEN + MAX_PAYLOAD + CRC_LEN;

/// Frame codec errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Output buffer cannot hold the frame.
    BufferTooSmall,
    /// Payload exceeds [`MAX_PAYLOAD`].
    PayloadTooLarge,
    /// Input ended before the declared frame did.
    Truncated,
    /// Protocol version mismatch.
    Version,
    /// Unknown message type.
    MsgType,
    /// Declared payload length disagrees with the buffer.
    LengthMismatch,
    /// CRC check failed.
    Crc,
}

/// Message types.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MsgType {
    /// Periodic telemetry snapshot, device to HMI.
    Telemetry = 0x01,
    /// Command, HMI to device.
    Command = 0x10,
    /// Command acknowledgment, device to HMI.
    CommandAck = 0x11,
    /// Asynchronous event, device to HMI.
    Event = 0x20,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0x01 => Ok(Self::Telemetry),
            0x10 => Ok(Self::Command),
            0x11 => Ok(Self::CommandAck),
            0x20 => Ok(Self::Event),
            _ => Err(Error::MsgType),
        }
    }
}

/// Parsed frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameHeader {
    /// Message type.
    pub msg_type: MsgType,
    /// Sender-assigned sequence number.
    pub seq: u16,
    /// Declared payload length.
    pub payload_len: u16,
}

/// Command identifiers. The canonical superset; no other ids exist.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
#[allow(missing_docs)]
pub enum CommandId {
    SetRelay = 0x0001,
    SetRelayMask = 0x0002,
    SetSetpoint = 0x0020,
    SetMode = 0x0021,
    RequestRefresh = 0x0022,
    SetPidParams = 0x0023,
    ReadPidParams = 0x0024,
    StartAutotune = 0x0025,
    StopAutotune = 0x0026,
    SetAlarmLimits = 0x0027,
    ReadAlarmLimits = 0x0028,
    ReadRegisters = 0x0030,
    WriteRegister = 0x0031,
    SetIdleTimeout = 0x0040,
    GetIdleTimeout = 0x0041,
    GetCapabilities = 0x0070,
    SetCapability = 0x0071,
    GetGates = 0x0072,
    SetGate = 0x0073,
    SnapshotNow = 0x00F0,
    ClearWarnings = 0x00F1,
    ClearLatchedAlarms = 0x00F2,
    OpenSession = 0x0100,
    Keepalive = 0x0101,
    StartRun = 0x0102,
    StopRun = 0x0103,
    PauseRun = 0x0104,
    ResumeRun = 0x0105,
    EnableService = 0x0110,
    DisableService = 0x0111,
    ClearEstop = 0x0112,
    ClearFault = 0x0113,
}

impl CommandId {
    /// Look up a wire command id.
    pub fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x0001 => Self::SetRelay,
            0x0002 => Self::SetRelayMask,
            0x0020 => Self::SetSetpoint,
            0x0021 => Self::SetMode,
            0x0022 => Self::RequestRefresh,
            0x0023 => Self::SetPidParams,
            0x0024 => Self::ReadPidParams,
            0x0025 => Self::StartAutotune,
            0x0026 => Self::StopAutotune,
            0x0027 => Self::SetAlarmLimits,
            0x0028 => Self::ReadAlarmLimits,
            0x0030 => Self::ReadRegisters,
            0x0031 => Self::WriteRegister,
            0x0040 => Self::SetIdleTimeout,
            0x0041 => Self::GetIdleTimeout,
            0x0070 => Self::GetCapabilities,
            0x0071 => Self::SetCapability,
            0x0072 => Self::GetGates,
            0x0073 => Self::SetGate,
            0x00F0 => Self::SnapshotNow,
            0x00F1 => Self::ClearWarnings,
            0x00F2 => Self::ClearLatchedAlarms,
            0x0100 => Self::OpenSession,
            0x0101 => Self::Keepalive,
            0x0102 => Self::StartRun,
            0x0103 => Self::StopRun,
            0x0104 => Self::PauseRun,
            0x0105 => Self::ResumeRun,
            0x0110 => Self::EnableService,
            0x0111 => Self::DisableService,
            0x0112 => Self::ClearEstop,
            0x0113 => Self::ClearFault,
            _ => return None,
        })
    }
}

/// Command acknowledgment status codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AckStatus {
    /// Command executed.
    Ok = 0,
    /// Rejected by policy, e.g. lease expired or interlocks blocking.
    RejectedPolicy = 1,
    /// Malformed or out-of-range arguments.
    InvalidArgs = 2,
    /// Resource busy.
    Busy = 3,
    /// Hardware write failed or verify mismatch.
    HwFault = 4,
    /// Wrong machine state for this command.
    NotReady = 5,
    /// Industrial-bus timeout or framing failure.
    Timeout = 6,
}

/// Ack detail subcodes.
pub mod detail {
    /// No additional detail.
    pub const NONE: u16 = 0x0000;
    /// Session id did not match a live session.
    pub const INVALID_SESSION: u16 = 0x0001;
    /// Interlocks blocking; optional data carries the interlock byte.
    pub const INTERLOCKS: u16 = 0x0002;
    /// The condition to clear is still active.
    pub const CONDITION_ACTIVE: u16 = 0x0003;
    /// Industrial-bus timeout.
    pub const BUS_TIMEOUT: u16 = 0x0004;
    /// Domain value out of range.
    pub const OUT_OF_RANGE: u16 = 0x0005;
}

/// Event identifiers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
#[allow(missing_docs)]
pub enum EventId {
    EstopAsserted = 0x1001,
    EstopCleared = 0x1002,
    HmiConnected = 0x1100,
    HmiDisconnected = 0x1101,
    RunStarted = 0x1200,
    RunStopped = 0x1201,
    RunAborted = 0x1202,
    PrecoolComplete = 0x1203,
    StateChanged = 0x1204,
    RunPaused = 0x1205,
    RunResumed = 0x1206,
    BusDeviceOnline = 0x1300,
    BusDeviceOffline = 0x1301,
    AlarmLatched = 0x1400,
    AlarmCleared = 0x1401,
    AutotuneStarted = 0x1500,
    AutotuneComplete = 0x1501,
    AutotuneFailed = 0x1502,
}

/// Event severity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Severity {
    /// Informational.
    Info = 0,
    /// Warning.
    Warn = 1,
    /// Alarm.
    Alarm = 2,
    /// Critical.
    Critical = 3,
}

/// One queued event, ready to be framed by the transport pump.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Event {
    /// Event identifier.
    pub id: EventId,
    /// Severity; alarm and above request reliable delivery.
    pub severity: Severity,
    /// 0 = system, 1..=N = controller index.
    pub source: u8,
    data: [u8; 4],
    len: u8,
}

impl Event {
    /// Event with no payload, sourced from the system.
    #[must_use]
    pub fn new(id: EventId, severity: Severity) -> Self {
        Self {
            id,
            severity,
            source: 0,
            data: [0; 4],
            len: 0,
        }
    }

    /// Event attributed to a controller.
    #[must_use]
    pub fn from_controller(id: EventId, severity: Severity, controller: u8) -> Self {
        Self {
            source: controller,
            ..Self::new(id, severity)
        }
    }

    /// Attach up to four payload bytes.
    #[must_use]
    pub fn with_data(mut self, data: &[u8]) -> Self {
        let len = data.len().min(self.data.len());
        self.data[..len].copy_from_slice(&data[..len]);
        self.len = len as u8;
        self
    }

    /// Event payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }
}

/// Alarm bits carried in the telemetry snapshot.
pub mod alarm {
    /// E-Stop input asserted.
    pub const ESTOP_ACTIVE: u32 = 1 << 0;
    /// Door interlock open.
    pub const DOOR_INTERLOCK: u32 = 1 << 1;
    /// Over-temperature condition.
    pub const OVER_TEMP: u32 = 1 << 2;
    /// Industrial-bus fault.
    pub const BUS_FAULT: u32 = 1 << 3;
    /// Power fault.
    pub const POWER_FAULT: u32 = 1 << 4;
    /// HMI session lease expired.
    pub const HMI_NOT_LIVE: u32 = 1 << 5;
    /// Controller 1 alarm.
    pub const PID1_FAULT: u32 = 1 << 6;
    /// Controller 2 alarm.
    pub const PID2_FAULT: u32 = 1 << 7;
    /// Controller 3 alarm.
    pub const PID3_FAULT: u32 = 1 << 8;

    /// Bits cleared by the clear-warnings command.
    pub const WARNING_MASK: u32 = OVER_TEMP | BUS_FAULT | POWER_FAULT;
}

/// Per-controller block of a telemetry snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControllerData {
    /// Controller id (1-based bus index).
    pub id: u8,
    /// Process value ×10.
    pub pv_x10: i16,
    /// Setpoint ×10.
    pub sv_x10: i16,
    /// Output percentage ×10.
    pub output_x10: u16,
    /// Controller mode.
    pub mode: u8,
    /// Sample age in milliseconds, saturated.
    pub age_ms: u16,
}

/// Extended run-state block appended to a telemetry snapshot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RunState {
    /// Machine state discriminant.
    pub state: u8,
    /// Time since the run started, 0 when idle.
    pub elapsed_ms: u32,
    /// Time until the run completes, 0 without a duration target.
    pub remaining_ms: u32,
    /// Active target temperature ×10.
    pub target_temp_x10: i16,
    /// Current recipe step.
    pub recipe_step: u8,
    /// Interlocks currently blocking start.
    pub interlock_bits: u8,
    /// Nonzero while the poller is in its slow period.
    pub lazy_poll: u8,
    /// Configured idle timeout in minutes.
    pub idle_timeout_min: u8,
}

/// Encoded size of [`RunState`] including the reserved byte.
pub const RUN_STATE_LEN: usize = 16;
/// Encoded size of one [`ControllerData`] block.
pub const CONTROLLER_DATA_LEN: usize = 10;
/// Fixed part of the telemetry payload before the controller blocks.
pub const TELEMETRY_FIXED_LEN: usize = 13;
/// Fixed part of an ack payload before the optional data.
pub const ACK_FIXED_LEN: usize = 7;
/// Command payload header: id and reserved flags.
pub const CMD_HEADER_LEN: usize = 4;
/// Event payload header: id, severity, source.
pub const EVENT_HEADER_LEN: usize = 4;

struct Cursor<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(Error::BufferTooSmall);
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    fn put_u8(&mut self, v: u8) -> Result<(), Error> {
        self.put(&[v])
    }

    fn put_u16(&mut self, v: u16) -> Result<(), Error> {
        self.put(&v.to_le_bytes())
    }

    fn put_i16(&mut self, v: i16) -> Result<(), Error> {
        self.put(&v.to_le_bytes())
    }

    fn put_u32(&mut self, v: u32) -> Result<(), Error> {
        self.put(&v.to_le_bytes())
    }
}

/// Bounds-checked little-endian reader over a command body.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Wrap a payload slice.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(Error::Truncated);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Read one byte.
    pub fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian u16.
    pub fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian i16.
    pub fn i16(&mut self) -> Result<i16, Error> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a little-endian u32.
    pub fn u32(&mut self) -> Result<u32, Error> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn seal_frame(buf: &mut [u8], msg_type: MsgType, seq: u16, payload_len: usize) -> Result<usize, Error> {
    if payload_len > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge);
    }
    let total = HEADER_LEN + payload_len + CRC_LEN;
    if buf.len() < total {
        return Err(Error::BufferTooSmall);
    }
    buf[0] = PROTO_VERSION;
    buf[1] = msg_type as u8;
    buf[2..4].copy_from_slice(&seq.to_le_bytes());
    buf[4..6].copy_from_slice(&(payload_len as u16).to_le_bytes());
    let crc = crc16_ccitt(&buf[..HEADER_LEN + payload_len]);
    buf[HEADER_LEN + payload_len..total].copy_from_slice(&crc.to_le_bytes());
    Ok(total)
}

/// Build a complete frame from a pre-assembled payload.
pub fn build_frame(buf: &mut [u8], msg_type: MsgType, seq: u16, payload: &[u8]) -> Result<usize, Error> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge);
    }
    if buf.len() < HEADER_LEN + payload.len() + CRC_LEN {
        return Err(Error::BufferTooSmall);
    }
    buf[HEADER_LEN..HEADER_LEN + payload.len()].copy_from_slice(payload);
    seal_frame(buf, msg_type, seq, payload.len())
}

/// Parse and validate a received frame, borrowing the payload.
pub fn parse_frame(buf: &[u8]) -> Result<(FrameHeader, &[u8]), Error> {
    if buf.len() < HEADER_LEN + CRC_LEN {
        return Err(Error::Truncated);
    }
    if buf[0] != PROTO_VERSION {
        return Err(Error::Version);
    }
    let msg_type = MsgType::try_from(buf[1])?;
    let seq = u16::from_le_bytes([buf[2], buf[3]]);
    let payload_len = u16::from_le_bytes([buf[4], buf[5]]);
    if usize::from(payload_len) > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge);
    }
    let total = HEADER_LEN + usize::from(payload_len) + CRC_LEN;
    if buf.len() < total {
        return Err(Error::LengthMismatch);
    }
    let crc_at = HEADER_LEN + usize::from(payload_len);
    let received = u16::from_le_bytes([buf[crc_at], buf[crc_at + 1]]);
    if received != crc16_ccitt(&buf[..crc_at]) {
        return Err(Error::Crc);
    }
    let header = FrameHeader {
        msg_type,
        seq,
        payload_len,
    };
    Ok((header, &buf[HEADER_LEN..crc_at]))
}

/// Build a command-acknowledgment frame.
pub fn build_ack(
    buf: &mut [u8],
    seq: u16,
    acked_seq: u16,
    cmd_id: u16,
    status: AckStatus,
    detail: u16,
    optional: &[u8],
) -> Result<usize, Error> {
    let payload_len = ACK_FIXED_LEN + optional.len();
    if payload_len > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge);
    }
    if buf.len() < HEADER_LEN + payload_len + CRC_LEN {
        return Err(Error::BufferTooSmall);
    }
    {
        let mut w = Cursor::new(&mut buf[HEADER_LEN..]);
        w.put_u16(acked_seq)?;
        w.put_u16(cmd_id)?;
        w.put_u8(status as u8)?;
        w.put_u16(detail)?;
        w.put(optional)?;
    }
    seal_frame(buf, MsgType::CommandAck, seq, payload_len)
}

/// Build an event frame.
pub fn build_event(
    buf: &mut [u8],
    seq: u16,
    id: u16,
    severity: Severity,
    source: u8,
    data: &[u8],
) -> Result<usize, Error> {
    let payload_len = EVENT_HEADER_LEN + data.len();
    if payload_len > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge);
    }
    if buf.len() < HEADER_LEN + payload_len + CRC_LEN {
        return Err(Error::BufferTooSmall);
    }
    {
        let mut w = Cursor::new(&mut buf[HEADER_LEN..]);
        w.put_u16(id)?;
        w.put_u8(severity as u8)?;
        w.put_u8(source)?;
        w.put(data)?;
    }
    seal_frame(buf, MsgType::Event, seq, payload_len)
}

/// Build a telemetry snapshot frame, extended with `run_state` when present.
#[allow(clippy::too_many_arguments)]
pub fn build_telemetry(
    buf: &mut [u8],
    seq: u16,
    timestamp_ms: u32,
    di_bits: u16,
    ro_bits: u16,
    alarm_bits: u32,
    controllers: &[ControllerData],
    run_state: Option<&RunState>,
) -> Result<usize, Error> {
    let payload_len = TELEMETRY_FIXED_LEN
        + controllers.len() * CONTROLLER_DATA_LEN
        + run_state.map_or(0, |_| RUN_STATE_LEN);
    if payload_len > MAX_PAYLOAD {
        return Err(Error::PayloadTooLarge);
    }
    if buf.len() < HEADER_LEN + payload_len + CRC_LEN {
        return Err(Error::BufferTooSmall);
    }
    {
        let mut w = Cursor::new(&mut buf[HEADER_LEN..]);
        w.put_u32(timestamp_ms)?;
        w.put_u16(di_bits)?;
        w.put_u16(ro_bits)?;
        w.put_u32(alarm_bits)?;
        w.put_u8(controllers.len() as u8)?;
        for c in controllers {
            w.put_u8(c.id)?;
            w.put_i16(c.pv_x10)?;
            w.put_i16(c.sv_x10)?;
            w.put_u16(c.output_x10)?;
            w.put_u8(c.mode)?;
            w.put_u16(c.age_ms)?;
        }
        if let Some(rs) = run_state {
            w.put_u8(rs.state)?;
            w.put_u32(rs.elapsed_ms)?;
            w.put_u32(rs.remaining_ms)?;
            w.put_i16(rs.target_temp_x10)?;
            w.put_u8(rs.recipe_step)?;
            w.put_u8(rs.interlock_bits)?;
            w.put_u8(rs.lazy_poll)?;
            w.put_u8(rs.idle_timeout_min)?;
            w.put_u8(0)?;
        }
    }
    seal_frame(buf, MsgType::Telemetry, seq, payload_len)
}
