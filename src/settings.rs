//! Persisted configuration
//!
//! Capability levels, the poller idle timeout and the recovery return-to
//! partition label, packed into a fixed CRC-checked record stored in a
//! dedicated flash sector. Anything unreadable falls back to defaults; gate
//! bypasses are deliberately never stored.

use embedded_storage_async::nor_flash::NorFlash;

use crate::crc::crc16_ccitt;
use crate::gates::{Capability, Subsystem, SUBSYSTEM_COUNT};

const MAGIC: [u8; 4] = *b"CMS1";
const RECORD_VERSION: u8 = 1;

/// Encoded record length: magic, version, six capability slots, idle
/// timeout, partition label, two reserved bytes, CRC.
pub const RECORD_LEN: usize = 24;

/// Subsystems with a persisted capability slot, in record order. The E-Stop
/// input is pinned REQUIRED and has no slot.
pub const PERSISTED_SUBSYSTEMS: [Subsystem; 6] = [
    Subsystem::Pid1,
    Subsystem::Pid2,
    Subsystem::Pid3,
    Subsystem::DoorInput,
    Subsystem::CoolantInput,
    Subsystem::MotorFaultInput,
];

/// Store failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// Flash access failed.
    Flash,
}

/// The persisted configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Settings {
    /// Capability levels, indexed per [`PERSISTED_SUBSYSTEMS`].
    pub caps: [Capability; 6],
    /// Poller idle timeout in minutes, 0 disables lazy polling.
    pub idle_timeout_min: u8,
    /// Boot partition label for the recovery collaborator, NUL-padded.
    pub return_partition: [u8; 8],
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            caps: [
                Capability::Optional,
                Capability::Required,
                Capability::Required,
                Capability::Required,
                Capability::Optional,
                Capability::NotPresent,
            ],
            idle_timeout_min: crate::pid::IDLE_TIMEOUT_DEFAULT_MIN,
            return_partition: [0; 8],
        }
    }
}

impl Settings {
    /// Record slot for a subsystem, if it has one.
    fn slot(subsystem: Subsystem) -> Option<usize> {
        PERSISTED_SUBSYSTEMS.iter().position(|s| *s == subsystem)
    }

    /// Update the stored capability for a subsystem. The E-Stop input has no
    /// slot and is ignored.
    pub fn set_capability(&mut self, subsystem: Subsystem, level: Capability) {
        if let Some(slot) = Self::slot(subsystem) {
            self.caps[slot] = level;
        }
    }

    /// Capability levels in [`Subsystem`] discriminant order, with the
    /// E-Stop slot pinned REQUIRED.
    #[must_use]
    pub fn gate_levels(&self) -> [Capability; SUBSYSTEM_COUNT] {
        let mut out = [Capability::Required; SUBSYSTEM_COUNT];
        for (slot, subsystem) in PERSISTED_SUBSYSTEMS.iter().enumerate() {
            out[*subsystem as usize] = self.caps[slot];
        }
        out
    }

    /// Pack into the fixed record.
    pub fn encode(&self, out: &mut [u8; RECORD_LEN]) {
        out[..4].copy_from_slice(&MAGIC);
        out[4] = RECORD_VERSION;
        for (i, cap) in self.caps.iter().enumerate() {
            out[5 + i] = *cap as u8;
        }
        out[11] = self.idle_timeout_min;
        out[12..20].copy_from_slice(&self.return_partition);
        out[20] = 0;
        out[21] = 0;
        let crc = crc16_ccitt(&out[..RECORD_LEN - 2]);
        out[RECORD_LEN - 2..].copy_from_slice(&crc.to_le_bytes());
    }

    /// Unpack a record; `None` on bad magic, version, CRC or level values.
    #[must_use]
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < RECORD_LEN || raw[..4] != MAGIC || raw[4] != RECORD_VERSION {
            return None;
        }
        let stored = u16::from_le_bytes([raw[RECORD_LEN - 2], raw[RECORD_LEN - 1]]);
        if stored != crc16_ccitt(&raw[..RECORD_LEN - 2]) {
            return None;
        }
        let mut caps = [Capability::NotPresent; 6];
        for (i, cap) in caps.iter_mut().enumerate() {
            *cap = Capability::from_raw(raw[5 + i])?;
        }
        let mut return_partition = [0u8; 8];
        return_partition.copy_from_slice(&raw[12..20]);
        Some(Self {
            caps,
            idle_timeout_min: raw[11],
            return_partition,
        })
    }
}

/// Settings persistence.
#[allow(async_fn_in_trait)]
pub trait SettingsStore {
    /// Load the stored settings, falling back to defaults.
    async fn load(&mut self) -> Settings;
    /// Persist the settings.
    async fn save(&mut self, settings: &Settings) -> Result<(), StoreError>;
}

/// Record storage in a dedicated NOR-flash sector. `offset` must be aligned
/// to an erase boundary.
pub struct FlashStore<F> {
    flash: F,
    offset: u32,
}

impl<F: NorFlash> FlashStore<F> {
    /// Bind to a flash region.
    pub fn new(flash: F, offset: u32) -> Self {
        Self { flash, offset }
    }
}

impl<F: NorFlash> SettingsStore for FlashStore<F> {
    async fn load(&mut self) -> Settings {
        let mut raw = [0u8; RECORD_LEN];
        if let Err(_e) = self.flash.read(self.offset, &mut raw).await {
            warn!("settings read failed, using defaults");
            return Settings::default();
        }
        match Settings::decode(&raw) {
            Some(settings) => {
                info!("settings loaded: idle_timeout={}min", settings.idle_timeout_min);
                settings
            }
            None => {
                info!("no valid settings record, using defaults");
                Settings::default()
            }
        }
    }

    async fn save(&mut self, settings: &Settings) -> Result<(), StoreError> {
        let mut raw = [0u8; RECORD_LEN];
        settings.encode(&mut raw);

        let end = self.offset + F::ERASE_SIZE as u32;
        self.flash.erase(self.offset, end).await.map_err(|_| {
            error!("settings erase failed");
            StoreError::Flash
        })?;
        self.flash.write(self.offset, &raw).await.map_err(|_| {
            error!("settings write failed");
            StoreError::Flash
        })?;
        info!("settings saved");
        Ok(())
    }
}
