//! Relay output and digital input driver
//!
//! Abstracts one 8-bit output port (relay channels 1..=8) and one 8-bit
//! input port behind the byte-wide [`ExpanderPort`] seam; the expander's
//! register layout is the integrator's concern. The driver keeps a cached
//! output byte, mirrored in an atomic for lock-free snapshots, and writes
//! hardware in a single transaction per update.

use core::sync::atomic::{AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

/// Safe digital-input byte reported when no input port is fitted:
/// E-Stop released, door closed, coolant present, no motor fault.
pub const DI_SAFE_DEFAULT: u8 = 0x07;

/// Relay driver errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Expander transaction failed.
    Io,
    /// No input port is fitted.
    NoInputPort,
    /// Relay index outside 1..=8 or unknown state value.
    InvalidChannel,
}

/// Byte-wide access to the I/O expander pair.
///
/// `read_inputs` returns [`Error::NoInputPort`] when the input expander is
/// absent; the driver substitutes the configured safe default.
#[allow(async_fn_in_trait)]
pub trait ExpanderPort {
    /// Drive the 8 output lines.
    async fn write_outputs(&mut self, bits: u8) -> Result<(), Error>;
    /// Read back the output register.
    async fn read_outputs(&mut self) -> Result<u8, Error>;
    /// Read the 8 input lines.
    async fn read_inputs(&mut self) -> Result<u8, Error>;
}

/// Requested state for a single relay.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RelayState {
    /// Open the relay.
    Off = 0,
    /// Close the relay.
    On = 1,
    /// Invert the current state.
    Toggle = 2,
}

impl RelayState {
    /// Decode the wire encoding.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            2 => Some(Self::Toggle),
            _ => None,
        }
    }
}

/// Driver configuration.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Input byte substituted when the input port is absent.
    pub di_fallback: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            di_fallback: DI_SAFE_DEFAULT,
        }
    }
}

struct Inner<E> {
    port: E,
    state: u8,
}

/// 8-channel relay output port plus 8-channel input port.
pub struct RelayDriver<E> {
    inner: Mutex<CriticalSectionRawMutex, Inner<E>>,
    cached: AtomicU8,
    config: Config,
}

impl<E: ExpanderPort> RelayDriver<E> {
    /// Create the driver. Call [`init`](Self::init) before first use.
    pub fn new(port: E, config: Config) -> Self {
        Self {
            inner: Mutex::new(Inner { port, state: 0 }),
            cached: AtomicU8::new(0),
            config,
        }
    }

    /// Drive all outputs OFF and align the cache with the hardware register.
    pub async fn init(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        inner.port.write_outputs(0x00).await?;
        match inner.port.read_outputs().await {
            Ok(0x00) => {}
            Ok(other) => warn!("output readback 0x{:02x} after init, expected 0x00", other),
            Err(_) => warn!("output readback failed after init"),
        }
        inner.state = 0x00;
        self.cached.store(0x00, Ordering::Relaxed);
        info!("relay outputs initialized, all channels OFF");
        Ok(())
    }

    async fn apply(&self, inner: &mut Inner<E>, new_state: u8) -> Result<(), Error> {
        inner.port.write_outputs(new_state).await?;
        inner.state = new_state;
        self.cached.store(new_state, Ordering::Relaxed);
        Ok(())
    }

    /// Set one relay. `index` is the 1-based channel number.
    pub async fn set(&self, index: u8, state: RelayState) -> Result<(), Error> {
        if !(1..=8).contains(&index) {
            return Err(Error::InvalidChannel);
        }
        let bit = 1u8 << (index - 1);
        let mut inner = self.inner.lock().await;
        let new_state = match state {
            RelayState::Off => inner.state & !bit,
            RelayState::On => inner.state | bit,
            RelayState::Toggle => inner.state ^ bit,
        };
        self.apply(&mut inner, new_state).await?;
        debug!("relay {} -> {} (outputs=0x{:02x})", index, (new_state & bit) != 0, new_state);
        Ok(())
    }

    /// Atomic masked update: `new = (current & !mask) | (values & mask)`.
    /// A zero mask is a no-op.
    pub async fn set_mask(&self, mask: u8, values: u8) -> Result<(), Error> {
        if mask == 0 {
            return Ok(());
        }
        let mut inner = self.inner.lock().await;
        let new_state = (inner.state & !mask) | (values & mask);
        let old = inner.state;
        self.apply(&mut inner, new_state).await?;
        debug!("relay mask update 0x{:02x} -> 0x{:02x} (mask=0x{:02x})", old, new_state, mask);
        Ok(())
    }

    /// Drive all eight channels to `bits` at once.
    pub async fn set_all(&self, bits: u8) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        self.apply(&mut inner, bits).await
    }

    /// All channels OFF.
    pub async fn all_off(&self) -> Result<(), Error> {
        self.set_all(0x00).await
    }

    /// Cached output byte, bit N = channel N+1.
    #[must_use]
    pub fn state(&self) -> u8 {
        self.cached.load(Ordering::Relaxed)
    }

    /// Read the output register from hardware.
    pub async fn read_hw_state(&self) -> Result<u8, Error> {
        let mut inner = self.inner.lock().await;
        inner.port.read_outputs().await
    }

    /// Read the digital inputs, bit N = input N+1. Falls back to the
    /// configured safe byte when no input port is fitted.
    pub async fn read_di(&self) -> Result<u8, Error> {
        let mut inner = self.inner.lock().await;
        match inner.port.read_inputs().await {
            Ok(bits) => Ok(bits),
            Err(Error::NoInputPort) => Ok(self.config.di_fallback),
            Err(e) => Err(e),
        }
    }
}
