//! Industrial-bus master (Modbus RTU over RS-485)
//!
//! Half-duplex request/response master for the temperature-controller bus.
//! The master owns the serial port and, when the transceiver needs manual
//! direction control, a driver-enable pin. One transaction is in flight at a
//! time; [`SharedRs485`] serializes callers behind a mutex with a bounded
//! acquisition timeout.
//!
//! Register values cross the wire high-byte-first, the trailing CRC
//! low-byte-first, per RTU convention.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{with_timeout, Duration, Instant, Timer};
use embedded_hal::digital::OutputPin;
use embedded_io_async::{Read, Write};

use crate::crc::crc16_modbus;

/// Maximum registers per read request.
pub const MAX_READ_REGISTERS: usize = 125;
/// Maximum registers per write-multiple request, bounded by the ADU size.
pub const MAX_WRITE_REGISTERS: usize = 123;
/// Maximum application data unit: address, function, 253 data bytes, CRC.
pub const MAX_ADU: usize = 256;

const FC_READ_HOLDING: u8 = 0x03;
const FC_WRITE_SINGLE: u8 = 0x06;
const FC_WRITE_MULTIPLE: u8 = 0x10;

/// Bus transaction outcome.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// No (or not enough) response within the response timeout.
    Timeout,
    /// Response CRC mismatch.
    Crc,
    /// Slave-reported exception, carrying the subcode.
    Exception(u8),
    /// Slave address outside 1..=247.
    InvalidAddress,
    /// Register count outside the allowed range.
    InvalidRegister,
    /// Malformed frame, echo mismatch, or serial-port failure.
    Frame,
    /// Bus mutex not acquired within the acquisition timeout.
    Busy,
}

/// Bus timing configuration.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Maximum wait for a slave response.
    pub response_timeout: Duration,
    /// Minimum silent gap between transactions.
    pub inter_frame_gap: Duration,
    /// Silence window read after the expected minimum arrives, to pick up
    /// trailing bytes.
    pub silence_window: Duration,
    /// Bound on waiting for the shared-bus mutex.
    pub acquire_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(100),
            inter_frame_gap: Duration::from_millis(5),
            silence_window: Duration::from_millis(5),
            acquire_timeout: Duration::from_millis(500),
        }
    }
}

/// Driver-enable placeholder for transceivers with automatic direction
/// control.
pub struct NoDePin;

impl embedded_hal::digital::ErrorType for NoDePin {
    type Error = core::convert::Infallible;
}

impl OutputPin for NoDePin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Register access offered to the controller layer.
///
/// Implemented by [`SharedRs485`]; test doubles implement it to exercise the
/// controller logic without a serial line.
#[allow(async_fn_in_trait)]
pub trait Bus {
    /// Read `out.len()` holding registers starting at `start`.
    async fn read_holding(&self, addr: u8, start: u16, out: &mut [u16]) -> Result<(), Error>;
    /// Write a single holding register; the slave echoes the request.
    async fn write_single(&self, addr: u8, reg: u16, value: u16) -> Result<(), Error>;
    /// Write consecutive holding registers.
    async fn write_multiple(&self, addr: u8, start: u16, values: &[u16]) -> Result<(), Error>;
}

/// RTU master owning the half-duplex serial line.
pub struct Rs485Master<P, D = NoDePin> {
    port: P,
    de: Option<D>,
    config: Config,
    last_transaction: Option<Instant>,
    rx: [u8; MAX_ADU],
}

impl<P, D> Rs485Master<P, D>
where
    P: Read + Write,
    D: OutputPin,
{
    /// Create a master. Pass a driver-enable pin when the transceiver needs
    /// manual direction control.
    pub fn new(port: P, de: Option<D>, config: Config) -> Self {
        Self {
            port,
            de,
            config,
            last_transaction: None,
            rx: [0; MAX_ADU],
        }
    }

    fn validate_addr(addr: u8) -> Result<(), Error> {
        if (1..=247).contains(&addr) {
            Ok(())
        } else {
            Err(Error::InvalidAddress)
        }
    }

    /// Read holding registers (function code 0x03).
    pub async fn read_holding(&mut self, addr: u8, start: u16, out: &mut [u16]) -> Result<(), Error> {
        Self::validate_addr(addr)?;
        if out.is_empty() || out.len() > MAX_READ_REGISTERS {
            return Err(Error::InvalidRegister);
        }

        let mut tx = [0u8; 8];
        encode_read_holding(&mut tx, addr, start, out.len() as u16);

        let expected = 3 + out.len() * 2 + 2;
        let got = self.transact(&tx, expected).await?;
        let frame = &self.rx[..got];

        validate_response(frame, addr, FC_READ_HOLDING)?;
        if usize::from(frame[2]) != out.len() * 2 {
            warn!("read response byte count {} for {} registers", frame[2], out.len());
            return Err(Error::Frame);
        }
        for (i, reg) in out.iter_mut().enumerate() {
            *reg = u16::from_be_bytes([frame[3 + i * 2], frame[4 + i * 2]]);
        }
        trace!("read {} registers from addr {} reg {}", out.len(), addr, start);
        Ok(())
    }

    /// Write a single holding register (function code 0x06).
    pub async fn write_single(&mut self, addr: u8, reg: u16, value: u16) -> Result<(), Error> {
        Self::validate_addr(addr)?;

        let mut tx = [0u8; 8];
        encode_write_single(&mut tx, addr, reg, value);

        let got = self.transact(&tx, 8).await?;
        let frame = &self.rx[..got];

        validate_response(frame, addr, FC_WRITE_SINGLE)?;
        if frame[..6] != tx[..6] {
            warn!("write echo mismatch on addr {} reg {}", addr, reg);
            return Err(Error::Frame);
        }
        trace!("wrote register {}={} on addr {}", reg, value, addr);
        Ok(())
    }

    /// Write consecutive holding registers (function code 0x10).
    pub async fn write_multiple(&mut self, addr: u8, start: u16, values: &[u16]) -> Result<(), Error> {
        Self::validate_addr(addr)?;
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS {
            return Err(Error::InvalidRegister);
        }

        let mut tx = [0u8; MAX_ADU];
        let tx_len = encode_write_multiple(&mut tx, addr, start, values);

        let got = self.transact(&tx[..tx_len], 8).await?;
        let frame = &self.rx[..got];

        validate_response(frame, addr, FC_WRITE_MULTIPLE)?;
        trace!("wrote {} registers starting at {} on addr {}", values.len(), start, addr);
        Ok(())
    }

    /// One half-duplex exchange: enforce the inter-frame gap, transmit,
    /// switch direction, then accumulate the response until `expected_min`
    /// bytes plus a silence window, or the response timeout.
    async fn transact(&mut self, tx: &[u8], expected_min: usize) -> Result<usize, Error> {
        if let Some(last) = self.last_transaction {
            let elapsed = Instant::now().saturating_duration_since(last);
            if elapsed < self.config.inter_frame_gap {
                Timer::after(self.config.inter_frame_gap - elapsed).await;
            }
        }

        if let Some(de) = self.de.as_mut() {
            de.set_high().map_err(|_| Error::Frame)?;
        }

        let tx_result = async {
            self.port.write_all(tx).await.map_err(|_| Error::Frame)?;
            self.port.flush().await.map_err(|_| Error::Frame)
        }
        .await;

        if let Some(de) = self.de.as_mut() {
            de.set_low().map_err(|_| Error::Frame)?;
        }
        tx_result?;

        let deadline = Instant::now() + self.config.response_timeout;
        let mut expected_min = expected_min;
        let mut got = 0usize;

        while got < expected_min {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match with_timeout(deadline - now, self.port.read(&mut self.rx[got..])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => got += n,
                Ok(Err(_)) => {
                    self.last_transaction = Some(Instant::now());
                    return Err(Error::Frame);
                }
                Err(_) => break,
            }
            // An exception reply is 5 bytes regardless of what the request
            // would normally get back.
            if got >= 2 && self.rx[1] & 0x80 != 0 {
                expected_min = 5;
            }
        }

        // Trailing bytes may still be in flight once the minimum is here.
        if got >= expected_min {
            while got < MAX_ADU {
                match with_timeout(self.config.silence_window, self.port.read(&mut self.rx[got..])).await {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => got += n,
                    Ok(Err(_)) | Err(_) => break,
                }
            }
        }

        self.last_transaction = Some(Instant::now());

        if got < expected_min {
            warn!("bus timeout: got {} bytes, expected >= {}", got, expected_min);
            return Err(Error::Timeout);
        }
        Ok(got)
    }
}

/// The master behind a mutex: the poller and command writes serialize here.
pub struct SharedRs485<P, D = NoDePin> {
    inner: Mutex<CriticalSectionRawMutex, Rs485Master<P, D>>,
    acquire_timeout: Duration,
}

impl<P, D> SharedRs485<P, D>
where
    P: Read + Write,
    D: OutputPin,
{
    /// Wrap a master for shared use.
    pub fn new(master: Rs485Master<P, D>) -> Self {
        let acquire_timeout = master.config.acquire_timeout;
        Self {
            inner: Mutex::new(master),
            acquire_timeout,
        }
    }
}

impl<P, D> Bus for SharedRs485<P, D>
where
    P: Read + Write,
    D: OutputPin,
{
    async fn read_holding(&self, addr: u8, start: u16, out: &mut [u16]) -> Result<(), Error> {
        let mut master = with_timeout(self.acquire_timeout, self.inner.lock())
            .await
            .map_err(|_| Error::Busy)?;
        master.read_holding(addr, start, out).await
    }

    async fn write_single(&self, addr: u8, reg: u16, value: u16) -> Result<(), Error> {
        let mut master = with_timeout(self.acquire_timeout, self.inner.lock())
            .await
            .map_err(|_| Error::Busy)?;
        master.write_single(addr, reg, value).await
    }

    async fn write_multiple(&self, addr: u8, start: u16, values: &[u16]) -> Result<(), Error> {
        let mut master = with_timeout(self.acquire_timeout, self.inner.lock())
            .await
            .map_err(|_| Error::Busy)?;
        master.write_multiple(addr, start, values).await
    }
}

fn encode_read_holding(buf: &mut [u8; 8], addr: u8, start: u16, count: u16) {
    buf[0] = addr;
    buf[1] = FC_READ_HOLDING;
    buf[2..4].copy_from_slice(&start.to_be_bytes());
    buf[4..6].copy_from_slice(&count.to_be_bytes());
    let crc = crc16_modbus(&buf[..6]);
    buf[6..8].copy_from_slice(&crc.to_le_bytes());
}

fn encode_write_single(buf: &mut [u8; 8], addr: u8, reg: u16, value: u16) {
    buf[0] = addr;
    buf[1] = FC_WRITE_SINGLE;
    buf[2..4].copy_from_slice(&reg.to_be_bytes());
    buf[4..6].copy_from_slice(&value.to_be_bytes());
    let crc = crc16_modbus(&buf[..6]);
    buf[6..8].copy_from_slice(&crc.to_le_bytes());
}

fn encode_write_multiple(buf: &mut [u8; MAX_ADU], addr: u8, start: u16, values: &[u16]) -> usize {
    buf[0] = addr;
    buf[1] = FC_WRITE_MULTIPLE;
    buf[2..4].copy_from_slice(&start.to_be_bytes());
    buf[4..6].copy_from_slice(&(values.len() as u16).to_be_bytes());
    buf[6] = (values.len() * 2) as u8;
    let mut at = 7;
    for v in values {
        buf[at..at + 2].copy_from_slice(&v.to_be_bytes());
        at += 2;
    }
    let crc = crc16_modbus(&buf[..at]);
    buf[at..at + 2].copy_from_slice(&crc.to_le_bytes());
    at + 2
}

/// Length, exception, CRC and addressing checks shared by all responses.
fn validate_response(frame: &[u8], addr: u8, function: u8) -> Result<(), Error> {
    if frame.len() < 5 {
        return Err(Error::Frame);
    }
    if frame[1] & 0x80 != 0 {
        warn!("exception response from addr {}: code 0x{:02x}", addr, frame[2]);
        return Err(Error::Exception(frame[2]));
    }
    let received = u16::from_le_bytes([frame[frame.len() - 2], frame[frame.len() - 1]]);
    if received != crc16_modbus(&frame[..frame.len() - 2]) {
        warn!("response CRC mismatch from addr {}", addr);
        return Err(Error::Crc);
    }
    if frame[0] != addr || frame[1] != function {
        warn!("address/function mismatch from addr {}", addr);
        return Err(Error::Frame);
    }
    Ok(())
}
