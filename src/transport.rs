//! Transport seam
//!
//! The wireless link is an external collaborator; this module pins down the
//! frame-bytes-in / notify-bytes-out contract. The transport delivers whole
//! frames (one frame per write or notification) and exposes three outbound
//! paths: unsolicited telemetry, acks, and events, the latter two with a
//! best-effort reliable (indication) option.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;

use crate::wire::{self, Event, Severity};

/// Outbound submission failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum TxError {
    /// No client connected.
    NotConnected,
    /// The client has not subscribed to this endpoint.
    NotSubscribed,
    /// The transport stack refused the submission.
    Failed,
}

/// Outbound frame submission, implemented by the transport binding.
#[allow(async_fn_in_trait)]
pub trait FrameSink: Sync {
    /// Push a telemetry frame.
    async fn send_telemetry(&self, frame: &[u8]) -> Result<(), TxError>;
    /// Push a command acknowledgment; `reliable` requests indication
    /// delivery where the transport supports it.
    async fn send_ack(&self, frame: &[u8], reliable: bool) -> Result<(), TxError>;
    /// Push an event frame; `reliable` as for acks.
    async fn send_event(&self, frame: &[u8], reliable: bool) -> Result<(), TxError>;
}

/// Queue carrying events from the subsystems to the pump.
///
/// Bounded; producers drop on overflow with a warning, since telemetry
/// carries the authoritative state regardless.
pub type EventQueue = Channel<CriticalSectionRawMutex, Event, 8>;

/// Drain the event queue into event frames. Severity alarm and above
/// requests reliable delivery.
pub async fn event_pump<F: FrameSink>(events: &EventQueue, sink: &F) -> ! {
    let mut seq = 0u16;
    let mut buf = [0u8; 64];

    loop {
        let event = events.receive().await;
        let reliable = event.severity >= Severity::Alarm;

        match wire::build_event(&mut buf, seq, event.id as u16, event.severity, event.source, event.data()) {
            Ok(len) => {
                seq = seq.wrapping_add(1);
                match sink.send_event(&buf[..len], reliable).await {
                    Ok(()) | Err(TxError::NotConnected) | Err(TxError::NotSubscribed) => {}
                    Err(e) => warn!("event 0x{:04x} submit failed: {:?}", event.id as u16, e),
                }
            }
            Err(e) => error!("event frame build failed: {:?}", e),
        }
    }
}
