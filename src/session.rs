//! HMI session manager
//!
//! Single-client session with lease-based liveness. The HMI opens a session
//! with a nonce, then refreshes the lease with keepalives; when the lease
//! (plus grace) lapses the session turns stale and the machine treats the
//! HMI as absent. One session exists at a time; a new open replaces it.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Instant};
use rand_core::RngCore;

use crate::machine::HmiPresence;

/// Default lease duration handed to the client.
pub const DEFAULT_LEASE: Duration = Duration::from_millis(3000);
/// Grace period past the lease before the session is declared stale.
pub const GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Session lifecycle state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    /// No session exists.
    None,
    /// Session active and recently refreshed.
    Live,
    /// Lease lapsed; the session still exists and can be revived.
    Stale,
}

/// Session operation errors.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// No session exists.
    NoSession,
    /// Session id does not match the current session.
    Mismatch,
}

#[derive(Copy, Clone)]
struct Session {
    id: u32,
    client_nonce: u32,
    lease_ms: u16,
    last_keepalive: Instant,
    state: SessionState,
}

impl Session {
    const fn empty() -> Self {
        Self {
            id: 0,
            client_nonce: 0,
            lease_ms: 0,
            last_keepalive: Instant::from_ticks(0),
            state: SessionState::None,
        }
    }
}

/// Lease-based single-client session manager.
pub struct SessionManager {
    inner: Mutex<CriticalSectionRawMutex, RefCell<Session>>,
}

impl SessionManager {
    /// Create the manager with no session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Session::empty())),
        }
    }

    /// Open a session, replacing any existing one. Returns the generated
    /// nonzero session id and the lease duration in milliseconds.
    pub fn open(&self, client_nonce: u32, now: Instant, rng: &mut dyn RngCore) -> (u32, u16) {
        let mut id = rng.next_u32();
        while id == 0 {
            id = rng.next_u32();
        }
        let lease_ms = DEFAULT_LEASE.as_millis() as u16;

        self.inner.lock(|s| {
            s.replace(Session {
                id,
                client_nonce,
                lease_ms,
                last_keepalive: now,
                state: SessionState::Live,
            });
        });

        info!("session opened: id=0x{:08x} nonce=0x{:08x} lease={}ms", id, client_nonce, lease_ms);
        (id, lease_ms)
    }

    /// Refresh the lease. Revives a stale session on a matching id.
    pub fn keepalive(&self, session_id: u32, now: Instant) -> Result<(), Error> {
        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            match s.state {
                SessionState::None => Err(Error::NoSession),
                _ if s.id != session_id => {
                    warn!("keepalive rejected: session mismatch (got 0x{:08x})", session_id);
                    Err(Error::Mismatch)
                }
                _ => {
                    s.last_keepalive = now;
                    if s.state == SessionState::Stale {
                        info!("session revived from stale");
                        s.state = SessionState::Live;
                    }
                    Ok(())
                }
            }
        })
    }

    /// Close the session. The id must match.
    pub fn close(&self, session_id: u32) -> Result<(), Error> {
        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            match s.state {
                SessionState::None => Err(Error::NoSession),
                _ if s.id != session_id => Err(Error::Mismatch),
                _ => {
                    info!("session closed: id=0x{:08x}", session_id);
                    *s = Session::empty();
                    Ok(())
                }
            }
        })
    }

    /// True iff the session is live and `session_id` matches.
    #[must_use]
    pub fn is_valid(&self, session_id: u32) -> bool {
        self.inner
            .lock(|s| {
                let s = s.borrow();
                s.state == SessionState::Live && s.id == session_id
            })
    }

    /// True iff a live session exists.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.state() == SessionState::Live
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock(|s| s.borrow().state)
    }

    /// Periodic expiry check. Transitions live→stale when the lease plus
    /// grace has lapsed; returns true on that transition.
    pub fn check_expiry(&self, now: Instant) -> bool {
        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            if s.state != SessionState::Live {
                return false;
            }
            let allowed = Duration::from_millis(u64::from(s.lease_ms)) + GRACE_PERIOD;
            let elapsed = now.saturating_duration_since(s.last_keepalive);
            if elapsed > allowed {
                warn!(
                    "session lease expired: id=0x{:08x} elapsed={}ms",
                    s.id,
                    elapsed.as_millis()
                );
                s.state = SessionState::Stale;
                true
            } else {
                false
            }
        })
    }

    /// Destroy the session, e.g. on transport disconnect.
    pub fn force_expire(&self) {
        self.inner.lock(|s| {
            let mut s = s.borrow_mut();
            if s.state != SessionState::None {
                warn!("session force-expired: id=0x{:08x}", s.id);
                *s = Session::empty();
            }
        });
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HmiPresence for SessionManager {
    fn is_live(&self) -> bool {
        SessionManager::is_live(self)
    }
}
