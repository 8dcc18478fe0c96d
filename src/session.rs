//! The per-listener session table.
//!
//! Every session id maps to an open backend connection that is kept between
//! requests. The first request carrying an unseen id dials the backend; later
//! requests reuse the connection until the session is closed or expires.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    io::{ReadHalf, WriteHalf, split},
    sync::{Mutex as AsyncMutex, OnceCell},
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tracing::{debug, info};

use crate::backend::Dialer;

/// One logical stream: a backend connection plus its liveness timestamp.
///
/// The read and write halves are locked independently, so two requests that
/// present the same id at the same time are not serialized against each other.
/// Keeping requests for one id in order is the client's job.
pub struct Session<C> {
    pub(crate) reader: AsyncMutex<ReadHalf<C>>,
    pub(crate) writer: AsyncMutex<WriteHalf<C>>,
    last_seen: Mutex<Instant>,
}

impl<C> Session<C>
where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    pub fn new(conn: C) -> Self {
        let (reader, writer) = split(conn);
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            last_seen: Mutex::new(Instant::now()),
        }
    }
}

impl<C> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("last_seen", &self.last_seen())
            .finish_non_exhaustive()
    }
}

impl<C> Session<C> {
    /// Marks the session as seen just now.
    pub fn touch(&self) {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(PoisonError::into_inner);
        *last_seen = (*last_seen).max(Instant::now());
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_expired(&self, now: Instant, max_staleness: Duration) -> bool {
        now.saturating_duration_since(self.last_seen()) > max_staleness
    }
}

// A slot exists from the moment an id is first seen; it is filled once the
// backend dial succeeds. Concurrent first requests for the same id wait on the
// same slot, so at most one connection is ever created per id.
type Slot<C> = Arc<OnceCell<Arc<Session<C>>>>;

pub struct SessionTable<D: Dialer> {
    dialer: D,
    sessions: Mutex<HashMap<String, Slot<D::Conn>>>,
}

impl<D: Dialer> SessionTable<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<D::Conn>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a session by id, or creates one (with its backend connection)
    /// if it doesn't exist yet. A failed dial leaves the table unchanged.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        origin: SocketAddr,
    ) -> Result<Arc<Session<D::Conn>>> {
        loop {
            // Slots are only cloned under the map lock, so their strong count is
            // exact while the lock is held.
            let slot = Arc::clone(self.lock().entry(session_id.to_owned()).or_default());

            let dialed = slot
                .get_or_try_init(|| async {
                    let conn = self
                        .dialer
                        .dial(origin)
                        .await
                        .context("dialing backend")?;
                    info!(session_id, client_addr = %origin, "Created session");
                    Ok::<_, anyhow::Error>(Arc::new(Session::new(conn)))
                })
                .await
                .map(Arc::clone);

            let mut sessions = self.lock();
            let current = sessions
                .get(session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &slot));
            match dialed {
                // Touching under the map lock keeps the sweeper from expiring the
                // session between lookup and use.
                Ok(session) if current => {
                    session.touch();
                    return Ok(session);
                }
                // Expired or closed since the lookup; start over with a fresh slot.
                Ok(_) => {}
                Err(e) => {
                    // Other callers still holding the slot retry the dial in turn.
                    // The last one to fail removes it.
                    if current && Arc::strong_count(&slot) == 2 {
                        sessions.remove(session_id);
                    }
                    drop(slot);
                    return Err(e);
                }
            }
        }
    }

    /// Removes a session and closes its backend connection. Unknown ids are ignored.
    pub fn close(&self, session_id: &str) -> bool {
        let removed = self.lock().remove(session_id);
        // Dropping the last reference closes the connection; a transaction still
        // holding the session finishes first.
        match removed {
            Some(_) => {
                debug!(session_id, "Closed session");
                true
            }
            None => false,
        }
    }

    /// Closes and removes every session idle for longer than `max_staleness`.
    /// Returns the number of sessions removed.
    pub fn sweep_expired(&self, now: Instant, max_staleness: Duration) -> usize {
        let mut expired = Vec::new();
        {
            let mut sessions = self.lock();
            sessions.retain(|session_id, slot| match slot.get() {
                Some(session) if session.is_expired(now, max_staleness) => {
                    debug!(session_id = %session_id, "Expiring idle session");
                    expired.push(Arc::clone(slot));
                    false
                }
                _ => true,
            });
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }
}

/// Runs the expiry sweep forever, every half staleness threshold.
pub fn spawn_sweeper<D: Dialer>(
    table: Arc<SessionTable<D>>,
    max_staleness: Duration,
) -> JoinHandle<()> {
    let period = (max_staleness / 2).max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let expired = table.sweep_expired(Instant::now(), max_staleness);
            if expired > 0 {
                info!(expired, remaining = table.len(), "Expired idle sessions");
            }
        }
    })
}
