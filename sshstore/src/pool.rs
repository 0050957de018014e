//! Bounded pool of protocol sessions.
//!
//! A [`Pool`] hands out at most `capacity` sessions at once. Callers beyond
//! that wait on a fair semaphore, so they are served in arrival order. New
//! sessions are created one at a time, each with a full handshake. A
//! [`Lease`] returns its session to the idle set when dropped unless the
//! session is broken, in which case it is closed and its slot freed.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sshstore_proto::ProtocolVersion;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::path::StoreDir;
use crate::session::Session;
use crate::transport::Connect;
use crate::{Error, Result};

/// Idle sessions and the teardown flag, guarded together.
#[derive(Debug, Default)]
struct Idle {
    /// Sessions ready for checkout, most recently used last.
    sessions: Vec<Session>,
    /// Set by [`Pool::close`].
    closed: bool,
    /// Leases not yet dropped.
    checked_out: usize,
}

/// State shared between the pool and its outstanding leases.
#[derive(Debug, Default)]
struct Shared {
    /// Single lock for all idle bookkeeping.
    idle: Mutex<Idle>,
}

impl Shared {
    /// Locks the idle set, recovering from a poisoned lock.
    fn lock(&self) -> MutexGuard<'_, Idle> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pops a healthy idle session, closing stale ones on the way.
    fn take_idle(&self) -> Option<Session> {
        let mut idle = self.lock();
        while let Some(mut session) = idle.sessions.pop() {
            if session.is_healthy() {
                return Some(session);
            }
            tracing::debug!(session = session.id(), "dropping stale idle session");
            session.close();
        }
        None
    }
}

/// A bounded set of sessions created by a [`Connect`] implementation.
#[derive(Debug)]
pub struct Pool<C> {
    /// Opens transports for new sessions.
    connector: C,
    /// One permit per session that may be checked out.
    permits: Arc<Semaphore>,
    /// Idle set shared with leases.
    shared: Arc<Shared>,
    /// Serializes session creation.
    create: tokio::sync::Mutex<()>,
    /// Maximum number of sessions.
    capacity: usize,
    /// Version offered in each handshake.
    client_version: ProtocolVersion,
    /// Store directory handed to each session.
    store_dir: StoreDir,
    /// Next session id.
    next_id: AtomicU64,
}

impl<C: Connect> Pool<C> {
    /// Creates an empty pool; no connection is made until [`acquire`](Self::acquire).
    pub fn new(
        connector: C,
        capacity: usize,
        client_version: ProtocolVersion,
        store_dir: StoreDir,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            connector,
            permits: Arc::new(Semaphore::new(capacity)),
            shared: Arc::default(),
            create: tokio::sync::Mutex::new(()),
            capacity,
            client_version,
            store_dir,
            next_id: AtomicU64::new(1),
        }
    }

    /// Checks out a session, waiting while the pool is at capacity.
    ///
    /// Reuses an idle session when one is healthy, otherwise connects and
    /// performs a handshake. A failed handshake returns its error and frees
    /// the slot. Fails with [`Error::PoolClosed`] after [`close`](Self::close).
    pub async fn acquire(&self) -> Result<Lease> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;

        if let Some(session) = self.shared.take_idle() {
            return Ok(self.lease(session, permit));
        }

        let _creating = self.create.lock().await;
        // A lease may have been returned while we waited for the lock.
        if let Some(session) = self.shared.take_idle() {
            return Ok(self.lease(session, permit));
        }
        if self.shared.lock().closed {
            return Err(Error::PoolClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let transport = self.connector.connect().await?;
        let session =
            Session::open(id, transport, self.store_dir.clone(), self.client_version).await?;
        tracing::debug!(session = id, version = %session.version(), "session created");
        Ok(self.lease(session, permit))
    }

    /// Wraps a checked-out session.
    fn lease(&self, session: Session, permit: OwnedSemaphorePermit) -> Lease {
        self.shared.lock().checked_out += 1;
        Lease {
            session: Some(session),
            shared: Arc::clone(&self.shared),
            broken: false,
            _permit: permit,
        }
    }

    /// Closes every idle session and rejects further checkouts.
    ///
    /// Leases still out close their session when they are dropped.
    pub fn close(&self) {
        let sessions = {
            let mut idle = self.shared.lock();
            idle.closed = true;
            std::mem::take(&mut idle.sessions)
        };
        self.permits.close();
        for mut session in sessions {
            session.close();
        }
        tracing::debug!("pool closed");
    }

    /// Returns the maximum number of sessions.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of sessions currently checked out.
    ///
    /// Leases still out after [`close`](Self::close) are counted until dropped.
    pub fn in_use(&self) -> usize {
        self.shared.lock().checked_out
    }

    /// Returns the number of idle sessions.
    pub fn idle(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    /// Returns the connector.
    pub const fn connector(&self) -> &C {
        &self.connector
    }
}

/// Exclusive use of one pooled session.
///
/// Dereferences to [`Session`]. Dropping the lease returns the session to
/// the pool if it is still healthy.
#[derive(Debug)]
pub struct Lease {
    /// The session; `None` only during drop.
    session: Option<Session>,
    /// Where the session goes back to.
    shared: Arc<Shared>,
    /// Set by [`Lease::mark_broken`].
    broken: bool,
    /// Released after the session is back in the idle set.
    _permit: OwnedSemaphorePermit,
}

impl Lease {
    /// Forces the session to be discarded instead of recycled.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Returns the session to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for Lease {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let recycle = !self.broken && session.is_healthy();
        {
            let mut idle = self.shared.lock();
            idle.checked_out = idle.checked_out.saturating_sub(1);
            if recycle && !idle.closed {
                idle.sessions.push(session);
                return;
            }
        }
        if !recycle {
            tracing::warn!(session = session.id(), "discarding broken session");
        }
        session.close();
    }
}
