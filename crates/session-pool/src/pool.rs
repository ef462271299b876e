//! Session pool state and checkout
//!
//! Set membership (idle, busy, connecting) lives behind one short-lived
//! mutex that is never held across an await; authentication and logoff run
//! without it. Waiters park on a `Notify` and re-check the state whenever a
//! slot frees up.
//!
//! New sessions are authenticated in a spawned task that hands the result
//! back over a oneshot channel as a `PooledSession`. If the caller gave up in
//! the meantime the undelivered `PooledSession` is dropped, which parks the
//! session in idle instead of leaking it.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common::Secret;
use endpoint::{Error, Result, ServerEndpoint};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use session::{Identity, PasswordChange, RotationPolicy, SessionHandle, SessionId};
use tokio::sync::{Notify, broadcast, oneshot};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;

/// Emitted when the pool adopts a rotated password for its identity.
#[derive(Debug, Clone)]
pub struct RotationEvent {
    pub user: String,
    pub password: Secret<String>,
    pub policy: RotationPolicy,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub busy: usize,
    pub pending: usize,
    pub min: usize,
    pub max: usize,
    pub closed: bool,
    pub acquisitions: u64,
    pub created: u64,
    pub released: u64,
    pub discarded: u64,
}

struct PoolState {
    idle: VecDeque<SessionHandle>,
    busy: HashSet<SessionId>,
    /// Slots reserved by in-flight authentications and keepalive checks
    pending: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.busy.len() + self.pending
    }
}

struct PoolInner {
    endpoint: Arc<dyn ServerEndpoint>,
    identity: RwLock<Identity>,
    connect_string: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    events: broadcast::Sender<RotationEvent>,
    acquisitions: AtomicU64,
    created: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
}

enum Checkout {
    Idle(SessionHandle),
    Connect,
    Wait,
}

/// Bounded pool of sessions authenticated as one identity.
///
/// Cheap to clone; clones share the same pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create a pool and authenticate `config.min` sessions up front.
    ///
    /// A failed pre-warm authentication closes what was opened and returns
    /// the endpoint's error unchanged.
    pub async fn create(
        endpoint: Arc<dyn ServerEndpoint>,
        identity: Identity,
        connect_string: impl Into<String>,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(16);
        let pool = Self {
            inner: Arc::new(PoolInner {
                endpoint,
                identity: RwLock::new(identity),
                connect_string: connect_string.into(),
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    busy: HashSet::new(),
                    pending: 0,
                    closed: false,
                }),
                available: Notify::new(),
                events,
                acquisitions: AtomicU64::new(0),
                created: AtomicU64::new(0),
                released: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        };

        for _ in 0..pool.inner.config.min {
            match pool.inner.authenticate().await {
                Ok(handle) => {
                    let mut state = pool.inner.state.lock();
                    state.idle.push_back(handle);
                    publish_gauges(&state);
                }
                Err(e) => {
                    warn!(user = %pool.user(), error = %e, "pool pre-warm failed");
                    let _ = pool.close().await;
                    return Err(e);
                }
            }
        }

        info!(
            user = %pool.user(),
            min = pool.inner.config.min,
            max = pool.inner.config.max,
            endpoint = pool.inner.endpoint.id(),
            "session pool created"
        );
        Ok(pool)
    }

    /// Take an idle session or authenticate a new one.
    ///
    /// Waits up to `acquire_timeout` when the pool is at capacity. Fails with
    /// `PoolClosed` once the pool is closed and never reconnects after that.
    pub async fn acquire(&self) -> Result<PooledSession> {
        let timeout = self.inner.config.acquire_timeout;
        let result = match tokio::time::timeout(timeout, self.checkout()).await {
            Ok(result) => result,
            Err(_) => Err(Error::pool_timeout(timeout)),
        };

        let outcome = match &result {
            Ok(_) => {
                self.inner.acquisitions.fetch_add(1, Ordering::Relaxed);
                "ok"
            }
            Err(e) => e.kind().code(),
        };
        metrics::counter!("session_pool_acquire_total", "outcome" => outcome).increment(1);
        result
    }

    /// Return a session to the pool. Same as dropping it.
    pub fn release(&self, session: PooledSession) {
        session.release();
    }

    /// Close the pool: log off idle sessions and refuse further checkouts.
    ///
    /// Sessions still checked out are logged off when they are released.
    pub async fn close(&self) -> Result<()> {
        let (idle, busy) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::pool_closed());
            }
            state.closed = true;
            let idle: Vec<SessionHandle> = state.idle.drain(..).collect();
            publish_gauges(&state);
            (idle, state.busy.len())
        };
        self.inner.available.notify_waiters();

        info!(user = %self.user(), idle = idle.len(), busy, "closing session pool");
        for handle in idle {
            let id = handle.id();
            if let Err(e) = handle.close().await {
                warn!(session_id = %id, error = %e, "logoff failed during pool close");
            }
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Account the pool authenticates as.
    pub fn user(&self) -> String {
        self.inner.identity.read().user.clone()
    }

    /// Replace the password used for future authentications.
    ///
    /// For rotations done outside the pool. Existing sessions are untouched.
    pub fn update_password(&self, password: Secret<String>) {
        let mut identity = self.inner.identity.write();
        identity.password = password;
        info!(user = %identity.user, "pool password updated");
    }

    /// Subscribe to rotations the pool adopts.
    pub fn subscribe(&self) -> broadcast::Receiver<RotationEvent> {
        self.inner.events.subscribe()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            busy: state.busy.len(),
            pending: state.pending,
            min: self.inner.config.min,
            max: self.inner.config.max,
            closed: state.closed,
            acquisitions: self.inner.acquisitions.load(Ordering::Relaxed),
            created: self.inner.created.load(Ordering::Relaxed),
            released: self.inner.released.load(Ordering::Relaxed),
            discarded: self.inner.discarded.load(Ordering::Relaxed),
        }
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: closed → closed, at least `min` sessions open →
    /// healthy, otherwise degraded.
    pub fn health(&self) -> serde_json::Value {
        let stats = self.stats();
        let open = stats.idle + stats.busy;
        let status = if stats.closed {
            "closed"
        } else if open >= stats.min {
            "healthy"
        } else {
            "degraded"
        };
        serde_json::json!({
            "status": status,
            "user": self.user(),
            "endpoint": self.inner.endpoint.id(),
            "sessions_idle": stats.idle,
            "sessions_busy": stats.busy,
            "sessions_pending": stats.pending,
            "sessions_min": stats.min,
            "sessions_max": stats.max,
            "acquisitions_total": stats.acquisitions,
        })
    }

    async fn checkout(&self) -> Result<PooledSession> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(Error::pool_closed());
                }
                let next = if let Some(handle) = state.idle.pop_front() {
                    state.busy.insert(handle.id());
                    Checkout::Idle(handle)
                } else if state.total() < self.inner.config.max {
                    state.pending += 1;
                    Checkout::Connect
                } else {
                    Checkout::Wait
                };
                publish_gauges(&state);
                next
            };

            match next {
                Checkout::Idle(handle) => {
                    debug!(session_id = %handle.id(), "reusing idle session");
                    return Ok(PooledSession::new(handle, Arc::clone(&self.inner)));
                }
                Checkout::Connect => return self.connect_new().await,
                Checkout::Wait => {
                    debug!(max = self.inner.config.max, "pool at capacity, waiting");
                    notified.await;
                }
            }
        }
    }

    async fn connect_new(&self) -> Result<PooledSession> {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = inner.authenticate().await;
            inner.finish_connect(result, tx).await;
        });
        rx.await.unwrap_or_else(|_| {
            Err(Error::unavailable(
                "session authentication task ended unexpectedly",
            ))
        })
    }

    /// Move every idle session into the pending set for a liveness check.
    pub(crate) fn take_idle_for_check(&self) -> Vec<SessionHandle> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Vec::new();
        }
        let sessions: Vec<SessionHandle> = state.idle.drain(..).collect();
        state.pending += sessions.len();
        sessions
    }

    /// Return checked sessions; `checked` is how many were taken out.
    pub(crate) fn return_checked(&self, alive: Vec<SessionHandle>, checked: usize) {
        let evict = {
            let mut state = self.inner.state.lock();
            state.pending -= checked;
            let evict = if state.closed {
                alive
            } else {
                state.idle.extend(alive);
                Vec::new()
            };
            publish_gauges(&state);
            evict
        };
        // Dropped active handles are logged off in the background
        drop(evict);
        self.inner.available.notify_waiters();
    }

    /// Reserve a slot if the pool holds fewer than `min` sessions.
    pub(crate) fn reserve_refill_slot(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed || state.total() >= self.inner.config.min {
            return false;
        }
        state.pending += 1;
        true
    }

    /// Authenticate into a slot reserved by `reserve_refill_slot`.
    pub(crate) async fn fill_reserved_slot(&self) -> Result<()> {
        let result = self.inner.authenticate().await;
        let outcome = {
            let mut state = self.inner.state.lock();
            state.pending -= 1;
            let outcome = match result {
                Ok(handle) if !state.closed => {
                    state.idle.push_back(handle);
                    Ok(None)
                }
                Ok(handle) => Ok(Some(handle)),
                Err(e) => Err(e),
            };
            publish_gauges(&state);
            outcome
        };
        self.inner.available.notify_waiters();
        // A session authenticated after close is dropped and logged off
        outcome.map(drop)
    }
}

impl PoolInner {
    async fn authenticate(&self) -> Result<SessionHandle> {
        let options = self.identity.read().connect_options(&self.connect_string);
        let handle = SessionHandle::connect(Arc::clone(&self.endpoint), &options).await?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    async fn finish_connect(
        self: &Arc<Self>,
        result: Result<SessionHandle>,
        tx: oneshot::Sender<Result<PooledSession>>,
    ) {
        let handle = match result {
            Ok(handle) => handle,
            Err(e) => {
                {
                    let mut state = self.state.lock();
                    state.pending -= 1;
                    publish_gauges(&state);
                }
                self.available.notify_waiters();
                let _ = tx.send(Err(e));
                return;
            }
        };

        let admitted = {
            let mut state = self.state.lock();
            state.pending -= 1;
            if !state.closed {
                state.busy.insert(handle.id());
            }
            publish_gauges(&state);
            !state.closed
        };

        if !admitted {
            let id = handle.id();
            if let Err(e) = handle.close().await {
                debug!(session_id = %id, error = %e, "logoff of late session failed");
            }
            self.available.notify_waiters();
            let _ = tx.send(Err(Error::pool_closed()));
            return;
        }

        let session = PooledSession::new(handle, Arc::clone(self));
        if let Err(Ok(session)) = tx.send(Ok(session)) {
            debug!(session_id = %session.id(), "acquire abandoned, parking session in idle");
        }
    }

    /// Take a released session back.
    fn reclaim(&self, handle: SessionHandle) {
        self.released.fetch_add(1, Ordering::Relaxed);
        let rejected = {
            let mut state = self.state.lock();
            state.busy.remove(&handle.id());
            let rejected = if state.closed || !handle.is_active() {
                Some(handle)
            } else {
                state.idle.push_back(handle);
                None
            };
            publish_gauges(&state);
            rejected
        };
        if let Some(handle) = rejected {
            debug!(session_id = %handle.id(), state = ?handle.state(), "released session not kept");
        }
        self.available.notify_waiters();
    }

    /// Forget a busy session that is being discarded.
    fn forget(&self, id: SessionId) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state.busy.remove(&id);
            publish_gauges(&state);
        }
        self.available.notify_waiters();
    }

    /// Adopt a password rotated through one of the pool's sessions.
    ///
    /// Only rotations of the pool's own account with a non-empty new password
    /// change what future authentications use.
    fn observe_rotation(&self, change: &PasswordChange, policy: RotationPolicy) {
        if change.new_password.is_empty() {
            return;
        }
        {
            let mut identity = self.identity.write();
            if identity.user != change.user {
                return;
            }
            identity.password = change.new_password.clone();
        }
        info!(user = %change.user, policy = policy.label(), "pool adopted rotated password");
        let _ = self.events.send(RotationEvent {
            user: change.user.clone(),
            password: change.new_password.clone(),
            policy,
        });
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn publish_gauges(state: &PoolState) {
    metrics::gauge!("session_pool_sessions", "state" => "idle").set(state.idle.len() as f64);
    metrics::gauge!("session_pool_sessions", "state" => "busy").set(state.busy.len() as f64);
    metrics::gauge!("session_pool_sessions", "state" => "pending").set(state.pending as f64);
}

/// A session checked out of a pool.
///
/// Derefs to `SessionHandle`. Dropping it returns the session to idle.
pub struct PooledSession {
    /// Always `Some` until the session is handed back
    handle: Option<SessionHandle>,
    pool: Arc<PoolInner>,
}

impl PooledSession {
    fn new(handle: SessionHandle, pool: Arc<PoolInner>) -> Self {
        Self {
            handle: Some(handle),
            pool,
        }
    }

    /// Change a password through this session.
    ///
    /// Other sessions of the pool are not affected. When the pool's own
    /// account is rotated, sessions authenticated afterwards use the new
    /// password.
    pub async fn change_password(&mut self, change: &PasswordChange) -> Result<RotationPolicy> {
        if self.pool.is_closed() {
            return Err(Error::pool_closed());
        }
        let handle = self.handle.as_mut().ok_or_else(Error::session_closed)?;
        let policy = handle.change_password(change).await?;
        self.pool.observe_rotation(change, policy);
        Ok(policy)
    }

    /// Return the session to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Log the session off and remove it from the pool.
    pub async fn discard(mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.pool.forget(handle.id());
        handle.close().await
    }
}

impl Deref for PooledSession {
    type Target = SessionHandle;

    fn deref(&self) -> &SessionHandle {
        self.handle
            .as_ref()
            .expect("pooled session used after being returned")
    }
}

impl DerefMut for PooledSession {
    fn deref_mut(&mut self) -> &mut SessionHandle {
        self.handle
            .as_mut()
            .expect("pooled session used after being returned")
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.reclaim(handle);
        }
    }
}
