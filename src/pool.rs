//! Bounded session pool.
//!
//! Sessions are idle (queued), active (leased to a caller) or pending (being
//! created against reserved capacity). `active + idle + pending <= max_size`
//! always holds; all bookkeeping lives behind one mutex that is never held
//! across an await. Blocked checkouts wait on a [`Notify`] that fires whenever
//! a session goes idle or capacity is freed.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{LdapError, LdapResult};
use crate::metrics::Metrics;
use crate::request::{SearchRequest, SearchScope};
use crate::result_code::ResultCode;
use crate::session::{DirectorySession, RawSearchItem, SessionFactory};

/// Health check run against a session outside the pool lock.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, session: &mut dyn DirectorySession) -> bool;
}

/// Base-scope search of the root DSE for `(objectClass=*)`, asking for no
/// attributes. Healthy when the search completes with success.
#[derive(Debug, Clone)]
pub struct SearchValidator {
    request: SearchRequest,
}

impl Default for SearchValidator {
    fn default() -> Self {
        Self {
            request: SearchRequest::new("", "(objectClass=*)")
                .scope(SearchScope::Base)
                .attributes(Vec::<String>::new())
                .size_limit(1),
        }
    }
}

impl SearchValidator {
    pub fn new(request: SearchRequest) -> Self {
        Self { request }
    }
}

#[async_trait]
impl Validator for SearchValidator {
    async fn validate(&self, session: &mut dyn DirectorySession) -> bool {
        let mut cursor = match session.search(&self.request, &[]).await {
            Ok(cursor) => cursor,
            Err(e) => {
                debug!("Validation search failed: {}", e);
                return false;
            }
        };
        loop {
            match cursor.next_item().await {
                Ok(RawSearchItem::Done(raw)) => return raw.code == ResultCode::Success.code(),
                Ok(_) => continue,
                Err(e) => {
                    debug!("Validation search failed: {}", e);
                    return false;
                }
            }
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub pending: usize,
    pub min: usize,
    pub max: usize,
}

struct IdleSession {
    session: Box<dyn DirectorySession>,
    created: Instant,
    idle_since: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleSession>,
    active: usize,
    pending: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.active + self.idle.len() + self.pending
    }
}

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    validator: Arc<dyn Validator>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    metrics: Option<Arc<Metrics>>,
}

/// Capacity reserved for a session being created. Dropping it unused gives
/// the slot back.
struct Reservation<'a> {
    pool: &'a PoolInner,
    armed: bool,
}

impl<'a> Reservation<'a> {
    /// Reserves a slot, or `None` when the pool is closed or full.
    fn take(pool: &'a PoolInner, state: &mut PoolState) -> Option<Self> {
        if state.closed || state.total() >= pool.config.max_size {
            return None;
        }
        state.pending += 1;
        Some(Self { pool, armed: true })
    }

    fn into_active(mut self) {
        self.armed = false;
        let mut state = self.pool.lock();
        state.pending -= 1;
        state.active += 1;
    }

    /// Returns the session when the pool closed while it was being created.
    fn into_idle(mut self, session: Box<dyn DirectorySession>) -> Option<Box<dyn DirectorySession>> {
        self.armed = false;
        let mut state = self.pool.lock();
        state.pending -= 1;
        if state.closed {
            return Some(session);
        }
        let now = Instant::now();
        state.idle.push_back(IdleSession {
            session,
            created: now,
            idle_since: now,
        });
        drop(state);
        self.pool.available.notify_waiters();
        None
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock().pending -= 1;
            self.pool.available.notify_waiters();
        }
    }
}

enum Step<'a> {
    Lease(IdleSession),
    Create(Reservation<'a>),
    Wait,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn count(&self, counter: impl Fn(&Metrics) -> &std::sync::atomic::AtomicU64) {
        if let Some(metrics) = &self.metrics {
            Metrics::inc(counter(metrics));
        }
    }

    async fn create_session(&self) -> LdapResult<Box<dyn DirectorySession>> {
        let session = self.factory.create().await?;
        self.count(|m| &m.sessions_created);
        debug!("Pool opened a new session");
        Ok(session)
    }

    async fn validate(&self, session: &mut dyn DirectorySession) -> bool {
        let ok = self.validator.validate(session).await;
        if !ok {
            self.count(|m| &m.validation_failures);
        }
        ok
    }

    async fn close_session(&self, mut session: Box<dyn DirectorySession>) {
        if let Err(e) = session.close().await {
            debug!("Error closing pooled session: {}", e);
        }
        self.count(|m| &m.sessions_destroyed);
    }

    /// Frees an active slot without returning a session to the idle queue.
    fn release_active(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.available.notify_waiters();
    }

    async fn acquire(self: &Arc<Self>) -> LdapResult<PooledConnection> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Registered before the state check so no release is missed.
            notified.as_mut().enable();

            let step = {
                let mut state = self.lock();
                if state.closed {
                    return Err(LdapError::PoolClosed);
                }
                if let Some(idle) = state.idle.pop_front() {
                    state.active += 1;
                    Step::Lease(idle)
                } else if let Some(reservation) = Reservation::take(self, &mut state) {
                    Step::Create(reservation)
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Lease(idle) => {
                    let mut conn = PooledConnection::new(Arc::clone(self), idle.session, idle.created);
                    if self.config.validate_on_checkout && !self.validate(conn.session_mut()).await {
                        warn!("Idle session failed validation on checkout; replacing it");
                        if let Some(session) = conn.session.take() {
                            self.release_active();
                            self.close_session(session).await;
                        }
                        continue;
                    }
                    return Ok(conn);
                }
                Step::Create(reservation) => {
                    let session = self.create_session().await?;
                    reservation.into_active();
                    return Ok(PooledConnection::new(Arc::clone(self), session, Instant::now()));
                }
                Step::Wait => notified.await,
            }
        }
    }

    async fn checkin(&self, mut session: Box<dyn DirectorySession>, created: Instant) {
        let expired = self
            .config
            .max_lifetime()
            .map_or(false, |max| created.elapsed() >= max);
        let healthy = !expired
            && (!self.config.validate_on_checkin || self.validate(session.as_mut()).await);
        if !healthy {
            if !expired {
                warn!("Session failed validation on checkin; destroying it");
            }
            self.release_active();
            self.close_session(session).await;
            return;
        }

        let leftover = {
            let mut state = self.lock();
            state.active = state.active.saturating_sub(1);
            if state.closed {
                Some(session)
            } else {
                state.idle.push_back(IdleSession {
                    session,
                    created,
                    idle_since: Instant::now(),
                });
                None
            }
        };
        self.available.notify_waiters();
        if let Some(session) = leftover {
            self.close_session(session).await;
        }
    }

    /// Creates idle sessions until the pool holds at least `min_size`.
    async fn fill_to_min(&self) -> LdapResult<usize> {
        let mut created = 0;
        loop {
            let reservation = {
                let mut state = self.lock();
                if state.total() >= self.config.min_size {
                    break;
                }
                match Reservation::take(self, &mut state) {
                    Some(reservation) => reservation,
                    None => break,
                }
            };
            let session = self.create_session().await?;
            if let Some(session) = reservation.into_idle(session) {
                self.close_session(session).await;
                break;
            }
            created += 1;
        }
        Ok(created)
    }

    async fn prune(&self) {
        let now = Instant::now();
        let max_idle = self.config.max_idle();
        let max_lifetime = self.config.max_lifetime();
        let removed: Vec<IdleSession> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let mut size = state.active + state.idle.len();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut removed = Vec::new();
            // Oldest idle sessions sit at the front.
            while let Some(idle) = state.idle.pop_front() {
                let too_old = max_lifetime.map_or(false, |max| now - idle.created >= max);
                let too_idle = now - idle.idle_since >= max_idle;
                if too_old || (too_idle && size > self.config.min_size) {
                    size -= 1;
                    removed.push(idle);
                } else {
                    kept.push_back(idle);
                }
            }
            state.idle = kept;
            removed
        };
        if !removed.is_empty() {
            debug!("Pruning {} idle sessions", removed.len());
        }
        for idle in removed {
            self.count(|m| &m.sessions_pruned);
            self.close_session(idle.session).await;
        }
        self.available.notify_waiters();

        if self.config.validate_periodically {
            self.validate_idle().await;
        }
        if let Err(e) = self.fill_to_min().await {
            warn!("Failed to restore pool to its minimum size: {}", e);
        }
    }

    /// Validates every idle session, leasing each one while it is checked.
    async fn validate_idle(&self) {
        let candidates: Vec<IdleSession> = {
            let mut state = self.lock();
            let taken: Vec<IdleSession> = state.idle.drain(..).collect();
            state.active += taken.len();
            taken
        };
        for mut idle in candidates {
            if self.validate(idle.session.as_mut()).await {
                let leftover = {
                    let mut state = self.lock();
                    state.active -= 1;
                    if state.closed {
                        Some(idle.session)
                    } else {
                        state.idle.push_back(idle);
                        None
                    }
                };
                if let Some(session) = leftover {
                    self.close_session(session).await;
                }
            } else {
                warn!("Idle session failed periodic validation; destroying it");
                self.release_active();
                self.close_session(idle.session).await;
            }
        }
        self.available.notify_waiters();
    }
}

/// Shared handle to a session pool; cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Builds an empty pool validated with [`SearchValidator`]. Nothing is
    /// opened until [`initialize`](Self::initialize) or the first checkout.
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Self {
        Self::with_validator(factory, config, Arc::new(SearchValidator::default()))
    }

    pub fn with_validator(
        factory: Arc<dyn SessionFactory>,
        config: PoolConfig,
        validator: Arc<dyn Validator>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                validator,
                config,
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
                metrics: None,
            }),
        }
    }

    /// Attaches metrics. Call before the pool is shared.
    pub fn with_metrics(self, metrics: Arc<Metrics>) -> Self {
        let inner = match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.metrics = Some(metrics);
                inner
            }
            Err(shared) => {
                warn!("Pool already shared; metrics not attached");
                return Self { inner: shared };
            }
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Opens `min_size` sessions.
    pub async fn initialize(&self) -> LdapResult<()> {
        let created = self.inner.fill_to_min().await?;
        info!(
            "Connection pool started: {} sessions (min {}, max {})",
            created, self.inner.config.min_size, self.inner.config.max_size
        );
        Ok(())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Checks out a session, waiting up to the configured checkout timeout.
    pub async fn checkout(&self) -> LdapResult<PooledConnection> {
        self.checkout_timeout(self.inner.config.checkout_timeout()).await
    }

    /// Checks out a session, waiting up to `timeout` for an idle session or
    /// free capacity.
    pub async fn checkout_timeout(&self, timeout: Duration) -> LdapResult<PooledConnection> {
        match tokio::time::timeout(timeout, self.inner.acquire()).await {
            Ok(Ok(conn)) => {
                self.inner.count(|m| &m.checkouts);
                Ok(conn)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.inner.count(|m| &m.checkouts_exhausted);
                warn!("No pooled session available within {:?}", timeout);
                Err(LdapError::PoolExhausted(timeout))
            }
        }
    }

    /// Returns a session to the pool.
    pub async fn checkin(&self, mut conn: PooledConnection) {
        if let Some(session) = conn.session.take() {
            conn.pool.checkin(session, conn.created).await;
        }
    }

    /// Destroys a leased session instead of returning it.
    pub async fn invalidate(&self, mut conn: PooledConnection) {
        if let Some(session) = conn.session.take() {
            debug!("Pooled session invalidated by caller");
            conn.pool.release_active();
            conn.pool.close_session(session).await;
        }
    }

    /// Runs one prune sweep now.
    pub async fn prune(&self) {
        self.inner.prune().await;
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            active: state.active,
            idle: state.idle.len(),
            pending: state.pending,
            min: self.inner.config.min_size,
            max: self.inner.config.max_size,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Closes idle sessions and rejects further checkouts. Leased sessions
    /// are closed as they come back.
    pub async fn close(&self) {
        let idle: Vec<IdleSession> = {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.available.notify_waiters();
        let count = idle.len();
        for idle in idle {
            self.inner.close_session(idle.session).await;
        }
        info!("Connection pool closed ({} idle sessions closed)", count);
    }

    /// Spawns the periodic prune sweep. The task ends once every pool handle
    /// and leased session is gone, or the pool is closed. Returns `None` when
    /// the prune period is zero.
    pub fn spawn_prune_task(&self) -> Option<JoinHandle<()>> {
        let period = self.inner.config.prune_period();
        if period.is_zero() {
            return None;
        }
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                if pool.lock().closed {
                    break;
                }
                pool.prune().await;
            }
            debug!("Pool prune task stopped");
        }))
    }
}

/// Session leased from a [`ConnectionPool`]. Dereferences to the session.
/// Dropping it without [`ConnectionPool::checkin`] returns it from a spawned
/// task.
pub struct PooledConnection {
    session: Option<Box<dyn DirectorySession>>,
    created: Instant,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, session: Box<dyn DirectorySession>, created: Instant) -> Self {
        Self {
            session: Some(session),
            created,
            pool,
        }
    }

    fn session_mut(&mut self) -> &mut dyn DirectorySession {
        &mut **self
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("created", &self.created)
            .field("held", &self.session.is_some())
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = dyn DirectorySession;

    fn deref(&self) -> &Self::Target {
        match &self.session {
            Some(session) => session.as_ref(),
            // The session is only taken by consuming methods and Drop.
            None => unreachable!("pooled session already released"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.session {
            Some(session) => session.as_mut(),
            None => unreachable!("pooled session already released"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        let created = self.created;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.checkin(session, created).await;
                });
            }
            Err(_) => {
                // No runtime left to close the session on; free the slot.
                pool.release_active();
                pool.count(|m| &m.sessions_destroyed);
            }
        }
    }
}
