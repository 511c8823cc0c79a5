//! Per-connector pool of backend sessions keyed by client identity.
//!
//! A client id owns at most one session. A request arriving while that
//! session is still busy cancels the running statement, waits for the old
//! holder to let go, rolls the session back and reuses it. Requests without
//! a client id get a private session that is never pooled.

use crate::config::PoolSettings;
use crate::error::{DataError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Interrupts a statement running on a session, from another task
#[async_trait]
pub trait StatementCanceller: Send + Sync {
    async fn cancel(&self) -> Result<()>;
}

/// Opens and recycles the backend sessions of a [`SessionPool`]
#[async_trait]
pub trait SessionManager: Send + Sync + 'static {
    type Session: Send + 'static;

    /// Open a session, switched to read-only mode where the backend allows
    async fn open(&self) -> Result<Self::Session>;

    /// Roll back whatever the previous use left open
    async fn reset(&self, session: &mut Self::Session) -> Result<()>;

    /// Handle able to interrupt the statement running on `session`
    fn canceller(&self, session: &Self::Session) -> Option<Arc<dyn StatementCanceller>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Busy,
}

type Slot<S> = Arc<tokio::sync::Mutex<Option<S>>>;

struct PoolEntry<S> {
    slot: Slot<S>,
    state: SessionState,
    /// Identifies the current holder; stale holders do not touch the entry
    generation: u64,
    last_used: Instant,
    token: CancellationToken,
    canceller: Option<Arc<dyn StatementCanceller>>,
}

impl<S> PoolEntry<S> {
    fn cancel(&self) {
        self.token.cancel();
        if let Some(canceller) = self.canceller.clone() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = canceller.cancel().await {
                        warn!("Failed to cancel running statement: {}", e);
                    }
                });
            }
        }
    }
}

struct PoolShared<M: SessionManager> {
    manager: Arc<M>,
    settings: PoolSettings,
    entries: Mutex<HashMap<String, PoolEntry<M::Session>>>,
    generations: AtomicU64,
}

impl<M: SessionManager> PoolShared<M> {
    fn entries(&self) -> MutexGuard<'_, HashMap<String, PoolEntry<M::Session>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Close idle sessions past the idle time and any session past the
    /// abandon time
    fn sweep(&self) {
        let now = Instant::now();
        let idle_time = self.settings.idle_time;
        let abandon_time = self.settings.abandon_time;
        self.entries().retain(|client, entry| {
            let age = now.saturating_duration_since(entry.last_used);
            let idle_expired = entry.state == SessionState::Idle && age > idle_time;
            let abandoned = age > abandon_time;
            if abandoned && entry.state == SessionState::Busy {
                warn!("Abandoning session for client {} after {:?}", client, age);
                entry.cancel();
            } else if idle_expired || abandoned {
                debug!("Closing idle session for client {}", client);
            }
            !(idle_expired || abandoned)
        });
    }

    fn release(&self, client: &str, generation: u64) {
        if let Some(entry) = self.entries().get_mut(client) {
            if entry.generation == generation {
                entry.state = SessionState::Idle;
                entry.last_used = Instant::now();
            }
        }
    }

    fn forget(&self, client: &str, generation: u64) {
        let mut entries = self.entries();
        if entries
            .get(client)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(client);
        }
    }

    fn set_canceller(
        &self,
        client: &str,
        generation: u64,
        canceller: Option<Arc<dyn StatementCanceller>>,
    ) {
        if let Some(entry) = self.entries().get_mut(client) {
            if entry.generation == generation {
                entry.canceller = canceller;
            }
        }
    }
}

enum Claim<S> {
    Existing {
        slot: Slot<S>,
        generation: u64,
        token: CancellationToken,
        superseded: Option<Option<Arc<dyn StatementCanceller>>>,
    },
    New {
        guard: OwnedMutexGuard<Option<S>>,
        generation: u64,
        token: CancellationToken,
    },
}

/// Sessions of one connector instance
pub struct SessionPool<M: SessionManager> {
    shared: Arc<PoolShared<M>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<M: SessionManager> SessionPool<M> {
    /// Create a pool; the periodic sweep starts when a tokio runtime is running
    pub fn new(manager: M, settings: PoolSettings) -> Self {
        let shared = Arc::new(PoolShared {
            manager: Arc::new(manager),
            settings,
            entries: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        });
        let sweeper = tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.spawn(sweep_loop(Arc::downgrade(&shared), settings)));
        Self { shared, sweeper }
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn settings(&self) -> PoolSettings {
        self.shared.settings
    }

    /// Get the session for `client_id`, cancelling its running statement
    /// if it is busy
    pub async fn acquire(&self, client_id: Option<&str>) -> Result<PooledSession<M>> {
        let Some(client) = client_id else {
            let session = self.shared.manager.open().await?;
            let slot: Slot<M::Session> = Arc::new(tokio::sync::Mutex::new(Some(session)));
            return Ok(PooledSession {
                guard: slot.lock_owned().await,
                token: CancellationToken::new(),
                client: None,
                shared: Weak::new(),
            });
        };

        self.shared.sweep();
        let claim = self.claim(client)?;
        match claim {
            Claim::New {
                mut guard,
                generation,
                token,
            } => {
                debug!("Opening session for client {}", client);
                match self.shared.manager.open().await {
                    Ok(session) => *guard = Some(session),
                    Err(e) => {
                        self.shared.forget(client, generation);
                        return Err(e);
                    }
                }
                self.finish_claim(client, generation, guard, token)
            }
            Claim::Existing {
                slot,
                generation,
                token,
                superseded,
            } => {
                if let Some(canceller) = superseded {
                    debug!("Cancelling running statement for client {}", client);
                    if let Some(canceller) = canceller {
                        if let Err(e) = canceller.cancel().await {
                            warn!("Failed to cancel running statement: {}", e);
                        }
                    }
                }
                let mut guard = slot.lock_owned().await;
                if token.is_cancelled() {
                    return Err(DataError::Cancelled);
                }
                if let Some(session) = guard.as_mut() {
                    if let Err(e) = self.shared.manager.reset(session).await {
                        warn!("Discarding session for client {}: {}", client, e);
                        *guard = None;
                    }
                }
                if guard.is_none() {
                    match self.shared.manager.open().await {
                        Ok(session) => *guard = Some(session),
                        Err(e) => {
                            self.shared.forget(client, generation);
                            return Err(e);
                        }
                    }
                }
                self.finish_claim(client, generation, guard, token)
            }
        }
    }

    fn claim(&self, client: &str) -> Result<Claim<M::Session>> {
        let generation = self.shared.next_generation();
        let token = CancellationToken::new();
        let mut entries = self.shared.entries();
        if let Some(entry) = entries.get_mut(client) {
            let superseded = (entry.state == SessionState::Busy).then(|| {
                entry.token.cancel();
                entry.canceller.clone()
            });
            entry.state = SessionState::Busy;
            entry.generation = generation;
            entry.last_used = Instant::now();
            entry.token = token.clone();
            return Ok(Claim::Existing {
                slot: entry.slot.clone(),
                generation,
                token,
                superseded,
            });
        }

        let slot: Slot<M::Session> = Arc::new(tokio::sync::Mutex::new(None));
        let guard = slot
            .clone()
            .try_lock_owned()
            .map_err(|e| DataError::Internal(format!("new session slot is locked: {e}")))?;
        entries.insert(
            client.to_string(),
            PoolEntry {
                slot,
                state: SessionState::Busy,
                generation,
                last_used: Instant::now(),
                token: token.clone(),
                canceller: None,
            },
        );
        Ok(Claim::New {
            guard,
            generation,
            token,
        })
    }

    fn finish_claim(
        &self,
        client: &str,
        generation: u64,
        guard: OwnedMutexGuard<Option<M::Session>>,
        token: CancellationToken,
    ) -> Result<PooledSession<M>> {
        let canceller = guard
            .as_ref()
            .and_then(|session| self.shared.manager.canceller(session));
        self.shared.set_canceller(client, generation, canceller);
        Ok(PooledSession {
            guard,
            token,
            client: Some((client.to_string(), generation)),
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Current state of a client's session
    pub fn state(&self, client: &str) -> Option<SessionState> {
        self.shared.entries().get(client).map(|entry| entry.state)
    }

    /// Number of pooled (client-bound) sessions
    pub fn len(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one sweep now
    pub fn sweep(&self) {
        self.shared.sweep();
    }

    /// Cancel busy sessions and drop every pooled session
    pub fn close_all(&self) {
        let mut entries = self.shared.entries();
        for (client, entry) in entries.drain() {
            if entry.state == SessionState::Busy {
                debug!("Cancelling session for client {} on close", client);
                entry.cancel();
            }
        }
    }
}

impl<M: SessionManager> Drop for SessionPool<M> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

async fn sweep_loop<M: SessionManager>(shared: Weak<PoolShared<M>>, settings: PoolSettings) {
    let mut ticker = tokio::time::interval(settings.sweep_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match shared.upgrade() {
            Some(shared) => shared.sweep(),
            None => break,
        }
    }
}

/// Exclusive use of one session; returns it to the pool when dropped
pub struct PooledSession<M: SessionManager> {
    guard: OwnedMutexGuard<Option<M::Session>>,
    token: CancellationToken,
    client: Option<(String, u64)>,
    shared: Weak<PoolShared<M>>,
}

impl<M: SessionManager> PooledSession<M> {
    pub fn session(&mut self) -> Result<&mut M::Session> {
        self.guard
            .as_mut()
            .ok_or_else(|| DataError::Internal("pooled session is missing".to_string()))
    }

    /// Move the session out, for drivers that need ownership across a
    /// blocking call; hand it back with [`PooledSession::restore`]
    pub fn take(&mut self) -> Result<M::Session> {
        self.guard
            .take()
            .ok_or_else(|| DataError::Internal("pooled session is missing".to_string()))
    }

    pub fn restore(&mut self, session: M::Session) {
        *self.guard = Some(session);
    }

    /// Fires when a newer request for the same client supersedes this one
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client.as_ref().map(|(client, _)| client.as_str())
    }

    /// Run `fut` unless this session is superseded first
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        run_cancellable(&self.token, fut).await
    }
}

impl<M: SessionManager> Drop for PooledSession<M> {
    fn drop(&mut self) {
        if let Some((client, generation)) = &self.client {
            if let Some(shared) = self.shared.upgrade() {
                shared.release(client, *generation);
            }
        }
    }
}

/// Await `fut`, giving up with [`DataError::Cancelled`] once `token` fires
pub async fn run_cancellable<T, F>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DataError::Cancelled),
        result = fut => result,
    }
}
