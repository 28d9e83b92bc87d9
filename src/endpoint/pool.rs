//! Per-endpoint connection pool.
//!
//! Acquire prefers the least-loaded active connection with a free stream
//! slot, grows the pool up to its max size, and otherwise parks the caller
//! in a bounded FIFO queue. A periodic cleaner closes idle and drained
//! connections. Connections report load changes and closure through an
//! event channel consumed by the pool task.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::config::EndpointConfig;
use crate::proto::{ConnHandle, ConnState, PoolEvent, PoolEvents};

/// Milliseconds on the process-wide monotonic clock; what
/// `ConnShared::idle_since_ms` is measured against.
pub(crate) fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Opens one connection for the pool. Implemented by the endpoint, which
/// owns transport negotiation and protocol selection.
pub(crate) trait Connector: Send + Sync + 'static {
    fn connect(&self, events: PoolEvents, conn_id: u64) -> BoxFuture<'static, crate::Result<ConnHandle>>;
}

pub(crate) struct Pool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    config: Arc<EndpointConfig>,
    connector: Arc<dyn Connector>,
    events: PoolEvents,
    state: Mutex<PoolState>,
}

struct PoolState {
    conns: Vec<ConnHandle>,
    connecting: usize,
    waiters: VecDeque<oneshot::Sender<crate::Result<()>>>,
    shutdown: bool,
    next_conn_id: u64,
}

impl Pool {
    pub(crate) fn new(config: Arc<EndpointConfig>, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(PoolShared {
            config,
            connector,
            events: events_tx,
            state: Mutex::new(PoolState {
                conns: Vec::new(),
                connecting: 0,
                waiters: VecDeque::new(),
                shutdown: false,
                next_conn_id: 0,
            }),
        });
        tokio::spawn(run_pool_task(Arc::downgrade(&shared), events_rx));
        Self { shared }
    }

    /// Eagerly open the first connection; the single-connection endpoint
    /// variant calls this right after construction.
    pub(crate) fn warm(&self) {
        let mut state = lock(&self.shared.state);
        if !state.shutdown && state.conns.is_empty() && state.connecting == 0 {
            self.shared.clone().start_connect(&mut state);
        }
    }

    /// Acquire a connection with a free slot, growing or queueing as
    /// needed. The configured connect timeout bounds the whole operation,
    /// including time spent parked in the queue.
    pub(crate) async fn acquire(&self) -> crate::Result<ConnHandle> {
        match self.shared.config.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.acquire_inner())
                .await
                .map_err(|_| {
                    crate::Error::new_connect(std::io::Error::from(std::io::ErrorKind::TimedOut))
                })?,
            None => self.acquire_inner().await,
        }
    }

    async fn acquire_inner(&self) -> crate::Result<ConnHandle> {
        loop {
            let waiter = {
                let mut state = lock(&self.shared.state);
                if state.shutdown {
                    return Err(crate::Error::new_shutdown());
                }
                state.conns.retain(|conn| conn.shared.state() != ConnState::Closed);

                if let Some(conn) = state
                    .conns
                    .iter()
                    .filter(|conn| {
                        conn.shared.has_slot()
                            && conn.shared.is_reusable()
                            && !conn.shared.is_detached()
                    })
                    .min_by_key(|conn| conn.shared.load())
                {
                    return Ok(conn.clone());
                }

                let growing =
                    state.conns.len() + state.connecting < self.shared.config.pool_max_size;
                if growing {
                    self.shared.clone().start_connect(&mut state);
                } else if state.waiters.len() >= self.shared.config.pool_buffer_size {
                    // Nothing to wait for but a slot, and the queue is full.
                    return Err(crate::Error::new_pool_exhausted());
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };
            trace!("pool acquire queued");
            match waiter.await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => return Err(err),
                // Pool task gone; endpoint is shutting down.
                Err(_) => return Err(crate::Error::new_shutdown()),
            }
        }
    }

    /// Close every connection immediately. In-flight exchanges fail with a
    /// shutdown cause; detached connections are not affected.
    pub(crate) fn shutdown(&self) {
        let conns = {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Err(crate::Error::new_shutdown()));
            }
            state.conns.drain(..).collect::<Vec<_>>()
        };
        for conn in conns {
            if !conn.shared.is_detached() {
                conn.close();
            }
        }
    }

    /// Refuse new acquires, drain connections and wait for load to reach
    /// zero; on deadline the shutdown escalates to a hard one.
    pub(crate) async fn shutdown_gracefully(&self) {
        let conns = {
            let mut state = lock(&self.shared.state);
            state.shutdown = true;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.send(Err(crate::Error::new_shutdown()));
            }
            state.conns.clone()
        };
        for conn in &conns {
            if !conn.shared.is_detached() {
                conn.drain();
            }
        }
        let deadline = tokio::time::Instant::now() + self.shared.config.graceful_shutdown_timeout;
        loop {
            let all_closed = {
                let state = lock(&self.shared.state);
                state
                    .conns
                    .iter()
                    .all(|conn| conn.shared.state() == ConnState::Closed || conn.shared.is_detached())
            };
            if all_closed {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                debug!("graceful shutdown deadline exceeded, escalating");
                self.shutdown();
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

impl PoolShared {
    /// Kick off one connection attempt; `state` is the held lock.
    fn start_connect(self: Arc<Self>, state: &mut PoolState) {
        let conn_id = state.next_conn_id;
        state.next_conn_id += 1;
        state.connecting += 1;
        let events = self.events.clone();
        trace!(conn_id, "pool opening connection");
        let shared = self;
        tokio::spawn(async move {
            let result = shared.connector.connect(events, conn_id).await;
            let mut state = lock(&shared.state);
            state.connecting -= 1;
            match result {
                Ok(conn) => {
                    if state.shutdown {
                        conn.close();
                        return;
                    }
                    let slots = conn.shared.capacity().max(1);
                    state.conns.push(conn);
                    wake_waiters(&mut state, slots);
                }
                Err(err) => {
                    debug!(conn_id, "pool connection attempt failed: {err}");
                    // The acquirer that triggered this growth is parked in
                    // the queue; it hears the establishment failure. Anyone
                    // still parked gets another attempt.
                    if let Some(waiter) = state.waiters.pop_front() {
                        let _ = waiter.send(Err(err));
                    }
                    if !state.waiters.is_empty()
                        && !state.shutdown
                        && state.conns.len() + state.connecting
                            < shared.config.pool_max_size
                    {
                        shared.clone().start_connect(&mut state);
                    }
                }
            }
        });
    }
}

fn wake_waiters(state: &mut PoolState, slots: usize) {
    for _ in 0..slots {
        match state.waiters.pop_front() {
            Some(waiter) => {
                let _ = waiter.send(Ok(()));
            }
            None => break,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Pool background task: connection events plus the periodic cleaner.
async fn run_pool_task(
    shared: Weak<PoolShared>,
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
) {
    let clean_period = match shared.upgrade() {
        Some(shared) => shared.config.pool_clean_period,
        None => return,
    };
    let mut ticker = tokio::time::interval(clean_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(shared) = shared.upgrade() else { return };
                match event {
                    Some(PoolEvent::Released(conn_id)) => {
                        trace!(conn_id, "pool connection released a slot");
                        let mut state = lock(&shared.state);
                        wake_waiters(&mut state, 1);
                    }
                    Some(PoolEvent::Closed(conn_id)) => {
                        trace!(conn_id, "pool connection closed");
                        let mut state = lock(&shared.state);
                        state.conns.retain(|conn| conn.shared.state() != ConnState::Closed);
                        // A slot may have opened up by replacement.
                        if !state.waiters.is_empty()
                            && state.conns.len() + state.connecting < shared.config.pool_max_size
                            && !state.shutdown
                        {
                            shared.clone().start_connect(&mut state);
                        }
                    }
                    None => return,
                }
            }
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { return };
                clean(&shared);
            }
        }
    }
}

/// Close idle-for-too-long connections and prune the closed.
fn clean(shared: &Arc<PoolShared>) {
    let keep_alive = shared.config.pool_keep_alive_timeout;
    let mut to_drain = Vec::new();
    {
        let mut state = lock(&shared.state);
        state.conns.retain(|conn| conn.shared.state() != ConnState::Closed);
        if let Some(keep_alive) = keep_alive {
            let now = now_ms();
            for conn in &state.conns {
                if conn.shared.load() == 0
                    && conn.shared.state() == ConnState::Active
                    && now.saturating_sub(conn.shared.idle_since_ms())
                        >= keep_alive.as_millis() as u64
                {
                    to_drain.push(conn.clone());
                }
            }
        }
    }
    for conn in to_drain {
        trace!(conn_id = conn.shared.id, "pool closing idle connection");
        conn.drain();
    }
}
