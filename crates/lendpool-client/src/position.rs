//! session-scoped snapshot cache for one pool/account pair
//!
//! holds the most recent successful pool, position, allowance and balance
//! reads. each read keeps its own error state, so one failing read never
//! clobbers the others; bound checks only ever see the last values that were
//! actually fetched.
//!
//! concurrent `refresh` calls share a single in-flight fetch. `invalidate`
//! never blocks: it marks the cache stale and detaches any fetch that started
//! before it, so the next refresh goes back to the ledger.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy_primitives::{Address, U256};
use futures::future::{BoxFuture, FutureExt, Shared};
use lendpool_core::{AllowanceState, PoolSnapshot, RiskEngine, UserPosition};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{ClientError, RemoteError, Result};
use crate::ledger::RemoteLedger;

/// a consistent view built from the latest successful reads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerSnapshot {
    /// totals from the ledger, rates recomputed locally
    pub pool: PoolSnapshot,
    pub position: UserPosition,
    pub allowance: AllowanceState,
    /// wallet balance of the underlying token
    pub balance: U256,
    /// time of the oldest read that went into this snapshot
    pub fetched_at: Instant,
}

/// last value and last error of one remote read
#[derive(Clone, Debug)]
pub struct ReadState<T> {
    pub value: Option<T>,
    pub error: Option<ClientError>,
    pub updated_at: Option<Instant>,
}

impl<T> Default for ReadState<T> {
    fn default() -> Self {
        Self {
            value: None,
            error: None,
            updated_at: None,
        }
    }
}

impl<T: Clone> ReadState<T> {
    fn record(&mut self, result: std::result::Result<T, ClientError>, now: Instant) {
        match result {
            Ok(v) => {
                self.value = Some(v);
                self.error = None;
                self.updated_at = Some(now);
            }
            Err(e) => self.error = Some(e),
        }
    }

    fn current(&self) -> Option<(T, Instant)> {
        Some((self.value.clone()?, self.updated_at?))
    }
}

/// per-read error state, for display
#[derive(Clone, Debug, Default)]
pub struct ReadErrors {
    pub pool: Option<ClientError>,
    pub position: Option<ClientError>,
    pub allowance: Option<ClientError>,
    pub balance: Option<ClientError>,
}

impl ReadErrors {
    pub fn is_empty(&self) -> bool {
        self.pool.is_none() && self.position.is_none() && self.allowance.is_none() && self.balance.is_none()
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<LedgerSnapshot>>>>;

#[derive(Default)]
struct Inner {
    pool: ReadState<PoolSnapshot>,
    position: ReadState<UserPosition>,
    allowance: ReadState<AllowanceState>,
    balance: ReadState<U256>,
    latest: Option<Arc<LedgerSnapshot>>,
    stale: bool,
    generation: u64,
    next_fetch_id: u64,
    inflight: Option<(u64, SharedRefresh)>,
}

impl Inner {
    fn compose(&mut self) {
        let (Some((pool, t1)), Some((position, t2)), Some((allowance, t3)), Some((balance, t4))) = (
            self.pool.current(),
            self.position.current(),
            self.allowance.current(),
            self.balance.current(),
        ) else {
            return;
        };
        self.latest = Some(Arc::new(LedgerSnapshot {
            pool,
            position,
            allowance,
            balance,
            fetched_at: t1.min(t2).min(t3).min(t4),
        }));
    }
}

struct State {
    remote: Arc<dyn RemoteLedger>,
    engine: RiskEngine,
    owner: Address,
    spender: Address,
    ttl: Duration,
    request_timeout: Duration,
    inner: Mutex<Inner>,
}

impl State {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic while holding the lock leaves plain data behind; keep going
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// cached view of one account in one pool
#[derive(Clone)]
pub struct PositionLedger {
    state: Arc<State>,
}

impl PositionLedger {
    pub fn new(
        remote: Arc<dyn RemoteLedger>,
        engine: RiskEngine,
        owner: Address,
        spender: Address,
        ttl: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(State {
                remote,
                engine,
                owner,
                spender,
                ttl,
                request_timeout,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn owner(&self) -> Address {
        self.state.owner
    }

    pub fn spender(&self) -> Address {
        self.state.spender
    }

    pub fn engine(&self) -> &RiskEngine {
        &self.state.engine
    }

    /// latest snapshot, `None` until every read has succeeded once
    pub fn get(&self) -> Option<Arc<LedgerSnapshot>> {
        self.state.lock().latest.clone()
    }

    /// latest snapshot if it is neither invalidated nor older than the ttl
    pub fn get_fresh(&self) -> Option<Arc<LedgerSnapshot>> {
        let inner = self.state.lock();
        let snapshot = inner.latest.as_ref()?;
        if inner.stale || snapshot.fetched_at.elapsed() >= self.state.ttl {
            return None;
        }
        Some(snapshot.clone())
    }

    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    pub fn errors(&self) -> ReadErrors {
        let inner = self.state.lock();
        ReadErrors {
            pool: inner.pool.error.clone(),
            position: inner.position.error.clone(),
            allowance: inner.allowance.error.clone(),
            balance: inner.balance.error.clone(),
        }
    }

    /// mark everything stale without waiting for anything
    pub fn invalidate(&self) {
        let mut inner = self.state.lock();
        inner.stale = true;
        inner.generation += 1;
        inner.inflight = None;
        debug!(owner = %self.state.owner, generation = inner.generation, "snapshot invalidated");
    }

    /// fresh snapshot, refreshing first when needed
    pub async fn ensure_fresh(&self) -> Result<Arc<LedgerSnapshot>> {
        match self.get_fresh() {
            Some(snapshot) => {
                debug!(owner = %self.state.owner, "snapshot cache hit");
                Ok(snapshot)
            }
            None => self.refresh().await,
        }
    }

    /// fetch pool, position, allowance and balance concurrently
    ///
    /// joins an in-flight fetch instead of starting a second one. on partial
    /// failure the successful reads are still recorded and the first error is
    /// returned.
    pub async fn refresh(&self) -> Result<Arc<LedgerSnapshot>> {
        let fetch = {
            let mut inner = self.state.lock();
            match &inner.inflight {
                Some((_, fetch)) => {
                    debug!(owner = %self.state.owner, "joining in-flight refresh");
                    fetch.clone()
                }
                None => {
                    let id = inner.next_fetch_id;
                    inner.next_fetch_id += 1;
                    let generation = inner.generation;
                    let fetch = fetch_all(self.state.clone(), id, generation).boxed().shared();
                    inner.inflight = Some((id, fetch.clone()));
                    fetch
                }
            }
        };
        fetch.await
    }

    /// re-read the allowance straight from the ledger and cache it
    pub async fn refresh_allowance(&self) -> Result<AllowanceState> {
        let state = &self.state;
        let generation = state.lock().generation;
        let result = with_timeout(
            state.request_timeout,
            state.remote.read_allowance(state.owner, state.spender),
        )
        .await
        .map(|amount| AllowanceState {
            owner: state.owner,
            spender: state.spender,
            amount,
        })
        .map_err(ClientError::from);

        let mut inner = state.lock();
        if inner.generation == generation {
            inner.allowance.record(result.clone(), Instant::now());
            inner.compose();
        }
        result
    }
}

async fn with_timeout<T>(
    limit: Duration,
    read: impl std::future::Future<Output = std::result::Result<T, RemoteError>>,
) -> std::result::Result<T, RemoteError> {
    match tokio::time::timeout(limit, read).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Transport(format!(
            "request timed out after {}s",
            limit.as_secs()
        ))),
    }
}

async fn fetch_all(state: Arc<State>, id: u64, generation: u64) -> Result<Arc<LedgerSnapshot>> {
    let remote = &state.remote;
    let limit = state.request_timeout;
    debug!(owner = %state.owner, fetch = id, "refreshing snapshot");

    let (pool, position, allowance, balance) = tokio::join!(
        with_timeout(limit, remote.read_pool()),
        with_timeout(limit, remote.read_position(state.owner)),
        with_timeout(limit, remote.read_allowance(state.owner, state.spender)),
        with_timeout(limit, remote.read_balance(state.owner)),
    );

    let pool = pool.map_err(ClientError::from).and_then(|reported| {
        let derived = state.engine.derive(&reported)?;
        if !reported.utilization_rate.is_zero() && reported.utilization_rate != derived.utilization_rate {
            debug!(
                reported = %reported.utilization_rate,
                local = %derived.utilization_rate,
                "ledger utilization differs from local derivation"
            );
        }
        Ok(derived)
    });
    let position = position.map_err(ClientError::from);
    let allowance = allowance.map_err(ClientError::from).map(|amount| AllowanceState {
        owner: state.owner,
        spender: state.spender,
        amount,
    });
    let balance = balance.map_err(ClientError::from);

    let first_error = [
        pool.as_ref().err(),
        position.as_ref().err(),
        allowance.as_ref().err(),
        balance.as_ref().err(),
    ]
    .into_iter()
    .flatten()
    .next()
    .cloned();

    let now = Instant::now();
    let mut inner = state.lock();
    if matches!(&inner.inflight, Some((inflight, _)) if *inflight == id) {
        inner.inflight = None;
    }

    // reads that began before an invalidation may predate the write; hand
    // them to whoever awaited this fetch but keep them out of the cache
    if inner.generation != generation {
        drop(inner);
        debug!(owner = %state.owner, fetch = id, "discarding reads from before an invalidation");
        return match (pool, position, allowance, balance) {
            (Ok(pool), Ok(position), Ok(allowance), Ok(balance)) => Ok(Arc::new(LedgerSnapshot {
                pool,
                position,
                allowance,
                balance,
                fetched_at: now,
            })),
            _ => Err(first_error.unwrap_or_else(|| ClientError::NoSnapshot(state.owner.to_string()))),
        };
    }

    inner.pool.record(pool, now);
    inner.position.record(position, now);
    inner.allowance.record(allowance, now);
    inner.balance.record(balance, now);
    inner.compose();

    if let Some(e) = first_error {
        warn!(owner = %state.owner, error = %e, "snapshot refresh incomplete");
        return Err(e);
    }

    inner.stale = false;
    inner
        .latest
        .clone()
        .ok_or_else(|| ClientError::NoSnapshot(state.owner.to_string()))
}
