//! one connected account
//!
//! a session owns everything that holds state for an address: the snapshot
//! cache, the transaction state machine and the background poller. sessions
//! share nothing, so tests can run as many side by side as they like.

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use lendpool_core::{
    HealthDisplay, HealthFactor, HealthStatus, HealthWarning, Percentage, PoolSnapshot, RiskEngine,
    UnitsError, UserPosition,
};
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result, SubmitError};
use crate::intent::{Action, TransactionIntent};
use crate::ledger::{Receipt, RemoteLedger};
use crate::notify::NotificationSink;
use crate::orchestrator::{TransactionOrchestrator, TxEvent, TxStep};
use crate::poller::Poller;
use crate::position::{LedgerSnapshot, PositionLedger, ReadErrors};

/// everything a dashboard shows, derived from the latest successful reads
#[derive(Clone, Debug)]
pub struct Dashboard {
    pub pool: PoolSnapshot,
    pub utilization: Percentage,
    pub position: UserPosition,
    pub health: HealthFactor,
    pub health_status: HealthStatus,
    pub health_warning: HealthWarning,
    pub health_display: HealthDisplay,
    pub max_withdraw: U256,
    pub max_borrow: U256,
    pub balance: U256,
    pub allowance: U256,
    /// the snapshot was invalidated and not yet refreshed
    pub stale: bool,
    pub errors: ReadErrors,
}

impl Dashboard {
    pub fn from_snapshot(
        engine: &RiskEngine,
        snapshot: &LedgerSnapshot,
        stale: bool,
        errors: ReadErrors,
    ) -> Result<Self> {
        let health = engine.health_factor(&snapshot.position)?;
        Ok(Self {
            pool: snapshot.pool.clone(),
            utilization: engine.utilization(&snapshot.pool)?,
            position: snapshot.position.clone(),
            health,
            health_status: engine.health_status(health),
            health_warning: engine.health_warning(health),
            health_display: engine.health_display(health),
            max_withdraw: engine.max_withdraw(&snapshot.position)?,
            max_borrow: engine.max_borrow(&snapshot.position)?,
            balance: snapshot.balance,
            allowance: snapshot.allowance.amount,
            stale,
            errors,
        })
    }
}

pub struct LendingSession {
    config: ClientConfig,
    ledger: PositionLedger,
    orchestrator: Arc<TransactionOrchestrator>,
    poller: Option<Poller>,
}

impl LendingSession {
    /// build a session without touching the ledger or starting the poller
    pub fn new(
        config: ClientConfig,
        remote: Arc<dyn RemoteLedger>,
        owner: Address,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        config.validate()?;
        let engine = RiskEngine::new(config.params.clone());
        let ledger = PositionLedger::new(
            remote.clone(),
            engine,
            owner,
            config.pool.pool_address,
            config.snapshot_ttl(),
            config.request_timeout(),
        );
        let orchestrator = Arc::new(TransactionOrchestrator::new(
            remote,
            ledger.clone(),
            sink,
            config.finality_timeout(),
        ));
        Ok(Self {
            config,
            ledger,
            orchestrator,
            poller: None,
        })
    }

    /// build, take a first snapshot and start background polling
    ///
    /// a failed first refresh is logged, not fatal; the poller and the next
    /// submit both retry it.
    pub async fn connect(
        config: ClientConfig,
        remote: Arc<dyn RemoteLedger>,
        owner: Address,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let mut session = Self::new(config, remote, owner, sink)?;
        info!(%owner, pool = %session.config.pool.pool_address, "session connected");
        if let Err(e) = session.ledger.refresh().await {
            warn!(error = %e, "initial refresh failed");
        }
        session.start_polling();
        Ok(session)
    }

    pub fn start_polling(&mut self) {
        if self.poller.is_none() {
            self.poller = Some(Poller::spawn(self.orchestrator.clone(), self.config.poll_interval()));
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller.as_ref().is_some_and(Poller::is_running)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn owner(&self) -> Address {
        self.ledger.owner()
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &Arc<TransactionOrchestrator> {
        &self.orchestrator
    }

    /// parse user text into an intent at the pool token's decimals
    pub fn intent(&self, action: Action, amount: &str) -> std::result::Result<TransactionIntent, UnitsError> {
        TransactionIntent::parse(action, amount, self.config.pool.decimals)
    }

    pub async fn submit(&self, intent: TransactionIntent) -> std::result::Result<Receipt, SubmitError> {
        self.orchestrator.submit(intent).await
    }

    pub async fn approve(&self, amount: U256) -> std::result::Result<Receipt, SubmitError> {
        self.orchestrator.approve(amount).await
    }

    pub fn reset(&self) -> bool {
        self.orchestrator.reset()
    }

    pub fn state(&self) -> TxStep {
        self.orchestrator.state()
    }

    pub fn watch(&self) -> watch::Receiver<TxStep> {
        self.orchestrator.watch()
    }

    pub fn events(&self) -> broadcast::Receiver<TxEvent> {
        self.orchestrator.subscribe()
    }

    pub async fn refresh(&self) -> Result<Arc<LedgerSnapshot>> {
        self.ledger.refresh().await
    }

    /// dashboard from the latest successful reads
    pub fn dashboard(&self) -> Result<Dashboard> {
        let snapshot = self
            .ledger
            .get()
            .ok_or_else(|| ClientError::NoSnapshot(self.owner().to_string()))?;
        Dashboard::from_snapshot(
            self.ledger.engine(),
            &snapshot,
            self.ledger.is_stale(),
            self.ledger.errors(),
        )
    }

    /// stop the poller and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(poller) = self.poller.take() {
            poller.shutdown().await;
        }
        info!(owner = %self.owner(), "session closed");
    }
}
