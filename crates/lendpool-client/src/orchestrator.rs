//! transaction state machine
//!
//! ```text
//! Idle -> Approving -> Confirming -> Waiting -> Success
//!   \________\____________\____________\------> Error
//! ```
//!
//! one intent at a time per session. bound checks run locally against the
//! latest successful snapshot before anything is sent; the ledger re-checks
//! and stays authoritative. failures are classified, reported and never
//! retried: a retry is always a new submit from the user.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::U256;
use lendpool_core::RiskEngine;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::error::{classify, SubmitError, TxErrorKind, TxFailure, WriteStage};
use crate::intent::{Action, TransactionIntent};
use crate::ledger::{OperationHandle, Receipt, RemoteLedger};
use crate::notify::{Notification, NotificationSink};
use crate::position::{LedgerSnapshot, PositionLedger};

/// lagging subscribers lose events past this many
const EVENT_CAPACITY: usize = 64;

/// orchestrator state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub enum TxStep {
    #[default]
    Idle,
    /// approval sent, waiting for it to become final
    Approving,
    /// primary write being sent for signing
    Confirming,
    /// write accepted, waiting for finality
    Waiting,
    Success { receipt: Receipt },
    Error(TxFailure),
}

impl TxStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStep::Success { .. } | TxStep::Error(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxStep::Idle => "idle",
            TxStep::Approving => "approving",
            TxStep::Confirming => "confirming",
            TxStep::Waiting => "waiting",
            TxStep::Success { .. } => "success",
            TxStep::Error(_) => "error",
        }
    }
}

/// one state transition
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TxEvent {
    /// increases by one per transition
    pub seq: u64,
    /// `None` for standalone approvals and resets
    pub intent: Option<TransactionIntent>,
    pub step: TxStep,
}

/// check an intent against the local bounds
///
/// the order of checks fixes which reason the user sees when several bounds
/// fail at once.
pub fn validate(
    engine: &RiskEngine,
    intent: &TransactionIntent,
    snapshot: &LedgerSnapshot,
) -> Result<(), TxFailure> {
    let amount = intent.amount();
    if amount.is_zero() {
        return Err(TxFailure::validation("amount must be greater than 0"));
    }

    let position = &snapshot.position;
    match intent.action() {
        Action::Supply => {
            if amount > snapshot.balance {
                return Err(TxFailure::validation("amount exceeds wallet balance"));
            }
        }
        Action::Withdraw => {
            if amount > engine.max_withdraw(position)? {
                return Err(TxFailure::validation("amount exceeds max withdrawable limit"));
            }
        }
        Action::Borrow => {
            if amount > engine.max_borrow(position)? {
                return Err(TxFailure::validation("amount exceeds max borrowable limit"));
            }
            if amount > snapshot.pool.available_liquidity() {
                return Err(TxFailure::validation("amount exceeds available pool liquidity"));
            }
        }
        Action::Repay => {
            if amount > position.borrowed {
                return Err(TxFailure::validation("amount exceeds borrowed balance"));
            }
            if amount > snapshot.balance {
                return Err(TxFailure::validation("amount exceeds wallet balance"));
            }
        }
    }
    Ok(())
}

/// releases the in-flight claim; a dropped submit leaves an ambiguous outcome
struct InFlight<'a> {
    orchestrator: &'a TransactionOrchestrator,
    intent: Option<TransactionIntent>,
    done: bool,
}

impl InFlight<'_> {
    fn finish(mut self) {
        self.done = true;
        self.orchestrator.in_flight.store(false, Ordering::Release);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let o = self.orchestrator;
        if !o.state().is_terminal() && o.state() != TxStep::Idle {
            warn!("transaction task dropped mid-flight, outcome unknown");
            o.needs_reconcile.store(true, Ordering::Release);
            o.ledger.invalidate();
            let failure = TxFailure::timeout("stopped waiting for the transaction");
            o.notify(Notification::error(
                format!("{} failed: {}", failure_label(self.intent.as_ref()), failure.reason),
                o.last_handle(),
            ));
            o.publish(self.intent.as_ref(), TxStep::Error(failure));
        }
        o.in_flight.store(false, Ordering::Release);
    }
}

fn failure_label(intent: Option<&TransactionIntent>) -> &'static str {
    intent.map(|i| i.action().as_str()).unwrap_or("approval")
}

pub struct TransactionOrchestrator {
    remote: Arc<dyn RemoteLedger>,
    ledger: PositionLedger,
    sink: Arc<dyn NotificationSink>,
    finality_timeout: Duration,
    in_flight: AtomicBool,
    /// latest write handle issued for the current intent
    handle: Mutex<Option<OperationHandle>>,
    needs_reconcile: AtomicBool,
    seq: AtomicU64,
    step: watch::Sender<TxStep>,
    events: broadcast::Sender<TxEvent>,
}

impl TransactionOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteLedger>,
        ledger: PositionLedger,
        sink: Arc<dyn NotificationSink>,
        finality_timeout: Duration,
    ) -> Self {
        let (step, _) = watch::channel(TxStep::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            remote,
            ledger,
            sink,
            finality_timeout,
            in_flight: AtomicBool::new(false),
            handle: Mutex::new(None),
            needs_reconcile: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            step,
            events,
        }
    }

    pub fn state(&self) -> TxStep {
        self.step.borrow().clone()
    }

    /// watch the current step
    pub fn watch(&self) -> watch::Receiver<TxStep> {
        self.step.subscribe()
    }

    /// every transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TxEvent> {
        self.events.subscribe()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// true after an ambiguous outcome until a fresh position read succeeds
    pub fn needs_reconciliation(&self) -> bool {
        self.needs_reconcile.load(Ordering::Acquire)
    }

    pub fn ledger(&self) -> &PositionLedger {
        &self.ledger
    }

    /// move a terminal state back to idle; no-op while in flight
    pub fn reset(&self) -> bool {
        if self.is_in_flight() || !self.state().is_terminal() {
            return false;
        }
        self.publish(None, TxStep::Idle);
        true
    }

    /// validate and run one intent to finality
    pub async fn submit(&self, intent: TransactionIntent) -> Result<Receipt, SubmitError> {
        let guard = self.claim(Some(intent.clone()))?;
        info!(%intent, "submitting");

        let result = self.run_intent(&intent).await;
        self.finish(guard, Some(&intent), result, |receipt| {
            format!("{} confirmed in block {}", intent, receipt.block_number)
        })
        .await
    }

    /// standalone approval of `amount` for the pool
    pub async fn approve(&self, amount: U256) -> Result<Receipt, SubmitError> {
        let guard = self.claim(None)?;
        info!(%amount, "approving");

        let result = self.run_approve(amount).await;
        self.finish(guard, None, result, |receipt| {
            format!("approval confirmed in block {}", receipt.block_number)
        })
        .await
    }

    fn claim(&self, intent: Option<TransactionIntent>) -> Result<InFlight<'_>, SubmitError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("rejecting submit, another transaction is in flight");
            return Err(SubmitError::Busy);
        }
        if self.state().is_terminal() {
            self.publish(None, TxStep::Idle);
        }
        self.set_handle(None);
        Ok(InFlight {
            orchestrator: self,
            intent,
            done: false,
        })
    }

    async fn finish(
        &self,
        guard: InFlight<'_>,
        intent: Option<&TransactionIntent>,
        result: Result<Receipt, TxFailure>,
        success_message: impl FnOnce(&Receipt) -> String,
    ) -> Result<Receipt, SubmitError> {
        match result {
            Ok(receipt) => {
                let handle = OperationHandle { hash: receipt.hash };
                self.publish(intent, TxStep::Success { receipt: receipt.clone() });
                self.notify(Notification::success(success_message(&receipt), Some(handle)));
                self.ledger.invalidate();
                guard.finish();

                if let Err(e) = self.ledger.refresh().await {
                    warn!(error = %e, "refresh after success failed");
                }
                Ok(receipt)
            }
            Err(failure) => {
                if failure.is_ambiguous() {
                    self.needs_reconcile.store(true, Ordering::Release);
                    self.ledger.invalidate();
                }
                warn!(kind = ?failure.kind, reason = %failure.reason, "transaction failed");
                self.publish(intent, TxStep::Error(failure.clone()));
                self.notify(Notification::error(
                    format!("{} failed: {}", failure_label(intent), failure.reason),
                    self.last_handle(),
                ));
                guard.finish();
                Err(SubmitError::Failed(failure))
            }
        }
    }

    async fn run_intent(&self, intent: &TransactionIntent) -> Result<Receipt, TxFailure> {
        let snapshot = self.snapshot_for_validation().await?;
        validate(self.ledger.engine(), intent, &snapshot)?;

        let action = intent.action();
        if action.needs_allowance() {
            let allowance = match self.ledger.refresh_allowance().await {
                Ok(a) => a,
                Err(e) => {
                    warn!(error = %e, "allowance read failed, using cached value");
                    snapshot.allowance.clone()
                }
            };
            if !allowance.covers(intent.amount()) {
                self.publish(Some(intent), TxStep::Approving);
                self.send_approval(intent.amount()).await?;
            }
        }

        self.publish(Some(intent), TxStep::Confirming);
        let handle = self
            .remote
            .submit(action, intent.amount())
            .await
            .map_err(|e| classify(WriteStage::Sending, &e))?;
        self.set_handle(Some(handle));
        self.notify(Notification::pending(format!("{} sent", intent), Some(handle)));

        self.publish(Some(intent), TxStep::Waiting);
        self.notify(Notification::pending("waiting for confirmation", Some(handle)));
        self.wait(&handle).await
    }

    async fn run_approve(&self, amount: U256) -> Result<Receipt, TxFailure> {
        if amount.is_zero() {
            return Err(TxFailure::validation("amount must be greater than 0"));
        }
        self.publish(None, TxStep::Approving);
        let handle = self
            .remote
            .approve(self.ledger.spender(), amount)
            .await
            .map_err(|e| classify(WriteStage::Sending, &e))?;
        self.set_handle(Some(handle));
        self.notify(Notification::pending("approval sent", Some(handle)));

        self.publish(None, TxStep::Waiting);
        self.notify(Notification::pending("waiting for approval", Some(handle)));
        self.wait(&handle).await
    }

    /// send an approval for exactly `amount` and wait for it
    async fn send_approval(&self, amount: U256) -> Result<Receipt, TxFailure> {
        let handle = self
            .remote
            .approve(self.ledger.spender(), amount)
            .await
            .map_err(|e| classify(WriteStage::Sending, &e))?;
        self.set_handle(Some(handle));
        self.notify(Notification::pending("approval sent", Some(handle)));
        let receipt = self.wait(&handle).await?;
        debug!(block = receipt.block_number, "approval final");
        Ok(receipt)
    }

    async fn wait(&self, handle: &OperationHandle) -> Result<Receipt, TxFailure> {
        let receipt = match tokio::time::timeout(self.finality_timeout, self.remote.await_finality(handle)).await {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(e)) => return Err(classify(WriteStage::Waiting, &e)),
            Err(_) => {
                return Err(TxFailure::timeout(format!(
                    "no finality for {} after {}s",
                    handle,
                    self.finality_timeout.as_secs()
                )))
            }
        };
        if !receipt.success {
            return Err(TxFailure::new(TxErrorKind::RemoteRejected, "transaction reverted"));
        }
        Ok(receipt)
    }

    async fn snapshot_for_validation(&self) -> Result<Arc<LedgerSnapshot>, TxFailure> {
        if self.needs_reconciliation() {
            debug!("reconciling position after ambiguous outcome");
            return match self.ledger.refresh().await {
                Ok(snapshot) => {
                    self.needs_reconcile.store(false, Ordering::Release);
                    Ok(snapshot)
                }
                Err(e) => {
                    warn!(error = %e, "reconciliation refresh failed");
                    Err(TxFailure::validation("position could not be reconciled"))
                }
            };
        }

        match self.ledger.ensure_fresh().await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => match self.ledger.get() {
                Some(snapshot) => {
                    warn!(error = %e, "refresh failed, validating against last good snapshot");
                    Ok(snapshot)
                }
                None => Err(TxFailure::validation("position unavailable")),
            },
        }
    }

    fn publish(&self, intent: Option<&TransactionIntent>, step: TxStep) {
        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        debug!(seq, step = step.name(), "transition");
        self.step.send_replace(step.clone());
        // no subscribers is fine
        let _ = self.events.send(TxEvent {
            seq,
            intent: intent.cloned(),
            step,
        });
    }

    fn set_handle(&self, handle: Option<OperationHandle>) {
        *self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = handle;
    }

    fn last_handle(&self) -> Option<OperationHandle> {
        *self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, notification: Notification) {
        let sink = &self.sink;
        if catch_unwind(AssertUnwindSafe(|| sink.notify(notification))).is_err() {
            warn!("notification sink panicked");
        }
    }
}
