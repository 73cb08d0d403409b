//! state machine behaviour against a scripted ledger

use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use lendpool_client::{
    Action, Notification, NotificationSink, OperationHandle, Outcome, PositionLedger, Receipt,
    RemoteError, RemoteLedger, Stage, SubmitError, TransactionIntent, TransactionOrchestrator,
    TxErrorKind, TxEvent, TxStep,
};
use lendpool_core::{PoolSnapshot, ProtocolParams, RiskEngine, UserPosition};
use tokio::sync::{broadcast, Notify};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    ReadPool,
    ReadPosition,
    ReadAllowance,
    ReadBalance,
    Approve(U256),
    Submit(Action, U256),
    AwaitFinality,
}

#[derive(Default)]
struct Script {
    pool: PoolSnapshot,
    position: UserPosition,
    allowance: U256,
    balance: U256,
    fail_reads: bool,
    fail_allowance_reads: bool,
    approve_error: Option<RemoteError>,
    submit_error: Option<RemoteError>,
    finality_error: Option<RemoteError>,
    revert_on_inclusion: bool,
    stall: bool,
    gate: Option<Arc<Notify>>,
}

#[derive(Default)]
struct ScriptedLedger {
    script: Mutex<Script>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedLedger {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn writes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Approve(_) | Call::Submit(..)))
            .count()
    }

    fn edit(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.script.lock().unwrap())
    }

    fn read_error(&self) -> Option<RemoteError> {
        self.script
            .lock()
            .unwrap()
            .fail_reads
            .then(|| RemoteError::Transport("connection refused".into()))
    }
}

#[async_trait]
impl RemoteLedger for ScriptedLedger {
    async fn read_pool(&self) -> Result<PoolSnapshot, RemoteError> {
        self.record(Call::ReadPool);
        match self.read_error() {
            Some(e) => Err(e),
            None => Ok(self.script.lock().unwrap().pool.clone()),
        }
    }

    async fn read_position(&self, _owner: Address) -> Result<UserPosition, RemoteError> {
        self.record(Call::ReadPosition);
        match self.read_error() {
            Some(e) => Err(e),
            None => Ok(self.script.lock().unwrap().position.clone()),
        }
    }

    async fn read_allowance(&self, _owner: Address, _spender: Address) -> Result<U256, RemoteError> {
        self.record(Call::ReadAllowance);
        if self.script.lock().unwrap().fail_allowance_reads {
            return Err(RemoteError::Transport("allowance read timed out".into()));
        }
        match self.read_error() {
            Some(e) => Err(e),
            None => Ok(self.script.lock().unwrap().allowance),
        }
    }

    async fn read_balance(&self, _owner: Address) -> Result<U256, RemoteError> {
        self.record(Call::ReadBalance);
        match self.read_error() {
            Some(e) => Err(e),
            None => Ok(self.script.lock().unwrap().balance),
        }
    }

    async fn approve(&self, _spender: Address, amount: U256) -> Result<OperationHandle, RemoteError> {
        self.record(Call::Approve(amount));
        if let Some(e) = self.script.lock().unwrap().approve_error.take() {
            return Err(e);
        }
        self.script.lock().unwrap().allowance = amount;
        Ok(OperationHandle { hash: B256::repeat_byte(0xa1) })
    }

    async fn submit(&self, action: Action, amount: U256) -> Result<OperationHandle, RemoteError> {
        self.record(Call::Submit(action, amount));
        if let Some(e) = self.script.lock().unwrap().submit_error.take() {
            return Err(e);
        }
        Ok(OperationHandle { hash: B256::repeat_byte(0xb2) })
    }

    async fn await_finality(&self, handle: &OperationHandle) -> Result<Receipt, RemoteError> {
        self.record(Call::AwaitFinality);
        let (gate, stall, error, revert) = {
            let mut s = self.script.lock().unwrap();
            (s.gate.clone(), s.stall, s.finality_error.take(), s.revert_on_inclusion)
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if stall {
            std::future::pending::<()>().await;
        }
        if let Some(e) = error {
            return Err(e);
        }
        Ok(Receipt {
            hash: handle.hash,
            block_number: 7,
            success: !revert,
        })
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<Notification>>);

impl RecordingSink {
    fn stages(&self) -> Vec<Stage> {
        self.0.lock().unwrap().iter().map(|n| n.stage).collect()
    }

    fn last(&self) -> Option<Notification> {
        self.0.lock().unwrap().last().cloned()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: Notification) {
        self.0.lock().unwrap().push(notification);
    }
}

struct PanickingSink;

impl NotificationSink for PanickingSink {
    fn notify(&self, _notification: Notification) {
        panic!("toast renderer crashed");
    }
}

fn u(x: u64) -> U256 {
    U256::from(x)
}

/// 1000 supplied, 200 borrowed, 500 in the wallet, nothing approved
fn funded() -> Arc<ScriptedLedger> {
    let ledger = ScriptedLedger::default();
    ledger.edit(|s| {
        s.pool = PoolSnapshot::from_totals(u(10_000), u(2_000));
        s.position = UserPosition {
            supplied: u(1000),
            borrowed: u(200),
            collateral_value: u(1000),
            health_factor: u(500),
        };
        s.balance = u(500);
    });
    Arc::new(ledger)
}

fn orchestrator(
    remote: Arc<ScriptedLedger>,
    sink: Arc<dyn NotificationSink>,
) -> Arc<TransactionOrchestrator> {
    let ledger = PositionLedger::new(
        remote.clone(),
        RiskEngine::new(ProtocolParams::default()),
        Address::repeat_byte(1),
        Address::repeat_byte(2),
        Duration::from_secs(10),
        Duration::from_secs(5),
    );
    Arc::new(TransactionOrchestrator::new(
        remote,
        ledger,
        sink,
        Duration::from_secs(120),
    ))
}

fn drain(rx: &mut broadcast::Receiver<TxEvent>) -> Vec<TxStep> {
    let mut steps = Vec::new();
    while let Ok(event) = rx.try_recv() {
        steps.push(event.step);
    }
    steps
}

fn names(steps: &[TxStep]) -> Vec<&'static str> {
    steps.iter().map(TxStep::name).collect()
}

fn intent(action: Action, amount: u64) -> TransactionIntent {
    TransactionIntent::new(action, u(amount), 0)
}

#[tokio::test]
async fn test_supply_without_allowance_approves_first() {
    let remote = funded();
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(remote.clone(), sink.clone());
    let mut events = orch.subscribe();

    let receipt = orch.submit(intent(Action::Supply, 100)).await.unwrap();
    assert!(receipt.success);

    assert_eq!(names(&drain(&mut events)), ["approving", "confirming", "waiting", "success"]);

    let calls = remote.calls();
    let approve = calls.iter().position(|c| *c == Call::Approve(u(100))).unwrap();
    let submit = calls.iter().position(|c| *c == Call::Submit(Action::Supply, u(100))).unwrap();
    assert!(approve < submit);
    assert_eq!(remote.writes(), 2);

    assert_eq!(sink.stages().last(), Some(&Stage::Success));
    assert!(sink.stages().iter().filter(|s| **s == Stage::Pending).count() >= 3);
}

#[tokio::test]
async fn test_supply_with_allowance_skips_approval() {
    let remote = funded();
    remote.edit(|s| s.allowance = u(1_000));
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));
    let mut events = orch.subscribe();

    orch.submit(intent(Action::Supply, 100)).await.unwrap();
    assert_eq!(names(&drain(&mut events)), ["confirming", "waiting", "success"]);
    assert_eq!(remote.writes(), 1);
}

#[tokio::test]
async fn test_withdraw_never_approves() {
    let remote = funded();
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));
    let mut events = orch.subscribe();

    orch.submit(intent(Action::Withdraw, 100)).await.unwrap();

    let steps = drain(&mut events);
    assert!(!steps.contains(&TxStep::Approving));
    assert!(!remote.calls().iter().any(|c| matches!(c, Call::Approve(_))));
    assert_eq!(remote.writes(), 1);
}

#[tokio::test]
async fn test_borrow_over_max_fails_without_remote_calls() {
    let remote = funded();
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));
    orch.ledger().refresh().await.unwrap();
    let before = remote.calls().len();
    let mut events = orch.subscribe();

    // capacity 750, 200 already borrowed
    let err = orch.submit(intent(Action::Borrow, 551)).await.unwrap_err();

    assert_eq!(err.kind(), Some(TxErrorKind::ValidationFailed));
    assert_eq!(remote.calls().len(), before);
    assert_eq!(names(&drain(&mut events)), ["error"]);
    match orch.state() {
        TxStep::Error(f) => {
            assert_eq!(f.reason, "amount exceeds max borrowable limit");
            assert_eq!(f.outcome, Outcome::NotApplied);
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert!(!orch.is_in_flight());
}

#[tokio::test]
async fn test_zero_amount_rejected() {
    let remote = funded();
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));
    let err = orch.submit(intent(Action::Repay, 0)).await.unwrap_err();
    assert_eq!(err.kind(), Some(TxErrorKind::ValidationFailed));
    assert_eq!(remote.writes(), 0);
}

#[tokio::test]
async fn test_second_submit_while_in_flight_is_busy() {
    let remote = funded();
    let gate = Arc::new(Notify::new());
    remote.edit(|s| s.gate = Some(gate.clone()));
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));
    let mut state = orch.watch();

    let first = tokio::spawn({
        let orch = orch.clone();
        async move { orch.submit(intent(Action::Borrow, 100)).await }
    });
    state.wait_for(|s| *s == TxStep::Waiting).await.unwrap();

    let second = orch.submit(intent(Action::Borrow, 100)).await;
    assert_eq!(second.unwrap_err(), SubmitError::Busy);
    assert_eq!(orch.state(), TxStep::Waiting);
    // reset is ignored mid-flight
    assert!(!orch.reset());

    gate.notify_one();
    first.await.unwrap().unwrap();
    assert_eq!(remote.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_ambiguous_and_forces_reconciliation() {
    let remote = funded();
    remote.edit(|s| s.stall = true);
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(remote.clone(), sink.clone());

    let err = orch.submit(intent(Action::Borrow, 100)).await.unwrap_err();
    let SubmitError::Failed(failure) = err else {
        panic!("expected a failure");
    };
    assert_eq!(failure.kind, TxErrorKind::Timeout);
    assert_eq!(failure.outcome, Outcome::Unknown);
    assert!(orch.needs_reconciliation());
    assert!(orch.ledger().is_stale());
    assert_eq!(sink.last().unwrap().stage, Stage::Error);

    // the position cannot be re-read, so nothing may be sent
    remote.edit(|s| {
        s.stall = false;
        s.fail_reads = true;
    });
    let writes = remote.writes();
    let err = orch.submit(intent(Action::Borrow, 100)).await.unwrap_err();
    let SubmitError::Failed(failure) = err else {
        panic!("expected a failure");
    };
    assert_eq!(failure.kind, TxErrorKind::ValidationFailed);
    assert_eq!(failure.reason, "position could not be reconciled");
    assert_eq!(remote.writes(), writes);

    // once the read works the intent goes through
    remote.edit(|s| s.fail_reads = false);
    orch.submit(intent(Action::Borrow, 100)).await.unwrap();
    assert!(!orch.needs_reconciliation());
}

#[tokio::test]
async fn test_user_rejection() {
    let remote = funded();
    remote.edit(|s| {
        s.submit_error = Some(RemoteError::Rpc {
            code: 4001,
            message: "User rejected the request.".into(),
        })
    });
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(remote.clone(), sink.clone());

    let err = orch.submit(intent(Action::Borrow, 10)).await.unwrap_err();
    assert_eq!(err.kind(), Some(TxErrorKind::UserRejected));
    assert!(!remote.calls().contains(&Call::AwaitFinality));

    let note = sink.last().unwrap();
    assert_eq!(note.stage, Stage::Error);
    assert_eq!(note.message, "borrow failed: transaction rejected by user");

    assert!(orch.reset());
    assert_eq!(orch.state(), TxStep::Idle);
    assert!(!orch.reset());
}

#[tokio::test]
async fn test_reverts_are_classified() {
    let remote = funded();
    remote.edit(|s| {
        s.allowance = u(1_000);
        s.submit_error = Some(RemoteError::Reverted {
            reason: "execution reverted: ERC20InsufficientAllowance".into(),
        });
    });
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));

    let err = orch.submit(intent(Action::Repay, 50)).await.unwrap_err();
    assert_eq!(err.kind(), Some(TxErrorKind::AllowanceInsufficient));

    remote.edit(|s| s.revert_on_inclusion = true);
    let err = orch.submit(intent(Action::Repay, 50)).await.unwrap_err();
    let SubmitError::Failed(failure) = err else {
        panic!("expected a failure");
    };
    assert_eq!(failure.kind, TxErrorKind::RemoteRejected);
    assert_eq!(failure.outcome, Outcome::NotApplied);
    assert!(!orch.needs_reconciliation());
}

#[tokio::test]
async fn test_lost_transport_while_waiting_is_unknown() {
    let remote = funded();
    remote.edit(|s| s.finality_error = Some(RemoteError::Transport("connection reset".into())));
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(remote.clone(), sink.clone());

    let err = orch.submit(intent(Action::Borrow, 10)).await.unwrap_err();
    let SubmitError::Failed(failure) = err else {
        panic!("expected a failure");
    };
    assert_eq!(failure.kind, TxErrorKind::Timeout);
    assert!(failure.is_ambiguous());
    assert!(orch.needs_reconciliation());

    // the user can look the write up by its handle
    let note = sink.last().unwrap();
    assert_eq!(note.stage, Stage::Error);
    assert_eq!(note.handle, Some(OperationHandle { hash: B256::repeat_byte(0xb2) }));
}

#[tokio::test]
async fn test_unanswered_send_is_unknown() {
    let remote = funded();
    remote.edit(|s| s.submit_error = Some(RemoteError::Transport("operation timed out".into())));
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(remote.clone(), sink.clone());

    let err = orch.submit(intent(Action::Withdraw, 10)).await.unwrap_err();
    let SubmitError::Failed(failure) = err else {
        panic!("expected a failure");
    };
    assert_eq!(failure.kind, TxErrorKind::Timeout);
    assert_eq!(failure.outcome, Outcome::Unknown);
    assert!(orch.needs_reconciliation());
    assert_eq!(sink.last().unwrap().handle, None);
}

#[tokio::test]
async fn test_unreachable_send_is_not_applied() {
    let remote = funded();
    remote.edit(|s| s.submit_error = Some(RemoteError::Unreachable("connection refused".into())));
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));

    let err = orch.submit(intent(Action::Withdraw, 10)).await.unwrap_err();
    let SubmitError::Failed(failure) = err else {
        panic!("expected a failure");
    };
    assert_eq!(failure.kind, TxErrorKind::RemoteRejected);
    assert_eq!(failure.outcome, Outcome::NotApplied);
    assert!(!orch.needs_reconciliation());
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_submit_reports_unknown_outcome() {
    let remote = funded();
    remote.edit(|s| s.stall = true);
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(remote.clone(), sink.clone());

    let abandoned = tokio::time::timeout(
        Duration::from_secs(5),
        orch.submit(intent(Action::Borrow, 10)),
    )
    .await;
    assert!(abandoned.is_err());

    match orch.state() {
        TxStep::Error(f) => {
            assert_eq!(f.kind, TxErrorKind::Timeout);
            assert_eq!(f.outcome, Outcome::Unknown);
        }
        other => panic!("unexpected state {:?}", other),
    }
    assert!(!orch.is_in_flight());
    assert!(orch.needs_reconciliation());
    assert!(orch.ledger().is_stale());

    let note = sink.last().unwrap();
    assert_eq!(note.stage, Stage::Error);
    assert_eq!(note.message, "borrow failed: stopped waiting for the transaction");
    assert_eq!(note.handle, Some(OperationHandle { hash: B256::repeat_byte(0xb2) }));
}

#[tokio::test]
async fn test_rejected_approval_stops_before_submit() {
    let remote = funded();
    remote.edit(|s| {
        s.approve_error = Some(RemoteError::Rpc {
            code: 4001,
            message: "User rejected the request.".into(),
        })
    });
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(remote.clone(), sink.clone());
    let mut events = orch.subscribe();

    let err = orch.submit(intent(Action::Supply, 100)).await.unwrap_err();
    assert_eq!(err.kind(), Some(TxErrorKind::UserRejected));
    assert_eq!(names(&drain(&mut events)), ["approving", "error"]);
    assert!(!remote.calls().iter().any(|c| matches!(c, Call::Submit(..))));
    assert_eq!(sink.last().unwrap().message, "supply failed: transaction rejected by user");
}

#[tokio::test]
async fn test_reverted_approval_stops_before_submit() {
    let remote = funded();
    remote.edit(|s| s.revert_on_inclusion = true);
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));

    let err = orch.submit(intent(Action::Repay, 50)).await.unwrap_err();
    let SubmitError::Failed(failure) = err else {
        panic!("expected a failure");
    };
    assert_eq!(failure.kind, TxErrorKind::RemoteRejected);
    assert_eq!(failure.reason, "transaction reverted");
    assert!(remote.calls().contains(&Call::Approve(u(50))));
    assert!(!remote.calls().iter().any(|c| matches!(c, Call::Submit(..))));
    assert!(matches!(orch.state(), TxStep::Error(_)));
}

#[tokio::test]
async fn test_failed_allowance_read_uses_cached_allowance() {
    let remote = funded();
    remote.edit(|s| s.allowance = u(1_000));
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));
    orch.ledger().refresh().await.unwrap();

    remote.edit(|s| s.fail_allowance_reads = true);
    orch.submit(intent(Action::Supply, 100)).await.unwrap();

    assert!(!remote.calls().iter().any(|c| matches!(c, Call::Approve(_))));
    assert!(remote.calls().contains(&Call::Submit(Action::Supply, u(100))));
}

#[tokio::test]
async fn test_standalone_approve() {
    let remote = funded();
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));
    let mut events = orch.subscribe();

    orch.approve(u(250)).await.unwrap();

    let events_seen = drain(&mut events);
    assert_eq!(names(&events_seen), ["approving", "waiting", "success"]);
    assert_eq!(remote.calls().first(), Some(&Call::Approve(u(250))));
}

#[tokio::test]
async fn test_events_are_sequenced() {
    let remote = funded();
    let orch = orchestrator(remote, Arc::new(RecordingSink::default()));
    let mut events = orch.subscribe();

    orch.submit(intent(Action::Borrow, 10)).await.unwrap();
    orch.submit(intent(Action::Borrow, 10)).await.unwrap();

    let mut seqs = Vec::new();
    while let Ok(event) = events.try_recv() {
        if event.step != TxStep::Idle {
            assert_eq!(event.intent.as_ref().map(|i| i.action()), Some(Action::Borrow));
        }
        seqs.push(event.seq);
    }
    // second submit implicitly resets the terminal state
    assert_eq!(seqs.len(), 7);
    assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
}

#[tokio::test]
async fn test_sink_panic_does_not_break_the_flow() {
    let remote = funded();
    let orch = orchestrator(remote, Arc::new(PanickingSink));

    let receipt = orch.submit(intent(Action::Borrow, 10)).await.unwrap();
    assert!(receipt.success);
    assert!(matches!(orch.state(), TxStep::Success { .. }));
}

#[tokio::test]
async fn test_success_invalidates_and_refreshes() {
    let remote = funded();
    let orch = orchestrator(remote.clone(), Arc::new(RecordingSink::default()));
    orch.ledger().refresh().await.unwrap();
    let reads_before = remote
        .calls()
        .iter()
        .filter(|c| **c == Call::ReadPosition)
        .count();

    orch.submit(intent(Action::Borrow, 10)).await.unwrap();

    let reads_after = remote
        .calls()
        .iter()
        .filter(|c| **c == Call::ReadPosition)
        .count();
    assert_eq!(reads_after, reads_before + 1);
    assert!(!orch.ledger().is_stale());
}
