//! error types and failure classification

use lendpool_core::{MathError, ParamsError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// errors a remote ledger reports
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// json-rpc error object, including wallet/signer errors
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// the ledger executed and reverted the call
    #[error("execution reverted: {reason}")]
    Reverted { reason: String },

    /// the request never reached the ledger (connection refused, dns)
    #[error("ledger unreachable: {0}")]
    Unreachable(String),

    /// the request may have reached the ledger but no usable answer came back
    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// json-rpc / eip-1193 code for a request the user declined
pub const USER_REJECTED_CODE: i64 = 4001;

/// longest remote message shown verbatim
const MAX_REASON_LEN: usize = 200;

const OPAQUE_REASON: &str = "transaction failed; see logs for details";

/// failure taxonomy for a transaction intent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxErrorKind {
    /// a local bound check failed; nothing was sent
    ValidationFailed,
    /// the signer declined
    UserRejected,
    /// the cached allowance raced a concurrent spend; re-approve
    AllowanceInsufficient,
    /// the ledger reverted the write; funds and state unchanged
    RemoteRejected,
    /// the outcome was never observed; the write may or may not apply
    Timeout,
    /// bad parameters or a programming error
    ArithmeticOverflow,
}

impl std::fmt::Display for TxErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TxErrorKind::ValidationFailed => "validation failed",
            TxErrorKind::UserRejected => "rejected by user",
            TxErrorKind::AllowanceInsufficient => "insufficient allowance",
            TxErrorKind::RemoteRejected => "rejected by ledger",
            TxErrorKind::Timeout => "timed out",
            TxErrorKind::ArithmeticOverflow => "arithmetic overflow",
        };
        f.write_str(s)
    }
}

/// what is known about the ledger state after a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// the write did not take effect
    NotApplied,
    /// the write may or may not have taken effect; reconcile before retrying
    Unknown,
}

/// a classified failure, stored in the orchestrator's error state
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {reason}")]
pub struct TxFailure {
    pub kind: TxErrorKind,
    pub reason: String,
    pub outcome: Outcome,
}

impl TxFailure {
    pub fn new(kind: TxErrorKind, reason: impl Into<String>) -> Self {
        let outcome = match kind {
            TxErrorKind::Timeout => Outcome::Unknown,
            _ => Outcome::NotApplied,
        };
        Self {
            kind,
            reason: reason.into(),
            outcome,
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::new(TxErrorKind::ValidationFailed, reason)
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::new(TxErrorKind::Timeout, reason)
    }

    pub fn is_ambiguous(&self) -> bool {
        self.outcome == Outcome::Unknown
    }
}

impl From<MathError> for TxFailure {
    fn from(e: MathError) -> Self {
        TxFailure::new(TxErrorKind::ArithmeticOverflow, e.to_string())
    }
}

/// where a write was when the ledger failed it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStage {
    /// sending the write; no handle was issued
    Sending,
    /// waiting for finality of an issued handle
    Waiting,
}

/// map a remote error to the failure taxonomy
pub fn classify(stage: WriteStage, err: &RemoteError) -> TxFailure {
    match err {
        RemoteError::Rpc { code, message } => {
            if *code == USER_REJECTED_CODE || is_user_rejection(message) {
                TxFailure::new(TxErrorKind::UserRejected, "transaction rejected by user")
            } else if is_allowance_failure(message) {
                TxFailure::new(TxErrorKind::AllowanceInsufficient, human_reason(message))
            } else {
                TxFailure::new(TxErrorKind::RemoteRejected, human_reason(message))
            }
        }
        RemoteError::Reverted { reason } => {
            if is_allowance_failure(reason) {
                TxFailure::new(TxErrorKind::AllowanceInsufficient, human_reason(reason))
            } else {
                TxFailure::new(TxErrorKind::RemoteRejected, human_reason(reason))
            }
        }
        RemoteError::Unreachable(msg) => match stage {
            WriteStage::Sending => TxFailure::new(
                TxErrorKind::RemoteRejected,
                format!("ledger unreachable: {}", human_reason(msg)),
            ),
            WriteStage::Waiting => TxFailure::timeout(format!(
                "lost track of submitted transaction: {}",
                human_reason(msg)
            )),
        },
        // the ledger may have accepted the write before the answer was lost
        RemoteError::Transport(msg) | RemoteError::Malformed(msg) => match stage {
            WriteStage::Sending => TxFailure::timeout(format!(
                "no answer after sending transaction: {}",
                human_reason(msg)
            )),
            WriteStage::Waiting => TxFailure::timeout(format!(
                "lost track of submitted transaction: {}",
                human_reason(msg)
            )),
        },
    }
}

fn is_user_rejection(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("action_rejected") || m.contains("user rejected") || m.contains("user denied")
}

fn is_allowance_failure(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("insufficient allowance") || m.contains("erc20insufficientallowance")
}

/// strip revert boilerplate and hide payloads nobody should read
pub fn human_reason(message: &str) -> String {
    const PREFIXES: [&str; 2] = [
        "execution reverted: ",
        "VM Exception while processing transaction: ",
    ];
    let trimmed = message.trim();
    let stripped = PREFIXES
        .iter()
        .find_map(|p| trimmed.find(p).map(|i| &trimmed[i + p.len()..]))
        .unwrap_or(trimmed);

    if stripped.is_empty() {
        return "unknown error occurred".into();
    }
    if stripped.len() > MAX_REASON_LEN || stripped.contains('{') {
        return OPAQUE_REASON.into();
    }
    stripped.to_string()
}

/// errors from the client outside a transaction intent
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("remote read failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("math error: {0}")]
    Math(#[from] MathError),

    #[error("invalid protocol params: {0}")]
    Params(#[from] ParamsError),

    #[error("invalid config: {0}")]
    Config(String),

    #[error("no snapshot available for {0}")]
    NoSnapshot(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// why `submit` or `approve` did not run to success
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// another intent is in flight; nothing was queued
    #[error("another transaction is in flight")]
    Busy,

    #[error(transparent)]
    Failed(#[from] TxFailure),
}

impl SubmitError {
    pub fn kind(&self) -> Option<TxErrorKind> {
        match self {
            SubmitError::Busy => None,
            SubmitError::Failed(f) => Some(f.kind),
        }
    }
}
