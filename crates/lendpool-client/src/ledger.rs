//! the remote ledger contract
//!
//! everything the client knows about the pool comes through this trait. reads
//! are eventually consistent snapshots; writes are irrevocable once the
//! network accepts them and only report their fate through `await_finality`.

use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use lendpool_core::{PoolSnapshot, UserPosition};
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::intent::Action;

/// handle to a write the network has accepted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHandle {
    pub hash: B256,
}

impl std::fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

/// finality record for a write
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub hash: B256,
    pub block_number: u64,
    /// false when the write was included but reverted
    pub success: bool,
}

#[async_trait]
pub trait RemoteLedger: Send + Sync {
    async fn read_pool(&self) -> Result<PoolSnapshot, RemoteError>;

    async fn read_position(&self, owner: Address) -> Result<UserPosition, RemoteError>;

    async fn read_allowance(&self, owner: Address, spender: Address) -> Result<U256, RemoteError>;

    async fn read_balance(&self, owner: Address) -> Result<U256, RemoteError>;

    /// let `spender` pull up to `amount` from the signer
    async fn approve(&self, spender: Address, amount: U256) -> Result<OperationHandle, RemoteError>;

    /// send a pool write signed by the session's account
    async fn submit(&self, action: Action, amount: U256) -> Result<OperationHandle, RemoteError>;

    /// wait until `handle` is final
    async fn await_finality(&self, handle: &OperationHandle) -> Result<Receipt, RemoteError>;
}
