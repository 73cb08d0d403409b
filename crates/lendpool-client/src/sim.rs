//! in-process pool ledger
//!
//! a [`SimulatedChain`] holds the token and pool books for every account and
//! re-validates each write with the same risk engine the client uses, the way
//! the real pool contract would. writes sit in a mempool until someone waits
//! for finality, which mines one block after `block_time`.
//!
//! collateral is priced 1:1 with the supplied token, so `collateral_value`
//! always equals `supplied`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy_primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;
use lendpool_core::{HealthFactor, PoolSnapshot, RiskEngine, UserPosition};
use tracing::{debug, info};

use crate::error::{RemoteError, USER_REJECTED_CODE};
use crate::intent::Action;
use crate::ledger::{OperationHandle, Receipt, RemoteLedger};

/// faults to inject into the next operations
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// the signer declines the next write
    pub reject_next_write: bool,
    /// the next write reverts when sent, with this reason
    pub revert_next_write: Option<String>,
    /// the next write is included but reverted, so its receipt fails
    pub fail_next_inclusion: bool,
    /// writes are applied but finality is never reported
    pub stall_finality: bool,
    /// every read fails with a transport error
    pub fail_reads: bool,
}

/// remote calls seen by the chain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallLog {
    pub reads: usize,
    pub approvals: usize,
    pub submits: usize,
}

impl CallLog {
    pub fn writes(&self) -> usize {
        self.approvals + self.submits
    }
}

#[derive(Clone, Debug)]
enum Op {
    Approve { spender: Address, amount: U256 },
    Pool { action: Action, amount: U256 },
}

#[derive(Debug)]
struct PendingTx {
    hash: B256,
    from: Address,
    op: Op,
    fail: bool,
}

#[derive(Debug, Default)]
struct Books {
    block: u64,
    nonce: u64,
    balances: HashMap<Address, U256>,
    allowances: HashMap<(Address, Address), U256>,
    supplied: HashMap<Address, U256>,
    borrowed: HashMap<Address, U256>,
    total_supply: U256,
    total_borrow: U256,
    mempool: Vec<PendingTx>,
    receipts: HashMap<B256, Receipt>,
    faults: FaultPlan,
    calls: CallLog,
}

impl Books {
    fn get(map: &HashMap<Address, U256>, who: Address) -> U256 {
        map.get(&who).copied().unwrap_or_default()
    }

    fn position(&self, engine: &RiskEngine, owner: Address) -> Result<UserPosition, RemoteError> {
        let supplied = Self::get(&self.supplied, owner);
        let mut position = UserPosition {
            supplied,
            borrowed: Self::get(&self.borrowed, owner),
            collateral_value: supplied,
            health_factor: U256::ZERO,
        };
        position.health_factor = match engine.health_factor(&position) {
            Ok(HealthFactor::Finite(v)) => v,
            Ok(HealthFactor::Infinite) => U256::MAX,
            Err(e) => return Err(RemoteError::Malformed(e.to_string())),
        };
        Ok(position)
    }

    fn liquidity(&self) -> U256 {
        self.total_supply.saturating_sub(self.total_borrow)
    }

    fn allowance(&self, owner: Address, spender: Address) -> U256 {
        self.allowances.get(&(owner, spender)).copied().unwrap_or_default()
    }

    /// what the pool contract would revert with, if anything
    fn check(&self, engine: &RiskEngine, pool: Address, from: Address, op: &Op) -> Result<(), String> {
        let Op::Pool { action, amount } = op else {
            return Ok(());
        };
        let amount = *amount;
        if amount.is_zero() {
            return Err("Amount must be greater than 0".into());
        }
        let position = self.position(engine, from).map_err(|e| e.to_string())?;
        let balance = Self::get(&self.balances, from);
        match action {
            Action::Supply => {
                if balance < amount {
                    return Err("Insufficient balance".into());
                }
                if self.allowance(from, pool) < amount {
                    return Err("ERC20InsufficientAllowance".into());
                }
            }
            Action::Withdraw => {
                if amount > position.supplied {
                    return Err("Insufficient supplied balance".into());
                }
                if amount > self.liquidity() {
                    return Err("Insufficient liquidity".into());
                }
                let health = engine
                    .health_after_withdraw(&position, amount)
                    .map_err(|e| e.to_string())?;
                if !health.at_least(engine.params().liquidation_threshold()) {
                    return Err("Insufficient collateral".into());
                }
            }
            Action::Borrow => {
                if amount > engine.max_borrow(&position).map_err(|e| e.to_string())? {
                    return Err("Insufficient collateral".into());
                }
                if amount > self.liquidity() {
                    return Err("Insufficient liquidity".into());
                }
            }
            Action::Repay => {
                if amount > position.borrowed {
                    return Err("Repay exceeds debt".into());
                }
                if balance < amount {
                    return Err("Insufficient balance".into());
                }
                if self.allowance(from, pool) < amount {
                    return Err("ERC20InsufficientAllowance".into());
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, pool: Address, from: Address, op: &Op) {
        match *op {
            Op::Approve { spender, amount } => {
                self.allowances.insert((from, spender), amount);
            }
            Op::Pool { action, amount } => {
                let balance = self.balances.entry(from).or_default();
                match action {
                    Action::Supply => {
                        *balance -= amount;
                        *self.supplied.entry(from).or_default() += amount;
                        self.total_supply += amount;
                    }
                    Action::Withdraw => {
                        *balance += amount;
                        *self.supplied.entry(from).or_default() -= amount;
                        self.total_supply -= amount;
                    }
                    Action::Borrow => {
                        *balance += amount;
                        *self.borrowed.entry(from).or_default() += amount;
                        self.total_borrow += amount;
                    }
                    Action::Repay => {
                        *balance -= amount;
                        *self.borrowed.entry(from).or_default() -= amount;
                        self.total_borrow -= amount;
                    }
                }
                if action.needs_allowance() {
                    let allowance = self.allowances.entry((from, pool)).or_default();
                    *allowance = allowance.saturating_sub(amount);
                }
            }
        }
    }
}

/// shared books for every simulated account
pub struct SimulatedChain {
    engine: RiskEngine,
    pool: Address,
    block_time: Duration,
    books: Mutex<Books>,
}

impl SimulatedChain {
    pub fn new(engine: RiskEngine, pool: Address) -> Self {
        Self {
            engine,
            pool,
            block_time: Duration::from_secs(2),
            books: Mutex::new(Books::default()),
        }
    }

    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Books> {
        self.books.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pool_address(&self) -> Address {
        self.pool
    }

    /// a signer for `account`
    pub fn ledger(self: &Arc<Self>, account: Address) -> SimulatedLedger {
        SimulatedLedger {
            chain: self.clone(),
            account,
        }
    }

    /// credit `amount` of the underlying token to `owner`
    pub fn mint(&self, owner: Address, amount: U256) {
        *self.lock().balances.entry(owner).or_default() += amount;
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        self.lock().faults = plan;
    }

    pub fn calls(&self) -> CallLog {
        self.lock().calls
    }

    pub fn block_number(&self) -> u64 {
        self.lock().block
    }

    pub fn balance_of(&self, owner: Address) -> U256 {
        Books::get(&self.lock().balances, owner)
    }

    pub fn allowance(&self, owner: Address) -> U256 {
        self.lock().allowance(owner, self.pool)
    }

    pub fn position(&self, owner: Address) -> Result<UserPosition, RemoteError> {
        self.lock().position(&self.engine, owner)
    }

    pub fn pool_snapshot(&self) -> Result<PoolSnapshot, RemoteError> {
        let books = self.lock();
        let totals = PoolSnapshot::from_totals(books.total_supply, books.total_borrow);
        self.engine
            .derive(&totals)
            .map_err(|e| RemoteError::Malformed(e.to_string()))
    }

    /// include every pending write in a new block
    pub fn mine(&self) -> u64 {
        let mut books = self.lock();
        books.block += 1;
        let block = books.block;
        let pending = std::mem::take(&mut books.mempool);
        for tx in pending {
            let success = !tx.fail && books.check(&self.engine, self.pool, tx.from, &tx.op).is_ok();
            if success {
                books.apply(self.pool, tx.from, &tx.op);
            }
            debug!(tx = %tx.hash, block, success, "mined");
            books.receipts.insert(
                tx.hash,
                Receipt {
                    hash: tx.hash,
                    block_number: block,
                    success,
                },
            );
        }
        block
    }

    fn read(&self) -> Result<MutexGuard<'_, Books>, RemoteError> {
        let mut books = self.lock();
        books.calls.reads += 1;
        if books.faults.fail_reads {
            return Err(RemoteError::Transport("simulated node unavailable".into()));
        }
        Ok(books)
    }

    fn send(&self, from: Address, op: Op) -> Result<OperationHandle, RemoteError> {
        let mut books = self.lock();
        match op {
            Op::Approve { .. } => books.calls.approvals += 1,
            Op::Pool { .. } => books.calls.submits += 1,
        }

        if std::mem::take(&mut books.faults.reject_next_write) {
            return Err(RemoteError::Rpc {
                code: USER_REJECTED_CODE,
                message: "User rejected the request.".into(),
            });
        }
        if let Some(reason) = books.faults.revert_next_write.take() {
            return Err(RemoteError::Reverted {
                reason: format!("execution reverted: {}", reason),
            });
        }
        // gas estimation runs the write against current state
        books
            .check(&self.engine, self.pool, from, &op)
            .map_err(|reason| RemoteError::Reverted {
                reason: format!("execution reverted: {}", reason),
            })?;

        books.nonce += 1;
        let mut preimage = from.to_vec();
        preimage.extend_from_slice(&books.nonce.to_be_bytes());
        let hash = keccak256(&preimage);
        let fail = std::mem::take(&mut books.faults.fail_next_inclusion);
        info!(tx = %hash, ?op, "write accepted");
        books.mempool.push(PendingTx { hash, from, op, fail });
        Ok(OperationHandle { hash })
    }

    async fn finality(&self, handle: &OperationHandle) -> Result<Receipt, RemoteError> {
        let known = self.lock().receipts.get(&handle.hash).cloned();
        if let Some(receipt) = known {
            return Ok(receipt);
        }
        tokio::time::sleep(self.block_time).await;
        self.mine();

        let (receipt, stalled) = {
            let books = self.lock();
            (books.receipts.get(&handle.hash).cloned(), books.faults.stall_finality)
        };
        if stalled {
            debug!(tx = %handle, "finality stalled");
            std::future::pending::<()>().await;
        }
        receipt.ok_or_else(|| RemoteError::Malformed(format!("unknown transaction {}", handle)))
    }
}

/// [`RemoteLedger`] view of a simulated chain, signing as one account
#[derive(Clone)]
pub struct SimulatedLedger {
    chain: Arc<SimulatedChain>,
    account: Address,
}

impl SimulatedLedger {
    pub fn chain(&self) -> &Arc<SimulatedChain> {
        &self.chain
    }

    pub fn account(&self) -> Address {
        self.account
    }
}

#[async_trait]
impl RemoteLedger for SimulatedLedger {
    async fn read_pool(&self) -> Result<PoolSnapshot, RemoteError> {
        drop(self.chain.read()?);
        self.chain.pool_snapshot()
    }

    async fn read_position(&self, owner: Address) -> Result<UserPosition, RemoteError> {
        self.chain.read()?.position(&self.chain.engine, owner)
    }

    async fn read_allowance(&self, owner: Address, spender: Address) -> Result<U256, RemoteError> {
        Ok(self.chain.read()?.allowance(owner, spender))
    }

    async fn read_balance(&self, owner: Address) -> Result<U256, RemoteError> {
        Ok(Books::get(&self.chain.read()?.balances, owner))
    }

    async fn approve(&self, spender: Address, amount: U256) -> Result<OperationHandle, RemoteError> {
        self.chain.send(self.account, Op::Approve { spender, amount })
    }

    async fn submit(&self, action: Action, amount: U256) -> Result<OperationHandle, RemoteError> {
        self.chain.send(self.account, Op::Pool { action, amount })
    }

    async fn await_finality(&self, handle: &OperationHandle) -> Result<Receipt, RemoteError> {
        self.chain.finality(handle).await
    }
}
