//! pool and position data model

use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};

/// basis-100 percentage clamped to `0..=100`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Percentage(u8);

impl Percentage {
    pub const ZERO: Self = Percentage(0);
    pub const FULL: Self = Percentage(100);

    pub fn new(value: u8) -> Self {
        Percentage(value.min(100))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    pub fn as_u256(&self) -> U256 {
        U256::from(self.0)
    }
}

impl std::fmt::Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// pool-wide totals as last read from the ledger
///
/// `total_borrow <= total_supply` is the ledger's invariant and is not
/// enforced here. the rate fields are a local cache recomputed by the risk
/// engine and are never used to move funds.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub total_supply: U256,
    pub total_borrow: U256,
    pub utilization_rate: U256,
    pub supply_rate: U256,
    pub borrow_rate: U256,
}

impl PoolSnapshot {
    /// snapshot with only the authoritative totals filled in
    pub fn from_totals(total_supply: U256, total_borrow: U256) -> Self {
        Self {
            total_supply,
            total_borrow,
            ..Default::default()
        }
    }

    /// funds currently available to borrow or withdraw
    pub fn available_liquidity(&self) -> U256 {
        self.total_supply.saturating_sub(self.total_borrow)
    }
}

/// one account's standing in the pool
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPosition {
    pub supplied: U256,
    pub borrowed: U256,
    /// collateral valued at current parameters
    pub collateral_value: U256,
    /// health factor as reported by the ledger; recompute with the risk
    /// engine before relying on it
    pub health_factor: U256,
}

impl UserPosition {
    pub fn has_debt(&self) -> bool {
        !self.borrowed.is_zero()
    }
}

/// how much the pool is currently permitted to pull from `owner`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowanceState {
    pub owner: Address,
    pub spender: Address,
    pub amount: U256,
}

impl AllowanceState {
    pub fn covers(&self, amount: U256) -> bool {
        self.amount >= amount
    }
}

/// collateral-to-debt ratio, basis 100
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthFactor {
    /// the position carries no debt
    Infinite,
    Finite(U256),
}

impl HealthFactor {
    pub fn is_infinite(&self) -> bool {
        matches!(self, HealthFactor::Infinite)
    }

    /// whether the factor is at or above `threshold`
    pub fn at_least(&self, threshold: U256) -> bool {
        match self {
            HealthFactor::Infinite => true,
            HealthFactor::Finite(v) => *v >= threshold,
        }
    }
}

impl PartialOrd for HealthFactor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HealthFactor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (HealthFactor::Infinite, HealthFactor::Infinite) => Ordering::Equal,
            (HealthFactor::Infinite, _) => Ordering::Greater,
            (_, HealthFactor::Infinite) => Ordering::Less,
            (HealthFactor::Finite(a), HealthFactor::Finite(b)) => a.cmp(b),
        }
    }
}

/// liquidation-risk band of a health factor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// below the liquidation threshold, liquidatable by the ledger
    AtRisk,
    Caution,
    Healthy,
}

/// dashboard warning level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthWarning {
    None,
    Low,
    Critical,
}

/// what a dashboard should print for a health factor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthDisplay {
    Infinite,
    Percent(U256),
}

impl std::fmt::Display for HealthDisplay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthDisplay::Infinite => write!(f, "∞"),
            HealthDisplay::Percent(v) => write!(f, "{}%", v),
        }
    }
}
