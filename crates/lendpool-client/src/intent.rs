//! transaction intents

use alloy_primitives::U256;
use lendpool_core::{format_units, parse_units, UnitsError};
use serde::{Deserialize, Serialize};

/// supported pool writes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Supply,
    Withdraw,
    Borrow,
    Repay,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::Supply, Action::Withdraw, Action::Borrow, Action::Repay];

    /// whether the pool pulls tokens from the wallet, so an allowance is needed
    pub fn needs_allowance(&self) -> bool {
        matches!(self, Action::Supply | Action::Repay)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Supply => "supply",
            Action::Withdraw => "withdraw",
            Action::Borrow => "borrow",
            Action::Repay => "repay",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "supply" => Ok(Action::Supply),
            "withdraw" => Ok(Action::Withdraw),
            "borrow" => Ok(Action::Borrow),
            "repay" => Ok(Action::Repay),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// one unit of work for the orchestrator; immutable once built
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIntent {
    action: Action,
    amount: U256,
    decimals: u8,
}

impl TransactionIntent {
    /// `amount` is already scaled by `decimals`
    pub fn new(action: Action, amount: U256, decimals: u8) -> Self {
        Self {
            action,
            amount,
            decimals,
        }
    }

    /// build from user text such as `"12.5"`
    pub fn parse(action: Action, text: &str, decimals: u8) -> Result<Self, UnitsError> {
        Ok(Self::new(action, parse_units(text, decimals)?, decimals))
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn amount(&self) -> U256 {
        self.amount
    }

    /// amount rendered with up to four fractional digits
    pub fn display_amount(&self) -> String {
        format_units(self.amount, self.decimals, 4)
    }
}

impl std::fmt::Display for TransactionIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action, self.display_amount())
    }
}
