//! protocol parameters
//!
//! supplied by whoever deployed the pool and fixed for the life of a
//! session. every field is a basis-100 percentage.

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

use crate::error::ParamsError;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolParams {
    /// borrow rate at zero utilization
    pub base_rate: u64,
    /// borrow rate added at full utilization
    pub utilization_multiplier: u64,
    /// share of collateral value that may be borrowed
    pub ltv_ratio: u64,
    /// health factor below which the ledger may liquidate
    pub liquidation_threshold: u64,
    /// health factor from which a position counts as healthy
    pub healthy_threshold: u64,
    /// health factor below which a warning becomes critical
    pub critical_threshold: u64,
    /// health factors above this render as infinite (display only)
    pub display_ceiling: u64,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            base_rate: 2,
            utilization_multiplier: 20,
            ltv_ratio: 75,
            liquidation_threshold: 100,
            healthy_threshold: 150,
            critical_threshold: 120,
            display_ceiling: 10_000,
        }
    }
}

impl ProtocolParams {
    pub fn validate(&self) -> Result<(), ParamsError> {
        if self.ltv_ratio == 0 || self.ltv_ratio > 100 {
            return Err(ParamsError::LtvOutOfRange(self.ltv_ratio));
        }
        if self.liquidation_threshold == 0 {
            return Err(ParamsError::ZeroLiquidationThreshold);
        }
        if self.critical_threshold < self.liquidation_threshold {
            return Err(ParamsError::ThresholdOrder(
                "critical threshold below liquidation threshold",
            ));
        }
        if self.healthy_threshold < self.critical_threshold {
            return Err(ParamsError::ThresholdOrder(
                "healthy threshold below critical threshold",
            ));
        }
        if self.display_ceiling < self.healthy_threshold {
            return Err(ParamsError::ThresholdOrder(
                "display ceiling below healthy threshold",
            ));
        }
        Ok(())
    }

    pub fn base_rate(&self) -> U256 {
        U256::from(self.base_rate)
    }

    pub fn utilization_multiplier(&self) -> U256 {
        U256::from(self.utilization_multiplier)
    }

    pub fn ltv_ratio(&self) -> U256 {
        U256::from(self.ltv_ratio)
    }

    pub fn liquidation_threshold(&self) -> U256 {
        U256::from(self.liquidation_threshold)
    }
}
