//! risk engine
//!
//! pure functions from pool and position snapshots to utilization, rates,
//! health and borrow/withdraw bounds. the bounds are advisory: the ledger
//! re-validates every write, so passing a local check never guarantees the
//! write will land.

use alloy_primitives::U256;

use crate::error::Result;
use crate::math::{checked_add, mul_div, mul_div_ceil, percent_of, ratio_percent, saturating_sub};
use crate::params::ProtocolParams;
use crate::types::{
    HealthDisplay, HealthFactor, HealthStatus, HealthWarning, Percentage, PoolSnapshot,
    UserPosition,
};

#[derive(Clone, Debug, Default)]
pub struct RiskEngine {
    params: ProtocolParams,
}

impl RiskEngine {
    pub fn new(params: ProtocolParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// share of supplied funds currently borrowed, `0` for an empty pool
    pub fn utilization(&self, pool: &PoolSnapshot) -> Result<Percentage> {
        if pool.total_supply.is_zero() {
            return Ok(Percentage::ZERO);
        }
        let raw = ratio_percent(pool.total_borrow, pool.total_supply)?;
        // over-borrowed pools are the ledger's problem; clamp for display
        let clamped = raw.min(U256::from(100u8));
        Ok(Percentage::new(clamped.to::<u8>()))
    }

    /// `base_rate + utilization * multiplier / 100`
    pub fn borrow_rate(&self, pool: &PoolSnapshot) -> Result<U256> {
        let utilization = self.utilization(pool)?;
        self.borrow_rate_at(utilization)
    }

    /// `borrow_rate * utilization / 100`
    pub fn supply_rate(&self, pool: &PoolSnapshot) -> Result<U256> {
        let utilization = self.utilization(pool)?;
        self.supply_rate_at(utilization)
    }

    pub fn borrow_rate_at(&self, utilization: Percentage) -> Result<U256> {
        let variable = percent_of(utilization.as_u256(), self.params.utilization_multiplier())?;
        checked_add(self.params.base_rate(), variable)
    }

    pub fn supply_rate_at(&self, utilization: Percentage) -> Result<U256> {
        let borrow = self.borrow_rate_at(utilization)?;
        percent_of(borrow, utilization.as_u256())
    }

    /// copy of `pool` with utilization and both rates recomputed locally
    pub fn derive(&self, pool: &PoolSnapshot) -> Result<PoolSnapshot> {
        let utilization = self.utilization(pool)?;
        Ok(PoolSnapshot {
            total_supply: pool.total_supply,
            total_borrow: pool.total_borrow,
            utilization_rate: utilization.as_u256(),
            borrow_rate: self.borrow_rate_at(utilization)?,
            supply_rate: self.supply_rate_at(utilization)?,
        })
    }

    /// `collateral_value * 100 / borrowed`, infinite without debt
    pub fn health_factor(&self, position: &UserPosition) -> Result<HealthFactor> {
        if !position.has_debt() {
            return Ok(HealthFactor::Infinite);
        }
        Ok(HealthFactor::Finite(ratio_percent(
            position.collateral_value,
            position.borrowed,
        )?))
    }

    pub fn health_status(&self, health: HealthFactor) -> HealthStatus {
        if !health.at_least(self.params.liquidation_threshold()) {
            HealthStatus::AtRisk
        } else if !health.at_least(U256::from(self.params.healthy_threshold)) {
            HealthStatus::Caution
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn health_warning(&self, health: HealthFactor) -> HealthWarning {
        match health {
            HealthFactor::Infinite => HealthWarning::None,
            HealthFactor::Finite(v) if v > U256::from(self.params.display_ceiling) => {
                HealthWarning::None
            }
            HealthFactor::Finite(v) if v >= U256::from(self.params.healthy_threshold) => {
                HealthWarning::None
            }
            HealthFactor::Finite(v) if v < U256::from(self.params.critical_threshold) => {
                HealthWarning::Critical
            }
            HealthFactor::Finite(_) => HealthWarning::Low,
        }
    }

    /// display form; values past the ceiling print as infinite. never gate
    /// a transaction on this.
    pub fn health_display(&self, health: HealthFactor) -> HealthDisplay {
        match health {
            HealthFactor::Finite(v) if v <= U256::from(self.params.display_ceiling) => {
                HealthDisplay::Percent(v)
            }
            _ => HealthDisplay::Infinite,
        }
    }

    /// largest additional borrow: `borrow_capacity - borrowed`, floored at
    /// zero
    pub fn max_borrow(&self, position: &UserPosition) -> Result<U256> {
        let capacity = self.borrow_capacity(position)?;
        Ok(saturating_sub(capacity, position.borrowed))
    }

    /// total debt the collateral can carry
    ///
    /// the lower of `collateral_value * ltv / 100` and the largest debt that
    /// still leaves the health factor at the liquidation threshold. the
    /// second bound only bites when `ltv * threshold > 10_000`.
    pub fn borrow_capacity(&self, position: &UserPosition) -> Result<U256> {
        let by_ltv = percent_of(position.collateral_value, self.params.ltv_ratio())?;
        // a zero threshold or a bound past U256 leaves the ltv bound alone
        let by_threshold = mul_div(
            position.collateral_value,
            U256::from(100u8),
            self.params.liquidation_threshold(),
        )
        .unwrap_or(U256::MAX);
        Ok(by_ltv.min(by_threshold))
    }

    /// largest supply reduction that keeps the health factor at or above
    /// the liquidation threshold
    ///
    /// collateral value is taken to scale linearly with the supplied amount.
    /// both the collateral requirement and the supply it implies round up,
    /// so the bound errs on the side of leaving more collateral behind.
    pub fn max_withdraw(&self, position: &UserPosition) -> Result<U256> {
        if position.supplied.is_zero() {
            return Ok(U256::ZERO);
        }
        if !position.has_debt() {
            return Ok(position.supplied);
        }
        if position.collateral_value.is_zero() {
            return Ok(U256::ZERO);
        }

        let required_collateral = mul_div_ceil(
            position.borrowed,
            self.params.liquidation_threshold(),
            U256::from(100u8),
        )?;
        if position.collateral_value <= required_collateral {
            return Ok(U256::ZERO);
        }

        let required_supply = mul_div_ceil(
            required_collateral,
            position.supplied,
            position.collateral_value,
        )?;
        Ok(saturating_sub(position.supplied, required_supply))
    }

    /// health factor the position would have after borrowing `amount` more
    pub fn health_after_borrow(&self, position: &UserPosition, amount: U256) -> Result<HealthFactor> {
        let borrowed = checked_add(position.borrowed, amount)?;
        self.health_factor(&UserPosition {
            borrowed,
            ..position.clone()
        })
    }

    /// health factor the position would have after withdrawing `amount`
    pub fn health_after_withdraw(&self, position: &UserPosition, amount: U256) -> Result<HealthFactor> {
        let supplied = saturating_sub(position.supplied, amount);
        let collateral_value = if position.supplied.is_zero() {
            U256::ZERO
        } else {
            mul_div(position.collateral_value, supplied, position.supplied)?
        };
        self.health_factor(&UserPosition {
            supplied,
            collateral_value,
            ..position.clone()
        })
    }
}
