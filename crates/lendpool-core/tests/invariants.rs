//! property checks for the risk engine bounds

use lendpool_core::{HealthFactor, PoolSnapshot, ProtocolParams, RiskEngine, UserPosition, U256};
use proptest::prelude::*;

fn engine() -> RiskEngine {
    RiskEngine::new(ProtocolParams::default())
}

fn amount() -> impl Strategy<Value = U256> {
    prop_oneof![
        (0u64..10_000).prop_map(U256::from),
        any::<u128>().prop_map(U256::from),
        any::<[u64; 4]>().prop_map(U256::from_limbs),
    ]
}

fn position() -> impl Strategy<Value = UserPosition> {
    (amount(), amount(), amount()).prop_map(|(supplied, borrowed, collateral_value)| UserPosition {
        supplied,
        borrowed,
        collateral_value,
        health_factor: U256::ZERO,
    })
}

proptest! {
    #[test]
    fn utilization_stays_in_range(supply in amount(), borrow in amount()) {
        let pool = PoolSnapshot::from_totals(supply, borrow);
        let u = engine().utilization(&pool).unwrap().get();
        prop_assert!(u <= 100);
        if supply.is_zero() {
            prop_assert_eq!(u, 0);
        }
    }

    #[test]
    fn rates_are_monotonic_in_utilization(a in 0u8..=100, b in 0u8..=100) {
        let e = engine();
        let (lo, hi) = (a.min(b), a.max(b));
        let lo = lendpool_core::Percentage::new(lo);
        let hi = lendpool_core::Percentage::new(hi);
        prop_assert!(e.borrow_rate_at(lo).unwrap() <= e.borrow_rate_at(hi).unwrap());
        prop_assert!(e.supply_rate_at(lo).unwrap() <= e.supply_rate_at(hi).unwrap());
    }

    #[test]
    fn no_debt_means_infinite_health(supplied in amount(), collateral in amount()) {
        let p = UserPosition {
            supplied,
            borrowed: U256::ZERO,
            collateral_value: collateral,
            health_factor: U256::ZERO,
        };
        prop_assert_eq!(engine().health_factor(&p).unwrap(), HealthFactor::Infinite);
    }

    #[test]
    fn max_borrow_within_capacity(p in position()) {
        let e = engine();
        if let (Ok(max), Ok(capacity)) = (e.max_borrow(&p), e.borrow_capacity(&p)) {
            prop_assert!(max <= capacity);
        }
    }

    #[test]
    fn max_borrow_keeps_health_across_tables(
        ltv in 1u64..=100,
        threshold in 1u64..=300,
        borrowed in 0u64..1_000_000,
        collateral in 1u64..1_000_000,
    ) {
        let e = RiskEngine::new(ProtocolParams {
            ltv_ratio: ltv,
            liquidation_threshold: threshold,
            critical_threshold: threshold,
            healthy_threshold: threshold.max(150),
            ..Default::default()
        });
        let p = UserPosition {
            supplied: U256::from(collateral),
            borrowed: U256::from(borrowed),
            collateral_value: U256::from(collateral),
            health_factor: U256::ZERO,
        };
        let max = e.max_borrow(&p).unwrap();
        if !max.is_zero() {
            let after = e.health_after_borrow(&p, max).unwrap();
            prop_assert!(after.at_least(e.params().liquidation_threshold()));
        }
    }

    #[test]
    fn max_withdraw_within_supplied(p in position()) {
        let e = engine();
        if let Ok(max) = e.max_withdraw(&p) {
            prop_assert!(max <= p.supplied);
        }
    }

    #[test]
    fn max_withdraw_keeps_health(
        supplied in 1u64..1_000_000,
        borrowed in 1u64..1_000_000,
        collateral in 1u64..1_000_000,
    ) {
        let e = engine();
        let p = UserPosition {
            supplied: U256::from(supplied),
            borrowed: U256::from(borrowed),
            collateral_value: U256::from(collateral),
            health_factor: U256::ZERO,
        };
        let max = e.max_withdraw(&p).unwrap();
        if !max.is_zero() {
            let after = e.health_after_withdraw(&p, max).unwrap();
            prop_assert!(after.at_least(e.params().liquidation_threshold()));
        }
    }
}
