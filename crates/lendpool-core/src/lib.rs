//! lendpool-core: pool accounting and risk engine
//!
//! turns raw ledger balances into utilization, interest rates, collateral
//! health and the borrow/withdraw bounds a client checks before it submits
//! anything. no I/O lives here.
//!
//! ## usage
//!
//! ```rust
//! use alloy_primitives::U256;
//! use lendpool_core::{PoolSnapshot, ProtocolParams, RiskEngine};
//!
//! let engine = RiskEngine::new(ProtocolParams::default());
//! let pool = PoolSnapshot::from_totals(U256::from(1000), U256::from(500));
//!
//! assert_eq!(engine.utilization(&pool).unwrap().get(), 50);
//! assert_eq!(engine.borrow_rate(&pool).unwrap(), U256::from(12));
//! ```

pub mod error;
pub mod math;
pub mod params;
pub mod risk;
pub mod types;
pub mod units;

pub use error::*;
pub use params::*;
pub use risk::*;
pub use types::*;
pub use units::{format_units, parse_units};

pub use alloy_primitives::{Address, U256};
