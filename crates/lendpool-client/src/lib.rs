//! lendpool-client: session cache and transaction orchestration
//!
//! talks to a lending pool through a [`RemoteLedger`]: caches the pool and
//! account snapshot, checks intents against the local risk bounds and drives
//! each write through approval, submission and finality.
//!
//! ## backends
//!
//! - `rpc`: json-rpc lending gateway over http (default)
//! - `sim`: in-process simulated chain with fault injection
//!
//! ## usage
//!
//! ```rust,ignore
//! let session = LendingSession::connect(config, remote, owner, Arc::new(TracingSink)).await?;
//! let intent = session.intent(Action::Supply, "12.5")?;
//! let receipt = session.submit(intent).await?;
//! println!("{:?}", session.dashboard()?);
//! session.shutdown().await;
//! ```

pub mod config;
pub mod error;
pub mod intent;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod poller;
pub mod position;
#[cfg(feature = "rpc")]
pub mod rpc;
pub mod session;
#[cfg(feature = "sim")]
pub mod sim;

pub use config::*;
pub use error::*;
pub use intent::*;
pub use ledger::*;
pub use notify::*;
pub use orchestrator::*;
pub use poller::Poller;
pub use position::*;
#[cfg(feature = "rpc")]
pub use rpc::RpcLedger;
pub use session::*;
#[cfg(feature = "sim")]
pub use sim::{CallLog, FaultPlan, SimulatedChain, SimulatedLedger};

pub use lendpool_core;
