//! Coordination module - escrow lifecycle orchestration
//!
//! The coordination layer:
//! 1. Generates hash-lock conditions and persists their fulfillments
//! 2. Builds EscrowCreate proposals at the live collateral rate
//! 3. Serializes custody submissions through one settlement worker
//! 4. Sweeps expired escrows into cancellation

pub mod condition;
pub mod engine;
pub mod lifecycle;
pub mod sweeper;

pub use condition::ConditionGenerator;
pub use engine::{Coordinator, EscrowRequest, FinishRequest, SettlementCommand, SettlementHandle};
pub use lifecycle::{EscrowState, SettlementOutcome};
pub use sweeper::ExpirySweeper;
