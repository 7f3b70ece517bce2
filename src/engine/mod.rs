//! Round Engine Module
//!
//! The asynchronous half of the engine: external services, the state
//! machine that owns a round, and the facade that drives it.
//!
//! ## Module Structure
//!
//! - `config`: Engine settings and validation
//! - `services`: Balance, bet record, and history service traits
//! - `remote`: REST ledger client
//! - `snapshot`: Published engine state
//! - `machine`: Round state machine
//! - `facade`: Engine handle and tick driver

pub mod config;
pub mod services;
pub mod remote;
pub mod snapshot;
pub mod machine;
pub mod facade;

// Re-export key types
pub use config::{ConfigError, EngineConfig};
pub use services::{
    BalanceService, BetRecord, BetRecordService, HistoryRecord, HistoryService, InMemoryLedger,
    ServiceError, Services,
};
pub use remote::RemoteLedger;
pub use snapshot::RoundSnapshot;
pub use machine::{RoundStateMachine, TickResult};
pub use facade::Engine;
