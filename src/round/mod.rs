//! Round Logic Module
//!
//! Synchronous building blocks of a round. No I/O, no waiting.
//!
//! ## Module Structure
//!
//! - `state`: Round, phase, and bet types
//! - `crash`: Crash point distribution
//! - `clock`: Tick periods and multiplier growth
//! - `ledger`: Bet validation, cashout pricing, crash settlement

pub mod state;
pub mod crash;
pub mod clock;
pub mod ledger;

// Re-export key types
pub use state::{Account, Bet, BetStatus, PlayerId, Round, RoundId, RoundPhase, RoundStatus};
pub use crash::{CrashPointSource, ScriptedCrashPoints, TieredCrashGenerator};
pub use clock::RoundClock;
pub use ledger::{BetLedger, BetRejection, CashoutQuote, ErrorKind, payout_for, MIN_BET};
