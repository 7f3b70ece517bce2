//! # Crash Round Server
//!
//! Round engine for a single-player crash betting game: a countdown opens
//! betting, the multiplier climbs from 1.00 until a hidden crash point, and
//! a short cooldown leads into the next round.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CRASH ROUND SERVER                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  round/           - Round rules (synchronous, no I/O)        │
//! │  ├── state.rs     - Round, phase, and bet types              │
//! │  ├── crash.rs     - Tiered crash point distribution (StdRng) │
//! │  ├── clock.rs     - Tick periods and multiplier growth       │
//! │  └── ledger.rs    - Bet validation, payouts, settlement      │
//! │                                                              │
//! │  engine/          - Round engine (async)                     │
//! │  ├── services.rs  - Balance / bet record / history traits    │
//! │  ├── remote.rs    - REST ledger client                       │
//! │  ├── machine.rs   - Round state machine                      │
//! │  └── facade.rs    - Engine handle and tick driver            │
//! │                                                              │
//! │  network/         - WebSocket seat server                    │
//! │  ├── server.rs    - Connection handling                      │
//! │  ├── protocol.rs  - Message types                            │
//! │  └── auth.rs      - JWT verification                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Money Guarantees
//!
//! - Stakes are debited before a bet exists; a failed debit leaves no bet
//! - Payouts are `floor(amount × multiplier)`, never rounded up
//! - A bet is settled at most once, by cashout or by crash
//! - A credit whose outcome is unknown is confirmed by reading the balance
//!   back, never blindly retried
//! - Closing a seat refunds a pending stake and lets a live bet settle

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod round;
pub mod engine;
pub mod network;

// Re-export commonly used types
pub use round::{Account, Bet, BetRejection, BetStatus, ErrorKind, PlayerId, RoundId, RoundStatus, MIN_BET};
pub use engine::{Engine, EngineConfig, RoundSnapshot, Services};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
