//! Round and Bet State Definitions
//!
//! Plain data for one round of play. Nothing here talks to services or
//! reads the wall clock; the state machine feeds instants in.

use serde::{Serialize, Deserialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Domain separator for account id → player id hashing.
const PLAYER_ID_DOMAIN: &[u8] = b"crash-round-player:";

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Engine-side player identifier (16 bytes).
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Stable id for an external account: the first 16 bytes of SHA-256
    /// over the domain tag and the account id.
    pub fn for_account(user_id: &str) -> Self {
        let digest = Sha256::new()
            .chain_update(PLAYER_ID_DOMAIN)
            .chain_update(user_id.as_bytes())
            .finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

/// A player as the balance ledger knows them.
///
/// `user_id` is the ledger's own key (the token subject, or the id a
/// development client sends); `player_id` is derived from it and keys
/// everything inside the engine.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Account {
    /// Engine-side id.
    pub player_id: PlayerId,
    /// Ledger-side id.
    pub user_id: String,
}

impl Account {
    /// Account for a ledger user id.
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            player_id: PlayerId::for_account(&user_id),
            user_id,
        }
    }
}

/// Opaque round identifier, freshly allocated for every countdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoundId(pub uuid::Uuid);

impl RoundId {
    /// Allocate a new random round id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl std::fmt::Display for RoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// ROUND
// =============================================================================

/// Externally visible round status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Accepting bets, counting down to launch.
    Countdown,
    /// Multiplier is rising.
    Active,
    /// Round is over; cooldown runs until the next countdown.
    Crashed,
}

/// Round phase with the data each phase owns.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RoundPhase {
    /// Accepting bets until `launch_at`.
    Countdown {
        /// Countdown ticks remaining, as last published.
        remaining: u32,
        /// When the round goes live.
        launch_at: Instant,
    },
    /// Round is live.
    Active {
        /// When the multiplier started rising.
        started_at: Instant,
        /// Hidden crash point, drawn at launch.
        crash_point: f64,
    },
    /// Round has crashed.
    Crashed {
        /// Launch instant of the round that crashed.
        started_at: Instant,
        /// Final multiplier.
        crash_point: f64,
        /// When the crash was observed.
        crashed_at: Instant,
    },
}

impl RoundPhase {
    /// Status without phase data.
    pub fn status(&self) -> RoundStatus {
        match self {
            RoundPhase::Countdown { .. } => RoundStatus::Countdown,
            RoundPhase::Active { .. } => RoundStatus::Active,
            RoundPhase::Crashed { .. } => RoundStatus::Crashed,
        }
    }

    /// Crash point, once drawn.
    pub fn crash_point(&self) -> Option<f64> {
        match self {
            RoundPhase::Countdown { .. } => None,
            RoundPhase::Active { crash_point, .. }
            | RoundPhase::Crashed { crash_point, .. } => Some(*crash_point),
        }
    }
}

/// The single current round.
#[derive(Clone, Debug)]
pub struct Round {
    /// Round identifier.
    pub id: RoundId,
    /// Current phase.
    pub phase: RoundPhase,
}

impl Round {
    /// Open a new round counting `ticks` down to `launch_at`.
    pub fn countdown(ticks: u32, launch_at: Instant) -> Self {
        Self {
            id: RoundId::generate(),
            phase: RoundPhase::Countdown { remaining: ticks, launch_at },
        }
    }

    /// Current status.
    pub fn status(&self) -> RoundStatus {
        self.phase.status()
    }
}

// =============================================================================
// BET
// =============================================================================

/// Bet settlement status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    /// Placed during countdown, waiting for launch.
    Pending,
    /// Riding the live multiplier.
    Active,
    /// Cashed out before the crash.
    CashedOut,
    /// Lost to the crash.
    Crashed,
}

impl BetStatus {
    /// Whether the bet has reached a final outcome.
    pub fn is_settled(self) -> bool {
        matches!(self, BetStatus::CashedOut | BetStatus::Crashed)
    }
}

/// A player's wager on one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    /// Round the bet belongs to.
    pub round_id: RoundId,
    /// Bettor.
    pub player_id: PlayerId,
    /// Stake in currency units.
    pub amount: u64,
    /// Auto-cashout threshold, if set.
    pub auto_cashout: Option<f64>,
    /// Settlement status.
    pub status: BetStatus,
    /// Multiplier the bet settled at.
    pub result_multiplier: Option<f64>,
    /// Amount credited back (0 when crashed).
    pub payout: Option<u64>,
}
