//! Read-only view of the engine, published after every state change.

use serde::{Serialize, Deserialize};

use crate::round::state::{Bet, Round, RoundId, RoundPhase, RoundStatus};

/// Everything a presentation layer needs to render the round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    /// Current round.
    pub round_id: RoundId,
    /// Round status.
    pub status: RoundStatus,
    /// Current multiplier (1.0 outside the active phase until crash).
    pub multiplier: f64,
    /// Countdown ticks left; zero outside countdown.
    pub countdown_remaining: u32,
    /// Revealed only once the round has crashed.
    pub crash_point: Option<f64>,
    /// The seat's bet on this round.
    pub current_bet: Option<Bet>,
}

impl RoundSnapshot {
    /// Build from the live round.
    pub fn capture(round: &Round, multiplier: f64, current_bet: Option<Bet>) -> Self {
        let (countdown_remaining, crash_point) = match round.phase {
            RoundPhase::Countdown { remaining, .. } => (remaining, None),
            RoundPhase::Active { .. } => (0, None),
            RoundPhase::Crashed { crash_point, .. } => (0, Some(crash_point)),
        };

        Self {
            round_id: round.id,
            status: round.status(),
            multiplier,
            countdown_remaining,
            crash_point,
            current_bet,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[test]
    fn test_crash_point_hidden_until_crash() {
        let mut round = Round::countdown(10, Instant::now());
        let snap = RoundSnapshot::capture(&round, 1.0, None);
        assert_eq!(snap.status, RoundStatus::Countdown);
        assert_eq!(snap.countdown_remaining, 10);
        assert_eq!(snap.crash_point, None);

        let now = Instant::now();
        round.phase = RoundPhase::Active { started_at: now, crash_point: 4.2 };
        let snap = RoundSnapshot::capture(&round, 1.3, None);
        assert_eq!(snap.crash_point, None);
        assert_eq!(snap.countdown_remaining, 0);

        round.phase = RoundPhase::Crashed { started_at: now, crash_point: 4.2, crashed_at: now };
        let snap = RoundSnapshot::capture(&round, 4.2, None);
        assert_eq!(snap.crash_point, Some(4.2));
    }

    #[test]
    fn test_snapshot_json_shape() {
        let round = Round::countdown(7, Instant::now());
        let json = serde_json::to_value(RoundSnapshot::capture(&round, 1.0, None)).unwrap();
        assert_eq!(json["status"], "countdown");
        assert_eq!(json["countdown_remaining"], 7);
        assert_eq!(json["round_id"], round.id.to_string());
    }
}
