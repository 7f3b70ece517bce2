//! Bet Ledger
//!
//! Bookkeeping for the bets on the current round. The ledger validates and
//! records state changes only; moving money is the state machine's job, which
//! is why cashout is split into a side-effect-free quote and a commit.

use std::collections::BTreeMap;

use crate::round::state::{Bet, BetStatus, PlayerId, Round, RoundId, RoundStatus};

/// Smallest accepted stake, in currency units.
pub const MIN_BET: u64 = 1_000;

/// How many ulps below an integer a product may land and still count as
/// that integer. `3000.0 * 1.15` evaluates to `3449.9999999999995`.
const PRODUCT_SLACK_ULPS: f64 = 4.0;

/// Broad error classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad amount or threshold; nothing was touched.
    Validation,
    /// Stake exceeds the player's balance; no debit attempted.
    InsufficientBalance,
    /// Operation does not fit the current round or bet state.
    StateConflict,
    /// A balance, bet record, or history call failed.
    Upstream,
}

/// Why a bet or cashout was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BetRejection {
    /// Stake under the table minimum.
    #[error("bet of {amount} is below the minimum of {minimum}")]
    BelowMinimum {
        /// Requested stake.
        amount: u64,
        /// Table minimum.
        minimum: u64,
    },

    /// Auto-cashout threshold must be finite and above 1.00.
    #[error("auto-cashout threshold {0} must be greater than 1.00")]
    InvalidAutoCashoutThreshold(f64),

    /// Stake exceeds balance.
    #[error("insufficient balance: bet {amount}, balance {balance}")]
    InsufficientBalance {
        /// Requested stake.
        amount: u64,
        /// Balance at the time of the check.
        balance: u64,
    },

    /// No countdown is open.
    #[error("round is not accepting bets")]
    RoundNotAcceptingBets,

    /// Player already has a bet on this round.
    #[error("a bet already exists for this round")]
    DuplicateBet,

    /// Nothing to cash out.
    #[error("no active bet")]
    NoActiveBet,

    /// The round crashed before the cashout.
    #[error("round already crashed")]
    RoundAlreadyCrashed,

    /// The bet was already cashed out.
    #[error("bet already settled")]
    AlreadySettled,

    /// An external service failed or timed out.
    #[error("upstream service error: {0}")]
    Upstream(String),
}

impl BetRejection {
    /// Error class for this rejection.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BetRejection::BelowMinimum { .. }
            | BetRejection::InvalidAutoCashoutThreshold(_) => ErrorKind::Validation,
            BetRejection::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            BetRejection::RoundNotAcceptingBets
            | BetRejection::DuplicateBet
            | BetRejection::NoActiveBet
            | BetRejection::RoundAlreadyCrashed
            | BetRejection::AlreadySettled => ErrorKind::StateConflict,
            BetRejection::Upstream(_) => ErrorKind::Upstream,
        }
    }
}

/// `floor(amount × multiplier)`.
///
/// The product is truncated, never rounded, except when it sits within a few
/// ulps under an integer: that gap is float noise from the decimal
/// multiplier, not a fraction of a currency unit.
pub fn payout_for(amount: u64, multiplier: f64) -> u64 {
    if !multiplier.is_finite() || multiplier <= 0.0 {
        return 0;
    }
    let product = amount as f64 * multiplier;
    let nearest = product.round();
    let slack = product * f64::EPSILON * PRODUCT_SLACK_ULPS;
    if nearest > product && nearest - product <= slack {
        nearest as u64
    } else {
        product.floor() as u64
    }
}

/// A priced cashout, ready to be committed once the credit lands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CashoutQuote {
    /// Round being cashed out of.
    pub round_id: RoundId,
    /// Bettor.
    pub player_id: PlayerId,
    /// Multiplier the bet settles at.
    pub multiplier: f64,
    /// Amount to credit.
    pub payout: u64,
    /// Triggered by the auto-cashout threshold.
    pub automatic: bool,
}

/// Bets for the current round, one per player.
#[derive(Debug, Clone)]
pub struct BetLedger {
    min_bet: u64,
    bets: BTreeMap<PlayerId, Bet>,
}

impl Default for BetLedger {
    fn default() -> Self {
        Self::new(MIN_BET)
    }
}

impl BetLedger {
    /// Create an empty ledger with the given minimum stake.
    pub fn new(min_bet: u64) -> Self {
        Self {
            min_bet,
            bets: BTreeMap::new(),
        }
    }

    /// Validate a placement against the round and existing bets.
    ///
    /// Balance is not checked here; it lives in the balance service.
    pub fn check_placement(
        &self,
        round: &Round,
        player_id: &PlayerId,
        amount: u64,
        auto_cashout: Option<f64>,
    ) -> Result<(), BetRejection> {
        if amount < self.min_bet {
            return Err(BetRejection::BelowMinimum {
                amount,
                minimum: self.min_bet,
            });
        }

        if let Some(threshold) = auto_cashout {
            if !threshold.is_finite() || threshold <= 1.0 {
                return Err(BetRejection::InvalidAutoCashoutThreshold(threshold));
            }
        }

        if round.status() != RoundStatus::Countdown {
            return Err(BetRejection::RoundNotAcceptingBets);
        }

        if self.bets.contains_key(player_id) {
            return Err(BetRejection::DuplicateBet);
        }

        Ok(())
    }

    /// Record a bet whose stake has already been debited.
    pub fn record(
        &mut self,
        round_id: RoundId,
        player_id: PlayerId,
        amount: u64,
        auto_cashout: Option<f64>,
    ) -> Bet {
        let bet = Bet {
            round_id,
            player_id,
            amount,
            auto_cashout,
            status: BetStatus::Pending,
            result_multiplier: None,
            payout: None,
        };
        self.bets.insert(player_id, bet.clone());
        bet
    }

    /// Promote every pending bet to active at launch.
    pub fn activate(&mut self) -> usize {
        let mut activated = 0;
        for bet in self.bets.values_mut() {
            if bet.status == BetStatus::Pending {
                bet.status = BetStatus::Active;
                activated += 1;
            }
        }
        activated
    }

    /// Price a manual cashout at `multiplier` without changing anything.
    pub fn quote_cashout(
        &self,
        player_id: &PlayerId,
        multiplier: f64,
        round_status: RoundStatus,
    ) -> Result<CashoutQuote, BetRejection> {
        let bet = self.bets.get(player_id).ok_or(BetRejection::NoActiveBet)?;

        match bet.status {
            BetStatus::CashedOut => return Err(BetRejection::AlreadySettled),
            BetStatus::Crashed => return Err(BetRejection::RoundAlreadyCrashed),
            BetStatus::Pending => return Err(BetRejection::NoActiveBet),
            BetStatus::Active => {}
        }

        match round_status {
            RoundStatus::Active => {}
            RoundStatus::Crashed => return Err(BetRejection::RoundAlreadyCrashed),
            RoundStatus::Countdown => return Err(BetRejection::NoActiveBet),
        }

        Ok(CashoutQuote {
            round_id: bet.round_id,
            player_id: *player_id,
            multiplier,
            payout: payout_for(bet.amount, multiplier),
            automatic: false,
        })
    }

    /// Auto-cashouts due at `multiplier`, priced at each bet's threshold.
    pub fn due_auto_cashouts(&self, multiplier: f64) -> Vec<CashoutQuote> {
        self.bets
            .values()
            .filter(|bet| bet.status == BetStatus::Active)
            .filter_map(|bet| {
                let threshold = bet.auto_cashout?;
                (multiplier >= threshold).then(|| CashoutQuote {
                    round_id: bet.round_id,
                    player_id: bet.player_id,
                    multiplier: threshold,
                    payout: payout_for(bet.amount, threshold),
                    automatic: true,
                })
            })
            .collect()
    }

    /// Apply a quote whose credit succeeded. First writer wins: a bet that
    /// settled in the meantime is left alone.
    pub fn commit_cashout(&mut self, quote: &CashoutQuote) -> Result<Bet, BetRejection> {
        let bet = self
            .bets
            .get_mut(&quote.player_id)
            .filter(|bet| bet.round_id == quote.round_id)
            .ok_or(BetRejection::NoActiveBet)?;

        match bet.status {
            BetStatus::Active => {
                bet.status = BetStatus::CashedOut;
                bet.result_multiplier = Some(quote.multiplier);
                bet.payout = Some(quote.payout);
                Ok(bet.clone())
            }
            BetStatus::CashedOut => Err(BetRejection::AlreadySettled),
            BetStatus::Crashed => Err(BetRejection::RoundAlreadyCrashed),
            BetStatus::Pending => Err(BetRejection::NoActiveBet),
        }
    }

    /// Settle every still-active bet as lost. Returns only the bets settled
    /// by this call, so a repeat call is a no-op.
    pub fn settle_crash(&mut self, crash_point: f64) -> Vec<Bet> {
        let mut settled = Vec::new();
        for bet in self.bets.values_mut() {
            if bet.status == BetStatus::Active {
                bet.status = BetStatus::Crashed;
                bet.result_multiplier = Some(crash_point);
                bet.payout = Some(0);
                settled.push(bet.clone());
            }
        }
        settled
    }

    /// Remove a bet that has not gone live yet. Anything past pending stays.
    pub fn withdraw(&mut self, player_id: &PlayerId) -> Option<Bet> {
        match self.bets.get(player_id) {
            Some(bet) if bet.status == BetStatus::Pending => self.bets.remove(player_id),
            _ => None,
        }
    }

    /// Bet for a player, if any.
    pub fn get(&self, player_id: &PlayerId) -> Option<&Bet> {
        self.bets.get(player_id)
    }

    /// Number of bets on the round.
    pub fn len(&self) -> usize {
        self.bets.len()
    }

    /// Whether the round has no bets.
    pub fn is_empty(&self) -> bool {
        self.bets.is_empty()
    }

    /// Drop all bets when the round is superseded.
    pub fn clear(&mut self) {
        self.bets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::state::RoundPhase;
    use proptest::prelude::*;
    use tokio::time::Instant;

    fn player() -> PlayerId {
        PlayerId::new([1; 16])
    }

    fn placed_ledger(round: &Round, amount: u64, auto: Option<f64>) -> BetLedger {
        let mut ledger = BetLedger::default();
        ledger.check_placement(round, &player(), amount, auto).unwrap();
        ledger.record(round.id, player(), amount, auto);
        ledger
    }

    #[test]
    fn test_payout_truncates() {
        assert_eq!(payout_for(10_000, 2.37), 23_700);
        assert_eq!(payout_for(1_000, 1.0059), 1_005);
        assert_eq!(payout_for(1_500, 1.999_999), 2_999);
        assert_eq!(payout_for(1_000, 1.15), 1_150);
        assert_eq!(payout_for(3_000, 1.15), 3_450);
        assert_eq!(payout_for(1_000, f64::NAN), 0);
    }

    #[test]
    fn test_payout_floors_sub_micro_multipliers() {
        // Live multipliers carry nanosecond precision
        assert_eq!(payout_for(100_000, 1.999_999_6), 199_999);
        assert_eq!(payout_for(100_000, 2.000_000_4), 200_000);
        assert_eq!(payout_for(10_000, 1.234_567_89), 12_345);
    }

    #[test]
    fn test_placement_validation() {
        let round = Round::countdown(10, Instant::now());
        let ledger = BetLedger::default();

        assert!(matches!(
            ledger.check_placement(&round, &player(), 999, None),
            Err(BetRejection::BelowMinimum { amount: 999, minimum: MIN_BET })
        ));
        assert!(matches!(
            ledger.check_placement(&round, &player(), 1_000, Some(1.0)),
            Err(BetRejection::InvalidAutoCashoutThreshold(_))
        ));
        assert!(matches!(
            ledger.check_placement(&round, &player(), 1_000, Some(f64::INFINITY)),
            Err(BetRejection::InvalidAutoCashoutThreshold(_))
        ));
        assert!(ledger.check_placement(&round, &player(), 1_000, Some(1.01)).is_ok());
    }

    #[test]
    fn test_placement_requires_countdown() {
        let mut round = Round::countdown(10, Instant::now());
        round.phase = RoundPhase::Active { started_at: Instant::now(), crash_point: 2.0 };
        let ledger = BetLedger::default();
        let err = ledger.check_placement(&round, &player(), 5_000, None).unwrap_err();
        assert_eq!(err, BetRejection::RoundNotAcceptingBets);
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }

    #[test]
    fn test_duplicate_bet_rejected() {
        let round = Round::countdown(10, Instant::now());
        let ledger = placed_ledger(&round, 5_000, None);
        let err = ledger.check_placement(&round, &player(), 5_000, None).unwrap_err();
        assert_eq!(err, BetRejection::DuplicateBet);
    }

    #[test]
    fn test_cashout_lifecycle() {
        let round = Round::countdown(10, Instant::now());
        let mut ledger = placed_ledger(&round, 10_000, None);

        // Pending bets cannot cash out
        assert_eq!(
            ledger.quote_cashout(&player(), 1.5, RoundStatus::Countdown).unwrap_err(),
            BetRejection::NoActiveBet
        );

        assert_eq!(ledger.activate(), 1);
        let quote = ledger.quote_cashout(&player(), 2.37, RoundStatus::Active).unwrap();
        assert_eq!(quote.payout, 23_700);
        assert!(!quote.automatic);

        let bet = ledger.commit_cashout(&quote).unwrap();
        assert_eq!(bet.status, BetStatus::CashedOut);
        assert_eq!(bet.result_multiplier, Some(2.37));
        assert_eq!(bet.payout, Some(23_700));

        // Second cashout is a state conflict, never a second payout
        let err = ledger.quote_cashout(&player(), 2.5, RoundStatus::Active).unwrap_err();
        assert_eq!(err, BetRejection::AlreadySettled);
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert_eq!(ledger.commit_cashout(&quote).unwrap_err(), BetRejection::AlreadySettled);

        // Crash after cashout leaves the cashed-out bet alone
        assert!(ledger.settle_crash(3.0).is_empty());
        assert_eq!(ledger.get(&player()).unwrap().status, BetStatus::CashedOut);
    }

    #[test]
    fn test_settle_crash_idempotent() {
        let round = Round::countdown(10, Instant::now());
        let mut ledger = placed_ledger(&round, 10_000, None);
        ledger.activate();

        let settled = ledger.settle_crash(2.5);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].status, BetStatus::Crashed);
        assert_eq!(settled[0].payout, Some(0));
        assert_eq!(settled[0].result_multiplier, Some(2.5));

        assert!(ledger.settle_crash(2.5).is_empty());
        assert_eq!(
            ledger.quote_cashout(&player(), 2.0, RoundStatus::Crashed).unwrap_err(),
            BetRejection::RoundAlreadyCrashed
        );
    }

    #[test]
    fn test_auto_cashout_due_at_threshold() {
        let round = Round::countdown(10, Instant::now());
        let mut ledger = placed_ledger(&round, 10_000, Some(2.0));
        ledger.activate();

        assert!(ledger.due_auto_cashouts(1.99).is_empty());

        let due = ledger.due_auto_cashouts(2.013);
        assert_eq!(due.len(), 1);
        assert!(due[0].automatic);
        assert_eq!(due[0].multiplier, 2.0);
        assert_eq!(due[0].payout, 20_000);
    }

    #[test]
    fn test_withdraw_only_pending() {
        let round = Round::countdown(10, Instant::now());
        let mut ledger = placed_ledger(&round, 10_000, None);
        let withdrawn = ledger.withdraw(&player()).unwrap();
        assert_eq!(withdrawn.amount, 10_000);
        assert!(ledger.is_empty());
        assert!(ledger.withdraw(&player()).is_none());

        let mut ledger = placed_ledger(&round, 10_000, None);
        ledger.activate();
        assert!(ledger.withdraw(&player()).is_none());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_no_cashout_without_bet() {
        let ledger = BetLedger::default();
        assert_eq!(
            ledger.quote_cashout(&player(), 1.5, RoundStatus::Active).unwrap_err(),
            BetRejection::NoActiveBet
        );
    }

    proptest! {
        #[test]
        fn prop_payout_never_exceeds_product(amount in 1_000u64..10_000_000, multiplier in 1.0f64..100.0) {
            let payout = payout_for(amount, multiplier);
            let product = amount as f64 * multiplier;
            prop_assert!(payout as f64 <= product * (1.0 + 1e-12));
            prop_assert!(payout as f64 + 1.0 > product);
            prop_assert!(payout >= amount);
        }

        #[test]
        fn prop_payout_matches_decimal_floor(amount in 1_000u64..1_000_000, micros in 1_000_000u64..100_000_000) {
            // Two-decimal thresholds and micro-precision multipliers alike
            let multiplier = micros as f64 / 1e6;
            let exact = amount as u128 * micros as u128 / 1_000_000;
            prop_assert_eq!(payout_for(amount, multiplier) as u128, exact);
        }
    }
}
