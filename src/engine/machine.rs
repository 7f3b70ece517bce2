//! Round State Machine
//!
//! Owns the current round, its bets, and every external call the round
//! makes. All mutation goes through `&mut self`; the facade wraps the machine
//! in a mutex so ticks, bet placement, and cashouts are serialized.
//!
//! ```text
//!   Countdown(launch_at) ──now ≥ launch_at──► Active ──mult ≥ crash──► Crashed
//!        ▲                                                                    │
//!        └──────────────────── cooldown elapsed, new round id ◄───────────────┘
//! ```

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::config::EngineConfig;
use crate::engine::services::{BetRecord, HistoryRecord, Services, ServiceError};
use crate::engine::snapshot::RoundSnapshot;
use crate::round::clock::BASE_MULTIPLIER;
use crate::round::crash::CrashPointSource;
use crate::round::ledger::{BetLedger, BetRejection, CashoutQuote};
use crate::round::state::{Account, Bet, BetStatus, Round, RoundPhase, RoundStatus};

/// What one tick changed.
#[derive(Debug, Default)]
pub struct TickResult {
    /// Countdown reached zero and the round went live.
    pub launched: bool,
    /// The multiplier reached the crash point.
    pub crashed: bool,
    /// Cooldown finished and a new round opened.
    pub new_round: bool,
    /// Bets settled by auto-cashout this tick.
    pub auto_cashouts: Vec<Bet>,
}

/// How a balance adjustment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    /// The ledger holds the new balance.
    Applied,
    /// The call failed ambiguously and the read-back could not tell.
    Unconfirmed,
}

/// The round engine core.
pub struct RoundStateMachine {
    config: EngineConfig,
    /// The one player this engine serves.
    seat: Account,
    round: Round,
    multiplier: f64,
    ledger: BetLedger,
    crash_source: Box<dyn CrashPointSource>,
    services: Services,
    snapshots: watch::Sender<RoundSnapshot>,
    /// Fire-and-forget record writes.
    background: JoinSet<()>,
}

impl RoundStateMachine {
    /// Open the first round in countdown.
    pub fn new(
        seat: Account,
        config: EngineConfig,
        services: Services,
        crash_source: Box<dyn CrashPointSource>,
    ) -> (Self, watch::Receiver<RoundSnapshot>) {
        let round = fresh_round(&config, Instant::now());
        let (snapshots, rx) = watch::channel(RoundSnapshot::capture(&round, BASE_MULTIPLIER, None));

        let machine = Self {
            ledger: BetLedger::new(config.min_bet),
            config,
            seat,
            round,
            multiplier: BASE_MULTIPLIER,
            crash_source,
            services,
            snapshots,
            background: JoinSet::new(),
        };
        (machine, rx)
    }

    /// Current round.
    pub fn round(&self) -> &Round {
        &self.round
    }

    /// Current status.
    pub fn status(&self) -> RoundStatus {
        self.round.status()
    }

    /// Current multiplier.
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Bets on the current round.
    pub fn ledger(&self) -> &BetLedger {
        &self.ledger
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of the current state.
    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot::capture(&self.round, self.multiplier, self.ledger.get(&self.seat.player_id).cloned())
    }

    /// Period of ticks in the current phase.
    pub fn tick_period(&self) -> Duration {
        self.config.clock.period_for(self.status())
    }

    /// Delay from `now` until the first tick of the current phase.
    ///
    /// Countdown ticks land on whole periods before `launch_at`, and cooldown
    /// is anchored to the crash instant, so both end on time even when the
    /// phase began outside a tick.
    pub fn first_tick_delay(&self, now: Instant) -> Duration {
        match self.round.phase {
            RoundPhase::Countdown { launch_at, .. } => self
                .config
                .clock
                .until_countdown_tick(launch_at.saturating_duration_since(now)),
            RoundPhase::Crashed { crashed_at, .. } => {
                (crashed_at + self.config.clock.cooldown).saturating_duration_since(now)
            }
            _ => self.tick_period(),
        }
    }

    /// Number of record writes still in flight.
    pub fn pending_writes(&self) -> usize {
        self.background.len()
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Advance the round to `now`.
    #[instrument(skip(self), fields(round = %self.round.id.short()))]
    pub async fn tick(&mut self, now: Instant) -> TickResult {
        let mut result = TickResult::default();

        match self.round.phase {
            RoundPhase::Countdown { launch_at, .. } => {
                if now >= launch_at {
                    self.launch(now);
                    result.launched = true;
                } else {
                    let remaining = self.config.clock.countdown_ticks_left(launch_at - now);
                    self.round.phase = RoundPhase::Countdown { remaining, launch_at };
                }
            }
            RoundPhase::Active { started_at, crash_point } => {
                self.advance(now, started_at, crash_point, &mut result).await;
            }
            RoundPhase::Crashed { crashed_at, .. } => {
                if now.saturating_duration_since(crashed_at) >= self.config.clock.cooldown {
                    self.open_next_round(now);
                    result.new_round = true;
                }
            }
        }

        self.reap_background();
        self.publish();
        result
    }

    fn launch(&mut self, now: Instant) {
        let crash_point = self.crash_source.draw();
        self.round.phase = RoundPhase::Active { started_at: now, crash_point };
        self.multiplier = BASE_MULTIPLIER;
        let bets = self.ledger.activate();

        info!(round = %self.round.id.short(), bets, "Round launched");
        debug!(crash_point, "Crash point drawn");
    }

    /// Recompute the multiplier, run due auto-cashouts, then check for the
    /// crash. Auto-cashouts run first so a threshold equal to the crash point
    /// pays out.
    async fn advance(
        &mut self,
        now: Instant,
        started_at: Instant,
        crash_point: f64,
        result: &mut TickResult,
    ) {
        let elapsed = now.saturating_duration_since(started_at);
        let raw = self.config.clock.multiplier_at(elapsed);
        self.multiplier = raw.max(self.multiplier).min(crash_point);

        for quote in self.ledger.due_auto_cashouts(self.multiplier) {
            match self.settle_cashout(quote).await {
                Ok(bet) => {
                    info!(
                        player = %bet.player_id.short(),
                        multiplier = quote.multiplier,
                        payout = quote.payout,
                        "Auto-cashout"
                    );
                    result.auto_cashouts.push(bet);
                }
                Err(e) => {
                    // Credit known not to have landed; the next tick retries.
                    warn!(player = %quote.player_id.short(), error = %e, "Auto-cashout credit failed");
                }
            }
        }

        if self.multiplier >= crash_point {
            self.crash(now, started_at, crash_point);
            result.crashed = true;
        }
    }

    fn crash(&mut self, now: Instant, started_at: Instant, crash_point: f64) {
        self.multiplier = crash_point;
        self.round.phase = RoundPhase::Crashed { started_at, crash_point, crashed_at: now };

        let lost = self.ledger.settle_crash(crash_point);
        for bet in &lost {
            self.dispatch_bet_record(bet);
        }

        let crash_time = now.saturating_duration_since(started_at).as_millis() as u64;
        self.dispatch_history(HistoryRecord {
            game_id: self.round.id.to_string(),
            multiplier: crash_point,
            crash_time,
            player_count: 1,
            created_at: Utc::now(),
        });

        info!(
            round = %self.round.id.short(),
            crash_point,
            crash_time_ms = crash_time,
            lost = lost.len(),
            "Round crashed"
        );
    }

    fn open_next_round(&mut self, now: Instant) {
        let previous = self.round.id;
        self.round = fresh_round(&self.config, now);
        self.multiplier = BASE_MULTIPLIER;
        self.ledger.clear();

        info!(previous = %previous.short(), round = %self.round.id.short(), "New round");
    }

    // =========================================================================
    // PLAYER OPERATIONS
    // =========================================================================

    /// Place a bet for the seat on the counting-down round.
    ///
    /// The stake is debited before the bet is recorded; a failed debit leaves
    /// no bet behind.
    #[instrument(skip(self), fields(round = %self.round.id.short(), player = %self.seat.player_id.short()))]
    pub async fn place_bet(&mut self, amount: u64, auto_cashout: Option<f64>) -> Result<Bet, BetRejection> {
        let player_id = self.seat.player_id;
        self.ledger.check_placement(&self.round, &player_id, amount, auto_cashout)?;

        let balance = self.services.read_balance(&self.seat).await.map_err(|e| {
            warn!(error = %e, "Balance read failed");
            BetRejection::from(e)
        })?;
        if amount > balance {
            return Err(BetRejection::InsufficientBalance { amount, balance });
        }

        let debit = i64::try_from(amount)
            .map_err(|_| BetRejection::Upstream(format!("stake {amount} exceeds ledger range")))?;
        match self.transfer(balance, -debit).await {
            Ok(Transfer::Applied) => {}
            Ok(Transfer::Unconfirmed) => {
                error!(amount, "Stake debit unconfirmed, bet not placed");
                return Err(BetRejection::Upstream("stake debit unconfirmed".into()));
            }
            Err(ServiceError::InsufficientFunds { balance }) => {
                return Err(BetRejection::InsufficientBalance { amount, balance });
            }
            Err(e) => {
                warn!(error = %e, "Stake debit failed");
                return Err(e.into());
            }
        }

        let bet = self.ledger.record(self.round.id, player_id, amount, auto_cashout);
        info!(amount, auto_cashout = ?auto_cashout, "Bet placed");

        self.publish();
        Ok(bet)
    }

    /// Cash out the seat at the multiplier as of `now`.
    ///
    /// The round is first brought up to `now`, so a cashout requested after
    /// the crash deadline loses even if no tick has observed the crash yet.
    #[instrument(skip(self), fields(round = %self.round.id.short(), player = %self.seat.player_id.short()))]
    pub async fn cash_out(&mut self, now: Instant) -> Result<Bet, BetRejection> {
        let outcome = self.cash_out_at(now).await;
        self.publish();
        outcome
    }

    async fn cash_out_at(&mut self, now: Instant) -> Result<Bet, BetRejection> {
        if let RoundPhase::Active { started_at, crash_point } = self.round.phase {
            let mut result = TickResult::default();
            self.advance(now, started_at, crash_point, &mut result).await;
        }

        let quote = self.ledger.quote_cashout(&self.seat.player_id, self.multiplier, self.status())?;
        let bet = self.settle_cashout(quote).await.map_err(|e| {
            warn!(error = %e, "Cashout credit failed");
            e
        })?;

        info!(multiplier = quote.multiplier, payout = quote.payout, "Cashed out");
        Ok(bet)
    }

    /// Credit the payout, then mark the bet settled. The bet record write
    /// happens in the background.
    ///
    /// An unconfirmed credit still settles the bet and is never retried.
    async fn settle_cashout(&mut self, quote: CashoutQuote) -> Result<Bet, BetRejection> {
        let credit = i64::try_from(quote.payout)
            .map_err(|_| BetRejection::Upstream(format!("payout {} exceeds ledger range", quote.payout)))?;
        let before = self.services.read_balance(&self.seat).await?;
        if self.transfer(before, credit).await? == Transfer::Unconfirmed {
            error!(
                player = %quote.player_id.short(),
                round = %quote.round_id.short(),
                payout = quote.payout,
                "Cashout credit unconfirmed, settling without retry"
            );
        }

        let bet = self.ledger.commit_cashout(&quote)?;
        self.dispatch_bet_record(&bet);
        Ok(bet)
    }

    /// Refund and remove the seat's bet while it is still pending.
    ///
    /// Returns `None` when there is no pending bet. On error the bet stays
    /// and rides the round.
    #[instrument(skip(self), fields(round = %self.round.id.short(), player = %self.seat.player_id.short()))]
    pub async fn withdraw_pending(&mut self) -> Result<Option<Bet>, ServiceError> {
        let amount = match self.ledger.get(&self.seat.player_id) {
            Some(bet) if bet.status == BetStatus::Pending => bet.amount,
            _ => return Ok(None),
        };

        let refund = i64::try_from(amount)
            .map_err(|_| ServiceError::Rejected(format!("stake {amount} exceeds ledger range")))?;
        let before = self.services.read_balance(&self.seat).await?;
        if self.transfer(before, refund).await? == Transfer::Unconfirmed {
            error!(amount, "Stake refund unconfirmed, withdrawing without retry");
        }

        let bet = self.ledger.withdraw(&self.seat.player_id);
        info!(amount, "Pending bet refunded");
        self.publish();
        Ok(bet)
    }

    /// Apply `delta` to the seat's balance, which read `before`.
    ///
    /// A timeout or transport failure may still have been applied, so the
    /// balance is read back: exactly `before + delta` means it landed,
    /// exactly `before` means it did not and the error is returned. Anything
    /// else is unconfirmed and must not be retried.
    async fn transfer(&self, before: u64, delta: i64) -> Result<Transfer, ServiceError> {
        let err = match self.services.adjust_balance(&self.seat, delta).await {
            Ok(_) => return Ok(Transfer::Applied),
            Err(e) if !e.is_ambiguous() => return Err(e),
            Err(e) => e,
        };

        let after = match self.services.read_balance(&self.seat).await {
            Ok(after) => after,
            Err(read) => {
                warn!(error = %err, read_error = %read, delta, "Balance read-back failed");
                return Ok(Transfer::Unconfirmed);
            }
        };

        if before.checked_add_signed(delta) == Some(after) {
            warn!(error = %err, delta, "Balance adjustment confirmed by read-back");
            Ok(Transfer::Applied)
        } else if after == before {
            Err(err)
        } else {
            warn!(error = %err, delta, before, after, "Balance moved by an unknown amount");
            Ok(Transfer::Unconfirmed)
        }
    }

    // =========================================================================
    // BACKGROUND WRITES
    // =========================================================================

    fn dispatch_bet_record(&mut self, bet: &Bet) {
        let services = self.services.clone();
        let record = BetRecord::new(bet, &self.seat.user_id);
        self.background.spawn(async move {
            if let Err(e) = services.write_bet(record).await {
                warn!(error = %e, "Bet record write failed");
            }
        });
    }

    fn dispatch_history(&mut self, record: HistoryRecord) {
        let services = self.services.clone();
        self.background.spawn(async move {
            if let Err(e) = services.write_history(record).await {
                warn!(error = %e, "History write failed");
            }
        });
    }

    fn reap_background(&mut self) {
        while let Some(joined) = self.background.try_join_next() {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!(error = %e, "Record write task panicked");
                }
            }
        }
    }

    /// Wait for in-flight record writes to finish.
    pub async fn flush(&mut self) {
        while self.background.join_next().await.is_some() {}
    }

    /// Abort in-flight record writes.
    pub fn shutdown(&mut self) {
        let pending = self.background.len();
        if pending > 0 {
            debug!(pending, "Aborting record writes");
        }
        self.background.abort_all();
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

/// A new round counting down from `now`.
fn fresh_round(config: &EngineConfig, now: Instant) -> Round {
    let launch_at = now + config.clock.countdown_period * config.countdown_secs;
    Round::countdown(config.countdown_secs, launch_at)
}
