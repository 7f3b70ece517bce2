//! External Services
//!
//! The engine calls three collaborators it does not own: the balance
//! ledger, the bet record store, and the round history store. Each is an
//! async trait so the remote REST ledger and the in-memory test double are
//! interchangeable.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

use crate::round::ledger::BetRejection;
use crate::round::state::{Account, Bet, BetStatus, PlayerId};

/// Balance a new account opens with.
pub const STARTING_BALANCE: u64 = 100_000;

/// Failure of an external call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    /// Call did not finish within the bound.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// Balance would go negative.
    #[error("insufficient funds: balance {balance}")]
    InsufficientFunds {
        /// Balance the service reported.
        balance: u64,
    },

    /// Player unknown to the ledger.
    #[error("unknown player {0}")]
    UnknownPlayer(String),

    /// Service answered with an error.
    #[error("service rejected request: {0}")]
    Rejected(String),

    /// Network or decoding failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ServiceError {
    /// Whether the call may have taken effect even though it failed.
    ///
    /// A timed-out or dropped balance adjustment can still have been
    /// applied by the ledger; callers must confirm before retrying it.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ServiceError::Timeout(_) | ServiceError::Transport(_))
    }
}

impl From<ServiceError> for BetRejection {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InsufficientFunds { balance } => BetRejection::InsufficientBalance {
                amount: 0,
                balance,
            },
            other => BetRejection::Upstream(other.to_string()),
        }
    }
}

/// Bet record as stored by the bet record service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetRecord {
    /// Round id.
    pub game_id: String,
    /// Ledger user id.
    pub user_id: String,
    /// Stake.
    pub bet_amount: u64,
    /// Auto-cashout threshold.
    pub auto_cashout: Option<f64>,
    /// Outcome.
    pub status: BetStatus,
    /// Multiplier the bet settled at.
    pub multiplier_result: Option<f64>,
    /// Amount paid out.
    pub payout: Option<u64>,
}

impl BetRecord {
    /// Record for `bet`, filed under the ledger user id.
    pub fn new(bet: &Bet, user_id: &str) -> Self {
        Self {
            game_id: bet.round_id.to_string(),
            user_id: user_id.to_owned(),
            bet_amount: bet.amount,
            auto_cashout: bet.auto_cashout,
            status: bet.status,
            multiplier_result: bet.result_multiplier,
            payout: bet.payout,
        }
    }
}

/// One crashed round, as stored by the history service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Round id.
    pub game_id: String,
    /// Crash point.
    pub multiplier: f64,
    /// Milliseconds from launch to crash.
    pub crash_time: u64,
    /// Seats in the round.
    pub player_count: u32,
    /// When the record was produced.
    pub created_at: DateTime<Utc>,
}

/// Player balances.
#[async_trait]
pub trait BalanceService: Send + Sync {
    /// Current balance.
    async fn read_balance(&self, account: &Account) -> Result<u64, ServiceError>;

    /// Apply `delta` atomically and return the new balance. Must refuse to
    /// go below zero.
    async fn adjust_balance(&self, account: &Account, delta: i64) -> Result<u64, ServiceError>;
}

/// Settled bet storage.
#[async_trait]
pub trait BetRecordService: Send + Sync {
    /// Store one bet record.
    async fn write_bet(&self, record: BetRecord) -> Result<(), ServiceError>;
}

/// Round history storage.
#[async_trait]
pub trait HistoryService: Send + Sync {
    /// Store one crashed round.
    async fn write_history(&self, record: HistoryRecord) -> Result<(), ServiceError>;
}

/// Run `fut` with an upper bound on how long it may take.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ServiceError::Timeout(limit))?
}

/// The collaborator set one engine talks to, with a shared call timeout.
#[derive(Clone)]
pub struct Services {
    balances: Arc<dyn BalanceService>,
    bets: Arc<dyn BetRecordService>,
    history: Arc<dyn HistoryService>,
    timeout: Duration,
}

impl Services {
    /// Assemble from individual services.
    pub fn new(
        balances: Arc<dyn BalanceService>,
        bets: Arc<dyn BetRecordService>,
        history: Arc<dyn HistoryService>,
        timeout: Duration,
    ) -> Self {
        Self { balances, bets, history, timeout }
    }

    /// Use one backend for all three services.
    pub fn from_ledger<L>(ledger: Arc<L>, timeout: Duration) -> Self
    where
        L: BalanceService + BetRecordService + HistoryService + 'static,
    {
        Self {
            balances: ledger.clone(),
            bets: ledger.clone(),
            history: ledger,
            timeout,
        }
    }

    /// Call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bounded balance read.
    pub async fn read_balance(&self, account: &Account) -> Result<u64, ServiceError> {
        bounded(self.timeout, self.balances.read_balance(account)).await
    }

    /// Bounded balance adjustment.
    pub async fn adjust_balance(&self, account: &Account, delta: i64) -> Result<u64, ServiceError> {
        bounded(self.timeout, self.balances.adjust_balance(account, delta)).await
    }

    /// Bounded bet record write.
    pub async fn write_bet(&self, record: BetRecord) -> Result<(), ServiceError> {
        bounded(self.timeout, self.bets.write_bet(record)).await
    }

    /// Bounded history write.
    pub async fn write_history(&self, record: HistoryRecord) -> Result<(), ServiceError> {
        bounded(self.timeout, self.history.write_history(record)).await
    }
}

// =============================================================================
// IN-MEMORY LEDGER
// =============================================================================

/// All three services backed by process memory, keyed by engine player id.
///
/// Used by tests and the offline server mode. Failures and latency can be
/// injected per call family.
#[derive(Default)]
pub struct InMemoryLedger {
    balances: Mutex<BTreeMap<PlayerId, u64>>,
    /// Unknown players are opened at this balance when set.
    opening_balance: Option<u64>,
    bets: Mutex<Vec<BetRecord>>,
    history: Mutex<Vec<HistoryRecord>>,
    fail_balance: AtomicBool,
    fail_adjust: AtomicBool,
    lose_adjust_replies: AtomicBool,
    fail_writes: AtomicBool,
    latency: Mutex<Duration>,
}

impl InMemoryLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that opens an account for any unknown player.
    pub fn with_opening_balance(balance: u64) -> Self {
        Self {
            opening_balance: Some(balance),
            ..Self::default()
        }
    }

    /// Set a player's balance.
    pub fn set_balance(&self, player_id: PlayerId, balance: u64) {
        lock(&self.balances).insert(player_id, balance);
    }

    /// Current balance, if the player exists.
    pub fn balance(&self, player_id: &PlayerId) -> Option<u64> {
        lock(&self.balances).get(player_id).copied()
    }

    /// Bet records written so far.
    pub fn bet_records(&self) -> Vec<BetRecord> {
        lock(&self.bets).clone()
    }

    /// History records written so far.
    pub fn history_records(&self) -> Vec<HistoryRecord> {
        lock(&self.history).clone()
    }

    /// Make balance calls fail.
    pub fn fail_balance_calls(&self, fail: bool) {
        self.fail_balance.store(fail, Ordering::SeqCst);
    }

    /// Make balance adjustments fail without applying them.
    pub fn fail_adjustments(&self, fail: bool) {
        self.fail_adjust.store(fail, Ordering::SeqCst);
    }

    /// Apply balance adjustments but answer with a transport error, as if
    /// the reply was lost on the way back.
    pub fn lose_adjust_replies(&self, lose: bool) {
        self.lose_adjust_replies.store(lose, Ordering::SeqCst);
    }

    /// Make bet record and history writes fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_balance_failure(&self) -> Result<(), ServiceError> {
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(ServiceError::Transport("injected balance failure".into()));
        }
        Ok(())
    }

    fn account<'a>(
        &self,
        balances: &'a mut BTreeMap<PlayerId, u64>,
        account: &Account,
    ) -> Result<&'a mut u64, ServiceError> {
        match self.opening_balance {
            Some(opening) => Ok(balances.entry(account.player_id).or_insert(opening)),
            None => balances
                .get_mut(&account.player_id)
                .ok_or_else(|| ServiceError::UnknownPlayer(account.user_id.clone())),
        }
    }

    fn check_write_failure(&self) -> Result<(), ServiceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ServiceError::Transport("injected write failure".into()));
        }
        Ok(())
    }
}

/// Poisoning only happens if a holder panicked; the data is still usable.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl BalanceService for InMemoryLedger {
    async fn read_balance(&self, account: &Account) -> Result<u64, ServiceError> {
        self.simulate_latency().await;
        self.check_balance_failure()?;
        let mut balances = lock(&self.balances);
        self.account(&mut balances, account).map(|balance| *balance)
    }

    async fn adjust_balance(&self, account: &Account, delta: i64) -> Result<u64, ServiceError> {
        self.simulate_latency().await;
        self.check_balance_failure()?;
        if self.fail_adjust.load(Ordering::SeqCst) {
            return Err(ServiceError::Transport("injected adjustment failure".into()));
        }

        let mut balances = lock(&self.balances);
        let balance = self.account(&mut balances, account)?;

        let updated = if delta >= 0 {
            balance
                .checked_add(delta.unsigned_abs())
                .ok_or_else(|| ServiceError::Rejected("balance overflow".into()))?
        } else {
            balance
                .checked_sub(delta.unsigned_abs())
                .ok_or(ServiceError::InsufficientFunds { balance: *balance })?
        };
        *balance = updated;

        if self.lose_adjust_replies.load(Ordering::SeqCst) {
            return Err(ServiceError::Transport("injected lost reply".into()));
        }
        Ok(updated)
    }
}

#[async_trait]
impl BetRecordService for InMemoryLedger {
    async fn write_bet(&self, record: BetRecord) -> Result<(), ServiceError> {
        self.simulate_latency().await;
        self.check_write_failure()?;
        lock(&self.bets).push(record);
        Ok(())
    }
}

#[async_trait]
impl HistoryService for InMemoryLedger {
    async fn write_history(&self, record: HistoryRecord) -> Result<(), ServiceError> {
        self.simulate_latency().await;
        self.check_write_failure()?;
        lock(&self.history).push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> Account {
        Account::new("player-7")
    }

    #[tokio::test]
    async fn test_adjust_balance_refuses_overdraft() {
        let ledger = InMemoryLedger::new();
        ledger.set_balance(player().player_id, 100_000);

        assert_eq!(ledger.adjust_balance(&player(), -40_000).await.unwrap(), 60_000);
        assert_eq!(ledger.adjust_balance(&player(), 5_000).await.unwrap(), 65_000);

        let err = ledger.adjust_balance(&player(), -70_000).await.unwrap_err();
        assert_eq!(err, ServiceError::InsufficientFunds { balance: 65_000 });
        assert_eq!(ledger.balance(&player().player_id), Some(65_000));
    }

    #[tokio::test]
    async fn test_unknown_player() {
        let ledger = InMemoryLedger::new();
        assert_eq!(
            ledger.read_balance(&player()).await,
            Err(ServiceError::UnknownPlayer("player-7".into()))
        );
    }

    #[tokio::test]
    async fn test_opening_balance_for_new_players() {
        let ledger = InMemoryLedger::with_opening_balance(STARTING_BALANCE);
        assert_eq!(ledger.read_balance(&player()).await.unwrap(), 100_000);
        assert_eq!(ledger.adjust_balance(&player(), -1_000).await.unwrap(), 99_000);
        assert_eq!(ledger.read_balance(&player()).await.unwrap(), 99_000);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let ledger = InMemoryLedger::new();
        ledger.set_balance(player().player_id, 10);
        ledger.fail_balance_calls(true);
        assert!(ledger.read_balance(&player()).await.is_err());
        ledger.fail_balance_calls(false);
        assert_eq!(ledger.read_balance(&player()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_lost_reply_still_applies_adjustment() {
        let ledger = InMemoryLedger::new();
        ledger.set_balance(player().player_id, 1_000);

        ledger.lose_adjust_replies(true);
        let err = ledger.adjust_balance(&player(), 500).await.unwrap_err();
        assert!(err.is_ambiguous());
        assert_eq!(ledger.balance(&player().player_id), Some(1_500));

        ledger.lose_adjust_replies(false);
        ledger.fail_adjustments(true);
        assert!(ledger.adjust_balance(&player(), 500).await.is_err());
        assert_eq!(ledger.balance(&player().player_id), Some(1_500));
        // Reads are unaffected
        assert_eq!(ledger.read_balance(&player()).await.unwrap(), 1_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_call_times_out() {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_balance(player().player_id, 10);
        ledger.set_latency(Duration::from_secs(30));
        let services = Services::from_ledger(ledger, Duration::from_secs(2));

        let err = services.read_balance(&player()).await.unwrap_err();
        assert_eq!(err, ServiceError::Timeout(Duration::from_secs(2)));
    }

    #[test]
    fn test_service_error_maps_to_rejection() {
        let rejection: BetRejection = ServiceError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(rejection, BetRejection::Upstream(_)));

        let rejection: BetRejection = ServiceError::InsufficientFunds { balance: 5 }.into();
        assert!(matches!(rejection, BetRejection::InsufficientBalance { balance: 5, .. }));
    }

    #[test]
    fn test_ambiguous_errors() {
        assert!(ServiceError::Timeout(Duration::from_secs(1)).is_ambiguous());
        assert!(ServiceError::Transport("reset".into()).is_ambiguous());
        assert!(!ServiceError::Rejected("400".into()).is_ambiguous());
        assert!(!ServiceError::InsufficientFunds { balance: 0 }.is_ambiguous());
        assert!(!ServiceError::UnknownPlayer("x".into()).is_ambiguous());
    }
}
