//! Engine Facade
//!
//! The surface a presentation layer talks to: start a seat, place a bet,
//! cash out, read or watch the snapshot, close the seat. A background
//! driver task ticks the state machine at the period of the current phase.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::engine::config::{ConfigError, EngineConfig};
use crate::engine::machine::RoundStateMachine;
use crate::engine::services::Services;
use crate::engine::snapshot::RoundSnapshot;
use crate::round::crash::{CrashPointSource, TieredCrashGenerator};
use crate::round::ledger::BetRejection;
use crate::round::state::{Account, Bet, PlayerId};

/// Extra time a closing seat allows for the last credit and record writes.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A running round engine for one seat.
pub struct Engine {
    seat: Account,
    machine: Arc<Mutex<RoundStateMachine>>,
    snapshots: watch::Receiver<RoundSnapshot>,
    shutdown_tx: broadcast::Sender<()>,
    driver: JoinHandle<()>,
}

impl Engine {
    /// Start an engine with the production crash generator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(seat: Account, config: EngineConfig, services: Services) -> Result<Self, ConfigError> {
        Self::start_with_source(seat, config, services, Box::new(TieredCrashGenerator::from_entropy()))
    }

    /// Start an engine with a caller-supplied crash point source.
    pub fn start_with_source(
        seat: Account,
        config: EngineConfig,
        services: Services,
        crash_source: Box<dyn CrashPointSource>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (machine, snapshots) = RoundStateMachine::new(seat.clone(), config, services, crash_source);
        let machine = Arc::new(Mutex::new(machine));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let driver = tokio::spawn(drive(machine.clone(), shutdown_rx));
        info!(seat = %seat.player_id.short(), "Engine started");

        Ok(Self {
            seat,
            machine,
            snapshots,
            shutdown_tx,
            driver,
        })
    }

    /// Seat this engine serves.
    pub fn player_id(&self) -> PlayerId {
        self.seat.player_id
    }

    /// Place a bet for the seat on the counting-down round.
    pub async fn place_bet(&self, amount: u64, auto_cashout: Option<f64>) -> Result<Bet, BetRejection> {
        self.machine.lock().await.place_bet(amount, auto_cashout).await
    }

    /// Cash out the seat's active bet at the current multiplier.
    pub async fn cash_out(&self) -> Result<Bet, BetRejection> {
        let mut machine = self.machine.lock().await;
        machine.cash_out(Instant::now()).await
    }

    /// Latest published state. Never waits on the engine lock.
    pub fn snapshot(&self) -> RoundSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RoundSnapshot> {
        self.snapshots.clone()
    }

    /// Retire the seat without orphaning its bet, then shut down.
    ///
    /// A pending stake is refunded. A live bet keeps riding the driver until
    /// it cashes out or crashes, bounded by the longest round the
    /// configuration allows, and its record is written before the engine
    /// stops.
    pub async fn close(&self) {
        let seat = self.seat.player_id.short();
        let bound = {
            let mut machine = self.machine.lock().await;
            if let Err(e) = machine.withdraw_pending().await {
                warn!(%seat, error = %e, "Pending stake refund failed, bet rides the round");
            }
            machine.config().max_round_duration() + CLOSE_GRACE
        };

        let mut rx = self.snapshots.clone();
        let settled = async {
            loop {
                let done = rx
                    .borrow_and_update()
                    .current_bet
                    .as_ref()
                    .map_or(true, |bet| bet.status.is_settled());
                if done || rx.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(bound, settled).await.is_err() {
            warn!(%seat, ?bound, "Bet still live at close");
        }

        let _ = self.shutdown_tx.send(());
        {
            let mut machine = self.machine.lock().await;
            let pending = machine.pending_writes();
            if pending > 0 {
                debug!(%seat, pending, "Flushing record writes");
                if tokio::time::timeout(CLOSE_GRACE, machine.flush()).await.is_err() {
                    warn!(%seat, "Record writes still pending at close");
                }
            }
        }
        self.shutdown().await;
        info!(%seat, "Engine closed");
    }

    /// Stop the driver and abort in-flight record writes. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.machine.lock().await.shutdown();
        debug!(seat = %self.seat.player_id.short(), "Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn ticker(machine: &RoundStateMachine, now: Instant) -> Interval {
    let mut ticker = interval_at(now + machine.first_tick_delay(now), machine.tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Tick loop. Rebuilds the interval whenever the phase changes, so no
/// active-phase tick fires once the round has crashed.
async fn drive(machine: Arc<Mutex<RoundStateMachine>>, mut shutdown_rx: broadcast::Receiver<()>) {
    let (mut scheduled_for, mut ticks) = {
        let machine = machine.lock().await;
        (machine.status(), ticker(&machine, Instant::now()))
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("Engine driver stopping");
                break;
            }
            _ = ticks.tick() => {}
        }

        let mut machine = machine.lock().await;
        let now = Instant::now();
        machine.tick(now).await;

        let status = machine.status();
        if status != scheduled_for {
            scheduled_for = status;
            ticks = ticker(&machine, now);
        }
    }
}
