//! Round Clock
//!
//! Timing rules for a round: how often each phase ticks and how the
//! multiplier grows with elapsed time.

use std::time::Duration;

use crate::round::state::RoundStatus;

/// Multiplier at launch.
pub const BASE_MULTIPLIER: f64 = 1.0;

/// Multiplier growth per elapsed second.
pub const DEFAULT_GROWTH_RATE: f64 = 0.1;

/// Upper bound on the active tick period.
pub const MAX_ACTIVE_PERIOD: Duration = Duration::from_millis(100);

/// Tick periods and the multiplier growth law.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RoundClock {
    /// Period of countdown ticks.
    pub countdown_period: Duration,
    /// Period of active ticks (multiplier recompute + auto-cashout check).
    pub active_period: Duration,
    /// Wait between a crash and the next countdown.
    pub cooldown: Duration,
    /// Multiplier growth per second.
    pub growth_rate: f64,
}

impl Default for RoundClock {
    fn default() -> Self {
        Self {
            countdown_period: Duration::from_secs(1),
            active_period: MAX_ACTIVE_PERIOD,
            cooldown: Duration::from_secs(3),
            growth_rate: DEFAULT_GROWTH_RATE,
        }
    }
}

impl RoundClock {
    /// Multiplier after `elapsed` time in the active phase.
    #[inline]
    pub fn multiplier_at(&self, elapsed: Duration) -> f64 {
        BASE_MULTIPLIER + elapsed.as_secs_f64() * self.growth_rate
    }

    /// Time the multiplier needs to reach `multiplier`.
    pub fn time_to_reach(&self, multiplier: f64) -> Duration {
        if multiplier <= BASE_MULTIPLIER || self.growth_rate <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((multiplier - BASE_MULTIPLIER) / self.growth_rate)
    }

    /// Countdown ticks left when `left` remains before launch, rounded up
    /// so the display reaches zero only at launch.
    pub fn countdown_ticks_left(&self, left: Duration) -> u32 {
        let period = self.countdown_period.as_nanos().max(1);
        let ticks = left.as_nanos().div_ceil(period);
        u32::try_from(ticks).unwrap_or(u32::MAX)
    }

    /// Delay until the next countdown boundary when `left` remains.
    pub fn until_countdown_tick(&self, left: Duration) -> Duration {
        let period = self.countdown_period.as_nanos().max(1);
        let offset = left.as_nanos() % period;
        if left.is_zero() {
            Duration::ZERO
        } else if offset == 0 {
            self.countdown_period
        } else {
            Duration::from_nanos(offset as u64)
        }
    }

    /// How long the driver should wait before the next tick in `status`.
    pub fn period_for(&self, status: RoundStatus) -> Duration {
        match status {
            RoundStatus::Countdown => self.countdown_period,
            RoundStatus::Active => self.active_period,
            RoundStatus::Crashed => self.cooldown,
        }
    }
}
