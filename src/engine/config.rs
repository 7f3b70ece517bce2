//! Engine configuration.

use std::time::Duration;

use crate::round::clock::{RoundClock, MAX_ACTIVE_PERIOD};
use crate::round::crash::MAX_CRASH_POINT;
use crate::round::ledger::MIN_BET;

/// Countdown length of a fresh round, in ticks.
pub const DEFAULT_COUNTDOWN_SECS: u32 = 10;

/// Default bound on a single external call.
pub const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// Countdown must have at least one tick.
    #[error("countdown must be at least one second")]
    ZeroCountdown,

    /// Active ticks must be frequent enough for auto-cashout to react.
    #[error("active tick period {0:?} exceeds {MAX_ACTIVE_PERIOD:?}")]
    ActivePeriodTooLong(Duration),

    /// A tick period of zero would spin.
    #[error("{0} tick period must be non-zero")]
    ZeroPeriod(&'static str),

    /// Growth rate must be positive and finite.
    #[error("invalid growth rate {0}")]
    InvalidGrowthRate(f64),
}

/// Round engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Countdown ticks before launch.
    pub countdown_secs: u32,
    /// Tick periods and multiplier law.
    pub clock: RoundClock,
    /// Smallest accepted stake.
    pub min_bet: u64,
    /// Bound on each balance, bet record, or history call.
    pub service_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            countdown_secs: DEFAULT_COUNTDOWN_SECS,
            clock: RoundClock::default(),
            min_bet: MIN_BET,
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `CRASH_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let clock = RoundClock {
            countdown_period: read_ms(
                "CRASH_COUNTDOWN_TICK_MS",
                defaults.clock.countdown_period,
            ),
            active_period: read_ms("CRASH_ACTIVE_TICK_MS", defaults.clock.active_period),
            cooldown: read_ms("CRASH_COOLDOWN_MS", defaults.clock.cooldown),
            growth_rate: read_f64("CRASH_GROWTH_RATE", defaults.clock.growth_rate),
        };

        Self {
            countdown_secs: read_u32("CRASH_COUNTDOWN_SECS", defaults.countdown_secs),
            clock,
            min_bet: read_u64("CRASH_MIN_BET", defaults.min_bet),
            service_timeout: read_ms("CRASH_SERVICE_TIMEOUT_MS", defaults.service_timeout),
        }
    }

    /// Reject settings the engine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.countdown_secs == 0 {
            return Err(ConfigError::ZeroCountdown);
        }
        if self.clock.countdown_period.is_zero() {
            return Err(ConfigError::ZeroPeriod("countdown"));
        }
        if self.clock.active_period.is_zero() {
            return Err(ConfigError::ZeroPeriod("active"));
        }
        if self.clock.cooldown.is_zero() {
            return Err(ConfigError::ZeroPeriod("cooldown"));
        }
        if self.clock.active_period > MAX_ACTIVE_PERIOD {
            return Err(ConfigError::ActivePeriodTooLong(self.clock.active_period));
        }
        if !self.clock.growth_rate.is_finite() || self.clock.growth_rate <= 0.0 {
            return Err(ConfigError::InvalidGrowthRate(self.clock.growth_rate));
        }
        Ok(())
    }

    /// Longest a bet can stay open: a full countdown plus the climb to the
    /// highest possible crash point.
    pub fn max_round_duration(&self) -> Duration {
        self.clock.countdown_period * self.countdown_secs
            + self.clock.time_to_reach(MAX_CRASH_POINT)
            + self.clock.active_period
    }
}

fn read_ms(key: &str, fallback: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

fn read_u64(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(fallback)
}

fn read_u32(key: &str, fallback: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u32>().ok())
        .unwrap_or(fallback)
}

fn read_f64(key: &str, fallback: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<f64>().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.countdown_secs, 10);
        assert_eq!(config.min_bet, 1_000);
        assert_eq!(config.clock.cooldown, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_slow_active_ticks() {
        let mut config = EngineConfig::default();
        config.clock.active_period = Duration::from_millis(250);
        assert_eq!(
            config.validate(),
            Err(ConfigError::ActivePeriodTooLong(Duration::from_millis(250)))
        );
    }

    #[test]
    fn test_validate_rejects_zero_countdown() {
        let config = EngineConfig { countdown_secs: 0, ..EngineConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::ZeroCountdown));
    }

    #[test]
    fn test_validate_rejects_zero_cooldown() {
        let mut config = EngineConfig::default();
        config.clock.cooldown = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroPeriod("cooldown")));

        config.clock.cooldown = Duration::from_millis(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_round_duration() {
        // 10s countdown, 990s climb to 100x, one active tick
        let config = EngineConfig::default();
        let max = config.max_round_duration();
        assert!(max >= Duration::from_secs(1_000) && max <= Duration::from_millis(1_000_200));
    }

    #[test]
    fn test_validate_rejects_bad_growth() {
        let mut config = EngineConfig::default();
        config.clock.growth_rate = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidGrowthRate(_))));
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("CRASH_MIN_BET", "2500");
        std::env::set_var("CRASH_ACTIVE_TICK_MS", "50");
        std::env::set_var("CRASH_GROWTH_RATE", "not-a-number");
        let config = EngineConfig::from_env();
        std::env::remove_var("CRASH_MIN_BET");
        std::env::remove_var("CRASH_ACTIVE_TICK_MS");
        std::env::remove_var("CRASH_GROWTH_RATE");

        assert_eq!(config.min_bet, 2_500);
        assert_eq!(config.clock.active_period, Duration::from_millis(50));
        assert_eq!(config.clock.growth_rate, 0.1);
    }
}
