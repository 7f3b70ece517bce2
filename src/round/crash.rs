//! Crash Point Generation
//!
//! Draws the hidden crash point for each round from a four-tier piecewise
//! uniform distribution that leans toward low multipliers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Lowest possible crash point.
pub const MIN_CRASH_POINT: f64 = 1.0;

/// Upper bound (exclusive) of the highest tier.
pub const MAX_CRASH_POINT: f64 = 100.0;

/// One tier of the crash distribution.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CrashTier {
    /// Cumulative probability bound: the tier is picked when the selector
    /// draw is below this value and not below the previous tier's bound.
    pub cumulative: f64,
    /// Inclusive lower bound of the tier range.
    pub low: f64,
    /// Exclusive upper bound of the tier range.
    pub high: f64,
}

/// 50% / 30% / 15% / 5% over [1,3) / [3,10) / [10,50) / [50,100).
pub const CRASH_TIERS: [CrashTier; 4] = [
    CrashTier { cumulative: 0.50, low: 1.0, high: 3.0 },
    CrashTier { cumulative: 0.80, low: 3.0, high: 10.0 },
    CrashTier { cumulative: 0.95, low: 10.0, high: 50.0 },
    CrashTier { cumulative: 1.00, low: 50.0, high: MAX_CRASH_POINT },
];

/// Source of crash points, one per round.
pub trait CrashPointSource: Send + Sync {
    /// Draw the next crash point. Never fails; always `>= 1.0`.
    fn draw(&mut self) -> f64;
}

/// Production generator.
///
/// Backed by `StdRng`, a CSPRNG: revealed crash points say nothing about
/// the next one.
#[derive(Clone, Debug)]
pub struct TieredCrashGenerator {
    rng: StdRng,
}

impl TieredCrashGenerator {
    /// Generator seeded from OS entropy.
    pub fn from_entropy() -> Self {
        Self { rng: StdRng::from_entropy() }
    }

    /// Generator with a fixed seed. Tests and benches only; a known seed
    /// makes every crash point predictable.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl CrashPointSource for TieredCrashGenerator {
    fn draw(&mut self) -> f64 {
        let tier = select_tier(self.rng.gen::<f64>());
        self.rng.gen_range(tier.low..tier.high)
    }
}

/// Pick the tier for a selector value in `[0, 1)`.
pub fn select_tier(selector: f64) -> &'static CrashTier {
    CRASH_TIERS
        .iter()
        .find(|tier| selector < tier.cumulative)
        .unwrap_or(&CRASH_TIERS[CRASH_TIERS.len() - 1])
}

/// Replays a fixed list of crash points, cycling when exhausted.
///
/// Lets tests and demos pin the outcome of each round.
#[derive(Clone, Debug)]
pub struct ScriptedCrashPoints {
    points: Vec<f64>,
    next: usize,
}

impl ScriptedCrashPoints {
    /// Create from a non-empty list. Values below 1.0 are raised to 1.0.
    pub fn new(points: Vec<f64>) -> Self {
        let points = if points.is_empty() { vec![MIN_CRASH_POINT] } else { points };
        Self { points, next: 0 }
    }
}

impl CrashPointSource for ScriptedCrashPoints {
    fn draw(&mut self) -> f64 {
        let point = self.points[self.next % self.points.len()];
        self.next += 1;
        point.max(MIN_CRASH_POINT)
    }
}
