//! Weighted winner selection.
//!
//! `[0, total)` is split into contiguous intervals, one per entry, sized by
//! effective amount and laid out in entry order. A uniform point picks the
//! interval. Weights are integer lamports, so the walk is exact; the
//! last-entry fallback only covers a source returning an out-of-range point.

use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use rapidpot_common::ContributionEntry;

/// Uniform integer source for draws.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, bound)`. `bound` is always > 0.
    fn point_below(&self, bound: u64) -> u64;
}

/// Operating-system entropy. Used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn point_below(&self, bound: u64) -> u64 {
        OsRng.gen_range(0..bound)
    }
}

/// Reproducible ChaCha20 stream.
#[derive(Debug)]
pub struct SeededRandom {
    rng: Mutex<ChaCha20Rng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }
}

impl RandomSource for SeededRandom {
    fn point_below(&self, bound: u64) -> u64 {
        self.rng.lock().gen_range(0..bound)
    }
}

/// Always returns the same point (clamped below `bound`). For tests that
/// force a specific winner.
#[derive(Debug, Clone, Copy)]
pub struct FixedPoint(pub u64);

impl RandomSource for FixedPoint {
    fn point_below(&self, bound: u64) -> u64 {
        self.0.min(bound.saturating_sub(1))
    }
}

/// Sum of selection weights, saturating at `u64::MAX`.
pub fn total_weight(entries: &[ContributionEntry]) -> u64 {
    let total: u128 = entries
        .iter()
        .map(|e| u128::from(e.effective_amount.get()))
        .sum();
    u64::try_from(total).unwrap_or(u64::MAX)
}

/// Index of the entry whose interval contains `point`.
///
/// `None` only for an empty list.
pub fn select_winner_at(entries: &[ContributionEntry], point: u64) -> Option<usize> {
    if entries.is_empty() {
        return None;
    }
    let mut cumulative: u128 = 0;
    for (i, entry) in entries.iter().enumerate() {
        cumulative += u128::from(entry.effective_amount.get());
        if u128::from(point) < cumulative {
            return Some(i);
        }
    }
    Some(entries.len() - 1)
}

/// Picks a winner with probability proportional to effective amount.
///
/// `None` when the list is empty or carries no weight.
pub fn select_winner(entries: &[ContributionEntry], rng: &dyn RandomSource) -> Option<usize> {
    let total = total_weight(entries);
    if total == 0 {
        return None;
    }
    select_winner_at(entries, rng.point_below(total))
}
