//! Process-wide engine counters, exported in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters. All methods take `&self`.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub entries_accepted: AtomicU64,
    pub verification_failures: AtomicU64,
    pub duplicate_transfers: AtomicU64,
    pub boost_lookup_failures: AtomicU64,
    pub draws_completed: AtomicU64,
    pub draws_empty: AtomicU64,
    pub payout_failures: AtomicU64,
    pub payouts_unconfirmed: AtomicU64,
    pub payouts_unresolved: AtomicU64,
    pub lamports_paid_out: AtomicU64,
}

/// Snapshot of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub entries_accepted: u64,
    pub verification_failures: u64,
    pub duplicate_transfers: u64,
    pub boost_lookup_failures: u64,
    pub draws_completed: u64,
    pub draws_empty: u64,
    pub payout_failures: u64,
    pub payouts_unconfirmed: u64,
    pub payouts_unresolved: u64,
    pub lamports_paid_out: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            entries_accepted: get(&self.entries_accepted),
            verification_failures: get(&self.verification_failures),
            duplicate_transfers: get(&self.duplicate_transfers),
            boost_lookup_failures: get(&self.boost_lookup_failures),
            draws_completed: get(&self.draws_completed),
            draws_empty: get(&self.draws_empty),
            payout_failures: get(&self.payout_failures),
            payouts_unconfirmed: get(&self.payouts_unconfirmed),
            payouts_unresolved: get(&self.payouts_unresolved),
            lamports_paid_out: get(&self.lamports_paid_out),
        }
    }

    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP rapidpot_entries_accepted_total Verified entries recorded
# TYPE rapidpot_entries_accepted_total counter
rapidpot_entries_accepted_total {entries}
# HELP rapidpot_verification_failures_total Entries rejected by verification
# TYPE rapidpot_verification_failures_total counter
rapidpot_verification_failures_total {verify_fail}
# HELP rapidpot_duplicate_transfers_total Entries rejected as already credited
# TYPE rapidpot_duplicate_transfers_total counter
rapidpot_duplicate_transfers_total {dup}
# HELP rapidpot_boost_lookup_failures_total Boost balance lookups that failed
# TYPE rapidpot_boost_lookup_failures_total counter
rapidpot_boost_lookup_failures_total {boost_fail}
# HELP rapidpot_draws_completed_total Draws settled with a winner
# TYPE rapidpot_draws_completed_total counter
rapidpot_draws_completed_total {draws}
# HELP rapidpot_draws_empty_total Draws skipped for lack of participants
# TYPE rapidpot_draws_empty_total counter
rapidpot_draws_empty_total {empty}
# HELP rapidpot_payout_failures_total Payouts that failed definitively
# TYPE rapidpot_payout_failures_total counter
rapidpot_payout_failures_total {pay_fail}
# HELP rapidpot_payouts_unconfirmed_total Payouts not confirmed in time
# TYPE rapidpot_payouts_unconfirmed_total counter
rapidpot_payouts_unconfirmed_total {unconfirmed}
# HELP rapidpot_payouts_unresolved_total Payouts needing operator resolution
# TYPE rapidpot_payouts_unresolved_total counter
rapidpot_payouts_unresolved_total {unresolved}
# HELP rapidpot_lamports_paid_out_total Lamports paid to winners
# TYPE rapidpot_lamports_paid_out_total counter
rapidpot_lamports_paid_out_total {paid}
"#,
            entries = s.entries_accepted,
            verify_fail = s.verification_failures,
            dup = s.duplicate_transfers,
            boost_fail = s.boost_lookup_failures,
            draws = s.draws_completed,
            empty = s.draws_empty,
            pay_fail = s.payout_failures,
            unconfirmed = s.payouts_unconfirmed,
            unresolved = s.payouts_unresolved,
            paid = s.lamports_paid_out,
        )
    }
}
