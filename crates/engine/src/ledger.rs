//! # Entry Ledger
//!
//! Appends verified contributions to a pot under that pot's lock and keeps
//! every transfer reference from being credited twice.
//!
//! ## Reference lifecycle
//!
//! ```text
//!             reserve()                   commit()
//!  (unknown) ──────────▶ pending ─────────────────▶ spent
//!                           │
//!                           │ guard dropped (error / cancellation)
//!                           ▼
//!                       (unknown)
//! ```
//!
//! `spent` is seeded from the persisted `spent_references` of every pot, so
//! the guarantee survives restarts.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::info;

use rapidpot_common::{ContributionEntry, Lamports};

use crate::error::{EngineError, StateError, ValidationError};
use crate::store::PotStore;

/// Boost multiplier 1.3.
pub const DEFAULT_BOOST_BPS: u32 = 13_000;

// ════════════════════════════════════════════════════════════════════════════════
// REFERENCE REGISTRY
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Registry {
    spent: HashSet<String>,
    pending: HashSet<String>,
}

/// Process-wide set of spent and in-verification transfer references.
#[derive(Debug, Default)]
pub struct ReferenceRegistry {
    inner: Mutex<Registry>,
}

impl ReferenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spent(spent: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner: Mutex::new(Registry {
                spent: spent.into_iter().collect(),
                pending: HashSet::new(),
            }),
        }
    }

    /// Claims `reference` for one verification attempt.
    pub fn reserve(&self, reference: &str) -> Result<ReferenceGuard<'_>, StateError> {
        let mut inner = self.inner.lock();
        if inner.spent.contains(reference) || !inner.pending.insert(reference.to_string()) {
            return Err(StateError::DuplicateTransfer(reference.to_string()));
        }
        Ok(ReferenceGuard {
            registry: self,
            reference: reference.to_string(),
            committed: false,
        })
    }

    pub fn is_spent(&self, reference: &str) -> bool {
        self.inner.lock().spent.contains(reference)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

/// Reservation of one transfer reference. Released on drop unless committed.
#[derive(Debug)]
pub struct ReferenceGuard<'a> {
    registry: &'a ReferenceRegistry,
    reference: String,
    committed: bool,
}

impl ReferenceGuard<'_> {
    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Marks the reference spent for the lifetime of the process.
    pub fn commit(mut self) {
        let mut inner = self.registry.inner.lock();
        inner.pending.remove(&self.reference);
        inner.spent.insert(self.reference.clone());
        self.committed = true;
    }
}

impl Drop for ReferenceGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.inner.lock().pending.remove(&self.reference);
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// LEDGER
// ════════════════════════════════════════════════════════════════════════════════

pub struct EntryLedger {
    store: Arc<PotStore>,
    boost_bps: u32,
}

impl EntryLedger {
    pub fn new(store: Arc<PotStore>, boost_bps: u32) -> Self {
        Self { store, boost_bps }
    }

    /// Stake weight of a contribution.
    pub fn effective_amount(&self, amount: Lamports, boost_eligible: bool) -> Lamports {
        if boost_eligible {
            amount.apply_bps(self.boost_bps)
        } else {
            amount
        }
    }

    /// Appends one entry and marks `reference` spent in the same write.
    ///
    /// Entries from the same participant are never merged.
    pub async fn record_entry(
        &self,
        pot: &str,
        participant: &str,
        verified_amount: Lamports,
        boost_eligible: bool,
        reference: &str,
    ) -> Result<ContributionEntry, EngineError> {
        if !self.store.contains(pot) {
            return Err(StateError::UnknownPot(pot.to_string()).into());
        }
        if verified_amount.is_zero() {
            let reason = "verified amount must be positive".to_string();
            return Err(ValidationError::InvalidAmount(reason).into());
        }

        let entry = ContributionEntry {
            participant: participant.to_string(),
            amount: verified_amount,
            effective_amount: self.effective_amount(verified_amount, boost_eligible),
            boost_eligible,
            transfer_reference: reference.to_string(),
            entered_at: Some(Utc::now()),
        };

        let position = self.store.mutate(pot, |state| {
            if state.spent_references.contains(reference) {
                return Err(EngineError::from(StateError::DuplicateTransfer(reference.to_string())));
            }
            state.spent_references.insert(reference.to_string());
            state.entries.push(entry.clone());
            Ok(state.entries.len())
        })
        .await?;

        info!(
            pot,
            participant,
            reference,
            lamports = verified_amount.get(),
            effective = entry.effective_amount.get(),
            boost = boost_eligible,
            position,
            "entry recorded"
        );
        Ok(entry)
    }
}
