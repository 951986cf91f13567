//! # Ledger Document
//!
//! The single durable record of a deployment: every pot's active entries,
//! draw history, last winner, spent transfer references, in-flight draw and
//! failure log.
//!
//! ## Versioning
//!
//! | Version | Layout |
//! |---------|--------|
//! | 0 | single pot: `mainPotParticipants`, `mainHistory`, `lastWinner.main`, SOL floats |
//! | 1 | `{ version, pots: { <id>: PotState } }`, integer lamports |
//!
//! Every v1 field carries a serde default so that documents written by an
//! older build load with defaults filled in. Version 0 documents are
//! migrated into pot [`LEGACY_POT_ID`] on load.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::amount::Lamports;
use crate::pot::PotId;

/// Current on-disk schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Pot that receives the entries of a migrated version-0 document.
pub const LEGACY_POT_ID: &str = "main";

/// Upper bound on the per-pot failure log.
pub const MAX_FAILURE_LOG: usize = 100;

// ════════════════════════════════════════════════════════════════════════════
// ENTRIES & RESULTS
// ════════════════════════════════════════════════════════════════════════════

/// One verified contribution. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionEntry {
    pub participant: String,
    /// On-chain verified amount.
    pub amount: Lamports,
    /// Selection weight: `amount`, boosted when `boost_eligible`.
    pub effective_amount: Lamports,
    #[serde(default)]
    pub boost_eligible: bool,
    #[serde(default)]
    pub transfer_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entered_at: Option<DateTime<Utc>>,
}

/// Outcome of a settled draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawResult {
    #[serde(default)]
    pub draw_id: Uuid,
    pub pot_id: PotId,
    pub timestamp: DateTime<Utc>,
    pub winner: String,
    pub payout: Lamports,
    pub settlement_reference: String,
    pub participant_count: usize,
    /// Sum of verified amounts at draw time.
    pub total_pool: Lamports,
    /// Sum of selection weights at draw time.
    #[serde(default)]
    pub total_effective: Lamports,
}

/// A draw whose payout did not settle. Its entries were reinstated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawFailure {
    pub draw_id: Uuid,
    pub pot_id: PotId,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub payout: Option<Lamports>,
    #[serde(default)]
    pub settlement_reference: Option<String>,
    pub participant_count: usize,
    pub total_pool: Lamports,
}

// ════════════════════════════════════════════════════════════════════════════
// IN-FLIGHT DRAW
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrawStage {
    /// Entries detached, nothing submitted yet.
    Detached,
    /// Winner chosen; the payout is being (or may have been) submitted.
    Submitting,
}

/// Snapshot detached from a pot while its draw runs.
///
/// Persisted so that a crash never loses the detached entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlightDraw {
    pub draw_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<ContributionEntry>,
    pub stage: DrawStage,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub payout: Option<Lamports>,
    #[serde(default)]
    pub settlement_reference: Option<String>,
    /// Set when the payout outcome is unknown and needs an operator.
    #[serde(default)]
    pub unresolved: bool,
}

impl InFlightDraw {
    pub fn new(entries: Vec<ContributionEntry>, started_at: DateTime<Utc>) -> Self {
        Self {
            draw_id: Uuid::new_v4(),
            started_at,
            entries,
            stage: DrawStage::Detached,
            winner: None,
            payout: None,
            settlement_reference: None,
            unresolved: false,
        }
    }

    pub fn total_pool(&self) -> Lamports {
        self.entries.iter().map(|e| e.amount).sum()
    }

    pub fn total_effective(&self) -> Lamports {
        self.entries.iter().map(|e| e.effective_amount).sum()
    }
}

// ════════════════════════════════════════════════════════════════════════════
// POT STATE
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PotState {
    /// Active entries in insertion order.
    #[serde(default)]
    pub entries: Vec<ContributionEntry>,
    /// Settled draws, chronological.
    #[serde(default)]
    pub history: Vec<DrawResult>,
    #[serde(default)]
    pub last_winner: Option<DrawResult>,
    /// Transfer references already credited to this pot.
    #[serde(default)]
    pub spent_references: BTreeSet<String>,
    #[serde(default)]
    pub in_flight: Option<InFlightDraw>,
    /// Failed payouts, chronological, capped at [`MAX_FAILURE_LOG`].
    #[serde(default)]
    pub failures: Vec<DrawFailure>,
}

impl PotState {
    pub fn total_pool(&self) -> Lamports {
        self.entries.iter().map(|e| e.amount).sum()
    }

    /// Puts `snapshot` back in front of whatever arrived meanwhile.
    pub fn reinstate(&mut self, snapshot: Vec<ContributionEntry>) {
        let mut restored = snapshot;
        restored.append(&mut self.entries);
        self.entries = restored;
    }

    pub fn record_result(&mut self, result: DrawResult) {
        self.history.push(result.clone());
        self.last_winner = Some(result);
    }

    pub fn record_failure(&mut self, failure: DrawFailure) {
        self.failures.push(failure);
        if self.failures.len() > MAX_FAILURE_LOG {
            let excess = self.failures.len() - MAX_FAILURE_LOG;
            self.failures.drain(..excess);
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// DOCUMENT
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDocument {
    #[serde(default = "current_version")]
    pub version: u32,
    #[serde(default)]
    pub pots: BTreeMap<PotId, PotState>,
}

fn current_version() -> u32 {
    CURRENT_VERSION
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            pots: BTreeMap::new(),
        }
    }
}

impl LedgerDocument {
    /// Parses any supported version, migrating version 0 in place.
    ///
    /// Returns the document and whether a migration happened.
    pub fn from_json_slice(bytes: &[u8]) -> Result<(Self, bool), serde_json::Error> {
        let value: Value = serde_json::from_slice(bytes)?;
        if is_legacy_layout(&value) {
            let legacy: LegacyDocument = serde_json::from_value(value)?;
            return Ok((legacy.migrate(), true));
        }
        let mut doc: LedgerDocument = serde_json::from_value(value)?;
        let migrated = doc.version < CURRENT_VERSION;
        doc.version = doc.version.max(CURRENT_VERSION);
        Ok((doc, migrated))
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }
}

fn is_legacy_layout(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => {
            !obj.contains_key("pots")
                && (obj.contains_key("mainPotParticipants")
                    || obj.contains_key("mainHistory")
                    || obj.contains_key("lastWinner"))
        }
        None => false,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VERSION 0 (LEGACY) LAYOUT
// ════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyDocument {
    #[serde(default)]
    main_pot_participants: Vec<LegacyEntry>,
    #[serde(default)]
    main_history: Vec<LegacyWinner>,
    #[serde(default)]
    last_winner: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyEntry {
    wallet: String,
    amount: f64,
    #[serde(default)]
    effective_amount: Option<f64>,
    #[serde(default)]
    has_lotto: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyWinner {
    time: String,
    winner: String,
    pot: f64,
    tx: String,
    #[serde(default)]
    participants: usize,
    #[serde(default)]
    total_pot: f64,
}

impl LegacyWinner {
    fn into_result(self) -> DrawResult {
        let timestamp = DateTime::parse_from_rfc3339(&self.time)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_default();
        let total = Lamports::from_sol(self.total_pot).unwrap_or_default();
        DrawResult {
            draw_id: Uuid::nil(),
            pot_id: LEGACY_POT_ID.to_string(),
            timestamp,
            winner: self.winner,
            payout: Lamports::from_sol(self.pot).unwrap_or_default(),
            settlement_reference: self.tx,
            participant_count: self.participants,
            total_pool: total,
            total_effective: total,
        }
    }
}

impl LegacyDocument {
    fn migrate(self) -> LedgerDocument {
        let listed = self.main_pot_participants.len();
        let entries: Vec<ContributionEntry> = self
            .main_pot_participants
            .into_iter()
            .filter_map(|e| {
                let amount = Lamports::from_sol(e.amount).ok().filter(|a| !a.is_zero())?;
                let effective = e
                    .effective_amount
                    .and_then(|v| Lamports::from_sol(v).ok())
                    .filter(|a| !a.is_zero())
                    .unwrap_or(amount);
                Some(ContributionEntry {
                    participant: e.wallet,
                    amount,
                    effective_amount: effective,
                    boost_eligible: e.has_lotto,
                    transfer_reference: String::new(),
                    entered_at: None,
                })
            })
            .collect();
        if entries.len() < listed {
            warn!(
                dropped = listed - entries.len(),
                "legacy entries without a positive amount dropped during migration"
            );
        }

        let history: Vec<DrawResult> = self
            .main_history
            .into_iter()
            .map(LegacyWinner::into_result)
            .collect();

        // An emptied `lastWinner.main` is stored as `{}`.
        let last_winner = self
            .last_winner
            .get(LEGACY_POT_ID)
            .cloned()
            .and_then(|v| serde_json::from_value::<LegacyWinner>(v).ok())
            .map(LegacyWinner::into_result);

        let pot = PotState {
            entries,
            history,
            last_winner,
            spent_references: BTreeSet::new(),
            in_flight: None,
            failures: Vec::new(),
        };

        let mut pots = BTreeMap::new();
        pots.insert(LEGACY_POT_ID.to_string(), pot);
        LedgerDocument {
            version: CURRENT_VERSION,
            pots,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(who: &str, amount: u64) -> ContributionEntry {
        ContributionEntry {
            participant: who.to_string(),
            amount: Lamports(amount),
            effective_amount: Lamports(amount),
            boost_eligible: false,
            transfer_reference: format!("ref-{}", who),
            entered_at: None,
        }
    }

    #[test]
    fn reinstate_prepends_snapshot() {
        let mut pot = PotState::default();
        pot.entries.push(entry("late", 1));
        pot.reinstate(vec![entry("a", 1), entry("b", 2)]);
        let order: Vec<&str> = pot.entries.iter().map(|e| e.participant.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "late"]);
    }

    #[test]
    fn failure_log_is_capped() {
        let mut pot = PotState::default();
        for i in 0..(MAX_FAILURE_LOG + 5) {
            pot.record_failure(DrawFailure {
                draw_id: Uuid::new_v4(),
                pot_id: "main".into(),
                timestamp: Utc::now(),
                reason: format!("r{}", i),
                winner: None,
                payout: None,
                settlement_reference: None,
                participant_count: 1,
                total_pool: Lamports(1),
            });
        }
        assert_eq!(pot.failures.len(), MAX_FAILURE_LOG);
        assert_eq!(pot.failures[0].reason, "r5");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let (doc, migrated) =
            LedgerDocument::from_json_slice(br#"{"pots":{"main":{"entries":[]}}}"#).unwrap();
        assert!(!migrated);
        assert_eq!(doc.version, CURRENT_VERSION);
        let pot = &doc.pots["main"];
        assert!(pot.history.is_empty());
        assert!(pot.in_flight.is_none());
        assert!(pot.spent_references.is_empty());
    }

    #[test]
    fn legacy_layout_migrates_into_main_pot() {
        let legacy = br#"{
            "mainPotParticipants": [
                {"wallet": "A", "amount": 1.0, "effectiveAmount": 1.3, "hasLotto": true},
                {"wallet": "B", "amount": 0.5}
            ],
            "mainHistory": [
                {"time": "2024-05-01T10:00:00.000Z", "winner": "C", "pot": 0.97,
                 "tx": "sig1", "participants": 2, "totalPot": 1.0}
            ],
            "lastWinner": {"main": {}}
        }"#;
        let (doc, migrated) = LedgerDocument::from_json_slice(legacy).unwrap();
        assert!(migrated);
        let pot = &doc.pots[LEGACY_POT_ID];
        assert_eq!(pot.entries.len(), 2);
        assert_eq!(pot.entries[0].effective_amount, Lamports(1_300_000_000));
        assert!(pot.entries[0].boost_eligible);
        assert_eq!(pot.entries[1].effective_amount, Lamports(500_000_000));
        assert_eq!(pot.history.len(), 1);
        assert_eq!(pot.history[0].payout, Lamports(970_000_000));
        assert!(pot.last_winner.is_none());
    }

    #[test]
    fn legacy_rows_without_amount_are_dropped() {
        let legacy = br#"{
            "mainPotParticipants": [
                {"wallet": "A", "amount": 0.0},
                {"wallet": "B", "amount": 0.25, "effectiveAmount": 0.0},
                {"wallet": "C", "amount": -1.0}
            ]
        }"#;
        let (doc, migrated) = LedgerDocument::from_json_slice(legacy).unwrap();
        assert!(migrated);
        let pot = &doc.pots[LEGACY_POT_ID];
        assert_eq!(pot.entries.len(), 1);
        assert_eq!(pot.entries[0].participant, "B");
        assert_eq!(pot.entries[0].effective_amount, Lamports(250_000_000));
    }

    #[test]
    fn serialization_is_stable() {
        let mut doc = LedgerDocument::default();
        let mut pot = PotState::default();
        pot.entries.push(entry("a", 10));
        pot.spent_references.insert("ref-a".into());
        doc.pots.insert("main".into(), pot);

        let first = doc.to_json_vec().unwrap();
        let (reloaded, _) = LedgerDocument::from_json_slice(&first).unwrap();
        assert_eq!(reloaded, doc);
        assert_eq!(reloaded.to_json_vec().unwrap(), first);
    }
}
