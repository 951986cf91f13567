//! # PotEngine
//!
//! One engine for every configured pot. Pots are data ([`PotConfig`]), not
//! code paths.
//!
//! ## Entry flow
//!
//! ```text
//! enter(request)
//!   │
//!   ▼ (1) validate request, resolve pot       → ValidationError / UnknownPot
//!   ▼ (2) ReferenceRegistry::reserve()        → DuplicateTransfer
//!   ▼ (3) ContributionVerifier::verify()      → VerificationError   (lock-free,
//!                                                payer must be the participant)
//!   ▼ (4) boost lookup (optional)             → failure = no boost
//!   ▼ (5) EntryLedger::record_entry()         (pot lock, persisted)
//!   ▼ (6) reservation committed
//! ContributionEntry
//! ```
//!
//! Dropping the `enter` future before (5) releases the reservation; nothing
//! is recorded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rapidpot_common::{
    validate_pots, ContributionEntry, DrawFailure, DrawResult, Lamports, PotConfig, PotId,
};

use crate::chain::{ChainQuery, TokenBalanceOracle, TransferSubmitter};
use crate::error::{EngineError, StateError, ValidationError};
use crate::ledger::{EntryLedger, ReferenceRegistry, DEFAULT_BOOST_BPS};
use crate::metrics::EngineMetrics;
use crate::orchestrator::{DrawOrchestrator, DrawOutcome, RecoveryReport, Resolution};
use crate::payout::PayoutExecutor;
use crate::retry::RetryPolicy;
use crate::selector::RandomSource;
use crate::solana::{is_valid_address, is_valid_signature};
use crate::store::{PotStore, StateBackend};
use crate::verifier::ContributionVerifier;

// ════════════════════════════════════════════════════════════════════════════════
// SETTINGS
// ════════════════════════════════════════════════════════════════════════════════

/// Token holding that earns the stake multiplier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoostPolicy {
    pub mint: String,
    /// Minimum raw token balance.
    pub min_balance: u64,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub pots: Vec<PotConfig>,
    /// Deposit address every contribution must pay.
    pub admin_address: String,
    pub verify_policy: RetryPolicy,
    pub confirm_policy: RetryPolicy,
    pub boost: Option<BoostPolicy>,
    pub boost_multiplier_bps: u32,
}

impl EngineSettings {
    pub fn new(pots: Vec<PotConfig>, admin_address: &str) -> Self {
        Self {
            pots,
            admin_address: admin_address.to_string(),
            verify_policy: RetryPolicy::verification_default(),
            confirm_policy: RetryPolicy::confirmation_default(),
            boost: None,
            boost_multiplier_bps: DEFAULT_BOOST_BPS,
        }
    }
}

/// External collaborators.
#[derive(Clone)]
pub struct EngineDeps {
    pub chain: Arc<dyn ChainQuery>,
    pub submitter: Arc<dyn TransferSubmitter>,
    pub balances: Arc<dyn TokenBalanceOracle>,
    pub backend: Arc<dyn StateBackend>,
    pub rng: Arc<dyn RandomSource>,
}

// ════════════════════════════════════════════════════════════════════════════════
// REQUESTS & VIEWS
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub struct EnterRequest {
    /// `None` selects the first configured pot.
    pub pot: Option<PotId>,
    pub participant: String,
    /// Client-claimed amount in native units.
    pub claimed_amount: f64,
    pub transfer_reference: String,
    pub boost_claim: bool,
}

/// Live view of one pot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PotSummary {
    pub config: PotConfig,
    pub participants: usize,
    pub pool: Lamports,
    pub next_draw: DateTime<Utc>,
    pub drawing: bool,
    pub unresolved: bool,
}

// ════════════════════════════════════════════════════════════════════════════════
// ENGINE
// ════════════════════════════════════════════════════════════════════════════════

pub struct PotEngine {
    pots: Vec<PotConfig>,
    admin_address: String,
    store: Arc<PotStore>,
    registry: ReferenceRegistry,
    verifier: ContributionVerifier,
    ledger: EntryLedger,
    orchestrator: Arc<DrawOrchestrator>,
    balances: Arc<dyn TokenBalanceOracle>,
    boost: Option<BoostPolicy>,
    boost_policy: RetryPolicy,
    metrics: Arc<EngineMetrics>,
}

impl PotEngine {
    pub fn new(settings: EngineSettings, deps: EngineDeps) -> Result<Self, EngineError> {
        validate_pots(&settings.pots)
            .map_err(|e| ValidationError::InvalidConfig(e.to_string()))?;
        if !is_valid_address(&settings.admin_address) {
            return Err(ValidationError::InvalidAddress(settings.admin_address).into());
        }

        let metrics = Arc::new(EngineMetrics::new());
        let store = Arc::new(PotStore::open(deps.backend, &settings.pots)?);
        let registry = ReferenceRegistry::with_spent(store.spent_references());
        let orchestrator = Arc::new(DrawOrchestrator::new(
            &settings.pots,
            store.clone(),
            deps.rng,
            PayoutExecutor::new(deps.submitter, settings.confirm_policy),
            metrics.clone(),
        ));

        Ok(Self {
            admin_address: settings.admin_address,
            verifier: ContributionVerifier::new(deps.chain, settings.verify_policy),
            ledger: EntryLedger::new(store.clone(), settings.boost_multiplier_bps),
            boost_policy: settings.verify_policy,
            pots: settings.pots,
            store,
            registry,
            orchestrator,
            balances: deps.balances,
            boost: settings.boost,
            metrics,
        })
    }

    pub fn admin_address(&self) -> &str {
        &self.admin_address
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn orchestrator(&self) -> &Arc<DrawOrchestrator> {
        &self.orchestrator
    }

    pub fn pot_configs(&self) -> &[PotConfig] {
        &self.pots
    }

    fn pot(&self, pot: Option<&str>) -> Result<&PotConfig, StateError> {
        match pot {
            None => self
                .pots
                .first()
                .ok_or_else(|| StateError::UnknownPot(String::new())),
            Some(id) => self
                .pots
                .iter()
                .find(|p| p.id == id)
                .ok_or_else(|| StateError::UnknownPot(id.to_string())),
        }
    }

    /// Verifies a contribution and credits it to its pot.
    pub async fn enter(&self, request: EnterRequest) -> Result<ContributionEntry, EngineError> {
        // (1)
        let config = self.pot(request.pot.as_deref())?;
        if request.participant.is_empty() {
            return Err(ValidationError::MissingField("participant").into());
        }
        if !is_valid_address(&request.participant) {
            return Err(ValidationError::InvalidAddress(request.participant).into());
        }
        if request.transfer_reference.is_empty() {
            return Err(ValidationError::MissingField("transferReference").into());
        }
        if !is_valid_signature(&request.transfer_reference) {
            return Err(ValidationError::InvalidReference(request.transfer_reference).into());
        }
        let claimed = Lamports::from_sol(request.claimed_amount).map_err(ValidationError::from)?;
        if claimed.is_zero() {
            let reason = "claimed amount must be positive".to_string();
            return Err(ValidationError::InvalidAmount(reason).into());
        }

        // (2)
        let guard = self.registry.reserve(&request.transfer_reference).map_err(|e| {
            EngineMetrics::incr(&self.metrics.duplicate_transfers);
            warn!(
                pot = %config.id,
                reference = %request.transfer_reference,
                "duplicate transfer reference"
            );
            e
        })?;

        // (3)
        let verified = match self
            .verifier
            .verify(
                &request.transfer_reference,
                &request.participant,
                claimed,
                &self.admin_address,
                config.tolerance,
            )
            .await
        {
            Ok(v) => v,
            Err(e) => {
                EngineMetrics::incr(&self.metrics.verification_failures);
                warn!(
                    pot = %config.id,
                    participant = %request.participant,
                    reference = %request.transfer_reference,
                    error = %e,
                    "contribution rejected"
                );
                return Err(e.into());
            }
        };

        // (4)
        let boost_eligible = request.boost_claim && self.boost_eligible(&request.participant).await;

        // (5)
        let entry = self
            .ledger
            .record_entry(
                &config.id,
                &request.participant,
                verified.amount,
                boost_eligible,
                &request.transfer_reference,
            )
            .await?;

        // (6)
        guard.commit();
        EngineMetrics::incr(&self.metrics.entries_accepted);
        Ok(entry)
    }

    async fn boost_eligible(&self, owner: &str) -> bool {
        let Some(boost) = &self.boost else {
            debug!(participant = owner, "boost claimed but no boost mint configured");
            return false;
        };

        let attempts = self.boost_policy.attempts();
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.balances.token_balance(owner, &boost.mint).await {
                Ok(balance) => {
                    debug!(participant = owner, balance, min = boost.min_balance, "boost balance");
                    return balance >= boost.min_balance;
                }
                Err(e) => last_error = Some(e),
            }
            self.boost_policy.pause(attempt).await;
        }

        EngineMetrics::incr(&self.metrics.boost_lookup_failures);
        warn!(
            participant = owner,
            error = %last_error.map(|e| e.to_string()).unwrap_or_default(),
            "boost balance lookup failed; entry credited without boost"
        );
        false
    }

    // ════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ════════════════════════════════════════════════════════════════════════

    /// Active entries in insertion order.
    pub fn participants(&self, pot: &str) -> Result<Vec<ContributionEntry>, EngineError> {
        Ok(self.store.snapshot(pot)?.entries)
    }

    /// Settled draws, most recent first.
    pub fn history(&self, pot: &str) -> Result<Vec<DrawResult>, EngineError> {
        let mut history = self.store.snapshot(pot)?.history;
        history.reverse();
        Ok(history)
    }

    pub fn last_winner(&self, pot: &str) -> Result<Option<DrawResult>, EngineError> {
        Ok(self.store.snapshot(pot)?.last_winner)
    }

    /// Failed payouts, most recent first.
    pub fn failures(&self, pot: &str) -> Result<Vec<DrawFailure>, EngineError> {
        let mut failures = self.store.snapshot(pot)?.failures;
        failures.reverse();
        Ok(failures)
    }

    pub fn pots(&self) -> Result<Vec<PotSummary>, EngineError> {
        let now = Utc::now();
        self.pots
            .iter()
            .map(|config| {
                let state = self.store.snapshot(&config.id)?;
                Ok(PotSummary {
                    participants: state.entries.len(),
                    pool: state.total_pool(),
                    next_draw: config.schedule.next_after(now),
                    drawing: state.in_flight.is_some(),
                    unresolved: state.in_flight.as_ref().is_some_and(|d| d.unresolved),
                    config: config.clone(),
                })
            })
            .collect()
    }

    // ════════════════════════════════════════════════════════════════════════
    // DRAWS & ADMIN
    // ════════════════════════════════════════════════════════════════════════

    pub async fn draw(&self, pot: &str) -> Result<DrawOutcome, EngineError> {
        self.orchestrator.draw(pot).await
    }

    /// Draw on a detached task; see [`DrawOrchestrator::spawn_draw`].
    pub fn spawn_draw(&self, pot: &str) -> JoinHandle<Result<DrawOutcome, EngineError>> {
        self.orchestrator.spawn_draw(pot)
    }

    /// Waits for every spawned draw to finish; see
    /// [`DrawOrchestrator::wait_for_draws`].
    pub async fn wait_for_draws(&self) -> usize {
        self.orchestrator.wait_for_draws().await
    }

    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        self.orchestrator.recover().await
    }

    pub async fn resolve(
        &self,
        pot: &str,
        resolution: Resolution,
    ) -> Result<Option<DrawResult>, EngineError> {
        self.orchestrator.resolve(pot, resolution).await
    }

    /// Clears a pot's history and last winner. Active entries stay.
    pub async fn clear_history(&self, pot: &str) -> Result<usize, EngineError> {
        let cleared = self
            .store
            .mutate(pot, |state| {
                let n = state.history.len();
                state.history.clear();
                state.last_winner = None;
                Ok::<_, EngineError>(n)
            })
            .await?;
        info!(pot, cleared, "draw history cleared");
        Ok(cleared)
    }

    /// Writes the current document image, including volatile changes.
    pub async fn flush(&self) -> Result<(), EngineError> {
        Ok(self.store.flush().await?)
    }
}
