//! # DrawOrchestrator: Per-Pot Draw State Machine
//!
//! ```text
//!                  draw(pot)
//!                      │
//!                      ▼ (1) detach        [pot lock, persisted]
//!   entries ──take──▶ in_flight { stage: Detached }
//!                      │  empty ─────────────────────────────▶ NoParticipants
//!                      ▼ (2) select winner, sign payout   (lock-free, nothing sent)
//!                      ▼ (3) mark Submitting + reference  [pot lock, persisted]
//!                      ▼ (4) PayoutExecutor::settle()     (lock-free)
//!                      │
//!        ┌─────────────┴──────────────┐
//!        ▼ Ok(reference)              ▼ Err(SettlementError)
//!   (5a) commit                  (5b) reinstate
//!   history += result            entries = snapshot ++ entries
//!   last_winner = result         failures += DrawFailure
//!   in_flight = None             in_flight = None
//! ```
//!
//! The persisted `in_flight` record *is* the `Drawing` flag. A second
//! trigger while it is present gets `DrawInProgress`; entries submitted
//! meanwhile land in the fresh active list and belong to the next round.
//!
//! ## Crash window
//!
//! | Persisted stage at startup | Recovery |
//! |----------------------------|----------|
//! | `Detached` | nothing was submitted; entries reinstated automatically |
//! | `Submitting` | payout may have landed; marked `unresolved` with its settlement reference |
//!
//! An unresolved pot answers draws with `PayoutUnresolved` until
//! [`DrawOrchestrator::resolve`]. The orchestrator never resubmits a payout
//! on its own.
//!
//! ## Shutdown
//!
//! Every running draw is counted, whether spawned or awaited directly.
//! [`DrawOrchestrator::wait_for_draws`] resolves once the count is zero.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use rapidpot_common::{
    DrawFailure, DrawResult, DrawStage, InFlightDraw, Lamports, PotConfig, PotId, PotState,
};

use crate::error::{EngineError, SettlementError, StateError, ValidationError};
use crate::metrics::EngineMetrics;
use crate::payout::PayoutExecutor;
use crate::selector::{select_winner, RandomSource};
use crate::store::PotStore;

// ════════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrawOutcome {
    Completed(DrawResult),
    /// The pot was empty; nothing happened.
    NoParticipants,
}

/// Operator decision for an unresolved payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The payout landed. Falls back to the recorded reference when `None`.
    Settled { settlement_reference: Option<String> },
    /// The payout did not land; entries go back into the pot.
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reinstated: Vec<PotId>,
    pub unresolved: Vec<PotId>,
}

// ════════════════════════════════════════════════════════════════════════════════
// ORCHESTRATOR
// ════════════════════════════════════════════════════════════════════════════════

pub struct DrawOrchestrator {
    pots: BTreeMap<PotId, PotConfig>,
    store: Arc<PotStore>,
    rng: Arc<dyn RandomSource>,
    payout: PayoutExecutor,
    metrics: Arc<EngineMetrics>,
    running: watch::Sender<usize>,
}

/// Counts one running draw for as long as it lives.
struct RunningDraw<'a>(&'a watch::Sender<usize>);

impl<'a> RunningDraw<'a> {
    fn enter(running: &'a watch::Sender<usize>) -> Self {
        running.send_modify(|n| *n += 1);
        Self(running)
    }
}

impl Drop for RunningDraw<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl DrawOrchestrator {
    pub fn new(
        pots: &[PotConfig],
        store: Arc<PotStore>,
        rng: Arc<dyn RandomSource>,
        payout: PayoutExecutor,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            pots: pots.iter().map(|p| (p.id.clone(), p.clone())).collect(),
            store,
            rng,
            payout,
            metrics,
            running: watch::channel(0).0,
        }
    }

    pub fn pot_config(&self, pot: &str) -> Result<&PotConfig, StateError> {
        self.pots
            .get(pot)
            .ok_or_else(|| StateError::UnknownPot(pot.to_string()))
    }

    /// Runs one draw on a detached task so that the caller going away
    /// cannot cancel it. The draw is counted before this returns.
    pub fn spawn_draw(
        self: &Arc<Self>,
        pot: &str,
    ) -> JoinHandle<Result<DrawOutcome, EngineError>> {
        let this = Arc::clone(self);
        let pot = pot.to_string();
        self.running.send_modify(|n| *n += 1);
        tokio::spawn(async move {
            let _running = RunningDraw(&this.running);
            this.run(&pot).await
        })
    }

    /// Number of draws currently running.
    pub fn running_draws(&self) -> usize {
        *self.running.borrow()
    }

    /// Waits until no draw is running. Returns how many were running when
    /// the wait started.
    pub async fn wait_for_draws(&self) -> usize {
        let mut running = self.running.subscribe();
        let pending = *running.borrow_and_update();
        if pending > 0 {
            info!(draws = pending, "waiting for running draws to finish");
            // The sender lives in `self`, so the channel cannot close here.
            let _ = running.wait_for(|n| *n == 0).await;
        }
        pending
    }

    /// Runs one draw for `pot`. Timer and manual triggers both land here.
    pub async fn draw(&self, pot: &str) -> Result<DrawOutcome, EngineError> {
        let _running = RunningDraw::enter(&self.running);
        self.run(pot).await
    }

    async fn run(&self, pot: &str) -> Result<DrawOutcome, EngineError> {
        let fee_bps = self.pot_config(pot)?.fee_bps;

        // (1) detach
        let started_at = Utc::now();
        let detached = self.store.mutate(pot, |state| {
            if let Some(in_flight) = &state.in_flight {
                return Err(EngineError::from(if in_flight.unresolved {
                    StateError::PayoutUnresolved(pot.to_string())
                } else {
                    StateError::DrawInProgress(pot.to_string())
                }));
            }
            if state.entries.is_empty() {
                return Ok(None);
            }
            let draw = InFlightDraw::new(std::mem::take(&mut state.entries), started_at);
            state.in_flight = Some(draw.clone());
            Ok(Some(draw))
        })
        .await?;

        let Some(draw) = detached else {
            EngineMetrics::incr(&self.metrics.draws_empty);
            info!(pot, "draw skipped: no participants");
            return Ok(DrawOutcome::NoParticipants);
        };

        // (2) select
        let Some(index) = select_winner(&draw.entries, self.rng.as_ref()) else {
            warn!(pot, draw_id = %draw.draw_id, "entries carry no selection weight; reinstating");
            self.reinstate(pot, draw.draw_id, None).await;
            return Ok(DrawOutcome::NoParticipants);
        };
        let winner = draw.entries[index].participant.clone();
        let total_pool = draw.total_pool();
        let payout = total_pool.deduct_fee_bps(fee_bps);

        let transfer = match self.payout.prepare(&winner, payout).await {
            Ok(t) => t,
            Err(e) => return Err(self.fail(pot, &draw, winner, payout, e).await),
        };

        // (3) mark Submitting; from here on a crash needs an operator
        let marked = self
            .store
            .mutate(pot, |state| match state.in_flight.as_mut() {
                Some(d) if d.draw_id == draw.draw_id => {
                    d.stage = DrawStage::Submitting;
                    d.winner = Some(winner.clone());
                    d.payout = Some(payout);
                    d.settlement_reference = Some(transfer.reference.clone());
                    Ok(())
                }
                _ => Err(EngineError::from(StateError::DrawInProgress(pot.to_string()))),
            })
            .await;
        if let Err(e) = marked {
            error!(
                pot,
                draw_id = %draw.draw_id,
                error = %e,
                "could not record payout intent; draw abandoned before submission"
            );
            self.reinstate(pot, draw.draw_id, None).await;
            return Err(e);
        }

        info!(
            pot,
            draw_id = %draw.draw_id,
            winner = %winner,
            participants = draw.entries.len(),
            pool = total_pool.get(),
            payout = payout.get(),
            reference = %transfer.reference,
            "winner selected; paying out"
        );

        // (4) pay out, (5) settle the record
        match self.payout.settle(&transfer).await {
            Ok(reference) => self.commit(pot, &draw, winner, payout, reference).await,
            Err(e) => Err(self.fail(pot, &draw, winner, payout, e).await),
        }
    }

    async fn commit(
        &self,
        pot: &str,
        draw: &InFlightDraw,
        winner: String,
        payout: Lamports,
        reference: String,
    ) -> Result<DrawOutcome, EngineError> {
        let result = DrawResult {
            draw_id: draw.draw_id,
            pot_id: pot.to_string(),
            timestamp: Utc::now(),
            winner,
            payout,
            settlement_reference: reference.clone(),
            participant_count: draw.entries.len(),
            total_pool: draw.total_pool(),
            total_effective: draw.total_effective(),
        };

        let committed = self
            .store
            .mutate(pot, |state| {
                state.in_flight = None;
                state.record_result(result.clone());
                Ok::<_, EngineError>(())
            })
            .await;

        match committed {
            Ok(()) => {
                EngineMetrics::incr(&self.metrics.draws_completed);
                EngineMetrics::add(&self.metrics.lamports_paid_out, payout.get());
                info!(
                    pot,
                    draw_id = %draw.draw_id,
                    winner = %result.winner,
                    payout = payout.get(),
                    reference = %reference,
                    "draw settled"
                );
                Ok(DrawOutcome::Completed(result))
            }
            Err(e) => {
                let _ = self
                    .store
                    .mutate_volatile(pot, |state| {
                        if let Some(d) = state.in_flight.as_mut() {
                            d.unresolved = true;
                            d.settlement_reference = Some(reference.clone());
                        }
                    })
                    .await;
                EngineMetrics::incr(&self.metrics.payouts_unresolved);
                error!(
                    pot,
                    draw_id = %draw.draw_id,
                    winner = %result.winner,
                    payout = payout.get(),
                    reference = %reference,
                    error = %e,
                    "PAYOUT SETTLED BUT NOT RECORDED; pot blocked until resolved"
                );
                Err(e)
            }
        }
    }

    async fn fail(
        &self,
        pot: &str,
        draw: &InFlightDraw,
        winner: String,
        payout: Lamports,
        e: SettlementError,
    ) -> EngineError {
        match e {
            SettlementError::SettlementFailed { .. } => {
                EngineMetrics::incr(&self.metrics.payout_failures)
            }
            SettlementError::Unconfirmed { .. } => {
                EngineMetrics::incr(&self.metrics.payouts_unconfirmed)
            }
        }
        error!(
            pot,
            draw_id = %draw.draw_id,
            winner = %winner,
            payout = payout.get(),
            reference = e.reference().unwrap_or("-"),
            error = %e,
            "payout failed; entries reinstated"
        );

        let failure = DrawFailure {
            draw_id: draw.draw_id,
            pot_id: pot.to_string(),
            timestamp: Utc::now(),
            reason: e.to_string(),
            winner: Some(winner),
            payout: Some(payout),
            settlement_reference: e.reference().map(str::to_string),
            participant_count: draw.entries.len(),
            total_pool: draw.total_pool(),
        };
        self.reinstate(pot, draw.draw_id, Some(failure)).await;
        e.into()
    }

    /// Puts a detached snapshot back. Falls back to an in-memory reinstate
    /// when the store refuses the write; the persisted in-flight record then
    /// still holds the entries.
    async fn reinstate(&self, pot: &str, draw_id: Uuid, failure: Option<DrawFailure>) {
        let persisted = self
            .store
            .mutate(pot, |state| {
                Ok::<_, EngineError>(reinstate_in(state, draw_id, failure.clone()))
            })
            .await;
        if let Err(e) = persisted {
            error!(
                pot,
                draw_id = %draw_id,
                error = %e,
                "could not persist reinstated entries; kept in memory"
            );
            let _ = self
                .store
                .mutate_volatile(pot, |state| reinstate_in(state, draw_id, failure))
                .await;
        }
    }

    // ════════════════════════════════════════════════════════════════════════
    // RECOVERY & RESOLUTION
    // ════════════════════════════════════════════════════════════════════════

    /// Handles in-flight draws left behind by a previous process.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();
        let pots: Vec<PotId> = self.pots.keys().cloned().collect();

        for pot in pots {
            let found = self
                .store
                .mutate(&pot, |state| {
                    let stage = match &state.in_flight {
                        None => return Ok::<_, EngineError>(None),
                        Some(d) => d.stage,
                    };
                    match stage {
                        DrawStage::Detached => {
                            let count = state.in_flight.as_ref().map_or(0, |d| d.entries.len());
                            if let Some(d) = state.in_flight.take() {
                                state.reinstate(d.entries);
                            }
                            Ok(Some((DrawStage::Detached, count, None)))
                        }
                        DrawStage::Submitting => {
                            let d = state.in_flight.as_mut().map(|d| {
                                d.unresolved = true;
                                d.clone()
                            });
                            Ok(Some((DrawStage::Submitting, 0, d)))
                        }
                    }
                })
                .await?;

            match found {
                None => {}
                Some((DrawStage::Detached, count, _)) => {
                    warn!(
                        pot = %pot,
                        entries = count,
                        "interrupted draw found before payout; entries reinstated"
                    );
                    report.reinstated.push(pot);
                }
                Some((DrawStage::Submitting, _, draw)) => {
                    EngineMetrics::incr(&self.metrics.payouts_unresolved);
                    if let Some(d) = draw {
                        error!(
                            pot = %pot,
                            draw_id = %d.draw_id,
                            winner = d.winner.as_deref().unwrap_or("-"),
                            payout = d.payout.map_or(0, Lamports::get),
                            reference = d.settlement_reference.as_deref().unwrap_or("-"),
                            "PAYOUT OUTCOME UNKNOWN after restart; pot blocked until resolved"
                        );
                    }
                    report.unresolved.push(pot);
                }
            }
        }
        Ok(report)
    }

    /// Closes an unresolved payout according to the operator's decision.
    ///
    /// Returns the recorded result for [`Resolution::Settled`].
    pub async fn resolve(
        &self,
        pot: &str,
        resolution: Resolution,
    ) -> Result<Option<DrawResult>, EngineError> {
        let fee_bps = self.pot_config(pot)?.fee_bps;

        let result = self
            .store
            .mutate(pot, |state| {
                let draw = match &state.in_flight {
                    None => {
                        return Err(EngineError::from(StateError::NothingToResolve(pot.to_string())))
                    }
                    Some(d) if !d.unresolved => {
                        return Err(StateError::DrawInProgress(pot.to_string()).into())
                    }
                    Some(d) => d.clone(),
                };

                match &resolution {
                    Resolution::Settled { settlement_reference } => {
                        let reference = settlement_reference
                            .clone()
                            .or_else(|| draw.settlement_reference.clone())
                            .ok_or(ValidationError::MissingField("settlementReference"))?;
                        let result = DrawResult {
                            draw_id: draw.draw_id,
                            pot_id: pot.to_string(),
                            timestamp: Utc::now(),
                            winner: draw.winner.clone().unwrap_or_default(),
                            payout: draw
                                .payout
                                .unwrap_or_else(|| draw.total_pool().deduct_fee_bps(fee_bps)),
                            settlement_reference: reference,
                            participant_count: draw.entries.len(),
                            total_pool: draw.total_pool(),
                            total_effective: draw.total_effective(),
                        };
                        state.in_flight = None;
                        state.record_result(result.clone());
                        Ok(Some(result))
                    }
                    Resolution::Failed { reason } => {
                        let failure = DrawFailure {
                            draw_id: draw.draw_id,
                            pot_id: pot.to_string(),
                            timestamp: Utc::now(),
                            reason: format!("resolved as failed: {}", reason),
                            winner: draw.winner.clone(),
                            payout: draw.payout,
                            settlement_reference: draw.settlement_reference.clone(),
                            participant_count: draw.entries.len(),
                            total_pool: draw.total_pool(),
                        };
                        reinstate_in(state, draw.draw_id, Some(failure));
                        Ok(None)
                    }
                }
            })
            .await?;

        match &result {
            Some(r) => info!(
                pot,
                draw_id = %r.draw_id,
                reference = %r.settlement_reference,
                "unresolved payout resolved as settled"
            ),
            None => warn!(pot, "unresolved payout resolved as failed; entries reinstated"),
        }
        Ok(result)
    }
}

/// Moves the in-flight snapshot with `draw_id` back in front of the active
/// list. Returns `false` if no such draw is in flight.
fn reinstate_in(state: &mut PotState, draw_id: Uuid, failure: Option<DrawFailure>) -> bool {
    match state.in_flight.take() {
        Some(d) if d.draw_id == draw_id => {
            state.reinstate(d.entries);
            if let Some(f) = failure {
                state.record_failure(f);
            }
            true
        }
        other => {
            state.in_flight = other;
            false
        }
    }
}
