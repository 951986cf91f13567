//! Per-pot draw timers.
//!
//! Shutdown is a `watch` flag rather than a notification: a scheduler that
//! is busy with a draw when the flag flips sees it before its next sleep,
//! and a draw that has started always runs to completion.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use rapidpot_common::PotConfig;

use crate::error::{EngineError, StateError};
use crate::orchestrator::{DrawOrchestrator, DrawOutcome};

/// Background timer that triggers one pot's draws on its schedule.
pub struct DrawScheduler {
    pot: PotConfig,
    orchestrator: Arc<DrawOrchestrator>,
    shutdown: watch::Receiver<bool>,
}

impl DrawScheduler {
    pub fn new(
        pot: PotConfig,
        orchestrator: Arc<DrawOrchestrator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pot,
            orchestrator,
            shutdown,
        }
    }

    /// One task per pot.
    pub fn spawn_all(
        pots: &[PotConfig],
        orchestrator: &Arc<DrawOrchestrator>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        pots.iter()
            .map(|pot| Self::new(pot.clone(), orchestrator.clone(), shutdown.clone()).start())
            .collect()
    }

    /// Time left until the next scheduled draw.
    pub fn until_next(&self) -> Duration {
        let now = Utc::now();
        (self.pot.schedule.next_after(now) - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(pot = %self.pot.id, schedule = ?self.pot.schedule, "draw scheduler started");
            let mut shutdown = self.shutdown.clone();
            loop {
                if *shutdown.borrow_and_update() {
                    break;
                }
                let wait = self.until_next();
                tokio::select! {
                    changed = shutdown.changed() => {
                        // a dropped sender also means shutdown
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = sleep(wait) => {
                        self.run_once().await;
                    }
                }
            }
            info!(pot = %self.pot.id, "draw scheduler stopped");
        })
    }

    async fn run_once(&self) {
        let pot = self.pot.id.as_str();
        match self.orchestrator.draw(pot).await {
            Ok(DrawOutcome::Completed(result)) => {
                info!(
                    pot,
                    winner = %result.winner,
                    payout = result.payout.get(),
                    "scheduled draw completed"
                );
            }
            Ok(DrawOutcome::NoParticipants) => {}
            Err(EngineError::State(StateError::DrawInProgress(_))) => {
                warn!(pot, "scheduled draw skipped: draw already in progress");
            }
            Err(EngineError::State(StateError::PayoutUnresolved(_))) => {
                error!(pot, "scheduled draw skipped: unresolved payout needs operator action");
            }
            Err(e) => {
                error!(pot, error = %e, "scheduled draw failed");
            }
        }
    }
}
