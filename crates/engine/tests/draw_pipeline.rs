//! # Integration Tests: Contribution and Draw Pipeline
//!
//! End-to-end runs through [`PotEngine`] with mock chain transports:
//! enter, draw, pay out, persist, restart.
//!
//! ## Coverage
//!
//! - Full pipeline: verified entries, weighted winner, fee-adjusted payout
//! - Concurrent entries are all credited
//! - Failed payouts keep entries and stay out of history
//! - A second trigger during a draw is rejected without a second payout
//! - Entries arriving mid-draw join the next round
//! - State survives a restart on a file backend
//! - Amount mismatch rejects the contribution
//! - A transfer can only be claimed by the account that paid it
//! - Shutdown waits for a detached draw to settle

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use rapidpot_common::{default_pots, Lamports};
use rapidpot_engine::{
    ChainClientError, DrawOutcome, EngineDeps, EngineError, EngineSettings, EnterRequest,
    FileBackend, FixedPoint, MemoryBackend, MockChainQuery, MockTokenBalances,
    MockTransferSubmitter, PotEngine, RandomSource, RetryPolicy, SettlementError,
    SettlementStatus, StateBackend, StateError, VerificationError,
};

// ════════════════════════════════════════════════════════════════════════════════
// HELPERS
// ════════════════════════════════════════════════════════════════════════════════

const ADMIN: u8 = 200;

fn addr(n: u8) -> String {
    bs58::encode([n; 32]).into_string()
}

fn sig(n: u8) -> String {
    bs58::encode([n; 64]).into_string()
}

struct Harness {
    chain: Arc<MockChainQuery>,
    submitter: Arc<MockTransferSubmitter>,
    balances: Arc<MockTokenBalances>,
    engine: Arc<PotEngine>,
}

fn harness_with(
    backend: Arc<dyn StateBackend>,
    rng: Arc<dyn RandomSource>,
    confirm: RetryPolicy,
) -> Harness {
    let chain = Arc::new(MockChainQuery::new());
    let submitter = Arc::new(MockTransferSubmitter::new());
    let balances = Arc::new(MockTokenBalances::new());
    let mut settings = EngineSettings::new(default_pots(), &addr(ADMIN));
    settings.verify_policy = RetryPolicy::immediate(2);
    settings.confirm_policy = confirm;
    let engine = PotEngine::new(
        settings,
        EngineDeps {
            chain: chain.clone(),
            submitter: submitter.clone(),
            balances: balances.clone(),
            backend,
            rng,
        },
    )
    .unwrap_or_else(|e| panic!("test setup: engine: {}", e));
    Harness {
        chain,
        submitter,
        balances,
        engine: Arc::new(engine),
    }
}

fn harness(point: u64) -> Harness {
    harness_with(
        Arc::new(MemoryBackend::new()),
        Arc::new(FixedPoint(point)),
        RetryPolicy::immediate(3),
    )
}

fn request(who: u8, reference: u8, sol: f64) -> EnterRequest {
    EnterRequest {
        pot: Some("main".to_string()),
        participant: addr(who),
        claimed_amount: sol,
        transfer_reference: sig(reference),
        boost_claim: false,
    }
}

async fn enter_paid(h: &Harness, who: u8, reference: u8, lamports: u64) {
    h.chain.push_transfer(&sig(reference), &addr(who), &addr(ADMIN), lamports);
    h.engine
        .enter(request(who, reference, lamports as f64 / 1e9))
        .await
        .unwrap_or_else(|e| panic!("enter {}: {}", who, e));
}

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════

// ── Test 1: enter, draw, pay, record ──
#[tokio::test]
async fn full_pipeline_pays_weighted_winner() {
    // 0.5 SOL then 3.5 SOL; point 1.0 SOL lands in the second entry.
    let h = harness(1_000_000_000);
    enter_paid(&h, 1, 1, 500_000_000).await;
    enter_paid(&h, 2, 2, 3_500_000_000).await;

    h.submitter.push_submission(Ok("payout-sig".to_string()));
    h.submitter.push_status(Ok(SettlementStatus::Pending));
    h.submitter.push_status(Ok(SettlementStatus::Confirmed));

    let outcome = h.engine.draw("main").await.unwrap_or_else(|e| panic!("draw: {}", e));
    let result = match outcome {
        DrawOutcome::Completed(r) => r,
        other => panic!("expected completed draw, got {:?}", other),
    };
    assert_eq!(result.winner, addr(2));
    assert_eq!(result.total_pool, Lamports(4_000_000_000));
    assert_eq!(result.payout, Lamports(3_880_000_000));
    assert_eq!(result.participant_count, 2);
    assert_eq!(result.settlement_reference, "payout-sig");

    assert_eq!(h.submitter.submitted(), vec![(addr(2), Lamports(3_880_000_000))]);
    assert!(h.engine.participants("main").unwrap_or_default().is_empty());
    assert_eq!(h.engine.history("main").unwrap_or_default(), vec![result.clone()]);
    assert_eq!(h.engine.last_winner("main").unwrap_or_default(), Some(result));

    let m = h.engine.metrics().snapshot();
    assert_eq!(m.entries_accepted, 2);
    assert_eq!(m.draws_completed, 1);
    assert_eq!(m.lamports_paid_out, 3_880_000_000);
}

// ── Test 2: concurrent entries are all credited ──
#[tokio::test]
async fn concurrent_entries_are_all_recorded() {
    let h = harness(0);
    const N: u8 = 24;
    for i in 1..=N {
        h.chain.push_transfer(&sig(i), &addr(i), &addr(ADMIN), 100_000_000);
    }

    let mut set = JoinSet::new();
    for i in 1..=N {
        let engine = h.engine.clone();
        set.spawn(async move { engine.enter(request(i, i, 0.1)).await });
    }
    while let Some(joined) = set.join_next().await {
        joined
            .unwrap_or_else(|e| panic!("join: {}", e))
            .unwrap_or_else(|e| panic!("enter: {}", e));
    }

    let entries = h.engine.participants("main").unwrap_or_default();
    assert_eq!(entries.len(), N as usize);
    let pots = h.engine.pots().unwrap_or_default();
    let main = pots.iter().find(|p| p.config.id == "main");
    assert_eq!(main.map(|p| p.pool), Some(Lamports(100_000_000 * N as u64)));
}

// ── Test 3: duplicate reference credited once, including concurrently ──
#[tokio::test]
async fn duplicate_reference_is_credited_once() {
    let h = harness(0);
    h.chain.push_transfer(&sig(9), &addr(1), &addr(ADMIN), 100_000_000);

    let (a, b) = tokio::join!(
        h.engine.enter(request(1, 9, 0.1)),
        h.engine.enter(request(1, 9, 0.1)),
    );
    let ok = [a.is_ok(), b.is_ok()].iter().filter(|x| **x).count();
    assert_eq!(ok, 1);

    let again = h.engine.enter(request(1, 9, 0.1)).await;
    assert_eq!(
        again.err(),
        Some(EngineError::from(StateError::DuplicateTransfer(sig(9))))
    );
    assert_eq!(h.engine.participants("main").unwrap_or_default().len(), 1);
}

// ── Test 4: a failed payout keeps entries and stays out of history ──
#[tokio::test]
async fn failed_payout_reinstates_entries() {
    let h = harness(0);
    enter_paid(&h, 1, 1, 1_000_000_000).await;
    enter_paid(&h, 2, 2, 2_000_000_000).await;
    let before = h.engine.participants("main").unwrap_or_default();

    h.submitter.push_submission(Ok("doomed-sig".to_string()));
    h.submitter
        .push_send(Err(ChainClientError::Rejected("insufficient funds".to_string())));
    let err = h.engine.draw("main").await;
    assert!(
        matches!(err, Err(EngineError::Settlement(SettlementError::SettlementFailed { .. }))),
        "{:?}",
        err
    );

    assert_eq!(h.engine.participants("main").unwrap_or_default(), before);
    assert!(h.engine.history("main").unwrap_or_default().is_empty());
    assert_eq!(h.engine.last_winner("main").unwrap_or_default(), None);
    let failures = h.engine.failures("main").unwrap_or_default();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].winner, Some(addr(1)));
    assert_eq!(failures[0].settlement_reference.as_deref(), Some("doomed-sig"));
    assert_eq!(h.engine.metrics().snapshot().payout_failures, 1);

    // The next round pays from the same entries.
    h.submitter.push_submission(Ok("retry-sig".to_string()));
    h.submitter.push_status(Ok(SettlementStatus::Confirmed));
    let outcome = h.engine.draw("main").await.unwrap_or_else(|e| panic!("draw: {}", e));
    assert!(matches!(
        outcome,
        DrawOutcome::Completed(ref r) if r.total_pool == Lamports(3_000_000_000)
    ));
}

// ── Test 5: a second trigger during a draw is rejected ──
#[tokio::test]
async fn second_trigger_during_draw_is_rejected() {
    let h = harness_with(
        Arc::new(MemoryBackend::new()),
        Arc::new(FixedPoint(0)),
        RetryPolicy::new(3, Duration::from_millis(50)),
    );
    enter_paid(&h, 1, 1, 1_000_000_000).await;
    h.submitter.push_submission(Ok("slow-sig".to_string()));
    h.submitter.push_status(Ok(SettlementStatus::Pending));
    h.submitter.push_status(Ok(SettlementStatus::Pending));
    h.submitter.push_status(Ok(SettlementStatus::Confirmed));

    let first = h.engine.spawn_draw("main");
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = h.engine.draw("main").await;
    assert_eq!(
        second,
        Err(EngineError::from(StateError::DrawInProgress("main".to_string())))
    );

    // Entries made while the draw is running belong to the next round.
    enter_paid(&h, 2, 2, 250_000_000).await;

    let outcome = first
        .await
        .unwrap_or_else(|e| panic!("join: {}", e))
        .unwrap_or_else(|e| panic!("draw: {}", e));
    match outcome {
        DrawOutcome::Completed(r) => {
            assert_eq!(r.winner, addr(1));
            assert_eq!(r.participant_count, 1);
        }
        other => panic!("expected completed draw, got {:?}", other),
    }
    assert_eq!(h.submitter.submitted().len(), 1);

    let remaining = h.engine.participants("main").unwrap_or_default();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].participant, addr(2));
}

// ── Test 6: state survives a restart ──
#[tokio::test]
async fn file_backed_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {}", e));
    let path = dir.path().join("db.json");

    {
        let h = harness_with(
            Arc::new(FileBackend::new(&path)),
            Arc::new(FixedPoint(0)),
            RetryPolicy::immediate(1),
        );
        enter_paid(&h, 1, 1, 1_000_000_000).await;
        enter_paid(&h, 2, 2, 500_000_000).await;
        h.engine.flush().await.unwrap_or_else(|e| panic!("flush: {}", e));
    }

    let h = harness_with(
        Arc::new(FileBackend::new(&path)),
        Arc::new(FixedPoint(0)),
        RetryPolicy::immediate(1),
    );
    let entries = h.engine.participants("main").unwrap_or_default();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].participant, addr(1));
    assert_eq!(entries[1].amount, Lamports(500_000_000));

    // Spent references are restored with the document.
    h.chain.push_transfer(&sig(1), &addr(1), &addr(ADMIN), 1_000_000_000);
    let dup = h.engine.enter(request(1, 1, 1.0)).await;
    assert_eq!(
        dup.err(),
        Some(EngineError::from(StateError::DuplicateTransfer(sig(1))))
    );
}

// ── Test 7: amount outside tolerance is rejected ──
#[tokio::test]
async fn amount_mismatch_is_rejected() {
    let h = harness(0);
    h.chain.push_transfer(&sig(1), &addr(1), &addr(ADMIN), 1_000_110_000);

    let err = h.engine.enter(request(1, 1, 1.0)).await;
    match err {
        Err(EngineError::Verification(VerificationError::AmountMismatch {
            claimed, observed, ..
        })) => {
            assert_eq!(claimed, Lamports(1_000_000_000));
            assert_eq!(observed, Lamports(1_000_110_000));
        }
        other => panic!("expected amount mismatch, got {:?}", other),
    }
    assert!(h.engine.participants("main").unwrap_or_default().is_empty());

    // Within tolerance the on-chain amount is credited.
    h.chain.push_transfer(&sig(2), &addr(1), &addr(ADMIN), 1_000_050_000);
    let entry = h
        .engine
        .enter(request(1, 2, 1.0))
        .await
        .unwrap_or_else(|e| panic!("enter: {}", e));
    assert_eq!(entry.amount, Lamports(1_000_050_000));
}

// ── Test 8: boost raises weight but not pool ──
#[tokio::test]
async fn boost_changes_weight_only() {
    let h = {
        let chain = Arc::new(MockChainQuery::new());
        let submitter = Arc::new(MockTransferSubmitter::new());
        let balances = Arc::new(MockTokenBalances::new());
        let mut settings = EngineSettings::new(default_pots(), &addr(ADMIN));
        settings.verify_policy = RetryPolicy::immediate(1);
        settings.boost = Some(rapidpot_engine::BoostPolicy { mint: addr(77), min_balance: 1 });
        let engine = PotEngine::new(
            settings,
            EngineDeps {
                chain: chain.clone(),
                submitter: submitter.clone(),
                balances: balances.clone(),
                backend: Arc::new(MemoryBackend::new()),
                rng: Arc::new(FixedPoint(0)),
            },
        )
        .unwrap_or_else(|e| panic!("engine: {}", e));
        Harness { chain, submitter, balances, engine: Arc::new(engine) }
    };
    h.balances.set_balance(&addr(1), 5);
    h.chain.push_transfer(&sig(1), &addr(1), &addr(ADMIN), 1_000_000_000);
    let mut req = request(1, 1, 1.0);
    req.boost_claim = true;
    let entry = h.engine.enter(req).await.unwrap_or_else(|e| panic!("enter: {}", e));
    assert!(entry.boost_eligible);
    assert_eq!(entry.amount, Lamports(1_000_000_000));
    assert_eq!(entry.effective_amount, Lamports(1_300_000_000));

    // Claimed boost without holdings: plain weight.
    h.chain.push_transfer(&sig(2), &addr(2), &addr(ADMIN), 1_000_000_000);
    let mut req = request(2, 2, 1.0);
    req.boost_claim = true;
    let entry = h.engine.enter(req).await.unwrap_or_else(|e| panic!("enter: {}", e));
    assert!(!entry.boost_eligible);
    assert_eq!(entry.effective_amount, Lamports(1_000_000_000));
    assert!(h.submitter.submitted().is_empty());
}

// ── Test 9: a reference paid by someone else cannot be claimed ──
#[tokio::test]
async fn foreign_transfer_cannot_be_claimed() {
    let h = harness(0);
    h.chain.push_transfer(&sig(1), &addr(1), &addr(ADMIN), 1_000_000_000);

    let stolen = h.engine.enter(request(2, 1, 1.0)).await;
    assert!(
        matches!(
            stolen,
            Err(EngineError::Verification(VerificationError::SourceMismatch { .. }))
        ),
        "{:?}",
        stolen
    );
    assert!(h.engine.participants("main").unwrap_or_default().is_empty());

    let entry = h
        .engine
        .enter(request(1, 1, 1.0))
        .await
        .unwrap_or_else(|e| panic!("enter: {}", e));
    assert_eq!(entry.participant, addr(1));
}

// ── Test 10: shutdown drains a draw whose caller went away ──
#[tokio::test]
async fn detached_draw_is_drained() {
    let h = harness_with(
        Arc::new(MemoryBackend::new()),
        Arc::new(FixedPoint(0)),
        RetryPolicy::new(3, Duration::from_millis(30)),
    );
    enter_paid(&h, 1, 1, 1_000_000_000).await;
    h.submitter.push_submission(Ok("drained-sig".to_string()));
    h.submitter.push_status(Ok(SettlementStatus::Pending));
    h.submitter.push_status(Ok(SettlementStatus::Confirmed));

    drop(h.engine.spawn_draw("main"));
    assert_eq!(h.engine.wait_for_draws().await, 1);

    let last = h
        .engine
        .last_winner("main")
        .unwrap_or_default()
        .unwrap_or_else(|| panic!("draw settled before shutdown"));
    assert_eq!(last.settlement_reference, "drained-sig");
    h.engine.flush().await.unwrap_or_else(|e| panic!("flush: {}", e));
}
