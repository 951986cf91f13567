//! HTTP surface of the draw engine.
//!
//! | Endpoint | Method | Description |
//! |----------|--------|-------------|
//! | `/enter` | POST | verify a contribution and credit it |
//! | `/participants/:pot` | GET | active entries, insertion order |
//! | `/history/:pot` | GET | settled draws, most recent first |
//! | `/last-winner/:pot` | GET | most recent draw, 404 when none |
//! | `/draw/:pot` | POST | manual draw trigger |
//! | `/pots` | GET | pot configs with live pool and next draw |
//! | `/failures/:pot` | GET | failed payouts, most recent first |
//! | `/admin/clear-winners/:pot` | POST | admin: clear history and last winner |
//! | `/admin/resolve/:pot` | POST | admin: close an unresolved payout |
//! | `/health` | GET | liveness and deposit address |
//! | `/metrics` | GET | Prometheus text |
//!
//! Amounts are rendered in native units (9 decimals) with the exact
//! lamport figure alongside. Errors are `{ ok: false, error, message }`,
//! including bodies that fail to parse.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use rapidpot_common::{ContributionEntry, DrawFailure, DrawResult};

use crate::engine::{EnterRequest, PotEngine, PotSummary};
use crate::error::{EngineError, StateError, ValidationError};
use crate::orchestrator::{DrawOutcome, Resolution};

// ════════════════════════════════════════════════════════════════════════════
// APP STATE
// ════════════════════════════════════════════════════════════════════════════

pub struct AppState {
    pub engine: Arc<PotEngine>,
    /// Bearer token for admin routes; `None` disables them.
    pub admin_token: Option<String>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<PotEngine>, admin_token: Option<String>) -> Self {
        Self {
            engine,
            admin_token,
            started_at: Instant::now(),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// REQUEST TYPES
// ════════════════════════════════════════════════════════════════════════════

/// `POST /enter` body. Accepts the legacy field names too.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterBody {
    #[serde(default)]
    pub pot: Option<String>,
    #[serde(default, alias = "wallet")]
    pub participant: Option<String>,
    #[serde(default, alias = "amount")]
    pub claimed_amount: Option<f64>,
    #[serde(default, alias = "tx")]
    pub transfer_reference: Option<String>,
    #[serde(default, alias = "hasLotto")]
    pub boost_claim: bool,
}

impl EnterBody {
    fn into_request(self) -> Result<EnterRequest, ValidationError> {
        Ok(EnterRequest {
            pot: self.pot,
            participant: self.participant.ok_or(ValidationError::MissingField("participant"))?,
            claimed_amount: self
                .claimed_amount
                .ok_or(ValidationError::MissingField("claimedAmount"))?,
            transfer_reference: self
                .transfer_reference
                .ok_or(ValidationError::MissingField("transferReference"))?,
            boost_claim: self.boost_claim,
        })
    }
}

/// `POST /admin/resolve/:pot` body.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveBody {
    #[serde(rename_all = "camelCase")]
    Settled {
        #[serde(default)]
        settlement_reference: Option<String>,
    },
    Failed {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl From<ResolveBody> for Resolution {
    fn from(body: ResolveBody) -> Self {
        match body {
            ResolveBody::Settled { settlement_reference } => {
                Resolution::Settled { settlement_reference }
            }
            ResolveBody::Failed { reason } => Resolution::Failed {
                reason: reason.unwrap_or_else(|| "operator decision".to_string()),
            },
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// RENDERING
// ════════════════════════════════════════════════════════════════════════════

pub fn error_status(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Validation(_) | EngineError::Verification(_) => StatusCode::BAD_REQUEST,
        EngineError::State(StateError::UnknownPot(_)) => StatusCode::NOT_FOUND,
        EngineError::State(_) => StatusCode::CONFLICT,
        EngineError::Settlement(_) => StatusCode::BAD_GATEWAY,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: &EngineError) -> (StatusCode, Json<Value>) {
    (
        error_status(e),
        Json(json!({ "ok": false, "error": e.kind(), "message": e.to_string() })),
    )
}

fn entry_json(e: &ContributionEntry) -> Value {
    json!({
        "participant": e.participant,
        "amount": e.amount.as_sol(),
        "amountLamports": e.amount.get(),
        "effectiveAmount": e.effective_amount.as_sol(),
        "effectiveLamports": e.effective_amount.get(),
        "boostEligible": e.boost_eligible,
        "transferReference": e.transfer_reference,
        "enteredAt": e.entered_at,
    })
}

fn result_json(r: &DrawResult) -> Value {
    json!({
        "drawId": r.draw_id,
        "pot": r.pot_id,
        "timestamp": r.timestamp,
        "winner": r.winner,
        "payout": r.payout.as_sol(),
        "payoutLamports": r.payout.get(),
        "settlementReference": r.settlement_reference,
        "participantCount": r.participant_count,
        "totalPool": r.total_pool.as_sol(),
        "totalEffective": r.total_effective.as_sol(),
    })
}

fn failure_json(f: &DrawFailure) -> Value {
    json!({
        "drawId": f.draw_id,
        "pot": f.pot_id,
        "timestamp": f.timestamp,
        "reason": f.reason,
        "winner": f.winner,
        "payout": f.payout.map(|p| p.as_sol()),
        "settlementReference": f.settlement_reference,
        "participantCount": f.participant_count,
        "totalPool": f.total_pool.as_sol(),
    })
}

fn summary_json(s: &PotSummary) -> Value {
    json!({
        "id": s.config.id,
        "label": s.config.label,
        "schedule": s.config.schedule,
        "feeBps": s.config.fee_bps,
        "tolerance": s.config.tolerance.as_sol(),
        "participants": s.participants,
        "pool": s.pool.as_sol(),
        "poolLamports": s.pool.get(),
        "nextDraw": s.next_draw,
        "drawing": s.drawing,
        "unresolved": s.unresolved,
    })
}

// ════════════════════════════════════════════════════════════════════════════
// ADMIN AUTH
// ════════════════════════════════════════════════════════════════════════════

/// Unparseable request bodies, in the common error shape.
fn body_rejection(rejection: JsonRejection) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "error": "invalid_body", "message": rejection.body_text() })),
    )
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({
                "ok": false,
                "error": "admin_disabled",
                "message": "no admin token configured"
            })),
        ));
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error": "unauthorized", "message": "invalid admin token" })),
        ))
    }
}

// ════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ════════════════════════════════════════════════════════════════════════════

/// POST /enter
pub async fn enter_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<EnterBody>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return body_rejection(rejection),
    };
    let request = match body.into_request() {
        Ok(r) => r,
        Err(e) => return error_response(&e.into()),
    };
    match state.engine.enter(request).await {
        Ok(entry) => (StatusCode::OK, Json(json!({ "ok": true, "entry": entry_json(&entry) }))),
        Err(e) => error_response(&e),
    }
}

/// GET /participants/:pot
pub async fn participants_handler(
    Path(pot): Path<String>,
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    match state.engine.participants(&pot) {
        Ok(entries) => (
            StatusCode::OK,
            Json(Value::Array(entries.iter().map(entry_json).collect())),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /history/:pot
pub async fn history_handler(
    Path(pot): Path<String>,
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    match state.engine.history(&pot) {
        Ok(history) => (
            StatusCode::OK,
            Json(Value::Array(history.iter().map(result_json).collect())),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /last-winner/:pot
pub async fn last_winner_handler(
    Path(pot): Path<String>,
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    match state.engine.last_winner(&pot) {
        Ok(Some(result)) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "result": result_json(&result) })),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "ok": false,
                "error": "not_found",
                "message": "no winner found for this pot"
            })),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /failures/:pot
pub async fn failures_handler(
    Path(pot): Path<String>,
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    match state.engine.failures(&pot) {
        Ok(failures) => (
            StatusCode::OK,
            Json(Value::Array(failures.iter().map(failure_json).collect())),
        ),
        Err(e) => error_response(&e),
    }
}

/// GET /pots
pub async fn pots_handler(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    match state.engine.pots() {
        Ok(pots) => (
            StatusCode::OK,
            Json(Value::Array(pots.iter().map(summary_json).collect())),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /draw/:pot
///
/// The draw runs on its own task; a client disconnect does not cancel it.
pub async fn draw_handler(
    Path(pot): Path<String>,
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<Value>) {
    let outcome = match state.engine.spawn_draw(&pot).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(pot = %pot, error = %e, "draw task failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "internal", "message": "draw task failed" })),
            );
        }
    };
    match outcome {
        Ok(DrawOutcome::Completed(result)) => {
            (StatusCode::OK, Json(json!({ "ok": true, "result": result_json(&result) })))
        }
        Ok(DrawOutcome::NoParticipants) => (
            StatusCode::OK,
            Json(json!({ "ok": false, "status": "no_participants", "message": "No participants" })),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /admin/clear-winners/:pot
pub async fn clear_winners_handler(
    Path(pot): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.engine.clear_history(&pot).await {
        Ok(cleared) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "cleared": cleared, "message": "Winners cleared." })),
        ),
        Err(e) => error_response(&e),
    }
}

/// POST /admin/resolve/:pot
pub async fn resolve_handler(
    Path(pot): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ResolveBody>, JsonRejection>,
) -> (StatusCode, Json<Value>) {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return body_rejection(rejection),
    };
    match state.engine.resolve(&pot, body.into()).await {
        Ok(Some(result)) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "outcome": "settled", "result": result_json(&result) })),
        ),
        Ok(None) => (StatusCode::OK, Json(json!({ "ok": true, "outcome": "failed" }))),
        Err(e) => error_response(&e),
    }
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "status": "healthy",
        "adminAddress": state.engine.admin_address(),
        "pots": state.engine.pot_configs().iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics().to_prometheus(),
    )
}

// ════════════════════════════════════════════════════════════════════════════
// ROUTER
// ════════════════════════════════════════════════════════════════════════════

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Entries
        .route("/enter", post(enter_handler))
        .route("/participants/:pot", get(participants_handler))
        // Draws
        .route("/draw/:pot", post(draw_handler))
        .route("/history/:pot", get(history_handler))
        .route("/last-winner/:pot", get(last_winner_handler))
        .route("/failures/:pot", get(failures_handler))
        .route("/pots", get(pots_handler))
        // Admin
        .route("/admin/clear-winners/:pot", post(clear_winners_handler))
        .route("/admin/resolve/:pot", post(resolve_handler))
        // Observability
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainQuery, MockTokenBalances, MockTransferSubmitter, SettlementStatus};
    use crate::engine::{EngineDeps, EngineSettings};
    use crate::error::{SettlementError, StoreError, VerificationError};
    use crate::retry::RetryPolicy;
    use crate::selector::FixedPoint;
    use crate::store::MemoryBackend;
    use axum::extract::FromRequest;
    use axum::http::HeaderValue;
    use rapidpot_common::{default_pots, Lamports};

    fn addr(n: u8) -> String {
        bs58::encode([n; 32]).into_string()
    }

    fn sig(n: u8) -> String {
        bs58::encode([n; 64]).into_string()
    }

    struct Harness {
        chain: Arc<MockChainQuery>,
        submitter: Arc<MockTransferSubmitter>,
        state: Arc<AppState>,
    }

    fn harness(token: Option<&str>) -> Harness {
        let chain = Arc::new(MockChainQuery::new());
        let submitter = Arc::new(MockTransferSubmitter::new());
        let mut settings = EngineSettings::new(default_pots(), &addr(200));
        settings.verify_policy = RetryPolicy::immediate(1);
        settings.confirm_policy = RetryPolicy::immediate(1);
        let engine = PotEngine::new(
            settings,
            EngineDeps {
                chain: chain.clone(),
                submitter: submitter.clone(),
                balances: Arc::new(MockTokenBalances::new()),
                backend: Arc::new(MemoryBackend::new()),
                rng: Arc::new(FixedPoint(0)),
            },
        )
        .unwrap_or_else(|e| panic!("engine: {}", e));
        Harness {
            chain,
            submitter,
            state: Arc::new(AppState::new(Arc::new(engine), token.map(str::to_string))),
        }
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .unwrap_or_else(|e| panic!("header: {}", e));
        headers.insert(header::AUTHORIZATION, value);
        headers
    }

    fn legacy_body(who: u8, reference: u8, sol: f64) -> EnterBody {
        serde_json::from_value(json!({
            "wallet": addr(who),
            "amount": sol,
            "tx": sig(reference),
            "hasLotto": false,
        }))
        .unwrap_or_else(|e| panic!("body: {}", e))
    }

    // ── Test 1: status mapping ──
    #[test]
    fn status_mapping() {
        let cases: Vec<(EngineError, StatusCode)> = vec![
            (ValidationError::MissingField("x").into(), StatusCode::BAD_REQUEST),
            (
                VerificationError::ChainError { reference: "r".into(), reason: "x".into() }.into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                VerificationError::SourceMismatch {
                    reference: "r".into(),
                    expected_source: "a".into(),
                    observed_source: "b".into(),
                }
                .into(),
                StatusCode::BAD_REQUEST,
            ),
            (StateError::UnknownPot("x".into()).into(), StatusCode::NOT_FOUND),
            (StateError::DrawInProgress("x".into()).into(), StatusCode::CONFLICT),
            (StateError::DuplicateTransfer("x".into()).into(), StatusCode::CONFLICT),
            (StateError::PayoutUnresolved("x".into()).into(), StatusCode::CONFLICT),
            (
                SettlementError::Unconfirmed { reference: None, attempts: 1 }.into(),
                StatusCode::BAD_GATEWAY,
            ),
            (StoreError::Io("disk".into()).into(), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (e, status) in cases {
            assert_eq!(error_status(&e), status, "{:?}", e);
        }
    }

    // ── Test 2: legacy field names are accepted ──
    #[tokio::test]
    async fn enter_with_legacy_fields() {
        let h = harness(None);
        h.chain.push_transfer(&sig(1), &addr(1), &addr(200), 250_000_000);
        let (status, Json(body)) =
            enter_handler(State(h.state.clone()), Ok(Json(legacy_body(1, 1, 0.25)))).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["ok"], json!(true));
        assert_eq!(body["entry"]["amountLamports"], json!(250_000_000u64));

        let (status, Json(list)) =
            participants_handler(Path("main".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().map(Vec::len), Some(1));
    }

    // ── Test 3: missing fields ──
    #[tokio::test]
    async fn enter_missing_fields_is_400() {
        let h = harness(None);
        let (status, Json(body)) =
            enter_handler(State(h.state.clone()), Ok(Json(EnterBody::default()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("validation_error"));
    }

    // ── Test 4: amount mismatch surfaces both values ──
    #[tokio::test]
    async fn enter_amount_mismatch() {
        let h = harness(None);
        h.chain.push_transfer(&sig(1), &addr(1), &addr(200), 1_000_110_000);
        let (status, Json(body)) =
            enter_handler(State(h.state.clone()), Ok(Json(legacy_body(1, 1, 1.0)))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("amount_mismatch"));
        let message = body["message"].as_str().unwrap_or_default().to_string();
        assert!(message.contains("1.000110000"), "{}", message);
    }

    // ── Test 5: unknown pot / no winner ──
    #[tokio::test]
    async fn not_found_responses() {
        let h = harness(None);
        let (status, _) = history_handler(Path("nope".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = last_winner_handler(Path("main".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ── Test 6: manual draw ──
    #[tokio::test]
    async fn manual_draw_pays_and_records() {
        let h = harness(None);
        let (status, Json(body)) = draw_handler(Path("main".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], json!("no_participants"));

        h.chain.push_transfer(&sig(1), &addr(1), &addr(200), 1_000_000_000);
        let _ = enter_handler(State(h.state.clone()), Ok(Json(legacy_body(1, 1, 1.0)))).await;
        h.submitter.push_submission(Ok("payout".into()));
        h.submitter.push_status(Ok(SettlementStatus::Confirmed));

        let (status, Json(body)) = draw_handler(Path("main".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["result"]["winner"], json!(addr(1)));
        assert_eq!(body["result"]["payoutLamports"], json!(970_000_000u64));
        assert_eq!(h.submitter.submitted(), vec![(addr(1), Lamports(970_000_000))]);

        let (status, Json(last)) =
            last_winner_handler(Path("main".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(last["result"]["settlementReference"], json!("payout"));
    }

    // ── Test 7: admin auth ──
    #[tokio::test]
    async fn admin_routes_require_token() {
        let main = || Path("main".to_string());
        let disabled = harness(None);
        let (status, _) =
            clear_winners_handler(main(), State(disabled.state.clone()), bearer("x")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let h = harness(Some("s3cret"));
        let (status, _) =
            clear_winners_handler(main(), State(h.state.clone()), bearer("wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) =
            clear_winners_handler(main(), State(h.state.clone()), HeaderMap::new()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, Json(body)) =
            clear_winners_handler(main(), State(h.state.clone()), bearer("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));

        let body: ResolveBody = serde_json::from_value(json!({ "outcome": "failed" }))
            .unwrap_or_else(|e| panic!("{}", e));
        let (status, Json(body)) =
            resolve_handler(main(), State(h.state.clone()), bearer("s3cret"), Ok(Json(body))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], json!("nothing_to_resolve"));
    }

    // ── Test 8: resolve body parsing ──
    #[test]
    fn resolve_body_variants() {
        let settled: ResolveBody =
            serde_json::from_value(json!({ "outcome": "settled", "settlementReference": "abc" }))
                .unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(
            Resolution::from(settled),
            Resolution::Settled { settlement_reference: Some("abc".into()) }
        );
        let failed: ResolveBody =
            serde_json::from_value(json!({ "outcome": "failed", "reason": "dropped" }))
                .unwrap_or_else(|e| panic!("{}", e));
        assert_eq!(Resolution::from(failed), Resolution::Failed { reason: "dropped".into() });
    }

    #[test]
    fn token_comparison() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[tokio::test]
    async fn health_and_metrics() {
        let h = harness(None);
        let Json(body) = health_handler(State(h.state.clone())).await;
        assert_eq!(body["adminAddress"], json!(addr(200)));
        let prom = h.state.engine.metrics().to_prometheus();
        assert!(prom.contains("rapidpot_entries_accepted_total 0"));
    }

    async fn json_body<T>(raw: &'static str) -> Result<Json<T>, JsonRejection>
    where
        T: serde::de::DeserializeOwned,
    {
        let request = axum::http::Request::builder()
            .method("POST")
            .header(header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(raw))
            .unwrap_or_else(|e| panic!("request: {}", e));
        Json::<T>::from_request(request, &()).await
    }

    // ── Test 9: unparseable bodies keep the error shape ──
    #[tokio::test]
    async fn malformed_body_is_json_error() {
        let main = || Path("main".to_string());
        let h = harness(Some("s3cret"));
        for raw in ["{ not json", r#"{ "wallet": 7 }"#] {
            let body = json_body::<EnterBody>(raw).await;
            assert!(body.is_err(), "{}", raw);
            let (status, Json(reply)) = enter_handler(State(h.state.clone()), body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", raw);
            assert_eq!(reply["ok"], json!(false));
            assert_eq!(reply["error"], json!("invalid_body"));
            assert!(reply["message"].as_str().is_some_and(|m| !m.is_empty()));
        }

        let body = json_body::<ResolveBody>(r#"{ "outcome": "maybe" }"#).await;
        let (status, Json(reply)) =
            resolve_handler(main(), State(h.state.clone()), bearer("s3cret"), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(reply["error"], json!("invalid_body"));
    }

    // ── Test 10: clearing a non-empty history ──
    #[tokio::test]
    async fn clear_winners_empties_history() {
        let main = || Path("main".to_string());
        let h = harness(Some("s3cret"));
        h.chain.push_transfer(&sig(1), &addr(1), &addr(200), 1_000_000_000);
        let _ = enter_handler(State(h.state.clone()), Ok(Json(legacy_body(1, 1, 1.0)))).await;
        h.submitter.push_submission(Ok("payout".into()));
        h.submitter.push_status(Ok(SettlementStatus::Confirmed));
        let (status, _) = draw_handler(Path("main".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, Json(body)) =
            clear_winners_handler(main(), State(h.state.clone()), bearer("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cleared"], json!(1));

        let (status, Json(history)) =
            history_handler(Path("main".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history, json!([]));
        let (status, _) = last_winner_handler(Path("main".into()), State(h.state.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
