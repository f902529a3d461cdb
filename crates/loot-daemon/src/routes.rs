//! Axum router and all HTTP handlers for loot-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.
//!
//! Every non-2xx body is a `loot_schemas::ErrorBody`. Claim-protocol
//! rejections carry the taxonomy `reason` so clients can decide on retries.

use std::{convert::Infallible, future::Future, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header::AUTHORIZATION, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use loot_claims::reject_reason_for;
use loot_db::StoreError;
use loot_schemas::{
    endpoints, ClaimOutcome, ClaimRequest, ErrorBody, Identity, ItemBatchRequest, ItemOp,
    LockRequest, NonceRequest, ReconcileRequest, RegisterRequest, RejectReason,
};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    api_types::{AccountResponse, HealthResponse},
    state::{uptime_secs, AppState, BusMsg, StatusSnapshot},
};

/// Upper bound on ops in one batch request.
pub const MAX_BATCH_OPS: usize = 100;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (timeout, CORS, tracing) are **not** applied here;
/// `main.rs` attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/accounts/register", post(register))
        .route("/v1/accounts/:identity", get(account_read))
        .route("/v1/nonce", post(nonce_issue))
        .route("/v1/claims", post(claim_submit))
        .route("/v1/items/batch", post(items_batch))
        .route("/v1/items/:instance_id/lock", post(item_lock))
        .route("/v1/items/:instance_id/unlock", post(item_unlock))
        .route("/v1/admin/reconcile", post(admin_reconcile))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub fn status_for(reason: RejectReason) -> StatusCode {
    match reason {
        RejectReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        RejectReason::IdentityUnverified => StatusCode::FORBIDDEN,
        RejectReason::InvalidNonce
        | RejectReason::NonceExpired
        | RejectReason::NonceAlreadyConsumed
        | RejectReason::ClaimKeyConflict => StatusCode::CONFLICT,
        RejectReason::InvalidPayload => StatusCode::UNPROCESSABLE_ENTITY,
        RejectReason::TransientStoreError | RejectReason::Timeout => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn rejected(reason: RejectReason) -> Response {
    (status_for(reason), Json(ErrorBody::rejected(reason))).into_response()
}

fn store_failure(op: &'static str, e: &StoreError) -> Response {
    warn!(op, error = %e, "store call failed");
    rejected(reject_reason_for(e))
}

fn bad_body(e: JsonRejection) -> Response {
    warn!(error = %e, "request body rejected");
    rejected(RejectReason::InvalidPayload)
}

async fn within<T, F>(st: &AppState, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(st.store_timeout, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout))
}

async fn rate_limited(
    st: &AppState,
    identity: &Identity,
    endpoint: &str,
    policy: &loot_schemas::RateLimitPolicy,
) -> bool {
    !st.claims.limiter.check(identity, endpoint, policy).await
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

// ---------------------------------------------------------------------------
// GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let store_ok = within(&st, st.store.ping()).await.is_ok();
    let snap = StatusSnapshot {
        daemon_uptime_secs: uptime_secs(),
        store: st.store.kind().to_string(),
        store_ok,
        reconcile_direction: st.reconciler.direction(),
        last_reconcile: st.last_reconcile().await,
    };
    (StatusCode::OK, Json(snap))
}

// ---------------------------------------------------------------------------
// POST /v1/accounts/register
// ---------------------------------------------------------------------------

pub(crate) async fn register(
    State(st): State<Arc<AppState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(e),
    };
    let now = st.clock.now();
    match within(&st, st.store.register_account(&req.identity, now)).await {
        Ok(reg) => {
            if reg.created {
                info!(identity = %req.identity, "account registered");
            }
            let code = if reg.created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (code, Json(reg.account)).into_response()
        }
        Err(e) => store_failure("register_account", &e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/accounts/:identity
// ---------------------------------------------------------------------------

pub(crate) async fn account_read(
    State(st): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Response {
    let Ok(identity) = Identity::new(raw) else {
        return rejected(RejectReason::InvalidPayload);
    };
    if rate_limited(
        &st,
        &identity,
        endpoints::ACCOUNT_READ,
        &st.rate_limits.account_read,
    )
    .await
    {
        return rejected(RejectReason::RateLimited);
    }

    let account = match within(&st, st.store.fetch_account(&identity)).await {
        Ok(Some(a)) => a,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorBody::other("ACCOUNT_NOT_FOUND")),
            )
                .into_response()
        }
        Err(e) => return store_failure("fetch_account", &e),
    };
    match within(&st, st.store.list_instances(&identity)).await {
        Ok(instances) => (
            StatusCode::OK,
            Json(AccountResponse { account, instances }),
        )
            .into_response(),
        Err(e) => store_failure("list_instances", &e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/nonce
// ---------------------------------------------------------------------------

pub(crate) async fn nonce_issue(
    State(st): State<Arc<AppState>>,
    body: Result<Json<NonceRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(e),
    };
    match st.claims.nonces.issue(&req.identity, &req.session_ref).await {
        Ok(issued) => (StatusCode::OK, Json(issued)).into_response(),
        Err(reason) => rejected(reason),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/claims
// ---------------------------------------------------------------------------

pub(crate) async fn claim_submit(
    State(st): State<Arc<AppState>>,
    body: Result<Json<ClaimRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(e),
    };
    let outcome = st.claims.applier.apply(&req).await;
    match outcome {
        ClaimOutcome::Applied { duplicate, .. } => {
            let _ = st.bus.send(BusMsg::ClaimApplied {
                identity: req.identity.clone(),
                claim_key: req.claim_key.clone(),
                duplicate,
            });
            (StatusCode::OK, Json(outcome)).into_response()
        }
        ClaimOutcome::Rejected { reason } => rejected(reason),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/items/batch
// ---------------------------------------------------------------------------

fn batch_is_valid(ops: &[ItemOp]) -> bool {
    !ops.is_empty()
        && ops.len() <= MAX_BATCH_OPS
        && ops.iter().all(|op| match op {
            ItemOp::Add { item_type, .. } => !item_type.trim().is_empty(),
            ItemOp::Remove { .. } => true,
        })
}

pub(crate) async fn items_batch(
    State(st): State<Arc<AppState>>,
    body: Result<Json<ItemBatchRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(e),
    };
    if rate_limited(
        &st,
        &req.identity,
        endpoints::ITEM_BATCH,
        &st.rate_limits.item_batch,
    )
    .await
    {
        return rejected(RejectReason::RateLimited);
    }
    if !batch_is_valid(&req.ops) {
        return rejected(RejectReason::InvalidPayload);
    }

    let now = st.clock.now();
    match within(&st, st.store.apply_item_batch(&req.identity, &req.ops, now)).await {
        Ok(outcome) => {
            info!(
                identity = %req.identity,
                added = outcome.added_count(),
                removed = outcome.removed_count(),
                refused = outcome.refused.len(),
                "item batch applied"
            );
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => store_failure("apply_item_batch", &e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/items/:instance_id/lock | unlock
// ---------------------------------------------------------------------------

async fn set_lock(
    st: &AppState,
    instance_id: Uuid,
    body: Result<Json<LockRequest>, JsonRejection>,
    locked: bool,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => return bad_body(e),
    };
    if rate_limited(
        st,
        &req.identity,
        endpoints::ITEM_LOCK,
        &st.rate_limits.item_lock,
    )
    .await
    {
        return rejected(RejectReason::RateLimited);
    }
    match within(
        st,
        st.store.set_instance_lock(&req.identity, instance_id, locked),
    )
    .await
    {
        Ok(inst) => {
            info!(identity = %req.identity, %instance_id, locked, "instance lock changed");
            (StatusCode::OK, Json(inst)).into_response()
        }
        Err(StoreError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody::other("INSTANCE_NOT_FOUND")),
        )
            .into_response(),
        Err(e) => store_failure("set_instance_lock", &e),
    }
}

pub(crate) async fn item_lock(
    State(st): State<Arc<AppState>>,
    Path(instance_id): Path<Uuid>,
    body: Result<Json<LockRequest>, JsonRejection>,
) -> Response {
    set_lock(&st, instance_id, body, true).await
}

pub(crate) async fn item_unlock(
    State(st): State<Arc<AppState>>,
    Path(instance_id): Path<Uuid>,
    body: Result<Json<LockRequest>, JsonRejection>,
) -> Response {
    set_lock(&st, instance_id, body, false).await
}

// ---------------------------------------------------------------------------
// POST /v1/admin/reconcile
// ---------------------------------------------------------------------------

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

pub(crate) async fn admin_reconcile(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ReconcileRequest>, JsonRejection>,
) -> Response {
    let Some(token) = bearer(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::other("ADMIN_TOKEN_REQUIRED")),
        )
            .into_response();
    };
    if !st.admin_token_matches(token) {
        warn!("admin reconcile refused: bad token");
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorBody::other("ADMIN_TOKEN_INVALID")),
        )
            .into_response();
    }

    // An empty POST reconciles every account.
    let req = match body {
        Ok(Json(r)) => r,
        Err(JsonRejection::MissingJsonContentType(_)) => ReconcileRequest::default(),
        Err(e) => return bad_body(e),
    };
    info!(
        accounts = req.identities.len(),
        direction = ?req.direction,
        "admin/reconcile"
    );
    match st.run_reconcile(&req.identities, req.direction).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => store_failure("reconcile_all", &e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(m.event_name()).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
