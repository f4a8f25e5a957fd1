//! HTTP ingest API (C2 receiver side + C6 query surface).
//!
//! Six `/api/ingest/*` endpoints matching `vmtrack-wire`'s request/reply
//! shapes one for one, a `/api/usage/:vm_id` query endpoint, and an
//! unauthenticated `/healthz`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::warn;

use vmtrack_wire::{
    ErrorReply, ForceSyncReply, ForceSyncRequest, HeartbeatReply, HeartbeatRequest, RegisterReply,
    RegisterRequest, VmStartReply, VmStartRequest, VmStatesReply, VmStatesRequest, VmStatus,
    VmStopReply, VmStopRequest,
};

use crate::reconciler::{ObservedVm, ReconcileError, Reconciler};
use crate::store::{StoreError, VmKind as StoreVmKind, VmStatus as StoreVmStatus};
use crate::usage::UsageCalculator;

pub struct AppState {
    pub reconciler: Reconciler,
    pub usage: UsageCalculator,
    pub api_key: String,
    pub known_nodes: tokio::sync::RwLock<Vec<String>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/api/ingest/register", post(register))
        .route("/api/ingest/vm-start", post(vm_start))
        .route("/api/ingest/vm-stop", post(vm_stop))
        .route("/api/ingest/vm-states", post(vm_states))
        .route("/api/ingest/heartbeat", post(heartbeat))
        .route("/api/ingest/force-sync", post(force_sync))
        .route("/api/usage/:vm_id", get(usage))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(authenticated)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let provided = headers.get("X-API-Key").and_then(|v| v.to_str().ok());
    if provided != Some(state.api_key.as_str()) {
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid API key");
    }
    next.run(request).await
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorReply { error: message.into() })).into_response()
}

fn reconcile_error_response(e: ReconcileError) -> Response {
    match e {
        ReconcileError::Store(StoreError::NotFound(id)) => {
            error_response(StatusCode::NOT_FOUND, format!("no such session: {id}"))
        }
        ReconcileError::Store(StoreError::AlreadyOpen { node, vm_id, .. }) => {
            // The reconciler itself absorbs AlreadyOpen; seeing one
            // escape means a race the caller should just retry.
            warn!(node, vm_id, "already-open race surfaced to http layer");
            error_response(StatusCode::CONFLICT, "session already open, retry")
        }
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let known = state.known_nodes.read().await;
    Json(serde_json::json!({
        "status": "ok",
        "store": "connected",
        "known_nodes": known.len(),
    }))
    .into_response()
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let node = state.reconciler.register_node(&req.name, req.hostname).await;
    {
        let mut known = state.known_nodes.write().await;
        if !known.contains(&node.name) {
            known.push(node.name.clone());
        }
    }
    Json(RegisterReply {
        success: true,
        node_id: node.name,
    })
    .into_response()
}

async fn vm_start(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VmStartRequest>,
) -> Response {
    let result = state
        .reconciler
        .vm_start(
            &req.node,
            &req.vm_id,
            req.vm_name,
            to_store_kind(req.vm_type),
            req.start_time,
        )
        .await;

    match result {
        Ok(session) => Json(VmStartReply {
            success: true,
            session_id: session.id,
        })
        .into_response(),
        Err(e) => reconcile_error_response(e),
    }
}

async fn vm_stop(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VmStopRequest>,
) -> Response {
    match state.reconciler.vm_stop(&req.node, &req.vm_id, req.stop_time).await {
        Ok(Some(session)) => Json(VmStopReply {
            success: true,
            session_id: Some(session.id),
            duration_seconds: session.duration_seconds,
        })
        .into_response(),
        Ok(None) => Json(VmStopReply {
            success: true,
            session_id: None,
            duration_seconds: None,
        })
        .into_response(),
        Err(e) => reconcile_error_response(e),
    }
}

async fn vm_states(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VmStatesRequest>,
) -> Response {
    let observed = req
        .vms
        .into_iter()
        .map(|v| ObservedVm {
            vm_id: v.vm_id,
            kind: to_store_kind(v.kind),
            name: v.name,
            status: to_store_status(v.status),
            uptime_seconds: v.uptime,
        })
        .collect();

    match state.reconciler.vm_states(&req.node, req.timestamp, observed).await {
        Ok(outcome) => Json(VmStatesReply {
            success: true,
            vms_processed: outcome.vms_processed,
            sessions_started: outcome.sessions_started,
            sessions_stopped: outcome.sessions_stopped,
        })
        .into_response(),
        Err(e) => reconcile_error_response(e),
    }
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Json(req): Json<HeartbeatRequest>,
) -> Response {
    let force_sync = state.reconciler.drain_force_sync(&req.node);
    Json(HeartbeatReply {
        success: true,
        server_time: Utc::now(),
        force_sync,
    })
    .into_response()
}

async fn force_sync(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForceSyncRequest>,
) -> Response {
    let known = state.known_nodes.read().await.clone();
    let notified = state
        .reconciler
        .request_force_sync(req.target_node.as_deref(), &known);
    Json(ForceSyncReply {
        success: true,
        nodes_notified: notified,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    node: Option<String>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

async fn usage(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(vm_id): axum::extract::Path<String>,
    Query(q): Query<UsageQuery>,
) -> Response {
    let report = state
        .usage
        .usage(&vm_id, q.node.as_deref(), q.from, q.to)
        .await;

    Json(serde_json::json!({
        "vm_id": report.vm_id,
        "node": report.node,
        "window_start": report.window_start,
        "window_end": report.window_end,
        "total_seconds": report.total_seconds,
        "session_count": report.session_count,
        "estimated_cost": report.estimated_cost.map(|c| serde_json::json!({
            "cost": c.cost,
            "is_approximate": c.is_approximate,
        })),
        "daily": report.daily.iter().map(|d| serde_json::json!({
            "date": d.date.to_string(),
            "seconds": d.seconds,
        })).collect::<Vec<_>>(),
    }))
    .into_response()
}

fn to_store_kind(kind: vmtrack_wire::VmKind) -> StoreVmKind {
    match kind {
        vmtrack_wire::VmKind::FullVm => StoreVmKind::FullVm,
        vmtrack_wire::VmKind::Container => StoreVmKind::Container,
    }
}

fn to_store_status(status: VmStatus) -> StoreVmStatus {
    match status {
        VmStatus::Running => StoreVmStatus::Running,
        VmStatus::Stopped => StoreVmStatus::Stopped,
        VmStatus::Paused => StoreVmStatus::Paused,
        VmStatus::Unknown => StoreVmStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::force_sync::ForceSyncRegistry;
    use crate::store::InMemorySessionStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let store = Arc::new(InMemorySessionStore::new());
        Arc::new(AppState {
            reconciler: Reconciler::new(store.clone(), Arc::new(ForceSyncRegistry::new())),
            usage: UsageCalculator::new(store),
            api_key: "secret".to_string(),
            known_nodes: tokio::sync::RwLock::new(vec![]),
        })
    }

    #[tokio::test]
    async fn missing_api_key_is_rejected() {
        let app = router(test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/ingest/register")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::to_vec(&RegisterRequest {
                            name: "pve1".into(),
                            hostname: None,
                        })
                        .unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn healthz_needs_no_key() {
        let app = router(test_state());
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_with_valid_key_succeeds() {
        let app = router(test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/ingest/register")
                    .header("content-type", "application/json")
                    .header("X-API-Key", "secret")
                    .body(Body::from(
                        serde_json::to_vec(&RegisterRequest {
                            name: "pve1".into(),
                            hostname: Some("pve1.lan".into()),
                        })
                        .unwrap(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
