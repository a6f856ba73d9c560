use crate::infra::AppState;
use axum::extract::Path;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sunbid::workflows::procurement::router::{actor_from, ApiError};
use sunbid::workflows::procurement::{
    procurement_router, ActorId, Notification, ProcurementError, Role,
};

#[derive(Debug, Serialize)]
pub(crate) struct InboxResponse {
    pub(crate) user_id: ActorId,
    pub(crate) unread: usize,
    pub(crate) notifications: Vec<Notification>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MarkReadRequest {
    pub(crate) up_to_sequence: u64,
}

/// Procurement API plus the operational and inbox endpoints served by the binary.
pub(crate) fn app_router(state: AppState) -> Router {
    procurement_router(state.service.clone())
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/notifications/:user_id", get(inbox_endpoint))
        .route(
            "/api/v1/notifications/:user_id/read",
            post(mark_read_endpoint),
        )
        .layer(Extension(state))
}

/// Liveness plus the engine's fault channel; degraded engines still answer 200.
pub(crate) async fn healthcheck(Extension(state): Extension<AppState>) -> impl IntoResponse {
    Json(state.service.health())
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

fn inbox_owner(headers: &HeaderMap, user_id: &str) -> Result<ActorId, ApiError> {
    let actor = actor_from(headers)?;
    if actor.id.0 != user_id && actor.role != Role::Officer {
        return Err(ProcurementError::Unauthorized(
            "notifications are only visible to their recipient".to_string(),
        )
        .into());
    }
    Ok(ActorId(user_id.to_string()))
}

pub(crate) async fn inbox_endpoint(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<InboxResponse>, ApiError> {
    let recipient = inbox_owner(&headers, &user_id)?;
    Ok(Json(InboxResponse {
        unread: state.inbox.unread_count(&recipient),
        notifications: state.inbox.for_recipient(&recipient),
        user_id: recipient,
    }))
}

pub(crate) async fn mark_read_endpoint(
    Extension(state): Extension<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(request): Json<MarkReadRequest>,
) -> Result<Response, ApiError> {
    let recipient = inbox_owner(&headers, &user_id)?;
    let updated = state.inbox.mark_read(&recipient, request.up_to_sequence);
    Ok(Json(json!({ "updated": updated })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use sunbid::config::EngineConfig;
    use sunbid::workflows::procurement::{
        ApplicationId, EngineHealth, EngineRuntime, EventBus, EventKind, ManualClock, ManualTimer,
        MemoryStore, NotificationHook, NotificationInbox, ProcurementEvent, ProcurementService,
        Stores,
    };
    use tower::ServiceExt;

    fn state() -> AppState {
        let (events, _outbox) = EventBus::channel();
        let start = Utc
            .with_ymd_and_hms(2025, 3, 1, 9, 0, 0)
            .single()
            .expect("valid instant");
        let service = ProcurementService::new(
            &EngineConfig::default(),
            Stores::shared(Arc::new(MemoryStore::default())),
            EngineRuntime {
                clock: Arc::new(ManualClock::new(start)),
                timer: Arc::new(ManualTimer::default()),
                events,
                health: Arc::new(EngineHealth::default()),
            },
        );
        AppState {
            readiness: Arc::new(AtomicBool::new(true)),
            metrics: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            service: Arc::new(service),
            inbox: Arc::new(NotificationInbox::default()),
        }
    }

    fn inbox_request(user: &str, caller: &str, role: &str) -> Request<Body> {
        Request::builder()
            .uri(format!("/api/v1/notifications/{user}"))
            .header("x-actor-id", caller)
            .header("x-actor-role", role)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_ok_without_faults() {
        let response = app_router(state())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 16 * 1024)
            .await
            .expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "ok");
    }

    #[tokio::test]
    async fn inbox_is_private_to_its_recipient() {
        let state = state();
        state
            .inbox
            .emit(&ProcurementEvent {
                sequence: 1,
                application_id: ApplicationId::generate(),
                customer: ActorId::from("cust-1"),
                occurred_at: Utc::now(),
                kind: EventKind::ApplicationSubmitted,
            })
            .expect("inbox accepts events");
        let app = app_router(state);

        let own = app
            .clone()
            .oneshot(inbox_request("cust-1", "cust-1", "customer"))
            .await
            .expect("response");
        assert_eq!(own.status(), StatusCode::OK);
        let body = axum::body::to_bytes(own.into_body(), 16 * 1024)
            .await
            .expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["unread"], 1);

        let other = app
            .oneshot(inbox_request("cust-1", "cust-2", "customer"))
            .await
            .expect("response");
        assert_eq!(other.status(), StatusCode::FORBIDDEN);
    }
}
