// Operational HTTP API.
//
// Small read-mostly surface for dashboards and support tooling: node
// health, per-user online status, cluster online stats, and the push
// suppression window (inspect and reset).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde_json::json;
use tracing::warn;

use crate::dispatch::Dispatcher;
use crate::error::{ApiError, ErrorCode};

pub fn router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/api/chat/health", get(health))
        .route("/api/chat/online/status/{user_id}", get(online_status))
        .route("/api/chat/online/stats", get(online_stats))
        .route("/api/chat/push-suppression/{user_id}", get(push_suppression))
        .route("/api/chat/push-suppression/{user_id}", delete(clear_push_suppression))
        .with_state(dispatcher)
}

async fn health(State(dispatcher): State<Dispatcher>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "nodeId": dispatcher.node_id(),
        "localSessions": dispatcher.sessions().session_count().await,
    }))
}

async fn online_status(
    Path(user_id): Path<String>,
    State(dispatcher): State<Dispatcher>,
) -> Result<impl IntoResponse, ApiError> {
    let online = dispatcher.presence().is_online(&user_id).await.map_err(internal)?;
    let owner = if online {
        dispatcher.presence().owner(&user_id).await.map_err(internal)?
    } else {
        None
    };
    Ok(Json(json!({
        "userId": user_id,
        "online": online,
        "nodeId": owner,
    })))
}

async fn online_stats(
    State(dispatcher): State<Dispatcher>,
) -> Result<impl IntoResponse, ApiError> {
    let users = dispatcher.presence().online_users().await.map_err(internal)?;
    Ok(Json(json!({
        "onlineCount": users.len(),
        "localSessions": dispatcher.sessions().session_count().await,
        "users": users,
    })))
}

async fn push_suppression(
    Path(user_id): Path<String>,
    State(dispatcher): State<Dispatcher>,
) -> Result<impl IntoResponse, ApiError> {
    let suppressed = dispatcher.push().is_suppressed(&user_id).await.map_err(internal)?;
    let remaining = dispatcher
        .push()
        .suppression_remaining(&user_id)
        .await
        .map_err(internal)?;
    Ok(Json(json!({
        "userId": user_id,
        "suppressed": suppressed,
        "remainingSecs": remaining,
    })))
}

async fn clear_push_suppression(
    Path(user_id): Path<String>,
    State(dispatcher): State<Dispatcher>,
) -> Result<impl IntoResponse, ApiError> {
    dispatcher.push().clear_suppression(&user_id).await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    warn!(error = %err, "operational api backend failure");
    ApiError::from_code(ErrorCode::InternalError)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::kv::KvStore;
    use crate::lock::ConnectLock;
    use crate::presence::PresenceRegistry;
    use crate::push::OfflinePushGate;
    use crate::router::{Broker, InterNodeRouter};
    use crate::sessions::SessionRegistry;
    use crate::storage::MessageStore;

    fn dispatcher() -> Dispatcher {
        let kv = KvStore::memory();
        let router = InterNodeRouter::new(Broker::memory(), "node-a");
        Dispatcher::new(
            PresenceRegistry::new(kv.clone(), "node-a", Duration::from_secs(80)),
            SessionRegistry::new(),
            router.clone(),
            ConnectLock::new(kv.clone()),
            MessageStore::memory(),
            OfflinePushGate::new(kv, router, Duration::from_secs(3600)),
        )
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_node_identity() {
        let (status, body) = get_json(router(dispatcher()), "/api/chat/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["nodeId"], "node-a");
        assert_eq!(body["localSessions"], 0);
    }

    #[tokio::test]
    async fn online_status_reflects_presence() {
        let dispatcher = dispatcher();
        dispatcher.presence().mark_online("u1").await.expect("mark_online");
        let app = router(dispatcher);

        let (status, body) = get_json(app.clone(), "/api/chat/online/status/u1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["online"], true);
        assert_eq!(body["nodeId"], "node-a");

        let (_, body) = get_json(app, "/api/chat/online/status/u2").await;
        assert_eq!(body["online"], false);
        assert_eq!(body["nodeId"], Value::Null);
    }

    #[tokio::test]
    async fn online_stats_list_users() {
        let dispatcher = dispatcher();
        dispatcher.presence().mark_online("u1").await.expect("mark_online");
        dispatcher.presence().mark_online("u2").await.expect("mark_online");

        let (status, body) = get_json(router(dispatcher), "/api/chat/online/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["onlineCount"], 2);
        let users = body["users"].as_array().expect("users array");
        assert_eq!(users.len(), 2);
    }

    #[tokio::test]
    async fn push_suppression_can_be_inspected_and_cleared() {
        let dispatcher = dispatcher();
        let mut frame =
            pulse_common::protocol::envelope::Envelope::system(
                pulse_common::protocol::envelope::FrameType::ChatMessage,
                "u1",
            );
        frame.sender_id = Some("u2".to_string());
        dispatcher.push().notify_offline(&frame).await.expect("push should succeed");
        let app = router(dispatcher);

        let (status, body) = get_json(app.clone(), "/api/chat/push-suppression/u1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["suppressed"], true);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/chat/push-suppression/u1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let (_, body) = get_json(app, "/api/chat/push-suppression/u1").await;
        assert_eq!(body["suppressed"], false);
        assert_eq!(body["remainingSecs"], Value::Null);
    }
}
