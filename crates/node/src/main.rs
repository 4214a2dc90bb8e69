mod api;
mod auth;
mod config;
mod dispatch;
mod error;
mod kv;
mod lock;
mod presence;
mod push;
mod router;
mod sessions;
mod storage;
mod ws;


use std::time::Duration;

use anyhow::Context;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::TokenService;
use crate::config::NodeConfig;
use crate::dispatch::Dispatcher;
use crate::error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope};
use crate::kv::KvStore;
use crate::lock::ConnectLock;
use crate::presence::PresenceRegistry;
use crate::push::OfflinePushGate;
use crate::router::{Broker, InterNodeRouter};
use crate::sessions::SessionRegistry;
use crate::storage::MessageStore;

/// Sweep cadence for the presence roster.
const SWEEP_INTERVAL: Duration = Duration::from_secs(120);
/// Initial offset so a restarted fleet does not sweep in lockstep.
const SWEEP_OFFSET: Duration = Duration::from_secs(60);
/// Cadence for expiring old failed-delivery records.
const FAILED_DELIVERY_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = NodeConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .init();

    if config.is_dev_jwt_secret() {
        warn!("running with the development JWT secret; set PULSE_NODE_JWT_SECRET in production");
    }

    let kv = match &config.redis_url {
        Some(url) => KvStore::connect_redis(url)
            .await
            .with_context(|| format!("failed to connect presence store at {url}"))?,
        None => {
            warn!("no PULSE_NODE_REDIS_URL set; using in-memory stores (single-node mode)");
            KvStore::memory()
        }
    };
    let broker = match &config.redis_url {
        Some(url) => Broker::connect_redis(url)
            .await
            .with_context(|| format!("failed to connect broker at {url}"))?,
        None => Broker::memory(),
    };
    let store = match &config.message_service_url {
        Some(url) => MessageStore::http(url.clone())
            .context("failed to build message service client")?,
        None => {
            warn!("no PULSE_NODE_MESSAGE_SERVICE_URL set; messages persist in memory only");
            MessageStore::memory()
        }
    };

    let presence = PresenceRegistry::new(kv.clone(), config.node_id.clone(), config.lease_ttl);
    let sessions = SessionRegistry::new();
    let inter_node = InterNodeRouter::new(broker, config.node_id.clone());
    let lock = ConnectLock::new(kv.clone());
    let push = OfflinePushGate::new(kv, inter_node.clone(), config.push_suppression);
    let dispatcher = Dispatcher::new(presence.clone(), sessions.clone(), inter_node.clone(), lock, store, push);
    let tokens = TokenService::new(&config.jwt_secret);

    spawn_broker_consumer(inter_node, dispatcher.clone());
    spawn_presence_sweeper(presence);
    spawn_failed_delivery_cleanup(sessions);

    let app = build_router(dispatcher, tokens);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, node_id = %config.node_id, "starting delivery node");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("delivery node exited unexpectedly")
}

fn build_router(dispatcher: Dispatcher, tokens: TokenService) -> Router {
    apply_middleware(
        Router::new()
            .merge(ws::router(dispatcher.clone(), tokens))
            .merge(api::router(dispatcher)),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

/// Consume this node's broker channels for the life of the process,
/// resubscribing with a short backoff if the broker connection drops.
fn spawn_broker_consumer(inter_node: InterNodeRouter, dispatcher: Dispatcher) {
    tokio::spawn(async move {
        loop {
            let mut subscription = match inter_node.subscribe_node_channels().await {
                Ok(subscription) => subscription,
                Err(err) => {
                    error!(error = %err, "broker subscribe failed, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            info!(node_id = %inter_node.node_id(), "broker consumer subscribed");
            while let Some((channel, payload)) = subscription.next_message().await {
                match inter_node.classify(&channel) {
                    Some(kind) => dispatcher.handle_broker_message(kind, &payload).await,
                    None => warn!(channel, "message on unexpected channel, dropping"),
                }
            }
            warn!("broker subscription ended, reconnecting");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

fn spawn_presence_sweeper(presence: PresenceRegistry) {
    tokio::spawn(async move {
        tokio::time::sleep(SWEEP_OFFSET).await;
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(err) = presence.sweep().await {
                warn!(error = %err, "presence sweep failed");
            }
        }
    });
}

fn spawn_failed_delivery_cleanup(sessions: SessionRegistry) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(FAILED_DELIVERY_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            sessions.expire_failed_deliveries().await;
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = std::time::Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    use super::*;
    use crate::error::REQUEST_ID_HEADER;

    fn test_router() -> Router {
        let kv = KvStore::memory();
        let inter_node = InterNodeRouter::new(Broker::memory(), "node-test");
        let dispatcher = Dispatcher::new(
            PresenceRegistry::new(kv.clone(), "node-test", Duration::from_secs(80)),
            SessionRegistry::new(),
            inter_node.clone(),
            ConnectLock::new(kv.clone()),
            MessageStore::memory(),
            OfflinePushGate::new(kv, inter_node, Duration::from_secs(3600)),
        );
        build_router(dispatcher, TokenService::new("test_secret_that_is_32_chars_long!!!"))
    }

    #[tokio::test]
    async fn requests_get_a_request_id_header() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/chat/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }

    #[tokio::test]
    async fn supplied_request_id_is_echoed() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/chat/health")
                    .header(REQUEST_ID_HEADER, "req-abc")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).and_then(|v| v.to_str().ok()),
            Some("req-abc")
        );
    }

    #[tokio::test]
    async fn websocket_route_rejects_plain_get_without_params() {
        let response = test_router()
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        // Missing userId/token query parameters.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let response = test_router()
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
