// WebSocket endpoint.
//
// `GET /ws?userId=...&token=...` authenticates before the upgrade, then
// runs the connect handshake and the frame loop. Heartbeats are
// client-driven application frames; the server does not ping.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pulse_common::protocol::envelope::{decode_frame, encode_frame, Envelope, FrameType};

use crate::auth::TokenService;
use crate::dispatch::{ConnectError, Dispatcher};
use crate::error::{
    request_id_from_headers_or_generate, with_request_id_scope, ApiError, ErrorCode,
};

#[derive(Clone)]
struct WsRouterState {
    dispatcher: Dispatcher,
    tokens: TokenService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectParams {
    user_id: String,
    token: String,
}

pub fn router(dispatcher: Dispatcher, tokens: TokenService) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(WsRouterState { dispatcher, tokens })
}

async fn ws_upgrade(
    Query(params): Query<ConnectParams>,
    State(state): State<WsRouterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if params.user_id.trim().is_empty() {
        return ApiError::new(ErrorCode::ValidationFailed, "userId must not be empty")
            .into_response();
    }
    if let Err(err) = state.tokens.validate_for_user(&params.token, &params.user_id) {
        debug!(user_id = %params.user_id, error = %err, "rejecting websocket auth");
        return ApiError::from_code(ErrorCode::AuthInvalidToken).into_response();
    }

    let dispatcher = state.dispatcher.clone();
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.on_upgrade(move |socket| async move {
        with_request_id_scope(request_id, handle_socket(dispatcher, params.user_id, socket)).await;
    })
}

async fn handle_socket(dispatcher: Dispatcher, user_id: String, mut socket: WebSocket) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();

    let session_id = match dispatcher.connect_user(&user_id, outbound_tx).await {
        Ok(session_id) => session_id,
        Err(ConnectError::Contended) => {
            let error = Envelope::system(FrameType::Error, &user_id)
                .with_content("another connection attempt for this user is in flight");
            send_frame(&mut socket, &error).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Err(err) => {
            warn!(user_id, error = %err, "connect handshake failed");
            let error = Envelope::system(FrameType::Error, &user_id)
                .with_content("connection could not be established");
            send_frame(&mut socket, &error).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    info!(user_id, session_id = %session_id, "websocket session established");

    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if !send_frame(&mut socket, &frame).await {
                            break;
                        }
                    }
                    // Channel dropped by the registry: this session was
                    // replaced. The CONNECTION_REPLACED frame already went
                    // out above.
                    None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            maybe_inbound = socket.recv() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(raw))) => {
                        match decode_frame(raw.as_str()) {
                            Ok(frame) => dispatcher.handle_client_frame(&user_id, frame).await,
                            Err(err) => {
                                warn!(user_id, error = %err, "undecodable client frame, dropping");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    // Transport pings and binary payloads carry nothing here.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(user_id, error = %err, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    dispatcher.disconnect_user(&user_id, session_id).await;
    info!(user_id, session_id = %session_id, "websocket session closed");
}

/// Returns false when the socket is gone.
async fn send_frame(socket: &mut WebSocket, frame: &Envelope) -> bool {
    match encode_frame(frame) {
        Ok(raw) => socket.send(Message::Text(raw.into())).await.is_ok(),
        Err(err) => {
            warn!(error = %err, "frame encoding failed, skipping");
            true
        }
    }
}
