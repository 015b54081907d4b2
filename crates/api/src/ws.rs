//! WebSocket upgrade endpoint.
//!
//! The bearer token is checked before the upgrade, so a rejected client gets
//! a plain HTTP 401 instead of an opened-then-closed socket. After the
//! upgrade the socket is adapted to transport-neutral [`Frame`]s and handed
//! to [`ussdhub_realtime::client::serve`].

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use ussdhub_realtime::auth::AuthenticatedSession;
use ussdhub_realtime::envelope::Frame;
use ussdhub_realtime::Realtime;

use crate::error::AppError;
use crate::middleware::auth::header_bearer;
use crate::state::AppState;

/// Query string accepted on `/ws`. Browsers cannot set headers on a
/// WebSocket handshake, so the token may travel here instead.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// GET /api/v1/ws
///
/// Authenticate, then upgrade. The token comes from `Authorization: Bearer`
/// or, failing that, `?token=`.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let bearer = match header_bearer(&headers) {
        Ok(token) => token.to_string(),
        Err(header_err) => match query.token {
            Some(token) if !token.is_empty() => token,
            _ => return header_err.into_response(),
        },
    };

    let session = match state.realtime.authenticator.authenticate(&bearer).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(error = %e, "WebSocket authentication rejected");
            return AppError::Auth(e).into_response();
        }
    };

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let realtime = state.realtime.clone();
    ws.max_message_size(realtime.config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, session, realtime))
}

async fn handle_socket(socket: WebSocket, session: AuthenticatedSession, realtime: Realtime) {
    let identity_id = session.identity_id();
    tracing::info!(identity_id, "WebSocket connected");

    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let stream = stream.map(|item| item.map(from_message));

    ussdhub_realtime::client::serve(sink, stream, session, realtime).await;
    tracing::info!(identity_id, "WebSocket disconnected");
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Ping(bytes) => Message::Ping(bytes.into()),
        Frame::Pong(bytes) => Message::Pong(bytes.into()),
        Frame::Close(reason) => Message::Close(reason.map(|reason| CloseFrame {
            code: close_code::NORMAL,
            reason: reason.into(),
        })),
    }
}

fn from_message(message: Message) -> Frame {
    match message {
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Binary(bytes) => Frame::Binary(bytes.to_vec()),
        Message::Ping(bytes) => Frame::Ping(bytes.to_vec()),
        Message::Pong(bytes) => Frame::Pong(bytes.to_vec()),
        Message::Close(frame) => Frame::Close(frame.map(|f| f.reason.as_str().to_owned())),
    }
}
