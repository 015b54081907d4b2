//! Per-connection lifecycle.
//!
//! [`serve`] takes an already authenticated session and a split transport,
//! registers with the hub and runs two tasks until either side ends:
//!
//! - the writer drains the bounded outbound queue, sends keepalive pings on
//!   its timer and bounds every send with the write timeout;
//! - the reader parses inbound frames, dispatches them and enforces the read
//!   deadline, which only a pong refreshes.
//!
//! Both share one [`CancellationToken`]. Cancelling it (from either task, the
//! hub or shutdown) ends the connection; cancelling twice is harmless.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use ussdhub_core::types::DbId;

use crate::auth::AuthenticatedSession;
use crate::channel::{can_subscribe, Subscriber};
use crate::context::Realtime;
use crate::envelope::{
    ConnectedPayload, ControlMessage, Frame, InboundEnvelope, PongPayload, ServerEnvelope,
    ServerEvent, SubscriptionReply,
};
use crate::handlers::{Dispatch, HandlerContext, HandlerError};
use crate::hub::{ConnectionId, Outbound, Registration};

/// Run a connection to completion.
///
/// Returns once both tasks have exited and the connection has been removed
/// from the hub.
pub async fn serve<S, R, E>(sink: S, mut stream: R, auth: AuthenticatedSession, realtime: Realtime)
where
    S: Sink<Frame> + Unpin + Send + 'static,
    S::Error: fmt::Display,
    R: Stream<Item = Result<Frame, E>> + Unpin + Send,
    E: fmt::Display + Send,
{
    let config = Arc::clone(&realtime.config);
    let id = ConnectionId::new();
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(config.outbound_queue_capacity.max(1));

    let conn = Connection {
        id,
        identity_id: auth.identity_id(),
        session_token: auth.session_token().to_string(),
        roles: auth.session.roles.clone(),
        permissions: auth.session.permissions.clone(),
        tx,
        cancel: cancel.clone(),
        realtime,
    };

    let registration = Registration {
        id,
        identity_id: conn.identity_id,
        session_token: conn.session_token.clone(),
        sender: conn.tx.clone(),
        cancel: cancel.clone(),
    };
    if let Err(e) = conn.realtime.hub.register(registration).await {
        tracing::error!(identity_id = conn.identity_id, error = %e, "Failed to register connection");
        return;
    }

    tracing::info!(
        identity_id = conn.identity_id,
        connection_id = %id,
        "Realtime connection established"
    );

    conn.send(
        ServerEvent::Connected(ConnectedPayload {
            identity_id: conn.identity_id,
            session_id: conn.session_token.clone(),
            roles: conn.roles.clone(),
            permissions: conn.permissions.clone(),
            device: auth.device(),
        }),
        None,
    );

    let writer = tokio::spawn(write_loop(
        sink,
        rx,
        cancel.clone(),
        config.keepalive(),
        config.write_timeout,
        id,
    ));

    let read_deadline = config.read_deadline();
    let mut deadline = Instant::now() + read_deadline;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!(connection_id = %id, "Read deadline exceeded, closing");
                break;
            }
            next = stream.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %id, error = %e, "Receive error");
                    break;
                }
                None => break,
            },
        };

        match frame {
            Frame::Pong(_) => deadline = Instant::now() + read_deadline,
            Frame::Ping(_) => {}
            Frame::Close(_) => break,
            Frame::Text(text) => conn.handle_text(&text).await,
            Frame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => conn.handle_text(&text).await,
                Err(_) => conn.send(
                    ServerEvent::error("INVALID_MESSAGE", "binary frame is not UTF-8"),
                    None,
                ),
            },
        }
    }

    conn.close();
    conn.realtime.hub.unregister(conn.identity_id, id).await;
    drop(conn);
    if let Err(e) = writer.await {
        tracing::error!(connection_id = %id, error = %e, "Writer task panicked");
    }
    tracing::info!(connection_id = %id, "Realtime connection closed");
}

/// Drain the outbound queue into the sink until cancelled, closed or told
/// to close.
async fn write_loop<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    keepalive: Duration,
    write_timeout: Duration,
    id: ConnectionId,
) where
    S: Sink<Frame> + Unpin,
    S::Error: fmt::Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + keepalive, keepalive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut close_reason = None;

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(Outbound::Text(text)) => Frame::Text(text.to_string()),
                Some(Outbound::Close { reason }) => {
                    match ServerEnvelope::new(ServerEvent::disconnected(reason.clone())).to_json() {
                        Ok(json) => {
                            let _ = send_frame(&mut sink, Frame::Text(json), write_timeout).await;
                        }
                        Err(e) => tracing::error!(error = %e, "Failed to serialize disconnect notice"),
                    }
                    close_reason = Some(reason);
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => Frame::Ping(Vec::new()),
        };

        if let Err(e) = send_frame(&mut sink, frame, write_timeout).await {
            tracing::debug!(connection_id = %id, error = %e, "Send failed, closing");
            break;
        }
    }

    rx.close();
    cancel.cancel();
    let _ = send_frame(&mut sink, Frame::Close(close_reason), write_timeout).await;
}

async fn send_frame<S>(sink: &mut S, frame: Frame, write_timeout: Duration) -> Result<(), String>
where
    S: Sink<Frame> + Unpin,
    S::Error: fmt::Display,
{
    match tokio::time::timeout(write_timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write timed out".to_string()),
    }
}

/// State the reader needs to answer inbound messages.
struct Connection {
    id: ConnectionId,
    identity_id: DbId,
    session_token: String,
    roles: Vec<String>,
    permissions: Vec<String>,
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    realtime: Realtime,
}

impl Connection {
    fn close(&self) {
        self.cancel.cancel();
    }

    /// Enqueue a reply behind whatever is already queued.
    fn send(&self, event: ServerEvent, reply_to: Option<String>) {
        let json = match ServerEnvelope::new(event).reply_to(reply_to).to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(connection_id = %self.id, error = %e, "Failed to serialize reply");
                return;
            }
        };
        match self.tx.try_send(Outbound::Text(json.into())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.id, "Slow consumer, disconnecting");
                self.close();
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn handle_text(&self, text: &str) {
        let envelope = match InboundEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.send(ServerEvent::error(e.code(), e.to_string()), None);
                return;
            }
        };

        let ctx = HandlerContext {
            connection_id: self.id,
            identity_id: self.identity_id,
            session_token: self.session_token.clone(),
            roles: self.roles.clone(),
            permissions: self.permissions.clone(),
        };
        match self.realtime.handlers.dispatch(&ctx, &envelope).await {
            Dispatch::Handled(Ok(Some(event))) => self.send(event, envelope.id),
            Dispatch::Handled(Ok(None)) => {}
            Dispatch::Handled(Err(e)) => {
                if let HandlerError::Internal(ref detail) = e {
                    tracing::error!(kind = %envelope.kind, error = %detail, "Message handler failed");
                }
                self.send(ServerEvent::error(e.code(), e.public_message()), envelope.id);
            }
            Dispatch::NoHandler => self.handle_control(envelope).await,
        }
    }

    async fn handle_control(&self, envelope: InboundEnvelope) {
        let message = match ControlMessage::from_envelope(&envelope) {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                self.send(ServerEvent::error(e.code(), e.to_string()), envelope.id);
                return;
            }
            None => {
                self.send(
                    ServerEvent::error(
                        "UNKNOWN_TYPE",
                        format!("unknown message type '{}'", envelope.kind),
                    ),
                    envelope.id,
                );
                return;
            }
        };

        match message {
            ControlMessage::Ping => self.send(
                ServerEvent::Pong(PongPayload {
                    server_time: Utc::now(),
                }),
                envelope.id,
            ),
            ControlMessage::Subscribe(list) => {
                let applied = self.subscribe(list.channels).await;
                if !applied.is_empty() {
                    self.send(
                        ServerEvent::Subscribed(SubscriptionReply {
                            channels: applied,
                            status: "subscribed".into(),
                        }),
                        envelope.id,
                    );
                }
            }
            ControlMessage::Unsubscribe(list) => {
                let removed = match self
                    .realtime
                    .hub
                    .unsubscribe(self.identity_id, self.id, dedup(list.channels))
                    .await
                {
                    Ok(removed) => removed,
                    Err(e) => {
                        tracing::error!(connection_id = %self.id, error = %e, "Hub unavailable");
                        self.close();
                        return;
                    }
                };
                self.send(
                    ServerEvent::Unsubscribed(SubscriptionReply {
                        channels: removed,
                        status: "unsubscribed".into(),
                    }),
                    envelope.id,
                );
            }
        }
    }

    /// Subscribe to the channels this connection is allowed to see.
    /// Channels it may not see are dropped without a reply.
    async fn subscribe(&self, channels: Vec<String>) -> Vec<String> {
        let subscriber = Subscriber {
            identity_id: self.identity_id,
            roles: &self.roles,
            permissions: &self.permissions,
        };
        let (allowed, denied): (Vec<String>, Vec<String>) = dedup(channels)
            .into_iter()
            .partition(|channel| can_subscribe(&subscriber, channel));
        if !denied.is_empty() {
            tracing::debug!(
                identity_id = self.identity_id,
                channels = ?denied,
                "Subscription denied"
            );
        }
        if allowed.is_empty() {
            return allowed;
        }

        match self
            .realtime
            .hub
            .subscribe(self.identity_id, self.id, allowed)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(connection_id = %self.id, error = %e, "Hub unavailable");
                self.close();
                Vec::new()
            }
        }
    }
}

/// Drop blanks and repeats, keeping first-seen order.
fn dedup(channels: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    channels
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty() && seen.insert(c.clone()))
        .collect()
}
