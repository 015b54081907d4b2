//! Connection registry and broadcast fan-out.
//!
//! The registry (identity → connections → subscriptions) is owned by a single
//! task. Everything else talks to it through a cloneable [`HubHandle`] over
//! bounded queues, so registration, subscription changes and fan-out never
//! race each other and no lock guards the registry.
//!
//! Delivery to a connection is a non-blocking enqueue onto its bounded
//! outbound queue. A full queue marks a slow consumer: the connection is
//! cancelled and dropped from the registry instead of stalling the loop.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use ussdhub_core::types::DbId;
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::envelope::{ServerEnvelope, ServerEvent, SessionNotice};

/// Identifies one physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized envelope, shared between every recipient of a broadcast.
    Text(Arc<str>),
    /// Send a `disconnected` notice and close the transport.
    Close { reason: String },
}

/// Which identities a broadcast is aimed at.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Identities(Vec<DbId>),
    All,
}

/// A push event addressed to subscribers of `channel`.
#[derive(Debug, Clone)]
pub struct BroadcastEnvelope {
    pub target: Target,
    pub channel: String,
    pub envelope: ServerEnvelope,
}

impl BroadcastEnvelope {
    pub fn new(target: Target, channel: impl Into<String>, envelope: impl Into<ServerEnvelope>) -> Self {
        Self {
            target,
            channel: channel.into(),
            envelope: envelope.into(),
        }
    }

    pub fn to_identity(identity_id: DbId, channel: impl Into<String>, event: ServerEvent) -> Self {
        Self::new(Target::Identities(vec![identity_id]), channel, event)
    }

    pub fn to_all(channel: impl Into<String>, event: ServerEvent) -> Self {
        Self::new(Target::All, channel, event)
    }
}

/// What a connection hands the hub when it registers.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub identity_id: DbId,
    pub session_token: String,
    pub sender: mpsc::Sender<Outbound>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub identities: usize,
    pub connections: usize,
    pub subscriptions: usize,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("realtime hub is not running")]
    Closed,
}

struct Connection {
    session_token: String,
    sender: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    subscriptions: HashSet<String>,
}

struct BroadcastRequest {
    broadcast: BroadcastEnvelope,
    delivered: Option<oneshot::Sender<usize>>,
}

enum Control {
    Subscribe {
        identity_id: DbId,
        connection: ConnectionId,
        channels: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    Unsubscribe {
        identity_id: DbId,
        connection: ConnectionId,
        channels: Vec<String>,
        reply: oneshot::Sender<Vec<String>>,
    },
    ForceLogout {
        identity_id: DbId,
        session_token: String,
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    DisconnectUser {
        identity_id: DbId,
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    IsOnline(DbId, oneshot::Sender<bool>),
    OnlineIdentities(oneshot::Sender<Vec<DbId>>),
    Stats(oneshot::Sender<HubStats>),
    Shutdown(oneshot::Sender<usize>),
}

/// Cloneable front door to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    register: mpsc::Sender<(Registration, oneshot::Sender<()>)>,
    unregister: mpsc::Sender<(DbId, ConnectionId)>,
    broadcast: mpsc::Sender<BroadcastRequest>,
    control: mpsc::Sender<Control>,
}

impl HubHandle {
    /// Add a connection to the registry. Returns once the hub has applied it.
    pub async fn register(&self, registration: Registration) -> Result<(), HubError> {
        let (tx, rx) = oneshot::channel();
        self.register
            .send((registration, tx))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove a connection. Unknown connections are ignored, as is a stopped hub.
    pub async fn unregister(&self, identity_id: DbId, connection: ConnectionId) {
        let _ = self.unregister.send((identity_id, connection)).await;
    }

    /// Queue a broadcast without waiting for fan-out.
    pub async fn broadcast(&self, broadcast: BroadcastEnvelope) -> Result<(), HubError> {
        self.broadcast
            .send(BroadcastRequest {
                broadcast,
                delivered: None,
            })
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Broadcast and wait for the number of connections it was enqueued to.
    pub async fn broadcast_and_count(&self, broadcast: BroadcastEnvelope) -> Result<usize, HubError> {
        let (tx, rx) = oneshot::channel();
        self.broadcast
            .send(BroadcastRequest {
                broadcast,
                delivered: Some(tx),
            })
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Add channels to a connection's subscription set. Returns the channels
    /// now subscribed from the request; empty if the connection is gone.
    pub async fn subscribe(
        &self,
        identity_id: DbId,
        connection: ConnectionId,
        channels: Vec<String>,
    ) -> Result<Vec<String>, HubError> {
        self.request(|reply| Control::Subscribe {
            identity_id,
            connection,
            channels,
            reply,
        })
        .await
    }

    /// Remove channels from a connection's subscription set. Returns the
    /// channels that were removed.
    pub async fn unsubscribe(
        &self,
        identity_id: DbId,
        connection: ConnectionId,
        channels: Vec<String>,
    ) -> Result<Vec<String>, HubError> {
        self.request(|reply| Control::Unsubscribe {
            identity_id,
            connection,
            channels,
            reply,
        })
        .await
    }

    /// Send a final `session:force_logout` notice to the connections of one
    /// session and close them. Returns the number of connections closed.
    pub async fn force_logout(
        &self,
        identity_id: DbId,
        session_token: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<usize, HubError> {
        let session_token = session_token.into();
        let reason = reason.into();
        self.request(|reply| Control::ForceLogout {
            identity_id,
            session_token,
            reason,
            reply,
        })
        .await
    }

    /// Like [`force_logout`](Self::force_logout) for every connection of an
    /// identity.
    pub async fn disconnect_user(
        &self,
        identity_id: DbId,
        reason: impl Into<String>,
    ) -> Result<usize, HubError> {
        let reason = reason.into();
        self.request(|reply| Control::DisconnectUser {
            identity_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn is_online(&self, identity_id: DbId) -> Result<bool, HubError> {
        self.request(|reply| Control::IsOnline(identity_id, reply))
            .await
    }

    pub async fn online_identities(&self) -> Result<Vec<DbId>, HubError> {
        self.request(Control::OnlineIdentities).await
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        self.request(Control::Stats).await
    }

    pub async fn connection_count(&self) -> Result<usize, HubError> {
        Ok(self.stats().await?.connections)
    }

    /// Cancel every connection, empty the registry and stop the hub task.
    /// Returns the number of connections that were open.
    pub async fn shutdown(&self) -> Result<usize, HubError> {
        self.request(Control::Shutdown).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, HubError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(build(tx))
            .await
            .map_err(|_| HubError::Closed)?;
        rx.await.map_err(|_| HubError::Closed)
    }
}

/// The registry-owning task.
pub struct Hub {
    connections: HashMap<DbId, HashMap<ConnectionId, Connection>>,
    register_rx: mpsc::Receiver<(Registration, oneshot::Sender<()>)>,
    unregister_rx: mpsc::Receiver<(DbId, ConnectionId)>,
    broadcast_rx: mpsc::Receiver<BroadcastRequest>,
    control_rx: mpsc::Receiver<Control>,
}

impl Hub {
    /// Spawn the hub task and return a handle to it.
    pub fn start(config: &RealtimeConfig) -> HubHandle {
        let capacity = config.hub_queue_capacity.max(1);
        let (register, register_rx) = mpsc::channel(capacity);
        let (unregister, unregister_rx) = mpsc::channel(capacity);
        let (broadcast, broadcast_rx) = mpsc::channel(capacity);
        let (control, control_rx) = mpsc::channel(capacity);

        let hub = Hub {
            connections: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            control_rx,
        };
        tokio::spawn(hub.run());

        HubHandle {
            register,
            unregister,
            broadcast,
            control,
        }
    }

    async fn run(mut self) {
        tracing::info!("Realtime hub started");
        loop {
            tokio::select! {
                biased;
                Some((registration, ack)) = self.register_rx.recv() => {
                    self.register(registration);
                    let _ = ack.send(());
                }
                Some((identity_id, connection)) = self.unregister_rx.recv() => {
                    self.unregister(identity_id, connection);
                }
                // Control ahead of broadcasts so a busy fan-out cannot
                // hold back logouts or shutdown.
                Some(control) = self.control_rx.recv() => {
                    if self.control(control).is_break() {
                        break;
                    }
                }
                Some(request) = self.broadcast_rx.recv() => {
                    let delivered = self.broadcast(&request.broadcast);
                    if let Some(reply) = request.delivered {
                        let _ = reply.send(delivered);
                    }
                }
                else => break,
            }
        }
        self.close_all();
        tracing::info!("Realtime hub stopped");
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            id,
            identity_id,
            session_token,
            sender,
            cancel,
        } = registration;

        self.connections.entry(identity_id).or_default().insert(
            id,
            Connection {
                session_token,
                sender,
                cancel,
                subscriptions: HashSet::new(),
            },
        );
        tracing::info!(identity_id, connection_id = %id, "Connection registered");
    }

    fn unregister(&mut self, identity_id: DbId, id: ConnectionId) {
        if self.remove(identity_id, id).is_some() {
            tracing::info!(identity_id, connection_id = %id, "Connection unregistered");
        }
    }

    fn remove(&mut self, identity_id: DbId, id: ConnectionId) -> Option<Connection> {
        let set = self.connections.get_mut(&identity_id)?;
        let removed = set.remove(&id);
        if set.is_empty() {
            self.connections.remove(&identity_id);
        }
        removed
    }

    fn broadcast(&mut self, broadcast: &BroadcastEnvelope) -> usize {
        let text: Arc<str> = match broadcast.envelope.to_json() {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(channel = %broadcast.channel, error = %e, "Failed to serialize broadcast");
                return 0;
            }
        };

        let identities: Vec<DbId> = match &broadcast.target {
            Target::All => self.connections.keys().copied().collect(),
            Target::Identities(ids) => {
                let mut seen = HashSet::new();
                ids.iter().copied().filter(|id| seen.insert(*id)).collect()
            }
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for identity_id in identities {
            let Some(set) = self.connections.get(&identity_id) else {
                continue;
            };
            for (id, conn) in set {
                if !conn.subscriptions.contains(&broadcast.channel) {
                    continue;
                }
                match conn.sender.try_send(Outbound::Text(Arc::clone(&text))) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            identity_id,
                            connection_id = %id,
                            channel = %broadcast.channel,
                            "Slow consumer, disconnecting"
                        );
                        dropped.push((identity_id, *id));
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::debug!(identity_id, connection_id = %id, "Outbound queue closed");
                        dropped.push((identity_id, *id));
                    }
                }
            }
        }

        for (identity_id, id) in dropped {
            if let Some(conn) = self.remove(identity_id, id) {
                conn.cancel.cancel();
            }
        }

        tracing::debug!(channel = %broadcast.channel, delivered, "Broadcast fanned out");
        delivered
    }

    fn control(&mut self, control: Control) -> ControlFlow<()> {
        match control {
            Control::Subscribe {
                identity_id,
                connection,
                channels,
                reply,
            } => {
                let applied = match self.connection_mut(identity_id, connection) {
                    Some(conn) => {
                        for channel in &channels {
                            conn.subscriptions.insert(channel.clone());
                        }
                        channels
                    }
                    None => Vec::new(),
                };
                let _ = reply.send(applied);
            }
            Control::Unsubscribe {
                identity_id,
                connection,
                channels,
                reply,
            } => {
                let applied = match self.connection_mut(identity_id, connection) {
                    Some(conn) => channels
                        .into_iter()
                        .filter(|c| conn.subscriptions.remove(c))
                        .collect(),
                    None => Vec::new(),
                };
                let _ = reply.send(applied);
            }
            Control::ForceLogout {
                identity_id,
                session_token,
                reason,
                reply,
            } => {
                let targets: Vec<ConnectionId> = self
                    .connections
                    .get(&identity_id)
                    .map(|set| {
                        set.iter()
                            .filter(|(_, c)| c.session_token == session_token)
                            .map(|(id, _)| *id)
                            .collect()
                    })
                    .unwrap_or_default();
                let closed =
                    self.close_with_notice(identity_id, &targets, Some(session_token), &reason);
                tracing::info!(identity_id, closed, reason = %reason, "Forced logout");
                let _ = reply.send(closed);
            }
            Control::DisconnectUser {
                identity_id,
                reason,
                reply,
            } => {
                let targets: Vec<ConnectionId> = self
                    .connections
                    .get(&identity_id)
                    .map(|set| set.keys().copied().collect())
                    .unwrap_or_default();
                let closed = self.close_with_notice(identity_id, &targets, None, &reason);
                tracing::info!(identity_id, closed, reason = %reason, "Disconnected user");
                let _ = reply.send(closed);
            }
            Control::IsOnline(identity_id, reply) => {
                let _ = reply.send(self.connections.contains_key(&identity_id));
            }
            Control::OnlineIdentities(reply) => {
                let mut ids: Vec<DbId> = self.connections.keys().copied().collect();
                ids.sort_unstable();
                let _ = reply.send(ids);
            }
            Control::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            Control::Shutdown(reply) => {
                let closed = self.close_all();
                let _ = reply.send(closed);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn connection_mut(&mut self, identity_id: DbId, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&identity_id)?.get_mut(&id)
    }

    /// Enqueue a force-logout notice followed by a close request, then drop
    /// the connections from the registry. Connections whose queue cannot take
    /// the notice are cancelled outright.
    fn close_with_notice(
        &mut self,
        identity_id: DbId,
        targets: &[ConnectionId],
        session_id: Option<String>,
        reason: &str,
    ) -> usize {
        if targets.is_empty() {
            return 0;
        }
        let notice = ServerEnvelope::new(ServerEvent::ForceLogout(SessionNotice {
            session_id,
            reason: reason.to_string(),
        }));
        let text: Option<Arc<str>> = match notice.to_json() {
            Ok(json) => Some(json.into()),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize logout notice");
                None
            }
        };

        let mut closed = 0;
        for id in targets {
            let Some(conn) = self.remove(identity_id, *id) else {
                continue;
            };
            let queued = text
                .as_ref()
                .is_some_and(|t| conn.sender.try_send(Outbound::Text(Arc::clone(t))).is_ok())
                && conn
                    .sender
                    .try_send(Outbound::Close {
                        reason: reason.to_string(),
                    })
                    .is_ok();
            if !queued {
                conn.cancel.cancel();
            }
            closed += 1;
        }
        closed
    }

    fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for (_, set) in self.connections.drain() {
            for (_, conn) in set {
                conn.cancel.cancel();
                closed += 1;
            }
        }
        if closed > 0 {
            tracing::info!(count = closed, "Closed all realtime connections");
        }
        closed
    }

    fn stats(&self) -> HubStats {
        let mut stats = HubStats {
            identities: self.connections.len(),
            ..HubStats::default()
        };
        for conn in self.connections.values().flat_map(|set| set.values()) {
            stats.connections += 1;
            stats.subscriptions += conn.subscriptions.len();
        }
        stats
    }
}
