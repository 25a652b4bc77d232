//! Per-connection state machine and message dispatch.
//!
//! # Connection states
//!
//! ```text
//! Connected ──auth──► Authenticating ──valid──► Authenticated
//!     │                     │                        │
//!     │                     └──invalid──► Closed ◄───┘ (disconnect, superseded,
//!     └──────────────────── disconnect ───► Closed        liveness, slow consumer)
//! ```
//!
//! The WebSocket server owns the socket and calls into [`Gateway`] with each
//! decoded text frame.  The gateway answers by pushing [`ServerMessage`]s onto
//! the connection's outbound queue and tells the server whether to keep
//! reading ([`Flow::Continue`]) or to wind the connection down
//! ([`Flow::Close`]).  When the server sees `Close` it stops reading, lets the
//! writer flush what is already queued (typically the final error reply), and
//! then calls [`Gateway::close_connection`].
//!
//! # Error replies
//!
//! | Situation                                   | Reply code             | Flow     |
//! |---------------------------------------------|------------------------|----------|
//! | malformed frame / unknown type              | `VALIDATION_ERROR`     | Continue |
//! | malformed `auth` frame                      | `AUTHENTICATION_ERROR` | Close    |
//! | certificate mismatch                        | `AUTHENTICATION_ERROR` | Close    |
//! | protected message before `auth_ok`          | `AUTHENTICATION_ERROR` | Continue |
//! | second `auth` on an authenticated socket    | `VALIDATION_ERROR`     | Continue |
//! | hub failure or action timeout               | `SERVICE_UNAVAILABLE`  | Continue |
//! | any non-operational (internal) error        | `INTERNAL_ERROR`       | Close    |

use std::sync::Arc;
use std::time::Duration;

use hublink_core::protocol::{
    AuthPayload, CallServicePayload, CreatePairingSessionPayload, PairPayload,
    SubscribeEntitiesPayload, PROTOCOL_VERSION,
};
use hublink_core::{
    decode_client_message, ClientId, ClientMessage, EntityChangeEvent, EntityFilter, ServerMessage,
    ServiceError,
};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::application::connection_registry::{
    BroadcastReport, CloseReason, ConnectionChannels, ConnectionHandle, ConnectionId,
    ConnectionRegistry, LivenessReport, Outbound, SendError,
};
use crate::application::hub::{HubAdapter, ServiceCall};
use crate::application::pairing_authority::PairingAuthority;
use crate::domain::GatewaySettings;

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Authenticating,
    Authenticated,
    Closed,
}

/// What the server should do after a frame has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Gateway-side state of one accepted socket.
#[derive(Debug)]
pub struct ConnectionSession {
    handle: ConnectionHandle,
    state: ConnectionState,
    client_id: Option<ClientId>,
}

impl ConnectionSession {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }
}

/// Routes client messages to the pairing authority, the registry, and the
/// hub.
pub struct Gateway {
    authority: Arc<PairingAuthority>,
    registry: Arc<ConnectionRegistry>,
    hub: Arc<dyn HubAdapter>,
    settings: GatewaySettings,
}

impl Gateway {
    pub fn new(
        authority: Arc<PairingAuthority>,
        registry: Arc<ConnectionRegistry>,
        hub: Arc<dyn HubAdapter>,
        settings: GatewaySettings,
    ) -> Self {
        Self {
            authority,
            registry,
            hub,
            settings,
        }
    }

    pub fn authority(&self) -> &Arc<PairingAuthority> {
        &self.authority
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<dyn HubAdapter> {
        &self.hub
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Registers a new connection and queues its `connected` greeting.
    pub async fn open_connection(&self) -> (ConnectionSession, ConnectionChannels) {
        let (handle, channels) = ConnectionHandle::new(self.settings.outbound_queue);
        self.registry.register(handle.clone()).await;

        let session = ConnectionSession {
            handle,
            state: ConnectionState::Connected,
            client_id: None,
        };
        // A fresh queue always has room for the greeting.
        let _ = self.reply(
            &session,
            ServerMessage::Connected {
                connection_id: session.id(),
                protocol_version: PROTOCOL_VERSION,
            },
        );
        (session, channels)
    }

    /// Removes the connection and, if it was the client's last one, marks
    /// the client inactive.  Consumes the session so its sender is dropped
    /// and the writer can finish draining.
    pub async fn close_connection(&self, mut session: ConnectionSession) {
        session.state = ConnectionState::Closed;
        // `None` also when a sweep already removed the entry, so the session's
        // own client id decides whether to release.
        self.registry.unregister(session.id()).await;

        if let Some(client_id) = session.client_id {
            self.release_client(client_id).await;
            info!("client {client_id} disconnected (connection {})", session.id());
        } else {
            debug!("unauthenticated connection {} closed", session.id());
        }
    }

    /// Marks `client_id` inactive unless a connection has authenticated as
    /// it since.  The registry is consulted inside the authority's write
    /// section, which `update_client_activity` on a reconnect also needs.
    async fn release_client(&self, client_id: ClientId) -> bool {
        let registry = &self.registry;
        self.authority
            .mark_client_inactive_unless(client_id, || registry.has_client(client_id))
            .await
    }

    /// Records a pong frame from the peer.
    pub async fn record_pong(&self, session: &ConnectionSession) {
        self.registry.mark_alive(session.id()).await;
    }

    // ── Inbound dispatch ──────────────────────────────────────────────────────

    /// Decodes and handles one text frame.
    pub async fn handle_text(&self, session: &mut ConnectionSession, text: &str) -> Flow {
        match decode_client_message(text) {
            Ok(msg) => self.handle_message(session, msg).await,
            Err(err) => {
                let in_auth_phase = !session.is_authenticated() && err.message_type() == Some("auth");
                if in_auth_phase {
                    warn!("connection {}: malformed auth message: {err}", session.id());
                    session.state = ConnectionState::Closed;
                    let _ = self.reply_error(session, ServiceError::authentication(err.to_string()));
                    return Flow::Close;
                }
                debug!("connection {}: rejected frame: {err}", session.id());
                self.reply_error(session, err.into())
            }
        }
    }

    /// Handles one decoded message.
    pub async fn handle_message(&self, session: &mut ConnectionSession, msg: ClientMessage) -> Flow {
        if msg.requires_auth() && !session.is_authenticated() {
            debug!(
                "connection {}: {} before authentication",
                session.id(),
                msg.type_name()
            );
            return self.reply_error(session, ServiceError::authentication("authentication required"));
        }

        match msg {
            ClientMessage::Auth(payload) => self.on_auth(session, payload).await,
            ClientMessage::Ping => {
                self.registry.mark_alive(session.id()).await;
                self.reply(session, ServerMessage::Pong {})
            }
            ClientMessage::SubscribeEntities(payload) => self.on_subscribe(session, payload).await,
            ClientMessage::CallService(payload) => self.on_call_service(session, payload).await,
            ClientMessage::Pair(payload) => self.on_pair(session, payload).await,
            ClientMessage::CreatePairingSession(payload) => {
                self.on_create_pairing_session(session, payload).await
            }
        }
    }

    async fn on_auth(&self, session: &mut ConnectionSession, payload: AuthPayload) -> Flow {
        if session.is_authenticated() {
            return self.reply_error(session, ServiceError::validation("already authenticated"));
        }

        session.state = ConnectionState::Authenticating;
        let client_id = payload.client_id;
        if !self
            .authority
            .verify_client_certificate(client_id, &payload.certificate)
            .await
        {
            warn!("connection {}: invalid credentials for client {client_id}", session.id());
            session.state = ConnectionState::Closed;
            let _ = self.reply_error(session, ServiceError::authentication("invalid client credentials"));
            return Flow::Close;
        }

        match self.registry.authenticate(session.id(), client_id).await {
            Ok(Some(previous)) => previous.close(CloseReason::Superseded),
            Ok(None) => {}
            Err(e) => {
                // Removed by a sweep while verifying.
                debug!("connection {}: {e}", session.id());
                session.state = ConnectionState::Closed;
                return Flow::Close;
            }
        }

        session.state = ConnectionState::Authenticated;
        session.client_id = Some(client_id);
        self.authority.update_client_activity(client_id).await;
        info!("client {client_id} authenticated on connection {}", session.id());
        self.reply(session, ServerMessage::AuthOk { client_id })
    }

    async fn on_subscribe(&self, session: &ConnectionSession, payload: SubscribeEntitiesPayload) -> Flow {
        let filter = EntityFilter::from_ids(payload.entity_ids);
        let entity_ids = filter.entity_ids();
        if !self.registry.set_filter(session.id(), filter).await {
            return Flow::Close;
        }
        debug!(
            "connection {} subscribed to {}",
            session.id(),
            if entity_ids.is_empty() {
                "all entities".to_string()
            } else {
                entity_ids.join(", ")
            }
        );
        self.reply(session, ServerMessage::Subscribed { entity_ids })
    }

    async fn on_call_service(&self, session: &ConnectionSession, payload: CallServicePayload) -> Flow {
        let call = ServiceCall::from(payload);
        let label = format!("{}.{}", call.domain, call.service);
        let deadline = self.settings.action_timeout;

        match timeout(deadline, self.hub.invoke(call)).await {
            Ok(Ok(result)) => {
                debug!("connection {}: {label} succeeded", session.id());
                self.reply(
                    session,
                    ServerMessage::ServiceCallResult {
                        success: true,
                        result,
                    },
                )
            }
            Ok(Err(e)) => {
                warn!("connection {}: {label} failed: {e}", session.id());
                self.reply_error(session, ServiceError::new(e.kind(), e.to_string()))
            }
            Err(_) => {
                warn!("connection {}: {label} timed out after {deadline:?}", session.id());
                self.reply_error(
                    session,
                    ServiceError::service_unavailable(format!(
                        "hub did not answer within {}s",
                        deadline.as_secs_f32()
                    )),
                )
            }
        }
    }

    async fn on_pair(&self, session: &ConnectionSession, payload: PairPayload) -> Flow {
        match self.authority.complete_session(payload.into()).await {
            Ok(client) => self.reply(
                session,
                ServerMessage::Paired {
                    client_id: client.id,
                    certificate: client.certificate,
                },
            ),
            Err(e) => {
                info!("connection {}: pairing failed: {e}", session.id());
                self.reply_error(session, e.into())
            }
        }
    }

    async fn on_create_pairing_session(
        &self,
        session: &ConnectionSession,
        payload: CreatePairingSessionPayload,
    ) -> Flow {
        let ttl = payload
            .ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(self.authority.settings().default_ttl);
        match self.authority.create_session(ttl).await {
            Ok(issued) => self.reply(
                session,
                ServerMessage::PairingSession {
                    session_id: issued.session_id,
                    pin: issued.pin,
                    expires_at: issued.expires_at,
                },
            ),
            Err(e) => self.reply_error(session, e.into()),
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    /// Pushes one hub event to every matching authenticated connection.
    pub async fn broadcast(&self, event: &EntityChangeEvent) -> BroadcastReport {
        let report = self.registry.broadcast(event).await;
        debug!(
            "entity {} fanned out to {} connection(s)",
            event.entity_id, report.delivered
        );
        report
    }

    /// Sends to the connection authenticated as `client_id`, if any.
    pub async fn send_to_client(&self, client_id: ClientId, msg: ServerMessage) -> bool {
        self.registry.send_to_client(client_id, msg).await
    }

    /// Runs one liveness round over every connection.
    pub async fn sweep_liveness(&self) -> LivenessReport {
        let report = self.registry.sweep_liveness().await;
        if !report.terminated.is_empty() {
            info!(
                "liveness sweep terminated {} connection(s)",
                report.terminated.len()
            );
        }
        report
    }

    fn reply(&self, session: &ConnectionSession, msg: ServerMessage) -> Flow {
        match session.handle.try_send(Outbound::Message(msg)) {
            Ok(()) => Flow::Continue,
            Err(SendError::Full) => {
                warn!("connection {} queue full; closing slow consumer", session.id());
                session.handle.close(CloseReason::SlowConsumer);
                Flow::Close
            }
            Err(SendError::Closed) => Flow::Close,
        }
    }

    /// Sends an error reply.  Internal errors also end the connection.
    fn reply_error(&self, session: &ConnectionSession, err: ServiceError) -> Flow {
        let fatal = !err.kind.is_operational();
        if fatal {
            error!("connection {}: {err}", session.id());
        }
        let flow = self.reply(session, ServerMessage::from(err));
        if fatal {
            Flow::Close
        } else {
            flow
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
