//! Home Assistant WebSocket API adapter.
//!
//! A background task owns the connection to Home Assistant and:
//!
//! 1. Connects and completes the `auth_required` → `auth` → `auth_ok`
//!    handshake with the configured access token.
//! 2. Subscribes to `state_changed` events and republishes each one as an
//!    [`EntityChangeEvent`] on a broadcast channel.  A refused
//!    subscription fails the session like a lost connection.
//! 3. Forwards `call_service` commands, tagging each with a fresh id and
//!    completing the caller's oneshot when the matching `result` arrives.
//!    Calls whose caller gave up are pruned as new ones are sent.
//! 4. On disconnect, fails every in-flight call with
//!    [`HubError::Unavailable`] and reconnects with exponential backoff.
//!    Calls made while disconnected fail immediately.
//!
//! ```text
//! invoke() ──Command──► [task] ──call_service{id}──► Home Assistant
//!    ▲                    │  ◄──────result{id}──────────┘
//!    └────oneshot─────────┘  ◄──event{state_changed}── ─► broadcast ─► subscribers
//! ```

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use hublink_core::EntityChangeEvent;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use crate::application::hub::{EventSubscription, HubAdapter, HubError, ServiceCall};

/// Connection parameters for [`HomeAssistantHub`].
#[derive(Debug, Clone)]
pub struct HomeAssistantConfig {
    /// WebSocket URL, e.g. `ws://supervisor/core/websocket`.
    pub url: String,
    /// Long-lived access token (or the Supervisor token).
    pub token: String,
    /// Per-subscriber event buffer.
    pub event_buffer: usize,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl HomeAssistantConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            event_buffer: 1024,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

struct Command {
    call: ServiceCall,
    reply: oneshot::Sender<Result<Value, HubError>>,
}

/// Request id of the `state_changed` subscription.
const SUBSCRIBE_ID: u64 = 1;

struct PendingCall {
    domain: String,
    service: String,
    reply: oneshot::Sender<Result<Value, HubError>>,
}

/// How a connected session ended.
enum SessionEnd {
    /// The hub handle was dropped.
    Shutdown,
    /// Home Assistant closed an authenticated session.
    Disconnected,
}

/// [`HubAdapter`] backed by the Home Assistant WebSocket API.
pub struct HomeAssistantHub {
    events: broadcast::Sender<EntityChangeEvent>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl HomeAssistantHub {
    /// Starts the background connection task.  Returns immediately; the
    /// first connection attempt happens on the task.
    pub fn spawn(config: HomeAssistantConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let (commands, command_rx) = mpsc::channel(64);
        let task = tokio::spawn(run(config, events.clone(), command_rx));
        Self {
            events,
            commands,
            task,
        }
    }
}

impl Drop for HomeAssistantHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
impl HubAdapter for HomeAssistantHub {
    fn subscribe(&self) -> EventSubscription {
        EventSubscription::new(self.events.subscribe())
    }

    async fn invoke(&self, call: ServiceCall) -> Result<Value, HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command { call, reply })
            .await
            .map_err(|_| HubError::Unavailable("hub connection task stopped".to_string()))?;
        rx.await
            .map_err(|_| HubError::Unavailable("connection to Home Assistant lost".to_string()))?
    }
}

// ── Connection task ───────────────────────────────────────────────────────────

async fn run(
    config: HomeAssistantConfig,
    events: broadcast::Sender<EntityChangeEvent>,
    mut commands: mpsc::Receiver<Command>,
) {
    let mut delay = config.reconnect_delay;
    loop {
        match serve(&config, &events, &mut commands).await {
            Ok(SessionEnd::Shutdown) => {
                debug!("Home Assistant adapter shutting down");
                return;
            }
            Ok(SessionEnd::Disconnected) => {
                warn!("Home Assistant closed the connection; reconnecting");
                delay = config.reconnect_delay;
            }
            Err(e) => warn!("Home Assistant connection failed: {e}"),
        }

        // Back off, refusing calls until reconnected.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        let _ = cmd.reply.send(Err(HubError::Unavailable(
                            "not connected to Home Assistant".to_string(),
                        )));
                    }
                    None => return,
                },
            }
        }
        delay = (delay * 2).min(config.max_reconnect_delay);
    }
}

/// Runs one connection from handshake to disconnect.
async fn serve(
    config: &HomeAssistantConfig,
    events: &broadcast::Sender<EntityChangeEvent>,
    commands: &mut mpsc::Receiver<Command>,
) -> Result<SessionEnd, HubError> {
    let (ws, _) = connect_async(config.url.as_str())
        .await
        .map_err(|e| HubError::Unavailable(format!("connect to {}: {e}", config.url)))?;
    let (mut sink, mut stream) = ws.split();

    // ── Handshake ─────────────────────────────────────────────────────────────
    let mut authenticated = false;
    while !authenticated {
        let text = match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(HubError::Unavailable(e.to_string())),
            None => return Err(HubError::Unavailable("closed during handshake".to_string())),
        };
        match parse_frame(&text) {
            HaFrame::AuthRequired => {
                let auth = json!({"type": "auth", "access_token": config.token}).to_string();
                sink.send(WsMessage::Text(auth))
                    .await
                    .map_err(|e| HubError::Unavailable(e.to_string()))?;
            }
            HaFrame::AuthOk => authenticated = true,
            HaFrame::AuthInvalid(reason) => return Err(HubError::AuthFailed(reason)),
            _ => debug!("ignoring pre-auth frame from Home Assistant"),
        }
    }

    let subscribe = json!({"id": SUBSCRIBE_ID, "type": "subscribe_events", "event_type": "state_changed"});
    sink.send(WsMessage::Text(subscribe.to_string()))
        .await
        .map_err(|e| HubError::Unavailable(e.to_string()))?;
    info!("connected to Home Assistant at {}", config.url);

    // ── Main loop ─────────────────────────────────────────────────────────────
    let mut next_id: u64 = SUBSCRIBE_ID + 1;
    let mut pending: HashMap<u64, PendingCall> = HashMap::new();

    let end = loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(Command { call, reply }) = cmd else {
                    break Ok(SessionEnd::Shutdown);
                };
                let id = next_id;
                next_id += 1;
                let frame = call_service_frame(id, &call);
                if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                    let _ = reply.send(Err(HubError::Unavailable(e.to_string())));
                    break Err(HubError::Unavailable(e.to_string()));
                }
                prune_abandoned(&mut pending);
                pending.insert(id, PendingCall { domain: call.domain, service: call.service, reply });
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match parse_frame(&text) {
                    HaFrame::Event(event) => {
                        let _ = events.send(event);
                    }
                    HaFrame::Result { id: SUBSCRIBE_ID, outcome: Err(reason) } => {
                        break Err(HubError::Unavailable(format!(
                            "state_changed subscription refused: {reason}"
                        )));
                    }
                    HaFrame::Result { id, outcome } => {
                        if let Some(call) = pending.remove(&id) {
                            let result = outcome.map_err(|reason| HubError::Rejected {
                                domain: call.domain,
                                service: call.service,
                                reason,
                            });
                            let _ = call.reply.send(result);
                        }
                    }
                    _ => {}
                },
                Some(Ok(WsMessage::Close(_))) | None => break Ok(SessionEnd::Disconnected),
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(HubError::Unavailable(e.to_string())),
            },
        }
    };

    for (_, call) in pending.drain() {
        let _ = call.reply.send(Err(HubError::Unavailable(
            "connection to Home Assistant lost".to_string(),
        )));
    }
    end
}

/// Drops calls whose caller stopped waiting, e.g. after a gateway-side
/// action timeout.
fn prune_abandoned(pending: &mut HashMap<u64, PendingCall>) {
    pending.retain(|_, call| !call.reply.is_closed());
}

// ── Wire format ───────────────────────────────────────────────────────────────

/// The subset of Home Assistant frames the adapter reacts to.
#[derive(Debug, PartialEq)]
enum HaFrame {
    AuthRequired,
    AuthOk,
    AuthInvalid(String),
    Event(EntityChangeEvent),
    Result {
        id: u64,
        outcome: Result<Value, String>,
    },
    Other,
}

fn parse_frame(text: &str) -> HaFrame {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return HaFrame::Other;
    };
    match value.get("type").and_then(Value::as_str) {
        Some("auth_required") => HaFrame::AuthRequired,
        Some("auth_ok") => HaFrame::AuthOk,
        Some("auth_invalid") => HaFrame::AuthInvalid(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("invalid access token")
                .to_string(),
        ),
        Some("event") => {
            let data = &value["event"]["data"];
            match data.get("entity_id").and_then(Value::as_str) {
                Some(entity_id) => HaFrame::Event(EntityChangeEvent::new(
                    entity_id,
                    data.get("new_state").cloned().unwrap_or(Value::Null),
                )),
                None => HaFrame::Other,
            }
        }
        Some("result") => {
            let Some(id) = value.get("id").and_then(Value::as_u64) else {
                return HaFrame::Other;
            };
            let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
            let outcome = if success {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            } else {
                Err(value["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string())
            };
            HaFrame::Result { id, outcome }
        }
        _ => HaFrame::Other,
    }
}

fn call_service_frame(id: u64, call: &ServiceCall) -> String {
    let mut frame = json!({
        "id": id,
        "type": "call_service",
        "domain": call.domain,
        "service": call.service,
        "service_data": call.service_data,
    });
    if let Some(target) = &call.target {
        frame["target"] = target.clone();
    }
    frame.to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
