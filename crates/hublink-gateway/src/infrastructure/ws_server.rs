//! WebSocket server: listeners, per-connection tasks, and periodic sweeps.
//!
//! This module is responsible for:
//!
//! 1. Binding the main listener (TLS when enabled) and, optionally, a
//!    plaintext fallback listener.
//! 2. Accepting TCP connections, completing the TLS and WebSocket handshakes,
//!    and handing each socket to the [`Gateway`].
//! 3. Running two tasks per connection:
//!    - **Reader** (the connection task itself): decodes text frames and
//!      dispatches them; pong frames mark the peer alive.
//!    - **Writer**: drains the connection's outbound queue onto the socket,
//!      and sends a close frame when the registry signals a forced close.
//! 4. Running the background loops: liveness probing, expired-session
//!    sweeping, and fan-out of hub events to connections.
//! 5. Shutting down when the `running` flag is cleared.
//!
//! # Closing a connection
//!
//! A connection ends in one of two ways:
//!
//! - **Graceful** (peer closed, or the gateway returned `Flow::Close`): the
//!   reader stops, the session is unregistered and its sender dropped, and
//!   the writer flushes whatever is already queued (e.g. the final error
//!   reply) before sending a normal close frame.
//! - **Forced** (superseded, liveness timeout, slow consumer, shutdown): the
//!   registry fires the close signal, both tasks stop at once, queued items
//!   are discarded, and the close frame carries the reason.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use hublink_core::protocol::encode_server_message_now;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, accept_hdr_async, tungstenite::Message as WsMessage, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::application::connection_registry::{CloseReason, ConnectionChannels, ConnectionId, Outbound};
use crate::application::gateway::{Flow, Gateway};
use crate::application::hub::EventSubscription;
use crate::domain::ServerSettings;
use crate::infrastructure::tls::TransportSecurity;

/// Upper bound on the TLS plus WebSocket handshakes of one connection.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often the accept loops re-check the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

// ── Public API ────────────────────────────────────────────────────────────────

/// Bound listeners plus everything needed to serve them.
pub struct GatewayServer {
    gateway: Arc<Gateway>,
    security: TransportSecurity,
    settings: ServerSettings,
    listener: TcpListener,
    fallback: Option<TcpListener>,
}

impl GatewayServer {
    /// Binds the main listener, and the fallback listener when TLS is on and
    /// a fallback address is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if either listener cannot be bound.
    pub async fn bind(
        settings: ServerSettings,
        security: TransportSecurity,
        gateway: Arc<Gateway>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(settings.bind_addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", settings.bind_addr))?;

        let fallback = match settings.fallback_addr {
            Some(addr) if security.is_tls() => Some(
                TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind fallback listener on {addr}"))?,
            ),
            _ => None,
        };

        Ok(Self {
            gateway,
            security,
            settings,
            listener,
            fallback,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn fallback_addr(&self) -> Option<SocketAddr> {
        self.fallback.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Serves until `running` is set to `false`, then closes every
    /// connection.
    pub async fn run(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        let local_addr = self.local_addr().context("listener has no local address")?;
        info!(
            "HubLink gateway listening on {}://{local_addr}",
            self.security.scheme()
        );

        let Self {
            gateway,
            security,
            settings,
            listener,
            fallback,
        } = self;

        let mut background: Vec<JoinHandle<()>> = vec![
            tokio::spawn(liveness_loop(Arc::clone(&gateway))),
            tokio::spawn(session_sweep_loop(Arc::clone(&gateway))),
            tokio::spawn(fan_out(Arc::clone(&gateway), gateway.hub().subscribe())),
        ];

        if let Some(fallback) = fallback {
            let redirect_port = settings.redirect_to_secure.then_some(local_addr.port());
            match redirect_port {
                Some(port) => info!(
                    "plaintext fallback on {} redirects to port {port}",
                    fallback.local_addr()?
                ),
                None => warn!(
                    "plaintext fallback on {} serves unencrypted connections",
                    fallback.local_addr()?
                ),
            }
            let gw = Arc::clone(&gateway);
            let flag = Arc::clone(&running);
            background.push(tokio::spawn(async move {
                accept_loop(&fallback, &flag, |stream, peer| {
                    let gw = Arc::clone(&gw);
                    tokio::spawn(async move {
                        match redirect_port {
                            Some(port) => redirect_to_secure(stream, peer, port).await,
                            None => serve_socket(stream, peer, gw).await,
                        }
                    });
                })
                .await;
            }));
        }

        accept_loop(&listener, &running, |stream, peer| {
            let gw = Arc::clone(&gateway);
            let security = security.clone();
            tokio::spawn(async move {
                handle_tcp(stream, peer, security, gw).await;
            });
        })
        .await;

        for task in background {
            task.abort();
        }
        let closed = gateway.registry().close_all(CloseReason::Shutdown).await;
        info!("gateway stopped; closed {closed} connection(s)");
        Ok(())
    }
}

// ── Accept loop ───────────────────────────────────────────────────────────────

/// Accepts until `running` is cleared, polling the flag every
/// [`ACCEPT_POLL`].
async fn accept_loop(
    listener: &TcpListener,
    running: &AtomicBool,
    mut on_accept: impl FnMut(TcpStream, SocketAddr),
) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("accepted TCP connection from {peer}");
                on_accept(stream, peer);
            }
            // Transient (e.g. too many open files); keep serving.
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }
}

// ── Per-connection handling ───────────────────────────────────────────────────

async fn handle_tcp(stream: TcpStream, peer: SocketAddr, security: TransportSecurity, gateway: Arc<Gateway>) {
    match security {
        TransportSecurity::Tls(acceptor) => match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => serve_socket(tls, peer, gateway).await,
            Ok(Err(e)) => warn!("TLS handshake with {peer} failed: {e}"),
            Err(_) => warn!("TLS handshake with {peer} timed out"),
        },
        TransportSecurity::Plaintext => serve_socket(stream, peer, gateway).await,
    }
}

async fn serve_socket<S>(stream: S, peer: SocketAddr, gateway: Arc<Gateway>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match run_connection(stream, peer, gateway).await {
        Ok(()) => debug!("connection from {peer} finished"),
        Err(e) => warn!("connection from {peer} closed with error: {e:#}"),
    }
}

/// Runs one WebSocket connection from handshake to close.
async fn run_connection<S>(stream: S, peer: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = timeout(HANDSHAKE_TIMEOUT, accept_async(stream))
        .await
        .with_context(|| format!("WebSocket handshake with {peer} timed out"))?
        .with_context(|| format!("WebSocket handshake with {peer} failed"))?;
    let (ws_tx, mut ws_rx) = ws.split();

    let (mut session, channels) = gateway.open_connection().await;
    let conn_id = session.id();
    info!("connection {conn_id} opened from {peer}");

    let ConnectionChannels { outbound, close } = channels;
    let mut close_signal = close.clone();
    let write_timeout = gateway.settings().write_timeout;
    let mut writer = tokio::spawn(write_loop(ws_tx, outbound, close, write_timeout, conn_id));

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            _ = close_signal.changed() => {
                debug!("connection {conn_id}: closed by server");
                break;
            }
        };

        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                if gateway.handle_text(&mut session, &text).await == Flow::Close {
                    break;
                }
            }
            Some(Ok(WsMessage::Pong(_))) => gateway.record_pong(&session).await,
            Some(Ok(WsMessage::Binary(_))) => {
                debug!("connection {conn_id}: ignoring binary frame");
            }
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!("connection {conn_id}: peer closed");
                break;
            }
            // Pings are answered by tungstenite.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("connection {conn_id}: read error: {e}");
                break;
            }
        }
    }

    gateway.close_connection(session).await;

    // Let the writer flush a final reply; never wait on it forever.
    if timeout(write_timeout * 2, &mut writer).await.is_err() {
        writer.abort();
    }
    info!("connection {conn_id} closed");
    Ok(())
}

/// Drains the outbound queue onto the socket until the queue closes or the
/// server forces a close.
async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
    mut close: watch::Receiver<Option<CloseReason>>,
    write_timeout: Duration,
    conn_id: ConnectionId,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut close_armed = true;
    loop {
        let item = tokio::select! {
            biased;
            changed = close.changed(), if close_armed => {
                if changed.is_err() {
                    // Every handle is gone; finish draining the queue.
                    close_armed = false;
                    continue;
                }
                let reason = *close.borrow();
                let frame = reason.map(|r| CloseFrame {
                    code: close_code(r),
                    reason: r.as_str().into(),
                });
                let _ = timeout(write_timeout, sink.send(WsMessage::Close(frame))).await;
                return;
            }
            item = outbound.recv() => item,
        };

        let frame = match item {
            Some(Outbound::Message(msg)) => match encode_server_message_now(&msg) {
                Ok(text) => WsMessage::Text(text),
                Err(e) => {
                    error!("connection {conn_id}: failed to encode {}: {e}", msg.type_name());
                    continue;
                }
            },
            Some(Outbound::Probe) => WsMessage::Ping(Vec::new()),
            None => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                let _ = timeout(write_timeout, sink.send(WsMessage::Close(Some(frame)))).await;
                return;
            }
        };

        match timeout(write_timeout, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("connection {conn_id}: write failed: {e}");
                return;
            }
            Err(_) => {
                warn!("connection {conn_id}: write timed out after {write_timeout:?}");
                return;
            }
        }
    }
}

fn close_code(reason: CloseReason) -> CloseCode {
    match reason {
        CloseReason::Superseded | CloseReason::LivenessTimeout => CloseCode::Policy,
        CloseReason::SlowConsumer => CloseCode::Again,
        CloseReason::Shutdown => CloseCode::Away,
    }
}

// ── Plaintext fallback redirect ───────────────────────────────────────────────

/// Refuses the upgrade with `301 Moved Permanently` pointing at `wss://`.
async fn redirect_to_secure(stream: TcpStream, peer: SocketAddr, secure_port: u16) {
    let callback = move |req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
        Err(redirect_response(req, secure_port))
    };
    match accept_hdr_async(stream, callback).await {
        Ok(_) => warn!("plaintext upgrade from {peer} unexpectedly accepted"),
        Err(e) => debug!("redirected plaintext upgrade from {peer} ({e})"),
    }
}

fn redirect_response(req: &Request, secure_port: u16) -> ErrorResponse {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(strip_port)
        .unwrap_or("localhost");
    let path = req.uri().path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let location = format!("wss://{host}:{secure_port}{path}");

    let mut resp = ErrorResponse::new(None);
    *resp.status_mut() = StatusCode::MOVED_PERMANENTLY;
    if let Ok(value) = HeaderValue::from_str(&location) {
        resp.headers_mut().insert(header::LOCATION, value);
    }
    resp
}

/// `host:port` → `host`, keeping bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}

// ── Background loops ──────────────────────────────────────────────────────────

async fn liveness_loop(gateway: Arc<Gateway>) {
    let mut ticker = interval(gateway.settings().probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let report = gateway.sweep_liveness().await;
        debug!(
            "liveness sweep: probed {}, terminated {}",
            report.probed,
            report.terminated.len()
        );
    }
}

async fn session_sweep_loop(gateway: Arc<Gateway>) {
    let mut ticker = interval(gateway.authority().settings().sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        gateway.authority().sweep_sessions().await;
    }
}

/// Pushes every hub event to matching connections.  The subscription is
/// dropped, and so unsubscribed, when this task is aborted at shutdown.
async fn fan_out(gateway: Arc<Gateway>, mut subscription: EventSubscription) {
    while let Some(event) = subscription.recv().await {
        gateway.broadcast(&event).await;
    }
    warn!("hub event stream ended; no further entity updates will be pushed");
}

// ── Tests ─────────────────────────────────────────────────────────────────────
