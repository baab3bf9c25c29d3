//! Per-provider pool of persistent WebSocket connections.
//!
//! A [`WsController`] owns N connections to one provider, each carrying its
//! own slice of subscriptions. Every connection automatically handles:
//! - reconnection on dial failure, transport error, EOF or inactivity,
//!   with capped exponential backoff;
//! - re-sending its subscription messages after every (re)connect;
//! - periodic pings, when the provider wants application-level heartbeats.
//!
//! Inbound frames are handed to a per-connection handler together with a
//! [`WsHandle`] for writing back on the live socket. Some providers
//! (Huobi, Crypto.com) embed their heartbeats in the data stream and the
//! handler, not the controller, must echo them. The controller itself is
//! payload-agnostic: it never inspects or decompresses frames.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{error, warn};
use serde::Serialize;
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    time::{Instant, interval, sleep, sleep_until, timeout},
};
use tokio_util::sync::CancellationToken;
use url::Url;
use yawc::{
    Options, WebSocket,
    frame::{FrameView, OpCode},
};

use super::{ProviderName, telemetry};

/// Default application-level ping period.
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(15);

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
const RECONNECT_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

/// Whether and how often a connection sends application pings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingPolicy {
    /// Never ping; the provider keeps the connection alive by itself.
    Disabled,
    /// Ping every [`DEFAULT_PING_PERIOD`].
    Enabled,
    /// Ping with a provider-chosen period.
    Every(Duration),
}

impl PingPolicy {
    /// The effective period, or `None` when pinging is disabled.
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Enabled => Some(DEFAULT_PING_PERIOD),
            Self::Every(period) => Some(*period),
        }
    }
}

/// What a ping looks like on the wire. Providers disagree: some expect a
/// JSON object, some the bare string `"ping"`, some a protocol-level ping
/// control frame.
#[derive(Clone, Debug)]
pub enum PingMessage {
    /// A JSON payload, e.g. `{"op":"ping"}`.
    Json(serde_json::Value),
    /// A literal text frame, unquoted.
    Text(String),
    /// A WebSocket ping control frame with an empty payload.
    Frame,
}

impl PingMessage {
    fn frame(&self) -> FrameView {
        match self {
            Self::Json(value) => FrameView::text(value.to_string()),
            Self::Text(text) => FrameView::text(text.clone()),
            Self::Frame => FrameView::ping(Vec::new()),
        }
    }
}

/// Write-side handle to a live connection, passed to message handlers so
/// they can answer server-initiated heartbeats.
#[derive(Clone)]
pub struct WsHandle {
    tx: UnboundedSender<FrameView>,
}

impl WsHandle {
    pub(crate) fn pair() -> (Self, UnboundedReceiver<FrameView>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues a JSON text frame for sending on the connection.
    pub fn send_json<T: Serialize>(&self, msg: &T) {
        match serde_json::to_string(msg) {
            Ok(text) => {
                let _ = self.tx.send(FrameView::text(text));
            }
            Err(err) => error!("unable to encode outbound frame: {err}"),
        }
    }

    /// Queues a raw text frame for sending on the connection.
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(FrameView::text(text.into()));
    }
}

/// Per-connection message callback: opcode, raw payload, and the write-side
/// handle of the connection the frame arrived on. Invocations are serialized
/// and in arrival order within one connection.
pub type MessageHandler = Arc<dyn Fn(OpCode, &[u8], &WsHandle) + Send + Sync>;

struct ConnectionConfig {
    subscribe_msgs: Vec<serde_json::Value>,
    handler: MessageHandler,
    ping: PingPolicy,
    ping_msg: PingMessage,
}

/// Pool of long-lived WebSocket workers for one provider.
pub struct WsController {
    name: ProviderName,
    url: Url,
    cancel: CancellationToken,
    pending: Mutex<Vec<Arc<ConnectionConfig>>>,
    started: AtomicBool,
}

impl WsController {
    /// Creates a controller for `url`, driven by `cancel`. No connection is
    /// opened until [`start_connections`](Self::start_connections).
    pub fn new(name: ProviderName, url: Url, cancel: CancellationToken) -> Self {
        Self {
            name,
            url,
            cancel,
            pending: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Registers a connection carrying `subscribe_msgs`, replayed in order
    /// after every (re)connect. When the controller is already running the
    /// worker is spawned immediately; providers use this to put pairs that
    /// arrive after startup on a fresh socket.
    pub fn add_connection(
        &self,
        subscribe_msgs: Vec<serde_json::Value>,
        handler: MessageHandler,
        ping: PingPolicy,
        ping_msg: PingMessage,
    ) {
        let config = Arc::new(ConnectionConfig {
            subscribe_msgs,
            handler,
            ping,
            ping_msg,
        });
        if self.started.load(Ordering::Acquire) {
            self.spawn(config);
        } else {
            self.pending.lock().unwrap().push(config);
        }
    }

    /// Spawns one worker per registered connection. Idempotent.
    pub fn start_connections(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let configs = std::mem::take(&mut *self.pending.lock().unwrap());
        for config in configs {
            self.spawn(config);
        }
    }

    fn spawn(&self, config: Arc<ConnectionConfig>) {
        tokio::spawn(run_connection(
            self.name,
            self.url.clone(),
            self.cancel.clone(),
            config,
        ));
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_CAP)
}

async fn run_connection(
    name: ProviderName,
    url: Url,
    cancel: CancellationToken,
    config: Arc<ConnectionConfig>,
) {
    let mut backoff = RECONNECT_FLOOR;

    'redial: loop {
        if cancel.is_cancelled() {
            return;
        }

        let connect = WebSocket::connect(url.clone())
            .with_options(Options::default().with_no_delay());
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return,
            dialed = timeout(DIAL_TIMEOUT, connect) => match dialed {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    warn!("{name}: unable to connect to {url}: {err:?}");
                    telemetry::websocket_reconnect(name);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                    continue 'redial;
                }
                Err(_) => {
                    warn!("{name}: timed out connecting to {url}");
                    telemetry::websocket_reconnect(name);
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                    continue 'redial;
                }
            },
        };
        backoff = RECONNECT_FLOOR;

        // Subscription replay.
        let mut subscribed = true;
        for msg in &config.subscribe_msgs {
            if let Err(err) = stream.send_json(msg).await {
                warn!("{name}: subscribing: {err:?}");
                subscribed = false;
                break;
            }
        }
        if !subscribed {
            telemetry::websocket_reconnect(name);
            continue 'redial;
        }

        let (handle, mut replies) = WsHandle::pair();
        let ping_period = config.ping.period();
        let mut ping = interval(ping_period.unwrap_or(Duration::from_secs(3600)));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately.
        ping.tick().await;

        // The deadline only moves when a frame actually arrives, so pings
        // going out unanswered still count as inactivity.
        let mut deadline = Instant::now() + INACTIVITY_TIMEOUT;
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep_until(deadline) => break "inactivity timeout".to_string(),
                _ = ping.tick(), if ping_period.is_some() => {
                    if let Err(err) = stream.send(config.ping_msg.frame()).await {
                        break format!("ping failed: {err:?}");
                    }
                }
                reply = replies.recv() => {
                    // The sender half lives in `handle`, so recv never yields
                    // None inside this loop.
                    if let Some(frame) = reply
                        && let Err(err) = stream.send(frame).await
                    {
                        break format!("reply failed: {err:?}");
                    }
                }
                inbound = stream.next() => {
                    match inbound {
                        None => break "connection closed by peer".to_string(),
                        Some(frame) => {
                            deadline = Instant::now() + INACTIVITY_TIMEOUT;
                            match frame.opcode {
                                OpCode::Close => break "close frame received".to_string(),
                                // Control frames are the transport's business.
                                OpCode::Ping | OpCode::Pong => {}
                                _ => (config.handler)(frame.opcode, &frame.payload, &handle),
                            }
                        }
                    }
                }
            }
        };

        warn!("{name}: reconnecting to {url}: {reason}");
        telemetry::websocket_reconnect(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = RECONNECT_FLOOR;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_ping_policy_periods() {
        assert_eq!(PingPolicy::Disabled.period(), None);
        assert_eq!(PingPolicy::Enabled.period(), Some(DEFAULT_PING_PERIOD));
        assert_eq!(
            PingPolicy::Every(Duration::from_secs(5)).period(),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_ping_message_renders_unquoted_text() {
        let frame = PingMessage::Text("ping".into()).frame();
        assert_eq!(&frame.payload[..], b"ping");

        let frame = PingMessage::Json(serde_json::json!({"op": "ping"})).frame();
        assert_eq!(&frame.payload[..], br#"{"op":"ping"}"#);
    }

    #[tokio::test]
    async fn test_handle_sends_json_frames() {
        let (handle, mut rx) = WsHandle::pair();
        handle.send_json(&serde_json::json!({"pong": 1_492_420_473_027_u64}));
        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame.payload[..], br#"{"pong":1492420473027}"#);
    }
}
