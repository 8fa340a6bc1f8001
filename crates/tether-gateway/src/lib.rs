//! Broker gateway client for tether.
//!
//! Maintains a single shared WebSocket connection to the central event
//! broker. The connection is established lazily on first use, performs a
//! challenge/connect handshake, and reconnects with exponential backoff for
//! as long as at least one subscription remains. Listeners are keyed by the
//! run identity embedded in each event frame's payload.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub token: Option<String>,
    pub backoff_floor: Duration,
    pub backoff_cap: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            backoff_floor: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

struct Listener {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

struct GatewayInner {
    config: GatewayConfig,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    next_listener_id: AtomicU64,
    next_request_id: AtomicU64,
    running: AtomicBool,
    shutdown: CancellationToken,
}

impl GatewayInner {
    fn listener_count(&self) -> usize {
        self.listeners.lock().values().map(Vec::len).sum()
    }
}

/// Shared handle to the broker connection. Cloning is cheap; all clones share
/// one transport.
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<GatewayInner>,
}

/// Removes its listener on drop. Dropping the last listener does not close
/// the shared connection; it stays open for reuse until `shutdown`.
pub struct SubscriptionGuard {
    inner: Arc<GatewayInner>,
    identity: String,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut listeners = self.inner.listeners.lock();
        if let Some(list) = listeners.get_mut(&self.identity) {
            list.retain(|l| l.id != self.id);
            if list.is_empty() {
                listeners.remove(&self.identity);
            }
        }
    }
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                config,
                listeners: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                next_listener_id: AtomicU64::new(1),
                next_request_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register a listener for event frames whose payload names `identity`,
    /// and make sure the connection is (or is becoming) live.
    pub fn subscribe(&self, identity: &str, tx: mpsc::UnboundedSender<Value>) -> SubscriptionGuard {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .listeners
            .lock()
            .entry(identity.to_string())
            .or_default()
            .push(Listener { id, tx });
        self.ensure_connected();
        SubscriptionGuard {
            inner: self.inner.clone(),
            identity: identity.to_string(),
            id,
        }
    }

    /// Fire-and-forget tagged request to the broker. Never blocks the caller;
    /// if no transport is live the frame is dropped and the failure swallowed.
    pub fn notify(&self, payload: Value) {
        self.ensure_connected();
        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({"type": "request", "id": id.to_string(), "payload": payload});
        let sender = self.inner.outbound.lock().clone();
        match sender {
            Some(tx) => {
                if tx.send(frame).is_err() {
                    debug!("gateway notify dropped: transport closing");
                }
            }
            None => debug!("gateway notify dropped: no live transport"),
        }
    }

    /// Permanently stop the connection task. Only the host calls this.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    fn ensure_connected(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(connection_task(inner));
    }
}

async fn connection_task(inner: Arc<GatewayInner>) {
    let floor = inner.config.backoff_floor;
    let cap = inner.config.backoff_cap;
    let mut backoff = floor;

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        match run_connection(&inner).await {
            Ok(authenticated) => {
                if authenticated {
                    backoff = floor;
                }
            }
            Err(err) => {
                warn!("gateway connection failed: {err}");
            }
        }

        if inner.shutdown.is_cancelled() || inner.listener_count() == 0 {
            break;
        }

        debug!("gateway reconnecting in {:?}", backoff);
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = inner.shutdown.cancelled() => break,
        }
        backoff = next_backoff(backoff, cap);
    }

    inner.running.store(false, Ordering::SeqCst);
}

/// One connection lifetime: handshake, then pump frames until the transport
/// closes. Returns whether the broker acknowledged our connect request.
async fn run_connection(inner: &Arc<GatewayInner>) -> anyhow::Result<bool> {
    let (ws_stream, _) = tokio_tungstenite::connect_async(&inner.config.url).await?;
    let (mut write, mut read) = ws_stream.split();

    // The broker opens with a challenge frame carrying a nonce.
    let first = read
        .next()
        .await
        .ok_or_else(|| anyhow::anyhow!("gateway closed before challenge"))??;
    let challenge: Value = serde_json::from_str(&first.to_string())?;
    let nonce = challenge.get("nonce").and_then(Value::as_str);

    let connect = connect_frame(nonce, inner.config.token.as_deref());
    write.send(Message::Text(connect.to_string())).await?;
    info!("gateway connected to {}", inner.config.url);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    *inner.outbound.lock() = Some(out_tx);

    let mut authenticated = false;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            outgoing = out_rx.recv() => {
                let Some(frame) = outgoing else { break };
                if write.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = read.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(t))) => t,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!("gateway read error: {err}");
                        break;
                    }
                    _ => continue,
                };
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                match frame.get("type").and_then(Value::as_str) {
                    Some("connect-ok") => {
                        authenticated = true;
                    }
                    Some("response") => {
                        // Tagged request/response traffic; a well-formed
                        // response also proves the session is authenticated.
                        authenticated = true;
                    }
                    Some("event") => {
                        if let Some(payload) = frame.get("payload") {
                            dispatch_event(inner, payload);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    *inner.outbound.lock() = None;
    Ok(authenticated)
}

fn dispatch_event(inner: &Arc<GatewayInner>, payload: &Value) {
    let Some(identity) = payload.get("sessionKey").and_then(Value::as_str) else {
        return;
    };
    let mut listeners = inner.listeners.lock();
    if let Some(list) = listeners.get_mut(identity) {
        list.retain(|l| l.tx.send(payload.clone()).is_ok());
    }
}

fn connect_frame(nonce: Option<&str>, token: Option<&str>) -> Value {
    let mut frame = json!({"type": "connect"});
    if let Some(nonce) = nonce {
        frame["nonce"] = json!(nonce);
    }
    if let Some(token) = token {
        frame["token"] = json!(token);
    }
    frame
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    (current * 2).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let cap = Duration::from_secs(30);
        let mut backoff = Duration::from_secs(1);
        let mut observed = Vec::new();
        for _ in 0..7 {
            observed.push(backoff.as_secs());
            backoff = next_backoff(backoff, cap);
        }
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn connect_frame_includes_credentials_when_configured() {
        let frame = connect_frame(Some("n1"), Some("secret"));
        assert_eq!(frame["type"], "connect");
        assert_eq!(frame["nonce"], "n1");
        assert_eq!(frame["token"], "secret");

        let bare = connect_frame(None, None);
        assert!(bare.get("nonce").is_none());
        assert!(bare.get("token").is_none());
    }

    #[tokio::test]
    async fn dispatch_routes_by_embedded_identity() {
        let client = GatewayClient::new(GatewayConfig::default());
        client.inner.shutdown.cancel(); // keep the connection task out of the test

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let _guard_a = client.subscribe("run-a", tx_a);
        let _guard_b = client.subscribe("run-b", tx_b);

        let payload = json!({"sessionKey": "run-a", "event": "agent"});
        dispatch_event(&client.inner, &payload);

        assert_eq!(rx_a.try_recv().unwrap(), payload);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_guard_removes_listener() {
        let client = GatewayClient::new(GatewayConfig::default());
        client.inner.shutdown.cancel();

        let (tx, _rx) = mpsc::unbounded_channel();
        let guard = client.subscribe("run-a", tx);
        assert_eq!(client.inner.listener_count(), 1);
        drop(guard);
        assert_eq!(client.inner.listener_count(), 0);
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let guard2 = client.subscribe("run-a", tx2);
        assert_eq!(client.inner.listener_count(), 1);
        drop(guard2);
    }

    #[tokio::test]
    async fn notify_without_transport_is_swallowed() {
        let client = GatewayClient::new(GatewayConfig::default());
        client.inner.shutdown.cancel();
        client.notify(json!({"type": "abort", "sessionKey": "run-a"}));
    }
}
