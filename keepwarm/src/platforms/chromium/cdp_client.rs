use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use crate::errors::AutomationError;

type CallResult = Result<Value, String>;
type PendingMap = HashMap<u64, oneshot::Sender<CallResult>>;
type Pending = Arc<Mutex<PendingMap>>;

/// Lightweight Chrome DevTools Protocol HTTP endpoint of a launched browser
#[derive(Debug, Clone)]
pub struct DevToolsEndpoint {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct TabInfo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub websocket_url: Option<String>,
}

impl DevToolsEndpoint {
    pub fn new(debug_port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{debug_port}"),
            client: reqwest::Client::new(),
        }
    }

    /// Check if the browser answers on its DevTools port
    pub async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/json/version", self.base_url))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Get list of all targets
    pub async fn get_tabs(&self) -> Result<Vec<TabInfo>, AutomationError> {
        let response = self
            .client
            .get(format!("{}/json/list", self.base_url))
            .send()
            .await
            .map_err(|e| AutomationError::Protocol(format!("Failed to get tabs: {e}")))?;

        let tabs: Vec<TabInfo> = response
            .json()
            .await
            .map_err(|e| AutomationError::Protocol(format!("Failed to parse tabs: {e}")))?;

        debug!("Found {} targets", tabs.len());
        Ok(tabs)
    }

    /// WebSocket URL of the first page target
    pub async fn page_websocket_url(&self) -> Result<String, AutomationError> {
        let tabs = self.get_tabs().await?;
        tabs.into_iter()
            .filter(|tab| tab.kind == "page")
            .find_map(|tab| {
                debug!(id = %tab.id, url = %tab.url, title = %tab.title, "Using page target");
                tab.websocket_url
            })
            .ok_or_else(|| AutomationError::Launch("browser exposed no page target".into()))
    }
}

#[derive(Debug, Serialize)]
struct CdpRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CdpErrorBody {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<CdpErrorBody>,
    },
    Event {
        method: String,
        #[serde(default)]
        params: Value,
    },
}

/// Protocol event pushed by the browser
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Default)]
struct NetworkActivity {
    inflight: HashSet<String>,
    last_change: Option<Instant>,
}

/// WebSocket session with one DevTools target.
///
/// Requests are matched to responses through a pending map of oneshot
/// senders; events are fanned out on a broadcast channel.
pub struct CdpConnection {
    sender: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    events: broadcast::Sender<CdpEvent>,
    network: Arc<std::sync::Mutex<NetworkActivity>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self, AutomationError> {
        let (ws_stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| AutomationError::Protocol(format!("WebSocket connect failed: {e}")))?;
        let (mut sink, mut stream) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);
        let network = Arc::new(std::sync::Mutex::new(NetworkActivity::default()));

        // writer task
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("cdp send error: {}", e);
                    break;
                }
            }
        });

        // reader loop
        let reader_pending = pending.clone();
        let reader_events = events.clone();
        let reader_network = network.clone();
        let reader = tokio::spawn(async move {
            while let Some(Ok(msg)) = stream.next().await {
                if !msg.is_text() {
                    continue;
                }
                let txt = msg.into_text().unwrap_or_default();
                match serde_json::from_str::<Incoming>(&txt) {
                    Ok(Incoming::Response { id, result, error }) => {
                        if let Some(tx) = reader_pending.lock().await.remove(&id) {
                            let _ = tx.send(match error {
                                Some(err) => Err(format!("{} (code {})", err.message, err.code)),
                                None => Ok(result.unwrap_or(Value::Null)),
                            });
                        }
                    }
                    Ok(Incoming::Event { method, params }) => {
                        track_network(&reader_network, &method, &params);
                        // No subscribers is the common case
                        let _ = reader_events.send(CdpEvent { method, params });
                    }
                    Err(e) => warn!("Invalid incoming CDP message: {}", e),
                }
            }
            debug!("CDP connection closed");
            for (_, tx) in reader_pending.lock().await.drain() {
                let _ = tx.send(Err("connection closed".into()));
            }
        });

        Ok(Self {
            sender: tx,
            pending,
            next_id: AtomicU64::new(1),
            events,
            network,
            reader,
            writer,
        })
    }

    /// Sends one command and waits for its response.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AutomationError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel::<CallResult>();
        self.pending.lock().await.insert(id, tx);

        let payload = serde_json::to_string(&CdpRequest { id, method, params })?;
        if self.sender.send(Message::Text(payload)).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AutomationError::Protocol(format!(
                "{method}: connection closed"
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(AutomationError::Protocol(format!("{method}: {message}"))),
            Ok(Err(_canceled)) => Err(AutomationError::Protocol(format!(
                "{method}: response channel dropped"
            ))),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                Err(AutomationError::Timeout(format!(
                    "{method} did not answer within {timeout:?}"
                )))
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// True when no request has been in flight for at least `quiet`.
    pub fn network_quiet_for(&self, quiet: Duration) -> bool {
        let Ok(activity) = self.network.lock() else {
            return false;
        };
        activity.inflight.is_empty()
            && activity
                .last_change
                .map(|at| at.elapsed() >= quiet)
                .unwrap_or(true)
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn track_network(network: &std::sync::Mutex<NetworkActivity>, method: &str, params: &Value) {
    let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
        return;
    };
    let Ok(mut activity) = network.lock() else {
        return;
    };
    match method {
        "Network.requestWillBeSent" => {
            activity.inflight.insert(request_id.to_string());
        }
        "Network.loadingFinished" | "Network.loadingFailed" => {
            activity.inflight.remove(request_id);
        }
        _ => return,
    }
    activity.last_change = Some(Instant::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_and_events_are_told_apart() {
        let resp: Incoming = serde_json::from_str(r#"{"id":7,"result":{"frameId":"A"}}"#).unwrap();
        assert!(matches!(resp, Incoming::Response { id: 7, .. }));

        let err: Incoming =
            serde_json::from_str(r#"{"id":8,"error":{"code":-32000,"message":"No node"}}"#).unwrap();
        match err {
            Incoming::Response { error: Some(e), .. } => assert_eq!(e.message, "No node"),
            other => panic!("unexpected {other:?}"),
        }

        let event: Incoming =
            serde_json::from_str(r#"{"method":"Page.loadEventFired","params":{"timestamp":1.0}}"#)
                .unwrap();
        assert!(matches!(event, Incoming::Event { ref method, .. } if method == "Page.loadEventFired"));
    }

    #[test]
    fn network_tracking_counts_inflight_requests() {
        let network = std::sync::Mutex::new(NetworkActivity::default());
        track_network(&network, "Network.requestWillBeSent", &json!({"requestId": "1"}));
        track_network(&network, "Network.requestWillBeSent", &json!({"requestId": "2"}));
        track_network(&network, "Network.loadingFinished", &json!({"requestId": "1"}));
        assert_eq!(network.lock().unwrap().inflight.len(), 1);
        track_network(&network, "Network.loadingFailed", &json!({"requestId": "2"}));
        assert!(network.lock().unwrap().inflight.is_empty());
        track_network(&network, "Page.loadEventFired", &json!({}));
        assert!(network.lock().unwrap().last_change.is_some());
    }

    #[tokio::test]
    async fn availability_follows_the_version_endpoint() {
        let server = tiny_http::Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let handle = std::thread::spawn(move || {
            let request = server.recv().unwrap();
            let path = request.url().to_string();
            request
                .respond(tiny_http::Response::from_string(r#"{"Browser":"Chrome"}"#))
                .unwrap();
            path
        });

        assert!(DevToolsEndpoint::new(port).is_available().await);
        assert_eq!(handle.join().unwrap(), "/json/version");

        let closed = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(!DevToolsEndpoint::new(closed).is_available().await);
    }
}
