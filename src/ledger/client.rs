//! WebSocket ledger client with request correlation and endpoint failover

use super::types::{
    BookOffersResponse, Issue, LedgerClosed, SubmitResponse, TrustLine, ValidatedLedger,
};
use super::Ledger;
use crate::config::LedgerConfig;
use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

type PendingRequests = Arc<DashMap<u64, oneshot::Sender<Value>>>;

/// Live connection state
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
}

/// Ledger client over the rippled WebSocket API
pub struct XrplClient {
    /// Ledger configuration
    config: LedgerConfig,
    /// Endpoints, used in order on failover
    urls: Vec<String>,
    /// Current active endpoint index
    current_url: AtomicUsize,
    /// Request id counter
    next_id: AtomicU64,
    /// In-flight requests awaiting a response
    pending: PendingRequests,
    /// Current connection, if any
    connection: RwLock<Option<Connection>>,
    /// Serializes (re)connects
    connect_lock: Mutex<()>,
    /// Ledger-close fan-out
    ledger_tx: broadcast::Sender<LedgerClosed>,
}

impl XrplClient {
    /// Create a client and open the first connection
    pub async fn new(config: LedgerConfig) -> EngineResult<Self> {
        let urls: Vec<String> = config
            .ws_urls
            .iter()
            .filter(|u| !u.trim().is_empty())
            .cloned()
            .collect();

        if urls.is_empty() {
            return Err(EngineError::Config("No ledger WebSocket URLs".to_string()));
        }

        let (ledger_tx, _) = broadcast::channel(256);

        let client = Self {
            config,
            urls,
            current_url: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            connection: RwLock::new(None),
            connect_lock: Mutex::new(()),
            ledger_tx,
        };

        // Walk the list once so a dead primary does not block startup
        for _ in 0..client.urls.len() {
            match client.connect().await {
                Ok(()) => return Ok(client),
                Err(e) => {
                    warn!("Ledger connection to {} failed: {}", client.url(), e);
                    client.failover();
                }
            }
        }

        Err(EngineError::Network("All ledger endpoints failed".to_string()))
    }

    /// Get the active endpoint
    pub fn url(&self) -> &str {
        let idx = self.current_url.load(Ordering::Relaxed);
        &self.urls[idx % self.urls.len()]
    }

    /// Switch to next available endpoint
    pub fn failover(&self) {
        let current = self.current_url.load(Ordering::Relaxed);
        let next = (current + 1) % self.urls.len();
        self.current_url.store(next, Ordering::Relaxed);
        warn!("Ledger failover to endpoint {}", next);
    }

    /// Open a connection to the active endpoint and subscribe to ledger closes
    async fn connect(&self) -> EngineResult<()> {
        let _guard = self.connect_lock.lock().await;

        if let Some(conn) = self.connection.read().await.as_ref() {
            if !conn.outbound.is_closed() {
                return Ok(());
            }
        }

        let url = self.url().to_string();
        let (stream, _) = timeout(self.request_timeout(), connect_async(url.as_str()))
            .await
            .map_err(|_| EngineError::Timeout {
                operation: format!("connect to {}", url),
            })?
            .map_err(|e| EngineError::Network(format!("{}: {}", url, e)))?;

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("Ledger socket write failed: {}", e);
                    break;
                }
            }
        });

        let pending = self.pending.clone();
        let ledger_tx = self.ledger_tx.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => dispatch(&text, &pending, &ledger_tx),
                    Ok(Message::Close(frame)) => {
                        info!("Ledger socket closed: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Ledger socket read failed: {}", e);
                        break;
                    }
                }
            }
            writer.abort();
            // Dropping the senders fails every waiter fast
            pending.clear();
        });

        let previous = self.connection.write().await.replace(Connection { outbound, reader });
        if let Some(previous) = previous {
            previous.reader.abort();
        }

        info!("Connected to ledger endpoint {}", url);
        drop(_guard);

        self.request(json!({"command": "subscribe", "streams": ["ledger"]}))
            .await?;
        Ok(())
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    /// Send a command and wait for its correlated response `result`
    pub async fn request(&self, mut command: Value) -> EngineResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        command["id"] = json!(id);

        let outbound = {
            let conn = self.connection.read().await;
            conn.as_ref()
                .filter(|c| !c.outbound.is_closed())
                .map(|c| c.outbound.clone())
        };
        let outbound = match outbound {
            Some(outbound) => outbound,
            None => {
                Box::pin(self.connect()).await?;
                self.connection
                    .read()
                    .await
                    .as_ref()
                    .map(|c| c.outbound.clone())
                    .ok_or_else(|| EngineError::Network("not connected".to_string()))?
            }
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if outbound.send(Message::Text(command.to_string())).is_err() {
            self.pending.remove(&id);
            return Err(EngineError::Network("connection closed".to_string()));
        }

        let response = match timeout(self.request_timeout(), rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(EngineError::Network(
                    "connection dropped awaiting response".to_string(),
                ))
            }
            Err(_) => {
                self.pending.remove(&id);
                return Err(EngineError::Timeout {
                    operation: command["command"].as_str().unwrap_or("request").to_string(),
                });
            }
        };

        if response["status"] == "error" {
            let code = response["error"].as_str().unwrap_or("unknown").to_string();
            let message = response["error_message"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            debug!("Ledger error response {}: {}", code, message);
            return Err(EngineError::Ledger { code, message });
        }

        Ok(response["result"].clone())
    }
}

/// Route an inbound frame to its waiter or to the ledger stream
fn dispatch(text: &str, pending: &PendingRequests, ledger_tx: &broadcast::Sender<LedgerClosed>) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparseable ledger frame: {}", e);
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some((_, waiter)) = pending.remove(&id) {
            let _ = waiter.send(value);
        }
        return;
    }

    if value["type"] == "ledgerClosed" {
        match serde_json::from_value::<LedgerClosed>(value) {
            Ok(closed) => {
                crate::metrics::record_ledger_index(closed.ledger_index);
                // No receivers is fine
                let _ = ledger_tx.send(closed);
            }
            Err(e) => error!("Malformed ledgerClosed message: {}", e),
        }
    }
}

#[async_trait]
impl Ledger for XrplClient {
    async fn book_offers(
        &self,
        taker: &str,
        taker_gets: Issue,
        taker_pays: Issue,
        limit: u32,
    ) -> EngineResult<BookOffersResponse> {
        let result = self
            .request(json!({
                "command": "book_offers",
                "taker": taker,
                "taker_gets": taker_gets,
                "taker_pays": taker_pays,
                "limit": limit,
            }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn account_sequence(&self, account: &str) -> EngineResult<u32> {
        let result = self
            .request(json!({
                "command": "account_info",
                "account": account,
                "ledger_index": "current",
            }))
            .await?;

        result["account_data"]["Sequence"]
            .as_u64()
            .map(|s| s as u32)
            .ok_or_else(|| EngineError::Decoding("account_info without Sequence".to_string()))
    }

    async fn validated_ledger(&self, ledger_index: u32) -> EngineResult<ValidatedLedger> {
        let result = self
            .request(json!({
                "command": "ledger",
                "ledger_index": ledger_index,
                "transactions": true,
                "expand": true,
            }))
            .await?;
        Ok(serde_json::from_value(result["ledger"].clone())?)
    }

    async fn account_lines(&self, account: &str) -> EngineResult<Vec<TrustLine>> {
        let result = self
            .request(json!({
                "command": "account_lines",
                "account": account,
            }))
            .await?;
        Ok(serde_json::from_value(result["lines"].clone())?)
    }

    async fn submit(&self, tx_blob: &str) -> EngineResult<SubmitResponse> {
        let result = self
            .request(json!({
                "command": "submit",
                "tx_blob": tx_blob,
            }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    fn subscribe_ledger_closes(&self) -> broadcast::Receiver<LedgerClosed> {
        self.ledger_tx.subscribe()
    }

    async fn reset(&self) -> EngineResult<()> {
        if let Some(conn) = self.connection.write().await.take() {
            conn.reader.abort();
        }
        self.pending.clear();
        self.failover();
        crate::metrics::record_ledger_reset();
        self.connect().await
    }

    async fn health_check(&self) -> bool {
        match self.request(json!({"command": "server_info"})).await {
            Ok(_) => true,
            Err(e) => {
                error!("Ledger health check failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_routes_responses_and_streams() {
        let pending: PendingRequests = Arc::new(DashMap::new());
        let (ledger_tx, mut ledger_rx) = broadcast::channel(4);

        let (tx, rx) = oneshot::channel();
        pending.insert(9, tx);
        dispatch(
            r#"{"id": 9, "status": "success", "result": {"ok": true}}"#,
            &pending,
            &ledger_tx,
        );
        let response = rx.await.unwrap();
        assert_eq!(response["result"]["ok"], true);
        assert!(pending.is_empty());

        dispatch(
            r#"{"type": "ledgerClosed", "ledger_index": 77, "ledger_hash": "AB", "ledger_time": 1, "txn_count": 3}"#,
            &pending,
            &ledger_tx,
        );
        let closed = ledger_rx.recv().await.unwrap();
        assert_eq!(closed.ledger_index, 77);
        assert_eq!(closed.txn_count, 3);
    }
}
