//! HTTP API for health checks, loan queries and subscriber sockets
//!
//! The API validates inbound requests and hands them to the lifecycle
//! components. Missing fields are answered with `{"error": "missing parameter X"}`.

use crate::config::ApiConfig;
use crate::coordination::{engine, Coordinator, EscrowRequest, SettlementHandle};
use crate::error::{EngineError, EngineResult};
use crate::ledger::Ledger;
use crate::pubsub::{Broker, PubSubMessage};
use crate::state::Store;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub ledger: Arc<dyn Ledger>,
    pub coordinator: Arc<Coordinator>,
    pub settlement: SettlementHandle,
    pub broker: Arc<Broker>,
    pub max_attempts: u32,
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> EngineResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::Internal(format!("api bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| EngineError::Internal(format!("api server: {}", e)))?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/api/v1/escrow/cancel", get(cancel_escrow))
        .route("/api/v1/loans/open", get(open_loans))
        .route("/api/v1/loans/trustlines", get(trust_lines))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body returned to HTTP callers
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Network(_) | EngineError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error_text(&e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

fn error_text(e: &EngineError) -> String {
    match e {
        EngineError::Validation(field) => format!("missing parameter {}", field),
        other => other.to_string(),
    }
}

fn param(query: &HashMap<String, String>, name: &str) -> Result<String, ApiError> {
    query
        .get(name)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| EngineError::Validation(name.to_string()).into())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify the store and the ledger connection
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.store.health_check().await.is_ok();
    let ledger = state.ledger.health_check().await;

    let status = if database && ledger {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            ready: database && ledger,
            database,
            ledger,
        }),
    )
}

/// Escrow counts by settlement status
async fn get_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.stats().await?;
    Ok(Json(stats))
}

async fn cancel_escrow(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let escrow_condition = param(&query, "escrow_condition")?;
    let sequence: u32 = param(&query, "sequence")?
        .parse()
        .map_err(|_| ApiError::from(EngineError::Validation("sequence".to_string())))?;
    let account = param(&query, "account")?;

    info!("Cancel requested for {}/{}", account, sequence);
    let outcome = state
        .settlement
        .cancel(&account, sequence, &escrow_condition)
        .await;

    Ok(Json(json!({
        "escrow_condition": escrow_condition,
        "sequence": sequence,
        "account": account,
        "engine_result": outcome.engine_result().map(|c| c.as_str().to_string()),
        "outcome": outcome.to_string(),
    })))
}

/// Open loans where the account is borrower or lender
async fn open_loans(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let account = param(&query, "account")?;
    let escrows = state.store.open_escrows_for_account(&account).await?;

    let mut loans = Vec::with_capacity(escrows.len());
    for escrow in &escrows {
        let completion = state.store.completion(&escrow.account, escrow.sequence).await?;
        loans.push(engine::describe(escrow, completion.as_ref(), state.max_attempts));
    }

    Ok(Json(json!({ "account": account, "loans": loans })))
}

async fn trust_lines(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let account = param(&query, "account")?;
    let lines = state.ledger.account_lines(&account).await?;
    Ok(Json(json!({ "account": account, "lines": lines })))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

/// Inbound socket frame: `{"request": "...", "message": {...}}`
#[derive(Debug, Deserialize)]
struct ClientRequest {
    request: String,
    #[serde(default)]
    message: Value,
}

/// Channel subscriptions held by one socket
struct Session {
    out: mpsc::Sender<String>,
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Session {
    fn subscribe(&mut self, broker: &Broker, account: &str) -> EngineResult<()> {
        if self.forwarders.contains_key(account) {
            return Ok(());
        }

        let mut rx = broker.subscribe(account)?;
        let out = self.out.clone();
        let channel = account.to_string();
        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(text) => {
                        if out.send(text).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Subscriber on {} lagged by {} message(s)", channel, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        debug!("Socket subscribed to {}", account);
        self.forwarders.insert(account.to_string(), forwarder);
        Ok(())
    }

    async fn reply(&self, body: Value) {
        let _ = self.out.send(body.to_string()).await;
    }

    fn close(self) {
        for (_, forwarder) in self.forwarders {
            forwarder.abort();
        }
    }
}

async fn client_session(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (out, mut outbound) = mpsc::channel::<String>(64);

    let writer = tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        out,
        forwarders: HashMap::new(),
    };

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let request: ClientRequest = match serde_json::from_str(&text) {
            Ok(request) => request,
            Err(e) => {
                debug!("Unreadable socket frame: {}", e);
                continue;
            }
        };

        if let Err(e) = handle_request(&state, &mut session, &request).await {
            session.reply(json!({ "error": error_text(&e) })).await;
        }
    }

    session.close();
    writer.abort();
}

async fn handle_request(
    state: &AppState,
    session: &mut Session,
    request: &ClientRequest,
) -> EngineResult<()> {
    let account = request
        .message
        .get("account")
        .and_then(Value::as_str)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| EngineError::Validation("account".to_string()))?;

    match request.request.as_str() {
        "SUBSCRIBE" => {
            info!("SUBSCRIBE {}", account);
            session.subscribe(&state.broker, account)
        }
        "PING" => {
            debug!("PING {}", account);
            session.subscribe(&state.broker, account)?;
            state
                .broker
                .route(&PubSubMessage::Pong(account.to_string()), account);
            Ok(())
        }
        "ESCROW" => {
            info!("ESCROW request from {}", account);
            let escrow = EscrowRequest::from_message(&request.message)?;
            session.subscribe(&state.broker, account)?;
            state.coordinator.create_escrow(&escrow).await?;
            Ok(())
        }
        other => {
            debug!("Ignoring socket request {}", other);
            Ok(())
        }
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    ledger: bool,
}
