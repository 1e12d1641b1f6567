use crate::dispatch::{ChatExchange, ReplyAssembler};
use crate::error::{GatewayError, Result};
use crate::storage::Storage;
use crate::usage::{UsageLedger, WeeklyUsageRecord};
use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    routing::{delete, get, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub assembler: Arc<ReplyAssembler>,
    pub ledger: Arc<UsageLedger>,
    pub storage: Storage,
    pub default_system_prompt: Arc<str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: String,
    system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    reply: String,
    input_tokens: u64,
    output_tokens: u64,
    /// Set when the reply succeeded but something could not be saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveChatRequest {
    chat_id: String,
    chat_data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveTokenUsageRequest {
    start_date: NaiveDate,
    input_tokens: u64,
    output_tokens: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CurrentUsage {
    week_start: NaiveDate,
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
    total_cost: f64,
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/chat", post(chat))
        .route("/saveChat", post(save_chat))
        .route("/loadChats", get(load_chats))
        .route("/deleteChat/:chat_id", delete(delete_chat))
        .route("/getTokenUsageHistory", get(token_usage_history))
        .route("/saveTokenUsage", post(save_token_usage))
        .route("/tokenUsage", get(current_usage));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves. In-flight requests, including their
/// storage writes, are drained before this returns.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(GatewayError::Io)?;

    info!("Gateway stopped");
    Ok(())
}

fn chat_blob_name(chat_id: &str) -> String {
    format!("{}.json", chat_id)
}

fn ok_message(message: &str) -> Json<Value> {
    Json(json!({ "message": message }))
}

fn parse_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(value)| value)
        .map_err(|rejection| GatewayError::InvalidRequest(rejection.body_text()))
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn persist_transcript(storage: &Storage, exchange: &ChatExchange) -> Result<()> {
    let data = serde_json::to_vec_pretty(exchange)?;
    storage
        .transcripts
        .put(&chat_blob_name(&exchange.id.to_string()), data)
        .await
}

async fn chat(
    State(state): State<AppState>,
    body: std::result::Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>> {
    let request = parse_body(body)?;
    let system_prompt = request
        .system_prompt
        .unwrap_or_else(|| state.default_system_prompt.to_string());

    let exchange = state
        .assembler
        .assemble_reply(&request.message, &system_prompt)
        .await?;

    info!(
        exchange = %exchange.id,
        chunks = exchange.chunk_count,
        input_tokens = exchange.input_tokens,
        output_tokens = exchange.output_tokens,
        "Exchange completed"
    );

    // Accounting happens regardless of whether the writes below succeed.
    let rollover = state.ledger.record_exchange(
        exchange.input_tokens,
        exchange.output_tokens,
        exchange.timestamp,
    );

    let mut warnings = Vec::new();

    if let Err(e) = persist_transcript(&state.storage, &exchange).await {
        warn!(exchange = %exchange.id, error = %e, "Failed to save chat transcript");
        warnings.push("chat transcript could not be saved");
    }

    if let Some(record) = rollover {
        if let Err(e) = state.storage.usage.append(&record).await {
            warn!(week_start = %record.start_date, error = %e, "Failed to save weekly usage record");
            warnings.push("weekly usage record could not be saved");
        }
    }

    Ok(Json(ChatResponse {
        reply: exchange.assistant_reply,
        input_tokens: exchange.input_tokens,
        output_tokens: exchange.output_tokens,
        warning: (!warnings.is_empty()).then(|| warnings.join("; ")),
    }))
}

async fn save_chat(
    State(state): State<AppState>,
    body: std::result::Result<Json<SaveChatRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let request = parse_body(body)?;
    let data = serde_json::to_vec(&request.chat_data)?;

    state
        .storage
        .chats
        .put(&chat_blob_name(&request.chat_id), data)
        .await?;

    info!(chat_id = %request.chat_id, "Chat saved");
    Ok(ok_message("Chat saved successfully."))
}

async fn load_chats(State(state): State<AppState>) -> Result<Json<Vec<Value>>> {
    let mut chats = Vec::new();

    for name in state.storage.chats.list().await? {
        if !name.ends_with(".json") {
            continue;
        }
        let Some(data) = state.storage.chats.get(&name).await? else {
            // Deleted between list and read
            continue;
        };
        match serde_json::from_slice::<Value>(&data) {
            Ok(chat) => chats.push(chat),
            Err(e) => warn!(blob = %name, error = %e, "Skipping unreadable chat"),
        }
    }

    Ok(Json(chats))
}

async fn delete_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Result<Json<Value>> {
    let existed = state.storage.chats.delete(&chat_blob_name(&chat_id)).await?;
    info!(chat_id = %chat_id, existed, "Chat deleted");
    Ok(ok_message("Chat deleted successfully."))
}

async fn token_usage_history(
    State(state): State<AppState>,
) -> Result<Json<Vec<WeeklyUsageRecord>>> {
    Ok(Json(state.storage.usage.list_desc().await?))
}

async fn save_token_usage(
    State(state): State<AppState>,
    body: std::result::Result<Json<SaveTokenUsageRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let request = parse_body(body)?;
    let record = WeeklyUsageRecord::checked(
        request.start_date,
        request.input_tokens,
        request.output_tokens,
        state.ledger.unit_cost(),
    )
    .ok_or_else(|| {
        GatewayError::InvalidRequest("inputTokens + outputTokens exceeds the supported range".to_string())
    })?;

    state.storage.usage.append(&record).await?;
    Ok(ok_message("Token usage saved successfully."))
}

async fn current_usage(State(state): State<AppState>) -> Json<CurrentUsage> {
    let totals = state.ledger.snapshot();
    Json(CurrentUsage {
        week_start: totals.week_start,
        input_tokens: totals.input_tokens,
        output_tokens: totals.output_tokens,
        total_tokens: totals.total_tokens(),
        total_cost: state.ledger.cost_of(totals.total_tokens()),
    })
}
