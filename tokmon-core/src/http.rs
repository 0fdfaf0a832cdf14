use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::{self, TraceLayer};
use tracing::{info, Level};

use crate::error::{BeamError, BeamResult};
use crate::models::{ChatExchange, ExchangeSubmission, RelayEvent, SummaryUpsert};
use crate::relay::{serve_socket, RelayHub};
use crate::services::AggregationService;

pub type AppState = Arc<GatewayState>;

pub struct GatewayState {
    pub service: Arc<AggregationService>,
    pub hub: RelayHub,
}

impl GatewayState {
    pub fn new(service: Arc<AggregationService>, hub: RelayHub) -> AppState {
        Arc::new(Self { service, hub })
    }

    /// Fire-and-forget: a relay problem never fails the request that
    /// caused it.
    fn relay(&self, event: RelayEvent) {
        let kind = event.kind();
        match self.hub.publish(&event) {
            Ok(report) => tracing::debug!(
                event = kind,
                delivered = report.delivered,
                dropped = report.dropped.len(),
                "Relayed event"
            ),
            Err(err) => err.log(),
        }
    }
}

impl IntoResponse for BeamError {
    fn into_response(self) -> Response {
        let status = match &self {
            BeamError::InvalidInput(_) | BeamError::Serialization(_) => StatusCode::BAD_REQUEST,
            BeamError::PricingMissing(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BeamError::NotFound(_) => StatusCode::NOT_FOUND,
            BeamError::StoreUnavailable(_) | BeamError::StoreTimeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        self.log();
        (status, Json(self.to_json_error())).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConversationQuery {
    #[serde(default, alias = "tokmon_conversation_id")]
    conversation_id: Option<String>,
}

impl ConversationQuery {
    fn id(&self) -> Option<&str> {
        self.conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct SummaryBody {
    summary: SummaryUpsert,
}

async fn relay_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

async fn api_exchange_submit(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<ChatExchange>, BeamError> {
    let submission: ExchangeSubmission = serde_json::from_value(body)?;
    let outcome = state
        .service
        .ingest_then(submission, |outcome| {
            state.relay(RelayEvent::ChatExchange(outcome.exchange.clone()));
            state.relay(RelayEvent::TokenUsageSummary(outcome.summary.clone()));
        })
        .await?;

    Ok(Json(outcome.exchange))
}

async fn api_exchange_list(
    State(state): State<AppState>,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Vec<ChatExchange>>, BeamError> {
    let exchanges = state.service.exchanges(query.id()).await?;
    Ok(Json(exchanges))
}

async fn api_summary_upsert(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, BeamError> {
    let body: SummaryBody = serde_json::from_value(body)?;
    let summary = state
        .service
        .upsert_summary_then(body.summary, |summary| {
            state.relay(RelayEvent::TokenUsageSummary(summary.clone()));
        })
        .await?;

    Ok(Json(summary).into_response())
}

async fn api_summary_get(
    State(state): State<AppState>,
    Query(query): Query<ConversationQuery>,
) -> Result<Response, BeamError> {
    match query.id() {
        Some(id) => {
            let view = state
                .service
                .conversation(id)
                .await?
                .ok_or_else(|| BeamError::NotFound(format!("summary for conversation '{}'", id)))?;
            Ok(Json(view).into_response())
        }
        None => Ok(Json(state.service.conversations().await?).into_response()),
    }
}

async fn api_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, BeamError> {
    let outcome = state.service.delete_conversation(&id).await?;
    Ok(Json(json!({
        "message": format!("Deleted conversation {}", id),
        "exchanges": outcome.exchanges,
        "summaries": outcome.summaries,
    })))
}

async fn api_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "observers": state.hub.connection_count(),
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(relay_socket))
        .route("/ws", get(relay_socket))
        .route(
            "/api/exchange",
            get(api_exchange_list).post(api_exchange_submit),
        )
        .route("/api/summary", get(api_summary_get).post(api_summary_upsert))
        .route("/api/delete/{id}", delete(api_delete))
        .route("/api/health", get(api_health))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn bind(addr: &str) -> BeamResult<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| BeamError::Internal(format!("failed to bind {}: {}", addr, e)))
}

/// Serves relay sockets and the gateway on one listener until `shutdown`
/// resolves. Observers are dropped before the server stops.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> BeamResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|e| BeamError::Internal(e.to_string()))?;
    info!("Relay and gateway listening on {}", addr);

    let hub = state.hub.clone();
    let app = router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            let closed = hub.close_all();
            info!(observers = closed, "Shutting down relay");
        })
        .await
        .map_err(|e| BeamError::Internal(format!("server error: {}", e)))?;

    Ok(())
}
