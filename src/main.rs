use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use switchyard::shutdown::ShutdownSignal;
use switchyard::{Coordinator, Event, NewEvent, RouteError, SwitchyardConfig};

/// Default page size for dead-letter listings.
const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 1000;

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Coordinator>,
    api_key: String,
}

/// Response returned when an event is successfully accepted.
#[derive(Debug, Serialize, Deserialize)]
struct EventResponse {
    /// Routing identifier assigned to the event
    id: String,
    lane: String,
    priority: String,
    status: String,
    /// Correlation ID for tracing
    #[serde(rename = "correlationId")]
    correlation_id: String,
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    limit: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize Logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load Configuration
    let config = SwitchyardConfig::load()?;
    let api_key = config
        .server
        .api_key
        .clone()
        .or_else(|| env::var("SWITCHYARD_API_KEY").ok())
        .unwrap_or_else(|| {
            warn!("No API key configured, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
            "dev-key".to_string()
        });
    let port = config.server.port;

    // 3. Build and start the pipeline
    let coordinator = Arc::new(Coordinator::initialize(config).await?);
    coordinator.start().await?;

    let app_state = Arc::new(AppState {
        coordinator: coordinator.clone(),
        api_key,
    });

    // 4. Build Router with Auth Middleware
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/events", post(route_event))
        .route("/api/v1/dead-letters", get(list_dead_letters))
        .layer(middleware::from_fn_with_state(app_state.clone(), auth_middleware))
        .with_state(app_state);

    // 5. Serve until SIGINT/SIGTERM
    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Switchyard listening on {}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().triggered())
        .await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server failed");
    }

    // 6. Drain the pipeline
    if !shutdown.drain(coordinator.stop(true)).await {
        warn!("Pipeline did not drain in time, pending work may be redelivered");
    }

    served?;
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(token) if token == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if let Err(e) = state.coordinator.ping().await {
        error!(error = %e, "Queue store ping failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "store": "disconnected" })),
        );
    }

    let latest = match state.coordinator.latest_health().await {
        Ok(record) => serde_json::to_value(record).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Failed to read latest health record");
            Value::Null
        }
    };

    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "store": "connected", "latest": latest })),
    )
}

/// Get metrics endpoint - returns pipeline metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snapshot = state.coordinator.get_metrics();
    let uptime = snapshot.uptime_seconds;
    let events = serde_json::to_value(&snapshot).unwrap_or_default();

    // Format uptime as human-readable
    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_str,
        "events": events,
        "status": "running"
    }))
}

async fn route_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(event): Json<NewEvent>,
) -> Result<(StatusCode, Json<EventResponse>), StatusCode> {
    // Extract or generate correlation ID
    let correlation_id = headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    debug!(
        correlation_id = %correlation_id,
        event_type = %event.kind,
        lane = %event.lane,
        "Received event"
    );

    let routed = state
        .coordinator
        .route_event(event)
        .await
        .map_err(|e| match e {
            RouteError::QueueUnavailable(_) => {
                error!(correlation_id = %correlation_id, error = %e, "Queue unavailable");
                StatusCode::SERVICE_UNAVAILABLE
            }
            RouteError::Validation(_) => {
                warn!(correlation_id = %correlation_id, error = %e, "Rejected event");
                StatusCode::BAD_REQUEST
            }
            RouteError::Serialization(_) => {
                error!(correlation_id = %correlation_id, error = %e, "Failed to encode event");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })?;

    info!(
        route_id = %routed.id,
        correlation_id = %correlation_id,
        "Event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            id: routed.id,
            lane: routed.lane,
            priority: routed.priority.to_string(),
            status: "accepted".to_string(),
            correlation_id,
        }),
    ))
}

async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<Event>>, StatusCode> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);

    state
        .coordinator
        .dead_letters(limit)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "Failed to read dead-letter store");
            StatusCode::SERVICE_UNAVAILABLE
        })
}
