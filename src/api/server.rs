//! Runtime API Server
//!
//! Serves one runtime's verbs under `/v1/{plural}` plus the kind-independent
//! `/v1/status`, `/v1/classes` and `/v1/events` endpoints.

use crate::crd::ResourceList;
use crate::domain::ports::{
    ClassInfo, ClassStatus, EventFilter, ListFilter, PoolTarget, RuntimeEvent, RuntimeObject, RuntimeRef,
};
use crate::error::{Error, Result};
use crate::store::parse_selector;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the runtime API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiServerConfig {
    /// REST API bind address
    pub addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Body of a resources update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ExpandRequest {
    pub resources: ResourceList,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListQuery {
    id: Option<String>,
    label_selector: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    /// Comma-separated pool names
    pool: Option<String>,
    selector: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    label_selector: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

/// Handler error carrying the crate error to its HTTP form
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = classify(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, status = status.as_u16(), "Request rejected");
        }
        let root = self.0.root().to_string();
        let message = self.0.to_string();
        let details = (root != message).then_some(root);
        (
            status,
            Json(ApiErrorResponse {
                error: code.into(),
                message,
                details,
            }),
        )
            .into_response()
    }
}

/// Status code and error code for an error
fn classify(err: &Error) -> (StatusCode, &'static str) {
    match err.root() {
        Error::ResourceNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        Error::NoMatchingClass { .. } | Error::AmbiguousClass { .. } => {
            (StatusCode::UNPROCESSABLE_ENTITY, "class_unresolved")
        }
        Error::ClassesNotSynced { .. } | Error::Cancelled(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
        Error::ApiValidation(_) | Error::SelectorParse(_) | Error::JsonParse(_) => {
            (StatusCode::BAD_REQUEST, "invalid_request")
        }
        Error::ResourceExists { .. } | Error::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// =============================================================================
// REST Router
// =============================================================================

/// REST API router over one runtime
pub struct RuntimeRouter {
    runtime: RuntimeRef,
}

impl RuntimeRouter {
    pub fn new(runtime: RuntimeRef) -> Self {
        Self { runtime }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let collection = format!("/v1/{}", self.runtime.kind().plural());
        let item = format!("{}/:id", collection);
        let state = AppState {
            runtime: self.runtime,
        };

        Router::new()
            .route(&collection, post(create_object).get(list_objects))
            .route(&item, delete(delete_object).patch(expand_object))
            .route("/v1/status", get(pool_status))
            .route("/v1/classes", get(list_classes))
            .route("/v1/events", get(list_events))
            .route("/healthz", get(health_check))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    runtime: RuntimeRef,
}

// =============================================================================
// Handlers
// =============================================================================

async fn create_object(
    State(state): State<AppState>,
    Json(object): Json<RuntimeObject>,
) -> ApiResult<(StatusCode, Json<RuntimeObject>)> {
    if object.spec.class.is_empty() {
        return Err(Error::ApiValidation("spec.class is required".into()).into());
    }
    let created = state.runtime.create(object).await?;
    info!(id = %created.metadata.id, class = %created.spec.class, "Created runtime object");
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_objects(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<RuntimeObject>>> {
    let filter = ListFilter {
        id: query.id.filter(|id| !id.is_empty()),
        label_selector: parse_selector(query.label_selector.as_deref().unwrap_or_default())?,
    };
    Ok(Json(state.runtime.list(&filter).await?))
}

async fn delete_object(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    state.runtime.delete(&id).await?;
    info!(id = %id, "Deleted runtime object");
    Ok(StatusCode::NO_CONTENT)
}

async fn expand_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ExpandRequest>,
) -> ApiResult<StatusCode> {
    state.runtime.update_resources(&id, request.resources).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pool_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Vec<ClassStatus>>> {
    let target = PoolTarget {
        names: query
            .pool
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect(),
        selector: parse_selector(query.selector.as_deref().unwrap_or_default())?,
    };
    Ok(Json(state.runtime.status(&target).await?))
}

async fn list_classes(State(state): State<AppState>) -> ApiResult<Json<Vec<ClassInfo>>> {
    Ok(Json(state.runtime.list_classes().await?))
}

async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<RuntimeEvent>>> {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(Error::ApiValidation(format!("from {} is after to {}", from, to)).into());
        }
    }
    let filter = EventFilter {
        label_selector: parse_selector(query.label_selector.as_deref().unwrap_or_default())?,
        from: query.from,
        to: query.to,
    };
    Ok(Json(state.runtime.list_events(&filter).await?))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

// =============================================================================
// Serving
// =============================================================================

/// Bind and serve until `shutdown` is cancelled
pub async fn serve(config: &ApiServerConfig, runtime: RuntimeRef, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
    serve_on(listener, runtime, shutdown).await
}

/// Serve on an already bound listener until `shutdown` is cancelled
pub async fn serve_on(listener: TcpListener, runtime: RuntimeRef, shutdown: CancellationToken) -> Result<()> {
    let kind = runtime.kind();
    let app = RuntimeRouter::new(runtime).build();
    info!(addr = %listener.local_addr()?, kind = %kind, "REST API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}
