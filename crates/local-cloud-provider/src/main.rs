//! Local Cloud - worker provisioning service
//!
//! Exposes a `LocalCloudClient` over HTTP so an orchestrator can provision,
//! restart and terminate local workers and report their registrations.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use local_cloud_core::{InstanceId, TemplateId};
use local_cloud_provider::{
    CloudClient, ErrorInfo, InstanceStatus, InstanceSummary, LocalCloudClient, ProviderConfig,
    ProviderError, ProvisionRequest, ScriptRunner, TemplateSummary, WorkerRegistration,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    client: Arc<LocalCloudClient>,
}

// =============================================================================
// Errors
// =============================================================================

/// Handler error, rendered as `{ "error": ..., "code": ... }`.
enum ApiError {
    Provider(ProviderError),
    UnknownWorker,
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        Self::Provider(err)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Provider(err) => {
                let status = StatusCode::from_u16(err.http_status_code())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let code = match status {
                    StatusCode::NOT_FOUND => "NOT_FOUND",
                    StatusCode::BAD_REQUEST => "BAD_REQUEST",
                    StatusCode::CONFLICT => "CONFLICT",
                    _ => "INTERNAL_ERROR",
                };
                if status.is_server_error() {
                    tracing::error!(error = %err, "Request failed");
                }
                (
                    status,
                    ErrorResponse {
                        error: err.to_string(),
                        code,
                    },
                )
            }
            Self::UnknownWorker => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: "worker does not belong to this provider".to_string(),
                    code: "NOT_FOUND",
                },
            ),
        };
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "local-cloud",
    })
}

#[derive(Serialize)]
struct TemplatesResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
    templates: Vec<TemplateSummary>,
}

async fn list_templates(State(state): State<AppState>) -> impl IntoResponse {
    Json(TemplatesResponse {
        error: state.client.error_info(),
        templates: state.client.templates().iter().map(|t| t.summary()).collect(),
    })
}

async fn start_instance(
    State(state): State<AppState>,
    Path(template_id): Path<TemplateId>,
    Json(request): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<InstanceSummary>), ApiError> {
    let instance = state.client.start_new_instance(&template_id, request).await?;
    Ok((StatusCode::CREATED, Json(instance.summary())))
}

async fn restart_instance(
    State(state): State<AppState>,
    Path((template_id, instance_id)): Path<(TemplateId, InstanceId)>,
) -> Result<(StatusCode, Json<InstanceSummary>), ApiError> {
    let instance = state.client.find_instance(&template_id, &instance_id)?;
    let summary = instance.summary();

    // Restart waits on registration; answer right away
    let client = Arc::clone(&state.client);
    tokio::spawn(async move {
        if let Err(e) = client.restart_instance(&template_id, &instance_id).await {
            tracing::warn!(%template_id, %instance_id, error = %e, "Restart failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

async fn terminate_instance(
    State(state): State<AppState>,
    Path((template_id, instance_id)): Path<(TemplateId, InstanceId)>,
) -> Result<(StatusCode, Json<InstanceSummary>), ApiError> {
    let instance = state.client.find_instance(&template_id, &instance_id)?;
    let summary = instance.summary();

    let client = Arc::clone(&state.client);
    tokio::spawn(async move {
        if let Err(e) = client.terminate_instance(&template_id, &instance_id).await {
            tracing::warn!(%template_id, %instance_id, error = %e, "Terminate failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

#[derive(Serialize)]
struct RegistrationResponse {
    status: InstanceStatus,
}

async fn report_registration(
    State(state): State<AppState>,
    Json(registration): Json<WorkerRegistration>,
) -> Result<Json<RegistrationResponse>, ApiError> {
    let status = state
        .client
        .on_worker_registration(&registration.parameters, registration.registered)
        .ok_or(ApiError::UnknownWorker)?;
    Ok(Json(RegistrationResponse { status }))
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/templates", get(list_templates))
        .route("/v1/templates/:template_id/instances", post(start_instance))
        .route(
            "/v1/templates/:template_id/instances/:instance_id",
            axum::routing::delete(terminate_instance),
        )
        .route(
            "/v1/templates/:template_id/instances/:instance_id/restart",
            post(restart_instance),
        )
        .route("/v1/workers/registration", post(report_registration))
        .with_state(state)
}

fn load_declarations() -> Result<String, Box<dyn std::error::Error>> {
    if let Ok(text) = std::env::var("LOCAL_CLOUD_TEMPLATES") {
        return Ok(text);
    }
    match std::env::var("LOCAL_CLOUD_TEMPLATES_FILE") {
        Ok(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| format!("failed to read {path}: {e}"))?;
            tracing::info!(path = %path, "Loaded template declarations");
            Ok(text)
        }
        Err(_) => Ok(String::new()),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,local_cloud=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Local Cloud provider");

    // Load configuration from environment
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8111".to_string());
    let config = ProviderConfig::from_env();
    let declarations = load_declarations()?;

    let client = Arc::new(LocalCloudClient::from_declarations(
        &declarations,
        config,
        Arc::new(ScriptRunner::new()),
    ));
    if let Some(error) = client.error_info() {
        tracing::warn!(%error, "Provider started with configuration errors");
    }

    let app = create_router(AppState {
        client: Arc::clone(&client),
    });

    // Start server
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    client.dispose().await;
    tracing::info!("Local Cloud provider stopped");
    Ok(())
}
