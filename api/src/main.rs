// ./api/src/main.rs
use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json as JsonResponse, Response},
    routing::get,
};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, fmt as log_fmt, layer::SubscriberExt, util::SubscriberInitExt};

use application::{
    ApplicationError, ConcurrencyMode, DocumentListResponse, DocumentRepository,
    IndexCorruptPolicy, IndexedDocumentRepository, ReadFailure, RepositoryOptions, StateStore,
    StateStoreError, StoreDocumentResponse, WriteFailure,
};
use domain::{DEFAULT_KEY_PREFIX, Document};
use infrastructure::{DaprStateStore, InMemoryStateStore};

/// Application state shared by all handlers.
#[derive(Clone)]
struct AppState {
    repository: Arc<dyn DocumentRepository>,
}

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_STORE_NAME: &str = "statestore";

/// Host settings, read once from the environment at startup.
#[derive(Debug, Clone)]
struct Config {
    port: u16,
    store_name: String,
    key_prefix: String,
    on_index_corrupt: IndexCorruptPolicy,
    concurrency: ConcurrencyMode,
    /// Dapr sidecar base URL. Without it documents live in process memory.
    dapr_endpoint: Option<String>,
}

impl Config {
    fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            port: parse_setting(&lookup, "PORT", DEFAULT_PORT),
            store_name: text_setting(&lookup, "STATE_STORE_NAME")
                .unwrap_or_else(|| DEFAULT_STORE_NAME.to_string()),
            key_prefix: text_setting(&lookup, "KEY_PREFIX")
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            on_index_corrupt: parse_setting(
                &lookup,
                "ON_INDEX_CORRUPT",
                IndexCorruptPolicy::default(),
            ),
            concurrency: parse_setting(&lookup, "INDEX_CONCURRENCY", ConcurrencyMode::default()),
            dapr_endpoint: text_setting(&lookup, "DAPR_HTTP_ENDPOINT"),
        }
    }

    fn repository_options(&self) -> RepositoryOptions {
        RepositoryOptions::new(self.store_name.clone())
            .with_key_prefix(self.key_prefix.clone())
            .with_index_corrupt_policy(self.on_index_corrupt)
            .with_concurrency(self.concurrency)
    }
}

fn text_setting<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).filter(|value| !value.trim().is_empty())
}

fn parse_setting<T, F>(lookup: &F, name: &str, default: T) -> T
where
    T: FromStr + fmt::Debug,
    F: Fn(&str) -> Option<String>,
{
    match text_setting(lookup, name) {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => {
                info!("Using {} = {:?} from environment.", name, value);
                value
            }
            Err(_) => {
                warn!(
                    "Invalid {} value '{}' in environment. Using default {:?}.",
                    name, raw, default
                );
                default
            }
        },
        None => default,
    }
}

// Application entry point
#[tokio::main]
async fn main() {
    // --- Logger Initialization ---
    let filter: EnvFilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(log_fmt::layer())
        .with(filter)
        .init();
    info!("Logger initialized successfully.");

    let config = Config::from_env();

    // --- Dependency Injection ---
    // 1. Create the state store backend
    let state_store: Arc<dyn StateStore> = match &config.dapr_endpoint {
        Some(endpoint) => match DaprStateStore::new(endpoint) {
            Ok(store) => {
                info!(endpoint = %endpoint, "Using Dapr state store.");
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to configure Dapr state store: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            warn!("DAPR_HTTP_ENDPOINT not set. Documents are kept in memory and lost on exit.");
            Arc::new(InMemoryStateStore::new())
        }
    };

    // 2. Create the repository on top of it
    let options = config.repository_options();
    let repository = match IndexedDocumentRepository::new(state_store, options) {
        Ok(repository) => repository,
        Err(e) => {
            error!("Invalid repository configuration: {}", e);
            std::process::exit(1);
        }
    };

    let app_state = AppState {
        repository: Arc::new(repository),
    };
    let app = router(app_state);
    info!("API routes configured.");

    // --- Server Startup ---
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server starting on {}", addr);
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!("Server listening on {}", addr);
            listener
        }
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/documents",
            get(list_documents_handler).post(store_document_handler),
        )
        .with_state(state)
}

// --- API Handlers ---

async fn health_check() -> impl IntoResponse {
    info!("Health check endpoint called");
    (StatusCode::OK, "OK")
}

/// Handler for enumerating every stored document (GET /documents).
async fn list_documents_handler(State(state): State<AppState>) -> Response {
    info!("Received request to list documents");
    match state.repository.get_all_documents().await {
        Ok(documents) => {
            let response = DocumentListResponse::from(documents);
            info!(count = response.count, "Documents listed successfully via handler");
            (StatusCode::OK, JsonResponse(response)).into_response()
        }
        Err(e) => {
            error!("Failed to list documents via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

#[derive(Deserialize, Debug)]
struct StoreDocumentParams {
    /// Optional label, logged only.
    name: Option<String>,
}

/// Handler for storing a document (POST /documents, raw XML body).
async fn store_document_handler(
    State(state): State<AppState>,
    Query(params): Query<StoreDocumentParams>,
    body: String,
) -> Response {
    info!(bytes = body.len(), "Received request to store document");
    let document = match Document::parse(&body) {
        Ok(document) => document,
        Err(e) => return map_application_error_to_response(e.into()),
    };

    let result = match params.name.as_deref() {
        Some(name) => state.repository.store_document_named(&document, name).await,
        None => state.repository.store_document(&document).await,
    };
    match result {
        Ok(key) => {
            info!(key = %key, "Document stored successfully via handler");
            (
                StatusCode::CREATED,
                JsonResponse(StoreDocumentResponse { key: key.into() }),
            )
                .into_response()
        }
        Err(e) => {
            error!("Failed to store document via handler: {}", e);
            map_application_error_to_response(e)
        }
    }
}

fn store_status(error: &StateStoreError) -> StatusCode {
    match error {
        StateStoreError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Helper function to map ApplicationError enum to HTTP status codes and response body.
fn map_application_error_to_response(err: ApplicationError) -> Response {
    let (status, body) = match err {
        ApplicationError::InvalidArgument(msg) => (StatusCode::BAD_REQUEST, msg),
        ApplicationError::DomainError(domain_err) => {
            warn!("Domain validation failed: {}", domain_err);
            (StatusCode::BAD_REQUEST, domain_err.to_string())
        }
        ApplicationError::RepositoryRead { key, source } => {
            let status = match &source {
                ReadFailure::Store(store_err) => store_status(store_err),
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error!(key = %key, "Repository read error: {}", source);
            (status, "Failed to read the document repository".to_string())
        }
        ApplicationError::RepositoryWrite { key, source } => {
            let status = match &source {
                WriteFailure::Store(store_err) => store_status(store_err),
                WriteFailure::IndexConflict { .. } => StatusCode::CONFLICT,
                WriteFailure::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error!(key = %key, "Repository write error: {}", source);
            (status, "Failed to write to the document repository".to_string())
        }
    };
    (status, body).into_response() // Convert tuple to Response
}
