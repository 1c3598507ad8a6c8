//! Application state and router
//!
//! Every service is built once here and handed to the handlers through
//! axum state.

use crate::handlers::{chats, health, items, search, storages};
use crate::middleware::{
    metrics::track_requests,
    rate_limit::{limited, RateLimits},
};
use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use cevra_agent::{Agent, ChatOrchestrator};
use cevra_common::{
    config::AppConfig,
    db::{DbPool, Repository},
    embeddings::create_embedder,
    errors::Result,
    llm::create_chat_model,
    vector::{create_vector_store, VectorStore},
};
use cevra_ingestion::{IngestionPipeline, StorageCatalog};
use cevra_search::RetrievalService;
use std::sync::Arc;
use tower::{limit::ConcurrencyLimitLayer, ServiceBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Multipart framing allowance on top of the file size limit
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repository: Repository,
    pub vectors: Arc<dyn VectorStore>,
    pub catalog: StorageCatalog,
    pub pipeline: Arc<IngestionPipeline>,
    pub retrieval: RetrievalService,
    pub chats: ChatOrchestrator,
}

impl AppState {
    /// Wire every service from configuration
    pub async fn build(config: Arc<AppConfig>, db: DbPool) -> Result<Self> {
        let embedder = create_embedder(&config.embedding)?;
        let vectors = create_vector_store(&config.vector, &db, embedder.clone()).await?;
        let repository = Repository::new(db);

        let catalog = StorageCatalog::new(repository.clone(), vectors.clone());
        let pipeline = Arc::new(IngestionPipeline::new(
            repository.clone(),
            vectors.clone(),
            &config.ingestion,
        )?);
        let retrieval =
            RetrievalService::new(repository.clone(), vectors.clone(), config.search.top_k);

        let model = create_chat_model(&config.llm)?;
        let agent = Agent::new(
            model,
            Arc::new(retrieval.clone()),
            &config.agent,
            &config.llm,
        );
        let chats = ChatOrchestrator::new(
            repository.clone(),
            Arc::new(agent),
            Arc::new(repository.clone()),
            config.agent.stream_buffer,
        );

        info!(
            embedding_model = embedder.model_name(),
            vector_backend = vectors.backend_name(),
            llm_model = %config.llm.model,
            llm_provider = %config.llm.provider,
            "Services initialized"
        );

        Ok(Self {
            config,
            repository,
            vectors,
            catalog,
            pipeline,
            retrieval,
            chats,
        })
    }
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    let config = state.config.clone();
    let limits = RateLimits::from_config(&config.rate_limit);

    let api = Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        // Storage catalog
        .route(
            "/storages",
            get(storages::list_storages).post(storages::create_storage),
        )
        .route(
            "/storages/{id}",
            get(storages::get_storage)
                .put(storages::update_storage)
                .delete(storages::delete_storage),
        )
        .route(
            "/storages/{id}/items",
            get(items::list_items).merge(limited(
                post(items::upload_item),
                limits.upload.as_ref(),
            )),
        )
        .route(
            "/storages/{id}/items/{item_id}",
            get(items::get_item).delete(items::delete_item),
        )
        // Retrieval
        .route(
            "/search",
            limited(post(search::search), limits.search.as_ref()),
        )
        // Chats
        .route("/chats", get(chats::list_chats).post(chats::create_chat))
        .route(
            "/chats/{id}",
            get(chats::get_chat)
                .put(chats::update_chat)
                .delete(chats::delete_chat),
        )
        .route(
            "/chat/respond",
            limited(post(chats::respond), limits.respond.as_ref()),
        )
        .route(
            "/chat/stream",
            limited(post(chats::stream), limits.stream.as_ref()),
        )
        .route_layer(from_fn(track_requests));

    let body_limit = config.ingestion.max_file_size_bytes + MULTIPART_OVERHEAD;

    Router::new().nest("/v1", api).with_state(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&config.server.cors_origins))
            .layer(TimeoutLayer::new(config.request_timeout()))
            .layer(ConcurrencyLimitLayer::new(
                config.server.max_concurrent_requests.max(1),
            ))
            .layer(DefaultBodyLimit::max(body_limit as usize)),
    )
}

/// CORS configuration; no configured origins means any origin
fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}
