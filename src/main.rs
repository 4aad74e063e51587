use std::panic;
use std::sync::Arc;

use axum::http::HeaderValue;
use colabri_pad::config::{Config, StoreBackend};
use colabri_pad::db::{DocumentStore, MemoryStore, PgStore};
use colabri_pad::ws::HubRegistry;
use colabri_pad::{create_app, AppState};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "colabri_pad=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    let instance_id = config.instance_id();
    info!("Replica instance id: {}", instance_id);

    let store: Arc<dyn DocumentStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let Some(db_url) = config.db_url.as_deref() else {
                error!("DB_URL is required for the postgres store backend");
                std::process::exit(1);
            };
            match PgStore::connect(db_url, &instance_id).await {
                Ok(store) => store,
                Err(e) => {
                    error!("Failed to connect to the document store: {}", e);
                    std::process::exit(1);
                }
            }
        }
        StoreBackend::Memory => {
            warn!("Using the in-memory document store, documents are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    if let Err(e) = store.ping().await {
        error!("Document store is unreachable: {}", e);
        std::process::exit(1);
    }
    info!("Document store is reachable");

    let registry = HubRegistry::new(store, config.hub_config(instance_id));
    let _sweeper = registry.spawn_idle_sweeper(config.hub_idle_timeout());

    let app = create_app(AppState::new(registry.clone(), config.default_doc_id.clone()))
        .layer(cors_layer(&config));

    let listener = match tokio::net::TcpListener::bind(config.server_address()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", config.server_address(), e);
            std::process::exit(1);
        }
    };

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 WebSocket available at ws://{}/ws?doc=<id>", config.server_address());
    info!("📚 Swagger UI available at http://{}/swagger", config.server_address());

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    info!("Saving open documents before exit");
    registry.shutdown_all().await;
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_origin_list()
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", o);
                None
            }
        })
        .collect();

    if origins.is_empty() {
        if !config.is_development() {
            warn!("No CORS_ORIGINS configured, allowing any origin");
        }
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        CorsLayer::new().allow_origin(origins).allow_methods(Any).allow_headers(Any)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
