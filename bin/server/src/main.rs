use chatledger_ai::{LlmBackend, OpenAiCompatibleBackend};
use chatledger_conversation::SessionStore;
use chatledger_server::{
    AppState,
    config::ServerConfig,
    db::{self, SqliteSessionStore},
    error::StartupError,
    router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> chatledger_core::Result<(), StartupError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().map_err(|e| StartupError::Config {
        reason: e.to_string(),
    })?;
    tracing::info!(model = %config.llm.model, "Loaded configuration");

    let pool = db::connect(&config.database_url, 5)
        .await
        .map_err(|e| StartupError::Database {
            reason: e.to_string(),
        })?;

    tracing::info!("Running database migrations...");
    db::migrate(&pool).await.map_err(|e| StartupError::Migration {
        reason: e.to_string(),
    })?;

    let store: Arc<dyn SessionStore> = Arc::new(SqliteSessionStore::new(pool));
    let backend: Arc<dyn LlmBackend> = Arc::new(
        OpenAiCompatibleBackend::new(config.llm.clone()).map_err(|e| StartupError::Backend {
            reason: e.to_string(),
        })?,
    );

    let app = router(AppState::new(store, backend, &config.conversation))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| StartupError::Bind {
            addr: config.bind_addr.clone(),
            reason: e.to_string(),
        })?;

    tracing::info!("listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| StartupError::Serve {
            reason: e.to_string(),
        })?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
