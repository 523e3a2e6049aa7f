mod business_logic;
mod config;
mod errors;
mod handlers;
mod models;
mod services;
mod state;

use anyhow::Context;
use axum::{routing::get, Router};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::services::cache::{CacheSynchronizer, CandleCache, MemoryCache, RedisCache};
use crate::services::feed::{self, WsConnector};
use crate::services::hyperliquid::HyperliquidClient;
use crate::services::market_state::MarketStateInner;
use crate::services::monitor::MonitorService;
use crate::services::window_store::CandleStore;
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::series::get_candles,
        handlers::series::get_trendlines,
        handlers::patterns::get_patterns,
        handlers::patterns::get_pattern_stream
    ),
    components(schemas(
        models::health::HealthResponse,
        models::series::WindowResponse,
        models::series::TrendlineResponse,
        models::pattern::PatternHistoryResponse,
        models::pattern::PatternEvent,
        errors::ErrorResponse
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    // Held for the life of the process so buffered file logs are flushed
    let _log_guard = init_tracing(&config)?;

    // Feed connection task; idle until the monitor connects it
    let connector = Arc::new(WsConnector::new(config.feed.ws_url.clone()));
    let (feed_handle, feed_events) = feed::spawn(connector, config.feed.clone());

    let market_state = MarketStateInner::new(feed_handle.watch_status());

    let cache: Arc<dyn CandleCache> = match &config.cache.redis_url {
        Some(url) => match RedisCache::connect(url).await {
            Ok(cache) => {
                tracing::info!("Using Redis candle cache");
                Arc::new(cache)
            }
            Err(e) => {
                tracing::warn!("Redis unavailable ({}), falling back to in-memory cache", e);
                Arc::new(MemoryCache::default())
            }
        },
        None => {
            tracing::info!("REDIS_URL not set, using in-memory candle cache");
            Arc::new(MemoryCache::default())
        }
    };

    let sync = CacheSynchronizer::new(
        CandleStore::new(config.retention.clone()),
        cache,
        Arc::new(HyperliquidClient::new(config.info_url.clone())),
        config.cache.clone(),
    );
    let mut monitor = MonitorService::new(
        &config,
        sync,
        feed_handle,
        feed_events,
        market_state.clone(),
    );

    tokio::spawn(async move {
        tracing::info!("Starting trendline monitor warmup...");
        monitor.warmup().await;

        tracing::info!("Trendline detection active, streaming candles");
        monitor.run().await;
    });

    let app_state = AppState {
        market: market_state,
    };

    // Start web server
    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/candles", get(handlers::series::get_candles))
        .route("/trendlines", get(handlers::series::get_trendlines))
        .route("/patterns", get(handlers::patterns::get_patterns))
        .route("/patterns/stream", get(handlers::patterns::get_pattern_stream))
        .with_state(app_state)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!("Server running on http://{}", config.bind_addr);
    tracing::info!("Swagger UI: http://{}/swagger-ui", config.bind_addr);
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

fn init_tracing(config: &AppConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "trendscreener=info,tower_http=debug".into());

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {dir}"))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "trendscreener.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}
