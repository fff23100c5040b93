mod api;
mod broadcast;
mod codec;
mod config;
mod data;
mod errors;
mod feed;
mod session;
mod websocket;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::api::{create_api_router, ApiState};
use crate::broadcast::{BroadcastHub, ChartPoller};
use crate::config::{Config, STATS_INTERVAL_SECS};
use crate::data::{DataLoader, InMemoryBarStore, InMemoryStockDirectory};
use crate::feed::{FeedConfig, FeedConnector};
use crate::session::SessionRegistry;
use crate::websocket::{RequestRouter, WebSocketHandler, WS_PATH};

fn load_bar_store(data_dir: &str) -> InMemoryBarStore {
    match DataLoader::load_bar_dir(Path::new(data_dir)) {
        Ok(bars) => InMemoryBarStore::new(bars),
        Err(e) => {
            warn!("No historical bars loaded from {}: {}", data_dir, e);
            InMemoryBarStore::default()
        }
    }
}

fn load_stock_directory(stock_file: &str) -> InMemoryStockDirectory {
    match DataLoader::load_stocks(Path::new(stock_file)) {
        Ok(stocks) => InMemoryStockDirectory::new(stocks),
        Err(e) => {
            warn!("No stock metadata loaded from {}: {}", stock_file, e);
            InMemoryStockDirectory::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    // Collaborators
    let bar_store = load_bar_store(&config.data_dir);
    info!(
        "📊 Historical bars ready: {} tickers, {} bars",
        bar_store.ticker_count(),
        bar_store.total_bars()
    );
    let bar_store = Arc::new(bar_store);

    let stock_directory = load_stock_directory(&config.stock_file);
    info!("📇 Stock directory ready: {} stocks", stock_directory.len());
    let stock_directory = Arc::new(stock_directory);

    // Sessions, broadcast and upstream feed
    let registry = SessionRegistry::new();
    let hub = BroadcastHub::new(registry.clone());

    let feed = FeedConnector::spawn(
        FeedConfig {
            url: config.kis_ws_url.clone(),
            approval_key: config.approval_key.clone(),
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
        },
        Arc::new(hub.clone()),
    );

    if let Some(ticker) = &config.feed_ticker {
        match feed.connect(ticker) {
            Ok(()) => info!("📡 Connecting upstream feed for ticker: {}", ticker),
            Err(e) => warn!("Upstream feed not started: {}", e),
        }
    } else {
        info!("📡 Upstream feed idle - use POST /api/feed/connect/:ticker to start streaming");
    }

    let shutdown = CancellationToken::new();
    let poller = ChartPoller::new(
        bar_store.clone(),
        hub,
        config.default_ticker.clone(),
        config.chart_poll_interval(),
        config.chart_poll_window(),
    );
    let poller_task = poller.spawn(shutdown.child_token());

    start_background_tasks(registry.clone(), feed.clone());

    // Start API server
    let api_state = ApiState {
        feed: feed.clone(),
        registry: registry.clone(),
    };
    let api_router = create_api_router(api_state).layer(CorsLayer::permissive());

    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("🌐 HTTP API server running at http://{}", config.api_bind_address);
    let api_server = axum::serve(api_listener, api_router);

    // Start WebSocket server
    let ws_listener = TcpListener::bind(&config.bind_address).await?;
    info!("🚀 WebSocket server running at ws://{}{}", config.bind_address, WS_PATH);

    let router = RequestRouter::new(stock_directory, bar_store, registry.clone());
    let ws_registry = registry.clone();
    let send_timeout = config.connect_timeout();
    let websocket_server = async move {
        while let Ok((stream, addr)) = ws_listener.accept().await {
            let handler = WebSocketHandler::new(
                ws_registry.clone(),
                router.clone(),
                addr.to_string(),
                send_timeout,
            );
            tokio::spawn(handler.handle_connection(stream));
        }
    };

    info!("🎯 Starting WebSocket and HTTP API servers...");
    tokio::select! {
        result = api_server => {
            error!("API server stopped: {:?}", result);
        }
        _ = websocket_server => {
            error!("WebSocket server stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown requested");
        }
    }

    shutdown.cancel();
    if let Err(e) = feed.disconnect() {
        warn!("Feed disconnect during shutdown failed: {}", e);
    }
    if let Err(e) = tokio::time::timeout(Duration::from_secs(2), poller_task).await {
        warn!("Chart poller did not stop in time: {}", e);
    }

    Ok(())
}

fn start_background_tasks(registry: SessionRegistry, feed: FeedConnector) {
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(STATS_INTERVAL_SECS));

        loop {
            interval_timer.tick().await;
            let (sessions, subscriptions) = registry.get_stats();
            let status = feed.status();
            info!(
                "Stats - Sessions: {}, Subscriptions: {}, Feed: {:?} ({}), Connected: {}",
                sessions,
                subscriptions,
                status.state,
                status.ticker.as_deref().unwrap_or("-"),
                feed.is_connected()
            );
        }
    });

    info!("📈 Started stats monitoring task (every {} seconds)", STATS_INTERVAL_SECS);
}
