use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use news_reader::config::Config;
use news_reader::feed::ParseOptions;
use news_reader::fetcher::{start_background_refresh, Fetcher};
use news_reader::routes::{self, AppState};
use news_reader::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "news_reader=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("NEWS_READER_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?;
    info!("Loaded configuration from {}", config_path);

    // Open the data directory
    let store = Arc::new(Store::open(&config.data_dir).await?);
    store.seed_feeds(&config.feeds).await?;
    info!("Data directory {} ready", config.data_dir.display());

    let options = ParseOptions {
        strip_html: true,
        max_entries: config.max_entries,
    };
    let fetcher = Arc::new(Fetcher::new(store.clone(), options)?);

    // Start background refresh task
    let bg_fetcher = fetcher.clone();
    let refresh_interval = config.refresh_interval;
    tokio::spawn(async move {
        start_background_refresh(bg_fetcher, refresh_interval).await;
    });

    let remote_access = store.settings().await.remote_access;
    let state = Arc::new(AppState {
        store,
        fetcher,
        max_feeds: config.max_feeds,
    });
    let app = routes::router(state);

    // Loopback only unless remote access is enabled
    let ip = if remote_access {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    };
    let addr = SocketAddr::new(ip, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Server starting on http://{}/news", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
