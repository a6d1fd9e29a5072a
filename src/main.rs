use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use newsdesk_api::aggregator::Aggregator;
use newsdesk_api::auth::Authenticator;
use newsdesk_api::config::Config;
use newsdesk_api::routes::{self, AppState};
use newsdesk_api::store::JsonFileStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "newsdesk_api=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path =
        std::env::var("NEWSDESK_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let config = Config::load(&config_path)?.with_env()?;
    info!(
        "Loaded {} feeds from {}",
        config.feeds.len(),
        config_path
    );

    // Prepare storage
    let store = JsonFileStore::new(&config.data_dir);
    store.initialize().await?;
    info!("Serving collections from {}", store.dir().display());

    let auth = Authenticator::new(&config.admin);
    if !auth.is_configured() {
        warn!("ADMIN_USERNAME, ADMIN_PASSWORD or JWT_SECRET is unset; admin login is disabled");
    }
    if config.security.require_token_for_writes {
        info!("Resource writes require a bearer token");
    }

    let state = Arc::new(AppState {
        store: Arc::new(store),
        aggregator: Arc::new(Aggregator::new(config.feeds.clone())?),
        auth: Arc::new(auth),
        require_token_for_writes: config.security.require_token_for_writes,
    });

    let app = routes::router(state, &config.allowed_origins);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server starting on http://localhost:{}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
