use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use realtime_hub::config::{generate_config_template, Config};
use realtime_hub::routes;
use realtime_hub::state::{AppState, Backend, Repositories};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("realtime_hub=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Realtime hub v{} starting", env!("CARGO_PKG_VERSION"));

    let backend = match &config.redis_url {
        Some(url) => Backend::redis(url).await?,
        None => {
            tracing::warn!("No Redis URL configured, running single-node on an in-memory store");
            Backend::memory()
        }
    };

    let addr = format!("{}:{}", config.bind_address, config.port);
    let shutdown_timeout = config.limits.shutdown_timeout();
    let app_state = AppState::new(config, backend, Repositories::in_memory());

    let cancel = CancellationToken::new();
    app_state.start_background(cancel.clone()).await?;

    let app = routes::build_router(app_state.clone());
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(node_id = app_state.presence.node_id(), "Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, closing sockets");
            for err in app_state.shutdown(shutdown_timeout).await {
                tracing::warn!(error = %err, "Hub did not drain in time");
            }
            cancel.cancel();
        })
        .await?;

    tracing::info!("Realtime hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
