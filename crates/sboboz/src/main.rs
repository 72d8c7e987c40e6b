use std::path::Path;
use std::sync::Arc;

use sboboz::http::{self, AppState};
use sboboz::{DevAuthenticator, SbobozError, SbobozServer, ServerConfig};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), SbobozError> {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(
        env = %config.env,
        grace_window_secs = config.grace_window.as_secs(),
        policy = ?config.identity_policy,
        "sboboz-backend configured"
    );
    if config.is_prod() {
        tracing::warn!("running with the development authenticator: auth tokens are trusted as player ids");
    }

    let socket = SbobozServer::builder()
        .bind(&config.socket_addr())
        .session_config(config.session_config())
        .build(DevAuthenticator)
        .await?;
    let sessions = Arc::clone(socket.gateway().store());

    let listener = tokio::net::TcpListener::bind(config.http_addr()).await?;
    tracing::info!(addr = %config.http_addr(), "HTTP API listening");
    let app = http::app(AppState::new(config, sessions));

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("shutdown requested");
        let _ = stop_tx.send(true);
    });

    let http_server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(stopped(stop_rx.clone()))
            .await
            .map_err(SbobozError::from)
    };
    tokio::try_join!(http_server, socket.run(stopped(stop_rx.clone())))?;

    tracing::info!("sboboz-backend stopped");
    Ok(())
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
