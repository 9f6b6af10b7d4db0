use std::net::SocketAddr;

use saferoute::{app, build_state, AppConfig};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise structured logging. Reads RUST_LOG environment variable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = AppConfig::from_env()?;
    tracing::info!(
        port = config.port,
        detector_url = %config.detector_url,
        store_url = %config.store_url,
        provider_url = %config.provider_url,
        "starting gateway"
    );

    let state = build_state(&config);
    let shutdown = state.shutdown.clone();
    let admission = state.admission.clone();
    let router = app(state);

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    // Connect info is required so the admission layer can key clients by
    // peer IP.
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await?;

    admission.shutdown();
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    // Wait for Ctrl+C
    let _ = signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    cancel.cancel();
}
