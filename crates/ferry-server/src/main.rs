use std::net::SocketAddr;
use std::sync::Arc;

use ferry_engine::{EngineConfig, UploadService, run_gc_loop};
use ferry_server::{AppState, app};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_server=debug,ferry_engine=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let host = std::env::var("FERRY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("FERRY_PORT")
        .unwrap_or_else(|_| "3212".into())
        .parse()?;
    let config = EngineConfig::from_env()?;
    let gc_interval = config.gc_interval;
    let session_ttl = config.session_ttl;

    let service = Arc::new(UploadService::open(config).await?);

    // Background GC, stopped on shutdown
    let shutdown = CancellationToken::new();
    let gc_task = tokio::spawn(run_gc_loop(service.clone(), gc_interval, shutdown.clone()));

    let app = app(AppState { service });

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Ferry upload server listening on {}", addr);
    info!(
        "Sessions expire after {}s idle; GC every {}s",
        session_ttl.as_secs(),
        gc_interval.as_secs()
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    gc_task.await.ok();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                tracing::warn!("Cannot install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
