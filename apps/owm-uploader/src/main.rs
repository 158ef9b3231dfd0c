use anyhow::Result;
use owm_uploader::config::Config;
use owm_uploader::http;
use owm_uploader::service::UploadServices;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,owm_uploader=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "owm-uploader starting");

    let cancel = CancellationToken::new();
    let services = Arc::new(UploadServices::start_all(
        &config.sites,
        &config.station,
        &cancel,
    ));
    if services.is_empty() {
        tracing::warn!("no upload targets configured; records will be accepted by nothing");
    }

    let app = http::router(http::HttpState {
        services: services.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, targets = services.len(), "owm-uploader HTTP listening");
    let http_cancel = cancel.clone();
    let mut http_handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
        {
            tracing::error!(error = %err, "http server exited");
        }
    });

    let http_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            false
        }
        _ = &mut http_handle => true,
    };

    cancel.cancel();
    if !http_done {
        if let Err(err) = http_handle.await {
            tracing::warn!(error = %err, "http task ended abnormally");
        }
    }
    match Arc::try_unwrap(services) {
        Ok(services) => services.join_all().await,
        Err(_) => tracing::warn!("upload services still shared at shutdown; not waiting for workers"),
    }
    tracing::info!("owm-uploader stopped");
    Ok(())
}
