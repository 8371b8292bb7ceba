use std::sync::Arc;

use axum::Router;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use polystored::audit::AuditLogger;
use polystored::backend;
use polystored::catalog::Catalog;
use polystored::config::Config;
use polystored::server::PolystoreEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("polystored=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting polystored");

    let config = Config::load().map_err(|e| {
        tracing::error!(error = %e, "configuration error");
        anyhow::anyhow!(e)
    })?;

    let backend = backend::connect(&config).await.map_err(|e| {
        tracing::error!(backend = %config.backend, error = %e, "backend connection failed");
        anyhow::anyhow!("cannot construct {} backend: {e}", config.backend)
    })?;

    let catalog = Arc::new(Catalog::build(Arc::clone(&backend)).map_err(|e| {
        tracing::error!(error = %e, "catalog build failed");
        anyhow::anyhow!(e)
    })?);

    tracing::info!(
        backend = %config.backend,
        operations = catalog.len(),
        policy = %config.policy,
        "catalog built"
    );

    let audit = Arc::new(AuditLogger::new(config.audit_log.clone()));
    tracing::info!("Audit log: {}", config.audit_log);

    let policy = config.policy;
    let session_manager = LocalSessionManager::default();
    let mcp_service = StreamableHttpService::new(
        move || {
            Ok(PolystoreEngine::new(
                Arc::clone(&backend),
                Arc::clone(&catalog),
                policy,
                Arc::clone(&audit),
            ))
        },
        session_manager.into(),
        Default::default(),
    );

    let app = Router::new().nest_service("/api/v1/mcp", mcp_service);
    let listener = TcpListener::bind(&config.bind).await?;

    tracing::info!("polystored listening on http://{}", config.bind);
    axum::serve(listener, app).await?;

    Ok(())
}
