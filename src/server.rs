//! MCP server initialization for stdio and streamable HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that open the
//! engine, start its background tasks and wire the MCP tool handler into a
//! running server.

use crate::config::EchoConfig;
use crate::engine::MemoryEngine;
use crate::tools::EchoTools;
use anyhow::Result;
use rmcp::ServiceExt;

/// Shared setup: open the engine and start its ingestion worker and scheduler.
fn setup_engine(config: EchoConfig) -> Result<MemoryEngine> {
    let engine = MemoryEngine::open(config)?;
    engine.start();
    tracing::info!(
        provider = %engine.config().embedding.provider,
        model = %engine.config().embedding.model,
        "memory engine ready (model loads on first use)"
    );
    Ok(engine)
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: EchoConfig) -> Result<()> {
    tracing::info!("starting echo-memory MCP server on stdio");

    let engine = setup_engine(config)?;

    let tools = EchoTools::new(engine.clone());
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    let result = server.waiting().await;
    engine.shutdown().await;
    result?;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over streamable HTTP transport.
pub async fn serve_http(config: EchoConfig) -> Result<()> {
    let host = config.server.host.clone();
    let port = config.server.port;
    let bind_addr = format!("{host}:{port}");

    tracing::info!(addr = %bind_addr, "starting echo-memory MCP server on HTTP");

    let engine = setup_engine(config)?;

    let session_engine = engine.clone();
    let service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(EchoTools::new(session_engine.clone())),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    engine.shutdown().await;
    Ok(())
}

/// Start the server on the configured transport (`stdio` or `http`).
pub async fn serve(config: EchoConfig) -> Result<()> {
    match config.server.transport.as_str() {
        "stdio" => serve_stdio(config).await,
        "http" | "sse" => serve_http(config).await,
        other => anyhow::bail!("unknown transport: {other}. Supported: stdio, http"),
    }
}
