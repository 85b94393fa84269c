use anyhow::Result;
use axum::Router;
use clap::Parser;
use memdex_core::{IndexHealth, MemoryConfig, MemoryService};
use memdex_server::build_app;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
struct Args {
    /// TOML config file
    #[arg(long, default_value = "memdex.toml")]
    config: PathBuf,
    /// Workspace root (overrides config and MEMDEX_WORKSPACE)
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Port to bind
    #[arg(long, default_value_t = 8787)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = MemoryConfig::load_from(&args.config)?;
    if let Some(ws) = args.workspace {
        config.workspace = ws;
    }
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let watch = config.watcher.enabled;
    let service = Arc::new(tokio::task::spawn_blocking(move || MemoryService::open(config)).await??);
    if service.health().index == IndexHealth::Missing {
        let builder = service.clone();
        let summary = tokio::task::spawn_blocking(move || builder.rebuild()).await??;
        tracing::info!(files = summary.files_added, chunks = summary.chunks_indexed, "built initial index");
    }
    let watcher = watch.then(|| service.spawn_watcher());

    let app: Router = build_app(service);
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    if let Some(watcher) = watcher {
        watcher.shutdown().await;
    }
    tracing::info!("server stopped");
    Ok(())
}
