use anyhow::Result;
use clap::{Parser, Subcommand};
use memdex_core::{MemoryConfig, MemoryError, MemoryService};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "memdex")]
#[command(about = "Build, update and search the local BM25 memory index", long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(long, default_value = "memdex.toml")]
    config: PathBuf,
    /// Workspace root (overrides config and MEMDEX_WORKSPACE)
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Print JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rebuild the whole index from the memory files
    Build,
    /// Re-index only files that changed since the last run
    Update {
        /// Rebuild everything instead
        #[arg(long, default_value_t = false)]
        full: bool,
    },
    /// Search the index
    Search {
        /// Query text
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        /// Maximum number of results
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Show index statistics
    Stats,
    /// List files changed since the last index, without updating
    Check,
    /// Keep the index up to date until interrupted
    Watch,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::from(1);
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn load_config(cli: &Cli) -> Result<MemoryConfig> {
    let mut config = MemoryConfig::load_from(&cli.config)?;
    if let Some(ws) = &cli.workspace {
        config.workspace = ws.clone();
    }
    Ok(config)
}

fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<MemoryError>() {
        Some(MemoryError::InvalidQuery(_)) => 2,
        Some(MemoryError::IndexCorrupt(_)) => 3,
        Some(MemoryError::ConcurrentUpdateConflict { .. }) => 4,
        _ => 1,
    }
}

fn run(cli: Cli, config: MemoryConfig) -> Result<()> {
    let default_k = config.search.default_top_k;
    let service = MemoryService::open(config)?;

    match cli.command {
        Commands::Build => {
            let summary = service.rebuild()?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let stats = service.stats();
                println!(
                    "rebuilt: {} files, {} chunks, {} terms in {:.2}s",
                    stats.file_count,
                    stats.document_count,
                    stats.term_count,
                    summary.duration.as_secs_f64()
                );
            }
        }
        Commands::Update { full } => {
            let summary = service.update(!full)?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "added {}, changed {}, removed {}, skipped {} in {:.2}s",
                    summary.files_added,
                    summary.files_changed,
                    summary.files_removed,
                    summary.skipped.len(),
                    summary.duration.as_secs_f64()
                );
            }
        }
        Commands::Search { query, top_k } => {
            let query = query.join(" ");
            if let Some(warning) = service.health().warning {
                tracing::warn!(%warning, "index not ready");
            }
            let hits = service.search(&query, top_k.unwrap_or(default_k))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                println!("{} result(s) for {query:?}\n", hits.len());
                for (i, hit) in hits.iter().enumerate() {
                    let section = if hit.heading_path.is_empty() { String::new() } else { format!(" > {}", hit.heading_path.join(" > ")) };
                    println!("{}. {}{} (lines {}-{}, score {:.4})", i + 1, hit.file, section, hit.start_line, hit.end_line, hit.score);
                    println!("   matched: {}", hit.matched_terms.join(", "));
                    println!("   {}\n", hit.excerpt.replace('\n', " "));
                }
            }
        }
        Commands::Stats => {
            let stats = service.stats();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("files:         {}", stats.file_count);
                println!("chunks:        {}", stats.document_count);
                println!("terms:         {}", stats.term_count);
                println!("postings:      {}", stats.posting_count);
                println!("avg chunk len: {:.1}", stats.average_chunk_length);
                println!("index size:    {} bytes", stats.index_size);
                println!("last update:   {}", stats.last_update.as_deref().unwrap_or("never"));
            }
        }
        Commands::Check => {
            let changes = service.check();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&changes)?);
            } else if changes.is_empty() {
                println!("no changes");
            } else {
                for change in &changes {
                    println!("{:?}\t{}", change.kind, change.key);
                }
            }
        }
        Commands::Watch => watch(service)?,
    }
    Ok(())
}

fn watch(service: MemoryService) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let handle = service.spawn_watcher();
        tracing::info!("watching for memory changes, press Ctrl+C to stop");
        tokio::signal::ctrl_c().await?;
        handle.shutdown().await;
        tracing::info!("watcher stopped");
        Ok(())
    })
}
