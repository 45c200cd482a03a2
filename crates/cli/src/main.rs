//! Operator CLI for the chunkref reference store.

use anyhow::{Context, Result};
use chunkref_core::config::AppConfig;
use chunkref_core::{ChunkHash, Reference, ReferenceUpdate};
use chunkref_gc::{GcClient, OpContext, StorageServer, StoreClient};
use chunkref_metadata::MetadataStore;
use chunkref_storage::ObjectStore;
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// chunkref - reference-counting garbage collection for chunk stores
#[derive(Parser, Debug)]
#[command(name = "chunkref")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "CHUNKREF_CONFIG",
        default_value = "config/chunkref.toml"
    )]
    config: String,

    /// Abort the operation if it has not finished after this many seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Print this run's protocol metrics in Prometheus text format on exit
    #[arg(long, global = true)]
    emit_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the schema if needed and check connectivity
    Migrate,
    /// Reserve chunks for a job
    Reserve {
        /// Job that will hold the reservations
        #[arg(long)]
        job: String,
        /// Chunk hashes to reserve
        #[arg(value_name = "HASH", required = true, num_args = 1..)]
        chunks: Vec<ChunkHash>,
    },
    /// Add and remove references in one atomic update
    Update {
        /// Reference to add, as kind:source:chunk (repeatable)
        #[arg(long = "add", value_name = "REF")]
        add: Vec<Reference>,
        /// Reference to remove, as kind:source:chunk (repeatable)
        #[arg(long = "remove", value_name = "REF")]
        remove: Vec<Reference>,
        /// Also release every reference held by this job
        #[arg(long)]
        release_job: Option<String>,
    },
    /// Release every reference held by a job
    ReleaseJob {
        /// Job to release
        job: String,
    },
    /// Show a chunk's deletion state and references
    Inspect {
        /// Chunk hash
        chunk: ChunkHash,
    },
    /// Redrive deletions left pending by a crash or chunk server fault
    Recover {
        /// Maximum number of chunks to redrive
        #[arg(long, default_value_t = 1000)]
        limit: u32,
    },
}

/// Load configuration from an optional TOML file overlaid with `CHUNKREF_*`
/// environment variables.
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("CHUNKREF_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Context for one command: cancelled on Ctrl-C, bounded by `--timeout-secs`.
fn command_context(timeout_secs: Option<u64>) -> OpContext {
    let mut ctx = OpContext::new();
    if let Some(secs) = timeout_secs {
        ctx = ctx.with_timeout(Duration::from_secs(secs));
    }

    let token = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling in-flight operation");
            token.cancel();
        }
    });
    ctx
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(Path::new(&cli.config))?;

    let metadata = chunkref_metadata::from_config(&config.metadata, &config.retry)
        .await
        .context("failed to initialize reference store")?;
    let storage = chunkref_storage::from_config(&config.storage)
        .await
        .context("failed to initialize chunk storage")?;
    let server = Arc::new(StorageServer::new(metadata.clone(), storage.clone()));
    let client = StoreClient::new(metadata.clone(), server);

    let ctx = command_context(cli.timeout_secs);
    run(cli.command, &ctx, &client, metadata.as_ref(), storage.as_ref()).await?;

    if cli.emit_metrics {
        print!("{}", chunkref_metadata::metrics::gather_text()?);
    }
    Ok(())
}

async fn run(
    command: Commands,
    ctx: &OpContext,
    client: &StoreClient,
    metadata: &dyn MetadataStore,
    storage: &dyn ObjectStore,
) -> Result<()> {
    match command {
        Commands::Migrate => {
            metadata.migrate().await.context("schema bootstrap failed")?;
            metadata
                .health_check()
                .await
                .context("reference store health check failed")?;
            storage
                .health_check()
                .await
                .context("chunk storage health check failed")?;
            println!(
                "schema ready ({} reference store, {} chunk storage)",
                metadata.backend_name(),
                storage.backend_name()
            );
        }
        Commands::Reserve { job, chunks } => {
            client.reserve_chunks(ctx, &job, &chunks).await?;
            println!("reserved {} chunk(s) for job {job}", chunks.len());
        }
        Commands::Update {
            add,
            remove,
            release_job,
        } => {
            let update = ReferenceUpdate {
                add,
                remove,
                release_job,
            };
            let marked = client.apply(ctx, &update).await?;
            print_deleted(&marked);
        }
        Commands::ReleaseJob { job } => {
            let marked = client
                .apply(ctx, &ReferenceUpdate::new().release_job(job))
                .await?;
            print_deleted(&marked);
        }
        Commands::Inspect { chunk } => {
            let row = metadata.get_chunk(&chunk).await?;
            let state = match &row {
                None => "absent".to_string(),
                Some(row) => match row.deleting {
                    Some(since) => format!("deleting since {since}"),
                    None => "live".to_string(),
                },
            };
            let has_content = storage.exists(&chunk.to_object_key()).await?;
            println!("chunk {chunk}: {state}, content {}", presence(has_content));
            for reference in metadata.refs_for_chunk(&chunk).await? {
                println!("  {reference}");
            }
        }
        Commands::Recover { limit } => {
            let redriven = client.recover_pending_deletes(ctx, limit).await?;
            println!("redrove {redriven} pending deletion(s)");
        }
    }
    Ok(())
}

fn presence(present: bool) -> &'static str {
    if present { "present" } else { "missing" }
}

fn print_deleted(marked: &[ChunkHash]) {
    println!("deleted {} chunk(s)", marked.len());
    for chunk in marked {
        println!("  {chunk}");
    }
}
