use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use vectorizer_lib::agent::validate::PgStatementValidator;
use vectorizer_lib::agent::{self, AgentConfig, PgCatalogSearch};
use vectorizer_lib::catalog;
use vectorizer_lib::config::EmbeddingConfig;
use vectorizer_lib::db::install;
use vectorizer_lib::db::postgres::{PgConfig, PgSession};
use vectorizer_lib::db::schema::Relation;
use vectorizer_lib::providers::{self, EmbedOptions, ProviderKind};
use vectorizer_lib::secrets::{EnvSecretResolver, PgSecretResolver, SecretResolver};
use vectorizer_lib::vectorizer::provision::{
    self, CreateVectorizerRequest,
};
use vectorizer_lib::worker::{registry, Worker, WorkerOptions};

#[derive(Parser, Debug)]
#[command(
    name = "vectorizer",
    version,
    about = "Queue-driven embedding sync for Postgres tables with a text-to-SQL agent"
)]
struct Cli {
    /// Postgres connection string; falls back to VECTORIZER_DB_URL.
    #[arg(long)]
    db_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the metadata schema.
    Install,
    /// Create a vectorizer on a source table.
    Create(CreateArgs),
    /// Drop a vectorizer, keeping its target table and view.
    Drop(DropArgs),
    /// Re-enqueue every current source row of a vectorizer.
    Enqueue(EnqueueArgs),
    /// Run the embedding worker.
    Worker(WorkerArgs),
    /// Ask a natural-language question and get validated SQL back.
    Ask(AskArgs),
    /// Show vectorizers, queue depths, and worker liveness.
    Status,
    /// Re-resolve semantic-catalog addresses after a dump/restore.
    PostRestore,
}

#[derive(Args, Debug, Clone)]
struct CreateArgs {
    /// Source table, schema-qualified (e.g. public.blog).
    #[arg(long)]
    source: String,

    /// Path to the JSON config document.
    #[arg(long)]
    config: PathBuf,

    /// Copy all current source pks into the queue after creation.
    #[arg(long, default_value_t = false)]
    enqueue_existing: bool,
}

#[derive(Args, Debug, Clone)]
struct DropArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Args, Debug, Clone)]
struct EnqueueArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Args, Debug, Clone)]
struct WorkerArgs {
    /// Run only this vectorizer to drain, then exit.
    #[arg(long)]
    vectorizer_id: Option<i64>,

    /// Seconds between polls of the vectorizer list.
    #[arg(long, default_value_t = 30)]
    poll_interval_secs: u64,

    /// Seconds between expected heartbeats.
    #[arg(long, default_value_t = 10)]
    heartbeat_interval_secs: u64,

    /// Resolve provider API keys through the database secret store instead
    /// of process environment variables.
    #[arg(long, default_value_t = false)]
    db_secrets: bool,
}

#[derive(Args, Debug, Clone)]
struct AskArgs {
    /// The natural-language question.
    question: String,

    /// Chat provider: anthropic, openai, cohere, or ollama.
    #[arg(long, default_value = "anthropic")]
    provider: String,

    /// Chat model; defaults per provider.
    #[arg(long)]
    model: Option<String>,

    /// Embedding provider for the question vectors.
    #[arg(long, default_value = "openai")]
    embedding_provider: String,

    #[arg(long, default_value = "text-embedding-3-small")]
    embedding_model: String,

    #[arg(long, default_value_t = 1536)]
    embedding_dimensions: u32,

    #[arg(long, default_value = "public")]
    search_path: String,

    #[arg(long, default_value_t = 10)]
    max_iter: usize,

    #[arg(long, default_value_t = 5)]
    max_results: i64,

    #[arg(long)]
    max_vector_dist: Option<f64>,

    /// Include every described top-level object instead of searching.
    #[arg(long, default_value_t = false)]
    include_entire_schema: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(err) = run().await {
        log::error!("command failed: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let db_url = cli
        .db_url
        .or_else(|| std::env::var("VECTORIZER_DB_URL").ok())
        .context("--db-url or VECTORIZER_DB_URL is required")?;
    let pg_config = PgConfig::from_url(&db_url);

    match cli.command {
        Commands::Install => {
            let session = PgSession::open(pg_config).await?;
            install::install(&session).await?;
            println!("metadata schema installed");
        }
        Commands::Create(args) => {
            let config: serde_json::Value = serde_json::from_str(
                &std::fs::read_to_string(&args.config)
                    .with_context(|| format!("failed to read {}", args.config.display()))?,
            )
            .context("config file is not valid JSON")?;

            let mut session = PgSession::open(pg_config).await?;
            let vectorizer = provision::create_vectorizer(
                &mut session,
                CreateVectorizerRequest {
                    source: parse_relation(&args.source)?,
                    config,
                    enqueue_existing: args.enqueue_existing,
                },
            )
            .await?;
            println!("created vectorizer {}", vectorizer.id);
        }
        Commands::Drop(args) => {
            let mut session = PgSession::open(pg_config).await?;
            provision::drop_vectorizer(&mut session, args.id).await?;
            println!("dropped vectorizer {}", args.id);
        }
        Commands::Enqueue(args) => {
            let session = PgSession::open(pg_config).await?;
            let vectorizer = provision::get_vectorizer(&session, args.id)
                .await?
                .with_context(|| format!("vectorizer {} does not exist", args.id))?;
            let enqueued = provision::enqueue_all(&session, &vectorizer).await?;
            println!("enqueued {} rows", enqueued);
        }
        Commands::Worker(args) => {
            let options = WorkerOptions {
                expected_heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
                ..Default::default()
            };
            let secrets: Arc<dyn SecretResolver> = if args.db_secrets {
                Arc::new(PgSecretResolver::connect(&pg_config).await?)
            } else {
                Arc::new(EnvSecretResolver)
            };
            let mut worker = Worker::start(pg_config, secrets, options).await?;

            let cancel = worker.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("shutdown requested");
                    cancel.cancel();
                }
            });

            match args.vectorizer_id {
                Some(id) => {
                    let report = worker.execute_vectorizer(id).await?;
                    println!(
                        "vectorizer {}: {} embedded, {} errors, drained={}",
                        report.vectorizer_id, report.successes, report.errors, report.drained
                    );
                }
                None => {
                    worker
                        .run_loop(Duration::from_secs(args.poll_interval_secs))
                        .await?;
                }
            }
        }
        Commands::Ask(args) => {
            let session = PgSession::open(pg_config.clone()).await?;
            let validator = PgStatementValidator::new(PgSession::open(pg_config).await?);

            let embedding_config = embedding_config_for(
                &args.embedding_provider,
                &args.embedding_model,
                args.embedding_dimensions,
            )?;
            let embed_key = match providers::default_key_name(&embedding_config) {
                Some(name) => Some(
                    std::env::var(name)
                        .with_context(|| format!("{} is not set", name))?,
                ),
                None => None,
            };
            let embedder = providers::embedding_provider(&embedding_config, embed_key)?;
            let embed_options = EmbedOptions {
                timeout: Duration::from_secs(60),
                dimensions: match &embedding_config {
                    EmbeddingConfig::OpenAi { dimensions, .. } => Some(*dimensions),
                    _ => None,
                },
                input_type: match &embedding_config {
                    EmbeddingConfig::VoyageAi { .. } => Some("query".to_string()),
                    _ => None,
                },
            };

            let provider: ProviderKind = args.provider.parse()?;
            let chat_key = chat_key_for(provider)?;
            let chat = providers::chat_provider(provider, chat_key)?;

            let config = AgentConfig {
                provider,
                model: args
                    .model
                    .unwrap_or_else(|| default_chat_model(provider).to_string()),
                max_iter: args.max_iter,
                max_results: args.max_results,
                max_vector_dist: args.max_vector_dist,
                include_entire_schema: args.include_entire_schema,
                ..Default::default()
            };

            let catalog_search = PgCatalogSearch::new(
                session.client()?,
                embedder.as_ref(),
                args.embedding_model.clone(),
                embed_options,
            );

            let answer = agent::generate_sql(
                &args.question,
                &catalog_search,
                chat.as_ref(),
                &validator,
                &config,
                &args.search_path,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&answer)?);
        }
        Commands::Status => {
            let session = PgSession::open(pg_config).await?;
            let vectorizers = provision::list_vectorizers(&session).await?;
            for vectorizer in &vectorizers {
                let pending = provision::queue_depth(&session, vectorizer).await?;
                let progress =
                    registry::get_progress(session.client()?, vectorizer.id).await?;
                let (successes, errors) = progress
                    .map(|p| (p.success_count, p.error_count))
                    .unwrap_or((0, 0));
                println!(
                    "vectorizer {} on {}: {} pending, {} embedded, {} errors",
                    vectorizer.id, vectorizer.source, pending, successes, errors
                );
            }
            for worker in registry::list_workers(session.client()?).await? {
                println!(
                    "worker {} v{}: live={}, heartbeats={}, successes={}, errors={}",
                    worker.id,
                    worker.version,
                    worker.live,
                    worker.heartbeat_count,
                    worker.success_count,
                    worker.error_count
                );
            }
        }
        Commands::PostRestore => {
            let session = PgSession::open(pg_config).await?;
            catalog::post_restore(session.client()?).await?;
            println!("semantic catalog addresses re-resolved");
        }
    }

    Ok(())
}

fn parse_relation(qualified: &str) -> anyhow::Result<Relation> {
    match qualified.split_once('.') {
        Some((schema, name)) if !schema.is_empty() && !name.is_empty() => {
            Ok(Relation::new(schema, name))
        }
        _ => Ok(Relation::new("public", qualified)),
    }
}

fn embedding_config_for(
    provider: &str,
    model: &str,
    dimensions: u32,
) -> anyhow::Result<EmbeddingConfig> {
    match provider {
        "openai" => Ok(EmbeddingConfig::OpenAi {
            model: model.to_string(),
            dimensions,
            base_url: None,
            api_key_name: None,
            use_batch_api: false,
        }),
        "ollama" => Ok(EmbeddingConfig::Ollama {
            model: model.to_string(),
            dimensions,
            base_url: None,
            keep_alive: None,
        }),
        "voyageai" => Ok(EmbeddingConfig::VoyageAi {
            model: model.to_string(),
            dimensions,
            api_key_name: None,
            input_type: Some("query".to_string()),
        }),
        other => anyhow::bail!("unknown embedding provider: {}", other),
    }
}

fn chat_key_for(provider: ProviderKind) -> anyhow::Result<Option<String>> {
    let name = match provider {
        ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        ProviderKind::OpenAi => "OPENAI_API_KEY",
        ProviderKind::Cohere => "COHERE_API_KEY",
        ProviderKind::Ollama => return Ok(None),
    };
    Ok(Some(
        std::env::var(name).with_context(|| format!("{} is not set", name))?,
    ))
}

fn default_chat_model(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Anthropic => "claude-3-5-sonnet-latest",
        ProviderKind::OpenAi => "gpt-4o",
        ProviderKind::Cohere => "command-r-plus",
        ProviderKind::Ollama => "llama3.2",
    }
}
