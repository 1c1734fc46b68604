//! `lorekeep`: operate a knowledge base from the command line.
//!
//! Results go to stdout as pretty JSON; logs go to stderr.

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand, ValueEnum},
    lorekeep_knowledge::{
        DocType, IngestMeta, KnowledgeConfig, KnowledgeInput, KnowledgeManager,
        config::EmbeddingBackend,
    },
    serde::Serialize,
    tracing::info,
    tracing_subscriber::EnvFilter,
};

#[derive(Parser)]
#[command(name = "lorekeep", version, about = "Knowledge retrieval engine")]
struct Cli {
    /// TOML config file. Missing file means defaults.
    #[arg(long, env = "LOREKEEP_CONFIG", default_value = "lorekeep.toml")]
    config: PathBuf,

    /// SQLite database path, overrides `store.db_path`.
    #[arg(long, env = "LOREKEEP_DB")]
    db: Option<String>,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Do not seed an empty knowledge base on startup.
    #[arg(long)]
    no_seed: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Backend and provider health, document counts, categories.
    Status,
    /// Write the starter catalog if the knowledge base is empty.
    Seed,
    /// Ranked search.
    Search {
        query: String,
        /// Restrict to document types (repeatable).
        #[arg(long = "type")]
        doc_types: Vec<DocType>,
        /// Restrict to categories (repeatable).
        #[arg(long = "category")]
        categories: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        min_similarity: Option<f32>,
    },
    /// Assemble a bounded context block.
    Context {
        query: String,
        #[arg(long)]
        max_chars: Option<usize>,
        #[arg(long)]
        no_conversations: bool,
        #[arg(long)]
        no_knowledge: bool,
        /// Print only the context text.
        #[arg(long)]
        text: bool,
    },
    /// Author or replace a knowledge document.
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        content: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value = "knowledge")]
        doc_type: DocType,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        source_url: Option<String>,
        /// Upsert over an existing document with this id.
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        confidence: Option<f32>,
    },
    /// Store one conversation turn.
    Ingest {
        #[arg(long)]
        user: String,
        #[arg(long)]
        response: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        intent: Option<String>,
    },
    /// Evict the oldest conversations above `memory.max_memories`.
    Prune,
    /// Report conversation growth against the consolidation threshold.
    Consolidate,
    /// Embed knowledge documents stored without a vector.
    Backfill,
    /// Rate a knowledge document.
    Feedback {
        id: String,
        /// Lower confidence instead of raising it.
        #[arg(long)]
        unhelpful: bool,
    },
    /// Run the maintenance loop until interrupted.
    Maintain,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<KnowledgeConfig> {
    let mut config = KnowledgeConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(db) = &cli.db {
        config.store.db_path = db.clone();
    }
    if cli.no_seed {
        config.memory.seed_on_start = false;
    }
    if config.embeddings.provider == EmbeddingBackend::OpenAi
        && config.embeddings.api_key.is_none()
    {
        config.embeddings.api_key = std::env::var("OPENAI_API_KEY").ok();
    }
    config.validate()?;
    Ok(config)
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli)?;
    let manager = Arc::new(
        KnowledgeManager::from_config(config)
            .await
            .context("opening knowledge base")?,
    );

    match cli.command {
        Command::Status => print_json(&manager.status().await)?,
        Command::Seed => {
            let written = manager.seed_knowledge().await;
            print_json(&serde_json::json!({ "written": written }))?;
        },
        Command::Search {
            query,
            doc_types,
            categories,
            limit,
            min_similarity,
        } => {
            let mut request = manager
                .query(query)
                .doc_types(doc_types)
                .categories(categories);
            if let Some(limit) = limit {
                request = request.limit(limit);
            }
            if let Some(floor) = min_similarity {
                request = request.min_similarity(floor);
            }
            print_json(&manager.search(&request).await?)?;
        },
        Command::Context {
            query,
            max_chars,
            no_conversations,
            no_knowledge,
            text,
        } => {
            let max_chars = max_chars.unwrap_or(manager.config().retrieval.context_max_chars);
            let bundle = manager
                .get_context(&query, max_chars, !no_conversations, !no_knowledge)
                .await;
            if text {
                println!("{}", bundle.text);
            } else {
                print_json(&bundle)?;
            }
        },
        Command::Add {
            title,
            content,
            category,
            doc_type,
            tags,
            source_url,
            id,
            confidence,
        } => {
            let input = KnowledgeInput {
                id,
                title,
                content,
                category,
                doc_type,
                tags,
                source_url,
                confidence,
            };
            let id = manager
                .add_knowledge(input)
                .await?
                .context("document backend rejected the write")?;
            print_json(&serde_json::json!({ "id": id }))?;
        },
        Command::Ingest {
            user,
            response,
            session_id,
            intent,
        } => {
            let meta = IngestMeta {
                session_id,
                intent,
                source: Some("cli".into()),
                ..IngestMeta::default()
            };
            let id = manager
                .ingest_conversation(&user, &response, &meta)
                .await
                .context("document backend rejected the write")?;
            print_json(&serde_json::json!({ "id": id }))?;
        },
        Command::Prune => {
            let evicted = manager.enforce_retention().await;
            print_json(&serde_json::json!({ "evicted": evicted }))?;
        },
        Command::Consolidate => {
            let report = manager
                .consolidate()
                .await
                .context("document backend unavailable")?;
            print_json(&report)?;
        },
        Command::Backfill => {
            let updated = manager.backfill_embeddings().await;
            print_json(&serde_json::json!({ "updated": updated }))?;
        },
        Command::Feedback { id, unhelpful } => {
            let confidence = manager
                .record_feedback(&id, !unhelpful)
                .await
                .with_context(|| format!("no knowledge document '{id}' to update"))?;
            print_json(&serde_json::json!({ "id": id, "confidence": confidence }))?;
        },
        Command::Maintain => {
            let interval = manager.config().memory.maintenance_interval();
            info!(interval_secs = interval.as_secs(), "maintenance loop started");
            let handle = manager.spawn_maintenance();
            tokio::signal::ctrl_c().await?;
            handle.abort();
            info!("maintenance loop stopped");
        },
    }
    Ok(())
}
