use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Context;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, EnvFilter};
use clap::{Parser, Subcommand};

use certex::config::{Config, LlmProvider};
use certex::llm::{CompletionService, LlmClient};
use certex::ops::{self, ExtractionService};
use certex::rag::{embeddings::EmbeddingClient, VectorIndex};
use certex::rules::{self, JsonRuleStore, NewRule, RuleStore, RuleUpdate};
use certex::validation::ValidationService;

#[derive(Parser)]
#[command(name = "certex")]
#[command(version)]
#[command(about = "Certificate extraction, validation and indexing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Check whether a PDF is a fillable ACORD form
    Detect {
        path: PathBuf,
    },
    /// Extract structured data from a PDF
    Extract {
        path: PathBuf,
        /// Use the ACORD pipeline even if detection says otherwise
        #[arg(long)]
        force_acord: bool,
        /// Render resolution for OCR
        #[arg(long)]
        dpi: Option<u32>,
    },
    /// Extract a PDF and validate it against the product rules
    Validate {
        path: PathBuf,
    },
    /// Manage validation rules
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Index a saved extraction JSON for search
    Index {
        path: PathBuf,
        /// Document id, defaults to the file stem
        #[arg(long)]
        id: Option<String>,
    },
    /// Search indexed extractions
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
    },
    /// List models served by the LLM endpoint
    Models {
        /// Save this model as the default
        #[arg(long = "use")]
        use_model: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
enum RulesAction {
    List,
    Get {
        id: i64,
    },
    Add {
        #[arg(long)]
        certificate_type: String,
        #[arg(long)]
        product: String,
        #[arg(long)]
        inactive: bool,
    },
    Update {
        id: i64,
        #[arg(long)]
        certificate_type: String,
        #[arg(long)]
        product: String,
        #[arg(long)]
        inactive: bool,
    },
    Delete {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    /// Bulk-create rules from a JSON array file
    Import {
        path: PathBuf,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// LM Studio serves whatever is loaded; fall back to its first model when
/// the configured one is not available.
async fn resolve_model(config: &mut Config) {
    if config.llm_provider != LlmProvider::LmStudio {
        return;
    }
    let client = LlmClient::from_config(config);
    match client.fetch_models().await {
        Ok(models) if !models.iter().any(|m| m == &config.llm_model) => {
            if let Some(first) = models.first() {
                tracing::info!("Auto-detected LLM Model: {}", first);
                config.llm_model = first.clone();
                if let Err(e) = Config::save_model(first) {
                    tracing::warn!("Failed to save model choice: {}", e);
                }
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Could not list LM Studio models: {}", e),
    }
}

fn open_rules() -> anyhow::Result<JsonRuleStore> {
    let path = Config::get_rules_path();
    JsonRuleStore::open(&path).with_context(|| format!("opening rules at {}", path.display()))
}

fn open_index(config: &Config) -> anyhow::Result<VectorIndex> {
    let embedder = Arc::new(EmbeddingClient::from_config(config));
    VectorIndex::open(&Config::get_index_path(), embedder)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let app_dir = Config::get_app_data_dir();
    let file_appender = tracing_appender::rolling::never(app_dir, "certex.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(EnvFilter::new("debug,lopdf=warn,pdf_extract=warn"))
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        )
        .init();

    let mut config = Config::load();
    let mut failed = false;

    match cli.command {
        Commands::Detect { path } => {
            let service = ExtractionService::from_config(config)?;
            print_json(&service.detect(&path).await)?;
        }
        Commands::Extract { path, force_acord, dpi } => {
            if let Some(dpi) = dpi {
                config.pdf_dpi = dpi;
            }
            resolve_model(&mut config).await;
            let service = ExtractionService::from_config(config)?;
            let report = service.extract_path(&path, force_acord).await;
            print_json(&report)?;
            failed = !report.success;
        }
        Commands::Validate { path } => {
            resolve_model(&mut config).await;
            let llm: Arc<dyn CompletionService> = Arc::new(LlmClient::from_config(&config));
            let rules: Arc<dyn RuleStore> = Arc::new(open_rules()?);
            let validation = ValidationService::new(llm, rules);
            let extraction = ExtractionService::from_config(config)?;

            let (report, outcome) = ops::extract_and_validate(&extraction, &validation, &path).await?;
            match outcome {
                Some(outcome) => print_json(&outcome)?,
                None => {
                    print_json(&report)?;
                    failed = true;
                }
            }
        }
        Commands::Rules { action } => {
            let store = open_rules()?;
            match action {
                RulesAction::List => print_json(&store.list()?)?,
                RulesAction::Get { id } => print_json(&store.get(id)?)?,
                RulesAction::Add { certificate_type, product, inactive } => {
                    let rule = NewRule { certificate_type, product_name: product, is_active: !inactive };
                    print_json(&store.create(rule)?)?;
                }
                RulesAction::Update { id, certificate_type, product, inactive } => {
                    let rule = RuleUpdate { id, certificate_type, product_name: product, is_active: !inactive };
                    print_json(&store.update(rule)?)?;
                }
                RulesAction::Delete { ids } => print_json(&store.delete_many(&ids)?)?,
                RulesAction::Import { path } => {
                    let new_rules = rules::read_rules_file(&path)?;
                    let created = store.create_many(new_rules)?;
                    println!("Imported {} rules into {}", created.len(), store.storage_path().display());
                }
            }
        }
        Commands::Index { path, id } => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let saved: serde_json::Value = serde_json::from_str(&text)?;
            let data = saved.get("formatted_data").cloned().unwrap_or_else(|| saved.clone());
            let doc_id = id.unwrap_or_else(|| {
                path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| "document".to_string())
            });

            let mut metadata = HashMap::new();
            for key in ["document_type", "certificate_type", "extraction_method"] {
                if let Some(v) = saved.get(key).and_then(|v| v.as_str()) {
                    metadata.insert(key.to_string(), v.to_string());
                }
            }

            let index = open_index(&config)?;
            print_json(&index.index_extraction(&doc_id, &data, metadata).await?)?;
        }
        Commands::Search { query, top_k } => {
            let index = open_index(&config)?;
            let stats = index.get_stats()?;
            tracing::info!(documents = stats.document_count, size = %stats.format_file_size(), "Searching index");
            print_json(&index.search(&query, top_k).await?)?;
        }
        Commands::Models { use_model } => {
            if let Some(model) = use_model {
                Config::save_model(&model)?;
                println!("Default model set to {}", model);
            } else {
                let client = LlmClient::from_config(&config);
                for model in client.fetch_models().await? {
                    let marker = if model == config.llm_model { "*" } else { " " };
                    println!("{} {}", marker, model);
                }
            }
        }
    }

    // Flush the log file before a non-zero exit skips destructors
    drop(_guard);
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
