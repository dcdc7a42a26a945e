//! homily command line interface.
//!
//! # Usage
//!
//! ```bash
//! homily search "faith hope" -n 10
//! homily search "\"seven seals\"" -m phrase --json
//! homily search "what happens after death" -m similar --sermon 63-0317M
//! homily sermon 63-0317M
//! homily paragraph 63-0317M-12-4
//! homily config show
//! ```

mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use homily_config::Config;
use homily_index::{
    EngineConfig, FusionConfig, FusionPreset, SearchEngine, SearchError, SearchMode, SearchRequest,
    SearchResponse, SermonStore, VectorSearchEngine,
};
use homily_providers::{Metric, OpenAiEmbeddings, RestVectorStore, RetryPolicy};

/// Hybrid lexical and semantic search over sermon transcripts.
#[derive(Parser, Debug)]
#[command(name = "homily", version, about)]
pub struct Cli {
    /// Configuration file (default: <config dir>/homily/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite corpus, overriding the configured path
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search the corpus
    Search(SearchArgs),

    /// Print a whole sermon
    Sermon {
        uid: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the blocks of one paragraph
    Paragraph {
        uid: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the merged configuration with credentials masked
    Show,
    /// Print the default configuration file location
    Path,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Search query
    pub query: String,

    /// general, phrase or similar
    #[arg(short, long, default_value = "general")]
    pub mode: SearchMode,

    /// Results per page; -1 returns every match
    #[arg(short = 'n', long, default_value_t = 20, allow_negative_numbers = true)]
    pub limit: i64,

    /// 1-based page number
    #[arg(short, long, default_value = "1")]
    pub page: String,

    /// Only search this sermon
    #[arg(long)]
    pub sermon: Option<String>,

    /// Skip the semantic leg of general searches
    #[arg(long)]
    pub lexical_only: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

impl SearchArgs {
    pub fn to_request(&self) -> SearchRequest {
        let mut request = SearchRequest::new(self.query.clone(), self.mode)
            .with_limit(self.limit)
            .with_page(homily_index::pagination::parse_page(&self.page));
        if let Some(sermon) = &self.sermon {
            request = request.with_sermon(sermon.clone());
        }
        request
    }
}

/// Parse arguments, set up logging and run the selected command.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    execute(cli).await
}

/// Logs go to stderr so JSON on stdout stays machine readable.
fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

pub async fn execute(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(database) = &cli.database {
        config.database.path = database.to_string_lossy().into_owned();
    }

    match cli.command {
        Command::Config { action } => match action {
            ConfigAction::Show => print!("{}", config.to_toml()?),
            ConfigAction::Path => match homily_config::default_config_path() {
                Some(path) => println!("{}", path.display()),
                None => bail!("No configuration directory on this platform"),
            },
        },
        Command::Search(args) => {
            let engine = build_engine(&config, !args.lexical_only)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let response = search(&engine, &args, &cancel).await?;
            let rendered = if args.json {
                output::format_json(&response)?
            } else {
                output::format_search(&args.query, &response)
            };
            println!("{rendered}");
        }
        Command::Sermon { uid, json } => {
            let store = open_store(&config)?;
            let Some(outline) = store.load_sermon(&uid).await? else {
                bail!("Sermon not found: {uid}");
            };
            let rendered = if json {
                output::format_json(&outline)?
            } else {
                output::format_sermon(&outline)
            };
            println!("{rendered}");
        }
        Command::Paragraph { uid, json } => {
            let store = open_store(&config)?;
            let blocks = store.paragraph_blocks(&uid).await?;
            if blocks.is_empty() {
                bail!("Paragraph not found: {uid}");
            }
            let rendered = if json {
                output::format_json(&blocks)?
            } else {
                output::format_paragraph(&uid, &blocks)
            };
            println!("{rendered}");
        }
    }
    Ok(())
}

/// Run one search, mapping cancellation to a readable error.
pub async fn search(engine: &SearchEngine, args: &SearchArgs, cancel: &CancellationToken) -> Result<SearchResponse> {
    match engine.search(&args.to_request(), cancel).await {
        Ok(response) => Ok(response),
        Err(SearchError::Cancelled) => bail!("Search interrupted"),
        Err(e) if e.is_configuration() => {
            Err(e).context("Semantic search needs an embeddings key, a vector key and vector.url")
        }
        Err(e) => Err(e).context("Search failed"),
    }
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling search");
            cancel.cancel();
        }
    });
}

pub fn open_store(config: &Config) -> Result<Arc<SermonStore>> {
    let path = config.database_path()?;
    let store = SermonStore::open(&path, config.database.read_connections)
        .with_context(|| format!("Failed to open sermon database at {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Engine settings from configuration. `hybrid` can only narrow the configured value.
pub fn engine_config(config: &Config, hybrid: bool) -> Result<EngineConfig> {
    let preset: FusionPreset = config
        .fusion
        .preset
        .parse()
        .map_err(anyhow::Error::msg)
        .context("Invalid fusion.preset")?;
    Ok(EngineConfig {
        fusion: FusionConfig {
            preset,
            alpha: config.fusion.alpha,
            beta: config.fusion.beta,
            rrf_k: config.fusion.rrf_k,
        },
        hybrid: hybrid && config.fusion.hybrid,
        candidate_limit: config.vector.candidate_limit,
        cache_ttl: Duration::from_millis(config.cache.ttl_ms),
    })
}

/// The semantic engine, when an ANN endpoint is configured. Missing
/// credentials are reported by the providers on first use.
pub fn vector_engine(config: &Config) -> Option<VectorSearchEngine> {
    let Some(url) = &config.vector.url else {
        info!("No vector.url configured, semantic search disabled");
        return None;
    };
    let retry = RetryPolicy::from_millis(
        config.retry.max_attempts,
        config.retry.base_delay_ms,
        config.retry.max_delay_ms,
    );
    let metric: Metric = config
        .vector
        .metric
        .parse()
        .unwrap_or_else(|never| match never {});

    let embeddings = OpenAiEmbeddings::new(
        config.embeddings.api_key.clone(),
        Some(config.embeddings.model.clone()),
    )
    .with_base_url(config.embeddings.base_url.clone())
    .with_retry(retry.clone())
    .with_timeout(Duration::from_secs(config.embeddings.timeout_secs));

    let store = RestVectorStore::new(url.clone(), config.vector.collection.clone(), config.vector.api_key.clone())
        .with_metric(metric)
        .with_vector_field(config.vector.vector_field.clone())
        .with_search_params(config.vector.nprobe, config.vector.ef_cap)
        .with_retry(retry)
        .with_timeout(Duration::from_secs(config.vector.timeout_secs));

    if !config.semantic_configured() {
        warn!("Semantic search is configured without credentials");
    }
    Some(VectorSearchEngine::new(Arc::new(embeddings), Arc::new(store)))
}

pub fn build_engine(config: &Config, hybrid: bool) -> Result<SearchEngine> {
    let store = open_store(config)?;
    let engine_config = engine_config(config, hybrid)?;
    Ok(SearchEngine::new(store, vector_engine(config), engine_config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_defaults() {
        let cli = Cli::try_parse_from(["homily", "search", "faith"]).unwrap();
        let Command::Search(args) = cli.command else {
            panic!("expected search");
        };
        assert_eq!(args.mode, SearchMode::General);
        assert_eq!(args.limit, 20);
        let request = args.to_request();
        assert_eq!(request.page, 1);
        assert_eq!(request.sermon, None);
    }

    #[test]
    fn test_parse_search_options() {
        let cli = Cli::try_parse_from([
            "homily", "search", "seven seals", "-m", "phrase", "-n", "-1", "-p", "3", "--sermon", "63-0317M",
            "--json", "--verbose",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Command::Search(args) = cli.command else {
            panic!("expected search");
        };
        assert_eq!(args.mode, SearchMode::Phrase);
        assert!(args.json);
        let request = args.to_request();
        assert_eq!(request.limit, -1);
        assert_eq!(request.page, 3);
        assert_eq!(request.sermon.as_deref(), Some("63-0317M"));
    }

    #[test]
    fn test_bad_page_normalizes_to_one() {
        let cli = Cli::try_parse_from(["homily", "search", "grace", "-p", "abc"]).unwrap();
        let Command::Search(args) = cli.command else {
            panic!("expected search");
        };
        assert_eq!(args.to_request().page, 1);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        assert!(Cli::try_parse_from(["homily", "search", "grace", "-m", "fuzzy"]).is_err());
    }

    #[test]
    fn test_parse_other_commands() {
        let cli = Cli::try_parse_from(["homily", "config", "show"]).unwrap();
        assert!(matches!(cli.command, Command::Config { action: ConfigAction::Show }));

        let cli = Cli::try_parse_from(["homily", "--database", "/tmp/c.db", "sermon", "65-0801"]).unwrap();
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/c.db")));
        assert!(matches!(cli.command, Command::Sermon { ref uid, json: false } if uid == "65-0801"));
    }
}
