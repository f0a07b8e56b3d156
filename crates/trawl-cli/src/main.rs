use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use trawl_client::{PROJECT_FIELDS, ProjectPageExtractor, ReqwestFetcherFactory};
use trawl_core::models::DEFAULT_BASE_URL;
use trawl_core::traits::{CacheStore, FetcherFactory};
use trawl_core::{
    CacheStatus, DedupCache, Orchestrator, RateLimitConfig, RotationPolicy, RunConfig, RunSummary,
    Target, TracingWorkerReporter,
};
use trawl_store::{CsvSink, JsonlCacheStore};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Polite, resumable project page fetcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch project pages and append extracted records to a CSV file
    Run(RunArgs),

    /// Inspect the dedup cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Targets: `owner/name` references or absolute URLs
    targets: Vec<String>,

    /// File with one target per line (`#` starts a comment)
    #[arg(short = 'f', long, env = "TRAWL_TARGETS_FILE")]
    targets_file: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(short, long, env = "TRAWL_WORKERS", default_value_t = 6)]
    workers: usize,

    /// Mean delay between two requests of the same worker
    #[arg(long, env = "TRAWL_INTERVAL_MS", default_value_t = 2000)]
    interval_ms: u64,

    /// Uniform jitter applied around the interval
    #[arg(long, env = "TRAWL_JITTER_MS", default_value_t = 1000)]
    jitter_ms: u64,

    /// Proxy URLs to rotate through (comma-separated in the env var)
    #[arg(long = "proxy", env = "TRAWL_PROXIES", value_delimiter = ',')]
    proxies: Vec<String>,

    /// User agents to rotate through (`|`-separated in the env var)
    #[arg(long = "user-agent", env = "TRAWL_USER_AGENTS", value_delimiter = '|')]
    user_agents: Vec<String>,

    /// Identity rotation policy: round-robin or random
    #[arg(long, env = "TRAWL_ROTATION", default_value = "round-robin")]
    rotation: RotationPolicy,

    /// Fetch attempts per target, the first one included
    #[arg(long, env = "TRAWL_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Per-fetch timeout
    #[arg(long, env = "TRAWL_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Dedup cache file
    #[arg(long, env = "TRAWL_CACHE", default_value = "scrape_cache.jsonl")]
    cache: PathBuf,

    /// CSV output file (appended to if it exists)
    #[arg(short, long, env = "TRAWL_OUTPUT", default_value = "github_projects.csv")]
    output: PathBuf,

    /// Base URL that `owner/name` references are resolved against
    #[arg(long, env = "TRAWL_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: Url,

    /// Dirty cache entries batched before each append
    #[arg(long, env = "TRAWL_CACHE_FLUSH_EVERY", default_value_t = 25)]
    cache_flush_every: usize,

    /// Render pages with headless Chromium instead of plain HTTP
    #[cfg(feature = "browser")]
    #[arg(long, env = "TRAWL_BROWSER", default_value_t = false)]
    browser: bool,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Count cache entries per status
    Stats {
        #[arg(long, env = "TRAWL_CACHE", default_value = "scrape_cache.jsonl")]
        cache: PathBuf,
    },

    /// List cache entries, sorted by target
    Show {
        #[arg(long, env = "TRAWL_CACHE", default_value = "scrape_cache.jsonl")]
        cache: PathBuf,

        /// Only show entries with this status
        #[arg(short, long)]
        status: Option<CacheStatus>,

        /// Number of entries to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

impl RunArgs {
    fn to_config(&self) -> RunConfig {
        let mut config = RunConfig::default()
            .with_workers(self.workers)
            .with_rate_limit(
                RateLimitConfig::new(Duration::from_millis(self.interval_ms))
                    .with_jitter(Duration::from_millis(self.jitter_ms)),
            )
            .with_max_retries(self.max_retries)
            .with_fetch_timeout(Duration::from_secs(self.timeout_secs))
            .with_proxies(clean_list(&self.proxies))
            .with_rotation(self.rotation)
            .with_base_url(self.base_url.clone())
            .with_cache_path(&self.cache)
            .with_output_path(&self.output)
            .with_cache_flush_every(self.cache_flush_every);

        let user_agents = clean_list(&self.user_agents);
        if !user_agents.is_empty() {
            config = config.with_user_agents(user_agents);
        }
        config
    }

    fn load_targets(&self, base: &Url) -> Result<Vec<Target>> {
        let mut raw: Vec<String> = self.targets.clone();
        if let Some(path) = &self.targets_file {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read targets file: {}", path.display()))?;
            raw.extend(parse_target_lines(&content));
        }

        let targets = raw
            .iter()
            .map(|r| Target::parse(r, base))
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid target")?;

        if targets.is_empty() {
            bail!("No targets given. Pass them as arguments or with --targets-file.");
        }
        Ok(targets)
    }

    #[cfg(feature = "browser")]
    fn use_browser(&self) -> bool {
        self.browser
    }

    #[cfg(not(feature = "browser"))]
    fn use_browser(&self) -> bool {
        false
    }
}

/// Trim entries and drop empty ones.
fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// One target per line; blank lines and `#` comments are skipped.
fn parse_target_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| strip_comment(line).trim())
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

/// Cut a `#` comment that starts the line or follows whitespace. A `#`
/// inside a URL is its fragment.
fn strip_comment(line: &str) -> &str {
    let cut = line
        .char_indices()
        .find(|&(i, c)| {
            c == '#' && line[..i].chars().next_back().is_none_or(char::is_whitespace)
        })
        .map_or(line.len(), |(i, _)| i);
    &line[..cut]
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => cmd_run(args).await?,
        Commands::Cache { command } => match command {
            CacheCommands::Stats { cache } => cmd_cache_stats(&cache)?,
            CacheCommands::Show {
                cache,
                status,
                limit,
            } => cmd_cache_show(&cache, status, limit)?,
        },
    }

    Ok(())
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let config = args.to_config();
    config.validate().context("Invalid configuration")?;
    let targets = args.load_targets(&config.base_url)?;

    let sink = CsvSink::create(&config.output_path, &PROJECT_FIELDS)
        .context("Cannot open output file")?;
    let store = JsonlCacheStore::new(&config.cache_path);
    let extractor = ProjectPageExtractor::new()?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight fetches");
            interrupt.cancel();
        }
    });

    let summary = if args.use_browser() {
        run_pool(config, browser_factory()?, extractor, sink, store, targets, cancel).await?
    } else {
        run_pool(config, ReqwestFetcherFactory, extractor, sink, store, targets, cancel).await?
    };

    println!("{summary}");
    Ok(())
}

#[cfg(feature = "browser")]
fn browser_factory() -> Result<trawl_client::BrowserFetcherFactory> {
    Ok(trawl_client::BrowserFetcherFactory)
}

#[cfg(not(feature = "browser"))]
fn browser_factory() -> Result<ReqwestFetcherFactory> {
    bail!("This binary was built without the `browser` feature")
}

async fn run_pool<FF: FetcherFactory>(
    config: RunConfig,
    factory: FF,
    extractor: ProjectPageExtractor,
    sink: CsvSink,
    store: JsonlCacheStore,
    targets: Vec<Target>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let orchestrator = Orchestrator::new(config, factory, extractor, sink, store)?;
    let summary = orchestrator
        .run(targets, cancel, Arc::new(TracingWorkerReporter))
        .await
        .context("Run could not start")?;
    Ok(summary)
}

fn open_cache(path: &Path) -> Result<DedupCache<JsonlCacheStore>> {
    let store = JsonlCacheStore::new(path);
    // Surface corruption here instead of silently showing an empty cache.
    store
        .load()
        .with_context(|| format!("Failed to read cache file: {}", path.display()))?;
    Ok(DedupCache::open(store, 1))
}

fn cmd_cache_stats(path: &Path) -> Result<()> {
    let stats = open_cache(path)?.stats();

    println!("Cache {}:", path.display());
    println!("  success:            {}", stats.success);
    println!("  permanent failures: {}", stats.permanent_failure);
    println!("  transient failures: {}", stats.transient_failure);
    println!("  total:              {}", stats.total());
    Ok(())
}

fn cmd_cache_show(path: &Path, status: Option<CacheStatus>, limit: usize) -> Result<()> {
    let entries: Vec<_> = open_cache(path)?
        .entries()
        .into_iter()
        .filter(|e| status.is_none_or(|s| e.status == s))
        .collect();

    if entries.is_empty() {
        println!("No cache entries found in {}", path.display());
        return Ok(());
    }

    for entry in entries.iter().take(limit) {
        let detail = match (&entry.record, &entry.error) {
            (Some(record), _) => record.fields.get("name").cloned().unwrap_or_default(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        println!(
            "  [{}] {} (attempts: {}, {}) {}",
            entry.status,
            entry.key,
            entry.attempts,
            entry.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
            detail,
        );
    }

    if entries.len() > limit {
        println!("\nShowing {} of {} entries", limit, entries.len());
    } else {
        println!("\nTotal: {} entries", entries.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_args(args: &[&str]) -> RunArgs {
        let mut argv = vec!["trawl", "run"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Run(args) => args,
            Commands::Cache { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn target_lines_skip_blanks_and_comments() {
        let content = "# trending\ntokio-rs/tokio\n\n  serde-rs/serde  # core\nhttps://github.com/a/b\n";
        assert_eq!(
            parse_target_lines(content),
            ["tokio-rs/tokio", "serde-rs/serde", "https://github.com/a/b"]
        );
    }

    #[test]
    fn url_fragment_is_not_a_comment() {
        let content = "https://host/x#readme
https://host/y#readme # pinned
	# indented comment
";
        assert_eq!(
            parse_target_lines(content),
            ["https://host/x#readme", "https://host/y#readme"]
        );
    }

    #[test]
    fn defaults_match_run_config() {
        let config = run_args(&["a/b"]).to_config();
        let default = RunConfig::default();
        assert_eq!(config.workers, default.workers);
        assert_eq!(config.rate_limit, default.rate_limit);
        assert_eq!(config.retry.max_retries, default.retry.max_retries);
        assert_eq!(config.user_agents, default.user_agents);
        assert_eq!(config.cache_path, default.cache_path);
        assert_eq!(config.output_path, default.output_path);
        config.validate().unwrap();
    }

    #[test]
    fn flags_map_onto_config() {
        let config = run_args(&[
            "--workers",
            "2",
            "--interval-ms",
            "500",
            "--jitter-ms",
            "0",
            "--proxy",
            "http://p1:8080",
            "--proxy",
            " ",
            "--user-agent",
            "ua-1",
            "--rotation",
            "random",
            "--max-retries",
            "5",
            "a/b",
        ])
        .to_config();

        assert_eq!(config.workers, 2);
        assert_eq!(config.rate_limit.interval, Duration::from_millis(500));
        assert_eq!(config.rate_limit.jitter, Duration::ZERO);
        assert_eq!(config.proxies, ["http://p1:8080"]);
        assert_eq!(config.user_agents, ["ua-1"]);
        assert_eq!(config.rotation, RotationPolicy::Random);
        assert_eq!(config.retry.max_retries, 5);
    }

    #[test]
    fn targets_come_from_args_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("targets.txt");
        std::fs::write(&file, "c/d\n# skip\ne/f\n").unwrap();

        let args = run_args(&["a/b", "--targets-file", file.to_str().unwrap()]);
        let base = Url::parse(DEFAULT_BASE_URL).unwrap();
        let keys: Vec<_> = args
            .load_targets(&base)
            .unwrap()
            .iter()
            .map(|t| t.key().to_string())
            .collect();
        assert_eq!(keys, ["a/b", "c/d", "e/f"]);
    }

    #[test]
    fn no_targets_is_an_error() {
        let base = Url::parse(DEFAULT_BASE_URL).unwrap();
        assert!(run_args(&[]).load_targets(&base).is_err());
    }

    #[test]
    fn cache_show_accepts_status_filter() {
        let cli = Cli::try_parse_from(["trawl", "cache", "show", "--status", "transient"]).unwrap();
        match cli.command {
            Commands::Cache {
                command: CacheCommands::Show { status, limit, .. },
            } => {
                assert_eq!(status, Some(CacheStatus::TransientFailure));
                assert_eq!(limit, 20);
            }
            _ => panic!("expected cache show"),
        }
    }
}
