//! tracker-proxy CLI - query, download and test tracker definitions.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tracker_proxy::config::default_config_path;
use tracker_proxy::{
    default_loader, list_enabled, load_definition_file, Aggregate, Config, DefinitionLoader, Indexer,
    JsonConfig, Query, Runner, RunnerOpts, TestMode, Tester, TesterOpts, AGGREGATE_KEY,
};

/// Torznab proxy for tracker sites described by YAML definitions
#[derive(Parser)]
#[command(name = "tracker-proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $TRACKER_PROXY_CONFIG or ~/.config/tracker-proxy/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Request timeout in seconds
    #[arg(short, long, global = true, default_value = "30")]
    timeout: u64,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Search one indexer, or "aggregate" for every enabled one
    Query(QueryArgs),

    /// Download the file behind a result link
    Download(DownloadArgs),

    /// Run a definition's self-tests
    #[command(alias = "test-definition")]
    Test(TestArgs),

    /// Show the share ratio of every enabled indexer
    Ratios,

    /// Print an indexer's Torznab capabilities
    Caps {
        /// Indexer key
        key: String,
    },

    /// List known definitions
    Definitions,
}

#[derive(Parser)]
struct QueryArgs {
    /// Indexer key
    key: String,

    /// Torznab parameters as name=value (t, q, cat, season, ep, imdbid, limit, offset, ...);
    /// bare words become the search term
    params: Vec<String>,

    /// Output format
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,
}

#[derive(Parser)]
struct DownloadArgs {
    /// Indexer key
    key: String,

    /// Result link
    url: String,

    /// Write to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Parser)]
struct TestArgs {
    /// Definition key or path to a definition file
    definition: String,

    /// Record the session to an archive
    #[arg(long, conflicts_with = "replay")]
    save: Option<PathBuf>,

    /// Serve the session from an archive instead of the network
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Write every fetched page to the cache directory
    #[arg(long)]
    cachepages: bool,

    /// Include the download case in the default suite
    #[arg(long)]
    download: bool,

    /// Log test progress
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// Torznab RSS
    Xml,
    /// JSON output
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Test(args) if args.verbose => "info",
        _ => "warn",
    };
    init_tracing(cli.debug, default_level)?;

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config: Arc<dyn Config> = Arc::new(
        JsonConfig::open(&config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?,
    );
    let opts = RunnerOpts::new(config).with_timeout(Duration::from_secs(cli.timeout));

    match cli.command {
        Commands::Query(args) => run_query(args, opts).await,
        Commands::Download(args) => run_download(args, opts).await,
        Commands::Test(args) => run_test(args, opts).await,
        Commands::Ratios => run_ratios(opts).await,
        Commands::Caps { key } => {
            let indexer = open_indexer(&key, &opts)?;
            println!("{}", indexer.capabilities().to_xml(&indexer.info().title));
            Ok(())
        }
        Commands::Definitions => list_definitions(&opts),
    }
}

fn init_tracing(debug: bool, default_level: &str) -> Result<()> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// A runner for one key, or the aggregate of every enabled definition.
fn open_indexer(key: &str, opts: &RunnerOpts) -> Result<Box<dyn Indexer>> {
    let loader = default_loader()?;
    if key == AGGREGATE_KEY {
        return Ok(Box::new(open_aggregate(&loader, opts)?));
    }
    let definition = loader
        .load(key)
        .with_context(|| format!("Failed to load definition '{}'", key))?;
    Ok(Box::new(Runner::new(Arc::new(definition), opts.clone())?))
}

fn open_aggregate(loader: &dyn DefinitionLoader, opts: &RunnerOpts) -> Result<Aggregate> {
    let mut aggregate = Aggregate::new().with_timeout(opts.request_timeout * 2);
    for key in list_enabled(loader, opts.config.as_ref())? {
        let definition = loader
            .load(&key)
            .with_context(|| format!("Failed to load definition '{}'", key))?;
        aggregate.add(Runner::new(Arc::new(definition), opts.clone())?);
    }
    if aggregate.is_empty() {
        anyhow::bail!("No enabled indexers; set \"enabled\": \"true\" in a site section of the config");
    }
    Ok(aggregate)
}

fn parse_params(params: &[String]) -> Result<Query> {
    let mut pairs = Vec::new();
    let mut words = Vec::new();
    for param in params {
        match param.split_once('=') {
            Some((name, value)) => pairs.push((name.to_string(), value.to_string())),
            None => words.push(param.as_str()),
        }
    }
    if !words.is_empty() {
        pairs.push(("q".to_string(), words.join(" ")));
    }
    Ok(Query::parse(pairs)?)
}

async fn run_query(args: QueryArgs, opts: RunnerOpts) -> Result<()> {
    let query = parse_params(&args.params)?;
    let mut indexer = open_indexer(&args.key, &opts)?;
    let feed = indexer.search(&query).await?;

    match args.format {
        OutputFormat::Xml => println!("{}", feed.to_xml()),
        OutputFormat::Json => println!("{}", feed.to_json()),
        OutputFormat::Text => {
            println!("\n{} results from {}:\n", feed.len(), feed.info.title);
            for (i, item) in feed.items.iter().enumerate() {
                println!("{}. {}", i + 1, item.title);
                println!("   Link: {}", item.link);
                let date = item
                    .publish_date
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let size = item
                    .size
                    .map(|s| format!("{:.1} MiB", s as f64 / 1024.0 / 1024.0))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "   {} | {} | seeders {} | site {}",
                    date,
                    size,
                    item.seeders.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string()),
                    item.site
                );
                println!();
            }
        }
    }
    Ok(())
}

async fn run_download(args: DownloadArgs, opts: RunnerOpts) -> Result<()> {
    let mut indexer = open_indexer(&args.key, &opts)?;
    let download = indexer.download(&args.url).await?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &download.body)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Wrote {} bytes to {}", download.len(), path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&download.body)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

async fn run_test(args: TestArgs, opts: RunnerOpts) -> Result<()> {
    let definition = if is_definition_file(&args.definition) {
        load_definition_file(Path::new(&args.definition))
            .with_context(|| format!("Failed to load {}", args.definition))?
    } else {
        default_loader()?
            .load(&args.definition)
            .with_context(|| format!("Failed to load definition '{}'", args.definition))?
    };

    let mode = match (args.save, args.replay) {
        (Some(path), _) => TestMode::Save(path),
        (None, Some(path)) => TestMode::Replay(path),
        (None, None) => TestMode::Live,
    };
    let opts = if args.cachepages {
        opts.with_page_cache(None)
    } else {
        opts
    };

    let tester = Tester::new(
        Arc::new(definition),
        TesterOpts::new(mode, opts).with_download(args.download),
    );
    let report = tester.run().await?;
    println!("{}", report);

    if !report.passed() {
        anyhow::bail!("{} test case(s) failed", report.failures().count().max(1));
    }
    Ok(())
}

fn is_definition_file(arg: &str) -> bool {
    let path = Path::new(arg);
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    ) || path.is_file()
}

async fn run_ratios(opts: RunnerOpts) -> Result<()> {
    let loader = default_loader()?;
    let mut aggregate = open_aggregate(&loader, &opts)?;

    let mut failed = 0;
    for (key, result) in aggregate.ratios().await {
        match result {
            Ok(ratio) => println!("{}\t{:.3}", key, ratio),
            Err(e) => {
                failed += 1;
                println!("{}\terror: {}", key, e);
            }
        }
    }
    if failed > 0 {
        anyhow::bail!("{} indexer(s) failed", failed);
    }
    Ok(())
}

fn list_definitions(opts: &RunnerOpts) -> Result<()> {
    let loader = default_loader()?;
    let enabled = list_enabled(&loader, opts.config.as_ref())?;

    println!("Known definitions:\n");
    for key in loader.list()? {
        let mark = if enabled.contains(&key) { "*" } else { " " };
        match loader.load(&key) {
            Ok(def) => println!("  {} {:<20} {}", mark, key, def.display_name()),
            Err(e) => println!("  {} {:<20} (invalid: {})", mark, key, e),
        }
    }
    println!();
    println!("* enabled. Usage: tracker-proxy query demo q=ubuntu");
    Ok(())
}
