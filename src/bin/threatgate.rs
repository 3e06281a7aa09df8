//! ThreatGate CLI binary.
//!
//! Real-time content threat detection.
//!
//! # Commands
//!
//! - `scan` - Classify one piece of content
//! - `batch` - Classify a JSON array or JSON-lines file of items
//! - `serve` - Start the HTTP gateway
//! - `config` - Print, write or validate configuration

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use threatgate::{
    BatchItem, BatchItemResult, BatchMode, BatchOptions, BatchOrchestrator, BatchSubmission,
    Config, DetectOptions, DetectionResult, Metadata, VERSION,
};

#[derive(Parser)]
#[command(name = "threatgate")]
#[command(version = VERSION)]
#[command(about = "ThreatGate - Real-time content threat detection", long_about = None)]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/threatgate/config.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify one piece of content
    Scan {
        /// Content (or - for stdin)
        input: Option<String>,

        /// Input file path
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Metadata as a JSON object
        #[arg(short, long)]
        metadata: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,

        /// Exit with status 1 when content is flagged
        #[arg(long)]
        fail_on_detect: bool,
    },

    /// Classify a batch of items
    Batch {
        /// JSON array or JSON-lines file of `{"content", "metadata"}` items
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start the HTTP gateway
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
    },

    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Output format
        #[arg(long, value_enum, default_value = "toml")]
        format: Format,
    },

    /// Write the default configuration to a file
    Init {
        /// Destination (default: $XDG_CONFIG_HOME/threatgate/config.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Check the configuration and exit
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Toml,
    Json,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    match cli.command {
        Commands::Scan {
            input,
            file,
            metadata,
            json,
            fail_on_detect,
        } => cmd_scan(cli.config, input, file, metadata, json, fail_on_detect),

        Commands::Batch { file, json } => cmd_batch(cli.config, &file, json),

        Commands::Serve { port, host } => cmd_serve(cli.config, port, host),

        Commands::Config { action } => cmd_config(cli.config, action),
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();
    }
}

/// Explicit file, else the default path if it exists, else defaults; then env overrides
fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = path.or_else(|| Config::default_path().filter(|p| p.exists()));
    let config = match path {
        Some(path) => {
            tracing::debug!("Loading config from {}", path.display());
            Config::from_file(path)?
        },
        None => Config::default(),
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn cmd_scan(
    config: Option<PathBuf>,
    input: Option<String>,
    file: Option<PathBuf>,
    metadata: Option<String>,
    json_output: bool,
    fail_on_detect: bool,
) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let content = read_input(input, file)?;
    let metadata: Metadata = match metadata {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("--metadata must be a JSON object: {e}"))?,
        None => Metadata::new(),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let gateway = BatchOrchestrator::new(config)?;
        let result = gateway
            .detect(BatchItem { content, metadata }, DetectOptions::default())
            .await;
        gateway.shutdown().await;
        result
    })?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_verdict(&result);
    }

    if fail_on_detect && result.detected {
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_batch(config: Option<PathBuf>, file: &Path, json_output: bool) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let items = parse_items(&std::fs::read_to_string(file)?)?;
    let count = items.len();

    let runtime = tokio::runtime::Runtime::new()?;
    let submission = runtime.block_on(async {
        let gateway = BatchOrchestrator::new(config)?;
        let options = BatchOptions {
            mode: BatchMode::Sync,
            ..BatchOptions::default()
        };
        let submission = gateway.detect_batch(items, options).await;
        gateway.shutdown().await;
        submission
    })?;

    let BatchSubmission::Sync(outcome) = submission else {
        anyhow::bail!("sync batch returned a job id");
    };

    if json_output {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    let flagged = outcome
        .results
        .iter()
        .filter_map(BatchItemResult::result)
        .filter(|r| r.detected)
        .count();
    println!("Batch: {count} items, {flagged} flagged, status {:?}", outcome.status);
    for (i, item) in outcome.results.iter().enumerate() {
        match item {
            BatchItemResult::Success(result) => println!(
                "  [{i}] {} (confidence: {:.2})",
                if result.detected { "UNSAFE" } else { "SAFE" },
                result.confidence
            ),
            BatchItemResult::Error { code, message } => println!("  [{i}] ERROR {code}: {message}"),
        }
    }
    Ok(())
}

fn cmd_serve(config: Option<PathBuf>, port: Option<u16>, host: Option<String>) -> anyhow::Result<()> {
    let mut config = load_config(config)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    println!("ThreatGate v{VERSION}");
    println!("Listening on http://{}", config.server.listen_addr());
    println!();
    println!("Endpoints:");
    println!("  GET    /health        - Health check");
    println!("  POST   /detect        - Classify one item");
    println!("  POST   /detect/batch  - Classify a batch (sync or async)");
    println!("  GET    /batch/:id     - Async batch status");
    println!("  DELETE /batch/:id     - Cancel an async batch");
    println!("  GET    /stats         - Gateway statistics");
    println!();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let gateway = BatchOrchestrator::new(config)?;
        threatgate::server::serve(gateway).await
    })?;
    Ok(())
}

fn cmd_config(config: Option<PathBuf>, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show { format } => {
            let config = load_config(config)?;
            match format {
                Format::Toml => println!("{}", toml::to_string_pretty(&config)?),
                Format::Json => println!("{}", serde_json::to_string_pretty(&config)?),
            }
        },
        ConfigAction::Init { path, force } => {
            let path = path
                .or_else(Config::default_path)
                .ok_or_else(|| anyhow::anyhow!("no config directory; pass a path"))?;
            if path.exists() && !force {
                anyhow::bail!("{} exists (use --force to overwrite)", path.display());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, toml::to_string_pretty(&Config::default())?)?;
            println!("Wrote {}", path.display());
        },
        ConfigAction::Validate => {
            load_config(config)?;
            println!("Configuration OK");
        },
    }
    Ok(())
}

fn print_verdict(result: &DetectionResult) {
    let verdict = if result.detected { "UNSAFE" } else { "SAFE" };
    println!("{verdict} (confidence: {:.2}, {:.1}ms)", result.confidence, result.latency_ms);

    if !result.categories.is_empty() {
        let categories: Vec<&str> = result.categories.iter().map(String::as_str).collect();
        println!("Categories: {}", categories.join(", "));
    }
    if result.incomplete {
        println!("Incomplete verdict:");
        for id in &result.timed_out_detectors {
            println!("  - {id}: timed out");
        }
        for id in &result.unavailable_detectors {
            println!("  - {id}: unavailable");
        }
    }

    println!();
    println!("Votes:");
    for vote in &result.votes {
        println!(
            "  {:<12} confidence {:.2}  weight {:.2}{}",
            vote.detector_id,
            vote.confidence,
            vote.weight,
            vote.category
                .as_deref()
                .map(|c| format!("  [{c}]"))
                .unwrap_or_default()
        );
        for evidence in &vote.evidence {
            println!("    {evidence}");
        }
    }
}

/// A JSON array of items, else one item (or bare string) per line
fn parse_items(raw: &str) -> anyhow::Result<Vec<BatchItem>> {
    if let Ok(items) = serde_json::from_str::<Vec<BatchItem>>(raw) {
        return Ok(items);
    }
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str::<BatchItem>(line)
                .or_else(|_| serde_json::from_str::<String>(line).map(BatchItem::new))
                .map_err(|e| anyhow::anyhow!("line {}: {e}", i + 1))
        })
        .collect()
}

fn read_input(input: Option<String>, file: Option<PathBuf>) -> anyhow::Result<String> {
    if let Some(path) = file {
        Ok(std::fs::read_to_string(path)?)
    } else if let Some(s) = input {
        if s == "-" {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        } else {
            Ok(s)
        }
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        Ok(buffer)
    }
}
