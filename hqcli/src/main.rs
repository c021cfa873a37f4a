use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use libhandle_storm::{
    CheckOutcome, CheckStore, Engine, EngineStats, ProbeConfig, RunSummary, SqliteStore,
    MAX_LENGTH, MIN_LENGTH, SEPARATOR,
};
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CREDENTIAL_ENV: &str = "HQ_CREDENTIAL";

#[derive(Debug, Error)]
enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Could not determine a data directory, set data_dir in the config")]
    NoDataDir,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    /// Holds the check database and the adaptive state.
    data_dir: Option<PathBuf>,
    probe: ProbeConfig,
}

impl Config {
    fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        self.data_dir
            .clone()
            .or_else(|| dirs::data_dir().map(|p| p.join("hq")))
            .ok_or(ConfigError::NoDataDir)
    }
}

fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hq").join("config.toml"))
}

/// An explicit path must exist; the default path is optional.
fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match config_path() {
            Some(path) => (path, false),
            None => return Ok(Config::default()),
        },
    };

    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if !required && e.kind() == io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
}

/// `HQ_CREDENTIAL` followed by `HQ_CREDENTIAL1` through `HQ_CREDENTIAL9`.
fn env_credentials<I>(vars: I) -> Vec<String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut numbered: Vec<(u32, String)> = vars
        .into_iter()
        .filter_map(|(key, value)| {
            let suffix = key.strip_prefix(CREDENTIAL_ENV)?;
            let order = if suffix.is_empty() {
                0
            } else {
                match suffix.parse::<u32>() {
                    Ok(n @ 1..=9) => n,
                    _ => return None,
                }
            };
            let value = value.trim();
            (!value.is_empty()).then(|| (order, value.to_string()))
        })
        .collect();
    numbered.sort_by_key(|(order, _)| *order);
    numbered.into_iter().map(|(_, secret)| secret).collect()
}

fn get_default_config_toml() -> String {
    r#"# Handle Query (hq) Configuration
#
# Keep credentials out of this file. Export HQ_CREDENTIAL, or
# HQ_CREDENTIAL1 through HQ_CREDENTIAL9 for a rotating pool.

# Where checks.db and adaptive_state.json live (default: platform data dir + /hq)
# data_dir = "/var/lib/hq"

[probe]
timeout = 8.0
cache_ttl = 60.0
batch_pause_min = 0.25
batch_pause_max = 0.75
adapt_every_batches = 5
# Records older than this (seconds) are removed when `hq run` starts
retention = 2592000.0

[probe.upstream]
credential_header = "Cookie"
credential_format = ".ROBLOSECURITY={token}"
available_code = 0

[[probe.upstream.endpoints]]
name = "auth-v1"
url_template = "https://auth.roblox.com/v1/usernames/validate?request.username={name}&request.birthday=2000-01-01"

[probe.credentials]
error_threshold = 5
cooldown = 300.0

[probe.router]
initial_delay = 0.5
max_delay = 5.0
min_delay = 0.2
failure_threshold = 5

[probe.controller]
min_concurrency = 5
max_concurrency = 30
learning_rate = 0.1

[probe.store]
# Definitive results are not re-checked for this long (seconds)
cooldown = 259200.0
# Failed checks may be retried after this long
error_retry = 600.0
"#
    .to_string()
}

#[derive(Parser, Debug)]
#[command(name = "hq")]
#[command(about = "Handle Query - self-tuning username availability search", long_about = None)]
struct Args {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print the default config to stdout and exit
    #[arg(long)]
    print_default_config: bool,

    /// Write the default config to the config path and exit
    #[arg(long)]
    write_default_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate and check candidates until interrupted (NDJSON on stdout)
    Run {
        /// Shortest name to generate
        #[arg(long)]
        min_length: Option<usize>,

        /// Longest name to generate
        #[arg(long)]
        max_length: Option<usize>,

        /// Print taken names and errors too, not only available ones
        #[arg(long, short = 'a')]
        all: bool,
    },
    /// Check specific names
    Check {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// List names recently found available
    Recent {
        #[arg(long, short = 'n', default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
enum OutcomeStatus {
    Available,
    Taken,
    Error,
}

#[derive(Debug, Serialize)]
struct OutcomeLine<'a> {
    name: &'a str,
    status: OutcomeStatus,
    available: bool,
    length: usize,
    has_separator: bool,
    has_digit: bool,
    status_code: u16,
    message: &'a str,
    checked_at: String,
}

impl<'a> From<&'a CheckOutcome> for OutcomeLine<'a> {
    fn from(outcome: &'a CheckOutcome) -> Self {
        let status = if outcome.is_error {
            OutcomeStatus::Error
        } else if outcome.is_available {
            OutcomeStatus::Available
        } else {
            OutcomeStatus::Taken
        };
        Self {
            name: &outcome.candidate,
            status,
            available: outcome.is_available,
            length: outcome.candidate.chars().count(),
            has_separator: outcome.candidate.contains(SEPARATOR),
            has_digit: outcome.candidate.chars().any(|c| c.is_ascii_digit()),
            status_code: outcome.status_code,
            message: &outcome.message,
            checked_at: outcome.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
struct FinalReport {
    summary: RunSummary,
    stats: EngineStats,
}

fn print_outcome(outcome: &CheckOutcome) -> io::Result<()> {
    let json = serde_json::to_string(&OutcomeLine::from(outcome))?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", json)?;
    stdout.flush()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.print_default_config {
        println!("{}", get_default_config_toml());
        return Ok(());
    }

    if args.write_default_config {
        let path = match args.config.clone().or_else(config_path) {
            Some(path) => path,
            None => {
                eprintln!("Error: Could not determine config path");
                std::process::exit(1);
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, get_default_config_toml())?;
        println!("Default config written to: {}", path.display());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let mut config = load_config(args.config.as_deref())?;
    config
        .probe
        .credentials
        .secrets
        .extend(env_credentials(std::env::vars()));

    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;
    if config.probe.controller.state_path.is_none() {
        config.probe.controller.state_path = Some(data_dir.join("adaptive_state.json"));
    }

    let command = args.command.unwrap_or(Command::Run {
        min_length: None,
        max_length: None,
        all: false,
    });

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let store = Arc::new(SqliteStore::open(&data_dir.join("checks.db"), config.probe.store).await?);
        let engine = Arc::new(Engine::new(
            config.probe,
            Arc::clone(&store) as Arc<dyn CheckStore>,
        )?);

        let result = match command {
            Command::Run {
                min_length,
                max_length,
                all,
            } => run(Arc::clone(&engine), min_length, max_length, all).await,
            Command::Check { names } => check(&engine, names).await,
            Command::Recent { limit } => recent(&engine, limit).await,
        };

        store.close().await;
        result
    })
}

async fn run(
    engine: Arc<Engine>,
    min_length: Option<usize>,
    max_length: Option<usize>,
    show_all: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if min_length.is_some() || max_length.is_some() {
        engine.set_length_override(Some((
            min_length.unwrap_or(MIN_LENGTH),
            max_length.unwrap_or(MAX_LENGTH),
        )))?;
    }

    if let Err(e) = engine.cleanup().await {
        warn!("Cleanup of old records failed: {}", e);
    }

    let shutdown = CancellationToken::new();
    let interrupt = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, finishing the current batch");
                shutdown.cancel();
            }
        })
    };

    let (tx, mut rx) = mpsc::channel(256);
    let runner = {
        let engine = Arc::clone(&engine);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { engine.run(shutdown, tx).await })
    };

    while let Some(outcome) = rx.recv().await {
        if outcome.is_available || show_all {
            if let Err(e) = print_outcome(&outcome) {
                warn!("Stdout closed ({}), stopping", e);
                shutdown.cancel();
                break;
            }
        }
    }
    drop(rx);

    let summary = runner.await?;
    interrupt.abort();

    let report = FinalReport {
        summary,
        stats: engine.stats(),
    };
    eprintln!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn check(engine: &Engine, names: Vec<String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut outcomes = stream::iter(names)
        .map(|name| async move { engine.check_single(name.trim()).await })
        .buffered(4);

    while let Some(outcome) = outcomes.next().await {
        print_outcome(&outcome)?;
    }
    Ok(())
}

async fn recent(engine: &Engine, limit: usize) -> Result<(), Box<dyn std::error::Error>> {
    for outcome in engine.recently_available(limit).await? {
        print_outcome(&outcome)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_parses_to_defaults() {
        let config: Config = toml::from_str(&get_default_config_toml()).unwrap();
        let defaults = ProbeConfig::default();
        assert!(config.data_dir.is_none());
        assert_eq!(config.probe.timeout, defaults.timeout);
        assert_eq!(config.probe.retention, defaults.retention);
        assert_eq!(config.probe.upstream.endpoints, defaults.upstream.endpoints);
        assert_eq!(config.probe.store.cooldown, defaults.store.cooldown);
        assert!(config.probe.credentials.secrets.is_empty());
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/tmp/hq"
            [probe.controller]
            max_concurrency = 12
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir.as_deref(), Some(Path::new("/tmp/hq")));
        assert_eq!(config.probe.controller.max_concurrency, 12);
        assert_eq!(config.probe.controller.min_concurrency, 5);
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let err = load_config(Some(Path::new("/nonexistent/hq/config.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn credentials_come_from_numbered_env_vars_in_order() {
        let vars = [
            ("HQ_CREDENTIAL2", "second"),
            ("PATH", "/usr/bin"),
            ("HQ_CREDENTIAL", "base"),
            ("HQ_CREDENTIAL1", " first "),
            ("HQ_CREDENTIAL10", "ignored"),
            ("HQ_CREDENTIAL3", "  "),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()));

        assert_eq!(env_credentials(vars), vec!["base", "first", "second"]);
    }

    #[test]
    fn outcome_line_carries_name_features() {
        let outcome = CheckOutcome::available("ab_4", "Username is valid");
        let line = serde_json::to_value(OutcomeLine::from(&outcome)).unwrap();
        assert_eq!(line["name"], "ab_4");
        assert_eq!(line["status"], "available");
        assert_eq!(line["length"], 4);
        assert_eq!(line["has_separator"], true);
        assert_eq!(line["has_digit"], true);

        let failed = CheckOutcome::error("abcd", 429, "Rate limited");
        let line = serde_json::to_value(OutcomeLine::from(&failed)).unwrap();
        assert_eq!(line["status"], "error");
        assert_eq!(line["status_code"], 429);
    }
}
