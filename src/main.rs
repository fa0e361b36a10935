//! redup: duplicate filter for line streams.
//!
//! Reads newline-delimited values from stdin, checks each against a Redis-backed
//! repository and emits NDJSON check records (or only unseen lines) to stdout.

use anyhow::Context;
use axum::routing::get;
use clap::{Parser, Subcommand};
use redup::event::CheckRecord;
use redup::{Config, DedupError, Deduplicator, metrics};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "redup")]
#[command(author, version, about = "Redis-backed duplicate detection for line streams")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check every stdin line until EOF or a shutdown signal
    Run {
        /// Config file path (store, strategy, fingerprint)
        #[arg(short, long, default_value = "redup.yaml", value_name = "PATH")]
        config: PathBuf,

        /// Parse each line as JSON; the parsed value is what gets fingerprinted
        #[arg(long)]
        json: bool,

        /// Echo unseen lines verbatim instead of writing check records
        #[arg(long)]
        drop_duplicates: bool,
    },

    /// Check the given values once
    Check {
        #[arg(short, long, default_value = "redup.yaml", value_name = "PATH")]
        config: PathBuf,

        #[arg(required = true, value_name = "VALUE")]
        values: Vec<String>,
    },

    /// Evict values so their next check is unseen (cuckoo strategy only)
    Forget {
        #[arg(short, long, default_value = "redup.yaml", value_name = "PATH")]
        config: PathBuf,

        #[arg(required = true, value_name = "VALUE")]
        values: Vec<String>,
    },

    /// Validate configuration file
    Validate {
        #[arg(short, long, default_value = "redup.yaml", value_name = "PATH")]
        config: PathBuf,
    },
}

impl Commands {
    fn config_path(&self) -> &Path {
        match self {
            Commands::Run { config, .. }
            | Commands::Check { config, .. }
            | Commands::Forget { config, .. }
            | Commands::Validate { config } => config,
        }
    }
}

/// Ignore SIGPIPE so writes to a closed stdout return EPIPE instead of killing the process.
#[cfg(unix)]
fn ignore_sigpipe() {
    unsafe {
        let _ = nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        );
    }
}
#[cfg(not(unix))]
fn ignore_sigpipe() {}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    ignore_sigpipe();

    if let Commands::Validate { config } = &cli.command {
        init_logging(None, &cli);
        run_validate(config);
    }

    let config = Config::load(cli.command.config_path())?;
    init_logging(Some(&config), &cli);
    serve_metrics(&config).await?;

    let dedup = Deduplicator::from_config(&config)
        .await
        .context("build deduplicator")?;
    tracing::info!(
        strategy = dedup.strategy(),
        timeout_ms = dedup.timeout().as_millis() as u64,
        "deduplicator ready"
    );

    match &cli.command {
        Commands::Run {
            json,
            drop_duplicates,
            ..
        } => run_stream(&dedup, *json, *drop_duplicates).await,
        Commands::Check { values, .. } => run_check(&dedup, values).await,
        Commands::Forget { values, .. } => run_forget(&dedup, values).await,
        Commands::Validate { .. } => Ok(()),
    }
}

/// Init tracing from config (log_format, log_level) or env. REDUP_LOG_FORMAT / RUST_LOG_JSON
/// and REDUP_LOG_LEVEL override the config; -q and -v override both.
fn init_logging(config: Option<&Config>, cli: &Cli) {
    let use_json = match config.and_then(|c| c.global.log_format.as_deref()) {
        Some("json") => true,
        _ => {
            std::env::var("REDUP_LOG_FORMAT").as_deref() == Ok("json")
                || std::env::var("RUST_LOG_JSON").as_deref() == Ok("1")
        }
    };
    let filter = if cli.quiet {
        EnvFilter::new("error")
    } else if cli.verbose {
        EnvFilter::new("redup=debug")
    } else {
        let env_level = std::env::var("REDUP_LOG_LEVEL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        match (env_level, config) {
            (Some(level), _) => EnvFilter::new(format!("redup={level}")),
            (None, Some(c)) => EnvFilter::new(format!("redup={}", c.global.log_level)),
            (None, None) => {
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("redup=info"))
            }
        }
    };
    if use_json {
        let json_fmt = tracing_subscriber::fmt::format()
            .json()
            .with_current_span(true)
            .with_span_list(false);
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(false)
                    .event_format(json_fmt),
            )
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(filter)
            .init();
    }
}

fn run_validate(config_path: &Path) -> ! {
    match Config::load(config_path) {
        Ok(c) => {
            tracing::info!(strategy = c.strategy.name(), "config valid");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!("config invalid: {}", e);
            std::process::exit(1);
        }
    }
}

/// Init metrics and serve GET /metrics when enabled.
async fn serve_metrics(config: &Config) -> anyhow::Result<()> {
    let Some(metrics_cfg) = config.global.metrics.as_ref().filter(|m| m.enabled) else {
        return Ok(());
    };
    if let Err(e) = metrics::init() {
        tracing::warn!("metrics init failed: {}", e);
        return Ok(());
    }
    let addr: SocketAddr = format!("{}:{}", metrics_cfg.address, metrics_cfg.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("metrics address invalid: {}", e))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener {addr}"))?;
    tracing::info!(%addr, "metrics server listening on GET /metrics");
    tokio::spawn(async move {
        let app = axum::Router::new().route(
            "/metrics",
            get(|| async {
                (
                    [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                    metrics::encode(),
                )
            }),
        );
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("metrics server error: {}", e);
        }
    });
    Ok(())
}

/// Interpret one input line: raw string, or parsed JSON with `--json`.
fn parse_value(line: &str, json: bool) -> Result<serde_json::Value, DedupError> {
    if json {
        serde_json::from_str(line)
            .map_err(|e| DedupError::Serialization(format!("invalid json line: {e}")))
    } else {
        Ok(serde_json::Value::String(line.to_string()))
    }
}

/// Write one line to stdout. Returns false once the reader has gone away.
fn emit(out: &mut impl Write, line: &str) -> anyhow::Result<bool> {
    match writeln!(out, "{line}").and_then(|_| out.flush()) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(false),
        Err(e) => Err(e).context("write stdout"),
    }
}

#[derive(Default)]
struct StreamStats {
    checked: u64,
    duplicates: u64,
    errors: u64,
}

async fn run_stream(dedup: &Deduplicator, json: bool, drop_duplicates: bool) -> anyhow::Result<()> {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut out = std::io::stdout();
    let mut stats = StreamStats::default();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received, stopping");
                break;
            }
        };
        let Some(line) = line else { break };
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }

        let (value, outcome) = match parse_value(line, json) {
            Ok(value) => {
                let outcome = dedup.is_duplicate(&value).await;
                (value, outcome)
            }
            Err(e) => (serde_json::Value::String(line.to_string()), Err(e)),
        };
        stats.checked += 1;
        match &outcome {
            Ok(true) => stats.duplicates += 1,
            Ok(false) => {}
            Err(e) => {
                stats.errors += 1;
                tracing::warn!(error = %e, kind = e.kind(), "check failed");
            }
        }

        let keep_going = if drop_duplicates {
            // Unknown outcomes pass through; dropping them would lose data on a store outage.
            match outcome {
                Ok(true) => true,
                _ => emit(&mut out, line)?,
            }
        } else {
            let record = CheckRecord::new(value).with_outcome(&outcome);
            emit(&mut out, &record.to_ndjson_line()?)?
        };
        if !keep_going {
            tracing::info!("stdout closed, stopping");
            break;
        }
    }

    tracing::info!(
        checked = stats.checked,
        duplicates = stats.duplicates,
        errors = stats.errors,
        "stream finished"
    );
    Ok(())
}

async fn run_check(dedup: &Deduplicator, values: &[String]) -> anyhow::Result<()> {
    let mut out = std::io::stdout();
    let mut failed = 0usize;
    for value in values {
        let outcome = dedup.is_duplicate(value).await;
        if outcome.is_err() {
            failed += 1;
        }
        let record =
            CheckRecord::new(serde_json::Value::String(value.clone())).with_outcome(&outcome);
        emit(&mut out, &record.to_ndjson_line()?)?;
    }
    if failed > 0 {
        anyhow::bail!("{} of {} checks failed", failed, values.len());
    }
    Ok(())
}

async fn run_forget(dedup: &Deduplicator, values: &[String]) -> anyhow::Result<()> {
    let mut out = std::io::stdout();
    let mut failed = 0usize;
    for value in values {
        let outcome = dedup.forget(value).await;
        if outcome.is_err() {
            failed += 1;
        }
        let record =
            CheckRecord::new(serde_json::Value::String(value.clone())).with_forget_outcome(&outcome);
        emit(&mut out, &record.to_ndjson_line()?)?;
    }
    if failed > 0 {
        anyhow::bail!("{} of {} evictions failed", failed, values.len());
    }
    Ok(())
}

/// Future that completes when SIGINT (Ctrl+C) or SIGTERM is received. A handler that
/// cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_lines_are_strings() {
        assert_eq!(
            parse_value("{\"a\":1}", false).unwrap(),
            serde_json::json!("{\"a\":1}")
        );
    }

    #[test]
    fn json_lines_are_parsed() {
        assert_eq!(
            parse_value("{\"a\":1}", true).unwrap(),
            serde_json::json!({"a": 1})
        );
        assert_eq!(parse_value("{oops", true).unwrap_err().kind(), "serialization");
    }

    #[test]
    fn emit_appends_newline() {
        let mut buf = Vec::new();
        assert!(emit(&mut buf, "x").unwrap());
        assert_eq!(buf, b"x\n");
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli =
            Cli::try_parse_from(["redup", "-q", "run", "--json", "--drop-duplicates"]).unwrap();
        assert!(cli.quiet);
        match cli.command {
            Commands::Run {
                config,
                json,
                drop_duplicates,
            } => {
                assert_eq!(config, PathBuf::from("redup.yaml"));
                assert!(json && drop_duplicates);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn check_requires_values() {
        assert!(Cli::try_parse_from(["redup", "check"]).is_err());
        let cli = Cli::try_parse_from(["redup", "check", "-c", "x.yaml", "a", "b"]).unwrap();
        assert_eq!(cli.command.config_path(), Path::new("x.yaml"));
    }
}
