//! Zentinel WS-Security command line tool.
//!
//! Run with: `zentinel-wss --config config.yaml secure request.xml`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use zentinel_wss::{fault_response, EngineStats, FaultCode, WssConfig, WssEngine, WssError};

/// Secure or verify SOAP messages with WS-Security.
///
/// Each input file is processed independently; a JSON report per file is
/// printed to stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply the configured actions to outbound messages
    Secure {
        /// SOAP message files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Verify inbound messages and evaluate the policy
    Verify {
        /// SOAP message files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Serialize)]
struct Report {
    file: PathBuf,
    #[serde(flatten)]
    outcome: Outcome,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Outcome {
    Secured(zentinel_wss::SecuredMessage),
    Verified(zentinel_wss::VerifiedMessage),
    Rejected { fault_code: FaultCode, error: String, fault: String },
}

impl Outcome {
    fn is_success(&self) -> bool {
        match self {
            Self::Secured(_) => true,
            Self::Verified(message) => message.accepted,
            Self::Rejected { .. } => false,
        }
    }
}

fn rejected(request: &str, e: WssError) -> Outcome {
    let code = e.fault_code();
    let message = e.to_string();
    Outcome::Rejected {
        fault_code: code,
        fault: fault_response(request, code, &message),
        error: message,
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting Zentinel WS-Security v{}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());

    // Load configuration
    let config = if args.config.exists() {
        let content = tokio::fs::read_to_string(&args.config)
            .await
            .context("Failed to read config file")?;
        WssConfig::from_yaml(&content).context("Failed to parse config file")?
    } else {
        info!("Config file not found, using defaults");
        WssConfig::default()
    };

    info!(
        actions = ?config.settings.actions,
        tokens = config.tokens.len(),
        policy = config.policy.is_some(),
        "Configuration loaded"
    );

    let engine = Arc::new(WssEngine::from_config(config).context("Invalid configuration")?);
    let (files, secure) = match args.command {
        Command::Secure { files } => (files, true),
        Command::Verify { files } => (files, false),
    };

    // One blocking worker per message; chains are never shared
    let mut jobs = Vec::with_capacity(files.len());
    for file in files {
        let request = tokio::fs::read_to_string(&file)
            .await
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let engine = Arc::clone(&engine);
        jobs.push(tokio::task::spawn_blocking(move || {
            let outcome = if secure {
                engine.secure(&request).map(Outcome::Secured)
            } else {
                engine.verify(&request).map(Outcome::Verified)
            };
            let outcome = outcome.unwrap_or_else(|e| rejected(&request, e));
            Report { file, outcome }
        }));
    }

    let mut failures = 0usize;
    for job in jobs {
        let report = job.await.context("Worker panicked")?;
        if !report.outcome.is_success() {
            error!(file = %report.file.display(), "Message rejected");
            failures += 1;
        }
        println!("{}", serde_json::to_string_pretty(&report).context("Failed to encode report")?);
    }

    let stats: EngineStats = engine.stats();
    info!(secured = stats.secured, verified = stats.verified, rejected = stats.rejected, "Done");

    Ok(if failures == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
