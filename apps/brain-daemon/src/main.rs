use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dialogue::RuleTable;
use orchestrator::{BrainConfig, Orchestrator};
use robot_link::LinkConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

mod interaction_log;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Backend {
    /// In-process robot that logs commands
    Mock,
}

#[derive(Parser)]
#[command(name = "brain-daemon")]
#[command(about = "Conversation daemon: reads NLP events as JSON lines on stdin and drives the robot")]
struct Args {
    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// YAML rule table, overrides `rules_path` from the config
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Robot backend
    #[arg(long, value_enum, default_value = "mock")]
    backend: Backend,

    /// Log filter, e.g. `info` or `orchestrator=debug`; defaults to RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Append the conversation transcript to this file
    #[arg(long)]
    interaction_log: Option<PathBuf>,

    /// Simulated execution time of each mock step
    #[arg(long, default_value = "0")]
    mock_latency_ms: u64,

    /// Session id for input records that carry none
    #[arg(long, default_value = "default")]
    session: String,

    /// Validate configuration and rule table, then exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_tracing(args.log_level.as_deref());

    let config = load_config(&args)?;
    let rules = load_rules(&args, &config)?;
    info!(rules = rules.len(), "rule table validated");

    if args.check {
        println!("configuration ok, {} rules", rules.len());
        return Ok(());
    }

    let connector: Arc<dyn LinkConnector> = match args.backend {
        Backend::Mock => Arc::new(robot_link::MockConnector::new(Duration::from_millis(
            args.mock_latency_ms,
        ))),
    };
    let orchestrator = Arc::new(
        Orchestrator::new(&config, Arc::new(rules), connector)
            .context("starting orchestrator")?,
    );
    let mut exits = orchestrator
        .take_exits()
        .context("session exit channel already taken")?;

    if let Some(path) = args.interaction_log.clone() {
        let events = orchestrator.subscribe();
        tokio::spawn(async move {
            if let Err(e) = interaction_log::run(&path, events).await {
                error!(path = %path.display(), error = %e, "interaction log stopped");
            }
        });
    }

    let sweeper = {
        let orchestrator = orchestrator.clone();
        let period = config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                orchestrator.sweep_idle();
            }
        })
    };

    let reader = tokio::spawn(read_input(orchestrator.clone(), args.session.clone()));

    info!(backend = ?args.backend, "brain-daemon serving");
    let fatal = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break None;
            }
            Some(exit) = exits.recv() => match exit.result {
                Ok(()) => debug!(session_id = %exit.session_id, "session closed"),
                Err(e) => {
                    error!(session_id = %exit.session_id, error = %e, "session ended fatally");
                    break Some(e);
                }
            },
        }
    };

    reader.abort();
    sweeper.abort();
    orchestrator.shutdown().await;
    print!("{}", orchestrator.metrics().encode_text());

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn load_config(args: &Args) -> Result<BrainConfig> {
    let mut config = match &args.config {
        Some(path) => BrainConfig::load(path)?,
        None => BrainConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn load_rules(args: &Args, config: &BrainConfig) -> Result<RuleTable> {
    let path = args.rules.as_ref().or(config.rules_path.as_ref());
    let rules = match path {
        Some(path) => RuleTable::load_yaml(path)
            .with_context(|| format!("refusing to serve with rule table {}", path.display()))?,
        None => RuleTable::builtin().context("built-in rule table")?,
    };
    Ok(rules)
}

/// Feed JSON-lines records from stdin to the orchestrator in arrival order.
async fn read_input(orchestrator: Arc<Orchestrator>, default_session: String) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_no = 0u64;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "reading input failed");
                break;
            }
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match intent_events::normalize_json(&line) {
            Ok((session_id, utterance)) => {
                let session_id = session_id.unwrap_or_else(|| default_session.clone());
                debug!(%session_id, utterance_id = %utterance.id(), intent = utterance.intent(), "input accepted");
                if let Err(e) = orchestrator.submit(&session_id, utterance).await {
                    error!(%session_id, line = line_no, error = %e, "could not deliver utterance");
                }
            }
            Err(e) => warn!(line = line_no, error = %e, "dropping malformed input"),
        }
    }
    info!("input stream closed");
}

fn setup_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::from_default_env(),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
