//! Terminal chat client over a resilient chat link.
//!
//! Usage:
//!   chatlink -c /etc/chatlink/chatlink.conf
//!   chatlink -c chatlink.conf --stderr --token $TOKEN   # log to stderr
//!
//! Every stdin line is sent as one message; completed replies are printed.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use chatlink::config;
use chatlink::{ChatLink, DeliveryReport, MessageEvent};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "chatlink", about = "Resilient streaming chat client")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/chatlink/chatlink.conf")]
    config: PathBuf,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,

    /// Auth token; overrides `auth_token`/`token_file` from the config.
    #[arg(long)]
    token: Option<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut cfg = match config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("chatlink: config error: {e}");
            process::exit(1);
        }
    };
    if let Some(token) = cli.token {
        cfg.auth_token = token;
    }
    if let Err(e) = config::validate_config(&cfg) {
        eprintln!("chatlink: config validation: {e}");
        process::exit(1);
    }

    let use_syslog = cfg.log_syslog && !cli.stderr;
    if let Err(e) = setup_logging(use_syslog) {
        eprintln!("chatlink: {e}");
        process::exit(1);
    }

    // Install the post-quantum TLS provider (must happen before any TLS use).
    if rustls_post_quantum::provider().install_default().is_err() {
        error!("a TLS crypto provider was already installed");
    }

    if let Err(e) = run(cfg).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(cfg: config::LinkConfig) -> anyhow::Result<()> {
    // Long enough for a message to use up its whole retry budget.
    let drain_timeout = cfg.ack_timeout * cfg.message_retry_budget + cfg.open_timeout;
    info!("chatlink starting ({})", cfg.stream_url.as_deref().unwrap_or_default());
    let link = ChatLink::from_config(cfg)?;

    link.on_status(|s| eprintln!("[{s}]"));
    link.on_message(|ev| match ev {
        MessageEvent::Complete(m)              => println!("{}", m.content),
        MessageEvent::Failed { stream_id, error } => eprintln!("! reply {stream_id} lost: {error}"),
    });
    link.on_delivery(|r| {
        if let DeliveryReport::Failed { id, error } = r {
            eprintln!("! message {id} not delivered: {error}");
        }
    });
    link.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupted = loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(text) if text.trim().is_empty() => continue,
                Some(text) => { link.submit(text); }
                None       => break false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break true;
            }
        }
    };

    if !interrupted && !link.wait_idle(drain_timeout).await {
        warn!("undelivered messages after {drain_timeout:?}, closing anyway");
    }

    link.shutdown().await?;
    info!("chatlink stopped");
    Ok(())
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_USER,
            hostname: None,
            process:  "chatlink".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .init();
    }
    Ok(())
}
