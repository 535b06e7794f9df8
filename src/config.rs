//! Chat link configuration.
//!
//! Parsed from a simple `key = value` file (one option per line, `#` starts a
//! comment).  Every option has a compiled-in default; unknown keys are ignored
//! and unparsable values keep the default.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

use crate::error::{ChatError, Result};

// Default constants (milliseconds unless noted)
const HEARTBEAT_INTERVAL:     u64 = 15_000;
const HEARTBEAT_TIMEOUT:      u64 = 45_000;
const BACKOFF_BASE:           u64 = 500;
const BACKOFF_MULTIPLIER:     f64 = 2.0;
const BACKOFF_MAX:            u64 = 30_000;
const BACKOFF_JITTER:         u64 = 250;
const MAX_STREAMING_ATTEMPTS: u32 = 5;
const MAX_POLLING_ATTEMPTS:   u32 = 5;
const PROBE_COOLDOWN:         u64 = 60_000;
const POLL_INTERVAL:          u64 = 2_000;
const MAX_FRAGMENTS:          usize = 4096;
const MAX_STREAM_BYTES:       usize = 1024 * 1024;
const GAP_TIMEOUT:            u64 = 5_000;
const MESSAGE_RETRY_BUDGET:   u32 = 3;
const MESSAGE_RETRY_BASE:     u64 = 1_000;
const ACK_TIMEOUT:            u64 = 10_000;
const REQUEST_TIMEOUT:        u64 = 10_000;
const OPEN_TIMEOUT:           u64 = 10_000;

/// Reconnect backoff parameters.
///
/// Delay for attempt `n` (0-based) is
/// `min(max_delay, base_delay * multiplier^n) + jitter` with `jitter` drawn
/// uniformly from `[0, max_jitter]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay:  Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(BACKOFF_BASE),
            multiplier: BACKOFF_MULTIPLIER,
            max_delay:  Duration::from_millis(BACKOFF_MAX),
            max_jitter: Duration::from_millis(BACKOFF_JITTER),
        }
    }
}

/// Full link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    // ── Endpoints (opaque, supplied by the API client) ────────────────────────
    /// WebSocket endpoint for the streaming transport (`ws://` or `wss://`).
    pub stream_url: Option<String>,
    /// HTTP endpoint for the polling fallback (`http://` or `https://`).
    pub poll_url: Option<String>,
    /// Bearer token sent with every connection and request.
    pub auth_token: String,
    /// Extra PEM CA bundle to trust (self-hosted servers).
    pub ca_file: Option<PathBuf>,
    // ── Streaming transport ───────────────────────────────────────────────────
    /// How often the client pings the server.
    pub heartbeat_interval: Duration,
    /// Silence after which the streaming channel is considered dead.
    pub heartbeat_timeout: Duration,
    /// Longest a transport open (handshake or first poll) may take.
    pub open_timeout: Duration,
    // ── Supervisor ────────────────────────────────────────────────────────────
    pub backoff: BackoffConfig,
    /// Consecutive streaming open failures before falling back to polling.
    pub max_streaming_attempts: u32,
    /// Consecutive polling open failures before giving up (`Failed`).
    pub max_polling_attempts: u32,
    /// Time spent in polling mode before probing streaming again.
    pub probe_cooldown: Duration,
    // ── Polling transport ─────────────────────────────────────────────────────
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    // ── Reassembly ────────────────────────────────────────────────────────────
    pub max_fragments_per_stream: usize,
    pub max_stream_bytes: usize,
    pub gap_timeout: Duration,
    // ── Outbound queue ────────────────────────────────────────────────────────
    /// Send attempts per message before it is reported failed.
    pub message_retry_budget: u32,
    pub message_retry_base: Duration,
    /// How long a sent message may wait for its acknowledgement.
    pub ack_timeout: Duration,
    // ── Process ───────────────────────────────────────────────────────────────
    pub log_syslog: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            stream_url:               None,
            poll_url:                 None,
            auth_token:               String::new(),
            ca_file:                  None,
            heartbeat_interval:       Duration::from_millis(HEARTBEAT_INTERVAL),
            heartbeat_timeout:        Duration::from_millis(HEARTBEAT_TIMEOUT),
            open_timeout:             Duration::from_millis(OPEN_TIMEOUT),
            backoff:                  BackoffConfig::default(),
            max_streaming_attempts:   MAX_STREAMING_ATTEMPTS,
            max_polling_attempts:     MAX_POLLING_ATTEMPTS,
            probe_cooldown:           Duration::from_millis(PROBE_COOLDOWN),
            poll_interval:            Duration::from_millis(POLL_INTERVAL),
            request_timeout:          Duration::from_millis(REQUEST_TIMEOUT),
            max_fragments_per_stream: MAX_FRAGMENTS,
            max_stream_bytes:         MAX_STREAM_BYTES,
            gap_timeout:              Duration::from_millis(GAP_TIMEOUT),
            message_retry_budget:     MESSAGE_RETRY_BUDGET,
            message_retry_base:       Duration::from_millis(MESSAGE_RETRY_BASE),
            ack_timeout:              Duration::from_millis(ACK_TIMEOUT),
            log_syslog:               false,
        }
    }
}

fn millis(val: &str, default: u64) -> Duration {
    Duration::from_millis(val.parse().unwrap_or(default))
}

fn flag(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

/// Parse `path` as a `chatlink.conf` key=value configuration file.
pub fn load_config(path: &Path) -> Result<LinkConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| ChatError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_config(&content)
}

/// Parse configuration text.  Relative `token_file` paths are read as-is.
pub fn parse_config(content: &str) -> Result<LinkConfig> {
    let mut cfg = LinkConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, val)) = line.split_once('=') else { continue };
        let key = key.trim().to_ascii_lowercase();
        let val = val.trim();
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "stream_url"               => cfg.stream_url             = Some(val.to_string()),
            "poll_url"                 => cfg.poll_url               = Some(val.to_string()),
            "auth_token"               => cfg.auth_token             = val.to_string(),
            "token_file" => {
                cfg.auth_token = fs::read_to_string(val)
                    .map_err(|e| ChatError::Config(format!("cannot read token_file {val}: {e}")))?
                    .trim()
                    .to_string();
            }
            "ca_file"                  => cfg.ca_file                = Some(PathBuf::from(val)),
            "heartbeat_interval_ms"    => cfg.heartbeat_interval     = millis(val, HEARTBEAT_INTERVAL),
            "heartbeat_timeout_ms"     => cfg.heartbeat_timeout      = millis(val, HEARTBEAT_TIMEOUT),
            "open_timeout_ms"          => cfg.open_timeout           = millis(val, OPEN_TIMEOUT),
            "backoff_base_ms"          => cfg.backoff.base_delay     = millis(val, BACKOFF_BASE),
            "backoff_multiplier"       => cfg.backoff.multiplier     = val.parse().unwrap_or(BACKOFF_MULTIPLIER),
            "backoff_max_ms"           => cfg.backoff.max_delay      = millis(val, BACKOFF_MAX),
            "backoff_jitter_ms"        => cfg.backoff.max_jitter     = millis(val, BACKOFF_JITTER),
            "max_streaming_attempts"   => cfg.max_streaming_attempts = val.parse().unwrap_or(MAX_STREAMING_ATTEMPTS),
            "max_polling_attempts"     => cfg.max_polling_attempts   = val.parse().unwrap_or(MAX_POLLING_ATTEMPTS),
            "probe_cooldown_ms"        => cfg.probe_cooldown         = millis(val, PROBE_COOLDOWN),
            "poll_interval_ms"         => cfg.poll_interval          = millis(val, POLL_INTERVAL),
            "request_timeout_ms"       => cfg.request_timeout        = millis(val, REQUEST_TIMEOUT),
            "max_fragments_per_stream" => cfg.max_fragments_per_stream = val.parse().unwrap_or(MAX_FRAGMENTS),
            "max_stream_bytes"         => cfg.max_stream_bytes       = val.parse().unwrap_or(MAX_STREAM_BYTES),
            "gap_timeout_ms"           => cfg.gap_timeout            = millis(val, GAP_TIMEOUT),
            "message_retry_budget"     => cfg.message_retry_budget   = val.parse().unwrap_or(MESSAGE_RETRY_BUDGET),
            "message_retry_base_ms"    => cfg.message_retry_base     = millis(val, MESSAGE_RETRY_BASE),
            "ack_timeout_ms"           => cfg.ack_timeout            = millis(val, ACK_TIMEOUT),
            "log_syslog"               => cfg.log_syslog             = flag(val),
            _ => {} // ignore unknown keys
        }
    }

    Ok(cfg)
}

fn check_scheme(name: &str, raw: &str, allowed: &[&str]) -> Result<()> {
    let url = Url::parse(raw)?;
    if !allowed.contains(&url.scheme()) {
        return Err(ChatError::Config(format!(
            "{name} must use one of {allowed:?}, got {}",
            url.scheme()
        )));
    }
    Ok(())
}

/// Validate that required fields are populated and limits are sane.
pub fn validate_config(cfg: &LinkConfig) -> Result<()> {
    match &cfg.stream_url {
        Some(u) => check_scheme("stream_url", u, &["ws", "wss"])?,
        None    => return Err(ChatError::Config("stream_url is required".into())),
    }
    match &cfg.poll_url {
        Some(u) => check_scheme("poll_url", u, &["http", "https"])?,
        None    => return Err(ChatError::Config("poll_url is required".into())),
    }
    if cfg.backoff.multiplier < 1.0 {
        return Err(ChatError::Config("backoff_multiplier must be >= 1".into()));
    }
    if cfg.backoff.base_delay > cfg.backoff.max_delay {
        return Err(ChatError::Config("backoff_base_ms must not exceed backoff_max_ms".into()));
    }
    if cfg.max_streaming_attempts == 0 || cfg.max_polling_attempts == 0 {
        return Err(ChatError::Config("attempt limits must be at least 1".into()));
    }
    if cfg.message_retry_budget == 0 {
        return Err(ChatError::Config("message_retry_budget must be at least 1".into()));
    }
    if cfg.max_fragments_per_stream == 0 || cfg.max_stream_bytes == 0 {
        return Err(ChatError::Config("stream buffer limits must be non-zero".into()));
    }
    if cfg.heartbeat_timeout <= cfg.heartbeat_interval {
        return Err(ChatError::Config(
            "heartbeat_timeout_ms must be greater than heartbeat_interval_ms".into(),
        ));
    }
    if cfg.poll_interval.is_zero() || cfg.open_timeout.is_zero() {
        return Err(ChatError::Config("poll_interval_ms and open_timeout_ms must be non-zero".into()));
    }
    // A send answered after its ack deadline would be charged to the next attempt.
    if cfg.ack_timeout < cfg.request_timeout {
        return Err(ChatError::Config("ack_timeout_ms must not be shorter than request_timeout_ms".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
        # chat widget link
        stream_url = wss://chat.example.com/ws
        poll_url   = https://chat.example.com/poll
        auth_token = abc123
        backoff_base_ms = 250
        backoff_multiplier = 1.5
        max_streaming_attempts = 3
        gap_timeout_ms = not-a-number
        unknown_key = whatever
    ";

    #[test]
    fn parses_known_keys() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.stream_url.as_deref(), Some("wss://chat.example.com/ws"));
        assert_eq!(cfg.poll_url.as_deref(), Some("https://chat.example.com/poll"));
        assert_eq!(cfg.auth_token, "abc123");
        assert_eq!(cfg.backoff.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.backoff.multiplier, 1.5);
        assert_eq!(cfg.max_streaming_attempts, 3);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.gap_timeout, Duration::from_millis(GAP_TIMEOUT));
        assert_eq!(cfg.max_polling_attempts, MAX_POLLING_ATTEMPTS);
    }

    #[test]
    fn sample_validates() {
        let cfg = parse_config(SAMPLE).unwrap();
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn missing_urls_rejected() {
        let err = validate_config(&LinkConfig::default()).unwrap_err();
        assert!(matches!(err, ChatError::Config(ref m) if m.contains("stream_url")), "{err}");
    }

    #[test]
    fn wrong_scheme_rejected() {
        let cfg = LinkConfig {
            stream_url: Some("https://chat.example.com/ws".into()),
            poll_url:   Some("https://chat.example.com/poll".into()),
            ..LinkConfig::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn heartbeat_timeout_must_exceed_interval() {
        let cfg = LinkConfig {
            stream_url:         Some("ws://localhost/ws".into()),
            poll_url:           Some("http://localhost/poll".into()),
            heartbeat_timeout:  Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(1),
            ..LinkConfig::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn defaults_keep_ack_timeout_above_request_timeout() {
        let cfg = LinkConfig::default();
        assert!(cfg.ack_timeout >= cfg.request_timeout);
        assert_eq!(cfg.open_timeout, Duration::from_millis(OPEN_TIMEOUT));
    }

    #[test]
    fn ack_timeout_shorter_than_request_timeout_rejected() {
        let cfg = parse_config(&format!("{SAMPLE}\nack_timeout_ms = 5000\nrequest_timeout_ms = 15000\n")).unwrap();
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ChatError::Config(ref m) if m.contains("ack_timeout_ms")), "{err}");
    }

    #[test]
    fn open_timeout_parsed_and_must_be_non_zero() {
        let cfg = parse_config(&format!("{SAMPLE}\nopen_timeout_ms = 2500\n")).unwrap();
        assert_eq!(cfg.open_timeout, Duration::from_millis(2500));
        let cfg = LinkConfig { open_timeout: Duration::ZERO, ..cfg };
        assert!(validate_config(&cfg).is_err());
    }
}
