use crate::channel::ChannelConfig;
use crate::poller::{DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT};
use crate::session::SessionConfig;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use synthflow_core::reconciler::{ReconcilerConfig, TerminalPolicy, DEFAULT_DEDUP_WINDOW};
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8787";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid url for {key}: {value} ({reason})")]
    InvalidUrl {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid number for {key}: {value}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("invalid flag for {key}: {value}")]
    InvalidFlag { key: &'static str, value: String },
    #[error("{0}")]
    InvalidPolicy(String),
}

#[derive(Parser, Debug)]
#[command(name = "synthflow", about = "Follow a synthetic-data workflow live")]
pub struct Cli {
    /// Backend base url (falls back to SYNTHFLOW_API_URL).
    #[arg(long, default_value = "")]
    pub api_url: String,
    /// Push channel url (falls back to SYNTHFLOW_WS_URL, then `<api>/ws`).
    #[arg(long, default_value = "")]
    pub ws_url: String,
    /// Side-channel database (falls back to SYNTHFLOW_STATE_DB).
    #[arg(long, default_value = "")]
    pub state_db: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Observe one workflow and print every view change.
    Watch(WatchArgs),
    /// Record that the distribution step of a workflow was completed.
    MarkDistributed { workflow_id: String },
    /// Remove a recorded distribution completion.
    ClearDistributed { workflow_id: String },
    /// List recorded distribution completions.
    Signals,
}

#[derive(Args, Debug, Default)]
pub struct WatchArgs {
    pub workflow_id: String,
    #[arg(long, default_value_t = 0)]
    pub poll_interval_ms: u64,
    #[arg(long, default_value_t = 0)]
    pub connected_poll_interval_ms: u64,
    /// `apply` or `freeze` (falls back to SYNTHFLOW_TERMINAL_POLICY).
    #[arg(long, default_value = "")]
    pub terminal_policy: String,
    /// `true`/`false` (falls back to SYNTHFLOW_RECONNECT).
    #[arg(long, default_value = "")]
    pub reconnect: String,
    /// Poll only; never open the push channel.
    #[arg(long, default_value_t = false)]
    pub no_channel: bool,
    #[arg(long, default_value_t = 10)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_DEDUP_WINDOW)]
    pub dedup_window: usize,
    /// Print the full view as JSON instead of a summary line.
    #[arg(long, default_value_t = false)]
    pub json: bool,
    /// Exit once the workflow reaches a terminal status.
    #[arg(long, default_value_t = false)]
    pub exit_on_terminal: bool,
}

/// Environment values consulted when a flag is left empty.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub api_url: Option<String>,
    pub ws_url: Option<String>,
    pub state_db: Option<String>,
    pub poll_interval_ms: Option<String>,
    pub terminal_policy: Option<String>,
    pub reconnect: Option<String>,
    pub xdg_state_home: Option<String>,
    pub home: Option<String>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok();
        Self {
            api_url: var("SYNTHFLOW_API_URL"),
            ws_url: var("SYNTHFLOW_WS_URL"),
            state_db: var("SYNTHFLOW_STATE_DB"),
            poll_interval_ms: var("SYNTHFLOW_POLL_INTERVAL_MS"),
            terminal_policy: var("SYNTHFLOW_TERMINAL_POLICY"),
            reconnect: var("SYNTHFLOW_RECONNECT"),
            xdg_state_home: var("XDG_STATE_HOME"),
            home: var("HOME"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub api_url: Url,
    pub ws_url: Option<Url>,
    pub state_db: PathBuf,
    pub poll_interval: Duration,
    pub connected_poll_interval: Option<Duration>,
    pub request_timeout: Duration,
    pub terminal_policy: TerminalPolicy,
    pub reconnect: bool,
    pub dedup_window: usize,
}

impl MonitorConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            channel: self.ws_url.clone().map(|url| ChannelConfig {
                reconnect: self.reconnect,
                ..ChannelConfig::new(url)
            }),
            poll_interval: self.poll_interval,
            connected_poll_interval: self.connected_poll_interval,
            reconciler: ReconcilerConfig {
                terminal_policy: self.terminal_policy,
                dedup_window: self.dedup_window,
            },
        }
    }
}

pub fn load_watch_config(
    cli: &Cli,
    watch: &WatchArgs,
    env: &EnvOverrides,
) -> Result<MonitorConfig, ConfigError> {
    let api_url = resolve_api_url(&cli.api_url, env.api_url.as_deref())?;
    let ws_url = if watch.no_channel {
        None
    } else {
        Some(resolve_ws_url(&cli.ws_url, env.ws_url.as_deref(), &api_url)?)
    };
    let poll_interval = resolve_poll_interval(watch.poll_interval_ms, env.poll_interval_ms.as_deref())?;
    let connected_poll_interval = match watch.connected_poll_interval_ms {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };
    let request_timeout = match watch.request_timeout_secs {
        0 => DEFAULT_REQUEST_TIMEOUT,
        secs => Duration::from_secs(secs),
    };
    Ok(MonitorConfig {
        api_url,
        ws_url,
        state_db: resolve_state_db(&cli.state_db, env),
        poll_interval,
        connected_poll_interval,
        request_timeout,
        terminal_policy: resolve_terminal_policy(
            &watch.terminal_policy,
            env.terminal_policy.as_deref(),
        )?,
        reconnect: resolve_reconnect(&watch.reconnect, env.reconnect.as_deref())?,
        dedup_window: watch.dedup_window.max(1),
    })
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Flag first, then the environment value, skipping blanks.
fn pick<'a>(flag: &'a str, env_value: Option<&'a str>) -> Option<&'a str> {
    if !flag.trim().is_empty() {
        return Some(flag.trim());
    }
    env_value.map(str::trim).filter(|value| !value.is_empty())
}

pub fn resolve_api_url(flag: &str, env_value: Option<&str>) -> Result<Url, ConfigError> {
    let raw = pick(flag, env_value).unwrap_or(DEFAULT_API_URL);
    parse_url("api_url", raw)
}

pub fn resolve_ws_url(flag: &str, env_value: Option<&str>, api_url: &Url) -> Result<Url, ConfigError> {
    if let Some(raw) = pick(flag, env_value) {
        return parse_url("ws_url", raw);
    }
    let mut url = api_url.clone();
    let scheme = if api_url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme).map_err(|_| ConfigError::InvalidUrl {
        key: "ws_url",
        value: api_url.to_string(),
        reason: "cannot derive websocket scheme".to_string(),
    })?;
    url.path_segments_mut()
        .map_err(|_| ConfigError::InvalidUrl {
            key: "ws_url",
            value: api_url.to_string(),
            reason: "base cannot carry a path".to_string(),
        })?
        .pop_if_empty()
        .push("ws");
    Ok(url)
}

pub fn resolve_poll_interval(flag_ms: u64, env_value: Option<&str>) -> Result<Duration, ConfigError> {
    if flag_ms > 0 {
        return Ok(Duration::from_millis(flag_ms));
    }
    match env_value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
            _ => Err(ConfigError::InvalidNumber {
                key: "SYNTHFLOW_POLL_INTERVAL_MS",
                value: raw.to_string(),
            }),
        },
        None => Ok(DEFAULT_POLL_INTERVAL),
    }
}

pub fn resolve_terminal_policy(
    flag: &str,
    env_value: Option<&str>,
) -> Result<TerminalPolicy, ConfigError> {
    match pick(flag, env_value) {
        Some(raw) => raw.parse().map_err(ConfigError::InvalidPolicy),
        None => Ok(TerminalPolicy::default()),
    }
}

pub fn resolve_reconnect(flag: &str, env_value: Option<&str>) -> Result<bool, ConfigError> {
    match pick(flag, env_value) {
        Some(raw) => parse_bool_flag(raw).ok_or_else(|| ConfigError::InvalidFlag {
            key: "reconnect",
            value: raw.to_string(),
        }),
        None => Ok(true),
    }
}

pub fn resolve_state_db(flag: &str, env: &EnvOverrides) -> PathBuf {
    if let Some(raw) = pick(flag, env.state_db.as_deref()) {
        return PathBuf::from(raw);
    }
    resolve_state_dir(env).join("side_channel.sqlite")
}

fn resolve_state_dir(env: &EnvOverrides) -> PathBuf {
    if let Some(value) = env.xdg_state_home.as_deref() {
        if !value.trim().is_empty() {
            return PathBuf::from(value).join("synthflow");
        }
    }
    if let Some(value) = env.home.as_deref() {
        return PathBuf::from(value)
            .join(".local")
            .join("state")
            .join("synthflow");
    }
    PathBuf::from(".synthflow/state")
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}
