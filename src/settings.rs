//! Server, connection and query settings.
//!
//! Settings are layered: [`ServerSettings`] come from the command line, a
//! [`ConnectionSettings`] snapshot is taken when a session is established, and each
//! query may override part of that snapshot for its own duration through the
//! settings carried in the Query packet.
use std::time::Duration;

use clap::Args;
use thiserror::Error;

use crate::{protocol::Setting, telemetry::LogLevel};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("unknown setting '{0}'")]
    Unknown(String),

    #[error("invalid value '{value}' for setting '{name}'")]
    InvalidValue { name: String, value: String },
}

fn parse_pair(s: &str, sep: char) -> Result<(String, String), String> {
    s.split_once(sep)
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| format!("expected '<name>{sep}<value>', got '{s}'"))
}

fn parse_user(s: &str) -> Result<(String, String), String> {
    parse_pair(s, ':')
}

fn parse_secret(s: &str) -> Result<(String, String), String> {
    parse_pair(s, '=')
}

/// Server-wide settings.
#[derive(Debug, Clone, Args)]
pub struct ServerSettings {
    /// Number of connections served concurrently
    #[arg(long, default_value_t = 16)]
    pub max_connections: usize,

    /// How long an idle connection waits for a packet before re-checking shutdown and idle timeouts
    #[arg(long, default_value_t = 10_000)]
    pub poll_interval_ms: u64,

    /// Interval between progress/log flushes and cancellation checks of a running query
    #[arg(long, default_value_t = 100)]
    pub interactive_delay_ms: u64,

    /// Close connections idle for longer than this; 0 keeps them open
    #[arg(long, default_value_t = 3600)]
    pub idle_connection_timeout_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub send_timeout_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub receive_timeout_secs: u64,

    /// Escalate a read-cancelled query to fully cancelled after this long; 0 waits for a second Cancel
    #[arg(long, default_value_t = 0)]
    pub cancel_grace_period_ms: u64,

    /// Do not attach error details to exception packets
    #[arg(long)]
    pub hide_stack_trace: bool,

    #[arg(long, default_value = "UTC")]
    pub timezone: String,

    /// Name reported to clients in the server hello
    #[arg(long)]
    pub display_name: Option<String>,

    /// Expect a PROXY protocol v1 header on every connection
    #[arg(long)]
    pub proxy_protocol: bool,

    /// Chunked framing capability for server→client packets
    #[arg(long, default_value = "notchunked_optional")]
    pub proto_caps_send: String,

    /// Chunked framing capability for client→server packets
    #[arg(long, default_value = "notchunked_optional")]
    pub proto_caps_recv: String,

    /// Allowed user as `name:password`; without any, user `default` with an empty password is allowed
    #[arg(long = "user", value_parser = parse_user)]
    pub users: Vec<(String, String)>,

    /// Inter-server secret as `cluster=secret`
    #[arg(long = "cluster-secret", value_parser = parse_secret)]
    pub cluster_secrets: Vec<(String, String)>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_connections: 16,
            poll_interval_ms: 10_000,
            interactive_delay_ms: 100,
            idle_connection_timeout_secs: 3600,
            send_timeout_secs: 300,
            receive_timeout_secs: 300,
            cancel_grace_period_ms: 0,
            hide_stack_trace: false,
            timezone: "UTC".to_string(),
            display_name: None,
            proxy_protocol: false,
            proto_caps_send: "notchunked_optional".to_string(),
            proto_caps_recv: "notchunked_optional".to_string(),
            users: Vec::new(),
            cluster_secrets: Vec::new(),
        }
    }
}

impl ServerSettings {
    pub fn cluster_secret(&self, cluster: &str) -> Option<&str> {
        self.cluster_secrets
            .iter()
            .find(|(name, _)| name == cluster)
            .map(|(_, secret)| secret.as_str())
    }
}

/// When a read-cancelled query is escalated to fully cancelled.
///
/// A second Cancel packet always escalates. With a grace period configured, the
/// query is also escalated once that much time has passed since the first Cancel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelPolicy {
    pub grace_period: Option<Duration>,
}

impl CancelPolicy {
    pub fn expired(&self, since_read_cancel: Duration) -> bool {
        self.grace_period
            .is_some_and(|grace| since_read_cancel >= grace)
    }
}

/// Operational settings of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub send_exception_with_stack_trace: bool,
    pub send_timeout: Duration,
    pub receive_timeout: Duration,
    pub poll_interval: Duration,
    pub idle_connection_timeout: Duration,
    pub interactive_delay: Duration,
    pub cancel_policy: CancelPolicy,
}

impl ConnectionSettings {
    /// Longest a running query blocks on client packets or pipeline output before
    /// checking its timeouts and cancellation again.
    pub fn query_wait(&self) -> Duration {
        self.poll_interval.min(self.interactive_delay)
    }
}

impl From<&ServerSettings> for ConnectionSettings {
    fn from(value: &ServerSettings) -> Self {
        Self {
            send_exception_with_stack_trace: !value.hide_stack_trace,
            send_timeout: Duration::from_secs(value.send_timeout_secs),
            receive_timeout: Duration::from_secs(value.receive_timeout_secs),
            poll_interval: Duration::from_millis(value.poll_interval_ms),
            idle_connection_timeout: Duration::from_secs(value.idle_connection_timeout_secs),
            interactive_delay: Duration::from_millis(value.interactive_delay_ms),
            cancel_policy: CancelPolicy {
                grace_period: Some(Duration::from_millis(value.cancel_grace_period_ms))
                    .filter(|d| !d.is_zero()),
            },
        }
    }
}

pub const DEFAULT_MAX_BLOCK_SIZE: usize = 65_409;

/// Settings that only affect one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySettings {
    pub send_logs_level: Option<LogLevel>,
    pub max_block_size: usize,
    pub extremes: bool,
    pub async_insert: bool,
    pub wait_for_async_insert: bool,
    pub async_insert_busy_timeout: Duration,
    pub session_timezone: Option<String>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            send_logs_level: None,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
            extremes: false,
            async_insert: false,
            wait_for_async_insert: true,
            async_insert_busy_timeout: Duration::from_millis(200),
            session_timezone: None,
        }
    }
}

fn invalid(setting: &Setting) -> SettingsError {
    SettingsError::InvalidValue {
        name: setting.name.clone(),
        value: setting.value.clone(),
    }
}

fn parse_bool(setting: &Setting) -> Result<bool, SettingsError> {
    match setting.value.to_lowercase().as_str() {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(invalid(setting)),
    }
}

fn parse_u64(setting: &Setting) -> Result<u64, SettingsError> {
    setting.value.trim().parse().map_err(|_| invalid(setting))
}

/// Applies the settings sent with a query on top of the connection snapshot.
pub fn apply_query_settings(
    base: &ConnectionSettings,
    overrides: &[Setting],
) -> Result<(ConnectionSettings, QuerySettings), SettingsError> {
    let mut connection = base.clone();
    let mut query = QuerySettings::default();

    for setting in overrides {
        match setting.name.as_str() {
            "poll_interval" => {
                connection.poll_interval = Duration::from_secs(parse_u64(setting)?);
            }
            "interactive_delay" => {
                connection.interactive_delay = Duration::from_micros(parse_u64(setting)?);
            }
            "send_timeout" => connection.send_timeout = Duration::from_secs(parse_u64(setting)?),
            "receive_timeout" => {
                connection.receive_timeout = Duration::from_secs(parse_u64(setting)?);
            }
            "cancel_grace_period_ms" => {
                let ms = parse_u64(setting)?;
                connection.cancel_policy.grace_period =
                    Some(Duration::from_millis(ms)).filter(|d| !d.is_zero());
            }
            "calculate_text_stack_trace" => {
                connection.send_exception_with_stack_trace = parse_bool(setting)?;
            }
            "send_logs_level" => {
                query.send_logs_level = match setting.value.as_str() {
                    "none" | "" => None,
                    level => Some(level.parse().map_err(|_| invalid(setting))?),
                };
            }
            "max_block_size" => {
                query.max_block_size = parse_u64(setting)?.max(1) as usize;
            }
            "extremes" => query.extremes = parse_bool(setting)?,
            "async_insert" => query.async_insert = parse_bool(setting)?,
            "wait_for_async_insert" => query.wait_for_async_insert = parse_bool(setting)?,
            "async_insert_busy_timeout_ms" => {
                query.async_insert_busy_timeout = Duration::from_millis(parse_u64(setting)?);
            }
            "session_timezone" => {
                query.session_timezone = Some(setting.value.clone()).filter(|tz| !tz.is_empty());
            }
            other => return Err(SettingsError::Unknown(other.to_string())),
        }
    }

    Ok((connection, query))
}
