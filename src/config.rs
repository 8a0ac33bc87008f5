//! Manager configuration

use crate::constants::{
    DEFAULT_AMI_PORT, DEFAULT_EVENT_MASK, DEFAULT_RECONNECT_DELAY_MS, DEFAULT_TIMEOUT_MS, REDACTED,
};
use serde::Deserialize;
use std::time::Duration;

/// How actions reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
#[non_exhaustive]
pub enum Transport {
    /// Persistent TCP session to `host:port`.
    #[default]
    Tcp,
    /// Asterisk's built-in HTTP server; `url` is the manager prefix, e.g.
    /// `http://pbx:8088/asterisk/`. Actions go to `<url>rawman`.
    Http {
        /// Base URL of the manager HTTP interface.
        url: String,
    },
}

/// Whether a tokio scheduler drives the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Reader task, async futures, event dispatch as events arrive.
    #[default]
    Async,
    /// No scheduler: blocking std I/O, events dispatched while waiting for a
    /// response.
    Sync,
}

/// Options for a [`Manager`](crate::Manager).
///
/// Deserializable so applications can embed it in their own config files;
/// missing fields take their defaults.
///
/// ```
/// use asterisk_ami_tokio::{ManagerOptions, Transport};
///
/// let options = ManagerOptions::new("pbx.example.com", "admin", "secret")
///     .with_port(5039)
///     .with_events("call,system");
/// assert_eq!(options.port, 5039);
/// assert_eq!(options.transport, Transport::Tcp);
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ManagerOptions {
    /// Server host name or address.
    pub host: String,
    /// Server TCP port. Default: 5038.
    pub port: u16,
    /// Login user; no `Login` is sent when empty.
    pub username: String,
    /// Login secret.
    pub secret: String,
    /// Event mask sent with `Login`. Default: `on`.
    pub events: String,
    /// TCP or HTTP transport.
    pub transport: Transport,
    /// Async (tokio) or Sync (blocking) execution.
    pub mode: ExecutionMode,
    /// TCP connect / HTTP request timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Interval between keepalive `Ping` actions; 0 disables.
    pub ping_delay_ms: u64,
    /// Reconnect after the TCP session drops unexpectedly.
    pub reconnect: bool,
    /// Delay between reconnection attempts in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Deadline for a response to an action; 0 waits indefinitely.
    pub action_timeout_ms: u64,
}

impl std::fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &REDACTED)
            .field("events", &self.events)
            .field("transport", &self.transport)
            .field("mode", &self.mode)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("ping_delay_ms", &self.ping_delay_ms)
            .field("reconnect", &self.reconnect)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("action_timeout_ms", &self.action_timeout_ms)
            .finish()
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_AMI_PORT,
            username: String::new(),
            secret: String::new(),
            events: DEFAULT_EVENT_MASK.to_string(),
            transport: Transport::Tcp,
            mode: ExecutionMode::Async,
            connect_timeout_ms: DEFAULT_TIMEOUT_MS,
            ping_delay_ms: 0,
            reconnect: false,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            action_timeout_ms: 0,
        }
    }
}

impl ManagerOptions {
    /// TCP options with credentials and defaults elsewhere.
    pub fn new(host: impl Into<String>, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Set the TCP port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the `Login` event mask.
    pub fn with_events(mut self, events: impl Into<String>) -> Self {
        self.events = events.into();
        self
    }

    /// Use the HTTP transport rooted at `url`.
    pub fn with_http(mut self, url: impl Into<String>) -> Self {
        self.transport = Transport::Http { url: url.into() };
        self
    }

    /// Select the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Send a keepalive `Ping` every `delay`.
    pub fn with_ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Reconnect automatically, waiting `delay` between attempts.
    pub fn with_reconnect(mut self, delay: Duration) -> Self {
        self.reconnect = true;
        self.reconnect_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Bound the wait for each response.
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Bound TCP connect and HTTP requests.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn ping_delay(&self) -> Option<Duration> {
        (self.ping_delay_ms > 0).then(|| Duration::from_millis(self.ping_delay_ms))
    }

    pub(crate) fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub(crate) fn action_timeout(&self) -> Option<Duration> {
        (self.action_timeout_ms > 0).then(|| Duration::from_millis(self.action_timeout_ms))
    }

    pub(crate) fn has_credentials(&self) -> bool {
        !self
            .username
            .is_empty()
    }
}
