//! Protocol constants and configuration values

/// Default Asterisk Manager Interface TCP port
pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Socket buffer size for reading from TCP stream (64KB)
pub const SOCKET_BUF_SIZE: usize = 65536;

/// Buffer allocation size (64KB) - used for initial allocation
pub const BUF_CHUNK: usize = 64 * 1024;

/// Maximum total buffer size (16MB) - a block that never terminates
/// indicates a desynchronized stream, not a legitimate message.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Protocol block and line terminators
pub const BLOCK_TERMINATOR: &str = "\r\n\r\n";
pub const LINE_TERMINATOR: &str = "\r\n";

/// Marker ending the free-form output of a `Response: Follows` block.
pub const END_COMMAND_MARKER: &str = "--END COMMAND--";

/// Prefix of the banner line Asterisk writes when a TCP session opens.
pub const GREETING_PREFIX: &str = "Asterisk Call Manager";

/// Path of the raw-text manager endpoint exposed by the Asterisk HTTP server.
pub const HTTP_RAWMAN_PATH: &str = "rawman";

/// Name of the session cookie set by the Asterisk HTTP server after `Login`.
pub const HTTP_SESSION_COOKIE: &str = "mansession_id";

/// Connection timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

/// Delay between reconnection attempts in milliseconds
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;

/// Default event mask sent with `Login`
pub const DEFAULT_EVENT_MASK: &str = "on";

/// Placeholder written instead of secrets in logs and `Debug` output.
pub const REDACTED: &str = "[REDACTED]";
