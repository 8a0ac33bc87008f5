//! Outgoing actions and correlation ids

use crate::{
    constants::{LINE_TERMINATOR, REDACTED},
    error::{AmiError, AmiResult},
    headers::AmiHeader,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// Validate that a header name or value contains no line breaks.
///
/// AMI is line-delimited; an embedded CR or LF would let a value inject
/// arbitrary headers or terminate the block early.
fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::protocol_error(format!(
            "{} must not contain newlines",
            context
        )));
    }
    Ok(())
}

/// Source of `ActionID` values.
///
/// Ids are `<prefix>-<counter>`, where the prefix mixes the process id with
/// the creation time so two generators (or two processes sharing a server)
/// do not collide.
#[derive(Debug)]
pub struct IdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl IdGenerator {
    /// New generator with a fresh prefix.
    pub fn new() -> Self {
        static INSTANCES: AtomicU64 = AtomicU64::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
            .unwrap_or_default();
        let instance = INSTANCES.fetch_add(1, Ordering::Relaxed);
        Self::with_prefix(format!("{:x}{:x}.{}", std::process::id(), nanos, instance))
    }

    /// New generator with a caller-chosen prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(1),
        }
    }

    /// Next unique id.
    pub fn next_id(&self) -> String {
        let n = self
            .counter
            .fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn default_generator() -> &'static IdGenerator {
    static GENERATOR: OnceLock<IdGenerator> = OnceLock::new();
    GENERATOR.get_or_init(IdGenerator::new)
}

/// An outgoing AMI command.
///
/// Fields keep insertion order. Every action carries an `ActionID`; one is
/// generated when the caller does not supply it.
///
/// ```
/// use asterisk_ami_tokio::Action;
///
/// let action = Action::new([("Action", "Ping")]);
/// let wire = action.to_wire_format().unwrap();
/// assert!(wire.starts_with("Action: Ping\r\nActionID: "));
/// assert!(wire.ends_with("\r\n\r\n"));
/// assert_ne!(action.id(), Action::ping().id());
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Action {
    fields: Vec<(String, String)>,
}

impl Action {
    /// Build an action from header pairs, generating an `ActionID` if absent.
    pub fn new<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::with_id_generator(fields, default_generator())
    }

    /// Like [`new`](Self::new), drawing the id from `ids`.
    pub fn with_id_generator<I, K, V>(fields: I, ids: &IdGenerator) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut action = Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        if !action.contains(AmiHeader::ActionId) {
            action
                .fields
                .push((AmiHeader::ActionId.to_string(), ids.next_id()));
        }
        action
    }

    /// Action named `name` with no other fields.
    pub fn named(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self::new([(AmiHeader::Action.to_string(), name)])
    }

    /// `Login` with the given event mask (`on`, `off`, or a comma list such
    /// as `call,system`).
    pub fn login(username: &str, secret: &str, events: &str) -> Self {
        Self::new([
            (AmiHeader::Action.as_str(), "Login"),
            (AmiHeader::Username.as_str(), username),
            (AmiHeader::Secret.as_str(), secret),
            (AmiHeader::Events.as_str(), events),
        ])
    }

    /// `Logoff`; the server answers `Response: Goodbye` and closes.
    pub fn logoff() -> Self {
        Self::named("Logoff")
    }

    /// `Ping` keepalive.
    pub fn ping() -> Self {
        Self::named("Ping")
    }

    /// CLI `Command`, answered with a `Response: Follows` block.
    pub fn command(cli: &str) -> Self {
        Self::new([
            (AmiHeader::Action.as_str(), "Command"),
            (AmiHeader::Command.as_str(), cli),
        ])
    }

    /// `Events` action changing the event mask of the session.
    pub fn events(mask: &str) -> Self {
        Self::new([
            (AmiHeader::Action.as_str(), "Events"),
            (AmiHeader::EventMask.as_str(), mask),
        ])
    }

    /// Add or replace a field, keeping its original position.
    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self
            .fields
            .iter_mut()
            .find(|(k, _)| *k == name)
        {
            Some((_, v)) => *v = value,
            None => self
                .fields
                .push((name, value)),
        }
        self
    }

    /// Append a field even if the name already exists (`Variable` can repeat).
    pub fn append(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .push((name.into(), value.into()));
        self
    }

    /// The correlation id.
    pub fn id(&self) -> &str {
        self.header(AmiHeader::ActionId)
            .unwrap_or_default()
    }

    /// The `Action` header (command name).
    pub fn name(&self) -> Option<&str> {
        self.header(AmiHeader::Action)
    }

    /// First value of a field.
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        let name = name.as_ref();
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether the field is present.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.header(name)
            .is_some()
    }

    /// Fields in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the name matches `name` case-insensitively.
    pub fn is(&self, name: &str) -> bool {
        self.name()
            .is_some_and(|n| n.eq_ignore_ascii_case(name))
    }

    /// Validate all fields, then render `Key: Value\r\n` lines plus the
    /// terminating empty line.
    pub fn to_wire_format(&self) -> AmiResult<String> {
        use std::fmt::Write;
        if !self.contains(AmiHeader::Action) {
            return Err(AmiError::protocol_error("action has no Action header"));
        }
        let mut result = String::new();
        for (key, value) in &self.fields {
            validate_no_newlines(key, "header name")?;
            validate_no_newlines(value, "header value")?;
            let _ = write!(result, "{}: {}{}", key, value, LINE_TERMINATOR);
        }
        result.push_str(LINE_TERMINATOR);
        Ok(result)
    }

    /// Wire bytes; see [`to_wire_format`](Self::to_wire_format).
    pub fn serialize(&self) -> AmiResult<Vec<u8>> {
        self.to_wire_format()
            .map(String::into_bytes)
    }

    fn redacted_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case(AmiHeader::Secret.as_str()) {
                    (k, REDACTED)
                } else {
                    (k, v)
                }
            })
    }
}

impl Default for Action {
    /// An action with only a generated `ActionID`; set `Action` before sending.
    fn default() -> Self {
        Self::new(std::iter::empty::<(String, String)>())
    }
}

impl<K, V> FromIterator<(K, V)> for Action
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for Action {
    /// Wire rendering with `Secret` redacted, for logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.redacted_fields() {
            write!(f, "{}: {}{}", key, value, LINE_TERMINATOR)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.redacted_fields())
            .finish()
    }
}
