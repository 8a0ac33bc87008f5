//! AMI message parsing and classification

use crate::{
    constants::{END_COMMAND_MARKER, LINE_TERMINATOR},
    error::{AmiError, AmiResult},
    headers::{AmiHeader, ResponseStatus},
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Headers that carry protocol bookkeeping rather than command output.
///
/// A `Response: Follows` block mixes these with the output lines; they are
/// kept out of [`Message::content()`].
const BOOKKEEPING_HEADERS: [&str; 2] = ["ActionID", "Privilege"];

/// Value of a header, collapsed into a list when the header repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    /// The header appeared once.
    Single(String),
    /// The header appeared two or more times, in server order.
    Multiple(Vec<String>),
}

impl HeaderValue {
    /// First occurrence of the header.
    pub fn first(&self) -> &str {
        match self {
            HeaderValue::Single(v) => v,
            HeaderValue::Multiple(vs) => vs
                .first()
                .map(String::as_str)
                .unwrap_or(""),
        }
    }

    /// Every occurrence, in server order.
    pub fn as_slice(&self) -> &[String] {
        match self {
            HeaderValue::Single(v) => std::slice::from_ref(v),
            HeaderValue::Multiple(vs) => vs,
        }
    }

    /// Whether the header repeated.
    pub fn is_multiple(&self) -> bool {
        matches!(self, HeaderValue::Multiple(_))
    }

    fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(first) => {
                let first = std::mem::take(first);
                *self = HeaderValue::Multiple(vec![first, value]);
            }
            HeaderValue::Multiple(vs) => vs.push(value),
        }
    }
}

impl PartialEq<str> for HeaderValue {
    fn eq(&self, other: &str) -> bool {
        matches!(self, HeaderValue::Single(v) if v == other)
    }
}

impl PartialEq<&str> for HeaderValue {
    fn eq(&self, other: &&str) -> bool {
        self == *other
    }
}

impl PartialEq<[&str]> for HeaderValue {
    fn eq(&self, other: &[&str]) -> bool {
        let values = self.as_slice();
        values.len() == other.len()
            && values
                .iter()
                .zip(other)
                .all(|(a, b)| a == b)
    }
}

/// How a message relates to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Solicited reply carrying a `Response` header.
    Response,
    /// Unsolicited notification carrying an `Event` header.
    Event,
    /// Neither `Response` nor `Event`; valid but not routable.
    Unclassified,
}

/// One parsed protocol block.
///
/// Header names are case-sensitive as received. Repeated headers collapse
/// into [`HeaderValue::Multiple`]. A `Message` is immutable once parsed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Message {
    headers: Vec<(String, HeaderValue)>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    content: String,
    /// Non-blank lines as received, for rendering back to the wire.
    #[serde(skip)]
    lines: Vec<String>,
}

/// Split `Key: Value`, trimming exactly one leading space from the value.
///
/// Returns `None` when the line has no `:` or the text before it is not a
/// single token (CLI output such as `  Name/username  Host: x` is content).
fn split_header(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    let key = &line[..colon];
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let value = &line[colon + 1..];
    Some((key, value.strip_prefix(' ').unwrap_or(value)))
}

impl Message {
    /// Parse one block (lines separated by CRLF, terminator already removed).
    ///
    /// ```
    /// use asterisk_ami_tokio::Message;
    ///
    /// let msg = Message::parse("Response: Success\r\nPing: Pong\r\nPing: Pong").unwrap();
    /// assert!(msg.success());
    /// assert_eq!(msg.get_all("Ping"), ["Pong", "Pong"]);
    /// ```
    pub fn parse(raw: &str) -> AmiResult<Self> {
        let mut lines = raw
            .split('\n')
            .map(|line| {
                line.strip_suffix('\r')
                    .unwrap_or(line)
            });

        let first = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| AmiError::malformed("block starts with an empty line"))?;
        let (key, value) = split_header(first)
            .ok_or_else(|| AmiError::malformed(format!("first line is not a header: {first:?}")))?;

        let follows = key == AmiHeader::Response.as_str()
            && value.eq_ignore_ascii_case(ResponseStatus::Follows.as_str());

        let mut message = Message::default();
        message.insert(key, value);

        let mut content: Vec<&str> = Vec::new();
        let mut collecting = true;

        message
            .lines
            .push(first.to_string());
        for line in lines {
            if line.is_empty() {
                continue;
            }
            message
                .lines
                .push(line.to_string());
            if line == END_COMMAND_MARKER {
                collecting = false;
                continue;
            }

            let header = split_header(line);
            if let Some((key, value)) = header {
                message.insert(key, value);
            }
            if !collecting {
                continue;
            }

            match header {
                Some(("Output", value)) => content.push(value),
                Some((key, _)) if follows && !BOOKKEEPING_HEADERS.contains(&key) => {
                    content.push(line)
                }
                Some(_) => {}
                None => content.push(line),
            }
        }

        message.content = content.join("\n");
        Ok(message)
    }

    /// Build a message from header pairs; repeated names collapse.
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut message = Message::default();
        for (k, v) in headers {
            message.insert(k.as_ref(), v.as_ref());
        }
        message
    }

    /// Synthesized `Response: Error` used when a transport cannot deliver an
    /// action, so callers see one failure shape regardless of transport.
    pub(crate) fn error_response(action_id: Option<&str>, reason: &str) -> Self {
        let mut message = Message::default();
        message.insert(AmiHeader::Response.as_str(), ResponseStatus::Error.as_str());
        if let Some(id) = action_id {
            message.insert(AmiHeader::ActionId.as_str(), id);
        }
        message.insert(AmiHeader::Message.as_str(), reason);
        message
    }

    fn insert(&mut self, key: &str, value: &str) {
        match self
            .index
            .get(key)
        {
            Some(&pos) => self.headers[pos]
                .1
                .push(value.to_string()),
            None => {
                self.index
                    .insert(key.to_string(), self.headers.len());
                self.headers
                    .push((key.to_string(), HeaderValue::Single(value.to_string())));
            }
        }
    }

    /// First value of a header (case-sensitive name).
    pub fn header(&self, name: impl AsRef<str>) -> Option<&str> {
        self.get(name)
            .map(HeaderValue::first)
    }

    /// Full value of a header, single or repeated.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&HeaderValue> {
        self.index
            .get(name.as_ref())
            .map(|&pos| &self.headers[pos].1)
    }

    /// Every value of a header, empty when absent.
    pub fn get_all(&self, name: impl AsRef<str>) -> &[String] {
        self.get(name)
            .map(HeaderValue::as_slice)
            .unwrap_or(&[])
    }

    /// Whether the header is present, even with an empty value.
    pub fn contains(&self, name: impl AsRef<str>) -> bool {
        self.index
            .contains_key(name.as_ref())
    }

    /// Headers in first-seen order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.headers
            .iter()
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.headers
            .len()
    }

    /// `true` when the message has no headers.
    pub fn is_empty(&self) -> bool {
        self.headers
            .is_empty()
    }

    /// Raw `Response` header.
    pub fn response(&self) -> Option<&str> {
        self.header(AmiHeader::Response)
    }

    /// Parsed `Response` header, `None` if absent or not a known status.
    pub fn response_status(&self) -> Option<ResponseStatus> {
        self.response()?
            .parse()
            .ok()
    }

    /// Event name; the key callbacks are matched against.
    pub fn matches(&self) -> Option<&str> {
        self.header(AmiHeader::Event)
    }

    /// Classification by `Response` / `Event` header.
    pub fn kind(&self) -> MessageKind {
        if self.contains(AmiHeader::Response) {
            MessageKind::Response
        } else if self.contains(AmiHeader::Event) {
            MessageKind::Event
        } else {
            MessageKind::Unclassified
        }
    }

    /// Whether this is an unsolicited event.
    pub fn is_event(&self) -> bool {
        self.kind() == MessageKind::Event
    }

    /// `false` only for responses that are not `Success`, `Follows` or
    /// `Goodbye`. Events and unclassified blocks count as successful.
    pub fn success(&self) -> bool {
        match self.response() {
            None => true,
            Some(_) => self
                .response_status()
                .is_some_and(|status| status.is_success()),
        }
    }

    /// `ActionID` header.
    pub fn action_id(&self) -> Option<&str> {
        self.header(AmiHeader::ActionId)
    }

    /// `Message` header (human-readable reason or acknowledgement).
    pub fn message_text(&self) -> Option<&str> {
        self.header(AmiHeader::Message)
    }

    /// `EventList` header (`start`, `Complete`, `Cancelled`).
    pub fn event_list(&self) -> Option<&str> {
        self.header(AmiHeader::EventList)
    }

    /// Whether this block closes a list started by a `EventList: start` response.
    pub fn is_list_end(&self) -> bool {
        self.event_list()
            .is_some_and(|v| {
                v.eq_ignore_ascii_case("Complete") || v.eq_ignore_ascii_case("Cancelled")
            })
    }

    /// Payload lines joined with `\n`: command output for `Response: Follows`,
    /// otherwise the lines that are not headers.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Payload lines in order.
    pub fn iter_lines(&self) -> impl Iterator<Item = &str> {
        self.content
            .lines()
    }

    /// Turn a failed response into [`AmiError::ActionFailed`].
    pub fn into_result(self) -> AmiResult<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(AmiError::ActionFailed {
            response: self
                .response()
                .unwrap_or_default()
                .to_string(),
            message: self
                .message_text()
                .unwrap_or_default()
                .to_string(),
        })
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.headers == other.headers && self.content == other.content
    }
}

impl fmt::Display for Message {
    /// Renders the block in wire format. A parsed message keeps its lines
    /// in received order; a built one writes headers, then free-form content.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self
            .lines
            .is_empty()
        {
            for line in &self.lines {
                write!(f, "{}{}", line, LINE_TERMINATOR)?;
            }
            return f.write_str(LINE_TERMINATOR);
        }
        for (key, value) in &self.headers {
            for v in value.as_slice() {
                write!(f, "{}: {}{}", key, v, LINE_TERMINATOR)?;
            }
        }
        for line in self
            .iter_lines()
            .filter(|l| split_header(l).is_none())
        {
            write!(f, "{}{}", line, LINE_TERMINATOR)?;
        }
        f.write_str(LINE_TERMINATOR)
    }
}
