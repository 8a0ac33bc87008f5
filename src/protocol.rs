//! AMI block reassembly

use crate::{
    buffer::AmiBuffer,
    constants::{BLOCK_TERMINATOR, GREETING_PREFIX, LINE_TERMINATOR},
    error::AmiResult,
    message::Message,
};
use tracing::{debug, trace};

/// Parser state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// A TCP session opens with a single banner line, not a block.
    WaitingForGreeting,
    WaitingForBlock,
}

/// Incremental reassembler turning a byte stream into [`Message`]s.
///
/// Bytes may arrive split at any boundary, including inside the
/// `\r\n\r\n` terminator; incomplete data stays buffered until the next
/// [`add_data`](Self::add_data).
#[derive(Debug)]
pub struct AmiParser {
    buffer: AmiBuffer,
    state: ParseState,
    greeting: Option<String>,
}

impl AmiParser {
    /// Parser for a stream that carries blocks only (HTTP bodies, tests).
    pub fn new() -> Self {
        Self {
            buffer: AmiBuffer::new(),
            state: ParseState::WaitingForBlock,
            greeting: None,
        }
    }

    /// Parser for a fresh TCP session, expecting the
    /// `Asterisk Call Manager/x.y.z` banner first.
    pub fn with_greeting() -> Self {
        Self {
            state: ParseState::WaitingForGreeting,
            ..Self::new()
        }
    }

    #[cfg(test)]
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            buffer: AmiBuffer::with_limit(limit),
            ..Self::new()
        }
    }

    /// Add data to the parser buffer
    pub fn add_data(&mut self, data: &[u8]) -> AmiResult<()> {
        self.buffer
            .extend_from_slice(data);
        self.buffer
            .check_size_limits()
    }

    /// Full banner line, once received.
    pub fn greeting(&self) -> Option<&str> {
        self.greeting
            .as_deref()
    }

    /// Protocol version announced in the banner (`5.0.1` for
    /// `Asterisk Call Manager/5.0.1`).
    pub fn protocol_version(&self) -> Option<&str> {
        self.greeting()?
            .split_once('/')
            .map(|(_, version)| version.trim())
    }

    /// Bytes buffered but not yet forming a complete block.
    pub fn buffered(&self) -> usize {
        self.buffer
            .len()
    }

    fn take_greeting(&mut self) -> bool {
        let line_end = LINE_TERMINATOR.as_bytes();
        let Some(pos) = self
            .buffer
            .find(line_end)
        else {
            if self
                .buffer
                .is_empty()
            {
                return false;
            }
            // A partial banner must not be mistaken for a block.
            let head = String::from_utf8_lossy(self.buffer.data());
            if GREETING_PREFIX.starts_with(head.as_ref()) || head.starts_with(GREETING_PREFIX) {
                return false;
            }
            self.state = ParseState::WaitingForBlock;
            return true;
        };

        let line = String::from_utf8_lossy(&self.buffer.data()[..pos]).into_owned();
        if line.starts_with(GREETING_PREFIX) {
            self.buffer
                .extract_until_pattern(line_end);
            self.buffer
                .compact();
            debug!("[RECV] Greeting: {}", line);
            self.greeting = Some(line);
        } else {
            debug!("[RECV] No greeting banner, reading blocks directly");
        }
        self.state = ParseState::WaitingForBlock;
        true
    }

    /// `true` while the session banner (or the first block standing in for
    /// it) has not fully arrived.
    pub fn awaiting_greeting(&mut self) -> bool {
        self.state == ParseState::WaitingForGreeting && !self.take_greeting()
    }

    /// Next complete raw block, without its terminator.
    ///
    /// Blank lines between blocks are skipped.
    pub fn next_block(&mut self) -> Option<String> {
        if self.awaiting_greeting() {
            return None;
        }
        loop {
            let raw = self
                .buffer
                .extract_until_pattern(BLOCK_TERMINATOR.as_bytes())?;
            self.buffer
                .compact();
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim_start_matches(['\r', '\n']);
            if text.is_empty() {
                trace!("[RECV] Skipping empty block");
                continue;
            }
            return Some(text.to_string());
        }
    }

    /// Try to parse a complete message from the buffer.
    ///
    /// `Ok(None)` means more data is needed. A malformed block is consumed
    /// before its error is returned, so the caller can keep calling.
    pub fn parse_message(&mut self) -> AmiResult<Option<Message>> {
        match self.next_block() {
            Some(raw) => Message::parse(&raw).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for AmiParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AmiError;

    #[test]
    fn test_parse_single_block() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Response: Success\r\nActionID: 1\r\nPing: Pong\r\n\r\n")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(message.action_id(), Some("1"));
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_incomplete_block() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Event: PeerStatus\r\nPeer: SIP/100\r\n")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
        parser
            .add_data(b"\r\n")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(message.header("Peer"), Some("SIP/100"));
    }

    #[test]
    fn test_terminator_split_across_chunks() {
        let data = b"Event: PeerStatus\r\nPeer: SIP/100\r\n\r\n";
        // Split at every position inside the terminator and elsewhere.
        for split in 1..data.len() {
            let mut parser = AmiParser::new();
            parser
                .add_data(&data[..split])
                .unwrap();
            let mut messages = Vec::new();
            while let Some(m) = parser
                .parse_message()
                .unwrap()
            {
                messages.push(m);
            }
            parser
                .add_data(&data[split..])
                .unwrap();
            while let Some(m) = parser
                .parse_message()
                .unwrap()
            {
                messages.push(m);
            }
            assert_eq!(messages.len(), 1, "split at {split}");
            assert_eq!(messages[0].matches(), Some("PeerStatus"));
            assert_eq!(parser.buffered(), 0);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let data = b"Event: A\r\n\r\nEvent: B\r\nX: 1\r\n\r\nResponse: Success\r\n\r\n";
        let mut parser = AmiParser::new();
        let mut names = Vec::new();
        for byte in data.iter() {
            parser
                .add_data(std::slice::from_ref(byte))
                .unwrap();
            while let Some(m) = parser
                .parse_message()
                .unwrap()
            {
                names.push(
                    m.matches()
                        .or(m.response())
                        .unwrap()
                        .to_string(),
                );
            }
        }
        assert_eq!(names, ["A", "B", "Success"]);
    }

    #[test]
    fn test_malformed_block_does_not_stall() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"garbage line\r\n\r\nEvent: PeerStatus\r\n\r\n")
            .unwrap();
        assert!(matches!(
            parser.parse_message(),
            Err(AmiError::MalformedMessage { .. })
        ));
        let next = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(next.matches(), Some("PeerStatus"));
    }

    #[test]
    fn test_greeting_consumed() {
        let mut parser = AmiParser::with_greeting();
        parser
            .add_data(b"Asterisk Call Manager/5.0.1\r\nResponse: Success\r\n\r\n")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert!(message.success());
        assert_eq!(parser.greeting(), Some("Asterisk Call Manager/5.0.1"));
        assert_eq!(parser.protocol_version(), Some("5.0.1"));
    }

    #[test]
    fn test_greeting_split() {
        let mut parser = AmiParser::with_greeting();
        parser
            .add_data(b"Asterisk Call Man")
            .unwrap();
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
        parser
            .add_data(b"ager/2.10.4\r\nEvent: FullyBooted\r\n\r\n")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(message.matches(), Some("FullyBooted"));
        assert_eq!(parser.protocol_version(), Some("2.10.4"));
    }

    #[test]
    fn test_awaiting_greeting() {
        let mut parser = AmiParser::with_greeting();
        assert!(parser.awaiting_greeting());
        parser
            .add_data(b"Asterisk Call Manager/5.0.1")
            .unwrap();
        assert!(parser.awaiting_greeting());
        parser
            .add_data(b"\r\n")
            .unwrap();
        assert!(!parser.awaiting_greeting());
        assert_eq!(parser.buffered(), 0);
        assert!(!AmiParser::new().awaiting_greeting());
    }

    #[test]
    fn test_missing_greeting_reads_blocks() {
        let mut parser = AmiParser::with_greeting();
        parser
            .add_data(b"Event: FullyBooted\r\n\r\n")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(message.matches(), Some("FullyBooted"));
        assert_eq!(parser.greeting(), None);
    }

    #[test]
    fn test_blank_lines_between_blocks_skipped() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Event: A\r\n\r\n\r\n\r\nEvent: B\r\n\r\n")
            .unwrap();
        assert_eq!(
            parser
                .parse_message()
                .unwrap()
                .unwrap()
                .matches(),
            Some("A")
        );
        assert_eq!(
            parser
                .parse_message()
                .unwrap()
                .unwrap()
                .matches(),
            Some("B")
        );
        assert!(parser
            .parse_message()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_buffer_limit() {
        let mut parser = AmiParser::with_limit(16);
        assert!(matches!(
            parser.add_data(&[b'x'; 17]),
            Err(AmiError::BufferOverflow { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let mut parser = AmiParser::new();
        parser
            .add_data(b"Event: X\r\nName: caf\xff\r\n\r\n")
            .unwrap();
        let message = parser
            .parse_message()
            .unwrap()
            .unwrap();
        assert_eq!(message.header("Name"), Some("caf\u{FFFD}"));
    }
}
