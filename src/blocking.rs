//! Blocking TCP session for [`ExecutionMode::Sync`](crate::ExecutionMode::Sync)
//!
//! No runtime and no background tasks: every call writes, then reads from the
//! socket until the matching response arrives. Events read along the way are
//! handed back to the caller for dispatch.

use crate::{
    action::Action,
    config::ManagerOptions,
    constants::SOCKET_BUF_SIZE,
    error::{AmiError, AmiResult},
    message::{Message, MessageKind},
    protocol::AmiParser,
};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

fn tcp_connect_with_timeout(host: &str, port: u16, timeout: Duration) -> AmiResult<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!("[CONNECT] TCP connection established to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                warn!("[CONNECT] TCP connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    match last_err {
        Some(e) if e.kind() == ErrorKind::TimedOut => Err(AmiError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        }),
        Some(e) => Err(AmiError::Io(e)),
        None => Err(AmiError::transport_unavailable(format!(
            "{}:{} resolved to no address",
            host, port
        ))),
    }
}

fn read_error(e: std::io::Error, timeout: Option<Duration>) -> AmiError {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => AmiError::Timeout {
            timeout_ms: timeout.map_or(0, |t| t.as_millis() as u64),
        },
        _ => AmiError::Io(e),
    }
}

/// One AMI session over a blocking [`TcpStream`].
#[derive(Debug)]
pub(crate) struct BlockingSession {
    stream: TcpStream,
    parser: AmiParser,
    read_timeout: Option<Duration>,
}

impl BlockingSession {
    /// Connect, read the banner and log in when credentials are configured.
    ///
    /// Also returns the events received before the login response.
    pub(crate) fn connect(options: &ManagerOptions) -> AmiResult<(Self, Vec<Message>)> {
        info!(
            "[CONNECT] Connecting to Asterisk at {}:{} (blocking)",
            options.host, options.port
        );
        let stream = tcp_connect_with_timeout(&options.host, options.port, options.connect_timeout())?;
        stream.set_nodelay(true)?;

        let mut session = Self {
            stream,
            parser: AmiParser::with_greeting(),
            read_timeout: Some(options.connect_timeout()),
        };
        session
            .stream
            .set_read_timeout(session.read_timeout)?;
        while session
            .parser
            .awaiting_greeting()
        {
            session.fill()?;
        }
        if let Some(greeting) = session
            .parser
            .greeting()
        {
            info!("[CONNECT] {}", greeting);
        }

        let mut early = Vec::new();
        if options.has_credentials() {
            let login = Action::login(&options.username, &options.secret, &options.events);
            let (response, events) = session.send_action(&login)?;
            early = events;
            if !response.success() {
                let reason = response
                    .message_text()
                    .unwrap_or("login rejected")
                    .to_string();
                warn!("[AUTH] Login as {} failed: {}", options.username, reason);
                session.close();
                return Err(AmiError::auth_failed(reason));
            }
            info!("[AUTH] Logged in as {}", options.username);
        }

        session.read_timeout = options.action_timeout();
        session
            .stream
            .set_read_timeout(session.read_timeout)?;
        Ok((session, early))
    }

    /// Banner line received at connect.
    pub(crate) fn greeting(&self) -> Option<&str> {
        self.parser
            .greeting()
    }

    fn fill(&mut self) -> AmiResult<()> {
        let mut buf = [0u8; SOCKET_BUF_SIZE];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| read_error(e, self.read_timeout))?;
        if n == 0 {
            info!("[RECV] Connection closed (EOF)");
            return Err(AmiError::ConnectionClosed);
        }
        self.parser
            .add_data(&buf[..n])
    }

    fn next_message(&mut self) -> AmiResult<Message> {
        loop {
            match self
                .parser
                .parse_message()
            {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => self.fill()?,
                Err(e) => warn!("[RECV] Dropping block: {}", e),
            }
        }
    }

    fn write_action(&mut self, action: &Action) -> AmiResult<()> {
        let wire = action.to_wire_format()?;
        debug!("[SEND] {} (blocking)", action.name().unwrap_or("?"));
        trace!("[SEND] {}", action);
        self.stream
            .write_all(wire.as_bytes())?;
        self.stream
            .flush()?;
        Ok(())
    }

    /// Send an action and read until its response; returns the response and
    /// the events received meanwhile.
    pub(crate) fn send_action(&mut self, action: &Action) -> AmiResult<(Message, Vec<Message>)> {
        self.write_action(action)?;
        let mut events = Vec::new();
        loop {
            let message = self.next_message()?;
            if message.action_id() == Some(action.id()) {
                return Ok((message, events));
            }
            if message.is_event() {
                events.push(message);
            } else {
                debug!("[RECV] Dropping unmatched {:?}", message.kind());
            }
        }
    }

    /// Send an `EventList` action and collect its messages up to the
    /// list-complete event.
    pub(crate) fn send_list(&mut self, action: &Action) -> AmiResult<(Vec<Message>, Vec<Message>)> {
        self.write_action(action)?;
        let mut collected: Vec<Message> = Vec::new();
        let mut events = Vec::new();
        loop {
            let message = self.next_message()?;
            if message.action_id() != Some(action.id()) {
                if message.is_event() {
                    events.push(message);
                }
                continue;
            }
            let done = !message.success()
                || message.is_list_end()
                || (collected.is_empty()
                    && message.kind() == MessageKind::Response
                    && message
                        .event_list()
                        .is_none());
            collected.push(message);
            if done {
                return Ok((collected, events));
            }
        }
    }

    /// Shut the socket down. Safe to call twice.
    pub(crate) fn close(&mut self) {
        if let Err(e) = self
            .stream
            .shutdown(Shutdown::Both)
        {
            debug!("Socket shutdown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;

    fn read_block(reader: &mut impl BufRead) -> Vec<(String, String)> {
        let mut fields = Vec::new();
        loop {
            let mut line = String::new();
            if reader
                .read_line(&mut line)
                .unwrap()
                == 0
            {
                return fields;
            }
            let line = line.trim_end();
            if line.is_empty() {
                return fields;
            }
            let (k, v) = line
                .split_once(": ")
                .unwrap();
            fields.push((k.to_string(), v.to_string()));
        }
    }

    fn action_id(fields: &[(String, String)]) -> String {
        fields
            .iter()
            .find(|(k, _)| k == "ActionID")
            .map(|(_, v)| v.clone())
            .unwrap()
    }

    fn serve(handler: impl FnOnce(TcpStream) + Send + 'static) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener
            .local_addr()
            .unwrap()
            .port();
        thread::spawn(move || {
            let (stream, _) = listener
                .accept()
                .unwrap();
            handler(stream);
        });
        port
    }

    #[test]
    fn test_connect_login_and_ping() {
        let port = serve(|stream| {
            let mut writer = stream
                .try_clone()
                .unwrap();
            let mut reader = std::io::BufReader::new(stream);
            writer
                .write_all(b"Asterisk Call Manager/5.0.1\r\nEvent: FullyBooted\r\nStatus: ok\r\n\r\n")
                .unwrap();
            let login = read_block(&mut reader);
            assert!(login.contains(&("Secret".to_string(), "pw".to_string())));
            write!(
                writer,
                "Response: Success\r\nActionID: {}\r\nMessage: Authentication accepted\r\n\r\n",
                action_id(&login)
            )
            .unwrap();
            let ping = read_block(&mut reader);
            write!(
                writer,
                "Event: PeerStatus\r\nPeer: SIP/1\r\n\r\nResponse: Success\r\nActionID: {}\r\nPing: Pong\r\n\r\n",
                action_id(&ping)
            )
            .unwrap();
        });

        let options = ManagerOptions::new("127.0.0.1", "admin", "pw").with_port(port);
        let (mut session, early) = BlockingSession::connect(&options).unwrap();
        assert_eq!(session.greeting(), Some("Asterisk Call Manager/5.0.1"));
        assert_eq!(early.len(), 1);
        assert_eq!(early[0].matches(), Some("FullyBooted"));
        let (response, events) = session
            .send_action(&Action::ping())
            .unwrap();
        assert_eq!(response.header("Ping"), Some("Pong"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].matches(), Some("PeerStatus"));
        session.close();
        session.close();
    }

    #[test]
    fn test_login_rejected() {
        let port = serve(|stream| {
            let mut writer = stream
                .try_clone()
                .unwrap();
            let mut reader = std::io::BufReader::new(stream);
            writer
                .write_all(b"Asterisk Call Manager/5.0.1\r\n")
                .unwrap();
            let login = read_block(&mut reader);
            write!(
                writer,
                "Response: Error\r\nActionID: {}\r\nMessage: Authentication failed\r\n\r\n",
                action_id(&login)
            )
            .unwrap();
        });
        let options = ManagerOptions::new("127.0.0.1", "admin", "bad").with_port(port);
        match BlockingSession::connect(&options) {
            Err(AmiError::AuthFailed { reason }) => assert_eq!(reason, "Authentication failed"),
            other => panic!("expected AuthFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_refused_port() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener
                .local_addr()
                .unwrap()
                .port()
        };
        let options = ManagerOptions::new("127.0.0.1", "", "").with_port(port);
        let err = BlockingSession::connect(&options).unwrap_err();
        assert!(err.is_connection_error(), "{:?}", err);
    }
}
