//! Connection state machine and response correlation

use crate::{
    action::Action,
    error::{AmiError, AmiResult},
    message::{Message, MessageKind},
    protocol::AmiParser,
};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, trace, warn};

/// Write half of a transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionState {
    /// No transport.
    Disconnected,
    /// Transport being established or authenticated.
    Connecting,
    /// Accepting writes and incoming bytes.
    Connected,
    /// Shutting down; pending actions are being failed.
    Closing,
    /// Finished. No further writes or reads.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An in-flight action waiting for its reply.
enum Pending {
    Single(oneshot::Sender<AmiResult<Message>>),
    /// `EventList` action: the response plus every event carrying the same
    /// `ActionID`, until the list-complete event.
    List {
        collected: Vec<Message>,
        tx: oneshot::Sender<AmiResult<Vec<Message>>>,
    },
}

impl Pending {
    fn fail(self) {
        match self {
            Pending::Single(tx) => {
                let _ = tx.send(Err(AmiError::ConnectionClosed));
            }
            Pending::List { tx, .. } => {
                let _ = tx.send(Err(AmiError::ConnectionClosed));
            }
        }
    }
}

/// Future resolving to the response whose `ActionID` matches the sent action.
///
/// Resolves to `Err(AmiError::ConnectionClosed)` if the connection goes away
/// first.
#[derive(Debug)]
#[must_use = "the response is only delivered when awaited"]
pub struct PendingResponse {
    action_id: String,
    rx: oneshot::Receiver<AmiResult<Message>>,
}

impl PendingResponse {
    /// Correlation id this future waits for.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub(crate) fn ready(action_id: String, result: AmiResult<Message>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { action_id, rx }
    }
}

impl Future for PendingResponse {
    type Output = AmiResult<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(AmiError::ConnectionClosed)))
    }
}

/// Future resolving to every message of an `EventList` action.
#[derive(Debug)]
#[must_use = "the responses are only delivered when awaited"]
pub struct PendingList {
    action_id: String,
    rx: oneshot::Receiver<AmiResult<Vec<Message>>>,
}

impl PendingList {
    /// Correlation id this future waits for.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }
}

impl Future for PendingList {
    type Output = AmiResult<Vec<Message>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(AmiError::ConnectionClosed)))
    }
}

/// One AMI session over a byte stream.
///
/// Owns the writer, the block reassembler and the pending-response table.
/// Incoming bytes are pushed in with [`on_bytes_received`](Self::on_bytes_received)
/// by whoever reads the transport; replies resolve their [`PendingResponse`]
/// and unsolicited events are handed back for dispatch.
pub struct Connection {
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<BoxedWriter>>,
    parser: SyncMutex<AmiParser>,
    pending: SyncMutex<HashMap<String, Pending>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Connection {
    /// Wrap a connected transport.
    pub fn new(writer: BoxedWriter, parser: AmiParser) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connected);
        Self {
            state,
            writer: Mutex::new(Some(writer)),
            parser: SyncMutex::new(parser),
            pending: SyncMutex::new(HashMap::new()),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self
            .state
            .borrow()
    }

    /// Whether writes and reads are accepted.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state
            .subscribe()
    }

    /// Actions still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .len()
    }

    /// Banner line received at session start, if any.
    pub fn greeting(&self) -> Option<String> {
        self.parser
            .lock()
            .greeting()
            .map(str::to_owned)
    }

    /// Feed received bytes; returns the unsolicited events found.
    ///
    /// Complete blocks are parsed and routed; partial data stays buffered.
    /// Malformed blocks are logged and skipped. Only a buffer overflow or a
    /// closed connection is an error.
    pub fn on_bytes_received(&self, chunk: &[u8]) -> AmiResult<Vec<Message>> {
        if !self.is_connected() {
            return Err(AmiError::ConnectionClosed);
        }
        self.parser
            .lock()
            .add_data(chunk)?;
        Ok(self.drain_buffered())
    }

    /// Parse and route every complete block already buffered; returns the
    /// unsolicited events found.
    ///
    /// Blocks that arrived together with the greeting sit in the parser
    /// until this runs.
    pub fn drain_buffered(&self) -> Vec<Message> {
        let messages = {
            let mut parser = self
                .parser
                .lock();
            let mut messages = Vec::new();
            loop {
                match parser.parse_message() {
                    Ok(Some(message)) => messages.push(message),
                    Ok(None) => break,
                    Err(e) => warn!("[RECV] Dropping block: {}", e),
                }
            }
            messages
        };

        messages
            .into_iter()
            .filter_map(|m| self.route(m))
            .collect()
    }

    /// Deliver a message to its pending entry, or return it when it is an
    /// event nobody waits for.
    pub(crate) fn route(&self, message: Message) -> Option<Message> {
        if let Some(id) = message
            .action_id()
            .map(str::to_owned)
        {
            let mut pending = self
                .pending
                .lock();
            match pending.remove(&id) {
                Some(Pending::Single(tx)) => {
                    drop(pending);
                    trace!("[RECV] Resolved action {}", id);
                    let _ = tx.send(Ok(message));
                    return None;
                }
                Some(Pending::List { mut collected, tx }) => {
                    let done = !message.success()
                        || message.is_list_end()
                        || (collected.is_empty()
                            && message.kind() == MessageKind::Response
                            && message
                                .event_list()
                                .is_none());
                    collected.push(message);
                    if done {
                        drop(pending);
                        trace!("[RECV] Completed list action {} ({} messages)", id, collected.len());
                        let _ = tx.send(Ok(collected));
                    } else {
                        pending.insert(id, Pending::List { collected, tx });
                    }
                    return None;
                }
                None => {}
            }
        }

        if message.is_event() {
            Some(message)
        } else {
            debug!(
                "[RECV] Dropping unmatched {:?} (ActionID {:?})",
                message.kind(),
                message.action_id()
            );
            None
        }
    }

    fn register(&self, action_id: &str, entry: Pending) -> AmiResult<()> {
        let mut pending = self
            .pending
            .lock();
        if !self.is_connected() {
            return Err(AmiError::ConnectionClosed);
        }
        if pending.contains_key(action_id) {
            return Err(AmiError::protocol_error(format!(
                "ActionID {} is already awaiting a response",
                action_id
            )));
        }
        pending.insert(action_id.to_string(), entry);
        Ok(())
    }

    fn unregister(&self, action_id: &str) {
        self.pending
            .lock()
            .remove(action_id);
    }

    async fn write(&self, bytes: &[u8]) -> AmiResult<()> {
        if !self.is_connected() {
            return Err(AmiError::ConnectionClosed);
        }
        let mut guard = self
            .writer
            .lock()
            .await;
        let writer = guard
            .as_mut()
            .ok_or(AmiError::ConnectionClosed)?;
        writer
            .write_all(bytes)
            .await?;
        writer
            .flush()
            .await?;
        Ok(())
    }

    /// Send an action; the returned future resolves with its response.
    ///
    /// The pending entry exists before the first byte is written, so a reply
    /// can never overtake its registration.
    pub async fn send(&self, action: &Action) -> AmiResult<PendingResponse> {
        let wire = action.to_wire_format()?;
        let action_id = action
            .id()
            .to_string();
        let (tx, rx) = oneshot::channel();
        self.register(&action_id, Pending::Single(tx))?;

        debug!("[SEND] {}", action.name().unwrap_or("?"));
        trace!("[SEND] {}", action);
        if let Err(e) = self
            .write(wire.as_bytes())
            .await
        {
            self.unregister(&action_id);
            return Err(e);
        }
        Ok(PendingResponse { action_id, rx })
    }

    /// Send an action answered by `EventList: start` followed by events.
    pub async fn send_list(&self, action: &Action) -> AmiResult<PendingList> {
        let wire = action.to_wire_format()?;
        let action_id = action
            .id()
            .to_string();
        let (tx, rx) = oneshot::channel();
        self.register(
            &action_id,
            Pending::List {
                collected: Vec::new(),
                tx,
            },
        )?;

        debug!("[SEND] {} (list)", action.name().unwrap_or("?"));
        if let Err(e) = self
            .write(wire.as_bytes())
            .await
        {
            self.unregister(&action_id);
            return Err(e);
        }
        Ok(PendingList { action_id, rx })
    }

    /// Write pre-serialized bytes without correlation.
    pub async fn send_raw(&self, bytes: &[u8]) -> AmiResult<()> {
        self.write(bytes)
            .await
    }

    /// Forget the pending entry of an action whose caller stopped waiting.
    pub(crate) fn cancel(&self, action_id: &str) {
        self.unregister(action_id);
    }

    /// Fail every pending action with `ConnectionClosed`; returns how many.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .drain()
            .map(|(_, p)| p)
            .collect();
        let count = drained.len();
        for entry in drained {
            entry.fail();
        }
        if count > 0 {
            debug!("Failed {} pending action(s): connection closed", count);
        }
        count
    }

    /// The transport ended underneath us (EOF or read error).
    pub fn on_transport_closed(&self) {
        self.state
            .send_replace(ConnectionState::Closed);
        self.fail_all();
    }

    /// Close the session: fail pending actions and shut the writer down.
    /// Safe to call repeatedly.
    pub async fn close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.state
            .send_replace(ConnectionState::Closing);
        self.fail_all();
        if let Some(mut writer) = self
            .writer
            .lock()
            .await
            .take()
        {
            if let Err(e) = writer
                .shutdown()
                .await
            {
                debug!("Writer shutdown failed: {}", e);
            }
        }
        self.state
            .send_replace(ConnectionState::Closed);
    }
}
