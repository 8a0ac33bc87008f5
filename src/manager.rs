//! Top-level AMI client: connection lifecycle, actions and event dispatch

use crate::{
    action::{Action, IdGenerator},
    blocking::BlockingSession,
    config::{ExecutionMode, ManagerOptions, Transport},
    connection::{Connection, ConnectionState, PendingResponse},
    constants::SOCKET_BUF_SIZE,
    error::{AmiError, AmiResult},
    http::{BlockingHttpTransport, HttpTransport},
    message::Message,
    protocol::AmiParser,
    registry::{Dispatch, EventRegistry},
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16, limit: Duration) -> AmiResult<TcpStream> {
    let tcp_result = timeout(limit, TcpStream::connect((host, port))).await;

    match tcp_result {
        Ok(Ok(s)) => {
            debug!("[CONNECT] TCP connection established");
            Ok(s)
        }
        Ok(Err(e)) => {
            warn!("[CONNECT] TCP connect failed: {}", e);
            Err(AmiError::Io(e))
        }
        Err(_) => {
            warn!(
                "[CONNECT] TCP connect timed out after {}ms",
                limit.as_millis()
            );
            Err(AmiError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}

/// Read until the banner line (or a first block in its place) is buffered.
async fn read_greeting(
    reader: &mut OwnedReadHalf,
    parser: &mut AmiParser,
    limit: Duration,
) -> AmiResult<()> {
    let wait = async {
        let mut buf = [0u8; 1024];
        while parser.awaiting_greeting() {
            let n = reader
                .read(&mut buf)
                .await?;
            if n == 0 {
                return Err(AmiError::ConnectionClosed);
            }
            parser.add_data(&buf[..n])?;
        }
        Ok(())
    };
    match timeout(limit, wait).await {
        Ok(result) => result,
        Err(_) => {
            warn!("[CONNECT] No greeting within {}ms", limit.as_millis());
            Err(AmiError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })
        }
    }
}

async fn reader_loop(reader: OwnedReadHalf, connection: Arc<Connection>, manager: Weak<ManagerInner>) {
    let result = std::panic::AssertUnwindSafe(reader_loop_inner(
        reader,
        connection.clone(),
        manager.clone(),
    ));
    if futures_util::FutureExt::catch_unwind(result)
        .await
        .is_err()
    {
        error!("reader task panicked");
    }
    connection.on_transport_closed();
    if let Some(inner) = manager.upgrade() {
        let manager = Manager { inner };
        manager.on_connection_lost(&connection);
    }
}

async fn reader_loop_inner(
    mut reader: OwnedReadHalf,
    connection: Arc<Connection>,
    manager: Weak<ManagerInner>,
) {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];

    loop {
        match reader
            .read(&mut read_buffer)
            .await
        {
            Ok(0) => {
                info!("[RECV] Connection closed (EOF)");
                return;
            }
            Ok(n) => {
                let events = match connection.on_bytes_received(&read_buffer[..n]) {
                    Ok(events) => events,
                    Err(AmiError::ConnectionClosed) => {
                        debug!("[RECV] Connection closed locally, reader exiting");
                        return;
                    }
                    Err(e) => {
                        warn!("[RECV] {}", e);
                        return;
                    }
                };
                if events.is_empty() {
                    continue;
                }
                let Some(inner) = manager.upgrade() else {
                    debug!("Manager dropped, reader exiting");
                    return;
                };
                let manager = Manager { inner };
                for event in &events {
                    manager.dispatch(event);
                }
            }
            Err(e) => {
                warn!("[RECV] Read error: {}", e);
                return;
            }
        }
    }
}

async fn keepalive_loop(weak: Weak<ManagerInner>, delay: Duration) {
    let mut ticker = tokio::time::interval(delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
        .tick()
        .await;
    loop {
        ticker
            .tick()
            .await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let manager = Manager { inner };
        if manager.is_closed() {
            return;
        }
        if !manager.is_connected() {
            continue;
        }
        match manager
            .send_action(manager.action([("Action", "Ping")]))
            .await
        {
            Ok(response) if response.success() => trace!("[PING] Pong"),
            Ok(response) => warn!(
                "[PING] Server answered {}",
                response
                    .response()
                    .unwrap_or("?")
            ),
            Err(e) => debug!("[PING] Failed: {}", e),
        }
    }
}

struct ManagerInner {
    options: ManagerOptions,
    registry: Arc<EventRegistry>,
    ids: IdGenerator,
    status: watch::Sender<ConnectionState>,
    connection: Mutex<Option<Arc<Connection>>>,
    http: Mutex<Option<Arc<HttpTransport>>>,
    blocking: Mutex<Option<BlockingSession>>,
    blocking_http: Mutex<Option<Arc<BlockingHttpTransport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    server_version: Mutex<Option<String>>,
    keepalive: AtomicBool,
    closed: AtomicBool,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .drain(..)
        {
            task.abort();
        }
    }
}

/// AMI client.
///
/// Cheap to clone; clones share one session. Owns the event registry, the
/// `ActionID` generator and the connection, and in async TCP mode the reader,
/// keepalive and reconnect tasks.
///
/// ```rust,no_run
/// use asterisk_ami_tokio::{Manager, ManagerOptions, AmiError};
///
/// #[tokio::main]
/// async fn main() -> Result<(), AmiError> {
///     let manager = Manager::new(ManagerOptions::new("127.0.0.1", "admin", "secret"));
///     manager.register_event("Peer*", |event, _manager| {
///         println!("{}: {:?}", event.matches().unwrap_or("?"), event.header("Peer"));
///     });
///     manager.connect().await?;
///
///     let uptime = manager.command("core show uptime").await?;
///     for line in uptime.iter_lines() {
///         println!("{}", line);
///     }
///     manager.close().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("options", &self.inner.options)
            .field("status", &self.status())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl Manager {
    /// Create an unconnected manager. Spawns nothing.
    pub fn new(options: ManagerOptions) -> Self {
        Self::with_registry(options, Arc::new(EventRegistry::new()))
    }

    /// Create a manager dispatching through an existing registry.
    pub fn with_registry(options: ManagerOptions, registry: Arc<EventRegistry>) -> Self {
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ManagerInner {
                options,
                registry,
                ids: IdGenerator::new(),
                status,
                connection: Mutex::new(None),
                http: Mutex::new(None),
                blocking: Mutex::new(None),
                blocking_http: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                server_version: Mutex::new(None),
                keepalive: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Registry consulted for every incoming event.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.inner.registry
    }

    /// Build an action whose `ActionID` comes from this manager's generator.
    pub fn action<I, K, V>(&self, fields: I) -> Action
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Action::with_id_generator(fields, &self.inner.ids)
    }

    /// Current connection status snapshot.
    pub fn status(&self) -> ConnectionState {
        *self
            .inner
            .status
            .borrow()
    }

    /// Watch status transitions (connect, drop, reconnect, close).
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionState> {
        self.inner
            .status
            .subscribe()
    }

    /// Whether actions can be sent right now.
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionState::Connected
    }

    fn is_closed(&self) -> bool {
        self.inner
            .closed
            .load(Ordering::SeqCst)
    }

    /// Banner of the last TCP session, e.g. `Asterisk Call Manager/5.0.1`.
    pub fn server_version(&self) -> Option<String> {
        self.inner
            .server_version
            .lock()
            .clone()
    }

    fn set_status(&self, state: ConnectionState) {
        if !self.is_closed() {
            self.inner
                .status
                .send_replace(state);
        }
    }

    fn ensure_open(&self) -> AmiResult<()> {
        if self.is_closed() {
            return Err(AmiError::ConnectionClosed);
        }
        Ok(())
    }

    fn require_mode(&self, mode: ExecutionMode) -> AmiResult<()> {
        if self.inner.options.mode == mode {
            return Ok(());
        }
        Err(AmiError::WrongMode {
            required: match mode {
                ExecutionMode::Async => "async",
                ExecutionMode::Sync => "sync",
            },
        })
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self
            .inner
            .tasks
            .lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    fn connection(&self) -> AmiResult<Arc<Connection>> {
        self.inner
            .connection
            .lock()
            .clone()
            .ok_or(AmiError::NotConnected)
    }

    /// Remove `connection` from the slot if it is still the current one.
    fn detach(&self, connection: &Arc<Connection>) -> bool {
        let mut slot = self
            .inner
            .connection
            .lock();
        if slot
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, connection))
        {
            *slot = None;
            true
        } else {
            false
        }
    }

    /// Connect (and log in when a username is configured).
    ///
    /// In [`ExecutionMode::Sync`] this runs [`connect_blocking`](Self::connect_blocking)
    /// and never spawns a task. Sync mode over HTTP must be driven outside a
    /// tokio runtime; inside one it fails with [`AmiError::WrongMode`].
    pub async fn connect(&self) -> AmiResult<()> {
        self.ensure_open()?;
        if self.inner.options.mode == ExecutionMode::Sync {
            return self.connect_blocking();
        }
        self.establish()
            .await?;
        self.start_keepalive();
        Ok(())
    }

    async fn establish(&self) -> AmiResult<()> {
        self.set_status(ConnectionState::Connecting);
        let result = match &self.inner.options.transport {
            Transport::Tcp => {
                self.connect_tcp()
                    .await
            }
            Transport::Http { url } => {
                self.connect_http(url)
                    .await
            }
        };
        match result {
            Ok(()) if self.is_closed() => {
                let current = self
                    .inner
                    .connection
                    .lock()
                    .take();
                if let Some(connection) = current {
                    connection
                        .close()
                        .await;
                }
                Err(AmiError::ConnectionClosed)
            }
            Ok(()) => {
                self.set_status(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("[CONNECT] {}", e);
                self.set_status(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect_tcp(&self) -> AmiResult<()> {
        let options = &self.inner.options;
        info!(
            "[CONNECT] Connecting to Asterisk at {}:{}",
            options.host, options.port
        );
        let stream =
            tcp_connect_with_timeout(&options.host, options.port, options.connect_timeout()).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[CONNECT] Could not set TCP_NODELAY: {}", e);
        }
        let (mut read_half, write_half) = stream.into_split();

        let mut parser = AmiParser::with_greeting();
        read_greeting(&mut read_half, &mut parser, options.connect_timeout()).await?;

        let connection = Arc::new(Connection::new(Box::new(write_half), parser));
        let version = connection.greeting();
        if let Some(greeting) = &version {
            info!("[CONNECT] {}", greeting);
        }
        *self
            .inner
            .server_version
            .lock() = version;

        let previous = self
            .inner
            .connection
            .lock()
            .replace(connection.clone());
        if let Some(previous) = previous {
            previous
                .close()
                .await;
        }

        // Blocks sent right behind the banner are already in the parser.
        for event in connection.drain_buffered() {
            self.dispatch(&event);
        }

        let handle = tokio::spawn(reader_loop(
            read_half,
            connection.clone(),
            Arc::downgrade(&self.inner),
        ));
        self.track(handle);

        if options.has_credentials() {
            if let Err(e) = self
                .login(&connection)
                .await
            {
                self.detach(&connection);
                connection
                    .close()
                    .await;
                return Err(e);
            }
        }
        Ok(())
    }

    async fn login(&self, connection: &Connection) -> AmiResult<()> {
        let options = &self.inner.options;
        let action = self.action([
            ("Action", "Login"),
            ("Username", options.username.as_str()),
            ("Secret", options.secret.as_str()),
            ("Events", options.events.as_str()),
        ]);
        debug!("[AUTH] Logging in as {}", options.username);

        let pending = connection
            .send(&action)
            .await?;
        let limit = options.connect_timeout();
        let response = match timeout(limit, pending).await {
            Ok(result) => result?,
            Err(_) => {
                connection.cancel(action.id());
                return Err(AmiError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        };
        if !response.success() {
            let reason = response
                .message_text()
                .unwrap_or("login rejected")
                .to_string();
            warn!("[AUTH] Login as {} failed: {}", options.username, reason);
            return Err(AmiError::auth_failed(reason));
        }
        info!("[AUTH] Logged in as {}", options.username);
        Ok(())
    }

    async fn connect_http(&self, url: &str) -> AmiResult<()> {
        let options = &self.inner.options;
        info!("[CONNECT] Using Asterisk HTTP manager at {}", url);
        let http = Arc::new(HttpTransport::new(url, options.connect_timeout())?);

        if options.has_credentials() {
            let login = Action::login(&options.username, &options.secret, &options.events);
            let response = self.take_response(
                &login,
                http.exchange(&login)
                    .await,
            );
            if !response.success() {
                let reason = response
                    .message_text()
                    .unwrap_or("login rejected")
                    .to_string();
                warn!("[AUTH] Login as {} failed: {}", options.username, reason);
                return Err(AmiError::auth_failed(reason));
            }
            info!("[AUTH] Logged in as {} over HTTP", options.username);
        }

        *self
            .inner
            .http
            .lock() = Some(http);
        Ok(())
    }

    /// First message answers `action`; the rest are dispatched as events.
    fn take_response(&self, action: &Action, messages: Vec<Message>) -> Message {
        let mut messages = messages.into_iter();
        let response = messages
            .next()
            .unwrap_or_else(|| Message::error_response(Some(action.id()), "empty response"));
        for event in messages {
            self.dispatch(&event);
        }
        response
    }

    /// Messages carrying `action`'s id are the list; the rest are dispatched.
    fn take_list(&self, action: &Action, messages: Vec<Message>) -> Vec<Message> {
        let (list, others): (Vec<Message>, Vec<Message>) = messages
            .into_iter()
            .partition(|m| m.action_id() == Some(action.id()));
        for event in &others {
            self.dispatch(event);
        }
        if list.is_empty() {
            return vec![Message::error_response(
                Some(action.id()),
                "no response for action",
            )];
        }
        list
    }

    fn start_keepalive(&self) {
        let Some(delay) = self
            .inner
            .options
            .ping_delay()
        else {
            return;
        };
        if self
            .inner
            .keepalive
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        debug!("[PING] Keepalive every {}ms", delay.as_millis());
        let handle = tokio::spawn(keepalive_loop(Arc::downgrade(&self.inner), delay));
        self.track(handle);
    }

    fn on_connection_lost(&self, connection: &Arc<Connection>) {
        if !self.detach(connection) || self.is_closed() {
            return;
        }
        warn!("[CONNECT] Connection to {} lost", self.inner.options.host);
        self.set_status(ConnectionState::Disconnected);
        if self.inner.options.reconnect {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(&self) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self
            .inner
            .options
            .reconnect_delay();
        let handle = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                tokio::time::sleep(delay).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let manager = Manager { inner };
                if manager.is_closed() {
                    return;
                }
                attempt += 1;
                info!("[CONNECT] Reconnect attempt {}", attempt);
                match manager
                    .establish()
                    .await
                {
                    Ok(()) => {
                        info!("[CONNECT] Reconnected after {} attempt(s)", attempt);
                        return;
                    }
                    Err(AmiError::ConnectionClosed) if manager.is_closed() => return,
                    Err(e) => warn!("[CONNECT] Reconnect failed: {}", e),
                }
            }
        });
        self.track(handle);
    }

    async fn bounded<T>(
        &self,
        action_id: &str,
        pending: impl Future<Output = AmiResult<T>>,
    ) -> AmiResult<T> {
        let Some(limit) = self
            .inner
            .options
            .action_timeout()
        else {
            return pending.await;
        };
        match timeout(limit, pending).await {
            Ok(result) => result,
            Err(_) => {
                let current = self
                    .inner
                    .connection
                    .lock()
                    .clone();
                if let Some(connection) = current {
                    connection.cancel(action_id);
                }
                Err(AmiError::Timeout {
                    timeout_ms: limit.as_millis() as u64,
                })
            }
        }
    }

    /// Send an action and return the future of its response.
    ///
    /// The action is on the wire (or, over HTTP, already answered) when this
    /// returns.
    pub async fn submit(&self, action: Action) -> AmiResult<PendingResponse> {
        self.ensure_open()?;
        self.require_mode(ExecutionMode::Async)?;

        let http = self
            .inner
            .http
            .lock()
            .clone();
        if let Some(http) = http {
            let messages = http
                .exchange(&action)
                .await;
            let response = self.take_response(&action, messages);
            return Ok(PendingResponse::ready(
                action
                    .id()
                    .to_string(),
                Ok(response),
            ));
        }

        self.connection()?
            .send(&action)
            .await
    }

    /// Send an action and wait for the response carrying its `ActionID`.
    ///
    /// A rejected action is still `Ok`: check [`Message::success`] or use
    /// [`Message::into_result`].
    pub async fn send_action(&self, action: Action) -> AmiResult<Message> {
        let action_id = action
            .id()
            .to_string();
        let pending = self
            .submit(action)
            .await?;
        self.bounded(&action_id, pending)
            .await
    }

    /// Send an action in a background task and hand its result to `callback`.
    ///
    /// Returns immediately. Must be called from within a tokio runtime.
    pub fn send_action_with_callback<F>(&self, action: Action, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(AmiResult<Message>) + Send + 'static,
    {
        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager
                .send_action(action)
                .await;
            callback(result);
        })
    }

    /// Send an action answered by a `Response: Follows` block; the output is
    /// in [`Message::content`].
    pub async fn send_command(&self, action: Action) -> AmiResult<Message> {
        let response = self
            .send_action(action)
            .await?;
        trace!(
            "[RECV] Command output: {} line(s)",
            response
                .iter_lines()
                .count()
        );
        Ok(response)
    }

    /// Run a CLI command, e.g. `core show channels`.
    pub async fn command(&self, cli: &str) -> AmiResult<Message> {
        self.send_command(self.action([("Action", "Command"), ("Command", cli)]))
            .await
    }

    /// Send an action answered with `EventList: start`; returns the response
    /// followed by every list event, ending with the list-complete event.
    pub async fn send_list_action(&self, action: Action) -> AmiResult<Vec<Message>> {
        self.ensure_open()?;
        self.require_mode(ExecutionMode::Async)?;

        let http = self
            .inner
            .http
            .lock()
            .clone();
        if let Some(http) = http {
            let messages = http
                .exchange(&action)
                .await;
            return Ok(self.take_list(&action, messages));
        }

        let pending = self
            .connection()?
            .send_list(&action)
            .await?;
        self.bounded(action.id(), pending)
            .await
    }

    /// Subscribe `callback` to events whose name matches the glob `pattern`.
    pub fn register_event<F>(&self, pattern: impl Into<String>, callback: F)
    where
        F: Fn(&Message, &Manager) + Send + Sync + 'static,
    {
        self.inner
            .registry
            .register(pattern, callback);
    }

    /// Run the callbacks matching `message`.
    pub fn dispatch(&self, message: &Message) -> Dispatch {
        self.inner
            .registry
            .dispatch(message, self)
    }

    /// Parse a raw block; `None` unless it is an event some pattern matches.
    pub fn event_from_block(&self, raw: &str) -> Option<Message> {
        let message = Message::parse(raw).ok()?;
        let name = message.matches()?;
        self.inner
            .registry
            .interested(name)
            .then_some(message)
    }

    /// Blocking connect for [`ExecutionMode::Sync`].
    ///
    /// The blocking HTTP client cannot live on a tokio runtime thread, so
    /// [`Transport::Http`] returns [`AmiError::WrongMode`] when called from one.
    pub fn connect_blocking(&self) -> AmiResult<()> {
        self.ensure_open()?;
        self.require_mode(ExecutionMode::Sync)?;
        if matches!(self.inner.options.transport, Transport::Http { .. })
            && tokio::runtime::Handle::try_current().is_ok()
        {
            warn!("[CONNECT] Blocking HTTP transport used inside a tokio runtime");
            return Err(AmiError::WrongMode { required: "async" });
        }
        self.set_status(ConnectionState::Connecting);

        let options = &self.inner.options;
        let result = match &options.transport {
            Transport::Tcp => BlockingSession::connect(options).map(|(session, early)| {
                *self
                    .inner
                    .server_version
                    .lock() = session
                    .greeting()
                    .map(str::to_owned);
                *self
                    .inner
                    .blocking
                    .lock() = Some(session);
                for event in &early {
                    self.dispatch(event);
                }
            }),
            Transport::Http { url } => self.connect_http_blocking(url),
        };
        match &result {
            Ok(()) => self.set_status(ConnectionState::Connected),
            Err(e) => {
                warn!("[CONNECT] {}", e);
                self.set_status(ConnectionState::Disconnected);
            }
        }
        result
    }

    fn connect_http_blocking(&self, url: &str) -> AmiResult<()> {
        let options = &self.inner.options;
        info!("[CONNECT] Using Asterisk HTTP manager at {} (blocking)", url);
        let http = Arc::new(BlockingHttpTransport::new(url, options.connect_timeout())?);
        if options.has_credentials() {
            let login = Action::login(&options.username, &options.secret, &options.events);
            let response = self.take_response(&login, http.exchange(&login));
            if !response.success() {
                let reason = response
                    .message_text()
                    .unwrap_or("login rejected")
                    .to_string();
                warn!("[AUTH] Login as {} failed: {}", options.username, reason);
                return Err(AmiError::auth_failed(reason));
            }
            info!("[AUTH] Logged in as {} over HTTP", options.username);
        }
        *self
            .inner
            .blocking_http
            .lock() = Some(http);
        Ok(())
    }

    /// Run `f` against the blocking session, dropping it on connection errors.
    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut BlockingSession) -> AmiResult<(T, Vec<Message>)>,
    ) -> AmiResult<T> {
        let (value, events) = {
            let mut slot = self
                .inner
                .blocking
                .lock();
            let session = slot
                .as_mut()
                .ok_or(AmiError::NotConnected)?;
            match f(session) {
                Ok(result) => result,
                Err(e) => {
                    if e.is_connection_error() {
                        if let Some(mut session) = slot.take() {
                            session.close();
                        }
                        self.set_status(ConnectionState::Disconnected);
                    }
                    return Err(e);
                }
            }
        };
        for event in &events {
            self.dispatch(event);
        }
        Ok(value)
    }

    /// Blocking [`send_action`](Self::send_action) for [`ExecutionMode::Sync`].
    ///
    /// Events read while waiting are dispatched before this returns.
    pub fn send_action_blocking(&self, action: Action) -> AmiResult<Message> {
        self.ensure_open()?;
        self.require_mode(ExecutionMode::Sync)?;

        let http = self
            .inner
            .blocking_http
            .lock()
            .clone();
        if let Some(http) = http {
            let messages = http.exchange(&action);
            return Ok(self.take_response(&action, messages));
        }
        self.with_session(|session| session.send_action(&action))
    }

    /// Blocking [`send_list_action`](Self::send_list_action).
    pub fn send_list_action_blocking(&self, action: Action) -> AmiResult<Vec<Message>> {
        self.ensure_open()?;
        self.require_mode(ExecutionMode::Sync)?;

        let http = self
            .inner
            .blocking_http
            .lock()
            .clone();
        if let Some(http) = http {
            let messages = http.exchange(&action);
            return Ok(self.take_list(&action, messages));
        }
        self.with_session(|session| session.send_list(&action))
    }

    fn close_sync_transports(&self) {
        let session = self
            .inner
            .blocking
            .lock()
            .take();
        if let Some(mut session) = session {
            session.close();
        }
        self.inner
            .blocking_http
            .lock()
            .take();
    }

    /// Close without a runtime. Same guarantees as [`close`](Self::close).
    pub fn close_blocking(&self) {
        if self
            .inner
            .closed
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        info!("Closing manager");
        self.close_sync_transports();
        self.inner
            .status
            .send_replace(ConnectionState::Closed);
    }

    /// Close the session.
    ///
    /// Sends nothing to the server. Pending actions fail with
    /// [`AmiError::ConnectionClosed`], background tasks stop, and every later
    /// call fails immediately. Safe to call repeatedly or before `connect`.
    pub async fn close(&self) {
        if self
            .inner
            .closed
            .swap(true, Ordering::SeqCst)
        {
            return;
        }
        info!("Closing manager");
        self.inner
            .status
            .send_replace(ConnectionState::Closing);

        let connection = self
            .inner
            .connection
            .lock()
            .take();
        if let Some(connection) = connection {
            connection
                .close()
                .await;
        }
        self.inner
            .http
            .lock()
            .take();
        self.close_sync_transports();

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.inner
            .status
            .send_replace(ConnectionState::Closed);
    }
}
