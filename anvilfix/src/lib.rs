//! A FIX 4.4 session engine.
//!
//! AnvilFIX lets a process hold either end of a FIX conversation: the
//! [`FixInitiator`] dials out to a counterparty and drives the logon, while
//! the [`FixEngine`] listens on a port and runs one session per inbound
//! connection, multiplexing any number of counterparties.
//!
//! ## Terminology
//! * `FIX Connection` -- A single TCP connection carrying a FIX session. It
//!   is established by the logon handshake and ends properly with a logout,
//!   but is considered over as soon as the TCP connection breaks.
//! * `FIX Session` -- The bidirectional stream of ordered, sequence-numbered
//!   messages between two CompIDs.
//! * `Session task` -- The background task that owns one connection: it is
//!   the only reader of the socket and the only writer to it, which is how
//!   sequence numbers stay contiguous without locking.
//!
//! ## Example
//! ```no_run
//! use anvilfix::{
//!     ChannelHandler, FixInitiator, SessionSettings, ApplicationError,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ApplicationError> {
//!     let settings = SessionSettings::builder()
//!         .with_sender_comp_id("Client")
//!         .with_target_comp_id("Server")
//!         .with_socket_addr("127.0.0.1:6161".parse().unwrap())
//!         .with_store_path("./client-store.fix".into())
//!         .with_log_dir("./log".into())
//!         .build()?;
//!
//!     let (handler, mut events) = ChannelHandler::channel();
//!
//!     // dial out, perform the logon handshake, wait up to 5 seconds
//!     let client = FixInitiator::build(settings, handler)?
//!         .connect(Duration::from_secs(5))
//!         .await?;
//!
//!     tokio::spawn(async move {
//!         while let Some(msg) = events.recv().await {
//!             println!("got an application message: {}", msg);
//!         }
//!     });
//!
//!     // send messages here...
//!
//!     client.end_async().await?;
//!     Ok(())
//! }
//! ```

pub mod fix;

use fix::encode::MessageBuilder;
use fix::log::{LogLevel, Logger, StdoutLogger};
use fix::mem::MsgBuf;
use fix::session::Sequences;
use fix::store::{Direction, MessageStore};
use fix::{Role, SessionContext};

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// How long the TCP handshake itself may take before the initiator gives
/// up; the logon wait is the caller's separate, explicit timeout.
const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long engine shutdown waits for a session task (and then the
/// listener) to drain before aborting it.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) enum Request {
    Logon {
        resp_sender: oneshot::Sender<bool>,
    },
    SendMessage {
        resp_sender: oneshot::Sender<bool>,
        builder: MessageBuilder,
    },
    Logout {
        resp_sender: oneshot::Sender<bool>,
    },
}

/// Errors that can occur while running AnvilFIX.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("An I/O error occured: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Session ended unexpectedly")]
    SessionEnded,
    #[error("Logon has failed")]
    LogonFailed,
    #[error("Timed out waiting for logon to complete")]
    LogonTimedOut,
    #[error("Logout has failed")]
    LogoutFailed,
    #[error("MessageSend has failed")]
    SendMessageFailed,
    #[error("setting `{0}` is required")]
    SettingRequired(String),
    #[error("no stored message with sequence number {0}")]
    MessageNotFound(u32),
}

fn store_error(e: anyhow::Error) -> ApplicationError {
    ApplicationError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// A collection of settings configuring one initiator session.
///
/// `SessionSettings` can be constructed with the [`SessionSettingsBuilder`],
/// or explicitly.
#[derive(Clone)]
pub struct SessionSettings {
    begin_string: Arc<String>,
    sender_comp_id: String,
    target_comp_id: String,
    addr: SocketAddr,
    store_path: PathBuf,
    log_dir: PathBuf,
    heartbeat_timeout: Duration,
    username: Option<String>,
    password: Option<String>,
    logger: Arc<dyn Logger>,
}

/// A builder for easily configuring all the fields of a [`SessionSettings`]
///
/// The following settings are required to be set:
/// * sender comp id
/// * target comp id
/// * addr
/// * store path
/// * log dir
#[derive(Default)]
pub struct SessionSettingsBuilder {
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    addr: Option<SocketAddr>,
    begin_string: Option<String>,
    store_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    heartbeat_timeout: Option<Duration>,
    username: Option<String>,
    password: Option<String>,
    logger: Option<Arc<dyn Logger>>,
}

impl SessionSettingsBuilder {
    pub fn new() -> SessionSettingsBuilder {
        Default::default()
    }

    /// The `SenderCompID(49)` that will be included in each message.
    pub fn with_sender_comp_id(mut self, sender_comp_id: &str) -> Self {
        self.set_sender_comp_id(sender_comp_id);
        self
    }
    pub fn set_sender_comp_id(&mut self, sender_comp_id: &str) {
        self.sender_comp_id = Some(sender_comp_id.to_string());
    }

    /// The `TargetCompID(56)` that will be included in each message.
    pub fn with_target_comp_id(mut self, target_comp_id: &str) -> Self {
        self.set_target_comp_id(target_comp_id);
        self
    }
    pub fn set_target_comp_id(&mut self, target_comp_id: &str) {
        self.target_comp_id = Some(target_comp_id.to_string());
    }

    /// The address to initiate the connection to.
    pub fn with_socket_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }
    pub fn set_socket_addr(&mut self, addr: SocketAddr) {
        self.addr = Some(addr);
    }

    /// Resolve `host` (a DNS name or dotted quad) and connect to the first
    /// IPv4 address it yields.
    pub fn with_host_port(mut self, host: &str, port: u16) -> Result<Self, ApplicationError> {
        use std::net::ToSocketAddrs;
        let addr = (host, port)
            .to_socket_addrs()?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| {
                ApplicationError::IoError(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Failed to resolve host '{}'", host),
                ))
            })?;
        self.addr = Some(addr);
        Ok(self)
    }

    /// The `BeginString(8)` that will be included in each message.
    pub fn with_begin_string(mut self, begin_string: &str) -> Self {
        self.set_begin_string(begin_string);
        self
    }
    pub fn set_begin_string(&mut self, begin_string: &str) {
        self.begin_string = Some(begin_string.to_string());
    }

    /// The file that holds this session's message store.
    pub fn with_store_path(mut self, store_path: PathBuf) -> Self {
        self.set_store_path(store_path);
        self
    }
    pub fn set_store_path(&mut self, store_path: PathBuf) {
        self.store_path = Some(store_path);
    }

    /// The directory used for wire journal files.
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.set_log_dir(log_dir);
        self
    }
    pub fn set_log_dir(&mut self, log_dir: PathBuf) {
        self.log_dir = Some(log_dir);
    }

    /// The `HeartBtInt(108)` offered in the logon.
    pub fn with_heartbeat_timeout(mut self, hb_timeout: Duration) -> Self {
        self.set_heartbeat_timeout(hb_timeout);
        self
    }
    pub fn set_heartbeat_timeout(&mut self, hb_timeout: Duration) {
        self.heartbeat_timeout = Some(hb_timeout);
    }

    /// Optional `Username(553)` for the logon.
    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    /// Optional `Password(554)` for the logon.
    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Diagnostic sink; defaults to stdout at `Info`.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build the [`SessionSettings`] struct.
    ///
    /// Returns an `Err(ApplicationError::SettingRequired)` if not all of
    /// the required fields were set.
    pub fn build(self) -> Result<SessionSettings, ApplicationError> {
        let sender_comp_id = self
            .sender_comp_id
            .ok_or(ApplicationError::SettingRequired(
                "sender_comp_id".to_string(),
            ))?;
        let target_comp_id = self
            .target_comp_id
            .ok_or(ApplicationError::SettingRequired(
                "target_comp_id".to_string(),
            ))?;
        let addr = self
            .addr
            .ok_or(ApplicationError::SettingRequired("addr".to_string()))?;
        let store_path = self
            .store_path
            .ok_or(ApplicationError::SettingRequired("store_path".to_string()))?;
        let log_dir = self
            .log_dir
            .ok_or(ApplicationError::SettingRequired("log_dir".to_string()))?;

        Ok(SessionSettings {
            begin_string: Arc::new(self.begin_string.unwrap_or(String::from("FIX.4.4"))),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(Duration::from_secs(30)),
            username: self.username,
            password: self.password,
            logger: self.logger.unwrap_or_else(|| Arc::new(StdoutLogger::default())),
            sender_comp_id,
            target_comp_id,
            addr,
            store_path,
            log_dir,
        })
    }
}

impl SessionSettings {
    /// Creates a new [`SessionSettingsBuilder`]
    pub fn builder() -> SessionSettingsBuilder {
        SessionSettingsBuilder::new()
    }
}

/// A collection of settings configuring an acceptor engine.
#[derive(Clone)]
pub struct EngineSettings {
    begin_string: Arc<String>,
    engine_id: String,
    addr: SocketAddr,
    store_dir: PathBuf,
    log_dir: PathBuf,
    heartbeat_timeout: Duration,
    logger: Arc<dyn Logger>,
}

/// A builder for [`EngineSettings`].
///
/// The following settings are required to be set:
/// * engine id (the acceptor's CompID)
/// * addr
/// * store dir
/// * log dir
#[derive(Default)]
pub struct EngineSettingsBuilder {
    engine_id: Option<String>,
    addr: Option<SocketAddr>,
    begin_string: Option<String>,
    store_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    heartbeat_timeout: Option<Duration>,
    logger: Option<Arc<dyn Logger>>,
}

impl EngineSettingsBuilder {
    pub fn new() -> EngineSettingsBuilder {
        Default::default()
    }

    /// The engine's own CompID, used as `SenderCompID(49)` on every session.
    pub fn with_engine_id(mut self, engine_id: &str) -> Self {
        self.engine_id = Some(engine_id.to_string());
        self
    }

    /// The address to accept connections on. Port 0 picks an ephemeral
    /// port, readable back from [`FixEngine::port`].
    pub fn with_socket_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    /// The `BeginString(8)` that will be included in each message.
    pub fn with_begin_string(mut self, begin_string: &str) -> Self {
        self.begin_string = Some(begin_string.to_string());
        self
    }

    /// Directory that receives one store file per session, named
    /// `<peer>-<UTC timestamp>.fix`.
    pub fn with_store_dir(mut self, store_dir: PathBuf) -> Self {
        self.store_dir = Some(store_dir);
        self
    }

    /// The directory used for wire journal files.
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.log_dir = Some(log_dir);
        self
    }

    /// Default heartbeat interval offered to sessions; the peer's
    /// `HeartBtInt(108)` overrides it per session.
    pub fn with_heartbeat_timeout(mut self, hb_timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(hb_timeout);
        self
    }

    /// Diagnostic sink; defaults to stdout at `Info`.
    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> Result<EngineSettings, ApplicationError> {
        let engine_id = self
            .engine_id
            .ok_or(ApplicationError::SettingRequired("engine_id".to_string()))?;
        let addr = self
            .addr
            .ok_or(ApplicationError::SettingRequired("addr".to_string()))?;
        let store_dir = self
            .store_dir
            .ok_or(ApplicationError::SettingRequired("store_dir".to_string()))?;
        let log_dir = self
            .log_dir
            .ok_or(ApplicationError::SettingRequired("log_dir".to_string()))?;

        Ok(EngineSettings {
            begin_string: Arc::new(self.begin_string.unwrap_or(String::from("FIX.4.4"))),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(Duration::from_secs(30)),
            logger: self.logger.unwrap_or_else(|| Arc::new(StdoutLogger::default())),
            engine_id,
            addr,
            store_dir,
            log_dir,
        })
    }
}

impl EngineSettings {
    /// Creates a new [`EngineSettingsBuilder`]
    pub fn builder() -> EngineSettingsBuilder {
        EngineSettingsBuilder::new()
    }
}

/// Delivery surface for inbound application messages.
///
/// `on_message` runs on the session task, in arrival order, after the
/// message has been recorded in the session store. The message is shared:
/// clone the [`Arc`] to retain it beyond the callback.
pub trait RecvHandler: Send + Sync {
    fn on_message(&self, session: &SessionRef, msg: Arc<MsgBuf>);
}

/// The session a message arrived on, as seen by a [`RecvHandler`]. Carries
/// the peer identity and a sending handle so handlers can reply in place.
pub struct SessionRef {
    target_comp_id: String,
    handle: FixHandle,
}

impl SessionRef {
    pub(crate) fn new(target_comp_id: String, handle: FixHandle) -> SessionRef {
        SessionRef {
            target_comp_id,
            handle,
        }
    }

    /// The peer's CompID.
    pub fn target_comp_id(&self) -> &str {
        &self.target_comp_id
    }

    pub fn handle(&self) -> &FixHandle {
        &self.handle
    }

    /// Queue a message on this session. See [`FixHandle::send_message`].
    pub fn send_message(
        &self,
        builder: MessageBuilder,
    ) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        self.handle.send_message(builder)
    }
}

/// A [`RecvHandler`] that forwards every message into an unbounded channel,
/// for callers who would rather receive than be called.
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<Arc<MsgBuf>>,
}

impl ChannelHandler {
    pub fn channel() -> (Arc<ChannelHandler>, mpsc::UnboundedReceiver<Arc<MsgBuf>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(ChannelHandler { sender }), receiver)
    }
}

impl RecvHandler for ChannelHandler {
    fn on_message(&self, _session: &SessionRef, msg: Arc<MsgBuf>) {
        let _ = self.sender.send(msg);
    }
}

/// A handle on one running session.
///
/// The handle requests the basic session operations: starting the FIX
/// connection, sending a message to the peer, and ending the connection.
/// Each operation comes in three shapes: return a [`oneshot::Receiver`]
/// immediately, await asynchronously, or block.
///
/// The underlying session can stop at any moment for a variety of reasons;
/// an operation on a stopped session returns
/// [`ApplicationError::SessionEnded`] or yields `false`.
///
/// `FixHandle` is [`Clone`], [`Send`] and [`Sync`]: copies can be handed to
/// any number of threads or tasks that all send on the same session.
///
/// [`oneshot::Receiver`]: tokio::sync::oneshot::Receiver
#[derive(Clone)]
pub struct FixHandle {
    request_sender: mpsc::UnboundedSender<Request>,
    begin_string: Arc<String>,
}

impl FixHandle {
    /// Request the logon handshake and return immediately. The receiver
    /// eventually yields `true` once the peer's logon is accepted.
    pub fn start(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let logon_request = Request::Logon { resp_sender };
        let _ = self.request_sender.send(logon_request);
        Ok(resp_receiver)
    }
    /// Request the logon handshake and await the result.
    pub async fn start_async(&self) -> Result<(), ApplicationError> {
        let resp_receiver = self.start()?;
        if Ok(true) != resp_receiver.await {
            return Err(ApplicationError::LogonFailed);
        }
        Ok(())
    }

    /// Queue the message in `builder` for sending and return immediately.
    ///
    /// The receiver yields `true` once the message has been written to the
    /// TCP connection, `false` if it could not be sent.
    pub fn send_message(
        &self,
        builder: MessageBuilder,
    ) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        if self.request_sender.is_closed() {
            return Err(ApplicationError::SessionEnded);
        }
        let (resp_sender, resp_receiver) = oneshot::channel();
        let send_message_request = Request::SendMessage {
            resp_sender,
            builder,
        };
        let _ = self.request_sender.send(send_message_request);
        Ok(resp_receiver)
    }
    /// Queue the message in `builder` and await the write.
    pub async fn send_message_async(
        &self,
        builder: MessageBuilder,
    ) -> Result<(), ApplicationError> {
        let resp_receiver = self.send_message(builder)?;
        if Ok(true) != resp_receiver.await {
            return Err(ApplicationError::SendMessageFailed);
        }
        Ok(())
    }
    /// Queue the message in `builder` and block until a result is returned.
    pub fn send_message_sync(&self, builder: MessageBuilder) -> Result<(), ApplicationError> {
        let resp_receiver = self.send_message(builder)?;
        if Ok(true) != resp_receiver.blocking_recv() {
            return Err(ApplicationError::SendMessageFailed);
        }
        Ok(())
    }

    /// Request a logout and return immediately.
    ///
    /// The receiver yields `true` once the FIX connection is over and ended
    /// without any issues.
    pub fn end(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        let (resp_sender, resp_receiver) = oneshot::channel();
        let logout_request = Request::Logout { resp_sender };
        let _ = self.request_sender.send(logout_request);
        Ok(resp_receiver)
    }
    /// Request a logout and await the end of the connection.
    pub async fn end_async(&self) -> Result<(), ApplicationError> {
        let resp_receiver = self.end()?;
        if Ok(true) != resp_receiver.await {
            return Err(ApplicationError::LogoutFailed);
        }
        Ok(())
    }
    /// Request a logout and block until the connection is over.
    pub fn end_sync(&self) -> Result<(), ApplicationError> {
        let resp_receiver = self.end()?;
        if Ok(true) != resp_receiver.blocking_recv() {
            return Err(ApplicationError::LogoutFailed);
        }
        Ok(())
    }

    /// Get the `BeginString(8)` of this session. Generally `"FIX.4.4"`.
    pub fn begin_string(&self) -> Arc<String> {
        Arc::clone(&self.begin_string)
    }
}

/// Dials out to a counterparty and creates the session.
pub struct FixInitiator {
    settings: SessionSettings,
    handler: Arc<dyn RecvHandler>,
}

impl FixInitiator {
    /// Build a `FixInitiator` from `settings`. Inbound application messages
    /// will be delivered to `handler` from the session task.
    pub fn build(
        settings: SessionSettings,
        handler: Arc<dyn RecvHandler>,
    ) -> Result<FixInitiator, ApplicationError> {
        Ok(FixInitiator { settings, handler })
    }

    /// Open the TCP connection, start the session task, emit the Logon and
    /// wait up to `logon_timeout` for the peer's reply.
    ///
    /// A zero `logon_timeout` returns right after the Logon is queued
    /// without waiting for the handshake to complete.
    ///
    /// On a logon timeout the session task keeps running; drop the returned
    /// error and call [`FixClient::end_async`] via a saved handle, or just
    /// drop everything to tear the task down.
    pub async fn connect(self, logon_timeout: Duration) -> Result<FixClient, ApplicationError> {
        let socket = TcpSocket::new_v4()?;
        let stream = match tokio::time::timeout(TCP_CONNECT_TIMEOUT, socket.connect(self.settings.addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(ApplicationError::IoError(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "TCP connect timed out",
                )))
            }
        };
        stream.set_nodelay(true)?;

        let store = MessageStore::create(&self.settings.store_path, &self.settings.sender_comp_id)
            .await
            .map_err(store_error)?;
        let sequences = Arc::new(Sequences::from((1, 1)));
        let (request_sender, request_receiver) = mpsc::unbounded_channel::<Request>();
        let handle = FixHandle {
            request_sender,
            begin_string: Arc::clone(&self.settings.begin_string),
        };

        let ctx = SessionContext {
            role: Role::Initiator,
            begin_string: Arc::clone(&self.settings.begin_string),
            sender_comp_id: self.settings.sender_comp_id.clone(),
            target_comp_id: Some(self.settings.target_comp_id.clone()),
            store: Some(store.clone()),
            store_dir: None,
            log_dir: self.settings.log_dir.clone(),
            heartbeat: self.settings.heartbeat_timeout,
            username: self.settings.username.clone(),
            password: self.settings.password.clone(),
            logger: Arc::clone(&self.settings.logger),
            sequences: Arc::clone(&sequences),
            handle: handle.clone(),
            target_slot: None,
        };

        let logger = Arc::clone(&self.settings.logger);
        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            if let Err(e) = fix::run_session(stream, request_receiver, handler, ctx).await {
                logger.log(LogLevel::Error, &format!("session ended with error: {e:?}"));
            }
        });

        let logon_receiver = handle.start()?;
        if !logon_timeout.is_zero() {
            match tokio::time::timeout(logon_timeout, logon_receiver).await {
                Ok(Ok(true)) => {}
                Ok(_) => return Err(ApplicationError::LogonFailed),
                Err(_) => return Err(ApplicationError::LogonTimedOut),
            }
        }

        Ok(FixClient {
            target_comp_id: self.settings.target_comp_id.clone(),
            handle,
            store,
            sequences,
        })
    }
}

/// A connected initiator session.
pub struct FixClient {
    target_comp_id: String,
    handle: FixHandle,
    store: MessageStore,
    sequences: Arc<Sequences>,
}

impl FixClient {
    /// A cloneable handle usable from other threads and tasks.
    pub fn handle(&self) -> FixHandle {
        self.handle.clone()
    }

    pub fn target_comp_id(&self) -> &str {
        &self.target_comp_id
    }

    pub fn begin_string(&self) -> Arc<String> {
        self.handle.begin_string()
    }

    /// See [`FixHandle::send_message`].
    pub fn send_message(
        &self,
        builder: MessageBuilder,
    ) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        self.handle.send_message(builder)
    }

    /// See [`FixHandle::send_message_async`].
    pub async fn send_message_async(
        &self,
        builder: MessageBuilder,
    ) -> Result<(), ApplicationError> {
        self.handle.send_message_async(builder).await
    }

    /// See [`FixHandle::end`].
    pub fn end(&self) -> Result<oneshot::Receiver<bool>, ApplicationError> {
        self.handle.end()
    }

    /// See [`FixHandle::end_async`].
    pub async fn end_async(&self) -> Result<(), ApplicationError> {
        self.handle.end_async().await
    }

    /// Fetch a message from the session store by sequence number and
    /// direction.
    pub async fn get_message(
        &self,
        seq: u32,
        direction: Direction,
    ) -> Result<Vec<u8>, ApplicationError> {
        self.store
            .get(seq, direction)
            .await
            .ok_or(ApplicationError::MessageNotFound(seq))
    }

    /// Highest outbound sequence number assigned so far.
    pub fn sent_seq(&self) -> u32 {
        self.sequences.peek_outgoing().saturating_sub(1)
    }

    /// Highest inbound sequence number accepted so far.
    pub fn recv_seq(&self) -> u32 {
        self.sequences.peek_incoming().saturating_sub(1)
    }
}

struct EngineSession {
    key: u64,
    target_id: Arc<OnceLock<String>>,
    handle: FixHandle,
    task: JoinHandle<()>,
}

/// The acceptor: listens on a port and runs one session per inbound
/// connection.
///
/// Sessions identify themselves by the `SenderCompID(49)` of their first
/// frame; from then on they are reachable through [`get_session`]. Each
/// session's messages land in a store file under the engine's store
/// directory. Sessions announce their own termination to the engine, which
/// prunes them from the registry.
///
/// [`get_session`]: FixEngine::get_session
pub struct FixEngine {
    engine_id: String,
    port: u16,
    store_dir: PathBuf,
    heartbeat_timeout: Duration,
    registry: Arc<Mutex<Vec<EngineSession>>>,
    shutdown_sender: watch::Sender<bool>,
    listener_task: Option<JoinHandle<()>>,
}

impl FixEngine {
    /// Create the storage directory, bind the listening socket and start
    /// accepting connections. Inbound application messages on every session
    /// are delivered to `handler`.
    pub fn bind(
        settings: EngineSettings,
        handler: Arc<dyn RecvHandler>,
    ) -> Result<FixEngine, ApplicationError> {
        std::fs::create_dir_all(&settings.store_dir)?;
        std::fs::create_dir_all(&settings.log_dir)?;

        let socket = TcpSocket::new_v4()?;
        socket.bind(settings.addr)?;
        let listener = socket.listen(1024)?;
        let port = listener.local_addr()?.port();

        let registry: Arc<Mutex<Vec<EngineSession>>> = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        let engine = FixEngine {
            engine_id: settings.engine_id.clone(),
            port,
            store_dir: settings.store_dir.clone(),
            heartbeat_timeout: settings.heartbeat_timeout,
            registry: Arc::clone(&registry),
            shutdown_sender,
            listener_task: Some(tokio::spawn(accept_loop(
                listener,
                settings,
                handler,
                registry,
                shutdown_receiver,
            ))),
        };
        Ok(engine)
    }

    /// The engine's own CompID.
    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    /// The port the engine is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Look up a live session by the peer's CompID. Sessions appear here
    /// once their first inbound frame identifies them.
    pub fn get_session(&self, target_comp_id: &str) -> Option<FixHandle> {
        self.registry
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.target_id.get().map(String::as_str) == Some(target_comp_id))
            .map(|s| s.handle.clone())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Stop accepting connections, log every live session out and drain
    /// them. Each session gets a bounded window before it is aborted, as
    /// does the listener, so shutdown completes in bounded time.
    pub async fn shutdown(mut self) -> Result<(), ApplicationError> {
        let _ = self.shutdown_sender.send(true);

        let sessions: Vec<EngineSession> = {
            let mut registry = self.registry.lock().unwrap();
            registry.drain(..).collect()
        };
        for mut session in sessions {
            if let Ok(_resp) = session.handle.end() {
                // the ack is observed through task completion below
            }
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut session.task)
                .await
                .is_err()
            {
                session.task.abort();
            }
        }

        if let Some(mut task) = self.listener_task.take() {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    settings: EngineSettings,
    handler: Arc<dyn RecvHandler>,
    registry: Arc<Mutex<Vec<EngineSession>>>,
    mut shutdown_receiver: watch::Receiver<bool>,
) {
    let logger = Arc::clone(&settings.logger);
    let (closed_sender, mut closed_receiver) = mpsc::unbounded_channel::<u64>();
    let mut next_key: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown_receiver.changed() => break,
            Some(key) = closed_receiver.recv() => {
                registry.lock().unwrap().retain(|s| s.key != key);
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        if logger.enabled(LogLevel::Info) {
                            logger.log(
                                LogLevel::Info,
                                &format!("connection established from {}", peer_addr),
                            );
                        }
                        let _ = stream.set_nodelay(true);

                        let key = next_key;
                        next_key += 1;
                        let (request_sender, request_receiver) =
                            mpsc::unbounded_channel::<Request>();
                        let handle = FixHandle {
                            request_sender,
                            begin_string: Arc::clone(&settings.begin_string),
                        };
                        let target_slot: Arc<OnceLock<String>> = Arc::new(OnceLock::new());

                        let ctx = SessionContext {
                            role: Role::Acceptor,
                            begin_string: Arc::clone(&settings.begin_string),
                            sender_comp_id: settings.engine_id.clone(),
                            target_comp_id: None,
                            store: None,
                            store_dir: Some(settings.store_dir.clone()),
                            log_dir: settings.log_dir.clone(),
                            heartbeat: settings.heartbeat_timeout,
                            username: None,
                            password: None,
                            logger: Arc::clone(&logger),
                            sequences: Arc::new(Sequences::from((1, 1))),
                            handle: handle.clone(),
                            target_slot: Some(Arc::clone(&target_slot)),
                        };

                        let session_handler = Arc::clone(&handler);
                        let session_logger = Arc::clone(&logger);
                        let session_closed = closed_sender.clone();
                        let task = tokio::spawn(async move {
                            if let Err(e) =
                                fix::run_session(stream, request_receiver, session_handler, ctx)
                                    .await
                            {
                                session_logger.log(
                                    LogLevel::Error,
                                    &format!("session ended with error: {e:?}"),
                                );
                            }
                            let _ = session_closed.send(key);
                        });

                        registry.lock().unwrap().push(EngineSession {
                            key,
                            target_id: target_slot,
                            handle,
                            task,
                        });
                    }
                    Err(e) => {
                        logger.log(
                            LogLevel::Error,
                            &format!("failed to accept a connection: {e}"),
                        );
                    }
                }
            }
        }
    }
}
