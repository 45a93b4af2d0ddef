//! Postgres connection state machine.
//!
//! A [`Connection`] never blocks on its own, the caller drives it:
//!
//! 1. [`start`][Connection::start] returns a handle in [`Status::Connecting`]
//! 2. [`poll`][Connection::poll] until [`PollStatus::Ready`], waiting for the reported readiness
//! 3. submit a query with one of the `send_*` operations
//! 4. [`get_result`][Connection::get_result] until [`Fetch::Exhausted`]
//!
//! Blocking conveniences ([`connect`][Connection::connect], [`exec`][Connection::exec]) are
//! built on the same steps.
use bytes::{Buf, BytesMut};
use std::{
    collections::{HashMap, VecDeque},
    fmt, io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::unix::io::RawFd;

mod config;
mod scram;
mod startup;

pub use config::{Config, ParseError, SslMode};
pub use scram::ScramError;
pub use startup::AuthError;

use crate::{
    Error, Result,
    cancel::{BackendKey, Cancellation},
    common::{ByteStr, log_debug, log_info, log_warn, span, verbose},
    notify::Notify,
    postgres::{
        BackendMessage, ProtocolError,
        Notice,
        frontend::{self, CopyFail, FrontendMessage, MAX_MESSAGE, Terminate},
    },
    row::{AnswerBuilder, Column, QueryResult, ResultStatus},
    transport::{Interest, Readiness, Socket, Transport},
};

/// msgtype + length
const HEADER: usize = 1 + 4;

/// Callback receiving server notices.
type NoticeProcessor = Box<dyn FnMut(&Notice) + Send>;

/// A connection to postgres backend.
pub struct Connection<T: Transport = Socket> {
    config: Config,
    transport: Option<T>,
    status: Status,
    nonblocking: bool,
    read_buf: BytesMut,
    write_buf: BytesMut,
    eof: bool,
    error_message: String,
    /// last error reported by the server, returned when the stream ends
    last_error: Option<Notice>,
    key: Option<Arc<BackendKey>>,
    parameters: HashMap<ByteStr, ByteStr>,
    transaction: u8,
    scram: Option<scram::Scram>,
    notifies: VecDeque<Notify>,
    results: VecDeque<QueryResult>,
    builder: AnswerBuilder,
    request: Request,
    /// `ReadyForQuery` received for current request
    ready: bool,
    /// a result was produced for current request
    produced: bool,
    single_row: bool,
    notice: Option<NoticeProcessor>,
    trace: bool,
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Startup phase is in progress.
    Connecting(Handshake),
    /// Ready for a new query.
    Idle,
    /// A query is in progress, results should be drained with
    /// [`get_result`][Connection::get_result].
    Busy,
    /// Transport or protocol failure, the connection is unusable until
    /// [`reset_start`][Connection::reset_start].
    Failed,
    /// [`close`][Connection::close] was called.
    Closed,
}

/// Startup phase substate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Transport is not opened yet.
    Opening,
    /// Startup packet is being written.
    Startup,
    /// Waiting for authentication requests.
    Authenticating,
    /// Authenticated, waiting for the backend to be ready.
    AwaitingReady,
}

/// Outcome of [`Connection::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Wait until the transport is readable, then poll again.
    Reading,
    /// Wait until the transport is writable, then poll again.
    Writing,
    /// Connection is ready, or results are available.
    Ready,
    /// Connection failed, see [`Connection::error_message`].
    Failed,
}

impl PollStatus {
    /// Returns readiness to wait for before polling again.
    pub fn interest(self) -> Option<Interest> {
        match self {
            PollStatus::Reading => Some(Interest::Readable),
            PollStatus::Writing => Some(Interest::Writable),
            PollStatus::Ready | PollStatus::Failed => None,
        }
    }
}

/// Outcome of a non-blocking fetch.
#[derive(Debug)]
pub enum Fetch<T> {
    /// A value is available.
    Ready(T),
    /// More input is required, wait for the transport to be readable.
    WouldBlock,
    /// No more values until a new request is sent.
    Exhausted,
}

impl<T> Fetch<T> {
    /// Returns the ready value.
    pub fn ready(self) -> Option<T> {
        match self {
            Fetch::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Fetch::Exhausted)
    }
}

/// Backend transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// A query is in progress.
    Active,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block.
    InError,
    /// Connection is not usable.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    Query,
    Prepare,
    Describe,
}

impl Connection<Socket> {
    /// Start connecting without blocking.
    ///
    /// The connection string is validated before returning, no I/O is performed until
    /// [`poll`][Connection::poll].
    pub fn start(conninfo: &str) -> Result<Connection> {
        Self::start_with(conninfo)
    }

    /// Start connecting with a custom [`Transport`].
    pub fn start_with<T: Transport>(conninfo: &str) -> Result<Connection<T>> {
        let mut config = Config::parse(conninfo)?;
        config.fill_env();
        Ok(Connection::with_config(config))
    }

    /// Connect and block until the connection is ready.
    pub fn connect(conninfo: &str) -> Result<Connection> {
        let mut conn = Self::start(conninfo)?;
        conn.wait_connected()?;
        Ok(conn)
    }

    /// Connect with config from environment variables, see [`Config::from_env`].
    pub fn connect_env() -> Result<Connection> {
        Self::connect_config(Config::from_env())
    }

    /// Connect with parsed config and block until the connection is ready.
    pub fn connect_config(config: Config) -> Result<Connection> {
        let mut conn = Connection::with_config(config);
        conn.wait_connected()?;
        Ok(conn)
    }
}

impl<T: Transport> Connection<T> {
    /// Start connecting with parsed config, no I/O is performed.
    pub fn with_config(config: Config) -> Connection<T> {
        Connection {
            config,
            transport: None,
            status: Status::Connecting(Handshake::Opening),
            nonblocking: false,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            eof: false,
            error_message: String::new(),
            last_error: None,
            key: None,
            parameters: HashMap::new(),
            transaction: b'I',
            scram: None,
            notifies: VecDeque::new(),
            results: VecDeque::new(),
            builder: AnswerBuilder::default(),
            request: Request::Query,
            ready: false,
            produced: false,
            single_row: false,
            notice: None,
            trace: false,
        }
    }

    /// Start the startup phase on an already opened transport.
    pub fn from_transport(config: Config, transport: T) -> Connection<T> {
        let mut conn = Self::with_config(config);
        conn.transport = Some(transport);
        conn.write_startup();
        conn.status = Status::Connecting(Handshake::Startup);
        conn
    }

    // ===== State machine =====

    /// Advance the startup phase or a running query.
    ///
    /// Returns [`PollStatus::Ready`] on an idle connection and [`PollStatus::Failed`] on a
    /// failed or closed connection without side effect.
    ///
    /// The first failure is returned as [`Err`], the connection is then [`Status::Failed`].
    pub fn poll(&mut self) -> Result<PollStatus> {
        match self.status {
            Status::Idle => Ok(PollStatus::Ready),
            Status::Failed | Status::Closed => Ok(PollStatus::Failed),
            Status::Busy => self.poll_busy().map_err(|e| self.fail(e)),
            Status::Connecting(_) => self.poll_connect().map_err(|e| self.fail(e)),
        }
    }

    fn poll_connect(&mut self) -> Result<PollStatus> {
        if let Status::Connecting(Handshake::Opening) = self.status {
            span!("open", host = self.config.host(), port = self.config.port());
            verbose!("opening transport");
            self.transport = Some(T::open(&self.config)?);
            self.write_startup();
            self.status = Status::Connecting(Handshake::Startup);
        }

        if !self.flush_some()? {
            return Ok(PollStatus::Writing);
        }
        if let Status::Connecting(Handshake::Startup) = self.status {
            self.status = Status::Connecting(Handshake::Authenticating);
        }

        self.fill()?;
        self.process()?;

        // authentication response may be queued
        if !self.flush_some()? {
            return Ok(PollStatus::Writing);
        }
        match self.status {
            Status::Idle => Ok(PollStatus::Ready),
            _ => Ok(PollStatus::Reading),
        }
    }

    fn poll_busy(&mut self) -> Result<PollStatus> {
        if !self.flush_some()? {
            return Ok(PollStatus::Writing);
        }
        self.fill()?;
        self.process()?;
        if !self.flush_some()? {
            return Ok(PollStatus::Writing);
        }
        match self.is_busy() {
            true => Ok(PollStatus::Reading),
            false => Ok(PollStatus::Ready),
        }
    }

    /// Read every available byte and process every complete message.
    ///
    /// Call it when the transport is readable, before [`is_busy`][Self::is_busy] or
    /// [`next_notify`][Self::next_notify].
    pub fn consume_input(&mut self) -> Result<()> {
        self.usable()?;
        if self.transport.is_none() {
            return Ok(());
        }
        match self.fill().and_then(|_| self.process()) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Try to write queued output, returns `true` when everything is written.
    pub fn flush(&mut self) -> Result<bool> {
        self.usable()?;
        if self.transport.is_none() {
            return Ok(self.write_buf.is_empty());
        }
        self.flush_some().map_err(|e| self.fail(e))
    }

    /// Returns the next result of the running query.
    ///
    /// [`Fetch::WouldBlock`] means more input is required, wait until the transport is
    /// readable. After [`Fetch::Exhausted`] the connection is [`Status::Idle`].
    pub fn get_result(&mut self) -> Result<Fetch<QueryResult>> {
        match self.status {
            Status::Busy => {},
            Status::Idle => return Ok(Fetch::Exhausted),
            Status::Failed | Status::Closed => return Err(self.lost()),
            status @ Status::Connecting(_) => return Err(NotReady::new(status).into()),
        }

        if self.results.is_empty() && !self.ready {
            self.poll_busy().map_err(|e| self.fail(e))?;
        }

        if let Some(result) = self.results.pop_front() {
            return Ok(Fetch::Ready(result));
        }
        if self.ready {
            verbose!("request exhausted");
            self.status = Status::Idle;
            self.single_row = false;
            return Ok(Fetch::Exhausted);
        }
        Ok(Fetch::WouldBlock)
    }

    /// Deliver each row of the running query as its own [`ResultStatus::SingleTuple`] result,
    /// followed by a zero row [`ResultStatus::TuplesOk`].
    ///
    /// Only allowed right after a query is sent, before any result is produced.
    pub fn set_single_row_mode(&mut self) -> bool {
        if self.status != Status::Busy
            || self.request != Request::Query
            || self.produced
            || self.builder.has_rows()
        {
            return false;
        }
        self.single_row = true;
        true
    }

    /// Reconnect with the same config, the current transport is closed.
    ///
    /// Follow with [`reset_poll`][Self::reset_poll] until ready.
    pub fn reset_start(&mut self) -> Result<()> {
        if self.status == Status::Closed {
            return Err(self.lost());
        }
        self.terminate();
        self.clear();
        self.status = Status::Connecting(Handshake::Opening);
        Ok(())
    }

    /// Same as [`poll`][Self::poll].
    pub fn reset_poll(&mut self) -> Result<PollStatus> {
        self.poll()
    }

    /// Reconnect and block until ready.
    pub fn reset(&mut self) -> Result<()> {
        self.reset_start()?;
        self.wait_connected()
    }

    /// Send `Terminate` and close the transport.
    ///
    /// Every following operation fails.
    pub fn close(&mut self) {
        self.terminate();
        self.clear();
        self.status = Status::Closed;
    }

    // ===== Blocking =====

    /// Poll until the connection is ready, bounded by `connect_timeout`.
    pub(crate) fn wait_connected(&mut self) -> Result<()> {
        let deadline = self.config.connect_timeout().map(|t| Instant::now() + t);
        loop {
            let interest = match self.poll()? {
                PollStatus::Ready => return Ok(()),
                PollStatus::Failed => return Err(self.lost()),
                PollStatus::Reading => Interest::Readable,
                PollStatus::Writing => Interest::Writable,
            };
            let timeout = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(timeout) => Some(timeout),
                    None => return Err(self.fail(timed_out())),
                },
                None => None,
            };
            if !self.wait(interest, timeout)? {
                return Err(self.fail(timed_out()));
            }
        }
    }

    /// Block until the next result, [`None`] when exhausted.
    pub(crate) fn block_on_result(&mut self) -> Result<Option<QueryResult>> {
        loop {
            match self.get_result()? {
                Fetch::Ready(result) => return Ok(Some(result)),
                Fetch::Exhausted => return Ok(None),
                Fetch::WouldBlock => {
                    let interest = match self.write_buf.is_empty() {
                        true => Interest::Readable,
                        false => Interest::Both,
                    };
                    self.wait(interest, None)?;
                },
            }
        }
    }

    fn wait(&self, interest: Interest, timeout: Option<Duration>) -> Result<bool> {
        match &self.transport {
            Some(transport) => Ok(transport.wait(interest, timeout)?),
            None => Err(self.lost()),
        }
    }

    // ===== Cancellation =====

    /// Returns a detached token that can cancel the running query from any thread.
    pub fn cancellation(&self) -> Result<Cancellation<T>> {
        self.usable()?;
        match &self.key {
            Some(key) => Ok(Cancellation::new(self.config.clone(), key.clone())),
            None => Err(NotReady::new(self.status).into()),
        }
    }

    /// Number of live [`Cancellation`] tokens for the current backend.
    pub fn cancellation_count(&self) -> usize {
        self.key.as_ref().map_or(0, |key| Arc::strong_count(key) - 1)
    }

    /// Request cancellation of the running query, blocking up to the default timeout.
    ///
    /// Cancellation is best-effort, the query may still complete normally.
    pub fn cancel(&self) -> Result<()> {
        let result = self.cancellation()?.do_cancel(crate::cancel::DEFAULT_TIMEOUT);
        if let Err(_err) = &result {
            log_warn!("cancel request failed: {_err}");
        }
        result
    }

    // ===== Notice and notification =====

    /// Set a callback for server notices, replacing the default which logs them.
    ///
    /// Panic in the callback is caught and logged.
    pub fn set_notice_processor<F>(&mut self, processor: F)
    where
        F: FnMut(&Notice) + Send + 'static,
    {
        self.notice = Some(Box::new(processor));
    }

    /// Restore the default notice processor.
    pub fn clear_notice_processor(&mut self) {
        self.notice = None;
    }

    /// Returns the next received notification.
    ///
    /// Notifications are collected by [`consume_input`][Self::consume_input].
    pub fn next_notify(&mut self) -> Option<Notify> {
        self.notifies.pop_front()
    }

    /// Trace every protocol message through the logger.
    pub fn trace(&mut self) {
        self.trace = true;
    }

    pub fn untrace(&mut self) {
        self.trace = false;
    }

    fn notice(&mut self, notice: Notice) {
        match &mut self.notice {
            Some(processor) => {
                if let Err(_panic) = panic::catch_unwind(AssertUnwindSafe(|| processor(&notice))) {
                    log_warn!("notice processor panicked: {}", panic_message(&*_panic));
                }
            },
            None => default_notice(&notice),
        }
    }

    // ===== Accessors =====

    pub fn status(&self) -> Status {
        self.status
    }

    /// Returns `true` when [`get_result`][Self::get_result] requires more input.
    pub fn is_busy(&self) -> bool {
        self.status == Status::Busy && self.results.is_empty() && !self.ready
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// In blocking mode, the default, sending a query waits until it is fully written.
    ///
    /// Switching to blocking mode flushes queued output.
    pub fn set_nonblocking(&mut self, nonblocking: bool) -> Result<()> {
        if !nonblocking && self.nonblocking && self.transport.is_some() {
            self.flush_blocking().map_err(|e| self.fail(e))?;
        }
        self.nonblocking = nonblocking;
        Ok(())
    }

    /// Returns the message of the last failure.
    pub fn error_message(&self) -> &str {
        &self.error_message
    }

    /// Returns the connection config.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns run-time parameter reported by the server, e.g. `server_version`.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(ByteStr::as_str)
    }

    /// Returns `3` when connected, `0` otherwise.
    pub fn protocol_version(&self) -> u32 {
        match self.status {
            Status::Idle | Status::Busy => 3,
            _ => 0,
        }
    }

    /// Returns server version as an integer, e.g. `160002` for `16.2` and `90603` for `9.6.3`.
    pub fn server_version(&self) -> u32 {
        self.parameter_status("server_version").map_or(0, parse_server_version)
    }

    pub fn db_name(&self) -> &str {
        self.config.dbname()
    }

    pub fn host(&self) -> &str {
        self.config.host()
    }

    pub fn port(&self) -> u16 {
        self.config.port()
    }

    pub fn user(&self) -> &str {
        self.config.user()
    }

    /// Returns the backend process id, `0` before the startup phase completes.
    pub fn backend_pid(&self) -> u32 {
        self.key.as_ref().map_or(0, |key| key.process_id)
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        match (self.status, self.transaction) {
            (Status::Busy, _) => TransactionStatus::Active,
            (Status::Idle, b'I') => TransactionStatus::Idle,
            (Status::Idle, b'T') => TransactionStatus::InTransaction,
            (Status::Idle, b'E') => TransactionStatus::InError,
            _ => TransactionStatus::Unknown,
        }
    }

    /// Returns current transport readiness.
    pub fn readiness(&self) -> Result<Readiness> {
        match &self.transport {
            Some(transport) => Ok(transport.readiness()?),
            None => Err(self.lost()),
        }
    }

    /// Returns raw descriptor of the transport, for external event loop.
    #[cfg(unix)]
    pub fn socket(&self) -> Option<RawFd> {
        self.transport.as_ref().and_then(Transport::raw_fd)
    }

    /// Returns another handle of the transport.
    pub fn socket_duplicate(&self) -> Result<T> {
        match &self.transport {
            Some(transport) => Ok(transport.duplicate()?),
            None => Err(self.lost()),
        }
    }

    // ===== Internals =====

    pub(crate) fn usable(&self) -> Result<()> {
        match self.status {
            Status::Failed | Status::Closed => Err(self.lost()),
            _ => Ok(()),
        }
    }

    fn lost(&self) -> Error {
        match self.status {
            Status::Closed => ConnectionLost::new("connection is closed").into(),
            _ if self.error_message.is_empty() => ConnectionLost::new("connection is not open").into(),
            _ => ConnectionLost::new(self.error_message.clone()).into(),
        }
    }

    /// Mark the connection failed.
    fn fail(&mut self, err: Error) -> Error {
        if self.status == Status::Closed {
            return err;
        }
        self.error_message = err.kind().to_string();
        verbose!(error = %self.error_message, "connection failed");
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close();
        }
        self.write_buf.clear();
        self.results.clear();
        self.status = Status::Failed;
        err
    }

    /// Best-effort `Terminate`, then close the transport.
    fn terminate(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };
        if matches!(self.status, Status::Idle | Status::Busy) {
            let mut buf = BytesMut::new();
            frontend::write(Terminate {}, &mut buf);
            let _ = transport.write(&buf);
        }
        let _ = transport.close();
    }

    /// Forget per session state.
    fn clear(&mut self) {
        self.read_buf.clear();
        self.write_buf.clear();
        self.eof = false;
        self.last_error = None;
        self.key = None;
        self.parameters.clear();
        self.transaction = b'I';
        self.scram = None;
        self.results.clear();
        self.builder.reset();
        self.ready = false;
        self.produced = false;
        self.single_row = false;
    }

    /// Enter [`Status::Busy`] after request messages are queued.
    pub(crate) fn begin(&mut self, request: Request) -> Result<()> {
        self.request = request;
        self.ready = false;
        self.produced = false;
        self.single_row = false;
        self.builder.reset();
        self.error_message.clear();
        self.last_error = None;
        self.status = Status::Busy;

        let flushed = match self.nonblocking {
            true => self.flush_some().map(|_| ()),
            false => self.flush_blocking(),
        };
        flushed.map_err(|e| self.fail(e))
    }

    /// Returns error if a new request cannot be sent.
    pub(crate) fn check_idle(&self) -> Result<()> {
        match self.status {
            Status::Idle => Ok(()),
            Status::Failed | Status::Closed => Err(self.lost()),
            status => Err(NotReady::new(status).into()),
        }
    }

    /// Queue a message.
    pub(crate) fn send<F: FrontendMessage>(&mut self, message: F) {
        frontend::write(message, &mut self.write_buf);
        if self.trace {
            log_debug!("pgpoll > {}", F::NAME);
        }
        verbose!(message = F::NAME, "send");
    }

    pub(crate) fn trace_recv(&self, _message: &BackendMessage) {
        if self.trace {
            log_debug!("pgpoll < {_message:?}");
        }
        verbose!(message = _message.name(), "recv");
    }

    /// Write until done or would block, returns `true` when done.
    fn flush_some(&mut self) -> Result<bool> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ConnectionLost::new("connection is not open").into());
        };
        while !self.write_buf.is_empty() {
            match transport.write(&self.write_buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.write_buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    /// Write everything, reading input meanwhile so the server is never blocked on us.
    fn flush_blocking(&mut self) -> Result<()> {
        while !self.flush_some()? {
            let Some(transport) = &self.transport else {
                return Err(ConnectionLost::new("connection is not open").into());
            };
            let readiness = match transport.wait(Interest::Both, None)? {
                true => transport.readiness()?,
                false => continue,
            };
            if readiness.readable {
                self.fill()?;
            }
        }
        Ok(())
    }

    /// Read until would block or end of stream.
    fn fill(&mut self) -> Result<()> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(ConnectionLost::new("connection is not open").into());
        };
        loop {
            match transport.read(&mut self.read_buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(());
                },
                Ok(_) => {},
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {},
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Split a complete message from the read buffer.
    fn next_message(&mut self) -> Result<Option<BackendMessage>, ProtocolError> {
        let Some(header) = self.read_buf.get(..HEADER) else {
            return Ok(None);
        };
        let msgtype = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len < 4 || len - 4 > MAX_MESSAGE {
            return Err(ProtocolError::malformed(format!("invalid message length {len}")));
        }
        if self.read_buf.len() < 1 + len {
            self.read_buf.reserve(1 + len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(HEADER);
        let body = self.read_buf.split_to(len - 4).freeze();
        BackendMessage::decode(msgtype, body).map(Some)
    }

    /// Dispatch every complete message.
    fn process(&mut self) -> Result<()> {
        while let Some(message) = self.next_message()? {
            match self.status {
                Status::Connecting(_) => self.handshake(message)?,
                _ => self.dispatch(message)?,
            }
        }
        if self.eof {
            // results already received are delivered before the failure
            if self.status == Status::Busy && !self.results.is_empty() {
                return Ok(());
            }
            if let Some(err) = self.last_error.take() {
                return Err(err.into());
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed the connection unexpectedly",
            )
            .into());
        }
        Ok(())
    }

    /// Handle a backend message after the startup phase.
    fn dispatch(&mut self, message: BackendMessage) -> Result<()> {
        use BackendMessage::*;

        self.trace_recv(&message);

        match message {
            NotificationResponse(body) => self.notifies.push_back(Notify::decode(body)?),
            ParameterStatus { name, value } => {
                self.parameters.insert(name, value);
            },
            NoticeResponse(notice) => self.notice(notice),
            message if self.status != Status::Busy => match message {
                ErrorResponse(err) => {
                    // usually followed by the server closing the connection
                    self.error_message = err.to_string();
                    self.last_error = Some(err);
                },
                message => return Err(ProtocolError::unexpected_phase(message.msgtype(), "idle").into()),
            },
            ParameterDescription(oids) => self.builder.set_params(oids),
            RowDescription(desc) => {
                self.builder.set_columns(Column::parse(desc)?);
                if self.request == Request::Describe {
                    self.emit(ResultStatus::CommandOk, None, 0);
                }
            },
            NoData => {
                if self.request == Request::Describe {
                    self.emit(ResultStatus::CommandOk, None, 0);
                }
            },
            ParseComplete => {
                if self.request == Request::Prepare {
                    self.emit(ResultStatus::CommandOk, None, 0);
                }
            },
            BindComplete | CloseComplete => {},
            DataRow(row) => {
                self.builder.push_row(row)?;
                if self.single_row {
                    self.emit(ResultStatus::SingleTuple, None, 0);
                }
            },
            CommandComplete(cmd) => {
                let rows_affected = cmd.rows();
                let status = match self.builder.returns_tuples() {
                    true => ResultStatus::TuplesOk,
                    false => ResultStatus::CommandOk,
                };
                self.emit(status, Some(cmd.tag), rows_affected);
                self.builder.reset();
            },
            PortalSuspended => {
                self.emit(ResultStatus::TuplesOk, None, 0);
                self.builder.reset();
            },
            EmptyQueryResponse => {
                self.emit(ResultStatus::EmptyQuery, None, 0);
                self.builder.reset();
            },
            ErrorResponse(err) => {
                verbose!(code = err.code(), "query failed");
                self.last_error = Some(err.clone());
                self.results.push_back(QueryResult::fatal(err));
                self.produced = true;
                self.builder.reset();
            },
            CopyInResponse => {
                log_warn!("COPY FROM STDIN is not supported, aborting copy");
                self.send(CopyFail { message: "COPY FROM STDIN is not supported" });
            },
            // copy out data is discarded, the command still completes with a tag
            CopyOutResponse | CopyBothResponse | CopyData | CopyDone => {},
            ReadyForQuery { status } => {
                self.transaction = status;
                self.last_error = None;
                self.ready = true;
            },
            message @ (Authentication(_) | BackendKeyData { .. } | NegotiateProtocolVersion { .. }) => {
                return Err(ProtocolError::unexpected_phase(message.msgtype(), "query").into());
            },
        }
        Ok(())
    }

    fn emit(&mut self, status: ResultStatus, tag: Option<ByteStr>, rows_affected: u64) {
        let answer = self.builder.take(tag, rows_affected);
        self.results.push_back(QueryResult::new(status, answer));
        self.produced = true;
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.status)
            .field("host", &self.host())
            .field("port", &self.port())
            .field("dbname", &self.db_name())
            .field("backend_pid", &self.backend_pid())
            .finish_non_exhaustive()
    }
}

fn default_notice(notice: &Notice) {
    log_info!("{}: {}", notice.severity(), notice.message());
    let _ = notice;
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>")
}

fn timed_out() -> Error {
    io::Error::new(io::ErrorKind::TimedOut, "timeout expired").into()
}

/// `16.2 (Debian 16.2-1)` is `160002`, `9.6.3` is `90603`.
fn parse_server_version(version: &str) -> u32 {
    let numeric = version.split(|c: char| !c.is_ascii_digit() && c != '.').next().unwrap_or_default();
    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    match major >= 10 {
        true => major * 10000 + minor,
        false => major * 10000 + minor * 100 + parts.next().unwrap_or(0),
    }
}

/// Connection is unusable.
pub struct ConnectionLost {
    message: String,
}

impl ConnectionLost {
    pub(crate) fn new(message: impl Into<String>) -> ConnectionLost {
        ConnectionLost { message: message.into() }
    }

    /// Returns the message of the failure that made the connection unusable.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::error::Error for ConnectionLost { }

impl fmt::Display for ConnectionLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection lost: {}", self.message)
    }
}

impl fmt::Debug for ConnectionLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Operation is not allowed in current connection status.
pub struct NotReady {
    status: Status,
}

impl NotReady {
    pub(crate) fn new(status: Status) -> NotReady {
        NotReady { status }
    }

    pub fn status(&self) -> Status {
        self.status
    }
}

impl std::error::Error for NotReady { }

impl fmt::Display for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection is not ready, current status is {:?}", self.status)
    }
}

impl fmt::Debug for NotReady {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        ErrorKind,
        postgres::{Format, OidType},
        testing::{connected, frame, script, Script},
    };

    #[test]
    fn start_validates_eagerly() {
        let err = Connection::start("host=localhost bogus=1").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Config(_)));

        let conn = Connection::start_with::<Script>("host=localhost dbname=test").unwrap();
        assert_eq!(conn.status(), Status::Connecting(Handshake::Opening));
        assert_eq!(conn.db_name(), "test");
        assert_eq!(conn.protocol_version(), 0);
    }

    #[test]
    fn handshake_reaches_idle() {
        let (conn, _) = connected();
        assert_eq!(conn.status(), Status::Idle);
        assert_eq!(conn.protocol_version(), 3);
        assert_eq!(conn.server_version(), 160002);
        assert_eq!(conn.parameter_status("standard_conforming_strings"), Some("on"));
        assert_eq!(conn.backend_pid(), 42);
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
    }

    #[test]
    fn poll_is_idempotent() {
        let (mut conn, wire) = connected();
        for _ in 0..3 {
            assert_eq!(conn.poll().unwrap(), PollStatus::Ready);
            assert_eq!(conn.status(), Status::Idle);
        }
        assert!(wire.borrow().outbound.is_empty());

        conn.close();
        for _ in 0..3 {
            assert_eq!(conn.poll().unwrap(), PollStatus::Failed);
            assert_eq!(conn.status(), Status::Closed);
        }
        assert!(matches!(conn.send_query("SELECT 1").unwrap_err().kind(), ErrorKind::ConnectionLost(_)));
        assert!(matches!(conn.reset_start().unwrap_err().kind(), ErrorKind::ConnectionLost(_)));
    }

    #[test]
    fn select_one() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::row_description(&[("?column?", OidType::Int4.oid(), Format::Text)]));
        wire.borrow_mut().push(frame::data_row(&[Some(b"1")]));
        wire.borrow_mut().push(frame::command_complete("SELECT 1"));
        wire.borrow_mut().push(frame::ready(b'I'));

        conn.send_query("SELECT 1").unwrap();
        assert_eq!(conn.status(), Status::Busy);
        assert_eq!(conn.transaction_status(), TransactionStatus::Active);

        let result = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(result.status(), ResultStatus::TuplesOk);
        let answer = result.answer().unwrap();
        assert_eq!(answer.column_count(), 1);
        assert_eq!(answer.len(), 1);
        assert_eq!(answer.get::<i32>(0, 0).unwrap(), 1);
        assert_eq!(answer.cmd_status(), "SELECT 1");

        assert!(conn.get_result().unwrap().is_exhausted());
        assert_eq!(conn.status(), Status::Idle);
    }

    #[test]
    fn drain_is_idempotent() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::command_complete("CREATE TABLE"));
        wire.borrow_mut().push(frame::ready(b'I'));

        conn.send_query("CREATE TABLE t()").unwrap();
        let result = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(result.status(), ResultStatus::CommandOk);
        for _ in 0..3 {
            assert!(conn.get_result().unwrap().is_exhausted());
        }
    }

    #[test]
    fn would_block_until_input() {
        let (mut conn, wire) = connected();
        conn.send_query("SELECT 1").unwrap();
        assert!(conn.is_busy());
        assert!(matches!(conn.get_result().unwrap(), Fetch::WouldBlock));
        assert_eq!(conn.poll().unwrap(), PollStatus::Reading);

        wire.borrow_mut().push(frame::empty_query());
        wire.borrow_mut().push(frame::ready(b'I'));
        conn.consume_input().unwrap();
        assert!(!conn.is_busy());
        let result = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(result.status(), ResultStatus::EmptyQuery);
        assert!(conn.get_result().unwrap().is_exhausted());
    }

    #[test]
    fn send_while_busy() {
        let (mut conn, _) = connected();
        conn.send_query("SELECT 1").unwrap();
        let err = conn.send_query("SELECT 2").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotReady(_)));
        assert_eq!(conn.status(), Status::Busy);
    }

    #[test]
    fn multiple_statements() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::row_description(&[("a", OidType::Int4.oid(), Format::Text)]));
        wire.borrow_mut().push(frame::data_row(&[Some(b"1")]));
        wire.borrow_mut().push(frame::command_complete("SELECT 1"));
        wire.borrow_mut().push(frame::command_complete("UPDATE 3"));
        wire.borrow_mut().push(frame::error("ERROR", "42P01", "relation \"nope\" does not exist"));
        wire.borrow_mut().push(frame::ready(b'E'));

        conn.send_query("SELECT 1; UPDATE t SET a = 1; SELECT * FROM nope").unwrap();
        let first = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(first.status(), ResultStatus::TuplesOk);
        let second = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(second.status(), ResultStatus::CommandOk);
        assert_eq!(second.cmd_tuples(), 3);
        assert_eq!(second.answer().unwrap().column_count(), 0);
        let third = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(third.status(), ResultStatus::FatalError);
        assert_eq!(third.error().map(|e| e.code()), Some("42P01"));
        assert!(conn.get_result().unwrap().is_exhausted());

        // server error keeps the connection usable
        assert_eq!(conn.status(), Status::Idle);
        assert_eq!(conn.transaction_status(), TransactionStatus::InError);
    }

    #[test]
    fn single_row_mode() {
        let (mut conn, wire) = connected();
        assert!(!conn.set_single_row_mode(), "no query running");

        wire.borrow_mut().push(frame::row_description(&[("n", OidType::Int4.oid(), Format::Text)]));
        wire.borrow_mut().push(frame::data_row(&[Some(b"1")]));
        wire.borrow_mut().push(frame::data_row(&[Some(b"2")]));
        wire.borrow_mut().push(frame::command_complete("SELECT 2"));
        wire.borrow_mut().push(frame::ready(b'I'));

        conn.send_query("SELECT generate_series(1, 2)").unwrap();
        assert!(conn.set_single_row_mode());

        for n in 1..=2 {
            let result = conn.get_result().unwrap().ready().unwrap();
            assert_eq!(result.status(), ResultStatus::SingleTuple);
            let answer = result.answer().unwrap();
            assert_eq!(answer.len(), 1);
            assert_eq!(answer.get::<i32>(0, 0).unwrap(), n);
            assert!(!conn.set_single_row_mode(), "result already produced");
        }
        let last = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(last.status(), ResultStatus::TuplesOk);
        assert_eq!(last.answer().unwrap().len(), 0);
        assert_eq!(last.answer().unwrap().column_count(), 1);
        assert!(conn.get_result().unwrap().is_exhausted());
    }

    #[test]
    fn notice_processor() {
        let (mut conn, wire) = connected();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        conn.set_notice_processor(move |notice| sink.lock().unwrap().push(notice.message().to_owned()));

        wire.borrow_mut().push(frame::notice("NOTICE", "00000", "first"));
        conn.consume_input().unwrap();
        assert_eq!(*seen.lock().unwrap(), ["first"]);

        conn.set_notice_processor(|_| panic!("broken processor"));
        wire.borrow_mut().push(frame::notice("WARNING", "01000", "second"));
        conn.consume_input().unwrap();
        assert_eq!(conn.status(), Status::Idle);

        conn.clear_notice_processor();
        wire.borrow_mut().push(frame::notice("NOTICE", "00000", "third"));
        conn.consume_input().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn notification() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::notification(99, "jobs", "42"));
        wire.borrow_mut().push(frame::parameter_status("TimeZone", "UTC"));
        assert!(conn.next_notify().is_none());

        conn.consume_input().unwrap();
        let notify = conn.next_notify().unwrap();
        assert_eq!((notify.channel(), notify.payload(), notify.process_id()), ("jobs", "42", 99));
        assert!(conn.next_notify().is_none());
        assert_eq!(conn.parameter_status("TimeZone"), Some("UTC"));
    }

    #[test]
    fn transport_failure() {
        let (mut conn, wire) = connected();
        conn.send_query("SELECT 1").unwrap();
        wire.borrow_mut().close();

        let err = conn.get_result().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Io(_)));
        assert_eq!(conn.status(), Status::Failed);
        assert!(conn.error_message().contains("closed"));

        let err = conn.get_result().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::ConnectionLost(_)));
        assert_eq!(conn.poll().unwrap(), PollStatus::Failed);
    }

    #[test]
    fn fatal_while_idle() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::error("FATAL", "57P01", "terminating connection due to administrator command"));
        wire.borrow_mut().close();

        let err = conn.consume_input().unwrap_err();
        assert_eq!(err.as_server_error().map(|e| e.code()), Some("57P01"));
        assert_eq!(conn.status(), Status::Failed);
    }

    #[test]
    fn fatal_while_busy() {
        let (mut conn, wire) = connected();
        conn.send_query("SELECT pg_sleep(60)").unwrap();
        wire.borrow_mut().push(frame::error("FATAL", "57P01", "terminating connection due to administrator command"));
        wire.borrow_mut().close();

        let result = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(result.status(), ResultStatus::FatalError);
        assert_eq!(result.error().map(|e| e.code()), Some("57P01"));

        let err = conn.get_result().unwrap_err();
        assert_eq!(err.as_server_error().map(|e| e.code()), Some("57P01"));
        assert_eq!(conn.status(), Status::Failed);
        assert!(conn.error_message().contains("administrator command"));
    }

    #[test]
    fn message_split_across_reads() {
        let (mut conn, wire) = connected();
        conn.send_query("SELECT 1").unwrap();

        let mut input = BytesMut::new();
        input.extend_from_slice(&frame::row_description(&[("n", OidType::Int4.oid(), Format::Text)]));
        input.extend_from_slice(&frame::data_row(&[Some(b"1")]));
        input.extend_from_slice(&frame::command_complete("SELECT 1"));
        input.extend_from_slice(&frame::ready(b'I'));
        let input = input.freeze();

        // header cut inside the length, then a body cut short
        for piece in [input.slice(..3), input.slice(3..9)] {
            wire.borrow_mut().push(piece);
            assert!(matches!(conn.get_result().unwrap(), Fetch::WouldBlock));
        }

        // everything but the tail of ReadyForQuery
        wire.borrow_mut().push(input.slice(9..input.len() - 2));
        conn.consume_input().unwrap();
        assert!(!conn.is_busy());
        let result = conn.get_result().unwrap().ready().unwrap();
        assert_eq!(result.answer().unwrap().get::<i32>(0, 0).unwrap(), 1);
        assert!(matches!(conn.get_result().unwrap(), Fetch::WouldBlock));

        wire.borrow_mut().push(input.slice(input.len() - 2..));
        assert!(conn.get_result().unwrap().is_exhausted());
        assert_eq!(conn.status(), Status::Idle);
    }

    #[test]
    fn oversized_message_length() {
        let (mut conn, wire) = connected();
        conn.send_query("SELECT 1").unwrap();
        wire.borrow_mut().push(Bytes::from_static(&[b'D', 0xff, 0xff, 0xff, 0xff]));

        let err = conn.get_result().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        assert_eq!(conn.status(), Status::Failed);
    }

    #[test]
    fn malformed_message_fails_connection() {
        let (mut conn, wire) = connected();
        conn.send_query("SELECT 1").unwrap();
        wire.borrow_mut().push(frame::message(b'Z', &[]));

        let err = conn.get_result().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        assert_eq!(conn.status(), Status::Failed);
    }

    #[test]
    fn reset_keeps_identity() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().close();
        assert!(conn.consume_input().is_err());
        assert_eq!(conn.status(), Status::Failed);

        let next = script();
        next.borrow_mut().push_handshake(77);
        conn.reset_start().unwrap();
        assert_eq!(conn.status(), Status::Connecting(Handshake::Opening));
        assert_eq!(conn.backend_pid(), 0);

        while conn.reset_poll().unwrap() != PollStatus::Ready { }
        assert_eq!(conn.status(), Status::Idle);
        assert_eq!(conn.backend_pid(), 77);
    }

    #[test]
    fn close_sends_terminate() {
        let (mut conn, wire) = connected();
        conn.close();
        assert_eq!(&wire.borrow().outbound[..], &[b'X', 0, 0, 0, 4]);
        assert!(wire.borrow().closed);
        assert_eq!(conn.status(), Status::Closed);
        assert!(matches!(conn.get_result().unwrap_err().kind(), ErrorKind::ConnectionLost(_)));
    }

    #[test]
    fn drop_sends_terminate() {
        let (conn, wire) = connected();
        drop(conn);
        assert_eq!(&wire.borrow().outbound[..], &[b'X', 0, 0, 0, 4]);
    }

    #[test]
    fn copy_in_is_refused() {
        let (mut conn, wire) = connected();
        wire.borrow_mut().push(frame::message(b'G', &[0, 0, 0]));
        conn.send_query("COPY t FROM STDIN").unwrap();
        wire.borrow_mut().take_outbound();

        assert!(matches!(conn.get_result().unwrap(), Fetch::WouldBlock));
        assert_eq!(wire.borrow().outbound[0], b'f');
    }

    #[test]
    fn server_version_format() {
        assert_eq!(parse_server_version("16.2 (Debian 16.2-1.pgdg120+2)"), 160002);
        assert_eq!(parse_server_version("9.6.3"), 90603);
        assert_eq!(parse_server_version("17devel"), 170000);
        assert_eq!(parse_server_version(""), 0);
    }
}
