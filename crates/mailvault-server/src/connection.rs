//! Connections and their state machine.
//!
//! A [`Connection`] pairs an [`Endpoint`] (the conduit plus its read and
//! write buffers, state, and deadline) with a [`ConnectionHandler`] that
//! reacts to the events the reactor dispatches. The reactor owns both and
//! drives all I/O; handlers only consume the read buffer and enqueue output.

use std::time::Instant;

use bytes::BytesMut;

use crate::error::Result;
use crate::reactor::ReactorHandle;
use crate::stream::{Conduit, Interest};

/// Read buffers start at this capacity and are replaced with a fresh
/// allocation when idle well above it.
pub(crate) const BUF_SHRINK_THRESHOLD: usize = 8192;

const READ_CHUNK: usize = 8192;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// An outbound connect is in flight.
    Connecting,
    /// The connection is established and serviced normally.
    Connected,
    /// The connection is draining its write buffer before closing.
    Closing,
}

/// What a connection is for. Determines which gauge counts it and whether
/// its lifecycle is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// A listening socket handing out new connections.
    Listener,
    /// An IMAP client session.
    ImapServer,
    /// A POP3 client session.
    Pop3Server,
    /// An SMTP client session.
    SmtpServer,
    /// An HTTP client session.
    HttpServer,
    /// A connection to the database server.
    DatabaseClient,
    /// Internal plumbing; not logged and counted separately.
    Internal,
}

impl Role {
    /// The gauge name counting connections of this role.
    #[must_use]
    pub const fn gauge_name(self) -> &'static str {
        match self {
            Self::Listener => "listeners",
            Self::ImapServer => "imap-connections",
            Self::Pop3Server => "pop3-connections",
            Self::SmtpServer => "smtp-connections",
            Self::HttpServer => "http-connections",
            Self::DatabaseClient => "db-connections",
            Self::Internal => "internal-connections",
        }
    }
}

/// Events dispatched to a [`ConnectionHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An outbound connect completed.
    Connect,
    /// New data was appended to the read buffer, or EOF was seen.
    Read,
    /// The peer closed the stream.
    Close,
    /// An in-flight connect failed.
    Error,
    /// The connection's deadline passed.
    Timeout,
    /// The server is shutting down; say goodbye now.
    Shutdown,
}

/// Reacts to connection events.
///
/// The handler never performs I/O itself: by the time `react` runs for a
/// `Read` event the new bytes are already in the endpoint's read buffer,
/// and whatever the handler enqueues is flushed by the reactor afterwards.
pub trait ConnectionHandler {
    /// Handles one event. Returning an error closes the connection.
    ///
    /// # Errors
    ///
    /// Implementations return an error to have the reactor force-close the
    /// connection.
    fn react(&mut self, event: Event, conn: &mut Endpoint, reactor: &ReactorHandle) -> Result<()>;
}

/// The I/O side of a connection: conduit, buffers, state, deadline.
pub struct Endpoint {
    pub(crate) id: u64,
    role: Role,
    state: ConnState,
    pub(crate) conduit: Box<dyn Conduit>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    deadline: Option<Instant>,
    eof: bool,
    pub(crate) detached: bool,
}

impl Endpoint {
    pub(crate) fn new(role: Role, state: ConnState, conduit: Box<dyn Conduit>) -> Self {
        Self {
            id: 0,
            role,
            state,
            conduit,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            deadline: None,
            eof: false,
            detached: false,
        }
    }

    /// The reactor-assigned connection id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The connection's role.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The connection's lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) const fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    /// The bytes read but not yet consumed. Handlers parse from here and
    /// `advance` past what they consumed.
    pub fn read_buffer(&mut self) -> &mut BytesMut {
        &mut self.read_buf
    }

    /// Queues `data` to be written when the conduit is writable.
    pub fn enqueue(&mut self, data: &[u8]) {
        self.write_buf.extend_from_slice(data);
    }

    /// True until EOF has been seen.
    #[must_use]
    pub const fn can_read(&self) -> bool {
        !self.eof
    }

    /// True while queued output remains.
    #[must_use]
    pub fn can_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Bytes currently buffered in both directions.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.read_buf.len() + self.write_buf.len()
    }

    /// Arms the inactivity deadline.
    pub const fn set_deadline(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    /// Disarms the deadline.
    pub const fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    pub(crate) const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Begins a graceful close: queued output is flushed first, then the
    /// connection is torn down.
    pub const fn start_closing(&mut self) {
        self.state = ConnState::Closing;
    }

    /// Tears the connection down without flushing queued output.
    pub fn force_close(&mut self) {
        self.state = ConnState::Closing;
        self.write_buf.clear();
    }

    /// Accepts a queued incoming connection from a listening conduit.
    ///
    /// # Errors
    ///
    /// Propagates accept errors from the conduit.
    pub fn accept(&mut self) -> Result<Option<(Box<dyn Conduit>, std::net::SocketAddr)>> {
        Ok(self.conduit.accept()?)
    }

    /// A short human-readable description for logs.
    #[must_use]
    pub fn description(&self) -> String {
        match self.conduit.peer() {
            Some(addr) => format!("{:?} connection {} to {addr}", self.role, self.id),
            None => format!("{:?} connection {}", self.role, self.id),
        }
    }

    /// The interest set the reactor should poll with.
    pub(crate) fn interest(&self, in_startup: bool) -> Interest {
        if self.detached {
            return Interest::default();
        }
        if self.role == Role::Listener {
            // Listeners sit idle until startup completes.
            return Interest {
                readable: !in_startup,
                writable: false,
            };
        }
        Interest {
            readable: self.can_read() && self.state != ConnState::Closing,
            writable: self.can_write() || self.state != ConnState::Connected,
        }
    }

    /// Reads everything currently available into the read buffer.
    /// Returns true if any bytes arrived.
    pub(crate) fn fill(&mut self) -> std::io::Result<bool> {
        let mut any = false;
        let mut scratch = [0u8; READ_CHUNK];
        loop {
            match self.conduit.try_read(&mut scratch) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&scratch[..n]);
                    any = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(any)
    }

    /// Writes as much queued output as the conduit accepts.
    pub(crate) fn flush(&mut self) -> std::io::Result<()> {
        while !self.write_buf.is_empty() {
            match self.conduit.try_write(&self.write_buf) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = self.write_buf.split_to(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Replaces oversized idle buffers with fresh small ones.
    pub(crate) fn shrink_buffers(&mut self) {
        if self.read_buf.is_empty() && self.read_buf.capacity() > BUF_SHRINK_THRESHOLD {
            self.read_buf = BytesMut::new();
        }
        if self.write_buf.is_empty() && self.write_buf.capacity() > BUF_SHRINK_THRESHOLD {
            self.write_buf = BytesMut::new();
        }
    }
}

/// A connection as owned by the reactor.
pub struct Connection {
    pub(crate) endpoint: Endpoint,
    pub(crate) handler: Box<dyn ConnectionHandler>,
}

impl Connection {
    /// An established connection serviced from the first iteration.
    #[must_use]
    pub fn established(
        role: Role,
        conduit: Box<dyn Conduit>,
        handler: Box<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(role, ConnState::Connected, conduit),
            handler,
        }
    }

    /// The I/O side of the connection.
    #[must_use]
    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The I/O side of the connection, mutably. Useful for arming a
    /// deadline before handing the connection to the reactor.
    pub const fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    /// A connection whose conduit is still connecting. The handler gets a
    /// [`Event::Connect`] or [`Event::Error`] once the connect resolves.
    #[must_use]
    pub fn connecting(
        role: Role,
        conduit: Box<dyn Conduit>,
        handler: Box<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            endpoint: Endpoint::new(role, ConnState::Connecting, conduit),
            handler,
        }
    }
}
