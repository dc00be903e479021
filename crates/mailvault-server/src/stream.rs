//! The stream boundary.
//!
//! The reactor does not talk to sockets directly; it drives a [`Conduit`],
//! which bundles the operations the event loop needs: readiness polling for
//! a given interest set, non-blocking reads and writes, pending
//! connect/error signals, and accept for listening sockets.
//!
//! [`TcpConduit`] and [`ListenerConduit`] implement the boundary over
//! `tokio::net`; [`ScriptedConduit`] is an in-memory implementation for
//! tests, driven from the outside through a [`Script`] handle.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use tokio::net::{TcpListener, TcpStream};

/// Which events a connection currently cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interest {
    /// Wake when the conduit can be read.
    pub readable: bool,
    /// Wake when the conduit can be written.
    pub writable: bool,
}

impl Interest {
    /// True if either direction is of interest.
    #[must_use]
    pub const fn any(self) -> bool {
        self.readable || self.writable
    }
}

/// The events a conduit reported as ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The conduit can be read without blocking.
    pub readable: bool,
    /// The conduit can be written without blocking.
    pub writable: bool,
}

/// Out-of-band conditions a conduit can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// An in-progress connect has succeeded.
    Connect,
    /// An in-progress connect has failed.
    Error,
}

/// A duplex byte stream (or listening socket) as seen by the reactor.
pub trait Conduit {
    /// Polls for readiness limited to `interest`. Registers the waker and
    /// returns `Pending` when nothing is ready.
    fn poll_readiness(
        &mut self,
        cx: &mut Context<'_>,
        interest: Interest,
    ) -> Poll<io::Result<Readiness>>;

    /// Reads into `buf`, returning `Ok(0)` at end of stream and
    /// `WouldBlock` when no data is available right now.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning `WouldBlock` when the stream cannot
    /// accept data right now.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// True if the given out-of-band signal is pending.
    fn is_pending(&self, signal: Signal) -> bool {
        let _ = signal;
        false
    }

    /// Disambiguates simultaneous read/write readiness while connecting:
    /// `Ok` means the connect succeeded, `Err` that it failed.
    fn connect_check(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Accepts a queued incoming connection, if this is a listening conduit.
    fn accept(&mut self) -> io::Result<Option<(Box<dyn Conduit>, SocketAddr)>> {
        Ok(None)
    }

    /// The peer address, once known.
    fn peer(&self) -> Option<SocketAddr> {
        None
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>>>>;

enum TcpPhase {
    Connecting(ConnectFuture),
    Established(TcpStream),
    Broken,
}

/// A TCP stream conduit, either established or with a connect in flight.
pub struct TcpConduit {
    phase: TcpPhase,
    pending_connect: bool,
    pending_error: Option<io::Error>,
    peer: Option<SocketAddr>,
}

impl TcpConduit {
    /// Wraps an already-established stream (e.g. from accept).
    #[must_use]
    pub fn established(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            phase: TcpPhase::Established(stream),
            pending_connect: false,
            pending_error: None,
            peer,
        }
    }

    /// Starts an outbound connect. The conduit reports writable readiness
    /// and a pending [`Signal::Connect`] or [`Signal::Error`] once the
    /// connect resolves.
    #[must_use]
    pub fn connect(addr: SocketAddr) -> Self {
        Self {
            phase: TcpPhase::Connecting(Box::pin(TcpStream::connect(addr))),
            pending_connect: false,
            pending_error: None,
            peer: Some(addr),
        }
    }
}

impl Conduit for TcpConduit {
    fn poll_readiness(
        &mut self,
        cx: &mut Context<'_>,
        interest: Interest,
    ) -> Poll<io::Result<Readiness>> {
        match &mut self.phase {
            TcpPhase::Connecting(fut) => match fut.as_mut().poll(cx) {
                Poll::Ready(Ok(stream)) => {
                    self.peer = stream.peer_addr().ok();
                    self.phase = TcpPhase::Established(stream);
                    self.pending_connect = true;
                    Poll::Ready(Ok(Readiness {
                        readable: false,
                        writable: true,
                    }))
                }
                Poll::Ready(Err(e)) => {
                    self.pending_error = Some(e);
                    self.phase = TcpPhase::Broken;
                    Poll::Ready(Ok(Readiness {
                        readable: false,
                        writable: true,
                    }))
                }
                Poll::Pending => Poll::Pending,
            },
            TcpPhase::Established(stream) => {
                let mut ready = Readiness::default();
                if interest.readable {
                    match stream.poll_read_ready(cx) {
                        Poll::Ready(Ok(())) => ready.readable = true,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {}
                    }
                }
                if interest.writable {
                    match stream.poll_write_ready(cx) {
                        Poll::Ready(Ok(())) => ready.writable = true,
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => {}
                    }
                }
                if ready.readable || ready.writable {
                    Poll::Ready(Ok(ready))
                } else {
                    Poll::Pending
                }
            }
            TcpPhase::Broken => Poll::Ready(Ok(Readiness {
                readable: false,
                writable: true,
            })),
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.phase {
            TcpPhase::Established(stream) => stream.try_read(buf),
            TcpPhase::Connecting(_) => Err(io::ErrorKind::WouldBlock.into()),
            TcpPhase::Broken => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.phase {
            TcpPhase::Established(stream) => stream.try_write(buf),
            TcpPhase::Connecting(_) => Err(io::ErrorKind::WouldBlock.into()),
            TcpPhase::Broken => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    fn is_pending(&self, signal: Signal) -> bool {
        match signal {
            Signal::Connect => self.pending_connect,
            Signal::Error => self.pending_error.is_some(),
        }
    }

    fn connect_check(&mut self) -> io::Result<()> {
        match self.pending_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// A listening socket conduit. Reports readable readiness when an incoming
/// connection is waiting; hand it out through [`Conduit::accept`].
pub struct ListenerConduit {
    listener: TcpListener,
    backlog: VecDeque<(TcpStream, SocketAddr)>,
}

impl ListenerConduit {
    /// Wraps a bound listener.
    #[must_use]
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            backlog: VecDeque::new(),
        }
    }

    /// Binds a new listener on `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(TcpListener::bind(addr).await?))
    }

    /// The locally bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn drain_ready(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        loop {
            match self.listener.poll_accept(cx) {
                Poll::Ready(Ok(pair)) => self.backlog.push_back(pair),
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => return Ok(()),
            }
        }
    }
}

impl Conduit for ListenerConduit {
    fn poll_readiness(
        &mut self,
        cx: &mut Context<'_>,
        interest: Interest,
    ) -> Poll<io::Result<Readiness>> {
        if !interest.readable {
            return Poll::Pending;
        }
        if let Err(e) = self.drain_ready(cx) {
            return Poll::Ready(Err(e));
        }
        if self.backlog.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(Readiness {
                readable: true,
                writable: false,
            }))
        }
    }

    fn try_read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn try_write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn accept(&mut self) -> io::Result<Option<(Box<dyn Conduit>, SocketAddr)>> {
        if self.backlog.is_empty() {
            let mut cx = Context::from_waker(Waker::noop());
            self.drain_ready(&mut cx)?;
        }
        Ok(self
            .backlog
            .pop_front()
            .map(|(stream, addr)| (Box::new(TcpConduit::established(stream)) as Box<dyn Conduit>, addr)))
    }
}

#[derive(Default)]
struct ScriptState {
    chunks: VecDeque<Vec<u8>>,
    eof: bool,
    written: Vec<u8>,
    writable: bool,
    read_error: Option<io::ErrorKind>,
    write_error: Option<io::ErrorKind>,
    pending_connect: bool,
    pending_error: bool,
    poll_error: Option<io::Error>,
    accepts: VecDeque<ScriptedConduit>,
}

/// An in-memory conduit whose behavior is scripted by tests.
pub struct ScriptedConduit {
    state: Rc<RefCell<ScriptState>>,
}

/// The test-side handle of a [`ScriptedConduit`].
pub struct Script {
    state: Rc<RefCell<ScriptState>>,
}

impl ScriptedConduit {
    /// Creates a conduit/script pair. The conduit starts writable with no
    /// readable data.
    #[must_use]
    pub fn new() -> (Self, Script) {
        let state = Rc::new(RefCell::new(ScriptState {
            writable: true,
            ..ScriptState::default()
        }));
        (
            Self {
                state: Rc::clone(&state),
            },
            Script { state },
        )
    }
}

impl Script {
    /// Queues `data` for the next reads.
    pub fn push_read(&self, data: &[u8]) {
        self.state.borrow_mut().chunks.push_back(data.to_vec());
    }

    /// Marks the stream as exhausted after the queued data.
    pub fn set_eof(&self) {
        self.state.borrow_mut().eof = true;
    }

    /// Everything the connection has written so far.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.state.borrow().written.clone()
    }

    /// Makes reads fail with the given error kind.
    pub fn fail_reads(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().read_error = Some(kind);
    }

    /// Makes writes fail with the given error kind.
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.state.borrow_mut().write_error = Some(kind);
    }

    /// Controls write readiness.
    pub fn set_writable(&self, writable: bool) {
        self.state.borrow_mut().writable = writable;
    }

    /// Signals that an in-flight connect succeeded.
    pub fn signal_connect(&self) {
        self.state.borrow_mut().pending_connect = true;
    }

    /// Signals that an in-flight connect failed.
    pub fn signal_error(&self) {
        self.state.borrow_mut().pending_error = true;
    }

    /// Makes the next readiness poll fail with `error`.
    pub fn fail_poll(&self, error: io::Error) {
        self.state.borrow_mut().poll_error = Some(error);
    }

    /// Queues a conduit to be handed out by `accept`.
    pub fn push_accept(&self, conduit: ScriptedConduit) {
        self.state.borrow_mut().accepts.push_back(conduit);
    }
}

impl Conduit for ScriptedConduit {
    fn poll_readiness(
        &mut self,
        _cx: &mut Context<'_>,
        interest: Interest,
    ) -> Poll<io::Result<Readiness>> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = state.poll_error.take() {
            return Poll::Ready(Err(e));
        }
        let mut ready = Readiness::default();
        if interest.readable
            && (!state.chunks.is_empty()
                || state.eof
                || state.read_error.is_some()
                || !state.accepts.is_empty())
        {
            ready.readable = true;
        }
        if interest.writable
            && (state.writable || state.pending_connect || state.pending_error)
        {
            ready.writable = true;
        }
        if ready.readable || ready.writable {
            Poll::Ready(Ok(ready))
        } else {
            Poll::Pending
        }
    }

    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.read_error {
            return Err(kind.into());
        }
        if let Some(mut chunk) = state.chunks.pop_front() {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                let rest = chunk.split_off(n);
                state.chunks.push_front(rest);
            }
            return Ok(n);
        }
        if state.eof {
            return Ok(0);
        }
        Err(io::ErrorKind::WouldBlock.into())
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }
        if !state.writable {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn is_pending(&self, signal: Signal) -> bool {
        let state = self.state.borrow();
        match signal {
            Signal::Connect => state.pending_connect,
            Signal::Error => state.pending_error,
        }
    }

    fn connect_check(&mut self) -> io::Result<()> {
        if self.state.borrow().pending_error {
            Err(io::ErrorKind::ConnectionRefused.into())
        } else {
            Ok(())
        }
    }

    fn accept(&mut self) -> io::Result<Option<(Box<dyn Conduit>, SocketAddr)>> {
        let accepted = self.state.borrow_mut().accepts.pop_front();
        Ok(accepted.map(|c| {
            (
                Box::new(c) as Box<dyn Conduit>,
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            )
        }))
    }
}
