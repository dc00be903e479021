//! The single-threaded event loop.
//!
//! The [`Reactor`] owns every connection and performs all network I/O on one
//! thread. Each iteration computes per-connection interest, waits until some
//! conduit is ready, a deadline passes, or the loop is woken, then fires due
//! timers and dispatches events to the affected connection handlers. Handlers
//! run to completion; nothing in the core blocks.
//!
//! Run the reactor on a current-thread runtime inside a
//! [`tokio::task::LocalSet`]; connections and handlers are deliberately not
//! `Send`.

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;
use std::task::Poll;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::connection::{ConnState, Connection, Event, Role};
use crate::error::{Error, Result};
use crate::event::{OwnerRef, notify};
use crate::metrics::Gauges;
use crate::stream::{Interest, Readiness, Signal};
use crate::time::{Clock, SharedClock, SystemClock};
use crate::timer::{Timer, TimerId, earliest, take_due};

/// Tuning knobs for the reactor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// Upper bound on how long one iteration may wait for readiness.
    pub max_wait: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(60),
        }
    }
}

/// Periodic housekeeping policy.
///
/// The reactor asks the policy two questions each iteration: whether the
/// readiness wait should be shortened because buffers are under pressure,
/// and whether a reclamation pass over idle buffers is due.
pub trait Maintenance {
    /// Returns a shorter wait bound when buffered bytes warrant more
    /// frequent iterations, or `None` to leave the wait alone.
    fn shorten_wait(&mut self, buffered: u64) -> Option<Duration> {
        let _ = buffered;
        None
    }

    /// Decides whether a reclamation pass should run now.
    fn due(&mut self, buffered: u64, since_last: Duration) -> bool;
}

/// The stock maintenance policy.
///
/// Shortens the wait to three seconds once more than 16 KiB sit in
/// connection buffers. Runs reclamation when buffered bytes exceed 8 MiB
/// and have grown by a fifth since the last pass, or every minute while at
/// least 128 KiB are buffered.
#[derive(Debug, Default)]
pub struct DefaultMaintenance {
    last_buffered: u64,
}

const PRESSURE_BYTES: u64 = 16_384;
const PRESSURE_WAIT: Duration = Duration::from_secs(3);
const RECLAIM_BYTES: u64 = 8 * 1024 * 1024;
const RECLAIM_IDLE_BYTES: u64 = 128 * 1024;
const RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

impl Maintenance for DefaultMaintenance {
    fn shorten_wait(&mut self, buffered: u64) -> Option<Duration> {
        (buffered > PRESSURE_BYTES).then_some(PRESSURE_WAIT)
    }

    fn due(&mut self, buffered: u64, since_last: Duration) -> bool {
        let grown = buffered > RECLAIM_BYTES && buffered > self.last_buffered / 5 * 6;
        let idle = since_last >= RECLAIM_INTERVAL && buffered >= RECLAIM_IDLE_BYTES;
        if grown || idle {
            self.last_buffered = buffered;
            true
        } else {
            false
        }
    }
}

struct Shared {
    stop: Cell<bool>,
    startup: Cell<bool>,
    additions: RefCell<Vec<Connection>>,
    timers: RefCell<Vec<Timer>>,
    next_timer: Cell<u64>,
    wake: Notify,
    clock: SharedClock,
}

/// A cloneable handle for talking to the reactor from handlers and
/// continuations on the same thread.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Rc<Shared>,
}

impl ReactorHandle {
    /// Hands a connection to the reactor. It is adopted at the start of the
    /// next iteration. Connections offered during shutdown are dropped.
    pub fn add_connection(&self, conn: Connection) {
        if self.shared.stop.get() {
            tracing::debug!(
                "connection offered during shutdown; dropping {}",
                conn.endpoint.description()
            );
            return;
        }
        self.shared.additions.borrow_mut().push(conn);
        self.shared.wake.notify_one();
    }

    /// Asks the reactor to stop after the current iteration.
    pub fn stop(&self) {
        self.shared.stop.set(true);
        self.shared.wake.notify_one();
    }

    /// True once [`stop`](Self::stop) has been called.
    #[must_use]
    pub fn in_shutdown(&self) -> bool {
        self.shared.stop.get()
    }

    /// True while listeners are held back from accepting.
    #[must_use]
    pub fn in_startup(&self) -> bool {
        self.shared.startup.get()
    }

    /// Controls the startup latch. While set, listening connections are
    /// not serviced; clear it once initialization is complete.
    pub fn set_startup(&self, startup: bool) {
        self.shared.startup.set(startup);
        self.shared.wake.notify_one();
    }

    /// Arms a timer firing `delay` from now, repeating at `repeat` if
    /// given. The owner is notified through the continuation protocol.
    pub fn arm_timer(&self, delay: Duration, repeat: Option<Duration>, owner: OwnerRef) -> TimerId {
        let id = TimerId(self.shared.next_timer.get());
        self.shared.next_timer.set(id.0 + 1);
        self.shared.timers.borrow_mut().push(Timer {
            id,
            deadline: self.shared.clock.now() + delay,
            repeat,
            owner,
        });
        self.shared.wake.notify_one();
        id
    }

    /// Cancels a timer. Cancelling an already-fired one-shot timer is a
    /// no-op.
    pub fn cancel_timer(&self, id: TimerId) {
        self.shared.timers.borrow_mut().retain(|t| t.id != id);
    }

    /// The clock the reactor runs on.
    #[must_use]
    pub fn clock(&self) -> SharedClock {
        Rc::clone(&self.shared.clock)
    }

    /// Wakes the reactor if it is waiting.
    pub fn wake(&self) {
        self.shared.wake.notify_one();
    }
}

/// The event loop.
pub struct Reactor {
    shared: Rc<Shared>,
    connections: Vec<Connection>,
    gauges: Gauges,
    maintenance: Box<dyn Maintenance>,
    config: ReactorConfig,
    next_conn_id: u64,
    last_maintenance: Instant,
}

impl Reactor {
    /// Creates a reactor on the system clock with stock maintenance.
    #[must_use]
    pub fn new(config: ReactorConfig) -> Self {
        Self::with_clock(config, Rc::new(SystemClock))
    }

    /// Creates a reactor on the given clock.
    #[must_use]
    pub fn with_clock(config: ReactorConfig, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            shared: Rc::new(Shared {
                stop: Cell::new(false),
                startup: Cell::new(false),
                additions: RefCell::new(Vec::new()),
                timers: RefCell::new(Vec::new()),
                next_timer: Cell::new(1),
                wake: Notify::new(),
                clock,
            }),
            connections: Vec::new(),
            gauges: Gauges::default(),
            maintenance: Box::new(DefaultMaintenance::default()),
            config,
            next_conn_id: 1,
            last_maintenance: now,
        }
    }

    /// Replaces the maintenance policy.
    pub fn set_maintenance(&mut self, maintenance: Box<dyn Maintenance>) {
        self.maintenance = maintenance;
    }

    /// Replaces the gauge registry.
    pub fn set_gauges(&mut self, gauges: Gauges) {
        self.gauges = gauges;
    }

    /// A handle for handlers and other same-thread code.
    #[must_use]
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Rc::clone(&self.shared),
        }
    }

    /// The gauge registry.
    #[must_use]
    pub const fn gauges(&self) -> &Gauges {
        &self.gauges
    }

    /// Number of connections currently owned by the reactor.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs until [`ReactorHandle::stop`] is called, then performs an
    /// orderly shutdown: every established connection gets a
    /// [`Event::Shutdown`] and one final flush.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting for readiness fails in a way that
    /// cannot be attributed to a single connection.
    pub async fn run(&mut self) -> Result<()> {
        while !self.shared.stop.get() {
            self.run_once().await?;
        }
        self.shutdown();
        Ok(())
    }

    /// Flushes every connection's pending output immediately, tolerating
    /// per-connection write errors. Useful right before forking work off
    /// or logging a fatal condition.
    pub fn flush_all(&mut self) {
        for conn in &mut self.connections {
            if conn.endpoint.can_write() {
                if let Err(e) = conn.endpoint.flush() {
                    tracing::debug!(error = %e, "flush failed");
                }
            }
        }
    }

    fn shutdown(&mut self) {
        let handle = self.handle();
        for conn in &mut self.connections {
            if conn.endpoint.state() == ConnState::Connected {
                if let Err(e) = conn.handler.react(Event::Shutdown, &mut conn.endpoint, &handle) {
                    tracing::debug!(error = %e, "shutdown handler failed; closing anyway");
                }
                // Goodbyes are best-effort.
                if let Err(e) = conn.endpoint.flush() {
                    tracing::debug!(error = %e, "final flush failed");
                }
            }
        }
        self.connections.clear();
        tracing::info!("event loop stopped");
    }

    /// Runs a single iteration: wait, fire timers, dispatch, maintain.
    ///
    /// # Errors
    ///
    /// Returns an error if the readiness wait itself fails. Errors on
    /// individual connections are contained: the connection is closed and
    /// the loop continues.
    pub async fn run_once(&mut self) -> Result<()> {
        self.adopt_additions();

        let now = self.shared.clock.now();
        let in_startup = self.shared.startup.get();
        let interests: Vec<Interest> = self
            .connections
            .iter()
            .map(|c| c.endpoint.interest(in_startup))
            .collect();

        let buffered: u64 = self
            .connections
            .iter()
            .map(|c| c.endpoint.buffered() as u64)
            .sum();
        let timeout = self.wait_bound(now, buffered);

        let mut ready: Vec<(usize, Readiness)> = Vec::new();
        let mut bad: Vec<(usize, io::Error)> = Vec::new();
        {
            let connections = &mut self.connections;
            let shared = Rc::clone(&self.shared);
            let wait = std::future::poll_fn(|cx| {
                for (i, conn) in connections.iter_mut().enumerate() {
                    if !interests[i].any() {
                        continue;
                    }
                    match conn.endpoint.conduit.poll_readiness(cx, interests[i]) {
                        Poll::Ready(Ok(r)) => ready.push((i, r)),
                        Poll::Ready(Err(e)) => bad.push((i, e)),
                        Poll::Pending => {}
                    }
                }
                if ready.is_empty() && bad.is_empty() {
                    Poll::Pending
                } else {
                    Poll::Ready(())
                }
            });
            // Readiness is checked first so a pending wake permit cannot
            // preempt a conduit that is already serviceable.
            tokio::select! {
                biased;
                () = wait => {}
                () = tokio::time::sleep(timeout) => {}
                () = shared.wake.notified() => {}
            }
        }

        self.isolate_bad(bad)?;
        self.fire_timers();
        self.dispatch_all(&ready);
        self.reap();
        self.maintain(buffered);
        Ok(())
    }

    fn adopt_additions(&mut self) {
        let mut additions = self.shared.additions.take();
        for mut conn in additions.drain(..) {
            conn.endpoint.id = self.next_conn_id;
            self.next_conn_id += 1;
            if conn.endpoint.role() != Role::Internal {
                tracing::debug!("adopted {}", conn.endpoint.description());
            }
            self.connections.push(conn);
        }
    }

    /// The bound on this iteration's readiness wait: the nearest deadline
    /// among connections and timers, capped at `max_wait`, shortened
    /// further under buffer pressure.
    fn wait_bound(&mut self, now: Instant, buffered: u64) -> Duration {
        let conn_deadline = self
            .connections
            .iter()
            .filter_map(|c| c.endpoint.deadline())
            .min();
        let timer_deadline = earliest(&self.shared.timers.borrow());
        let nearest = match (conn_deadline, timer_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let mut bound = self.config.max_wait;
        if let Some(deadline) = nearest {
            bound = bound.min(deadline.saturating_duration_since(now));
        }
        if let Some(shorter) = self.maintenance.shorten_wait(buffered) {
            bound = bound.min(shorter);
        }
        bound
    }

    /// Contains errors reported by the readiness wait. A stale or broken
    /// descriptor closes only its own connection; anything else is fatal.
    fn isolate_bad(&mut self, bad: Vec<(usize, io::Error)>) -> Result<()> {
        for (i, e) in bad {
            if is_descriptor_error(&e) {
                let conn = &mut self.connections[i];
                tracing::error!(
                    error = %e,
                    "broken descriptor on {}; closing it",
                    conn.endpoint.description()
                );
                conn.endpoint.force_close();
                conn.endpoint.detached = true;
            } else {
                return Err(Error::Wait(e));
            }
        }
        Ok(())
    }

    fn dispatch_all(&mut self, ready: &[(usize, Readiness)]) {
        let handle = self.handle();
        let now = self.shared.clock.now();
        for (i, conn) in self.connections.iter_mut().enumerate() {
            let readiness = ready
                .iter()
                .find(|(j, _)| *j == i)
                .map(|(_, r)| *r)
                .unwrap_or_default();
            dispatch(conn, readiness.readable, readiness.writable, now, &handle);
        }
    }

    fn fire_timers(&mut self) {
        let now = self.shared.clock.now();
        let due = take_due(&mut self.shared.timers.borrow_mut(), now);
        for timer in due {
            notify(&timer.owner);
        }
    }

    /// Drops connections that have finished closing and refreshes the
    /// connection-count gauges.
    fn reap(&mut self) {
        self.connections.retain(|c| {
            if c.endpoint.detached
                || (c.endpoint.state() == ConnState::Closing && !c.endpoint.can_write())
            {
                if c.endpoint.role() != Role::Internal {
                    tracing::debug!("closed {}", c.endpoint.description());
                }
                false
            } else {
                true
            }
        });

        // Counts are only interesting on a serving reactor.
        if self
            .connections
            .iter()
            .any(|c| c.endpoint.role() == Role::Listener)
        {
            for role in [
                Role::ImapServer,
                Role::Pop3Server,
                Role::SmtpServer,
                Role::HttpServer,
                Role::DatabaseClient,
                Role::Internal,
            ] {
                let n = self
                    .connections
                    .iter()
                    .filter(|c| c.endpoint.role() == role)
                    .count() as u64;
                self.gauges.set(role.gauge_name(), n);
            }
        }
    }

    fn maintain(&mut self, buffered: u64) {
        let since_last = self.shared.clock.elapsed(self.last_maintenance);
        if self.maintenance.due(buffered, since_last) {
            self.last_maintenance = self.shared.clock.now();
            for conn in &mut self.connections {
                conn.endpoint.shrink_buffers();
            }
        }
        let remaining: u64 = self
            .connections
            .iter()
            .map(|c| c.endpoint.buffered() as u64)
            .sum();
        self.gauges.set("memory-used", remaining);
    }
}

/// Stale or torn-down descriptors; the errno set the readiness wait can
/// report for a single connection without the loop itself being broken.
fn is_descriptor_error(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(9 | 88 | 107)) || e.kind() == io::ErrorKind::NotConnected
}

fn react(conn: &mut Connection, event: Event, handle: &ReactorHandle) {
    if let Err(e) = conn.handler.react(event, &mut conn.endpoint, handle) {
        tracing::error!(
            error = %e,
            "handler failed on {}; closing connection",
            conn.endpoint.description()
        );
        conn.endpoint.force_close();
    }
}

/// Dispatches one iteration's events for a single connection, porting the
/// classic readiness state machine: timeouts first, then connect
/// resolution, then read before write so a response to freshly-read input
/// goes out in the same iteration.
fn dispatch(conn: &mut Connection, r: bool, w: bool, now: Instant, handle: &ReactorHandle) {
    if let Some(deadline) = conn.endpoint.deadline() {
        if deadline <= now {
            conn.endpoint.clear_deadline();
            react(conn, Event::Timeout, handle);
        }
    }

    if conn.endpoint.state() == ConnState::Connecting {
        let connected = (w && !r) || conn.endpoint.conduit.is_pending(Signal::Connect);
        let failed = conn.endpoint.conduit.is_pending(Signal::Error);
        if connected && !failed {
            conn.endpoint.set_state(ConnState::Connected);
            react(conn, Event::Connect, handle);
        } else if failed {
            react(conn, Event::Error, handle);
            conn.endpoint.force_close();
            return;
        } else if w && r {
            // Readable and writable at once is ambiguous while a connect
            // is in flight; ask the conduit which it was.
            match conn.endpoint.conduit.connect_check() {
                Ok(()) => {
                    conn.endpoint.set_state(ConnState::Connected);
                    react(conn, Event::Connect, handle);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "connect failed on {}", conn.endpoint.description());
                    react(conn, Event::Error, handle);
                    conn.endpoint.force_close();
                    return;
                }
            }
        }
    }

    if r && conn.endpoint.state() != ConnState::Closing {
        match conn.endpoint.fill() {
            Ok(_) => {
                react(conn, Event::Read, handle);
                if !conn.endpoint.can_read() && conn.endpoint.state() != ConnState::Closing {
                    conn.endpoint.start_closing();
                    react(conn, Event::Close, handle);
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "read failed on {}", conn.endpoint.description());
                conn.endpoint.start_closing();
                react(conn, Event::Close, handle);
                conn.endpoint.force_close();
                return;
            }
        }
    }

    // Flush whatever the handlers enqueued, so a response to input read
    // this iteration goes out in the same iteration.
    if conn.endpoint.state() != ConnState::Connecting && conn.endpoint.can_write() {
        if let Err(e) = conn.endpoint.flush() {
            tracing::debug!(error = %e, "write failed on {}", conn.endpoint.description());
            conn.endpoint.start_closing();
            react(conn, Event::Close, handle);
            conn.endpoint.force_close();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_maintenance_shortens_wait_under_pressure() {
        let mut m = DefaultMaintenance::default();
        assert_eq!(m.shorten_wait(100), None);
        assert_eq!(m.shorten_wait(PRESSURE_BYTES + 1), Some(PRESSURE_WAIT));
    }

    #[test]
    fn default_maintenance_due_on_growth() {
        let mut m = DefaultMaintenance::default();
        // First pass over the size threshold counts as growth from zero.
        assert!(m.due(RECLAIM_BYTES + 1, Duration::from_secs(1)));
        // Unchanged level is not growth.
        assert!(!m.due(RECLAIM_BYTES + 1, Duration::from_secs(1)));
        // A fifth more is.
        assert!(m.due((RECLAIM_BYTES + 1) / 5 * 7, Duration::from_secs(1)));
    }

    #[test]
    fn default_maintenance_due_on_interval() {
        let mut m = DefaultMaintenance::default();
        assert!(!m.due(RECLAIM_IDLE_BYTES, Duration::from_secs(59)));
        assert!(m.due(RECLAIM_IDLE_BYTES, Duration::from_secs(60)));
        assert!(!m.due(RECLAIM_IDLE_BYTES - 1, Duration::from_secs(3600)));
    }

    #[test]
    fn descriptor_errors_are_recognized() {
        assert!(is_descriptor_error(&io::Error::from_raw_os_error(9)));
        assert!(is_descriptor_error(&io::Error::from(
            io::ErrorKind::NotConnected
        )));
        assert!(!is_descriptor_error(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }

    #[test]
    fn config_defaults() {
        let config = ReactorConfig::default();
        assert_eq!(config.max_wait, Duration::from_secs(60));
    }
}
