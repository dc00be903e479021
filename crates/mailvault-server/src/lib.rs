//! # mailvault-server
//!
//! The concurrency core of the mailvault mail store: a single-threaded,
//! readiness-driven reactor that multiplexes many client connections and
//! timers without blocking threads.
//!
//! This crate provides:
//! - The [`reactor::Reactor`] event loop and its [`reactor::ReactorHandle`]
//! - The [`connection`] state machine over a pluggable [`stream::Conduit`]
//! - [`timer`] bookkeeping
//! - The [`event::EventHandler`] continuation protocol
//! - Named numeric [`metrics`] gauges
//!
//! Everything here runs on one logical thread: the reactor, every connection
//! handler and every continuation. A handler's `react`/`resume` always runs
//! to completion before the next readiness check, so there is no internal
//! data race, but a handler must never block or perform long synchronous
//! work. Run the reactor on a current-thread tokio runtime, typically inside
//! a `LocalSet`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod connection;
mod error;
pub mod event;
pub mod metrics;
pub mod reactor;
pub mod stream;
pub mod time;
pub mod timer;

pub use connection::{ConnState, Connection, ConnectionHandler, Endpoint, Event, Role};
pub use error::{Error, Result};
pub use event::{EventHandler, HandlerRef, OwnerRef, notify};
pub use metrics::{Gauges, MetricsSink, TracingSink};
pub use reactor::{DefaultMaintenance, Maintenance, Reactor, ReactorConfig, ReactorHandle};
pub use stream::{
    Conduit, Interest, ListenerConduit, Readiness, Script, ScriptedConduit, Signal, TcpConduit,
};
pub use time::{Clock, MockClock, SharedClock, SystemClock};
pub use timer::TimerId;
