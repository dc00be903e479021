//! # mailvault-store
//!
//! The storage side of the mailvault concurrency core: asynchronous
//! [`query::Query`] units and pipelined [`transaction::Transaction`] groups
//! over a SQLite backend, the adaptive batched [`fetcher::Fetcher`] that
//! populates [`message::Message`] objects with several kinds of associated
//! data, and the [`helper::RowCreator`] insert-if-absent pattern built on
//! savepoint semantics.
//!
//! Everything runs on the same logical thread as the reactor in
//! `mailvault-server`: query and transaction drivers are `spawn_local`
//! tasks, completion is reported through the continuation protocol
//! (`EventHandler`/`notify`), and nothing here takes a lock that another
//! thread could hold.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod database;
mod error;
pub mod fetcher;
pub mod helper;
pub mod idset;
pub mod mailbox;
pub mod message;
pub mod query;
pub mod schema;
pub mod selector;
pub mod transaction;
pub mod value;

pub use database::Database;
pub use error::{Error, Result};
pub use fetcher::{FetchConfig, Fetcher, Kind};
pub use helper::{NameCache, RowCreator};
pub use idset::IdSet;
pub use mailbox::{Mailbox, Session};
pub use message::Message;
pub use query::Query;
pub use selector::Selector;
pub use transaction::Transaction;
pub use value::{Row, Value};
