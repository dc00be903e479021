//! Asynchronous parameterized queries.
//!
//! A [`Query`] is one statement plus bound parameters, handed to the
//! [`Database`](crate::Database) or a [`Transaction`](crate::Transaction)
//! for execution. Completion is observable through `done`/`failed`, result
//! rows are consumed FIFO, and the owning continuation is notified exactly
//! once when the query completes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use mailvault_server::{OwnerRef, notify};

use crate::value::{Row, Value};

struct QueryState {
    statement: String,
    params: Vec<Value>,
    rows: VecDeque<Row>,
    done: bool,
    error: Option<String>,
    allow_failure: bool,
    recovers: bool,
    owner: Option<OwnerRef>,
    notified: bool,
}

/// One asynchronous statement. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Query {
    state: Rc<RefCell<QueryState>>,
}

impl Query {
    /// Creates a query for `statement` with no parameters bound yet.
    #[must_use]
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            state: Rc::new(RefCell::new(QueryState {
                statement: statement.into(),
                params: Vec::new(),
                rows: VecDeque::new(),
                done: false,
                error: None,
                allow_failure: false,
                recovers: false,
                owner: None,
                notified: false,
            })),
        }
    }

    /// Binds the next positional parameter.
    #[must_use]
    pub fn bind(self, value: impl Into<Value>) -> Self {
        self.state.borrow_mut().params.push(value.into());
        self
    }

    /// Marks the query as allowed to fail without failing its transaction.
    #[must_use]
    pub fn allow_failure(self) -> Self {
        self.state.borrow_mut().allow_failure = true;
        self
    }

    /// Sets the continuation notified when this query completes.
    pub fn set_owner(&self, owner: OwnerRef) {
        self.state.borrow_mut().owner = Some(owner);
    }

    /// The statement text.
    #[must_use]
    pub fn statement(&self) -> String {
        self.state.borrow().statement.clone()
    }

    /// True once execution finished, successfully or not.
    #[must_use]
    pub fn done(&self) -> bool {
        self.state.borrow().done
    }

    /// True if execution finished with an error.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.state.borrow().error.is_some()
    }

    /// The error text, if the query failed.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    /// The completed query's outcome as a `Result`, for callers that want
    /// to propagate instead of polling `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Query`](crate::Error::Query) with the recorded
    /// failure text if the query failed.
    pub fn check(&self) -> crate::error::Result<()> {
        match self.error() {
            Some(e) => Err(crate::error::Error::Query(e)),
            None => Ok(()),
        }
    }

    /// True while unconsumed result rows remain.
    #[must_use]
    pub fn has_results(&self) -> bool {
        !self.state.borrow().rows.is_empty()
    }

    /// Takes the next result row.
    #[must_use]
    pub fn next_row(&self) -> Option<Row> {
        self.state.borrow_mut().rows.pop_front()
    }

    pub(crate) fn is_failure_allowed(&self) -> bool {
        self.state.borrow().allow_failure
    }

    /// Marks this query as one that recovers an already-failed
    /// transaction (a rollback to a savepoint): it executes even while the
    /// transaction is failed, and clears the failure on success.
    pub(crate) fn mark_recovering(&self) {
        let mut s = self.state.borrow_mut();
        s.recovers = true;
        s.allow_failure = true;
    }

    pub(crate) fn recovers(&self) -> bool {
        self.state.borrow().recovers
    }

    pub(crate) fn statement_and_params(&self) -> (String, Vec<Value>) {
        let s = self.state.borrow();
        (s.statement.clone(), s.params.clone())
    }

    pub(crate) fn set_results(&self, rows: Vec<Row>) {
        let mut s = self.state.borrow_mut();
        s.rows = rows.into();
        s.done = true;
    }

    pub(crate) fn set_error(&self, error: impl Into<String>) {
        let mut s = self.state.borrow_mut();
        s.error = Some(error.into());
        s.done = true;
    }

    /// Notifies the owner. Safe to call more than once; only the first
    /// call after completion is delivered.
    pub(crate) fn notify_owner(&self) {
        let owner = {
            let mut s = self.state.borrow_mut();
            if s.notified || !s.done {
                return;
            }
            s.notified = true;
            s.owner.clone()
        };
        if let Some(owner) = owner {
            notify(&owner);
        }
    }
}
