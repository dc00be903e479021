//! Pipelined transactions with savepoints.
//!
//! A [`Transaction`] accumulates queries in enqueue order. `execute` hands
//! them to a driver task that holds the backend connection from BEGIN to
//! COMMIT/ROLLBACK and runs them strictly in submission order, notifying
//! each query's owner as that query completes, so partial results can be
//! consumed before the transaction ends.
//!
//! A failing query (unless marked allow-failure) fails the whole
//! transaction: later queries are failed without execution instead of
//! running against half-applied state. The exception is a rollback to a
//! named savepoint, which executes even while the transaction is failed
//! and clears the failure on success, the mechanism behind the
//! [`RowCreator`](crate::RowCreator) retry.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use mailvault_server::{OwnerRef, notify};
use tokio::sync::Notify;

use crate::database::{Database, run_query};
use crate::query::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    CommitRequested,
    RollbackRequested,
    Ended,
}

struct TxState {
    queue: VecDeque<Query>,
    phase: Phase,
    failed: bool,
    error: Option<String>,
    done: bool,
    started: bool,
    owner: Option<OwnerRef>,
}

struct TxInner {
    state: RefCell<TxState>,
    wake: Notify,
    savepoint_seq: Cell<u32>,
}

/// An ordered, atomically-committed group of queries. Cheap to clone;
/// clones share state.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<TxInner>,
    db: Database,
}

impl Transaction {
    /// Creates a transaction on `db`. Nothing runs until
    /// [`execute`](Self::execute), [`commit`](Self::commit) or
    /// [`rollback`](Self::rollback) is called.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            inner: Rc::new(TxInner {
                state: RefCell::new(TxState {
                    queue: VecDeque::new(),
                    phase: Phase::Active,
                    failed: false,
                    error: None,
                    done: false,
                    started: false,
                    owner: None,
                }),
                wake: Notify::new(),
                savepoint_seq: Cell::new(0),
            }),
            db: db.clone(),
        }
    }

    /// Sets the continuation notified when the transaction ends.
    pub fn set_owner(&self, owner: OwnerRef) {
        self.inner.state.borrow_mut().owner = Some(owner);
    }

    /// Appends a query to the pipeline. It runs after everything enqueued
    /// before it.
    pub fn enqueue(&self, query: Query) {
        self.inner.state.borrow_mut().queue.push_back(query);
    }

    /// Starts executing enqueued queries without finalizing. Must be
    /// called from within a `LocalSet`.
    pub fn execute(&self) {
        self.start_driver();
        self.inner.wake.notify_one();
    }

    /// Finalizes the transaction after all enqueued queries: COMMIT, or
    /// ROLLBACK if it has failed by then.
    pub fn commit(&self) {
        {
            let mut s = self.inner.state.borrow_mut();
            if s.phase == Phase::Active {
                s.phase = Phase::CommitRequested;
            }
        }
        self.start_driver();
        self.inner.wake.notify_one();
    }

    /// Discards the transaction after all enqueued queries.
    pub fn rollback(&self) {
        {
            let mut s = self.inner.state.borrow_mut();
            if s.phase == Phase::Active {
                s.phase = Phase::RollbackRequested;
            }
        }
        self.start_driver();
        self.inner.wake.notify_one();
    }

    /// Establishes a named savepoint at this point in the pipeline.
    pub fn savepoint(&self, name: &str) {
        self.enqueue(Query::new(format!("savepoint {name}")));
    }

    /// Rolls back to a named savepoint, discarding only the segment after
    /// it. Executes even if the transaction has failed, and clears the
    /// failed state on success.
    pub fn rollback_to_savepoint(&self, name: &str) {
        let q = Query::new(format!("rollback to savepoint {name}"));
        q.mark_recovering();
        self.enqueue(q);
    }

    /// Releases a named savepoint. Allowed to fail: releasing an enclosing
    /// savepoint collapses the ones nested inside it, so a later release
    /// may find its name already gone.
    pub fn release_savepoint(&self, name: &str) {
        self.enqueue(Query::new(format!("release savepoint {name}")).allow_failure());
    }

    /// A fresh per-transaction suffix for savepoint names.
    #[must_use]
    pub fn next_savepoint_id(&self) -> u32 {
        let id = self.inner.savepoint_seq.get();
        self.inner.savepoint_seq.set(id + 1);
        id
    }

    /// True if a non-exempt query has failed.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.inner.state.borrow().failed
    }

    /// True once the transaction has been committed or rolled back.
    #[must_use]
    pub fn done(&self) -> bool {
        self.inner.state.borrow().done
    }

    /// The first recorded failure, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.inner.state.borrow().error.clone()
    }

    fn start_driver(&self) {
        {
            let mut s = self.inner.state.borrow_mut();
            if s.started {
                return;
            }
            s.started = true;
        }
        let inner = Rc::clone(&self.inner);
        let db = self.db.clone();
        tokio::task::spawn_local(drive(db, inner));
    }
}

enum Step {
    Run(Query),
    Finalize(Phase),
    Wait,
}

async fn drive(db: Database, inner: Rc<TxInner>) {
    let conn = db.connection();
    let mut conn = conn.lock_owned().await;

    let begin = Query::new("begin");
    run_query(&mut conn, &begin).await;
    if begin.failed() {
        let mut s = inner.state.borrow_mut();
        s.failed = true;
        s.error = begin.error();
        s.done = true;
        let owner = s.owner.clone();
        drop(s);
        notify_tx_owner(owner.as_ref());
        return;
    }

    loop {
        let step = {
            let mut s = inner.state.borrow_mut();
            if let Some(q) = s.queue.pop_front() {
                Step::Run(q)
            } else {
                match s.phase {
                    Phase::CommitRequested | Phase::RollbackRequested => Step::Finalize(s.phase),
                    Phase::Active | Phase::Ended => Step::Wait,
                }
            }
        };

        match step {
            Step::Run(q) => {
                let skip = inner.state.borrow().failed && !q.recovers();
                if skip {
                    q.set_error("transaction already failed");
                } else {
                    run_query(&mut conn, &q).await;
                    let mut s = inner.state.borrow_mut();
                    if q.failed() {
                        if !q.is_failure_allowed() {
                            s.failed = true;
                            if s.error.is_none() {
                                s.error = q.error();
                            }
                        }
                    } else if q.recovers() && s.failed {
                        tracing::debug!("transaction recovered by savepoint rollback");
                        s.failed = false;
                    }
                }
                q.notify_owner();
            }
            Step::Finalize(phase) => {
                let failed = inner.state.borrow().failed;
                let statement = if phase == Phase::CommitRequested && !failed {
                    "commit"
                } else {
                    "rollback"
                };
                let fin = Query::new(statement);
                run_query(&mut conn, &fin).await;
                let mut s = inner.state.borrow_mut();
                if fin.failed() {
                    s.failed = true;
                    if s.error.is_none() {
                        s.error = fin.error();
                    }
                }
                s.phase = Phase::Ended;
                s.done = true;
                let owner = s.owner.clone();
                drop(s);
                notify_tx_owner(owner.as_ref());
                return;
            }
            Step::Wait => inner.wake.notified().await,
        }
    }
}

fn notify_tx_owner(owner: Option<&OwnerRef>) {
    if let Some(owner) = owner {
        notify(owner);
    }
}
