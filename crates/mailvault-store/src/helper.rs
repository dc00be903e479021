//! Race-tolerant insert-if-absent lookups.
//!
//! Flag names, header field names and annotation entry names live in small
//! id/name tables that any session may extend at any time. A [`RowCreator`]
//! resolves a set of names to ids inside a transaction: select what exists,
//! insert what is missing behind a savepoint, and if the insert loses a
//! race (recognized by the unique-constraint error text) roll back to the
//! savepoint and select again, exactly once. Either the row exists
//! afterwards or the creation attempt is terminally failed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use mailvault_server::{EventHandler, OwnerRef, notify};

use crate::query::Query;
use crate::transaction::Transaction;

/// A shared name↔id cache for one lookup table. Cheap to clone; clones
/// share entries. Passed explicitly to every creator that should share it.
#[derive(Clone)]
pub struct NameCache {
    inner: Rc<RefCell<CacheInner>>,
    fold_case: bool,
}

#[derive(Default)]
struct CacheInner {
    by_name: HashMap<String, i64>,
    by_id: HashMap<i64, String>,
}

impl NameCache {
    /// An empty cache. `fold_case` matches the table's collation: flag
    /// names compare case-insensitively, field and annotation names do
    /// not.
    #[must_use]
    pub fn new(fold_case: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(CacheInner::default())),
            fold_case,
        }
    }

    fn key(&self, name: &str) -> String {
        if self.fold_case {
            name.to_lowercase()
        } else {
            name.to_owned()
        }
    }

    /// Records a name/id pair.
    pub fn insert(&self, name: &str, id: i64) {
        let mut inner = self.inner.borrow_mut();
        inner.by_name.insert(self.key(name), id);
        inner.by_id.insert(id, name.to_owned());
    }

    /// The id for `name`, if known.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<i64> {
        self.inner.borrow().by_name.get(&self.key(name)).copied()
    }

    /// The stored spelling for `id`, if known.
    #[must_use]
    pub fn name_of(&self, id: i64) -> Option<String> {
        self.inner.borrow().by_id.get(&id).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Idle,
    Selecting,
    Inserting,
    Done,
}

/// Resolves names to ids in one lookup table, creating missing rows.
///
/// Construct with [`flags`](Self::flags), [`field_names`](Self::field_names)
/// or [`annotation_names`](Self::annotation_names), then call
/// [`execute`](Self::execute). The owner is notified once, when every name
/// has an id or the attempt has terminally failed.
pub struct RowCreator {
    table: &'static str,
    constraint: String,
    names: Vec<String>,
    cache: NameCache,
    tx: Transaction,
    step: Step,
    select: Option<Query>,
    insert: Option<Query>,
    savepoint: String,
    insert_attempts: u32,
    error: Option<String>,
    owner: OwnerRef,
    self_ref: Weak<RefCell<RowCreator>>,
}

impl RowCreator {
    /// A creator for IMAP flag names.
    #[must_use]
    pub fn flags(
        tx: &Transaction,
        names: Vec<String>,
        cache: NameCache,
        owner: OwnerRef,
    ) -> Rc<RefCell<Self>> {
        Self::build("flag_names", tx, names, cache, owner)
    }

    /// A creator for header field names.
    #[must_use]
    pub fn field_names(
        tx: &Transaction,
        names: Vec<String>,
        cache: NameCache,
        owner: OwnerRef,
    ) -> Rc<RefCell<Self>> {
        Self::build("field_names", tx, names, cache, owner)
    }

    /// A creator for annotation entry names.
    #[must_use]
    pub fn annotation_names(
        tx: &Transaction,
        names: Vec<String>,
        cache: NameCache,
        owner: OwnerRef,
    ) -> Rc<RefCell<Self>> {
        Self::build("annotation_names", tx, names, cache, owner)
    }

    fn build(
        table: &'static str,
        tx: &Transaction,
        names: Vec<String>,
        cache: NameCache,
        owner: OwnerRef,
    ) -> Rc<RefCell<Self>> {
        let savepoint = format!("{table}_creator_{}", tx.next_savepoint_id());
        Rc::new_cyclic(|self_ref| {
            RefCell::new(Self {
                table,
                constraint: format!("UNIQUE constraint failed: {table}.name"),
                names,
                cache,
                tx: tx.clone(),
                step: Step::Idle,
                select: None,
                insert: None,
                savepoint,
                insert_attempts: 0,
                error: None,
                owner,
                self_ref: self_ref.clone(),
            })
        })
    }

    /// Starts resolving. Progress continues through query-completion
    /// notifications on the transaction. Must be called from within a
    /// `LocalSet`.
    pub fn execute(&mut self) {
        if self.step != Step::Idle {
            return;
        }
        if self.missing().is_empty() {
            self.finish(None);
            return;
        }
        self.issue_select();
    }

    /// True once resolution has finished, successfully or not.
    #[must_use]
    pub fn done(&self) -> bool {
        self.step == Step::Done
    }

    /// True if the attempt terminally failed.
    #[must_use]
    pub const fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// The failure text, if any.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.error.clone()
    }

    /// The id resolved for `name`, through the shared cache.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<i64> {
        self.cache.id_of(name)
    }

    /// Requested names with no cached id yet, first occurrence order.
    fn missing(&self) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        for name in &self.names {
            let dup = seen.iter().any(|s| {
                if self.cache.fold_case {
                    s.eq_ignore_ascii_case(name)
                } else {
                    s == name
                }
            });
            if self.cache.id_of(name).is_none() && !dup {
                seen.push(name.clone());
            }
        }
        seen
    }

    fn issue_select(&mut self) {
        let missing = self.missing();
        let placeholders = (1..=missing.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut q = Query::new(format!(
            "select id, name from {} where name in ({placeholders})",
            self.table
        ));
        for name in missing {
            q = q.bind(name);
        }
        q.set_owner(self.owner_ref());
        self.select = Some(q.clone());
        self.step = Step::Selecting;
        self.tx.enqueue(q);
        self.tx.execute();
    }

    fn issue_insert(&mut self, missing: Vec<String>) {
        self.insert_attempts += 1;
        self.tx.savepoint(&self.savepoint);
        let placeholders = (1..=missing.len())
            .map(|i| format!("(${i})"))
            .collect::<Vec<_>>()
            .join(",");
        let mut q = Query::new(format!(
            "insert into {} (name) values {placeholders} returning id, name",
            self.table
        ));
        for name in missing {
            q = q.bind(name);
        }
        q.set_owner(self.owner_ref());
        self.insert = Some(q.clone());
        self.step = Step::Inserting;
        self.tx.enqueue(q);
        self.tx.execute();
    }

    fn step_select(&mut self) {
        let Some(q) = self.select.clone() else {
            return;
        };
        if !q.done() {
            return;
        }
        self.select = None;
        if q.failed() {
            self.finish(q.error());
            return;
        }
        while let Some(row) = q.next_row() {
            if let (Some(id), Some(name)) = (row.int("id"), row.text("name")) {
                self.cache.insert(name, id);
            }
        }

        let missing = self.missing();
        if missing.is_empty() {
            self.finish(None);
        } else if self.insert_attempts >= 2 {
            self.finish(Some(format!(
                "{} rows still missing after insert retry",
                self.table
            )));
        } else {
            self.issue_insert(missing);
        }
    }

    fn step_insert(&mut self) {
        let Some(q) = self.insert.clone() else {
            return;
        };
        if !q.done() {
            return;
        }
        self.insert = None;
        if q.failed() {
            let error = q.error().unwrap_or_default();
            // The savepoint rollback restores the transaction either way.
            self.tx.rollback_to_savepoint(&self.savepoint);
            if error.contains(&self.constraint) && self.insert_attempts < 2 {
                tracing::debug!(
                    table = self.table,
                    "lost a creation race; rolling back to savepoint and retrying"
                );
                self.issue_select();
            } else {
                self.tx.execute();
                self.finish(Some(error));
            }
            return;
        }
        while let Some(row) = q.next_row() {
            if let (Some(id), Some(name)) = (row.int("id"), row.text("name")) {
                self.cache.insert(name, id);
            }
        }
        self.tx.release_savepoint(&self.savepoint);
        if self.missing().is_empty() {
            self.finish(None);
        } else {
            // The insert returned fewer rows than asked; look again.
            self.issue_select();
        }
    }

    fn finish(&mut self, error: Option<String>) {
        if self.step == Step::Done {
            return;
        }
        self.step = Step::Done;
        self.error = error;
        notify(&self.owner);
    }

    fn owner_ref(&self) -> OwnerRef {
        self.self_ref.clone() as OwnerRef
    }
}

impl EventHandler for RowCreator {
    fn resume(&mut self) {
        match self.step {
            Step::Idle | Step::Done => {}
            Step::Selecting => self.step_select(),
            Step::Inserting => self.step_insert(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn cache_folds_case_when_asked() {
        let folded = NameCache::new(true);
        folded.insert("\\Seen", 3);
        assert_eq!(folded.id_of("\\seen"), Some(3));
        assert_eq!(folded.name_of(3).as_deref(), Some("\\Seen"));

        let exact = NameCache::new(false);
        exact.insert("Subject", 1);
        assert_eq!(exact.id_of("subject"), None);
        assert_eq!(exact.id_of("Subject"), Some(1));
    }
}
