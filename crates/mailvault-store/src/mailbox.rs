//! Mailboxes and live session views.
//!
//! A [`Mailbox`] is shared by every session that has it selected. It keeps
//! weak registries only: sessions and canonical fetchers hold their own
//! lifetimes, and the mailbox forgets them when they drop.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::fetcher::{Fetcher, Kind};
use crate::idset::IdSet;

/// One client's live view of a mailbox: the UIDs it knows about and the
/// modseq horizon it has reported.
#[derive(Debug, Default)]
pub struct Session {
    messages: RefCell<IdSet>,
    next_mod_seq: Cell<i64>,
}

impl Session {
    /// An empty view.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The UIDs this view knows about.
    #[must_use]
    pub fn messages(&self) -> IdSet {
        self.messages.borrow().clone()
    }

    /// Adds UIDs to the view.
    pub fn add_messages(&self, uids: &IdSet) {
        let mut m = self.messages.borrow_mut();
        for id in uids.iter() {
            m.add(id);
        }
    }

    /// The modseq this view has seen up to.
    #[must_use]
    pub fn next_mod_seq(&self) -> i64 {
        self.next_mod_seq.get()
    }

    /// Advances the modseq horizon. Never moves backward.
    pub fn set_next_mod_seq(&self, mod_seq: i64) {
        if mod_seq > self.next_mod_seq.get() {
            self.next_mod_seq.set(mod_seq);
        }
    }
}

struct MailboxInner {
    id: i64,
    name: String,
    sessions: RefCell<Vec<Weak<Session>>>,
    fetchers: RefCell<HashMap<Kind, Weak<RefCell<Fetcher>>>>,
}

/// A mailbox shared across sessions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Mailbox {
    inner: Rc<MailboxInner>,
}

impl Mailbox {
    /// A mailbox with a known database id and name.
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(MailboxInner {
                id,
                name: name.into(),
                sessions: RefCell::new(Vec::new()),
                fetchers: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// The `mailboxes` table id.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// The mailbox name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registers a session viewing this mailbox. Held weakly; dropping
    /// the session detaches it.
    pub fn attach_session(&self, session: &Rc<Session>) {
        self.inner.sessions.borrow_mut().push(Rc::downgrade(session));
    }

    /// The live sessions viewing this mailbox, pruning dead entries.
    #[must_use]
    pub fn sessions(&self) -> Vec<Rc<Session>> {
        let mut registered = self.inner.sessions.borrow_mut();
        registered.retain(|w| w.strong_count() > 0);
        registered.iter().filter_map(Weak::upgrade).collect()
    }

    /// The canonical fetcher currently serving `kind`, if one is alive
    /// and still fetching.
    #[must_use]
    pub fn canonical_fetcher(&self, kind: Kind) -> Option<Rc<RefCell<Fetcher>>> {
        let fetchers = self.inner.fetchers.borrow();
        let fetcher = fetchers.get(&kind).and_then(Weak::upgrade)?;
        if fetcher.borrow().fetching(kind) {
            Some(Rc::clone(&fetcher))
        } else {
            None
        }
    }

    /// Registers `fetcher` as canonical for every kind it serves.
    /// At most one canonical fetcher per (mailbox, kind) may be live; a
    /// still-fetching predecessor keeps its registration.
    pub fn register_fetcher(&self, fetcher: &Rc<RefCell<Fetcher>>) {
        let kinds = fetcher.borrow().kinds().to_vec();
        let mut fetchers = self.inner.fetchers.borrow_mut();
        for kind in kinds {
            let occupied = fetchers
                .get(&kind)
                .and_then(Weak::upgrade)
                .is_some_and(|f| !Rc::ptr_eq(&f, fetcher) && f.borrow().fetching(kind));
            if occupied {
                tracing::warn!(?kind, mailbox = self.inner.id, "canonical fetcher already live");
                continue;
            }
            fetchers.insert(kind, Rc::downgrade(fetcher));
        }
    }

    /// Explicitly forgets the canonical fetcher for `kind`.
    pub fn forget_fetcher(&self, kind: Kind) {
        self.inner.fetchers.borrow_mut().remove(&kind);
    }
}
