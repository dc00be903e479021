//! Adaptive batched retrieval.
//!
//! A [`Fetcher`] populates a set of [`Message`]s with one or more [`Kind`]s
//! of associated data without materializing the whole result set at once.
//! Small selections take a simple path: one query per kind, spliced
//! directly against the selector's base query. Large selections are
//! batched: a locating query pins down the working set (and its database
//! ids and trivia), then rounds of per-kind queries walk it in batches
//! whose size adapts to a wall-clock budget per round.
//!
//! The fetcher is a continuation: each query completion resumes it, it
//! drains whatever rows have arrived, and when a round's queries are all
//! done it marks the batch complete and starts the next. The owner is
//! notified exactly once, when everything requested is populated or a
//! query has failed.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use mailvault_server::{Clock, EventHandler, OwnerRef, SharedClock, notify};
use serde::{Deserialize, Serialize};

use crate::database::Database;
use crate::idset::IdSet;
use crate::mailbox::Mailbox;
use crate::message::{Address, Annotation, BodyPart, HeaderField, Message, Trivia};
use crate::query::Query;
use crate::selector::{SELECT_MARKER, Selector, WHERE_MARKER};
use crate::value::Row;

/// Bucket count for locating a row's message(s) by database id in
/// expected O(1).
const BATCH_HASH: usize = 1800;

/// A kind of associated message data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    /// Flag ids from `flags`.
    Flags = 0,
    /// Annotations with their entry names.
    Annotations = 1,
    /// Addresses from address-valued header fields.
    Addresses = 2,
    /// Non-address header fields.
    OtherHeader = 3,
    /// Body part content.
    Body = 4,
    /// Size, internal date and modseq.
    Trivia = 5,
    /// Part numbers without content.
    PartNumbers = 6,
}

/// How rows of a kind are routed back to messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    /// By mailbox UID; the row's first column is `uid`.
    Uid,
    /// By `messages` table id; the row's first column is `message`. One id
    /// may be shared by several UIDs (copied messages).
    MessageId,
}

impl Kind {
    pub(crate) const fn bit(self) -> u8 {
        1 << (self as u8)
    }

    /// The initial batch size for this kind, derived from the configured
    /// seed. Heavy kinds start smaller.
    const fn seed(self, base: u32) -> u32 {
        match self {
            Self::Body => base / 2,
            Self::OtherHeader => base / 3 * 2,
            Self::Addresses => base / 4 * 3,
            _ => base,
        }
    }

    const fn route(self) -> Route {
        match self {
            Self::Flags | Self::Annotations | Self::Trivia => Route::Uid,
            Self::Addresses | Self::OtherHeader | Self::Body | Self::PartNumbers => {
                Route::MessageId
            }
        }
    }

    /// Extra result columns spliced into the selector's column list in
    /// simple mode.
    const fn splice_columns(self) -> &'static str {
        match self {
            Self::Flags => "f.flag",
            Self::Annotations => "an.value, an.owner, ann.name",
            Self::Addresses => "af.part, af.position, af.field, a.name, a.localpart, a.domain",
            Self::OtherHeader => "hf.part, hf.position, fn.name, hf.value",
            Self::Body => "pn.part, bp.bytes, bp.nlines, bp.text, bp.data",
            Self::Trivia => "mm.message, mm.idate, mm.modseq, m.rfc822size",
            Self::PartNumbers => "pn.part, pn.bytes, pn.nlines",
        }
    }

    /// Joins spliced in front of the selector's where boundary in simple
    /// mode.
    const fn splice_joins(self) -> &'static str {
        match self {
            Self::Flags => "join flags f on (mm.mailbox=f.mailbox and mm.uid=f.uid)",
            Self::Annotations => {
                "join annotations an on (mm.mailbox=an.mailbox and mm.uid=an.uid) \
                 join annotation_names ann on (an.name=ann.id)"
            }
            Self::Addresses => {
                "join address_fields af on (mm.message=af.message) \
                 join addresses a on (af.address=a.id)"
            }
            Self::OtherHeader => {
                "join header_fields hf on (mm.message=hf.message) \
                 join field_names fn on (hf.field=fn.id)"
            }
            Self::Body => {
                "join part_numbers pn on (mm.message=pn.message) \
                 join bodyparts bp on (pn.bodypart=bp.id)"
            }
            Self::Trivia => "join messages m on (mm.message=m.id)",
            Self::PartNumbers => "join part_numbers pn on (mm.message=pn.message)",
        }
    }

    /// One spliced simple-mode query against the selector's base text.
    fn simple_query(self, selector: &Selector) -> Query {
        let base = selector.base_query();
        let columns = format!("{SELECT_MARKER}, {}", self.splice_columns());
        let spliced = base
            .replacen(SELECT_MARKER, &columns, 1)
            .replacen(WHERE_MARKER, &format!(" {} where ", self.splice_joins()), 1);
        let q = Query::new(spliced).bind(selector.mailbox());
        match selector.min_modseq() {
            Some(floor) => q.bind(floor),
            None => q,
        }
    }

    /// One batched-mode query for a batch's UIDs or database ids.
    fn batched_query(self, mailbox: i64, uids: &IdSet, ids: &[i64]) -> Option<Query> {
        let text = match self {
            Self::Flags => format!(
                "select f.uid, f.flag from flags f where f.mailbox=$1 and {} order by f.uid",
                uids.where_clause("f.uid")
            ),
            Self::Annotations => format!(
                "select an.uid, an.value, an.owner, ann.name from annotations an \
                 join annotation_names ann on (an.name=ann.id) \
                 where an.mailbox=$1 and {} order by an.uid",
                uids.where_clause("an.uid")
            ),
            Self::Addresses => format!(
                "select af.message, af.part, af.position, af.field, \
                 a.name, a.localpart, a.domain from address_fields af \
                 join addresses a on (af.address=a.id) \
                 where {} order by af.message, af.part, af.field, af.position",
                id_clause("af.message", ids)
            ),
            Self::OtherHeader => format!(
                "select hf.message, hf.part, hf.position, fn.name, hf.value \
                 from header_fields hf join field_names fn on (hf.field=fn.id) \
                 where {} order by hf.message",
                id_clause("hf.message", ids)
            ),
            Self::Body => format!(
                "select pn.message, pn.part, bp.bytes, bp.nlines, bp.text, bp.data \
                 from part_numbers pn join bodyparts bp on (pn.bodypart=bp.id) \
                 where {} order by pn.message",
                id_clause("pn.message", ids)
            ),
            Self::PartNumbers => format!(
                "select pn.message, pn.part, pn.bytes, pn.nlines from part_numbers pn \
                 where {} order by pn.message, pn.part",
                id_clause("pn.message", ids)
            ),
            // Trivia comes from the locating query.
            Self::Trivia => return None,
        };
        let q = Query::new(text);
        Some(match self {
            Self::Flags | Self::Annotations => q.bind(mailbox),
            _ => q,
        })
    }

    /// Applies one row to one message.
    fn decode(self, row: &Row, message: &mut Message) {
        match self {
            Self::Flags => {
                if let Some(flag) = row.int("flag") {
                    message.add_flag(flag);
                }
            }
            Self::Annotations => {
                message.add_annotation(Annotation {
                    entry: row.text("name").unwrap_or_default().to_owned(),
                    value: row.text("value").unwrap_or_default().to_owned(),
                    owner: row.int("owner"),
                });
            }
            Self::Addresses => {
                message.add_address(Address {
                    part: row.text("part").unwrap_or_default().to_owned(),
                    position: row.int("position").unwrap_or_default(),
                    field: row.int("field").unwrap_or_default(),
                    name: row.text("name").unwrap_or_default().to_owned(),
                    localpart: row.text("localpart").unwrap_or_default().to_owned(),
                    domain: row.text("domain").unwrap_or_default().to_owned(),
                });
            }
            Self::OtherHeader => {
                message.add_header_field(HeaderField {
                    part: row.text("part").unwrap_or_default().to_owned(),
                    position: row.int("position").unwrap_or_default(),
                    name: row.text("name").unwrap_or_default().to_owned(),
                    value: row.text("value").unwrap_or_default().to_owned(),
                });
            }
            Self::Body => {
                message.add_part(BodyPart {
                    part: row.text("part").unwrap_or_default().to_owned(),
                    bytes: row.int("bytes").unwrap_or_default(),
                    lines: row.int("nlines"),
                    text: row.text("text").map(ToOwned::to_owned),
                    data: row.blob("data").map(ToOwned::to_owned),
                });
            }
            Self::Trivia => {
                if let Some(id) = row.int("message") {
                    message.set_database_id(id);
                }
                message.set_trivia(Trivia {
                    rfc822_size: row.int("rfc822size").unwrap_or_default(),
                    internal_date: row.int("idate").unwrap_or_default(),
                    mod_seq: row.int("modseq").unwrap_or_default(),
                });
            }
            Self::PartNumbers => {
                if let Some(part) = row.text("part") {
                    message.add_part_number(part.to_owned());
                }
            }
        }
    }
}

fn bucket_of(id: i64) -> usize {
    // rem_euclid keeps negative ids in range.
    usize::try_from(id.rem_euclid(BATCH_HASH as i64)).unwrap_or(0)
}

/// An `in`-list condition over literal ids, deduplicated and sorted.
fn id_clause(column: &str, ids: &[i64]) -> String {
    let mut sorted: Vec<i64> = ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.is_empty() {
        return format!("{column} is null and {column} is not null");
    }
    let mut list = String::new();
    for (i, id) in sorted.iter().enumerate() {
        if i > 0 {
            list.push(',');
        }
        let _ = write!(list, "{id}");
    }
    format!("{column} in ({list})")
}

/// Tuning knobs for batched fetching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Initial batch size before per-kind scaling.
    pub seed: u32,
    /// Lower bound on the batch size.
    pub floor: u32,
    /// Upper bound on the batch size.
    pub max_batch: u32,
    /// Wall-clock budget one round should take.
    pub round_budget: Duration,
    /// Below `objects × kinds < simple_limit`, use simple mode.
    pub simple_limit: u64,
    /// For contiguous ranges, use simple mode below this product.
    pub range_limit: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            seed: 1024,
            floor: 128,
            max_batch: 32_768,
            round_budget: Duration::from_secs(30),
            simple_limit: 1000,
            range_limit: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    NotStarted,
    FindingMessages,
    Fetching,
    Done,
}

/// The adaptive batched retrieval engine. Construct with
/// [`Fetcher::new`], add targets, then [`start`](Fetcher::start).
pub struct Fetcher {
    db: Database,
    mailbox: Mailbox,
    kinds: Vec<Kind>,
    messages: Vec<Rc<RefCell<Message>>>,
    uid_index: HashMap<u32, Rc<RefCell<Message>>>,
    pending: VecDeque<Rc<RefCell<Message>>>,
    batch: Vec<Rc<RefCell<Message>>>,
    buckets: Vec<Vec<(i64, Rc<RefCell<Message>>)>>,
    unique_ids: bool,
    state: FetchState,
    simple: bool,
    min_modseq: Option<i64>,
    locating: Option<Query>,
    queries: Vec<(Kind, Query)>,
    batch_size: u32,
    round_started: Instant,
    config: FetchConfig,
    clock: SharedClock,
    owner: OwnerRef,
    self_ref: Weak<RefCell<Fetcher>>,
    failed: bool,
}

impl Fetcher {
    /// Creates a fetcher for `kinds` over `messages` in `mailbox` and
    /// registers it as the mailbox's canonical fetcher for those kinds.
    /// The owner is notified once when the fetch completes or fails.
    #[must_use]
    pub fn new(
        db: &Database,
        mailbox: &Mailbox,
        kinds: Vec<Kind>,
        messages: Vec<Rc<RefCell<Message>>>,
        owner: OwnerRef,
        config: FetchConfig,
        clock: SharedClock,
    ) -> Rc<RefCell<Self>> {
        let mut batch_size = config.seed;
        for kind in &kinds {
            batch_size = batch_size.min(kind.seed(config.seed));
        }
        batch_size = batch_size.max(config.floor);

        let now = clock.now();
        let fetcher = Rc::new_cyclic(|self_ref| {
            let mut f = Self {
                db: db.clone(),
                mailbox: mailbox.clone(),
                kinds,
                messages: Vec::new(),
                uid_index: HashMap::new(),
                pending: VecDeque::new(),
                batch: Vec::new(),
                buckets: Vec::new(),
                unique_ids: true,
                state: FetchState::NotStarted,
                simple: false,
                min_modseq: None,
                locating: None,
                queries: Vec::new(),
                batch_size,
                round_started: now,
                config,
                clock,
                owner,
                self_ref: self_ref.clone(),
                failed: false,
            };
            f.index_messages(messages);
            RefCell::new(f)
        });
        mailbox.register_fetcher(&fetcher);
        fetcher
    }

    /// Grows the target set. Only allowed before [`start`](Self::start).
    pub fn add_messages(&mut self, messages: Vec<Rc<RefCell<Message>>>) {
        if self.state == FetchState::NotStarted {
            self.index_messages(messages);
        } else {
            tracing::warn!("messages added to a fetcher that has already started; ignored");
        }
    }

    /// Restricts the locating pass to entries with `modseq >= floor`.
    /// Only meaningful before [`start`](Self::start).
    pub const fn set_min_modseq(&mut self, floor: i64) {
        self.min_modseq = Some(floor);
    }

    fn index_messages(&mut self, messages: Vec<Rc<RefCell<Message>>>) {
        for m in messages {
            let uid = m.borrow().uid();
            if self.uid_index.insert(uid, Rc::clone(&m)).is_none() {
                self.messages.push(m);
            }
        }
        self.messages.sort_by_key(|m| m.borrow().uid());
    }

    /// The kinds this fetcher serves.
    #[must_use]
    pub fn kinds(&self) -> &[Kind] {
        &self.kinds
    }

    /// True while `kind` is requested and not yet complete.
    #[must_use]
    pub fn fetching(&self, kind: Kind) -> bool {
        self.state != FetchState::Done && self.kinds.contains(&kind)
    }

    /// True once the fetch has completed or failed.
    #[must_use]
    pub fn done(&self) -> bool {
        self.state == FetchState::Done
    }

    /// True if a query failed; affected kinds stay not-done.
    #[must_use]
    pub const fn failed(&self) -> bool {
        self.failed
    }

    /// The current batch size, as adapted so far.
    #[must_use]
    pub const fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// Begins fetching. Decides between the simple and batched strategy,
    /// issues the first queries, and returns; progress continues through
    /// query-completion notifications. Must be called from within a
    /// `LocalSet`.
    pub fn start(&mut self) {
        if self.state != FetchState::NotStarted {
            return;
        }
        if self.messages.is_empty() || self.kinds.is_empty() {
            self.finish();
            return;
        }

        let mut uids = IdSet::new();
        for m in &self.messages {
            uids.add(m.borrow().uid());
        }
        let mut selector = Selector::new(self.mailbox.id(), uids);
        if let Some(floor) = self.min_modseq {
            selector = selector.with_min_modseq(floor);
        }

        let objects = selector.count();
        let product = objects * self.kinds.len() as u64;
        let simple = objects == 1
            || (selector.is_range() && product < self.config.range_limit)
            || product < self.config.simple_limit;

        if simple {
            self.simple = true;
            self.state = FetchState::Fetching;
            self.batch = self.messages.clone();
            self.pending.clear();
            self.round_started = self.clock.now();
            for kind in self.kinds.clone() {
                let q = kind.simple_query(&selector);
                q.set_owner(self.owner_ref());
                self.queries.push((kind, q.clone()));
                self.db.submit(q);
            }
        } else {
            // Widen with other live views of the mailbox, so one locating
            // pass can serve gaps they already know about.
            for session in self.mailbox.sessions() {
                selector.widen(&session.messages());
            }
            self.state = FetchState::FindingMessages;
            let q = self.locating_query(&selector);
            q.set_owner(self.owner_ref());
            self.locating = Some(q.clone());
            self.db.submit(q);
        }
    }

    fn locating_query(&self, selector: &Selector) -> Query {
        let trivia = self.kinds.contains(&Kind::Trivia);
        let mut text = String::from("select mm.uid, mm.message");
        if trivia {
            text.push_str(", mm.idate, mm.modseq, m.rfc822size");
        }
        text.push_str(" from mailbox_messages mm");
        if trivia {
            text.push_str(" join messages m on (mm.message=m.id)");
        }
        let _ = write!(
            text,
            " where mm.mailbox=$1 and {}",
            selector.uids().where_clause("mm.uid")
        );
        if selector.min_modseq().is_some() {
            text.push_str(" and mm.modseq>=$2");
        }
        text.push_str(" order by mm.uid");
        let q = Query::new(text).bind(selector.mailbox());
        match selector.min_modseq() {
            Some(floor) => q.bind(floor),
            None => q,
        }
    }

    fn owner_ref(&self) -> OwnerRef {
        self.self_ref.clone() as OwnerRef
    }

    fn step(&mut self) {
        match self.state {
            FetchState::NotStarted | FetchState::Done => {}
            FetchState::FindingMessages => self.check_locating(),
            FetchState::Fetching => self.pump_round(),
        }
    }

    fn check_locating(&mut self) {
        let Some(q) = self.locating.clone() else {
            return;
        };
        if !q.done() {
            return;
        }
        if q.failed() {
            tracing::debug!(error = ?q.error(), "locating query failed");
            self.failed = true;
            self.finish();
            return;
        }

        let trivia = self.kinds.contains(&Kind::Trivia);
        while let Some(row) = q.next_row() {
            let Some(uid) = row.int("uid").and_then(|v| u32::try_from(v).ok()) else {
                continue;
            };
            // Widened rows for UIDs outside the target set are ignored.
            let Some(m) = self.uid_index.get(&uid) else {
                continue;
            };
            let mut message = m.borrow_mut();
            if let Some(id) = row.int("message") {
                message.set_database_id(id);
            }
            if trivia && !message.is_done(Kind::Trivia) {
                Kind::Trivia.decode(&row, &mut message);
            }
        }
        self.locating = None;
        self.pending = self.messages.iter().map(Rc::clone).collect();
        self.state = FetchState::Fetching;
        self.next_batch();
    }

    fn next_batch(&mut self) {
        let mut take = self.batch_size as usize;
        // Absorb a small remainder instead of leaving a tiny final batch.
        if self.pending.len() <= take.saturating_mul(5) / 4 {
            take = self.pending.len();
        }
        self.batch = self.pending.drain(..take).collect();
        self.buckets = vec![Vec::new(); BATCH_HASH];
        self.unique_ids = true;
        let mut ids: Vec<i64> = Vec::with_capacity(self.batch.len());
        let mut uids = IdSet::new();
        for m in &self.batch {
            let message = m.borrow();
            uids.add(message.uid());
            if let Some(id) = message.database_id() {
                ids.push(id);
                let bucket = &mut self.buckets[bucket_of(id)];
                if bucket.iter().any(|(other, _)| *other == id) {
                    self.unique_ids = false;
                }
                bucket.push((id, Rc::clone(m)));
            }
        }

        self.round_started = self.clock.now();
        self.queries.clear();
        for kind in self.kinds.clone() {
            if let Some(q) = kind.batched_query(self.mailbox.id(), &uids, &ids) {
                q.set_owner(self.owner_ref());
                self.queries.push((kind, q.clone()));
                self.db.submit(q);
            }
        }
        if self.queries.is_empty() {
            // Trivia-only round: everything came from the locating pass.
            self.complete_round();
        }
    }

    fn pump_round(&mut self) {
        let queries = self.queries.clone();
        for (kind, q) in &queries {
            while let Some(row) = q.next_row() {
                self.route(*kind, &row);
            }
        }
        if queries.iter().all(|(_, q)| q.done()) {
            self.complete_round();
        }
    }

    fn route(&self, kind: Kind, row: &Row) {
        let by_uid = self.simple || kind.route() == Route::Uid;
        if by_uid {
            let Some(uid) = row.int("uid").and_then(|v| u32::try_from(v).ok()) else {
                return;
            };
            if let Some(m) = self.uid_index.get(&uid) {
                let mut message = m.borrow_mut();
                if !message.is_done(kind) {
                    kind.decode(row, &mut message);
                }
            }
        } else {
            let Some(id) = row.int("message") else {
                return;
            };
            for (other, m) in &self.buckets[bucket_of(id)] {
                if *other != id {
                    continue;
                }
                let mut message = m.borrow_mut();
                if !message.is_done(kind) {
                    kind.decode(row, &mut message);
                }
                if self.unique_ids {
                    break;
                }
            }
        }
    }

    fn complete_round(&mut self) {
        let mut failed_kinds: Vec<Kind> = Vec::new();
        for (kind, q) in &self.queries {
            if q.failed() {
                tracing::debug!(?kind, error = ?q.error(), "fetch query failed");
                failed_kinds.push(*kind);
            }
        }

        for m in &self.batch {
            let mut message = m.borrow_mut();
            for kind in &self.kinds {
                // A failed kind stays not-done; absence of rows does not.
                if !failed_kinds.contains(kind) {
                    message.set_done(*kind);
                }
            }
        }
        self.batch.clear();
        self.buckets.clear();
        self.queries.clear();

        if !failed_kinds.is_empty() {
            self.failed = true;
            self.finish();
            return;
        }
        if self.simple || self.pending.is_empty() {
            self.finish();
            return;
        }
        self.adapt_batch_size();
        self.next_batch();
    }

    /// Retargets the next round at the configured wall-clock budget,
    /// growing at most 3x and +2000 at a time, within floor and ceiling.
    fn adapt_batch_size(&mut self) {
        let prev = self.batch_size;
        let elapsed = self.clock.elapsed(self.round_started).as_secs();
        let ideal = if elapsed == 0 {
            u64::from(prev).saturating_mul(3)
        } else {
            u64::from(prev) * self.config.round_budget.as_secs() / elapsed
        };
        let next = ideal
            .min(u64::from(prev).saturating_mul(3))
            .min(u64::from(prev) + 2000)
            .min(u64::from(self.config.max_batch))
            .max(u64::from(self.config.floor));
        self.batch_size = u32::try_from(next).unwrap_or(self.config.max_batch);
        if self.batch_size != prev {
            tracing::debug!(
                from = prev,
                to = self.batch_size,
                seconds = elapsed,
                "batch size adjusted"
            );
        }
    }

    fn finish(&mut self) {
        if self.state == FetchState::Done {
            return;
        }
        self.state = FetchState::Done;
        notify(&self.owner);
    }
}

impl EventHandler for Fetcher {
    fn resume(&mut self) {
        self.step();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn id_clause_deduplicates_and_sorts() {
        assert_eq!(id_clause("pn.message", &[5, 1, 5, 3]), "pn.message in (1,3,5)");
        assert!(id_clause("pn.message", &[]).contains("is null"));
    }

    #[test]
    fn seed_scaling_per_kind() {
        assert_eq!(Kind::Flags.seed(1024), 1024);
        assert_eq!(Kind::Body.seed(1024), 512);
        assert_eq!(Kind::OtherHeader.seed(1024), 682);
        assert_eq!(Kind::Addresses.seed(1024), 768);
    }

    #[test]
    fn simple_query_splices_both_markers() {
        let selector = Selector::new(7, IdSet::range(1, 5));
        let q = Kind::Flags.simple_query(&selector);
        let text = q.statement();
        assert!(text.starts_with("select distinct mm.uid, f.flag"));
        assert!(text.contains("join flags f on (mm.mailbox=f.mailbox and mm.uid=f.uid) where"));
        assert!(text.ends_with("order by mm.uid"));
    }

    struct Noop;
    impl EventHandler for Noop {
        fn resume(&mut self) {}
    }

    #[tokio::test]
    async fn batch_size_adapts_toward_the_round_budget() {
        let db = Database::in_memory().await.unwrap();
        let mailbox = Mailbox::new(1, "INBOX");
        let mock = mailvault_server::MockClock::shared();
        let clock: SharedClock = Rc::<mailvault_server::MockClock>::clone(&mock) as SharedClock;
        let holder: Rc<RefCell<Noop>> = Rc::new(RefCell::new(Noop));
        let fetcher = Fetcher::new(
            &db,
            &mailbox,
            vec![Kind::Flags],
            Vec::new(),
            Rc::downgrade(&holder) as OwnerRef,
            FetchConfig::default(),
            clock,
        );

        let mut f = fetcher.borrow_mut();
        assert_eq!(f.batch_size(), 1024);

        // A 2-second round under a 30-second budget wants 15x, but growth
        // is capped at +2000 (the tighter of the two caps here).
        f.round_started = mock.now();
        mock.advance(Duration::from_secs(2));
        f.adapt_batch_size();
        assert_eq!(f.batch_size(), 3024);

        // An instant round grows threefold at most; +2000 is tighter.
        f.round_started = mock.now();
        f.adapt_batch_size();
        assert_eq!(f.batch_size(), 5024);

        // A slow round shrinks, but never below the floor.
        f.round_started = mock.now();
        mock.advance(Duration::from_secs(3600));
        f.adapt_batch_size();
        assert_eq!(f.batch_size(), FetchConfig::default().floor);
    }

    #[test]
    fn trivia_has_no_batched_query() {
        assert!(
            Kind::Trivia
                .batched_query(1, &IdSet::range(1, 5), &[1, 2])
                .is_none()
        );
        assert!(
            Kind::Flags
                .batched_query(1, &IdSet::range(1, 5), &[])
                .is_some()
        );
    }
}
