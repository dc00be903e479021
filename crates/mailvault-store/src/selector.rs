//! Message selection.
//!
//! A [`Selector`] names a mailbox, a UID set and optionally a modseq
//! floor, and produces the canonical base query text. The base text
//! carries two well-known markers the fetcher's simple mode rewrites:
//! the `select distinct mm.uid` column list and the first ` where `
//! boundary. Keep them stable when changing the shape of the query.

use crate::idset::IdSet;

/// The column-list marker simple-mode splicing rewrites.
pub(crate) const SELECT_MARKER: &str = "select distinct mm.uid";

/// The join-insertion marker simple-mode splicing rewrites.
pub(crate) const WHERE_MARKER: &str = " where ";

/// Selects messages in one mailbox by UID, optionally limited to entries
/// changed at or after a modseq floor.
#[derive(Debug, Clone)]
pub struct Selector {
    mailbox: i64,
    uids: IdSet,
    min_modseq: Option<i64>,
}

impl Selector {
    /// Selects `uids` within the mailbox.
    #[must_use]
    pub fn new(mailbox: i64, uids: IdSet) -> Self {
        Self {
            mailbox,
            uids,
            min_modseq: None,
        }
    }

    /// Restricts the selection to entries with `modseq >= floor`.
    #[must_use]
    pub const fn with_min_modseq(mut self, floor: i64) -> Self {
        self.min_modseq = Some(floor);
        self
    }

    /// The mailbox id, bound as `$1` in generated queries.
    #[must_use]
    pub const fn mailbox(&self) -> i64 {
        self.mailbox
    }

    /// The selected UID set.
    #[must_use]
    pub const fn uids(&self) -> &IdSet {
        &self.uids
    }

    /// Widens the UID set in place (see [`IdSet::add_gaps_from`]).
    pub fn widen(&mut self, other: &IdSet) {
        self.uids.add_gaps_from(other);
    }

    /// True if the selection is one contiguous UID range.
    #[must_use]
    pub fn is_range(&self) -> bool {
        self.uids.is_range()
    }

    /// Number of selected UIDs.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.uids.count()
    }

    /// The canonical base query: UID column only, mailbox bound as `$1`,
    /// ascending UID order.
    #[must_use]
    pub fn base_query(&self) -> String {
        let mut text = format!(
            "{SELECT_MARKER} from mailbox_messages mm where mm.mailbox=$1 and {}",
            self.uids.where_clause("mm.uid")
        );
        if self.min_modseq.is_some() {
            text.push_str(" and mm.modseq>=$2");
        }
        text.push_str(" order by mm.uid");
        text
    }

    /// The modseq floor, if set. Bound as `$2`.
    #[must_use]
    pub const fn min_modseq(&self) -> Option<i64> {
        self.min_modseq
    }
}
