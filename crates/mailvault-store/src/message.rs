//! The message domain object the fetcher populates.

use crate::fetcher::Kind;

/// The small always-wanted facts about a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trivia {
    /// Transfer-encoded size in bytes.
    pub rfc822_size: i64,
    /// Internal date as a unix timestamp.
    pub internal_date: i64,
    /// Modification sequence within the mailbox.
    pub mod_seq: i64,
}

/// One non-address header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    /// MIME part the field belongs to; empty for the top level.
    pub part: String,
    /// Position within the header.
    pub position: i64,
    /// Field name, e.g. `Subject`.
    pub name: String,
    /// Field value.
    pub value: String,
}

/// One address in an address-valued header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// MIME part the field belongs to; empty for the top level.
    pub part: String,
    /// Position within the field.
    pub position: i64,
    /// Which address field (From, To, Cc, ...), as the stored field id.
    pub field: i64,
    /// Display name.
    pub name: String,
    /// Local part.
    pub localpart: String,
    /// Domain.
    pub domain: String,
}

/// One body part's stored content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    /// MIME part number, e.g. `1.2`.
    pub part: String,
    /// Stored size in bytes.
    pub bytes: i64,
    /// Line count, for text parts.
    pub lines: Option<i64>,
    /// Text content, if the part is textual.
    pub text: Option<String>,
    /// Raw content, if the part is binary.
    pub data: Option<Vec<u8>>,
}

/// One annotation on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Annotation entry name.
    pub entry: String,
    /// Annotation value.
    pub value: String,
    /// Owning user id; `None` for shared annotations.
    pub owner: Option<i64>,
}

/// A message as seen through one mailbox: a UID plus whatever kinds of
/// associated data have been fetched so far.
///
/// Per-kind completion is monotonic: once a kind is done it stays done for
/// the lifetime of the object, which is what lets decoders skip rows for
/// already-populated messages.
#[derive(Debug, Default)]
pub struct Message {
    uid: u32,
    database_id: Option<i64>,
    done: u8,
    flags: Vec<i64>,
    trivia: Option<Trivia>,
    header_fields: Vec<HeaderField>,
    addresses: Vec<Address>,
    parts: Vec<BodyPart>,
    part_numbers: Vec<String>,
    annotations: Vec<Annotation>,
}

impl Message {
    /// A message known only by UID.
    #[must_use]
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            ..Self::default()
        }
    }

    /// The UID within its mailbox.
    #[must_use]
    pub const fn uid(&self) -> u32 {
        self.uid
    }

    /// The `messages` table id, once the locating pass has found it.
    #[must_use]
    pub const fn database_id(&self) -> Option<i64> {
        self.database_id
    }

    /// Records the `messages` table id.
    pub const fn set_database_id(&mut self, id: i64) {
        self.database_id = Some(id);
    }

    /// True once `kind` has been fetched for this message.
    #[must_use]
    pub const fn is_done(&self, kind: Kind) -> bool {
        self.done & kind.bit() != 0
    }

    /// Marks `kind` fetched. Never reverts.
    pub const fn set_done(&mut self, kind: Kind) {
        self.done |= kind.bit();
    }

    /// Adds a flag id, ignoring duplicates.
    pub fn add_flag(&mut self, flag: i64) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    /// Flag ids set on this message.
    #[must_use]
    pub fn flags(&self) -> &[i64] {
        &self.flags
    }

    /// Stores size, date and modseq.
    pub const fn set_trivia(&mut self, trivia: Trivia) {
        self.trivia = Some(trivia);
    }

    /// Size, date and modseq, once fetched.
    #[must_use]
    pub const fn trivia(&self) -> Option<Trivia> {
        self.trivia
    }

    /// Appends a header field.
    pub fn add_header_field(&mut self, field: HeaderField) {
        self.header_fields.push(field);
    }

    /// Header fields in stored order.
    #[must_use]
    pub fn header_fields(&self) -> &[HeaderField] {
        &self.header_fields
    }

    /// Appends an address.
    pub fn add_address(&mut self, address: Address) {
        self.addresses.push(address);
    }

    /// Addresses in stored order.
    #[must_use]
    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    /// Appends a body part.
    pub fn add_part(&mut self, part: BodyPart) {
        self.parts.push(part);
    }

    /// Body parts in stored order.
    #[must_use]
    pub fn parts(&self) -> &[BodyPart] {
        &self.parts
    }

    /// Appends a known part number.
    pub fn add_part_number(&mut self, part: String) {
        self.part_numbers.push(part);
    }

    /// Known part numbers in stored order.
    #[must_use]
    pub fn part_numbers(&self) -> &[String] {
        &self.part_numbers
    }

    /// Appends an annotation.
    pub fn add_annotation(&mut self, annotation: Annotation) {
        self.annotations.push(annotation);
    }

    /// Annotations in stored order.
    #[must_use]
    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn done_flags_are_monotonic() {
        let mut m = Message::new(12);
        assert!(!m.is_done(Kind::Flags));
        m.set_done(Kind::Flags);
        m.set_done(Kind::Body);
        assert!(m.is_done(Kind::Flags));
        assert!(m.is_done(Kind::Body));
        assert!(!m.is_done(Kind::Addresses));
    }

    #[test]
    fn flags_deduplicate() {
        let mut m = Message::new(12);
        m.add_flag(3);
        m.add_flag(3);
        m.add_flag(7);
        assert_eq!(m.flags(), &[3, 7]);
    }
}
