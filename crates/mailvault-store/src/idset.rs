//! Ordered id sets with range runs.
//!
//! UID and message-id sets are stored as sorted, disjoint inclusive runs,
//! so a mailbox-sized contiguous selection costs one run. The set also
//! generates its own SQL fragment (`where_clause`) with literal numbers,
//! which is how selection reaches the locating and per-kind queries.

use std::fmt::Write as _;

/// A sorted set of u32 ids stored as disjoint inclusive ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    runs: Vec<(u32, u32)>,
}

impl IdSet {
    /// An empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A set holding one inclusive range.
    #[must_use]
    pub fn range(lo: u32, hi: u32) -> Self {
        let mut s = Self::new();
        s.add_range(lo, hi);
        s
    }

    /// Adds one id.
    pub fn add(&mut self, id: u32) {
        self.add_range(id, id);
    }

    /// Adds an inclusive range. Overlapping and adjacent runs merge.
    pub fn add_range(&mut self, lo: u32, hi: u32) {
        if lo > hi {
            return;
        }
        let mut merged: Vec<(u32, u32)> = Vec::with_capacity(self.runs.len() + 1);
        let mut new = (lo, hi);
        let mut placed = false;
        for &(a, b) in &self.runs {
            if placed {
                merged.push((a, b));
            } else if b.saturating_add(1) < new.0 {
                merged.push((a, b));
            } else if new.1.saturating_add(1) < a {
                merged.push(new);
                merged.push((a, b));
                placed = true;
            } else {
                new = (new.0.min(a), new.1.max(b));
            }
        }
        if !placed {
            merged.push(new);
        }
        self.runs = merged;
    }

    /// True if `id` is in the set.
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.runs.iter().any(|&(a, b)| a <= id && id <= b)
    }

    /// Number of ids in the set.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.runs
            .iter()
            .map(|&(a, b)| u64::from(b - a) + 1)
            .sum()
    }

    /// True if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// True if the set is one contiguous range.
    #[must_use]
    pub fn is_range(&self) -> bool {
        self.runs.len() == 1
    }

    /// The smallest member, if any.
    #[must_use]
    pub fn smallest(&self) -> Option<u32> {
        self.runs.first().map(|&(a, _)| a)
    }

    /// The largest member, if any.
    #[must_use]
    pub fn largest(&self) -> Option<u32> {
        self.runs.last().map(|&(_, b)| b)
    }

    /// Iterates the members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.runs.iter().flat_map(|&(a, b)| a..=b)
    }

    /// Widens this set with every member of `other` lying strictly inside
    /// this set's span. Used to reuse one view's gaps for another view of
    /// the same collection before a locating query.
    pub fn add_gaps_from(&mut self, other: &Self) {
        let (Some(lo), Some(hi)) = (self.smallest(), self.largest()) else {
            return;
        };
        for &(a, b) in &other.runs {
            let a = a.max(lo);
            let b = b.min(hi);
            if a <= b {
                self.add_range(a, b);
            }
        }
    }

    /// A SQL condition selecting exactly this set on `column`, with
    /// literal numbers. Empty sets yield a never-true condition.
    #[must_use]
    pub fn where_clause(&self, column: &str) -> String {
        if self.runs.is_empty() {
            return format!("{column} is null and {column} is not null");
        }
        if let [(a, b)] = self.runs[..] {
            return if a == b {
                format!("{column}={a}")
            } else {
                format!("{column}>={a} and {column}<={b}")
            };
        }

        let singles: Vec<u32> = self
            .runs
            .iter()
            .filter(|&&(a, b)| a == b)
            .map(|&(a, _)| a)
            .collect();
        let mut parts: Vec<String> = Vec::new();
        if !singles.is_empty() {
            let mut list = String::new();
            for (i, v) in singles.iter().enumerate() {
                if i > 0 {
                    list.push(',');
                }
                let _ = write!(list, "{v}");
            }
            parts.push(format!("{column} in ({list})"));
        }
        for &(a, b) in self.runs.iter().filter(|&&(a, b)| a != b) {
            parts.push(format!("({column}>={a} and {column}<={b})"));
        }
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            format!("({})", parts.join(" or "))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn runs_merge_when_adjacent() {
        let mut s = IdSet::new();
        s.add(3);
        s.add(5);
        s.add(4);
        assert!(s.is_range());
        assert_eq!(s.count(), 3);
        assert_eq!(s.smallest(), Some(3));
        assert_eq!(s.largest(), Some(5));
    }

    #[test]
    fn where_clause_shapes() {
        assert_eq!(IdSet::range(7, 7).where_clause("uid"), "uid=7");
        assert_eq!(IdSet::range(2, 9).where_clause("uid"), "uid>=2 and uid<=9");

        let mut s = IdSet::new();
        s.add(1);
        s.add(3);
        s.add_range(10, 20);
        assert_eq!(
            s.where_clause("mm.uid"),
            "(mm.uid in (1,3) or (mm.uid>=10 and mm.uid<=20))"
        );
    }

    #[test]
    fn empty_where_clause_matches_nothing() {
        let clause = IdSet::new().where_clause("uid");
        assert!(clause.contains("uid is null"));
    }

    #[test]
    fn gaps_are_filled_only_within_span() {
        let mut s = IdSet::new();
        s.add(10);
        s.add(20);
        let mut other = IdSet::new();
        other.add_range(1, 30);
        s.add_gaps_from(&other);

        assert!(s.is_range());
        assert_eq!(s.smallest(), Some(10));
        assert_eq!(s.largest(), Some(20));
    }

    proptest! {
        #[test]
        fn add_then_contains(ids in proptest::collection::vec(1u32..5000, 0..64)) {
            let mut s = IdSet::new();
            for &id in &ids {
                s.add(id);
            }
            for &id in &ids {
                prop_assert!(s.contains(id));
            }
            let mut unique: Vec<u32> = ids.clone();
            unique.sort_unstable();
            unique.dedup();
            prop_assert_eq!(s.count(), unique.len() as u64);
            prop_assert_eq!(s.iter().collect::<Vec<_>>(), unique);
        }

        #[test]
        fn runs_stay_sorted_and_disjoint(
            ranges in proptest::collection::vec((1u32..1000, 0u32..50), 0..32)
        ) {
            let mut s = IdSet::new();
            for &(lo, len) in &ranges {
                s.add_range(lo, lo + len);
            }
            let mut prev_end: Option<u32> = None;
            for &(a, b) in &s.runs {
                prop_assert!(a <= b);
                if let Some(e) = prev_end {
                    // Disjoint and non-adjacent, or they would have merged.
                    prop_assert!(e + 1 < a);
                }
                prev_end = Some(b);
            }
        }

        #[test]
        fn widening_never_leaves_span(
            base in proptest::collection::vec(1u32..2000, 1..32),
            other in proptest::collection::vec(1u32..2000, 0..32)
        ) {
            let mut s = IdSet::new();
            for &id in &base {
                s.add(id);
            }
            let lo = s.smallest().unwrap();
            let hi = s.largest().unwrap();
            let mut o = IdSet::new();
            for &id in &other {
                o.add(id);
            }
            s.add_gaps_from(&o);
            prop_assert_eq!(s.smallest(), Some(lo));
            prop_assert_eq!(s.largest(), Some(hi));
            for &id in &base {
                prop_assert!(s.contains(id));
            }
            for id in o.iter().filter(|&v| v >= lo && v <= hi) {
                prop_assert!(s.contains(id));
            }
        }
    }
}
