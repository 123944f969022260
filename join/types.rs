// ========================================================================================
//
//                               SHARED DOMAIN TYPES
//
// ========================================================================================
//
// The small vocabulary that every stage of the join speaks: partition identities,
// marker keys and allele pairs. Nothing in here performs I/O.

use std::fmt;

/// The zero-based position of an input partition in the order given by the user.
///
/// Rendered one-based (`#1`, `#2`, ...) in every message a user sees.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionIndex(pub usize);

impl PartitionIndex {
    pub fn ordinal(self) -> usize {
        self.0 + 1
    }
}

impl fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.ordinal())
    }
}

/// The identity under which rows from different partitions are matched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MarkerKey {
    /// Matched on the exact marker label.
    Label(String),
    /// Matched on position plus the unordered, lower-cased allele pair, so the same
    /// physical marker carrying different labels in different partitions still joins.
    Locus {
        position: String,
        alleles: (String, String),
    },
}

impl MarkerKey {
    pub fn locus(position: &str, a1: &str, a2: &str) -> Self {
        let (a1, a2) = (a1.to_lowercase(), a2.to_lowercase());
        let alleles = if a1 <= a2 { (a1, a2) } else { (a2, a1) };
        MarkerKey::Locus {
            position: position.to_lowercase(),
            alleles,
        }
    }
}

impl fmt::Display for MarkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerKey::Label(label) => f.write_str(label),
            MarkerKey::Locus {
                position,
                alleles: (low, high),
            } => write!(f, "{position}:{low}/{high}"),
        }
    }
}

/// How one partition's allele pair relates to the reference pair for a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlleleOrientation {
    Same,
    Reversed,
    Mismatch,
}

/// An ordered allele pair as written in a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllelePair {
    pub first: String,
    pub second: String,
}

impl AllelePair {
    pub fn new(first: &str, second: &str) -> Self {
        Self {
            first: first.to_string(),
            second: second.to_string(),
        }
    }

    /// Compares `first`/`second` against this reference pair. Comparison is exact;
    /// a pair of identical alleles is always `Same`, never `Reversed`.
    pub fn orient(&self, first: &str, second: &str) -> AlleleOrientation {
        if self.first == first && self.second == second {
            AlleleOrientation::Same
        } else if self.first == second && self.second == first {
            AlleleOrientation::Reversed
        } else {
            AlleleOrientation::Mismatch
        }
    }
}

impl fmt::Display for AllelePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.first, self.second)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_index_displays_one_based() {
        assert_eq!(PartitionIndex(0).to_string(), "#1");
        assert_eq!(PartitionIndex(2).ordinal(), 3);
    }

    #[test]
    fn locus_keys_ignore_allele_order_and_case() {
        assert_eq!(
            MarkerKey::locus("1234", "A", "g"),
            MarkerKey::locus("1234", "G", "a")
        );
        assert_ne!(
            MarkerKey::locus("1234", "A", "G"),
            MarkerKey::locus("1235", "A", "G")
        );
        assert_eq!(MarkerKey::locus("99", "T", "C").to_string(), "99:c/t");
    }

    #[test]
    fn allele_orientation_is_exact() {
        let reference = AllelePair::new("A", "G");
        assert_eq!(reference.orient("A", "G"), AlleleOrientation::Same);
        assert_eq!(reference.orient("G", "A"), AlleleOrientation::Reversed);
        assert_eq!(reference.orient("A", "T"), AlleleOrientation::Mismatch);
        assert_eq!(reference.orient("a", "g"), AlleleOrientation::Mismatch);

        let homozygous = AllelePair::new("C", "C");
        assert_eq!(homozygous.orient("C", "C"), AlleleOrientation::Same);
    }
}
