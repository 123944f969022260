//! Column layouts of the supported result formats.
//!
//! Every format is "leading columns, then one value group per sample". The join
//! engine is written once against [`RecordLayout`]; adding a format means adding a
//! preset here, not another copy of the join loop.

use std::fmt;

/// The number of values each sample contributes to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLayout {
    /// One expected allele dosage in `[0, 2]`.
    Dosage,
    /// Three genotype probabilities `P(AA) P(AB) P(BB)`.
    Triplet,
}

impl ValueLayout {
    pub fn width(self) -> usize {
        match self {
            ValueLayout::Dosage => 1,
            ValueLayout::Triplet => 3,
        }
    }
}

/// How the marker key is assembled from the leading columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStyle {
    Label,
    Locus { position_column: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub name: &'static str,
    /// File extension of the data stream, without the leading dot.
    pub extension: &'static str,
    pub leading_columns: usize,
    pub label_column: usize,
    pub allele_columns: (usize, usize),
    pub key: KeyStyle,
    pub values: ValueLayout,
    /// Header records preceding the data.
    pub header_lines: usize,
}

impl RecordLayout {
    pub const BEAGLE_DOSE: RecordLayout = RecordLayout {
        name: "dose",
        extension: "dose",
        leading_columns: 3,
        label_column: 0,
        allele_columns: (1, 2),
        key: KeyStyle::Label,
        values: ValueLayout::Dosage,
        header_lines: 1,
    };

    pub const BEAGLE_GPROBS: RecordLayout = RecordLayout {
        name: "gprobs",
        extension: "gprobs",
        leading_columns: 3,
        label_column: 0,
        allele_columns: (1, 2),
        key: KeyStyle::Label,
        values: ValueLayout::Triplet,
        header_lines: 1,
    };

    pub const IMPUTE2: RecordLayout = RecordLayout {
        name: "impute2",
        extension: "impute2",
        leading_columns: 5,
        label_column: 1,
        allele_columns: (3, 4),
        key: KeyStyle::Locus { position_column: 2 },
        values: ValueLayout::Triplet,
        header_lines: 0,
    };

    /// The total field count of a record carrying `samples` value groups.
    pub fn expected_fields(&self, samples: usize) -> usize {
        self.leading_columns + samples * self.values.width()
    }

    /// The field offset of the first value of sample `sample`.
    pub fn value_offset(&self, sample: usize) -> usize {
        self.leading_columns + sample * self.values.width()
    }

    pub fn has_header(&self) -> bool {
        self.header_lines > 0
    }
}

/// The families of input the joiner understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    /// Beagle `.dose` / `.gprobs` results sharing a `.bgl` sample header.
    Beagle,
    /// IMPUTE2 `.impute2` results with a companion `.sample` file.
    Impute2,
}

/// Samples are identified by one label in Beagle files and by the case-insensitive
/// `ID_1 ID_2` pair in IMPUTE2 sample files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleNaming {
    pub id_words: usize,
    pub case_insensitive: bool,
}

impl DataFormat {
    pub fn sample_naming(self) -> SampleNaming {
        match self {
            DataFormat::Beagle => SampleNaming {
                id_words: 1,
                case_insensitive: false,
            },
            DataFormat::Impute2 => SampleNaming {
                id_words: 2,
                case_insensitive: true,
            },
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::Beagle => f.write_str("beagle"),
            DataFormat::Impute2 => f.write_str("impute2"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_counts_follow_the_value_width() {
        assert_eq!(RecordLayout::BEAGLE_DOSE.expected_fields(4), 7);
        assert_eq!(RecordLayout::BEAGLE_GPROBS.expected_fields(4), 15);
        assert_eq!(RecordLayout::IMPUTE2.expected_fields(2), 11);
        assert_eq!(RecordLayout::IMPUTE2.value_offset(1), 8);
        assert_eq!(RecordLayout::IMPUTE2.expected_fields(0), 5);
    }

    #[test]
    fn only_beagle_streams_carry_a_header_row() {
        assert!(RecordLayout::BEAGLE_DOSE.has_header());
        assert!(!RecordLayout::IMPUTE2.has_header());
    }
}
