use crate::pipeline::PipelineError;
use crate::types::PartitionIndex;
use itertools::Itertools;
use std::fmt;
use std::io;
use thiserror::Error;

/// A pair of fully covered markers that two partitions list in opposite order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderConflict {
    pub earlier: String,
    pub later: String,
    pub partitions: Vec<PartitionIndex>,
}

impl fmt::Display for OrderConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} precedes {} in partition #1 but not in partition(s) {}",
            self.earlier,
            self.later,
            self.partitions.iter().join(", ")
        )
    }
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("pipeline I/O error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "partition {partition} ({source_name}) line {line}: expected {expected} fields, found {found}"
    )]
    SchemaMismatch {
        partition: PartitionIndex,
        source_name: String,
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error(
        "marker {label}: partition {partition} has alleles {found}, which are neither {expected} nor its reverse"
    )]
    AlleleMismatch {
        partition: PartitionIndex,
        label: String,
        expected: String,
        found: String,
    },

    #[error("inconsistent marker order between partitions:\n  {}", .0.iter().join("\n  "))]
    OrderConflict(Vec<OrderConflict>),

    #[error("duplicate marker {label} on line {line} of the marker list")]
    DuplicateMarker { label: String, line: u64 },

    #[error("partition {partition} line {line}: value {value:?} for marker {label} is not a number")]
    InvalidValue {
        partition: PartitionIndex,
        line: u64,
        label: String,
        value: String,
    },

    #[error("sample {sample} appears more than once in the sample filter")]
    DuplicateFilterSample { sample: String },

    #[error("malformed record in {source_name} at line {line}: {message}")]
    Malformed {
        source_name: String,
        line: u64,
        message: String,
    },

    #[error("sample header of {source_name} does not match the first partition's header")]
    SampleHeaderMismatch { source_name: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

impl JoinError {
    pub fn malformed(source_name: &str, line: u64, message: impl Into<String>) -> Self {
        JoinError::Malformed {
            source_name: source_name.to_string(),
            line,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, JoinError>;
