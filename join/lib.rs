#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod config;
pub mod dedup;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod index;
pub mod layout;
pub mod partition;
pub mod pipeline;
pub mod prefetch;
pub mod record;
pub mod samples;
#[path = "../shared/files.rs"]
pub mod shared_files;
pub mod sink;
pub mod types;
pub mod shared {
    pub use super::shared_files as files;
}

pub use config::JoinConfig;
pub use error::{JoinError, Result};
pub use layout::{DataFormat, RecordLayout};
pub use pipeline::{JobSpec, JobSummary, PartitionInputs, run_job};
