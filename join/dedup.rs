use crate::error::{JoinError, Result};
use crate::layout::SampleNaming;
use crate::samples::{Sample, SampleList, sample_identity};
use crate::shared::files::read_text_lines;
use crate::types::PartitionIndex;
use ahash::{AHashMap, AHashSet};
use log::info;
use std::path::Path;

/// The samples a run is restricted to.
#[derive(Debug, Clone, Default)]
pub struct SampleAllowList {
    ids: AHashSet<String>,
}

impl SampleAllowList {
    /// Reads one sample per line; `#` lines and blank lines are ignored.
    pub fn read(path: &Path, naming: SampleNaming) -> Result<Self> {
        let source_name = path.display().to_string();
        let mut ids = Vec::new();
        for (number, line) in read_text_lines(path)?.iter().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let words: Vec<&str> = trimmed.split_whitespace().collect();
            let id = sample_identity(&words, naming).ok_or_else(|| {
                JoinError::malformed(
                    &source_name,
                    number as u64 + 1,
                    format!("expected {} sample id column(s)", naming.id_words),
                )
            })?;
            ids.push(id);
        }
        let list = Self::from_ids(ids)?;
        info!("Read {} samples from {}", list.len(), source_name);
        Ok(list)
    }

    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Result<Self> {
        let mut set = AHashSet::new();
        for id in ids {
            if set.contains(&id) {
                return Err(JoinError::DuplicateFilterSample { sample: id });
            }
            set.insert(id);
        }
        Ok(Self { ids: set })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Which of a partition's samples reach the merged output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepPlan {
    /// Every declared sample is kept; the row can be copied as is.
    All,
    /// No sample is kept; the partition contributes no value columns.
    Nothing,
    /// The sample indices to keep, ascending.
    Samples(Vec<usize>),
}

/// A sample seen again after its first (primary) occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicatePair {
    pub label: String,
    pub primary: (PartitionIndex, usize),
    pub shadow: (PartitionIndex, usize),
    /// The full `.sample` records of both occurrences, when there are any.
    pub records: Option<(String, String)>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleCounts {
    pub declared: usize,
    pub kept: usize,
    pub duplicates: usize,
    pub filtered: usize,
}

#[derive(Debug, Clone)]
pub struct DedupPlan {
    pub keep: Vec<KeepPlan>,
    pub duplicates: Vec<DuplicatePair>,
    pub counts: Vec<SampleCounts>,
    /// Kept samples in output column order.
    pub primaries: Vec<Sample>,
}

impl DedupPlan {
    pub fn declared(&self, partition: PartitionIndex) -> usize {
        self.counts[partition.0].declared
    }
}

/// Assigns every sample to exactly one output column: the first occurrence across
/// partitions (in partition order, then column order) is primary, later occurrences
/// are shadows. Samples outside `allow` are dropped without counting as duplicates.
pub fn resolve_samples(lists: &[SampleList], allow: Option<&SampleAllowList>) -> DedupPlan {
    let mut first_seen: AHashMap<&str, (PartitionIndex, usize, &Sample)> = AHashMap::new();
    let mut keep = Vec::with_capacity(lists.len());
    let mut duplicates = Vec::new();
    let mut counts = Vec::with_capacity(lists.len());
    let mut primaries = Vec::new();

    for list in lists {
        let mut tally = SampleCounts {
            declared: list.len(),
            ..SampleCounts::default()
        };
        let mut kept = Vec::with_capacity(list.len());

        for (column, sample) in list.samples.iter().enumerate() {
            if allow.is_some_and(|a| !a.contains(&sample.id)) {
                tally.filtered += 1;
            } else if let Some(&(partition, index, original)) = first_seen.get(sample.id.as_str()) {
                tally.duplicates += 1;
                duplicates.push(DuplicatePair {
                    label: sample.label.clone(),
                    primary: (partition, index),
                    shadow: (list.partition, column),
                    records: original.record.clone().zip(sample.record.clone()),
                });
            } else {
                first_seen.insert(&sample.id, (list.partition, column, sample));
                kept.push(column);
                primaries.push(sample.clone());
            }
        }

        tally.kept = kept.len();
        keep.push(if kept.len() == list.len() {
            KeepPlan::All
        } else if kept.is_empty() {
            KeepPlan::Nothing
        } else {
            KeepPlan::Samples(kept)
        });
        info!(
            "  {}: {} samples ({} unique, {} duplicate, {} filtered)",
            list.partition, tally.declared, tally.kept, tally.duplicates, tally.filtered
        );
        counts.push(tally);
    }

    info!(
        "Resolved {} unique samples, {} duplicates",
        primaries.len(),
        duplicates.len()
    );
    DedupPlan {
        keep,
        duplicates,
        counts,
        primaries,
    }
}
