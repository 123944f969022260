// ========================================================================================
//
//                                THE MERGE-JOIN ENGINE
//
// ========================================================================================
//
// Walks the canonical index once, in order, and keeps one cursor per partition. For
// each canonical marker every cursor first skips records the index does not know (or
// markers it has already passed), then either all cursors agree and a merged row is
// written, or the marker is incomplete and only the cursors sitting on it move on.
//
// A single coordinator owns every cursor and counter; nothing here is shared between
// threads. Prefetching, when enabled, happens inside the partitions' line sources.

use crate::dedup::{DedupPlan, KeepPlan};
use crate::diagnostics::{DiagnosticStatus, Diagnostics};
use crate::error::{JoinError, Result};
use crate::index::CanonicalIndex;
use crate::layout::RecordLayout;
use crate::partition::PartitionStream;
use crate::pipeline::create_progress_bar;
use crate::record::Record;
use crate::types::{AlleleOrientation, AllelePair, MarkerKey, PartitionIndex};
use ahash::AHashSet;
use indicatif::ProgressBar;
use itertools::Itertools;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::io::Write;

/// Per-partition counters of one join.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionStats {
    /// Records passed over because their key was unknown or already behind.
    pub skipped: u64,
    /// Joined markers whose alleles this partition listed in reverse order.
    pub reversed: u64,
    /// Records left after the last canonical marker.
    pub leftover: u64,
}

#[derive(Debug, Clone, Default)]
pub struct JoinSummary {
    pub kind: &'static str,
    pub canonical: usize,
    pub joined: u64,
    /// Labels of canonical markers that were missing from some partition.
    pub incomplete: Vec<String>,
    /// Distinct keys that were not in the canonical index.
    pub unmatched: u64,
    pub partitions: Vec<PartitionStats>,
}

impl JoinSummary {
    /// Logs the non-fatal irregularities of the run, once per partition.
    pub fn report(&self) {
        for (i, stats) in self.partitions.iter().enumerate() {
            let partition = PartitionIndex(i);
            if stats.skipped > 0 {
                warn!(
                    "{} partition {partition} had {} extra records skipped during processing",
                    self.kind, stats.skipped
                );
            }
            if stats.reversed > 0 {
                warn!(
                    "{} partition {partition} had {} markers with swapped allele order",
                    self.kind, stats.reversed
                );
            }
            if stats.leftover > 0 {
                warn!(
                    "{} partition {partition} has {} leftover records",
                    self.kind, stats.leftover
                );
            }
        }
        if self.unmatched > 0 {
            warn!(
                "{}: {} markers did not match the canonical index",
                self.kind, self.unmatched
            );
        }
        info!(
            "{}: joined {} markers ({} matched, {} incomplete)",
            self.kind,
            self.canonical,
            self.joined,
            self.incomplete.len()
        );
    }
}

/// Where a join writes. The duplicate stream and the diagnostics log are optional.
pub struct JoinOutputs<'a> {
    pub merged: &'a mut dyn Write,
    pub duplicates: Option<&'a mut dyn Write>,
    pub diagnostics: Option<&'a mut dyn Write>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Positioned,
    Exhausted,
}

struct Cursor<'p> {
    stream: &'p mut PartitionStream,
    record: Record,
    state: CursorState,
    /// The canonical position of the current record's key, if it has one.
    position: Option<usize>,
    stats: PartitionStats,
}

impl<'p> Cursor<'p> {
    fn open(stream: &'p mut PartitionStream, index: &CanonicalIndex) -> Result<Self> {
        let mut cursor = Self {
            stream,
            record: Record::default(),
            state: CursorState::Positioned,
            position: None,
            stats: PartitionStats::default(),
        };
        cursor.advance(index)?;
        Ok(cursor)
    }

    fn advance(&mut self, index: &CanonicalIndex) -> Result<()> {
        if self.stream.next_record(&mut self.record)? {
            let layout = *self.stream.layout();
            self.state = CursorState::Positioned;
            self.position = index.position(&self.record.key(&layout));
        } else {
            self.state = CursorState::Exhausted;
            self.position = None;
        }
        Ok(())
    }

    fn is_at(&self, position: usize) -> bool {
        self.state == CursorState::Positioned && self.position == Some(position)
    }

    /// True while the current record can never match `position` or a later marker.
    fn is_behind(&self, position: usize) -> bool {
        self.state == CursorState::Positioned && self.position.is_none_or(|p| p < position)
    }
}

/// An N-way merge-join of partitions sharing one [`RecordLayout`].
pub struct MergeJoin<'a> {
    layout: RecordLayout,
    index: &'a CanonicalIndex,
    plan: &'a DedupPlan,
    progress: bool,
}

impl<'a> MergeJoin<'a> {
    pub fn new(layout: RecordLayout, index: &'a CanonicalIndex, plan: &'a DedupPlan) -> Self {
        Self {
            layout,
            index,
            plan,
            progress: false,
        }
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Joins the partitions. Each partition must be positioned at its first data
    /// record; on success every partition has been read to the end.
    pub fn run(
        &self,
        partitions: &mut [PartitionStream],
        outputs: JoinOutputs<'_>,
    ) -> Result<JoinSummary> {
        let layout = self.layout;
        let JoinOutputs {
            merged,
            mut duplicates,
            diagnostics,
        } = outputs;
        let mut diagnostics = Diagnostics::new(layout.name, diagnostics);
        if self.plan.duplicates.is_empty() {
            duplicates = None;
        }

        if partitions.is_empty() {
            return Err(JoinError::Config("the join needs at least one partition".into()));
        }
        if partitions.len() != self.plan.keep.len()
            || partitions.iter().any(|p| p.index().0 >= self.plan.keep.len())
        {
            return Err(JoinError::Config(format!(
                "the sample plan covers {} partitions but {} were given",
                self.plan.keep.len(),
                partitions.len()
            )));
        }

        for partition in partitions.iter_mut() {
            let declared = self.plan.declared(partition.index());
            partition.expect_fields(layout.expected_fields(declared));
        }
        let mut cursors = partitions
            .iter_mut()
            .map(|stream| Cursor::open(stream, self.index))
            .collect::<Result<Vec<_>>>()?;

        let bar = if self.progress {
            create_progress_bar(self.index.len() as u64, &format!("Joining {}", layout.name))
        } else {
            ProgressBar::hidden()
        };

        let mut summary = JoinSummary {
            kind: layout.name,
            canonical: self.index.len(),
            ..JoinSummary::default()
        };
        let mut unmatched: AHashSet<MarkerKey> = AHashSet::new();
        let mut row = String::with_capacity(1 << 16);

        for (position, entry) in self.index.entries().iter().enumerate() {
            bar.inc(1);

            for cursor in cursors.iter_mut() {
                while cursor.is_behind(position) {
                    if cursor.position.is_none() {
                        let key = cursor.record.key(&layout);
                        if !unmatched.contains(&key) {
                            diagnostics.record(
                                &cursor.record.label(&layout),
                                DiagnosticStatus::Unmatched,
                                &cursor.stream.index(),
                            )?;
                            unmatched.insert(key);
                        }
                    }
                    cursor.stats.skipped += 1;
                    cursor.advance(self.index)?;
                }
            }

            if !cursors.iter().all(|c| c.is_at(position)) {
                let missing = cursors
                    .iter()
                    .filter(|c| !c.is_at(position))
                    .map(|c| c.stream.index())
                    .join(",");
                diagnostics.record(&entry.label, DiagnosticStatus::Incomplete, &missing)?;
                summary.incomplete.push(entry.label.clone());
                for cursor in cursors.iter_mut().filter(|c| c.is_at(position)) {
                    cursor.advance(self.index)?;
                }
                continue;
            }

            for cursor in &cursors {
                cursor.stream.parser().validate(&cursor.record)?;
            }

            let (first, second) = cursors[0].record.alleles(&layout);
            let reference = AllelePair::new(first, second);
            for cursor in cursors.iter_mut().skip(1) {
                let partition = cursor.stream.index();
                let (a1, a2) = cursor.record.alleles(&layout);
                match reference.orient(a1, a2) {
                    AlleleOrientation::Same => {}
                    AlleleOrientation::Reversed => {
                        cursor.record.reverse_alleles(&layout, partition)?;
                        cursor.stats.reversed += 1;
                        debug!(
                            "Swapped allele order for {} partition {partition} marker {}",
                            layout.name, entry.label
                        );
                        diagnostics.record(&entry.label, DiagnosticStatus::Reversed, &partition)?;
                    }
                    AlleleOrientation::Mismatch => {
                        return Err(JoinError::AlleleMismatch {
                            partition,
                            label: entry.label.clone(),
                            expected: reference.to_string(),
                            found: format!("{a1}/{a2}"),
                        });
                    }
                }
            }

            let aliases: BTreeSet<&str> = cursors
                .iter()
                .map(|c| c.record.label(&layout))
                .filter(|label| *label != entry.label)
                .collect();
            if !aliases.is_empty() {
                diagnostics.record(
                    &entry.label,
                    DiagnosticStatus::Alias,
                    &aliases.iter().join(";"),
                )?;
            }

            row.clear();
            self.push_leading(&mut row, &cursors[0].record, &entry.label);
            for cursor in &cursors {
                match &self.plan.keep[cursor.stream.index().0] {
                    KeepPlan::All => push_fields(&mut row, cursor.record.values(&layout)),
                    KeepPlan::Nothing => {}
                    KeepPlan::Samples(samples) => {
                        for &sample in samples {
                            push_fields(&mut row, cursor.record.value_group(&layout, sample));
                        }
                    }
                }
            }
            row.push('\n');
            merged.write_all(row.as_bytes())?;

            if let Some(out) = duplicates.as_mut() {
                row.clear();
                self.push_leading(&mut row, &cursors[0].record, &entry.label);
                for pair in &self.plan.duplicates {
                    for (partition, sample) in [pair.primary, pair.shadow] {
                        let record = &cursors[partition.0].record;
                        push_fields(&mut row, record.value_group(&layout, sample));
                    }
                }
                row.push('\n');
                out.write_all(row.as_bytes())?;
            }

            summary.joined += 1;
            for cursor in cursors.iter_mut() {
                cursor.advance(self.index)?;
            }
        }
        bar.finish_and_clear();

        for cursor in cursors.iter_mut() {
            let pending = u64::from(cursor.state == CursorState::Positioned);
            cursor.stats.leftover = pending + cursor.stream.drain()?;
        }
        summary.unmatched = unmatched.len() as u64;
        summary.partitions = cursors.iter().map(|c| c.stats).collect();
        Ok(summary)
    }

    fn push_leading(&self, row: &mut String, record: &Record, label: &str) {
        for (column, field) in record.leading(&self.layout).iter().enumerate() {
            if column > 0 {
                row.push(' ');
            }
            if column == self.layout.label_column {
                row.push_str(label);
            } else {
                row.push_str(field);
            }
        }
    }
}

fn push_fields(row: &mut String, fields: &[String]) {
    for field in fields {
        row.push(' ');
        row.push_str(field);
    }
}
