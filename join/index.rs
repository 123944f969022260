// ========================================================================================
//
//                               THE CANONICAL MARKER INDEX
//
// ========================================================================================
//
// The join walks every partition in lock-step, which only works if all partitions
// agree on one marker order. This module produces that order: either trusted from a
// user-supplied marker list, or inferred from the partitions themselves.
//
// Inference takes partition #1 as the reference order and then makes one pass over
// each further partition. A key is canonical only if every partition contains it.
// While walking partition i, the highest reference position matched so far is
// remembered; matching a key *below* that high-water mark means partition i lists it
// after keys that the reference lists after it, i.e. the pair is swapped. Swaps
// between two canonical keys cannot be joined by a single forward pass and are fatal.

use crate::error::{JoinError, OrderConflict, Result};
use crate::layout::{KeyStyle, RecordLayout};
use crate::partition::PartitionStream;
use crate::record::Record;
use crate::shared::files::read_text_lines;
use crate::types::{MarkerKey, PartitionIndex};
use ahash::AHashMap;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: MarkerKey,
    /// The label written to the merged output.
    pub label: String,
    /// The leading columns describing the marker, with `label` in the label column.
    pub descriptor: Vec<String>,
}

/// The ordered, duplicate-free set of markers the join emits. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct CanonicalIndex {
    entries: Vec<IndexEntry>,
    positions: AHashMap<MarkerKey, usize>,
}

impl CanonicalIndex {
    fn from_entries(entries: Vec<IndexEntry>) -> Self {
        let positions = entries
            .iter()
            .enumerate()
            .map(|(position, entry)| (entry.key.clone(), position))
            .collect();
        Self { entries, positions }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, key: &MarkerKey) -> Option<usize> {
        self.positions.get(key).copied()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Reads an ordered marker list. Lines starting with `#` are comments. The key
    /// columns are located with the same layout as the data records.
    pub fn read_marker_list(path: &Path, layout: &RecordLayout) -> Result<Self> {
        let source_name = path.display().to_string();
        let required = key_columns(layout);
        let mut entries = Vec::new();
        let mut seen: AHashMap<MarkerKey, u64> = AHashMap::new();

        for (number, line) in read_text_lines(path)?.into_iter().enumerate() {
            let line_number = number as u64 + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let words: Vec<String> = trimmed.split_whitespace().map(str::to_string).collect();
            if words.len() < required {
                return Err(JoinError::malformed(
                    &source_name,
                    line_number,
                    format!("expected at least {required} columns, found {}", words.len()),
                ));
            }
            let key = key_from_words(layout, &words);
            let label = words[layout.label_column].clone();
            if seen.insert(key.clone(), line_number).is_some() {
                return Err(JoinError::DuplicateMarker {
                    label,
                    line: line_number,
                });
            }
            entries.push(IndexEntry {
                key,
                label,
                descriptor: words,
            });
        }

        info!("Read {} markers from {}", entries.len(), source_name);
        Ok(Self::from_entries(entries))
    }

    /// Writes the index in the format [`CanonicalIndex::read_marker_list`] reads.
    pub fn write_marker_list<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for entry in &self.entries {
            writeln!(out, "{}", entry.descriptor.join(" "))?;
        }
        Ok(())
    }
}

fn key_columns(layout: &RecordLayout) -> usize {
    match layout.key {
        KeyStyle::Label => layout.label_column + 1,
        KeyStyle::Locus { position_column } => {
            let (a, b) = layout.allele_columns;
            [layout.label_column, position_column, a, b]
                .into_iter()
                .max()
                .unwrap_or(0)
                + 1
        }
    }
}

fn key_from_words(layout: &RecordLayout, words: &[String]) -> MarkerKey {
    match layout.key {
        KeyStyle::Label => MarkerKey::Label(words[layout.label_column].clone()),
        KeyStyle::Locus { position_column } => {
            let (a, b) = layout.allele_columns;
            MarkerKey::locus(&words[position_column], &words[a], &words[b])
        }
    }
}

/// Per-partition counts gathered while inferring the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionScan {
    pub records: u64,
    /// Records whose key was first seen in this partition and already covered by every
    /// earlier partition.
    pub matched: u64,
}

/// A key listed more than once within at least one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateMarker {
    pub descriptor: Vec<String>,
    pub partitions: BTreeSet<PartitionIndex>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub scans: Vec<PartitionScan>,
    pub duplicates: Vec<DuplicateMarker>,
    /// Keys of the reference partition missing from at least one other partition.
    pub partially_covered: usize,
    /// Order swaps involving a partially covered key; these keys are excluded anyway.
    pub ignored_conflicts: usize,
}

impl IndexReport {
    /// Writes one line per duplicated marker: its descriptor, then the names of the
    /// partitions that repeat it.
    pub fn write_duplicates<W: Write>(
        &self,
        out: &mut W,
        partition_names: &[String],
    ) -> std::io::Result<()> {
        for duplicate in &self.duplicates {
            let names: Vec<&str> = duplicate
                .partitions
                .iter()
                .filter_map(|p| partition_names.get(p.0).map(String::as_str))
                .collect();
            writeln!(out, "{} {}", duplicate.descriptor.join(" "), names.join(" "))?;
        }
        Ok(())
    }
}

struct ReferenceMarker {
    key: MarkerKey,
    descriptor: Vec<String>,
    labels: BTreeSet<String>,
    coverage: usize,
}

/// Infers the canonical index from the partitions and rewinds them afterwards.
pub fn infer_index(partitions: &mut [PartitionStream]) -> Result<(CanonicalIndex, IndexReport)> {
    let Some(first) = partitions.first() else {
        return Ok((CanonicalIndex::default(), IndexReport::default()));
    };
    let layout = *first.layout();
    let locus_keys = matches!(layout.key, KeyStyle::Locus { .. });

    let mut reference: Vec<ReferenceMarker> = Vec::new();
    let mut order: AHashMap<MarkerKey, usize> = AHashMap::new();
    let mut duplicates: BTreeMap<usize, BTreeSet<PartitionIndex>> = BTreeMap::new();
    let mut swaps: BTreeMap<(usize, usize), BTreeSet<PartitionIndex>> = BTreeMap::new();
    let mut scans = Vec::with_capacity(partitions.len());
    let mut record = Record::default();

    for (i, partition) in partitions.iter_mut().enumerate() {
        let index = partition.index();
        let mut scan = PartitionScan::default();
        let mut high_water = 0usize;

        while partition.next_record(&mut record)? {
            scan.records += 1;
            let key = record.key(&layout);

            if i == 0 {
                if let Some(&position) = order.get(&key) {
                    duplicates.entry(position).or_default().insert(index);
                    continue;
                }
                let mut labels = BTreeSet::new();
                add_labels(&mut labels, record.label(&layout), locus_keys);
                order.insert(key.clone(), reference.len());
                reference.push(ReferenceMarker {
                    key,
                    descriptor: record.leading(&layout).to_vec(),
                    labels,
                    coverage: 1,
                });
                continue;
            }

            let Some(&position) = order.get(&key) else {
                continue;
            };
            let coverage = reference[position].coverage;
            if coverage > i {
                duplicates.entry(position).or_default().insert(index);
            } else if coverage == i {
                reference[position].coverage += 1;
                add_labels(
                    &mut reference[position].labels,
                    record.label(&layout),
                    locus_keys,
                );
                let mut cursor = position;
                while cursor < high_water {
                    cursor += 1;
                    if reference[cursor].coverage > i {
                        swaps.entry((position, cursor)).or_default().insert(index);
                    }
                }
                high_water = cursor;
                scan.matched += 1;
            }
        }

        if i == 0 {
            info!("  {index}: {} markers", scan.records);
        } else {
            info!("  {index}: {} markers ({} matching)", scan.records, scan.matched);
        }
        scans.push(scan);
    }

    let total = partitions.len();
    let mut conflicts = Vec::new();
    let mut ignored_conflicts = 0;
    for ((earlier, later), partition_set) in swaps {
        let (a, b) = (&reference[earlier], &reference[later]);
        if a.coverage == total && b.coverage == total {
            let conflict = OrderConflict {
                earlier: a.key.to_string(),
                later: b.key.to_string(),
                partitions: partition_set.into_iter().collect(),
            };
            error!("Marker order swapped: {conflict}");
            conflicts.push(conflict);
        } else {
            ignored_conflicts += 1;
        }
    }
    if !conflicts.is_empty() {
        return Err(JoinError::OrderConflict(conflicts));
    }
    if ignored_conflicts > 0 {
        debug!("{ignored_conflicts} order swaps involve markers missing from some partition");
    }

    let duplicates: Vec<DuplicateMarker> = duplicates
        .into_iter()
        .map(|(position, partitions)| DuplicateMarker {
            descriptor: reference[position].descriptor.clone(),
            partitions,
        })
        .collect();
    if !duplicates.is_empty() {
        warn!(
            "{} markers are duplicated in one or more partitions",
            duplicates.len()
        );
    }

    let mut partially_covered = 0;
    let mut entries = Vec::with_capacity(reference.len());
    for marker in reference {
        if marker.coverage < total {
            partially_covered += 1;
            continue;
        }
        let label = if locus_keys {
            preferred_label(&marker.labels)
        } else {
            layout_label(&marker.descriptor, &layout)
        };
        let mut descriptor = marker.descriptor;
        descriptor[layout.label_column] = label.clone();
        entries.push(IndexEntry {
            key: marker.key,
            label,
            descriptor,
        });
    }

    for partition in partitions.iter_mut() {
        partition.rewind()?;
    }

    let index = CanonicalIndex::from_entries(entries);
    info!(
        "Inferred {} markers present in all {} partitions ({} excluded)",
        index.len(),
        total,
        partially_covered
    );
    Ok((
        index,
        IndexReport {
            scans,
            duplicates,
            partially_covered,
            ignored_conflicts,
        },
    ))
}

fn add_labels(labels: &mut BTreeSet<String>, label: &str, split_aliases: bool) {
    if split_aliases {
        labels.extend(label.split(';').filter(|l| !l.is_empty()).map(str::to_string));
    } else {
        labels.insert(label.to_string());
    }
}

fn layout_label(descriptor: &[String], layout: &RecordLayout) -> String {
    descriptor[layout.label_column].clone()
}

/// The highest `rs` number among the labels, else the greatest label.
fn preferred_label(labels: &BTreeSet<String>) -> String {
    let best_rs = labels
        .iter()
        .filter_map(|label| {
            let lower = label.to_ascii_lowercase();
            lower.strip_prefix("rs")?.parse::<u64>().ok()
        })
        .max();
    match best_rs {
        Some(number) => format!("rs{number}"),
        None => labels.iter().next_back().cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::test_support::memory_stream;

    fn beagle(index: usize, markers: &[(&str, &str, &str)]) -> PartitionStream {
        let mut text = String::from("marker alleleA alleleB s\n");
        for (label, a1, a2) in markers {
            text.push_str(&format!("{label} {a1} {a2} 1.0\n"));
        }
        memory_stream(index, RecordLayout::BEAGLE_DOSE, &text)
    }

    fn labels(index: &CanonicalIndex) -> Vec<&str> {
        index.entries().iter().map(|e| e.label.as_str()).collect()
    }

    #[test]
    fn keeps_only_markers_present_in_every_partition() {
        let mut partitions = vec![
            beagle(0, &[("m1", "A", "G"), ("m2", "C", "T"), ("m3", "A", "C")]),
            beagle(1, &[("m1", "A", "G"), ("m3", "A", "C"), ("x9", "G", "T")]),
            beagle(2, &[("m1", "A", "G"), ("m2", "C", "T"), ("m3", "C", "A")]),
        ];
        let (index, report) = infer_index(&mut partitions).expect("infer");
        assert_eq!(labels(&index), vec!["m1", "m3"]);
        assert_eq!(report.partially_covered, 1);
        assert_eq!(report.scans[1], PartitionScan { records: 3, matched: 2 });
        assert_eq!(index.position(&MarkerKey::Label("m3".into())), Some(1));

        // Streams are rewound for the join.
        let mut record = Record::default();
        assert!(partitions[1].next_record(&mut record).expect("first"));
        assert_eq!(record.fields()[0], "m1");
    }

    #[test]
    fn swapped_canonical_markers_are_fatal() {
        let mut partitions = vec![
            beagle(0, &[("m1", "A", "G"), ("m2", "C", "T")]),
            beagle(1, &[("m2", "C", "T"), ("m1", "A", "G")]),
        ];
        match infer_index(&mut partitions) {
            Err(JoinError::OrderConflict(conflicts)) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].earlier, "m1");
                assert_eq!(conflicts[0].later, "m2");
                assert_eq!(conflicts[0].partitions, vec![PartitionIndex(1)]);
            }
            other => panic!("expected an order conflict, got {:?}", other.map(|r| r.0.len())),
        }
    }

    #[test]
    fn swaps_with_partially_covered_markers_are_ignored() {
        let mut partitions = vec![
            beagle(0, &[("m1", "A", "G"), ("m2", "C", "T"), ("m3", "A", "C")]),
            beagle(1, &[("m2", "C", "T"), ("m1", "A", "G"), ("m3", "A", "C")]),
            beagle(2, &[("m1", "A", "G"), ("m3", "A", "C")]),
        ];
        let (index, report) = infer_index(&mut partitions).expect("infer");
        assert_eq!(labels(&index), vec!["m1", "m3"]);
        assert_eq!(report.ignored_conflicts, 1);
    }

    #[test]
    fn repeated_markers_are_reported_once_per_partition() {
        let mut partitions = vec![
            beagle(0, &[("m1", "A", "G"), ("m1", "A", "G"), ("m2", "C", "T")]),
            beagle(1, &[("m1", "A", "G"), ("m2", "C", "T"), ("m2", "C", "T")]),
        ];
        let (index, report) = infer_index(&mut partitions).expect("infer");
        assert_eq!(labels(&index), vec!["m1", "m2"]);
        assert_eq!(report.duplicates.len(), 2);
        assert_eq!(
            report.duplicates[0].partitions,
            BTreeSet::from([PartitionIndex(0)])
        );
        assert_eq!(
            report.duplicates[1].partitions,
            BTreeSet::from([PartitionIndex(1)])
        );

        let mut out = Vec::new();
        report
            .write_duplicates(&mut out, &["a".to_string(), "b".to_string()])
            .expect("write");
        assert_eq!(String::from_utf8(out).expect("utf8"), "m1 A G a\nm2 C T b\n");
    }

    #[test]
    fn locus_keys_take_the_highest_rs_label() {
        let first = "22 rs100;chr22:5 5000 A G 1 0 0\n22 kgp7 6000 C T 0 1 0\n";
        let second = "22 rs20 5000 g a 0 0 1\n22 kgp9 6000 C T 0 1 0\n";
        let mut partitions = vec![
            memory_stream(0, RecordLayout::IMPUTE2, first),
            memory_stream(1, RecordLayout::IMPUTE2, second),
        ];
        let (index, _) = infer_index(&mut partitions).expect("infer");
        assert_eq!(labels(&index), vec!["rs100", "kgp9"]);
        assert_eq!(index.entries()[0].descriptor, ["22", "rs100", "5000", "A", "G"]);
    }

    #[test]
    fn marker_lists_round_trip_and_reject_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chr22.markers");
        std::fs::write(
            &path,
            "# chr label pos a1 a2\n22 rs1 100 A G\n22 rs2 200 C T\n",
        )
        .expect("write markers");
        let index =
            CanonicalIndex::read_marker_list(&path, &RecordLayout::IMPUTE2).expect("read");
        assert_eq!(labels(&index), vec!["rs1", "rs2"]);
        assert_eq!(index.position(&MarkerKey::locus("100", "g", "a")), Some(0));

        let mut written = Vec::new();
        index.write_marker_list(&mut written).expect("write");
        assert_eq!(
            String::from_utf8(written).expect("utf8"),
            "22 rs1 100 A G\n22 rs2 200 C T\n"
        );

        std::fs::write(&path, "m1 100 A G\nm2 200 C T\nm1 300 A C\n").expect("rewrite");
        match CanonicalIndex::read_marker_list(&path, &RecordLayout::BEAGLE_DOSE) {
            Err(JoinError::DuplicateMarker { label, line }) => {
                assert_eq!(label, "m1");
                assert_eq!(line, 3);
            }
            other => panic!("expected a duplicate marker error, got {:?}", other.map(|i| i.len())),
        }
    }
}
