use crate::error::{JoinError, Result};
use crate::layout::{RecordLayout, SampleNaming};
use crate::shared::files::read_text_lines;
use crate::types::PartitionIndex;
use std::path::Path;

const SAMPLE_FILE_COLUMNS: &str = "ID_1 ID_2 missing";
const SAMPLE_FILE_TYPES: &str = "0 0 0";

/// A sample column as declared by one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// The identity used for deduplication and filtering.
    pub id: String,
    /// The name written to output headers.
    pub label: String,
    /// The sample's full record when it came from an IMPUTE2 `.sample` file.
    pub record: Option<String>,
}

impl Sample {
    fn named(label: &str) -> Self {
        Self {
            id: label.to_string(),
            label: label.to_string(),
            record: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SampleList {
    pub partition: PartitionIndex,
    pub source_name: String,
    pub samples: Vec<Sample>,
}

impl SampleList {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// The two header records of an IMPUTE2 `.sample` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFileHeader {
    pub columns: String,
    pub types: String,
}

/// Builds a sample identity from the leading id words of a record.
pub fn sample_identity(words: &[&str], naming: SampleNaming) -> Option<String> {
    if words.len() < naming.id_words {
        return None;
    }
    let joined = words[..naming.id_words].join(" ");
    Some(if naming.case_insensitive {
        joined.to_lowercase()
    } else {
        joined
    })
}

/// Reads the sample labels from the header row of a Beagle result stream, where each
/// label is repeated once per value column.
pub fn samples_from_data_header(
    partition: PartitionIndex,
    source_name: &str,
    header: &str,
    layout: &RecordLayout,
) -> Result<SampleList> {
    let words: Vec<&str> = header.split_whitespace().collect();
    let width = layout.values.width();
    if words.len() < layout.leading_columns || (words.len() - layout.leading_columns) % width != 0
    {
        return Err(JoinError::malformed(
            source_name,
            1,
            format!(
                "header has {} columns, which is not {} plus a multiple of {width}",
                words.len(),
                layout.leading_columns
            ),
        ));
    }
    let mut samples = Vec::new();
    for group in words[layout.leading_columns..].chunks(width) {
        if let Some(stray) = group.iter().find(|label| **label != group[0]) {
            return Err(JoinError::malformed(
                source_name,
                1,
                format!("column group of sample {} also names {stray}", group[0]),
            ));
        }
        samples.push(Sample::named(group[0]));
    }
    Ok(SampleList {
        partition,
        source_name: source_name.to_string(),
        samples,
    })
}

/// Reads the sample labels from the first row of a Beagle `.bgl` file: two leading
/// columns, then every sample's label twice (one per haplotype).
pub fn read_bgl_header(partition: PartitionIndex, path: &Path) -> Result<SampleList> {
    let source_name = path.display().to_string();
    let lines = read_text_lines(path)?;
    let header = lines
        .first()
        .ok_or_else(|| JoinError::malformed(&source_name, 1, "file has no header row"))?;
    let samples = header
        .split_whitespace()
        .skip(2)
        .step_by(2)
        .map(Sample::named)
        .collect();
    Ok(SampleList {
        partition,
        source_name,
        samples,
    })
}

/// Reads an IMPUTE2 `.sample` file. Samples are identified by their case-folded
/// `ID_1 ID_2` pair.
pub fn read_sample_file(
    partition: PartitionIndex,
    path: &Path,
) -> Result<(SampleFileHeader, SampleList)> {
    let source_name = path.display().to_string();
    let lines = read_text_lines(path)?;
    let columns = lines.first().map(|l| l.trim_end()).unwrap_or_default();
    if !columns.starts_with(SAMPLE_FILE_COLUMNS) {
        return Err(JoinError::malformed(
            &source_name,
            1,
            format!("expected a header starting with '{SAMPLE_FILE_COLUMNS}'"),
        ));
    }
    let types = lines.get(1).map(|l| l.trim_end()).unwrap_or_default();
    if !types.starts_with(SAMPLE_FILE_TYPES) {
        return Err(JoinError::malformed(
            &source_name,
            2,
            format!("expected a type row starting with '{SAMPLE_FILE_TYPES}'"),
        ));
    }

    let naming = SampleNaming {
        id_words: 2,
        case_insensitive: true,
    };
    let mut samples = Vec::new();
    for (offset, line) in lines.iter().enumerate().skip(2) {
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let id = sample_identity(&words, naming).ok_or_else(|| {
            JoinError::malformed(&source_name, offset as u64 + 1, "expected ID_1 and ID_2")
        })?;
        samples.push(Sample {
            id,
            label: words[..2].join(" "),
            record: Some(words.join(" ")),
        });
    }

    Ok((
        SampleFileHeader {
            columns: columns.to_string(),
            types: types.to_string(),
        },
        SampleList {
            partition,
            source_name,
            samples,
        },
    ))
}

/// Reads every partition's `.sample` file and checks that their headers agree.
pub fn read_sample_files(paths: &[&Path]) -> Result<(Option<SampleFileHeader>, Vec<SampleList>)> {
    let mut shared: Option<SampleFileHeader> = None;
    let mut lists = Vec::with_capacity(paths.len());
    for (i, path) in paths.iter().enumerate() {
        let (header, list) = read_sample_file(PartitionIndex(i), path)?;
        match &shared {
            None => shared = Some(header),
            Some(first) if *first != header => {
                return Err(JoinError::SampleHeaderMismatch {
                    source_name: list.source_name,
                });
            }
            Some(_) => {}
        }
        lists.push(list);
    }
    Ok((shared, lists))
}
