use crate::error::{JoinError, Result};
use crate::layout::{KeyStyle, RecordLayout, ValueLayout};
use crate::types::{MarkerKey, PartitionIndex};
use std::fmt::Write as _;

/// One whitespace-split data record.
///
/// The field buffers are reused between records, so a long-lived `Record` per
/// partition performs no allocation in the steady state.
#[derive(Debug, Default, Clone)]
pub struct Record {
    line: u64,
    fields: Vec<String>,
    len: usize,
}

impl Record {
    pub fn line_number(&self) -> u64 {
        self.line
    }

    pub fn fields(&self) -> &[String] {
        &self.fields[..self.len]
    }

    pub fn label(&self, layout: &RecordLayout) -> &str {
        &self.fields[layout.label_column]
    }

    pub fn alleles(&self, layout: &RecordLayout) -> (&str, &str) {
        let (a, b) = layout.allele_columns;
        (&self.fields[a], &self.fields[b])
    }

    pub fn key(&self, layout: &RecordLayout) -> MarkerKey {
        match layout.key {
            KeyStyle::Label => MarkerKey::Label(self.label(layout).to_string()),
            KeyStyle::Locus { position_column } => {
                let (a1, a2) = self.alleles(layout);
                MarkerKey::locus(&self.fields[position_column], a1, a2)
            }
        }
    }

    pub fn leading(&self, layout: &RecordLayout) -> &[String] {
        &self.fields[..layout.leading_columns]
    }

    /// The value group of the `sample`-th sample.
    pub fn value_group(&self, layout: &RecordLayout, sample: usize) -> &[String] {
        let start = layout.value_offset(sample);
        &self.fields[start..start + layout.values.width()]
    }

    pub fn values(&self, layout: &RecordLayout) -> &[String] {
        &self.fields[layout.leading_columns..self.len]
    }

    /// Rewrites the record as if its two alleles had been listed the other way round.
    ///
    /// Triplets swap their first and third probability. Dosages count the other
    /// allele, so each `v` becomes `2 - v`, printed with six decimals.
    pub fn reverse_alleles(
        &mut self,
        layout: &RecordLayout,
        partition: PartitionIndex,
    ) -> Result<()> {
        let (a, b) = layout.allele_columns;
        self.fields.swap(a, b);

        match layout.values {
            ValueLayout::Triplet => {
                let mut offset = layout.leading_columns;
                while offset + 2 < self.len {
                    self.fields.swap(offset, offset + 2);
                    offset += 3;
                }
            }
            ValueLayout::Dosage => {
                let mut scratch = String::with_capacity(16);
                for index in layout.leading_columns..self.len {
                    let value: f64 = self.fields[index].parse().map_err(|_| {
                        JoinError::InvalidValue {
                            partition,
                            line: self.line,
                            label: self.fields[layout.label_column].clone(),
                            value: self.fields[index].clone(),
                        }
                    })?;
                    scratch.clear();
                    let _ = write!(scratch, "{:.6}", 2.0 - value);
                    std::mem::swap(&mut self.fields[index], &mut scratch);
                }
            }
        }
        Ok(())
    }
}

/// Splits raw records of one partition and checks their width.
#[derive(Debug, Clone)]
pub struct RecordParser {
    partition: PartitionIndex,
    layout: RecordLayout,
    expected: Option<usize>,
    source_name: String,
}

impl RecordParser {
    pub fn new(partition: PartitionIndex, layout: RecordLayout, source_name: &str) -> Self {
        Self {
            partition,
            layout,
            expected: None,
            source_name: source_name.to_string(),
        }
    }

    /// Sets the exact field count every data record must have.
    pub fn expect_fields(&mut self, expected: usize) {
        self.expected = Some(expected);
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Splits `raw` on whitespace into `record`. Only the leading key columns are
    /// required here; the full width is checked by [`RecordParser::validate`].
    pub fn parse_into(&self, raw: &[u8], line: u64, record: &mut Record) -> Result<()> {
        let text = std::str::from_utf8(raw).map_err(|_| {
            JoinError::malformed(&self.source_name, line, "record is not valid UTF-8")
        })?;

        let mut count = 0;
        for word in text.split_ascii_whitespace() {
            if count < record.fields.len() {
                let slot = &mut record.fields[count];
                slot.clear();
                slot.push_str(word);
            } else {
                record.fields.push(word.to_string());
            }
            count += 1;
        }
        record.len = count;
        record.line = line;

        if count < self.layout.leading_columns {
            return Err(self.mismatch(record, self.layout.leading_columns));
        }
        Ok(())
    }

    pub fn validate(&self, record: &Record) -> Result<()> {
        match self.expected {
            Some(expected) if record.len != expected => Err(self.mismatch(record, expected)),
            _ => Ok(()),
        }
    }

    fn mismatch(&self, record: &Record, minimum: usize) -> JoinError {
        JoinError::SchemaMismatch {
            partition: self.partition,
            source_name: self.source_name.clone(),
            line: record.line,
            expected: self.expected.unwrap_or(minimum),
            found: record.len,
        }
    }
}
