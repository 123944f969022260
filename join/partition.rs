use crate::error::{JoinError, Result};
use crate::layout::RecordLayout;
use crate::record::{Record, RecordParser};
use crate::shared::files::TextSource;
use crate::types::PartitionIndex;

/// One input partition: a line stream positioned after its header, plus the parser
/// that turns its lines into records.
pub struct PartitionStream {
    index: PartitionIndex,
    source: Box<dyn TextSource>,
    parser: RecordParser,
    header: Option<String>,
    line: u64,
}

impl PartitionStream {
    /// Wraps `source` and consumes the layout's header records.
    pub fn open(
        index: PartitionIndex,
        source: Box<dyn TextSource>,
        layout: RecordLayout,
    ) -> Result<Self> {
        let parser = RecordParser::new(index, layout, source.describe());
        let mut stream = Self {
            index,
            source,
            parser,
            header: None,
            line: 0,
        };
        stream.header = stream.skip_header()?;
        Ok(stream)
    }

    pub fn index(&self) -> PartitionIndex {
        self.index
    }

    pub fn describe(&self) -> &str {
        self.parser.source_name()
    }

    pub fn layout(&self) -> &RecordLayout {
        self.parser.layout()
    }

    pub fn parser(&self) -> &RecordParser {
        &self.parser
    }

    /// The first header record, if the layout has one.
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    pub fn expect_fields(&mut self, expected: usize) {
        self.parser.expect_fields(expected);
    }

    /// Reads the next non-blank data record into `record`. Returns `false` at the end
    /// of the stream.
    pub fn next_record(&mut self, record: &mut Record) -> Result<bool> {
        loop {
            let Some(raw) = self.source.next_line()? else {
                return Ok(false);
            };
            self.line += 1;
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.parser.parse_into(raw, self.line, record)?;
            return Ok(true);
        }
    }

    /// Counts the remaining records without parsing them.
    pub fn drain(&mut self) -> Result<u64> {
        let mut remaining = 0;
        while let Some(raw) = self.source.next_line()? {
            self.line += 1;
            if !raw.iter().all(u8::is_ascii_whitespace) {
                remaining += 1;
            }
        }
        Ok(remaining)
    }

    /// Restarts the partition at its first data record.
    pub fn rewind(&mut self) -> Result<()> {
        self.source.rewind()?;
        self.line = 0;
        self.skip_header()?;
        Ok(())
    }

    fn skip_header(&mut self) -> Result<Option<String>> {
        let mut first = None;
        for _ in 0..self.parser.layout().header_lines {
            let Some(raw) = self.source.next_line()? else {
                return Err(JoinError::malformed(
                    self.parser.source_name(),
                    self.line + 1,
                    "stream ended before its header row",
                ));
            };
            self.line += 1;
            if first.is_none() {
                let text = std::str::from_utf8(raw).map_err(|_| {
                    JoinError::malformed(
                        self.parser.source_name(),
                        self.line,
                        "header is not valid UTF-8",
                    )
                })?;
                first = Some(text.to_string());
            }
        }
        Ok(first)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::shared::files::{ByteSource, DecodingTextSource, InMemory};
    use std::sync::Arc;

    pub fn memory_stream(
        index: usize,
        layout: RecordLayout,
        text: &str,
    ) -> PartitionStream {
        let bytes: Arc<dyn ByteSource> = Arc::new(InMemory::new(
            format!("partition{}", index + 1),
            text.as_bytes().to_vec(),
        ));
        let source = DecodingTextSource::new(bytes, 64).expect("open memory source");
        PartitionStream::open(PartitionIndex(index), Box::new(source), layout)
            .expect("open partition")
    }
}
