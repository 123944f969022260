use crate::pipeline::PipelineError;
use flate2::bufread::{MultiGzDecoder, ZlibDecoder};
use log::debug;
use memchr::memmem;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The number of decoded bytes requested from the underlying reader per refill.
pub const DEFAULT_CHUNK_BYTES: usize = 1 << 20;

const PEEK_BUFFER_BYTES: usize = 64 * 1024;

/// A forward-only sequence of delimited text records.
///
/// A returned slice borrows the source's internal buffer and stays valid only until
/// the next call. `Ok(None)` marks the end of the stream.
pub trait TextSource: Send {
    fn next_line<'a>(&'a mut self) -> Result<Option<&'a [u8]>, PipelineError>;

    /// Restarts the stream from its first byte.
    fn rewind(&mut self) -> Result<(), PipelineError>;

    /// A human-readable name used in diagnostics.
    fn describe(&self) -> &str;
}

/// A restartable raw byte source. Every call to `open` yields a fresh reader that
/// starts at the first byte.
pub trait ByteSource: Send + Sync {
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;
    fn describe(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct LocalFile {
    path: PathBuf,
}

impl LocalFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl ByteSource for LocalFile {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Bytes held in memory, shared between reopenings.
#[derive(Debug, Clone)]
pub struct InMemory {
    label: String,
    bytes: Arc<[u8]>,
}

impl InMemory {
    pub fn new(label: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            label: label.into(),
            bytes: bytes.into(),
        }
    }
}

impl ByteSource for InMemory {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(io::Cursor::new(Arc::clone(&self.bytes))))
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// The container detected from the leading bytes of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Plain,
    Gzip,
    Zlib,
}

impl Compression {
    pub fn detect(lead: &[u8]) -> Self {
        match lead {
            [a, b, ..] if is_gzip_magic(&[*a, *b]) => Compression::Gzip,
            [a, b, rest @ ..] if is_zlib_header(*a, *b) && is_deflate_start(rest) => {
                Compression::Zlib
            }
            _ => Compression::Plain,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Plain => "plain",
            Compression::Gzip => "gzip",
            Compression::Zlib => "zlib",
        };
        f.write_str(name)
    }
}

fn is_gzip_magic(magic: &[u8; 2]) -> bool {
    magic == &[0x1F, 0x8B]
}

// Only the default 32 KiB window without a preset dictionary. Two bytes alone are
// ambiguous ("x^" is both a header and text), so the first block is checked too.
fn is_zlib_header(cmf: u8, flg: u8) -> bool {
    cmf == 0x78 && flg & 0x20 == 0 && ((u16::from(cmf) << 8) | u16::from(flg)) % 31 == 0
}

fn is_deflate_start(block: &[u8]) -> bool {
    match block {
        [] => false,
        [first, ..] if (*first >> 1) & 0b11 == 0b11 => false,
        [first, rest @ ..] if (*first >> 1) & 0b11 == 0 => match rest {
            [l0, l1, n0, n1, ..] => {
                u16::from_le_bytes([*l0, *l1]) == !u16::from_le_bytes([*n0, *n1])
            }
            _ => false,
        },
        _ => true,
    }
}

/// Splits a possibly compressed byte stream into records.
///
/// Reads fixed-size chunks and keeps only the unterminated tail between refills, so
/// memory stays proportional to the chunk size plus the longest record. A delimiter
/// that straddles two chunks is still found because the search resumes
/// `delimiter.len() - 1` bytes before the end of the previous chunk.
pub struct DecodingTextSource {
    source: Arc<dyn ByteSource>,
    description: String,
    reader: Box<dyn Read + Send>,
    compression: Compression,
    delimiter: Vec<u8>,
    finder: memmem::Finder<'static>,
    chunk_bytes: usize,
    pending: Vec<u8>,
    cursor: usize,
    scan_from: usize,
    eof: bool,
}

impl DecodingTextSource {
    pub fn new(source: Arc<dyn ByteSource>, chunk_bytes: usize) -> Result<Self, PipelineError> {
        Self::with_delimiter(source, b"\n", chunk_bytes)
    }

    pub fn with_delimiter(
        source: Arc<dyn ByteSource>,
        delimiter: &[u8],
        chunk_bytes: usize,
    ) -> Result<Self, PipelineError> {
        let description = source.describe();
        if delimiter.is_empty() {
            return Err(PipelineError::Io(format!(
                "Empty record delimiter for {description}"
            )));
        }
        if chunk_bytes == 0 {
            return Err(PipelineError::Io(format!(
                "Zero-sized read chunk for {description}"
            )));
        }
        let (reader, compression) = open_decoder(source.as_ref(), &description)?;
        debug!("Opened {description} ({compression})");
        Ok(Self {
            source,
            description,
            reader,
            compression,
            delimiter: delimiter.to_vec(),
            finder: memmem::Finder::new(delimiter).into_owned(),
            chunk_bytes,
            pending: Vec::with_capacity(chunk_bytes),
            cursor: 0,
            scan_from: 0,
            eof: false,
        })
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    fn fill(&mut self) -> Result<(), PipelineError> {
        if self.cursor > 0 {
            self.pending.drain(..self.cursor);
            self.scan_from -= self.cursor;
            self.cursor = 0;
        }

        let filled = self.pending.len();
        self.pending.resize(filled + self.chunk_bytes, 0);
        let read = loop {
            match self.reader.read(&mut self.pending[filled..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.pending.truncate(filled);
                    return Err(PipelineError::Io(format!(
                        "Error reading {}: {e}",
                        self.description
                    )));
                }
            }
        };
        self.pending.truncate(filled + read);
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }

    fn record(&self, start: usize, end: usize) -> &[u8] {
        let mut slice = &self.pending[start..end];
        if self.delimiter == b"\n" && slice.last() == Some(&b'\r') {
            slice = &slice[..slice.len() - 1];
        }
        slice
    }
}

impl TextSource for DecodingTextSource {
    fn next_line<'a>(&'a mut self) -> Result<Option<&'a [u8]>, PipelineError> {
        loop {
            let window = self.scan_from.max(self.cursor);
            if let Some(rel_pos) = self.finder.find(&self.pending[window..]) {
                let start = self.cursor;
                let end = window + rel_pos;
                self.cursor = end + self.delimiter.len();
                self.scan_from = self.cursor;
                return Ok(Some(self.record(start, end)));
            }

            if self.eof {
                if self.cursor >= self.pending.len() {
                    return Ok(None);
                }
                let start = self.cursor;
                let end = self.pending.len();
                self.cursor = end;
                self.scan_from = end;
                return Ok(Some(self.record(start, end)));
            }

            self.scan_from = self
                .pending
                .len()
                .saturating_sub(self.delimiter.len() - 1)
                .max(self.cursor);
            self.fill()?;
        }
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        let (reader, compression) = open_decoder(self.source.as_ref(), &self.description)?;
        self.reader = reader;
        self.compression = compression;
        self.pending.clear();
        self.cursor = 0;
        self.scan_from = 0;
        self.eof = false;
        Ok(())
    }

    fn describe(&self) -> &str {
        &self.description
    }
}

fn open_decoder(
    source: &dyn ByteSource,
    description: &str,
) -> Result<(Box<dyn Read + Send>, Compression), PipelineError> {
    let raw = source
        .open()
        .map_err(|e| PipelineError::Io(format!("Opening {description}: {e}")))?;
    let mut buffered = BufReader::with_capacity(PEEK_BUFFER_BYTES, raw);
    let lead = buffered
        .fill_buf()
        .map_err(|e| PipelineError::Io(format!("Error reading {description}: {e}")))?;
    let compression = Compression::detect(lead);
    let reader: Box<dyn Read + Send> = match compression {
        Compression::Gzip => Box::new(MultiGzDecoder::new(buffered)),
        Compression::Zlib => Box::new(ZlibDecoder::new(buffered)),
        Compression::Plain => Box::new(buffered),
    };
    Ok((reader, compression))
}

/// Opens a local file as a newline-delimited record stream, decompressing on the fly.
pub fn open_text_source(
    path: &Path,
    chunk_bytes: usize,
) -> Result<Box<dyn TextSource>, PipelineError> {
    let source: Arc<dyn ByteSource> = Arc::new(LocalFile::new(path));
    Ok(Box::new(DecodingTextSource::new(source, chunk_bytes)?))
}

/// Reads every record of a small file into owned strings.
pub fn read_text_lines(path: &Path) -> Result<Vec<String>, PipelineError> {
    let mut source = open_text_source(path, DEFAULT_CHUNK_BYTES)?;
    let mut lines = Vec::new();
    while let Some(line) = source.next_line()? {
        let text = std::str::from_utf8(line).map_err(|_| {
            PipelineError::Io(format!(
                "Invalid UTF-8 on line {} of {}",
                lines.len() + 1,
                path.display()
            ))
        })?;
        lines.push(text.to_string());
    }
    Ok(lines)
}
