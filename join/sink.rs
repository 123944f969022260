use crate::dedup::DedupPlan;
use crate::layout::RecordLayout;
use crate::samples::{Sample, SampleFileHeader};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

const SINK_BUFFER_BYTES: usize = 1 << 20;

/// The output path for `prefix` plus `extension`, with `.gz` appended when the
/// stream is compressed.
pub fn output_path(prefix: &Path, extension: &str, compression_level: u32) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(".");
    name.push(extension);
    if compression_level > 0 {
        name.push(".gz");
    }
    PathBuf::from(name)
}

fn suffixed_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn partial_path(path: &Path) -> PathBuf {
    suffixed_path(path, ".partial")
}

fn previous_path(path: &Path) -> PathBuf {
    suffixed_path(path, ".previous")
}

enum SinkWriter {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Plain(w) => w.write(buf),
            SinkWriter::Gzip(w) => w.write(buf),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            SinkWriter::Plain(w) => w.write_all(buf),
            SinkWriter::Gzip(w) => w.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Plain(w) => w.flush(),
            SinkWriter::Gzip(w) => w.flush(),
        }
    }
}

/// A text output written to `<path>.partial` and only moved to `<path>` on commit.
///
/// Dropping a sink that was never finished and committed removes the partial file,
/// so an aborted run leaves no half-written output behind.
pub struct OutputSink {
    path: PathBuf,
    partial: PathBuf,
    writer: Option<SinkWriter>,
}

impl OutputSink {
    /// Creates the partial file. A `compression_level` of 0 writes plain text,
    /// 1 to 9 write gzip at that level.
    pub fn create(path: &Path, compression_level: u32) -> io::Result<Self> {
        let partial = partial_path(path);
        let file = File::create(&partial).map_err(|e| {
            io::Error::new(e.kind(), format!("creating {}: {e}", partial.display()))
        })?;
        let buffered = BufWriter::with_capacity(SINK_BUFFER_BYTES, file);
        let writer = if compression_level == 0 {
            SinkWriter::Plain(buffered)
        } else {
            SinkWriter::Gzip(GzEncoder::new(
                buffered,
                Compression::new(compression_level.min(9)),
            ))
        };
        Ok(Self {
            path: path.to_path_buf(),
            partial,
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes every buffered byte (and the gzip trailer) to the partial file.
    pub fn finish(mut self) -> io::Result<FinishedSink> {
        let file = match self.writer.take() {
            Some(SinkWriter::Plain(w)) => w.into_inner().map_err(|e| e.into_error())?,
            Some(SinkWriter::Gzip(w)) => w.finish()?.into_inner().map_err(|e| e.into_error())?,
            None => return Err(io::Error::other("output sink already finished")),
        };
        file.sync_all()?;
        Ok(FinishedSink {
            path: std::mem::take(&mut self.path),
            partial: std::mem::take(&mut self.partial),
            committed: false,
        })
    }

    fn writer(&mut self) -> io::Result<&mut SinkWriter> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("output sink already finished"))
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer()?.write(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer()?.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }
}

impl Drop for OutputSink {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            let _ = fs::remove_file(&self.partial);
        }
    }
}

/// A completely written partial file awaiting [`FinishedSink::commit`].
pub struct FinishedSink {
    path: PathBuf,
    partial: PathBuf,
    committed: bool,
}

impl FinishedSink {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.partial, &self.path).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("moving {} into place: {e}", self.partial.display()),
            )
        })?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for FinishedSink {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.partial);
        }
    }
}

/// Writes the Beagle header row: the leading column names, then every sample label
/// once per value column.
pub fn write_beagle_header<'a, W, I>(out: &mut W, layout: &RecordLayout, labels: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a str>,
{
    out.write_all(b"marker alleleA alleleB")?;
    for label in labels {
        for _ in 0..layout.values.width() {
            write!(out, " {label}")?;
        }
    }
    out.write_all(b"\n")
}

/// Writes the header of the duplicate stream: for each duplicate pair the primary
/// columns, labelled with the primary's partition, followed by the shadow columns.
pub fn write_duplicate_header<W: Write>(
    out: &mut W,
    layout: &RecordLayout,
    plan: &DedupPlan,
) -> io::Result<()> {
    out.write_all(b"marker alleleA alleleB")?;
    for pair in &plan.duplicates {
        for (partition, _) in [pair.primary, pair.shadow] {
            for _ in 0..layout.values.width() {
                write!(out, " {}({partition})", pair.label)?;
            }
        }
    }
    out.write_all(b"\n")
}

/// Writes an IMPUTE2 `.sample` file for the given samples.
pub fn write_sample_file<'a, W, I>(
    out: &mut W,
    header: &SampleFileHeader,
    samples: I,
) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a Sample>,
{
    writeln!(out, "{}", header.columns)?;
    writeln!(out, "{}", header.types)?;
    for sample in samples {
        match &sample.record {
            Some(record) => writeln!(out, "{record}")?,
            None => writeln!(out, "{}", sample.label)?,
        }
    }
    Ok(())
}

/// Writes the `.sample` file matching the duplicate stream's column groups: the
/// primary occurrence of each pair, then its shadow.
pub fn write_duplicate_sample_file<W: Write>(
    out: &mut W,
    header: &SampleFileHeader,
    plan: &DedupPlan,
) -> io::Result<()> {
    writeln!(out, "{}", header.columns)?;
    writeln!(out, "{}", header.types)?;
    for pair in &plan.duplicates {
        match &pair.records {
            Some((primary, shadow)) => {
                writeln!(out, "{primary}")?;
                writeln!(out, "{shadow}")?;
            }
            None => {
                let ((primary, _), (shadow, _)) = (pair.primary, pair.shadow);
                writeln!(out, "{} {primary}", pair.label)?;
                writeln!(out, "{} {shadow}", pair.label)?;
            }
        }
    }
    Ok(())
}

/// A committed output and the file it replaced, parked at `<path>.previous`.
struct Committed {
    path: PathBuf,
    previous: Option<PathBuf>,
}

impl Committed {
    fn undo(self) {
        let _ = fs::remove_file(&self.path);
        if let Some(previous) = self.previous {
            let _ = fs::rename(previous, &self.path);
        }
    }
}

/// Commits every finished sink, in order. Files already at an output path are parked
/// until the last rename succeeds; if any step fails, the outputs committed so far
/// are removed and the parked files restored.
pub fn commit_all(sinks: Vec<FinishedSink>) -> io::Result<()> {
    let mut committed: Vec<Committed> = Vec::with_capacity(sinks.len());
    for sink in sinks {
        match commit_one(sink) {
            Ok(done) => committed.push(done),
            Err(e) => {
                committed.into_iter().rev().for_each(Committed::undo);
                return Err(e);
            }
        }
    }
    for done in committed {
        if let Some(previous) = done.previous {
            fs::remove_file(previous)?;
        }
    }
    Ok(())
}

fn commit_one(sink: FinishedSink) -> io::Result<Committed> {
    let path = sink.path().to_path_buf();
    let previous = if path.is_file() {
        let parked = previous_path(&path);
        fs::rename(&path, &parked)?;
        Some(parked)
    } else {
        None
    };
    match sink.commit() {
        Ok(()) => Ok(Committed { path, previous }),
        Err(e) => {
            if let Some(parked) = previous {
                let _ = fs::rename(parked, &path);
            }
            Err(e)
        }
    }
}
