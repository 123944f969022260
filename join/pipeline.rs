// ========================================================================================
//
//                                  THE JOB PIPELINE
//
// ========================================================================================
//
// Wires the stages of one run together: open the partitions, resolve the samples,
// settle the canonical index, then join every value kind against that one index and
// one dedup plan. Outputs are written as partial files and only moved into place
// once every kind has joined without a fatal error.

use crate::config::JoinConfig;
use crate::dedup::{DedupPlan, SampleAllowList, SampleCounts, resolve_samples};
use crate::diagnostics::write_diagnostics_header;
use crate::engine::{JoinOutputs, JoinSummary, MergeJoin};
use crate::error::{JoinError, Result};
use crate::index::{CanonicalIndex, IndexReport, infer_index};
use crate::layout::{DataFormat, RecordLayout};
use crate::partition::PartitionStream;
use crate::prefetch::PrefetchTextSource;
use crate::samples::{
    SampleFileHeader, SampleList, read_bgl_header, read_sample_files, samples_from_data_header,
};
use crate::shared::files::{TextSource, open_text_source};
use crate::sink::{
    FinishedSink, OutputSink, commit_all, output_path, write_beagle_header,
    write_duplicate_header, write_duplicate_sample_file, write_sample_file,
};
use crate::types::PartitionIndex;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use std::error::Error;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Debug)]
pub enum PipelineError {
    Io(String),
    Worker(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Io(e) => write!(f, "I/O error during pipeline execution: {e}"),
            PipelineError::Worker(e) => write!(f, "A reader thread failed: {e}"),
        }
    }
}
impl Error for PipelineError {}

pub(crate) fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());

    pb
}

// ========================================================================================
//                                  Job description
// ========================================================================================

/// The files of one input partition.
#[derive(Debug, Clone)]
pub struct PartitionInputs {
    /// One data stream per value kind, in the job's kind order.
    pub data: Vec<PathBuf>,
    /// A `.bgl` header (Beagle) or `.sample` file (IMPUTE2). Beagle partitions without
    /// one take their labels from the first kind's header row.
    pub samples: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub format: DataFormat,
    pub kinds: Vec<RecordLayout>,
    pub partitions: Vec<PartitionInputs>,
    /// Samples to keep; every sample is kept when absent.
    pub filter: Option<PathBuf>,
    /// Read as the canonical index when it exists, otherwise the inferred index is
    /// written there.
    pub markers: Option<PathBuf>,
    pub output: PathBuf,
    pub dupes: Option<PathBuf>,
    pub config: JoinConfig,
}

#[derive(Debug, Clone)]
pub struct JobSummary {
    pub markers: usize,
    pub inferred: Option<IndexReport>,
    pub samples: Vec<SampleCounts>,
    pub unique_samples: usize,
    pub duplicate_samples: usize,
    pub kinds: Vec<JoinSummary>,
    pub outputs: Vec<PathBuf>,
}

// ========================================================================================
//                                     Execution
// ========================================================================================

pub fn run_job(spec: &JobSpec) -> Result<JobSummary> {
    let start = Instant::now();
    validate_spec(spec)?;
    debug!("Effective configuration:\n{}", spec.config.to_toml()?);

    let first_kind = spec.kinds[0];
    info!("Opening {} {} partitions ...", spec.partitions.len(), spec.format);
    let mut partitions = open_partitions(spec, 0)?;
    for partition in &partitions {
        info!("  {}: {}", partition.index(), partition.describe());
    }

    info!("Joining samples ...");
    let (sample_header, lists) = read_sample_lists(spec, &partitions)?;
    let allow = match &spec.filter {
        Some(path) => Some(SampleAllowList::read(path, spec.format.sample_naming())?),
        None => None,
    };
    let plan = resolve_samples(&lists, allow.as_ref());
    if !plan.duplicates.is_empty() && spec.dupes.is_none() {
        warn!("No duplicate output prefix was specified; duplicate samples will be dropped");
    }

    let (index, inferred) = match &spec.markers {
        Some(path) if path.exists() => {
            info!("Reading markers from {} ...", path.display());
            (CanonicalIndex::read_marker_list(path, &first_kind)?, None)
        }
        _ => {
            info!("Building the marker index from the input partitions ...");
            let (index, report) = infer_index(&mut partitions)?;
            (index, Some(report))
        }
    };

    let mut finished: Vec<FinishedSink> = Vec::new();
    if let Some(report) = &inferred {
        if let Some(path) = &spec.markers {
            info!("Writing inferred markers to {}", path.display());
            let mut sink = OutputSink::create(path, 0)?;
            index.write_marker_list(&mut sink)?;
            finished.push(sink.finish()?);
        }
        if let (Some(dupes), false) = (&spec.dupes, report.duplicates.is_empty()) {
            let path = output_path(dupes, "markers", 0);
            info!("Writing duplicate markers to {}", path.display());
            let names: Vec<String> = partitions.iter().map(|p| p.describe().to_string()).collect();
            let mut sink = OutputSink::create(&path, 0)?;
            report.write_duplicates(&mut sink, &names)?;
            finished.push(sink.finish()?);
        }
    }

    if let Some(header) = &sample_header {
        finished.extend(write_sample_outputs(spec, header, &plan)?);
    }

    let mut log_sink = OutputSink::create(&output_path(&spec.output, "log", 0), 0)?;
    write_diagnostics_header(&mut log_sink)?;

    let level = spec.config.compression_level;
    let mut kinds = Vec::with_capacity(spec.kinds.len());
    for (k, layout) in spec.kinds.iter().enumerate() {
        if k > 0 {
            partitions = open_partitions(spec, k)?;
            check_sample_headers(spec, &partitions, &lists)?;
        }
        info!("Joining {} data ...", layout.name);

        let mut merged = OutputSink::create(&output_path(&spec.output, layout.extension, level), level)?;
        let mut duplicates = match &spec.dupes {
            Some(prefix) if !plan.duplicates.is_empty() => Some(OutputSink::create(
                &output_path(prefix, layout.extension, level),
                level,
            )?),
            _ => None,
        };
        if layout.has_header() {
            write_beagle_header(
                &mut merged,
                layout,
                plan.primaries.iter().map(|s| s.label.as_str()),
            )?;
            if let Some(sink) = duplicates.as_mut() {
                write_duplicate_header(sink, layout, &plan)?;
            }
        }

        let summary = MergeJoin::new(*layout, &index, &plan)
            .with_progress(spec.config.progress)
            .run(
                &mut partitions,
                JoinOutputs {
                    merged: &mut merged,
                    duplicates: duplicates.as_mut().map(|s| s as &mut dyn Write),
                    diagnostics: Some(&mut log_sink),
                },
            )?;
        summary.report();
        kinds.push(summary);

        finished.push(merged.finish()?);
        if let Some(sink) = duplicates {
            finished.push(sink.finish()?);
        }
    }
    finished.push(log_sink.finish()?);

    let outputs: Vec<PathBuf> = finished.iter().map(|s| s.path().to_path_buf()).collect();
    commit_all(finished)?;
    for path in &outputs {
        info!("  wrote {}", path.display());
    }
    info!("Finished in {:.2?}", start.elapsed());

    Ok(JobSummary {
        markers: index.len(),
        inferred,
        samples: plan.counts.clone(),
        unique_samples: plan.primaries.len(),
        duplicate_samples: plan.duplicates.len(),
        kinds,
        outputs,
    })
}

fn validate_spec(spec: &JobSpec) -> Result<()> {
    spec.config.validate()?;
    if spec.partitions.is_empty() {
        return Err(JoinError::Config("at least one input partition is required".into()));
    }
    if spec.kinds.is_empty() {
        return Err(JoinError::Config("at least one value kind is required".into()));
    }
    for (i, partition) in spec.partitions.iter().enumerate() {
        if partition.data.len() != spec.kinds.len() {
            return Err(JoinError::Config(format!(
                "partition {} names {} data files for {} value kinds",
                PartitionIndex(i),
                partition.data.len(),
                spec.kinds.len()
            )));
        }
        if spec.format == DataFormat::Impute2 && partition.samples.is_none() {
            return Err(JoinError::Config(format!(
                "partition {} has no .sample file",
                PartitionIndex(i)
            )));
        }
    }
    Ok(())
}

fn open_source(path: &Path, config: &JoinConfig) -> Result<Box<dyn TextSource>> {
    let source = open_text_source(path, config.chunk_bytes)?;
    if config.prefetch {
        Ok(Box::new(PrefetchTextSource::spawn(
            source,
            config.prefetch_batch_lines,
            config.prefetch_queue_batches,
        )?))
    } else {
        Ok(source)
    }
}

fn open_partitions(spec: &JobSpec, kind: usize) -> Result<Vec<PartitionStream>> {
    let layout = spec.kinds[kind];
    spec.partitions
        .iter()
        .enumerate()
        .map(|(i, inputs)| {
            let source = open_source(&inputs.data[kind], &spec.config)?;
            PartitionStream::open(PartitionIndex(i), source, layout)
        })
        .collect()
}

fn read_sample_lists(
    spec: &JobSpec,
    partitions: &[PartitionStream],
) -> Result<(Option<SampleFileHeader>, Vec<SampleList>)> {
    match spec.format {
        DataFormat::Impute2 => {
            let paths: Vec<&Path> = spec
                .partitions
                .iter()
                .filter_map(|p| p.samples.as_deref())
                .collect();
            read_sample_files(&paths)
        }
        DataFormat::Beagle => {
            let lists = spec
                .partitions
                .iter()
                .zip(partitions)
                .map(|(inputs, stream)| match &inputs.samples {
                    Some(path) => read_bgl_header(stream.index(), path),
                    None => samples_from_data_header(
                        stream.index(),
                        stream.describe(),
                        stream.header().unwrap_or_default(),
                        stream.layout(),
                    ),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok((None, lists))
        }
    }
}

/// Every later Beagle kind labelled by its own header row must name the same samples,
/// in the same order, as the header the sample plan was built from.
fn check_sample_headers(
    spec: &JobSpec,
    partitions: &[PartitionStream],
    lists: &[SampleList],
) -> Result<()> {
    if spec.format != DataFormat::Beagle {
        return Ok(());
    }
    for ((inputs, stream), list) in spec.partitions.iter().zip(partitions).zip(lists) {
        if inputs.samples.is_some() {
            continue;
        }
        let labels = samples_from_data_header(
            stream.index(),
            stream.describe(),
            stream.header().unwrap_or_default(),
            stream.layout(),
        )?;
        if labels.samples != list.samples {
            return Err(JoinError::malformed(
                stream.describe(),
                1,
                format!(
                    "partition {} names samples differently from {}",
                    stream.index(),
                    list.source_name
                ),
            ));
        }
    }
    Ok(())
}

fn write_sample_outputs(
    spec: &JobSpec,
    header: &SampleFileHeader,
    plan: &DedupPlan,
) -> Result<Vec<FinishedSink>> {
    let mut finished = Vec::new();
    let mut sink = OutputSink::create(&output_path(&spec.output, "phased.sample", 0), 0)?;
    write_sample_file(&mut sink, header, &plan.primaries)?;
    finished.push(sink.finish()?);

    if let (Some(dupes), false) = (&spec.dupes, plan.duplicates.is_empty()) {
        let mut sink = OutputSink::create(&output_path(dupes, "phased.sample", 0), 0)?;
        write_duplicate_sample_file(&mut sink, header, plan)?;
        finished.push(sink.finish()?);
    }
    Ok(finished)
}
