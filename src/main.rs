#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Env;
use groupjoin::{
    DataFormat, JobSpec, JobSummary, JoinConfig, JoinError, PartitionInputs, RecordLayout, run_job,
};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "groupjoin",
    version,
    about = "Join per-group imputation results into one marker-aligned dataset",
    long_about = "Streams the result files of several imputation groups in lock-step, aligns \
                 them on a canonical marker order, reconciles reversed allele order and \
                 diverts samples that appear in more than one group to a duplicate stream."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join Beagle .dose / .gprobs results
    #[command(about = "Join Beagle .dose and .gprobs results (outputs: PREFIX.dose.gz, PREFIX.gprobs.gz, PREFIX.log)")]
    Beagle(BeagleArgs),

    /// Join IMPUTE2 results
    #[command(about = "Join IMPUTE2 results (outputs: PREFIX.impute2.gz, PREFIX.phased.sample, PREFIX.log)")]
    Impute2(CommonArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Prefixes of the input partitions, in partition order
    #[arg(short = 'i', long = "input", value_name = "PREFIX", num_args = 1.., required = true)]
    inputs: Vec<PathBuf>,

    /// File listing the samples to retain
    #[arg(short = 'f', long, value_name = "FILE")]
    filter: Option<PathBuf>,

    /// Expected marker order; written from the inputs when the file does not exist
    #[arg(short = 'm', long, value_name = "FILE")]
    markers: Option<PathBuf>,

    /// Prefix of the joined output and log files
    #[arg(short = 'o', long, value_name = "PREFIX")]
    output: PathBuf,

    /// Prefix of the duplicate sample output files
    #[arg(short = 'd', long, value_name = "PREFIX")]
    dupes: Option<PathBuf>,

    /// gzip level of the joined data (0 writes plain text)
    #[arg(short = 'z', long = "compression-level", value_name = "LEVEL")]
    compression_level: Option<u32>,

    /// Decode every input on its own reader thread
    #[arg(long)]
    prefetch: bool,

    /// Never draw a progress bar
    #[arg(long)]
    no_progress: bool,

    /// TOML file with tuning options; flags given here take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum BeagleKind {
    Dose,
    Gprobs,
}

impl BeagleKind {
    fn layout(self) -> RecordLayout {
        match self {
            BeagleKind::Dose => RecordLayout::BEAGLE_DOSE,
            BeagleKind::Gprobs => RecordLayout::BEAGLE_GPROBS,
        }
    }
}

#[derive(Args)]
struct BeagleArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Prefixes of .bgl files supplying each partition's sample labels
    #[arg(short = 's', long = "samples", value_name = "PREFIX", num_args = 1..)]
    samples: Vec<PathBuf>,

    /// Value kinds to join; the first one also settles the marker index
    #[arg(long, value_enum, value_delimiter = ',', default_value = "dose,gprobs")]
    kinds: Vec<BeagleKind>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Beagle(args) => beagle_spec(args),
        Commands::Impute2(args) => impute2_spec(args),
    }
    .and_then(|spec| run_job(&spec));

    match result {
        Ok(summary) => print_summary(&summary),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn beagle_spec(args: BeagleArgs) -> Result<JobSpec, JoinError> {
    let BeagleArgs {
        common,
        samples,
        kinds,
    } = args;
    if !samples.is_empty() && samples.len() != common.inputs.len() {
        return Err(JoinError::Config(format!(
            "{} sample prefixes given for {} inputs",
            samples.len(),
            common.inputs.len()
        )));
    }
    let kinds: Vec<RecordLayout> = kinds.into_iter().map(BeagleKind::layout).collect();

    let mut partitions = Vec::with_capacity(common.inputs.len());
    for (i, prefix) in common.inputs.iter().enumerate() {
        let data = kinds
            .iter()
            .map(|layout| find_input(prefix, layout.extension))
            .collect::<Result<Vec<_>, _>>()?;
        let sample_header = match samples.get(i) {
            Some(bgl) => Some(find_input(bgl, "bgl")?),
            None => None,
        };
        partitions.push(PartitionInputs {
            data,
            samples: sample_header,
        });
    }
    build_spec(common, DataFormat::Beagle, kinds, partitions)
}

fn impute2_spec(args: CommonArgs) -> Result<JobSpec, JoinError> {
    let partitions = args
        .inputs
        .iter()
        .map(|prefix| {
            Ok(PartitionInputs {
                data: vec![find_input(prefix, "best_guess_haps_imputation.impute2")?],
                samples: Some(find_input(prefix, "phased.sample")?),
            })
        })
        .collect::<Result<Vec<_>, JoinError>>()?;
    build_spec(
        args,
        DataFormat::Impute2,
        vec![RecordLayout::IMPUTE2],
        partitions,
    )
}

fn build_spec(
    common: CommonArgs,
    format: DataFormat,
    kinds: Vec<RecordLayout>,
    partitions: Vec<PartitionInputs>,
) -> Result<JobSpec, JoinError> {
    let mut config = match &common.config {
        Some(path) => JoinConfig::from_toml_file(path)?,
        None => JoinConfig::default(),
    };
    if let Some(level) = common.compression_level {
        config.compression_level = level;
    }
    if common.prefetch {
        config.prefetch = true;
    }
    if common.no_progress {
        config.progress = false;
    }
    config.validate()?;

    Ok(JobSpec {
        format,
        kinds,
        partitions,
        filter: common.filter,
        markers: common.markers,
        output: common.output,
        dupes: common.dupes,
        config,
    })
}

/// Resolves `<prefix>.<extension>.gz`, falling back to the uncompressed file.
fn find_input(prefix: &Path, extension: &str) -> Result<PathBuf, JoinError> {
    let mut plain = OsString::from(prefix.as_os_str());
    plain.push(".");
    plain.push(extension);
    let mut gzipped = plain.clone();
    gzipped.push(".gz");

    let (plain, gzipped) = (PathBuf::from(plain), PathBuf::from(gzipped));
    if gzipped.is_file() {
        return Ok(gzipped);
    }
    if plain.is_file() {
        return Ok(plain);
    }
    Err(JoinError::Config(format!(
        "neither {} nor {} exists",
        gzipped.display(),
        plain.display()
    )))
}

fn print_summary(summary: &JobSummary) {
    eprintln!(
        "> Joined {} samples ({} duplicates) over {} markers",
        summary.unique_samples, summary.duplicate_samples, summary.markers
    );
    for kind in &summary.kinds {
        eprintln!(
            "> {}: {} rows written, {} incomplete markers",
            kind.kind,
            kind.joined,
            kind.incomplete.len()
        );
    }
}
