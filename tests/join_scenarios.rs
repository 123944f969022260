use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use groupjoin::{DataFormat, JobSpec, JoinConfig, JoinError, PartitionInputs, RecordLayout, run_job};
use tempfile::tempdir;

const P1_DOSE: &str = "marker alleleA alleleB a b\n\
m1 A G 0.1 0.2\n\
m2 C T 1 1\n\
m3 A C 0.5 0.5\n";

const P2_DOSE: &str = "marker alleleA alleleB c\n\
m1 A G 0.3\n\
m3 C A 1.5\n";

const P3_DOSE: &str = "marker alleleA alleleB d\n\
m1 A G 0\n\
m2 C T 2\n\
m3 A C 1\n";

fn plain_config() -> JoinConfig {
    JoinConfig {
        compression_level: 0,
        progress: false,
        ..JoinConfig::default()
    }
}

fn write_inputs(dir: &Path, texts: &[&str], extension: &str) -> Vec<PathBuf> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            let path = dir.join(format!("p{}.{extension}", i + 1));
            fs::write(&path, text).expect("write partition");
            path
        })
        .collect()
}

fn dose_job(dir: &Path, data: Vec<PathBuf>, output: &str) -> JobSpec {
    JobSpec {
        format: DataFormat::Beagle,
        kinds: vec![RecordLayout::BEAGLE_DOSE],
        partitions: data
            .into_iter()
            .map(|path| PartitionInputs {
                data: vec![path],
                samples: None,
            })
            .collect(),
        filter: None,
        markers: None,
        output: dir.join(output),
        dupes: None,
        config: plain_config(),
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

#[test]
fn three_partitions_join_on_markers_present_everywhere() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(tmp.path(), &[P1_DOSE, P2_DOSE, P3_DOSE], "dose");
    let mut job = dose_job(tmp.path(), data, "joined");
    let markers = tmp.path().join("joined.markers");
    job.markers = Some(markers.clone());

    let summary = run_job(&job).expect("join");

    assert_eq!(
        read(&tmp.path().join("joined.dose")),
        "marker alleleA alleleB a b c d\n\
         m1 A G 0.1 0.2 0.3 0\n\
         m3 A C 0.5 0.5 0.500000 1\n"
    );
    assert_eq!(read(&markers), "m1 A G\nm3 A C\n");
    assert_eq!(summary.markers, 2);
    assert_eq!(summary.unique_samples, 4);

    let inferred = summary.inferred.as_ref().expect("index was inferred");
    assert_eq!(inferred.partially_covered, 1);
    assert_eq!(inferred.scans[1].records, 2);

    let dose = &summary.kinds[0];
    assert_eq!(dose.joined, 2);
    assert!(dose.incomplete.is_empty());
    assert_eq!(dose.partitions[1].reversed, 1);
    assert_eq!(dose.partitions[0].skipped, 1);

    let log = read(&tmp.path().join("joined.log"));
    assert!(log.starts_with("#kind\tmarker\tstatus\tnote\n"));
    assert!(log.contains("dose\tm2\tunmatched\t#1\n"));
    assert!(log.contains("dose\tm3\treversed\t#2\n"));
}

#[test]
fn an_existing_marker_list_is_trusted_and_left_untouched() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(tmp.path(), &[P1_DOSE, P2_DOSE, P3_DOSE], "dose");
    let mut job = dose_job(tmp.path(), data, "joined");
    let markers = tmp.path().join("expected.markers");
    fs::write(&markers, "# marker order\nm1 A G\nm2 C T\nm3 A C\n").expect("write markers");
    job.markers = Some(markers.clone());

    let summary = run_job(&job).expect("join");

    assert!(summary.inferred.is_none());
    assert_eq!(summary.markers, 3);
    assert_eq!(summary.kinds[0].incomplete, vec!["m2".to_string()]);
    assert_eq!(
        read(&tmp.path().join("joined.dose")),
        "marker alleleA alleleB a b c d\n\
         m1 A G 0.1 0.2 0.3 0\n\
         m3 A C 0.5 0.5 0.500000 1\n"
    );
    assert!(read(&tmp.path().join("joined.log")).contains("dose\tm2\tincomplete\t#2\n"));
    assert_eq!(read(&markers), "# marker order\nm1 A G\nm2 C T\nm3 A C\n");
}

#[test]
fn swapped_marker_order_fails_without_writing_outputs() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(
        tmp.path(),
        &[
            "marker alleleA alleleB a\nm1 A G 0\nm2 A G 1\n",
            "marker alleleA alleleB b\nm2 A G 1\nm1 A G 0\n",
        ],
        "dose",
    );
    let mut job = dose_job(tmp.path(), data, "joined");
    job.markers = Some(tmp.path().join("joined.markers"));

    match run_job(&job) {
        Err(JoinError::OrderConflict(conflicts)) => {
            assert_eq!(conflicts.len(), 1);
            assert_eq!(conflicts[0].earlier, "m1");
            assert_eq!(conflicts[0].later, "m2");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("swapped partitions should not join"),
    }

    let mut names: Vec<String> = fs::read_dir(tmp.path())
        .expect("list directory")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["p1.dose", "p2.dose"]);
}

#[test]
fn allele_mismatch_leaves_no_partial_files() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(
        tmp.path(),
        &[
            "marker alleleA alleleB a\nm1 A G 0\n",
            "marker alleleA alleleB b\nm1 A T 1\n",
        ],
        "dose",
    );
    let job = dose_job(tmp.path(), data, "joined");

    assert!(matches!(
        run_job(&job),
        Err(JoinError::AlleleMismatch { .. })
    ));
    for entry in fs::read_dir(tmp.path()).expect("list directory") {
        let name = entry.expect("entry").file_name().to_string_lossy().into_owned();
        assert!(name.starts_with('p'), "unexpected output {name}");
    }
}

#[test]
fn repeated_runs_produce_identical_bytes() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(tmp.path(), &[P1_DOSE, P2_DOSE, P3_DOSE], "dose");
    let markers = tmp.path().join("trusted.markers");
    fs::write(&markers, "m1 A G\nm2 C T\nm3 A C\n").expect("write marker list");

    let mut runs = Vec::new();
    for name in ["first", "second"] {
        let mut job = dose_job(tmp.path(), data.clone(), name);
        job.config.compression_level = 6;
        job.markers = Some(markers.clone());
        let summary = run_job(&job).expect("join");
        assert!(summary.inferred.is_none());
        runs.push((
            fs::read(tmp.path().join(format!("{name}.dose.gz"))).expect("merged output"),
            fs::read(tmp.path().join(format!("{name}.log"))).expect("diagnostics"),
        ));
    }

    assert_eq!(runs[0], runs[1]);
    assert_eq!(
        fs::read_to_string(&markers).expect("marker list"),
        "m1 A G\nm2 C T\nm3 A C\n"
    );
}

#[test]
fn duplicate_samples_are_split_into_their_own_stream() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(
        tmp.path(),
        &[
            "marker alleleA alleleB a b\nm1 A G 0.1 0.2\nm2 C T 1 1.2\n",
            "marker alleleA alleleB b c\nm1 A G 0.4 0.5\nm2 T C 0.5 2\n",
        ],
        "dose",
    );
    let mut job = dose_job(tmp.path(), data, "joined");
    job.dupes = Some(tmp.path().join("dupes"));

    let summary = run_job(&job).expect("join");

    assert_eq!(summary.unique_samples, 3);
    assert_eq!(summary.duplicate_samples, 1);
    assert_eq!(summary.samples[1].duplicates, 1);
    assert_eq!(
        read(&tmp.path().join("joined.dose")),
        "marker alleleA alleleB a b c\n\
         m1 A G 0.1 0.2 0.5\n\
         m2 C T 1 1.2 0.000000\n"
    );
    assert_eq!(
        read(&tmp.path().join("dupes.dose")),
        "marker alleleA alleleB b(#1) b(#2)\n\
         m1 A G 0.2 0.4\n\
         m2 C T 1.2 1.500000\n"
    );
}

#[test]
fn sample_filter_restricts_the_output_columns() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(tmp.path(), &[P1_DOSE, P2_DOSE, P3_DOSE], "dose");
    let filter = tmp.path().join("keep.txt");
    fs::write(&filter, "# samples to keep\nb\nd\n").expect("write filter");
    let mut job = dose_job(tmp.path(), data, "joined");
    job.filter = Some(filter);

    let summary = run_job(&job).expect("join");

    assert_eq!(
        read(&tmp.path().join("joined.dose")),
        "marker alleleA alleleB b d\nm1 A G 0.2 0\nm3 A C 0.5 1\n"
    );
    assert_eq!(summary.samples[0].filtered, 1);
    assert_eq!(summary.samples[1].filtered, 1);
    assert_eq!(summary.samples[1].kept, 0);
}

#[test]
fn a_sample_listed_twice_in_the_filter_is_rejected() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(tmp.path(), &[P1_DOSE], "dose");
    let filter = tmp.path().join("keep.txt");
    fs::write(&filter, "a\nb\na\n").expect("write filter");
    let mut job = dose_job(tmp.path(), data, "joined");
    job.filter = Some(filter);

    assert!(matches!(
        run_job(&job),
        Err(JoinError::DuplicateFilterSample { sample }) if sample == "a"
    ));
}

#[test]
fn dose_and_gprobs_are_joined_against_one_index() {
    let tmp = tempdir().expect("temporary directory");
    let dose = write_inputs(
        tmp.path(),
        &[
            "marker alleleA alleleB a\nm1 A G 0.5\nm2 C T 1\n",
            "marker alleleA alleleB b\nm1 G A 2\nm2 C T 0\n",
        ],
        "dose",
    );
    let gprobs = write_inputs(
        tmp.path(),
        &[
            "marker alleleA alleleB a a a\nm1 A G 0.6 0.3 0.1\nm2 C T 0 1 0\n",
            "marker alleleA alleleB b b b\nm1 G A 0 0 1\nm2 C T 1 0 0\n",
        ],
        "gprobs",
    );
    let job = JobSpec {
        format: DataFormat::Beagle,
        kinds: vec![RecordLayout::BEAGLE_DOSE, RecordLayout::BEAGLE_GPROBS],
        partitions: dose
            .into_iter()
            .zip(gprobs)
            .map(|(d, g)| PartitionInputs {
                data: vec![d, g],
                samples: None,
            })
            .collect(),
        filter: None,
        markers: None,
        output: tmp.path().join("joined"),
        dupes: None,
        config: plain_config(),
    };

    let summary = run_job(&job).expect("join");

    assert_eq!(summary.kinds.len(), 2);
    assert_eq!(
        read(&tmp.path().join("joined.dose")),
        "marker alleleA alleleB a b\nm1 A G 0.5 0.000000\nm2 C T 1 0\n"
    );
    assert_eq!(
        read(&tmp.path().join("joined.gprobs")),
        "marker alleleA alleleB a a a b b b\nm1 A G 0.6 0.3 0.1 1 0 0\nm2 C T 0 1 0 1 0 0\n"
    );
    let log = read(&tmp.path().join("joined.log"));
    assert!(log.contains("dose\tm1\treversed\t#2\n"));
    assert!(log.contains("gprobs\tm1\treversed\t#2\n"));
}

#[test]
fn later_kinds_must_name_the_same_samples() {
    let tmp = tempdir().expect("temporary directory");
    let dose = write_inputs(
        tmp.path(),
        &["marker alleleA alleleB a b\nm1 A G 0.5 1\n"],
        "dose",
    );
    let gprobs = write_inputs(
        tmp.path(),
        &["marker alleleA alleleB b b b a a a\nm1 A G 0 0 1 1 0 0\n"],
        "gprobs",
    );
    let job = JobSpec {
        format: DataFormat::Beagle,
        kinds: vec![RecordLayout::BEAGLE_DOSE, RecordLayout::BEAGLE_GPROBS],
        partitions: vec![PartitionInputs {
            data: vec![dose[0].clone(), gprobs[0].clone()],
            samples: None,
        }],
        filter: None,
        markers: None,
        output: tmp.path().join("joined"),
        dupes: None,
        config: plain_config(),
    };

    match run_job(&job) {
        Err(JoinError::Malformed { source_name, message, .. }) => {
            assert!(source_name.ends_with("p1.gprobs"), "{source_name}");
            assert!(message.contains("#1"), "{message}");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("reordered gprobs samples should not join"),
    }
    assert!(!tmp.path().join("joined.dose").exists());
    assert!(!tmp.path().join("joined.gprobs").exists());
    assert!(!tmp.path().join("joined.log").exists());
}

#[test]
fn bgl_headers_supply_sample_labels() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(
        tmp.path(),
        &[
            "marker alleleA alleleB x\nm1 A G 0.1\n",
            "marker alleleA alleleB y\nm1 A G 0.2\n",
        ],
        "dose",
    );
    let bgl: Vec<PathBuf> = ["S1", "S2"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let path = tmp.path().join(format!("p{}.bgl", i + 1));
            fs::write(&path, format!("I id {name} {name}\nM m1 A G\n")).expect("write bgl");
            path
        })
        .collect();
    let mut job = dose_job(tmp.path(), data, "joined");
    for (partition, path) in job.partitions.iter_mut().zip(bgl) {
        partition.samples = Some(path);
    }

    run_job(&job).expect("join");

    assert_eq!(
        read(&tmp.path().join("joined.dose")),
        "marker alleleA alleleB S1 S2\nm1 A G 0.1 0.2\n"
    );
}

fn write_gzip(path: &Path, text: &str) {
    let file = fs::File::create(path).expect("create gzip input");
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(text.as_bytes()).expect("compress");
    encoder.finish().expect("finish gzip");
}

#[test]
fn gzip_inputs_and_outputs() {
    let tmp = tempdir().expect("temporary directory");
    let p1 = tmp.path().join("p1.dose.gz");
    write_gzip(&p1, P1_DOSE);
    let p2 = tmp.path().join("p2.dose");
    fs::write(&p2, P2_DOSE).expect("write plain input");
    let p3 = tmp.path().join("p3.dose.gz");
    write_gzip(&p3, P3_DOSE);

    let mut job = dose_job(tmp.path(), vec![p1, p2, p3], "joined");
    job.config.compression_level = 6;
    run_job(&job).expect("join");

    let mut text = String::new();
    GzDecoder::new(fs::File::open(tmp.path().join("joined.dose.gz")).expect("open output"))
        .read_to_string(&mut text)
        .expect("decompress output");
    assert_eq!(
        text,
        "marker alleleA alleleB a b c d\n\
         m1 A G 0.1 0.2 0.3 0\n\
         m3 A C 0.5 0.5 0.500000 1\n"
    );
    assert!(tmp.path().join("joined.log").exists());
}

#[test]
fn prefetching_does_not_change_the_output() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(tmp.path(), &[P1_DOSE, P2_DOSE, P3_DOSE], "dose");

    let direct = dose_job(tmp.path(), data.clone(), "direct");
    let mut prefetched = dose_job(tmp.path(), data, "prefetched");
    prefetched.config.prefetch = true;
    prefetched.config.prefetch_batch_lines = 1;
    prefetched.config.prefetch_queue_batches = 1;

    run_job(&direct).expect("direct run");
    run_job(&prefetched).expect("prefetched run");

    assert_eq!(
        read(&tmp.path().join("direct.dose")),
        read(&tmp.path().join("prefetched.dose"))
    );
}

const SAMPLE_HEADER: &str = "ID_1 ID_2 missing\n0 0 0\n";

#[test]
fn impute2_partitions_carry_sample_files_and_duplicates() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(
        tmp.path(),
        &[
            "22 rs1 100 A G 1 0 0\n22 rs7;kgp9 200 C T 0 1 0\n",
            "22 rs1 100 A G 0 1 0 0 0 1\n22 kgp9 200 T C 0.1 0.2 0.7 1 0 0\n",
        ],
        "impute2",
    );
    let samples: Vec<PathBuf> = ["F1 I1 0\n", "f1 i1 0\nF2 I2 0\n"]
        .iter()
        .enumerate()
        .map(|(i, rows)| {
            let path = tmp.path().join(format!("p{}.phased.sample", i + 1));
            fs::write(&path, format!("{SAMPLE_HEADER}{rows}")).expect("write sample file");
            path
        })
        .collect();

    let job = JobSpec {
        format: DataFormat::Impute2,
        kinds: vec![RecordLayout::IMPUTE2],
        partitions: data
            .into_iter()
            .zip(samples)
            .map(|(data, samples)| PartitionInputs {
                data: vec![data],
                samples: Some(samples),
            })
            .collect(),
        filter: None,
        markers: None,
        output: tmp.path().join("joined"),
        dupes: Some(tmp.path().join("dupes")),
        config: plain_config(),
    };

    let summary = run_job(&job).expect("join");

    assert_eq!(summary.unique_samples, 2);
    assert_eq!(summary.duplicate_samples, 1);
    assert_eq!(
        read(&tmp.path().join("joined.impute2")),
        "22 rs1 100 A G 1 0 0 0 0 1\n22 rs7 200 C T 0 1 0 0 0 1\n"
    );
    assert_eq!(
        read(&tmp.path().join("dupes.impute2")),
        "22 rs1 100 A G 1 0 0 0 1 0\n22 rs7 200 C T 0 1 0 0.7 0.2 0.1\n"
    );
    assert_eq!(
        read(&tmp.path().join("joined.phased.sample")),
        format!("{SAMPLE_HEADER}F1 I1 0\nF2 I2 0\n")
    );
    assert_eq!(
        read(&tmp.path().join("dupes.phased.sample")),
        format!("{SAMPLE_HEADER}F1 I1 0\nf1 i1 0\n")
    );
    assert!(read(&tmp.path().join("joined.log")).contains("impute2\trs7\talias\tkgp9;rs7;kgp9\n"));
}

#[test]
fn impute2_sample_headers_must_agree() {
    let tmp = tempdir().expect("temporary directory");
    let data = write_inputs(
        tmp.path(),
        &["22 rs1 100 A G 1 0 0\n", "22 rs1 100 A G 0 1 0\n"],
        "impute2",
    );
    let first = tmp.path().join("p1.phased.sample");
    fs::write(&first, format!("{SAMPLE_HEADER}F1 I1 0\n")).expect("write");
    let second = tmp.path().join("p2.phased.sample");
    fs::write(&second, "ID_1 ID_2 missing sex\n0 0 0 D\nF2 I2 0 1\n").expect("write");

    let job = JobSpec {
        format: DataFormat::Impute2,
        kinds: vec![RecordLayout::IMPUTE2],
        partitions: vec![
            PartitionInputs {
                data: vec![data[0].clone()],
                samples: Some(first),
            },
            PartitionInputs {
                data: vec![data[1].clone()],
                samples: Some(second),
            },
        ],
        filter: None,
        markers: None,
        output: tmp.path().join("joined"),
        dupes: None,
        config: plain_config(),
    };

    assert!(matches!(
        run_job(&job),
        Err(JoinError::SampleHeaderMismatch { .. })
    ));
}
