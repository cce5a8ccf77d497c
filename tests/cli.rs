use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

/// Four populations of three samples in two regions, two loci.
fn write_inputs(dir: &Path, with_regions: bool) -> (PathBuf, PathBuf, PathBuf) {
    let coi = [
        ("s01", "ACGTACGTAC"),
        ("s02", "ACGTACGTAC"),
        ("s03", "ACGTACGTAT"),
        ("s04", "ACGTACGAAC"),
        ("s05", "ACGTACGAAC"),
        ("s06", "ACGTACGTAC"),
        ("s07", "GCGTTCGTAC"),
        ("s08", "GCGTTCGTAC"),
        ("s09", "GCGTTCGTGC"),
        ("s10", "GCGATCGTAC"),
        ("s11", "GCGATCGTAC"),
        ("s12", "GCGTTCGTAC"),
    ];
    let cytb = [
        ("s12", "TTAGC"),
        ("s11", "TTAGT"),
        ("s10", "TTAGT"),
        ("s09", "TTAGC"),
        ("s08", "TTAGC"),
        ("s07", "TTAGC"),
        ("s06", "CTAGA"),
        ("s05", "CTAGA"),
        ("s04", "CTA-A"),
        ("s03", "CTAGA"),
        ("s02", "CTAGG"),
        ("s01", "CTAGA"),
    ];
    let coi_path = dir.join("COI.fasta");
    let cytb_path = dir.join("cytb.fa");
    fs::write(
        &coi_path,
        coi.iter()
            .map(|(id, seq)| format!(">{}\n{}\n", id, seq))
            .collect::<String>(),
    )
    .unwrap();
    fs::write(
        &cytb_path,
        cytb.iter()
            .map(|(id, seq)| format!(">{} sampled 2021\n{}\n", id, seq))
            .collect::<String>(),
    )
    .unwrap();

    let strata_path = dir.join("strata.csv");
    let mut strata = String::from(if with_regions {
        "sample,population,region\n"
    } else {
        "sample,population\n"
    });
    for i in 1..=12 {
        let pop = ["north", "east", "south", "west"][(i - 1) / 3];
        let region = if i <= 6 { "upland" } else { "coast" };
        if with_regions {
            strata.push_str(&format!("s{:02},{},{}\n", i, pop, region));
        } else {
            strata.push_str(&format!("s{:02},{}\n", i, pop));
        }
    }
    fs::write(&strata_path, strata).unwrap();
    (coi_path, cytb_path, strata_path)
}

#[test]
fn test_full_run_writes_all_tables() {
    let temp = tempdir().unwrap();
    let (coi, cytb, strata) = write_inputs(temp.path(), true);
    let prefix = temp.path().join("results").join("run");

    let mut cmd = Command::cargo_bin("popdiff").unwrap();
    cmd.arg("--fasta")
        .arg(&coi)
        .arg("--fasta")
        .arg(format!("CYTB={}", cytb.display()))
        .arg("--strata")
        .arg(&strata)
        .arg("--out")
        .arg(&prefix)
        .arg("--permutations")
        .arg("20")
        .arg("--bootstrap")
        .arg("10")
        .arg("--threads")
        .arg("2")
        .assert()
        .success();

    let read = |suffix: &str| {
        fs::read_to_string(format!("{}.{}", prefix.display(), suffix)).unwrap()
    };
    let differentiation = read("differentiation.tsv");
    assert!(differentiation.starts_with("Scope\tStatistic\tValue\tLinearized"));
    assert!(differentiation.contains("overall\tnei_gst\t"));
    assert!(differentiation.contains("overall\tphi_st\t"));
    assert!(differentiation.contains("COI\tjost_d\t"));
    assert!(differentiation.contains("CYTB\thedrick_gst\t"));

    let pairwise = read("pairwise.tsv");
    // 6 pairs for each of 4 statistics, plus the header.
    assert_eq!(pairwise.lines().count(), 25);
    assert!(pairwise.contains("nei_gst\tnorth\teast\t"));

    let amova = read("amova.tsv");
    assert!(amova.contains("among_regions\t1\t"));
    assert!(amova.contains("among_populations\t2\t"));
    assert!(amova.contains("within_populations\t8\t"));
    assert!(amova.contains("total\t11\t"));
    assert!(amova.contains("Phi_CT\t"));

    let bootstrap = read("bootstrap.tsv");
    assert!(bootstrap.contains("jost_d\t"));
    assert_eq!(bootstrap.lines().count(), 4);
}

#[test]
fn test_missing_strata_entry_is_schema_error() {
    let temp = tempdir().unwrap();
    let (coi, _, strata) = write_inputs(temp.path(), false);
    let contents = fs::read_to_string(&strata).unwrap();
    let trimmed: String = contents
        .lines()
        .filter(|l| !l.starts_with("s07,"))
        .map(|l| format!("{}\n", l))
        .collect();
    fs::write(&strata, trimmed).unwrap();

    let mut cmd = Command::cargo_bin("popdiff").unwrap();
    cmd.arg("--fasta")
        .arg(&coi)
        .arg("--strata")
        .arg(&strata)
        .arg("--out")
        .arg(temp.path().join("run"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Schema"))
        .stderr(predicate::str::contains("s07"));
}

#[test]
fn test_unknown_distance_model_is_rejected() {
    let temp = tempdir().unwrap();
    let (coi, _, strata) = write_inputs(temp.path(), false);

    let mut cmd = Command::cargo_bin("popdiff").unwrap();
    cmd.arg("--fasta")
        .arg(&coi)
        .arg("--strata")
        .arg(&strata)
        .arg("--out")
        .arg(temp.path().join("run"))
        .arg("--distance")
        .arg("tamura")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown distance model"));
}

#[test]
fn test_flat_design_skips_region_level() {
    let temp = tempdir().unwrap();
    let (coi, cytb, strata) = write_inputs(temp.path(), false);
    let prefix = temp.path().join("flat");

    let mut cmd = Command::cargo_bin("popdiff").unwrap();
    cmd.arg("--fasta")
        .arg(&coi)
        .arg("--fasta")
        .arg(&cytb)
        .arg("--strata")
        .arg(&strata)
        .arg("--out")
        .arg(&prefix)
        .arg("--skip-pairwise")
        .arg("--distance")
        .arg("raw")
        .assert()
        .success();

    let amova = fs::read_to_string(format!("{}.amova.tsv", prefix.display())).unwrap();
    assert!(!amova.contains("among_regions"));
    assert!(amova.contains("among_populations\t3\t"));
    assert!(!Path::new(&format!("{}.pairwise.tsv", prefix.display())).exists());
    assert!(!Path::new(&format!("{}.bootstrap.tsv", prefix.display())).exists());
}

#[test]
fn test_seed_makes_runs_reproducible() {
    let temp = tempdir().unwrap();
    let (coi, cytb, strata) = write_inputs(temp.path(), true);

    let mut outputs = Vec::new();
    for (run, threads) in [("a", "1"), ("b", "3")] {
        let prefix = temp.path().join(run);
        let mut cmd = Command::cargo_bin("popdiff").unwrap();
        cmd.arg("--fasta")
            .arg(&coi)
            .arg("--fasta")
            .arg(&cytb)
            .arg("--strata")
            .arg(&strata)
            .arg("--out")
            .arg(&prefix)
            .arg("--seed")
            .arg("17")
            .arg("--permutations")
            .arg("30")
            .arg("--bootstrap")
            .arg("15")
            .arg("--threads")
            .arg(threads)
            .arg("--skip-pairwise")
            .assert()
            .success();
        outputs.push((
            fs::read_to_string(format!("{}.amova.tsv", prefix.display())).unwrap(),
            fs::read_to_string(format!("{}.bootstrap.tsv", prefix.display())).unwrap(),
        ));
    }
    assert_eq!(outputs[0], outputs[1]);
}
