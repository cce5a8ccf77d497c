// loader.rs

use crate::dataset::{validate_locus_name, Dataset, Locus, Strata};
use crate::error::{PopDiffError, Result};
use log::{debug, info, warn};
use noodles_fasta as fasta;
use rayon::prelude::*;
use serde::Deserialize;
use std::{
    collections::{HashMap, HashSet},
    fs::File,
    io::{BufRead, BufReader, Read},
    path::{Path, PathBuf},
    str::FromStr,
};

/// IUPAC nucleotide codes plus gap and unknown.
const ALIGNMENT_ALPHABET: &[u8] = b"ACGTURYSWKMBDHVN-?";

/// A FASTA file holding one locus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocusSource {
    pub name: String,
    pub path: PathBuf,
}

impl LocusSource {
    /// Names the locus after the file stem (`data/COI.fasta` -> `COI`).
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                PopDiffError::schema(format!(
                    "Cannot derive a locus name from path {}.",
                    path.display()
                ))
            })?;
        validate_locus_name(&name)?;
        Ok(Self { name, path })
    }
}

impl FromStr for LocusSource {
    type Err = PopDiffError;

    /// Accepts `path` or `name=path`.
    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((name, path)) => {
                validate_locus_name(name)?;
                Ok(Self {
                    name: name.to_string(),
                    path: PathBuf::from(path),
                })
            }
            None => Self::from_path(s),
        }
    }
}

/// The sequences of one locus, keyed by sample identifier in file order.
#[derive(Debug, Clone)]
pub struct LocusAlignment {
    pub locus: String,
    pub records: Vec<(String, Vec<u8>)>,
}

impl LocusAlignment {
    pub fn sample_ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|(id, _)| id.as_str())
    }
}

fn normalize_sequence(locus: &str, sample: &str, raw: &[u8]) -> Result<Vec<u8>> {
    raw.iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|&b| {
            let upper = b.to_ascii_uppercase();
            if ALIGNMENT_ALPHABET.contains(&upper) {
                Ok(upper)
            } else {
                Err(PopDiffError::schema(format!(
                    "Locus '{}', sample '{}': invalid sequence character '{}'.",
                    locus, sample, b as char
                )))
            }
        })
        .collect()
}

/// Reads an aligned multi-FASTA stream for one locus.
pub fn read_alignment_from<R: BufRead>(locus: &str, inner: R) -> Result<LocusAlignment> {
    let mut reader = fasta::io::Reader::new(inner);
    let mut records = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for result in reader.records() {
        let record = result.map_err(|e| {
            PopDiffError::schema(format!("Locus '{}': malformed FASTA: {}", locus, e))
        })?;
        let definition = String::from_utf8_lossy(record.name()).into_owned();
        let sample = definition
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_string();
        if sample.is_empty() {
            return Err(PopDiffError::schema(format!(
                "Locus '{}': FASTA record with an empty name.",
                locus
            )));
        }
        if !seen.insert(sample.clone()) {
            return Err(PopDiffError::schema(format!(
                "Locus '{}': sample '{}' appears more than once.",
                locus, sample
            )));
        }
        let sequence = normalize_sequence(locus, &sample, record.sequence().as_ref())?;
        records.push((sample, sequence));
    }

    if records.is_empty() {
        return Err(PopDiffError::schema(format!(
            "Locus '{}': FASTA input contains no records.",
            locus
        )));
    }
    debug!("Locus '{}': read {} FASTA records.", locus, records.len());
    Ok(LocusAlignment {
        locus: locus.to_string(),
        records,
    })
}

pub fn read_alignment(source: &LocusSource) -> Result<LocusAlignment> {
    debug!(
        "Reading locus '{}' from {}",
        source.name,
        source.path.display()
    );
    let file = File::open(&source.path).map_err(|e| PopDiffError::io(&source.path, e))?;
    read_alignment_from(&source.name, BufReader::new(file))
}

#[derive(Debug, Clone, Deserialize)]
struct StrataRow {
    #[serde(alias = "Sample", alias = "id", alias = "ID", alias = "individual")]
    sample: String,
    #[serde(default, alias = "Population", alias = "pop", alias = "Pop")]
    population: Option<String>,
    #[serde(default, alias = "Region", alias = "region_name")]
    region: Option<String>,
}

/// Sample -> (population, region) assignments read from a delimited table.
#[derive(Debug, Clone, Default)]
pub struct StrataTable {
    rows: HashMap<String, (Option<String>, Option<String>)>,
    order: Vec<String>,
    has_region_column: bool,
}

impl StrataTable {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn has_region_column(&self) -> bool {
        self.has_region_column
    }

    pub fn population_of(&self, sample: &str) -> Option<&str> {
        self.rows.get(sample).and_then(|(p, _)| p.as_deref())
    }

    pub fn region_of(&self, sample: &str) -> Option<&str> {
        self.rows.get(sample).and_then(|(_, r)| r.as_deref())
    }

    pub fn contains(&self, sample: &str) -> bool {
        self.rows.contains_key(sample)
    }
}

/// Reads a strata table with a header row (`sample`, `population`, optional
/// `region`).
pub fn read_strata_from<R: Read>(inner: R, delimiter: u8) -> Result<StrataTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(inner);

    let has_region_column = reader
        .headers()?
        .iter()
        .any(|h| matches!(h, "region" | "Region" | "region_name"));

    let mut table = StrataTable {
        has_region_column,
        ..StrataTable::default()
    };
    for (line_idx, result) in reader.deserialize::<StrataRow>().enumerate() {
        let row = result?;
        if row.sample.is_empty() {
            return Err(PopDiffError::schema(format!(
                "Strata row {}: empty sample identifier.",
                line_idx + 2
            )));
        }
        if table.rows.contains_key(&row.sample) {
            return Err(PopDiffError::schema(format!(
                "Strata row {}: sample '{}' is listed more than once.",
                line_idx + 2,
                row.sample
            )));
        }
        table.order.push(row.sample.clone());
        table.rows.insert(row.sample, (row.population, row.region));
    }
    info!(
        "Read strata for {} samples (region column: {}).",
        table.len(),
        table.has_region_column
    );
    Ok(table)
}

/// Tab for `.tsv`/`.tab`/`.txt`, comma otherwise.
pub fn delimiter_for_path(path: &Path) -> u8 {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("tsv") | Some("tab") | Some("txt") => b'\t',
        _ => b',',
    }
}

pub fn read_strata(path: &Path) -> Result<StrataTable> {
    info!("Reading strata table: {}", path.display());
    let file = File::open(path).map_err(|e| PopDiffError::io(path, e))?;
    read_strata_from(BufReader::new(file), delimiter_for_path(path))
}

/// Joins per-locus alignments and strata into a `Dataset`.
///
/// The sample order is that of the first alignment; every other alignment
/// must hold exactly the same sample set.
pub fn assemble_dataset(alignments: Vec<LocusAlignment>, strata: &StrataTable) -> Result<Dataset> {
    let first = alignments
        .first()
        .ok_or_else(|| PopDiffError::schema("No loci were supplied."))?;
    let sample_names: Vec<String> = first.sample_ids().map(String::from).collect();
    let sample_index: HashMap<&str, usize> = sample_names
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    for alignment in alignments.iter().skip(1) {
        let ids: HashSet<&str> = alignment.sample_ids().collect();
        if let Some(missing) = sample_names.iter().find(|s| !ids.contains(s.as_str())) {
            return Err(PopDiffError::schema(format!(
                "Sample '{}' has a sequence for locus '{}' but none for locus '{}'.",
                missing, first.locus, alignment.locus
            )));
        }
        if let Some(extra) = alignment
            .sample_ids()
            .find(|s| !sample_index.contains_key(s))
        {
            return Err(PopDiffError::schema(format!(
                "Sample '{}' has a sequence for locus '{}' but none for locus '{}'.",
                extra, alignment.locus, first.locus
            )));
        }
    }

    let mut labels: Vec<(String, Option<String>)> = Vec::with_capacity(sample_names.len());
    for sample in &sample_names {
        let population = strata.population_of(sample).ok_or_else(|| {
            PopDiffError::schema(format!("Sample '{}' has no population label.", sample))
        })?;
        let region = if strata.has_region_column() {
            Some(
                strata
                    .region_of(sample)
                    .ok_or_else(|| {
                        PopDiffError::schema(format!("Sample '{}' has no region label.", sample))
                    })?
                    .to_string(),
            )
        } else {
            None
        };
        labels.push((population.to_string(), region));
    }

    let unused = strata
        .order
        .iter()
        .filter(|s| !sample_index.contains_key(s.as_str()))
        .count();
    if unused > 0 {
        warn!(
            "{} strata rows refer to samples without sequences; they are ignored.",
            unused
        );
    }

    let strata = Strata::from_labels(&labels)?;

    let loci = alignments
        .into_iter()
        .map(|alignment| {
            let mut by_sample: HashMap<String, Vec<u8>> = alignment.records.into_iter().collect();
            let sequences = sample_names
                .iter()
                .map(|s| by_sample.remove(s).unwrap_or_default())
                .collect();
            Locus::from_sequences(&alignment.locus, sequences)
        })
        .collect::<Result<Vec<_>>>()?;

    Dataset::new(sample_names, strata, loci)
}

/// Reads every locus file in parallel, then the strata table, and builds the
/// dataset.
pub fn load_dataset(sources: &[LocusSource], strata_path: &Path) -> Result<Dataset> {
    if sources.is_empty() {
        return Err(PopDiffError::schema("At least one FASTA file is required."));
    }
    let mut names = HashSet::new();
    for source in sources {
        if !names.insert(source.name.as_str()) {
            return Err(PopDiffError::schema(format!(
                "Locus name '{}' is used by more than one FASTA file.",
                source.name
            )));
        }
    }

    info!("Reading {} FASTA file(s)...", sources.len());
    let alignments = sources
        .par_iter()
        .map(read_alignment)
        .collect::<Result<Vec<_>>>()?;
    let strata = read_strata(strata_path)?;
    let dataset = assemble_dataset(alignments, &strata)?;
    info!(
        "Loaded {} samples in {} populations across {} loci.",
        dataset.n_samples(),
        dataset.strata().n_populations(),
        dataset.loci().len()
    );
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn alignment(locus: &str, text: &str) -> LocusAlignment {
        read_alignment_from(locus, Cursor::new(text.as_bytes().to_vec())).unwrap()
    }

    fn strata(text: &str) -> StrataTable {
        read_strata_from(text.as_bytes(), b',').unwrap()
    }

    #[test]
    fn reads_fasta_records_and_uppercases() {
        let aln = alignment("COI", ">s1 first sample\nacgt\nAC\n>s2\nACGTAA\n");
        assert_eq!(aln.records.len(), 2);
        assert_eq!(aln.records[0].0, "s1");
        assert_eq!(aln.records[0].1, b"ACGTAC".to_vec());
    }

    #[test]
    fn rejects_duplicate_and_invalid_records() {
        let dup = read_alignment_from("COI", Cursor::new(b">s1\nACGT\n>s1\nACGT\n".to_vec()));
        assert!(matches!(dup, Err(PopDiffError::Schema(_))));
        let bad = read_alignment_from("COI", Cursor::new(b">s1\nACXT\n".to_vec()));
        assert!(matches!(bad, Err(PopDiffError::Schema(_))));
    }

    #[test]
    fn locus_source_parsing() {
        let named: LocusSource = "cytb=data/seqs.fa".parse().unwrap();
        assert_eq!(named.name, "cytb");
        let stem: LocusSource = "data/COI.fasta".parse().unwrap();
        assert_eq!(stem.name, "COI");
        assert!("bad.name=x.fa".parse::<LocusSource>().is_err());
    }

    #[test]
    fn assembles_dataset_in_first_file_order() {
        let a = alignment("A", ">s2\nAC\n>s1\nAG\n>s3\nAC\n");
        let b = alignment("B", ">s1\nTT\n>s3\nTA\n>s2\nTT\n");
        let table = strata("sample,population\ns1,p1\ns2,p1\ns3,p2\nghost,p3\n");
        let ds = assemble_dataset(vec![a, b], &table).unwrap();
        assert_eq!(ds.sample_names(), &["s2", "s1", "s3"]);
        assert_eq!(ds.strata().population_names(), vec!["p1", "p2"]);
        let b = ds.locus("B").unwrap();
        assert_eq!(b.haplotype(b.sample_haplotypes()[2]), b"TA");
    }

    #[test]
    fn missing_locus_sequence_is_a_schema_error() {
        let a = alignment("A", ">s1\nAC\n>s2\nAG\n");
        let b = alignment("B", ">s1\nTT\n");
        let table = strata("sample,population\ns1,p1\ns2,p2\n");
        assert!(matches!(
            assemble_dataset(vec![a, b], &table),
            Err(PopDiffError::Schema(_))
        ));
    }

    #[test]
    fn missing_population_is_a_schema_error() {
        let a = alignment("A", ">s1\nAC\n>s2\nAG\n");
        let table = strata("sample,population\ns1,p1\ns2,\n");
        assert!(matches!(
            assemble_dataset(vec![a.clone()], &table),
            Err(PopDiffError::Schema(_))
        ));
        let table = strata("sample,population\ns1,p1\n");
        assert!(matches!(
            assemble_dataset(vec![a], &table),
            Err(PopDiffError::Schema(_))
        ));
    }

    #[test]
    fn region_column_requires_every_region() {
        let a = alignment("A", ">s1\nAC\n>s2\nAG\n");
        let table = strata("sample,population,region\ns1,p1,r1\ns2,p2,\n");
        assert!(table.has_region_column());
        assert!(matches!(
            assemble_dataset(vec![a], &table),
            Err(PopDiffError::Schema(_))
        ));
    }

    #[test]
    fn tab_delimiter_from_extension() {
        assert_eq!(delimiter_for_path(Path::new("strata.tsv")), b'\t');
        assert_eq!(delimiter_for_path(Path::new("strata.CSV")), b',');
    }
}
