// dataset.rs

use crate::error::{PopDiffError, Result};
use log::debug;
use std::collections::HashMap;

/// Characters that would collide with the `locus:haplotype` labels and the
/// delimited output tables.
const LOCUS_NAME_DELIMITERS: &[char] = &['.', '|', ',', ':', '/', '\\'];

/// Checks that a locus name is non-empty and free of structural delimiters.
pub fn validate_locus_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PopDiffError::schema("Locus name must not be empty."));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| c.is_whitespace() || LOCUS_NAME_DELIMITERS.contains(c))
    {
        return Err(PopDiffError::schema(format!(
            "Locus name '{}' contains the reserved delimiter {:?}.",
            name, bad
        )));
    }
    Ok(())
}

/// A named group of samples, optionally nested in a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Population {
    pub name: String,
    pub region: Option<usize>,
    /// Dataset sample indices, ascending.
    pub members: Vec<usize>,
}

impl Population {
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Population (and optional region) assignment of every sample.
#[derive(Debug, Clone)]
pub struct Strata {
    populations: Vec<Population>,
    regions: Vec<String>,
    sample_population: Vec<usize>,
}

impl Strata {
    /// Builds strata from per-sample `(population, region)` labels given in
    /// dataset sample order.
    ///
    /// Either every sample carries a region or none does, and a population
    /// may only ever appear in one region.
    pub fn from_labels<P, R>(labels: &[(P, Option<R>)]) -> Result<Self>
    where
        P: AsRef<str>,
        R: AsRef<str>,
    {
        let with_region = labels.iter().filter(|(_, r)| r.is_some()).count();
        if with_region != 0 && with_region != labels.len() {
            return Err(PopDiffError::schema(format!(
                "{} of {} samples have a region label; regions must be given for all samples or none.",
                with_region,
                labels.len()
            )));
        }

        let mut populations: Vec<Population> = Vec::new();
        let mut population_lookup: HashMap<String, usize> = HashMap::new();
        let mut regions: Vec<String> = Vec::new();
        let mut region_lookup: HashMap<String, usize> = HashMap::new();
        let mut sample_population = Vec::with_capacity(labels.len());

        for (sample_idx, (pop, region)) in labels.iter().enumerate() {
            let pop = pop.as_ref();
            if pop.trim().is_empty() {
                return Err(PopDiffError::schema(format!(
                    "Sample index {} has an empty population label.",
                    sample_idx
                )));
            }
            let region_idx = match region {
                Some(r) => {
                    let r = r.as_ref();
                    if r.trim().is_empty() {
                        return Err(PopDiffError::schema(format!(
                            "Sample index {} has an empty region label.",
                            sample_idx
                        )));
                    }
                    let next = regions.len();
                    let idx = *region_lookup.entry(r.to_string()).or_insert(next);
                    if idx == next {
                        regions.push(r.to_string());
                    }
                    Some(idx)
                }
                None => None,
            };

            let next = populations.len();
            let pop_idx = *population_lookup.entry(pop.to_string()).or_insert(next);
            if pop_idx == next {
                populations.push(Population {
                    name: pop.to_string(),
                    region: region_idx,
                    members: Vec::new(),
                });
            } else if populations[pop_idx].region != region_idx {
                let describe = |r: Option<usize>| r.map_or("<none>", |i| regions[i].as_str());
                return Err(PopDiffError::schema(format!(
                    "Population '{}' is assigned to more than one region ('{}' and '{}').",
                    pop,
                    describe(populations[pop_idx].region),
                    describe(region_idx)
                )));
            }
            populations[pop_idx].members.push(sample_idx);
            sample_population.push(pop_idx);
        }

        debug!(
            "Strata: {} samples, {} populations, {} regions.",
            sample_population.len(),
            populations.len(),
            regions.len()
        );
        Ok(Self {
            populations,
            regions,
            sample_population,
        })
    }

    pub fn n_samples(&self) -> usize {
        self.sample_population.len()
    }

    pub fn n_populations(&self) -> usize {
        self.populations.len()
    }

    pub fn n_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn has_regions(&self) -> bool {
        !self.regions.is_empty()
    }

    pub fn populations(&self) -> &[Population] {
        &self.populations
    }

    pub fn population(&self, idx: usize) -> &Population {
        &self.populations[idx]
    }

    pub fn population_names(&self) -> Vec<String> {
        self.populations.iter().map(|p| p.name.clone()).collect()
    }

    pub fn regions(&self) -> &[String] {
        &self.regions
    }

    /// Population index of every sample, in dataset sample order.
    pub fn sample_populations(&self) -> &[usize] {
        &self.sample_population
    }

    /// Region index of every population, or `None` for a flat design.
    pub fn population_regions(&self) -> Option<Vec<usize>> {
        self.populations.iter().map(|p| p.region).collect()
    }
}

/// One aligned marker: its distinct haplotypes and which haplotype each
/// sample carries.
#[derive(Debug, Clone)]
pub struct Locus {
    name: String,
    alignment_length: usize,
    haplotypes: Vec<Vec<u8>>,
    sample_haplotypes: Vec<usize>,
}

impl Locus {
    /// Collapses per-sample sequences (dataset sample order) into distinct
    /// haplotypes, numbered by first appearance.
    pub fn from_sequences(name: &str, sequences: Vec<Vec<u8>>) -> Result<Self> {
        validate_locus_name(name)?;
        let alignment_length = match sequences.first() {
            Some(seq) => seq.len(),
            None => {
                return Err(PopDiffError::schema(format!(
                    "Locus '{}' has no sequences.",
                    name
                )))
            }
        };

        let mut haplotypes: Vec<Vec<u8>> = Vec::new();
        let mut lookup: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut sample_haplotypes = Vec::with_capacity(sequences.len());
        for (sample_idx, seq) in sequences.into_iter().enumerate() {
            if seq.len() != alignment_length {
                return Err(PopDiffError::schema(format!(
                    "Locus '{}' is not aligned: sample index {} has length {}, expected {}.",
                    name,
                    sample_idx,
                    seq.len(),
                    alignment_length
                )));
            }
            let idx = match lookup.get(&seq) {
                Some(&idx) => idx,
                None => {
                    let idx = haplotypes.len();
                    lookup.insert(seq.clone(), idx);
                    haplotypes.push(seq);
                    idx
                }
            };
            sample_haplotypes.push(idx);
        }

        debug!(
            "Locus '{}': {} samples, {} haplotypes, {} aligned sites.",
            name,
            sample_haplotypes.len(),
            haplotypes.len(),
            alignment_length
        );
        Ok(Self {
            name: name.to_string(),
            alignment_length,
            haplotypes,
            sample_haplotypes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alignment_length(&self) -> usize {
        self.alignment_length
    }

    pub fn n_haplotypes(&self) -> usize {
        self.haplotypes.len()
    }

    pub fn haplotypes(&self) -> &[Vec<u8>] {
        &self.haplotypes
    }

    pub fn haplotype(&self, idx: usize) -> &[u8] {
        &self.haplotypes[idx]
    }

    pub fn haplotype_label(&self, idx: usize) -> String {
        format!("{}:{}", self.name, idx + 1)
    }

    /// Haplotype index carried by every sample.
    pub fn sample_haplotypes(&self) -> &[usize] {
        &self.sample_haplotypes
    }
}

/// Immutable analysis input: samples, their strata and all loci.
#[derive(Debug, Clone)]
pub struct Dataset {
    sample_names: Vec<String>,
    strata: Strata,
    loci: Vec<Locus>,
}

impl Dataset {
    pub fn new(sample_names: Vec<String>, strata: Strata, loci: Vec<Locus>) -> Result<Self> {
        if sample_names.is_empty() {
            return Err(PopDiffError::schema("Dataset contains no samples."));
        }
        if loci.is_empty() {
            return Err(PopDiffError::schema("Dataset contains no loci."));
        }
        if strata.n_samples() != sample_names.len() {
            return Err(PopDiffError::schema(format!(
                "Strata cover {} samples but the dataset has {}.",
                strata.n_samples(),
                sample_names.len()
            )));
        }
        let mut seen_loci = std::collections::HashSet::new();
        for locus in &loci {
            if !seen_loci.insert(locus.name()) {
                return Err(PopDiffError::schema(format!(
                    "Locus name '{}' is used more than once.",
                    locus.name()
                )));
            }
            if locus.sample_haplotypes().len() != sample_names.len() {
                return Err(PopDiffError::schema(format!(
                    "Locus '{}' has {} samples but the dataset has {}.",
                    locus.name(),
                    locus.sample_haplotypes().len(),
                    sample_names.len()
                )));
            }
        }
        Ok(Self {
            sample_names,
            strata,
            loci,
        })
    }

    pub fn sample_names(&self) -> &[String] {
        &self.sample_names
    }

    pub fn n_samples(&self) -> usize {
        self.sample_names.len()
    }

    pub fn strata(&self) -> &Strata {
        &self.strata
    }

    pub fn loci(&self) -> &[Locus] {
        &self.loci
    }

    pub fn locus(&self, name: &str) -> Option<&Locus> {
        self.loci.iter().find(|l| l.name() == name)
    }
}
