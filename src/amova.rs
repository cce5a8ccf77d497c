// amova.rs

use crate::dataset::Strata;
use crate::distance::DistanceMatrix;
use crate::error::{PopDiffError, Result};
use crate::estimate::Estimate;
use crate::task_rng;
use indicatif::ProgressBar;
use log::{debug, info};
use ndarray::Array2;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;

/// Permuted statistics within this distance of the observed value count as
/// ties (and therefore as "at least as extreme").
const TIE_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct AmovaConfig {
    pub permutations: usize,
    pub seed: u64,
    /// Square the distances before partitioning. Leave unset for distances
    /// that are already squared Euclidean, such as pairwise difference counts.
    pub squared: bool,
}

impl Default for AmovaConfig {
    fn default() -> Self {
        Self {
            permutations: 100,
            seed: crate::DEFAULT_SEED,
            squared: false,
        }
    }
}

/// Sample -> population and optional population -> region assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    sample_population: Vec<usize>,
    population_region: Option<Vec<usize>>,
    n_populations: usize,
    n_regions: usize,
}

impl Hierarchy {
    /// Population and region indices must be dense (`0..P`, `0..G`) with no
    /// empty group, so the grouping partitions every sample.
    pub fn new(sample_population: Vec<usize>, population_region: Option<Vec<usize>>) -> Result<Self> {
        let n_populations = sample_population.iter().max().map_or(0, |&m| m + 1);
        let mut sizes = vec![0usize; n_populations];
        for &p in &sample_population {
            sizes[p] += 1;
        }
        if let Some(empty) = sizes.iter().position(|&s| s == 0) {
            return Err(PopDiffError::insufficient(format!(
                "Population index {} has no samples.",
                empty
            )));
        }

        let n_regions = match &population_region {
            Some(regions) => {
                if regions.len() != n_populations {
                    return Err(PopDiffError::schema(format!(
                        "{} populations but {} region assignments.",
                        n_populations,
                        regions.len()
                    )));
                }
                let n_regions = regions.iter().max().map_or(0, |&m| m + 1);
                let mut used = vec![false; n_regions];
                for &r in regions {
                    used[r] = true;
                }
                if let Some(empty) = used.iter().position(|&u| !u) {
                    return Err(PopDiffError::insufficient(format!(
                        "Region index {} has no populations.",
                        empty
                    )));
                }
                n_regions
            }
            None => 0,
        };

        Ok(Self {
            sample_population,
            population_region,
            n_populations,
            n_regions,
        })
    }

    pub fn from_strata(strata: &Strata) -> Result<Self> {
        Self::new(
            strata.sample_populations().to_vec(),
            strata.population_regions(),
        )
    }

    /// The same grouping without the region level.
    pub fn without_regions(&self) -> Self {
        Self {
            population_region: None,
            n_regions: 0,
            ..self.clone()
        }
    }

    pub fn n_samples(&self) -> usize {
        self.sample_population.len()
    }

    pub fn n_populations(&self) -> usize {
        self.n_populations
    }

    pub fn n_regions(&self) -> usize {
        self.n_regions
    }

    pub fn is_nested(&self) -> bool {
        self.population_region.is_some()
    }

    fn population_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.n_populations];
        for &p in &self.sample_population {
            sizes[p] += 1;
        }
        sizes
    }

    fn sample_regions(&self) -> Option<Vec<usize>> {
        self.population_region.as_ref().map(|regions| {
            self.sample_population
                .iter()
                .map(|&p| regions[p])
                .collect()
        })
    }
}

/// Σ over groups of (Σ_{i<j in group} δ²_ij) / n_group.
fn ssd_within_groups(d: &Array2<f64>, labels: &[usize], n_groups: usize) -> f64 {
    let mut sums = vec![0.0f64; n_groups];
    let mut sizes = vec![0usize; n_groups];
    let n = labels.len();
    for i in 0..n {
        let g = labels[i];
        sizes[g] += 1;
        for j in (i + 1)..n {
            if labels[j] == g {
                sums[g] += d[[i, j]];
            }
        }
    }
    sums.iter()
        .zip(sizes.iter())
        .filter(|(_, &size)| size > 0)
        .map(|(sum, &size)| sum / size as f64)
        .sum()
}

/// Variance components (σ²) of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VarianceComponents {
    pub among_regions: Option<f64>,
    pub among_populations: f64,
    pub within_populations: f64,
}

impl VarianceComponents {
    pub fn total(&self) -> f64 {
        self.among_regions.unwrap_or(0.0) + self.among_populations + self.within_populations
    }

    /// Correlation of samples within populations relative to the whole.
    pub fn phi_st(&self) -> Estimate {
        Estimate::ratio(
            self.among_regions.unwrap_or(0.0) + self.among_populations,
            self.total(),
        )
    }

    /// Correlation within populations relative to their region.
    pub fn phi_sc(&self) -> Estimate {
        match self.among_regions {
            Some(_) => Estimate::ratio(
                self.among_populations,
                self.among_populations + self.within_populations,
            ),
            None => Estimate::NotApplicable,
        }
    }

    /// Correlation within regions relative to the whole.
    pub fn phi_ct(&self) -> Estimate {
        match self.among_regions {
            Some(a) => Estimate::ratio(a, self.total()),
            None => Estimate::NotApplicable,
        }
    }

    fn phi(&self, statistic: PhiStatistic) -> Estimate {
        match statistic {
            PhiStatistic::St => self.phi_st(),
            PhiStatistic::Sc => self.phi_sc(),
            PhiStatistic::Ct => self.phi_ct(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Source {
    AmongRegions,
    AmongPopulations,
    WithinPopulations,
    Total,
}

impl Source {
    pub fn name(&self) -> &'static str {
        match self {
            Source::AmongRegions => "among_regions",
            Source::AmongPopulations => "among_populations",
            Source::WithinPopulations => "within_populations",
            Source::Total => "total",
        }
    }
}

/// One line of the AMOVA table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmovaRow {
    pub source: Source,
    pub df: usize,
    pub ssd: f64,
    pub msd: f64,
    pub sigma: f64,
    pub percent: Estimate,
}

#[derive(Debug, Clone)]
struct Decomposition {
    rows: Vec<AmovaRow>,
    components: VarianceComponents,
}

fn decompose(d: &Array2<f64>, h: &Hierarchy) -> Result<Decomposition> {
    let n = h.n_samples();
    let p = h.n_populations();
    if p < 2 {
        return Err(PopDiffError::insufficient(format!(
            "AMOVA needs at least two populations, found {}.",
            p
        )));
    }
    if n <= p {
        return Err(PopDiffError::insufficient(format!(
            "AMOVA needs more samples ({}) than populations ({}).",
            n, p
        )));
    }
    let nf = n as f64;
    let sizes = h.population_sizes();

    let ssd_total = ssd_within_groups(d, &vec![0; n], 1);
    let ssd_within = ssd_within_groups(d, &h.sample_population, p);
    let df_within = n - p;
    let msd_within = ssd_within / df_within as f64;
    let sigma_within = msd_within;

    let (rows, components) = match (&h.population_region, h.sample_regions()) {
        (Some(population_region), Some(sample_regions)) => {
            let g = h.n_regions();
            if g < 2 {
                return Err(PopDiffError::insufficient(format!(
                    "Hierarchical AMOVA needs at least two regions, found {}.",
                    g
                )));
            }
            if p <= g {
                return Err(PopDiffError::insufficient(format!(
                    "Hierarchical AMOVA needs more populations ({}) than regions ({}).",
                    p, g
                )));
            }
            let ssd_within_regions = ssd_within_groups(d, &sample_regions, g);
            let ssd_regions = ssd_total - ssd_within_regions;
            let ssd_populations = ssd_within_regions - ssd_within;
            let df_regions = g - 1;
            let df_populations = p - g;
            let msd_regions = ssd_regions / df_regions as f64;
            let msd_populations = ssd_populations / df_populations as f64;

            let mut region_n = vec![0.0f64; g];
            let mut region_sq = vec![0.0f64; g];
            for (pop, &size) in sizes.iter().enumerate() {
                let r = population_region[pop];
                region_n[r] += size as f64;
                region_sq[r] += (size * size) as f64;
            }
            let nested_sq: f64 = region_sq
                .iter()
                .zip(region_n.iter())
                .map(|(sq, ng)| sq / ng)
                .sum();
            let pop_sq: f64 = sizes.iter().map(|&s| (s * s) as f64).sum();
            let region_n_sq: f64 = region_n.iter().map(|ng| ng * ng).sum();

            let n_coef = (nf - nested_sq) / df_populations as f64;
            let n_prime = (nested_sq - pop_sq / nf) / df_regions as f64;
            let n_second = (nf - region_n_sq / nf) / df_regions as f64;

            let sigma_populations = (msd_populations - sigma_within) / n_coef;
            let sigma_regions =
                (msd_regions - sigma_within - n_prime * sigma_populations) / n_second;

            let components = VarianceComponents {
                among_regions: Some(sigma_regions),
                among_populations: sigma_populations,
                within_populations: sigma_within,
            };
            let rows = vec![
                (Source::AmongRegions, df_regions, ssd_regions, msd_regions, sigma_regions),
                (
                    Source::AmongPopulations,
                    df_populations,
                    ssd_populations,
                    msd_populations,
                    sigma_populations,
                ),
                (Source::WithinPopulations, df_within, ssd_within, msd_within, sigma_within),
            ];
            (rows, components)
        }
        _ => {
            let ssd_populations = ssd_total - ssd_within;
            let df_populations = p - 1;
            let msd_populations = ssd_populations / df_populations as f64;
            let pop_sq: f64 = sizes.iter().map(|&s| (s * s) as f64).sum();
            let n_coef = (nf - pop_sq / nf) / df_populations as f64;
            let sigma_populations = (msd_populations - sigma_within) / n_coef;

            let components = VarianceComponents {
                among_regions: None,
                among_populations: sigma_populations,
                within_populations: sigma_within,
            };
            let rows = vec![
                (
                    Source::AmongPopulations,
                    df_populations,
                    ssd_populations,
                    msd_populations,
                    sigma_populations,
                ),
                (Source::WithinPopulations, df_within, ssd_within, msd_within, sigma_within),
            ];
            (rows, components)
        }
    };

    let sigma_total = components.total();
    let mut rows: Vec<AmovaRow> = rows
        .into_iter()
        .map(|(source, df, ssd, msd, sigma)| AmovaRow {
            source,
            df,
            ssd,
            msd,
            sigma,
            percent: Estimate::ratio(100.0 * sigma, sigma_total),
        })
        .collect();
    rows.push(AmovaRow {
        source: Source::Total,
        df: n - 1,
        ssd: ssd_total,
        msd: ssd_total / (n - 1) as f64,
        sigma: sigma_total,
        percent: Estimate::ratio(100.0 * sigma_total, sigma_total),
    });

    Ok(Decomposition { rows, components })
}

/// Variance components without significance testing.
pub fn variance_components(distances: &DistanceMatrix, hierarchy: &Hierarchy) -> Result<VarianceComponents> {
    check_dimensions(distances, hierarchy)?;
    Ok(decompose(distances.values(), hierarchy)?.components)
}

fn check_dimensions(distances: &DistanceMatrix, hierarchy: &Hierarchy) -> Result<()> {
    if distances.len() != hierarchy.n_samples() {
        return Err(PopDiffError::schema(format!(
            "Distance matrix covers {} samples but the grouping has {}.",
            distances.len(),
            hierarchy.n_samples()
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PhiStatistic {
    St,
    Sc,
    Ct,
}

impl PhiStatistic {
    pub fn name(&self) -> &'static str {
        match self {
            PhiStatistic::St => "Phi_ST",
            PhiStatistic::Sc => "Phi_SC",
            PhiStatistic::Ct => "Phi_CT",
        }
    }

    fn stream(&self) -> u64 {
        match self {
            PhiStatistic::St => 1,
            PhiStatistic::Sc => 2,
            PhiStatistic::Ct => 3,
        }
    }
}

impl fmt::Display for PhiStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observed Phi statistic with its permutation p-value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhiTest {
    pub statistic: PhiStatistic,
    pub observed: Estimate,
    /// `None` when no permutations were run.
    pub p_value: Option<f64>,
    pub permutations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AmovaTable {
    pub nested: bool,
    pub n_samples: usize,
    pub n_populations: usize,
    pub n_regions: usize,
    pub rows: Vec<AmovaRow>,
    pub components: VarianceComponents,
    pub tests: Vec<PhiTest>,
}

impl AmovaTable {
    pub fn row(&self, source: Source) -> Option<&AmovaRow> {
        self.rows.iter().find(|r| r.source == source)
    }

    pub fn test(&self, statistic: PhiStatistic) -> Option<&PhiTest> {
        self.tests.iter().find(|t| t.statistic == statistic)
    }
}

/// Ratio used as the permutation test statistic; zero total variance counts
/// as no structure so the test stays defined.
fn test_value(components: &VarianceComponents, statistic: PhiStatistic) -> f64 {
    components.phi(statistic).value().unwrap_or(0.0)
}

fn permuted_hierarchy<R: rand::Rng>(
    h: &Hierarchy,
    statistic: PhiStatistic,
    rng: &mut R,
) -> Hierarchy {
    let mut permuted = h.clone();
    match statistic {
        PhiStatistic::St => permuted.sample_population.shuffle(rng),
        PhiStatistic::Sc => {
            if let Some(sample_regions) = h.sample_regions() {
                for region in 0..h.n_regions {
                    let members: Vec<usize> = (0..h.n_samples())
                        .filter(|&s| sample_regions[s] == region)
                        .collect();
                    let mut labels: Vec<usize> =
                        members.iter().map(|&s| h.sample_population[s]).collect();
                    labels.shuffle(rng);
                    for (&s, label) in members.iter().zip(labels) {
                        permuted.sample_population[s] = label;
                    }
                }
            }
        }
        PhiStatistic::Ct => {
            if let Some(regions) = permuted.population_region.as_mut() {
                regions.shuffle(rng);
            }
        }
    }
    permuted
}

fn permutation_test(
    d: &Array2<f64>,
    h: &Hierarchy,
    statistic: PhiStatistic,
    observed: &VarianceComponents,
    config: &AmovaConfig,
    progress: &ProgressBar,
) -> Result<PhiTest> {
    let observed_estimate = observed.phi(statistic);
    if config.permutations == 0 {
        return Ok(PhiTest {
            statistic,
            observed: observed_estimate,
            p_value: None,
            permutations: 0,
        });
    }
    let observed_value = test_value(observed, statistic);

    let null: Vec<f64> = (0..config.permutations)
        .into_par_iter()
        .map(|i| {
            let mut rng = task_rng(config.seed, statistic.stream(), i);
            let permuted = permuted_hierarchy(h, statistic, &mut rng);
            let value = decompose(d, &permuted).map(|dec| test_value(&dec.components, statistic));
            progress.inc(1);
            value
        })
        .collect::<Result<Vec<_>>>()?;

    let as_extreme = null
        .iter()
        .filter(|&&v| v >= observed_value - TIE_TOLERANCE)
        .count();
    let p_value = (as_extreme + 1) as f64 / (config.permutations + 1) as f64;
    debug!(
        "{}: observed {:.6}, {} / {} permutations at least as large, p = {:.4}",
        statistic, observed_value, as_extreme, config.permutations, p_value
    );
    Ok(PhiTest {
        statistic,
        observed: observed_estimate,
        p_value: Some(p_value),
        permutations: config.permutations,
    })
}

pub fn amova(distances: &DistanceMatrix, hierarchy: &Hierarchy, config: &AmovaConfig) -> Result<AmovaTable> {
    amova_with_progress(distances, hierarchy, config, &ProgressBar::hidden())
}

/// Partitions molecular variance and tests every Phi statistic of the design
/// by permutation. The progress bar advances once per permutation.
pub fn amova_with_progress(
    distances: &DistanceMatrix,
    hierarchy: &Hierarchy,
    config: &AmovaConfig,
    progress: &ProgressBar,
) -> Result<AmovaTable> {
    check_dimensions(distances, hierarchy)?;
    let squared;
    let d = if config.squared {
        squared = distances.squared();
        squared.values()
    } else {
        distances.values()
    };

    info!(
        "AMOVA: {} samples, {} populations{}, {} permutations per test.",
        hierarchy.n_samples(),
        hierarchy.n_populations(),
        if hierarchy.is_nested() {
            format!(", {} regions", hierarchy.n_regions())
        } else {
            String::new()
        },
        config.permutations
    );

    let observed = decompose(d, hierarchy)?;
    let statistics: &[PhiStatistic] = if hierarchy.is_nested() {
        &[PhiStatistic::St, PhiStatistic::Sc, PhiStatistic::Ct]
    } else {
        &[PhiStatistic::St]
    };
    let tests = statistics
        .iter()
        .map(|&s| permutation_test(d, hierarchy, s, &observed.components, config, progress))
        .collect::<Result<Vec<_>>>()?;

    Ok(AmovaTable {
        nested: hierarchy.is_nested(),
        n_samples: hierarchy.n_samples(),
        n_populations: hierarchy.n_populations(),
        n_regions: hierarchy.n_regions(),
        rows: observed.rows,
        components: observed.components,
        tests,
    })
}
