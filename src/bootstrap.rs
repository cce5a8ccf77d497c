// bootstrap.rs

use crate::differentiation::{multilocus, Statistic};
use crate::error::{PopDiffError, Result};
use crate::estimate::Estimate;
use crate::frequency::FrequencyTable;
use crate::task_rng;
use indicatif::ProgressBar;
use log::{debug, info, warn};
use ndarray::{Array2, ArrayView1};
use rand::Rng;
use rand_distr::{Binomial, Distribution};
use rayon::prelude::*;
use serde::Serialize;
use statrs::statistics::{Data, OrderStatistics, Statistics};

const BOOTSTRAP_STREAM: u64 = 10;

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub replicates: usize,
    pub seed: u64,
    /// Two-sided confidence level of the reported interval.
    pub confidence: f64,
    pub statistics: Vec<Statistic>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            replicates: 100,
            seed: crate::DEFAULT_SEED,
            confidence: 0.95,
            statistics: Statistic::FREQUENCY_BASED.to_vec(),
        }
    }
}

/// Coverage-adjusted estimate of one population's haplotype distribution
/// (Chao & Jost 2010).
#[derive(Debug, Clone, PartialEq)]
pub struct Assemblage {
    /// Shrunk probabilities of the observed haplotypes, in column order.
    pub observed: Vec<f64>,
    /// Number of undetected haplotypes (Chao1 `f0`).
    pub unseen: usize,
    /// Probability mass shared equally by the undetected haplotypes.
    pub unseen_mass: f64,
    pub coverage: f64,
}

impl Assemblage {
    /// Probabilities over `observed.len() + width` columns; this
    /// population's undetected haplotypes occupy the first `unseen` of the
    /// extra columns.
    pub fn probabilities(&self, width: usize) -> Vec<f64> {
        let mut probs = self.observed.clone();
        let share = if self.unseen > 0 {
            self.unseen_mass / self.unseen as f64
        } else {
            0.0
        };
        probs.extend((0..width).map(|i| if i < self.unseen { share } else { 0.0 }));
        probs
    }
}

/// Builds the assemblage for a row of haplotype counts.
pub fn chao_assemblage(counts: ArrayView1<u32>) -> Assemblage {
    let n: u32 = counts.sum();
    if n == 0 {
        return Assemblage {
            observed: vec![0.0; counts.len()],
            unseen: 0,
            unseen_mass: 0.0,
            coverage: 1.0,
        };
    }
    let nf = n as f64;
    let f1 = counts.iter().filter(|&&c| c == 1).count() as f64;
    let f2 = counts.iter().filter(|&&c| c == 2).count() as f64;

    let coverage = if f1 == 0.0 {
        1.0
    } else {
        let den = (nf - 1.0) * f1 + 2.0 * f2;
        let refinement = if den > 0.0 { (nf - 1.0) * f1 / den } else { 1.0 };
        1.0 - f1 / nf * refinement
    };

    let raw: Vec<f64> = counts.iter().map(|&c| c as f64 / nf).collect();
    let weight: f64 = raw.iter().map(|&p| p * (-nf * p).exp()).sum();
    let lambda = if weight > 0.0 { (1.0 - coverage) / weight } else { 0.0 };
    let mut observed: Vec<f64> = raw
        .iter()
        .map(|&p| (p * (1.0 - lambda * (-nf * p).exp())).max(0.0))
        .collect();

    let f0 = if f2 > 0.0 {
        (nf - 1.0) / nf * f1 * f1 / (2.0 * f2)
    } else {
        (nf - 1.0) / nf * f1 * (f1 - 1.0) / 2.0
    };
    let unseen = f0.max(0.0).ceil() as usize;
    let unseen_mass = 1.0 - coverage;

    if unseen == 0 || unseen_mass <= 0.0 {
        // No undetected haplotypes to carry the missing mass.
        let total: f64 = observed.iter().sum();
        if total > 0.0 {
            observed.iter_mut().for_each(|p| *p /= total);
        } else {
            observed = raw;
        }
        return Assemblage {
            observed,
            unseen: 0,
            unseen_mass: 0.0,
            coverage,
        };
    }

    Assemblage {
        observed,
        unseen,
        unseen_mass,
        coverage,
    }
}

/// Draws `n` items over `probs` by successive conditional binomials.
fn multinomial<R: Rng + ?Sized>(n: u32, probs: &[f64], rng: &mut R) -> Result<Vec<u32>> {
    let mut out = vec![0u32; probs.len()];
    let mut remaining = n as u64;
    let mut mass: f64 = probs.iter().sum();
    for (j, &p) in probs.iter().enumerate() {
        if remaining == 0 || mass <= 0.0 {
            break;
        }
        let conditional = (p / mass).clamp(0.0, 1.0);
        let draw = Binomial::new(remaining, conditional)
            .map_err(|e| PopDiffError::undefined(format!("Binomial draw failed: {}", e)))?
            .sample(rng);
        out[j] = draw as u32;
        remaining -= draw;
        mass -= p;
    }
    if remaining > 0 {
        // Rounding left some items undrawn; give them to the most probable class.
        if let Some(best) = probs
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(j, _)| j)
        {
            out[best] += remaining as u32;
        }
    }
    Ok(out)
}

/// Resamples every population of every table from its assemblage, keeping
/// the sample sizes.
pub fn resample_tables<R: Rng + ?Sized>(tables: &[FrequencyTable], rng: &mut R) -> Result<Vec<FrequencyTable>> {
    tables
        .iter()
        .map(|table| -> Result<FrequencyTable> {
            let assemblages: Vec<Assemblage> = table.counts().rows().into_iter().map(chao_assemblage).collect();
            let width = assemblages.iter().map(|a| a.unseen).max().unwrap_or(0);
            let columns = table.n_alleles() + width;
            let sizes = table.sample_sizes();
            let mut counts = Array2::<u32>::zeros((table.n_populations(), columns));
            for (row, assemblage) in assemblages.iter().enumerate() {
                let drawn = multinomial(sizes[row], &assemblage.probabilities(width), rng)?;
                for (col, c) in drawn.into_iter().enumerate() {
                    counts[[row, col]] = c;
                }
            }
            Ok(FrequencyTable::from_counts(table.locus(), counts))
        })
        .collect()
}

/// One resampled copy of the frequency tables.
#[derive(Debug, Clone)]
pub struct BootstrapReplicate {
    pub index: usize,
    pub tables: Vec<FrequencyTable>,
}

impl BootstrapReplicate {
    /// Replicate `index` of the bootstrap seeded with `seed`. The draw only
    /// depends on `(seed, index)`, not on thread scheduling.
    pub fn draw(tables: &[FrequencyTable], seed: u64, index: usize) -> Result<Self> {
        let mut rng = task_rng(seed, BOOTSTRAP_STREAM, index);
        Ok(Self {
            index,
            tables: resample_tables(tables, &mut rng)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatisticSummary {
    pub statistic: Statistic,
    pub observed: Estimate,
    pub mean: Estimate,
    pub lower: Estimate,
    pub upper: Estimate,
    /// Replicates where the statistic was defined.
    pub defined: usize,
    pub replicates: usize,
}

fn summarise(
    statistic: Statistic,
    observed: Estimate,
    values: Vec<f64>,
    replicates: usize,
    confidence: f64,
) -> StatisticSummary {
    let defined = values.len();
    if defined == 0 {
        return StatisticSummary {
            statistic,
            observed,
            mean: Estimate::NotApplicable,
            lower: Estimate::NotApplicable,
            upper: Estimate::NotApplicable,
            defined,
            replicates,
        };
    }
    let mean = (&values).mean();
    let mut data = Data::new(values);
    StatisticSummary {
        statistic,
        observed,
        mean: Estimate::from(mean),
        lower: Estimate::from(data.quantile((1.0 - confidence) / 2.0)),
        upper: Estimate::from(data.quantile((1.0 + confidence) / 2.0)),
        defined,
        replicates,
    }
}

#[derive(Debug)]
pub struct BootstrapSummary {
    pub replicates: usize,
    pub confidence: f64,
    pub statistics: Vec<(Statistic, Result<StatisticSummary>)>,
}

impl BootstrapSummary {
    pub fn get(&self, statistic: Statistic) -> Option<&Result<StatisticSummary>> {
        self.statistics
            .iter()
            .find(|(s, _)| *s == statistic)
            .map(|(_, r)| r)
    }
}

pub fn chao_bootstrap(tables: &[FrequencyTable], config: &BootstrapConfig) -> Result<BootstrapSummary> {
    chao_bootstrap_with_progress(tables, config, &ProgressBar::hidden())
}

/// Resamples `tables` `config.replicates` times in parallel and summarises
/// each requested statistic over the replicates. Statistics that cannot be
/// bootstrapped from frequencies fail individually.
pub fn chao_bootstrap_with_progress(
    tables: &[FrequencyTable],
    config: &BootstrapConfig,
    progress: &ProgressBar,
) -> Result<BootstrapSummary> {
    if !(config.confidence > 0.0 && config.confidence < 1.0) {
        return Err(PopDiffError::schema(format!(
            "Confidence level must lie strictly between 0 and 1, got {}.",
            config.confidence
        )));
    }
    if config.replicates == 0 {
        return Err(PopDiffError::insufficient("Bootstrap needs at least one replicate."));
    }
    if tables.is_empty() {
        return Err(PopDiffError::insufficient("Bootstrap needs at least one locus."));
    }
    info!(
        "Chao bootstrap: {} replicates over {} loci, {} populations.",
        config.replicates,
        tables.len(),
        tables[0].n_populations()
    );

    let frequency_stats: Vec<Statistic> = config
        .statistics
        .iter()
        .copied()
        .filter(|s| *s != Statistic::PhiSt)
        .collect();

    let per_replicate: Vec<Vec<Estimate>> = (0..config.replicates)
        .into_par_iter()
        .map(|index| -> Result<Vec<Estimate>> {
            let replicate = BootstrapReplicate::draw(tables, config.seed, index)?;
            let estimates = frequency_stats
                .iter()
                .map(|&s| multilocus(s, &replicate.tables))
                .collect::<Result<Vec<_>>>()?;
            progress.inc(1);
            Ok(estimates)
        })
        .collect::<Result<Vec<_>>>()?;

    let statistics = config
        .statistics
        .iter()
        .map(|&statistic| {
            let result = match frequency_stats.iter().position(|&s| s == statistic) {
                None => Err(PopDiffError::undefined(format!(
                    "{} cannot be bootstrapped from haplotype frequencies.",
                    statistic
                ))),
                Some(col) => multilocus(statistic, tables).map(|observed| {
                    let values: Vec<f64> = per_replicate
                        .iter()
                        .filter_map(|row| row[col].value())
                        .collect();
                    if values.len() < config.replicates {
                        debug!(
                            "{}: {} of {} replicates undefined.",
                            statistic,
                            config.replicates - values.len(),
                            config.replicates
                        );
                    }
                    summarise(statistic, observed, values, config.replicates, config.confidence)
                }),
            };
            if let Err(e) = &result {
                warn!("Bootstrap of {} failed: {}", statistic, e);
            }
            (statistic, result)
        })
        .collect();

    Ok(BootstrapSummary {
        replicates: config.replicates,
        confidence: config.confidence,
        statistics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn undifferentiated() -> Vec<FrequencyTable> {
        vec![FrequencyTable::from_counts("L1", array![[10, 10], [10, 10]])]
    }

    #[test]
    fn assemblage_is_a_distribution() {
        let counts = array![3u32, 1, 1, 2, 0, 1];
        let a = chao_assemblage(counts.view());
        assert!(a.unseen > 0);
        assert!(a.coverage < 1.0);
        let probs = a.probabilities(a.unseen + 2);
        assert_eq!(probs.len(), counts.len() + a.unseen + 2);
        assert_abs_diff_eq!(probs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        assert!(probs.iter().all(|&p| p >= 0.0));
        assert_eq!(probs[4], 0.0);
    }

    #[test]
    fn no_singletons_keeps_observed_frequencies() {
        let a = chao_assemblage(array![4u32, 6].view());
        assert_eq!(a.coverage, 1.0);
        assert_eq!(a.unseen, 0);
        assert_abs_diff_eq!(a.observed[0], 0.4, epsilon = 1e-12);
        assert_abs_diff_eq!(a.observed[1], 0.6, epsilon = 1e-12);
    }

    #[test]
    fn resampling_keeps_sample_sizes() {
        let tables = vec![FrequencyTable::from_counts("L1", array![[3, 1, 0, 1], [0, 2, 5, 1]])];
        let mut rng = task_rng(3, BOOTSTRAP_STREAM, 0);
        let resampled = resample_tables(&tables, &mut rng).unwrap();
        assert_eq!(resampled[0].sample_sizes(), tables[0].sample_sizes());
        assert!(resampled[0].n_alleles() >= tables[0].n_alleles());
    }

    #[test]
    fn undifferentiated_populations_average_near_zero() {
        let config = BootstrapConfig {
            replicates: 200,
            seed: 2024,
            ..BootstrapConfig::default()
        };
        let summary = chao_bootstrap(&undifferentiated(), &config).unwrap();
        for statistic in [Statistic::NeiGst, Statistic::JostD] {
            let s = summary.get(statistic).unwrap().as_ref().unwrap();
            let mean = s.mean.value().unwrap();
            assert!(mean.abs() < 0.05, "{} mean = {}", statistic, mean);
            assert_eq!(s.defined, 200);
            assert!(s.lower.value().unwrap() <= s.upper.value().unwrap());
        }
    }

    #[test]
    fn same_seed_same_summary() {
        let tables = vec![
            FrequencyTable::from_counts("L1", array![[6, 3, 1], [1, 4, 5]]),
            FrequencyTable::from_counts("L2", array![[9, 1], [2, 8]]),
        ];
        let config = BootstrapConfig {
            replicates: 40,
            seed: 99,
            ..BootstrapConfig::default()
        };
        let a = chao_bootstrap(&tables, &config).unwrap();
        let b = chao_bootstrap(&tables, &config).unwrap();
        for statistic in Statistic::FREQUENCY_BASED {
            assert_eq!(
                a.get(statistic).unwrap().as_ref().unwrap(),
                b.get(statistic).unwrap().as_ref().unwrap()
            );
        }
    }

    #[test]
    fn phi_st_fails_alone() {
        let config = BootstrapConfig {
            replicates: 5,
            statistics: vec![Statistic::NeiGst, Statistic::PhiSt],
            ..BootstrapConfig::default()
        };
        let summary = chao_bootstrap(&undifferentiated(), &config).unwrap();
        assert!(summary.get(Statistic::NeiGst).unwrap().is_ok());
        assert!(matches!(
            summary.get(Statistic::PhiSt).unwrap(),
            Err(PopDiffError::UndefinedStatistic(_))
        ));
    }

    #[test]
    fn invalid_confidence_is_rejected() {
        let config = BootstrapConfig {
            confidence: 1.0,
            ..BootstrapConfig::default()
        };
        assert!(matches!(
            chao_bootstrap(&undifferentiated(), &config),
            Err(PopDiffError::Schema(_))
        ));
    }
}
