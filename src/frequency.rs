// frequency.rs

use crate::dataset::{Locus, Strata};
use crate::error::{PopDiffError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::Serialize;

/// Haplotype counts of one locus: populations as rows, haplotypes as columns.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTable {
    locus: String,
    counts: Array2<u32>,
}

/// Nei & Chesser (1983) heterozygosities for haploid samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Heterozygosity {
    /// Observed mean within-population diversity, `mean_i(1 - Σ_j p_ij²)`.
    pub hs_observed: f64,
    /// Observed total diversity, `1 - Σ_j p̄_j²`.
    pub ht_observed: f64,
    /// Bias-corrected within-population diversity.
    pub hs: f64,
    /// Bias-corrected total diversity.
    pub ht: f64,
    /// Harmonic mean population size.
    pub harmonic_n: f64,
    pub n_populations: usize,
}

impl FrequencyTable {
    /// Counts haplotypes of `locus` in each of the given populations.
    pub fn from_locus(locus: &Locus, strata: &Strata, populations: &[usize]) -> Result<Self> {
        let mut counts = Array2::<u32>::zeros((populations.len(), locus.n_haplotypes()));
        let haplotypes = locus.sample_haplotypes();
        for (row, &pop_idx) in populations.iter().enumerate() {
            let pop = strata.population(pop_idx);
            if pop.members.is_empty() {
                return Err(PopDiffError::insufficient(format!(
                    "Population '{}' has no samples.",
                    pop.name
                )));
            }
            for &sample in &pop.members {
                counts[[row, haplotypes[sample]]] += 1;
            }
        }
        Ok(Self {
            locus: locus.name().to_string(),
            counts,
        })
    }

    pub fn from_counts(locus: impl Into<String>, counts: Array2<u32>) -> Self {
        Self {
            locus: locus.into(),
            counts,
        }
    }

    pub fn locus(&self) -> &str {
        &self.locus
    }

    pub fn counts(&self) -> &Array2<u32> {
        &self.counts
    }

    pub fn n_populations(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_alleles(&self) -> usize {
        self.counts.ncols()
    }

    pub fn sample_sizes(&self) -> Array1<u32> {
        self.counts.sum_axis(Axis(1))
    }

    /// Row-wise relative frequencies; empty rows stay zero.
    pub fn frequencies(&self) -> Array2<f64> {
        let mut freqs = self.counts.mapv(|c| c as f64);
        for mut row in freqs.rows_mut() {
            let total = row.sum();
            if total > 0.0 {
                row /= total;
            }
        }
        freqs
    }

    /// Corrected heterozygosities, or `None` when they are undefined
    /// (fewer than two populations, an empty population, or a harmonic mean
    /// sample size of one or less).
    pub fn heterozygosity(&self) -> Option<Heterozygosity> {
        let k = self.n_populations();
        if k < 2 {
            return None;
        }
        let sizes = self.sample_sizes();
        if sizes.iter().any(|&n| n == 0) {
            return None;
        }
        let harmonic_n = k as f64 / sizes.iter().map(|&n| 1.0 / n as f64).sum::<f64>();
        if harmonic_n <= 1.0 {
            return None;
        }

        let freqs = self.frequencies();
        let hs_observed = freqs
            .rows()
            .into_iter()
            .map(|row| 1.0 - row.iter().map(|p| p * p).sum::<f64>())
            .sum::<f64>()
            / k as f64;
        let mean_freqs = freqs.mean_axis(Axis(0))?;
        let ht_observed = 1.0 - mean_freqs.iter().map(|p| p * p).sum::<f64>();

        let hs = harmonic_n / (harmonic_n - 1.0) * hs_observed;
        let ht = ht_observed + hs / (k as f64 * harmonic_n);
        Some(Heterozygosity {
            hs_observed,
            ht_observed,
            hs,
            ht,
            harmonic_n,
            n_populations: k,
        })
    }
}
