// differentiation.rs

use crate::amova::{variance_components, Hierarchy};
use crate::dataset::Dataset;
use crate::distance::{pooled_sample_distances, DistanceMatrix, DistanceModel};
use crate::error::{PopDiffError, Result};
use crate::estimate::Estimate;
use crate::frequency::{FrequencyTable, Heterozygosity};
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Statistic {
    NeiGst,
    HedrickGst,
    JostD,
    PhiSt,
}

impl Statistic {
    pub const ALL: [Statistic; 4] = [
        Statistic::NeiGst,
        Statistic::HedrickGst,
        Statistic::JostD,
        Statistic::PhiSt,
    ];

    /// Statistics derived from haplotype frequencies alone.
    pub const FREQUENCY_BASED: [Statistic; 3] =
        [Statistic::NeiGst, Statistic::HedrickGst, Statistic::JostD];

    pub fn name(&self) -> &'static str {
        match self {
            Statistic::NeiGst => "nei_gst",
            Statistic::HedrickGst => "hedrick_gst",
            Statistic::JostD => "jost_d",
            Statistic::PhiSt => "phi_st",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nei_gst" | "gst" => Ok(Statistic::NeiGst),
            "hedrick_gst" | "gst_prime" | "gstp" => Ok(Statistic::HedrickGst),
            "jost_d" | "d" => Ok(Statistic::JostD),
            "phi_st" | "phist" => Ok(Statistic::PhiSt),
            other => Err(format!(
                "Unknown statistic '{}'. Expected one of nei_gst, hedrick_gst, jost_d, phi_st.",
                other
            )),
        }
    }
}

fn gst_from(hs: f64, ht: f64) -> Estimate {
    if ht == 0.0 {
        return Estimate::NotApplicable;
    }
    Estimate::ratio(ht - hs, ht)
}

fn hedrick_from(hs: f64, ht: f64, k: usize) -> Estimate {
    let k = k as f64;
    // Gst' = Gst / Gst_max with Gst_max = (k-1)(1-Hs)/(k-1+Hs)
    gst_from(hs, ht).map(|gst| Estimate::ratio(gst * (k - 1.0 + hs), (k - 1.0) * (1.0 - hs)).value())
}

fn jost_from(hs: f64, ht: f64, k: usize) -> Estimate {
    if ht == 0.0 {
        return Estimate::NotApplicable;
    }
    let k = k as f64;
    Estimate::ratio(ht - hs, 1.0 - hs).map(|d| Some(d * k / (k - 1.0)))
}

/// Nei's Gst, `(Ht - Hs) / Ht`.
pub fn nei_gst(h: &Heterozygosity) -> Estimate {
    gst_from(h.hs, h.ht)
}

/// Hedrick's standardized Gst'.
pub fn hedrick_gst(h: &Heterozygosity) -> Estimate {
    hedrick_from(h.hs, h.ht, h.n_populations)
}

/// Jost's D.
pub fn jost_d(h: &Heterozygosity) -> Estimate {
    jost_from(h.hs, h.ht, h.n_populations)
}

/// Frequency-based differentiation at a single locus.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocusDifferentiation {
    pub locus: String,
    pub heterozygosity: Option<Heterozygosity>,
    pub nei_gst: Estimate,
    pub hedrick_gst: Estimate,
    pub jost_d: Estimate,
}

impl LocusDifferentiation {
    pub fn from_table(table: &FrequencyTable) -> Self {
        let heterozygosity = table.heterozygosity();
        let (nei_gst, hedrick_gst, jost_d) = match &heterozygosity {
            Some(h) => (nei_gst(h), hedrick_gst(h), jost_d(h)),
            None => Default::default(),
        };
        Self {
            locus: table.locus().to_string(),
            heterozygosity,
            nei_gst,
            hedrick_gst,
            jost_d,
        }
    }

    /// `None` for statistics that are not frequency based.
    pub fn get(&self, statistic: Statistic) -> Option<Estimate> {
        match statistic {
            Statistic::NeiGst => Some(self.nei_gst),
            Statistic::HedrickGst => Some(self.hedrick_gst),
            Statistic::JostD => Some(self.jost_d),
            Statistic::PhiSt => None,
        }
    }
}

/// Combines per-locus heterozygosities into a multi-locus estimate.
///
/// Gst and Gst' use the mean Hs and Ht over loci. D is the harmonic mean of
/// the per-locus values when every defined value is positive, and is
/// otherwise computed from the mean heterozygosities. Data that is
/// monomorphic at every locus carries no differentiation and gives 0.
pub fn combine_loci(statistic: Statistic, loci: &[LocusDifferentiation]) -> Result<Estimate> {
    if statistic == Statistic::PhiSt {
        return Err(PopDiffError::undefined(
            "PhiST is derived from sequence distances, not haplotype frequencies.",
        ));
    }
    let hets: Vec<&Heterozygosity> = loci.iter().filter_map(|l| l.heterozygosity.as_ref()).collect();
    if hets.is_empty() || hets.len() != loci.len() {
        return Ok(Estimate::NotApplicable);
    }
    let k = hets[0].n_populations;
    let n_loci = hets.len() as f64;
    let hs = hets.iter().map(|h| h.hs).sum::<f64>() / n_loci;
    let ht = hets.iter().map(|h| h.ht).sum::<f64>() / n_loci;
    if ht == 0.0 {
        return Ok(Estimate::Value(0.0));
    }

    Ok(match statistic {
        Statistic::NeiGst => gst_from(hs, ht),
        Statistic::HedrickGst => hedrick_from(hs, ht, k),
        Statistic::JostD => {
            let defined: Vec<f64> = loci.iter().filter_map(|l| l.jost_d.value()).collect();
            if !defined.is_empty() && defined.iter().all(|&d| d > 0.0) {
                Estimate::from(defined.len() as f64 / defined.iter().map(|d| 1.0 / d).sum::<f64>())
            } else {
                jost_from(hs, ht, k)
            }
        }
        Statistic::PhiSt => Estimate::NotApplicable,
    })
}

/// Multi-locus estimate straight from frequency tables.
pub fn multilocus(statistic: Statistic, tables: &[FrequencyTable]) -> Result<Estimate> {
    let loci: Vec<LocusDifferentiation> = tables.iter().map(LocusDifferentiation::from_table).collect();
    combine_loci(statistic, &loci)
}

/// PhiST between the given populations: one-level AMOVA on `distances`
/// restricted to their samples, squared first when `squared` is set.
pub fn phi_st(
    distances: &DistanceMatrix,
    squared: bool,
    dataset: &Dataset,
    populations: &[usize],
) -> Result<Estimate> {
    if !distinct_populations(populations) {
        return Ok(Estimate::NotApplicable);
    }
    let strata = dataset.strata();
    let n: usize = populations.iter().map(|&pop| strata.population(pop).size()).sum();
    if n <= populations.len() {
        return Ok(Estimate::NotApplicable);
    }
    let mut samples = Vec::new();
    let mut labels = Vec::new();
    for (group, &pop) in populations.iter().enumerate() {
        for &s in &strata.population(pop).members {
            samples.push(s);
            labels.push(group);
        }
    }
    let hierarchy = Hierarchy::new(labels, None)?;
    let mut restricted = distances.subset(&samples);
    if squared {
        restricted = restricted.squared();
    }
    let components = variance_components(&restricted, &hierarchy)?;
    Ok(components.phi_st())
}

fn distinct_populations(populations: &[usize]) -> bool {
    if populations.len() < 2 {
        return false;
    }
    let mut sorted = populations.to_vec();
    sorted.sort_unstable();
    sorted.windows(2).all(|w| w[0] != w[1])
}

/// Per-statistic results for all populations together.
#[derive(Debug)]
pub struct DifferentiationReport {
    pub populations: Vec<String>,
    pub overall: Vec<(Statistic, Result<Estimate>)>,
    pub loci: Result<Vec<LocusDifferentiation>>,
}

impl DifferentiationReport {
    pub fn overall(&self, statistic: Statistic) -> Option<&Result<Estimate>> {
        self.overall
            .iter()
            .find(|(s, _)| *s == statistic)
            .map(|(_, r)| r)
    }
}

/// Symmetric matrix of one statistic over all population pairs; the
/// diagonal is not applicable.
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseMatrix {
    pub statistic: Statistic,
    pub populations: Vec<String>,
    pub values: Array2<Estimate>,
}

impl PairwiseMatrix {
    pub fn get(&self, a: usize, b: usize) -> Estimate {
        self.values[[a, b]]
    }

    /// Upper-triangle entries as `(pop1, pop2, estimate)`.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str, Estimate)> + '_ {
        let n = self.populations.len();
        (0..n).flat_map(move |i| {
            ((i + 1)..n).map(move |j| {
                (
                    self.populations[i].as_str(),
                    self.populations[j].as_str(),
                    self.values[[i, j]],
                )
            })
        })
    }
}

/// Computes differentiation statistics over a loaded dataset. The pooled
/// sample distance matrix for PhiST is computed once up front; if that fails
/// only PhiST requests report the error.
pub struct DifferentiationEngine<'a> {
    dataset: &'a Dataset,
    distances: Result<DistanceMatrix>,
    squared: bool,
}

impl<'a> DifferentiationEngine<'a> {
    pub fn new(dataset: &'a Dataset, model: DistanceModel, squared: bool) -> Self {
        let distances = pooled_sample_distances(dataset, model);
        if let Err(e) = &distances {
            warn!("Pooled {} distances unavailable, PhiST will not be computed: {}", model, e);
        }
        Self {
            dataset,
            distances,
            squared,
        }
    }

    pub fn with_distances(dataset: &'a Dataset, distances: DistanceMatrix, squared: bool) -> Self {
        Self {
            dataset,
            distances: Ok(distances),
            squared,
        }
    }

    pub fn dataset(&self) -> &Dataset {
        self.dataset
    }

    /// The pooled sample distances as computed, before any squaring.
    pub fn distances(&self) -> Result<&DistanceMatrix> {
        self.distances.as_ref().map_err(|e| {
            PopDiffError::undefined(format!("Pooled distance matrix unavailable: {}", e))
        })
    }

    /// One frequency table per locus for the given populations, in that order.
    pub fn frequency_tables(&self, populations: &[usize]) -> Result<Vec<FrequencyTable>> {
        self.dataset
            .loci()
            .iter()
            .map(|locus| FrequencyTable::from_locus(locus, self.dataset.strata(), populations))
            .collect()
    }

    pub fn per_locus(&self, populations: &[usize]) -> Result<Vec<LocusDifferentiation>> {
        Ok(self
            .frequency_tables(populations)?
            .iter()
            .map(LocusDifferentiation::from_table)
            .collect())
    }

    /// Multi-locus estimate among `populations`. A population compared with
    /// itself, or a single population, is not applicable.
    pub fn compare(&self, populations: &[usize], statistic: Statistic) -> Result<Estimate> {
        if !distinct_populations(populations) {
            return Ok(Estimate::NotApplicable);
        }
        match statistic {
            Statistic::PhiSt => phi_st(self.distances()?, self.squared, self.dataset, populations),
            _ => combine_loci(statistic, &self.per_locus(populations)?),
        }
    }

    /// Every requested statistic over all populations, plus per-locus
    /// frequency statistics.
    pub fn overall(&self, statistics: &[Statistic]) -> DifferentiationReport {
        let strata = self.dataset.strata();
        let all: Vec<usize> = (0..strata.n_populations()).collect();
        if all.len() < 2 {
            warn!(
                "Only {} population(s): differentiation is not applicable.",
                all.len()
            );
        }
        let loci = self.per_locus(&all);
        let overall = statistics
            .iter()
            .map(|&statistic| {
                let result = match (&loci, statistic) {
                    (_, _) if all.len() < 2 => Ok(Estimate::NotApplicable),
                    (_, Statistic::PhiSt) => self.compare(&all, statistic),
                    (Ok(loci), _) => combine_loci(statistic, loci),
                    (Err(e), _) => Err(e.duplicate()),
                };
                match &result {
                    Ok(estimate) => info!("Overall {}: {:.6}", statistic, estimate),
                    Err(e) => warn!("Overall {} failed: {}", statistic, e),
                }
                (statistic, result)
            })
            .collect();

        DifferentiationReport {
            populations: strata.population_names(),
            overall,
            loci,
        }
    }

    /// All population pairs in parallel.
    pub fn pairwise(&self, statistic: Statistic) -> Result<PairwiseMatrix> {
        let strata = self.dataset.strata();
        let p = strata.n_populations();
        if p < 2 {
            return Err(PopDiffError::insufficient(format!(
                "Pairwise {} needs at least two populations, found {}.",
                statistic, p
            )));
        }
        let pairs: Vec<(usize, usize)> = (0..p)
            .flat_map(|i| ((i + 1)..p).map(move |j| (i, j)))
            .collect();
        debug!("Pairwise {}: {} population pairs.", statistic, pairs.len());

        let estimates = pairs
            .par_iter()
            .map(|&(i, j)| self.compare(&[i, j], statistic))
            .collect::<Result<Vec<_>>>()?;

        let mut values = Array2::from_elem((p, p), Estimate::NotApplicable);
        for (&(i, j), estimate) in pairs.iter().zip(estimates) {
            values[[i, j]] = estimate;
            values[[j, i]] = estimate;
        }
        Ok(PairwiseMatrix {
            statistic,
            populations: strata.population_names(),
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Locus, Strata};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn build(populations: &[(&str, &[&str])], extra_locus: Option<&[&str]>) -> Dataset {
        let mut labels = Vec::new();
        let mut sequences = Vec::new();
        for (pop, seqs) in populations {
            for s in seqs.iter() {
                labels.push((*pop, None::<&str>));
                sequences.push(s.as_bytes().to_vec());
            }
        }
        let names = (0..labels.len()).map(|i| format!("s{}", i)).collect();
        let mut loci = vec![Locus::from_sequences("L1", sequences).unwrap()];
        if let Some(extra) = extra_locus {
            let extra = extra.iter().map(|s| s.as_bytes().to_vec()).collect();
            loci.push(Locus::from_sequences("L2", extra).unwrap());
        }
        Dataset::new(names, Strata::from_labels(&labels).unwrap(), loci).unwrap()
    }

    fn three_populations() -> Dataset {
        build(
            &[
                ("north", &["AAAA", "AAAA", "AAAT", "AACT"]),
                ("south", &["AAAT", "GAAT", "GAAT", "GACT"]),
                ("west", &["GGCT", "GGCT", "GACT", "AAAA"]),
            ],
            None,
        )
    }

    #[test]
    fn fixed_differences_are_complete_differentiation() {
        let table = FrequencyTable::from_counts("L1", array![[10, 0], [0, 10]]);
        let h = table.heterozygosity().unwrap();
        assert_abs_diff_eq!(nei_gst(&h).value().unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(hedrick_gst(&h).value().unwrap(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(jost_d(&h).value().unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn hand_computed_locus() {
        // ñ = 10, Hs = 10/9 * 0.25, Ht = 0.375 + Hs/20
        let table = FrequencyTable::from_counts("L1", array![[5, 5], [10, 0]]);
        let h = table.heterozygosity().unwrap();
        let hs = 10.0 / 9.0 * 0.25;
        let ht = 0.375 + hs / 20.0;
        let gst = (ht - hs) / ht;
        assert_abs_diff_eq!(nei_gst(&h).value().unwrap(), gst, epsilon = 1e-12);
        assert_abs_diff_eq!(
            hedrick_gst(&h).value().unwrap(),
            gst * (1.0 + hs) / (1.0 - hs),
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(
            jost_d(&h).value().unwrap(),
            (ht - hs) / (1.0 - hs) * 2.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn self_comparison_is_not_applicable() {
        let data = three_populations();
        let engine = DifferentiationEngine::new(&data, DistanceModel::Count, false);
        for statistic in Statistic::ALL {
            assert_eq!(engine.compare(&[1, 1], statistic).unwrap(), Estimate::NotApplicable);
            assert_eq!(engine.compare(&[2], statistic).unwrap(), Estimate::NotApplicable);
        }
    }

    #[test]
    fn single_population_dataset_is_not_applicable() {
        let data = build(&[("only", &["AAAA", "AAAT", "GAAT"])], None);
        let engine = DifferentiationEngine::new(&data, DistanceModel::Count, false);
        let report = engine.overall(&Statistic::ALL);
        for statistic in Statistic::ALL {
            assert_eq!(
                report.overall(statistic).unwrap().as_ref().unwrap(),
                &Estimate::NotApplicable
            );
        }
        assert!(matches!(
            engine.pairwise(Statistic::NeiGst),
            Err(PopDiffError::InsufficientData(_))
        ));
    }

    #[test]
    fn pairwise_matrices_are_symmetric() {
        let data = three_populations();
        let engine = DifferentiationEngine::new(&data, DistanceModel::Count, false);
        for statistic in Statistic::ALL {
            let m = engine.pairwise(statistic).unwrap();
            assert_eq!(m.populations, vec!["north", "south", "west"]);
            for i in 0..3 {
                assert_eq!(m.get(i, i), Estimate::NotApplicable);
                for j in 0..3 {
                    assert_eq!(m.get(i, j), m.get(j, i));
                }
            }
            let direct = engine.compare(&[2, 0], statistic).unwrap();
            assert_eq!(direct, m.get(0, 2));
            assert_eq!(m.pairs().count(), 3);
        }
    }

    #[test]
    fn identical_populations_show_no_differentiation() {
        let same = ["ACGTACGT"; 10];
        let data = build(&[("a", &same), ("b", &same)], None);
        let engine = DifferentiationEngine::new(&data, DistanceModel::Count, false);
        let report = engine.overall(&Statistic::ALL);
        for statistic in Statistic::FREQUENCY_BASED {
            assert_eq!(
                report.overall(statistic).unwrap().as_ref().unwrap(),
                &Estimate::Value(0.0)
            );
        }
        // Monomorphic at the single locus.
        let loci = report.loci.as_ref().unwrap();
        assert_eq!(loci[0].nei_gst, Estimate::NotApplicable);
        // No variance at all, so PhiST has a zero denominator.
        assert_eq!(
            report.overall(Statistic::PhiSt).unwrap().as_ref().unwrap(),
            &Estimate::NotApplicable
        );
    }

    #[test]
    fn harmonic_mean_of_jost_d_over_loci() {
        let data = build(
            &[
                ("a", &["AA", "AA", "AA", "AT"]),
                ("b", &["TT", "TT", "AT", "TT"]),
            ],
            Some(&["C", "C", "C", "G", "G", "G", "G", "C"]),
        );
        let engine = DifferentiationEngine::new(&data, DistanceModel::Count, false);
        let loci = engine.per_locus(&[0, 1]).unwrap();
        let d: Vec<f64> = loci.iter().map(|l| l.jost_d.value().unwrap()).collect();
        assert!(d.iter().all(|&x| x > 0.0));
        let expected = 2.0 / (1.0 / d[0] + 1.0 / d[1]);
        assert_abs_diff_eq!(
            engine.compare(&[0, 1], Statistic::JostD).unwrap().value().unwrap(),
            expected,
            epsilon = 1e-12
        );
        let hs = loci.iter().map(|l| l.heterozygosity.unwrap().hs).sum::<f64>() / 2.0;
        let ht = loci.iter().map(|l| l.heterozygosity.unwrap().ht).sum::<f64>() / 2.0;
        assert_abs_diff_eq!(
            engine.compare(&[0, 1], Statistic::NeiGst).unwrap().value().unwrap(),
            (ht - hs) / ht,
            epsilon = 1e-12
        );
    }

    #[test]
    fn phi_st_separates_diverged_populations() {
        let data = build(
            &[
                ("a", &["AAAAAA", "AAAAAA", "AAAAAT"]),
                ("b", &["GGGGGG", "GGGGGC", "GGGGGG"]),
            ],
            None,
        );
        let engine = DifferentiationEngine::new(&data, DistanceModel::Count, false);
        let phi = engine.compare(&[0, 1], Statistic::PhiSt).unwrap().value().unwrap();
        assert!(phi > 0.8 && phi <= 1.0, "PhiST = {}", phi);
    }

    #[test]
    fn singleton_pair_does_not_sink_the_pairwise_matrix() {
        let data = build(
            &[
                ("a", &["AAAA", "AAAT", "AACT"]),
                ("b", &["GGCT"]),
                ("c", &["GGCC"]),
            ],
            None,
        );
        let engine = DifferentiationEngine::new(&data, DistanceModel::Count, false);
        for statistic in Statistic::ALL {
            let m = engine.pairwise(statistic).unwrap();
            assert_eq!(m.get(1, 2), Estimate::NotApplicable, "{}", statistic);
        }
        let phi = engine.pairwise(Statistic::PhiSt).unwrap();
        assert_eq!(phi.get(0, 1), engine.compare(&[0, 1], Statistic::PhiSt).unwrap());
        assert!(phi.get(0, 1).value().is_some());
        assert!(phi.get(0, 2).value().is_some());
    }

    #[test]
    fn statistic_names_parse() {
        for statistic in Statistic::ALL {
            assert_eq!(statistic.name().parse::<Statistic>().unwrap(), statistic);
        }
        assert_eq!("Gst".parse::<Statistic>().unwrap(), Statistic::NeiGst);
        assert!("fst".parse::<Statistic>().is_err());
    }

    #[test]
    fn phi_st_is_not_a_frequency_statistic() {
        assert!(matches!(
            multilocus(Statistic::PhiSt, &[]),
            Err(PopDiffError::UndefinedStatistic(_))
        ));
        assert_eq!(multilocus(Statistic::NeiGst, &[]).unwrap(), Estimate::NotApplicable);
    }
}
