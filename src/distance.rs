// distance.rs

use crate::dataset::{Dataset, Locus};
use crate::error::{PopDiffError, Result};
use log::debug;
use ndarray::Array2;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::ops::AddAssign;
use std::str::FromStr;

/// Substitution model used to turn site comparisons into a distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DistanceModel {
    /// Number of differing sites.
    #[default]
    Count,
    /// Proportion of differing sites (p-distance).
    Raw,
    /// Jukes & Cantor (1969).
    JukesCantor,
    /// Kimura (1980) two-parameter.
    Kimura2P,
}

impl DistanceModel {
    pub fn name(&self) -> &'static str {
        match self {
            DistanceModel::Count => "count",
            DistanceModel::Raw => "raw",
            DistanceModel::JukesCantor => "jc69",
            DistanceModel::Kimura2P => "k80",
        }
    }

    pub fn distance(&self, cmp: &SiteComparison) -> Result<f64> {
        let differences = cmp.differences();
        if *self != DistanceModel::Count {
            if cmp.compared == 0 {
                return Err(PopDiffError::undefined(
                    "no comparable sites between sequences",
                ));
            }
            if differences == 0 {
                return Ok(0.0);
            }
        }
        let l = cmp.compared as f64;
        match self {
            DistanceModel::Count => Ok(differences as f64),
            DistanceModel::Raw => Ok(differences as f64 / l),
            DistanceModel::JukesCantor => {
                let p = differences as f64 / l;
                let arg = 1.0 - 4.0 * p / 3.0;
                if arg <= 0.0 {
                    return Err(PopDiffError::undefined(format!(
                        "Jukes-Cantor distance saturated (p = {:.4})",
                        p
                    )));
                }
                Ok(-0.75 * arg.ln())
            }
            DistanceModel::Kimura2P => {
                let p = cmp.transitions as f64 / l;
                let q = cmp.transversions as f64 / l;
                let a = 1.0 - 2.0 * p - q;
                let b = 1.0 - 2.0 * q;
                if a <= 0.0 || b <= 0.0 {
                    return Err(PopDiffError::undefined(format!(
                        "Kimura 2-parameter distance saturated (P = {:.4}, Q = {:.4})",
                        p, q
                    )));
                }
                Ok(-0.5 * a.ln() - 0.25 * b.ln())
            }
        }
    }
}

impl fmt::Display for DistanceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DistanceModel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "count" | "n" => Ok(DistanceModel::Count),
            "raw" | "p" => Ok(DistanceModel::Raw),
            "jc69" | "jc" | "jukes-cantor" => Ok(DistanceModel::JukesCantor),
            "k80" | "k2p" | "kimura" => Ok(DistanceModel::Kimura2P),
            other => Err(format!(
                "unknown distance model '{}' (expected count, raw, jc69 or k80)",
                other
            )),
        }
    }
}

#[inline(always)]
fn purine(b: u8) -> bool {
    matches!(b, b'A' | b'G')
}

#[inline(always)]
fn unambiguous(b: u8) -> bool {
    matches!(b, b'A' | b'C' | b'G' | b'T' | b'U')
}

/// Site-by-site comparison of two aligned sequences.
///
/// Sites where either base is a gap or an ambiguity code are left out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteComparison {
    pub compared: u64,
    pub transitions: u64,
    pub transversions: u64,
}

impl SiteComparison {
    pub fn between(a: &[u8], b: &[u8]) -> Self {
        let mut cmp = SiteComparison::default();
        for (&x, &y) in a.iter().zip(b.iter()) {
            if !unambiguous(x) || !unambiguous(y) {
                continue;
            }
            cmp.compared += 1;
            let (x, y) = (normalize_base(x), normalize_base(y));
            if x != y {
                if purine(x) == purine(y) {
                    cmp.transitions += 1;
                } else {
                    cmp.transversions += 1;
                }
            }
        }
        cmp
    }

    pub fn differences(&self) -> u64 {
        self.transitions + self.transversions
    }
}

#[inline(always)]
fn normalize_base(b: u8) -> u8 {
    if b == b'U' {
        b'T'
    } else {
        b
    }
}

impl AddAssign for SiteComparison {
    fn add_assign(&mut self, rhs: Self) {
        self.compared += rhs.compared;
        self.transitions += rhs.transitions;
        self.transversions += rhs.transversions;
    }
}

/// Labelled symmetric distance matrix with a zero diagonal.
#[derive(Debug, Clone, PartialEq)]
pub struct DistanceMatrix {
    labels: Vec<String>,
    values: Array2<f64>,
}

impl DistanceMatrix {
    pub fn new(labels: Vec<String>, values: Array2<f64>) -> Result<Self> {
        let n = labels.len();
        if values.dim() != (n, n) {
            return Err(PopDiffError::schema(format!(
                "Distance matrix is {:?} but has {} labels.",
                values.dim(),
                n
            )));
        }
        for i in 0..n {
            if values[[i, i]] != 0.0 {
                return Err(PopDiffError::schema(format!(
                    "Distance matrix diagonal entry {} is {}, expected 0.",
                    labels[i],
                    values[[i, i]]
                )));
            }
            for j in (i + 1)..n {
                if (values[[i, j]] - values[[j, i]]).abs() > 1e-12 {
                    return Err(PopDiffError::schema(format!(
                        "Distance matrix is not symmetric at ({}, {}).",
                        labels[i], labels[j]
                    )));
                }
            }
        }
        Ok(Self { labels, values })
    }

    /// Builds a matrix from the upper triangle.
    pub fn from_fn<F>(labels: Vec<String>, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> f64,
    {
        let n = labels.len();
        let mut values = Array2::<f64>::zeros((n, n));
        for i in 0..n {
            for j in (i + 1)..n {
                let d = f(i, j);
                values[[i, j]] = d;
                values[[j, i]] = d;
            }
        }
        Self { labels, values }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    #[inline(always)]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[[i, j]]
    }

    /// Rows and columns restricted to `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Self {
        let labels = indices.iter().map(|&i| self.labels[i].clone()).collect();
        let values = Array2::from_shape_fn((indices.len(), indices.len()), |(a, b)| {
            self.values[[indices[a], indices[b]]]
        });
        Self { labels, values }
    }

    pub fn squared(&self) -> Self {
        Self {
            labels: self.labels.clone(),
            values: self.values.mapv(|d| d * d),
        }
    }
}

/// All pairwise comparisons between the distinct haplotypes of a locus.
fn haplotype_comparisons(locus: &Locus) -> Array2<SiteComparison> {
    let n = locus.n_haplotypes();
    let rows: Vec<Vec<SiteComparison>> = (0..n)
        .into_par_iter()
        .map(|i| {
            (0..n)
                .map(|j| {
                    if j <= i {
                        SiteComparison::default()
                    } else {
                        SiteComparison::between(locus.haplotype(i), locus.haplotype(j))
                    }
                })
                .collect()
        })
        .collect();
    let mut out = Array2::from_elem((n, n), SiteComparison::default());
    for (i, row) in rows.into_iter().enumerate() {
        for (j, cmp) in row.into_iter().enumerate().skip(i + 1) {
            out[[i, j]] = cmp;
            out[[j, i]] = cmp;
        }
    }
    out
}

fn apply_model(
    labels: Vec<String>,
    comparisons: &Array2<SiteComparison>,
    model: DistanceModel,
) -> Result<DistanceMatrix> {
    let n = labels.len();
    let mut values = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let d = model.distance(&comparisons[[i, j]]).map_err(|e| {
                PopDiffError::undefined(format!("{} vs {}: {}", labels[i], labels[j], e))
            })?;
            values[[i, j]] = d;
            values[[j, i]] = d;
        }
    }
    Ok(DistanceMatrix { labels, values })
}

/// Distances between the distinct haplotypes of one locus.
pub fn haplotype_distances(locus: &Locus, model: DistanceModel) -> Result<DistanceMatrix> {
    let labels = (0..locus.n_haplotypes())
        .map(|i| locus.haplotype_label(i))
        .collect();
    apply_model(labels, &haplotype_comparisons(locus), model)
}

/// Expands a haplotype-level matrix to samples through their haplotype index.
fn expand_to_samples(
    sample_names: &[String],
    sample_classes: &[usize],
    class_distances: &DistanceMatrix,
) -> DistanceMatrix {
    DistanceMatrix::from_fn(sample_names.to_vec(), |i, j| {
        class_distances.get(sample_classes[i], sample_classes[j])
    })
}

/// Sample-by-sample distances at one locus.
pub fn sample_distances(
    dataset: &Dataset,
    locus: &Locus,
    model: DistanceModel,
) -> Result<DistanceMatrix> {
    let haps = haplotype_distances(locus, model)?;
    Ok(expand_to_samples(
        dataset.sample_names(),
        locus.sample_haplotypes(),
        &haps,
    ))
}

/// Sample-by-sample distances over all loci.
///
/// Site comparisons are summed across loci before the model is applied, so
/// the result matches the distance between concatenated alignments.
pub fn pooled_sample_distances(dataset: &Dataset, model: DistanceModel) -> Result<DistanceMatrix> {
    let per_locus: Vec<Array2<SiteComparison>> = dataset
        .loci()
        .iter()
        .map(haplotype_comparisons)
        .collect();

    // Multi-locus haplotypes: distinct tuples of per-locus haplotype indices.
    let mut classes: Vec<Vec<usize>> = Vec::new();
    let mut lookup: HashMap<Vec<usize>, usize> = HashMap::new();
    let sample_classes: Vec<usize> = (0..dataset.n_samples())
        .map(|s| {
            let key: Vec<usize> = dataset
                .loci()
                .iter()
                .map(|l| l.sample_haplotypes()[s])
                .collect();
            let next = classes.len();
            *lookup.entry(key.clone()).or_insert_with(|| {
                classes.push(key);
                next
            })
        })
        .collect();
    debug!(
        "Pooled distances: {} multi-locus haplotypes over {} loci.",
        classes.len(),
        per_locus.len()
    );

    let n = classes.len();
    let mut combined = Array2::from_elem((n, n), SiteComparison::default());
    for a in 0..n {
        for b in (a + 1)..n {
            let mut total = SiteComparison::default();
            for (locus_idx, cmp) in per_locus.iter().enumerate() {
                total += cmp[[classes[a][locus_idx], classes[b][locus_idx]]];
            }
            combined[[a, b]] = total;
            combined[[b, a]] = total;
        }
    }
    let labels = (0..n).map(|i| format!("mlh{}", i + 1)).collect();
    let class_distances = apply_model(labels, &combined, model)?;
    Ok(expand_to_samples(
        dataset.sample_names(),
        &sample_classes,
        &class_distances,
    ))
}
