// lib.rs

//! Population differentiation from aligned haplotype sequences: pairwise
//! sequence distances, heterozygosity-based estimators (Nei's Gst,
//! Hedrick's Gst', Jost's D), PhiST, hierarchical AMOVA with permutation
//! tests and Chao's coverage-based bootstrap.

pub mod amova;
pub mod bootstrap;
pub mod dataset;
pub mod differentiation;
pub mod distance;
pub mod error;
pub mod estimate;
pub mod frequency;
pub mod loader;

pub use amova::{amova, amova_with_progress, AmovaConfig, AmovaTable, Hierarchy, PhiStatistic};
pub use bootstrap::{chao_bootstrap, chao_bootstrap_with_progress, BootstrapConfig, BootstrapSummary};
pub use dataset::{Dataset, Locus, Population, Strata};
pub use differentiation::{DifferentiationEngine, PairwiseMatrix, Statistic};
pub use distance::{DistanceMatrix, DistanceModel};
pub use error::{PopDiffError, Result};
pub use estimate::{inverse_linearize, linearize, Estimate};
pub use frequency::FrequencyTable;
pub use loader::{load_dataset, LocusSource};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Seed used when none is given.
pub const DEFAULT_SEED: u64 = 42;

/// Independent generator for one parallel task (a permutation or a bootstrap
/// replicate). The key comes from `seed` alone; the analysis `stream` fills
/// the high 32 bits of the ChaCha stream id and the task index the low 32.
pub(crate) fn task_rng(seed: u64, stream: u64, index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream((stream << 32) | (index as u64 & 0xffff_ffff));
    rng
}
