// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use popdiff::{
    amova::{amova_with_progress, AmovaConfig, AmovaTable, Hierarchy},
    bootstrap::{chao_bootstrap_with_progress, BootstrapConfig, BootstrapSummary},
    differentiation::{DifferentiationEngine, DifferentiationReport, PairwiseMatrix, Statistic},
    loader::load_dataset,
    PopDiffError,
};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    time::Instant,
};

fn progress_bar(len: u64, unit: &str) -> Result<ProgressBar> {
    let style = ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {} ({{percent}}%) ETA: {{eta}}",
            unit
        ))
        .map_err(|e| anyhow!("Failed to create progress bar style: {}", e))?
        .progress_chars("=> ");
    Ok(ProgressBar::new(len).with_style(style))
}

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!("Starting popdiff with args: {:?}", cli_args);

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel operations.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    if !(cli_args.ci > 0.0 && cli_args.ci < 1.0) {
        return Err(anyhow!(
            "--ci must lie strictly between 0 and 1, got {}.",
            cli_args.ci
        ));
    }
    let seed = cli_args.seed.unwrap_or(popdiff::DEFAULT_SEED);

    // --- 1. Load Alignments and Strata ---
    let dataset = load_dataset(&cli_args.fasta, &cli_args.strata)
        .map_err(|e| anyhow!("Failed to load input data: {}", e))?;
    let strata = dataset.strata();
    debug!("Populations: {:?}", strata.population_names());
    if strata.has_regions() {
        info!(
            "{} populations nested in {} regions: {:?}",
            strata.n_populations(),
            strata.n_regions(),
            strata.regions()
        );
    }

    // --- 2. Prepare Output Location ---
    let output_prefix_path = PathBuf::from(&cli_args.output_prefix);
    if let Some(parent) = output_prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow!("Failed to create output directory {}: {}", parent.display(), e)
            })?;
            info!("Created output directory: {}", parent.display());
        }
    }

    // --- 3. Differentiation Statistics ---
    info!(
        "Computing pooled {} distances and overall differentiation...",
        cli_args.distance
    );
    let engine = DifferentiationEngine::new(&dataset, cli_args.distance, cli_args.squared);
    let report = engine.overall(&Statistic::ALL);
    if let Err(e) = &report.loci {
        error!("Per-locus differentiation failed: {}", e);
    }
    output_writer::write_differentiation(&cli_args.output_prefix, &report)?;

    // --- 4. Pairwise Matrices ---
    let mut pairwise: Vec<PairwiseMatrix> = Vec::new();
    if cli_args.skip_pairwise {
        info!("Skipping pairwise comparisons (--skip-pairwise).");
    } else if strata.n_populations() < 2 {
        warn!("Pairwise comparisons need at least two populations; skipping.");
    } else {
        let n_pairs = strata.n_populations() * (strata.n_populations() - 1) / 2;
        info!(
            "Computing {} statistics over {} population pairs...",
            Statistic::ALL.len(),
            n_pairs
        );
        for statistic in Statistic::ALL {
            match engine.pairwise(statistic) {
                Ok(matrix) => pairwise.push(matrix),
                Err(e) => error!("Pairwise {} failed: {}", statistic, e),
            }
        }
        output_writer::write_pairwise(&cli_args.output_prefix, &pairwise)?;
    }

    // --- 5. AMOVA ---
    #[cfg(feature = "json")]
    let mut amova_table: Option<AmovaTable> = None;
    if cli_args.skip_amova {
        info!("Skipping AMOVA (--skip-amova).");
    } else {
        match run_amova(&engine, &cli_args, seed) {
            Ok(table) => {
                output_writer::write_amova(&cli_args.output_prefix, &table)?;
                #[cfg(feature = "json")]
                {
                    amova_table = Some(table);
                }
            }
            Err(e) => error!("AMOVA failed: {}", e),
        }
    }

    // --- 6. Chao Bootstrap ---
    #[cfg(feature = "json")]
    let mut bootstrap: Option<BootstrapSummary> = None;
    if cli_args.bootstrap > 0 {
        let all: Vec<usize> = (0..strata.n_populations()).collect();
        let config = BootstrapConfig {
            replicates: cli_args.bootstrap,
            seed,
            confidence: cli_args.ci,
            statistics: Statistic::FREQUENCY_BASED.to_vec(),
        };
        let pb = progress_bar(config.replicates as u64, "replicates")?;
        let result = engine
            .frequency_tables(&all)
            .and_then(|tables| chao_bootstrap_with_progress(&tables, &config, &pb));
        pb.finish_with_message("Bootstrap complete.");
        match result {
            Ok(summary) => {
                output_writer::write_bootstrap(&cli_args.output_prefix, &summary)?;
                #[cfg(feature = "json")]
                {
                    bootstrap = Some(summary);
                }
            }
            Err(e) => error!("Bootstrap failed: {}", e),
        }
    } else {
        debug!("No bootstrap replicates requested.");
    }

    // --- 7. JSON Report ---
    #[cfg(feature = "json")]
    output_writer::write_json_report(
        &cli_args.output_prefix,
        &report,
        &pairwise,
        amova_table.as_ref(),
        bootstrap.as_ref(),
    )?;

    info!(
        "popdiff finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

/// Two-level AMOVA when regions are given, falling back to one level when
/// the region design cannot be analysed.
fn run_amova(engine: &DifferentiationEngine, cli_args: &cli::CliArgs, seed: u64) -> Result<AmovaTable> {
    let distances = engine.distances()?;
    let hierarchy = Hierarchy::from_strata(engine.dataset().strata())?;
    let config = AmovaConfig {
        permutations: cli_args.permutations,
        seed,
        squared: cli_args.squared,
    };
    let tests = if hierarchy.is_nested() { 3 } else { 1 };

    let pb = progress_bar((config.permutations * tests) as u64, "permutations")?;
    match amova_with_progress(distances, &hierarchy, &config, &pb) {
        Err(PopDiffError::InsufficientData(msg)) if hierarchy.is_nested() => {
            pb.abandon();
            warn!(
                "Hierarchical AMOVA not possible ({}); falling back to populations only.",
                msg
            );
            let flat = hierarchy.without_regions();
            let pb_flat = progress_bar(config.permutations as u64, "permutations")?;
            let table = amova_with_progress(distances, &flat, &config, &pb_flat)?;
            pb_flat.finish_with_message("AMOVA permutations complete.");
            Ok(table)
        }
        result => {
            pb.finish_with_message("AMOVA permutations complete.");
            Ok(result?)
        }
    }
}

// --- Module Implementations ---

mod cli {
    use clap::Parser;
    use popdiff::{distance::DistanceModel, loader::LocusSource};
    use std::path::PathBuf;

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Population differentiation (Gst, Gst', D, PhiST) and AMOVA from aligned FASTA loci.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Aligned FASTA file for one locus, as `path` or `name=path`. Repeat per locus.
        #[arg(short = 'f', long = "fasta", required = true)]
        pub(crate) fasta: Vec<LocusSource>,

        /// CSV/TSV table with `sample`, `population` and optional `region` columns.
        #[arg(short = 's', long, required = true)]
        pub(crate) strata: PathBuf,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,

        #[arg(short = 'd', long, default_value_t = DistanceModel::Count)]
        pub(crate) distance: DistanceModel,

        /// Square distances before variance partitioning.
        #[arg(long)]
        pub(crate) squared: bool,

        #[arg(short = 'p', long, default_value_t = 100)]
        pub(crate) permutations: usize,

        /// Chao bootstrap replicates; 0 disables the bootstrap.
        #[arg(short = 'b', long, default_value_t = 0)]
        pub(crate) bootstrap: usize,

        #[arg(long, default_value_t = 0.95)]
        pub(crate) ci: f64,

        #[arg(long)]
        pub(crate) seed: Option<u64>,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,

        #[arg(long)]
        pub(crate) skip_amova: bool,

        #[arg(long)]
        pub(crate) skip_pairwise: bool,
    }
}

mod output_writer {
    use super::{anyhow, info, AmovaTable, BootstrapSummary, DifferentiationReport, File, BufWriter, PairwiseMatrix, Result, Write};
    use popdiff::estimate::Estimate;

    fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
        let filename = format!("{}.{}", prefix, suffix);
        File::create(&filename)
            .map(BufWriter::new)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", filename, e))
    }

    pub(crate) fn write_differentiation(
        output_prefix: &str,
        report: &DifferentiationReport,
    ) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "differentiation.tsv")?;
        info!("Writing differentiation to {}.differentiation.tsv", output_prefix);

        writeln!(writer, "Scope\tStatistic\tValue\tLinearized")?;
        for (statistic, result) in &report.overall {
            let estimate = result.as_ref().copied().unwrap_or(Estimate::NotApplicable);
            writeln!(
                writer,
                "overall\t{}\t{:.6}\t{:.6}",
                statistic,
                estimate,
                estimate.linearized()
            )?;
        }
        if let Ok(loci) = &report.loci {
            for locus in loci {
                if let Some(h) = &locus.heterozygosity {
                    writeln!(writer, "{}\ths\t{:.6}\tNA", locus.locus, h.hs)?;
                    writeln!(writer, "{}\tht\t{:.6}\tNA", locus.locus, h.ht)?;
                }
                for (name, estimate) in [
                    ("nei_gst", locus.nei_gst),
                    ("hedrick_gst", locus.hedrick_gst),
                    ("jost_d", locus.jost_d),
                ] {
                    writeln!(
                        writer,
                        "{}\t{}\t{:.6}\t{:.6}",
                        locus.locus,
                        name,
                        estimate,
                        estimate.linearized()
                    )?;
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_pairwise(output_prefix: &str, matrices: &[PairwiseMatrix]) -> Result<()> {
        if matrices.is_empty() {
            info!("No pairwise matrices to write.");
            return Ok(());
        }
        let mut writer = create_output_file(output_prefix, "pairwise.tsv")?;
        info!("Writing pairwise statistics to {}.pairwise.tsv", output_prefix);

        writeln!(writer, "Statistic\tPop1\tPop2\tValue\tLinearized")?;
        for matrix in matrices {
            for (pop1, pop2, estimate) in matrix.pairs() {
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{:.6}\t{:.6}",
                    matrix.statistic,
                    pop1,
                    pop2,
                    estimate,
                    estimate.linearized()
                )?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_amova(output_prefix: &str, table: &AmovaTable) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "amova.tsv")?;
        info!("Writing AMOVA table to {}.amova.tsv", output_prefix);

        writeln!(writer, "Source\tDf\tSSD\tMSD\tSigma2\tPercent")?;
        for row in &table.rows {
            writeln!(
                writer,
                "{}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.2}",
                row.source.name(),
                row.df,
                row.ssd,
                row.msd,
                row.sigma,
                row.percent
            )?;
        }
        writeln!(writer)?;
        writeln!(writer, "Statistic\tValue\tPValue\tPermutations")?;
        for test in &table.tests {
            let p_value = test
                .p_value
                .map_or_else(|| "NA".to_string(), |p| format!("{:.6}", p));
            writeln!(
                writer,
                "{}\t{:.6}\t{}\t{}",
                test.statistic, test.observed, p_value, test.permutations
            )?;
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_bootstrap(output_prefix: &str, summary: &BootstrapSummary) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "bootstrap.tsv")?;
        info!("Writing bootstrap summary to {}.bootstrap.tsv", output_prefix);

        writeln!(
            writer,
            "Statistic\tObserved\tMean\tLower\tUpper\tDefined\tReplicates\tConfidence"
        )?;
        for (statistic, result) in &summary.statistics {
            match result {
                Ok(s) => writeln!(
                    writer,
                    "{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{}\t{}\t{}",
                    statistic, s.observed, s.mean, s.lower, s.upper, s.defined, s.replicates,
                    summary.confidence
                )?,
                Err(_) => writeln!(
                    writer,
                    "{}\tNA\tNA\tNA\tNA\t0\t{}\t{}",
                    statistic, summary.replicates, summary.confidence
                )?,
            }
        }
        writer.flush()?;
        Ok(())
    }

    #[cfg(feature = "json")]
    pub(crate) fn write_json_report(
        output_prefix: &str,
        report: &DifferentiationReport,
        pairwise: &[PairwiseMatrix],
        amova: Option<&AmovaTable>,
        bootstrap: Option<&BootstrapSummary>,
    ) -> Result<()> {
        use serde_json::{json, Map, Value};

        fn outcome<T: serde::Serialize>(result: &popdiff::Result<T>) -> Value {
            match result {
                Ok(v) => json!({ "value": v }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }

        let overall: Map<String, Value> = report
            .overall
            .iter()
            .map(|(s, r)| (s.name().to_string(), outcome(r)))
            .collect();
        let pairwise: Vec<Value> = pairwise
            .iter()
            .map(|m| {
                let pairs: Vec<Value> = m
                    .pairs()
                    .map(|(a, b, e)| json!({ "pop1": a, "pop2": b, "value": e }))
                    .collect();
                json!({ "statistic": m.statistic, "pairs": pairs })
            })
            .collect();
        let bootstrap: Option<Map<String, Value>> = bootstrap.map(|b| {
            b.statistics
                .iter()
                .map(|(s, r)| (s.name().to_string(), outcome(r)))
                .collect()
        });
        let document = json!({
            "populations": report.populations,
            "overall": overall,
            "loci": outcome(&report.loci),
            "pairwise": pairwise,
            "amova": amova,
            "bootstrap": bootstrap,
        });

        let mut writer = create_output_file(output_prefix, "report.json")?;
        info!("Writing JSON report to {}.report.json", output_prefix);
        serde_json::to_writer_pretty(&mut writer, &document)?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}
