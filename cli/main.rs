#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{info, warn};
use std::error::Error;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;

use dscperm::config::RunConfig;
use dscperm::decompose::{GeneSlotOrder, decompose};
use dscperm::dispatch::{DispatchPlan, run_permutations};
use dscperm::io::{
    LabeledMatrix, OutputPaths, default_prefix, read_batches, read_matrix, write_dispersion,
    write_permutation_genes, write_permutation_globals, write_pvalues,
};
use dscperm::progress::PermutationProgress;
use dscperm::summary::summarize;
use dscperm::types::BatchLayout;

#[derive(Parser)]
#[command(
    name = "dscperm",
    version,
    about = "Batch-effect dispersion separability (DSC) with permutation testing"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct InputArgs {
    /// Genes × samples matrix: header `<corner>\t<sample>...`, rows `<gene>\t<value>...`
    #[arg(value_name = "MATRIX")]
    matrix: PathBuf,

    /// Batch file: header `Sample\t<type>...`, one row per sample
    #[arg(value_name = "BATCHES")]
    batches: PathBuf,

    /// Batch type column to use (default: the first one in the batch file)
    #[arg(long, value_name = "TYPE")]
    batch_type: Option<String>,

    /// Output prefix (default: the matrix path without its extension)
    #[arg(long, value_name = "PREFIX")]
    out: Option<PathBuf>,

    /// TOML run configuration; command-line flags take precedence
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Write between-batch values to the per-gene DB column and within-batch values to DW
    #[arg(long)]
    conventional_gene_slots: bool,

    /// Report values beyond ±1e6 as infinities and tiny positive values as 0
    #[arg(long)]
    saturate_extremes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose the observed matrix
    #[command(about = "Compute observed DSC, DB and DW (outputs: <prefix>.dsc.tsv)")]
    Compute(InputArgs),

    /// Decompose the observed matrix and build a permutation null
    #[command(
        about = "Run a permutation test (writes .dsc, .perm_global, .perm_genes, .pvalues TSVs)"
    )]
    Permute {
        #[command(flatten)]
        input: InputArgs,

        /// Number of permutations
        #[arg(long, value_name = "N")]
        permutations: Option<usize>,

        /// Worker threads (default: one per logical CPU)
        #[arg(long, value_name = "N")]
        threads: Option<usize>,
    },
}

/// Drives an `indicatif` bar from the dispatcher's progress callbacks.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} permutations ({eta})",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self { bar }
    }
}

impl PermutationProgress for BarProgress {
    fn on_start(&self, total_jobs: usize) {
        self.bar.set_length(total_jobs as u64);
        self.bar.set_position(0);
    }

    fn on_advance(&self, completed: usize) {
        if completed as u64 > self.bar.position() {
            self.bar.set_position(completed as u64);
        }
    }

    fn on_finish(&self) {
        self.bar.finish_and_clear();
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let result = match Cli::parse().command {
        Commands::Compute(input) => run_compute(input),
        Commands::Permute {
            input,
            permutations,
            threads,
        } => run_permute(input, permutations, threads),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn resolve_config(
    input: &InputArgs,
    permutations: Option<usize>,
    threads: Option<usize>,
) -> Result<RunConfig, Box<dyn Error>> {
    let mut config = match &input.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    if let Some(permutations) = permutations {
        config.permutations = permutations;
    }
    if threads.is_some() {
        config.threads = threads;
    }
    if input.conventional_gene_slots {
        config.gene_slot_order = GeneSlotOrder::Conventional;
    }
    if input.saturate_extremes {
        config.saturate_extremes = true;
    }
    Ok(config)
}

fn load_inputs(input: &InputArgs) -> Result<(LabeledMatrix, BatchLayout), Box<dyn Error>> {
    let labeled = read_matrix(&input.matrix)?;
    let table = read_batches(&input.batches)?;
    let labels = table.assignment_for(&labeled.sample_ids, input.batch_type.as_deref())?;
    let layout = BatchLayout::new(&labels)?;

    info!(
        "Samples fall into {} batches: {}",
        layout.batch_count(),
        layout.unique_batches().join(", ")
    );
    if layout.is_degenerate() {
        warn!("Only one batch is present; DSC and between-batch dispersion are reported as 0.");
    }
    Ok((labeled, layout))
}

fn output_paths(input: &InputArgs) -> OutputPaths {
    let prefix = input
        .out
        .clone()
        .unwrap_or_else(|| default_prefix(&input.matrix));
    OutputPaths::from_prefix(&prefix)
}

fn announce(path: &Path) {
    info!("Wrote '{}'.", path.display());
}

fn run_compute(input: InputArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&input, None, None)?;
    let (labeled, layout) = load_inputs(&input)?;
    let paths = output_paths(&input);

    let observed = decompose(&labeled.matrix, &layout, config.gene_slot_order)?;
    info!("Observed {}", observed.global);

    write_dispersion(
        &paths.dispersion,
        &labeled.gene_ids,
        &observed,
        config.saturate_extremes,
    )?;
    announce(&paths.dispersion);
    Ok(())
}

fn run_permute(
    input: InputArgs,
    permutations: Option<usize>,
    threads: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&input, permutations, threads)?;
    config.check_for_permutations()?;
    let (labeled, layout) = load_inputs(&input)?;
    let paths = output_paths(&input);

    let observed = decompose(&labeled.matrix, &layout, config.gene_slot_order)?;
    info!("Observed {}", observed.global);

    let plan = DispatchPlan {
        permutations: config.permutations,
        threads: config.resolved_threads(),
        gene_slot_order: config.gene_slot_order,
    };
    let progress = BarProgress::new();
    let outputs = run_permutations(&labeled.matrix, &layout, &plan, &progress)?;
    let summary = summarize(&observed, &outputs);
    info!(
        "Permutation p-value for the observed DSC of {}: {}",
        summary.observed_dsc, summary.global_pvalue
    );

    let saturate = config.saturate_extremes;
    write_dispersion(&paths.dispersion, &labeled.gene_ids, &observed, saturate)?;
    announce(&paths.dispersion);
    write_permutation_globals(&paths.permutation_globals, &outputs, saturate)?;
    announce(&paths.permutation_globals);
    write_permutation_genes(&paths.permutation_genes, &labeled.gene_ids, &outputs, saturate)?;
    announce(&paths.permutation_genes);
    write_pvalues(&paths.pvalues, &labeled.gene_ids, &summary, saturate)?;
    announce(&paths.pvalues);
    Ok(())
}
