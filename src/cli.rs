
use clap::Parser;
use lazy_static::lazy_static;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::strainer::StrainerConfig;
use crate::writers::strain_bam_writer::OutputMode;

lazy_static! {
    /// Stores the full version string we plan to use.
    /// # Examples
    /// * `0.1.0-6bb9635-dirty` - while on a dirty branch
    /// * `0.1.0-6bb9635` - with a fresh commit
    pub static ref FULL_VERSION: String = format!("{}-{}", env!("CARGO_PKG_VERSION"), env!("VERGEN_GIT_DESCRIBE"));
}

#[derive(Clone, Parser)]
#[clap(author,
    version = &**FULL_VERSION,
    about)]
pub struct Settings {
    /// Floria output folder containing contig_ploidy_info.tsv and one folder per contig
    #[clap(required = true)]
    #[clap(value_name = "FLORIA_OUTDIR")]
    #[clap(help_heading = Some("Input/Output"))]
    pub floria_outdir: PathBuf,

    /// Input alignment file in BAM format, the same alignments given to floria
    #[clap(required = true)]
    #[clap(short = 'b')]
    #[clap(long = "bam")]
    #[clap(value_name = "BAM")]
    #[clap(help_heading = Some("Input/Output"))]
    pub bam_filename: PathBuf,

    /// Output mode: "tag" writes one tagged BAM, "split" writes one BAM per strain
    #[clap(short = 'm')]
    #[clap(long = "mode")]
    #[clap(value_name = "MODE")]
    #[clap(default_value = "tag")]
    #[clap(help_heading = Some("Input/Output"))]
    pub mode: String,

    /// Output basename; writes <BASENAME>.bam in tag mode and <BASENAME>.<STRAIN>.bam in split mode
    #[clap(required = true)]
    #[clap(short = 'o')]
    #[clap(long = "output-basename")]
    #[clap(value_name = "BASENAME")]
    #[clap(help_heading = Some("Input/Output"))]
    pub output_basename: PathBuf,

    /// Output haploset to strain table (optional, csv/tsv)
    #[clap(long = "strain-table")]
    #[clap(value_name = "FILE")]
    #[clap(help_heading = Some("Input/Output"))]
    pub strain_table_filename: Option<PathBuf>,

    /// Number of threads for BAM I/O (default: minimum of `--threads` or `4`)
    #[clap(long = "io-threads")]
    #[clap(value_name = "THREADS")]
    #[clap(help_heading = Some("Input/Output"))]
    pub io_threads: Option<usize>,

    /// Number of threads to use for parsing contigs
    #[clap(short = 't')]
    #[clap(long = "threads")]
    #[clap(value_name = "THREADS")]
    #[clap(default_value = "1")]
    pub threads: usize,

    /// Enable verbose output
    #[clap(short = 'v')]
    #[clap(long = "verbose")]
    #[clap(action = clap::ArgAction::Count)]
    pub verbosity: u8,

    /// Sets a minimum haploset quality (HAPQ) to include a haploset in the strain clustering
    #[clap(long = "hapq-cut")]
    #[clap(value_name = "HAPQ")]
    #[clap(default_value = "15")]
    #[clap(help_heading = Some("Haploset Filtering"))]
    pub hapq_cut: u32,

    /// Number of strains to cluster into; 0 uses the mean strain count from the ploidy summary
    #[clap(short = 'n')]
    #[clap(long = "nb-strains")]
    #[clap(value_name = "COUNT")]
    #[clap(default_value = "0")]
    #[clap(help_heading = Some("Strain Clustering"))]
    pub nb_strains: usize,

    /// Sets a minimum strain clustering probability for an observation to vote on a strain
    #[clap(short = 's')]
    #[clap(long = "sp-cut")]
    #[clap(value_name = "PROB")]
    #[clap(default_value = "0.5")]
    #[clap(help_heading = Some("Strain Clustering"))]
    pub probability_cut: f64,

    /// Seed for the mixture model initialization
    #[clap(long = "seed")]
    #[clap(value_name = "SEED")]
    #[clap(default_value = "42")]
    #[clap(help_heading = Some("Strain Clustering"))]
    pub seed: u64,

    /// The parsed output mode, filled in by `check_settings(...)`
    #[clap(skip)]
    pub output_mode: OutputMode
}

impl Settings {
    /// Wrapper function to build the strain inference configuration from our CLI settings
    pub fn strainer_config(&self) -> StrainerConfig {
        StrainerConfig {
            floria_outdir: self.floria_outdir.clone(),
            nb_strains: self.nb_strains,
            hapq_cut: self.hapq_cut,
            probability_cut: self.probability_cut,
            seed: self.seed,
            threads: self.threads
        }
    }
}

pub fn get_raw_settings() -> Settings {
    Settings::parse()
}

/// Checks if a file exists and will otherwise exit
/// # Arguments
/// * `filename` - the file path to check for
/// * `label` - the label to use for error messages
fn check_required_filename(filename: &Path, label: &str) {
    if !filename.exists() {
        error!("{} does not exist: \"{}\"", label, filename.display());
        std::process::exit(exitcode::NOINPUT);
    } else {
        info!("{}: \"{}\"", label, filename.display());
    }
}

/// Do some additional checks here, we may increase these as we go.
/// Also can modify settings if needed since we're passing it around.
/// # Arguments
/// * `settings` - the raw settings, nothing has been checked other than what clap does for us.
pub fn check_settings(mut settings: Settings) -> Settings {
    //check for any of our required files
    check_required_filename(&settings.floria_outdir, "Floria output folder");
    check_required_filename(&settings.bam_filename, "Alignment file");

    settings.output_mode = match OutputMode::from_str(&settings.mode) {
        Ok(m) => m,
        Err(_) => {
            error!("--mode must be \"tag\" or \"split\", got \"{}\"", settings.mode);
            std::process::exit(exitcode::USAGE);
        }
    };

    // a single strain is not a mixture
    if settings.nb_strains == 1 {
        error!("--nb-strains must be 0 (automatic) or at least 2");
        std::process::exit(exitcode::USAGE);
    }

    if !(0.0..=1.0).contains(&settings.probability_cut) {
        error!("--sp-cut must be in the range [0.0, 1.0]");
        std::process::exit(exitcode::USAGE);
    }

    // 0 doesn't make sense, so lets just error proof it up to 1
    if settings.threads == 0 {
        settings.threads = 1;
    }

    // if this is not specified, then set it to the same as processing
    if settings.io_threads.is_none() {
        // 4 is a happy default, users can override if needed
        settings.io_threads = Some(settings.threads.min(4));
    }

    // dump stuff to the logger
    info!("Output mode: {}", settings.output_mode);
    info!("Output basename: \"{}\"", settings.output_basename.display());
    if let Some(filename) = settings.strain_table_filename.as_ref() {
        info!("Strain table: \"{}\"", filename.display());
    }

    info!("Haploset filtering:");
    info!("\tMinimum HAPQ: {}", settings.hapq_cut);

    info!("Strain clustering:");
    if settings.nb_strains == 0 {
        info!("\tNumber of strains: AUTOMATIC");
    } else {
        info!("\tNumber of strains: {}", settings.nb_strains);
        if settings.nb_strains > 10 {
            warn!("\tClustering into more than 10 strains is unlikely to be supported by allele frequencies alone.");
        }
    }
    info!("\tMinimum strain probability: {}", settings.probability_cut);
    info!("\tSeed: {}", settings.seed);

    info!("Processing threads: {}", settings.threads);
    info!("I/O threads: {}", settings.io_threads.unwrap_or(1));

    //send the settings back
    settings
}
