//! cytoprofile - Cell Painting profiling CLI
//!
//! Command-line interface for per-plate profile construction, analytical
//! dataset assembly, and single-cell extraction.

use clap::{Parser, Subcommand};
use cytoprofile::config::RunConfig;
use cytoprofile::data::store::MeasurementStore;
use cytoprofile::error::Result;
use cytoprofile::single_cell::{process_images, SingleCellOptions};
use cytoprofile::split::SplitConfig;
use std::path::{Path, PathBuf};

/// Cell Painting profile construction and dataset assembly
#[derive(Parser)]
#[command(name = "cytoprofile")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the per-plate profiling pipeline from a YAML descriptor
    Profiles {
        /// Path to the multi-document run configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Override the configured profile output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Assemble analytical datasets with model splits from processed profiles
    Assemble {
        /// Path to the dataset assembly configuration YAML
        #[arg(short, long)]
        config: PathBuf,

        /// Override the configured profile input directory
        #[arg(short, long)]
        profile_dir: Option<PathBuf>,

        /// Override the configured output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Merge per-cell compartment measurements and write a train/test split
    SingleCell {
        /// Path to a per-plate measurement database
        #[arg(short, long)]
        database: PathBuf,

        /// Output directory for the train/test tables
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Image numbers to extract (default: every image in the store)
        #[arg(short, long)]
        images: Vec<i64>,

        /// Substring flags; features containing any flag are dropped
        #[arg(long)]
        feature_filter: Vec<String>,

        /// Split seed
        #[arg(long, default_value = "123")]
        seed: u64,

        /// Test proportion
        #[arg(long, default_value = "0.15")]
        test_size: f64,
    },
}

fn cmd_profiles(config_path: &Path, output_dir: Option<PathBuf>) -> Result<()> {
    let mut config = RunConfig::load(config_path)?;
    if let Some(dir) = output_dir {
        config.pipeline.output_dir = dir;
    }
    cytoprofile::pipeline::run(&config)
}

fn cmd_assemble(
    config_path: &Path,
    profile_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = SplitConfig::load(config_path)?;
    if let Some(dir) = profile_dir {
        config.profile_dir = dir;
    }
    if let Some(dir) = output_dir {
        config.output_dir = dir;
    }
    cytoprofile::split::assemble_all(&config)
}

fn cmd_single_cell(
    database: &Path,
    output_dir: &Path,
    images: Vec<i64>,
    options: SingleCellOptions,
) -> Result<()> {
    let store = MeasurementStore::open(database)?;
    let strata = vec![
        "Image_Metadata_Plate".to_string(),
        "Image_Metadata_Well".to_string(),
        "Image_Metadata_Site".to_string(),
    ];
    let image = store.image_table(&strata)?;
    let images = if images.is_empty() {
        store.image_numbers()?
    } else {
        images
    };
    let (train, test) = process_images(&store, &image, &images, &options)?;
    train.write_delimited(output_dir.join("single_cells_train.csv.gz"))?;
    test.write_delimited(output_dir.join("single_cells_test.csv.gz"))?;
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Profiles { config, output_dir } => cmd_profiles(&config, output_dir),

        Commands::Assemble {
            config,
            profile_dir,
            output_dir,
        } => cmd_assemble(&config, profile_dir, output_dir),

        Commands::SingleCell {
            database,
            output_dir,
            images,
            feature_filter,
            seed,
            test_size,
        } => {
            let options = SingleCellOptions {
                feature_filter,
                seed,
                test_size,
                ..SingleCellOptions::default()
            };
            cmd_single_cell(&database, &output_dir, images, options)
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
