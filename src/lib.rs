//! Cell Painting profile construction and dataset-split pipeline.
//!
//! Turns per-plate single-cell measurement databases into analysis-ready
//! morphology profiles: well-level aggregation, platemap annotation,
//! reference-subset normalization, feature selection, and multi-plate
//! analytical dataset assembly with reproducible model splits.
//!
//! # Overview
//!
//! The library is organized into composable modules:
//!
//! - **data**: Core data structures (ProfileTable, MeasurementStore, Platemap)
//! - **aggregate**: Well-level aggregation of per-cell measurements
//! - **annotate**: Platemap metadata joins
//! - **normalize**: Reference-subset standardization / MAD robustization
//! - **select**: Feature selection operations
//! - **single_cell**: Per-cell compartment merges and splits
//! - **split**: Multi-plate dataset assembly and model-split assignment
//! - **pipeline**: The staged per-plate pipeline runner
//! - **config**: Multi-document YAML run configuration
//! - **gct**: GCT 1.3 export for heatmap tooling
//!
//! # Example
//!
//! ```no_run
//! use cytoprofile::prelude::*;
//!
//! let config = RunConfig::load("profiling_config.yml").unwrap();
//! cytoprofile::pipeline::run(&config).unwrap();
//! ```

pub mod aggregate;
pub mod annotate;
pub mod config;
pub mod data;
pub mod error;
pub mod gct;
pub mod normalize;
pub mod pipeline;
pub mod select;
pub mod single_cell;
pub mod split;

/// Convenient re-exports for common usage.
pub mod prelude {
    pub use crate::aggregate::{aggregate, count_cells, AggregateOperation, AggregateOptions};
    pub use crate::annotate::annotate;
    pub use crate::config::{BatchConfig, Compression, PipelineConfig, RunConfig};
    pub use crate::data::platemap::{resolve_platemap, BarcodeMap, Platemap};
    pub use crate::data::store::{CompartmentTable, ImageTable, MeasurementStore};
    pub use crate::data::table::{Column, ProfileTable};
    pub use crate::error::{ProfileError, Result};
    pub use crate::gct::write_gct;
    pub use crate::normalize::{normalize, NormalizeMethod, SamplePredicate};
    pub use crate::pipeline::PlatePaths;
    pub use crate::select::{apply_selection, select_features, SelectOperation, SelectOptions};
    pub use crate::single_cell::{merge_cells, process_images, SingleCellOptions};
    pub use crate::split::{
        assemble_all, assemble_dataset, stratified_split, DatasetSpec, SplitConfig, SplitLabel,
    };
}
