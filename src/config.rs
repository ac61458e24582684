//! Run configuration: the multi-document YAML descriptor.
//!
//! One document carries the pipeline-wide settings (recognized by its
//! `pipeline` key); every other document describes one batch with a `process`
//! flag, a batch name, and a plate list. Batches with `process: false` are
//! excluded from all downstream processing. A descriptor without a pipeline
//! document is a fatal configuration error.

use crate::aggregate::AggregateOptions;
use crate::error::{ProfileError, Result};
use crate::normalize::NormalizeMethod;
use crate::select::SelectOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Output compression for per-plate profile artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl Compression {
    /// File suffix for a profile stage, e.g. `csv` or `csv.gz`.
    pub fn csv_suffix(&self) -> &'static str {
        match self {
            Compression::None => "csv",
            Compression::Gzip => "csv.gz",
        }
    }
}

/// Global processing options shared across stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalOptions {
    #[serde(default)]
    pub compression: Compression,
    /// Reference-sample predicate for normalization, in query form
    /// (`all` or `column == 'value'`).
    #[serde(default = "default_samples")]
    pub samples: String,
}

fn default_samples() -> String {
    "all".to_string()
}

impl Default for GlobalOptions {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            samples: default_samples(),
        }
    }
}

/// Aggregate stage block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateStep {
    pub perform: bool,
    #[serde(flatten)]
    pub options: AggregateOptions,
}

/// Annotate stage block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotateStep {
    pub perform: bool,
    /// Well column on the profile side of the join.
    pub well_column: String,
}

/// Normalize stage block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeStep {
    pub perform: bool,
    pub method: NormalizeMethod,
    /// Per-stage override of the global reference-sample predicate.
    #[serde(default)]
    pub samples: Option<String>,
}

/// Feature-selection stage block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureSelectStep {
    pub perform: bool,
    #[serde(flatten)]
    pub options: SelectOptions,
}

/// Cell-count side output block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CountStep {
    #[serde(default)]
    pub perform: bool,
    /// Directory for `<batch>_<plate>_cell_count.tsv` files.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

/// The pipeline-wide settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name (the key that marks this document).
    pub pipeline: String,
    pub workspace_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Well column on the platemap side of joins.
    pub platemap_well_column: String,
    #[serde(default)]
    pub options: GlobalOptions,
    pub aggregate: AggregateStep,
    pub annotate: AnnotateStep,
    pub normalize: NormalizeStep,
    pub feature_select: FeatureSelectStep,
    #[serde(default)]
    pub count: CountStep,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchDocument {
    process: bool,
    batch: String,
    plates: Vec<serde_yaml::Value>,
}

/// One batch to process: its name and plate barcodes.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub batch: String,
    pub plates: Vec<String>,
}

impl BatchConfig {
    /// Conventional measurement-store path for a plate in this batch.
    pub fn store_path(&self, workspace_dir: &Path, plate: &str) -> PathBuf {
        workspace_dir
            .join("backend")
            .join(&self.batch)
            .join(plate)
            .join(format!("{plate}.sqlite"))
    }
}

/// A parsed run configuration: pipeline settings plus processable batches.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub pipeline: PipelineConfig,
    pub batches: Vec<BatchConfig>,
}

impl RunConfig {
    /// Parse a multi-document descriptor file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse descriptor text. Malformed documents propagate as fatal parse
    /// errors; there is no partial recovery.
    pub fn parse(text: &str) -> Result<Self> {
        let mut pipeline: Option<PipelineConfig> = None;
        let mut batches = Vec::new();

        for document in serde_yaml::Deserializer::from_str(text) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            if value.get("pipeline").is_some() {
                if pipeline.is_some() {
                    return Err(ProfileError::Config(
                        "multiple pipeline documents in descriptor".to_string(),
                    ));
                }
                pipeline = Some(serde_yaml::from_value(value)?);
            } else {
                let batch: BatchDocument = serde_yaml::from_value(value)?;
                if !batch.process {
                    continue;
                }
                // Plate barcodes may be written as bare numbers in YAML.
                let plates = batch
                    .plates
                    .iter()
                    .map(plate_as_string)
                    .collect::<Result<Vec<_>>>()?;
                batches.push(BatchConfig {
                    batch: batch.batch,
                    plates,
                });
            }
        }

        let pipeline = pipeline.ok_or_else(|| {
            ProfileError::Config("descriptor contains no pipeline document".to_string())
        })?;
        Ok(Self { pipeline, batches })
    }
}

fn plate_as_string(value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Err(ProfileError::Config(format!(
            "unsupported plate identifier: {other:?}"
        ))),
    }
}
