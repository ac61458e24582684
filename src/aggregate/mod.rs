//! Well-level aggregation of per-cell measurements.
//!
//! Groups per-cell feature rows by (plate, well[, site]) via the image table
//! and reduces each feature column with a summary statistic, emitting one
//! profile row per distinct grouping-key tuple. The three compartments are
//! aggregated independently and merged on the grouping keys; cell counts come
//! from the cells compartment alone.

use crate::data::store::{CompartmentTable, ImageKey, ImageTable, MeasurementStore, COMPARTMENTS};
use crate::data::table::{ProfileTable, METADATA_PREFIX};
use crate::error::{ProfileError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Summary statistic applied per group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOperation {
    Median,
    Mean,
}

impl AggregateOperation {
    /// Reduce a group's values, skipping NaN. An all-NaN group yields NaN.
    pub fn reduce(&self, values: &[f64]) -> f64 {
        let mut finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if finite.is_empty() {
            return f64::NAN;
        }
        match self {
            AggregateOperation::Mean => finite.iter().sum::<f64>() / finite.len() as f64,
            AggregateOperation::Median => {
                finite.sort_by(|a, b| a.partial_cmp(b).unwrap());
                let mid = finite.len() / 2;
                if finite.len() % 2 == 1 {
                    finite[mid]
                } else {
                    (finite[mid - 1] + finite[mid]) / 2.0
                }
            }
        }
    }
}

/// Feature columns to aggregate: inferred from the store schema or explicit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FeatureSelection {
    #[default]
    Infer,
    List(Vec<String>),
}

impl Serialize for FeatureSelection {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            FeatureSelection::Infer => serializer.serialize_str("infer"),
            FeatureSelection::List(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for FeatureSelection {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Keyword(String),
            List(Vec<String>),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Keyword(word) if word == "infer" => Ok(FeatureSelection::Infer),
            Repr::Keyword(word) => Err(serde::de::Error::custom(format!(
                "unknown feature selection '{word}' (expected 'infer' or a list)"
            ))),
            Repr::List(names) => Ok(FeatureSelection::List(names)),
        }
    }
}

impl FeatureSelection {
    fn keep(&self, name: &str) -> bool {
        match self {
            FeatureSelection::Infer => true,
            FeatureSelection::List(names) => names.iter().any(|n| n == name),
        }
    }
}

/// Grouping keys and statistic for one aggregation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateOptions {
    /// Plate column in the image table, e.g. `Image_Metadata_Plate`.
    pub plate_column: String,
    /// Well column in the image table, e.g. `Image_Metadata_Well`.
    pub well_column: String,
    /// Optional site column for site-level profiles.
    #[serde(default)]
    pub site_column: Option<String>,
    /// Serialized as `method` in run configurations.
    #[serde(default = "default_operation", rename = "method")]
    pub operation: AggregateOperation,
    #[serde(default)]
    pub features: FeatureSelection,
}

fn default_operation() -> AggregateOperation {
    AggregateOperation::Median
}

impl AggregateOptions {
    /// Grouping-key columns as stored in the image table.
    pub fn strata_columns(&self) -> Vec<String> {
        let mut columns = vec![self.plate_column.clone(), self.well_column.clone()];
        if let Some(site) = &self.site_column {
            columns.push(site.clone());
        }
        columns
    }

    /// Output names for the grouping keys: the image-table `Image_` prefix is
    /// stripped and a `Metadata_` prefix guaranteed, so the aggregated
    /// profile follows the global column convention.
    pub fn output_strata_columns(&self) -> Vec<String> {
        self.strata_columns()
            .iter()
            .map(|c| metadata_output_name(c))
            .collect()
    }

    /// Output name of the well grouping key.
    pub fn output_well_column(&self) -> String {
        metadata_output_name(&self.well_column)
    }
}

/// Output name for an image-table grouping column: the `Image_` prefix is
/// stripped and a `Metadata_` prefix guaranteed.
pub fn metadata_output_name(column: &str) -> String {
    let stripped = column.strip_prefix("Image_").unwrap_or(column);
    if stripped.starts_with(METADATA_PREFIX) {
        stripped.to_string()
    } else {
        format!("{METADATA_PREFIX}{stripped}")
    }
}

/// Distinct grouping-key tuples in first-appearance order, with the member
/// row indices of each group.
struct Grouping {
    strata: Vec<Vec<String>>,
    /// `rows[g]` holds the compartment row indices belonging to group `g`.
    rows: Vec<Vec<usize>>,
    index: HashMap<Vec<String>, usize>,
}

impl Grouping {
    fn build(image: &ImageTable, compartment: &CompartmentTable) -> Result<Self> {
        let mut grouping = Grouping {
            strata: Vec::new(),
            rows: Vec::new(),
            index: HashMap::new(),
        };
        for row in 0..compartment.n_rows() {
            let key: ImageKey = (
                compartment.table_number[row].clone(),
                compartment.image_number[row],
            );
            let strata = image.strata_for(&key).ok_or_else(|| {
                ProfileError::IdentityMismatch {
                    expected: format!("image ({}, {})", key.0, key.1),
                    found: "Image table".to_string(),
                }
            })?;
            let group = match grouping.index.get(strata) {
                Some(&g) => g,
                None => {
                    let g = grouping.strata.len();
                    grouping.index.insert(strata.to_vec(), g);
                    grouping.strata.push(strata.to_vec());
                    grouping.rows.push(Vec::new());
                    g
                }
            };
            grouping.rows[group].push(row);
        }
        Ok(grouping)
    }
}

/// Aggregate all three compartments into one well-level profile table.
///
/// Output rows are one per distinct grouping-key tuple present in the
/// per-cell data, keyed by the metadata-prefixed grouping columns.
pub fn aggregate(store: &MeasurementStore, options: &AggregateOptions) -> Result<ProfileTable> {
    let image = store.image_table(&options.strata_columns())?;
    let output_strata = options.output_strata_columns();

    let mut merged: Option<ProfileTable> = None;
    for (compartment_name, _) in COMPARTMENTS {
        let compartment = store.compartment(compartment_name, None)?;
        let grouping = Grouping::build(&image, &compartment)?;
        let aggregated =
            aggregate_compartment(&compartment, &grouping, options, &output_strata)?;
        merged = Some(match merged {
            None => aggregated,
            Some(left) => {
                let keys: Vec<(String, String)> = output_strata
                    .iter()
                    .map(|c| (c.clone(), c.clone()))
                    .collect();
                let (joined, unmatched) = left.left_join(&aggregated, &keys)?;
                if unmatched > 0 {
                    return Err(ProfileError::IncompleteJoin {
                        unmatched,
                        total: joined.n_rows(),
                    });
                }
                joined
            }
        });
    }
    merged.ok_or_else(|| ProfileError::EmptyData("no compartments aggregated".to_string()))
}

fn aggregate_compartment(
    compartment: &CompartmentTable,
    grouping: &Grouping,
    options: &AggregateOptions,
    output_strata: &[String],
) -> Result<ProfileTable> {
    let n_groups = grouping.strata.len();
    let mut table = ProfileTable::new();
    for (i, name) in output_strata.iter().enumerate() {
        let values: Vec<String> = grouping.strata.iter().map(|s| s[i].clone()).collect();
        table.push_meta(name, values)?;
    }

    for (f, feature_name) in compartment.feature_names.iter().enumerate() {
        if !options.features.keep(feature_name) {
            continue;
        }
        let column = &compartment.features[f];
        let mut reduced = Vec::with_capacity(n_groups);
        let mut group_values = Vec::new();
        for members in &grouping.rows {
            group_values.clear();
            group_values.extend(members.iter().map(|&row| column[row]));
            reduced.push(options.operation.reduce(&group_values));
        }
        table.push_feature(feature_name, reduced)?;
    }
    Ok(table)
}

/// Count per-cell rows per grouping-key tuple from the cells compartment.
///
/// Returns a table of the metadata-prefixed grouping keys plus
/// `Metadata_cell_count`.
pub fn count_cells(store: &MeasurementStore, options: &AggregateOptions) -> Result<ProfileTable> {
    let image = store.image_table(&options.strata_columns())?;
    let cells = store.compartment("cells", None)?;
    let grouping = Grouping::build(&image, &cells)?;

    let mut table = ProfileTable::new();
    for (i, name) in options.output_strata_columns().iter().enumerate() {
        let values: Vec<String> = grouping.strata.iter().map(|s| s[i].clone()).collect();
        table.push_meta(name, values)?;
    }
    let counts: Vec<String> = grouping.rows.iter().map(|r| r.len().to_string()).collect();
    table.push_meta("Metadata_cell_count", counts)?;
    Ok(table)
}
