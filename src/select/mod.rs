//! Feature selection: removing feature columns that fail quality criteria.
//!
//! Operations run in the configured order and each one sees only the columns
//! surviving earlier operations. Selection is computed once, on a
//! training-only subset when splits exist, and the resulting column set is
//! then applied to the other subsets — it is never recomputed on
//! non-training data.

use crate::data::table::ProfileTable;
use crate::error::{ProfileError, Result};
use nalgebra::DMatrix;
use rayon::prelude::*;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A single selection operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectOperation {
    /// Drop near-constant features (dominant-value and uniqueness ratios).
    VarianceThreshold,
    /// Drop one member of each highly correlated feature pair.
    CorrelationThreshold,
    /// Drop features whose missing fraction exceeds the cutoff.
    DropNaColumns,
    /// Drop features matching the blocklist patterns.
    Blocklist,
    /// Drop features with extreme absolute values.
    DropOutliers,
}

/// Parameters shared by the selection operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectOptions {
    pub operations: Vec<SelectOperation>,
    /// Pairwise Pearson threshold for `correlation_threshold`.
    #[serde(default = "default_corr_threshold")]
    pub corr_threshold: f64,
    /// Maximum tolerated missing fraction for `drop_na_columns`.
    #[serde(default = "default_na_cutoff")]
    pub na_cutoff: f64,
    /// Second-most-common / most-common frequency ratio below which a
    /// feature counts as near-constant.
    #[serde(default = "default_freq_cut")]
    pub freq_cut: f64,
    /// Distinct-value fraction below which a feature counts as near-constant.
    #[serde(default = "default_unique_cut")]
    pub unique_cut: f64,
    /// Maximum tolerated absolute value for `drop_outliers` (profiles are
    /// normalized, so this is in reference-sigma units).
    #[serde(default = "default_outlier_cutoff")]
    pub outlier_cutoff: f64,
    /// Regex patterns for `blocklist`; empty means the standard Cell
    /// Painting blocklist families.
    #[serde(default)]
    pub blocklist: Vec<String>,
}

fn default_corr_threshold() -> f64 {
    0.9
}
fn default_na_cutoff() -> f64 {
    0.05
}
fn default_freq_cut() -> f64 {
    0.05
}
fn default_unique_cut() -> f64 {
    0.01
}
fn default_outlier_cutoff() -> f64 {
    15.0
}

/// Correlation and intensity-bleedthrough families known to be unreliable.
pub const DEFAULT_BLOCKLIST: [&str; 4] = ["Costes", "Manders", "RWC", "Granularity_1[4-6]"];

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            operations: vec![
                SelectOperation::VarianceThreshold,
                SelectOperation::CorrelationThreshold,
                SelectOperation::DropNaColumns,
                SelectOperation::Blocklist,
                SelectOperation::DropOutliers,
            ],
            corr_threshold: default_corr_threshold(),
            na_cutoff: default_na_cutoff(),
            freq_cut: default_freq_cut(),
            unique_cut: default_unique_cut(),
            outlier_cutoff: default_outlier_cutoff(),
            blocklist: Vec::new(),
        }
    }
}

/// Compute the surviving feature set on `table` (typically the training
/// subset), returning names in table order.
pub fn select_features(table: &ProfileTable, options: &SelectOptions) -> Result<Vec<String>> {
    let mut surviving = table.feature_columns();
    if surviving.is_empty() {
        return Err(ProfileError::EmptyData("no feature columns".to_string()));
    }
    for operation in &options.operations {
        surviving = match operation {
            SelectOperation::VarianceThreshold => variance_threshold(table, &surviving, options)?,
            SelectOperation::CorrelationThreshold => {
                correlation_threshold(table, &surviving, options)?
            }
            SelectOperation::DropNaColumns => drop_na_columns(table, &surviving, options)?,
            SelectOperation::Blocklist => blocklist(&surviving, options)?,
            SelectOperation::DropOutliers => drop_outliers(table, &surviving, options)?,
        };
    }
    Ok(surviving)
}

/// Reindex a table onto a previously computed feature set: all metadata
/// columns plus the selected features, in selection order. Selected features
/// absent from the table are skipped, so the applied set is always a subset
/// of the computed one.
pub fn apply_selection(table: &ProfileTable, selected: &[String]) -> Result<ProfileTable> {
    let mut order = table.metadata_columns();
    let features: HashSet<String> = table.feature_columns().into_iter().collect();
    order.extend(selected.iter().filter(|f| features.contains(*f)).cloned());
    table.select_columns(&order)
}

fn variance_threshold(
    table: &ProfileTable,
    surviving: &[String],
    options: &SelectOptions,
) -> Result<Vec<String>> {
    let mut kept = Vec::new();
    for name in surviving {
        let values = table.feature(name)?;
        let finite: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
        if finite.is_empty() {
            continue;
        }
        let mut counts: HashMap<u64, usize> = HashMap::new();
        for v in &finite {
            *counts.entry(v.to_bits()).or_insert(0) += 1;
        }
        let mut ordered: Vec<usize> = counts.values().copied().collect();
        ordered.sort_unstable_by(|a, b| b.cmp(a));

        // Single-valued features and features dominated by one value go.
        let near_constant = match ordered.as_slice() {
            [_] => true,
            [first, second, ..] => (*second as f64 / *first as f64) < options.freq_cut,
            [] => true,
        };
        let low_uniqueness = (counts.len() as f64 / finite.len() as f64) < options.unique_cut;
        if !near_constant && !low_uniqueness {
            kept.push(name.clone());
        }
    }
    Ok(kept)
}

fn correlation_threshold(
    table: &ProfileTable,
    surviving: &[String],
    options: &SelectOptions,
) -> Result<Vec<String>> {
    let p = surviving.len();
    if p < 2 {
        return Ok(surviving.to_vec());
    }
    let columns: Vec<&[f64]> = surviving
        .iter()
        .map(|name| table.feature(name))
        .collect::<Result<_>>()?;

    // Pairwise-complete Pearson correlations, one matrix row at a time.
    let rows: Vec<Vec<f64>> = (0..p)
        .into_par_iter()
        .map(|i| {
            (0..p)
                .map(|j| {
                    if i == j {
                        1.0
                    } else {
                        pearson(columns[i], columns[j])
                    }
                })
                .collect()
        })
        .collect();
    let corr = DMatrix::from_fn(p, p, |i, j| rows[i][j]);

    let mean_abs: Vec<f64> = (0..p)
        .map(|i| {
            let sum: f64 = (0..p)
                .filter(|&j| j != i)
                .map(|j| corr[(i, j)].abs())
                .filter(|v| !v.is_nan())
                .sum();
            sum / (p - 1) as f64
        })
        .collect();

    // For each offending pair, drop the member more correlated with
    // everything else overall.
    let mut dropped = vec![false; p];
    for i in 0..p {
        for j in (i + 1)..p {
            if dropped[i] || dropped[j] {
                continue;
            }
            let r = corr[(i, j)];
            if !r.is_nan() && r.abs() > options.corr_threshold {
                if mean_abs[i] >= mean_abs[j] {
                    dropped[i] = true;
                } else {
                    dropped[j] = true;
                }
            }
        }
    }
    Ok(surviving
        .iter()
        .zip(&dropped)
        .filter(|(_, &d)| !d)
        .map(|(n, _)| n.clone())
        .collect())
}

fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(y)
        .filter(|(a, b)| !a.is_nan() && !b.is_nan())
        .map(|(&a, &b)| (a, b))
        .collect();
    if pairs.len() < 2 {
        return f64::NAN;
    }
    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|(a, _)| a).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|(_, b)| b).sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in &pairs {
        cov += (a - mean_x) * (b - mean_y);
        var_x += (a - mean_x).powi(2);
        var_y += (b - mean_y).powi(2);
    }
    if var_x == 0.0 || var_y == 0.0 {
        f64::NAN
    } else {
        cov / (var_x.sqrt() * var_y.sqrt())
    }
}

fn drop_na_columns(
    table: &ProfileTable,
    surviving: &[String],
    options: &SelectOptions,
) -> Result<Vec<String>> {
    let mut kept = Vec::new();
    for name in surviving {
        let values = table.feature(name)?;
        let missing = values.iter().filter(|v| v.is_nan()).count();
        if (missing as f64 / values.len() as f64) <= options.na_cutoff {
            kept.push(name.clone());
        }
    }
    Ok(kept)
}

fn blocklist(surviving: &[String], options: &SelectOptions) -> Result<Vec<String>> {
    let patterns: Vec<&str> = if options.blocklist.is_empty() {
        DEFAULT_BLOCKLIST.to_vec()
    } else {
        options.blocklist.iter().map(|s| s.as_str()).collect()
    };
    let set = RegexSet::new(&patterns)
        .map_err(|e| ProfileError::InvalidParameter(format!("bad blocklist pattern: {e}")))?;
    Ok(surviving
        .iter()
        .filter(|name| !set.is_match(name))
        .cloned()
        .collect())
}

fn drop_outliers(
    table: &ProfileTable,
    surviving: &[String],
    options: &SelectOptions,
) -> Result<Vec<String>> {
    let mut kept = Vec::new();
    for name in surviving {
        let values = table.feature(name)?;
        let max_abs = values
            .iter()
            .filter(|v| !v.is_nan())
            .fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if max_abs <= options.outlier_cutoff {
            kept.push(name.clone());
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(features: Vec<(&str, Vec<f64>)>) -> ProfileTable {
        let n = features[0].1.len();
        let mut table = ProfileTable::new();
        table
            .push_meta(
                "Metadata_Well",
                (0..n).map(|i| format!("W{i:02}")).collect(),
            )
            .unwrap();
        for (name, values) in features {
            table.push_feature(name, values).unwrap();
        }
        table
    }

    fn only(ops: &[SelectOperation]) -> SelectOptions {
        SelectOptions {
            operations: ops.to_vec(),
            ..SelectOptions::default()
        }
    }

    #[test]
    fn variance_threshold_drops_constant_features() {
        let table = table_with(vec![
            ("Cells_Constant", vec![1.0; 10]),
            ("Cells_Varying", (0..10).map(|i| i as f64).collect()),
        ]);
        let selected =
            select_features(&table, &only(&[SelectOperation::VarianceThreshold])).unwrap();
        assert_eq!(selected, vec!["Cells_Varying"]);
    }

    #[test]
    fn correlation_threshold_drops_one_of_a_pair() {
        let x: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let x_dup: Vec<f64> = x.iter().map(|v| v * 2.0 + 1.0).collect(); // r = 1
        let noise: Vec<f64> = (0..20)
            .map(|i| if i % 2 == 0 { 1.0 } else { -(i as f64) })
            .collect();
        let table = table_with(vec![
            ("Cells_A", x),
            ("Cells_B", x_dup),
            ("Cells_C", noise),
        ]);
        let selected =
            select_features(&table, &only(&[SelectOperation::CorrelationThreshold])).unwrap();
        assert_eq!(selected.len(), 2);
        assert!(selected.contains(&"Cells_C".to_string()));
        // Exactly one of the duplicated pair survives.
        let pair_survivors = selected
            .iter()
            .filter(|n| *n == "Cells_A" || *n == "Cells_B")
            .count();
        assert_eq!(pair_survivors, 1);
    }

    #[test]
    fn drop_na_columns_respects_cutoff() {
        let table = table_with(vec![
            ("Cells_Missing", vec![1.0, f64::NAN, 3.0, f64::NAN]),
            ("Cells_Complete", vec![1.0, 2.0, 3.0, 4.0]),
        ]);
        let mut options = only(&[SelectOperation::DropNaColumns]);
        options.na_cutoff = 0.0;
        assert_eq!(
            select_features(&table, &options).unwrap(),
            vec!["Cells_Complete"]
        );
        options.na_cutoff = 0.5;
        assert_eq!(select_features(&table, &options).unwrap().len(), 2);
    }

    #[test]
    fn blocklist_matches_default_families() {
        let table = table_with(vec![
            ("Nuclei_Correlation_Costes_DNA_Mito", vec![1.0, 2.0]),
            ("Nuclei_Correlation_Manders_DNA_Mito", vec![1.0, 2.0]),
            ("Cells_Granularity_15_Mito", vec![1.0, 2.0]),
            ("Cells_Granularity_3_Mito", vec![1.0, 2.0]),
            ("Cells_AreaShape_Area", vec![1.0, 2.0]),
        ]);
        let selected = select_features(&table, &only(&[SelectOperation::Blocklist])).unwrap();
        assert_eq!(
            selected,
            vec!["Cells_Granularity_3_Mito", "Cells_AreaShape_Area"]
        );
    }

    #[test]
    fn drop_outliers_uses_max_absolute_value() {
        let table = table_with(vec![
            ("Cells_Wild", vec![0.0, 99.0]),
            ("Cells_Tame", vec![0.5, -1.5]),
        ]);
        let selected = select_features(&table, &only(&[SelectOperation::DropOutliers])).unwrap();
        assert_eq!(selected, vec!["Cells_Tame"]);
    }

    #[test]
    fn operations_compose_in_order() {
        let table = table_with(vec![
            ("Cells_Constant", vec![1.0; 4]),
            ("Cells_Costes_Thing", vec![1.0, 2.0, 3.0, 4.0]),
            ("Cells_Keep", vec![1.0, 2.0, 3.0, 5.0]),
        ]);
        let options = only(&[
            SelectOperation::VarianceThreshold,
            SelectOperation::Blocklist,
        ]);
        assert_eq!(select_features(&table, &options).unwrap(), vec!["Cells_Keep"]);
    }

    #[test]
    fn apply_selection_never_adds_columns() {
        // Selection computed on training includes a feature the test table
        // lacks; applying must not invent it.
        let test_table = table_with(vec![("Cells_Keep", vec![1.0, 2.0])]);
        let selected = vec!["Cells_Keep".to_string(), "Cells_TrainOnly".to_string()];
        let applied = apply_selection(&test_table, &selected).unwrap();
        assert_eq!(applied.column_names(), &["Metadata_Well", "Cells_Keep"]);

        // Subset invariant: applied features are a subset of the selection.
        let applied_features: HashSet<String> = applied.feature_columns().into_iter().collect();
        assert!(applied_features.is_subset(&selected.iter().cloned().collect()));
    }
}
