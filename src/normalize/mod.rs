//! Feature normalization against a reference sample subset.
//!
//! Statistics are computed only from rows matching the reference predicate
//! (for example, control wells) and then applied to every row, so treated
//! samples are expressed relative to the untreated baseline. Metadata columns
//! pass through untouched.

use crate::data::table::ProfileTable;
use crate::error::{ProfileError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Normalization method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeMethod {
    /// (x − mean) / std, population standard deviation.
    Standardize,
    /// (x − median) / (1.4826 · MAD), robust to outliers.
    MadRobustize,
}

/// Which rows contribute normalization statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SamplePredicate {
    /// Every row is a reference sample.
    #[default]
    All,
    /// Rows where a metadata column equals a value.
    MetaEquals { column: String, value: String },
    /// Rows where a metadata column differs from a value.
    MetaNotEquals { column: String, value: String },
}

impl SamplePredicate {
    /// Parse the configuration form: `all`, `column == 'value'`, or
    /// `column != 'value'` (the pandas-query style the run configs use).
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(SamplePredicate::All);
        }
        for (op, negated) in [("==", false), ("!=", true)] {
            if let Some((column, value)) = trimmed.split_once(op) {
                let column = column.trim().to_string();
                let value = value.trim().trim_matches(|c| c == '\'' || c == '"').to_string();
                return Ok(if negated {
                    SamplePredicate::MetaNotEquals { column, value }
                } else {
                    SamplePredicate::MetaEquals { column, value }
                });
            }
        }
        Err(ProfileError::InvalidParameter(format!(
            "unparseable sample predicate '{expr}'"
        )))
    }

    /// Row mask of reference samples.
    pub fn mask(&self, table: &ProfileTable) -> Result<Vec<bool>> {
        match self {
            SamplePredicate::All => Ok(vec![true; table.n_rows()]),
            SamplePredicate::MetaEquals { column, value } => table.mask_meta_eq(column, value),
            SamplePredicate::MetaNotEquals { column, value } => Ok(table
                .mask_meta_eq(column, value)?
                .into_iter()
                .map(|m| !m)
                .collect()),
        }
    }
}

/// Normalize all feature columns in place against the reference subset.
///
/// Every feature column is rescaled with the same reference statistics,
/// including rows outside the reference subset. NaN values are skipped when
/// computing statistics and stay NaN afterwards. A feature with zero spread
/// in the reference subset is an error (it cannot be rescaled).
pub fn normalize(
    table: &ProfileTable,
    method: NormalizeMethod,
    samples: &SamplePredicate,
) -> Result<ProfileTable> {
    let mask = samples.mask(table)?;
    if !mask.iter().any(|&m| m) {
        return Err(ProfileError::EmptyData(
            "reference predicate matched no rows".to_string(),
        ));
    }

    let feature_names = table.feature_columns();
    let normalized: Vec<Result<(String, Vec<f64>)>> = feature_names
        .par_iter()
        .map(|name| {
            let values = table.feature(name)?;
            Ok((name.clone(), normalize_column(values, &mask, method, name)?))
        })
        .collect();

    let mut out = table.clone();
    for result in normalized {
        let (name, values) = result?;
        out.set_feature(&name, values)?;
    }
    Ok(out)
}

fn normalize_column(
    values: &[f64],
    mask: &[bool],
    method: NormalizeMethod,
    name: &str,
) -> Result<Vec<f64>> {
    let reference: Vec<f64> = values
        .iter()
        .zip(mask)
        .filter(|(v, &m)| m && !v.is_nan())
        .map(|(&v, _)| v)
        .collect();
    if reference.is_empty() {
        return Err(ProfileError::EmptyData(format!(
            "no finite reference values for feature '{name}'"
        )));
    }

    let (center, spread) = match method {
        NormalizeMethod::Standardize => {
            let mean = reference.iter().sum::<f64>() / reference.len() as f64;
            let variance = reference.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / reference.len() as f64;
            (mean, variance.sqrt())
        }
        NormalizeMethod::MadRobustize => {
            let center = median(&reference);
            let deviations: Vec<f64> = reference.iter().map(|v| (v - center).abs()).collect();
            // 1.4826 rescales the MAD to a normal-consistent sigma.
            (center, 1.4826 * median(&deviations))
        }
    };
    if spread == 0.0 || !spread.is_finite() {
        return Err(ProfileError::Numerical(format!(
            "feature '{name}' has zero spread in the reference subset"
        )));
    }
    Ok(values.iter().map(|v| (v - center) / spread).collect())
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}
