//! Single-cell merge path: per-cell analytical tables.
//!
//! Joins the three compartment tables on shared (TableNumber, ImageNumber,
//! ObjectNumber) identifiers via the cytoplasm parent references, attaches
//! image-level metadata, and emits one row per detected cell. Cells whose
//! cytoplasm or nucleus parent reference does not resolve are dropped by the
//! inner joins — merged row count is at most the raw cell-table row count,
//! and callers must not assume equality.

use crate::data::store::{ImageTable, MeasurementStore};
use crate::data::table::ProfileTable;
use crate::error::{ProfileError, Result};
use crate::normalize::{normalize, NormalizeMethod, SamplePredicate};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Parent-reference columns recorded on the cytoplasm table.
const PARENT_CELLS: &str = "Cytoplasm_Parent_Cells";
const PARENT_NUCLEI: &str = "Cytoplasm_Parent_Nuclei";

/// Options for per-cell extraction and splitting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleCellOptions {
    /// Substring flags; feature columns containing any flag are dropped
    /// before merging (e.g. `Costes`, `Location`).
    #[serde(default)]
    pub feature_filter: Vec<String>,
    /// Normalize each image's cells before splitting.
    #[serde(default)]
    pub normalize: bool,
    #[serde(default = "default_method")]
    pub method: NormalizeMethod,
    #[serde(default = "default_test_size")]
    pub test_size: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_method() -> NormalizeMethod {
    NormalizeMethod::Standardize
}
fn default_test_size() -> f64 {
    0.15
}
fn default_seed() -> u64 {
    123
}

impl Default for SingleCellOptions {
    fn default() -> Self {
        Self {
            feature_filter: Vec::new(),
            normalize: false,
            method: default_method(),
            test_size: default_test_size(),
            seed: default_seed(),
        }
    }
}

/// Merge the three compartments for the given image numbers into one
/// per-cell table.
///
/// The explicit image list caps memory and implements site-based sampling;
/// image-level grouping keys are left-joined on afterwards and
/// metadata-prefixed.
pub fn merge_cells(
    store: &MeasurementStore,
    image: &ImageTable,
    images: &[i64],
    feature_filter: &[String],
) -> Result<ProfileTable> {
    if images.is_empty() {
        return Err(ProfileError::InvalidParameter(
            "single-cell merge requires at least one image number".to_string(),
        ));
    }
    let cells = store.compartment("cells", Some(images))?;
    let cytoplasm = store.compartment("cytoplasm", Some(images))?;
    let nuclei = store.compartment("nuclei", Some(images))?;

    // Index cytoplasm by its parent-cell reference and nuclei by object id.
    let parent_cells = cytoplasm.parent(PARENT_CELLS)?;
    let parent_nuclei = cytoplasm.parent(PARENT_NUCLEI)?;
    let mut cytoplasm_by_cell: HashMap<(&str, i64, i64), usize> = HashMap::new();
    for row in 0..cytoplasm.n_rows() {
        let key = (
            cytoplasm.table_number[row].as_str(),
            cytoplasm.image_number[row],
            parent_cells[row],
        );
        cytoplasm_by_cell.entry(key).or_insert(row);
    }
    let mut nuclei_by_object: HashMap<(&str, i64, i64), usize> = HashMap::new();
    for row in 0..nuclei.n_rows() {
        let key = (
            nuclei.table_number[row].as_str(),
            nuclei.image_number[row],
            nuclei.object_number[row],
        );
        nuclei_by_object.entry(key).or_insert(row);
    }

    // Inner joins: cells -> cytoplasm (parent-cell), -> nuclei (parent-nucleus).
    let mut matched: Vec<(usize, usize, usize)> = Vec::new();
    for cell_row in 0..cells.n_rows() {
        let cell_key = (
            cells.table_number[cell_row].as_str(),
            cells.image_number[cell_row],
            cells.object_number[cell_row],
        );
        let Some(&cyto_row) = cytoplasm_by_cell.get(&cell_key) else {
            continue;
        };
        let nucleus_key = (cell_key.0, cell_key.1, parent_nuclei[cyto_row]);
        let Some(&nucleus_row) = nuclei_by_object.get(&nucleus_key) else {
            continue;
        };
        matched.push((cell_row, cyto_row, nucleus_row));
    }

    let mut table = ProfileTable::new();
    table.push_meta(
        "Metadata_TableNumber",
        matched
            .iter()
            .map(|&(c, _, _)| cells.table_number[c].clone())
            .collect(),
    )?;
    table.push_meta(
        "Metadata_ImageNumber",
        matched
            .iter()
            .map(|&(c, _, _)| cells.image_number[c].to_string())
            .collect(),
    )?;
    table.push_meta(
        "Metadata_ObjectNumber",
        matched
            .iter()
            .map(|&(c, _, _)| cells.object_number[c].to_string())
            .collect(),
    )?;

    // Image-level grouping keys, metadata-prefixed, left-joined by identity.
    for (i, column) in image.strata_columns.iter().enumerate() {
        let name = crate::aggregate::metadata_output_name(column);
        let values: Vec<String> = matched
            .iter()
            .map(|&(c, _, _)| {
                let key = (cells.table_number[c].clone(), cells.image_number[c]);
                image
                    .strata_for(&key)
                    .map(|s| s[i].clone())
                    .unwrap_or_default()
            })
            .collect();
        table.push_meta(&name, values)?;
    }

    for (compartment, rows) in [
        (&cells, matched.iter().map(|&(c, _, _)| c).collect::<Vec<_>>()),
        (&cytoplasm, matched.iter().map(|&(_, y, _)| y).collect()),
        (&nuclei, matched.iter().map(|&(_, _, n)| n).collect()),
    ] {
        for (f, name) in compartment.feature_names.iter().enumerate() {
            if feature_filter.iter().any(|flag| name.contains(flag)) {
                continue;
            }
            let column = &compartment.features[f];
            table.push_feature(name, rows.iter().map(|&r| column[r]).collect())?;
        }
    }
    Ok(table)
}

/// Process a list of images one at a time: merge, optionally normalize, and
/// split each image's cells into train/test, then concatenate the per-image
/// pieces.
pub fn process_images(
    store: &MeasurementStore,
    image: &ImageTable,
    images: &[i64],
    options: &SingleCellOptions,
) -> Result<(ProfileTable, ProfileTable)> {
    let mut train_parts = Vec::new();
    let mut test_parts = Vec::new();
    for &number in images {
        info!("merging single cells for image {number}");
        let mut merged = merge_cells(store, image, &[number], &options.feature_filter)?;
        if options.normalize {
            merged = normalize(&merged, options.method, &SamplePredicate::All)?;
        }
        let (train, test) = train_test_split(&merged, options.test_size, options.seed)?;
        train_parts.push(train);
        test_parts.push(test);
    }
    Ok((
        ProfileTable::concat_union(&train_parts)?,
        ProfileTable::concat_union(&test_parts)?,
    ))
}

/// Seeded random row split; the test partition gets ceil(n · test_size) rows.
pub fn train_test_split(
    table: &ProfileTable,
    test_size: f64,
    seed: u64,
) -> Result<(ProfileTable, ProfileTable)> {
    if !(0.0..1.0).contains(&test_size) {
        return Err(ProfileError::InvalidParameter(format!(
            "test_size {test_size} outside [0, 1)"
        )));
    }
    let n = table.n_rows();
    let mut indices: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    let n_test = (n as f64 * test_size).ceil() as usize;

    let mut is_test = vec![false; n];
    for &i in indices.iter().take(n_test) {
        is_test[i] = true;
    }
    let train_mask: Vec<bool> = is_test.iter().map(|&t| !t).collect();
    Ok((table.filter_rows(&train_mask)?, table.filter_rows(&is_test)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::fixtures::seed_plate;

    fn strata() -> Vec<String> {
        vec![
            "Image_Metadata_Plate".to_string(),
            "Image_Metadata_Well".to_string(),
        ]
    }

    #[test]
    fn merge_drops_cells_without_resolved_parents() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");
        let image = store.image_table(&strata()).unwrap();

        // Image 1 has 3 cells but only 2 cytoplasm rows.
        let merged = merge_cells(&store, &image, &[1], &[]).unwrap();
        let raw_cells = store.compartment("cells", Some(&[1])).unwrap();
        assert_eq!(merged.n_rows(), 2);
        assert!(merged.n_rows() <= raw_cells.n_rows());
    }

    #[test]
    fn merge_carries_all_three_compartment_features() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");
        let image = store.image_table(&strata()).unwrap();

        let merged = merge_cells(&store, &image, &[1, 2], &[]).unwrap();
        assert!(merged.has_column("Cells_AreaShape_Area"));
        assert!(merged.has_column("Cytoplasm_Texture_Entropy"));
        assert!(merged.has_column("Nuclei_AreaShape_Perimeter"));
        // Parent references are identity plumbing, not features.
        assert!(!merged.has_column("Cytoplasm_Parent_Cells"));
    }

    #[test]
    fn image_metadata_attached_and_prefixed() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");
        let image = store.image_table(&strata()).unwrap();

        let merged = merge_cells(&store, &image, &[2], &[]).unwrap();
        assert_eq!(merged.meta("Metadata_Plate").unwrap(), &["plateX", "plateX"]);
        assert_eq!(merged.meta("Metadata_Well").unwrap(), &["A02", "A02"]);
    }

    #[test]
    fn feature_filter_prunes_by_substring() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");
        let image = store.image_table(&strata()).unwrap();

        let merged = merge_cells(&store, &image, &[1], &["Texture".to_string()]).unwrap();
        assert!(!merged.has_column("Cytoplasm_Texture_Entropy"));
        assert!(merged.has_column("Cells_AreaShape_Area"));
    }

    #[test]
    fn split_is_deterministic_for_a_fixed_seed() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");
        let image = store.image_table(&strata()).unwrap();
        let merged = merge_cells(&store, &image, &[1, 2], &[]).unwrap();

        let (train_a, test_a) = train_test_split(&merged, 0.25, 7).unwrap();
        let (train_b, test_b) = train_test_split(&merged, 0.25, 7).unwrap();
        assert_eq!(
            train_a.meta("Metadata_ObjectNumber").unwrap(),
            train_b.meta("Metadata_ObjectNumber").unwrap()
        );
        assert_eq!(
            test_a.meta("Metadata_ObjectNumber").unwrap(),
            test_b.meta("Metadata_ObjectNumber").unwrap()
        );
        assert_eq!(train_a.n_rows() + test_a.n_rows(), merged.n_rows());
    }

    #[test]
    fn process_images_concatenates_per_image_splits() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");
        let image = store.image_table(&strata()).unwrap();

        let options = SingleCellOptions {
            test_size: 0.5,
            ..SingleCellOptions::default()
        };
        let (train, test) = process_images(&store, &image, &[1, 2], &options).unwrap();
        // Image 1 contributes 2 merged cells, image 2 contributes 2.
        assert_eq!(train.n_rows() + test.n_rows(), 4);
        assert!(test.n_rows() >= 2); // ceil(2 * 0.5) per image
    }
}
