//! Per-plate SQLite measurement stores.
//!
//! One database per imaging plate, holding three per-cell compartment tables
//! (`cells`, `cytoplasm`, `nuclei`) linked by shared (TableNumber,
//! ImageNumber, ObjectNumber) identifiers, plus an `Image` table carrying
//! per-image plate/well/site identifiers. Stores are read-only from this
//! pipeline's perspective; a connection is opened per plate, held for the
//! duration of aggregation and any single-cell extraction, and discarded.

use crate::error::{ProfileError, Result};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The three per-cell compartments and their feature-column prefixes.
pub const COMPARTMENTS: [(&str, &str); 3] = [
    ("cells", "Cells_"),
    ("cytoplasm", "Cytoplasm_"),
    ("nuclei", "Nuclei_"),
];

/// Shared image identity: (TableNumber, ImageNumber).
pub type ImageKey = (String, i64);

/// An open per-plate measurement database.
#[derive(Debug)]
pub struct MeasurementStore {
    conn: Connection,
    path: PathBuf,
}

impl MeasurementStore {
    /// Open a measurement store read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Ok(Self { conn, path })
    }

    /// Open a store after checking that the batch and plate names appear in
    /// its path, guarding against configuration/layout drift.
    pub fn open_checked<P: AsRef<Path>>(path: P, batch: &str, plate: &str) -> Result<Self> {
        let display = path.as_ref().display().to_string();
        for expected in [batch, plate] {
            if !display.contains(expected) {
                return Err(ProfileError::IdentityMismatch {
                    expected: expected.to_string(),
                    found: display,
                });
            }
        }
        Self::open(path)
    }

    /// Open an in-memory store (tests and fixtures).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            path: PathBuf::from(":memory:"),
        })
    }

    /// The underlying connection (fixture setup in tests).
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Store path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All distinct image numbers in the image table, ascending.
    pub fn image_numbers(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT ImageNumber FROM Image ORDER BY ImageNumber")?;
        let numbers = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(numbers)
    }

    /// Load the image table restricted to the given grouping-key columns.
    pub fn image_table(&self, strata_columns: &[String]) -> Result<ImageTable> {
        let select = strata_columns
            .iter()
            .map(|c| quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT TableNumber, ImageNumber, {select} FROM Image");
        let mut stmt = self.conn.prepare(&sql)?;

        let mut keys = Vec::new();
        let mut strata = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let table_number = value_as_string(row.get_ref(0)?);
            let image_number: i64 = row.get(1)?;
            let values: Vec<String> = (0..strata_columns.len())
                .map(|i| value_as_string(row.get_ref(2 + i).unwrap_or(ValueRef::Null)))
                .collect();
            keys.push((table_number, image_number));
            strata.push(values);
        }

        let lookup = keys
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, k)| (k, i))
            .collect();
        Ok(ImageTable {
            strata_columns: strata_columns.to_vec(),
            keys,
            strata,
            lookup,
        })
    }

    /// Load one compartment table, optionally filtered to a set of image
    /// numbers (used to cap memory during single-cell extraction).
    ///
    /// Only columns carrying the compartment's feature prefix are loaded as
    /// features; parent-reference columns (`*_Parent_*`) are kept separately
    /// as integer links, and the (TableNumber, ImageNumber, ObjectNumber)
    /// identity columns are always loaded.
    pub fn compartment(&self, name: &str, images: Option<&[i64]>) -> Result<CompartmentTable> {
        let prefix = COMPARTMENTS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, p)| *p)
            .ok_or_else(|| {
                ProfileError::InvalidParameter(format!("unknown compartment '{name}'"))
            })?;

        let sql = match images {
            Some(numbers) => {
                let placeholders = vec!["?"; numbers.len()].join(", ");
                format!("SELECT * FROM {name} WHERE ImageNumber IN ({placeholders})")
            }
            None => format!("SELECT * FROM {name}"),
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|s| s.to_string()).collect();

        let table_idx = required_column(&column_names, "TableNumber", name)?;
        let image_idx = required_column(&column_names, "ImageNumber", name)?;
        let object_idx = required_column(&column_names, "ObjectNumber", name)?;

        let mut feature_indices = Vec::new();
        let mut feature_names = Vec::new();
        let mut parent_indices = Vec::new();
        let mut parent_names = Vec::new();
        for (i, column) in column_names.iter().enumerate() {
            if column.contains("_Parent_") {
                parent_indices.push(i);
                parent_names.push(column.clone());
            } else if column.starts_with(prefix) {
                feature_indices.push(i);
                feature_names.push(column.clone());
            }
        }

        let mut table = CompartmentTable {
            name: name.to_string(),
            table_number: Vec::new(),
            image_number: Vec::new(),
            object_number: Vec::new(),
            feature_names,
            features: vec![Vec::new(); feature_indices.len()],
            parent_names,
            parents: vec![Vec::new(); parent_indices.len()],
        };

        let mut rows = match images {
            Some(numbers) => stmt.query(rusqlite::params_from_iter(numbers.iter()))?,
            None => stmt.query([])?,
        };
        while let Some(row) = rows.next()? {
            table
                .table_number
                .push(value_as_string(row.get_ref(table_idx)?));
            table.image_number.push(row.get(image_idx)?);
            table.object_number.push(row.get(object_idx)?);
            for (slot, &i) in feature_indices.iter().enumerate() {
                table.features[slot].push(value_as_f64(row.get_ref(i)?));
            }
            for (slot, &i) in parent_indices.iter().enumerate() {
                table.parents[slot].push(row.get(i)?);
            }
        }
        Ok(table)
    }
}

/// The image table projected onto the configured grouping keys.
#[derive(Debug, Clone)]
pub struct ImageTable {
    /// Grouping-key column names, as stored in the image table.
    pub strata_columns: Vec<String>,
    /// Image identities, one per image-table row.
    pub keys: Vec<ImageKey>,
    /// Grouping-key values per image, parallel to `keys`.
    pub strata: Vec<Vec<String>>,
    lookup: HashMap<ImageKey, usize>,
}

impl ImageTable {
    /// Grouping-key values for an image, if present.
    pub fn strata_for(&self, key: &ImageKey) -> Option<&[String]> {
        self.lookup.get(key).map(|&i| self.strata[i].as_slice())
    }

    /// Number of images.
    pub fn n_images(&self) -> usize {
        self.keys.len()
    }
}

/// One compartment's per-cell measurements, column-major.
#[derive(Debug, Clone)]
pub struct CompartmentTable {
    pub name: String,
    pub table_number: Vec<String>,
    pub image_number: Vec<i64>,
    pub object_number: Vec<i64>,
    pub feature_names: Vec<String>,
    /// Feature values, `features[f][row]`.
    pub features: Vec<Vec<f64>>,
    pub parent_names: Vec<String>,
    /// Parent object references, `parents[p][row]`.
    pub parents: Vec<Vec<i64>>,
}

impl CompartmentTable {
    /// Number of per-cell rows.
    pub fn n_rows(&self) -> usize {
        self.object_number.len()
    }

    /// Values of a named parent-reference column.
    pub fn parent(&self, name: &str) -> Result<&[i64]> {
        self.parent_names
            .iter()
            .position(|n| n == name)
            .map(|i| self.parents[i].as_slice())
            .ok_or_else(|| ProfileError::MissingColumn(name.to_string()))
    }
}

fn required_column(columns: &[String], name: &str, table: &str) -> Result<usize> {
    columns
        .iter()
        .position(|c| c == name)
        .ok_or_else(|| ProfileError::MissingColumn(format!("{table}.{name}")))
}

fn value_as_string(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Text(v) => String::from_utf8_lossy(v).into_owned(),
        ValueRef::Blob(_) => String::new(),
    }
}

fn value_as_f64(value: ValueRef<'_>) -> f64 {
    match value {
        ValueRef::Integer(v) => v as f64,
        ValueRef::Real(v) => v,
        ValueRef::Text(v) => std::str::from_utf8(v)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(f64::NAN),
        _ => f64::NAN,
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}


#[cfg(test)]
mod tests {
    use super::fixtures::seed_plate;
    use super::*;

    #[test]
    fn identity_check_rejects_foreign_path() {
        let err = MeasurementStore::open_checked(
            "/workspace/backend/batch1/218360/218360.sqlite",
            "batch2",
            "218360",
        );
        assert!(matches!(err, Err(ProfileError::IdentityMismatch { .. })));
    }

    #[test]
    fn image_table_maps_keys_to_strata() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");

        let image = store
            .image_table(&[
                "Image_Metadata_Plate".to_string(),
                "Image_Metadata_Well".to_string(),
            ])
            .unwrap();
        assert_eq!(image.n_images(), 2);
        assert_eq!(
            image.strata_for(&("t1".to_string(), 1)).unwrap(),
            &["plateX", "A01"]
        );
        assert!(image.strata_for(&("t1".to_string(), 99)).is_none());
    }

    #[test]
    fn compartment_splits_features_and_parents() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");

        let cytoplasm = store.compartment("cytoplasm", None).unwrap();
        assert_eq!(cytoplasm.n_rows(), 4);
        assert_eq!(cytoplasm.feature_names, &["Cytoplasm_Texture_Entropy"]);
        assert_eq!(
            cytoplasm.parent_names,
            &["Cytoplasm_Parent_Cells", "Cytoplasm_Parent_Nuclei"]
        );
        assert_eq!(cytoplasm.parent("Cytoplasm_Parent_Cells").unwrap(), &[1, 2, 1, 2]);
    }

    #[test]
    fn compartment_image_filter_restricts_rows() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");

        let cells = store.compartment("cells", Some(&[2])).unwrap();
        assert_eq!(cells.n_rows(), 2);
        assert!(cells.image_number.iter().all(|&n| n == 2));
    }

    #[test]
    fn unknown_compartment_is_an_error() {
        let store = MeasurementStore::open_in_memory().unwrap();
        seed_plate(&store, "plateX");
        assert!(store.compartment("mitochondria", None).is_err());
    }
}
