//! Platemap resolution: barcode lookup and well metadata loading.
//!
//! Each batch carries a single barcode-to-platemap CSV in its metadata
//! directory (`<workspace>/metadata/<batch>/`) and one tab-separated platemap
//! file per unique platemap name under `platemap/`. Multiple plates may share
//! one platemap.

use crate::data::table::{is_metadata_name, ProfileTable, METADATA_PREFIX};
use crate::error::{ProfileError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Barcode column in the per-batch barcode map file.
pub const BARCODE_COLUMN: &str = "Assay_Plate_Barcode";
/// Platemap name column in the per-batch barcode map file.
pub const PLATEMAP_COLUMN: &str = "Plate_Map_Name";

/// Barcode → platemap-name lookup for one batch.
#[derive(Debug, Clone)]
pub struct BarcodeMap {
    entries: HashMap<String, String>,
    source: PathBuf,
}

impl BarcodeMap {
    /// Load the batch's barcode map: the lexicographically first regular file
    /// in the batch metadata directory.
    pub fn load(metadata_dir: &Path) -> Result<Self> {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(metadata_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        candidates.sort();
        let source = candidates.into_iter().next().ok_or_else(|| {
            ProfileError::EmptyData(format!(
                "no barcode platemap file in {}",
                metadata_dir.display()
            ))
        })?;

        let mut reader = csv::Reader::from_path(&source)?;
        let headers: Vec<String> = reader.headers()?.iter().map(|s| s.to_string()).collect();
        let barcode_idx = column_index(&headers, BARCODE_COLUMN)?;
        let platemap_idx = column_index(&headers, PLATEMAP_COLUMN)?;

        let mut entries = HashMap::new();
        for record in reader.records() {
            let record = record?;
            entries.insert(
                record[barcode_idx].to_string(),
                record[platemap_idx].to_string(),
            );
        }
        Ok(Self { entries, source })
    }

    /// Platemap name for a plate barcode; an absent barcode is an error, the
    /// resolver never falls back to an arbitrary platemap.
    pub fn platemap_name(&self, barcode: &str) -> Result<&str> {
        self.entries
            .get(barcode)
            .map(|s| s.as_str())
            .ok_or_else(|| ProfileError::UnknownBarcode(barcode.to_string()))
    }

    /// Path of the barcode map file this was loaded from.
    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Well → sample metadata for one plate layout.
///
/// Every column is metadata-prefixed on load so platemap-supplied columns can
/// never collide with measurement features downstream.
#[derive(Debug, Clone)]
pub struct Platemap {
    table: ProfileTable,
    name: String,
}

impl Platemap {
    /// Load a tab-separated platemap file, prefixing unprefixed columns.
    pub fn load(path: &Path, name: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path)?;
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| {
                if is_metadata_name(h) {
                    h.to_string()
                } else {
                    format!("{METADATA_PREFIX}{h}")
                }
            })
            .collect();

        let mut columns: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
        for record in reader.records() {
            let record = record?;
            if record.len() != headers.len() {
                return Err(ProfileError::DimensionMismatch {
                    expected: headers.len(),
                    actual: record.len(),
                });
            }
            for (col, cell) in record.iter().enumerate() {
                columns[col].push(cell.to_string());
            }
        }

        let mut table = ProfileTable::new();
        for (header, values) in headers.into_iter().zip(columns) {
            table.push_meta(&header, values)?;
        }
        Ok(Self {
            table,
            name: name.to_string(),
        })
    }

    /// The well metadata as a profile table (all columns metadata-typed).
    pub fn table(&self) -> &ProfileTable {
        &self.table
    }

    /// Platemap name (file stem from the barcode map).
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Resolve and load the platemap for one (batch, plate).
///
/// Looks up the plate barcode in the batch's barcode map, then loads
/// `<workspace>/metadata/<batch>/platemap/<name>.txt`.
pub fn resolve_platemap(workspace_dir: &Path, batch: &str, plate: &str) -> Result<Platemap> {
    let metadata_dir = workspace_dir.join("metadata").join(batch);
    let barcode_map = BarcodeMap::load(&metadata_dir)?;
    let name = barcode_map.platemap_name(plate)?.to_string();
    let platemap_file = metadata_dir.join("platemap").join(format!("{name}.txt"));
    Platemap::load(&platemap_file, &name)
}

fn column_index(headers: &[String], name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h == name)
        .ok_or_else(|| ProfileError::MissingColumn(name.to_string()))
}
