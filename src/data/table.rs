//! Column-oriented profile tables with an explicit metadata/feature partition.
//!
//! A [`ProfileTable`] holds either well-level aggregates (one row per
//! plate/well) or single-cell rows (one row per detected cell). Each column
//! is either a metadata column (strings: sample identity, plate, well, batch,
//! split assignment) or a feature column (numeric morphology measurements,
//! `NaN` for missing). The partition is fixed when a column is created —
//! columns whose name carries the `Metadata_` prefix are metadata, everything
//! else is a feature — and is carried through every pipeline stage instead of
//! being re-inferred.

use crate::error::{ProfileError, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Column prefix separating metadata from measurement features.
pub const METADATA_PREFIX: &str = "Metadata_";

/// A single table column: metadata strings or numeric feature values.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Meta(Vec<String>),
    Feature(Vec<f64>),
}

impl Column {
    fn len(&self) -> usize {
        match self {
            Column::Meta(v) => v.len(),
            Column::Feature(v) => v.len(),
        }
    }

    fn filtered(&self, mask: &[bool]) -> Column {
        match self {
            Column::Meta(v) => Column::Meta(
                v.iter()
                    .zip(mask)
                    .filter(|(_, &keep)| keep)
                    .map(|(x, _)| x.clone())
                    .collect(),
            ),
            Column::Feature(v) => Column::Feature(
                v.iter()
                    .zip(mask)
                    .filter(|(_, &keep)| keep)
                    .map(|(&x, _)| x)
                    .collect(),
            ),
        }
    }
}

/// Whether a column name belongs to the metadata family.
pub fn is_metadata_name(name: &str) -> bool {
    name.starts_with(METADATA_PREFIX)
}

/// A tabular profile with named, typed columns.
#[derive(Debug, Clone, Default)]
pub struct ProfileTable {
    names: Vec<String>,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    n_rows: usize,
}

impl ProfileTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from (name, column) pairs, validating lengths and
    /// rejecting duplicate names.
    pub fn from_columns(columns: Vec<(String, Column)>) -> Result<Self> {
        let mut table = Self::new();
        for (name, column) in columns {
            table.push_column(name, column)?;
        }
        Ok(table)
    }

    /// Append a column. The first column fixes the row count.
    pub fn push_column(&mut self, name: String, column: Column) -> Result<()> {
        if self.index.contains_key(&name) {
            return Err(ProfileError::DuplicateColumn(name));
        }
        if self.columns.is_empty() {
            self.n_rows = column.len();
        } else if column.len() != self.n_rows {
            return Err(ProfileError::DimensionMismatch {
                expected: self.n_rows,
                actual: column.len(),
            });
        }
        self.index.insert(name.clone(), self.columns.len());
        self.names.push(name);
        self.columns.push(column);
        Ok(())
    }

    /// Append a metadata column.
    pub fn push_meta(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        self.push_column(name.to_string(), Column::Meta(values))
    }

    /// Append a feature column.
    pub fn push_feature(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        self.push_column(name.to_string(), Column::Feature(values))
    }

    /// Append a metadata column holding one constant value.
    pub fn push_meta_constant(&mut self, name: &str, value: &str) -> Result<()> {
        self.push_meta(name, vec![value.to_string(); self.n_rows])
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Number of columns.
    pub fn n_cols(&self) -> usize {
        self.columns.len()
    }

    /// Column names in order.
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    /// Whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    /// Metadata column values, erroring on absent or feature-typed columns.
    pub fn meta(&self, name: &str) -> Result<&[String]> {
        match self.column(name) {
            Some(Column::Meta(v)) => Ok(v),
            _ => Err(ProfileError::MissingColumn(name.to_string())),
        }
    }

    /// Feature column values, erroring on absent or metadata-typed columns.
    pub fn feature(&self, name: &str) -> Result<&[f64]> {
        match self.column(name) {
            Some(Column::Feature(v)) => Ok(v),
            _ => Err(ProfileError::MissingColumn(name.to_string())),
        }
    }

    /// Replace the values of an existing feature column.
    pub fn set_feature(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if values.len() != self.n_rows {
            return Err(ProfileError::DimensionMismatch {
                expected: self.n_rows,
                actual: values.len(),
            });
        }
        match self.index.get(name) {
            Some(&i) => match &mut self.columns[i] {
                Column::Feature(v) => {
                    *v = values;
                    Ok(())
                }
                Column::Meta(_) => Err(ProfileError::MissingColumn(name.to_string())),
            },
            None => Err(ProfileError::MissingColumn(name.to_string())),
        }
    }

    /// Overwrite a metadata column on the rows selected by `mask`, creating
    /// the column (filled with `default`) if it does not yet exist.
    pub fn set_meta_where(
        &mut self,
        name: &str,
        mask: &[bool],
        value: &str,
        default: &str,
    ) -> Result<()> {
        if mask.len() != self.n_rows {
            return Err(ProfileError::DimensionMismatch {
                expected: self.n_rows,
                actual: mask.len(),
            });
        }
        if !self.has_column(name) {
            self.push_meta_constant(name, default)?;
        }
        let i = self.index[name];
        match &mut self.columns[i] {
            Column::Meta(v) => {
                for (x, &hit) in v.iter_mut().zip(mask) {
                    if hit {
                        *x = value.to_string();
                    }
                }
                Ok(())
            }
            Column::Feature(_) => Err(ProfileError::MissingColumn(name.to_string())),
        }
    }

    /// Rename a column, keeping its values and position.
    pub fn rename_column(&mut self, old: &str, new: &str) -> Result<()> {
        let i = *self
            .index
            .get(old)
            .ok_or_else(|| ProfileError::MissingColumn(old.to_string()))?;
        if old != new && self.index.contains_key(new) {
            return Err(ProfileError::DuplicateColumn(new.to_string()));
        }
        self.index.remove(old);
        self.index.insert(new.to_string(), i);
        self.names[i] = new.to_string();
        Ok(())
    }

    /// Remove a column if present.
    pub fn drop_column(&mut self, name: &str) {
        if let Some(i) = self.index.remove(name) {
            self.names.remove(i);
            self.columns.remove(i);
            for v in self.index.values_mut() {
                if *v > i {
                    *v -= 1;
                }
            }
        }
    }

    /// Rewrite metadata values in place using a recode map; values absent
    /// from the map pass through.
    pub fn recode_meta(&mut self, name: &str, recode: &HashMap<String, String>) -> Result<()> {
        let i = *self
            .index
            .get(name)
            .ok_or_else(|| ProfileError::MissingColumn(name.to_string()))?;
        match &mut self.columns[i] {
            Column::Meta(v) => {
                for x in v.iter_mut() {
                    if let Some(replacement) = recode.get(x) {
                        *x = replacement.clone();
                    }
                }
                Ok(())
            }
            Column::Feature(_) => Err(ProfileError::MissingColumn(name.to_string())),
        }
    }

    /// Names of all metadata columns, in table order.
    pub fn metadata_columns(&self) -> Vec<String> {
        self.names
            .iter()
            .zip(&self.columns)
            .filter(|(_, c)| matches!(c, Column::Meta(_)))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Names of all feature columns, in table order.
    pub fn feature_columns(&self) -> Vec<String> {
        self.names
            .iter()
            .zip(&self.columns)
            .filter(|(_, c)| matches!(c, Column::Feature(_)))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Project onto the named columns, in the given order.
    pub fn select_columns(&self, names: &[String]) -> Result<Self> {
        let mut out = Self::new();
        for name in names {
            let column = self
                .column(name)
                .ok_or_else(|| ProfileError::MissingColumn(name.clone()))?;
            out.push_column(name.clone(), column.clone())?;
        }
        if out.columns.is_empty() {
            out.n_rows = self.n_rows;
        }
        Ok(out)
    }

    /// Reorder columns so that all metadata columns precede all features.
    pub fn metadata_first(&self) -> Result<Self> {
        let mut order = self.metadata_columns();
        order.extend(self.feature_columns());
        self.select_columns(&order)
    }

    /// Keep only rows where `mask` is true.
    pub fn filter_rows(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.n_rows {
            return Err(ProfileError::DimensionMismatch {
                expected: self.n_rows,
                actual: mask.len(),
            });
        }
        let mut out = Self::new();
        for (name, column) in self.names.iter().zip(&self.columns) {
            out.push_column(name.clone(), column.filtered(mask))?;
        }
        if out.columns.is_empty() {
            out.n_rows = 0;
        }
        Ok(out)
    }

    /// Row mask for `column == value` over a metadata column.
    pub fn mask_meta_eq(&self, name: &str, value: &str) -> Result<Vec<bool>> {
        Ok(self.meta(name)?.iter().map(|x| x == value).collect())
    }

    /// Row mask for `column` membership in a value set.
    pub fn mask_meta_in(&self, name: &str, values: &HashSet<String>) -> Result<Vec<bool>> {
        Ok(self.meta(name)?.iter().map(|x| values.contains(x)).collect())
    }

    /// Sorted distinct values of a metadata column.
    pub fn meta_levels(&self, name: &str) -> Result<Vec<String>> {
        let mut levels: Vec<String> = self
            .meta(name)?
            .iter()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        levels.sort();
        Ok(levels)
    }

    /// Left-join `right` onto this table over pairs of metadata key columns.
    ///
    /// Every left row keeps its position. A right-side key is expected to be
    /// unique; the first match wins otherwise. Right columns whose names
    /// already exist on the left (including the key columns) are not copied.
    /// Returns the joined table and the number of unmatched left rows; the
    /// caller decides whether an incomplete join is fatal. Unmatched rows get
    /// empty metadata and NaN features.
    pub fn left_join(
        &self,
        right: &ProfileTable,
        keys: &[(String, String)],
    ) -> Result<(Self, usize)> {
        if keys.is_empty() {
            return Err(ProfileError::InvalidParameter(
                "join requires at least one key column pair".to_string(),
            ));
        }
        let left_keys: Vec<&[String]> = keys
            .iter()
            .map(|(l, _)| self.meta(l))
            .collect::<Result<_>>()?;
        let right_keys: Vec<&[String]> = keys
            .iter()
            .map(|(_, r)| right.meta(r))
            .collect::<Result<_>>()?;

        let mut lookup: HashMap<Vec<&str>, usize> = HashMap::new();
        for row in 0..right.n_rows {
            let key: Vec<&str> = right_keys.iter().map(|col| col[row].as_str()).collect();
            lookup.entry(key).or_insert(row);
        }

        let matches: Vec<Option<usize>> = (0..self.n_rows)
            .map(|row| {
                let key: Vec<&str> = left_keys.iter().map(|col| col[row].as_str()).collect();
                lookup.get(&key).copied()
            })
            .collect();
        let unmatched = matches.iter().filter(|m| m.is_none()).count();

        let mut out = self.clone();
        let skip: HashSet<&str> = keys.iter().map(|(_, r)| r.as_str()).collect();
        for (name, column) in right.names.iter().zip(&right.columns) {
            if skip.contains(name.as_str()) || out.has_column(name) {
                continue;
            }
            let gathered = match column {
                Column::Meta(v) => Column::Meta(
                    matches
                        .iter()
                        .map(|m| m.map(|r| v[r].clone()).unwrap_or_default())
                        .collect(),
                ),
                Column::Feature(v) => Column::Feature(
                    matches.iter().map(|m| m.map_or(f64::NAN, |r| v[r])).collect(),
                ),
            };
            out.push_column(name.clone(), gathered)?;
        }
        Ok((out, unmatched))
    }

    /// Concatenate tables row-wise over the union of their columns.
    ///
    /// Columns are ordered by first appearance. A column missing from a
    /// constituent table contributes empty metadata or NaN features for its
    /// rows. A name typed as metadata in one table and feature in another is
    /// an error.
    pub fn concat_union(tables: &[ProfileTable]) -> Result<Self> {
        let mut order: Vec<String> = Vec::new();
        let mut kinds: HashMap<String, bool> = HashMap::new(); // true = meta
        for table in tables {
            for (name, column) in table.names.iter().zip(&table.columns) {
                let is_meta = matches!(column, Column::Meta(_));
                match kinds.get(name) {
                    None => {
                        kinds.insert(name.clone(), is_meta);
                        order.push(name.clone());
                    }
                    Some(&prior) if prior != is_meta => {
                        return Err(ProfileError::DuplicateColumn(format!(
                            "column '{name}' is metadata in one table and feature in another"
                        )));
                    }
                    Some(_) => {}
                }
            }
        }

        let total_rows: usize = tables.iter().map(|t| t.n_rows).sum();
        let mut out = Self::new();
        for name in &order {
            let column = if kinds[name] {
                let mut values = Vec::with_capacity(total_rows);
                for table in tables {
                    match table.column(name) {
                        Some(Column::Meta(v)) => values.extend(v.iter().cloned()),
                        _ => values.extend(std::iter::repeat_n(String::new(), table.n_rows)),
                    }
                }
                Column::Meta(values)
            } else {
                let mut values = Vec::with_capacity(total_rows);
                for table in tables {
                    match table.column(name) {
                        Some(Column::Feature(v)) => values.extend(v.iter().copied()),
                        _ => values.extend(std::iter::repeat_n(f64::NAN, table.n_rows)),
                    }
                }
                Column::Feature(values)
            };
            out.push_column(name.clone(), column)?;
        }
        out.n_rows = total_rows;
        Ok(out)
    }

    /// Read a delimited table, typing columns by the `Metadata_` prefix.
    ///
    /// The delimiter is chosen from the file name (`.tsv` means tab,
    /// otherwise comma) and `.gz` files are decompressed transparently.
    /// Empty, `NA`, and `NaN` feature cells load as NaN; anything else that
    /// fails to parse as a number is an error.
    pub fn read_delimited<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader: Box<dyn Read> = if is_gzipped(path) {
            Box::new(MultiGzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(delimiter_for(path))
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()?
            .iter()
            .map(|s| s.to_string())
            .collect();
        if headers.is_empty() {
            return Err(ProfileError::EmptyData(format!(
                "no columns in {}",
                path.display()
            )));
        }

        let mut meta: Vec<Option<Vec<String>>> = headers
            .iter()
            .map(|h| is_metadata_name(h).then(Vec::new))
            .collect();
        let mut features: Vec<Option<Vec<f64>>> = headers
            .iter()
            .map(|h| (!is_metadata_name(h)).then(Vec::new))
            .collect();

        for (row, record) in csv_reader.records().enumerate() {
            let record = record?;
            if record.len() != headers.len() {
                return Err(ProfileError::DimensionMismatch {
                    expected: headers.len(),
                    actual: record.len(),
                });
            }
            for (col, cell) in record.iter().enumerate() {
                if let Some(values) = &mut meta[col] {
                    values.push(cell.to_string());
                } else if let Some(values) = &mut features[col] {
                    values.push(parse_feature(cell, &headers[col], row)?);
                }
            }
        }

        let mut out = Self::new();
        for (col, header) in headers.iter().enumerate() {
            let column = match (meta[col].take(), features[col].take()) {
                (Some(v), _) => Column::Meta(v),
                (_, Some(v)) => Column::Feature(v),
                _ => unreachable!(),
            };
            out.push_column(header.clone(), column)?;
        }
        Ok(out)
    }

    /// Write the table as a delimited file (delimiter and compression chosen
    /// from the file name, as in [`ProfileTable::read_delimited`]).
    ///
    /// Output files are whole-file overwrites; NaN features are written as
    /// empty cells.
    pub fn write_delimited<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let writer: Box<dyn Write> = if is_gzipped(path) {
            Box::new(GzEncoder::new(BufWriter::new(file), Compression::default()))
        } else {
            Box::new(BufWriter::new(file))
        };
        let mut csv_writer = csv::WriterBuilder::new()
            .delimiter(delimiter_for(path))
            .from_writer(writer);

        csv_writer.write_record(&self.names)?;
        let mut record: Vec<String> = Vec::with_capacity(self.n_cols());
        for row in 0..self.n_rows {
            record.clear();
            for column in &self.columns {
                match column {
                    Column::Meta(v) => record.push(v[row].clone()),
                    Column::Feature(v) => record.push(format_feature(v[row])),
                }
            }
            csv_writer.write_record(&record)?;
        }
        csv_writer.flush()?;
        Ok(())
    }
}

fn parse_feature(cell: &str, column: &str, row: usize) -> Result<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() || trimmed == "NA" || trimmed == "NaN" || trimmed == "nan" {
        return Ok(f64::NAN);
    }
    trimmed.parse::<f64>().map_err(|_| ProfileError::InvalidValue {
        column: column.to_string(),
        value: cell.to_string(),
        row,
    })
}

fn format_feature(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        value.to_string()
    }
}

fn is_gzipped(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

fn delimiter_for(path: &Path) -> u8 {
    if path.to_string_lossy().contains(".tsv") {
        b'\t'
    } else {
        b','
    }
}
