//! GCT 1.3 export for heatmap tooling.
//!
//! Profiles are written transposed: features as rows, samples as columns,
//! with every metadata column carried as a column annotation. Sample ids come
//! from `Metadata_unique_sample_name` when present, otherwise positional ids
//! are generated.

use crate::data::table::ProfileTable;
use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const VERSION: &str = "#1.3";
const UNIQUE_SAMPLE_COLUMN: &str = "Metadata_unique_sample_name";

/// Write a profile table as a GCT 1.3 file.
pub fn write_gct<P: AsRef<Path>>(table: &ProfileTable, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);

    let features = table.feature_columns();
    let metadata = table.metadata_columns();
    let n_samples = table.n_rows();

    let sample_ids: Vec<String> = if table.has_column(UNIQUE_SAMPLE_COLUMN) {
        table.meta(UNIQUE_SAMPLE_COLUMN)?.to_vec()
    } else {
        (0..n_samples).map(|i| format!("profile_{i}")).collect()
    };

    writeln!(writer, "{VERSION}")?;
    writeln!(
        writer,
        "{}\t{}\t{}\t{}",
        features.len(),
        n_samples,
        1,
        metadata.len()
    )?;

    write!(writer, "id\tcp_feature_name")?;
    for id in &sample_ids {
        write!(writer, "\t{id}")?;
    }
    writeln!(writer)?;

    for name in &metadata {
        write!(writer, "{name}\tna")?;
        for value in table.meta(name)? {
            write!(writer, "\t{value}")?;
        }
        writeln!(writer)?;
    }

    for name in &features {
        write!(writer, "{name}\t{name}")?;
        for &value in table.feature(name)? {
            if value.is_nan() {
                write!(writer, "\t")?;
            } else {
                write!(writer, "\t{value}")?;
            }
        }
        writeln!(writer)?;
    }
    writer.flush()?;
    Ok(())
}
