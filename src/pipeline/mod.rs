//! The per-plate processing pipeline.
//!
//! Drives every configured (batch, plate) pair through the staged profile
//! flow: aggregate from the measurement store, annotate with platemap
//! metadata, normalize against the reference subset, and select features.
//! Each stage reads its predecessor's artifact from disk and writes its own,
//! so a stage can be re-run in isolation by flipping the `perform` flags.
//! Plates are processed sequentially and a failed plate aborts the run.

use crate::aggregate::{aggregate, count_cells};
use crate::annotate::annotate;
use crate::config::{PipelineConfig, RunConfig};
use crate::data::platemap::resolve_platemap;
use crate::data::store::MeasurementStore;
use crate::data::table::ProfileTable;
use crate::error::Result;
use crate::normalize::{normalize, SamplePredicate};
use crate::select::{apply_selection, select_features};
use log::info;
use std::path::PathBuf;

/// Artifact paths for one plate's staged profiles.
#[derive(Debug, Clone)]
pub struct PlatePaths {
    pub aggregated: PathBuf,
    pub augmented: PathBuf,
    pub normalized: PathBuf,
    pub feature_selected: PathBuf,
    pub cell_count: PathBuf,
}

impl PlatePaths {
    /// Resolve the staged artifact paths under `<output>/<batch>/<plate>/`.
    pub fn resolve(config: &PipelineConfig, batch: &str, plate: &str) -> Self {
        let plate_dir = config.output_dir.join(batch).join(plate);
        let suffix = config.options.compression.csv_suffix();
        let count_dir = config
            .count
            .output_dir
            .clone()
            .unwrap_or_else(|| config.workspace_dir.join("cell_counts"));
        Self {
            aggregated: plate_dir.join(format!("{plate}.{suffix}")),
            augmented: plate_dir.join(format!("{plate}_augmented.{suffix}")),
            normalized: plate_dir.join(format!("{plate}_normalized.{suffix}")),
            feature_selected: plate_dir.join(format!("{plate}_normalized_feature_selected.{suffix}")),
            cell_count: count_dir.join(format!("{batch}_{plate}_cell_count.tsv")),
        }
    }
}

/// Run the full pipeline over every processable batch in the configuration.
pub fn run(config: &RunConfig) -> Result<()> {
    for batch in &config.batches {
        for plate in &batch.plates {
            info!("processing plate {} in batch {}", plate, batch.batch);
            run_plate(config, &batch.batch, plate)?;
        }
    }
    Ok(())
}

/// Run the enabled stages for one (batch, plate) pair.
pub fn run_plate(config: &RunConfig, batch: &str, plate: &str) -> Result<()> {
    let pipeline = &config.pipeline;
    let paths = PlatePaths::resolve(pipeline, batch, plate);
    let batch_config = config
        .batches
        .iter()
        .find(|b| b.batch == batch)
        .ok_or_else(|| {
            crate::error::ProfileError::Config(format!("batch '{batch}' not in configuration"))
        })?;

    if pipeline.aggregate.perform || pipeline.count.perform {
        let store_path = batch_config.store_path(&pipeline.workspace_dir, plate);
        let store = MeasurementStore::open_checked(&store_path, batch, plate)?;

        if pipeline.aggregate.perform {
            info!("aggregating {}", store.path().display());
            let profile = aggregate(&store, &pipeline.aggregate.options)?;
            profile.write_delimited(&paths.aggregated)?;
            info!(
                "wrote {} profiles to {}",
                profile.n_rows(),
                paths.aggregated.display()
            );
        }

        if pipeline.count.perform {
            let counts = count_cells(&store, &pipeline.aggregate.options)?;
            let platemap = resolve_platemap(&pipeline.workspace_dir, batch, plate)?;
            let annotated = annotate(
                &counts,
                &platemap,
                &pipeline.aggregate.options.output_well_column(),
                &pipeline.platemap_well_column,
            )?;
            annotated.write_delimited(&paths.cell_count)?;
            info!("wrote cell counts to {}", paths.cell_count.display());
        }
    }

    if pipeline.annotate.perform {
        let profile = ProfileTable::read_delimited(&paths.aggregated)?;
        let platemap = resolve_platemap(&pipeline.workspace_dir, batch, plate)?;
        info!("annotating {} with platemap {}", plate, platemap.name());
        let annotated = annotate(
            &profile,
            &platemap,
            &pipeline.annotate.well_column,
            &pipeline.platemap_well_column,
        )?;
        annotated.write_delimited(&paths.augmented)?;
    }

    if pipeline.normalize.perform {
        let profile = ProfileTable::read_delimited(&paths.augmented)?;
        let expr = pipeline
            .normalize
            .samples
            .as_deref()
            .unwrap_or(&pipeline.options.samples);
        let predicate = SamplePredicate::parse(expr)?;
        info!("normalizing {} against samples '{}'", plate, expr);
        let normalized = normalize(&profile, pipeline.normalize.method, &predicate)?;
        normalized.write_delimited(&paths.normalized)?;
    }

    if pipeline.feature_select.perform {
        let profile = ProfileTable::read_delimited(&paths.normalized)?;
        let selected = select_features(&profile, &pipeline.feature_select.options)?;
        info!(
            "feature selection kept {} of {} features for {}",
            selected.len(),
            profile.feature_columns().len(),
            plate
        );
        let reduced = apply_selection(&profile, &selected)?;
        reduced.write_delimited(&paths.feature_selected)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::fixtures::seed_plate_file;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    const BATCH: &str = "batch1";
    const PLATE: &str = "218360";

    fn descriptor(workspace: &Path) -> String {
        format!(
            r#"
pipeline: test_profiles
workspace_dir: {workspace}
output_dir: {workspace}/profiles
platemap_well_column: Metadata_well_position
options:
  compression: gzip
  samples: all
aggregate:
  perform: true
  plate_column: Image_Metadata_Plate
  well_column: Image_Metadata_Well
  method: median
  features: infer
annotate:
  perform: true
  well_column: Metadata_Well
normalize:
  perform: true
  method: standardize
feature_select:
  perform: true
  operations:
    - drop_na_columns
    - blocklist
  na_cutoff: 0.05
count:
  perform: true
---
batch: {BATCH}
process: true
plates:
  - {PLATE}
"#,
            workspace = workspace.display()
        )
    }

    fn build_workspace(workspace: &Path) -> RunConfig {
        let config = RunConfig::parse(&descriptor(workspace)).unwrap();

        seed_plate_file(
            &config.batches[0].store_path(workspace, PLATE),
            PLATE,
        );

        let metadata_dir = workspace.join("metadata").join(BATCH);
        std::fs::create_dir_all(metadata_dir.join("platemap")).unwrap();
        let mut barcode =
            std::fs::File::create(metadata_dir.join("barcode_platemap.csv")).unwrap();
        writeln!(barcode, "Assay_Plate_Barcode,Plate_Map_Name").unwrap();
        writeln!(barcode, "{PLATE},layout_A").unwrap();
        let mut platemap =
            std::fs::File::create(metadata_dir.join("platemap").join("layout_A.txt")).unwrap();
        writeln!(platemap, "well_position\tCellLine\tDosage").unwrap();
        writeln!(platemap, "A01\tWT parental\t0.0").unwrap();
        writeln!(platemap, "A02\tClone A\t0.7").unwrap();
        config
    }

    #[test]
    fn run_writes_every_stage_artifact() {
        let dir = TempDir::new().unwrap();
        let config = build_workspace(dir.path());

        run(&config).unwrap();

        let paths = PlatePaths::resolve(&config.pipeline, BATCH, PLATE);
        assert!(paths.aggregated.exists());
        assert!(paths.augmented.exists());
        assert!(paths.normalized.exists());
        assert!(paths.feature_selected.exists());
        assert!(paths.cell_count.exists());
    }

    #[test]
    fn augmented_profiles_carry_platemap_metadata() {
        let dir = TempDir::new().unwrap();
        let config = build_workspace(dir.path());
        run(&config).unwrap();

        let paths = PlatePaths::resolve(&config.pipeline, BATCH, PLATE);
        let augmented = ProfileTable::read_delimited(&paths.augmented).unwrap();
        assert_eq!(
            augmented.meta("Metadata_CellLine").unwrap(),
            &["WT parental", "Clone A"]
        );
        // Metadata leads, features trail.
        assert!(augmented
            .column_names()
            .last()
            .unwrap()
            .starts_with("Nuclei_"));
    }

    #[test]
    fn normalized_profiles_are_centered() {
        let dir = TempDir::new().unwrap();
        let config = build_workspace(dir.path());
        run(&config).unwrap();

        let paths = PlatePaths::resolve(&config.pipeline, BATCH, PLATE);
        let normalized = ProfileTable::read_delimited(&paths.normalized).unwrap();
        let area = normalized.feature("Cells_AreaShape_Area").unwrap();
        // Two wells standardize to +-1.
        assert!((area[0] + 1.0).abs() < 1e-9);
        assert!((area[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cell_count_file_is_annotated() {
        let dir = TempDir::new().unwrap();
        let config = build_workspace(dir.path());
        run(&config).unwrap();

        let paths = PlatePaths::resolve(&config.pipeline, BATCH, PLATE);
        let counts = ProfileTable::read_delimited(&paths.cell_count).unwrap();
        assert_eq!(counts.meta("Metadata_cell_count").unwrap(), &["3", "2"]);
        assert_eq!(
            counts.meta("Metadata_CellLine").unwrap(),
            &["WT parental", "Clone A"]
        );
    }

    #[test]
    fn disabled_stages_write_nothing() {
        let dir = TempDir::new().unwrap();
        let mut config = build_workspace(dir.path());
        config.pipeline.annotate.perform = false;
        config.pipeline.normalize.perform = false;
        config.pipeline.feature_select.perform = false;
        config.pipeline.count.perform = false;

        run(&config).unwrap();
        let paths = PlatePaths::resolve(&config.pipeline, BATCH, PLATE);
        assert!(paths.aggregated.exists());
        assert!(!paths.augmented.exists());
        assert!(!paths.cell_count.exists());
    }

    #[test]
    fn missing_store_fails_the_run() {
        let dir = TempDir::new().unwrap();
        let config = build_workspace(dir.path());
        std::fs::remove_file(config.batches[0].store_path(dir.path(), PLATE)).unwrap();
        assert!(run(&config).is_err());
    }
}
