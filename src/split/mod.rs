//! Analytical dataset assembly and model-split assignment.
//!
//! Combines many plates' normalized profiles into per-dataset analytical
//! tables, tags clone-type metadata, and partitions rows into model splits
//! with a seeded, stratified sampler. Split assignment is keyed by a unique
//! per-row sample identifier, so re-running with the same seed and input
//! order reproduces the assignment exactly.

use crate::data::table::ProfileTable;
use crate::error::{ProfileError, Result};
use crate::gct::write_gct;
use crate::select::{apply_selection, select_features, SelectOptions};
use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Clone identity column after harmonization.
pub const CLONE_COLUMN: &str = "Metadata_clone_number";
/// Treatment column after harmonization.
pub const TREATMENT_COLUMN: &str = "Metadata_treatment";
/// Split assignment column.
pub const SPLIT_COLUMN: &str = "Metadata_model_split";
/// Unique per-row sample identifier column.
pub const SAMPLE_COLUMN: &str = "Metadata_unique_sample_name";

/// Model-split assignment of a profile row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitLabel {
    Training,
    Test,
    Validation,
    Holdout,
    Perturbation,
    Inference,
}

impl SplitLabel {
    /// Lowercase label stored in `Metadata_model_split`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitLabel::Training => "training",
            SplitLabel::Test => "test",
            SplitLabel::Validation => "validation",
            SplitLabel::Holdout => "holdout",
            SplitLabel::Perturbation => "perturbation",
            SplitLabel::Inference => "inference",
        }
    }
}

/// One batch's worth of plates feeding a dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlateSource {
    pub batch: String,
    pub plates: Vec<String>,
}

/// A named analytical dataset: its sources and forced-plate rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSpec {
    pub name: String,
    pub sources: Vec<PlateSource>,
    /// Plate whose rows are forced into the validation split.
    pub validation_plate: String,
    /// Plates forced into the holdout split.
    #[serde(default)]
    pub holdout_plates: Vec<String>,
    /// Sources appended afterwards with the inference label (for example a
    /// legacy batch scored but never trained on).
    #[serde(default)]
    pub inference: Vec<PlateSource>,
}

/// Assembly configuration (one YAML document).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    pub profile_dir: PathBuf,
    pub cell_count_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Per-plate profile stage to load, e.g. `normalized.csv.gz`.
    #[serde(default = "default_suffix")]
    pub profile_suffix: String,
    #[serde(default = "default_test_size")]
    pub test_size: f64,
    pub seed: u64,
    /// Reference treatment; everything else is a perturbation.
    #[serde(default = "default_reference_treatment")]
    pub reference_treatment: String,
    /// Clones eligible for the training/test split.
    pub training_clones: Vec<String>,
    #[serde(default)]
    pub feature_select: SelectOptions,
    pub datasets: Vec<DatasetSpec>,
}

fn default_suffix() -> String {
    "normalized.csv.gz".to_string()
}
fn default_test_size() -> f64 {
    0.15
}
fn default_reference_treatment() -> String {
    "0.1% DMSO".to_string()
}

impl SplitConfig {
    /// Parse an assembly configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}

/// Column renames applied when harmonizing plates from different eras.
fn harmonize_renames() -> Vec<(&'static str, &'static str)> {
    vec![
        ("Metadata_CellLine", CLONE_COLUMN),
        ("Metadata_Dosage", TREATMENT_COLUMN),
    ]
}

fn clone_recodes() -> HashMap<String, String> {
    [
        ("Clone A", "CloneA"),
        ("Clone E", "CloneE"),
        ("WT", "WT_parental"),
        ("WT parental", "WT_parental"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn treatment_recodes() -> HashMap<String, String> {
    [
        ("0.0", "0.1% DMSO"),
        ("DMSO", "0.1% DMSO"),
        ("0.7", "2.1 nM bortezomib"),
        ("7.0", "21 nM bortezomib"),
        ("70.0", "210 nM bortezomib"),
        ("bortezomib", "21 nM bortezomib"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Normalize column naming and sample/treatment vocabulary across batches.
pub fn harmonize(table: &mut ProfileTable) -> Result<()> {
    for (old, new) in harmonize_renames() {
        if table.has_column(old) && !table.has_column(new) {
            table.rename_column(old, new)?;
        }
    }
    if table.has_column(CLONE_COLUMN) {
        table.recode_meta(CLONE_COLUMN, &clone_recodes())?;
    }
    if table.has_column(TREATMENT_COLUMN) {
        table.recode_meta(TREATMENT_COLUMN, &treatment_recodes())?;
    }
    Ok(())
}

/// Load one batch's plates at the configured profile stage, tagging the
/// batch and merging per-plate cell counts.
pub fn load_plates(
    config: &SplitConfig,
    batch: &str,
    plates: &[String],
) -> Result<Vec<ProfileTable>> {
    let mut tables = Vec::new();
    for plate in plates {
        let path = config
            .profile_dir
            .join(batch)
            .join(plate)
            .join(format!("{plate}_{}", config.profile_suffix));
        let mut table = ProfileTable::read_delimited(&path)?;
        table.push_meta_constant("Metadata_batch", batch)?;
        table = merge_cell_count(&table, &config.cell_count_dir, batch, plate)?;
        harmonize(&mut table)?;
        tables.push(table);
    }
    Ok(tables)
}

/// Merge the per-(batch, plate) cell-count file into a profile table on the
/// grouping keys both tables share.
pub fn merge_cell_count(
    table: &ProfileTable,
    cell_count_dir: &Path,
    batch: &str,
    plate: &str,
) -> Result<ProfileTable> {
    let path = cell_count_dir.join(format!("{batch}_{plate}_cell_count.tsv"));
    let counts = ProfileTable::read_delimited(&path)?;

    let keys: Vec<(String, String)> = counts
        .metadata_columns()
        .into_iter()
        .filter(|c| c != "Metadata_cell_count" && table.has_column(c))
        .map(|c| (c.clone(), c))
        .collect();
    if keys.is_empty() {
        return Err(ProfileError::Config(format!(
            "cell count file {} shares no key columns with the profile",
            path.display()
        )));
    }
    let (joined, unmatched) = table.left_join(&counts, &keys)?;
    if unmatched > 0 {
        return Err(ProfileError::IncompleteJoin {
            unmatched,
            total: table.n_rows(),
        });
    }
    Ok(joined)
}

/// Stratified, seeded split of sample ids into (training, test).
///
/// The overall test count is ceil(n · test_size), allocated across strata by
/// largest remainder. Strata are visited in sorted order and each stratum is
/// shuffled with the shared generator, so the selection is a pure function
/// of (ids, strata, test_size, seed).
pub fn stratified_split(
    ids: &[String],
    strata: &[String],
    test_size: f64,
    seed: u64,
) -> Result<(Vec<String>, Vec<String>)> {
    if ids.len() != strata.len() {
        return Err(ProfileError::DimensionMismatch {
            expected: ids.len(),
            actual: strata.len(),
        });
    }
    if !(0.0..1.0).contains(&test_size) {
        return Err(ProfileError::InvalidParameter(format!(
            "test_size {test_size} outside [0, 1)"
        )));
    }
    let n = ids.len();
    if n == 0 {
        return Err(ProfileError::EmptyData("no rows to split".to_string()));
    }

    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, stratum) in strata.iter().enumerate() {
        groups.entry(stratum.as_str()).or_default().push(i);
    }

    let n_test_total = ((n as f64) * test_size).ceil() as usize;

    // Largest-remainder allocation of the test quota across strata.
    let mut quotas: Vec<(usize, f64)> = groups
        .values()
        .map(|members| {
            let exact = members.len() as f64 * test_size;
            (exact.floor() as usize, exact - exact.floor())
        })
        .collect();
    let mut allocated: usize = quotas.iter().map(|(q, _)| q).sum();
    let mut order: Vec<usize> = (0..quotas.len()).collect();
    order.sort_by(|&a, &b| quotas[b].1.partial_cmp(&quotas[a].1).unwrap().then(a.cmp(&b)));
    let sizes: Vec<usize> = groups.values().map(|m| m.len()).collect();
    for &g in order.iter().cycle() {
        if allocated >= n_test_total {
            break;
        }
        if quotas[g].0 < sizes[g] {
            quotas[g].0 += 1;
            allocated += 1;
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for (g, members) in groups.values().enumerate() {
        let mut shuffled = members.clone();
        shuffled.shuffle(&mut rng);
        let quota = quotas[g].0;
        for (rank, &i) in shuffled.iter().enumerate() {
            if rank < quota {
                test.push(ids[i].clone());
            } else {
                train.push(ids[i].clone());
            }
        }
    }
    train.sort();
    test.sort();
    Ok((train, test))
}

/// Assemble one dataset: load, tag, and assign model splits.
pub fn assemble_dataset(config: &SplitConfig, spec: &DatasetSpec) -> Result<ProfileTable> {
    let mut parts = Vec::new();
    for source in &spec.sources {
        for mut table in load_plates(config, &source.batch, &source.plates)? {
            tag_clone_type(&mut table, &spec.name)?;
            parts.push(table);
        }
    }
    if parts.is_empty() {
        return Err(ProfileError::EmptyData(format!(
            "dataset '{}' has no source plates",
            spec.name
        )));
    }
    let mut dataset = ProfileTable::concat_union(&parts)?;

    // Globally unique sample ids, the join key for split assignment.
    let ids: Vec<String> = (0..dataset.n_rows())
        .map(|i| format!("profile_{i}_{}", spec.name))
        .collect();
    dataset.push_meta(SAMPLE_COLUMN, ids)?;

    // Rule-based plate exclusions come first.
    for plate in &spec.holdout_plates {
        let mask = dataset.mask_meta_eq("Metadata_Plate", plate)?;
        dataset.set_meta_where(SPLIT_COLUMN, &mask, SplitLabel::Holdout.as_str(), "")?;
    }
    let validation_mask = dataset.mask_meta_eq("Metadata_Plate", &spec.validation_plate)?;
    dataset.set_meta_where(
        SPLIT_COLUMN,
        &validation_mask,
        SplitLabel::Validation.as_str(),
        "",
    )?;

    // Training/test: eligible clones under the reference treatment, on rows
    // not already claimed by a plate rule.
    let eligible_clones: HashSet<String> = config.training_clones.iter().cloned().collect();
    let clones = dataset.meta(CLONE_COLUMN)?.to_vec();
    let treatments = dataset.meta(TREATMENT_COLUMN)?.to_vec();
    let splits = dataset.meta(SPLIT_COLUMN)?.to_vec();
    let sample_ids = dataset.meta(SAMPLE_COLUMN)?.to_vec();

    let mut split_ids = Vec::new();
    let mut split_strata = Vec::new();
    for i in 0..dataset.n_rows() {
        if !splits[i].is_empty() {
            continue; // claimed by a plate rule
        }
        if eligible_clones.contains(&clones[i]) && treatments[i] == config.reference_treatment {
            split_ids.push(sample_ids[i].clone());
            split_strata.push(clones[i].clone());
        }
    }
    if !split_ids.is_empty() {
        let (train_ids, _test_ids) =
            stratified_split(&split_ids, &split_strata, config.test_size, config.seed)?;
        let train_set: HashSet<String> = train_ids.into_iter().collect();
        let train_mask: Vec<bool> = sample_ids.iter().map(|id| train_set.contains(id)).collect();
        dataset.set_meta_where(
            SPLIT_COLUMN,
            &train_mask,
            SplitLabel::Training.as_str(),
            SplitLabel::Test.as_str(),
        )?;
    }

    // Ineligible clones and unselected eligible rows keep the test default.
    let unclaimed: Vec<bool> = dataset
        .meta(SPLIT_COLUMN)?
        .iter()
        .map(|s| s.is_empty())
        .collect();
    dataset.set_meta_where(SPLIT_COLUMN, &unclaimed, SplitLabel::Test.as_str(), "")?;

    // Non-reference treatments are perturbations regardless of earlier rules.
    let perturbed: Vec<bool> = dataset
        .meta(TREATMENT_COLUMN)?
        .iter()
        .map(|t| t != &config.reference_treatment)
        .collect();
    dataset.set_meta_where(
        SPLIT_COLUMN,
        &perturbed,
        SplitLabel::Perturbation.as_str(),
        "",
    )?;

    // Inference sources join afterwards and never enter the sampler.
    let mut all_parts = vec![dataset];
    for source in &spec.inference {
        for mut table in load_plates(config, &source.batch, &source.plates)? {
            tag_clone_type(&mut table, &spec.name)?;
            table.push_meta_constant(SPLIT_COLUMN, SplitLabel::Inference.as_str())?;
            all_parts.push(table);
        }
    }
    let mut combined = ProfileTable::concat_union(&all_parts)?;
    reassign_inference_ids(&mut combined, &spec.name)?;
    check_unique_samples(&combined)?;
    combined.metadata_first()
}

fn tag_clone_type(table: &mut ProfileTable, dataset: &str) -> Result<()> {
    table.push_meta_constant("Metadata_dataset", dataset)?;
    let sensitive: Vec<bool> = table
        .meta(CLONE_COLUMN)?
        .iter()
        .map(|c| c.contains("WT"))
        .collect();
    table.set_meta_where("Metadata_clone_type", &sensitive, "sensitive", "resistant")?;
    table.set_meta_where("Metadata_clone_type_indicator", &sensitive, "0", "1")?;
    Ok(())
}

fn reassign_inference_ids(table: &mut ProfileTable, dataset: &str) -> Result<()> {
    let splits = table.meta(SPLIT_COLUMN)?.to_vec();
    let existing = table.meta(SAMPLE_COLUMN)?.to_vec();
    let inference = SplitLabel::Inference.as_str();
    let values: Vec<String> = existing
        .iter()
        .enumerate()
        .map(|(i, id)| {
            if splits[i] == inference || id.is_empty() {
                format!("profile_{i}_{dataset}_inference")
            } else {
                id.clone()
            }
        })
        .collect();
    table.drop_column(SAMPLE_COLUMN);
    table.push_meta(SAMPLE_COLUMN, values)?;
    Ok(())
}

fn check_unique_samples(table: &ProfileTable) -> Result<()> {
    let ids = table.meta(SAMPLE_COLUMN)?;
    let distinct: HashSet<&String> = ids.iter().collect();
    if distinct.len() != ids.len() {
        return Err(ProfileError::Config(
            "duplicate unique sample names in assembled dataset".to_string(),
        ));
    }
    Ok(())
}

/// Assemble every configured dataset and write the analytical artifacts:
/// per-dataset combined tables, the selected-feature companion file, and
/// GCT exports of the feature-selected tables.
pub fn assemble_all(config: &SplitConfig) -> Result<()> {
    let mut selected_rows: Vec<(String, String)> = Vec::new();
    for spec in &config.datasets {
        info!("assembling dataset: {}", spec.name);
        let dataset = assemble_dataset(config, spec)?;

        // Feature selection on training rows only, applied to the whole set.
        let training_mask = dataset.mask_meta_eq(SPLIT_COLUMN, SplitLabel::Training.as_str())?;
        let training = dataset.filter_rows(&training_mask)?;
        let selected = select_features(&training, &config.feature_select)?;
        for feature in &selected {
            selected_rows.push((feature.clone(), spec.name.clone()));
        }

        let out = config
            .output_dir
            .join(format!("{}_signature_analytical_set.tsv.gz", spec.name));
        dataset.write_delimited(&out)?;
        info!(
            "dataset {}: {} rows, {} selected features -> {}",
            spec.name,
            dataset.n_rows(),
            selected.len(),
            out.display()
        );

        let reduced = apply_selection(&dataset, &selected)?;
        let gct_out = config
            .output_dir
            .join(format!("{}_feature_select_analytical_set.gct", spec.name));
        write_gct(&reduced, &gct_out)?;
    }

    let mut features_table = ProfileTable::new();
    features_table.push_meta(
        "Metadata_feature",
        selected_rows.iter().map(|(f, _)| f.clone()).collect(),
    )?;
    features_table.push_meta(
        "Metadata_dataset",
        selected_rows.iter().map(|(_, d)| d.clone()).collect(),
    )?;
    features_table.write_delimited(config.output_dir.join("dataset_features_selected.tsv"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plate_table(plate: &str, wells: &[(&str, &str, &str)]) -> ProfileTable {
        // wells: (well, clone, treatment)
        let mut table = ProfileTable::new();
        table
            .push_meta("Metadata_Plate", vec![plate.to_string(); wells.len()])
            .unwrap();
        table
            .push_meta(
                "Metadata_Well",
                wells.iter().map(|(w, _, _)| w.to_string()).collect(),
            )
            .unwrap();
        table
            .push_meta(
                CLONE_COLUMN,
                wells.iter().map(|(_, c, _)| c.to_string()).collect(),
            )
            .unwrap();
        table
            .push_meta(
                TREATMENT_COLUMN,
                wells.iter().map(|(_, _, t)| t.to_string()).collect(),
            )
            .unwrap();
        table
            .push_feature("Cells_X", (0..wells.len()).map(|i| i as f64).collect())
            .unwrap();
        table
    }

    fn write_fixture(config: &SplitConfig, batch: &str, plate: &str, table: &ProfileTable) {
        let path = config
            .profile_dir
            .join(batch)
            .join(plate)
            .join(format!("{plate}_{}", config.profile_suffix));
        table.write_delimited(&path).unwrap();

        // Matching cell-count file.
        let mut counts = ProfileTable::new();
        counts
            .push_meta("Metadata_Plate", table.meta("Metadata_Plate").unwrap().to_vec())
            .unwrap();
        counts
            .push_meta("Metadata_Well", table.meta("Metadata_Well").unwrap().to_vec())
            .unwrap();
        counts
            .push_meta(
                "Metadata_cell_count",
                (0..table.n_rows()).map(|i| (100 + i).to_string()).collect(),
            )
            .unwrap();
        counts
            .write_delimited(
                config
                    .cell_count_dir
                    .join(format!("{batch}_{plate}_cell_count.tsv")),
            )
            .unwrap();
    }

    fn test_config(root: &Path) -> SplitConfig {
        SplitConfig {
            profile_dir: root.join("profiles"),
            cell_count_dir: root.join("cell_counts"),
            output_dir: root.join("data"),
            profile_suffix: "normalized.csv.gz".to_string(),
            test_size: 0.2,
            seed: 9876,
            reference_treatment: "0.1% DMSO".to_string(),
            training_clones: vec!["BZ001".to_string(), "WT clone 01".to_string()],
            feature_select: SelectOptions {
                operations: Vec::new(),
                ..SelectOptions::default()
            },
            datasets: vec![DatasetSpec {
                name: "bortezomib".to_string(),
                sources: vec![
                    PlateSource {
                        batch: "Batch12".to_string(),
                        plates: vec!["219907".to_string()],
                    },
                    PlateSource {
                        batch: "Batch14".to_string(),
                        plates: vec!["219901".to_string()],
                    },
                ],
                validation_plate: "219901".to_string(),
                holdout_plates: Vec::new(),
                inference: Vec::new(),
            }],
        }
    }

    fn standard_wells() -> Vec<(&'static str, &'static str, &'static str)> {
        vec![
            ("A01", "BZ001", "0.1% DMSO"),
            ("A02", "BZ001", "0.1% DMSO"),
            ("A03", "BZ001", "0.1% DMSO"),
            ("A04", "WT clone 01", "0.1% DMSO"),
            ("A05", "WT clone 01", "0.1% DMSO"),
            ("A06", "WT_parental", "0.1% DMSO"),
            ("A07", "BZ001", "21 nM bortezomib"),
        ]
    }

    fn build_fixture(root: &Path) -> SplitConfig {
        let config = test_config(root);
        write_fixture(
            &config,
            "Batch12",
            "219907",
            &plate_table("219907", &standard_wells()),
        );
        write_fixture(
            &config,
            "Batch14",
            "219901",
            &plate_table("219901", &[("A01", "BZ001", "0.1% DMSO")]),
        );
        config
    }

    #[test]
    fn stratified_split_scenario_is_deterministic() {
        // 10 eligible rows over two clones, test_size 0.2 -> 8 training and
        // 2 test, identical on every run.
        let ids: Vec<String> = (0..10).map(|i| format!("profile_{i}_d")).collect();
        let strata: Vec<String> = (0..10)
            .map(|i| if i < 5 { "BZ001" } else { "WT clone 01" }.to_string())
            .collect();

        let (train_a, test_a) = stratified_split(&ids, &strata, 0.2, 9876).unwrap();
        let (train_b, test_b) = stratified_split(&ids, &strata, 0.2, 9876).unwrap();
        assert_eq!(train_a.len(), 8);
        assert_eq!(test_a.len(), 2);
        assert_eq!(train_a, train_b);
        assert_eq!(test_a, test_b);
    }

    #[test]
    fn stratified_split_respects_strata() {
        // One test row per clone with test_size 0.5 over 2+2 rows.
        let ids: Vec<String> = (0..4).map(|i| format!("p{i}")).collect();
        let strata = vec!["a".to_string(), "a".to_string(), "b".to_string(), "b".to_string()];
        let (_, test) = stratified_split(&ids, &strata, 0.5, 1).unwrap();
        assert_eq!(test.len(), 2);
        let a_count = test.iter().filter(|id| ["p0", "p1"].contains(&id.as_str())).count();
        assert_eq!(a_count, 1);
    }

    #[test]
    fn different_seeds_differ_eventually() {
        let ids: Vec<String> = (0..30).map(|i| format!("p{i}")).collect();
        let strata = vec!["a".to_string(); 30];
        let (_, test_a) = stratified_split(&ids, &strata, 0.3, 1).unwrap();
        let (_, test_b) = stratified_split(&ids, &strata, 0.3, 2).unwrap();
        assert_ne!(test_a, test_b);
    }

    #[test]
    fn assembly_is_idempotent_under_a_fixed_seed() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = build_fixture(dir.path());

        let first = assemble_dataset(&config, &config.datasets[0]).unwrap();
        let second = assemble_dataset(&config, &config.datasets[0]).unwrap();
        assert_eq!(
            first.meta(SPLIT_COLUMN).unwrap(),
            second.meta(SPLIT_COLUMN).unwrap()
        );
        assert_eq!(
            first.meta(SAMPLE_COLUMN).unwrap(),
            second.meta(SAMPLE_COLUMN).unwrap()
        );
    }

    #[test]
    fn validation_plate_rows_are_forced() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = build_fixture(dir.path());
        let dataset = assemble_dataset(&config, &config.datasets[0]).unwrap();

        let plates = dataset.meta("Metadata_Plate").unwrap();
        let splits = dataset.meta(SPLIT_COLUMN).unwrap();
        for (plate, split) in plates.iter().zip(splits) {
            if plate == "219901" {
                assert_eq!(split, "validation");
            }
        }
    }

    #[test]
    fn ineligible_clones_never_train() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = build_fixture(dir.path());
        let dataset = assemble_dataset(&config, &config.datasets[0]).unwrap();

        let clones = dataset.meta(CLONE_COLUMN).unwrap();
        let splits = dataset.meta(SPLIT_COLUMN).unwrap();
        for (clone, split) in clones.iter().zip(splits) {
            if clone == "WT_parental" {
                assert_eq!(split, "test");
            }
        }
    }

    #[test]
    fn non_reference_treatments_become_perturbation() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = build_fixture(dir.path());
        let dataset = assemble_dataset(&config, &config.datasets[0]).unwrap();

        let treatments = dataset.meta(TREATMENT_COLUMN).unwrap();
        let splits = dataset.meta(SPLIT_COLUMN).unwrap();
        for (treatment, split) in treatments.iter().zip(splits) {
            if treatment != "0.1% DMSO" {
                assert_eq!(split, "perturbation");
            }
        }
    }

    #[test]
    fn clone_type_tagging_follows_wt_containment() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = build_fixture(dir.path());
        let dataset = assemble_dataset(&config, &config.datasets[0]).unwrap();

        let clones = dataset.meta(CLONE_COLUMN).unwrap();
        let types = dataset.meta("Metadata_clone_type").unwrap();
        let indicators = dataset.meta("Metadata_clone_type_indicator").unwrap();
        for i in 0..dataset.n_rows() {
            if clones[i].contains("WT") {
                assert_eq!(types[i], "sensitive");
                assert_eq!(indicators[i], "0");
            } else {
                assert_eq!(types[i], "resistant");
                assert_eq!(indicators[i], "1");
            }
        }
    }

    #[test]
    fn cell_counts_are_merged_in() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = build_fixture(dir.path());
        let dataset = assemble_dataset(&config, &config.datasets[0]).unwrap();
        assert!(dataset.has_column("Metadata_cell_count"));
        assert!(dataset
            .meta("Metadata_cell_count")
            .unwrap()
            .iter()
            .all(|c| !c.is_empty()));
    }

    #[test]
    fn harmonize_renames_and_recodes() {
        let mut table = ProfileTable::new();
        table
            .push_meta("Metadata_CellLine", vec!["WT".into(), "Clone A".into()])
            .unwrap();
        table
            .push_meta("Metadata_Dosage", vec!["0.0".into(), "7.0".into()])
            .unwrap();
        harmonize(&mut table).unwrap();
        assert_eq!(
            table.meta(CLONE_COLUMN).unwrap(),
            &["WT_parental", "CloneA"]
        );
        assert_eq!(
            table.meta(TREATMENT_COLUMN).unwrap(),
            &["0.1% DMSO", "21 nM bortezomib"]
        );
    }

    #[test]
    fn assemble_all_writes_artifacts() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = build_fixture(dir.path());
        assemble_all(&config).unwrap();

        assert!(config
            .output_dir
            .join("bortezomib_signature_analytical_set.tsv.gz")
            .exists());
        assert!(config
            .output_dir
            .join("bortezomib_feature_select_analytical_set.gct")
            .exists());
        assert!(config.output_dir.join("dataset_features_selected.tsv").exists());
    }
}
