//! Annotation: attaching platemap metadata to aggregated profiles.

use crate::data::platemap::Platemap;
use crate::data::table::ProfileTable;
use crate::error::{ProfileError, Result};

/// Left-join aggregated profiles to platemap metadata on well identifiers.
///
/// `profile_well_column` names the well key on the profile side and
/// `platemap_well_column` the (metadata-prefixed) key on the platemap side.
/// The join must be total over profile rows: any profile row without a
/// platemap entry is an error rather than a silently lossy merge. Platemap
/// rows for unused wells are simply ignored. The joined table is reordered
/// metadata-first.
pub fn annotate(
    profile: &ProfileTable,
    platemap: &Platemap,
    profile_well_column: &str,
    platemap_well_column: &str,
) -> Result<ProfileTable> {
    let keys = [(
        profile_well_column.to_string(),
        platemap_well_column.to_string(),
    )];
    let (joined, unmatched) = profile.left_join(platemap.table(), &keys)?;
    if unmatched > 0 {
        return Err(ProfileError::IncompleteJoin {
            unmatched,
            total: profile.n_rows(),
        });
    }
    joined.metadata_first()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::platemap::Platemap;
    use std::io::Write;
    use tempfile::TempDir;

    fn sample_profile() -> ProfileTable {
        let mut table = ProfileTable::new();
        table
            .push_meta("Metadata_Plate", vec!["p1".into(), "p1".into()])
            .unwrap();
        table
            .push_meta("Metadata_Well", vec!["A01".into(), "A02".into()])
            .unwrap();
        table
            .push_feature("Cells_AreaShape_Area", vec![2.0, 15.0])
            .unwrap();
        table
    }

    fn sample_platemap(dir: &TempDir, wells: &[(&str, &str)]) -> Platemap {
        let path = dir.path().join("layout.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "well_position\tCellLine").unwrap();
        for (well, line) in wells {
            writeln!(file, "{well}\t{line}").unwrap();
        }
        Platemap::load(&path, "layout").unwrap()
    }

    #[test]
    fn annotate_attaches_platemap_metadata() {
        let dir = TempDir::new().unwrap();
        let platemap = sample_platemap(&dir, &[("A01", "WT"), ("A02", "R1")]);

        let annotated = annotate(
            &sample_profile(),
            &platemap,
            "Metadata_Well",
            "Metadata_well_position",
        )
        .unwrap();
        assert_eq!(annotated.meta("Metadata_CellLine").unwrap(), &["WT", "R1"]);
        // Metadata columns lead, features trail.
        assert_eq!(
            annotated.column_names().last().unwrap(),
            "Cells_AreaShape_Area"
        );
    }

    #[test]
    fn round_trip_drop_restores_profile() {
        let dir = TempDir::new().unwrap();
        let platemap = sample_platemap(&dir, &[("A01", "WT"), ("A02", "R1")]);
        let profile = sample_profile();

        let annotated = annotate(
            &profile,
            &platemap,
            "Metadata_Well",
            "Metadata_well_position",
        )
        .unwrap();
        let restored = annotated
            .select_columns(&profile.column_names().to_vec())
            .unwrap();
        assert_eq!(
            restored.meta("Metadata_Well").unwrap(),
            profile.meta("Metadata_Well").unwrap()
        );
        assert_eq!(
            restored.feature("Cells_AreaShape_Area").unwrap(),
            profile.feature("Cells_AreaShape_Area").unwrap()
        );
    }

    #[test]
    fn incomplete_join_is_fatal() {
        let dir = TempDir::new().unwrap();
        let platemap = sample_platemap(&dir, &[("A01", "WT")]); // A02 missing

        let err = annotate(
            &sample_profile(),
            &platemap,
            "Metadata_Well",
            "Metadata_well_position",
        );
        assert!(matches!(
            err,
            Err(ProfileError::IncompleteJoin { unmatched: 1, total: 2 })
        ));
    }

    #[test]
    fn unused_platemap_wells_are_ignored() {
        let dir = TempDir::new().unwrap();
        let platemap = sample_platemap(&dir, &[("A01", "WT"), ("A02", "R1"), ("B01", "R2")]);

        let annotated = annotate(
            &sample_profile(),
            &platemap,
            "Metadata_Well",
            "Metadata_well_position",
        )
        .unwrap();
        assert_eq!(annotated.n_rows(), 2);
    }
}
