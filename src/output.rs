//! Dataset layout on disk and the writer that fills it.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enums::Subset;
use crate::nifti::{self, DataType, NiftiError, NiftiHeader};
use crate::structure::StructureMaskVolume;
use crate::volume::SliceStack;

/// Channel suffix distinguishing image files from mask files.
pub const IMAGE_CHANNEL_SUFFIX: &str = "_0000";
pub const FILE_ENDING: &str = ".nii.gz";

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] NiftiError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Directory layout of one raw dataset.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn images_dir(&self, subset: Subset) -> PathBuf {
        self.root.join(format!("images{}", subset.suffix()))
    }

    pub fn labels_dir(&self, subset: Subset) -> PathBuf {
        self.root.join(format!("labels{}", subset.suffix()))
    }

    pub fn locations_dir(&self, subset: Subset) -> PathBuf {
        self.root.join(format!("sliceLOC{}", subset.suffix()))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("dataset.json")
    }

    pub fn create_dirs(&self) -> Result<(), OutputError> {
        for subset in [Subset::Train, Subset::Test] {
            fs::create_dir_all(self.images_dir(subset))?;
            fs::create_dir_all(self.labels_dir(subset))?;
            fs::create_dir_all(self.locations_dir(subset))?;
        }
        Ok(())
    }

    pub fn paths(&self, case_id: &str, phase_id: &str, subset: Subset) -> PhasePaths {
        let stem = format!("{case_id}_{phase_id}");
        PhasePaths {
            image: self
                .images_dir(subset)
                .join(format!("{stem}{IMAGE_CHANNEL_SUFFIX}{FILE_ENDING}")),
            mask: self.labels_dir(subset).join(format!("{stem}{FILE_ENDING}")),
            locations: self.locations_dir(subset).join(format!("{stem}_LOC.json")),
        }
    }

    /// Case IDs that already have image files in `subset`.
    ///
    /// A file belongs to the longest of `known` it starts with, followed by
    /// `_`. Files matching none are attributed to the text before their
    /// first `_`, which covers cases whose raw inputs are gone.
    pub fn converted_cases(
        &self,
        subset: Subset,
        known: &[String],
    ) -> Result<BTreeSet<String>, OutputError> {
        let dir = self.images_dir(subset);
        if !dir.is_dir() {
            return Ok(BTreeSet::new());
        }
        let mut cases = BTreeSet::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if !name.ends_with(FILE_ENDING) {
                continue;
            }
            let case = known
                .iter()
                .filter(|id| {
                    name.strip_prefix(id.as_str())
                        .is_some_and(|rest| rest.starts_with('_'))
                })
                .max_by_key(|id| id.len())
                .cloned()
                .or_else(|| name.split('_').next().map(str::to_string));
            cases.extend(case);
        }
        Ok(cases)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhasePaths {
    pub image: PathBuf,
    pub mask: PathBuf,
    pub locations: PathBuf,
}

/// Side-car record kept next to each written phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceLocations {
    pub native_positions: Vec<f64>,
    /// Index positions, padding rendered as the sentinel.
    pub target_positions: Vec<f64>,
    pub image_position_patient: [f64; 3],
    pub image_orientation_patient: [f64; 6],
    pub pixel_spacing: [f64; 2],
}

impl SliceLocations {
    pub fn from_stack(stack: &SliceStack) -> Self {
        Self {
            native_positions: stack.native_positions.clone(),
            target_positions: stack.index.padded_positions(),
            image_position_patient: stack.geometry.image_position,
            image_orientation_patient: stack.geometry.image_orientation,
            pixel_spacing: stack.geometry.pixel_spacing,
        }
    }
}

/// Everything produced for one phase, ready to be persisted.
#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub case_id: String,
    pub phase_id: String,
    pub stack: SliceStack,
    pub mask: StructureMaskVolume,
    pub affine: [[f64; 4]; 4],
}

/// Persists assembled phases.
pub trait PhaseWriter: Send + Sync {
    fn write_phase(&self, output: &PhaseOutput, subset: Subset) -> Result<(), OutputError>;
}

/// Writes NIfTI image/mask pairs and JSON side-cars into a [`DatasetLayout`].
#[derive(Debug, Clone)]
pub struct NiftiPhaseWriter {
    layout: DatasetLayout,
}

impl NiftiPhaseWriter {
    pub fn new(layout: DatasetLayout) -> Self {
        Self { layout }
    }
}

impl PhaseWriter for NiftiPhaseWriter {
    fn write_phase(&self, output: &PhaseOutput, subset: Subset) -> Result<(), OutputError> {
        let paths = self
            .layout
            .paths(&output.case_id, &output.phase_id, subset);

        let (rows, cols, depth) = output.stack.dim();
        let image_header = NiftiHeader::new([rows, cols, depth], DataType::Float32, output.affine);
        nifti::write_volume(&paths.image, output.stack.data.view(), &image_header)?;

        let mask_header = NiftiHeader::new([rows, cols, depth], DataType::UInt8, output.affine);
        let mask = output.mask.data.mapv(f32::from);
        nifti::write_volume(&paths.mask, mask.view(), &mask_header)?;

        let locations = SliceLocations::from_stack(&output.stack);
        fs::write(&paths.locations, serde_json::to_vec_pretty(&locations)?)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Single(u8),
    Region(Vec<u8>),
}

/// `dataset.json` of the raw dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetManifest {
    pub channel_names: BTreeMap<String, String>,
    pub labels: BTreeMap<String, LabelValue>,
    #[serde(rename = "numTraining")]
    pub num_training: usize,
    pub file_ending: String,
}

impl DatasetManifest {
    pub fn new(channel: &str, label: &str, num_training: usize) -> Self {
        Self {
            channel_names: BTreeMap::from([("0".to_string(), channel.to_string())]),
            labels: BTreeMap::from([
                ("background".to_string(), LabelValue::Single(0)),
                (label.to_string(), LabelValue::Region(vec![1])),
            ]),
            num_training,
            file_ending: FILE_ENDING.to_string(),
        }
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), OutputError> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_paths() {
        let layout = DatasetLayout::new("/data/Dataset801_SBRTest");
        let paths = layout.paths("PAT1", "CT_50", Subset::Train);
        assert_eq!(
            paths.image,
            PathBuf::from("/data/Dataset801_SBRTest/imagesTr/PAT1_CT_50_0000.nii.gz")
        );
        assert_eq!(
            paths.mask,
            PathBuf::from("/data/Dataset801_SBRTest/labelsTr/PAT1_CT_50.nii.gz")
        );
        let test = layout.paths("PAT1", "CT_50", Subset::Test);
        assert_eq!(
            test.locations,
            PathBuf::from("/data/Dataset801_SBRTest/sliceLOCTs/PAT1_CT_50_LOC.json")
        );
    }

    #[test]
    fn test_converted_cases_scan() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        layout.create_dirs().unwrap();
        fs::write(layout.images_dir(Subset::Train).join("A1_CT_0_0000.nii.gz"), b"").unwrap();
        fs::write(layout.images_dir(Subset::Train).join("A1_CT_50_0000.nii.gz"), b"").unwrap();
        fs::write(layout.images_dir(Subset::Test).join("B2_CT_0_0000.nii.gz"), b"").unwrap();
        fs::write(layout.images_dir(Subset::Test).join("notes.txt"), b"").unwrap();

        let train = layout.converted_cases(Subset::Train, &[]).unwrap();
        assert_eq!(train, BTreeSet::from(["A1".to_string()]));
        let test = layout.converted_cases(Subset::Test, &[]).unwrap();
        assert_eq!(test, BTreeSet::from(["B2".to_string()]));
    }

    #[test]
    fn test_converted_cases_with_underscored_ids() {
        let dir = tempfile::tempdir().unwrap();
        let layout = DatasetLayout::new(dir.path());
        layout.create_dirs().unwrap();
        let images = layout.images_dir(Subset::Train);
        fs::write(images.join("1207-2_targets_CT_0_0000.nii.gz"), b"").unwrap();
        fs::write(images.join("1207-2_CT_0_0000.nii.gz"), b"").unwrap();

        let known = vec!["1207-2".to_string(), "1207-2_targets".to_string()];
        let cases = layout.converted_cases(Subset::Train, &known).unwrap();
        assert_eq!(
            cases,
            BTreeSet::from(["1207-2".to_string(), "1207-2_targets".to_string()])
        );
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = DatasetManifest::new("CT", "GTV", 6);
        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(value["channel_names"]["0"], "CT");
        assert_eq!(value["labels"]["background"], 0);
        assert_eq!(value["labels"]["GTV"], serde_json::json!([1]));
        assert_eq!(value["numTraining"], 6);
        assert_eq!(value["file_ending"], ".nii.gz");
    }
}
