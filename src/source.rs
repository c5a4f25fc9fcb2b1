use std::path::Path;

use crate::rtstruct::{RtStructRasterizer, find_structure_set};
use crate::structure::{StructureError, StructureRasterizer, check_structure_set};
use crate::volume::RawSlice;
use crate::volume_loader::{SliceLoader, SliceLoaderError};

/// Reads the raw records of one phase directory.
pub trait PhaseSource: Send + Sync {
    fn load_slices(&self, phase_dir: &Path) -> Result<Vec<RawSlice>, SliceLoaderError>;

    /// Rasterizer bound to the native ordering of `slices`.
    fn structure_set(
        &self,
        phase_dir: &Path,
        slices: &[RawSlice],
    ) -> Result<Box<dyn StructureRasterizer>, StructureError>;
}

/// DICOM image series plus an RT structure set, as exported by planning systems.
#[derive(Debug, Clone)]
pub struct DicomPhaseSource {
    loader: SliceLoader,
    structure_set_prefix: String,
    min_structure_set_bytes: u64,
}

impl DicomPhaseSource {
    pub fn new(
        image_prefixes: Vec<String>,
        structure_set_prefix: impl Into<String>,
        min_structure_set_bytes: u64,
    ) -> Self {
        Self {
            loader: SliceLoader::new(image_prefixes),
            structure_set_prefix: structure_set_prefix.into(),
            min_structure_set_bytes,
        }
    }
}

impl PhaseSource for DicomPhaseSource {
    fn load_slices(&self, phase_dir: &Path) -> Result<Vec<RawSlice>, SliceLoaderError> {
        self.loader.load_from_directory(phase_dir)
    }

    fn structure_set(
        &self,
        phase_dir: &Path,
        slices: &[RawSlice],
    ) -> Result<Box<dyn StructureRasterizer>, StructureError> {
        // an absent record fails the size check like an empty one
        let path = find_structure_set(phase_dir, &self.structure_set_prefix)?
            .unwrap_or_else(|| phase_dir.join(format!("{}.dcm", self.structure_set_prefix)));
        check_structure_set(&path, self.min_structure_set_bytes)?;
        Ok(Box::new(RtStructRasterizer::open(&path, slices)?))
    }
}
