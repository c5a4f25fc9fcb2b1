use std::fs;
use std::path::{Path, PathBuf};

use dicom::{
    core::Tag,
    object::{FileDicomObject, InMemDicomObject, open_file},
    pixeldata::{ConvertOptions, ModalityLutOption, PixelDecoder, VoiLutOption},
};
use dicom_dictionary_std::tags;
use ndarray::{Array2, s};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::volume::{POSITION_UNIT_SCALE, RawSlice, SliceGeometry};

#[derive(Debug, Error)]
pub enum SliceLoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// Reads the per-slice image records of one phase directory.
#[derive(Debug, Clone)]
pub struct SliceLoader {
    prefixes: Vec<String>,
}

impl Default for SliceLoader {
    fn default() -> Self {
        Self::new(vec!["CT".to_string(), "US".to_string()])
    }
}

impl SliceLoader {
    /// `prefixes` are tried in order; the first one matching any `.dcm` file wins.
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    /// Slice files of `dir`, sorted by file name.
    pub fn find_slice_files(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, SliceLoaderError> {
        let dcm_files = dicom_files(dir.as_ref())?;
        for prefix in &self.prefixes {
            let mut matching: Vec<_> = dcm_files
                .iter()
                .filter(|path| has_prefix(path, prefix))
                .cloned()
                .collect();
            if !matching.is_empty() {
                matching.sort();
                return Ok(matching);
            }
        }
        Ok(Vec::new())
    }

    /// Load every slice of a phase directory
    ///
    /// Files without pixel data or without a position are skipped.
    pub fn load_from_directory(
        &self,
        dir: impl AsRef<Path>,
    ) -> Result<Vec<RawSlice>, SliceLoaderError> {
        let paths = self.find_slice_files(dir.as_ref())?;
        debug!(dir = %dir.as_ref().display(), files = paths.len(), "Found slice files");

        let loaded: Vec<Option<RawSlice>> = paths
            .par_iter()
            .map(|path| -> Result<_, SliceLoaderError> {
                let dicom_object = open_file(path)?;
                let slice = Self::extract_slice(&dicom_object, &path.display().to_string());
                if slice.is_none() {
                    warn!(file = %path.display(), "Skipping slice without pixel data or position");
                }
                Ok(slice)
            })
            .collect::<Result<_, _>>()?;

        Ok(loaded.into_iter().flatten().collect())
    }

    fn extract_slice(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        source: &str,
    ) -> Option<RawSlice> {
        let position = Self::get_position(dicom_object)?;
        let pixels = Self::decode_image(dicom_object)?;
        let geometry = Self::get_geometry(dicom_object);
        Some(RawSlice::new(pixels, position, source).with_geometry(geometry))
    }

    /// SliceLocation, or the z of ImagePositionPatient, in reduced units.
    fn get_position(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<f64> {
        let location = dicom_object
            .element(tags::SLICE_LOCATION)
            .ok()
            .and_then(|element| element.to_float64().ok());
        let location = location.or_else(|| {
            dicom_object
                .element(tags::IMAGE_POSITION_PATIENT)
                .ok()?
                .to_multi_float64()
                .ok()?
                .get(2)
                .copied()
        })?;
        Some(location / POSITION_UNIT_SCALE)
    }

    /// Stored pixel values of the first frame, no LUT applied.
    fn decode_image(dicom_object: &FileDicomObject<InMemDicomObject>) -> Option<Array2<f32>> {
        let pixel_data = dicom_object.decode_pixel_data().ok()?;
        let options = ConvertOptions::new()
            .with_modality_lut(ModalityLutOption::None)
            .with_voi_lut(VoiLutOption::Identity);
        pixel_data
            .to_ndarray_with_options::<f32>(&options)
            .ok()
            .map(|arr| arr.slice_move(s![0, .., .., 0]))
    }

    fn get_geometry(dicom_object: &FileDicomObject<InMemDicomObject>) -> SliceGeometry {
        let floats = |tag: Tag| {
            dicom_object
                .element(tag)
                .ok()
                .and_then(|element| element.to_multi_float64().ok())
        };
        let mut geometry = SliceGeometry::default();
        if let Some([row, col, ..]) = floats(tags::PIXEL_SPACING).as_deref() {
            geometry.pixel_spacing = [*row, *col];
        }
        if let Some([x, y, z, ..]) = floats(tags::IMAGE_POSITION_PATIENT).as_deref() {
            geometry.image_position = [*x, *y, *z];
        }
        if let Some(values) = floats(tags::IMAGE_ORIENTATION_PATIENT) {
            if let Ok(orientation) = <[f64; 6]>::try_from(values.as_slice()) {
                geometry.image_orientation = orientation;
            }
        }
        geometry
    }
}

/// `.dcm` files directly inside `dir`.
pub(crate) fn dicom_files(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    Ok(fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|s| s.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("dcm"))
        })
        .collect())
}

pub(crate) fn has_prefix(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(prefix))
}
