//! Structure masks aligned to an assembled slice stack.
//!
//! A rasterizer produces one binary raster per *native* slice (every slice
//! of the phase, ascending position). The builder copies each raster into
//! the depth slot the stack's [`PositionIndex`] assigns to that position,
//! so mask and image share depth semantics even though the stack may have
//! excluded, trimmed or padded slices.

use std::fs;
use std::path::Path;

use ndarray::{Array2, Array3, Array4, Axis, s};
use thiserror::Error;
use tracing::debug;

use crate::position_index::PositionIndex;
use crate::volume::SliceStack;

/// Structure-set records smaller than this are treated as empty.
pub const MIN_STRUCTURE_SET_BYTES: u64 = 20_000;

#[derive(Debug, Error)]
pub enum StructureError {
    #[error("Structure {name} is not defined in the structure set")]
    MissingStructure { name: String },

    #[error("Structure set {path} is missing or too small ({size} bytes)")]
    EmptyStructureSet { path: String, size: u64 },

    #[error("Structure {name} rasterized to {found} slices, expected {expected}")]
    SliceCountMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("Structure {name} raster is {found:?}, expected {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Malformed structure set: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DICOM error: {0}")]
    Dicom(#[from] dicom::object::ReadError),
}

/// Rasterizes named structures of one phase.
///
/// `rasterize` yields one (rows, columns) raster per native slice, in
/// ascending position order.
pub trait StructureRasterizer {
    fn known_names(&self) -> Vec<String>;

    fn rasterize(&self, name: &str) -> Result<Vec<Array2<bool>>, StructureError>;
}

/// Binary mask aligned one-to-one with a stack's depth slots.
#[derive(Debug, Clone, PartialEq)]
pub struct StructureMaskVolume {
    pub data: Array3<u8>,
    pub structures: Vec<String>,
}

impl StructureMaskVolume {
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn foreground_voxels(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }
}

/// Size check on a structure-set record before it is parsed.
///
/// Returns the record size. A missing record counts as empty.
pub fn check_structure_set(path: &Path, min_bytes: u64) -> Result<u64, StructureError> {
    let size = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    if size < min_bytes {
        return Err(StructureError::EmptyStructureSet {
            path: path.display().to_string(),
            size,
        });
    }
    Ok(size)
}

enum Channels {
    Single(Array3<u8>),
    Multi(Array4<u8>),
}

pub struct StructureMaskBuilder<'a> {
    target: &'a PositionIndex,
    native_positions: &'a [f64],
    shape: (usize, usize),
}

impl<'a> StructureMaskBuilder<'a> {
    pub fn new(target: &'a PositionIndex, native_positions: &'a [f64], shape: (usize, usize)) -> Self {
        Self {
            target,
            native_positions,
            shape,
        }
    }

    /// Builder targeting the index and native ordering of `stack`.
    pub fn for_stack(stack: &'a SliceStack) -> Self {
        let (rows, cols, _) = stack.dim();
        Self::new(&stack.index, &stack.native_positions, (rows, cols))
    }

    /// Rasterize `names` and merge them into one aligned mask.
    ///
    /// # Errors
    ///
    /// Returns [`StructureError::MissingStructure`] for the first name the
    /// rasterizer does not know; nothing is substituted or skipped.
    pub fn build(
        &self,
        names: &[String],
        rasterizer: &dyn StructureRasterizer,
    ) -> Result<StructureMaskVolume, StructureError> {
        let (rows, cols) = self.shape;
        let depth = self.target.depth();
        let mut channels = if names.len() == 1 {
            Channels::Single(Array3::zeros((rows, cols, depth)))
        } else {
            Channels::Multi(Array4::zeros((names.len(), rows, cols, depth)))
        };

        let known = rasterizer.known_names();
        for (channel, name) in names.iter().enumerate() {
            if !known.contains(name) {
                return Err(StructureError::MissingStructure { name: name.clone() });
            }
            let rasters = rasterizer.rasterize(name)?;
            self.validate(name, &rasters)?;

            for (&position, raster) in self.native_positions.iter().zip(&rasters) {
                let Some(slot) = self.target.index_of(position) else {
                    continue;
                };
                // slices read twice at one position share a slot
                let mut target = match &mut channels {
                    Channels::Single(mask) => mask.slice_mut(s![.., .., slot]),
                    Channels::Multi(mask) => mask.slice_mut(s![channel, .., .., slot]),
                };
                target.zip_mut_with(raster, |voxel, &inside| *voxel |= u8::from(inside));
            }
            debug!(structure = %name, "Rasterized structure");
        }

        let data = match channels {
            Channels::Single(mask) => mask,
            Channels::Multi(mask) => merge_channels(&mask),
        };
        Ok(StructureMaskVolume {
            data,
            structures: names.to_vec(),
        })
    }

    fn validate(&self, name: &str, rasters: &[Array2<bool>]) -> Result<(), StructureError> {
        if rasters.len() != self.native_positions.len() {
            return Err(StructureError::SliceCountMismatch {
                name: name.to_string(),
                expected: self.native_positions.len(),
                found: rasters.len(),
            });
        }
        match rasters.iter().find(|raster| raster.dim() != self.shape) {
            Some(raster) => Err(StructureError::ShapeMismatch {
                name: name.to_string(),
                expected: self.shape,
                found: raster.dim(),
            }),
            None => Ok(()),
        }
    }
}

/// Logical OR across the channel axis.
fn merge_channels(channels: &Array4<u8>) -> Array3<u8> {
    channels.map_axis(Axis(0), |lane| u8::from(lane.iter().any(|&v| v != 0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    /// Marks pixel (native slice number % rows, 0) of every native slice.
    struct DiagonalRasterizer {
        slices: usize,
        shape: (usize, usize),
        names: Vec<String>,
    }

    impl StructureRasterizer for DiagonalRasterizer {
        fn known_names(&self) -> Vec<String> {
            self.names.clone()
        }

        fn rasterize(&self, _name: &str) -> Result<Vec<Array2<bool>>, StructureError> {
            Ok((0..self.slices)
                .map(|i| {
                    let mut raster = Array2::from_elem(self.shape, false);
                    raster[[i % self.shape.0, 0]] = true;
                    raster
                })
                .collect())
        }
    }

    struct FixedRasterizer(HashMap<String, Vec<Array2<bool>>>);

    impl StructureRasterizer for FixedRasterizer {
        fn known_names(&self) -> Vec<String> {
            self.0.keys().cloned().collect()
        }

        fn rasterize(&self, name: &str) -> Result<Vec<Array2<bool>>, StructureError> {
            Ok(self.0[name].clone())
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_reindexing_follows_target_positions() {
        let native: Vec<f64> = (0..10).map(f64::from).collect();
        let target = PositionIndex::new(vec![3.0, 4.0, 5.0, 8.0]).unwrap();
        let rasterizer = DiagonalRasterizer {
            slices: 10,
            shape: (10, 2),
            names: names(&["GTV"]),
        };
        let mask = StructureMaskBuilder::new(&target, &native, (10, 2))
            .build(&names(&["GTV"]), &rasterizer)
            .unwrap();

        assert_eq!(mask.dim(), (10, 2, 4));
        // slot k carries the raster of native slice at target position k
        for (slot, &position) in target.positions().iter().enumerate() {
            let native_slice = position as usize;
            assert_eq!(mask.data[[native_slice, 0, slot]], 1);
            assert_eq!(mask.data.slice(s![.., .., slot]).sum(), 1);
        }
    }

    #[test]
    fn test_padded_slots_stay_empty() {
        let native: Vec<f64> = (0..4).map(f64::from).collect();
        let target = PositionIndex::with_capacity(vec![1.0, 2.0], 5).unwrap();
        let rasterizer = DiagonalRasterizer {
            slices: 4,
            shape: (4, 4),
            names: names(&["GTV"]),
        };
        let mask = StructureMaskBuilder::new(&target, &native, (4, 4))
            .build(&names(&["GTV"]), &rasterizer)
            .unwrap();
        assert_eq!(mask.dim(), (4, 4, 5));
        for slot in 2..5 {
            assert_eq!(mask.data.slice(s![.., .., slot]).sum(), 0);
        }
    }

    #[test]
    fn test_duplicate_native_position_keeps_contoured_raster() {
        let native = vec![0.0, 0.6, 0.6, 1.2];
        let target = PositionIndex::new(vec![0.6]).unwrap();
        let mut rasters = vec![Array2::from_elem((2, 2), false); 4];
        rasters[1][[1, 0]] = true;
        let rasterizer = FixedRasterizer(HashMap::from([("GTV".to_string(), rasters)]));

        let mask = StructureMaskBuilder::new(&target, &native, (2, 2))
            .build(&names(&["GTV"]), &rasterizer)
            .unwrap();
        assert_eq!(mask.data[[1, 0, 0]], 1);
        assert_eq!(mask.foreground_voxels(), 1);
    }

    #[test]
    fn test_missing_structure_is_an_error() {
        let native = vec![0.0, 1.0, 2.0];
        let target = PositionIndex::new(vec![1.0]).unwrap();
        let rasterizer = DiagonalRasterizer {
            slices: 3,
            shape: (3, 3),
            names: names(&["GTV_0"]),
        };
        let err = StructureMaskBuilder::new(&target, &native, (3, 3))
            .build(&names(&["GTV_0", "GTV_1"]), &rasterizer)
            .unwrap_err();
        assert!(matches!(err, StructureError::MissingStructure { name } if name == "GTV_1"));
    }

    #[test]
    fn test_multiple_structures_are_merged() {
        let native = vec![0.0, 1.0];
        let target = PositionIndex::new(native.clone()).unwrap();
        let mut a = vec![Array2::from_elem((2, 2), false); 2];
        let mut b = vec![Array2::from_elem((2, 2), false); 2];
        a[0][[0, 0]] = true;
        b[0][[1, 1]] = true;
        b[1][[0, 1]] = true;
        let rasterizer = FixedRasterizer(HashMap::from([
            ("A".to_string(), a),
            ("B".to_string(), b),
        ]));

        let mask = StructureMaskBuilder::new(&target, &native, (2, 2))
            .build(&names(&["A", "B"]), &rasterizer)
            .unwrap();
        assert_eq!(mask.dim(), (2, 2, 2));
        assert_eq!(mask.data[[0, 0, 0]], 1);
        assert_eq!(mask.data[[1, 1, 0]], 1);
        assert_eq!(mask.data[[0, 1, 1]], 1);
        assert_eq!(mask.foreground_voxels(), 3);
    }

    #[test]
    fn test_merging_a_structure_with_itself_is_idempotent() {
        let native: Vec<f64> = (0..6).map(f64::from).collect();
        let target = PositionIndex::new(vec![1.0, 2.0, 3.0]).unwrap();
        let rasterizer = DiagonalRasterizer {
            slices: 6,
            shape: (6, 3),
            names: names(&["GTV"]),
        };
        let builder = StructureMaskBuilder::new(&target, &native, (6, 3));
        let once = builder.build(&names(&["GTV"]), &rasterizer).unwrap();
        let twice = builder.build(&names(&["GTV", "GTV"]), &rasterizer).unwrap();
        assert_eq!(once.data, twice.data);
    }

    #[test]
    fn test_raster_count_must_match_native_slices() {
        let native = vec![0.0, 1.0, 2.0];
        let target = PositionIndex::new(vec![1.0]).unwrap();
        let rasterizer = DiagonalRasterizer {
            slices: 2,
            shape: (3, 3),
            names: names(&["GTV"]),
        };
        let err = StructureMaskBuilder::new(&target, &native, (3, 3))
            .build(&names(&["GTV"]), &rasterizer)
            .unwrap_err();
        assert!(matches!(
            err,
            StructureError::SliceCountMismatch { expected: 3, found: 2, .. }
        ));
    }

    #[test]
    fn test_small_structure_set_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("RS.dcm");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(&[0u8; 500]).unwrap();

        let err = check_structure_set(&path, MIN_STRUCTURE_SET_BYTES).unwrap_err();
        assert!(matches!(err, StructureError::EmptyStructureSet { size: 500, .. }));

        let missing = check_structure_set(&dir.path().join("absent.dcm"), MIN_STRUCTURE_SET_BYTES);
        assert!(matches!(missing, Err(StructureError::EmptyStructureSet { size: 0, .. })));

        assert_eq!(check_structure_set(&path, 100).unwrap(), 500);
    }
}
