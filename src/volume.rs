use ndarray::{Array2, Array3, ArrayView2, s};
use serde::{Deserialize, Serialize};

use crate::position_index::PositionIndex;

/// Positions are stored in centimetres; output spacing is in millimetres.
pub const POSITION_UNIT_SCALE: f64 = 10.0;

/// Acquisition geometry of a single slice as reported by its source.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SliceGeometry {
    /// Spacing between rows, then between columns.
    pub pixel_spacing: [f64; 2],
    pub image_position: [f64; 3],
    /// Row direction cosines followed by column direction cosines.
    pub image_orientation: [f64; 6],
}

impl Default for SliceGeometry {
    fn default() -> Self {
        Self {
            pixel_spacing: [1.0, 1.0],
            image_position: [0.0, 0.0, 0.0],
            image_orientation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        }
    }
}

/// One decoded 2-D slice and where it sits along the stacking axis.
#[derive(Debug, Clone)]
pub struct RawSlice {
    pub pixels: Array2<f32>,
    /// Physical position along the stacking axis, in reduced units.
    pub position: f64,
    pub source: String,
    pub geometry: SliceGeometry,
}

impl RawSlice {
    pub fn new(pixels: Array2<f32>, position: f64, source: impl Into<String>) -> Self {
        Self {
            pixels,
            position,
            source: source.into(),
            geometry: SliceGeometry::default(),
        }
    }

    pub fn with_geometry(mut self, geometry: SliceGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// (rows, columns)
    pub fn dim(&self) -> (usize, usize) {
        self.pixels.dim()
    }
}

/// A (rows, columns, depth) image volume ordered by a [`PositionIndex`].
#[derive(Debug, Clone)]
pub struct SliceStack {
    pub data: Array3<f32>,
    pub index: PositionIndex,
    /// Every slice position of the phase, ascending, duplicates kept.
    pub native_positions: Vec<f64>,
    /// Geometry of the reference slice (the last one read).
    pub geometry: SliceGeometry,
    /// Positions claimed by more than one slice.
    pub ambiguous_positions: Vec<f64>,
}

impl SliceStack {
    /// Get the dimensions of the volume (rows, columns, depth)
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn depth(&self) -> usize {
        self.index.depth()
    }

    pub fn get_slice(&self, slot: usize) -> Option<ArrayView2<'_, f32>> {
        (slot < self.depth()).then(|| self.data.slice(s![.., .., slot]))
    }

    /// (row spacing, column spacing) from the source metadata.
    pub fn pixel_spacing(&self) -> (f64, f64) {
        let [row, col] = self.geometry.pixel_spacing;
        (row, col)
    }

    /// Stacking-axis spacing in millimetres, from the first two indexed positions.
    ///
    /// `None` when fewer than two real positions exist.
    pub fn slice_spacing(&self) -> Option<f64> {
        match self.index.positions() {
            [first, second, ..] => {
                let gap = ((second - first).abs() * 100.0).round() / 100.0;
                Some(gap * POSITION_UNIT_SCALE)
            }
            _ => None,
        }
    }
}
