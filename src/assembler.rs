//! Slice-stack assembly: turns an unordered, possibly incomplete set of
//! slices into a volume indexed by physical position.
//!
//! Assembly runs in a fixed order:
//!  1. flag informative (non-empty) slices
//!  2. collect every native position, ascending
//!  3. collect the distinct informative positions
//!  4. drop the lowest and highest informative position
//!  5. keep the highest `target_depth` positions, or pad up to it
//!  6. build the [`PositionIndex`] and allocate the volume
//!  7. copy each slice whose position is indexed into its slot

use ndarray::Array3;
use ndarray::parallel::prelude::*;
use ndarray::s;
use thiserror::Error;
use tracing::{debug, warn};

use crate::position_index::{PositionIndex, PositionIndexError, same_position, sorted_unique};
use crate::volume::{RawSlice, SliceStack};

/// A slice with at least this fraction of zero pixels is considered empty.
pub const EMPTY_FRACTION_THRESHOLD: f64 = 0.687;

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("No slices found")]
    EmptyInputSet,

    #[error("None of the {slices} slices survived emptiness filtering and edge trimming")]
    NoInformativeSlices { slices: usize },

    #[error("Slice {source_id} is {found:?}, expected {expected:?}")]
    InconsistentDimensions {
        source_id: String,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Invalid slice position: {0}")]
    Position(#[from] PositionIndexError),
}

#[derive(Debug, Clone)]
pub struct SliceStackAssembler {
    target_depth: usize,
    empty_fraction_threshold: f64,
}

impl Default for SliceStackAssembler {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SliceStackAssembler {
    /// `target_depth == 0` builds a variable-depth stack.
    pub fn new(target_depth: usize) -> Self {
        Self {
            target_depth,
            empty_fraction_threshold: EMPTY_FRACTION_THRESHOLD,
        }
    }

    pub fn with_empty_fraction_threshold(mut self, threshold: f64) -> Self {
        self.empty_fraction_threshold = threshold;
        self
    }

    /// True when the fraction of zero-valued pixels is below the threshold.
    pub fn is_informative(&self, slice: &RawSlice) -> bool {
        let total = slice.pixels.len();
        if total == 0 {
            return false;
        }
        let zeros = slice.pixels.par_iter().filter(|&&v| v == 0.0).count();
        (zeros as f64) < total as f64 * self.empty_fraction_threshold
    }

    /// Assemble `slices` into a stack.
    ///
    /// # Errors
    ///
    /// Returns error if no slices are given, if their dimensions differ, or
    /// if no informative slice survives trimming.
    pub fn assemble(&self, slices: &[RawSlice]) -> Result<SliceStack, AssemblyError> {
        let first = slices.first().ok_or(AssemblyError::EmptyInputSet)?;
        let (rows, cols) = first.dim();
        Self::validate_dimensions(slices, (rows, cols))?;

        let native_positions = Self::native_positions(slices);
        let ambiguous_positions = Self::ambiguous_positions(&native_positions);
        for position in &ambiguous_positions {
            warn!(position, "Several slices share a position; the last one read is kept");
        }

        let informative: Vec<f64> = slices
            .iter()
            .filter(|slice| self.is_informative(slice))
            .map(|slice| slice.position)
            .collect();
        let trimmed = Self::trim_extremes(sorted_unique(informative)?);
        if trimmed.is_empty() {
            return Err(AssemblyError::NoInformativeSlices {
                slices: slices.len(),
            });
        }

        let index = self.select(trimmed)?;
        debug!(
            slices = slices.len(),
            depth = index.depth(),
            padding = index.padding(),
            "Assembled position index"
        );

        let mut data = Array3::<f32>::zeros((rows, cols, index.depth()));
        for slice in slices {
            if let Some(slot) = index.index_of(slice.position) {
                data.slice_mut(s![.., .., slot]).assign(&slice.pixels);
            }
        }

        let geometry = slices
            .last()
            .map(|slice| slice.geometry)
            .unwrap_or_default();

        Ok(SliceStack {
            data,
            index,
            native_positions,
            geometry,
            ambiguous_positions,
        })
    }

    fn validate_dimensions(
        slices: &[RawSlice],
        expected: (usize, usize),
    ) -> Result<(), AssemblyError> {
        match slices.iter().find(|slice| slice.dim() != expected) {
            Some(slice) => Err(AssemblyError::InconsistentDimensions {
                source_id: slice.source.clone(),
                expected,
                found: slice.dim(),
            }),
            None => Ok(()),
        }
    }

    fn native_positions(slices: &[RawSlice]) -> Vec<f64> {
        let mut positions: Vec<f64> = slices.iter().map(|slice| slice.position).collect();
        positions.sort_by(f64::total_cmp);
        positions
    }

    fn ambiguous_positions(native_positions: &[f64]) -> Vec<f64> {
        let mut ambiguous: Vec<f64> = native_positions
            .windows(2)
            .filter(|pair| same_position(pair[0], pair[1]))
            .map(|pair| pair[0])
            .collect();
        ambiguous.dedup_by(|later, kept| same_position(*later, *kept));
        ambiguous
    }

    /// Removes the single lowest and single highest position.
    fn trim_extremes(mut positions: Vec<f64>) -> Vec<f64> {
        if positions.len() < 2 {
            return Vec::new();
        }
        positions.pop();
        positions.remove(0);
        positions
    }

    fn select(&self, trimmed: Vec<f64>) -> Result<PositionIndex, AssemblyError> {
        let depth = self.target_depth;
        if depth == 0 {
            return Ok(PositionIndex::new(trimmed)?);
        }
        if trimmed.len() >= depth {
            let highest = trimmed[trimmed.len() - depth..].to_vec();
            return Ok(PositionIndex::with_capacity(highest, depth)?);
        }
        warn!(
            available = trimmed.len(),
            depth, "Fewer informative slices than requested depth; padding with empty slices"
        );
        Ok(PositionIndex::with_capacity(trimmed, depth)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn filled(value: f32, position: f64) -> RawSlice {
        RawSlice::new(Array2::from_elem((4, 4), value), position, format!("{position}"))
    }

    fn blank(position: f64) -> RawSlice {
        filled(0.0, position)
    }

    /// Slices at 0..n, informative unless listed in `empty`.
    fn series(n: usize, empty: &[usize]) -> Vec<RawSlice> {
        (0..n)
            .map(|i| {
                if empty.contains(&i) {
                    blank(i as f64)
                } else {
                    filled(i as f32 + 1.0, i as f64)
                }
            })
            .collect()
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let err = SliceStackAssembler::new(0).assemble(&[]).unwrap_err();
        assert!(matches!(err, AssemblyError::EmptyInputSet));
    }

    #[test]
    fn test_emptiness_threshold() {
        let assembler = SliceStackAssembler::default();
        let mut pixels = Array2::from_elem((10, 10), 5.0f32);
        // 68 zeros: below 68.7
        pixels.iter_mut().take(68).for_each(|v| *v = 0.0);
        assert!(assembler.is_informative(&RawSlice::new(pixels.clone(), 0.0, "a")));
        // 69 zeros: above
        pixels.iter_mut().take(69).for_each(|v| *v = 0.0);
        assert!(!assembler.is_informative(&RawSlice::new(pixels, 0.0, "b")));
    }

    #[test]
    fn test_variable_depth_trims_after_exclusion() {
        // Positions 0 and 11 are empty; 1 and 10 are the informative extremes.
        let slices = series(12, &[0, 11]);
        let stack = SliceStackAssembler::new(0).assemble(&slices).unwrap();

        let expected: Vec<f64> = (2..=9).map(f64::from).collect();
        assert_eq!(stack.index.positions(), expected.as_slice());
        assert_eq!(stack.depth(), 8);
        assert_eq!(stack.dim(), (4, 4, 8));
        assert_eq!(stack.native_positions.len(), 12);
        // slot k holds the slice at position k + 2
        for slot in 0..8 {
            assert_eq!(stack.data[[0, 0, slot]], (slot + 2) as f32 + 1.0);
        }
    }

    #[test]
    fn test_fixed_depth_keeps_highest_positions() {
        let slices = series(12, &[]);
        let stack = SliceStackAssembler::new(4).assemble(&slices).unwrap();
        // trimmed set is 1..=10, highest four are 7..=10
        assert_eq!(stack.index.positions(), &[7.0, 8.0, 9.0, 10.0]);
        assert_eq!(stack.index.padding(), 0);
        assert_eq!(stack.data[[2, 2, 0]], 8.0);
    }

    #[test]
    fn test_fixed_depth_pads_with_zero_slices() {
        let slices = series(5, &[]);
        let stack = SliceStackAssembler::new(6).assemble(&slices).unwrap();
        // trimmed set is 1..=3
        assert_eq!(stack.depth(), 6);
        assert_eq!(stack.index.positions(), &[1.0, 2.0, 3.0]);
        for slot in 3..6 {
            assert!(stack.index.is_padding(slot));
            assert!(stack.data.slice(s![.., .., slot]).iter().all(|&v| v == 0.0));
        }
        assert!(!stack.index.is_padding(2));
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let mut slices = series(8, &[]);
        slices.reverse();
        slices.swap(1, 5);
        let stack = SliceStackAssembler::new(0).assemble(&slices).unwrap();
        assert!(stack.index.positions().windows(2).all(|w| w[0] < w[1]));
        assert_eq!(stack.data[[0, 0, 0]], 2.0);
    }

    #[test]
    fn test_duplicate_position_last_write_wins() {
        // The last slice read at a shared position overwrites the earlier one.
        // Kept as observed behaviour; it is surfaced as an ambiguity warning.
        let mut slices = series(6, &[]);
        slices.push(filled(99.0, 2.0));
        let stack = SliceStackAssembler::new(0).assemble(&slices).unwrap();

        assert_eq!(stack.ambiguous_positions, vec![2.0]);
        assert!(stack.index.positions().windows(2).all(|w| w[0] < w[1]));
        let slot = stack.index.index_of(2.0).unwrap();
        assert_eq!(stack.data[[0, 0, slot]], 99.0);
        assert_eq!(stack.native_positions.len(), 7);
    }

    #[test]
    fn test_too_few_informative_slices() {
        let slices = vec![filled(1.0, 0.0), blank(1.0), blank(2.0)];
        let err = SliceStackAssembler::new(0).assemble(&slices).unwrap_err();
        assert!(matches!(err, AssemblyError::NoInformativeSlices { slices: 3 }));
    }

    #[test]
    fn test_inconsistent_dimensions() {
        let mut slices = series(4, &[]);
        slices.push(RawSlice::new(Array2::ones((3, 4)), 9.0, "odd"));
        let err = SliceStackAssembler::new(0).assemble(&slices).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::InconsistentDimensions { expected: (4, 4), found: (3, 4), .. }
        ));
    }
}
