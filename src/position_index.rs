use std::cmp::Ordering;

use thiserror::Error;

/// Two positions closer than this are the same physical slice.
pub const POSITION_TOLERANCE: f64 = 1e-6;

/// Placeholder written into padded depth slots. No real slice is this far out.
pub const SENTINEL_POSITION: f64 = 10_000.0;

#[derive(Debug, Error, PartialEq)]
pub enum PositionIndexError {
    #[error("{count} positions do not fit into a capacity of {capacity}")]
    CapacityExceeded { count: usize, capacity: usize },

    #[error("Position is not a finite number")]
    NonFinite,
}

/// Canonical slice order of one stack.
///
/// Real positions are strictly increasing. Slots beyond them, up to
/// `capacity`, are padding and resolve to [`SENTINEL_POSITION`].
#[derive(Debug, Clone, PartialEq)]
pub struct PositionIndex {
    positions: Vec<f64>,
    capacity: usize,
}

impl PositionIndex {
    /// Index without padding: depth equals the number of distinct positions.
    pub fn new(positions: Vec<f64>) -> Result<Self, PositionIndexError> {
        let positions = sorted_unique(positions)?;
        let capacity = positions.len();
        Ok(Self {
            positions,
            capacity,
        })
    }

    /// Index padded up to `capacity` slots.
    pub fn with_capacity(positions: Vec<f64>, capacity: usize) -> Result<Self, PositionIndexError> {
        let positions = sorted_unique(positions)?;
        if positions.len() > capacity {
            return Err(PositionIndexError::CapacityExceeded {
                count: positions.len(),
                capacity,
            });
        }
        Ok(Self {
            positions,
            capacity,
        })
    }

    /// Number of depth slots, padding included.
    pub fn depth(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.capacity == 0
    }

    /// Real (non-padding) positions in ascending order.
    pub fn positions(&self) -> &[f64] {
        &self.positions
    }

    /// Number of padded slots at the high end of the index.
    pub fn padding(&self) -> usize {
        self.capacity - self.positions.len()
    }

    pub fn is_padding(&self, slot: usize) -> bool {
        slot >= self.positions.len() && slot < self.capacity
    }

    /// Position stored at `slot`, [`SENTINEL_POSITION`] for padding.
    pub fn position_at(&self, slot: usize) -> Option<f64> {
        if slot < self.positions.len() {
            Some(self.positions[slot])
        } else if slot < self.capacity {
            Some(SENTINEL_POSITION)
        } else {
            None
        }
    }

    /// All slots, padding rendered as the sentinel.
    pub fn padded_positions(&self) -> Vec<f64> {
        (0..self.capacity)
            .filter_map(|slot| self.position_at(slot))
            .collect()
    }

    /// Depth slot holding `position`, if it is a real position of this index.
    pub fn index_of(&self, position: f64) -> Option<usize> {
        if !position.is_finite() {
            return None;
        }
        let slot = self
            .positions
            .partition_point(|&p| p < position - POSITION_TOLERANCE);
        self.positions
            .get(slot)
            .filter(|&&p| same_position(p, position))
            .map(|_| slot)
    }
}

pub fn same_position(a: f64, b: f64) -> bool {
    (a - b).abs() <= POSITION_TOLERANCE
}

/// Ascending order, collapsing entries that are the same within tolerance.
pub(crate) fn sorted_unique(mut positions: Vec<f64>) -> Result<Vec<f64>, PositionIndexError> {
    if positions.iter().any(|p| !p.is_finite()) {
        return Err(PositionIndexError::NonFinite);
    }
    positions.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    positions.dedup_by(|later, kept| same_position(*later, *kept));
    Ok(positions)
}
