//! RT structure-set reader: turns planar ROI contours into per-slice rasters.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use dicom::object::{FileDicomObject, InMemDicomObject, open_file};
use dicom_dictionary_std::tags;
use ndarray::Array2;
use tracing::debug;

use crate::structure::{StructureError, StructureRasterizer};
use crate::volume::{RawSlice, SliceGeometry};
use crate::volume_loader::{dicom_files, has_prefix};

/// First `<prefix>*.dcm` file of a phase directory, by file name.
pub fn find_structure_set(dir: &Path, prefix: &str) -> Result<Option<PathBuf>, std::io::Error> {
    let mut candidates: Vec<_> = dicom_files(dir)?
        .into_iter()
        .filter(|path| has_prefix(path, prefix))
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Planes closer than this (mm) count as one position.
const PLANE_TOLERANCE_MM: f64 = 1e-5;

/// Closed planar contour in patient coordinates (mm).
type Contour = Vec<[f64; 3]>;

#[derive(Debug, Clone)]
struct Roi {
    number: i32,
    name: String,
    contours: Vec<Contour>,
}

/// Pixel grid of one native slice.
#[derive(Debug, Clone, Copy)]
struct SliceGrid {
    shape: (usize, usize),
    geometry: SliceGeometry,
}

impl SliceGrid {
    fn row_direction(&self) -> [f64; 3] {
        let o = self.geometry.image_orientation;
        [o[0], o[1], o[2]]
    }

    fn column_direction(&self) -> [f64; 3] {
        let o = self.geometry.image_orientation;
        [o[3], o[4], o[5]]
    }

    fn normal(&self) -> [f64; 3] {
        cross(self.row_direction(), self.column_direction())
    }

    /// Signed distance of the slice plane from the origin along its normal.
    fn plane_offset(&self) -> f64 {
        dot(self.normal(), self.geometry.image_position)
    }

    /// (row, column) continuous pixel coordinates of a patient-space point.
    fn to_pixel(&self, point: [f64; 3]) -> (f64, f64) {
        let origin = self.geometry.image_position;
        let v = [
            point[0] - origin[0],
            point[1] - origin[1],
            point[2] - origin[2],
        ];
        let [row_spacing, col_spacing] = self.geometry.pixel_spacing;
        let col = dot(v, self.row_direction()) / col_spacing;
        let row = dot(v, self.column_direction()) / row_spacing;
        (row, col)
    }
}

/// Rasterizes the ROIs of an RT structure set onto a phase's native slices.
#[derive(Debug, Clone)]
pub struct RtStructRasterizer {
    rois: Vec<Roi>,
    grids: Vec<SliceGrid>,
}

impl RtStructRasterizer {
    /// Parse the structure set at `path` for the given phase slices.
    pub fn open(path: impl AsRef<Path>, slices: &[RawSlice]) -> Result<Self, StructureError> {
        let dicom_object = open_file(path.as_ref())?;
        Self::from_dicom_object(&dicom_object, slices)
    }

    pub fn from_dicom_object(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        slices: &[RawSlice],
    ) -> Result<Self, StructureError> {
        let mut rois = Self::read_roi_names(dicom_object)?;
        Self::read_contours(dicom_object, &mut rois)?;
        debug!(rois = rois.len(), "Parsed structure set");
        Ok(Self::from_parts(rois, slices))
    }

    fn from_parts(rois: Vec<Roi>, slices: &[RawSlice]) -> Self {
        let mut native: Vec<&RawSlice> = slices.iter().collect();
        native.sort_by(|a, b| a.position.total_cmp(&b.position));
        let grids = native
            .into_iter()
            .map(|slice| SliceGrid {
                shape: slice.dim(),
                geometry: slice.geometry,
            })
            .collect();
        Self { rois, grids }
    }

    fn read_roi_names(
        dicom_object: &FileDicomObject<InMemDicomObject>,
    ) -> Result<Vec<Roi>, StructureError> {
        let items = dicom_object
            .element(tags::STRUCTURE_SET_ROI_SEQUENCE)
            .ok()
            .and_then(|element| element.items())
            .ok_or_else(|| StructureError::Malformed("no StructureSetROISequence".into()))?;

        Ok(items
            .iter()
            .filter_map(|item| {
                let number = item.element(tags::ROI_NUMBER).ok()?.to_int::<i32>().ok()?;
                let name = item.element(tags::ROI_NAME).ok()?.to_str().ok()?;
                Some(Roi {
                    number,
                    name: name.trim().to_string(),
                    contours: Vec::new(),
                })
            })
            .collect())
    }

    fn read_contours(
        dicom_object: &FileDicomObject<InMemDicomObject>,
        rois: &mut [Roi],
    ) -> Result<(), StructureError> {
        let items = dicom_object
            .element(tags::ROI_CONTOUR_SEQUENCE)
            .ok()
            .and_then(|element| element.items())
            .ok_or_else(|| StructureError::Malformed("no ROIContourSequence".into()))?;

        for item in items {
            let Some(number) = item
                .element(tags::REFERENCED_ROI_NUMBER)
                .ok()
                .and_then(|element| element.to_int::<i32>().ok())
            else {
                continue;
            };
            let Some(roi) = rois.iter_mut().find(|roi| roi.number == number) else {
                continue;
            };
            let Some(contours) = item
                .element(tags::CONTOUR_SEQUENCE)
                .ok()
                .and_then(|element| element.items())
            else {
                continue;
            };
            for contour in contours {
                let data = contour
                    .element(tags::CONTOUR_DATA)
                    .map_err(|e| StructureError::Malformed(e.to_string()))?
                    .to_multi_float64()
                    .map_err(|e| StructureError::Malformed(e.to_string()))?;
                let points: Contour = data
                    .chunks_exact(3)
                    .map(|p| [p[0], p[1], p[2]])
                    .collect();
                if !points.is_empty() {
                    roi.contours.push(points);
                }
            }
        }
        Ok(())
    }

    /// Native slices whose plane is nearest to `contour`, within half a
    /// slice gap. Slices read twice at one position all receive it.
    fn slices_of(&self, contour: &Contour) -> Vec<usize> {
        let Some(grid) = self.grids.first() else {
            return Vec::new();
        };
        let normal = grid.normal();
        let depth = contour.iter().map(|&p| dot(normal, p)).sum::<f64>() / contour.len() as f64;

        let distances: Vec<f64> = self
            .grids
            .iter()
            .map(|grid| (grid.plane_offset() - depth).abs())
            .collect();
        let Some(nearest) = distances
            .iter()
            .copied()
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        else {
            return Vec::new();
        };

        let offsets: Vec<f64> = self.grids.iter().map(SliceGrid::plane_offset).collect();
        let tolerance = min_gap(&offsets).map_or(f64::INFINITY, |gap| gap / 2.0);
        if nearest > tolerance {
            return Vec::new();
        }
        distances
            .iter()
            .enumerate()
            .filter(|&(_, &distance)| distance - nearest <= PLANE_TOLERANCE_MM)
            .map(|(slot, _)| slot)
            .collect()
    }
}

impl StructureRasterizer for RtStructRasterizer {
    fn known_names(&self) -> Vec<String> {
        self.rois.iter().map(|roi| roi.name.clone()).collect()
    }

    fn rasterize(&self, name: &str) -> Result<Vec<Array2<bool>>, StructureError> {
        let roi = self
            .rois
            .iter()
            .find(|roi| roi.name == name)
            .ok_or_else(|| StructureError::MissingStructure {
                name: name.to_string(),
            })?;

        let mut polygons: Vec<Vec<Vec<(f64, f64)>>> = vec![Vec::new(); self.grids.len()];
        for contour in &roi.contours {
            for slot in self.slices_of(contour) {
                let grid = &self.grids[slot];
                polygons[slot].push(contour.iter().map(|&p| grid.to_pixel(p)).collect());
            }
        }

        Ok(self
            .grids
            .iter()
            .zip(&polygons)
            .map(|(grid, polygons)| fill_polygons(grid.shape, polygons))
            .collect())
    }
}

/// Even-odd scanline fill sampled at pixel centres.
fn fill_polygons(shape: (usize, usize), polygons: &[Vec<(f64, f64)>]) -> Array2<bool> {
    let (rows, cols) = shape;
    let mut raster = Array2::from_elem(shape, false);
    if polygons.is_empty() {
        return raster;
    }

    for row in 0..rows {
        let y = row as f64;
        let mut crossings: Vec<f64> = Vec::new();
        for polygon in polygons {
            let n = polygon.len();
            for i in 0..n {
                let (yi, xi) = polygon[i];
                let (yj, xj) = polygon[(i + 1) % n];
                if (yi <= y && yj > y) || (yj <= y && yi > y) {
                    let t = (y - yi) / (yj - yi);
                    crossings.push(xi + t * (xj - xi));
                }
            }
        }
        crossings.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        for pair in crossings.chunks_exact(2) {
            let start = pair[0].ceil().max(0.0);
            let end = pair[1].floor().min(cols as f64 - 1.0);
            if start > end {
                continue;
            }
            for col in start as usize..=end as usize {
                raster[[row, col]] = true;
            }
        }
    }

    raster
}

fn min_gap(offsets: &[f64]) -> Option<f64> {
    let mut sorted = offsets.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|gap| *gap > 0.0)
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}
