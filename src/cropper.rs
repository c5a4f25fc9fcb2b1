//! Crops finished image/mask pairs around each connected mask region.
//!
//! Regions are labelled with a two-pass union-find over the mask in C
//! order, so label `n` is the `n`-th region met when scanning rows, then
//! columns, then slices. Each region yields one crop spanning every row
//! and column and the region's slices plus a margin.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView3, s};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::enums::{Connectivity, Subset};
use crate::nifti::{self, NiftiError};
use crate::output::{DatasetLayout, FILE_ENDING, IMAGE_CHANNEL_SUFFIX};

/// Slices kept on either side of a region.
pub const DEFAULT_MARGIN: usize = 10;

/// Appended to the dataset directory name for the cropped copy.
pub const CROPPED_SUFFIX: &str = "CROPPED";

#[derive(Debug, Error)]
pub enum CropError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NIfTI error: {0}")]
    Nifti(#[from] NiftiError),

    #[error("Dataset directory not found: {0}")]
    MissingDataset(PathBuf),

    #[error("Image dims {image:?} do not match mask dims {mask:?}")]
    ShapeMismatch { image: [usize; 3], mask: [usize; 3] },
}

/// Sub-volume of one region; half-open on every axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBox {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
    pub slices: Range<usize>,
}

fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        parents[current] = parents[parents[current]];
        current = parents[current];
    }
    current
}

fn union_labels(parents: &mut [usize], a: usize, b: usize) {
    let root_a = find_root(parents, a);
    let root_b = find_root(parents, b);
    // the smaller label stays root so roots keep scan order
    if root_a < root_b {
        parents[root_b] = root_a;
    } else if root_b < root_a {
        parents[root_a] = root_b;
    }
}

/// Neighbours already visited in C order.
fn backward_offsets(connectivity: Connectivity) -> Vec<[isize; 3]> {
    match connectivity {
        Connectivity::Face => vec![[-1, 0, 0], [0, -1, 0], [0, 0, -1]],
        Connectivity::Full => {
            let mut offsets = Vec::with_capacity(13);
            for di in -1..=1isize {
                for dj in -1..=1isize {
                    for dk in -1..=1isize {
                        if (di, dj, dk) < (0, 0, 0) {
                            offsets.push([di, dj, dk]);
                        }
                    }
                }
            }
            offsets
        }
    }
}

/// Label connected non-zero voxels. Returns the label volume (0 is
/// background) and the number of regions.
pub fn label_components(mask: ArrayView3<'_, u8>, connectivity: Connectivity) -> (Array3<u32>, usize) {
    let (height, width, depth) = mask.dim();
    let offsets = backward_offsets(connectivity);
    let mut labels = Array3::<usize>::zeros((height, width, depth));
    let mut parents = vec![0usize];

    for i in 0..height {
        for j in 0..width {
            for k in 0..depth {
                if mask[[i, j, k]] == 0 {
                    continue;
                }
                let mut current = 0usize;
                for [di, dj, dk] in &offsets {
                    let (Some(ni), Some(nj), Some(nk)) = (
                        i.checked_add_signed(*di),
                        j.checked_add_signed(*dj),
                        k.checked_add_signed(*dk),
                    ) else {
                        continue;
                    };
                    if ni >= height || nj >= width || nk >= depth {
                        continue;
                    }
                    let neighbour = labels[[ni, nj, nk]];
                    if neighbour == 0 {
                        continue;
                    }
                    if current == 0 {
                        current = neighbour;
                    } else if current != neighbour {
                        union_labels(&mut parents, current, neighbour);
                    }
                }
                if current == 0 {
                    current = parents.len();
                    parents.push(current);
                }
                labels[[i, j, k]] = current;
            }
        }
    }

    // provisional labels were issued in scan order, so do their roots
    let mut relabel = vec![0u32; parents.len()];
    let mut count = 0usize;
    for label in 1..parents.len() {
        let root = find_root(&mut parents, label);
        if relabel[root] == 0 {
            count += 1;
            relabel[root] = count as u32;
        }
        relabel[label] = relabel[root];
    }

    (labels.mapv(|label| relabel[label]), count)
}

/// Cuts image/mask pairs into one pair per connected region.
#[derive(Debug, Clone, Copy)]
pub struct ComponentCropper {
    margin: usize,
    connectivity: Connectivity,
}

impl Default for ComponentCropper {
    fn default() -> Self {
        Self::new(Connectivity::default())
    }
}

impl ComponentCropper {
    pub fn new(connectivity: Connectivity) -> Self {
        Self {
            margin: DEFAULT_MARGIN,
            connectivity,
        }
    }

    pub fn with_margin(mut self, margin: usize) -> Self {
        self.margin = margin;
        self
    }

    /// One box per region, in label order.
    pub fn plan(&self, mask: ArrayView3<'_, u8>) -> Vec<BoundingBox> {
        let (height, width, depth) = mask.dim();
        let (labels, count) = label_components(mask, self.connectivity);

        let mut extents: Vec<Option<(usize, usize)>> = vec![None; count];
        for ((_, _, k), &label) in labels.indexed_iter() {
            if label == 0 {
                continue;
            }
            let extent = &mut extents[label as usize - 1];
            *extent = Some(match *extent {
                Some((lo, hi)) => (lo.min(k), hi.max(k)),
                None => (k, k),
            });
        }

        extents
            .into_iter()
            .flatten()
            .map(|(lo, hi)| BoundingBox {
                rows: 0..height,
                cols: 0..width,
                slices: lo.saturating_sub(self.margin)..(hi + self.margin + 1).min(depth),
            })
            .collect()
    }

    /// Crop one pair into `images_out` and `labels_out` as `{stem}_{i:04}.nii.gz`.
    /// Returns the number of crops written.
    pub fn crop_pair(
        &self,
        image_path: &Path,
        mask_path: &Path,
        stem: &str,
        images_out: &Path,
        labels_out: &Path,
    ) -> Result<usize, CropError> {
        let image_header = nifti::read_header(image_path)?;
        let mask = nifti::read_volume(mask_path)?;
        if image_header.dim != mask.header.dim {
            return Err(CropError::ShapeMismatch {
                image: image_header.dim,
                mask: mask.header.dim,
            });
        }

        let binary = mask.data.mapv(|value| u8::from(value != 0.0));
        let boxes = self.plan(binary.view());
        for (i, bbox) in boxes.iter().enumerate() {
            let name = format!("{stem}_{i:04}{FILE_ENDING}");
            debug!(crop = %name, slices = ?bbox.slices, "Writing crop");

            // only the slab is read from the image
            let image = nifti::read_slab(image_path, bbox.slices.clone())?;
            nifti::write_volume(images_out.join(&name), image.data.view(), &image.header)?;

            let mask_crop = mask.data.slice(s![
                bbox.rows.clone(),
                bbox.cols.clone(),
                bbox.slices.clone()
            ]);
            nifti::write_volume(
                labels_out.join(&name),
                mask_crop,
                &mask.header.slab(&bbox.slices),
            )?;
        }
        Ok(boxes.len())
    }

    /// Write a cropped copy of the dataset at `dataset_root` next to it.
    ///
    /// Files outside the image and label directories are copied as they
    /// are. Pairs that fail are logged and counted, they do not stop the run.
    pub fn crop_dataset(&self, dataset_root: &Path, fresh: bool) -> Result<CropReport, CropError> {
        let start = Instant::now();
        if !dataset_root.is_dir() {
            return Err(CropError::MissingDataset(dataset_root.to_path_buf()));
        }
        let target_root = cropped_root(dataset_root);
        if fresh && target_root.exists() {
            info!(root = %target_root.display(), "Removing existing cropped dataset");
            fs::remove_dir_all(&target_root)?;
        }

        let source = DatasetLayout::new(dataset_root);
        let target = DatasetLayout::new(&target_root);
        let excluded: Vec<PathBuf> = [Subset::Train, Subset::Test]
            .into_iter()
            .flat_map(|subset| [source.images_dir(subset), source.labels_dir(subset)])
            .collect();
        copy_tree(dataset_root, &target_root, &excluded)?;

        let mut report = CropReport::default();
        for subset in [Subset::Train, Subset::Test] {
            let images_out = target.images_dir(subset);
            let labels_out = target.labels_dir(subset);
            fs::create_dir_all(&images_out)?;
            fs::create_dir_all(&labels_out)?;

            let (pairs, unpaired) = find_pairs(&source.images_dir(subset), &source.labels_dir(subset))?;
            report.unpaired += unpaired;

            let results: Vec<(String, Result<usize, CropError>)> = pairs
                .par_iter()
                .map(|pair| {
                    let result =
                        self.crop_pair(&pair.image, &pair.mask, &pair.stem, &images_out, &labels_out);
                    (pair.stem.clone(), result)
                })
                .collect();

            for (stem, result) in results {
                report.pairs += 1;
                match result {
                    Ok(0) => {
                        warn!(pair = %stem, "No connected components in mask");
                        report.without_components.push(stem);
                    }
                    Ok(crops) => {
                        info!(pair = %stem, crops, "Cropped pair");
                        report.crops += crops;
                    }
                    Err(e) => {
                        warn!(pair = %stem, error = %e, "Failed to crop pair");
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            pairs = report.pairs,
            crops = report.crops,
            without_components = report.without_components.len(),
            failed = report.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cropping finished"
        );
        Ok(report)
    }
}

/// Summary of one cropping run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CropReport {
    pub pairs: usize,
    pub crops: usize,
    /// Stems whose mask held no foreground.
    pub without_components: Vec<String>,
    pub failed: usize,
    /// Images without a matching label file.
    pub unpaired: usize,
}

/// `<root>CROPPED`, next to `root`.
pub fn cropped_root(dataset_root: &Path) -> PathBuf {
    let name = dataset_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dataset_root.with_file_name(format!("{name}{CROPPED_SUFFIX}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CropPair {
    stem: String,
    image: PathBuf,
    mask: PathBuf,
}

/// Match `X_0000.nii.gz` images with `X.nii.gz` labels.
fn find_pairs(images_dir: &Path, labels_dir: &Path) -> Result<(Vec<CropPair>, usize), CropError> {
    if !images_dir.is_dir() {
        return Ok((Vec::new(), 0));
    }
    let image_suffix = format!("{IMAGE_CHANNEL_SUFFIX}{FILE_ENDING}");
    let mut names: Vec<String> = fs::read_dir(images_dir)?
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .filter(|name| name.ends_with(&image_suffix))
        .collect();
    names.sort();

    let mut pairs = Vec::with_capacity(names.len());
    let mut unpaired = 0;
    for name in names {
        let stem = name[..name.len() - image_suffix.len()].to_string();
        let mask = labels_dir.join(format!("{stem}{FILE_ENDING}"));
        if !mask.is_file() {
            warn!(image = %name, "No label file for image");
            unpaired += 1;
            continue;
        }
        pairs.push(CropPair {
            image: images_dir.join(&name),
            mask,
            stem,
        });
    }
    Ok((pairs, unpaired))
}

/// Mirror the directory tree of `src` into `dst`, skipping the files of
/// directories in `excluded`.
fn copy_tree(src: &Path, dst: &Path, excluded: &[PathBuf]) -> Result<(), CropError> {
    fs::create_dir_all(dst)?;
    let skip_files = excluded.iter().any(|dir| dir == src);
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&path, &target, excluded)?;
        } else if !skip_files {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}
