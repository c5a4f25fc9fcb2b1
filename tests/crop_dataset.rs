use std::fs;
use std::path::Path;

use ndarray::Array3;

use dicom_seg_dataset::cropper::{ComponentCropper, CropError, cropped_root};
use dicom_seg_dataset::enums::{Connectivity, Subset};
use dicom_seg_dataset::nifti::{self, DataType, NiftiHeader};
use dicom_seg_dataset::output::DatasetLayout;

fn affine() -> [[f64; 4]; 4] {
    [
        [0.9, 0.0, 0.0, 0.0],
        [0.0, 0.9, 0.0, 0.0],
        [0.0, 0.0, 3.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

fn write_pair(layout: &DatasetLayout, subset: Subset, stem: &str, mask: &Array3<f32>) {
    let (nx, ny, nz) = mask.dim();
    let image = Array3::from_shape_fn((nx, ny, nz), |(i, j, k)| (i + j + k) as f32);
    nifti::write_volume(
        layout.images_dir(subset).join(format!("{stem}_0000.nii.gz")),
        image.view(),
        &NiftiHeader::new([nx, ny, nz], DataType::Float32, affine()),
    )
    .unwrap();
    nifti::write_volume(
        layout.labels_dir(subset).join(format!("{stem}.nii.gz")),
        mask.view(),
        &NiftiHeader::new([nx, ny, nz], DataType::UInt8, affine()),
    )
    .unwrap();
}

/// Two separate blobs: slices 3..=4 and 40..=41.
fn two_blob_mask() -> Array3<f32> {
    let mut mask = Array3::zeros((6, 6, 50));
    for k in 3..=4 {
        mask[[1, 1, k]] = 1.0;
        mask[[1, 2, k]] = 1.0;
    }
    for k in 40..=41 {
        mask[[4, 4, k]] = 1.0;
    }
    mask
}

fn dataset(root: &Path) -> DatasetLayout {
    let layout = DatasetLayout::new(root.join("Dataset801_SBRTest"));
    layout.create_dirs().unwrap();
    fs::write(layout.manifest_path(), b"{}").unwrap();
    fs::write(layout.locations_dir(Subset::Train).join("P1_CT_0_LOC.json"), b"{}").unwrap();
    layout
}

#[test]
fn test_two_blobs_give_two_numbered_pairs() {
    let dir = tempfile::tempdir().unwrap();
    let layout = dataset(dir.path());
    write_pair(&layout, Subset::Train, "P1_CT_0", &two_blob_mask());

    let report = ComponentCropper::default()
        .crop_dataset(layout.root(), true)
        .unwrap();
    assert_eq!(report.pairs, 1);
    assert_eq!(report.crops, 2);
    assert!(report.without_components.is_empty());

    let cropped = DatasetLayout::new(cropped_root(layout.root()));
    let images = cropped.images_dir(Subset::Train);
    let labels = cropped.labels_dir(Subset::Train);

    let mut names: Vec<String> = fs::read_dir(&images)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["P1_CT_0_0000.nii.gz", "P1_CT_0_0001.nii.gz"]);
    assert!(labels.join("P1_CT_0_0000.nii.gz").is_file());
    assert!(labels.join("P1_CT_0_0001.nii.gz").is_file());

    // first blob: slices 0..15, second: 30..50
    let first = nifti::read_volume(images.join("P1_CT_0_0000.nii.gz")).unwrap();
    assert_eq!(first.header.dim, [6, 6, 15]);
    let second = nifti::read_volume(images.join("P1_CT_0_0001.nii.gz")).unwrap();
    assert_eq!(second.header.dim, [6, 6, 20]);
    assert_eq!(second.data[[1, 2, 0]], 33.0);
    assert!((second.header.affine()[2][3] - 90.0).abs() < 1e-9);

    let second_mask = nifti::read_volume(labels.join("P1_CT_0_0001.nii.gz")).unwrap();
    assert_eq!(second_mask.data.iter().filter(|&&v| v != 0.0).count(), 2);
    assert_eq!(second_mask.data[[4, 4, 10]], 1.0);

    // everything outside the image and label directories is copied
    assert!(cropped.manifest_path().is_file());
    assert!(cropped.locations_dir(Subset::Train).join("P1_CT_0_LOC.json").is_file());
    assert!(cropped.images_dir(Subset::Test).is_dir());
}

#[test]
fn test_empty_mask_is_reported_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let layout = dataset(dir.path());
    write_pair(&layout, Subset::Test, "P2_CT_50", &Array3::zeros((4, 4, 8)));
    write_pair(&layout, Subset::Train, "P1_CT_0", &two_blob_mask());

    let report = ComponentCropper::new(Connectivity::Face)
        .crop_dataset(layout.root(), false)
        .unwrap();
    assert_eq!(report.pairs, 2);
    assert_eq!(report.crops, 2);
    assert_eq!(report.without_components, vec!["P2_CT_50".to_string()]);
    assert_eq!(report.failed, 0);

    let cropped = DatasetLayout::new(cropped_root(layout.root()));
    assert_eq!(fs::read_dir(cropped.images_dir(Subset::Test)).unwrap().count(), 0);
}

#[test]
fn test_images_without_labels_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let layout = dataset(dir.path());
    write_pair(&layout, Subset::Train, "P1_CT_0", &two_blob_mask());
    fs::remove_file(layout.labels_dir(Subset::Train).join("P1_CT_0.nii.gz")).unwrap();

    let report = ComponentCropper::default()
        .crop_dataset(layout.root(), true)
        .unwrap();
    assert_eq!(report.pairs, 0);
    assert_eq!(report.unpaired, 1);
}

#[test]
fn test_missing_dataset_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ComponentCropper::default().crop_dataset(&dir.path().join("nope"), true);
    assert!(matches!(result, Err(CropError::MissingDataset(_))));
}
