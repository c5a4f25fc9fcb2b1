//! # DICOM segmentation dataset library
//!
//! This crate turns per-case directories of DICOM image series and RT
//! structure sets into spatially aligned volume/mask pairs laid out as a
//! raw segmentation dataset, then crops those pairs around each
//! connected structure region.
//!
//! It builds on the dicom-rs ecosystem for reading the records. Every case
//! directory holds a `GTV.txt` listing the structures to extract and one
//! sub-directory per acquisition phase. For each phase:
//!
//!  1. Slices are read in parallel using rayon and sorted by their
//!     position along the stacking axis.
//!  2. Nearly empty slices are dropped and the outermost informative
//!     positions trimmed, giving the slot index of the output volume.
//!  3. The requested structures are rasterized per native slice and
//!     re-indexed into the same slots, merged into one binary mask when
//!     several are requested.
//!  4. Volume, mask and a slice-location side-car are written as NIfTI.
//!
//! Cases are split once into training and test subsets before any case is
//! processed; cases converted by an earlier run keep their subset.
//!
//! DICOM files are assumed to have the following attributes:
//!  - Axial data set
//!  - No multiframe (always the first frame is used)
//!  - One series per phase directory
//!
//! # Examples
//!
//! ## Converting a directory of cases
//!
//! ```no_run
//! # use dicom_seg_dataset::config::PipelineConfig;
//! # use dicom_seg_dataset::orchestrator::CaseOrchestrator;
//! # use std::path::PathBuf;
//! let config = PipelineConfig {
//!     source_root: PathBuf::from("cases"),
//!     target_root: PathBuf::from("nnUNet_raw"),
//!     seed: Some(7),
//!     ..PipelineConfig::default()
//! };
//! let report = CaseOrchestrator::with_dicom(config)
//!     .run()
//!     .expect("should have converted the cases");
//! println!("{} phases written", report.written_phases());
//! ```
//!
//! ## Cropping a converted dataset
//!
//! ```no_run
//! # use dicom_seg_dataset::cropper::ComponentCropper;
//! # use std::path::Path;
//! let report = ComponentCropper::default()
//!     .crop_dataset(Path::new("nnUNet_raw/Dataset801_SBRTest"), true)
//!     .expect("should have cropped the dataset");
//! println!("{} crops written", report.crops);
//! ```

pub mod assembler;
pub mod config;
pub mod cropper;
pub mod enums;
pub mod nifti;
pub mod orchestrator;
pub mod output;
pub mod phase;
pub mod position_index;
pub mod rtstruct;
pub mod source;
pub mod split;
pub mod structure;
pub mod volume;
pub mod volume_loader;
