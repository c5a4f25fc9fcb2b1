//! Per-case sequencing of phases and the dataset-wide conversion run.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};
use web_time::Instant;

use crate::assembler::{AssemblyError, SliceStackAssembler};
use crate::config::PipelineConfig;
use crate::enums::Subset;
use crate::output::{
    DatasetLayout, DatasetManifest, NiftiPhaseWriter, OutputError, PhaseOutput, PhaseWriter,
};
use crate::phase::{PhaseResolver, SuffixPhaseResolver};
use crate::source::{DicomPhaseSource, PhaseSource};
use crate::split::SplitPlan;
use crate::structure::{StructureError, StructureMaskBuilder};
use crate::volume::SliceStack;
use crate::volume_loader::SliceLoaderError;

/// Slice spacing used when the index holds fewer than two positions.
const FALLBACK_SLICE_SPACING: f64 = 1.0;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No case directories found in {0}")]
    NoCases(PathBuf),

    #[error("Failed to read structure list {path}: {source}")]
    StructureList {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Why a phase produced no output.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Load(#[from] SliceLoaderError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

impl PhaseError {
    pub fn is_missing_structure(&self) -> bool {
        matches!(self, PhaseError::Structure(StructureError::MissingStructure { .. }))
    }

    pub fn is_empty_structure_set(&self) -> bool {
        matches!(self, PhaseError::Structure(StructureError::EmptyStructureSet { .. }))
    }
}

#[derive(Debug)]
pub enum PhaseOutcome {
    Written {
        depth: usize,
        structures: Vec<String>,
        ambiguous_positions: usize,
    },
    /// No declared structure applies to the phase.
    Skipped,
    Failed(PhaseError),
}

#[derive(Debug)]
pub struct PhaseRecord {
    pub phase_id: String,
    pub outcome: PhaseOutcome,
}

#[derive(Debug)]
pub struct CaseRecord {
    pub case_id: String,
    pub subset: Subset,
    pub phases: Vec<PhaseRecord>,
    /// Set when the case could not be processed at all.
    pub failure: Option<PipelineError>,
    pub deleted: bool,
}

impl CaseRecord {
    pub fn written_phases(&self) -> usize {
        self.phases
            .iter()
            .filter(|phase| matches!(phase.outcome, PhaseOutcome::Written { .. }))
            .count()
    }

    /// Raw inputs may only go when nothing about the case failed.
    pub fn deletion_eligible(&self) -> bool {
        self.failure.is_none()
            && self
                .phases
                .iter()
                .all(|phase| !matches!(phase.outcome, PhaseOutcome::Failed(_)))
    }
}

/// Result of a whole conversion run.
#[derive(Debug)]
pub struct DatasetReport {
    pub records: Vec<CaseRecord>,
    pub split: SplitPlan,
    pub num_training: usize,
}

impl DatasetReport {
    pub fn written_phases(&self) -> usize {
        self.records.iter().map(CaseRecord::written_phases).sum()
    }

    pub fn failed_phases(&self) -> usize {
        self.records
            .iter()
            .flat_map(|record| &record.phases)
            .filter(|phase| matches!(phase.outcome, PhaseOutcome::Failed(_)))
            .count()
    }
}

/// Turns the phases of each case into aligned image/mask pairs.
pub struct CaseOrchestrator {
    config: PipelineConfig,
    assembler: SliceStackAssembler,
    resolver: Box<dyn PhaseResolver>,
    source: Box<dyn PhaseSource>,
    writer: Box<dyn PhaseWriter>,
}

impl CaseOrchestrator {
    pub fn new(
        config: PipelineConfig,
        resolver: Box<dyn PhaseResolver>,
        source: Box<dyn PhaseSource>,
        writer: Box<dyn PhaseWriter>,
    ) -> Self {
        let assembler = SliceStackAssembler::new(config.target_depth)
            .with_empty_fraction_threshold(config.empty_fraction_threshold);
        Self {
            config,
            assembler,
            resolver,
            source,
            writer,
        }
    }

    /// DICOM inputs, suffix-based phase resolution and NIfTI outputs.
    pub fn with_dicom(config: PipelineConfig) -> Self {
        let resolver = SuffixPhaseResolver::new(config.phase_naming);
        let source = DicomPhaseSource::new(
            config.image_prefixes.clone(),
            config.structure_set_prefix.clone(),
            config.min_structure_set_bytes,
        );
        let writer = NiftiPhaseWriter::new(DatasetLayout::new(config.dataset_root()));
        Self::new(config, Box::new(resolver), Box::new(source), Box::new(writer))
    }

    pub fn layout(&self) -> DatasetLayout {
        DatasetLayout::new(self.config.dataset_root())
    }

    /// Voxel-to-world scaling: in-plane spacing from the slice metadata,
    /// stacking-axis spacing from the index itself.
    pub fn affine(stack: &SliceStack) -> [[f64; 4]; 4] {
        let (row_spacing, col_spacing) = stack.pixel_spacing();
        let slice_spacing = stack.slice_spacing().unwrap_or_else(|| {
            warn!("Fewer than two indexed slices; using fallback slice spacing");
            FALLBACK_SLICE_SPACING
        });
        [
            [col_spacing, 0.0, 0.0, 0.0],
            [0.0, row_spacing, 0.0, 0.0],
            [0.0, 0.0, slice_spacing, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    /// Convert every phase of one case directory.
    pub fn process_case(&self, case_dir: &Path, subset: Subset) -> CaseRecord {
        let start = Instant::now();
        let case_id = dir_name(case_dir);
        let mut record = CaseRecord {
            case_id: case_id.clone(),
            subset,
            phases: Vec::new(),
            failure: None,
            deleted: false,
        };

        let declared = match self.read_structure_list(case_dir) {
            Ok(declared) => declared,
            Err(e) => {
                warn!(case = %case_id, error = %e, "Skipping case");
                record.failure = Some(e);
                return record;
            }
        };
        let phase_dirs = match subdirectories(case_dir) {
            Ok(dirs) => dirs,
            Err(e) => {
                record.failure = Some(e.into());
                return record;
            }
        };
        info!(case = %case_id, phases = phase_dirs.len(), ?subset, "Processing case");

        for phase_dir in phase_dirs {
            let phase_id = dir_name(&phase_dir);
            let outcome = self.process_phase(&case_id, &phase_id, &phase_dir, &declared, subset);
            if let PhaseOutcome::Failed(e) = &outcome {
                warn!(case = %case_id, phase = %phase_id, error = %e, "Phase failed");
            }
            record.phases.push(PhaseRecord { phase_id, outcome });
        }

        info!(
            case = %case_id,
            written = record.written_phases(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished case"
        );
        record
    }

    pub fn process_phase(
        &self,
        case_id: &str,
        phase_id: &str,
        phase_dir: &Path,
        declared: &[String],
        subset: Subset,
    ) -> PhaseOutcome {
        let resolution = self.resolver.resolve(declared, phase_id);
        if resolution.names.is_empty() {
            warn!(case = %case_id, phase = %phase_id, "No structures apply to phase; skipping");
            return PhaseOutcome::Skipped;
        }
        debug!(
            phase = %phase_id,
            structures = resolution.names.len(),
            phase_specific = resolution.phase_specific,
            "Resolved structures"
        );

        match self.convert_phase(case_id, phase_id, phase_dir, &resolution.names, subset) {
            Ok(outcome) => outcome,
            Err(e) => PhaseOutcome::Failed(e),
        }
    }

    fn convert_phase(
        &self,
        case_id: &str,
        phase_id: &str,
        phase_dir: &Path,
        names: &[String],
        subset: Subset,
    ) -> Result<PhaseOutcome, PhaseError> {
        let slices = self.source.load_slices(phase_dir)?;
        let stack = self.assembler.assemble(&slices)?;
        let rasterizer = self.source.structure_set(phase_dir, &slices)?;
        drop(slices);
        let mask = StructureMaskBuilder::for_stack(&stack).build(names, rasterizer.as_ref())?;

        let affine = Self::affine(&stack);
        let outcome = PhaseOutcome::Written {
            depth: stack.depth(),
            structures: names.to_vec(),
            ambiguous_positions: stack.ambiguous_positions.len(),
        };
        let output = PhaseOutput {
            case_id: case_id.to_string(),
            phase_id: phase_id.to_string(),
            stack,
            mask,
            affine,
        };
        self.writer.write_phase(&output, subset)?;
        Ok(outcome)
    }

    /// Declared structure names, one per non-blank line.
    fn read_structure_list(&self, case_dir: &Path) -> Result<Vec<String>, PipelineError> {
        let path = case_dir.join(&self.config.structure_list_file);
        let contents = fs::read_to_string(&path)
            .map_err(|source| PipelineError::StructureList { path, source })?;
        Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Convert every pending case under the source root.
    ///
    /// # Errors
    ///
    /// Fails when no case directory exists or the output tree cannot be
    /// prepared. Failures inside a case are recorded, not returned.
    pub fn run(&self) -> Result<DatasetReport, PipelineError> {
        let start = Instant::now();
        let layout = self.layout();
        if self.config.fresh_output && layout.root().exists() {
            info!(root = %layout.root().display(), "Removing existing dataset directory");
            fs::remove_dir_all(layout.root())?;
        }
        layout.create_dirs()?;

        let case_dirs = subdirectories(&self.config.source_root)?;
        if case_dirs.is_empty() {
            return Err(PipelineError::NoCases(self.config.source_root.clone()));
        }

        let case_ids: Vec<String> = case_dirs.iter().map(|dir| dir_name(dir)).collect();
        let converted_train = layout.converted_cases(Subset::Train, &case_ids)?;
        let converted_test = layout.converted_cases(Subset::Test, &case_ids)?;
        let (pending, pending_ids): (Vec<PathBuf>, Vec<String>) = case_dirs
            .into_iter()
            .zip(case_ids)
            .filter(|(_, id)| !converted_train.contains(id) && !converted_test.contains(id))
            .unzip();

        let split = SplitPlan::new(
            &pending_ids,
            &converted_train,
            &converted_test,
            self.config.test_fraction,
            self.config.seed,
        );
        info!(
            pending = pending.len(),
            train = split.train.len(),
            test = split.test.len(),
            "Planned dataset split"
        );

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.workers.unwrap_or(0))
            .build()?;
        let records: Vec<CaseRecord> = pool.install(|| {
            pending
                .par_iter()
                .map(|case_dir| {
                    let subset = split.subset_of(&dir_name(case_dir)).unwrap_or(Subset::Train);
                    let mut record = self.process_case(case_dir, subset);
                    self.delete_if_eligible(case_dir, &mut record);
                    record
                })
                .collect()
        });

        let num_training = split.num_training(self.config.phases_per_case);
        DatasetManifest::new(&self.config.channel_name, &self.config.label_name, num_training)
            .write(layout.manifest_path())?;

        let report = DatasetReport {
            records,
            split,
            num_training,
        };
        info!(
            cases = report.records.len(),
            written = report.written_phases(),
            failed = report.failed_phases(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Conversion finished"
        );
        Ok(report)
    }

    /// Runs only after the case's outputs were written.
    fn delete_if_eligible(&self, case_dir: &Path, record: &mut CaseRecord) {
        if !self.config.delete_origin_data {
            return;
        }
        if !record.deletion_eligible() {
            info!(case = %record.case_id, "Keeping raw inputs of incomplete case");
            return;
        }
        match fs::remove_dir_all(case_dir) {
            Ok(()) => {
                record.deleted = true;
                info!(case = %record.case_id, "Deleted raw inputs");
            }
            Err(e) => warn!(case = %record.case_id, error = %e, "Failed to delete raw inputs"),
        }
    }
}

fn dir_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Immediate sub-directories, sorted by name.
fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}
