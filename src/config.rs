use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::assembler::EMPTY_FRACTION_THRESHOLD;
use crate::enums::PhaseNaming;
use crate::structure::MIN_STRUCTURE_SET_BYTES;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file as TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of one conversion run. Built once, then only read.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub dataset_id: u32,
    pub dataset_name: String,
    /// One sub-directory per case.
    pub source_root: PathBuf,
    /// Root under which the dataset directory is created.
    pub target_root: PathBuf,
    pub phase_naming: PhaseNaming,
    pub test_fraction: f64,
    /// 0 keeps every informative slice.
    pub target_depth: usize,
    pub empty_fraction_threshold: f64,
    pub min_structure_set_bytes: u64,
    pub phases_per_case: usize,
    pub structure_list_file: String,
    pub image_prefixes: Vec<String>,
    pub structure_set_prefix: String,
    pub channel_name: String,
    pub label_name: String,
    pub delete_origin_data: bool,
    pub fresh_output: bool,
    pub seed: Option<u64>,
    pub workers: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dataset_id: 801,
            dataset_name: "SBRTest".to_string(),
            source_root: PathBuf::new(),
            target_root: PathBuf::new(),
            phase_naming: PhaseNaming::Auto,
            test_fraction: 0.40,
            target_depth: 0,
            empty_fraction_threshold: EMPTY_FRACTION_THRESHOLD,
            min_structure_set_bytes: MIN_STRUCTURE_SET_BYTES,
            phases_per_case: 2,
            structure_list_file: "GTV.txt".to_string(),
            image_prefixes: vec!["CT".to_string(), "US".to_string()],
            structure_set_prefix: "RS".to_string(),
            channel_name: "CT".to_string(),
            label_name: "GTV".to_string(),
            delete_origin_data: false,
            fresh_output: false,
            seed: None,
            workers: None,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.test_fraction) {
            return Err(ConfigError::Invalid(format!(
                "test_fraction must be within [0, 1], got {}",
                self.test_fraction
            )));
        }
        if !(self.empty_fraction_threshold > 0.0 && self.empty_fraction_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "empty_fraction_threshold must be within (0, 1], got {}",
                self.empty_fraction_threshold
            )));
        }
        if self.phases_per_case == 0 {
            return Err(ConfigError::Invalid("phases_per_case must be at least 1".into()));
        }
        if self.image_prefixes.is_empty() {
            return Err(ConfigError::Invalid("image_prefixes must not be empty".into()));
        }
        Ok(())
    }

    /// `Dataset801_SBRTest`
    pub fn full_dataset_name(&self) -> String {
        format!("Dataset{:03}_{}", self.dataset_id, self.dataset_name)
    }

    pub fn dataset_root(&self) -> PathBuf {
        self.target_root.join(self.full_dataset_name())
    }
}
