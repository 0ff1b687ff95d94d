use crate::decompose::GeneSlotOrder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_PERMUTATIONS: usize = 1000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write run configuration: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML run configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize run configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("The thread count must be at least 1.")]
    ZeroThreads,
    #[error("A permutation run needs at least one permutation.")]
    ZeroPermutations,
}

/// Settings shared by every subcommand. Missing TOML keys take their defaults,
/// and command-line flags override whatever the file holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub permutations: usize,
    /// `None` means one worker per logical CPU.
    pub threads: Option<usize>,
    pub gene_slot_order: GeneSlotOrder,
    pub saturate_extremes: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            permutations: DEFAULT_PERMUTATIONS,
            threads: None,
            gene_slot_order: GeneSlotOrder::Reference,
            saturate_extremes: false,
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.threads == Some(0) {
            return Err(ConfigError::ZeroThreads);
        }
        Ok(())
    }

    /// Rejects settings that cannot drive a permutation run.
    pub fn check_for_permutations(&self) -> Result<(), ConfigError> {
        self.check()?;
        if self.permutations == 0 {
            return Err(ConfigError::ZeroPermutations);
        }
        Ok(())
    }

    /// The explicit thread count, or the number of logical CPUs.
    pub fn resolved_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }
}
