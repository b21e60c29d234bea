//! Configuration management for dLLM scheduling
//!
//! A [`DllmConfig`] is resolved once at startup and then shared, immutable,
//! by every request through an `Arc`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::thresholds::MultiBlockThresholds;
use crate::error::DllmError;
use crate::TokenId;

/// Algorithm config key holding threshold overrides
pub const THRESHOLDS_KEY: &str = "multi_block_thresholds";

/// Decoding algorithm selecting single-block or multi-block scheduling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DllmAlgorithm {
    /// One block refined at a time
    LowConfidence,
    /// Sliding window of several blocks
    LowConfidenceMultiBlock,
}

impl DllmAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DllmAlgorithm::LowConfidence => "LowConfidence",
            DllmAlgorithm::LowConfidenceMultiBlock => "LowConfidenceMultiBlock",
        }
    }

    pub fn is_multi_block(&self) -> bool {
        matches!(self, DllmAlgorithm::LowConfidenceMultiBlock)
    }
}

impl FromStr for DllmAlgorithm {
    type Err = DllmError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LowConfidence" => Ok(DllmAlgorithm::LowConfidence),
            "LowConfidenceMultiBlock" => Ok(DllmAlgorithm::LowConfidenceMultiBlock),
            other => Err(DllmError::UnknownAlgorithm(other.to_string())),
        }
    }
}

impl std::fmt::Display for DllmAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Startup arguments the config is resolved from
#[derive(Debug, Clone, Default)]
pub struct DllmArgs {
    /// Algorithm identifier; `None` disables diffusion decoding
    pub dllm_algorithm: Option<String>,

    /// Optional JSON file with algorithm overrides
    pub dllm_algorithm_config: Option<PathBuf>,

    /// Model architecture name, e.g. `LLaDA2MoeModelLM`
    pub architecture: String,

    pub max_running_requests: Option<usize>,
}

/// Scheduler configuration for diffusion decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DllmConfig {
    /// Selected decoding algorithm
    pub algorithm: DllmAlgorithm,

    /// Raw algorithm-specific settings
    #[serde(default)]
    pub algorithm_config: serde_json::Value,

    /// Maximum number of blocks in flight per request
    pub buffer_size: usize,

    /// Tokens per block
    pub block_size: usize,

    /// Placeholder token id, never produced as real text
    pub mask_token_id: TokenId,

    /// Maximum number of requests decoded concurrently
    pub max_running_requests: usize,

    /// Multi-block transition thresholds
    #[serde(default)]
    pub thresholds: MultiBlockThresholds,
}

impl DllmConfig {
    pub fn new(
        algorithm: DllmAlgorithm,
        block_size: usize,
        buffer_size: usize,
        mask_token_id: TokenId,
    ) -> Self {
        Self {
            algorithm,
            algorithm_config: serde_json::Value::Null,
            buffer_size,
            block_size,
            mask_token_id,
            max_running_requests: 1,
            thresholds: MultiBlockThresholds::default(),
        }
    }

    /// Block geometry and mask token for a known model architecture
    pub fn for_model(
        architecture: &str,
        algorithm: DllmAlgorithm,
    ) -> std::result::Result<Self, DllmError> {
        match architecture {
            "LLaDA2MoeModelLM" => Ok(Self::new(algorithm, 32, 1, 156895)),
            other => Err(DllmError::UnknownModel(other.to_string())),
        }
    }

    /// Resolve the config from startup arguments.
    ///
    /// Returns `Ok(None)` when no algorithm is selected.
    pub fn from_args(args: &DllmArgs) -> Result<Option<Self>> {
        let Some(name) = args.dllm_algorithm.as_deref() else {
            return Ok(None);
        };

        let algorithm: DllmAlgorithm = name.parse()?;
        let mut config = Self::for_model(&args.architecture, algorithm)?;
        config.max_running_requests = args.max_running_requests.unwrap_or(1);

        if let Some(path) = &args.dllm_algorithm_config {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read algorithm config: {:?}", path))?;
            let algorithm_config: serde_json::Value = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse algorithm config: {:?}", path))?;
            config = config.with_algorithm_config(algorithm_config)?;
        }

        config.validate()?;

        tracing::info!(
            "Resolved dLLM config: algorithm={}, block_size={}, buffer_size={}, mask_token_id={}",
            config.algorithm,
            config.block_size,
            config.buffer_size,
            config.mask_token_id
        );
        Ok(Some(config))
    }

    /// Attach algorithm settings, applying the common overrides they carry
    pub fn with_algorithm_config(mut self, algorithm_config: serde_json::Value) -> Result<Self> {
        if let Some(block_size) = algorithm_config.get("block_size") {
            self.block_size = serde_json::from_value(block_size.clone())
                .context("Invalid block_size in algorithm config")?;
        }

        if let Some(buffer_size) = algorithm_config.get("buffer_size") {
            self.buffer_size = serde_json::from_value(buffer_size.clone())
                .context("Invalid buffer_size in algorithm config")?;
        }

        if let Some(thresholds) = algorithm_config.get(THRESHOLDS_KEY) {
            self.thresholds = serde_json::from_value(thresholds.clone())
                .context("Invalid multi_block_thresholds in algorithm config")?;
        }

        self.algorithm_config = algorithm_config;
        Ok(self)
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> std::result::Result<(), DllmError> {
        if self.block_size == 0 {
            return Err(DllmError::invalid_config("block_size must be positive"));
        }

        if self.buffer_size == 0 {
            return Err(DllmError::invalid_config("buffer_size must be positive"));
        }

        if self.max_running_requests == 0 {
            return Err(DllmError::invalid_config("max_running_requests must be positive"));
        }

        Ok(())
    }

    pub fn is_multi_block(&self) -> bool {
        self.algorithm.is_multi_block()
    }

    /// Load configuration from a file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save_to_file<P: Into<PathBuf>>(&self, path: P) -> Result<()> {
        let path = path.into();
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Builder pattern methods
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_max_running_requests(mut self, max_running_requests: usize) -> Self {
        self.max_running_requests = max_running_requests;
        self
    }

    pub fn with_thresholds(mut self, thresholds: MultiBlockThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("LowConfidence".parse::<DllmAlgorithm>().unwrap(), DllmAlgorithm::LowConfidence);
        assert!("LowConfidenceMultiBlock".parse::<DllmAlgorithm>().unwrap().is_multi_block());
        assert_eq!(
            "Greedy".parse::<DllmAlgorithm>(),
            Err(DllmError::UnknownAlgorithm("Greedy".to_string()))
        );
    }

    #[test]
    fn test_model_defaults() {
        let config =
            DllmConfig::for_model("LLaDA2MoeModelLM", DllmAlgorithm::LowConfidence).unwrap();
        assert_eq!(config.block_size, 32);
        assert_eq!(config.buffer_size, 1);
        assert_eq!(config.mask_token_id, 156895);
        assert_eq!(config.max_running_requests, 1);

        assert!(DllmConfig::for_model("LlamaForCausalLM", DllmAlgorithm::LowConfidence).is_err());
    }

    #[test]
    fn test_from_args_disabled() {
        let args = DllmArgs::default();
        assert!(DllmConfig::from_args(&args).unwrap().is_none());
    }

    #[test]
    fn test_from_args_unknown_algorithm() {
        let args = DllmArgs {
            dllm_algorithm: Some("Beam".to_string()),
            architecture: "LLaDA2MoeModelLM".to_string(),
            ..Default::default()
        };
        let err = DllmConfig::from_args(&args).unwrap_err();
        assert!(err.to_string().contains("Unknown dLLM algorithm"));
    }

    #[test]
    fn test_from_args_with_overrides() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("algo.json");
        std::fs::write(
            &path,
            json!({
                "block_size": 8,
                "buffer_size": 2,
                "multi_block_thresholds": { "add_block_threshold": 0.3 }
            })
            .to_string(),
        )
        .unwrap();

        let args = DllmArgs {
            dllm_algorithm: Some("LowConfidenceMultiBlock".to_string()),
            dllm_algorithm_config: Some(path),
            architecture: "LLaDA2MoeModelLM".to_string(),
            max_running_requests: Some(4),
        };
        let config = DllmConfig::from_args(&args).unwrap().unwrap();

        assert_eq!(config.block_size, 8);
        assert_eq!(config.buffer_size, 2);
        assert_eq!(config.max_running_requests, 4);
        assert_eq!(config.thresholds.add_block_threshold, 0.3);
        assert_eq!(config.thresholds.decoding_threshold, 0.95);
    }

    #[test]
    fn test_validation() {
        let config = DllmConfig::new(DllmAlgorithm::LowConfidence, 4, 1, -1);
        assert!(config.validate().is_ok());
        assert!(config.clone().with_block_size(0).validate().is_err());
        assert!(config.with_buffer_size(0).validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("dllm.json");
        let config = DllmConfig::new(DllmAlgorithm::LowConfidenceMultiBlock, 16, 2, 99)
            .with_max_running_requests(8);

        config.save_to_file(&path).unwrap();
        let loaded = DllmConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
