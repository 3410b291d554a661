use crate::device::DeviceSpec;
use crate::transform::{TransformError, TransformPipeline, TransformStep};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{fs, io};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Unsupported config format for {0} (expected a .toml or .json file)")]
    UnsupportedFormat(PathBuf),
    #[error("Malformed TOML config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Malformed JSON config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("Invalid inference transforms: {0}")]
    Transform(#[from] TransformError),
}

/// How the weight file is turned into a model.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModelOption {
    /// Weights only, loaded into a model skeleton built by the caller.
    StateDict,
    /// A self-describing artifact holding the model config and its weights.
    #[serde(alias = "model")]
    FullModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderParams {
    pub batch_size: usize,
    /// Threads decoding the items of a batch. `0` decodes on the calling thread.
    #[serde(default)]
    pub num_workers: usize,
    /// Accepted for compatibility with training configs, never honoured at inference.
    #[serde(default)]
    pub shuffle: bool,
}

impl LoaderParams {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            num_workers: 0,
            shuffle: false,
        }
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }
}

/// Transform steps per dataset phase. Only the inference phase is consumed; other phases
/// present in a shared training config are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformPhases {
    pub inference: Vec<TransformStep>,
}

/// Deployment settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    pub device: DeviceSpec,
    pub model_option: ModelOption,
    /// May start with (or contain) the `project_root` placeholder segment.
    pub weight_path: String,
    pub compressed: bool,
    pub data_loader: LoaderParams,
    pub transforms: TransformPhases,
}

impl DeployConfig {
    /// Loads a `.toml` or `.json` deployment file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = match extension.as_deref() {
            Some("toml") => Self::from_toml_str(&contents)?,
            Some("json") => Self::from_json_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        log::debug!("Loaded deployment config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.weight_path.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "weight_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.data_loader.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "data_loader.batch_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        self.inference_pipeline()?;
        Ok(())
    }

    pub fn inference_pipeline(&self) -> Result<TransformPipeline, ConfigError> {
        Ok(TransformPipeline::new(self.transforms.inference.clone())?)
    }
}
