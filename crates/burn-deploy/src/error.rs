use crate::config::ConfigError;
use crate::dataset::{DatasetError, StoreError};
use crate::engine::InferenceError;
use crate::model::ModelLoadError;
use crate::weights::ResolveError;
use std::any::Any;
use thiserror::Error;

/// Coarse classification of an [`Error`], for callers mapping failures onto their own responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing configuration.
    Config,
    /// A configuration that parses but cannot be used as given.
    Configuration,
    Io,
    ModelLoad,
    /// A collaborator required by the selected mode was not supplied.
    Argument,
    NotFound,
    Decode,
    Inference,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error("Failed to upload `{filename}` (index {index}): {source}")]
    Upload {
        index: usize,
        filename: String,
        #[source]
        source: UploadError,
    },
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Resolve(err) => match err {
                ResolveError::MissingProjectRoot(_) | ResolveError::MissingCompressionSuffix(_) => {
                    ErrorKind::Configuration
                }
                ResolveError::Decompress { .. } => ErrorKind::Io,
            },
            Error::ModelLoad(err) => match err {
                ModelLoadError::MissingSkeleton | ModelLoadError::RequiresFullModel => {
                    ErrorKind::Argument
                }
                ModelLoadError::Read { .. } | ModelLoadError::Write { .. } => ErrorKind::Io,
                ModelLoadError::Record { .. }
                | ModelLoadError::InvalidArtifact { .. }
                | ModelLoadError::Incompatible { .. } => ErrorKind::ModelLoad,
            },
            Error::Dataset(err) => dataset_kind(err),
            Error::Inference(err) => match err {
                InferenceError::Data(err) => dataset_kind(err),
                InferenceError::Forward { .. } | InferenceError::OutputShape { .. } => {
                    ErrorKind::Inference
                }
            },
            Error::Upload { .. } => ErrorKind::Io,
        }
    }
}

fn dataset_kind(err: &DatasetError) -> ErrorKind {
    match err {
        DatasetError::NotFound { .. } => ErrorKind::NotFound,
        DatasetError::Decode { .. } => ErrorKind::Decode,
        DatasetError::Read { .. } | DatasetError::Store { .. } | DatasetError::Folder { .. } => {
            ErrorKind::Io
        }
        DatasetError::EmptyFolder(_) | DatasetError::IndexOutOfBounds { .. } => {
            ErrorKind::Argument
        }
        DatasetError::ShapeMismatch { .. } | DatasetError::WorkerPanicked { .. } => {
            ErrorKind::Inference
        }
    }
}

/// Extracts the message of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
