//! Configuration-driven batch inference for burn image classifiers.
//!
//! The flow mirrors how a trained classifier is served:
//! 1. Load a [`DeployConfig`] from disk and resolve the weight file with a [`WeightResolver`]
//!    (project root substitution, optional gunzip).
//! 2. Produce a [`ModelHandle`] with the [`ModelLoader`], either by loading a state dict into a
//!    caller supplied skeleton or by rebuilding a full model artifact.
//! 3. Wrap one of the [`ImageDataset`] sources (uploaded files, store records or a folder) in a
//!    [`BatchedLoader`] and drive the batches through the [`InferenceEngine`].
//!
//! [`DeployedModel`] bundles these steps behind `deploy` / `predict` / `upload`.
pub mod config;
pub mod dataset;
pub mod deploy;
pub mod device;
pub mod engine;
pub mod error;
pub mod loader;
pub mod model;
pub mod transform;
pub mod weights;

#[cfg(feature = "cli")]
pub mod cli;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, DeployConfig, LoaderParams, ModelOption, TransformPhases};
pub use dataset::{
    DatabaseSource, DatasetError, DecodedImage, FileBlob, FolderSource, ImageDataset, ImageStore,
    InMemoryImageStore, ListSource, RecordId, StoreError, TransformedDataset,
};
pub use deploy::{DeployedModel, InputSource, PredictInput, upload};
pub use device::{DeviceBinding, DeviceProvider, DeviceSpec, ParseDeviceError, probe_device};
pub use engine::{InferenceEngine, InferenceError, Prediction};
pub use error::{Error, ErrorKind, UploadError};
pub use loader::{BatchIter, BatchedLoader, TensorBatch};
pub use model::{
    FullModel, ImageClassifier, ModelHandle, ModelLoadError, ModelLoader, save_full_model,
    save_state_dict,
};
pub use transform::{ImageTensor, TransformError, TransformPipeline, TransformStep};
pub use weights::{Decompressor, Gunzip, ResolveError, WeightResolver};
