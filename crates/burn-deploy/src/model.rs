use crate::config::{DeployConfig, ModelOption};
use crate::device::{DeviceBinding, DeviceProvider, DeviceSpec};
use crate::error::panic_message;
use burn::module::{AutodiffModule, ModuleVisitor, Param};
use burn::prelude::{Backend, Module, Tensor};
use burn::record::{FullPrecisionSettings, NamedMpkBytesRecorder, Recorder, RecorderError};
use burn::tensor::backend::AutodiffBackend;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the model config inside a full model artifact.
pub const ARTIFACT_CONFIG_ENTRY: &str = "config.json";
/// Name of the weight record inside a full model artifact.
pub const ARTIFACT_WEIGHTS_ENTRY: &str = "weights.mpk";

type WeightsRecorder = NamedMpkBytesRecorder<FullPrecisionSettings>;

/// A classifier over `[batch, channels, height, width]` images.
pub trait ImageClassifier<B: Backend>: Module<B> {
    /// Returns `[batch, classes]` logits.
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// A classifier that can be rebuilt from its own serialized config, which is what a full model
/// artifact stores next to the weights.
pub trait FullModel<B: Backend>: ImageClassifier<B> {
    type Config: Serialize + DeserializeOwned;

    fn from_config(config: &Self::Config, device: &B::Device) -> Self;
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("Model option `state_dict` requires a model skeleton to load the weights into")]
    MissingSkeleton,
    #[error("Model option `full_model` needs a model type that can be rebuilt from its config")]
    RequiresFullModel,
    #[error("Failed to read model file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write model file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to decode weights from {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: RecorderError,
    },
    #[error("Model artifact {path} is invalid: {reason}")]
    InvalidArtifact { path: PathBuf, reason: String },
    #[error("Weights from {path} do not match the model: {reason}")]
    Incompatible { path: PathBuf, reason: String },
}

/// A loaded model bound to its device.
///
/// Forward passes only need `&self`; rebinding needs `&mut self`, so the borrow checker keeps it
/// from overlapping an inference call on the same handle.
#[derive(Debug)]
pub struct ModelHandle<B: Backend, M> {
    model: M,
    binding: DeviceBinding<B>,
}

impl<B: Backend, M: Module<B>> ModelHandle<B, M> {
    pub fn new(model: M, binding: DeviceBinding<B>) -> Self {
        let model = model.to_device(&binding.device);
        Self { model, binding }
    }

    pub fn on_device(model: M, device: B::Device) -> Self {
        Self::new(model, DeviceBinding::exact(device))
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn device(&self) -> &B::Device {
        &self.binding.device
    }

    pub fn binding(&self) -> &DeviceBinding<B> {
        &self.binding
    }

    /// Whether an unavailable accelerator was replaced by the CPU at load time.
    pub fn fell_back_to_cpu(&self) -> bool {
        self.binding.fell_back
    }

    pub fn rebind(&mut self, device: B::Device) {
        self.model = self.model.clone().to_device(&device);
        self.binding = DeviceBinding::exact(device);
    }

    pub fn into_model(self) -> M {
        self.model
    }
}

impl<B, M> ModelHandle<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    /// Drops the autodiff wrapper so inference records no graph and training-only layers stay
    /// inert.
    pub fn valid(self) -> ModelHandle<B::InnerBackend, M::InnerModule> {
        let binding = DeviceBinding {
            requested: self.binding.requested,
            device: self.binding.device,
            fell_back: self.binding.fell_back,
        };
        ModelHandle {
            model: self.model.valid(),
            binding,
        }
    }
}

/// Builds [`ModelHandle`]s according to the configured [`ModelOption`] and device.
#[derive(Debug, Clone)]
pub struct ModelLoader<B> {
    option: ModelOption,
    device: DeviceSpec,
    _backend: PhantomData<B>,
}

impl<B: DeviceProvider> ModelLoader<B> {
    pub fn new(option: ModelOption, device: DeviceSpec) -> Self {
        Self {
            option,
            device,
            _backend: PhantomData,
        }
    }

    pub fn from_config(config: &DeployConfig) -> Self {
        Self::new(config.model_option, config.device)
    }

    pub fn option(&self) -> ModelOption {
        self.option
    }

    /// Loads `path` according to the configured option.
    ///
    /// `state_dict` requires `skeleton`; `full_model` ignores it.
    pub fn load<M: FullModel<B>>(
        &self,
        skeleton: Option<M>,
        path: &Path,
    ) -> Result<ModelHandle<B, M>, ModelLoadError> {
        match self.option {
            ModelOption::StateDict => {
                let skeleton = skeleton.ok_or(ModelLoadError::MissingSkeleton)?;
                self.load_state_dict(skeleton, path)
            }
            ModelOption::FullModel => {
                if skeleton.is_some() {
                    log::debug!("Ignoring the model skeleton, `full_model` rebuilds it");
                }
                self.load_full_model(path)
            }
        }
    }

    /// Loads `path` into `skeleton`, for models that cannot be rebuilt from a config.
    ///
    /// Only `state_dict` applies; `full_model` is rejected with
    /// [`ModelLoadError::RequiresFullModel`].
    pub fn load_into<M: Module<B>>(
        &self,
        skeleton: M,
        path: &Path,
    ) -> Result<ModelHandle<B, M>, ModelLoadError> {
        match self.option {
            ModelOption::StateDict => self.load_state_dict(skeleton, path),
            ModelOption::FullModel => Err(ModelLoadError::RequiresFullModel),
        }
    }

    pub fn load_state_dict<M: Module<B>>(
        &self,
        skeleton: M,
        path: &Path,
    ) -> Result<ModelHandle<B, M>, ModelLoadError> {
        let binding = DeviceBinding::<B>::select(self.device);
        let bytes = fs::read(path).map_err(|source| ModelLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let model = apply_weights(skeleton.to_device(&binding.device), bytes, path, &binding.device)?;
        log::info!(
            "Loaded state dict {} ({} parameters)",
            path.display(),
            model.num_params()
        );
        Ok(ModelHandle::new(model, binding))
    }

    pub fn load_full_model<M: FullModel<B>>(
        &self,
        path: &Path,
    ) -> Result<ModelHandle<B, M>, ModelLoadError> {
        let binding = DeviceBinding::<B>::select(self.device);
        let (config, weights) = read_artifact(path)?;
        let config: M::Config =
            serde_json::from_slice(&config).map_err(|err| ModelLoadError::InvalidArtifact {
                path: path.to_path_buf(),
                reason: format!("config entry cannot be parsed: {err}"),
            })?;
        let model = M::from_config(&config, &binding.device);
        let model = apply_weights(model, weights, path, &binding.device)?;
        log::info!(
            "Loaded full model {} ({} parameters)",
            path.display(),
            model.num_params()
        );
        Ok(ModelHandle::new(model, binding))
    }
}

/// Float parameter shapes of a module, keyed by their dotted field path.
#[derive(Default)]
struct ParamShapes {
    path: Vec<String>,
    shapes: Vec<(String, Vec<usize>)>,
}

impl ParamShapes {
    fn collect<B: Backend, M: Module<B>>(model: &M) -> Vec<(String, Vec<usize>)> {
        let mut visitor = Self::default();
        model.visit(&mut visitor);
        visitor.shapes
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamShapes {
    fn enter_module(&mut self, name: &str, _container_type: &str) {
        self.path.push(name.to_string());
    }

    fn exit_module(&mut self, _name: &str, _container_type: &str) {
        self.path.pop();
    }

    fn visit_float<const D: usize>(&mut self, param: &Param<Tensor<B, D>>) {
        self.shapes.push((self.path.join("."), param.lazy_shape().dims));
    }
}

/// Describes the first parameter whose shape differs between the skeleton and the loaded model.
fn shape_mismatch(
    expected: &[(String, Vec<usize>)],
    found: &[(String, Vec<usize>)],
) -> Option<String> {
    if expected.len() != found.len() {
        return Some(format!(
            "expected {} parameter tensors, the weights hold {}",
            expected.len(),
            found.len()
        ));
    }
    expected
        .iter()
        .zip(found)
        .find(|(expected, found)| expected != found)
        .map(|((name, expected), (_, found))| {
            format!("parameter `{name}` expects shape {expected:?}, the weights hold {found:?}")
        })
}

fn apply_weights<B: Backend, M: Module<B>>(
    model: M,
    bytes: Vec<u8>,
    path: &Path,
    device: &B::Device,
) -> Result<M, ModelLoadError> {
    let expected = ParamShapes::collect::<B, M>(&model);
    let record = <WeightsRecorder as Recorder<B>>::load(&WeightsRecorder::default(), bytes, device)
        .map_err(|source| ModelLoadError::Record {
            path: path.to_path_buf(),
            source,
        })?;
    let model = panic::catch_unwind(AssertUnwindSafe(|| model.load_record(record))).map_err(
        |payload| ModelLoadError::Incompatible {
            path: path.to_path_buf(),
            reason: panic_message(payload.as_ref()),
        },
    )?;
    let found = ParamShapes::collect::<B, M>(&model);
    if let Some(reason) = shape_mismatch(&expected, &found) {
        return Err(ModelLoadError::Incompatible {
            path: path.to_path_buf(),
            reason,
        });
    }
    Ok(model)
}

fn read_artifact(path: &Path) -> Result<(Vec<u8>, Vec<u8>), ModelLoadError> {
    let invalid = |reason: String| ModelLoadError::InvalidArtifact {
        path: path.to_path_buf(),
        reason,
    };
    let file = File::open(path).map_err(|source| ModelLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut config = None;
    let mut weights = None;
    let entries = archive
        .entries()
        .map_err(|err| invalid(format!("not a model archive: {err}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|err| invalid(format!("corrupt entry: {err}")))?;
        let name = entry
            .path()
            .map_err(|err| invalid(format!("corrupt entry name: {err}")))?
            .to_string_lossy()
            .into_owned();
        let slot = match name.as_str() {
            ARTIFACT_CONFIG_ENTRY => &mut config,
            ARTIFACT_WEIGHTS_ENTRY => &mut weights,
            _ => continue,
        };
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|err| invalid(format!("cannot read `{name}`: {err}")))?;
        *slot = Some(contents);
    }

    let config = config.ok_or_else(|| invalid(format!("missing `{ARTIFACT_CONFIG_ENTRY}`")))?;
    let weights = weights.ok_or_else(|| invalid(format!("missing `{ARTIFACT_WEIGHTS_ENTRY}`")))?;
    Ok((config, weights))
}

/// Writes the weights of `model` in the format `state_dict` loading expects.
pub fn save_state_dict<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
) -> Result<(), ModelLoadError> {
    let bytes = record_bytes::<B, M>(model, path)?;
    fs::write(path, bytes).map_err(|source| ModelLoadError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes `model` and its config as a full model artifact.
pub fn save_full_model<B: Backend, M: FullModel<B>>(
    model: M,
    config: &M::Config,
    path: &Path,
) -> Result<(), ModelLoadError> {
    let config = serde_json::to_vec_pretty(config).map_err(|err| ModelLoadError::InvalidArtifact {
        path: path.to_path_buf(),
        reason: format!("config cannot be serialized: {err}"),
    })?;
    let weights = record_bytes::<B, M>(model, path)?;

    let write = || -> io::Result<()> {
        let mut builder = tar::Builder::new(BufWriter::new(File::create(path)?));
        for (name, contents) in [
            (ARTIFACT_CONFIG_ENTRY, &config),
            (ARTIFACT_WEIGHTS_ENTRY, &weights),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::file());
            header.set_mode(0o644);
            header.set_size(contents.len() as u64);
            // use something nonzero to avoid rust-lang/cargo#9512
            header.set_mtime(1);
            header.set_cksum();
            builder.append_data(&mut header, name, contents.as_slice())?;
        }
        builder.into_inner()?.flush()
    };
    write().map_err(|source| ModelLoadError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn record_bytes<B: Backend, M: Module<B>>(model: M, path: &Path) -> Result<Vec<u8>, ModelLoadError> {
    <WeightsRecorder as Recorder<B>>::record(&WeightsRecorder::default(), model.into_record(), ())
        .map_err(|source| ModelLoadError::Record {
            path: path.to_path_buf(),
            source,
        })
}
