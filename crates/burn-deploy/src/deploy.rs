use crate::config::{DeployConfig, ModelOption};
use crate::dataset::{
    DatabaseSource, FileBlob, FolderSource, ImageDataset, ImageStore, ListSource, RecordId,
};
use crate::device::DeviceProvider;
use crate::engine::{InferenceEngine, Prediction};
use crate::error::{Error, UploadError};
use crate::loader::BatchedLoader;
use crate::model::{FullModel, ImageClassifier, ModelHandle, ModelLoadError, ModelLoader};
use crate::transform::TransformPipeline;
use crate::weights::WeightResolver;
use burn::prelude::Backend;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

/// Which kind of source a prediction request reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum InputSource {
    List,
    Database,
    Folder,
}

/// The inputs of one prediction request.
pub enum PredictInput<'a, R = Cursor<Vec<u8>>> {
    /// Files uploaded with the request.
    List(&'a [FileBlob<R>]),
    /// Images previously stored with [`upload`].
    Database {
        ids: &'a [RecordId],
        store: &'a dyn ImageStore,
    },
    /// A directory of `.jpg` / `.png` files.
    Folder(&'a Path),
}

impl<'a> PredictInput<'a> {
    /// Reads `ids` from `store`, in the order given.
    pub fn database(ids: &'a [RecordId], store: &'a dyn ImageStore) -> Self {
        PredictInput::Database { ids, store }
    }

    /// Reads every `.jpg` / `.png` file of `path`, ordered by file name.
    pub fn folder(path: &'a Path) -> Self {
        PredictInput::Folder(path)
    }
}

impl<'a, R> PredictInput<'a, R> {
    pub fn list(blobs: &'a [FileBlob<R>]) -> Self {
        PredictInput::List(blobs)
    }

    pub fn source(&self) -> InputSource {
        match self {
            PredictInput::List(_) => InputSource::List,
            PredictInput::Database { .. } => InputSource::Database,
            PredictInput::Folder(_) => InputSource::Folder,
        }
    }
}

/// A model loaded from a deployment config, ready to serve predictions.
#[derive(Debug)]
pub struct DeployedModel<B: Backend, M> {
    config: DeployConfig,
    handle: ModelHandle<B, M>,
    pipeline: TransformPipeline,
}

impl<B, M> DeployedModel<B, M>
where
    B: DeviceProvider,
    M: FullModel<B>,
{
    /// Loads the config at `config_path`, resolves the weights and loads the model.
    ///
    /// `skeleton` is required when the config selects `state_dict` and ignored for `full_model`.
    /// Models without a config of their own go through [`DeployedModel::deploy_state_dict`].
    pub fn deploy(
        config_path: impl AsRef<Path>,
        project_root: Option<&Path>,
        skeleton: Option<M>,
    ) -> Result<Self, Error> {
        let config = DeployConfig::load(config_path)?;
        Self::from_config(config, project_root, skeleton)
    }

    pub fn from_config(
        config: DeployConfig,
        project_root: Option<&Path>,
        skeleton: Option<M>,
    ) -> Result<Self, Error> {
        let weights = WeightResolver::new().resolve(&config, project_root)?;
        let handle = ModelLoader::<B>::from_config(&config).load(skeleton, &weights)?;
        log::info!(
            "Deployed {} model from {} on {:?}",
            config.model_option,
            weights.display(),
            handle.device()
        );
        Self::new(config, handle)
    }
}

impl<B, M> DeployedModel<B, M>
where
    B: DeviceProvider,
    M: ImageClassifier<B>,
{
    /// Like [`DeployedModel::deploy`], for a model that only exists as `skeleton`.
    ///
    /// The config must select `state_dict`.
    pub fn deploy_state_dict(
        config_path: impl AsRef<Path>,
        project_root: Option<&Path>,
        skeleton: M,
    ) -> Result<Self, Error> {
        let config = DeployConfig::load(config_path)?;
        Self::from_config_state_dict(config, project_root, skeleton)
    }

    pub fn from_config_state_dict(
        config: DeployConfig,
        project_root: Option<&Path>,
        skeleton: M,
    ) -> Result<Self, Error> {
        if config.model_option != ModelOption::StateDict {
            return Err(ModelLoadError::RequiresFullModel.into());
        }
        let weights = WeightResolver::new().resolve(&config, project_root)?;
        let handle = ModelLoader::<B>::from_config(&config).load_into(skeleton, &weights)?;
        log::info!(
            "Deployed {} model from {} on {:?}",
            config.model_option,
            weights.display(),
            handle.device()
        );
        Self::new(config, handle)
    }
}

impl<B, M> DeployedModel<B, M>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    /// Serves an already loaded model with the loader and transform settings of `config`.
    pub fn new(config: DeployConfig, handle: ModelHandle<B, M>) -> Result<Self, Error> {
        let pipeline = config.inference_pipeline()?;
        Ok(Self {
            config,
            handle,
            pipeline,
        })
    }

    /// Returns one class index per input, in input order.
    pub fn predict<R>(&self, input: PredictInput<'_, R>) -> Result<Vec<Prediction>, Error>
    where
        R: Read + Seek + Send,
    {
        log::info!("Predicting from {} input", input.source());
        match input {
            PredictInput::List(blobs) => self.predict_dataset(&ListSource::new(blobs)),
            PredictInput::Database { ids, store } => {
                self.predict_dataset(&DatabaseSource::new(ids, store))
            }
            PredictInput::Folder(path) => self.predict_dataset(&FolderSource::open(path)?),
        }
    }

    pub fn predict_dataset<D: ImageDataset + ?Sized>(
        &self,
        dataset: &D,
    ) -> Result<Vec<Prediction>, Error> {
        let loader = BatchedLoader::<B, _>::new(
            ImageDataset::with_transform(dataset, self.pipeline.clone()),
            &self.config.data_loader,
            self.handle.device().clone(),
        );
        log::debug!(
            "Running {} items in {} batches",
            loader.num_items(),
            loader.num_batches()
        );
        Ok(InferenceEngine::new(&self.handle).run(&loader)?)
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn handle(&self) -> &ModelHandle<B, M> {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut ModelHandle<B, M> {
        &mut self.handle
    }

    pub fn into_handle(self) -> ModelHandle<B, M> {
        self.handle
    }
}

/// Stores the bytes of every blob, in order, and returns their new ids.
///
/// Blob readers are left where they were, so the same blobs can still be passed to
/// [`PredictInput::List`].
pub fn upload<S, R>(store: &S, blobs: &[FileBlob<R>]) -> Result<Vec<RecordId>, Error>
where
    S: ImageStore + ?Sized,
    R: Read + Seek,
{
    let mut ids = Vec::with_capacity(blobs.len());
    for (index, blob) in blobs.iter().enumerate() {
        let upload_error = |source: UploadError| Error::Upload {
            index,
            filename: blob.filename().to_string(),
            source,
        };
        let bytes = blob
            .read_contents()
            .map_err(|err| upload_error(err.into()))?;
        let id = store
            .insert(bytes)
            .map_err(|err| upload_error(err.into()))?;
        log::debug!("Stored `{}` as record {id}", blob.filename());
        ids.push(id);
    }
    log::info!("Uploaded {} images", ids.len());
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{InMemoryImageStore, StoreError};
    use crate::testing::{GREEN, RED, solid_png};

    struct ReadOnlyStore;

    impl ImageStore for ReadOnlyStore {
        fn lookup(&self, _id: RecordId) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(None)
        }

        fn insert(&self, _bytes: Vec<u8>) -> Result<RecordId, StoreError> {
            Err(StoreError::Rejected("read-only replica".to_string()))
        }
    }

    #[test]
    fn input_source_names() {
        let blobs: Vec<FileBlob> = Vec::new();

        let store = InMemoryImageStore::new();

        assert_eq!(PredictInput::list(&blobs).source().to_string(), "list");
        assert_eq!(
            PredictInput::folder(Path::new("/images")).source(),
            InputSource::Folder
        );
        assert_eq!(
            PredictInput::database(&[RecordId(1)], &store).source(),
            InputSource::Database
        );
        assert_eq!("database".parse::<InputSource>().unwrap(), InputSource::Database);
    }

    #[test]
    fn upload_stores_blobs_in_order_without_moving_readers() {
        let store = InMemoryImageStore::new();
        let blobs = vec![
            FileBlob::from_bytes("red.png", solid_png(RED, 2)),
            FileBlob::from_bytes("green.png", solid_png(GREEN, 2)),
        ];

        let ids = upload(&store, &blobs).unwrap();

        assert_eq!(ids, vec![RecordId(1), RecordId(2)]);
        assert_eq!(store.lookup(RecordId(2)).unwrap(), Some(solid_png(GREEN, 2)));
        assert_eq!(blobs[0].position().unwrap(), 0);
    }

    #[test]
    fn upload_failure_names_the_file() {
        let blobs = vec![FileBlob::from_bytes("red.png", solid_png(RED, 2))];

        let err = upload(&ReadOnlyStore, &blobs).unwrap_err();

        assert!(
            matches!(&err, Error::Upload { index: 0, filename, .. } if filename == "red.png"),
            "{err}"
        );
    }
}
