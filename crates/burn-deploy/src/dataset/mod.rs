//! Input sources normalized behind [`ImageDataset`].
//!
//! Every source decodes lazily: `get(index)` reads and decodes a single item and nothing is
//! cached between calls.

mod database;
mod folder;
mod list;
mod store;

pub use database::DatabaseSource;
pub use folder::FolderSource;
pub use list::{FileBlob, ListSource};
pub use store::{ImageStore, InMemoryImageStore, RecordId, StoreError};

use crate::transform::{ImageTensor, TransformPipeline};
use image::RgbImage;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type DecodedImage = RgbImage;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("Index {index} is out of bounds for a dataset of {len} items")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("Failed to decode image at index {index}: {source}")]
    Decode {
        index: usize,
        #[source]
        source: image::ImageError,
    },
    #[error("Failed to read image at index {index}: {source}")]
    Read {
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("Record {id} (index {index}) does not exist")]
    NotFound { index: usize, id: RecordId },
    #[error("Failed to fetch record {id} (index {index}): {source}")]
    Store {
        index: usize,
        id: RecordId,
        #[source]
        source: StoreError,
    },
    #[error("Failed to list image folder {path}: {source}")]
    Folder {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Image folder {0} contains no .jpg or .png files")]
    EmptyFolder(PathBuf),
    #[error("Item {index} has shape {found:?}, expected {expected:?} like the rest of its batch")]
    ShapeMismatch {
        index: usize,
        expected: [usize; 3],
        found: [usize; 3],
    },
    #[error("Worker decoding index {index} panicked: {message}")]
    WorkerPanicked { index: usize, message: String },
}

impl DatasetError {
    /// Position of the offending item, when the error relates to one.
    pub fn index(&self) -> Option<usize> {
        match self {
            DatasetError::IndexOutOfBounds { index, .. }
            | DatasetError::Decode { index, .. }
            | DatasetError::Read { index, .. }
            | DatasetError::NotFound { index, .. }
            | DatasetError::Store { index, .. }
            | DatasetError::ShapeMismatch { index, .. }
            | DatasetError::WorkerPanicked { index, .. } => Some(*index),
            DatasetError::Folder { .. } | DatasetError::EmptyFolder(_) => None,
        }
    }
}

/// Random access over a finite, ordered set of images.
pub trait ImageDataset: Send + Sync {
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> Result<DecodedImage, DatasetError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_transform(self, pipeline: TransformPipeline) -> TransformedDataset<Self>
    where
        Self: Sized,
    {
        TransformedDataset {
            inner: self,
            pipeline,
        }
    }
}

impl<D: ImageDataset + ?Sized> ImageDataset for &D {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize) -> Result<DecodedImage, DatasetError> {
        (**self).get(index)
    }
}

/// A dataset whose items are already preprocessed into tensors.
#[derive(Debug, Clone)]
pub struct TransformedDataset<D> {
    inner: D,
    pipeline: TransformPipeline,
}

impl<D: ImageDataset> TransformedDataset<D> {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<ImageTensor, DatasetError> {
        self.inner
            .get(index)
            .map(|image| self.pipeline.apply(image))
    }

    pub fn pipeline(&self) -> &TransformPipeline {
        &self.pipeline
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

pub(crate) fn check_bounds(index: usize, len: usize) -> Result<(), DatasetError> {
    if index >= len {
        return Err(DatasetError::IndexOutOfBounds { index, len });
    }
    Ok(())
}

pub(crate) fn decode(index: usize, bytes: &[u8]) -> Result<DecodedImage, DatasetError> {
    image::load_from_memory(bytes)
        .map(|image| image.to_rgb8())
        .map_err(|source| DatasetError::Decode { index, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RED, solid_png};
    use crate::transform::TransformStep;

    #[test]
    fn decode_reports_the_failing_index() {
        let err = decode(7, b"not an image").unwrap_err();

        assert!(matches!(err, DatasetError::Decode { index: 7, .. }));
        assert_eq!(err.index(), Some(7));
    }

    #[test]
    fn transformed_dataset_applies_pipeline() {
        let blobs = vec![FileBlob::from_bytes("red.png", solid_png(RED, 6))];
        let pipeline = TransformPipeline::new(vec![TransformStep::Resize {
            height: 2,
            width: 3,
        }])
        .unwrap();

        let dataset = ListSource::new(&blobs).with_transform(pipeline);
        let tensor = dataset.get(0).unwrap();

        assert_eq!(dataset.len(), 1);
        assert_eq!(tensor.shape, [3, 2, 3]);
        assert_eq!(&tensor.data[..6], &[1.0; 6]);
    }
}
