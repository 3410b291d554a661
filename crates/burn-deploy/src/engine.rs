use crate::dataset::DatasetError;
use crate::error::panic_message;
use crate::loader::TensorBatch;
use crate::model::{ImageClassifier, ModelHandle};
use burn::prelude::Backend;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Class index predicted for one input.
pub type Prediction = usize;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error(transparent)]
    Data(#[from] DatasetError),
    #[error("Forward pass failed on batch {batch} (items {indices:?}): {message}")]
    Forward {
        batch: usize,
        indices: Range<usize>,
        message: String,
    },
    #[error("Batch {batch} produced logits of shape {found:?}, expected [{expected}, classes]")]
    OutputShape {
        batch: usize,
        expected: usize,
        found: [usize; 2],
    },
}

/// Drives batches through a model and decodes the arg-max class of every item.
pub struct InferenceEngine<'a, B: Backend, M> {
    handle: &'a ModelHandle<B, M>,
}

impl<'a, B, M> InferenceEngine<'a, B, M>
where
    B: Backend,
    M: ImageClassifier<B>,
{
    pub fn new(handle: &'a ModelHandle<B, M>) -> Self {
        if B::ad_enabled() {
            log::warn!(
                "Running inference on an autodiff backend, use `ModelHandle::valid` to skip graph recording"
            );
        }
        Self { handle }
    }

    /// Returns one prediction per item, in batch order. The first failure aborts the run and no
    /// partial predictions are returned.
    pub fn run<I>(&self, batches: I) -> Result<Vec<Prediction>, InferenceError>
    where
        I: IntoIterator<Item = Result<TensorBatch<B>, DatasetError>>,
    {
        let mut predictions = Vec::new();
        for (number, batch) in batches.into_iter().enumerate() {
            let batch = batch?;
            predictions.extend(self.run_batch(number, batch)?);
        }
        log::info!("Predicted {} items", predictions.len());
        Ok(predictions)
    }

    fn run_batch(
        &self,
        number: usize,
        batch: TensorBatch<B>,
    ) -> Result<Vec<Prediction>, InferenceError> {
        let expected = batch.len();
        let images = batch.images.to_device(self.handle.device());
        let model = self.handle.model();

        let logits = panic::catch_unwind(AssertUnwindSafe(|| model.forward(images))).map_err(
            |payload| InferenceError::Forward {
                batch: number,
                indices: batch.indices.clone(),
                message: panic_message(payload.as_ref()),
            },
        )?;

        let found = logits.dims();
        if found[0] != expected || found[1] == 0 {
            return Err(InferenceError::OutputShape {
                batch: number,
                expected,
                found,
            });
        }

        let classes = logits.argmax(1).flatten::<1>(0, 1).into_data();
        log::debug!("Batch {number} (items {:?}) done", batch.indices);
        Ok(classes
            .iter::<i64>()
            .map(|class| class as Prediction)
            .collect())
    }
}
