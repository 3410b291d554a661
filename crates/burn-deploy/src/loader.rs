use crate::config::LoaderParams;
use crate::dataset::{DatasetError, ImageDataset, TransformedDataset};
use crate::error::panic_message;
use crate::transform::ImageTensor;
use burn::prelude::{Backend, Tensor};
use burn::tensor::TensorData;
use std::ops::Range;
use std::thread;

/// A device tensor of `[batch, channels, height, width]` and the dataset indices it holds.
#[derive(Debug, Clone)]
pub struct TensorBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub indices: Range<usize>,
}

impl<B: Backend> TensorBatch<B> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Splits a transformed dataset into consecutive fixed-size batches, preserving dataset order.
///
/// Batches are assembled lazily when the iterator is advanced. With `num_workers > 0`, the items
/// of one batch are decoded on scoped threads and reassembled by index, so the result is the same
/// as decoding them on the calling thread.
pub struct BatchedLoader<B: Backend, D> {
    dataset: TransformedDataset<D>,
    batch_size: usize,
    num_workers: usize,
    device: B::Device,
}

impl<B: Backend, D: ImageDataset> BatchedLoader<B, D> {
    pub fn new(dataset: TransformedDataset<D>, params: &LoaderParams, device: B::Device) -> Self {
        if params.shuffle {
            log::warn!("Ignoring `shuffle = true`, inference batches always keep input order");
        }
        Self {
            dataset,
            batch_size: params.batch_size.max(1),
            num_workers: params.num_workers,
            device,
        }
    }

    pub fn num_items(&self) -> usize {
        self.dataset.len()
    }

    pub fn num_batches(&self) -> usize {
        self.num_items().div_ceil(self.batch_size)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn iter(&self) -> BatchIter<'_, B, D> {
        BatchIter {
            loader: self,
            next: 0,
        }
    }

    fn load_batch(&self, indices: Range<usize>) -> Result<TensorBatch<B>, DatasetError> {
        let items = if self.num_workers == 0 || indices.len() == 1 {
            indices
                .clone()
                .map(|index| self.dataset.get(index))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            self.load_parallel(indices.clone())?
        };

        let Some(first) = items.first() else {
            return Err(DatasetError::IndexOutOfBounds {
                index: indices.start,
                len: self.num_items(),
            });
        };
        let expected = first.shape;
        let mut data = Vec::with_capacity(items.len() * first.data.len());
        for (offset, item) in items.into_iter().enumerate() {
            if item.shape != expected {
                return Err(DatasetError::ShapeMismatch {
                    index: indices.start + offset,
                    expected,
                    found: item.shape,
                });
            }
            data.extend(item.data);
        }

        let [channels, height, width] = expected;
        let data = TensorData::new(data, [indices.len(), channels, height, width]);
        log::debug!(
            "Assembled batch {:?} of shape {:?}",
            indices,
            data.shape
        );
        Ok(TensorBatch {
            images: Tensor::from_data(data, &self.device),
            indices,
        })
    }

    fn load_parallel(&self, indices: Range<usize>) -> Result<Vec<ImageTensor>, DatasetError> {
        let workers = self.num_workers.min(indices.len());
        let (sender, receiver) = crossbeam::channel::unbounded();
        let dataset = &self.dataset;

        let panics: Vec<(usize, String)> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let sender = sender.clone();
                    let assigned = indices.clone().skip(worker).step_by(workers);
                    scope.spawn(move || {
                        for index in assigned {
                            let item = dataset.get(index);
                            let failed = item.is_err();
                            if sender.send((index, item)).is_err() || failed {
                                break;
                            }
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .filter_map(|(worker, handle)| {
                    handle
                        .join()
                        .err()
                        .map(|payload| (worker, panic_message(payload.as_ref())))
                })
                .collect()
        });
        drop(sender);

        let mut slots: Vec<Option<ImageTensor>> = indices.clone().map(|_| None).collect();
        let mut failure: Option<DatasetError> = None;
        let mut keep_lowest = |err: DatasetError| {
            let replace = match (&failure, err.index()) {
                (None, _) => true,
                (Some(current), Some(index)) => current.index().is_none_or(|c| index < c),
                (Some(_), None) => false,
            };
            if replace {
                failure = Some(err);
            }
        };

        for (index, item) in receiver.try_iter() {
            match item {
                Ok(tensor) => slots[index - indices.start] = Some(tensor),
                Err(err) => keep_lowest(err),
            }
        }
        for (worker, message) in panics {
            // A worker reports its items in order, so the first unfilled slot is where it stopped.
            let stopped_at = indices
                .clone()
                .skip(worker)
                .step_by(workers)
                .find(|index| slots[index - indices.start].is_none());
            if let Some(index) = stopped_at {
                keep_lowest(DatasetError::WorkerPanicked { index, message });
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }

        slots
            .into_iter()
            .zip(indices.clone())
            .map(|(slot, index)| {
                slot.ok_or(DatasetError::WorkerPanicked {
                    index,
                    message: "worker exited without reporting the item".to_string(),
                })
            })
            .collect()
    }
}

/// Lazy iterator over the batches of a [`BatchedLoader`].
pub struct BatchIter<'l, B: Backend, D> {
    loader: &'l BatchedLoader<B, D>,
    next: usize,
}

impl<B: Backend, D: ImageDataset> Iterator for BatchIter<'_, B, D> {
    type Item = Result<TensorBatch<B>, DatasetError>;

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.loader.num_items();
        if self.next >= len {
            return None;
        }
        let end = (self.next + self.loader.batch_size).min(len);
        let indices = self.next..end;
        self.next = end;
        Some(self.loader.load_batch(indices))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self
            .loader
            .num_items()
            .saturating_sub(self.next)
            .div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}

impl<B: Backend, D: ImageDataset> ExactSizeIterator for BatchIter<'_, B, D> {}

impl<'l, B: Backend, D: ImageDataset> IntoIterator for &'l BatchedLoader<B, D> {
    type Item = Result<TensorBatch<B>, DatasetError>;
    type IntoIter = BatchIter<'l, B, D>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
