use super::{DatasetError, DecodedImage, ImageDataset, ImageStore, RecordId, check_bounds, decode};

/// Images previously uploaded to an [`ImageStore`], fetched by id in the order given.
pub struct DatabaseSource<'a, S: ?Sized> {
    ids: &'a [RecordId],
    store: &'a S,
}

impl<'a, S: ImageStore + ?Sized> DatabaseSource<'a, S> {
    pub fn new(ids: &'a [RecordId], store: &'a S) -> Self {
        Self { ids, store }
    }

    pub fn ids(&self) -> &[RecordId] {
        self.ids
    }
}

impl<S: ImageStore + ?Sized> ImageDataset for DatabaseSource<'_, S> {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn get(&self, index: usize) -> Result<DecodedImage, DatasetError> {
        check_bounds(index, self.ids.len())?;
        let id = self.ids[index];
        let bytes = self
            .store
            .lookup(id)
            .map_err(|source| DatasetError::Store { index, id, source })?
            .ok_or(DatasetError::NotFound { index, id })?;
        decode(index, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{InMemoryImageStore, StoreError};
    use crate::testing::{RED, solid_png};

    struct OfflineStore;

    impl ImageStore for OfflineStore {
        fn lookup(&self, _id: RecordId) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        fn insert(&self, _bytes: Vec<u8>) -> Result<RecordId, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }

    #[test]
    fn fetches_stored_images() {
        let store = InMemoryImageStore::new();
        let id = store.insert(solid_png(RED, 3)).unwrap();
        let ids = [id];

        let image = DatabaseSource::new(&ids, &store).get(0).unwrap();

        assert_eq!(image.get_pixel(0, 0).0, RED);
    }

    #[test]
    fn missing_record_is_not_found_with_its_id() {
        let store = InMemoryImageStore::new();
        store.insert(solid_png(RED, 3)).unwrap();
        let ids = [RecordId(1), RecordId(999)];

        let err = DatabaseSource::new(&ids, &store).get(1).unwrap_err();

        assert!(matches!(
            err,
            DatasetError::NotFound {
                index: 1,
                id: RecordId(999)
            }
        ));
    }

    #[test]
    fn store_failures_are_propagated() {
        let ids = [RecordId(1)];
        let store: &dyn ImageStore = &OfflineStore;

        let err = DatabaseSource::new(&ids, store).get(0).unwrap_err();

        assert!(matches!(err, DatasetError::Store { index: 0, .. }));
    }
}
