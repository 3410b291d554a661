use super::{DatasetError, DecodedImage, ImageDataset, check_bounds, decode};
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::{Mutex, PoisonError};

/// An uploaded file: its name and a seekable reader over its bytes.
///
/// Reading the contents never moves the reader: the position found before the read is restored
/// afterwards, so a blob can be decoded, uploaded and decoded again with identical results.
#[derive(Debug)]
pub struct FileBlob<R = Cursor<Vec<u8>>> {
    filename: String,
    reader: Mutex<R>,
}

impl FileBlob {
    pub fn from_bytes(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::new(filename, Cursor::new(bytes))
    }
}

impl<R: Read + Seek> FileBlob<R> {
    pub fn new(filename: impl Into<String>, reader: R) -> Self {
        Self {
            filename: filename.into(),
            reader: Mutex::new(reader),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Reads every byte from the start of the reader.
    pub fn read_contents(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let position = reader.stream_position()?;
        reader.seek(SeekFrom::Start(0))?;
        let mut contents = Vec::new();
        let read = reader.read_to_end(&mut contents);
        reader.seek(SeekFrom::Start(position))?;
        read.map(|_| contents)
    }

    pub fn position(&self) -> io::Result<u64> {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stream_position()
    }

    pub fn into_inner(self) -> R {
        self.reader
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Images from caller-supplied files, in the order given.
#[derive(Debug)]
pub struct ListSource<'a, R = Cursor<Vec<u8>>> {
    blobs: &'a [FileBlob<R>],
}

impl<'a, R> ListSource<'a, R> {
    pub fn new(blobs: &'a [FileBlob<R>]) -> Self {
        Self { blobs }
    }
}

impl<R: Read + Seek + Send> ImageDataset for ListSource<'_, R> {
    fn len(&self) -> usize {
        self.blobs.len()
    }

    fn get(&self, index: usize) -> Result<DecodedImage, DatasetError> {
        check_bounds(index, self.blobs.len())?;
        let blob = &self.blobs[index];
        let bytes = blob
            .read_contents()
            .map_err(|source| DatasetError::Read { index, source })?;
        decode(index, &bytes).inspect_err(|_| {
            log::debug!("Upload `{}` at index {index} is not a valid image", blob.filename)
        })
    }
}
