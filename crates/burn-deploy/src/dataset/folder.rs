use super::{DatasetError, DecodedImage, ImageDataset, check_bounds, decode};
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 2] = ["jpg", "png"];

/// `.jpg` and `.png` files of a directory, sorted by file name. Subdirectories are not visited.
#[derive(Debug, Clone)]
pub struct FolderSource {
    root: PathBuf,
    entries: Vec<PathBuf>,
}

impl FolderSource {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let root = root.as_ref().to_path_buf();
        let folder_error = |source| DatasetError::Folder {
            path: root.clone(),
            source,
        };

        let mut entries = Vec::new();
        for entry in fs::read_dir(&root).map_err(folder_error)? {
            let entry = entry.map_err(folder_error)?;
            let path = entry.path();
            if path.is_file() && is_image(&path) {
                entries.push(path);
            }
        }
        if entries.is_empty() {
            return Err(DatasetError::EmptyFolder(root));
        }
        entries.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        log::debug!("Found {} images in {}", entries.len(), root.display());

        Ok(Self { root, entries })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

impl ImageDataset for FolderSource {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize) -> Result<DecodedImage, DatasetError> {
        check_bounds(index, self.entries.len())?;
        let bytes =
            fs::read(&self.entries[index]).map_err(|source| DatasetError::Read { index, source })?;
        decode(index, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BLUE, GREEN, RED, solid_png};

    #[test]
    fn lists_images_sorted_case_insensitively_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.PNG"), solid_png(GREEN, 2)).unwrap();
        fs::write(dir.path().join("a.png"), solid_png(RED, 2)).unwrap();
        fs::write(dir.path().join("c.jpg"), solid_png(BLUE, 2)).unwrap();
        fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        fs::create_dir(dir.path().join("nested.png")).unwrap();

        let source = FolderSource::open(dir.path()).unwrap();
        let names: Vec<_> = source
            .entries()
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();

        assert_eq!(names, vec!["a.png", "b.PNG", "c.jpg"]);
        assert_eq!(source.get(1).unwrap().get_pixel(0, 0).0, GREEN);
    }

    #[test]
    fn folder_without_images_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("readme.md"), b"no images").unwrap();

        let err = FolderSource::open(dir.path()).unwrap_err();

        assert!(matches!(err, DatasetError::EmptyFolder(_)));
    }

    #[test]
    fn missing_folder_is_a_folder_error() {
        let dir = tempfile::tempdir().unwrap();

        let err = FolderSource::open(dir.path().join("absent")).unwrap_err();

        assert!(matches!(err, DatasetError::Folder { .. }));
    }

    #[test]
    fn image_removed_after_listing_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        fs::write(&path, solid_png(RED, 2)).unwrap();
        let source = FolderSource::open(dir.path()).unwrap();
        fs::remove_file(&path).unwrap();

        let err = source.get(0).unwrap_err();

        assert!(matches!(err, DatasetError::Read { index: 0, .. }));
    }
}
