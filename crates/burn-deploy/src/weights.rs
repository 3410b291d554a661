use crate::config::DeployConfig;
use flate2::read::GzDecoder;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Path segment standing for the deployment's root directory.
pub const PROJECT_ROOT_PLACEHOLDER: &str = "project_root";
/// Suffix stripped from compressed weight paths once decompressed.
pub const COMPRESSION_SUFFIX: &str = ".gz";

#[derive(thiserror::Error, Debug)]
pub enum ResolveError {
    #[error("Weight path `{0}` uses the `project_root` placeholder but no project root was provided")]
    MissingProjectRoot(String),
    #[error("Compressed weight path {0} does not end with `.gz`")]
    MissingCompressionSuffix(PathBuf),
    #[error("Failed to decompress {path}: {source}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Expands a compressed archive into `target`.
pub trait Decompressor {
    fn decompress(&self, archive: &Path, target: &Path) -> io::Result<()>;
}

/// Gzip decompression. Output goes to `<target>.partial` and is renamed into place once complete.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gunzip;

impl Decompressor for Gunzip {
    fn decompress(&self, archive: &Path, target: &Path) -> io::Result<()> {
        let mut partial = OsString::from(target.as_os_str());
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let mut decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
        let written = File::create(&partial).and_then(|file| {
            let mut output = BufWriter::new(file);
            let size = io::copy(&mut decoder, &mut output)?;
            output.flush()?;
            Ok(size)
        });
        match written {
            Ok(size) => {
                fs::rename(&partial, target)?;
                log::debug!(
                    "Decompressed {} into {} ({size} bytes)",
                    archive.display(),
                    target.display()
                );
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&partial);
                Err(err)
            }
        }
    }
}

/// Turns the configured weight path into a concrete file on disk.
#[derive(Debug, Default, Clone)]
pub struct WeightResolver<D = Gunzip> {
    decompressor: D,
}

impl WeightResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: Decompressor> WeightResolver<D> {
    pub fn with_decompressor(decompressor: D) -> Self {
        Self { decompressor }
    }

    pub fn resolve(
        &self,
        config: &DeployConfig,
        project_root: Option<&Path>,
    ) -> Result<PathBuf, ResolveError> {
        self.resolve_path(&config.weight_path, config.compressed, project_root)
    }

    pub fn resolve_path(
        &self,
        weight_path: &str,
        compressed: bool,
        project_root: Option<&Path>,
    ) -> Result<PathBuf, ResolveError> {
        let path = substitute_project_root(weight_path, project_root)?;
        if !compressed {
            return Ok(path);
        }

        let target = strip_compression_suffix(&path)
            .ok_or_else(|| ResolveError::MissingCompressionSuffix(path.clone()))?;
        log::info!("Decompressing weights {}", path.display());
        self.decompressor
            .decompress(&path, &target)
            .map_err(|source| ResolveError::Decompress {
                path: path.clone(),
                source,
            })?;
        Ok(target)
    }
}

fn substitute_project_root(
    weight_path: &str,
    project_root: Option<&Path>,
) -> Result<PathBuf, ResolveError> {
    let segments: Vec<&str> = weight_path.split('/').collect();
    if !segments.contains(&PROJECT_ROOT_PLACEHOLDER) {
        return Ok(PathBuf::from(weight_path));
    }
    let root =
        project_root.ok_or_else(|| ResolveError::MissingProjectRoot(weight_path.to_string()))?;
    Ok(segments
        .into_iter()
        .filter(|segment| !segment.is_empty() && *segment != PROJECT_ROOT_PLACEHOLDER)
        .fold(root.to_path_buf(), |path, segment| path.join(segment)))
}

fn strip_compression_suffix(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(COMPRESSION_SUFFIX)?;
    if stem.is_empty() {
        return None;
    }
    Some(path.with_file_name(stem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingDecompressor {
        calls: RefCell<Vec<(PathBuf, PathBuf)>>,
    }

    impl Decompressor for &RecordingDecompressor {
        fn decompress(&self, archive: &Path, target: &Path) -> io::Result<()> {
            self.calls
                .borrow_mut()
                .push((archive.to_path_buf(), target.to_path_buf()));
            Ok(())
        }
    }

    #[test]
    fn placeholder_is_replaced_by_project_root() {
        let resolver = WeightResolver::new();

        let path = resolver
            .resolve_path(
                "project_root/weights/model.mpk",
                false,
                Some(Path::new("/app")),
            )
            .unwrap();

        assert_eq!(path, PathBuf::from("/app/weights/model.mpk"));
    }

    #[test]
    fn placeholder_without_project_root_fails() {
        let err = WeightResolver::new()
            .resolve_path("project_root/weights/model.mpk", false, None)
            .unwrap_err();

        assert!(matches!(err, ResolveError::MissingProjectRoot(_)));
    }

    #[test]
    fn plain_paths_are_kept_and_never_decompressed() {
        let recorder = RecordingDecompressor::default();
        let resolver = WeightResolver::with_decompressor(&recorder);

        let path = resolver
            .resolve_path("/models/model.mpk", false, None)
            .unwrap();

        assert_eq!(path, PathBuf::from("/models/model.mpk"));
        assert!(recorder.calls.borrow().is_empty());
    }

    #[test]
    fn compressed_path_is_decompressed_once_and_suffix_stripped() {
        let recorder = RecordingDecompressor::default();
        let resolver = WeightResolver::with_decompressor(&recorder);

        let path = resolver
            .resolve_path("project_root/weights/model.gz", true, Some(Path::new("/app")))
            .unwrap();

        assert_eq!(path, PathBuf::from("/app/weights/model"));
        assert_eq!(
            *recorder.calls.borrow(),
            vec![(
                PathBuf::from("/app/weights/model.gz"),
                PathBuf::from("/app/weights/model")
            )]
        );
    }

    #[test]
    fn compressed_path_without_suffix_is_rejected() {
        let recorder = RecordingDecompressor::default();
        let resolver = WeightResolver::with_decompressor(&recorder);

        let err = resolver
            .resolve_path("/models/model.mpk", true, None)
            .unwrap_err();

        assert!(matches!(err, ResolveError::MissingCompressionSuffix(_)));
        assert!(recorder.calls.borrow().is_empty());
    }

    #[test]
    fn gunzip_writes_the_decompressed_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("model.mpk.gz");
        let mut encoder = GzEncoder::new(File::create(&archive).unwrap(), Compression::fast());
        encoder.write_all(b"weights").unwrap();
        encoder.finish().unwrap();

        let path = WeightResolver::new()
            .resolve_path(archive.to_str().unwrap(), true, None)
            .unwrap();

        assert_eq!(path, dir.path().join("model.mpk"));
        assert_eq!(fs::read(&path).unwrap(), b"weights");
        assert!(!dir.path().join("model.mpk.partial").exists());
    }

    #[test]
    fn missing_archive_is_a_decompression_error() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("model.gz");

        let err = WeightResolver::new()
            .resolve_path(archive.to_str().unwrap(), true, None)
            .unwrap_err();

        assert!(matches!(err, ResolveError::Decompress { .. }));
    }

    #[test]
    fn corrupt_archive_leaves_no_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("model.gz");
        fs::write(&archive, b"definitely not gzip").unwrap();

        let err = WeightResolver::new()
            .resolve_path(archive.to_str().unwrap(), true, None)
            .unwrap_err();

        assert!(matches!(err, ResolveError::Decompress { .. }));
        assert!(!dir.path().join("model").exists());
        assert!(!dir.path().join("model.partial").exists());
    }
}
