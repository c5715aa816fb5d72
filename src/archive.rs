//! Archive creation and extraction
//!
//! Matched files are packed into a tar stream compressed with zstd. The stream
//! is spooled to a temporary file so the length header can be sent before the
//! payload; the spool file is removed as soon as the blob has been read back,
//! whether packing succeeded or not.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use tar::{Archive, Builder};

use crate::error::{Error, Result};

/// Default zstd level (balance of speed and ratio)
pub const DEFAULT_LEVEL: i32 = 3;

/// An encoded archive held in memory for one response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveBlob {
    bytes: Vec<u8>,
}

impl ArchiveBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Zero-length blob meaning "no matches"
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Packs an explicit list of files into one archive.
///
/// Membership is exactly `paths`. A path that cannot be read aborts the whole
/// archive with [`Error::ArchiveCreation`]; nothing is skipped silently.
pub trait Archiver: Send + Sync {
    fn create_archive(&self, paths: &[PathBuf]) -> Result<ArchiveBlob>;
}

/// tar + zstd archiver spooling through a temporary file
#[derive(Debug, Clone)]
pub struct TarZstdArchiver {
    /// Entry names are stored relative to this directory
    root: PathBuf,
    spool_dir: PathBuf,
    level: i32,
}

impl TarZstdArchiver {
    pub fn new(root: impl Into<PathBuf>, spool_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            spool_dir: spool_dir.into(),
            level: DEFAULT_LEVEL,
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Name of `path` inside the archive: relative to the root when under it,
    /// otherwise the path with its root/prefix components dropped
    fn entry_name(&self, path: &Path) -> PathBuf {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl Archiver for TarZstdArchiver {
    fn create_archive(&self, paths: &[PathBuf]) -> Result<ArchiveBlob> {
        if paths.is_empty() {
            return Ok(ArchiveBlob::empty());
        }

        let spool_err = |source| Error::ArchiveCreation {
            path: self.spool_dir.clone(),
            source,
        };
        let spool = tempfile::Builder::new()
            .prefix("treefetch-")
            .suffix(".tar.zst")
            .tempfile_in(&self.spool_dir)
            .map_err(spool_err)?;

        {
            let mut encoder = zstd::Encoder::new(spool.as_file(), self.level).map_err(spool_err)?;
            encoder.include_checksum(true).map_err(spool_err)?;
            let mut builder = Builder::new(encoder);
            for path in paths {
                let name = self.entry_name(path);
                builder
                    .append_path_with_name(path, &name)
                    .map_err(|source| Error::ArchiveCreation {
                        path: path.clone(),
                        source,
                    })?;
            }
            let encoder = builder.into_inner().map_err(spool_err)?;
            encoder.finish().map_err(spool_err)?;
        }

        let bytes = fs::read(spool.path()).map_err(spool_err)?;
        // `spool` drops here and removes the file
        Ok(ArchiveBlob::new(bytes))
    }
}

/// Extract a received archive into `dest`, returning the number of entries written.
///
/// Every failure is reported as [`Error::Extraction`] naming `archive_path`.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<u64> {
    let extraction = |source| Error::Extraction {
        path: archive_path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dest).map_err(extraction)?;
    let file = File::open(archive_path).map_err(extraction)?;
    let decoder = zstd::Decoder::new(file).map_err(extraction)?;
    let mut archive = Archive::new(decoder);

    let mut count = 0u64;
    for entry in archive.entries().map_err(extraction)? {
        let mut entry = entry.map_err(extraction)?;
        // unpack_in refuses names escaping `dest`
        if entry.unpack_in(dest).map_err(extraction)? {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spool_is_empty(dir: &Path) -> bool {
        fs::read_dir(dir).unwrap().next().is_none()
    }

    #[test]
    fn round_trip_reproduces_contents_and_names() {
        let home = TempDir::new().unwrap();
        let spool = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::create_dir_all(home.path().join("docs")).unwrap();
        fs::write(home.path().join("x.txt"), b"hello").unwrap();
        fs::write(home.path().join("docs/y.bin"), vec![7u8; 4096]).unwrap();

        let archiver = TarZstdArchiver::new(home.path(), spool.path());
        let paths = vec![home.path().join("x.txt"), home.path().join("docs/y.bin")];
        let blob = archiver.create_archive(&paths).unwrap();
        assert!(!blob.is_empty());
        assert!(spool_is_empty(spool.path()));

        let local = out.path().join("received.tar.zst");
        fs::write(&local, blob.as_bytes()).unwrap();
        let extracted = out.path().join("extract");
        assert_eq!(unpack_archive(&local, &extracted).unwrap(), 2);
        assert_eq!(fs::read(extracted.join("x.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(extracted.join("docs/y.bin")).unwrap(), vec![7u8; 4096]);
    }

    #[test]
    fn membership_is_exactly_the_given_paths() {
        let home = TempDir::new().unwrap();
        let spool = TempDir::new().unwrap();
        fs::write(home.path().join("keep.txt"), b"k").unwrap();
        fs::write(home.path().join("other.txt"), b"o").unwrap();

        let blob = TarZstdArchiver::new(home.path(), spool.path())
            .create_archive(&[home.path().join("keep.txt")])
            .unwrap();
        let decoder = zstd::Decoder::new(blob.as_bytes()).unwrap();
        let mut archive = Archive::new(decoder);
        let names: Vec<PathBuf> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().into_owned())
            .collect();
        assert_eq!(names, vec![PathBuf::from("keep.txt")]);
    }

    #[test]
    fn missing_file_aborts_whole_archive_and_cleans_spool() {
        let home = TempDir::new().unwrap();
        let spool = TempDir::new().unwrap();
        fs::write(home.path().join("present.txt"), b"p").unwrap();
        let missing = home.path().join("vanished.txt");

        let err = TarZstdArchiver::new(home.path(), spool.path())
            .create_archive(&[home.path().join("present.txt"), missing.clone()])
            .unwrap_err();
        match err {
            Error::ArchiveCreation { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(spool_is_empty(spool.path()));
    }

    #[test]
    fn unpack_failure_names_the_archive() {
        let out = TempDir::new().unwrap();
        let bogus = out.path().join("temp.tar.zst");
        fs::write(&bogus, b"definitely not zstd").unwrap();
        match unpack_archive(&bogus, &out.path().join("extract")) {
            Err(Error::Extraction { path, .. }) => assert_eq!(path, bogus),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn no_paths_means_empty_blob() {
        let spool = TempDir::new().unwrap();
        let blob = TarZstdArchiver::new("/", spool.path()).create_archive(&[]).unwrap();
        assert!(blob.is_empty());
        assert!(spool_is_empty(spool.path()));
    }

    #[test]
    fn entry_names_never_absolute() {
        let archiver = TarZstdArchiver::new("/home/alice", "/tmp");
        assert_eq!(
            archiver.entry_name(Path::new("/home/alice/docs/a.txt")),
            PathBuf::from("docs/a.txt")
        );
        assert_eq!(
            archiver.entry_name(Path::new("/srv/b.txt")),
            PathBuf::from("srv/b.txt")
        );
    }
}
