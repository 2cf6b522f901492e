//! Store directory management.
//!
//! ```text
//! <store>/
//! ├─ MANIFEST          # schema, ID sequences, checkpoint position
//! ├─ LOCK              # advisory lock held while the store is open
//! ├─ wal.log           # write-ahead log
//! └─ data.seg          # segment file
//! ```

use crate::error::{CoreError, CoreResult};
use crate::manifest::Manifest;
use boxdb_storage::FileBackend;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const MANIFEST_TEMP: &str = "MANIFEST.tmp";
const LOCK_FILE: &str = "LOCK";
const WAL_FILE: &str = "wal.log";
const SEGMENT_FILE: &str = "data.seg";

/// An opened store directory. Holds an exclusive advisory lock on `LOCK`
/// for as long as it lives.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    file_mode: u32,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// Fails with `StoreLocked` if another handle (in this or another
    /// process) holds the lock.
    pub fn open(path: &Path, create_if_missing: bool, file_mode: u32) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::illegal_argument(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::illegal_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = Self::open_options(file_mode)
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked {
                location: path.display().to_string(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            file_mode,
            _lock_file: lock_file,
        })
    }

    #[cfg(unix)]
    fn open_options(mode: u32) -> OpenOptions {
        use std::os::unix::fs::OpenOptionsExt;
        let mut options = OpenOptions::new();
        options.mode(mode);
        options
    }

    #[cfg(not(unix))]
    fn open_options(_mode: u32) -> OpenOptions {
        OpenOptions::new()
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the WAL file.
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.path.join(WAL_FILE)
    }

    /// Returns the path to the segment file.
    #[must_use]
    pub fn segment_path(&self) -> PathBuf {
        self.path.join(SEGMENT_FILE)
    }

    /// Returns the path to the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Opens the WAL file backend.
    pub fn open_wal(&self) -> CoreResult<FileBackend> {
        Ok(FileBackend::open_with_mode(
            &self.wal_path(),
            Some(self.file_mode),
        )?)
    }

    /// Opens the segment file backend.
    pub fn open_segments(&self) -> CoreResult<FileBackend> {
        Ok(FileBackend::open_with_mode(
            &self.segment_path(),
            Some(self.file_mode),
        )?)
    }

    /// Loads the manifest, or `None` for a new store.
    pub fn load_manifest(&self) -> CoreResult<Option<Manifest>> {
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Manifest::decode(&data)?))
    }

    /// Saves the manifest atomically (write temp, fsync, rename, fsync dir).
    pub fn save_manifest(&self, manifest: &Manifest) -> CoreResult<()> {
        let temp_path = self.path.join(MANIFEST_TEMP);
        let mut file = Self::open_options(self.file_mode)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(&manifest.encode())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.manifest_path())?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }

    /// Returns the combined size of the store files.
    pub fn size_on_disk(&self) -> CoreResult<u64> {
        let mut total = 0;
        for name in [MANIFEST_FILE, WAL_FILE, SEGMENT_FILE] {
            match fs::metadata(self.path.join(name)) {
                Ok(meta) => total += meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    /// Deletes the store files, releases the lock and removes the directory
    /// if nothing else is left in it.
    pub fn remove_files(self) -> CoreResult<()> {
        for name in [MANIFEST_FILE, MANIFEST_TEMP, WAL_FILE, SEGMENT_FILE] {
            match fs::remove_file(self.path.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let path = self.path.clone();
        drop(self);
        fs::remove_file(path.join(LOCK_FILE))?;
        if fs::read_dir(&path)?.next().is_none() {
            fs::remove_dir(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("new_store");
        let dir = StoreDir::open(&path, true, 0o644).unwrap();
        assert!(path.is_dir());
        assert_eq!(dir.wal_path(), path.join("wal.log"));
        assert_eq!(dir.segment_path(), path.join("data.seg"));
    }

    #[test]
    fn open_fails_if_missing_and_no_create() {
        let temp = tempdir().unwrap();
        let err = StoreDir::open(&temp.path().join("absent"), false, 0o644).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("locked");
        let _first = StoreDir::open(&path, true, 0o644).unwrap();
        let err = StoreDir::open(&path, true, 0o644).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreLocked);
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("reopen");
        drop(StoreDir::open(&path, true, 0o644).unwrap());
        assert!(StoreDir::open(&path, true, 0o644).is_ok());
    }

    #[test]
    fn manifest_round_trip() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(&temp.path().join("m"), true, 0o644).unwrap();
        assert!(dir.load_manifest().unwrap().is_none());

        let mut manifest = Manifest::new();
        manifest
            .id_sequences
            .insert(crate::types::EntityTypeId::new(1), 9);
        dir.save_manifest(&manifest).unwrap();
        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
    }

    #[test]
    fn remove_files_cleans_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("doomed");
        let dir = StoreDir::open(&path, true, 0o644).unwrap();
        dir.save_manifest(&Manifest::new()).unwrap();
        drop(dir.open_wal().unwrap());
        assert!(dir.size_on_disk().unwrap() > 0);

        dir.remove_files().unwrap();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn created_files_use_mode() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(&temp.path().join("mode"), true, 0o600).unwrap();
        dir.save_manifest(&Manifest::new()).unwrap();
        let mode = fs::metadata(dir.manifest_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
