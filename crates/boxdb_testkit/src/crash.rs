//! Crash recovery testing.
//!
//! A crash is simulated by copying the files of a store that is still
//! open: the copy holds exactly what a killed process would have left on
//! disk, without a final checkpoint. The copy can then be damaged before
//! it is opened to check how recovery treats torn or corrupt files.
//!
//! ```rust,ignore
//! use boxdb_testkit::crash::CrashImage;
//!
//! let image = CrashImage::capture(&store_dir);
//! image.append_to_wal(b"BWA");
//! let store = image.open(notes_model()).unwrap();
//! ```

use boxdb_core::{Config, CoreResult, Model, Store, StoreLocation};
use boxdb_storage::{FileBackend, StorageBackend};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const WAL_FILE: &str = "wal.log";
const SEGMENT_FILE: &str = "data.seg";
const LOCK_FILE: &str = "LOCK";

/// Files of a store captured as if the process had died.
pub struct CrashImage {
    dir: TempDir,
}

impl CrashImage {
    /// Copies the store directory at `source` without taking its lock.
    pub fn capture(source: &Path) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let target = dir.path().join("crashed.boxdb");
        fs::create_dir_all(&target).expect("Failed to create image directory");
        for entry in fs::read_dir(source).expect("Failed to list store directory") {
            let entry = entry.expect("Failed to read directory entry");
            if entry.file_name() == LOCK_FILE {
                continue;
            }
            fs::copy(entry.path(), target.join(entry.file_name()))
                .expect("Failed to copy store file");
        }
        Self { dir }
    }

    /// Directory holding the captured files.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("crashed.boxdb")
    }

    fn file(&self, name: &str) -> PathBuf {
        self.path().join(name)
    }

    /// Length of the captured WAL in bytes.
    pub fn wal_len(&self) -> u64 {
        fs::metadata(self.file(WAL_FILE)).map_or(0, |m| m.len())
    }

    /// Appends `bytes` to the WAL, as a write cut short by the crash.
    pub fn append_to_wal(&self, bytes: &[u8]) {
        append(&self.file(WAL_FILE), bytes);
    }

    /// Appends `bytes` to the segment file.
    pub fn append_to_segments(&self, bytes: &[u8]) {
        append(&self.file(SEGMENT_FILE), bytes);
    }

    /// Flips every bit of the byte at `offset` from the end of the WAL.
    pub fn corrupt_wal_from_end(&self, offset: u64) {
        let path = self.file(WAL_FILE);
        let mut data = fs::read(&path).expect("Failed to read WAL");
        let len = data.len() as u64;
        assert!(offset < len, "WAL has only {len} bytes");
        let at = usize::try_from(len - 1 - offset).expect("offset fits in usize");
        data[at] ^= 0xFF;
        fs::write(&path, data).expect("Failed to write WAL");
    }

    /// Opens the captured files as a store, running recovery.
    pub fn open(&self, model: Model) -> CoreResult<Store> {
        Store::open(
            model,
            StoreLocation::Directory(self.path()),
            Config::default().create_if_missing(false),
        )
    }
}

fn append(path: &Path, bytes: &[u8]) {
    let mut backend = FileBackend::open(path).expect("Failed to open store file");
    backend.append(bytes).expect("Failed to append");
    backend.flush().expect("Failed to flush");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{notes_model, Note, TestStore};
    use boxdb_core::ErrorKind;

    fn store_with_notes(count: usize) -> (TestStore, Vec<Note>) {
        let test_store = TestStore::file();
        let notes = test_store.entity_box::<Note>().unwrap();
        let mut batch: Vec<Note> = (0..count)
            .map(|i| Note::new(&format!("n{i}")).with_priority(i as i32))
            .collect();
        notes.put_many(&mut batch).unwrap();
        (test_store, batch)
    }

    #[test]
    fn committed_writes_survive_a_crash() {
        let (test_store, batch) = store_with_notes(5);
        let image = CrashImage::capture(&test_store.path().unwrap());
        assert!(image.wal_len() > 0);

        let recovered = image.open(notes_model()).unwrap();
        let notes = recovered.entity_box::<Note>().unwrap();
        assert_eq!(notes.all().unwrap(), batch);
    }

    #[test]
    fn ids_continue_after_recovery() {
        let (test_store, batch) = store_with_notes(3);
        let image = CrashImage::capture(&test_store.path().unwrap());

        let recovered = image.open(notes_model()).unwrap();
        let id = recovered
            .entity_box::<Note>()
            .unwrap()
            .put(&mut Note::new("after"))
            .unwrap();
        assert!(batch.iter().all(|n| n.id < id));
    }

    #[test]
    fn torn_wal_tail_is_ignored() {
        let (test_store, batch) = store_with_notes(2);
        let image = CrashImage::capture(&test_store.path().unwrap());
        image.append_to_wal(b"BWA");

        let recovered = image.open(notes_model()).unwrap();
        assert_eq!(
            recovered.entity_box::<Note>().unwrap().count().unwrap(),
            batch.len() as u64
        );
    }

    #[test]
    fn torn_segment_tail_is_cut() {
        let (test_store, batch) = store_with_notes(3);
        let image = CrashImage::capture(&test_store.path().unwrap());
        image.append_to_segments(&[0x40, 0x00, 0x00]);

        let recovered = image.open(notes_model()).unwrap();
        assert_eq!(recovered.recovery_report().truncated_bytes, 3);
        assert_eq!(
            recovered.entity_box::<Note>().unwrap().all().unwrap(),
            batch
        );
    }

    #[test]
    fn wal_checksum_mismatch_is_fatal() {
        let (test_store, _) = store_with_notes(2);
        let image = CrashImage::capture(&test_store.path().unwrap());
        image.corrupt_wal_from_end(0);

        let err = image.open(notes_model()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FileCorrupt);
        assert!(err.is_fatal());
    }

    #[test]
    fn checkpoint_leaves_nothing_to_replay() {
        let (test_store, batch) = store_with_notes(4);
        test_store.checkpoint().unwrap();
        let image = CrashImage::capture(&test_store.path().unwrap());

        let recovered = image.open(notes_model()).unwrap();
        assert_eq!(recovered.recovery_report().replayed_commits, 0);
        assert_eq!(
            recovered.entity_box::<Note>().unwrap().all().unwrap(),
            batch
        );
    }
}
