//! Known identities and nearest-neighbour face matching.
//!
//! The record set is the only state that survives restarts. Every mutation
//! persists the full set; a failed save keeps the change in memory and the
//! next save retries with everything.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::module::define::label;
use crate::module::error::PersistenceError;
use crate::module::vision::Embedding;

/// One enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub name: String,
    pub embedding: Embedding,
}

/// Durable storage of the full record set.
pub trait IdentityStorage: Send + Sync {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>, PersistenceError>;
    fn save_identities(&self, records: &[IdentityRecord]) -> Result<(), PersistenceError>;
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    version: u32,
    identities: Vec<IdentityRecord>,
}

const IDENTITY_FILE_VERSION: u32 = 1;

/// Stores records as one JSON document.
///
/// Saves go to a sibling temp file which is synced and renamed over the
/// target, so a failed save leaves the previous file untouched.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl IdentityStorage for JsonFileStorage {
    fn load_identities(&self) -> Result<Vec<IdentityRecord>, PersistenceError> {
        if !self.path.is_file() {
            return Ok(vec![]);
        }
        let content = fs::read_to_string(&self.path)?;
        let file: IdentityFile = serde_json::from_str(&content)?;
        Ok(file.identities)
    }

    fn save_identities(&self, records: &[IdentityRecord]) -> Result<(), PersistenceError> {
        let tmp = self.temp_path();
        let document = IdentityFile {
            version: IDENTITY_FILE_VERSION,
            identities: records.to_vec(),
        };
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer(&mut file, &document)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Result of a successful in-memory enrollment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub name: String,
    /// An existing record of that name was overwritten.
    pub replaced: bool,
    pub total: usize,
}

/// In-memory record set in front of an [`IdentityStorage`].
///
/// Readers work on an `Arc` snapshot; writers serialize on a mutex and swap
/// in a new snapshot, so a match never sees a half-applied enrollment.
pub struct IdentityStore {
    tolerance: f32,
    storage: Box<dyn IdentityStorage>,
    records: RwLock<Arc<Vec<IdentityRecord>>>,
    writer: Mutex<()>,
    dirty: AtomicBool,
}

impl IdentityStore {
    pub fn new(storage: Box<dyn IdentityStorage>, tolerance: f32) -> Self {
        Self {
            tolerance,
            storage,
            records: RwLock::new(Arc::new(vec![])),
            writer: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Create a store and load its records.
    pub fn open(storage: Box<dyn IdentityStorage>, tolerance: f32) -> Result<Self, PersistenceError> {
        let store = Self::new(storage, tolerance);
        store.load()?;
        Ok(store)
    }

    /// Replace the in-memory set with the durable one.
    pub fn load(&self) -> Result<usize, PersistenceError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let records = self.storage.load_identities()?;
        let count = records.len();
        self.swap(Arc::new(records));
        self.dirty.store(false, Ordering::SeqCst);
        log::info!("Loaded {} known faces", count);
        Ok(count)
    }

    /// Write the full in-memory set to storage.
    pub fn persist(&self) -> Result<(), PersistenceError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.save(&self.snapshot())
    }

    /// Enroll or re-enroll `name`; the most recent embedding wins.
    ///
    /// The record is applied in memory before saving. When the save fails the
    /// record stays, the store is marked dirty and the error is returned.
    pub fn enroll(&self, name: &str, embedding: Embedding) -> Result<Enrollment, PersistenceError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = Vec::clone(&self.snapshot());
        let replaced = match records.iter_mut().find(|r| r.name == name) {
            Some(record) => {
                record.embedding = embedding;
                true
            }
            None => {
                records.push(IdentityRecord {
                    name: name.to_string(),
                    embedding,
                });
                false
            }
        };
        let records = Arc::new(records);
        self.swap(Arc::clone(&records));
        if replaced {
            log::info!("Updated encoding for {}", name);
        } else {
            log::info!("Added new face: {}", name);
        }

        self.save(&records)?;
        Ok(Enrollment {
            name: name.to_string(),
            replaced,
            total: records.len(),
        })
    }

    /// Name of the nearest record within tolerance, or `"Unknown"`.
    pub fn match_embedding(&self, embedding: &[f32]) -> String {
        match self.nearest(embedding) {
            Some((name, distance)) if distance <= self.tolerance => name,
            _ => label::UNKNOWN_IDENTITY.to_string(),
        }
    }

    /// Nearest record and its distance, first one on ties.
    pub fn nearest(&self, embedding: &[f32]) -> Option<(String, f32)> {
        let records = self.snapshot();
        let mut best: Option<(&IdentityRecord, f32)> = None;
        for record in records.iter() {
            if record.embedding.len() != embedding.len() {
                log::debug!(
                    "Skip {}: embedding length {} != {}",
                    record.name,
                    record.embedding.len(),
                    embedding.len()
                );
                continue;
            }
            let distance = euclidean(&record.embedding, embedding);
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((record, distance));
            }
        }
        best.map(|(record, distance)| (record.name.clone(), distance))
    }

    /// Copy-on-read view of the records.
    pub fn snapshot(&self) -> Arc<Vec<IdentityRecord>> {
        Arc::clone(&self.records.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|r| r.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// In-memory records not yet durable.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn swap(&self, records: Arc<Vec<IdentityRecord>>) {
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = records;
    }

    fn save(&self, records: &[IdentityRecord]) -> Result<(), PersistenceError> {
        match self.storage.save_identities(records) {
            Ok(()) => {
                self.dirty.store(false, Ordering::SeqCst);
                log::info!("Saved {} known faces", records.len());
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                log::warn!("Saving known faces failed, kept in memory: {}", e);
                Err(e)
            }
        }
    }
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Storage kept in memory that can be told to fail.
    #[derive(Default)]
    struct MemoryStorage {
        saved: Mutex<Vec<IdentityRecord>>,
        fail: AtomicBool,
    }

    impl IdentityStorage for Arc<MemoryStorage> {
        fn load_identities(&self) -> Result<Vec<IdentityRecord>, PersistenceError> {
            Ok(self.saved.lock().unwrap().clone())
        }

        fn save_identities(&self, records: &[IdentityRecord]) -> Result<(), PersistenceError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            *self.saved.lock().unwrap() = records.to_vec();
            Ok(())
        }
    }

    fn store() -> (IdentityStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::default());
        (IdentityStore::new(Box::new(Arc::clone(&storage)), 0.6), storage)
    }

    #[test]
    fn enroll_then_match() {
        let (store, _) = store();
        let e1 = vec![0.1, 0.2, 0.3];
        store.enroll("alice", e1.clone()).unwrap();
        assert_eq!(store.match_embedding(&e1), "alice");
        assert_eq!(store.match_embedding(&[0.15, 0.2, 0.3]), "alice");
        // Distance 1.0 is beyond the tolerance.
        assert_eq!(store.match_embedding(&[1.1, 0.2, 0.3]), "Unknown");
    }

    #[test]
    fn empty_store_matches_nothing() {
        let (store, _) = store();
        assert_eq!(store.match_embedding(&[0.0, 0.0]), "Unknown");
        assert_eq!(store.nearest(&[0.0, 0.0]), None);
    }

    #[test]
    fn nearest_record_wins() {
        let (store, _) = store();
        store.enroll("alice", vec![0.0, 0.0]).unwrap();
        store.enroll("bob", vec![0.3, 0.0]).unwrap();
        assert_eq!(store.match_embedding(&[0.2, 0.0]), "bob");
        assert_eq!(store.match_embedding(&[0.1, 0.0]), "alice");
        // Records of another dimension are ignored.
        store.enroll("carol", vec![0.2, 0.0, 0.0]).unwrap();
        assert_eq!(store.match_embedding(&[0.2, 0.0]), "bob");
    }

    #[test]
    fn re_enroll_keeps_one_record() {
        let (store, storage) = store();
        let first = store.enroll("alice", vec![0.0, 0.0]).unwrap();
        assert!(!first.replaced);
        let second = store.enroll("alice", vec![5.0, 5.0]).unwrap();
        assert!(second.replaced);
        assert_eq!(second.total, 1);
        let saved = storage.saved.lock().unwrap().clone();
        assert_eq!(
            saved,
            vec![IdentityRecord {
                name: "alice".into(),
                embedding: vec![5.0, 5.0]
            }]
        );
        assert_eq!(store.match_embedding(&[5.0, 5.0]), "alice");
        assert_eq!(store.match_embedding(&[0.0, 0.0]), "Unknown");
    }

    #[test]
    fn failed_save_keeps_enrollment() {
        let (store, storage) = store();
        store.enroll("alice", vec![0.0]).unwrap();
        storage.fail.store(true, Ordering::SeqCst);
        assert!(store.enroll("bob", vec![1.0]).is_err());
        assert!(store.is_dirty());
        assert_eq!(store.match_embedding(&[1.0]), "bob");
        // Durable state still holds the earlier set.
        assert_eq!(storage.saved.lock().unwrap().len(), 1);

        storage.fail.store(false, Ordering::SeqCst);
        store.persist().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(storage.saved.lock().unwrap().len(), 2);
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_faces.json");
        let storage = JsonFileStorage::new(&path);
        assert!(storage.load_identities().unwrap().is_empty());

        let records = vec![
            IdentityRecord {
                name: "alice".into(),
                embedding: vec![0.25, -1.5, 3.0],
            },
            IdentityRecord {
                name: "bob".into(),
                embedding: vec![0.0, 0.5, 0.125],
            },
        ];
        storage.save_identities(&records).unwrap();
        assert!(!dir.path().join("known_faces.json.tmp").exists());

        let mut loaded = storage.load_identities().unwrap();
        loaded.sort_by(|a, b| b.name.cmp(&a.name));
        let mut expected = records.clone();
        expected.sort_by(|a, b| b.name.cmp(&a.name));
        assert_eq!(loaded, expected);
    }

    #[test]
    fn store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_faces.json");
        {
            let store = IdentityStore::open(Box::new(JsonFileStorage::new(&path)), 0.6).unwrap();
            store.enroll("alice", vec![0.1, 0.2]).unwrap();
            store.enroll("bob", vec![0.9, 0.9]).unwrap();
        }
        let store = IdentityStore::open(Box::new(JsonFileStorage::new(&path)), 0.6).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.match_embedding(&[0.9, 0.9]), "bob");
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_faces.json");
        fs::write(&path, "{not json").unwrap();
        assert!(IdentityStore::open(Box::new(JsonFileStorage::new(&path)), 0.6).is_err());
    }

    #[test]
    fn matching_while_enrolling() {
        let (store, _) = store();
        store.enroll("alice", vec![0.0, 0.0]).unwrap();
        let store = Arc::new(store);
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..200 {
                        assert_eq!(store.match_embedding(&[0.0, 0.0]), "alice");
                    }
                })
            })
            .collect();
        for i in 0..50 {
            store.enroll(&format!("guest{i}"), vec![10.0 + i as f32, 0.0]).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.len(), 51);
    }
}
