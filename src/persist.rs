//! Durable storage of the persistent Raft fields.
//!
//! A node saves `(current_term, voted_for, log)` as one blob on every change
//! and reads it back once at startup. [`Persister`] hides where the blob
//! lives: [`FilePersister`] writes it to disk, [`MemPersister`] keeps it in
//! memory so tests can "restart" a node by handing the same persister to a
//! fresh instance.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::config::NodeId;
use crate::error::Result;
use crate::raft::state::LogEntry;

/// The fields that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub log: Vec<LogEntry>,
}

impl PersistentState {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Byte-blob storage that outlives the node process.
pub trait Persister: Send + Sync {
    /// Replace the stored blob. Must be durable when this returns.
    fn save(&self, state: &[u8]) -> Result<()>;

    /// Read the stored blob; empty if nothing was ever saved.
    fn load(&self) -> Result<Vec<u8>>;
}

/// Load and decode the persisted state.
///
/// A missing blob means a fresh node. A blob that cannot be read or decoded
/// is reported and the node also starts fresh.
pub fn restore_state(persister: &dyn Persister, node_id: NodeId) -> Option<PersistentState> {
    let bytes = match persister.load() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!(node_id, error = %e, "Failed to read persisted state, starting fresh");
            return None;
        }
    };
    if bytes.is_empty() {
        return None;
    }
    match PersistentState::decode(&bytes) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::error!(
                node_id,
                error = %e,
                bytes = bytes.len(),
                "Persisted state is corrupt, starting fresh at term 0"
            );
            None
        }
    }
}

/// In-memory persister for tests and simulations.
#[derive(Debug, Default)]
pub struct MemPersister {
    state: Mutex<Vec<u8>>,
}

impl MemPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this persister, so a restarted node does not share writes
    /// with the instance it replaces.
    pub fn duplicate(&self) -> Self {
        Self {
            state: Mutex::new(self.lock().clone()),
        }
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // A panic while holding this lock cannot leave the Vec half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Persister for MemPersister {
    fn save(&self, state: &[u8]) -> Result<()> {
        *self.lock() = state.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<Vec<u8>> {
        Ok(self.lock().clone())
    }
}

/// File-backed persister.
///
/// Writes go to a temporary file that is synced and then renamed over the
/// real one, so a crash leaves either the old or the new blob.
#[derive(Debug)]
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    /// Creates the parent directory if it doesn't exist.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        Ok(Self { path })
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    fn write_atomically(&self, state: &[u8]) -> Result<()> {
        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path)?;
        file.write_all(state)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl Persister for FilePersister {
    /// Saves happen under the node's state lock. On a multi-threaded
    /// runtime the worker hands its other tasks off while the disk syncs.
    fn save(&self, state: &[u8]) -> Result<()> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.write_atomically(state))
            }
            _ => self.write_atomically(state),
        }
    }

    fn load(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_state() -> PersistentState {
        PersistentState {
            current_term: 7,
            voted_for: Some(3),
            log: vec![
                LogEntry {
                    term: 1,
                    index: 1,
                    command: b"set x 1".to_vec(),
                },
                LogEntry {
                    term: 7,
                    index: 2,
                    command: b"set y 2".to_vec(),
                },
            ],
        }
    }

    #[test]
    fn persisted_state_survives_encode_decode() {
        let state = sample_state();
        let bytes = state.encode().unwrap();
        assert_eq!(PersistentState::decode(&bytes).unwrap(), state);
    }

    #[test]
    fn mem_persister_starts_empty() {
        let persister = MemPersister::new();
        assert!(persister.load().unwrap().is_empty());
        assert!(restore_state(&persister, 1).is_none());
    }

    #[test]
    fn mem_persister_duplicate_is_independent() {
        let persister = MemPersister::new();
        persister.save(b"first").unwrap();

        let copy = persister.duplicate();
        persister.save(b"second").unwrap();

        assert_eq!(copy.load().unwrap(), b"first".to_vec());
        assert_eq!(persister.size(), 6);
    }

    #[test]
    fn restore_state_ignores_corrupt_blob() {
        let persister = MemPersister::new();
        persister.save(b"{not json").unwrap();
        assert!(restore_state(&persister, 1).is_none());
    }

    #[test]
    fn restore_state_reads_saved_blob() {
        let persister = MemPersister::new();
        persister.save(&sample_state().encode().unwrap()).unwrap();
        assert_eq!(restore_state(&persister, 1), Some(sample_state()));
    }

    #[test]
    fn file_persister_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let persister = FilePersister::new(dir.path().join("node-1.json")).unwrap();
        assert!(persister.load().unwrap().is_empty());
    }

    #[test]
    fn file_persister_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("node-1.json");

        // first "session"
        {
            let persister = FilePersister::new(&path).unwrap();
            persister.save(&sample_state().encode().unwrap()).unwrap();
        }

        // "restart" - new persister instance
        {
            let persister = FilePersister::new(&path).unwrap();
            assert_eq!(restore_state(&persister, 1), Some(sample_state()));
        }
    }

    #[test]
    fn file_persister_overwrites_previous_blob() {
        let dir = tempdir().unwrap();
        let persister = FilePersister::new(dir.path().join("node-2.json")).unwrap();

        persister.save(b"old").unwrap();
        persister.save(b"new").unwrap();

        assert_eq!(persister.load().unwrap(), b"new".to_vec());
        assert!(!dir.path().join("node-2.tmp").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn file_persister_saves_inside_multi_thread_runtime() {
        let dir = tempdir().unwrap();
        let persister = FilePersister::new(dir.path().join("node-3.json")).unwrap();

        persister.save(&sample_state().encode().unwrap()).unwrap();
        assert_eq!(restore_state(&persister, 3), Some(sample_state()));
    }

    #[tokio::test]
    async fn file_persister_saves_inside_current_thread_runtime() {
        let dir = tempdir().unwrap();
        let persister = FilePersister::new(dir.path().join("node-4.json")).unwrap();

        persister.save(b"blob").unwrap();
        assert_eq!(persister.load().unwrap(), b"blob".to_vec());
    }
}
