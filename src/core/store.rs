// src/core/store.rs

//! The object-store adapter seam and the in-use VDI bitmap merged between
//! members during the join handshake.

use crate::core::FlockError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Number of virtual disk images addressable in one cluster.
pub const VDI_SPACE: usize = 1 << 16;
const BITMAP_WORDS: usize = VDI_SPACE / 64;

/// Fixed-size bitmap of in-use VDI ids. Members OR each other's bitmaps
/// together during the join handshake so every node knows which ids are
/// taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdiBitmap {
    words: Vec<u64>,
}

impl Default for VdiBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl VdiBitmap {
    pub fn new() -> Self {
        Self {
            words: vec![0; BITMAP_WORDS],
        }
    }

    pub fn set(&mut self, vdi: usize) {
        assert!(vdi < VDI_SPACE);
        self.words[vdi / 64] |= 1 << (vdi % 64);
    }

    pub fn test(&self, vdi: usize) -> bool {
        assert!(vdi < VDI_SPACE);
        self.words[vdi / 64] & (1 << (vdi % 64)) != 0
    }

    /// Merges another member's bitmap into this one.
    pub fn or_with(&mut self, other: &VdiBitmap) {
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BITMAP_WORDS * 8);
        for w in &self.words {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, FlockError> {
        if raw.len() != BITMAP_WORDS * 8 {
            return Err(FlockError::MalformedMessage(format!(
                "VDI bitmap has length {}, expected {}",
                raw.len(),
                BITMAP_WORDS * 8
            )));
        }
        let words = raw
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Self { words })
    }
}

/// The on-disk object store, seen from the membership core. The actual
/// read/write path lives with the I/O request handlers; the core only
/// needs initialization and the stale-object purge after a rejoin that
/// advanced the epoch.
pub trait ObjectStore: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn init(&self, base: &Path) -> Result<(), FlockError>;

    /// Called on a node that rejoined with an epoch increment: replicas
    /// written under a dead epoch must not shadow live data. Stale objects
    /// are moved aside for recovery to reconcile, then dropped.
    fn purge_stale_objects(&self) -> Result<(), FlockError>;
}

/// The default store layout: objects under `<base>/obj`, stale replicas
/// quarantined under `<base>/obj/.stale`.
#[derive(Debug, Default)]
pub struct PlainStore {
    obj_dir: parking_lot::Mutex<Option<PathBuf>>,
}

impl PlainStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for PlainStore {
    fn name(&self) -> &str {
        "plain"
    }

    fn init(&self, base: &Path) -> Result<(), FlockError> {
        let obj_dir = base.join("obj");
        fs::create_dir_all(obj_dir.join(".stale"))?;
        info!("Object store initialized at {}", obj_dir.display());
        *self.obj_dir.lock() = Some(obj_dir);
        Ok(())
    }

    fn purge_stale_objects(&self) -> Result<(), FlockError> {
        let guard = self.obj_dir.lock();
        let Some(obj_dir) = guard.as_ref() else {
            return Err(FlockError::InvalidState("object store not initialized".into()));
        };

        let stale = obj_dir.join(".stale");
        let mut purged = 0usize;
        for entry in fs::read_dir(&stale)? {
            let entry = entry?;
            fs::remove_file(entry.path())?;
            purged += 1;
        }
        if purged > 0 {
            info!("Purged {} stale objects after rejoin", purged);
        } else {
            debug!("No stale objects to purge");
        }
        Ok(())
    }
}
