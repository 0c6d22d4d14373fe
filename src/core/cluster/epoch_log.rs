// src/core/cluster/epoch_log.rs

//! The durable, append-only record of epoch transitions: one file per
//! epoch, containing the sorted membership committed at the transition
//! into that epoch.

use crate::core::FlockError;
use crate::core::cluster::node::{NODE_WIRE_LEN, Node};
use bytes::BytesMut;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only epoch → membership log. `latest()` is O(1) via a cached
/// maximum; `read(e)` is a single file open.
#[derive(Debug)]
pub struct EpochLog {
    dir: PathBuf,
    latest: u32,
}

impl EpochLog {
    /// Opens (or creates) the log directory under `base` and scans it once
    /// to recover the highest committed epoch.
    pub fn open(base: &Path) -> Result<Self, FlockError> {
        let dir = base.join("epoch");
        fs::create_dir_all(&dir)?;

        let mut latest = 0;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match u32::from_str_radix(name, 16) {
                Ok(epoch) => latest = latest.max(epoch),
                Err(_) => {
                    // Leftover tmp files from an interrupted append are harmless.
                    if !name.contains(".tmp-") {
                        warn!("Ignoring unrecognized file in epoch log: {}", name);
                    }
                }
            }
        }

        Ok(Self { dir, latest })
    }

    fn path_for(&self, epoch: u32) -> PathBuf {
        self.dir.join(format!("{epoch:08x}"))
    }

    /// Durably records the membership committed at the transition into
    /// `epoch`. Idempotent for the same `(epoch, nodes)` tuple; a different
    /// node list for an already-committed epoch is an invariant violation.
    pub fn append(&mut self, epoch: u32, nodes: &[Node]) -> Result<(), FlockError> {
        debug_assert!(nodes.windows(2).all(|w| w[0] < w[1]), "unsorted epoch entry");

        let mut buf = BytesMut::with_capacity(nodes.len() * NODE_WIRE_LEN);
        for node in nodes {
            node.encode(&mut buf);
        }

        let path = self.path_for(epoch);
        if let Ok(existing) = fs::read(&path) {
            if existing.as_slice() == &buf[..] {
                return Ok(());
            }
            return Err(FlockError::Internal(format!(
                "Epoch log entry {epoch} already committed with a different membership"
            )));
        }

        let tmp = self.dir.join(format!("{epoch:08x}.tmp-{}", rand::random::<u32>()));
        fs::write(&tmp, &buf)?;
        fs::rename(tmp, path)?;
        self.latest = self.latest.max(epoch);
        Ok(())
    }

    /// Returns the membership committed at `epoch`, or an empty list if no
    /// entry exists.
    pub fn read(&self, epoch: u32) -> Vec<Node> {
        let raw = match fs::read(self.path_for(epoch)) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        if raw.len() % NODE_WIRE_LEN != 0 {
            warn!("Epoch log entry {} has a malformed length {}", epoch, raw.len());
            return Vec::new();
        }
        let count = raw.len() / NODE_WIRE_LEN;
        let mut buf = &raw[..];
        match Node::decode_list(&mut buf, count) {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("Epoch log entry {} failed to decode: {}", epoch, e);
                Vec::new()
            }
        }
    }

    /// The highest committed epoch, 0 if the log is empty.
    pub fn latest(&self) -> u32 {
        self.latest
    }
}
