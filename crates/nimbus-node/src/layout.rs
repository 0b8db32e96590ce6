//! The node's on-disk layout: `raft/log`, `raft/snapshot-<index>`,
//! `raft/meta`, `chunks/<first-2-hex>/<digest>`, `identity/node.key`,
//! `certs/*.crt|key`. Every writer goes through [`atomic_write`] so a
//! crash mid-write never leaves a half-written file at the path readers
//! expect.

use std::path::{Path, PathBuf};

use nimbus_fabric::ChunkDigest;

use crate::error::NodeError;

#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, NodeError> {
        let root = root.into();
        let dir = Self { root };
        for sub in ["raft", "chunks", "identity", "certs", "audit"] {
            std::fs::create_dir_all(dir.root.join(sub))?;
        }
        Ok(dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raft_log_dir(&self) -> PathBuf {
        self.root.join("raft").join("log")
    }

    pub fn raft_meta_path(&self) -> PathBuf {
        self.root.join("raft").join("meta")
    }

    pub fn raft_snapshot_path(&self, index: u64) -> PathBuf {
        self.root.join("raft").join(format!("snapshot-{index}"))
    }

    pub fn identity_key_path(&self) -> PathBuf {
        self.root.join("identity").join("node.key")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.root.join("certs").join("node.crt")
    }

    pub fn cert_key_path(&self) -> PathBuf {
        self.root.join("certs").join("node.key")
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.root.join("certs").join("ca.crt")
    }

    pub fn ca_key_path(&self) -> PathBuf {
        self.root.join("certs").join("ca.key")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join("audit").join("events.jsonl")
    }

    /// Chunk files are immutable once written: the content address is the
    /// filename, so two writers racing to put the same bytes just write
    /// the same file twice.
    pub fn chunk_path(&self, digest: &ChunkDigest) -> PathBuf {
        self.root.join("chunks").join(digest.shard_prefix()).join(digest.to_string())
    }

    pub fn chunk_shard_dir(&self, digest: &ChunkDigest) -> PathBuf {
        self.root.join("chunks").join(digest.shard_prefix())
    }
}

/// Writes `bytes` to `path` via a temp file in the same directory followed
/// by a rename, so readers never observe a partially-written file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), NodeError> {
    let dir = path.parent().ok_or_else(|| NodeError::DataDir(format!("{} has no parent directory", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let tmp_path = dir.join(format!(".{}.tmp-{}", path.file_name().and_then(|n| n.to_str()).unwrap_or("file"), std::process::id()));
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_every_subdirectory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path()).unwrap();
        assert!(dir.root().join("raft").is_dir());
        assert!(dir.root().join("chunks").is_dir());
        assert!(dir.root().join("identity").is_dir());
        assert!(dir.root().join("certs").is_dir());
        assert!(dir.root().join("audit").is_dir());
    }

    #[test]
    fn chunk_path_uses_shard_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = DataDir::open(tmp.path()).unwrap();
        let digest = ChunkDigest::of(b"hello");
        let path = dir.chunk_path(&digest);
        assert!(path.starts_with(dir.root().join("chunks").join(digest.shard_prefix())));
    }

    #[test]
    fn atomic_write_then_read_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sub").join("file.bin");
        atomic_write(&path, b"payload").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }
}
