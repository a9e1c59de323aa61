// src/storage/wal.rs
// Write-ahead log for the commit path. One JSON record per line, fsynced
// before the block store or state is touched.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::StoreError;
use crate::chain::Block;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalRecord {
    /// A finalized block is about to be persisted and applied.
    Commit { block: Block },
}

pub struct CommitLog {
    path: PathBuf,
    file: File,
}

impl CommitLog {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        crate::crypto::set_restrictive_permissions(path);
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn append(&mut self, record: &WalRecord) -> Result<(), StoreError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }

    /// All complete records. A torn final line from a crash mid-write is
    /// skipped; a bad line followed by good ones is corruption.
    pub fn read_all(&self) -> Result<Vec<WalRecord>, StoreError> {
        let f = File::open(&self.path)?;
        let lines: Vec<String> = BufReader::new(f).lines().collect::<Result<_, _>>()?;
        let mut records = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<WalRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) if i == last => {
                    log::warn!("ignoring torn wal tail in {}: {}", self.path.display(), e);
                }
                Err(e) => {
                    return Err(StoreError::Corrupt(format!(
                        "wal line {} unreadable: {}",
                        i + 1,
                        e
                    )))
                }
            }
        }
        Ok(records)
    }

    /// Drop all records once their effects are durable elsewhere.
    pub fn truncate(&mut self) -> Result<(), StoreError> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(fs::metadata(&self.path)?.len() == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_read_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.wal");
        let mut wal = CommitLog::open(&path).unwrap();
        assert!(wal.is_empty().unwrap());

        let rec = WalRecord::Commit {
            block: Block::genesis("t"),
        };
        wal.append(&rec).unwrap();
        assert_eq!(wal.read_all().unwrap(), vec![rec.clone()]);

        wal.truncate().unwrap();
        assert!(wal.read_all().unwrap().is_empty());
        wal.append(&rec).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn torn_tail_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("commit.wal");
        let mut wal = CommitLog::open(&path).unwrap();
        wal.append(&WalRecord::Commit {
            block: Block::genesis("t"),
        })
        .unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"{\"type\":\"commit\",\"blo").unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }
}
