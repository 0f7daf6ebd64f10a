use crate::core::Block;
use crate::error::{BlockchainError, Result};
use log::info;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const CHAIN_SUBDIR: &str = "chain";

/// On-disk chain storage: one self-describing JSON file per block, named by
/// index, under `<data_dir>/chain/`. Append-only; only the ledger writes
/// here, one block at a time. Loading requires every index from 0 to the
/// recorded height to be present - a gap means the ledger is corrupt and is
/// fatal rather than recoverable.
#[derive(Debug)]
pub struct ChainStore {
    chain_dir: PathBuf,
}

impl ChainStore {
    pub fn open(data_dir: &Path) -> Result<ChainStore> {
        let chain_dir = data_dir.join(CHAIN_SUBDIR);
        fs::create_dir_all(&chain_dir).map_err(|e| {
            BlockchainError::Storage(format!(
                "Failed to create chain directory {}: {e}",
                chain_dir.display()
            ))
        })?;
        Ok(ChainStore { chain_dir })
    }

    fn block_path(&self, index: u64) -> PathBuf {
        self.chain_dir.join(format!("{index}.json"))
    }

    /// Load the full chain in index order. Returns an empty vector when no
    /// blocks have been persisted yet.
    pub fn load_blocks(&self) -> Result<Vec<Block>> {
        let height = match self.recorded_height()? {
            Some(height) => height,
            None => return Ok(Vec::new()),
        };

        let mut blocks = Vec::with_capacity(height as usize + 1);
        for index in 0..=height {
            let path = self.block_path(index);
            let file = File::open(&path).map_err(|e| {
                BlockchainError::Storage(format!(
                    "Missing block file for index {index} (recorded height {height}): {e}"
                ))
            })?;
            let block: Block = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                BlockchainError::Storage(format!("Corrupt block file {}: {e}", path.display()))
            })?;
            if block.get_index() != index {
                return Err(BlockchainError::Storage(format!(
                    "Block file {} records index {} instead of {index}",
                    path.display(),
                    block.get_index()
                )));
            }
            blocks.push(block);
        }

        info!("Loaded {} persisted blocks from {}", blocks.len(), self.chain_dir.display());
        Ok(blocks)
    }

    /// Highest block index present on disk, from the file names alone
    fn recorded_height(&self) -> Result<Option<u64>> {
        let mut height: Option<u64> = None;
        let entries = fs::read_dir(&self.chain_dir).map_err(|e| {
            BlockchainError::Storage(format!(
                "Failed to read chain directory {}: {e}",
                self.chain_dir.display()
            ))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| {
                BlockchainError::Storage(format!("Failed to read chain directory entry: {e}"))
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(index) = stem.parse::<u64>() {
                    height = Some(height.map_or(index, |h| h.max(index)));
                }
            }
        }
        Ok(height)
    }

    /// Persist one block. A failure here must abort the append that
    /// triggered it, so every I/O step maps to a Storage error.
    pub fn append_block(&self, block: &Block) -> Result<()> {
        let path = self.block_path(block.get_index());
        let file = File::create(&path).map_err(|e| {
            BlockchainError::Storage(format!(
                "Failed to create block file {}: {e}",
                path.display()
            ))
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, block).map_err(|e| {
            BlockchainError::Storage(format!("Failed to write block file {}: {e}", path.display()))
        })?;
        writer.flush().map_err(|e| {
            BlockchainError::Storage(format!("Failed to flush block file {}: {e}", path.display()))
        })?;
        writer
            .into_inner()
            .map_err(|e| {
                BlockchainError::Storage(format!(
                    "Failed to flush block file {}: {e}",
                    path.display()
                ))
            })?
            .sync_all()
            .map_err(|e| {
                BlockchainError::Storage(format!("Failed to sync block file {}: {e}", path.display()))
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transaction;
    use tempfile::tempdir;

    fn test_block(index: u64, prev_hash: &str) -> Block {
        let coinbase = Transaction::new_coinbase("miner".to_string(), 50).unwrap();
        Block::new_block(index, prev_hash.to_string(), vec![coinbase], 1, None).unwrap()
    }

    #[test]
    fn empty_store_loads_nothing() {
        let dir = tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        assert!(store.load_blocks().unwrap().is_empty());
    }

    #[test]
    fn persisted_blocks_round_trip() {
        let dir = tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();

        let genesis = test_block(0, crate::core::ZERO_HASH);
        let next = test_block(1, genesis.get_hash());
        store.append_block(&genesis).unwrap();
        store.append_block(&next).unwrap();

        let loaded = store.load_blocks().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], genesis);
        assert_eq!(loaded[1], next);
    }

    #[test]
    fn empty_transactions_block_round_trips() {
        let dir = tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();

        let block = Block::new_block(0, crate::core::ZERO_HASH.to_string(), vec![], 1, None)
            .unwrap();
        store.append_block(&block).unwrap();

        let loaded = store.load_blocks().unwrap();
        assert_eq!(loaded[0].get_hash(), block.get_hash());
        assert_eq!(loaded[0].get_merkle_root(), crate::core::ZERO_HASH);
    }

    #[test]
    fn gap_in_indices_is_fatal() {
        let dir = tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();

        let genesis = test_block(0, crate::core::ZERO_HASH);
        let skipped = test_block(2, "somewhere");
        store.append_block(&genesis).unwrap();
        store.append_block(&skipped).unwrap();

        let err = store.load_blocks().unwrap_err();
        assert!(matches!(err, BlockchainError::Storage(_)));
    }

    #[test]
    fn corrupt_file_is_fatal() {
        let dir = tempdir().unwrap();
        let store = ChainStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("chain").join("0.json"), b"not a block").unwrap();

        let err = store.load_blocks().unwrap_err();
        assert!(matches!(err, BlockchainError::Storage(_)));
    }
}
