//! Persistence Layer for chain state
//!
//! - Block log: append-only newline-delimited JSON of `{hash, block}` records
//! - Genesis: a single JSON file holding the signed genesis
//!
//! The block log keeps an in-memory copy of every block so sync and search
//! requests never touch the disk.

use crate::identity::{Address, Hash};
use crate::types::{SignedBlock, SignedGenesis, SignedTransaction};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const BLOCK_LOG_FILE: &str = "blocks.jsonl";
pub const GENESIS_FILE: &str = "genesis.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed record at line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("Hash mismatch at line {line}: stored {stored}, computed {computed}")]
    HashMismatch { line: usize, stored: Hash, computed: Hash },

    #[error("Out-of-order block: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
}

/// One line of the block log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: Hash,
    pub block: SignedBlock,
}

/// Block lookup criteria
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockQuery {
    pub number: Option<u64>,
    pub hash_prefix: Option<String>,
    pub parent_prefix: Option<String>,
}

/// Transaction lookup criteria; `account` matches either side
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxQuery {
    pub hash: Option<Hash>,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub account: Option<Address>,
}

impl TxQuery {
    pub fn is_empty(&self) -> bool {
        self.hash.is_none() && self.from.is_none() && self.to.is_none() && self.account.is_none()
    }

    pub fn matches(&self, tx: &SignedTransaction, hash: &Hash) -> bool {
        self.hash.map_or(true, |h| &h == hash)
            && self.from.map_or(true, |a| &a == tx.sender())
            && self.to.map_or(true, |a| &a == tx.recipient())
            && self
                .account
                .map_or(true, |a| &a == tx.sender() || &a == tx.recipient())
    }
}

/// A matched transaction with the block it landed in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub hash: Hash,
    pub tx: SignedTransaction,
    pub block_number: u64,
    pub block_hash: Hash,
}

/// Append-only block log
pub struct BlockStore {
    file: Mutex<File>,
    blocks: RwLock<Vec<SignedBlock>>,
}

impl BlockStore {
    /// Open or create the log at `path`, loading existing records in file order.
    /// A trailing record without its newline was cut short by a crash and is
    /// dropped from the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let blocks = if path.exists() {
            Self::read_records(path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        tracing::info!("Opened block log at {:?} ({} blocks)", path, blocks.len());

        Ok(Self {
            file: Mutex::new(file),
            blocks: RwLock::new(blocks),
        })
    }

    fn read_records(path: &Path) -> Result<Vec<SignedBlock>, StoreError> {
        let data = fs::read(path)?;
        let complete = data.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        if complete < data.len() {
            tracing::warn!(
                "Dropping {} bytes of torn record at the end of {:?}",
                data.len() - complete,
                path
            );
            OpenOptions::new().write(true).open(path)?.set_len(complete as u64)?;
        }

        let mut blocks = Vec::new();
        for (index, line) in data[..complete].split(|b| *b == b'\n').enumerate() {
            let line_no = index + 1;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let record: BlockRecord =
                serde_json::from_slice(line).map_err(|e| StoreError::Malformed {
                    line: line_no,
                    reason: e.to_string(),
                })?;

            let computed = record.block.hash();
            if computed != record.hash {
                return Err(StoreError::HashMismatch {
                    line: line_no,
                    stored: record.hash,
                    computed,
                });
            }
            blocks.push(record.block);
        }

        Ok(blocks)
    }

    /// Append a block; it must extend the log by exactly one
    pub fn append(&self, block: &SignedBlock) -> Result<(), StoreError> {
        let mut blocks = self.blocks.write();
        let expected = blocks.last().map_or(1, |last| last.number() + 1);
        if block.number() != expected {
            return Err(StoreError::OutOfOrder {
                expected,
                got: block.number(),
            });
        }

        let record = BlockRecord {
            hash: block.hash(),
            block: block.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        let written = file
            .write_all(&line)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data());
        if let Err(e) = written {
            // Cut any partial line so the next append starts clean
            if let Err(truncate) = file.set_len(len) {
                tracing::error!("Cannot truncate block log after failed append: {}", truncate);
            }
            return Err(e.into());
        }

        blocks.push(block.clone());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    pub fn last_number(&self) -> u64 {
        self.blocks.read().last().map_or(0, |block| block.number())
    }

    /// All blocks in log order
    pub fn blocks(&self) -> Vec<SignedBlock> {
        self.blocks.read().clone()
    }

    pub fn get(&self, number: u64) -> Option<SignedBlock> {
        if number == 0 {
            return None;
        }
        self.blocks
            .read()
            .get((number - 1) as usize)
            .filter(|block| block.number() == number)
            .cloned()
    }

    /// Blocks numbered `from_number` and above
    pub fn blocks_from(&self, from_number: u64) -> Vec<SignedBlock> {
        let start = from_number.saturating_sub(1) as usize;
        self.blocks
            .read()
            .iter()
            .skip(start)
            .filter(|block| block.number() >= from_number)
            .cloned()
            .collect()
    }

    pub fn contains_hash(&self, hash: &Hash) -> bool {
        self.blocks.read().iter().any(|block| &block.hash() == hash)
    }

    pub fn search_blocks(&self, query: &BlockQuery) -> Vec<SignedBlock> {
        self.blocks
            .read()
            .iter()
            .filter(|block| query.number.map_or(true, |n| block.number() == n))
            .filter(|block| {
                query
                    .hash_prefix
                    .as_deref()
                    .map_or(true, |prefix| block.hash().has_prefix(prefix))
            })
            .filter(|block| {
                query
                    .parent_prefix
                    .as_deref()
                    .map_or(true, |prefix| block.parent().has_prefix(prefix))
            })
            .cloned()
            .collect()
    }

    pub fn search_transactions(&self, query: &TxQuery) -> Vec<TxRecord> {
        let blocks = self.blocks.read();
        let mut records = Vec::new();

        for block in blocks.iter() {
            let block_hash = block.hash();
            for tx in block.txs() {
                let hash = tx.hash();
                if query.matches(tx, &hash) {
                    records.push(TxRecord {
                        hash,
                        tx: tx.clone(),
                        block_number: block.number(),
                        block_hash,
                    });
                }
            }
        }

        records
    }
}

/// Signed genesis file
pub struct GenesisStore {
    path: PathBuf,
}

impl GenesisStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn load(&self) -> Result<Option<SignedGenesis>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Write via a temporary file so a crash never leaves half a genesis
    pub fn store(&self, genesis: &SignedGenesis) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(genesis)?)?;
        fs::rename(&tmp, &self.path)?;

        tracing::info!("Stored genesis {} at {:?}", genesis.hash(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::types::{now_millis, Block, Genesis, Transaction};
    use tempfile::tempdir;

    fn chain(authority: &Identity, payer: &Identity, len: u64) -> Vec<SignedBlock> {
        let mut parent = Hash::digest(b"genesis");
        let mut blocks = Vec::new();
        for number in 1..=len {
            let tx = payer.sign_payload(Transaction::new(payer.address(), authority.address(), 1, number));
            let block = authority.sign_payload(Block {
                number,
                parent,
                timestamp: now_millis(),
                txs: vec![tx],
            });
            parent = block.hash();
            blocks.push(block);
        }
        blocks
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(BLOCK_LOG_FILE);
        let authority = Identity::generate().unwrap();
        let payer = Identity::generate().unwrap();
        let blocks = chain(&authority, &payer, 3);

        {
            let store = BlockStore::open(&path).unwrap();
            for block in &blocks {
                store.append(block).unwrap();
            }
            assert_eq!(store.last_number(), 3);
        }

        let store = BlockStore::open(&path).unwrap();
        assert_eq!(store.blocks(), blocks);
        assert_eq!(store.blocks_from(2), blocks[1..].to_vec());
        assert_eq!(store.get(3), Some(blocks[2].clone()));
        assert!(store.get(0).is_none());
        assert!(store.contains_hash(&blocks[0].hash()));
    }

    #[test]
    fn test_append_rejects_gaps() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path().join(BLOCK_LOG_FILE)).unwrap();
        let authority = Identity::generate().unwrap();
        let payer = Identity::generate().unwrap();
        let blocks = chain(&authority, &payer, 2);

        assert!(matches!(
            store.append(&blocks[1]),
            Err(StoreError::OutOfOrder { expected: 1, got: 2 })
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_corrupted_record_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(BLOCK_LOG_FILE);
        let authority = Identity::generate().unwrap();
        let payer = Identity::generate().unwrap();
        let block = chain(&authority, &payer, 1).remove(0);

        let record = BlockRecord {
            hash: Hash::digest(b"wrong"),
            block,
        };
        fs::write(&path, format!("{}\n", serde_json::to_string(&record).unwrap())).unwrap();
        assert!(matches!(
            BlockStore::open(&path),
            Err(StoreError::HashMismatch { line: 1, .. })
        ));

        fs::write(&path, "not json\n").unwrap();
        assert!(matches!(
            BlockStore::open(&path),
            Err(StoreError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_search() {
        let dir = tempdir().unwrap();
        let store = BlockStore::open(dir.path().join(BLOCK_LOG_FILE)).unwrap();
        let authority = Identity::generate().unwrap();
        let payer = Identity::generate().unwrap();
        let blocks = chain(&authority, &payer, 3);
        for block in &blocks {
            store.append(block).unwrap();
        }

        let by_number = store.search_blocks(&BlockQuery {
            number: Some(2),
            ..Default::default()
        });
        assert_eq!(by_number, vec![blocks[1].clone()]);

        let by_parent = store.search_blocks(&BlockQuery {
            parent_prefix: Some(blocks[1].hash().to_hex()[..8].to_string()),
            ..Default::default()
        });
        assert_eq!(by_parent, vec![blocks[2].clone()]);

        let by_account = store.search_transactions(&TxQuery {
            account: Some(authority.address()),
            ..Default::default()
        });
        assert_eq!(by_account.len(), 3);
        assert_eq!(by_account[2].block_number, 3);

        let wanted = blocks[0].txs()[0].hash();
        let by_hash = store.search_transactions(&TxQuery {
            hash: Some(wanted),
            ..Default::default()
        });
        assert_eq!(by_hash.len(), 1);
        assert_eq!(by_hash[0].block_hash, blocks[0].hash());

        let none = store.search_transactions(&TxQuery {
            from: Some(authority.address()),
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn test_genesis_store() {
        let dir = tempdir().unwrap();
        let store = GenesisStore::new(dir.path().join(GENESIS_FILE));
        assert!(store.load().unwrap().is_none());

        let authority = Identity::generate().unwrap();
        let genesis = authority.sign_payload(Genesis::new("test", authority.address(), 5));
        store.store(&genesis).unwrap();

        assert_eq!(store.load().unwrap(), Some(genesis));
    }
}
