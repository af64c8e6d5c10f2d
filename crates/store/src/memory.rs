//! In-memory store backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use alloy_primitives::U256;
use chain::{BlockBody, BlockHeader, BlockNum, Hash};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{HeadInfo, StoreError, StoreReader};

#[derive(Debug, Default)]
struct Tables {
    headers: HashMap<Hash, BlockHeader>,
    total_difficulty: HashMap<Hash, U256>,
    canonical: BTreeMap<BlockNum, Hash>,
    bodies: HashMap<Hash, BlockBody>,
    progress: HashMap<String, BlockNum>,
    head: Option<HeadInfo>,
    fork_blocks: Vec<u64>,
}

/// In-memory chain database seeded with a genesis header.
#[derive(Clone)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    writer_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new(genesis: BlockHeader) -> Self {
        let genesis_hash = genesis.hash();
        let genesis_td = genesis.difficulty;
        let mut tables = Tables::default();
        tables.canonical.insert(0, genesis_hash);
        tables.total_difficulty.insert(genesis_hash, genesis_td);
        tables.headers.insert(genesis_hash, genesis);
        tables.head = Some(HeadInfo {
            hash: genesis_hash,
            td: genesis_td,
            height: 0,
        });
        Self {
            tables: Arc::new(RwLock::new(tables)),
            writer_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Start a read-write transaction. Blocks until the previous writer
    /// commits or is dropped; only one writer exists at a time.
    pub async fn begin_rw(&self) -> RwTx {
        let guard = Arc::clone(&self.writer_lock).lock_owned().await;
        RwTx {
            store: self.clone(),
            ops: Vec::new(),
            _guard: guard,
        }
    }

    /// Record the fork schedule at init (diagnostics only).
    pub fn write_fork_table(&self, fork_blocks: &[u64]) -> Result<(), StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?
            .fork_blocks = fork_blocks.to_vec();
        Ok(())
    }

    pub fn fork_table(&self) -> Result<Vec<u64>, StoreError> {
        Ok(self.read()?.fork_blocks.clone())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }
}

impl StoreReader for MemoryStore {
    fn header(&self, hash: &Hash) -> Result<Option<BlockHeader>, StoreError> {
        Ok(self.read()?.headers.get(hash).cloned())
    }

    fn total_difficulty(&self, hash: &Hash) -> Result<Option<U256>, StoreError> {
        Ok(self.read()?.total_difficulty.get(hash).copied())
    }

    fn canonical_hash(&self, number: BlockNum) -> Result<Option<Hash>, StoreError> {
        Ok(self.read()?.canonical.get(&number).copied())
    }

    fn body(&self, hash: &Hash) -> Result<Option<BlockBody>, StoreError> {
        Ok(self.read()?.bodies.get(hash).cloned())
    }

    fn head(&self) -> Result<HeadInfo, StoreError> {
        self.read()?
            .head
            .ok_or_else(|| StoreError::Inconsistent("head not initialized".to_string()))
    }

    fn stage_progress(&self, stage: &str) -> Result<BlockNum, StoreError> {
        Ok(self.read()?.progress.get(stage).copied().unwrap_or(0))
    }

    fn headers_without_bodies(
        &self,
        range: std::ops::RangeInclusive<BlockNum>,
    ) -> Result<Vec<(BlockNum, BlockHeader)>, StoreError> {
        let tables = self.read()?;
        let mut out = Vec::new();
        for (&number, hash) in tables.canonical.range(range) {
            if tables.bodies.contains_key(hash) {
                continue;
            }
            let header = tables.headers.get(hash).ok_or_else(|| {
                StoreError::Inconsistent(format!("canonical {number} has no header"))
            })?;
            out.push((number, header.clone()));
        }
        Ok(out)
    }
}

enum Op {
    PutHeader {
        hash: Hash,
        header: BlockHeader,
        td: U256,
    },
    PutCanonical(BlockNum, Hash),
    PutBody(Hash, BlockBody),
    SetHead(HeadInfo),
    SetStageProgress(String, BlockNum),
    RemoveCanonicalAbove(BlockNum),
    RemoveHeaders(Vec<Hash>),
    RemoveBodies(Vec<Hash>),
}

/// Staged write batch. Nothing is visible until [`RwTx::commit`]; dropping
/// the transaction discards the batch.
pub struct RwTx {
    store: MemoryStore,
    ops: Vec<Op>,
    _guard: OwnedMutexGuard<()>,
}

impl RwTx {
    pub fn put_header(&mut self, header: BlockHeader, td: U256) {
        self.ops.push(Op::PutHeader {
            hash: header.hash(),
            header,
            td,
        });
    }

    pub fn put_canonical(&mut self, number: BlockNum, hash: Hash) {
        self.ops.push(Op::PutCanonical(number, hash));
    }

    pub fn put_body(&mut self, hash: Hash, body: BlockBody) {
        self.ops.push(Op::PutBody(hash, body));
    }

    pub fn set_head(&mut self, head: HeadInfo) {
        self.ops.push(Op::SetHead(head));
    }

    pub fn set_stage_progress(&mut self, stage: &str, height: BlockNum) {
        self.ops.push(Op::SetStageProgress(stage.to_string(), height));
    }

    /// Stage removal of every canonical header above `new_height` and
    /// return the hashes that will disappear, highest first.
    pub fn unwind_headers_above(&mut self, new_height: BlockNum) -> Result<Vec<Hash>, StoreError> {
        let removed: Vec<Hash> = {
            let tables = self.store.read()?;
            tables
                .canonical
                .range(new_height + 1..)
                .rev()
                .map(|(_, hash)| *hash)
                .collect()
        };
        self.ops.push(Op::RemoveCanonicalAbove(new_height));
        self.ops.push(Op::RemoveHeaders(removed.clone()));
        Ok(removed)
    }

    /// Stage removal of bodies of canonical blocks above `new_height`.
    pub fn unwind_bodies_above(&mut self, new_height: BlockNum) -> Result<usize, StoreError> {
        let removed: Vec<Hash> = {
            let tables = self.store.read()?;
            tables
                .canonical
                .range(new_height + 1..)
                .filter(|(_, hash)| tables.bodies.contains_key(*hash))
                .map(|(_, hash)| *hash)
                .collect()
        };
        let count = removed.len();
        self.ops.push(Op::RemoveBodies(removed));
        Ok(count)
    }

    /// Apply all staged operations atomically.
    pub fn commit(self) -> Result<(), StoreError> {
        let mut tables = self
            .store
            .tables
            .write()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?;
        for op in self.ops {
            match op {
                Op::PutHeader { hash, header, td } => {
                    tables.total_difficulty.insert(hash, td);
                    tables.headers.insert(hash, header);
                }
                Op::PutCanonical(number, hash) => {
                    tables.canonical.insert(number, hash);
                }
                Op::PutBody(hash, body) => {
                    tables.bodies.insert(hash, body);
                }
                Op::SetHead(head) => tables.head = Some(head),
                Op::SetStageProgress(stage, height) => {
                    tables.progress.insert(stage, height);
                }
                Op::RemoveCanonicalAbove(height) => {
                    tables.canonical.retain(|&n, _| n <= height);
                }
                Op::RemoveHeaders(hashes) => {
                    for hash in hashes {
                        tables.headers.remove(&hash);
                        tables.total_difficulty.remove(&hash);
                    }
                }
                Op::RemoveBodies(hashes) => {
                    for hash in hashes {
                        tables.bodies.remove(&hash);
                    }
                }
            }
        }
        Ok(())
    }
}
