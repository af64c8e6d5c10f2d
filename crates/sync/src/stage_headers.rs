//! Stage 1: header download.
//!
//! Pulls contiguous verified header runs from the exchange, checks their
//! linkage against the database tip and persists them in bounded batches
//! together with the canonical mapping and the head triple. A conflict
//! with already-canonical headers on a heavier chain surfaces as
//! `UnwindNeeded`.

use std::time::{Duration, Instant};

use alloy_primitives::U256;
use chain::{BlockHeader, BlockNum, Hash};
use store::{HeadInfo, MemoryStore, StoreError, StoreReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::exchange::ExchangeHandle;
use crate::stage::StageResult;

/// Headers pulled per withdrawal round.
const WITHDRAW_MAX: usize = 65_536;
/// Pause between empty withdrawal rounds.
const WITHDRAW_POLL: Duration = Duration::from_millis(500);
/// Rough byte budget per database batch.
const BATCH_BYTE_BUDGET: usize = 512 * 1024;
/// Progress log cadence.
const PROGRESS_EVERY: Duration = Duration::from_secs(30);

pub struct HeadersStage {
    store: MemoryStore,
    exchange: ExchangeHandle,
    stop: CancellationToken,
}

impl HeadersStage {
    pub const NAME: &'static str = "Headers";

    pub fn new(store: MemoryStore, exchange: ExchangeHandle, stop: CancellationToken) -> Self {
        Self {
            store,
            exchange,
            stop,
        }
    }

    pub async fn forward(&mut self, first_sync: bool) -> StageResult {
        let started = Instant::now();
        info!("[1/2 Headers] start");

        match self.forward_inner(first_sync).await {
            Ok(result) => {
                info!(elapsed = ?started.elapsed(), "[1/2 Headers] done");
                result
            }
            Err(SyncError::ExchangeStopped) => {
                info!("[1/2 Headers] stopped");
                StageResult::done()
            }
            Err(e) => {
                error!(err = %e, "[1/2 Headers] aborted");
                StageResult::error()
            }
        }
    }

    async fn forward_inner(&mut self, first_sync: bool) -> Result<StageResult, SyncError> {
        let head = self.store.head()?;
        let head_header = self
            .store
            .header(&head.hash)?
            .ok_or_else(|| StoreError::Inconsistent("head header missing".to_string()))?;

        self.exchange.sync_header_chain(head_header).await?;
        info!(from = head.height, "[1/2 Headers] waiting for headers");

        let mut persistence = HeaderPersistence::new(self.store.clone(), head);
        let mut last_progress = Instant::now();
        let mut reached_target = false;

        while !reached_target && !self.stop.is_cancelled() {
            let (headers, in_sync) = self.exchange.withdraw_stable_headers(WITHDRAW_MAX).await?;

            if headers.is_empty() {
                tokio::time::sleep(WITHDRAW_POLL).await;
            } else {
                persistence.persist(&headers).await?;
                if persistence.unwind_needed() {
                    break;
                }
            }

            // First sync wants to drain as much as possible in one pass;
            // at the tip we react to any advancement.
            reached_target = if first_sync {
                in_sync && persistence.advanced()
            } else {
                persistence.advanced()
            };

            if last_progress.elapsed() > PROGRESS_EVERY {
                last_progress = Instant::now();
                info!(
                    height = persistence.highest(),
                    "[1/2 Headers] wrote block headers"
                );
            }
        }

        persistence.flush().await?;

        if let Some((unwind_point, bad_block)) = persistence.unwind() {
            info!(unwind_point, "[1/2 Headers] unwind needed");
            return Ok(StageResult::unwind_needed(unwind_point, bad_block));
        }

        info!(
            headers = persistence.written(),
            last = persistence.highest(),
            "[1/2 Headers] downloading completed"
        );
        Ok(StageResult::done())
    }

    pub async fn unwind_to(&mut self, new_height: BlockNum, bad_block: Hash) -> StageResult {
        info!(new_height, "[1/2 Headers] unwind start");
        match self.unwind_inner(new_height, bad_block).await {
            Ok(result) => result,
            Err(SyncError::ExchangeStopped) => StageResult::done(),
            Err(e) => {
                error!(err = %e, "[1/2 Headers] unwind aborted");
                StageResult::error()
            }
        }
    }

    async fn unwind_inner(
        &mut self,
        new_height: BlockNum,
        bad_block: Hash,
    ) -> Result<StageResult, SyncError> {
        let mut tx = self.store.begin_rw().await;
        let mut removed = tx.unwind_headers_above(new_height)?;
        if !removed.contains(&bad_block) {
            removed.push(bad_block);
        }

        let new_head_hash = self.store.canonical_hash(new_height)?.ok_or_else(|| {
            StoreError::Inconsistent(format!("no canonical hash at {new_height}"))
        })?;
        let new_head_td = self
            .store
            .total_difficulty(&new_head_hash)?
            .ok_or_else(|| StoreError::Inconsistent(format!("no td for {new_head_hash}")))?;

        tx.set_head(HeadInfo {
            hash: new_head_hash,
            td: new_head_td,
            height: new_height,
        });
        tx.set_stage_progress(Self::NAME, new_height);
        tx.commit()?;

        info!(
            new_height,
            removed = removed.len(),
            "[1/2 Headers] unwind completed"
        );
        // Keep the working set from re-adopting the removed chain.
        self.exchange.mark_bad_headers(removed).await?;

        Ok(StageResult::done_and_updated(new_height))
    }
}

/// Batched header persistence with reorg detection.
struct HeaderPersistence {
    store: MemoryStore,
    /// Last persisted header on the chain being extended.
    tip_hash: Hash,
    tip_td: U256,
    initial_height: BlockNum,
    highest: BlockNum,
    written: u64,
    batch: Vec<(BlockHeader, U256)>,
    batch_bytes: usize,
    unwind: Option<(BlockNum, Option<Hash>)>,
}

impl HeaderPersistence {
    fn new(store: MemoryStore, head: HeadInfo) -> Self {
        Self {
            store,
            tip_hash: head.hash,
            tip_td: head.td,
            initial_height: head.height,
            highest: head.height,
            written: 0,
            batch: Vec::new(),
            batch_bytes: 0,
            unwind: None,
        }
    }

    fn unwind_needed(&self) -> bool {
        self.unwind.is_some()
    }

    fn unwind(&self) -> Option<(BlockNum, Option<Hash>)> {
        self.unwind
    }

    fn advanced(&self) -> bool {
        self.highest > self.initial_height
    }

    fn highest(&self) -> BlockNum {
        self.highest
    }

    fn written(&self) -> u64 {
        self.written
    }

    async fn persist(&mut self, headers: &[BlockHeader]) -> Result<(), SyncError> {
        for header in headers {
            if self.unwind.is_some() {
                break;
            }
            self.persist_one(header).await?;
        }
        if self.batch_bytes >= BATCH_BYTE_BUDGET {
            self.flush().await?;
        }
        Ok(())
    }

    async fn persist_one(&mut self, header: &BlockHeader) -> Result<(), SyncError> {
        let hash = header.hash();
        let number = header.number;

        // Withdrawn runs are parent-linked; the first header of a run must
        // link the persisted tip or it belongs to another chain.
        if header.parent_hash != self.tip_hash || number != self.highest + 1 {
            if self.is_heavier_fork(header)? {
                // A heavier chain branches below our tip: revert to the
                // fork point and let the next forward pass adopt it.
                warn!(
                    number,
                    "canonical conflict with heavier chain, requesting unwind"
                );
                self.unwind = Some((number.saturating_sub(1), Some(hash)));
            } else {
                debug!(number, "dropping non-linking header run");
            }
            return Ok(());
        }

        let td = self.tip_td + header.difficulty;
        self.batch_bytes += header.rlp_encode().len();
        self.batch.push((header.clone(), td));
        self.tip_hash = hash;
        self.tip_td = td;
        self.highest = number;
        self.written += 1;

        if self.batch_bytes >= BATCH_BYTE_BUDGET {
            self.flush().await?;
        }
        Ok(())
    }

    /// Does `header` fork the canonical chain below our tip with more
    /// cumulative work behind it?
    fn is_heavier_fork(&self, header: &BlockHeader) -> Result<bool, SyncError> {
        if header.number > self.highest {
            return Ok(false);
        }
        let canonical = self.store.canonical_hash(header.number)?;
        if canonical == Some(header.hash()) {
            return Ok(false);
        }
        let parent_td = self.store.total_difficulty(&header.parent_hash)?;
        match parent_td {
            Some(parent_td) => Ok(parent_td + header.difficulty > self.tip_td),
            None => Ok(false),
        }
    }

    /// Commit the batch: headers, canonical mapping and head move together.
    async fn flush(&mut self) -> Result<(), SyncError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.store.begin_rw().await;
        for (header, td) in self.batch.drain(..) {
            tx.put_canonical(header.number, header.hash());
            tx.put_header(header, td);
        }
        tx.set_head(HeadInfo {
            hash: self.tip_hash,
            td: self.tip_td,
            height: self.highest,
        });
        tx.set_stage_progress(HeadersStage::NAME, self.highest);
        tx.commit()?;
        self.batch_bytes = 0;
        debug!(height = self.highest, "header batch committed");
        Ok(())
    }
}
