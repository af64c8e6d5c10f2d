//! Stage 2: body download.
//!
//! Feeds the body sequence with persisted headers that still lack bodies,
//! then drains matched bodies into the database in batches keyed by
//! header hash. A block the network refuses to supply a root-matching
//! body for is reported as `UnwindNeeded` with the offending header.

use std::time::{Duration, Instant};

use chain::{BlockNum, Hash};
use store::{MemoryStore, StoreReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::SyncError;
use crate::exchange::ExchangeHandle;
use crate::stage::StageResult;
use crate::stage_headers::HeadersStage;

/// Blocks pulled per withdrawal round.
const WITHDRAW_MAX: usize = 4_096;
/// Pause between empty withdrawal rounds.
const WITHDRAW_POLL: Duration = Duration::from_millis(500);
/// Blocks per database batch.
const BATCH_BLOCKS: usize = 1_024;
/// Progress log cadence.
const PROGRESS_EVERY: Duration = Duration::from_secs(30);

pub struct BodiesStage {
    store: MemoryStore,
    exchange: ExchangeHandle,
    stop: CancellationToken,
}

impl BodiesStage {
    pub const NAME: &'static str = "Bodies";

    pub fn new(store: MemoryStore, exchange: ExchangeHandle, stop: CancellationToken) -> Self {
        Self {
            store,
            exchange,
            stop,
        }
    }

    pub async fn forward(&mut self, _first_sync: bool) -> StageResult {
        let started = Instant::now();
        info!("[2/2 Bodies] start");

        match self.forward_inner().await {
            Ok(result) => {
                info!(elapsed = ?started.elapsed(), "[2/2 Bodies] done");
                result
            }
            Err(SyncError::ExchangeStopped) => {
                info!("[2/2 Bodies] stopped");
                StageResult::done()
            }
            Err(e) => {
                error!(err = %e, "[2/2 Bodies] aborted");
                StageResult::error()
            }
        }
    }

    async fn forward_inner(&mut self) -> Result<StageResult, SyncError> {
        let target_height = self.store.stage_progress(HeadersStage::NAME)?;
        let mut body_height = self.store.stage_progress(Self::NAME)?;

        self.exchange.sync_body_sequence(body_height).await?;
        if body_height >= target_height {
            return Ok(StageResult::done());
        }

        // The sequence pre-fills bodies it can derive from the header
        // roots (empty blocks); the rest matches on arrival.
        let missing = self
            .store
            .headers_without_bodies(body_height + 1..=target_height)?;
        info!(
            from = body_height,
            to = target_height,
            missing = missing.len(),
            "[2/2 Bodies] waiting for bodies"
        );
        self.exchange.download_bodies(missing).await?;

        let mut last_progress = Instant::now();
        while body_height < target_height && !self.stop.is_cancelled() {
            let withdrawal = self.exchange.withdraw_ready_bodies(WITHDRAW_MAX).await?;

            if let Some(&(bad_num, bad_hash)) = withdrawal.bad.first() {
                info!(bad_num, "[2/2 Bodies] unwind needed");
                return Ok(StageResult::unwind_needed(
                    bad_num.saturating_sub(1),
                    Some(bad_hash),
                ));
            }

            if withdrawal.blocks.is_empty() {
                body_height = self.advance_over_stored(body_height, target_height).await?;
                if body_height >= target_height {
                    break;
                }
                tokio::time::sleep(WITHDRAW_POLL).await;
                continue;
            }

            for chunk in withdrawal.blocks.chunks(BATCH_BLOCKS) {
                let mut tx = self.store.begin_rw().await;
                let mut last = body_height;
                for block in chunk {
                    tx.put_body(block.hash, block.body.clone());
                    last = block.block_num;
                }
                tx.set_stage_progress(Self::NAME, last);
                tx.commit()?;
                body_height = last;
            }

            if last_progress.elapsed() > PROGRESS_EVERY {
                last_progress = Instant::now();
                info!(height = body_height, "[2/2 Bodies] wrote block bodies");
            }
        }

        info!(height = body_height, "[2/2 Bodies] download completed");
        Ok(StageResult::done())
    }

    /// Advance progress over blocks whose bodies are already in the db
    /// (re-runs after a crash between the body batch and the progress
    /// record).
    async fn advance_over_stored(
        &mut self,
        mut body_height: BlockNum,
        target_height: BlockNum,
    ) -> Result<BlockNum, SyncError> {
        let mut advanced = false;
        while body_height < target_height {
            let next = body_height + 1;
            let Some(hash) = self.store.canonical_hash(next)? else {
                break;
            };
            if !self.store.has_body(&hash)? {
                break;
            }
            body_height = next;
            advanced = true;
        }
        if advanced {
            let mut tx = self.store.begin_rw().await;
            tx.set_stage_progress(Self::NAME, body_height);
            tx.commit()?;
            // Keep the sequence's floor in step with ours.
            self.exchange.sync_body_sequence(body_height).await?;
        }
        Ok(body_height)
    }

    pub async fn unwind_to(&mut self, new_height: BlockNum, _bad_block: Hash) -> StageResult {
        info!(new_height, "[2/2 Bodies] unwind start");
        match self.unwind_inner(new_height).await {
            Ok(result) => result,
            Err(SyncError::ExchangeStopped) => StageResult::done(),
            Err(e) => {
                error!(err = %e, "[2/2 Bodies] unwind aborted");
                StageResult::error()
            }
        }
    }

    async fn unwind_inner(&mut self, new_height: BlockNum) -> Result<StageResult, SyncError> {
        let mut tx = self.store.begin_rw().await;
        let removed = tx.unwind_bodies_above(new_height)?;
        let progress = self.store.stage_progress(Self::NAME)?;
        tx.set_stage_progress(Self::NAME, progress.min(new_height));
        tx.commit()?;

        self.exchange.unwind_bodies(new_height).await?;

        info!(new_height, removed, "[2/2 Bodies] unwind completed");
        Ok(StageResult::done_and_updated(new_height))
    }
}
