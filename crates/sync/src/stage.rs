//! The stage contract.
//!
//! A stage moves the chain forward in its own dimension and can revert it
//! below a height that later proved bad. Dispatch is a small variant, not
//! a trait object: the pipeline has exactly these members and the loop
//! matches on them.

use chain::{BlockNum, Hash};

use crate::stage_bodies::BodiesStage;
use crate::stage_headers::HeadersStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Unspecified,
    Done,
    /// Unwind finished and moved the current point.
    DoneAndUpdated,
    UnwindNeeded,
    Error,
}

#[derive(Debug, Clone)]
pub struct StageResult {
    pub status: StageStatus,
    pub unwind_point: Option<BlockNum>,
    pub bad_block: Option<Hash>,
    pub current_point: Option<BlockNum>,
}

impl StageResult {
    pub fn done() -> Self {
        Self {
            status: StageStatus::Done,
            unwind_point: None,
            bad_block: None,
            current_point: None,
        }
    }

    pub fn done_and_updated(current_point: BlockNum) -> Self {
        Self {
            status: StageStatus::DoneAndUpdated,
            unwind_point: None,
            bad_block: None,
            current_point: Some(current_point),
        }
    }

    pub fn unwind_needed(unwind_point: BlockNum, bad_block: Option<Hash>) -> Self {
        Self {
            status: StageStatus::UnwindNeeded,
            unwind_point: Some(unwind_point),
            bad_block,
            current_point: None,
        }
    }

    pub fn error() -> Self {
        Self {
            status: StageStatus::Error,
            unwind_point: None,
            bad_block: None,
            current_point: None,
        }
    }
}

pub enum SyncStage {
    Headers(HeadersStage),
    Bodies(BodiesStage),
}

impl SyncStage {
    pub fn name(&self) -> &'static str {
        match self {
            SyncStage::Headers(_) => HeadersStage::NAME,
            SyncStage::Bodies(_) => BodiesStage::NAME,
        }
    }

    pub async fn forward(&mut self, first_sync: bool) -> StageResult {
        match self {
            SyncStage::Headers(stage) => stage.forward(first_sync).await,
            SyncStage::Bodies(stage) => stage.forward(first_sync).await,
        }
    }

    pub async fn unwind_to(&mut self, new_height: BlockNum, bad_block: Hash) -> StageResult {
        match self {
            SyncStage::Headers(stage) => stage.unwind_to(new_height, bad_block).await,
            SyncStage::Bodies(stage) => stage.unwind_to(new_height, bad_block).await,
        }
    }
}
