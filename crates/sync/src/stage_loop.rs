//! Forward/unwind orchestration.
//!
//! Stages run forward in index order; the first `UnwindNeeded` switches
//! the loop into a reverse sweep from the reporting stage down to stage
//! zero, inclusive. A stage that fails to unwind leaves the database in
//! an unknown split state, so the loop dies on it.

use chain::{BlockNum, Hash};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::stage::{StageResult, StageStatus, SyncStage};

/// Loop state, observable for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Forwarding,
    Unwinding,
    Done,
    Error,
}

pub struct StageLoop {
    stages: Vec<SyncStage>,
    state: SyncState,
    stop: CancellationToken,
}

impl StageLoop {
    pub fn new(stages: Vec<SyncStage>, stop: CancellationToken) -> Self {
        Self {
            stages,
            state: SyncState::Idle,
            stop,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Run until a fatal error or shutdown. Returns the terminal state.
    pub async fn run(&mut self) -> SyncState {
        let mut first_sync = true;

        loop {
            if self.stop.is_cancelled() {
                self.state = SyncState::Done;
                break;
            }

            self.state = SyncState::Forwarding;
            let (result, last_stage) = self.forward_all(first_sync).await;

            match result.status {
                StageStatus::UnwindNeeded => {
                    let Some(unwind_point) = result.unwind_point else {
                        error!("unwind requested without an unwind point");
                        self.state = SyncState::Error;
                        break;
                    };
                    self.state = SyncState::Unwinding;
                    let unwound = self
                        .unwind_all(last_stage, unwind_point, result.bad_block.unwrap_or_default())
                        .await;
                    if unwound.status == StageStatus::Error {
                        error!("partial unwind, stopping");
                        self.state = SyncState::Error;
                        break;
                    }
                    self.state = SyncState::Idle;
                }
                StageStatus::Error => {
                    self.state = SyncState::Error;
                    break;
                }
                _ => {
                    if self.stop.is_cancelled() {
                        self.state = SyncState::Done;
                        break;
                    }
                    self.state = SyncState::Idle;
                }
            }

            first_sync = false;
        }

        info!(state = ?self.state, "stage loop ended");
        self.state
    }

    /// Stages in index order; stops at the first unwind request or error.
    async fn forward_all(&mut self, first_sync: bool) -> (StageResult, usize) {
        let mut result = StageResult::done();
        for index in 0..self.stages.len() {
            info!(stage = self.stages[index].name(), "forward");
            result = self.stages[index].forward(first_sync).await;
            match result.status {
                StageStatus::UnwindNeeded | StageStatus::Error => return (result, index),
                _ => {}
            }
        }
        (result, self.stages.len().saturating_sub(1))
    }

    /// Reverse sweep from `last_stage` down to stage zero inclusive.
    async fn unwind_all(
        &mut self,
        last_stage: usize,
        unwind_point: BlockNum,
        bad_block: Hash,
    ) -> StageResult {
        let mut result = StageResult::done();
        for index in (0..=last_stage).rev() {
            info!(stage = self.stages[index].name(), unwind_point, "unwind");
            result = self.stages[index].unwind_to(unwind_point, bad_block).await;
            if result.status == StageStatus::Error {
                return result;
            }
        }
        result
    }
}
