//! The block exchange: single coordinator for peer I/O.
//!
//! Owns the header chain, the body sequence, and every per-peer in-flight
//! counter. Inbound messages and stage commands arrive over channels; a
//! short tick drives request issuance and timeout sweeps. Nothing else
//! mutates the working sets, so no locks cross this boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chain::{BlockHeader, BlockNum, Hash};
use sentry::messages::{
    BlockBodiesPacket, BlockHeadersPacket, EthMessage, EthMessageId, HeaderOrigin,
    NewBlockHashesPacket, NewBlockPacket,
};
use sentry::{InboundMessage, Penalty, PenaltyReason, PeerId, SentryApi};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::body_sequence::{BodySequence, ReadyBlock};
use crate::error::SyncError;
use crate::header_chain::HeaderChain;

/// Upper bound on a single sentry send call.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Request-issuance and timeout-sweep cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(100);
/// Progress publication cadence.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Immutable tuning, built from the CLI once and passed in at
/// construction.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Blocks per outbound request.
    pub max_blocks_per_req: u64,
    /// In-flight requests allowed per peer.
    pub max_requests_per_peer: usize,
    /// Age at which an unanswered request is considered lost.
    pub request_deadline: Duration,
    /// Pause before re-issuing after a send reached no peer.
    pub no_peer_delay: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_req: 128,
            max_requests_per_peer: 4,
            request_deadline: Duration::from_secs(30),
            no_peer_delay: Duration::from_millis(1000),
        }
    }
}

/// Result of a `WithdrawReadyBodies` command.
#[derive(Debug, Default)]
pub struct BodyWithdrawal {
    pub blocks: Vec<ReadyBlock>,
    pub bad: Vec<(BlockNum, Hash)>,
}

enum ExchangeCommand {
    SyncHeaderChain {
        head: BlockHeader,
        reply: oneshot::Sender<()>,
    },
    WithdrawStableHeaders {
        max: usize,
        reply: oneshot::Sender<(Vec<BlockHeader>, bool)>,
    },
    MarkBadHeaders {
        bad: Vec<Hash>,
        reply: oneshot::Sender<()>,
    },
    SyncBodySequence {
        height: BlockNum,
        reply: oneshot::Sender<()>,
    },
    DownloadBodies {
        headers: Vec<(BlockNum, BlockHeader)>,
        reply: oneshot::Sender<()>,
    },
    WithdrawReadyBodies {
        max: usize,
        reply: oneshot::Sender<BodyWithdrawal>,
    },
    UnwindBodies {
        height: BlockNum,
        reply: oneshot::Sender<()>,
    },
}

/// Stage-side handle to the exchange. Commands execute on the exchange
/// task; every call resolves when the exchange has applied it.
#[derive(Clone)]
pub struct ExchangeHandle {
    cmd_tx: mpsc::Sender<ExchangeCommand>,
    stop: CancellationToken,
}

impl ExchangeHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ExchangeCommand,
    ) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .await
            .map_err(|_| SyncError::ExchangeStopped)?;
        rx.await.map_err(|_| SyncError::ExchangeStopped)
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub async fn sync_header_chain(&self, head: BlockHeader) -> Result<(), SyncError> {
        self.request(|reply| ExchangeCommand::SyncHeaderChain { head, reply })
            .await
    }

    /// Contiguous verified headers plus the in-sync flag.
    pub async fn withdraw_stable_headers(
        &self,
        max: usize,
    ) -> Result<(Vec<BlockHeader>, bool), SyncError> {
        self.request(|reply| ExchangeCommand::WithdrawStableHeaders { max, reply })
            .await
    }

    pub async fn mark_bad_headers(&self, bad: Vec<Hash>) -> Result<(), SyncError> {
        self.request(|reply| ExchangeCommand::MarkBadHeaders { bad, reply })
            .await
    }

    pub async fn sync_body_sequence(&self, height: BlockNum) -> Result<(), SyncError> {
        self.request(|reply| ExchangeCommand::SyncBodySequence { height, reply })
            .await
    }

    pub async fn download_bodies(
        &self,
        headers: Vec<(BlockNum, BlockHeader)>,
    ) -> Result<(), SyncError> {
        self.request(|reply| ExchangeCommand::DownloadBodies { headers, reply })
            .await
    }

    pub async fn withdraw_ready_bodies(&self, max: usize) -> Result<BodyWithdrawal, SyncError> {
        self.request(|reply| ExchangeCommand::WithdrawReadyBodies { max, reply })
            .await
    }

    pub async fn unwind_bodies(&self, height: BlockNum) -> Result<(), SyncError> {
        self.request(|reply| ExchangeCommand::UnwindBodies { height, reply })
            .await
    }
}

struct HeaderRequest {
    peers: Vec<PeerId>,
    issued_at: Instant,
}

pub struct BlockExchange<S> {
    sentry: Arc<S>,
    config: ExchangeConfig,
    header_chain: HeaderChain,
    body_sequence: BodySequence,
    inbound_rx: mpsc::Receiver<InboundMessage>,
    cmd_rx: mpsc::Receiver<ExchangeCommand>,
    /// In-flight request count per peer; owned and mutated only here.
    peers: HashMap<PeerId, usize>,
    header_requests: HashMap<u64, HeaderRequest>,
    next_request_id: u64,
    header_backoff_until: Option<Instant>,
    body_backoff_until: Option<Instant>,
    stop: CancellationToken,
}

impl<S: SentryApi> BlockExchange<S> {
    /// Returns the exchange, the stage-facing handle, and the sender the
    /// message loop feeds inbound traffic into.
    pub fn new(
        sentry: Arc<S>,
        config: ExchangeConfig,
        stop: CancellationToken,
    ) -> (Self, ExchangeHandle, mpsc::Sender<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let handle = ExchangeHandle {
            cmd_tx,
            stop: stop.clone(),
        };
        let exchange = Self {
            header_chain: HeaderChain::new(config.max_blocks_per_req, config.request_deadline),
            body_sequence: BodySequence::new(config.max_blocks_per_req, config.request_deadline),
            sentry,
            config,
            inbound_rx,
            cmd_rx,
            peers: HashMap::new(),
            header_requests: HashMap::new(),
            next_request_id: 1,
            header_backoff_until: None,
            body_backoff_until: None,
            stop,
        };
        (exchange, handle, inbound_tx)
    }

    pub async fn execution_loop(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
        progress.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("block exchange started");
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    // Drain and discard whatever the intake loop queued.
                    while self.inbound_rx.try_recv().is_ok() {}
                    break;
                }
                Some(message) = self.inbound_rx.recv() => self.on_inbound(message).await,
                Some(command) = self.cmd_rx.recv() => self.on_command(command),
                _ = tick.tick() => self.on_tick().await,
                _ = progress.tick() => self.publish_progress(),
            }
        }
        info!("block exchange stopped");
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    async fn on_inbound(&mut self, message: InboundMessage) {
        let peer = message.peer;
        self.peers.entry(peer).or_insert(0);

        match message.id {
            EthMessageId::BlockHeaders => match BlockHeadersPacket::decode(&message.data) {
                Ok(packet) => self.on_block_headers(peer, packet).await,
                Err(e) => {
                    warn!(peer = %peer_tag(&peer), err = %e, "malformed BlockHeaders");
                    self.penalize(peer, PenaltyReason::BadProtocol).await;
                }
            },
            EthMessageId::BlockBodies => match BlockBodiesPacket::decode(&message.data) {
                Ok(packet) => self.on_block_bodies(peer, packet).await,
                Err(e) => {
                    warn!(peer = %peer_tag(&peer), err = %e, "malformed BlockBodies");
                    self.penalize(peer, PenaltyReason::BadProtocol).await;
                }
            },
            EthMessageId::NewBlockHashes => match NewBlockHashesPacket::decode(&message.data) {
                Ok(packet) => {
                    for (_, number) in packet.entries {
                        self.header_chain.top_seen_from_announcement(number);
                    }
                }
                Err(e) => {
                    warn!(peer = %peer_tag(&peer), err = %e, "malformed NewBlockHashes");
                    self.penalize(peer, PenaltyReason::BadProtocol).await;
                }
            },
            EthMessageId::NewBlock => match NewBlockPacket::decode(&message.data) {
                Ok(packet) => {
                    self.header_chain
                        .top_seen_from_announcement(packet.header.number);
                }
                Err(e) => {
                    warn!(peer = %peer_tag(&peer), err = %e, "malformed NewBlock");
                    self.penalize(peer, PenaltyReason::BadProtocol).await;
                }
            },
            // We do not serve; the sentry answers trivial queries itself.
            EthMessageId::GetBlockHeaders | EthMessageId::GetBlockBodies => {
                trace!(peer = %peer_tag(&peer), id = ?message.id, "ignoring peer query");
            }
        }
    }

    async fn on_block_headers(&mut self, peer: PeerId, packet: BlockHeadersPacket) {
        if let Some(request) = self.header_requests.remove(&packet.request_id) {
            for p in &request.peers {
                self.release_peer(p);
            }
        }
        debug!(
            peer = %peer_tag(&peer),
            request_id = packet.request_id,
            count = packet.headers.len(),
            "received block headers"
        );
        let penalties = self.header_chain.new_headers(peer, packet.headers);
        self.apply_penalties(penalties).await;
    }

    async fn on_block_bodies(&mut self, peer: PeerId, packet: BlockBodiesPacket) {
        debug!(
            peer = %peer_tag(&peer),
            request_id = packet.request_id,
            count = packet.bodies.len(),
            "received block bodies"
        );
        let (penalties, released) =
            self.body_sequence
                .accept_bodies(peer, packet.request_id, packet.bodies);
        if let Some(p) = released {
            self.release_peer(&p);
        }
        self.apply_penalties(penalties).await;
    }

    fn on_command(&mut self, command: ExchangeCommand) {
        match command {
            ExchangeCommand::SyncHeaderChain { head, reply } => {
                self.header_chain.sync_current_state(head);
                let _ = reply.send(());
            }
            ExchangeCommand::WithdrawStableHeaders { max, reply } => {
                let headers = self.header_chain.withdraw_stable_headers(max);
                let _ = reply.send((headers, self.header_chain.in_sync()));
            }
            ExchangeCommand::MarkBadHeaders { bad, reply } => {
                self.header_chain.add_bad_headers(bad);
                let _ = reply.send(());
            }
            ExchangeCommand::SyncBodySequence { height, reply } => {
                self.body_sequence.sync_current_state(height);
                let _ = reply.send(());
            }
            ExchangeCommand::DownloadBodies { headers, reply } => {
                self.body_sequence.download_bodies(headers);
                let _ = reply.send(());
            }
            ExchangeCommand::WithdrawReadyBodies { max, reply } => {
                let (blocks, bad) = self.body_sequence.withdraw_ready(max);
                let _ = reply.send(BodyWithdrawal { blocks, bad });
            }
            ExchangeCommand::UnwindBodies { height, reply } => {
                self.body_sequence.unwind_to(height);
                let _ = reply.send(());
            }
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();
        self.expire_requests(now).await;
        self.issue_header_request(now).await;
        self.issue_body_requests(now).await;
    }

    async fn expire_requests(&mut self, now: Instant) {
        let deadline = self.config.request_deadline;
        let expired: Vec<u64> = self
            .header_requests
            .iter()
            .filter(|(_, req)| now.duration_since(req.issued_at) >= deadline)
            .map(|(&id, _)| id)
            .collect();
        for id in expired {
            if let Some(req) = self.header_requests.remove(&id) {
                debug!(request_id = id, "header request timed out");
                for p in &req.peers {
                    self.release_peer(p);
                }
            }
        }

        let (penalties, released) = self.body_sequence.expire_requests(now);
        for p in &released {
            self.release_peer(p);
        }
        self.apply_penalties(penalties).await;
    }

    async fn issue_header_request(&mut self, now: Instant) {
        if self.backing_off(self.header_backoff_until, now) || self.all_peers_saturated() {
            return;
        }
        let request_id = self.next_id();
        let Some(packet) = self.header_chain.request_more_headers(now, request_id) else {
            return;
        };
        let origin = packet.origin;
        trace!(request_id, amount = packet.amount, "requesting headers");

        match self
            .sentry
            .send_message_to_random(&EthMessage::GetBlockHeaders(packet), 1, SEND_TIMEOUT)
            .await
        {
            Ok(peers) if peers.is_empty() => {
                debug!("no peer took the header request, backing off");
                self.defer_header_origin(origin, now);
            }
            Ok(peers) => {
                for p in &peers {
                    *self.peers.entry(*p).or_insert(0) += 1;
                }
                self.header_requests.insert(
                    request_id,
                    HeaderRequest {
                        peers,
                        issued_at: now,
                    },
                );
            }
            Err(e) => {
                warn!(err = %e, "header request send failed");
                self.defer_header_origin(origin, now);
            }
        }
    }

    /// Back off the request source that reached no peer; only that source
    /// waits, everything else stays on its own timer.
    fn defer_header_origin(&mut self, origin: HeaderOrigin, now: Instant) {
        let retry_at = now + self.config.no_peer_delay;
        match origin {
            HeaderOrigin::Hash(anchor) => self.header_chain.defer_anchor_retry(anchor, retry_at),
            HeaderOrigin::Number(_) => self.header_chain.defer_forward_retry(retry_at),
        }
        self.header_backoff_until = Some(retry_at);
    }

    async fn issue_body_requests(&mut self, now: Instant) {
        if self.backing_off(self.body_backoff_until, now) {
            return;
        }
        loop {
            let target = self.pick_body_peer();
            if target.is_none() && !self.peers.is_empty() {
                // Every known peer is at its in-flight cap.
                return;
            }
            let request_id = self.next_id();
            let Some((packet, block_nums)) = self.body_sequence.request_more_bodies(now, request_id)
            else {
                return;
            };
            trace!(request_id, blocks = block_nums.len(), "requesting bodies");
            let message = EthMessage::GetBlockBodies(packet);

            let sent = match target {
                Some(peer) => self.sentry.send_message_by_id(peer, &message, SEND_TIMEOUT).await,
                None => {
                    self.sentry
                        .send_message_to_random(&message, 1, SEND_TIMEOUT)
                        .await
                }
            };

            match sent {
                Ok(peers) if peers.is_empty() => {
                    debug!("no peer took the body request, backing off");
                    self.body_sequence.cancel_request(&block_nums);
                    self.body_backoff_until = Some(now + self.config.no_peer_delay);
                    return;
                }
                Ok(peers) => {
                    for p in &peers {
                        *self.peers.entry(*p).or_insert(0) += 1;
                    }
                    self.body_sequence
                        .note_request_sent(request_id, peers[0], block_nums, now);
                }
                Err(e) => {
                    warn!(err = %e, "body request send failed");
                    self.body_sequence.cancel_request(&block_nums);
                    self.body_backoff_until = Some(now + self.config.no_peer_delay);
                    return;
                }
            }
        }
    }

    fn pick_body_peer(&self) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|(_, &count)| count < self.config.max_requests_per_peer)
            .min_by_key(|(_, &count)| count)
            .map(|(peer, _)| *peer)
    }

    fn all_peers_saturated(&self) -> bool {
        !self.peers.is_empty()
            && self
                .peers
                .values()
                .all(|&count| count >= self.config.max_requests_per_peer)
    }

    fn backing_off(&self, until: Option<Instant>, now: Instant) -> bool {
        until.is_some_and(|t| now < t)
    }

    fn release_peer(&mut self, peer: &PeerId) {
        if let Some(count) = self.peers.get_mut(peer) {
            *count = count.saturating_sub(1);
        }
    }

    async fn apply_penalties(&mut self, penalties: Vec<Penalty>) {
        for penalty in penalties {
            self.penalize(penalty.peer, penalty.reason).await;
        }
    }

    async fn penalize(&mut self, peer: PeerId, reason: PenaltyReason) {
        debug!(peer = %peer_tag(&peer), reason = reason.as_str(), "penalizing peer");
        if let Err(e) = self.sentry.penalize_peer(peer, reason).await {
            warn!(err = %e, "penalize call failed");
        }
    }

    fn publish_progress(&self) {
        let headers = self.header_chain.stats();
        let bodies = self.body_sequence.stats();
        info!(
            top_seen = headers.top_seen,
            anchors = headers.anchors,
            links = headers.links,
            headers_in_db = headers.highest_in_db,
            bodies_in_db = bodies.highest_body_in_db,
            body_backlog = bodies.pending,
            in_flight = self.peers.values().sum::<usize>(),
            "download progress"
        );
    }
}

fn peer_tag(peer: &PeerId) -> String {
    hex::encode(&peer[..8])
}
