//! Pending-body tracker.
//!
//! Persisted headers lacking bodies are admitted as pending entries keyed
//! by height. Requests go out in hash batches; replies are matched purely
//! by root pair (transactions trie root, uncle list hash), so partial and
//! out-of-order deliveries are fine. Entries that keep yielding bodies
//! with the wrong roots are flagged bad and surface as an unwind.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use chain::{BlockBody, BlockHeader, BlockNum, Hash};
use sentry::messages::GetBlockBodiesPacket;
use sentry::{Penalty, PenaltyReason, PeerId};
use tracing::{debug, trace, warn};

/// Delivered-but-mismatched bodies tolerated per entry before the header
/// itself is considered bad.
const MAX_BODY_MISMATCHES: u32 = 3;

#[derive(Debug, Clone)]
struct PendingBody {
    hash: Hash,
    tx_root: Hash,
    uncle_root: Hash,
    body: Option<BlockBody>,
    /// Gate for re-issuing; None means never asked (or reset for retry).
    last_request_at: Option<Instant>,
    mismatches: u32,
    bad: bool,
}

/// An issued `GetBlockBodies` awaiting its reply.
#[derive(Debug, Clone)]
pub struct OutstandingRequest {
    pub request_id: u64,
    pub peer: PeerId,
    pub block_nums: Vec<BlockNum>,
    pub issued_at: Instant,
}

/// A block ready for persistence.
#[derive(Debug, Clone)]
pub struct ReadyBlock {
    pub block_num: BlockNum,
    pub hash: Hash,
    pub body: BlockBody,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BodySequenceStats {
    pub pending: usize,
    pub ready: usize,
    pub outstanding_requests: usize,
    pub highest_body_in_db: BlockNum,
}

pub struct BodySequence {
    pending: BTreeMap<BlockNum, PendingBody>,
    outstanding: HashMap<u64, OutstandingRequest>,
    in_flight: HashSet<BlockNum>,
    highest_body_in_db: BlockNum,
    max_blocks_per_req: u64,
    request_deadline: Duration,
}

impl BodySequence {
    pub fn new(max_blocks_per_req: u64, request_deadline: Duration) -> Self {
        Self {
            pending: BTreeMap::new(),
            outstanding: HashMap::new(),
            in_flight: HashSet::new(),
            highest_body_in_db: 0,
            max_blocks_per_req,
            request_deadline,
        }
    }

    /// Reset on the bodies-stage progress height.
    pub fn sync_current_state(&mut self, highest_body_in_db: BlockNum) {
        self.highest_body_in_db = highest_body_in_db;
        self.pending.retain(|&num, _| num > highest_body_in_db);
    }

    /// Drop all working state above `new_height` (unwind support).
    pub fn unwind_to(&mut self, new_height: BlockNum) {
        self.highest_body_in_db = self.highest_body_in_db.min(new_height);
        self.pending.retain(|&num, _| num <= new_height);
        self.in_flight.retain(|num| *num <= new_height);
        self.outstanding
            .retain(|_, req| req.block_nums.iter().any(|n| *n <= new_height));
    }

    /// Admit persisted headers awaiting bodies. Headers whose roots are
    /// the empty-transactions and empty-uncles constants need no network
    /// round trip; their body is pre-filled.
    pub fn download_bodies(&mut self, headers: Vec<(BlockNum, BlockHeader)>) {
        for (block_num, header) in headers {
            if block_num <= self.highest_body_in_db || self.pending.contains_key(&block_num) {
                continue;
            }
            let empty = header.transactions_root == chain::trie::empty_trie_hash()
                && header.uncle_hash == chain::types::empty_uncle_hash();
            self.pending.insert(
                block_num,
                PendingBody {
                    hash: header.hash(),
                    tx_root: header.transactions_root,
                    uncle_root: header.uncle_hash,
                    body: empty.then(BlockBody::default),
                    last_request_at: None,
                    mismatches: 0,
                    bad: false,
                },
            );
        }
    }

    /// Blocks that still need a body and are not covered by a live request.
    pub fn backlog(&self) -> usize {
        self.pending
            .iter()
            .filter(|(num, p)| p.body.is_none() && !p.bad && !self.in_flight.contains(num))
            .count()
    }

    /// Build the next request of up to `max_blocks_per_req` eligible
    /// hashes. The caller confirms dispatch with [`note_request_sent`] or
    /// abandons it with [`cancel_request`]; the pending-request invariant
    /// (one live request per block) is kept by the `in_flight` set.
    ///
    /// [`note_request_sent`]: BodySequence::note_request_sent
    /// [`cancel_request`]: BodySequence::cancel_request
    pub fn request_more_bodies(
        &mut self,
        now: Instant,
        request_id: u64,
    ) -> Option<(GetBlockBodiesPacket, Vec<BlockNum>)> {
        let deadline = self.request_deadline;
        let mut hashes = Vec::new();
        let mut block_nums = Vec::new();

        for (&num, entry) in self.pending.iter() {
            if hashes.len() as u64 >= self.max_blocks_per_req {
                break;
            }
            if entry.body.is_some() || entry.bad || self.in_flight.contains(&num) {
                continue;
            }
            let stale = match entry.last_request_at {
                None => true,
                Some(at) => now.duration_since(at) >= deadline,
            };
            if !stale {
                continue;
            }
            hashes.push(entry.hash);
            block_nums.push(num);
        }

        if hashes.is_empty() {
            return None;
        }
        for num in &block_nums {
            if let Some(entry) = self.pending.get_mut(num) {
                entry.last_request_at = Some(now);
            }
        }
        Some((
            GetBlockBodiesPacket { request_id, hashes },
            block_nums,
        ))
    }

    /// Record a dispatched request against the peer that took it.
    pub fn note_request_sent(
        &mut self,
        request_id: u64,
        peer: PeerId,
        block_nums: Vec<BlockNum>,
        now: Instant,
    ) {
        self.in_flight.extend(block_nums.iter().copied());
        self.outstanding.insert(
            request_id,
            OutstandingRequest {
                request_id,
                peer,
                block_nums,
                issued_at: now,
            },
        );
    }

    /// A request that reached no peer: make its blocks eligible again.
    pub fn cancel_request(&mut self, block_nums: &[BlockNum]) {
        for num in block_nums {
            if let Some(entry) = self.pending.get_mut(num) {
                entry.last_request_at = None;
            }
        }
    }

    /// Ingest a `BlockBodies` reply. Returns penalties plus the peers
    /// whose in-flight budget the reply released.
    pub fn accept_bodies(
        &mut self,
        peer: PeerId,
        request_id: u64,
        bodies: Vec<BlockBody>,
    ) -> (Vec<Penalty>, Option<PeerId>) {
        let mut penalties = Vec::new();

        let matched_request = self.outstanding.remove(&request_id);
        let released = match &matched_request {
            Some(req) if req.peer == peer => {
                for num in &req.block_nums {
                    self.in_flight.remove(num);
                }
                Some(req.peer)
            }
            Some(req) => {
                // Someone else answered our id; restore and ignore the id.
                let req = req.clone();
                self.outstanding.insert(request_id, req);
                None
            }
            None => None,
        };

        if bodies.is_empty() {
            // Peer had none of the blocks. Not an offense, but the entries
            // become eligible again right away.
            if let Some(req) = matched_request.filter(|r| r.peer == peer) {
                self.cancel_request(&req.block_nums);
            }
            return (penalties, released);
        }

        // Root-pair index over entries still waiting for a body.
        let awaiting: HashMap<(Hash, Hash), BlockNum> = self
            .pending
            .iter()
            .filter(|(_, p)| p.body.is_none() && !p.bad)
            .map(|(&num, p)| ((p.tx_root, p.uncle_root), num))
            .collect();

        let mut accepted = 0usize;
        for body in bodies {
            let roots = (body.transactions_root(), body.uncle_root());
            match awaiting.get(&roots) {
                Some(&num) => {
                    if let Some(entry) = self.pending.get_mut(&num) {
                        if entry.body.is_none() {
                            entry.body = Some(body);
                            accepted += 1;
                        }
                    }
                }
                None => {
                    // A body nobody asked for by these roots. Either the
                    // peer is garbling, or the header this was requested
                    // for has no truthful body on the network.
                    penalties.push(Penalty {
                        peer,
                        reason: PenaltyReason::BadBlock,
                    });
                    if let Some(req) = matched_request.as_ref().filter(|r| r.peer == peer) {
                        self.count_mismatch(&req.block_nums);
                    }
                }
            }
        }
        trace!(accepted, request_id, "bodies matched");

        (penalties, released)
    }

    fn count_mismatch(&mut self, block_nums: &[BlockNum]) {
        // Attribute the stray body to the lowest still-missing block of
        // the request it answered.
        for num in block_nums {
            if let Some(entry) = self.pending.get_mut(num) {
                if entry.body.is_none() && !entry.bad {
                    entry.mismatches += 1;
                    entry.last_request_at = None;
                    if entry.mismatches >= MAX_BODY_MISMATCHES {
                        warn!(
                            block_num = num,
                            hash = %entry.hash,
                            "no matching body after repeated deliveries, flagging bad"
                        );
                        entry.bad = true;
                    }
                    return;
                }
            }
        }
    }

    /// Re-issue requests whose deadline passed; the slow peers get a
    /// `TooSlow` penalty and their budget back.
    pub fn expire_requests(&mut self, now: Instant) -> (Vec<Penalty>, Vec<PeerId>) {
        let deadline = self.request_deadline;
        let expired: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|(_, req)| now.duration_since(req.issued_at) >= deadline)
            .map(|(&id, _)| id)
            .collect();

        let mut penalties = Vec::new();
        let mut released = Vec::new();
        for id in expired {
            if let Some(req) = self.outstanding.remove(&id) {
                debug!(
                    request_id = id,
                    peer = %hex::encode(&req.peer[..8]),
                    blocks = req.block_nums.len(),
                    "body request timed out, re-queueing"
                );
                for num in &req.block_nums {
                    self.in_flight.remove(num);
                    if let Some(entry) = self.pending.get_mut(num) {
                        if entry.body.is_none() {
                            entry.last_request_at = None;
                        }
                    }
                }
                penalties.push(Penalty {
                    peer: req.peer,
                    reason: PenaltyReason::TooSlow,
                });
                released.push(req.peer);
            }
        }
        (penalties, released)
    }

    /// Contiguous run of arrived bodies above the db height, plus any bad
    /// block sitting at the front of the queue.
    pub fn withdraw_ready(&mut self, max: usize) -> (Vec<ReadyBlock>, Vec<(BlockNum, Hash)>) {
        let mut blocks = Vec::new();
        let mut bad = Vec::new();

        while blocks.len() < max {
            let next = self.highest_body_in_db + 1;
            let Some(entry) = self.pending.get(&next) else {
                break;
            };
            if entry.bad {
                bad.push((next, entry.hash));
                break;
            }
            if entry.body.is_none() {
                break;
            }
            if let Some(entry) = self.pending.remove(&next) {
                self.in_flight.remove(&next);
                if let Some(body) = entry.body {
                    blocks.push(ReadyBlock {
                        block_num: next,
                        hash: entry.hash,
                        body,
                    });
                }
                self.highest_body_in_db = next;
            }
        }

        (blocks, bad)
    }

    pub fn stats(&self) -> BodySequenceStats {
        BodySequenceStats {
            pending: self.pending.len(),
            ready: self.pending.values().filter(|p| p.body.is_some()).count(),
            outstanding_requests: self.outstanding.len(),
            highest_body_in_db: self.highest_body_in_db,
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }
}
