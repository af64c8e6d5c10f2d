//! Working set of unverified header fragments.
//!
//! Headers arrive out of order from many peers. Each one becomes a
//! [`Link`] in an arena keyed by hash; fragments whose parent is unknown
//! hang off an [`Anchor`] keyed by the missing parent hash. Anchors
//! drive reverse `GetBlockHeaders` requests downward until they meet a
//! linked header, at which point they dissolve. Contiguous parent-linked
//! runs above the persisted head are withdrawn for persistence.
//!
//! The DAG is acyclic by construction: parent and child relationships
//! are stored as hashes only, never as owning references.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use alloy_primitives::U256;
use chain::{BlockHeader, BlockNum, Hash};
use sentry::messages::{GetBlockHeadersPacket, HeaderOrigin};
use sentry::{Penalty, PenaltyReason, PeerId};
use tracing::{debug, trace, warn};

/// Persisted links older than this many blocks below the tip are pruned.
const PERSISTED_PRUNE_DEPTH: u64 = 4096;

/// Node in the in-memory header DAG.
#[derive(Debug, Clone)]
pub struct Link {
    pub header: BlockHeader,
    pub hash: Hash,
    pub block_num: BlockNum,
    pub persisted: bool,
    pub preverified: bool,
    /// Children, by hash.
    pub next: Vec<Hash>,
}

/// An unresolved fragment root: `parent_hash` is not in the arena yet and
/// must be fetched from above, down toward the persisted head.
#[derive(Debug, Clone)]
pub struct Anchor {
    pub parent_hash: Hash,
    /// Height of the fragment's lowest headers (the anchor's direct links).
    pub block_num: BlockNum,
    /// Direct links at `block_num`, by hash.
    pub links: Vec<Hash>,
    pub last_request_at: Option<Instant>,
    /// Insertion order; ties on `block_num` resolve FIFO.
    pub sequence: u64,
}

/// Counters published in the exchange progress line.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderChainStats {
    pub links: usize,
    pub anchors: usize,
    pub top_seen: BlockNum,
    pub highest_in_db: BlockNum,
}

pub struct HeaderChain {
    links: HashMap<Hash, Link>,
    /// Keyed by the missing parent hash.
    anchors: HashMap<Hash, Anchor>,
    highest_in_db: BlockNum,
    /// Hash of the highest persisted link (attachment point for withdrawal).
    persisted_tip: Option<Hash>,
    top_seen: BlockNum,
    /// Highest height present in the arena; forward requests extend it.
    highest_link: BlockNum,
    /// Origin and issue time of the live forward (skeleton) request.
    last_forward: Option<(BlockNum, Instant)>,
    bad_headers: HashSet<Hash>,
    /// Checkpoint hashes trusted out of band.
    preverified: HashSet<Hash>,
    next_sequence: u64,
    max_blocks_per_req: u64,
    request_deadline: Duration,
}

impl HeaderChain {
    pub fn new(max_blocks_per_req: u64, request_deadline: Duration) -> Self {
        Self {
            links: HashMap::new(),
            anchors: HashMap::new(),
            highest_in_db: 0,
            persisted_tip: None,
            top_seen: 0,
            highest_link: 0,
            last_forward: None,
            bad_headers: HashSet::new(),
            preverified: HashSet::new(),
            next_sequence: 0,
            max_blocks_per_req,
            request_deadline,
        }
    }

    /// Re-anchor on the persisted head. Drops all working state at or
    /// below it; in-flight fragments above survive a restart of the
    /// headers stage only through re-delivery.
    pub fn sync_current_state(&mut self, head: BlockHeader) {
        let head_num = head.number;
        let head_hash = head.hash();

        self.links.retain(|_, link| link.block_num > head_num);
        self.anchors.retain(|_, anchor| anchor.block_num > head_num);

        self.links.insert(
            head_hash,
            Link {
                hash: head_hash,
                block_num: head_num,
                header: head,
                persisted: true,
                preverified: false,
                next: Vec::new(),
            },
        );
        self.highest_in_db = head_num;
        self.persisted_tip = Some(head_hash);
        self.top_seen = self.top_seen.max(head_num);
        self.highest_link = self
            .links
            .values()
            .map(|l| l.block_num)
            .max()
            .unwrap_or(head_num);
        self.last_forward = None;
        debug!(height = head_num, "header chain anchored on db head");
    }

    pub fn add_preverified_hashes(&mut self, hashes: impl IntoIterator<Item = Hash>) {
        self.preverified.extend(hashes);
    }

    /// Record hashes proven bad by an unwind and evict them together with
    /// every descendant still in the arena.
    pub fn add_bad_headers(&mut self, bad: impl IntoIterator<Item = Hash>) {
        let mut queue: Vec<Hash> = bad.into_iter().collect();
        self.bad_headers.extend(queue.iter().copied());
        while let Some(hash) = queue.pop() {
            if let Some(link) = self.links.remove(&hash) {
                self.bad_headers.insert(hash);
                queue.extend(link.next);
                if self.persisted_tip == Some(hash) {
                    self.persisted_tip = None;
                }
            }
            self.anchors.remove(&hash);
        }
    }

    /// Observe an announced tip height (NewBlock / NewBlockHashes).
    pub fn top_seen_from_announcement(&mut self, height: BlockNum) {
        if height > self.top_seen {
            trace!(height, "top seen advanced by announcement");
            self.top_seen = height;
        }
    }

    pub fn top_seen(&self) -> BlockNum {
        self.top_seen
    }

    pub fn highest_in_db(&self) -> BlockNum {
        self.highest_in_db
    }

    /// All headers withdrawn and nothing above us on the network.
    pub fn in_sync(&self) -> bool {
        self.top_seen > 0 && self.highest_in_db >= self.top_seen
    }

    pub fn stats(&self) -> HeaderChainStats {
        HeaderChainStats {
            links: self.links.len(),
            anchors: self.anchors.len(),
            top_seen: self.top_seen,
            highest_in_db: self.highest_in_db,
        }
    }

    /// Ingest a header delivery. Headers already known are skipped, so
    /// replaying a reply leaves the DAG unchanged.
    pub fn new_headers(&mut self, peer: PeerId, headers: Vec<BlockHeader>) -> Vec<Penalty> {
        let mut penalties = Vec::new();

        for header in headers {
            let hash = header.hash();
            let number = header.number;

            if self.links.contains_key(&hash) {
                continue;
            }
            if self.bad_headers.contains(&hash) || self.bad_headers.contains(&header.parent_hash) {
                penalties.push(Penalty {
                    peer,
                    reason: PenaltyReason::BadBlock,
                });
                continue;
            }
            // Below or at the persisted head: nothing to do with it here.
            // A competing chain that deep surfaces as an unwind, not as a
            // working-set fragment.
            if number <= self.highest_in_db {
                continue;
            }
            if !self.accept_header(peer, header, hash, &mut penalties) {
                continue;
            }
            self.top_seen = self.top_seen.max(number);
        }

        penalties
    }

    fn accept_header(
        &mut self,
        peer: PeerId,
        header: BlockHeader,
        hash: Hash,
        penalties: &mut Vec<Penalty>,
    ) -> bool {
        let number = header.number;
        let parent_hash = header.parent_hash;
        let preverified = self.preverified.contains(&hash);

        // Minimal self-consistency; the seal itself is checkpoint or
        // consensus territory.
        if !preverified && header.difficulty.is_zero() {
            penalties.push(Penalty {
                peer,
                reason: PenaltyReason::BadBlock,
            });
            return false;
        }

        if let Some(parent) = self.links.get(&parent_hash) {
            // Height must continue the parent; a claim that breaks the
            // cumulative-difficulty recurrence is a bad block.
            if number != parent.block_num + 1 {
                warn!(
                    peer = %hex_prefix(&peer),
                    number,
                    parent = parent.block_num,
                    "header does not extend its parent"
                );
                penalties.push(Penalty {
                    peer,
                    reason: PenaltyReason::BadBlock,
                });
                return false;
            }
            if let Some(parent) = self.links.get_mut(&parent_hash) {
                parent.next.push(hash);
            }
        } else if let Some(anchor) = self.anchors.get_mut(&parent_hash) {
            // Sibling of an existing anchor fragment.
            if number != anchor.block_num {
                penalties.push(Penalty {
                    peer,
                    reason: PenaltyReason::BadBlock,
                });
                return false;
            }
            anchor.links.push(hash);
        } else {
            // Unknown parent: a new gap to fill from above.
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            self.anchors.insert(
                parent_hash,
                Anchor {
                    parent_hash,
                    block_num: number,
                    links: vec![hash],
                    last_request_at: None,
                    sequence,
                },
            );
            trace!(number, "new anchor created");
        }

        let mut link = Link {
            header,
            hash,
            block_num: number,
            persisted: false,
            preverified,
            next: Vec::new(),
        };

        // This header may be the parent an anchor was waiting for.
        if let Some(anchor) = self.anchors.remove(&hash) {
            debug_assert_eq!(anchor.block_num, number + 1);
            link.next = anchor.links;
            debug!(number, "anchor resolved");
        }

        self.links.insert(hash, link);
        self.highest_link = self.highest_link.max(number);
        true
    }

    /// Next header request. Gap-filling anchors have priority, served
    /// lowest-height first with a FIFO tie-break; with no anchor due, a
    /// forward (skeleton) request extends the arena toward `top_seen`.
    pub fn request_more_headers(
        &mut self,
        now: Instant,
        request_id: u64,
    ) -> Option<GetBlockHeadersPacket> {
        let deadline = self.request_deadline;
        let due = |anchor: &Anchor| match anchor.last_request_at {
            None => true,
            Some(at) => now.duration_since(at) >= deadline,
        };

        let key = self
            .anchors
            .values()
            .filter(|a| due(a))
            .min_by_key(|a| (a.block_num, a.sequence))
            .map(|a| a.parent_hash);

        if let Some(key) = key {
            let highest = self.highest_in_db;
            let anchor = self.anchors.get_mut(&key)?;
            // Missing range is highest+1 ..= block_num-1; the origin hash
            // sits at the top of it. Zero gap means the anchor forks the
            // db head.
            let gap = anchor.block_num.saturating_sub(highest + 1);
            let amount = gap.clamp(1, self.max_blocks_per_req);
            anchor.last_request_at = Some(now);

            return Some(GetBlockHeadersPacket {
                request_id,
                origin: HeaderOrigin::Hash(anchor.parent_hash),
                amount,
                skip: 0,
                reverse: true,
            });
        }

        self.request_forward(now, request_id)
    }

    /// Ascending request from the highest link toward the announced tip.
    /// One live forward request at a time; it is considered answered as
    /// soon as the arena's top moves (the origin changes).
    fn request_forward(&mut self, now: Instant, request_id: u64) -> Option<GetBlockHeadersPacket> {
        if self.top_seen <= self.highest_link {
            return None;
        }
        let origin = self.highest_link + 1;
        let due = match self.last_forward {
            None => true,
            Some((o, at)) => o != origin || now.duration_since(at) >= self.request_deadline,
        };
        if !due {
            return None;
        }
        self.last_forward = Some((origin, now));
        let amount = (self.top_seen - self.highest_link).min(self.max_blocks_per_req);
        Some(GetBlockHeadersPacket {
            request_id,
            origin: HeaderOrigin::Number(origin),
            amount,
            skip: 0,
            reverse: false,
        })
    }

    /// Make an anchor eligible again at `retry_at` after a send that
    /// reached no peer.
    pub fn defer_anchor_retry(&mut self, parent_hash: Hash, retry_at: Instant) {
        if let Some(anchor) = self.anchors.get_mut(&parent_hash) {
            anchor.last_request_at = retry_at.checked_sub(self.request_deadline);
        }
    }

    /// Forward-request counterpart of [`defer_anchor_retry`].
    ///
    /// [`defer_anchor_retry`]: HeaderChain::defer_anchor_retry
    pub fn defer_forward_retry(&mut self, retry_at: Instant) {
        if let Some((origin, _)) = self.last_forward {
            match retry_at.checked_sub(self.request_deadline) {
                Some(at) => self.last_forward = Some((origin, at)),
                None => self.last_forward = None,
            }
        }
    }

    /// Withdraw the longest contiguous parent-linked run above the
    /// persisted head, marking it persisted. Competing children are
    /// resolved toward the heaviest branch.
    pub fn withdraw_stable_headers(&mut self, max: usize) -> Vec<BlockHeader> {
        let mut out = Vec::new();
        let Some(mut tip) = self.persisted_tip else {
            return out;
        };

        while out.len() < max {
            let Some(current) = self.links.get(&tip) else {
                break;
            };
            let Some(next_hash) = self.heaviest_child(current) else {
                break;
            };
            let Some(child) = self.links.get_mut(&next_hash) else {
                break;
            };
            child.persisted = true;
            self.highest_in_db = child.block_num;
            out.push(child.header.clone());
            tip = next_hash;
        }

        if !out.is_empty() {
            self.persisted_tip = Some(tip);
            self.prune_persisted();
        }
        out
    }

    fn heaviest_child(&self, link: &Link) -> Option<Hash> {
        let live: Vec<&Hash> = link
            .next
            .iter()
            .filter(|h| self.links.contains_key(*h))
            .collect();
        match live.len() {
            0 => None,
            1 => Some(*live[0]),
            _ => live
                .into_iter()
                .max_by_key(|h| self.branch_weight(h))
                .cloned(),
        }
    }

    /// Cumulative difficulty of the heaviest path below `hash`.
    fn branch_weight(&self, hash: &Hash) -> U256 {
        let mut weight = U256::ZERO;
        let mut current = *hash;
        loop {
            let Some(link) = self.links.get(&current) else {
                break;
            };
            weight += link.header.difficulty;
            match self.heaviest_child_shallow(link) {
                Some(next) => current = next,
                None => break,
            }
        }
        weight
    }

    // One-level lookahead to keep branch_weight linear.
    fn heaviest_child_shallow(&self, link: &Link) -> Option<Hash> {
        link.next
            .iter()
            .filter_map(|h| self.links.get(h))
            .max_by_key(|l| l.header.difficulty)
            .map(|l| l.hash)
    }

    fn prune_persisted(&mut self) {
        let cutoff = self.highest_in_db.saturating_sub(PERSISTED_PRUNE_DEPTH);
        self.links
            .retain(|_, link| !(link.persisted && link.block_num < cutoff));
    }
}

fn hex_prefix(peer: &PeerId) -> String {
    hex::encode(&peer[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};
    use chain::types::empty_uncle_hash;

    fn peer(n: u8) -> PeerId {
        let mut id = [0u8; 64];
        id[0] = n;
        id
    }

    fn genesis() -> BlockHeader {
        make_header(0, B256::ZERO)
    }

    fn make_header(number: u64, parent_hash: Hash) -> BlockHeader {
        BlockHeader {
            parent_hash,
            uncle_hash: empty_uncle_hash(),
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: chain::trie::empty_trie_hash(),
            receipts_root: B256::ZERO,
            logs_bloom: [0u8; 256],
            difficulty: U256::from(1000u64),
            number,
            gas_limit: 8_000_000,
            gas_used: 0,
            timestamp: 1_600_000_000 + number,
            extra_data: Vec::new(),
            mix_hash: B256::ZERO,
            nonce: [0u8; 8],
            base_fee: None,
        }
    }

    /// Chain of `n` headers on top of genesis; index i holds height i.
    fn make_chain(n: u64) -> Vec<BlockHeader> {
        let mut headers = vec![genesis()];
        for number in 1..=n {
            let parent = headers.last().unwrap().hash();
            headers.push(make_header(number, parent));
        }
        headers
    }

    fn chain_with_head(n: u64) -> (HeaderChain, Vec<BlockHeader>) {
        let headers = make_chain(n);
        let mut hc = HeaderChain::new(128, Duration::from_secs(30));
        hc.sync_current_state(headers[0].clone());
        (hc, headers)
    }

    #[test]
    fn contiguous_delivery_is_withdrawn() {
        let (mut hc, headers) = chain_with_head(10);
        let penalties = hc.new_headers(peer(1), headers[1..=10].to_vec());
        assert!(penalties.is_empty());

        let run = hc.withdraw_stable_headers(1000);
        assert_eq!(run.len(), 10);
        assert_eq!(run[0].number, 1);
        assert_eq!(run[9].number, 10);
        assert!(hc.stats().anchors == 0);
        assert!(hc.in_sync());
    }

    #[test]
    fn out_of_order_segments_meet() {
        let (mut hc, headers) = chain_with_head(20);

        // Upper segment first: creates an anchor waiting for header 9.
        hc.new_headers(peer(1), headers[10..=20].to_vec());
        assert_eq!(hc.stats().anchors, 1);
        assert!(hc.withdraw_stable_headers(1000).is_empty());

        // Lower segment arrives later from another peer.
        hc.new_headers(peer(2), headers[1..=9].to_vec());
        assert_eq!(hc.stats().anchors, 0);

        let run = hc.withdraw_stable_headers(1000);
        assert_eq!(run.len(), 20);
        assert_eq!(run.last().unwrap().number, 20);
    }

    #[test]
    fn replay_is_idempotent() {
        let (mut hc, headers) = chain_with_head(8);
        hc.new_headers(peer(1), headers[1..=8].to_vec());
        let before = hc.stats();

        hc.new_headers(peer(1), headers[1..=8].to_vec());
        let after = hc.stats();
        assert_eq!(before.links, after.links);
        assert_eq!(before.anchors, after.anchors);

        let run = hc.withdraw_stable_headers(1000);
        assert_eq!(run.len(), 8);
        // Replaying after withdrawal must not resurrect anything.
        hc.new_headers(peer(2), headers[1..=8].to_vec());
        assert!(hc.withdraw_stable_headers(1000).is_empty());
    }

    #[test]
    fn anchor_generates_reverse_request() {
        let (mut hc, headers) = chain_with_head(20);
        hc.new_headers(peer(1), headers[10..=20].to_vec());

        let now = Instant::now();
        let packet = hc.request_more_headers(now, 7).unwrap();
        assert_eq!(packet.request_id, 7);
        assert_eq!(packet.origin, HeaderOrigin::Hash(headers[9].hash()));
        assert!(packet.reverse);
        assert_eq!(packet.skip, 0);
        // Gap is 1..=9: nine headers, origin included.
        assert_eq!(packet.amount, 9);

        // The anchor was just asked; nothing else is due.
        assert!(hc.request_more_headers(now, 8).is_none());
    }

    #[test]
    fn anchor_retries_after_deadline() {
        let mut hc = HeaderChain::new(128, Duration::from_millis(10));
        let headers = make_chain(6);
        hc.sync_current_state(headers[0].clone());
        hc.new_headers(peer(1), headers[4..=6].to_vec());

        let first = Instant::now();
        assert!(hc.request_more_headers(first, 1).is_some());
        assert!(hc.request_more_headers(first, 2).is_none());
        let later = first + Duration::from_millis(11);
        assert!(hc.request_more_headers(later, 3).is_some());
    }

    #[test]
    fn lowest_anchor_is_served_first() {
        let (mut hc, headers) = chain_with_head(30);
        hc.new_headers(peer(1), headers[20..=25].to_vec());
        hc.new_headers(peer(1), headers[10..=15].to_vec());

        let packet = hc.request_more_headers(Instant::now(), 1).unwrap();
        // The anchor at height 10 wins over the one at height 20.
        assert_eq!(packet.origin, HeaderOrigin::Hash(headers[9].hash()));
    }

    #[test]
    fn non_extending_header_is_penalized() {
        let (mut hc, headers) = chain_with_head(3);
        hc.new_headers(peer(1), headers[1..=3].to_vec());

        // Claims header 3 as parent but carries a bogus height.
        let mut bogus = make_header(9, headers[3].hash());
        bogus.timestamp += 1;
        let penalties = hc.new_headers(peer(4), vec![bogus]);
        assert_eq!(penalties.len(), 1);
        assert!(matches!(penalties[0].reason, PenaltyReason::BadBlock));
        assert_eq!(penalties[0].peer, peer(4));
    }

    #[test]
    fn zero_difficulty_header_is_penalized() {
        let (mut hc, headers) = chain_with_head(2);
        let mut sealless = make_header(1, headers[0].hash());
        sealless.difficulty = U256::ZERO;
        let penalties = hc.new_headers(peer(1), vec![sealless]);
        assert_eq!(penalties.len(), 1);
        assert!(matches!(penalties[0].reason, PenaltyReason::BadBlock));
    }

    #[test]
    fn bad_headers_are_rejected_on_redelivery() {
        let (mut hc, headers) = chain_with_head(5);
        hc.new_headers(peer(1), headers[1..=5].to_vec());
        hc.withdraw_stable_headers(1000);

        hc.sync_current_state(headers[2].clone());
        hc.add_bad_headers([headers[3].hash()]);

        let penalties = hc.new_headers(peer(2), vec![headers[3].clone()]);
        assert_eq!(penalties.len(), 1);
        // Children of a bad header are bad too.
        let penalties = hc.new_headers(peer(2), vec![headers[4].clone()]);
        assert_eq!(penalties.len(), 1);
    }

    #[test]
    fn heavier_branch_wins_withdrawal() {
        let (mut hc, headers) = chain_with_head(1);
        hc.new_headers(peer(1), vec![headers[1].clone()]);

        // A lighter competing child of genesis.
        let mut light = make_header(1, headers[0].hash());
        light.difficulty = U256::from(1u64);
        light.extra_data = b"fork".to_vec();
        hc.new_headers(peer(2), vec![light]);

        let run = hc.withdraw_stable_headers(1000);
        assert_eq!(run.len(), 1);
        assert_eq!(run[0].hash(), headers[1].hash());
    }

    #[test]
    fn forward_request_chases_the_announced_tip() {
        let (mut hc, headers) = chain_with_head(6);
        hc.top_seen_from_announcement(6);

        let now = Instant::now();
        let packet = hc.request_more_headers(now, 1).unwrap();
        assert_eq!(packet.origin, HeaderOrigin::Number(1));
        assert!(!packet.reverse);
        assert_eq!(packet.amount, 6);

        // One live forward request at a time.
        assert!(hc.request_more_headers(now, 2).is_none());

        // The reply moves the arena top, so the next origin is due at once.
        hc.new_headers(peer(1), headers[1..=3].to_vec());
        let packet = hc.request_more_headers(now, 3).unwrap();
        assert_eq!(packet.origin, HeaderOrigin::Number(4));
        assert_eq!(packet.amount, 3);

        // Fully caught up: no more requests.
        hc.new_headers(peer(1), headers[4..=6].to_vec());
        assert!(hc.request_more_headers(now, 4).is_none());
    }

    #[test]
    fn announcements_advance_top_seen() {
        let (mut hc, _) = chain_with_head(0);
        hc.top_seen_from_announcement(640);
        assert_eq!(hc.top_seen(), 640);
        hc.top_seen_from_announcement(100);
        assert_eq!(hc.top_seen(), 640);
        assert!(!hc.in_sync());
    }
}
