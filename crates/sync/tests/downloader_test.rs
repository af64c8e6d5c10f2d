//! End-to-end scenarios against a scripted sentry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy_primitives::{Address, B256, U256};
use chain::types::{empty_uncle_hash, BlockHeader};
use chain::{BlockBody, Hash};
use sentry::messages::{
    BlockBodiesPacket, BlockHeadersPacket, EthMessage, EthMessageId, GetBlockBodiesPacket,
    GetBlockHeadersPacket, HeaderOrigin, NewBlockHashesPacket,
};
use sentry::{InboundMessage, PenaltyReason, PeerId, SentPeers, SentryApi, SentryError, StatusData};
use store::{MemoryStore, StoreReader};
use sync::{
    BlockExchange, BodiesStage, ExchangeConfig, ExchangeHandle, HeadersStage, StageLoop,
    SyncStage, SyncState,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Mock sentry
// ---------------------------------------------------------------------------

const SERVING_PEER: PeerId = {
    let mut id = [0u8; 64];
    id[0] = 0xaa;
    id
};

#[derive(Clone, Copy, Debug)]
struct SendAttempt {
    at: Instant,
    id: EthMessageId,
}

struct MockSentry {
    headers: Vec<BlockHeader>,
    by_hash: HashMap<Hash, usize>,
    bodies: HashMap<Hash, BlockBody>,
    /// Serve a garbage body whenever this hash is requested.
    bad_body_for: Option<Hash>,
    inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    accept_sends: AtomicBool,
    respond_headers: AtomicBool,
    respond_bodies: AtomicBool,
    attempts: Mutex<Vec<SendAttempt>>,
    penalties: Mutex<Vec<(PeerId, PenaltyReason)>>,
}

impl MockSentry {
    fn new(headers: Vec<BlockHeader>, bodies: HashMap<Hash, BlockBody>) -> Self {
        let by_hash = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.hash(), i))
            .collect();
        Self {
            headers,
            by_hash,
            bodies,
            bad_body_for: None,
            inbound: Mutex::new(None),
            accept_sends: AtomicBool::new(true),
            respond_headers: AtomicBool::new(true),
            respond_bodies: AtomicBool::new(true),
            attempts: Mutex::new(Vec::new()),
            penalties: Mutex::new(Vec::new()),
        }
    }

    fn connect(&self, inbound: mpsc::Sender<InboundMessage>) {
        *self.inbound.lock().unwrap() = Some(inbound);
    }

    fn attempts_of(&self, id: EthMessageId) -> Vec<SendAttempt> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|a| a.id == id)
            .collect()
    }

    fn penalties(&self) -> Vec<(PeerId, PenaltyReason)> {
        self.penalties.lock().unwrap().clone()
    }

    async fn push(&self, id: EthMessageId, data: Vec<u8>) {
        let sender = self.inbound.lock().unwrap().clone();
        if let Some(tx) = sender {
            let _ = tx
                .send(InboundMessage {
                    peer: SERVING_PEER,
                    id,
                    data,
                })
                .await;
        }
    }

    async fn serve_headers(&self, packet: &GetBlockHeadersPacket) {
        if !self.respond_headers.load(Ordering::Relaxed) {
            return;
        }
        let origin = match packet.origin {
            HeaderOrigin::Number(n) => n as usize,
            HeaderOrigin::Hash(hash) => match self.by_hash.get(&hash) {
                Some(&i) => i,
                None => return,
            },
        };
        let mut headers = Vec::new();
        let mut index = origin as i64;
        let step: i64 = if packet.reverse { -1 } else { 1 };
        while headers.len() < packet.amount as usize {
            if index < 0 || index as usize >= self.headers.len() {
                break;
            }
            headers.push(self.headers[index as usize].clone());
            index += step;
        }
        let reply = BlockHeadersPacket {
            request_id: packet.request_id,
            headers,
        };
        self.push(EthMessageId::BlockHeaders, reply.encode()).await;
    }

    async fn serve_bodies(&self, packet: &GetBlockBodiesPacket) {
        if !self.respond_bodies.load(Ordering::Relaxed) {
            return;
        }
        let mut bodies = Vec::new();
        for hash in &packet.hashes {
            if self.bad_body_for == Some(*hash) {
                bodies.push(BlockBody {
                    transactions: vec![chain::rlp::encode_bytes(b"garbage")],
                    uncles: Vec::new(),
                });
            } else if let Some(body) = self.bodies.get(hash) {
                bodies.push(body.clone());
            }
        }
        let reply = BlockBodiesPacket {
            request_id: packet.request_id,
            bodies,
        };
        self.push(EthMessageId::BlockBodies, reply.encode()).await;
    }

    async fn handle_send(&self, message: &EthMessage) -> Result<SentPeers, SentryError> {
        self.attempts.lock().unwrap().push(SendAttempt {
            at: Instant::now(),
            id: message.id(),
        });
        if !self.accept_sends.load(Ordering::Relaxed) {
            return Ok(Vec::new());
        }
        match message {
            EthMessage::GetBlockHeaders(packet) => self.serve_headers(packet).await,
            EthMessage::GetBlockBodies(packet) => self.serve_bodies(packet).await,
        }
        Ok(vec![SERVING_PEER])
    }
}

impl SentryApi for MockSentry {
    async fn set_status(&self, _status: &StatusData) -> Result<(), SentryError> {
        Ok(())
    }

    async fn hand_shake(&self) -> Result<(), SentryError> {
        Ok(())
    }

    async fn send_message_to_random(
        &self,
        message: &EthMessage,
        _max_peers: usize,
        _timeout: Duration,
    ) -> Result<SentPeers, SentryError> {
        self.handle_send(message).await
    }

    async fn send_message_by_id(
        &self,
        _peer: PeerId,
        message: &EthMessage,
        _timeout: Duration,
    ) -> Result<SentPeers, SentryError> {
        self.handle_send(message).await
    }

    async fn receive_messages(&self) -> Result<Vec<InboundMessage>, SentryError> {
        // Replies are pushed straight into the exchange queue.
        std::future::pending().await
    }

    async fn penalize_peer(&self, peer: PeerId, reason: PenaltyReason) -> Result<(), SentryError> {
        self.penalties.lock().unwrap().push((peer, reason));
        Ok(())
    }

    async fn peer_count(&self) -> Result<u64, SentryError> {
        Ok(1)
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Chain of `n` blocks on top of genesis. Every third block is empty and
/// exercises the no-download path; the rest carry a unique transaction.
fn build_chain(n: u64) -> (Vec<BlockHeader>, HashMap<Hash, BlockBody>) {
    let mut headers = Vec::new();
    let mut bodies = HashMap::new();
    let mut parent_hash = B256::ZERO;

    for number in 0..=n {
        let body = if number == 0 || number % 3 == 0 {
            BlockBody::default()
        } else {
            BlockBody {
                transactions: vec![chain::rlp::encode_bytes(&number.to_be_bytes())],
                uncles: Vec::new(),
            }
        };
        let header = BlockHeader {
            parent_hash,
            uncle_hash: body.uncle_root(),
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: body.transactions_root(),
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
        };
        parent_hash = header.hash();
        bodies.insert(header.hash(), body);
        headers.push(header);
    }
    (headers, bodies)
}

struct Harness {
    mock: Arc<MockSentry>,
    store: MemoryStore,
    handle: ExchangeHandle,
    inbound_tx: mpsc::Sender<InboundMessage>,
    stop: CancellationToken,
    exchange_task: tokio::task::JoinHandle<()>,
}

fn quick_config() -> ExchangeConfig {
    ExchangeConfig {
        max_blocks_per_req: 16,
        max_requests_per_peer: 4,
        request_deadline: Duration::from_secs(5),
        no_peer_delay: Duration::from_millis(100),
    }
}

fn start(mock: Arc<MockSentry>, genesis: BlockHeader, config: ExchangeConfig) -> Harness {
    let store = MemoryStore::new(genesis);
    let stop = CancellationToken::new();
    let (exchange, handle, inbound_tx) =
        BlockExchange::new(Arc::clone(&mock), config, stop.clone());
    mock.connect(inbound_tx.clone());
    let exchange_task = tokio::spawn(exchange.execution_loop());
    Harness {
        mock,
        store,
        handle,
        inbound_tx,
        stop,
        exchange_task,
    }
}

impl Harness {
    fn stages(&self) -> Vec<SyncStage> {
        vec![
            SyncStage::Headers(HeadersStage::new(
                self.store.clone(),
                self.handle.clone(),
                self.stop.clone(),
            )),
            SyncStage::Bodies(BodiesStage::new(
                self.store.clone(),
                self.handle.clone(),
                self.stop.clone(),
            )),
        ]
    }

    async fn announce_tip(&self, header: &BlockHeader) {
        let packet = NewBlockHashesPacket {
            entries: vec![(header.hash(), header.number)],
        };
        self.inbound_tx
            .send(InboundMessage {
                peer: SERVING_PEER,
                id: EthMessageId::NewBlockHashes,
                data: packet.encode(),
            })
            .await
            .unwrap();
    }

    async fn shutdown(self) {
        self.stop.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.exchange_task).await;
    }
}

async fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration, what: &str) {
    let started = Instant::now();
    while !cond() {
        if started.elapsed() > timeout {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// S1: cold sync against a single well-behaved peer.
#[tokio::test(flavor = "multi_thread")]
async fn cold_sync_to_small_tip() {
    let tip = 60u64;
    let (headers, bodies) = build_chain(tip);
    let mock = Arc::new(MockSentry::new(headers.clone(), bodies));
    let h = start(Arc::clone(&mock), headers[0].clone(), quick_config());

    h.announce_tip(&headers[tip as usize]).await;

    let mut stage_loop = StageLoop::new(h.stages(), h.stop.clone());
    let run = tokio::spawn(async move { stage_loop.run().await });

    {
        let store = h.store.clone();
        wait_for(
            move || {
                store.head().unwrap().height == tip
                    && store.stage_progress(BodiesStage::NAME).unwrap() == tip
            },
            Duration::from_secs(20),
            "full sync",
        )
        .await;
    }

    h.stop.cancel();
    let state = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, SyncState::Done);

    // Exactly one canonical hash per height, bodies matching their roots.
    for number in 1..=tip {
        let hash = h.store.canonical_hash(number).unwrap().unwrap();
        assert_eq!(hash, headers[number as usize].hash());
        let header = h.store.header(&hash).unwrap().unwrap();
        let body = h.store.body(&hash).unwrap().unwrap();
        assert_eq!(body.transactions_root(), header.transactions_root);
        assert_eq!(body.uncle_root(), header.uncle_hash);
    }
    assert!(h.mock.penalties().is_empty());
    h.shutdown().await;
}

/// S2: a later range arrives before the earlier one; a single contiguous
/// run comes out.
#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_header_arrival() {
    let (headers, bodies) = build_chain(40);
    let mock = Arc::new(MockSentry::new(headers.clone(), bodies));
    // Replies are injected by hand below.
    mock.respond_headers.store(false, Ordering::Relaxed);
    let h = start(Arc::clone(&mock), headers[0].clone(), quick_config());

    h.handle
        .sync_header_chain(headers[0].clone())
        .await
        .unwrap();

    let mut peer_b = SERVING_PEER;
    peer_b[0] = 0xbb;
    let late = BlockHeadersPacket {
        request_id: 901,
        headers: headers[30..=40].to_vec(),
    };
    let early = BlockHeadersPacket {
        request_id: 902,
        headers: headers[1..=29].to_vec(),
    };
    h.inbound_tx
        .send(InboundMessage {
            peer: SERVING_PEER,
            id: EthMessageId::BlockHeaders,
            data: late.encode(),
        })
        .await
        .unwrap();
    h.inbound_tx
        .send(InboundMessage {
            peer: peer_b,
            id: EthMessageId::BlockHeaders,
            data: early.encode(),
        })
        .await
        .unwrap();

    let mut collected: Vec<u64> = Vec::new();
    let started = Instant::now();
    while collected.len() < 40 {
        assert!(started.elapsed() < Duration::from_secs(10), "sync stalled");
        let (run, _) = h.handle.withdraw_stable_headers(1000).await.unwrap();
        collected.extend(run.iter().map(|hd| hd.number));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let expected: Vec<u64> = (1..=40).collect();
    assert_eq!(collected, expected);
    h.shutdown().await;
}

/// S3: an unanswered body request is re-issued after the deadline and the
/// silent peer is penalized `TooSlow`. Until the deadline, the per-peer
/// in-flight budget bounds the outstanding requests.
#[tokio::test(flavor = "multi_thread")]
async fn body_timeout_retries_and_penalizes() {
    let (headers, bodies) = build_chain(40);
    let mock = Arc::new(MockSentry::new(headers.clone(), bodies));
    mock.respond_bodies.store(false, Ordering::Relaxed);

    let config = ExchangeConfig {
        max_blocks_per_req: 4,
        max_requests_per_peer: 4,
        request_deadline: Duration::from_millis(500),
        no_peer_delay: Duration::from_millis(100),
    };
    let h = start(Arc::clone(&mock), headers[0].clone(), config);

    h.handle.sync_body_sequence(0).await.unwrap();
    let targets: Vec<(u64, BlockHeader)> = (1..=40)
        .filter(|n| n % 3 != 0)
        .map(|n| (n, headers[n as usize].clone()))
        .collect();
    h.handle.download_bodies(targets).await.unwrap();

    // Before the deadline: exactly the per-peer budget is in flight.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let before = h.mock.attempts_of(EthMessageId::GetBlockBodies);
    assert_eq!(before.len(), 4, "per-peer in-flight cap violated");
    assert!(h.mock.penalties().is_empty());

    // After the deadline: penalized and re-issued.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let after = h.mock.attempts_of(EthMessageId::GetBlockBodies);
    assert!(after.len() > before.len(), "request was not re-issued");
    let penalties = h.mock.penalties();
    assert!(penalties
        .iter()
        .any(|(peer, reason)| *peer == SERVING_PEER && *reason == PenaltyReason::TooSlow));

    h.shutdown().await;
}

/// S4: one block's true body is unobtainable; the pipeline unwinds below
/// it and stays there.
#[tokio::test(flavor = "multi_thread")]
async fn bad_block_unwind() {
    let tip = 20u64;
    let bad_height = 13u64;
    let (headers, bodies) = build_chain(tip);
    let bad_hash = headers[bad_height as usize].hash();
    let mut mock = MockSentry::new(headers.clone(), bodies);
    mock.bad_body_for = Some(bad_hash);
    let mock = Arc::new(mock);
    let h = start(Arc::clone(&mock), headers[0].clone(), quick_config());

    h.announce_tip(&headers[tip as usize]).await;

    let mut stage_loop = StageLoop::new(h.stages(), h.stop.clone());
    let run = tokio::spawn(async move { stage_loop.run().await });

    {
        let store = h.store.clone();
        wait_for(
            move || {
                store.head().unwrap().height == bad_height - 1
                    && store.canonical_hash(bad_height).unwrap().is_none()
            },
            Duration::from_secs(20),
            "unwind below the bad block",
        )
        .await;
    }

    h.stop.cancel();
    let state = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, SyncState::Done);

    // Nothing at or above the bad height survives the unwind.
    assert_eq!(h.store.head().unwrap().height, bad_height - 1);
    for number in bad_height..=tip {
        assert!(h.store.canonical_hash(number).unwrap().is_none());
    }
    // The peer that kept serving the wrong body was reported for it.
    assert!(h
        .mock
        .penalties()
        .iter()
        .any(|(_, reason)| *reason == PenaltyReason::BadBlock));

    h.shutdown().await;
}

/// S5: no peer accepts our sends; issuance is spaced by `no_peer_delay`
/// and nothing changes.
#[tokio::test(flavor = "multi_thread")]
async fn no_peer_backpressure() {
    let (headers, bodies) = build_chain(30);
    let mock = Arc::new(MockSentry::new(headers.clone(), bodies));
    mock.accept_sends.store(false, Ordering::Relaxed);

    let config = ExchangeConfig {
        no_peer_delay: Duration::from_millis(200),
        ..quick_config()
    };
    let h = start(Arc::clone(&mock), headers[0].clone(), config);

    h.handle
        .sync_header_chain(headers[0].clone())
        .await
        .unwrap();
    h.announce_tip(&headers[30]).await;

    tokio::time::sleep(Duration::from_secs(1)).await;

    let attempts = h.mock.attempts_of(EthMessageId::GetBlockHeaders);
    assert!(attempts.len() >= 2, "issuance stopped entirely");
    for pair in attempts.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(
            gap >= Duration::from_millis(190),
            "attempts only {gap:?} apart"
        );
    }
    assert!(h.mock.penalties().is_empty());
    let (run, _) = h.handle.withdraw_stable_headers(1000).await.unwrap();
    assert!(run.is_empty());

    h.shutdown().await;
}

/// S6: stop() mid-request: every activity returns promptly and the store
/// stays consistent.
#[tokio::test(flavor = "multi_thread")]
async fn clean_shutdown_mid_request() {
    let (headers, bodies) = build_chain(50);
    let mock = Arc::new(MockSentry::new(headers.clone(), bodies));
    // Requests are accepted but never answered: permanently mid-request.
    mock.respond_headers.store(false, Ordering::Relaxed);
    mock.respond_bodies.store(false, Ordering::Relaxed);
    let h = start(Arc::clone(&mock), headers[0].clone(), quick_config());

    h.announce_tip(&headers[50]).await;

    let mut stage_loop = StageLoop::new(h.stages(), h.stop.clone());
    let run = tokio::spawn(async move { stage_loop.run().await });

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!h
        .mock
        .attempts_of(EthMessageId::GetBlockHeaders)
        .is_empty());

    h.stop.cancel();
    let state = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("stage loop did not stop in time")
        .unwrap();
    assert_eq!(state, SyncState::Done);

    let head = h.store.head().unwrap();
    assert_eq!(head.height, 0);
    assert_eq!(h.store.canonical_hash(0).unwrap(), Some(headers[0].hash()));

    h.shutdown().await;
}
