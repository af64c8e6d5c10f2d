use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, B256, U256};
use chain::types::{empty_uncle_hash, BlockHeader};
use forks::ChainIdentity;
use sentry::{SentryApi, SentryClient, StatusData};
use store::{MemoryStore, StoreReader};
use sync::{
    BlockExchange, BodiesStage, HeadersStage, StageLoop, SyncState, SyncStage,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;

/// Peer-count publication cadence of the stats loop.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Main node orchestrator: wires store, sentry, exchange and stage loop.
pub struct Node {
    config: RuntimeConfig,
}

impl Node {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            "starting blocksync downloader"
        );
        info!(
            max_blocks_per_req = self.config.exchange.max_blocks_per_req,
            max_requests_per_peer = self.config.exchange.max_requests_per_peer,
            request_deadline = ?self.config.exchange.request_deadline,
            no_peer_delay = ?self.config.exchange.no_peer_delay,
            "exchange parameters"
        );

        // Unsupported chains are fatal before anything is opened.
        let identity = ChainIdentity::named(&self.config.chain)?;
        info!(
            chain = identity.name,
            chain_id = identity.chain_id,
            genesis_hash = %identity.genesis_hash,
            hard_forks = identity.distinct_fork_numbers().len(),
            "chain identity"
        );

        let store = MemoryStore::new(genesis_placeholder(&identity));
        store.write_fork_table(&identity.distinct_fork_numbers())?;

        let head = store.head()?;
        info!(
            head_hash = %head.hash,
            head_td = %head.td,
            head_height = head.height,
            "chain/db status"
        );

        // Sentry client: advertise our view, then wait for a matched peer.
        let sentry = Arc::new(SentryClient::new(&self.config.sentry_api_addr));
        let status = StatusData {
            network_id: identity.chain_id,
            total_difficulty: head.td,
            head_hash: head.hash,
            head_height: head.height,
            genesis_hash: identity.genesis_hash,
            fork_id: identity.fork_id(head.height),
        };
        sentry.set_status(&status).await?;
        info!("status set, waiting for peers");

        tokio::select! {
            result = sentry.hand_shake() => result?,
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received during handshake");
                return Ok(());
            }
        }

        let stop = CancellationToken::new();
        let (exchange, handle, inbound_tx) =
            BlockExchange::new(Arc::clone(&sentry), self.config.exchange.clone(), stop.clone());

        let exchange_task = tokio::spawn(exchange.execution_loop());
        let message_task = spawn_message_loop(Arc::clone(&sentry), inbound_tx, stop.clone());
        let stats_task = spawn_stats_loop(Arc::clone(&sentry), stop.clone());

        let stages = vec![
            SyncStage::Headers(HeadersStage::new(
                store.clone(),
                handle.clone(),
                stop.clone(),
            )),
            SyncStage::Bodies(BodiesStage::new(store.clone(), handle, stop.clone())),
        ];
        let mut stage_loop = StageLoop::new(stages, stop.clone());

        let run = stage_loop.run();
        tokio::pin!(run);
        let state = loop {
            tokio::select! {
                state = &mut run => break state,
                _ = tokio::signal::ctrl_c() => {
                    // The loop finishes its current batch and comes back
                    // with Done.
                    info!("shutdown signal received");
                    stop.cancel();
                }
            }
        };

        stop.cancel();
        join_quiet(exchange_task).await;
        join_quiet(message_task).await;
        join_quiet(stats_task).await;

        let head = store.head()?;
        info!(
            head_hash = %head.hash,
            head_height = head.height,
            "node stopped"
        );

        match state {
            SyncState::Error => Err("stage loop terminated with an error".into()),
            _ => Ok(()),
        }
    }
}

/// Message intake loop: drains the sentry's inbound long-poll into the
/// exchange queue until cancelled.
fn spawn_message_loop(
    sentry: Arc<SentryClient>,
    inbound_tx: tokio::sync::mpsc::Sender<sentry::InboundMessage>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let batch = tokio::select! {
                _ = stop.cancelled() => break,
                batch = sentry.receive_messages() => batch,
            };
            match batch {
                Ok(messages) => {
                    for message in messages {
                        if inbound_tx.send(message).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(err = %e, "receive_messages failed, retrying");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        debug!("message loop stopped");
    })
}

/// Stats intake loop: periodic peer-count snapshots for the logs.
fn spawn_stats_loop(sentry: Arc<SentryClient>, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {}
            }
            let count = tokio::select! {
                _ = stop.cancelled() => break,
                count = sentry.peer_count() => count,
            };
            match count {
                Ok(count) => info!(peers = count, "peer stats"),
                Err(e) => debug!(err = %e, "peer stats unavailable"),
            }
        }
        debug!("stats loop stopped");
    })
}

async fn join_quiet(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(err = %e, "background task panicked");
    }
}

/// Bootstrap header for an empty database. A production deployment opens
/// an existing chaindata directory instead; the advertised genesis hash
/// always comes from the chain identity, not from this header.
fn genesis_placeholder(identity: &ChainIdentity) -> BlockHeader {
    BlockHeader {
        parent_hash: B256::ZERO,
        uncle_hash: empty_uncle_hash(),
        coinbase: Address::ZERO,
        state_root: B256::ZERO,
        transactions_root: chain::trie::empty_trie_hash(),
        receipts_root: B256::ZERO,
        logs_bloom: [0u8; 256],
        difficulty: U256::from(1u64),
        number: 0,
        gas_limit: 5_000,
        gas_used: 0,
        timestamp: 0,
        extra_data: identity.name.as_bytes().to_vec(),
        mix_hash: B256::ZERO,
        nonce: [0u8; 8],
        base_fee: None,
    }
}
