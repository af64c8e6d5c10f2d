//! The peer-client seam: what the downloader needs from the transport
//! daemon, expressed as a trait so the exchange can run against a mock.

use std::future::Future;
use std::time::Duration;

use alloy_primitives::U256;
use chain::{BlockNum, Hash};
use forks::ForkId;

use crate::error::SentryError;
use crate::messages::{EthMessage, EthMessageId};

/// Opaque peer handle assigned by the transport daemon.
pub type PeerId = [u8; 64];

/// Peers a message was actually delivered to. May be empty: no peer was
/// available or matched the request.
pub type SentPeers = Vec<PeerId>;

/// Penalties the daemon understands; it decides whether to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyReason {
    BadBlock,
    BadProtocol,
    TooSlow,
    Useless,
}

impl PenaltyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PenaltyReason::BadBlock => "BadBlock",
            PenaltyReason::BadProtocol => "BadProtocol",
            PenaltyReason::TooSlow => "TooSlow",
            PenaltyReason::Useless => "Useless",
        }
    }
}

/// A penalty decided by the engine, to be delivered to the daemon.
#[derive(Debug, Clone, Copy)]
pub struct Penalty {
    pub peer: PeerId,
    pub reason: PenaltyReason,
}

/// Typed inbound message, tagged with the originating peer. The payload
/// stays raw; decoding (and penalizing on failure) happens in the
/// exchange.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub peer: PeerId,
    pub id: EthMessageId,
    pub data: Vec<u8>,
}

/// Our view of the chain, advertised to the daemon for the Status
/// handshake it performs with every peer.
#[derive(Debug, Clone)]
pub struct StatusData {
    pub network_id: u64,
    pub total_difficulty: U256,
    pub head_hash: Hash,
    pub head_height: BlockNum,
    pub genesis_hash: Hash,
    pub fork_id: ForkId,
}

/// Unary surface of the sentry daemon.
///
/// `receive_messages` is a long-poll: an empty reply after the poll
/// window is normal, and looping over it forms the restartable inbound
/// stream. All calls are cancel-safe at their await points.
pub trait SentryApi: Send + Sync + 'static {
    fn set_status(
        &self,
        status: &StatusData,
    ) -> impl Future<Output = Result<(), SentryError>> + Send;

    /// Resolves once the daemon reports at least one peer matched on
    /// network id and fork id.
    fn hand_shake(&self) -> impl Future<Output = Result<(), SentryError>> + Send;

    fn send_message_to_random(
        &self,
        message: &EthMessage,
        max_peers: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<SentPeers, SentryError>> + Send;

    fn send_message_by_id(
        &self,
        peer: PeerId,
        message: &EthMessage,
        timeout: Duration,
    ) -> impl Future<Output = Result<SentPeers, SentryError>> + Send;

    fn receive_messages(
        &self,
    ) -> impl Future<Output = Result<Vec<InboundMessage>, SentryError>> + Send;

    fn penalize_peer(
        &self,
        peer: PeerId,
        reason: PenaltyReason,
    ) -> impl Future<Output = Result<(), SentryError>> + Send;

    fn peer_count(&self) -> impl Future<Output = Result<u64, SentryError>> + Send;
}
