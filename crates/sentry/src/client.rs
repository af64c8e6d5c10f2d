//! JSON-RPC client for the sentry daemon.

use std::time::Duration;

use chain::types::u256_to_be;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::{InboundMessage, PenaltyReason, PeerId, SentPeers, SentryApi, StatusData};
use crate::error::SentryError;
use crate::messages::{EthMessage, EthMessageId};

/// How long a single receive long-poll is allowed to hang.
const RECEIVE_POLL_TIMEOUT: Duration = Duration::from_secs(60);
/// Delay between peer-count probes while waiting for the handshake.
const HANDSHAKE_POLL_DELAY: Duration = Duration::from_secs(1);

/// Error code the daemon uses for chain/fork-id mismatches in `setStatus`.
const INCOMPATIBLE_CHAIN_CODE: i64 = -38001;

pub struct SentryClient {
    url: String,
    http: reqwest::Client,
}

impl SentryClient {
    pub fn new(addr: &str) -> Self {
        let url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, SentryError> {
        self.rpc_with_timeout(method, params, None).await
    }

    async fn rpc_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, SentryError> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        debug!(method, "sending sentry RPC request");

        let mut request = self.http.post(&self.url).json(&body);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        let resp: Value = request.send().await?.json().await?;

        if let Some(err) = resp.get("error") {
            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error")
                .to_string();
            return Err(SentryError::Rpc { code, message });
        }

        resp.get("result").cloned().ok_or(SentryError::NullResult)
    }
}

fn encode_peer(peer: &PeerId) -> String {
    hex::encode(peer)
}

fn decode_peer(value: &Value) -> Result<PeerId, SentryError> {
    let text = value
        .as_str()
        .ok_or_else(|| SentryError::BadReply("peer id is not a string".to_string()))?;
    let bytes = hex::decode(text.trim_start_matches("0x"))
        .map_err(|e| SentryError::BadReply(format!("peer id hex: {e}")))?;
    if bytes.len() != 64 {
        return Err(SentryError::BadReply(format!(
            "peer id must be 64 bytes, got {}",
            bytes.len()
        )));
    }
    let mut peer = [0u8; 64];
    peer.copy_from_slice(&bytes);
    Ok(peer)
}

fn decode_sent_peers(result: Value) -> Result<SentPeers, SentryError> {
    let peers = result
        .get("peers")
        .and_then(|p| p.as_array())
        .cloned()
        .unwrap_or_default();
    peers.iter().map(decode_peer).collect()
}

impl SentryApi for SentryClient {
    async fn set_status(&self, status: &StatusData) -> Result<(), SentryError> {
        let params = json!([{
            "networkId": status.network_id,
            "totalDifficulty": format!("0x{}", hex::encode(u256_to_be(&status.total_difficulty))),
            "bestHash": format!("0x{:x}", status.head_hash),
            "maxBlockHeight": status.head_height,
            "forkData": {
                "genesis": format!("0x{:x}", status.genesis_hash),
                "forkHash": format!("0x{}", hex::encode(status.fork_id.fork_hash)),
                "forkNext": status.fork_id.fork_next,
            },
        }]);

        match self.rpc("sentry_setStatus", params).await {
            Ok(_) => Ok(()),
            Err(SentryError::Rpc { code, message }) if code == INCOMPATIBLE_CHAIN_CODE => {
                Err(SentryError::Handshake(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn hand_shake(&self) -> Result<(), SentryError> {
        loop {
            match self.peer_count().await {
                Ok(0) => {
                    debug!("waiting for a matched peer");
                }
                Ok(count) => {
                    debug!(count, "handshake complete");
                    return Ok(());
                }
                Err(SentryError::Handshake(m)) => return Err(SentryError::Handshake(m)),
                Err(e) => {
                    warn!(err = %e, "sentry unreachable, retrying");
                }
            }
            tokio::time::sleep(HANDSHAKE_POLL_DELAY).await;
        }
    }

    async fn send_message_to_random(
        &self,
        message: &EthMessage,
        max_peers: usize,
        timeout: Duration,
    ) -> Result<SentPeers, SentryError> {
        let params = json!([{
            "messageId": message.id().as_str(),
            "data": format!("0x{}", hex::encode(message.encode())),
            "maxPeers": max_peers,
        }]);
        let result = self
            .rpc_with_timeout("sentry_sendMessageToRandomPeers", params, Some(timeout))
            .await?;
        decode_sent_peers(result)
    }

    async fn send_message_by_id(
        &self,
        peer: PeerId,
        message: &EthMessage,
        timeout: Duration,
    ) -> Result<SentPeers, SentryError> {
        let params = json!([{
            "peerId": encode_peer(&peer),
            "messageId": message.id().as_str(),
            "data": format!("0x{}", hex::encode(message.encode())),
        }]);
        let result = self
            .rpc_with_timeout("sentry_sendMessageById", params, Some(timeout))
            .await?;
        decode_sent_peers(result)
    }

    async fn receive_messages(&self) -> Result<Vec<InboundMessage>, SentryError> {
        let result = self
            .rpc_with_timeout(
                "sentry_receiveMessages",
                json!([]),
                Some(RECEIVE_POLL_TIMEOUT),
            )
            .await?;

        let entries = result
            .as_array()
            .ok_or_else(|| SentryError::BadReply("receiveMessages: not an array".to_string()))?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries {
            let peer = decode_peer(
                entry
                    .get("peerId")
                    .ok_or_else(|| SentryError::BadReply("message without peerId".to_string()))?,
            )?;
            let id_name = entry
                .get("messageId")
                .and_then(|m| m.as_str())
                .ok_or_else(|| SentryError::BadReply("message without messageId".to_string()))?;
            let Some(id) = EthMessageId::parse(id_name) else {
                // Unknown ids are the daemon's problem to filter; skip.
                debug!(message_id = id_name, "ignoring unknown message id");
                continue;
            };
            let data_hex = entry
                .get("data")
                .and_then(|d| d.as_str())
                .unwrap_or_default();
            let data = hex::decode(data_hex.trim_start_matches("0x"))
                .map_err(|e| SentryError::BadReply(format!("message data hex: {e}")))?;
            messages.push(InboundMessage { peer, id, data });
        }
        Ok(messages)
    }

    async fn penalize_peer(&self, peer: PeerId, reason: PenaltyReason) -> Result<(), SentryError> {
        let params = json!([{
            "peerId": encode_peer(&peer),
            "penalty": reason.as_str(),
        }]);
        self.rpc("sentry_penalizePeer", params).await?;
        Ok(())
    }

    async fn peer_count(&self) -> Result<u64, SentryError> {
        let result = self.rpc("sentry_peerCount", json!([])).await?;
        result
            .get("count")
            .and_then(|c| c.as_u64())
            .ok_or_else(|| SentryError::BadReply("peerCount: missing count".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_scheme_is_defaulted() {
        let client = SentryClient::new("127.0.0.1:9091");
        assert_eq!(client.url, "http://127.0.0.1:9091");
        let client = SentryClient::new("http://sentry:9091");
        assert_eq!(client.url, "http://sentry:9091");
    }

    #[test]
    fn peer_roundtrip() {
        let peer = [0x5au8; 64];
        let decoded = decode_peer(&json!(encode_peer(&peer))).unwrap();
        assert_eq!(decoded, peer);
    }

    #[test]
    fn short_peer_rejected() {
        assert!(decode_peer(&json!("aabb")).is_err());
        assert!(decode_peer(&json!(42)).is_err());
    }

    #[test]
    fn sent_peers_default_to_empty() {
        assert!(decode_sent_peers(json!({})).unwrap().is_empty());
        let one = decode_sent_peers(json!({"peers": [encode_peer(&[1u8; 64])]})).unwrap();
        assert_eq!(one.len(), 1);
    }
}
