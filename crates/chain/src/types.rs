use alloy_primitives::{Address, B256, U256};
use sha3::{Digest, Keccak256};

use crate::rlp::{self, RlpItem};

/// 32-byte content identifier (keccak256 of RLP).
pub type Hash = B256;

/// Monotonically increasing 64-bit block height.
pub type BlockNum = u64;

/// 8-byte PoW seal nonce.
pub type BlockNonce = [u8; 8];

/// 256-byte log bloom filter.
pub type Bloom = [u8; 256];

/// Block header. Identity is the keccak256 of the RLP encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: B256,
    pub uncle_hash: B256,
    pub coinbase: Address,
    pub state_root: B256,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: BlockNum,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: B256,
    pub nonce: BlockNonce,
    /// Present post-London only.
    pub base_fee: Option<U256>,
}

impl BlockHeader {
    /// keccak256 of the RLP encoding.
    pub fn hash(&self) -> Hash {
        keccak(&self.rlp_encode())
    }

    pub fn rlp_encode(&self) -> Vec<u8> {
        self.to_rlp_item().encode()
    }

    pub fn to_rlp_item(&self) -> RlpItem {
        let mut fields = vec![
            RlpItem::Bytes(self.parent_hash.as_slice().to_vec()),
            RlpItem::Bytes(self.uncle_hash.as_slice().to_vec()),
            RlpItem::Bytes(self.coinbase.as_slice().to_vec()),
            RlpItem::Bytes(self.state_root.as_slice().to_vec()),
            RlpItem::Bytes(self.transactions_root.as_slice().to_vec()),
            RlpItem::Bytes(self.receipts_root.as_slice().to_vec()),
            RlpItem::Bytes(self.logs_bloom.to_vec()),
            RlpItem::Bytes(u256_to_be(&self.difficulty)),
            RlpItem::Bytes(rlp::encode_u64(self.number)),
            RlpItem::Bytes(rlp::encode_u64(self.gas_limit)),
            RlpItem::Bytes(rlp::encode_u64(self.gas_used)),
            RlpItem::Bytes(rlp::encode_u64(self.timestamp)),
            RlpItem::Bytes(self.extra_data.clone()),
            RlpItem::Bytes(self.mix_hash.as_slice().to_vec()),
            RlpItem::Bytes(self.nonce.to_vec()),
        ];
        if let Some(ref base_fee) = self.base_fee {
            fields.push(RlpItem::Bytes(u256_to_be(base_fee)));
        }
        RlpItem::List(fields)
    }
}

/// Block body: raw RLP transactions plus decoded uncle headers.
///
/// Transactions stay opaque; the downloader only needs their trie root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockBody {
    pub transactions: Vec<Vec<u8>>,
    pub uncles: Vec<BlockHeader>,
}

impl BlockBody {
    pub fn rlp_encode(&self) -> Vec<u8> {
        // Transactions are pre-encoded; splice them as a raw list payload.
        let mut txs_payload = Vec::new();
        for tx in &self.transactions {
            txs_payload.extend_from_slice(tx);
        }
        let uncles: Vec<RlpItem> = self.uncles.iter().map(|u| u.to_rlp_item()).collect();

        let mut payload = rlp::encode_list_payload(&txs_payload);
        payload.extend(RlpItem::List(uncles).encode());
        rlp::encode_list_payload(&payload)
    }

    /// Trie root over the transaction list (the `transactions_root` rule).
    pub fn transactions_root(&self) -> Hash {
        crate::trie::ordered_trie_root(&self.transactions)
    }

    /// keccak256 of the RLP-encoded uncle list (the `uncle_hash` rule).
    pub fn uncle_root(&self) -> Hash {
        compute_uncle_hash(&self.uncles)
    }
}

pub fn keccak(data: &[u8]) -> B256 {
    B256::from_slice(&Keccak256::digest(data))
}

/// keccak256 of the RLP-encoded empty list.
pub fn empty_uncle_hash() -> B256 {
    keccak(&[0xc0])
}

pub fn compute_uncle_hash(uncles: &[BlockHeader]) -> B256 {
    if uncles.is_empty() {
        return empty_uncle_hash();
    }
    let items: Vec<RlpItem> = uncles.iter().map(|u| u.to_rlp_item()).collect();
    keccak(&RlpItem::List(items).encode())
}

/// Big-endian bytes without leading zeros (empty for zero), the RLP
/// integer representation.
pub fn u256_to_be(v: &U256) -> Vec<u8> {
    if v.is_zero() {
        return Vec::new();
    }
    let buf = v.to_be_bytes::<32>();
    let start = buf.iter().position(|&b| b != 0).unwrap_or(32);
    buf[start..].to_vec()
}

pub fn be_to_u256(bytes: &[u8]) -> U256 {
    if bytes.is_empty() {
        return U256::ZERO;
    }
    let mut buf = [0u8; 32];
    let len = bytes.len().min(32);
    buf[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    U256::from_be_bytes(buf)
}
