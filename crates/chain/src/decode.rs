//! Strict decoding of headers and bodies from wire RLP.

use alloy_primitives::{Address, B256, U256};

use crate::error::ChainError;
use crate::rlp::{self, RlpItem};
use crate::types::{keccak, BlockBody, BlockHeader, BlockNonce, Bloom, Hash};

fn next_field(iter: &mut impl Iterator<Item = RlpItem>) -> Result<RlpItem, ChainError> {
    iter.next()
        .ok_or_else(|| ChainError::Rlp("unexpected end of RLP fields".to_string()))
}

fn to_b256(item: RlpItem, field: &'static str) -> Result<B256, ChainError> {
    let bytes = item.into_bytes()?;
    if bytes.len() != 32 {
        return Err(ChainError::InvalidLength {
            field,
            expected: 32,
            got: bytes.len(),
        });
    }
    Ok(B256::from_slice(&bytes))
}

fn to_address(item: RlpItem) -> Result<Address, ChainError> {
    let bytes = item.into_bytes()?;
    if bytes.len() != 20 {
        return Err(ChainError::InvalidLength {
            field: "address",
            expected: 20,
            got: bytes.len(),
        });
    }
    Ok(Address::from_slice(&bytes))
}

fn to_bloom(item: RlpItem) -> Result<Bloom, ChainError> {
    let bytes = item.into_bytes()?;
    if bytes.len() != 256 {
        return Err(ChainError::InvalidLength {
            field: "bloom",
            expected: 256,
            got: bytes.len(),
        });
    }
    let mut bloom = [0u8; 256];
    bloom.copy_from_slice(&bytes);
    Ok(bloom)
}

fn to_u256(item: RlpItem) -> Result<U256, ChainError> {
    let bytes = item.into_bytes()?;
    if bytes.len() > 32 {
        return Err(ChainError::InvalidLength {
            field: "u256",
            expected: 32,
            got: bytes.len(),
        });
    }
    Ok(crate::types::be_to_u256(&bytes))
}

fn to_u64(item: RlpItem, field: &'static str) -> Result<u64, ChainError> {
    let bytes = item.into_bytes()?;
    if bytes.len() > 8 {
        return Err(ChainError::InvalidLength {
            field,
            expected: 8,
            got: bytes.len(),
        });
    }
    Ok(rlp::decode_u64(&bytes))
}

fn to_nonce(item: RlpItem) -> Result<BlockNonce, ChainError> {
    let bytes = item.into_bytes()?;
    if bytes.len() != 8 {
        return Err(ChainError::InvalidLength {
            field: "nonce",
            expected: 8,
            got: bytes.len(),
        });
    }
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&bytes);
    Ok(nonce)
}

/// Decode a header from an already-parsed RLP item.
pub fn header_from_rlp(item: RlpItem) -> Result<BlockHeader, ChainError> {
    let fields = item.into_list()?;
    // Pre-London headers have 15 fields; post-London adds base_fee.
    if fields.len() < 15 || fields.len() > 16 {
        return Err(ChainError::FieldCount {
            expected_min: 15,
            got: fields.len(),
        });
    }
    let has_base_fee = fields.len() == 16;
    let mut iter = fields.into_iter();

    Ok(BlockHeader {
        parent_hash: to_b256(next_field(&mut iter)?, "parent_hash")?,
        uncle_hash: to_b256(next_field(&mut iter)?, "uncle_hash")?,
        coinbase: to_address(next_field(&mut iter)?)?,
        state_root: to_b256(next_field(&mut iter)?, "state_root")?,
        transactions_root: to_b256(next_field(&mut iter)?, "transactions_root")?,
        receipts_root: to_b256(next_field(&mut iter)?, "receipts_root")?,
        logs_bloom: to_bloom(next_field(&mut iter)?)?,
        difficulty: to_u256(next_field(&mut iter)?)?,
        number: to_u64(next_field(&mut iter)?, "number")?,
        gas_limit: to_u64(next_field(&mut iter)?, "gas_limit")?,
        gas_used: to_u64(next_field(&mut iter)?, "gas_used")?,
        timestamp: to_u64(next_field(&mut iter)?, "timestamp")?,
        extra_data: next_field(&mut iter)?.into_bytes()?,
        mix_hash: to_b256(next_field(&mut iter)?, "mix_hash")?,
        nonce: to_nonce(next_field(&mut iter)?)?,
        base_fee: if has_base_fee {
            Some(to_u256(next_field(&mut iter)?)?)
        } else {
            None
        },
    })
}

/// Decode a header from raw RLP bytes.
pub fn decode_block_header(data: &[u8]) -> Result<BlockHeader, ChainError> {
    header_from_rlp(rlp::decode(data)?)
}

/// Decode a body from an already-parsed RLP item: `[txs, uncles]`.
pub fn body_from_rlp(item: RlpItem) -> Result<BlockBody, ChainError> {
    let fields = item.into_list()?;
    if fields.len() != 2 {
        return Err(ChainError::FieldCount {
            expected_min: 2,
            got: fields.len(),
        });
    }
    let mut iter = fields.into_iter();

    // Transactions stay as raw RLP; re-encoding a parsed item is canonical.
    let transactions: Vec<Vec<u8>> = next_field(&mut iter)?
        .into_list()?
        .into_iter()
        .map(|tx| tx.encode())
        .collect();

    let uncles = next_field(&mut iter)?
        .into_list()?
        .into_iter()
        .map(header_from_rlp)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BlockBody {
        transactions,
        uncles,
    })
}

/// Decode a body from raw RLP bytes.
pub fn decode_block_body(data: &[u8]) -> Result<BlockBody, ChainError> {
    body_from_rlp(rlp::decode(data)?)
}

/// keccak256 of raw RLP header bytes, without re-encoding.
pub fn hash_raw_header(raw_rlp: &[u8]) -> Hash {
    keccak(raw_rlp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::empty_trie_hash;
    use crate::types::empty_uncle_hash;

    fn header(number: u64, base_fee: Option<U256>) -> BlockHeader {
        BlockHeader {
            parent_hash: B256::ZERO,
            uncle_hash: empty_uncle_hash(),
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: empty_trie_hash(),
            receipts_root: B256::ZERO,
            logs_bloom: [0u8; 256],
            difficulty: U256::from(131_072u64),
            number,
            gas_limit: 8_000_000,
            gas_used: 21_000,
            timestamp: 1_438_270_000,
            extra_data: b"test".to_vec(),
            mix_hash: B256::ZERO,
            nonce: [0, 0, 0, 0, 0, 0, 0, 42],
            base_fee,
        }
    }

    #[test]
    fn header_roundtrip() {
        let h = header(1, None);
        let decoded = decode_block_header(&h.rlp_encode()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn header_roundtrip_with_base_fee() {
        let h = header(13_000_000, Some(U256::from(7u64)));
        let decoded = decode_block_header(&h.rlp_encode()).unwrap();
        assert_eq!(decoded.base_fee, Some(U256::from(7u64)));
    }

    #[test]
    fn header_with_wrong_field_count_rejected() {
        let item = RlpItem::List(vec![RlpItem::Bytes(vec![0x01]); 5]);
        assert!(decode_block_header(&item.encode()).is_err());
    }

    #[test]
    fn hash_raw_matches_struct_hash() {
        let h = header(0, None);
        assert_eq!(hash_raw_header(&h.rlp_encode()), h.hash());
    }

    #[test]
    fn body_roundtrip() {
        let body = BlockBody {
            transactions: vec![rlp::encode_bytes(&[0xde, 0xad, 0xbe, 0xef])],
            uncles: vec![header(5, None)],
        };
        let decoded = decode_block_body(&body.rlp_encode()).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn empty_body_roundtrip() {
        let decoded = decode_block_body(&BlockBody::default().rlp_encode()).unwrap();
        assert!(decoded.transactions.is_empty());
        assert!(decoded.uncles.is_empty());
    }

    #[test]
    fn garbage_body_rejected() {
        assert!(decode_block_body(&[0xff, 0x00, 0x01]).is_err());
    }
}
