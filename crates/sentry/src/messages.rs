//! eth/66 packet codecs.
//!
//! Request/response pairs are `[request_id, payload]`; encoding is
//! canonical RLP with strict lengths. Any decode failure is surfaced to
//! the exchange, which penalizes the sending peer.

use alloy_primitives::U256;
use chain::decode::{body_from_rlp, header_from_rlp};
use chain::rlp::{self, RlpItem};
use chain::types::{be_to_u256, u256_to_be};
use chain::{BlockBody, BlockHeader, BlockNum, ChainError, Hash};

/// Wire message kinds the downloader speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthMessageId {
    GetBlockHeaders,
    BlockHeaders,
    GetBlockBodies,
    BlockBodies,
    NewBlockHashes,
    NewBlock,
}

impl EthMessageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            EthMessageId::GetBlockHeaders => "GetBlockHeaders",
            EthMessageId::BlockHeaders => "BlockHeaders",
            EthMessageId::GetBlockBodies => "GetBlockBodies",
            EthMessageId::BlockBodies => "BlockBodies",
            EthMessageId::NewBlockHashes => "NewBlockHashes",
            EthMessageId::NewBlock => "NewBlock",
        }
    }

    pub fn parse(name: &str) -> Option<EthMessageId> {
        match name {
            "GetBlockHeaders" => Some(EthMessageId::GetBlockHeaders),
            "BlockHeaders" => Some(EthMessageId::BlockHeaders),
            "GetBlockBodies" => Some(EthMessageId::GetBlockBodies),
            "BlockBodies" => Some(EthMessageId::BlockBodies),
            "NewBlockHashes" => Some(EthMessageId::NewBlockHashes),
            "NewBlock" => Some(EthMessageId::NewBlock),
            _ => None,
        }
    }
}

/// Start of a header request: by number or by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderOrigin {
    Number(BlockNum),
    Hash(Hash),
}

/// `GetBlockHeaders (0x03)`: `[request_id, [origin, amount, skip, reverse]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockHeadersPacket {
    pub request_id: u64,
    pub origin: HeaderOrigin,
    pub amount: u64,
    pub skip: u64,
    pub reverse: bool,
}

impl GetBlockHeadersPacket {
    pub fn encode(&self) -> Vec<u8> {
        let origin = match self.origin {
            HeaderOrigin::Number(n) => RlpItem::Bytes(rlp::encode_u64(n)),
            HeaderOrigin::Hash(h) => RlpItem::Bytes(h.as_slice().to_vec()),
        };
        let inner = RlpItem::List(vec![
            origin,
            RlpItem::Bytes(rlp::encode_u64(self.amount)),
            RlpItem::Bytes(rlp::encode_u64(self.skip)),
            RlpItem::Bytes(if self.reverse { vec![1] } else { vec![] }),
        ]);
        RlpItem::List(vec![RlpItem::Bytes(rlp::encode_u64(self.request_id)), inner]).encode()
    }

    pub fn decode(data: &[u8]) -> Result<GetBlockHeadersPacket, ChainError> {
        let (request_id, payload) = split_request(data)?;
        let inner = payload.into_list()?;
        if inner.len() != 4 {
            return Err(ChainError::FieldCount {
                expected_min: 4,
                got: inner.len(),
            });
        }
        let mut iter = inner.into_iter();

        let origin_bytes = next(&mut iter)?.into_bytes()?;
        let origin = if origin_bytes.len() == 32 {
            HeaderOrigin::Hash(Hash::from_slice(&origin_bytes))
        } else {
            HeaderOrigin::Number(rlp::decode_u64(&origin_bytes))
        };
        let amount = rlp::decode_u64(&next(&mut iter)?.into_bytes()?);
        let skip = rlp::decode_u64(&next(&mut iter)?.into_bytes()?);
        let reverse_bytes = next(&mut iter)?.into_bytes()?;
        let reverse = reverse_bytes.first().is_some_and(|&b| b != 0);

        Ok(GetBlockHeadersPacket {
            request_id,
            origin,
            amount,
            skip,
            reverse,
        })
    }
}

/// `BlockHeaders (0x04)`: `[request_id, [header, ...]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeadersPacket {
    pub request_id: u64,
    pub headers: Vec<BlockHeader>,
}

impl BlockHeadersPacket {
    pub fn encode(&self) -> Vec<u8> {
        let headers: Vec<RlpItem> = self.headers.iter().map(|h| h.to_rlp_item()).collect();
        RlpItem::List(vec![
            RlpItem::Bytes(rlp::encode_u64(self.request_id)),
            RlpItem::List(headers),
        ])
        .encode()
    }

    pub fn decode(data: &[u8]) -> Result<BlockHeadersPacket, ChainError> {
        let (request_id, payload) = split_request(data)?;
        let headers = payload
            .into_list()?
            .into_iter()
            .map(header_from_rlp)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlockHeadersPacket {
            request_id,
            headers,
        })
    }
}

/// `GetBlockBodies (0x05)`: `[request_id, [hash, ...]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBlockBodiesPacket {
    pub request_id: u64,
    pub hashes: Vec<Hash>,
}

impl GetBlockBodiesPacket {
    pub fn encode(&self) -> Vec<u8> {
        let hashes: Vec<RlpItem> = self
            .hashes
            .iter()
            .map(|h| RlpItem::Bytes(h.as_slice().to_vec()))
            .collect();
        RlpItem::List(vec![
            RlpItem::Bytes(rlp::encode_u64(self.request_id)),
            RlpItem::List(hashes),
        ])
        .encode()
    }

    pub fn decode(data: &[u8]) -> Result<GetBlockBodiesPacket, ChainError> {
        let (request_id, payload) = split_request(data)?;
        let mut hashes = Vec::new();
        for item in payload.into_list()? {
            let bytes = item.into_bytes()?;
            if bytes.len() != 32 {
                return Err(ChainError::InvalidLength {
                    field: "block_hash",
                    expected: 32,
                    got: bytes.len(),
                });
            }
            hashes.push(Hash::from_slice(&bytes));
        }
        Ok(GetBlockBodiesPacket { request_id, hashes })
    }
}

/// `BlockBodies (0x06)`: `[request_id, [body, ...]]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBodiesPacket {
    pub request_id: u64,
    pub bodies: Vec<BlockBody>,
}

impl BlockBodiesPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        for body in &self.bodies {
            payload.extend(body.rlp_encode());
        }
        let mut outer = rlp::encode_bytes(&rlp::encode_u64(self.request_id));
        outer.extend(rlp::encode_list_payload(&payload));
        rlp::encode_list_payload(&outer)
    }

    pub fn decode(data: &[u8]) -> Result<BlockBodiesPacket, ChainError> {
        let (request_id, payload) = split_request(data)?;
        let bodies = payload
            .into_list()?
            .into_iter()
            .map(body_from_rlp)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlockBodiesPacket { request_id, bodies })
    }
}

/// `NewBlockHashes (0x01)`: `[[hash, number], ...]` — no request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlockHashesPacket {
    pub entries: Vec<(Hash, BlockNum)>,
}

impl NewBlockHashesPacket {
    pub fn encode(&self) -> Vec<u8> {
        let items: Vec<RlpItem> = self
            .entries
            .iter()
            .map(|(hash, number)| {
                RlpItem::List(vec![
                    RlpItem::Bytes(hash.as_slice().to_vec()),
                    RlpItem::Bytes(rlp::encode_u64(*number)),
                ])
            })
            .collect();
        RlpItem::List(items).encode()
    }

    pub fn decode(data: &[u8]) -> Result<NewBlockHashesPacket, ChainError> {
        let mut entries = Vec::new();
        for item in rlp::decode(data)?.into_list()? {
            let fields = item.into_list()?;
            if fields.len() != 2 {
                return Err(ChainError::FieldCount {
                    expected_min: 2,
                    got: fields.len(),
                });
            }
            let mut iter = fields.into_iter();
            let hash_bytes = next(&mut iter)?.into_bytes()?;
            if hash_bytes.len() != 32 {
                return Err(ChainError::InvalidLength {
                    field: "block_hash",
                    expected: 32,
                    got: hash_bytes.len(),
                });
            }
            let number = rlp::decode_u64(&next(&mut iter)?.into_bytes()?);
            entries.push((Hash::from_slice(&hash_bytes), number));
        }
        Ok(NewBlockHashesPacket { entries })
    }
}

/// `NewBlock (0x07)`: `[[header, txs, uncles], td]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBlockPacket {
    pub header: BlockHeader,
    pub body: BlockBody,
    pub total_difficulty: U256,
}

impl NewBlockPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut txs = Vec::new();
        for tx in &self.body.transactions {
            txs.extend_from_slice(tx);
        }
        let uncles: Vec<RlpItem> = self.body.uncles.iter().map(|u| u.to_rlp_item()).collect();

        let mut block = self.header.rlp_encode();
        block.extend(rlp::encode_list_payload(&txs));
        block.extend(RlpItem::List(uncles).encode());

        let mut outer = rlp::encode_list_payload(&block);
        outer.extend(rlp::encode_bytes(&u256_to_be(&self.total_difficulty)));
        rlp::encode_list_payload(&outer)
    }

    pub fn decode(data: &[u8]) -> Result<NewBlockPacket, ChainError> {
        let outer = rlp::decode(data)?.into_list()?;
        if outer.len() != 2 {
            return Err(ChainError::FieldCount {
                expected_min: 2,
                got: outer.len(),
            });
        }
        let mut iter = outer.into_iter();

        let block = next(&mut iter)?.into_list()?;
        if block.len() != 3 {
            return Err(ChainError::FieldCount {
                expected_min: 3,
                got: block.len(),
            });
        }
        let mut block_iter = block.into_iter();
        let header = header_from_rlp(next(&mut block_iter)?)?;
        let transactions: Vec<Vec<u8>> = next(&mut block_iter)?
            .into_list()?
            .into_iter()
            .map(|tx| tx.encode())
            .collect();
        let uncles = next(&mut block_iter)?
            .into_list()?
            .into_iter()
            .map(header_from_rlp)
            .collect::<Result<Vec<_>, _>>()?;

        let td = be_to_u256(&next(&mut iter)?.into_bytes()?);

        Ok(NewBlockPacket {
            header,
            body: BlockBody {
                transactions,
                uncles,
            },
            total_difficulty: td,
        })
    }
}

/// Outbound requests the downloader issues.
#[derive(Debug, Clone)]
pub enum EthMessage {
    GetBlockHeaders(GetBlockHeadersPacket),
    GetBlockBodies(GetBlockBodiesPacket),
}

impl EthMessage {
    pub fn id(&self) -> EthMessageId {
        match self {
            EthMessage::GetBlockHeaders(_) => EthMessageId::GetBlockHeaders,
            EthMessage::GetBlockBodies(_) => EthMessageId::GetBlockBodies,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            EthMessage::GetBlockHeaders(p) => p.encode(),
            EthMessage::GetBlockBodies(p) => p.encode(),
        }
    }
}

fn split_request(data: &[u8]) -> Result<(u64, RlpItem), ChainError> {
    let outer = rlp::decode(data)?.into_list()?;
    if outer.len() != 2 {
        return Err(ChainError::FieldCount {
            expected_min: 2,
            got: outer.len(),
        });
    }
    let mut iter = outer.into_iter();
    let id_bytes = next(&mut iter)?.into_bytes()?;
    if id_bytes.len() > 8 {
        return Err(ChainError::InvalidLength {
            field: "request_id",
            expected: 8,
            got: id_bytes.len(),
        });
    }
    let request_id = rlp::decode_u64(&id_bytes);
    Ok((request_id, next(&mut iter)?))
}

fn next(iter: &mut impl Iterator<Item = RlpItem>) -> Result<RlpItem, ChainError> {
    iter.next()
        .ok_or_else(|| ChainError::Rlp("unexpected end of RLP fields".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};
    use chain::types::empty_uncle_hash;

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            parent_hash: B256::from([number as u8; 32]),
            uncle_hash: empty_uncle_hash(),
            coinbase: Address::ZERO,
            state_root: B256::ZERO,
            transactions_root: chain::trie::empty_trie_hash(),
            receipts_root: B256::ZERO,
            logs_bloom: [0u8; 256],
            difficulty: U256::from(131_072u64),
            number,
            gas_limit: 8_000_000,
            gas_used: 0,
            timestamp: number,
            extra_data: Vec::new(),
            mix_hash: B256::ZERO,
            nonce: [0u8; 8],
            base_fee: None,
        }
    }

    #[test]
    fn get_headers_roundtrip_by_hash() {
        let packet = GetBlockHeadersPacket {
            request_id: 42,
            origin: HeaderOrigin::Hash(B256::from([0xaa; 32])),
            amount: 128,
            skip: 0,
            reverse: true,
        };
        assert_eq!(
            GetBlockHeadersPacket::decode(&packet.encode()).unwrap(),
            packet
        );
    }

    #[test]
    fn get_headers_roundtrip_by_number() {
        let packet = GetBlockHeadersPacket {
            request_id: 7,
            origin: HeaderOrigin::Number(1_000),
            amount: 192,
            skip: 0,
            reverse: false,
        };
        assert_eq!(
            GetBlockHeadersPacket::decode(&packet.encode()).unwrap(),
            packet
        );
    }

    #[test]
    fn headers_roundtrip() {
        let packet = BlockHeadersPacket {
            request_id: 9,
            headers: vec![header(1), header(2)],
        };
        assert_eq!(BlockHeadersPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn empty_headers_reply_is_valid() {
        let packet = BlockHeadersPacket {
            request_id: 3,
            headers: Vec::new(),
        };
        let decoded = BlockHeadersPacket::decode(&packet.encode()).unwrap();
        assert!(decoded.headers.is_empty());
    }

    #[test]
    fn bodies_roundtrip() {
        let packet = BlockBodiesPacket {
            request_id: 11,
            bodies: vec![
                BlockBody::default(),
                BlockBody {
                    transactions: vec![chain::rlp::encode_bytes(&[0x01, 0x02])],
                    uncles: vec![header(5)],
                },
            ],
        };
        assert_eq!(BlockBodiesPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn get_bodies_rejects_short_hash() {
        let bad = RlpItem::List(vec![
            RlpItem::Bytes(rlp::encode_u64(1)),
            RlpItem::List(vec![RlpItem::Bytes(vec![0xaa; 31])]),
        ]);
        assert!(GetBlockBodiesPacket::decode(&bad.encode()).is_err());
    }

    #[test]
    fn new_block_hashes_roundtrip() {
        let packet = NewBlockHashesPacket {
            entries: vec![(B256::from([1; 32]), 100), (B256::from([2; 32]), 200)],
        };
        assert_eq!(
            NewBlockHashesPacket::decode(&packet.encode()).unwrap(),
            packet
        );
    }

    #[test]
    fn new_block_roundtrip() {
        let packet = NewBlockPacket {
            header: header(77),
            body: BlockBody {
                transactions: vec![chain::rlp::encode_bytes(&[0xde, 0xad])],
                uncles: Vec::new(),
            },
            total_difficulty: U256::from(12_345u64),
        };
        assert_eq!(NewBlockPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn message_id_names_roundtrip() {
        for id in [
            EthMessageId::GetBlockHeaders,
            EthMessageId::BlockHeaders,
            EthMessageId::GetBlockBodies,
            EthMessageId::BlockBodies,
            EthMessageId::NewBlockHashes,
            EthMessageId::NewBlock,
        ] {
            assert_eq!(EthMessageId::parse(id.as_str()), Some(id));
        }
        assert_eq!(EthMessageId::parse("Transactions"), None);
    }
}
