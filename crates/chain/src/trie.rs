//! Ordered Merkle-Patricia trie root.
//!
//! Computes the root Ethereum stores in `transactions_root` and
//! `receipts_root`: a trie keyed by the RLP encoding of each item's index,
//! valued by the raw item bytes. Nodes whose encoding is shorter than 32
//! bytes are inlined in their parent; everything else is referenced by
//! keccak256, and the root is always hashed.

use alloy_primitives::B256;

use crate::rlp;
use crate::types::keccak;

/// Root over `items` keyed by RLP-encoded index.
pub fn ordered_trie_root(items: &[Vec<u8>]) -> B256 {
    if items.is_empty() {
        return empty_trie_hash();
    }

    let mut pairs: Vec<(Vec<u8>, &[u8])> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let key = rlp::encode_bytes(&rlp::encode_u64(i as u64));
            (to_nibbles(&key), item.as_slice())
        })
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));

    let root = build(&pairs, 0);
    keccak(&encode_node(&root))
}

/// keccak256(RLP("")) — the root of an empty trie.
pub fn empty_trie_hash() -> B256 {
    keccak(&[0x80])
}

enum Node {
    Leaf { path: Vec<u8>, value: Vec<u8> },
    Ext { path: Vec<u8>, child: Box<Node> },
    Branch { children: Vec<Option<Node>>, value: Option<Vec<u8>> },
}

/// Build the subtree for `pairs`, all sharing their first `depth` nibbles.
/// Pairs are sorted, non-empty, and have distinct keys (RLP is prefix-free,
/// but an exhausted key is still routed to the branch value slot).
fn build(pairs: &[(Vec<u8>, &[u8])], depth: usize) -> Node {
    if pairs.len() == 1 {
        let (key, value) = &pairs[0];
        return Node::Leaf {
            path: key[depth..].to_vec(),
            value: value.to_vec(),
        };
    }

    // Longest common prefix below `depth` across all keys.
    let first = &pairs[0].0;
    let mut lcp = 0;
    'outer: while depth + lcp < first.len() {
        let nibble = first[depth + lcp];
        for (key, _) in &pairs[1..] {
            if key.len() <= depth + lcp || key[depth + lcp] != nibble {
                break 'outer;
            }
        }
        lcp += 1;
    }

    if lcp > 0 {
        return Node::Ext {
            path: first[depth..depth + lcp].to_vec(),
            child: Box::new(build(pairs, depth + lcp)),
        };
    }

    let mut children: Vec<Option<Node>> = (0..16).map(|_| None).collect();
    let mut value = None;
    let mut start = 0;
    while start < pairs.len() {
        let (key, item) = &pairs[start];
        if key.len() == depth {
            value = Some(item.to_vec());
            start += 1;
            continue;
        }
        let nibble = key[depth];
        let mut end = start + 1;
        while end < pairs.len()
            && pairs[end].0.len() > depth
            && pairs[end].0[depth] == nibble
        {
            end += 1;
        }
        children[nibble as usize] = Some(build(&pairs[start..end], depth + 1));
        start = end;
    }
    Node::Branch { children, value }
}

/// Full RLP encoding of a node.
fn encode_node(node: &Node) -> Vec<u8> {
    let mut payload = Vec::new();
    match node {
        Node::Leaf { path, value } => {
            payload.extend(rlp::encode_bytes(&hex_prefix(path, true)));
            payload.extend(rlp::encode_bytes(value));
        }
        Node::Ext { path, child } => {
            payload.extend(rlp::encode_bytes(&hex_prefix(path, false)));
            payload.extend(node_ref(child));
        }
        Node::Branch { children, value } => {
            for child in children {
                match child {
                    Some(c) => payload.extend(node_ref(c)),
                    None => payload.extend(rlp::encode_bytes(&[])),
                }
            }
            match value {
                Some(v) => payload.extend(rlp::encode_bytes(v)),
                None => payload.extend(rlp::encode_bytes(&[])),
            }
        }
    }
    rlp::encode_list_payload(&payload)
}

/// Child reference: inlined when shorter than 32 bytes, hashed otherwise.
fn node_ref(node: &Node) -> Vec<u8> {
    let encoded = encode_node(node);
    if encoded.len() < 32 {
        encoded
    } else {
        rlp::encode_bytes(keccak(&encoded).as_slice())
    }
}

fn to_nibbles(bytes: &[u8]) -> Vec<u8> {
    let mut nibbles = Vec::with_capacity(bytes.len() * 2);
    for &b in bytes {
        nibbles.push(b >> 4);
        nibbles.push(b & 0x0f);
    }
    nibbles
}

/// Compact (hex-prefix) path encoding with the leaf/extension flag.
fn hex_prefix(nibbles: &[u8], leaf: bool) -> Vec<u8> {
    let flag: u8 = if leaf { 0x20 } else { 0x00 };
    let mut out;
    if nibbles.len() % 2 == 0 {
        out = vec![flag];
        for pair in nibbles.chunks(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    } else {
        out = vec![flag | 0x10 | nibbles[0]];
        for pair in nibbles[1..].chunks(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
    }
    out
}
