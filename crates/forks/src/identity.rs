//! Chain identities: network id, genesis hash and fork schedule.
//!
//! The identity is what EIP-2124 summarizes into a fork id; it is also
//! persisted at startup for diagnostics. Rinkeby and Goerli are not
//! listed: chains without a supported consensus engine are rejected.

use alloy_primitives::{b256, B256};
use thiserror::Error;

use crate::fork_id::{ForkFilter, ForkId};

#[derive(Error, Debug)]
#[error("chain {0:?} is not supported")]
pub struct UnknownChain(pub String);

/// Identity of a chain: everything a fork-id handshake needs.
#[derive(Debug, Clone)]
pub struct ChainIdentity {
    pub name: &'static str,
    pub chain_id: u64,
    pub genesis_hash: B256,
    /// Raw fork schedule; may contain duplicates and zeroes.
    fork_blocks: Vec<u64>,
}

impl ChainIdentity {
    /// Look up a built-in identity by CLI name.
    pub fn named(name: &str) -> Result<ChainIdentity, UnknownChain> {
        match name {
            "mainnet" => Ok(mainnet()),
            "ropsten" => Ok(ropsten()),
            "sepolia" => Ok(sepolia()),
            other => Err(UnknownChain(other.to_string())),
        }
    }

    /// Fork activation numbers, sorted, deduplicated, genesis removed.
    pub fn distinct_fork_numbers(&self) -> Vec<u64> {
        let mut forks = self.fork_blocks.clone();
        forks.sort_unstable();
        forks.dedup();
        forks.retain(|&b| b != 0);
        forks
    }

    /// EIP-2124 fork id for a node whose head is at `head`.
    pub fn fork_id(&self, head: u64) -> ForkId {
        self.fork_filter().current(head)
    }

    pub fn fork_filter(&self) -> ForkFilter {
        ForkFilter::new(&self.genesis_hash, &self.distinct_fork_numbers())
    }
}

pub fn mainnet() -> ChainIdentity {
    ChainIdentity {
        name: "mainnet",
        chain_id: 1,
        genesis_hash: b256!("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3"),
        fork_blocks: vec![
            1_150_000,  // Homestead
            1_920_000,  // DAO
            2_463_000,  // Tangerine Whistle
            2_675_000,  // Spurious Dragon
            4_370_000,  // Byzantium
            7_280_000,  // Constantinople & Petersburg
            9_069_000,  // Istanbul
            9_200_000,  // Muir Glacier
            12_244_000, // Berlin
            12_965_000, // London
            13_773_000, // Arrow Glacier
            15_050_000, // Gray Glacier
        ],
    }
}

pub fn ropsten() -> ChainIdentity {
    ChainIdentity {
        name: "ropsten",
        chain_id: 3,
        genesis_hash: b256!("41941023680923e0fe4d74a34bdac8141f2540e3ae90623718e47d66d1ca4a2d"),
        fork_blocks: vec![
            0,          // Homestead & Tangerine Whistle
            10,         // Spurious Dragon
            1_700_000,  // Byzantium
            4_230_000,  // Constantinople
            4_939_394,  // Petersburg
            6_485_846,  // Istanbul
            7_117_117,  // Muir Glacier
            9_812_189,  // Berlin
            10_499_401, // London
        ],
    }
}

pub fn sepolia() -> ChainIdentity {
    ChainIdentity {
        name: "sepolia",
        chain_id: 11_155_111,
        genesis_hash: b256!("25a5cc106eea7138acab33231d7160d69cb777ee0c2c553fcddf5138993e6dd9"),
        // Launched with every pre-merge fork already active.
        fork_blocks: vec![0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_lookup() {
        assert_eq!(ChainIdentity::named("mainnet").unwrap().chain_id, 1);
        assert_eq!(ChainIdentity::named("ropsten").unwrap().chain_id, 3);
        assert_eq!(
            ChainIdentity::named("sepolia").unwrap().chain_id,
            11_155_111
        );
    }

    #[test]
    fn unknown_chains_rejected() {
        for name in ["rinkeby", "goerli", "bogus"] {
            assert!(ChainIdentity::named(name).is_err());
        }
    }

    #[test]
    fn distinct_fork_numbers_are_sorted_and_nonzero() {
        let forks = ropsten().distinct_fork_numbers();
        assert!(forks.windows(2).all(|w| w[0] < w[1]));
        assert!(forks.iter().all(|&b| b != 0));
    }

    #[test]
    fn sepolia_has_no_distinct_forks() {
        assert!(sepolia().distinct_fork_numbers().is_empty());
    }

    #[test]
    fn mainnet_genesis_fork_hash() {
        // CRC32(mainnet genesis) = 0xfc64ec04, the well-known frontier id.
        let id = mainnet().fork_id(0);
        assert_eq!(id.fork_hash, [0xfc, 0x64, 0xec, 0x04]);
        assert_eq!(id.fork_next, 1_150_000);
    }
}
