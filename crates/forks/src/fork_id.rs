//! EIP-2124 fork identifier.
//!
//! A fork id is the CRC32 checksum of the genesis hash folded with each
//! passed fork activation number, plus the next upcoming activation.
//! Peers whose fork id cannot be reconciled with the local schedule are
//! rejected at handshake.

use alloy_primitives::B256;

/// Compact fork identifier exchanged in the Status handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForkId {
    pub fork_hash: [u8; 4],
    /// Next upcoming fork activation, 0 when none is known.
    pub fork_next: u64,
}

/// Validates remote fork ids against the local fork schedule.
#[derive(Debug, Clone)]
pub struct ForkFilter {
    /// Checksum at each fork boundary: sums[0] covers only the genesis
    /// hash, sums[i] additionally folds in forks[..i].
    sums: Vec<[u8; 4]>,
    /// Sorted, deduplicated fork numbers without genesis.
    forks: Vec<u64>,
}

impl ForkFilter {
    pub fn new(genesis_hash: &B256, forks: &[u64]) -> Self {
        let mut hash = crc32fast::hash(genesis_hash.as_slice());
        let mut sums = Vec::with_capacity(forks.len() + 1);
        sums.push(hash.to_be_bytes());

        for &fork in forks {
            let mut hasher = crc32fast::Hasher::new_with_initial(hash);
            hasher.update(&fork.to_be_bytes());
            hash = hasher.finalize();
            sums.push(hash.to_be_bytes());
        }

        Self {
            sums,
            forks: forks.to_vec(),
        }
    }

    /// The local fork id for a node whose head is at `head`.
    pub fn current(&self, head: u64) -> ForkId {
        let passed = self.forks.iter().filter(|&&f| head >= f).count();
        ForkId {
            fork_hash: self.sums[passed],
            fork_next: self.forks.get(passed).copied().unwrap_or(0),
        }
    }

    /// EIP-2124 validation rules. `head` is our local head height.
    pub fn validate(&self, remote: &ForkId, head: u64) -> Result<(), &'static str> {
        let passed = self.forks.iter().filter(|&&f| head >= f).count();

        // Same checksum: compatible unless the remote announces a fork we
        // already passed without forking.
        if self.sums[passed] == remote.fork_hash {
            if remote.fork_next > 0 && head >= remote.fork_next {
                return Err("remote announces a fork we already passed");
            }
            return Ok(());
        }

        // Remote is behind us: its checksum must sit at an earlier boundary
        // and its announced next fork must be the one we took there.
        for i in 0..passed {
            if self.sums[i] == remote.fork_hash {
                if self.forks[i] != remote.fork_next {
                    return Err("remote is stale and needs a software update");
                }
                return Ok(());
            }
        }

        // We are behind the remote: any later boundary checksum is fine.
        for i in (passed + 1)..self.sums.len() {
            if self.sums[i] == remote.fork_hash {
                return Ok(());
            }
        }

        Err("incompatible fork id")
    }
}
