pub mod fork_id;
pub mod identity;

pub use fork_id::{ForkFilter, ForkId};
pub use identity::{ChainIdentity, UnknownChain};
