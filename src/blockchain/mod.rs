pub mod indexer;
pub mod registry;
pub mod traits;
pub mod zcash;

pub use registry::{ProviderChain, ProviderFailures};
pub use traits::{FundingInput, Outpoint, Txid};
