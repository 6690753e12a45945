pub mod client;
pub mod epoch;
pub mod fee;
pub mod script;
pub mod sighash;
pub mod transaction;

pub use client::ZcashClient;
pub use epoch::EpochCache;
pub use fee::{FeePolicy, OutputPlan};
