pub mod zcash;

pub use zcash::{parse_private_key, parse_public_key, LocalSigner, TransparentAddress};
