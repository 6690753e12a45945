pub mod epoch;
pub mod inscription;

pub use epoch::*;
pub use inscription::*;
