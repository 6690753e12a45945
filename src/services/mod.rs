pub mod coordinator;
pub mod inscription_service;
#[cfg(test)]
pub mod test_support;

pub use coordinator::UtxoCoordinator;
pub use inscription_service::{InscriptionService, ServiceSettings};
