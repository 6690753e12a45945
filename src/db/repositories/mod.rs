pub mod context_repo;
pub mod inscription_repo;
pub mod lock_repo;

pub use context_repo::ContextRepository;
pub use inscription_repo::InscriptionRepository;
pub use lock_repo::LockRepository;
