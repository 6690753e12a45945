//! Commit/reveal inscription engine for Zcash transparent transactions

pub mod api;
pub mod blockchain;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod services;
