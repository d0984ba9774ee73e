pub mod block_cache;
pub mod chain;
pub mod decoder;
pub mod types;
pub mod verifier;
