pub mod asset_cache;
pub mod config;
pub mod mutation_store;
