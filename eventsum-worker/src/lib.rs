pub mod aggregator;
pub mod batcher;
pub mod config;
pub mod dump;
pub mod error;
pub mod persister;
pub mod query;
