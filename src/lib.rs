//! Library crate for mc-scan-rs: random-sampling discovery of public game servers.
pub mod aggregator;
pub mod codec;
pub mod config;
pub mod engine;
pub mod motd;
pub mod probe;
pub mod sampler;
pub mod scanner;
pub mod store;
pub mod types;
