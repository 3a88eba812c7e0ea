pub mod aggregate;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod metrics;
pub mod proxy;
pub mod server;
pub mod upstream;
