#![doc = include_str!("../README.md")]

pub mod cache;
pub mod cluster;
pub mod config;
pub mod fault;
pub mod logger;
pub mod message;
pub mod notifier;
pub mod poller;
pub mod shared_cache;
pub mod watermark;
pub mod worker;

/// the current app version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
