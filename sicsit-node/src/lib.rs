//! # sicsit-node
//!
//! Peer runtime for SIC-SIT: a session registry with per-session deadlines,
//! the inbound packet pipeline and the node configuration.

pub mod config;
pub mod frame;
pub mod handler;
pub mod registry;

pub use config::NodeConfig;
pub use frame::Frame;
pub use handler::{ExchangeOutcome, Inbound, Node};
pub use registry::SessionRegistry;
