//! Topicgate - an on-demand instance supervisor with a WebSocket gateway
//!
//! This library runs one isolated instance per topic:
//! - Starts an instance the first time a topic is requested and hands back its
//!   listen addresses
//! - Gives every instance its own port from a configured range and its own
//!   storage directory
//! - Stops instances that have had no peers for a configurable timeout
//! - Permanently bans topics reported as finished
//! - Proxies WebSocket upgrades to running instances by port, refusing ports
//!   that belong to no instance

pub mod allocator;
pub mod completed;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod queue;
pub mod registry;
pub mod supervisor;
pub mod watchdog;
