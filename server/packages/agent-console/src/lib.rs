//! Agent console server core.

pub mod bootstrap;
pub mod channel;
pub mod cli;
pub mod config;
mod driver;
pub mod events;
pub mod log_monitor;
pub mod permissions;
pub mod registry;
pub mod router;
pub mod service;
pub mod store;

pub use driver::{flatten_tool_result, message_events};
