//! Client library for the donations marketplace: typed HTTP services, a
//! persisted login session and a self-healing STOMP chat connection.

pub mod client;
pub mod common;
pub mod utils;
