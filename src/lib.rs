//! Library crate for port-bridge: concurrent TCP port scanning and a file
//! bridge gated on the ports the last scan found open.
pub mod bridge;
pub mod config;
pub mod error;
pub mod ports;
pub mod probe;
pub mod scanner;
pub mod server;
pub mod session;
pub mod types;
