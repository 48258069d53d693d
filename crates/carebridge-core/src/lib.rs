//! Core CareBridge library (chat session engine, wire protocol, transport, config).

pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;
