//! chainmesh: peer-to-peer synchronization engine for a hash-linked chain.
//!
//! The daemon in `main.rs` is a thin shell over [`node::Node`]; everything
//! else lives here so integration tests can drive real nodes over loopback.

pub mod config;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod network;
pub mod node;
pub mod shutdown;
pub mod types;
