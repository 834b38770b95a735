pub mod blacklist;
pub mod block_source;
pub mod chain_sync;
pub mod connection_manager;
pub mod datagram;
pub mod dedup_filter;
pub mod dispatcher;
pub mod envelope;
pub mod gossip;
pub mod http_api;
pub mod message;
pub mod message_handler;
pub mod peer_connection;
pub mod peer_connection_registry;
pub mod rate_limiter;
pub mod reconnect;
pub mod replay;
pub mod reputation;
pub mod security;
pub mod server;
pub mod sync_coordinator;
pub mod tls;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;
