//! Connection admission and accounting.
//! Uses DashMap for lock-free concurrent access to connection states

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

impl std::fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionDirection::Inbound => write!(f, "Inbound"),
            ConnectionDirection::Outbound => write!(f, "Outbound"),
        }
    }
}

#[derive(Clone, Debug)]
struct ConnectionInfo {
    ip: IpAddr,
    direction: ConnectionDirection,
    connected_at: Instant,
}

#[derive(Clone, Debug)]
pub struct ConnectionLimits {
    pub max_total: usize,
    pub max_per_ip: usize,
    pub max_outbound: usize,
}

impl ConnectionLimits {
    pub fn from_config(config: &crate::config::NetworkConfig) -> Self {
        Self {
            max_total: config.max_connections,
            max_per_ip: config.max_connections_per_ip,
            max_outbound: config.max_outbound,
        }
    }
}

/// Tracks live connections per peer id and dials in progress per address
pub struct ConnectionManager {
    limits: ConnectionLimits,
    connections: DashMap<String, ConnectionInfo>,
    dialing: DashMap<String, Instant>,
    inbound_count: AtomicUsize,
    outbound_count: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            limits,
            connections: DashMap::new(),
            dialing: DashMap::new(),
            inbound_count: AtomicUsize::new(0),
            outbound_count: AtomicUsize::new(0),
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound_count.load(Ordering::Relaxed)
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound_count.load(Ordering::Relaxed)
    }

    fn count_connections_from_ip(&self, ip: IpAddr) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().ip == ip)
            .count()
    }

    /// Check if we can accept a new inbound connection from `ip`
    pub fn can_accept_inbound(&self, ip: IpAddr) -> Result<(), String> {
        let total = self.connected_count();
        if total >= self.limits.max_total {
            return Err(format!(
                "Max total connections reached: {}/{}",
                total, self.limits.max_total
            ));
        }

        let ip_connections = self.count_connections_from_ip(ip);
        if ip_connections >= self.limits.max_per_ip {
            return Err(format!(
                "Max connections per IP reached: {}/{}",
                ip_connections, self.limits.max_per_ip
            ));
        }

        Ok(())
    }

    /// Check if we can make a new outbound connection
    pub fn can_connect_outbound(&self) -> Result<(), String> {
        let total = self.connected_count() + self.dialing.len();
        if total >= self.limits.max_total {
            return Err(format!(
                "Max total connections reached: {}/{}",
                total, self.limits.max_total
            ));
        }

        let outbound = self.outbound_count() + self.dialing.len();
        if outbound >= self.limits.max_outbound {
            return Err(format!(
                "Max outbound connections reached: {}/{}",
                outbound, self.limits.max_outbound
            ));
        }

        Ok(())
    }

    /// Claim `address` for dialing. False if a dial is already in flight.
    pub fn mark_dialing(&self, address: &str) -> bool {
        match self.dialing.entry(address.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                true
            }
        }
    }

    pub fn finish_dialing(&self, address: &str) {
        self.dialing.remove(address);
    }

    pub fn is_dialing(&self, address: &str) -> bool {
        self.dialing.contains_key(address)
    }

    /// Register an established connection
    pub fn mark_connected(&self, peer_id: &str, ip: IpAddr, direction: ConnectionDirection) {
        let info = ConnectionInfo {
            ip,
            direction,
            connected_at: Instant::now(),
        };
        if self.connections.insert(peer_id.to_string(), info).is_none() {
            match direction {
                ConnectionDirection::Inbound => self.inbound_count.fetch_add(1, Ordering::Relaxed),
                ConnectionDirection::Outbound => {
                    self.outbound_count.fetch_add(1, Ordering::Relaxed)
                }
            };
        }
    }

    /// Remove a closed connection
    pub fn mark_disconnected(&self, peer_id: &str) -> bool {
        match self.connections.remove(peer_id) {
            Some((_, info)) => {
                match info.direction {
                    ConnectionDirection::Inbound => {
                        self.inbound_count.fetch_sub(1, Ordering::Relaxed)
                    }
                    ConnectionDirection::Outbound => {
                        self.outbound_count.fetch_sub(1, Ordering::Relaxed)
                    }
                };
                tracing::debug!(
                    "Connection {} closed after {}s",
                    peer_id,
                    info.connected_at.elapsed().as_secs()
                );
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.connections.contains_key(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(ConnectionLimits {
            max_total: 4,
            max_per_ip: 2,
            max_outbound: 2,
        })
    }

    #[tokio::test]
    async fn test_per_ip_cap() {
        let cm = manager();
        let ip: IpAddr = "10.1.1.1".parse().unwrap();

        assert!(cm.can_accept_inbound(ip).is_ok());
        cm.mark_connected("10.1.1.1:5000", ip, ConnectionDirection::Inbound);
        cm.mark_connected("10.1.1.1:5001", ip, ConnectionDirection::Inbound);
        assert!(cm.can_accept_inbound(ip).is_err());
        assert!(cm.can_accept_inbound("10.1.1.2".parse().unwrap()).is_ok());

        assert!(cm.mark_disconnected("10.1.1.1:5000"));
        assert!(!cm.mark_disconnected("10.1.1.1:5000"));
        assert!(cm.can_accept_inbound(ip).is_ok());
        assert_eq!(cm.inbound_count(), 1);
    }

    #[tokio::test]
    async fn test_outbound_cap_counts_dials() {
        let cm = manager();
        assert!(cm.mark_dialing("10.0.0.5:9333"));
        assert!(!cm.mark_dialing("10.0.0.5:9333"));
        assert!(cm.can_connect_outbound().is_ok());

        cm.mark_connected(
            "10.0.0.6:9333",
            "10.0.0.6".parse().unwrap(),
            ConnectionDirection::Outbound,
        );
        assert!(cm.can_connect_outbound().is_err());

        cm.finish_dialing("10.0.0.5:9333");
        assert!(cm.can_connect_outbound().is_ok());
    }
}
