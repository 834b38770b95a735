//! TCP listener feeding inbound connections to the transport.

use crate::network::transport::Transport;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct NetworkServer {
    listener: TcpListener,
    transport: Arc<Transport>,
}

impl NetworkServer {
    pub async fn new(bind_addr: &str, transport: Arc<Transport>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(bind_addr).await?;
        Ok(Self {
            listener,
            transport,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires. Admission and TLS run off the accept loop.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.listener.local_addr() {
            Ok(addr) => info!(
                "📡 Listening for peers on {}{}",
                addr,
                if self.transport.tls_enabled() { " (TLS)" } else { "" }
            ),
            Err(e) => error!("❌ Listener has no local address: {}", e),
        }

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let transport = self.transport.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.accept(stream, addr).await {
                            debug!("Rejected inbound connection from {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    // Usually EMFILE or a reset during accept; keep serving
                    error!("❌ Accept failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }

        info!("🛑 Peer listener stopped");
    }
}
