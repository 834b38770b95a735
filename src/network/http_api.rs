//! HTTP request/response surface for block fetching and item submission.
//!
//! | Method | Path                   | Body / query                  |
//! |--------|------------------------|-------------------------------|
//! | GET    | `/blocks`              | `?limit&offset` → JSON        |
//! | POST   | `/block/receive`       | bincode signed envelope       |
//! | POST   | `/transaction/receive` | bincode signed envelope       |
//!
//! Submissions are charged and verified by the security gate keyed by the
//! client IP, then dispatched like P2P traffic.

use crate::ledger::Ledger;
use crate::network::message::{Payload, MAX_RANGE_BLOCKS};
use crate::network::rate_limiter::InboundVerdict;
use crate::network::transport::{InboundMessage, Origin, Transport};
use crate::types::{Block, BlockDescriptor};
use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_BLOCK_LIMIT: u64 = 100;

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<dyn Ledger>,
    pub transport: Arc<Transport>,
}

#[derive(Debug, Deserialize)]
pub struct BlocksQuery {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksResponse {
    pub total: u64,
    pub latest: Option<BlockDescriptor>,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Serialize)]
struct ReceiveResponse {
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Block,
    Transaction,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/blocks", get(get_blocks))
        .route("/block/receive", post(receive_block))
        .route("/transaction/receive", post(receive_transaction))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: ApiState, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        info!("🌐 Block API listening on http://{}", addr);
    }
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        error!("❌ Block API server error: {}", e);
    }
}

async fn get_blocks(
    State(state): State<ApiState>,
    Query(query): Query<BlocksQuery>,
) -> Json<BlocksResponse> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_BLOCK_LIMIT)
        .min(MAX_RANGE_BLOCKS);
    let offset = query.offset.unwrap_or(0);
    Json(BlocksResponse {
        total: state.ledger.height().await,
        latest: state.ledger.latest().await,
        blocks: state.ledger.blocks(offset, limit).await,
    })
}

async fn receive_block(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> impl IntoResponse {
    receive(state, addr, body, ItemKind::Block).await
}

async fn receive_transaction(
    State(state): State<ApiState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> impl IntoResponse {
    receive(state, addr, body, ItemKind::Transaction).await
}

/// Budget key for HTTP clients. Each request arrives from a fresh ephemeral
/// port, so only the IP identifies the client.
fn budget_key(addr: &SocketAddr) -> String {
    format!("http:{}", addr.ip())
}

fn rejected(status: StatusCode, error: impl Into<String>) -> (StatusCode, Json<ReceiveResponse>) {
    (
        status,
        Json(ReceiveResponse {
            accepted: false,
            error: Some(error.into()),
        }),
    )
}

async fn receive(
    state: ApiState,
    addr: SocketAddr,
    body: Bytes,
    kind: ItemKind,
) -> (StatusCode, Json<ReceiveResponse>) {
    let gate = state.transport.gate();
    let source = budget_key(&addr);

    if let Some(reason) = gate.is_banned(addr.ip()) {
        return rejected(StatusCode::FORBIDDEN, reason);
    }
    match gate.check_inbound(&source, body.len()) {
        InboundVerdict::Accept => {}
        InboundVerdict::RateLimited => {
            return rejected(StatusCode::TOO_MANY_REQUESTS, "message rate exceeded")
        }
        InboundVerdict::BandwidthExceeded(scope) => {
            return rejected(
                StatusCode::TOO_MANY_REQUESTS,
                format!("{:?} bandwidth budget exceeded", scope),
            )
        }
    }

    let envelope = match gate.verify(&body) {
        Ok(envelope) => envelope,
        Err(reason) => {
            let message = reason.to_string();
            gate.report_rejection(&source, addr.ip(), reason);
            return rejected(StatusCode::BAD_REQUEST, message);
        }
    };

    let expected = match (&envelope.payload, kind) {
        (Payload::Block(_), ItemKind::Block) => true,
        (Payload::Transaction(_), ItemKind::Transaction) => true,
        _ => false,
    };
    if !expected {
        let detail = format!(
            "{} posted to the {:?} endpoint",
            envelope.payload.message_type(),
            kind
        );
        gate.report_violation(&source, addr.ip(), detail.clone());
        return rejected(StatusCode::BAD_REQUEST, detail);
    }

    state
        .transport
        .deliver(InboundMessage {
            peer_id: source,
            remote_address: addr,
            sender: envelope.sender_id,
            origin: Origin::Http,
            payload: envelope.payload,
        })
        .await;

    (
        StatusCode::ACCEPTED,
        Json(ReceiveResponse {
            accepted: true,
            error: None,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ledger::MemoryLedger;
    use crate::network::envelope::NodeIdentity;
    use crate::network::testing::test_transport;
    use crate::types::{build_chain, unix_now, Transaction};

    fn submission(identity: &NodeIdentity, note: &str) -> Bytes {
        let tx = Transaction::new(note.as_bytes().to_vec());
        let envelope = identity
            .seal(Payload::Transaction(tx), 2, vec![], unix_now())
            .unwrap();
        Bytes::from(envelope.encode().unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_submissions_share_one_budget_per_ip() {
        let mut config = Config::default();
        config.security.max_messages_per_second = 1;
        let ledger = Arc::new(MemoryLedger::with_chain(build_chain(1)));
        let (transport, _events) = test_transport(&config, ledger.clone());
        let state = ApiState {
            ledger,
            transport,
        };
        let identity = NodeIdentity::generate();

        let (status, _) = receive(
            state.clone(),
            "10.2.2.2:50001".parse().unwrap(),
            submission(&identity, "first"),
            ItemKind::Transaction,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        // Same client, new ephemeral port
        let (status, _) = receive(
            state.clone(),
            "10.2.2.2:50002".parse().unwrap(),
            submission(&identity, "second"),
            ItemKind::Transaction,
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        let (status, _) = receive(
            state,
            "10.3.3.3:50003".parse().unwrap(),
            submission(&identity, "third"),
            ItemKind::Transaction,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
}
