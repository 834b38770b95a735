//! Payload kinds carried inside signed envelopes.

use crate::types::{Block, CheckpointMeta, CheckpointPayload, Hash256, NodeId, Transaction};
use serde::{Deserialize, Serialize};

pub const FEATURE_CHAIN_RANGE: &str = "chain_range";
pub const FEATURE_CHECKPOINT: &str = "checkpoint";
pub const FEATURE_INV: &str = "inv";
pub const FEATURE_UDP: &str = "udp";

/// Most blocks one `chain_range` answer or `/blocks` page carries.
pub const MAX_RANGE_BLOCKS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub version: u32,
    pub features: Vec<String>,
    pub node_id: NodeId,
    pub height: u64,
    /// Base URL of the peer's block-serving HTTP surface.
    pub api_endpoint: Option<String>,
    /// Address other nodes can dial to reach this peer.
    pub listen_address: Option<String>,
    pub udp_port: Option<u16>,
}

impl Handshake {
    pub fn supports(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub transactions: Vec<Hash256>,
    pub blocks: Vec<Hash256>,
}

impl Inventory {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.blocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transactions.len() + self.blocks.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    Handshake(Handshake),
    Transaction(Transaction),
    Block(Block),
    GetChain,
    Chain {
        blocks: Vec<Block>,
    },
    GetChainRange {
        offset: u64,
        limit: u64,
        include_pending: bool,
    },
    ChainRange {
        offset: u64,
        total: u64,
        blocks: Vec<Block>,
        pending: Vec<Transaction>,
    },
    GetPeers,
    Peers {
        addresses: Vec<String>,
    },
    GetCheckpoint,
    Checkpoint(Option<CheckpointMeta>),
    CheckpointRequest {
        height: u64,
    },
    CheckpointPayload(Option<CheckpointPayload>),
    Inv(Inventory),
    GetData(Inventory),
    Ping {
        nonce: u64,
        height: u64,
    },
    Pong {
        nonce: u64,
        height: u64,
    },
}

impl Payload {
    pub fn message_type(&self) -> &'static str {
        match self {
            Payload::Handshake(_) => "handshake",
            Payload::Transaction(_) => "transaction",
            Payload::Block(_) => "block",
            Payload::GetChain => "get_chain",
            Payload::Chain { .. } => "chain",
            Payload::GetChainRange { .. } => "get_chain_range",
            Payload::ChainRange { .. } => "chain_range",
            Payload::GetPeers => "get_peers",
            Payload::Peers { .. } => "peers",
            Payload::GetCheckpoint => "get_checkpoint",
            Payload::Checkpoint(_) => "checkpoint",
            Payload::CheckpointRequest { .. } => "checkpoint_request",
            Payload::CheckpointPayload(_) => "checkpoint_payload",
            Payload::Inv(_) => "inv",
            Payload::GetData(_) => "getdata",
            Payload::Ping { .. } => "ping",
            Payload::Pong { .. } => "pong",
        }
    }

    /// The response kind a request expects, if it is a request.
    pub fn response_type(&self) -> Option<&'static str> {
        match self {
            Payload::GetChain => Some("chain"),
            Payload::GetChainRange { .. } => Some("chain_range"),
            Payload::GetPeers => Some("peers"),
            Payload::GetCheckpoint => Some("checkpoint"),
            Payload::CheckpointRequest { .. } => Some("checkpoint_payload"),
            _ => None,
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Payload::Chain { .. }
                | Payload::ChainRange { .. }
                | Payload::Peers { .. }
                | Payload::Checkpoint(_)
                | Payload::CheckpointPayload(_)
        )
    }

    pub fn is_handshake(&self) -> bool {
        matches!(self, Payload::Handshake(_))
    }

    /// Kinds accepted over the datagram transport.
    pub fn fits_datagram(&self) -> bool {
        matches!(
            self,
            Payload::Inv(_) | Payload::Ping { .. } | Payload::Pong { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_request_names_a_response() {
        let requests = [
            Payload::GetChain,
            Payload::GetChainRange {
                offset: 0,
                limit: 10,
                include_pending: false,
            },
            Payload::GetPeers,
            Payload::GetCheckpoint,
            Payload::CheckpointRequest { height: 5 },
        ];
        for request in requests {
            assert!(request.response_type().is_some(), "{}", request.message_type());
            assert!(!request.is_response());
        }
    }

    #[test]
    fn test_responses_match_expected_type() {
        let response = Payload::ChainRange {
            offset: 0,
            total: 0,
            blocks: vec![],
            pending: vec![],
        };
        assert!(response.is_response());
        assert_eq!(
            Payload::GetChainRange {
                offset: 0,
                limit: 1,
                include_pending: true
            }
            .response_type(),
            Some(response.message_type())
        );
    }
}
