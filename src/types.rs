//! Core value types shared by the ledger, the wire protocol and sync.
//!
//! Identifiers are 32-byte digests. They render as hex in human-readable
//! formats (TOML, JSON) and as raw bytes in bincode frames.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

macro_rules! digest_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 32]);

        impl $name {
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let mut out = [0u8; 32];
                hex::decode_to_slice(s, &mut out)?;
                Ok(Self(out))
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0
            }

            /// First 8 hex characters, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                if serializer.is_human_readable() {
                    serializer.serialize_str(&self.to_hex())
                } else {
                    self.0.serialize(serializer)
                }
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                if deserializer.is_human_readable() {
                    let s = String::deserialize(deserializer)?;
                    Self::from_hex(&s).map_err(serde::de::Error::custom)
                } else {
                    <[u8; 32]>::deserialize(deserializer).map(Self)
                }
            }
        }
    };
}

digest_newtype!(
    /// blake3 digest identifying a block or transaction.
    Hash256
);

digest_newtype!(
    /// ed25519 public key of a node; doubles as the envelope sender id.
    NodeId
);

/// Opaque payload bytes, hex in JSON.
mod payload_bytes {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            bytes.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            hex::decode(s).map_err(serde::de::Error::custom)
        } else {
            Vec::<u8>::deserialize(deserializer)
        }
    }
}

const GENESIS_TIMESTAMP: i64 = 1_735_689_600; // 2025-01-01T00:00:00Z
const GENESIS_PAYLOAD: &[u8] = b"chainmesh genesis";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: Hash256,
    pub previous_hash: Hash256,
    pub timestamp: i64,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
}

impl Block {
    pub fn new(height: u64, previous_hash: Hash256, timestamp: i64, payload: Vec<u8>) -> Self {
        let hash = Self::compute_hash(height, &previous_hash, timestamp, &payload);
        Self {
            height,
            hash,
            previous_hash,
            timestamp,
            payload,
        }
    }

    /// The network-wide genesis block.
    pub fn genesis() -> Self {
        Self::new(
            0,
            Hash256::default(),
            GENESIS_TIMESTAMP,
            GENESIS_PAYLOAD.to_vec(),
        )
    }

    pub fn compute_hash(
        height: u64,
        previous_hash: &Hash256,
        timestamp: i64,
        payload: &[u8],
    ) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&height.to_le_bytes());
        hasher.update(previous_hash.as_bytes());
        hasher.update(&timestamp.to_le_bytes());
        hasher.update(payload);
        Hash256(*hasher.finalize().as_bytes())
    }

    pub fn hash_is_valid(&self) -> bool {
        self.hash
            == Self::compute_hash(
                self.height,
                &self.previous_hash,
                self.timestamp,
                &self.payload,
            )
    }

    /// Builds the block that extends `self`.
    pub fn child(&self, timestamp: i64, payload: Vec<u8>) -> Self {
        Self::new(self.height + 1, self.hash, timestamp, payload)
    }

    pub fn descriptor(&self) -> BlockDescriptor {
        BlockDescriptor {
            height: self.height,
            hash: self.hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Hash256,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            id: Self::compute_id(&payload),
            payload,
        }
    }

    pub fn compute_id(payload: &[u8]) -> Hash256 {
        Hash256(*blake3::hash(payload).as_bytes())
    }

    pub fn id_is_valid(&self) -> bool {
        self.id == Self::compute_id(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDescriptor {
    pub height: u64,
    pub hash: Hash256,
}

/// Advertised checkpoint: the tip block of a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub height: u64,
    pub block_hash: Hash256,
    pub timestamp: i64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub meta: CheckpointMeta,
    pub tip: Block,
    #[serde(with = "payload_bytes")]
    pub state: Vec<u8>,
}

impl CheckpointPayload {
    /// The tip must be the block the metadata names, with an intact hash.
    pub fn is_consistent(&self) -> bool {
        self.tip.height == self.meta.height
            && self.tip.hash == self.meta.block_hash
            && self.tip.hash_is_valid()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryKind {
    Transaction,
    Block,
}

impl fmt::Display for InventoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InventoryKind::Transaction => write!(f, "tx"),
            InventoryKind::Block => write!(f, "block"),
        }
    }
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Builds a valid chain of `len` blocks on top of genesis.
pub fn build_chain(len: u64) -> Vec<Block> {
    let mut chain = Vec::with_capacity(len as usize);
    if len == 0 {
        return chain;
    }
    chain.push(Block::genesis());
    for height in 1..len {
        let parent = &chain[(height - 1) as usize];
        let next = parent.child(
            GENESIS_TIMESTAMP + height as i64 * 10,
            height.to_le_bytes().to_vec(),
        );
        chain.push(next);
    }
    chain
}
