//! Signed envelopes and the node's signing identity.
//!
//! Every frame on the wire is a bincode-encoded [`SignedEnvelope`]. The
//! ed25519 signature covers the bincode encoding of every other field, so
//! nonce, timestamp and version negotiation cannot be altered in transit.

use crate::network::message::Payload;
use crate::types::NodeId;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("Sender id is not a valid ed25519 key")]
    InvalidSenderKey,
    #[error("Invalid signature")]
    InvalidSignature,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignedEnvelope {
    pub sender_id: NodeId,
    pub nonce: u64,
    pub timestamp: i64,
    pub protocol_version: u32,
    pub feature_set: Vec<String>,
    pub payload: Payload,
    pub signature: Signature,
}

/// Borrowed view of the signed fields, encoded in declaration order.
#[derive(Serialize)]
struct SignedFields<'a> {
    sender_id: &'a NodeId,
    nonce: u64,
    timestamp: i64,
    protocol_version: u32,
    feature_set: &'a [String],
    payload: &'a Payload,
}

impl SignedEnvelope {
    fn signed_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let fields = SignedFields {
            sender_id: &self.sender_id,
            nonce: self.nonce,
            timestamp: self.timestamp,
            protocol_version: self.protocol_version,
            feature_set: &self.feature_set,
            payload: &self.payload,
        };
        Ok(bincode::serialize(&fields)?)
    }

    pub fn verify_signature(&self) -> Result<(), EnvelopeError> {
        let key = VerifyingKey::from_bytes(self.sender_id.as_bytes())
            .map_err(|_| EnvelopeError::InvalidSenderKey)?;
        let message = self.signed_bytes()?;
        key.verify_strict(&message, &self.signature)
            .map_err(|_| EnvelopeError::InvalidSignature)
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Age relative to `now`, in seconds. Negative for future timestamps.
    pub fn age_secs(&self, now: i64) -> i64 {
        now - self.timestamp
    }
}

/// The node's long-lived ed25519 key.
///
/// `SigningKey` zeroizes itself on drop; the seed is only ever held in
/// `Zeroizing` buffers while loading.
pub struct NodeIdentity {
    signing_key: SigningKey,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(&mut seed[..]);
        Self::from_seed(&seed)
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Load the hex-encoded seed at `path`, creating one if it does not exist.
    pub fn load_or_generate(path: &Path) -> std::io::Result<Self> {
        if path.exists() {
            let contents = Zeroizing::new(std::fs::read_to_string(path)?);
            let mut seed = Zeroizing::new([0u8; 32]);
            hex::decode_to_slice(contents.trim(), &mut seed[..]).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Invalid node key in {}: {}", path.display(), e),
                )
            })?;
            return Ok(Self::from_seed(&seed));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = Zeroizing::new(hex::encode(identity.signing_key.to_bytes()));
        std::fs::write(path, encoded.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!("🔑 Generated new node key at {}", path.display());
        Ok(identity)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId(self.signing_key.verifying_key().to_bytes())
    }

    /// Wrap `payload` in a freshly-nonced envelope signed by this node.
    pub fn seal(
        &self,
        payload: Payload,
        protocol_version: u32,
        feature_set: Vec<String>,
        timestamp: i64,
    ) -> Result<SignedEnvelope, EnvelopeError> {
        let mut envelope = SignedEnvelope {
            sender_id: self.node_id(),
            nonce: rand::random::<u64>(),
            timestamp,
            protocol_version,
            feature_set,
            payload,
            signature: Signature::from_bytes(&[0u8; 64]),
        };
        let message = envelope.signed_bytes()?;
        envelope.signature = self.signing_key.sign(&message);
        Ok(envelope)
    }
}
