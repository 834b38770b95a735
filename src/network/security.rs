//! Security gate between the transport and everything else.
//!
//! Outbound: signs payloads into envelopes and reserves outbound bandwidth.
//! Inbound: charges budgets, then runs the verify pipeline in a fixed order
//! (structure and signature, sender allow-list, nonce replay, protocol
//! version, features) and stops at the first failure. Abnormal closes feed
//! the reset-storm detector; outcomes feed advisory reputation.

use crate::config::SecurityConfig;
use crate::network::blacklist::IPBlacklist;
use crate::network::envelope::{EnvelopeError, NodeIdentity, SignedEnvelope};
use crate::network::message::Payload;
use crate::network::rate_limiter::{BudgetLimits, BudgetScope, InboundVerdict, RateLimiter};
use crate::network::replay::ReplayWindow;
use crate::network::reputation::{ReputationBook, ReputationEvent};
use crate::types::{unix_now, NodeId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("invalid signature")]
    BadSignature,
    #[error("timestamp outside replay window ({age_secs}s)")]
    StaleTimestamp { age_secs: i64 },
    #[error("sender {0} is not on the allow-list")]
    UnknownSender(String),
    #[error("replayed nonce {nonce}")]
    Replay { nonce: u64 },
    #[error("incompatible protocol version {version} (supported {min}..={max})")]
    IncompatibleVersion { version: u32, min: u32, max: u32 },
    #[error("missing required features: {0:?}")]
    MissingFeatures(Vec<String>),
}

impl RejectReason {
    /// Replays and clock skew drop the message; everything else closes the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RejectReason::Replay { .. } | RejectReason::StaleTimestamp { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("outbound bandwidth exhausted ({0:?} budget)")]
    BandwidthExhausted(BudgetScope),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
    EnvelopeRejected { peer: String, reason: RejectReason },
    RateLimited { peer: String },
    BandwidthExceeded { peer: String, scope: BudgetScope },
    ProtocolViolation { peer: String, detail: String },
    PeerBanned { ip: IpAddr, reason: String },
    ConnectionRefused { ip: IpAddr, reason: String },
}

pub struct SecurityGate {
    identity: Arc<NodeIdentity>,
    protocol_version: u32,
    min_protocol_version: u32,
    features: Vec<String>,
    required_features: Vec<String>,
    allowed_senders: HashSet<NodeId>,
    replay: Mutex<ReplayWindow>,
    budgets: Mutex<RateLimiter>,
    blacklist: Mutex<IPBlacklist>,
    reputation: Mutex<ReputationBook>,
    events: broadcast::Sender<SecurityEvent>,
}

impl SecurityGate {
    pub fn new(identity: Arc<NodeIdentity>, config: &SecurityConfig) -> Self {
        let allowed_senders = config
            .allowed_senders
            .iter()
            .filter_map(|hex| match NodeId::from_hex(hex) {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!("Ignoring invalid allowed_senders entry {}: {}", hex, e);
                    None
                }
            })
            .collect();
        let (events, _) = broadcast::channel(256);

        Self {
            identity,
            protocol_version: config.protocol_version,
            min_protocol_version: config.min_protocol_version,
            features: config.features.clone(),
            required_features: config.required_features.clone(),
            allowed_senders,
            replay: Mutex::new(ReplayWindow::new(Duration::from_secs(
                config.replay_window_secs,
            ))),
            budgets: Mutex::new(RateLimiter::new(BudgetLimits::from_config(config))),
            blacklist: Mutex::new(IPBlacklist::new(
                Duration::from_secs(config.reset_storm_window_secs),
                config.reset_storm_threshold,
                Duration::from_secs(config.ban_duration_secs),
            )),
            reputation: Mutex::new(ReputationBook::new()),
            events,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityEvent> {
        self.events.subscribe()
    }

    /// Seal `payload` into a signed envelope from this node.
    pub fn sign(&self, payload: Payload) -> Result<SignedEnvelope, EnvelopeError> {
        self.identity.seal(
            payload,
            self.protocol_version,
            self.features.clone(),
            unix_now(),
        )
    }

    /// Sign and encode, ready for framing.
    pub fn seal_bytes(&self, payload: Payload) -> Result<Vec<u8>, EnvelopeError> {
        self.sign(payload)?.encode()
    }

    /// Decode and authenticate an inbound envelope.
    pub fn verify(&self, bytes: &[u8]) -> Result<SignedEnvelope, RejectReason> {
        // 1. structure and signature
        let envelope =
            SignedEnvelope::decode(bytes).map_err(|e| RejectReason::Malformed(e.to_string()))?;
        envelope.verify_signature().map_err(|e| match e {
            EnvelopeError::InvalidSignature => RejectReason::BadSignature,
            other => RejectReason::Malformed(other.to_string()),
        })?;
        let mut replay = self.replay.lock();
        let window = replay.ttl().as_secs() as i64;
        let age = envelope.age_secs(unix_now());
        if age.abs() > window {
            return Err(RejectReason::StaleTimestamp { age_secs: age });
        }

        // 2. sender allow-list
        if !self.allowed_senders.is_empty() && !self.allowed_senders.contains(&envelope.sender_id)
        {
            return Err(RejectReason::UnknownSender(envelope.sender_id.to_hex()));
        }

        // 3. nonce replay
        if replay.is_replay(&envelope.sender_id, envelope.nonce) {
            return Err(RejectReason::Replay {
                nonce: envelope.nonce,
            });
        }

        // 4. protocol version
        let version = envelope.protocol_version;
        if version < self.min_protocol_version || version > self.protocol_version {
            return Err(RejectReason::IncompatibleVersion {
                version,
                min: self.min_protocol_version,
                max: self.protocol_version,
            });
        }

        // 5. features
        let missing: Vec<String> = self
            .required_features
            .iter()
            .filter(|f| !envelope.feature_set.contains(f))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(RejectReason::MissingFeatures(missing));
        }

        replay.record(envelope.sender_id, envelope.nonce);
        Ok(envelope)
    }

    /// Charge an inbound frame to `peer_id`'s and the global budgets.
    pub fn check_inbound(&self, peer_id: &str, bytes: usize) -> InboundVerdict {
        let verdict = self.budgets.lock().charge_inbound(peer_id, bytes as u64);
        match verdict {
            InboundVerdict::Accept => {}
            InboundVerdict::RateLimited => self.emit(SecurityEvent::RateLimited {
                peer: peer_id.to_string(),
            }),
            InboundVerdict::BandwidthExceeded(scope) => {
                self.emit(SecurityEvent::BandwidthExceeded {
                    peer: peer_id.to_string(),
                    scope,
                })
            }
        }
        verdict
    }

    pub fn check_outbound(&self, peer_id: &str, bytes: usize) -> Result<(), SecurityError> {
        self.budgets
            .lock()
            .charge_outbound(peer_id, bytes as u64)
            .map_err(SecurityError::BandwidthExhausted)
    }

    pub fn is_banned(&self, ip: IpAddr) -> Option<String> {
        self.blacklist.lock().is_blacklisted(ip)
    }

    pub fn ban(&self, ip: IpAddr, duration: Duration, reason: &str) {
        self.blacklist.lock().add_temp_ban(ip, duration, reason);
        self.emit(SecurityEvent::PeerBanned {
            ip,
            reason: reason.to_string(),
        });
    }

    /// Feed the reset-storm detector. Returns true if `ip` is now banned.
    pub fn record_abnormal_close(&self, ip: IpAddr, reason: &str) -> bool {
        let banned = self.blacklist.lock().record_abnormal_close(ip, reason);
        if banned {
            self.emit(SecurityEvent::PeerBanned {
                ip,
                reason: format!("reset storm: {}", reason),
            });
        }
        banned
    }

    pub fn report_rejection(&self, peer_id: &str, ip: IpAddr, reason: RejectReason) {
        self.record_reputation(ip, ReputationEvent::ProtocolViolation);
        self.emit(SecurityEvent::EnvelopeRejected {
            peer: peer_id.to_string(),
            reason,
        });
    }

    pub fn report_violation(&self, peer_id: &str, ip: IpAddr, detail: impl Into<String>) {
        self.record_reputation(ip, ReputationEvent::ProtocolViolation);
        self.emit(SecurityEvent::ProtocolViolation {
            peer: peer_id.to_string(),
            detail: detail.into(),
        });
    }

    pub fn report_refused(&self, ip: IpAddr, reason: impl Into<String>) {
        self.emit(SecurityEvent::ConnectionRefused {
            ip,
            reason: reason.into(),
        });
    }

    pub fn record_reputation(&self, ip: IpAddr, event: ReputationEvent) -> i32 {
        self.reputation.lock().record(ip, event)
    }

    pub fn reputation(&self, ip: &IpAddr) -> i32 {
        self.reputation.lock().score(ip)
    }

    /// Purge per-connection state when a connection closes.
    pub fn forget_peer(&self, peer_id: &str, sender: Option<&NodeId>) {
        self.budgets.lock().forget(peer_id);
        if let Some(sender) = sender {
            self.replay.lock().forget(sender);
        }
    }

    /// Periodic housekeeping from the health task.
    pub fn cleanup(&self) {
        self.budgets.lock().cleanup();
        self.replay.lock().cleanup();
        self.blacklist.lock().cleanup();
    }

    /// (banned IPs, IPs with recent abnormal closes)
    pub fn ban_stats(&self) -> (usize, usize) {
        self.blacklist.lock().stats()
    }

    fn emit(&self, event: SecurityEvent) {
        match &event {
            SecurityEvent::RateLimited { peer } => {
                tracing::debug!(peer = %peer, "⏳ Message rate budget exceeded, dropping");
            }
            SecurityEvent::EnvelopeRejected { peer, reason } => {
                tracing::warn!(peer = %peer, reason = %reason, "🛡️  Envelope rejected");
            }
            SecurityEvent::BandwidthExceeded { peer, scope } => {
                tracing::warn!(peer = %peer, scope = ?scope, "🛡️  Bandwidth budget exceeded");
            }
            SecurityEvent::ProtocolViolation { peer, detail } => {
                tracing::warn!(peer = %peer, detail = %detail, "🛡️  Protocol violation");
            }
            SecurityEvent::PeerBanned { ip, reason } => {
                tracing::warn!(ip = %ip, reason = %reason, "🚫 Peer banned");
            }
            SecurityEvent::ConnectionRefused { ip, reason } => {
                tracing::info!(ip = %ip, reason = %reason, "🚫 Connection refused");
            }
        }
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Payload;

    fn gate_with(config: SecurityConfig) -> SecurityGate {
        SecurityGate::new(Arc::new(NodeIdentity::generate()), &config)
    }

    fn ping() -> Payload {
        Payload::Ping {
            nonce: 1,
            height: 0,
        }
    }

    fn sealed(identity: &NodeIdentity, version: u32, features: &[&str], ts: i64) -> Vec<u8> {
        identity
            .seal(
                ping(),
                version,
                features.iter().map(|f| f.to_string()).collect(),
                ts,
            )
            .unwrap()
            .encode()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_rejected_then_accepted_after_window() {
        let gate = gate_with(SecurityConfig::default());
        let remote = NodeIdentity::generate();
        let bytes = sealed(&remote, 2, &[], unix_now());

        assert!(gate.verify(&bytes).is_ok());
        assert!(matches!(
            gate.verify(&bytes),
            Err(RejectReason::Replay { .. })
        ));

        // The nonce window expires on the monotonic clock
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(gate.verify(&bytes).is_ok());
    }

    #[tokio::test]
    async fn test_stale_timestamp_rejected() {
        let gate = gate_with(SecurityConfig::default());
        let remote = NodeIdentity::generate();

        let old = sealed(&remote, 2, &[], unix_now() - 301);
        assert!(matches!(
            gate.verify(&old),
            Err(RejectReason::StaleTimestamp { .. })
        ));
        let future = sealed(&remote, 2, &[], unix_now() + 301);
        assert!(gate.verify(&future).is_err());
    }

    #[tokio::test]
    async fn test_garbage_and_bad_signature() {
        let gate = gate_with(SecurityConfig::default());
        assert!(matches!(
            gate.verify(b"\x01\x02"),
            Err(RejectReason::Malformed(_))
        ));

        let remote = NodeIdentity::generate();
        let mut envelope = remote.seal(ping(), 2, vec![], unix_now()).unwrap();
        envelope.payload = Payload::GetPeers;
        assert_eq!(
            gate.verify(&envelope.encode().unwrap()).unwrap_err(),
            RejectReason::BadSignature
        );
    }

    #[tokio::test]
    async fn test_pipeline_order_allow_list_before_version() {
        let allowed = NodeIdentity::generate();
        let config = SecurityConfig {
            allowed_senders: vec![allowed.node_id().to_hex()],
            ..SecurityConfig::default()
        };
        let gate = gate_with(config);

        // Stranger with a bad version fails on the allow-list first
        let stranger = NodeIdentity::generate();
        assert!(matches!(
            gate.verify(&sealed(&stranger, 99, &[], unix_now())),
            Err(RejectReason::UnknownSender(_))
        ));

        assert!(matches!(
            gate.verify(&sealed(&allowed, 99, &[], unix_now())),
            Err(RejectReason::IncompatibleVersion { version: 99, .. })
        ));
        assert!(gate.verify(&sealed(&allowed, 1, &[], unix_now())).is_ok());
    }

    #[tokio::test]
    async fn test_rejected_nonce_is_not_recorded() {
        let config = SecurityConfig {
            required_features: vec!["inv".to_string()],
            ..SecurityConfig::default()
        };
        let gate = gate_with(config);
        let remote = NodeIdentity::generate();

        let envelope = remote.seal(ping(), 2, vec![], unix_now()).unwrap();
        assert_eq!(
            gate.verify(&envelope.encode().unwrap()).unwrap_err(),
            RejectReason::MissingFeatures(vec!["inv".to_string()])
        );
        // Same nonce again still fails on features, not on replay
        assert!(matches!(
            gate.verify(&envelope.encode().unwrap()),
            Err(RejectReason::MissingFeatures(_))
        ));

        assert!(gate.verify(&sealed(&remote, 2, &["inv"], unix_now())).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storm_ban_emits_event() {
        let config = SecurityConfig {
            reset_storm_threshold: 2,
            ..SecurityConfig::default()
        };
        let gate = gate_with(config);
        let mut events = gate.subscribe();
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        assert!(!gate.record_abnormal_close(ip, "reset"));
        assert!(gate.record_abnormal_close(ip, "reset"));
        assert!(gate.is_banned(ip).is_some());

        match events.try_recv().unwrap() {
            SecurityEvent::PeerBanned { ip: banned, .. } => assert_eq!(banned, ip),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_peer_resets_budget() {
        let config = SecurityConfig {
            max_messages_per_second: 1,
            ..SecurityConfig::default()
        };
        let gate = gate_with(config);

        assert_eq!(gate.check_inbound("p", 10), InboundVerdict::Accept);
        assert_eq!(gate.check_inbound("p", 10), InboundVerdict::RateLimited);
        gate.forget_peer("p", None);
        assert_eq!(gate.check_inbound("p", 10), InboundVerdict::Accept);
    }
}
