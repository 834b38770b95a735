//! Advisory peer reputation.
//!
//! Scores only influence which peers sync asks first. Nothing here closes a
//! connection or bans an address; that is the reset-storm detector's job.

use std::collections::HashMap;
use std::net::IpAddr;

pub const MIN_SCORE: i32 = -100;
pub const MAX_SCORE: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationEvent {
    ValidTransaction,
    ValidBlock,
    InvalidTransaction,
    InvalidBlock,
    ProtocolViolation,
    Disconnect,
    /// Served a sync chunk or probe that checked out.
    UsefulResponse,
    /// Failed or timed out on a sync request.
    FailedResponse,
}

impl ReputationEvent {
    pub fn delta(self) -> i32 {
        match self {
            ReputationEvent::ValidTransaction => 1,
            ReputationEvent::ValidBlock => 2,
            ReputationEvent::InvalidTransaction => -5,
            ReputationEvent::InvalidBlock => -10,
            ReputationEvent::ProtocolViolation => -10,
            ReputationEvent::Disconnect => -2,
            ReputationEvent::UsefulResponse => 1,
            ReputationEvent::FailedResponse => -3,
        }
    }
}

#[derive(Default)]
pub struct ReputationBook {
    scores: HashMap<IpAddr, i32>,
}

impl ReputationBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, ip: IpAddr, event: ReputationEvent) -> i32 {
        let score = self.scores.entry(ip).or_insert(0);
        *score = (*score + event.delta()).clamp(MIN_SCORE, MAX_SCORE);
        *score
    }

    pub fn score(&self, ip: &IpAddr) -> i32 {
        self.scores.get(ip).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}
