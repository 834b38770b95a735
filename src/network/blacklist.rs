use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::Instant;

/// Tracks abnormal connection closes per IP and bans reset-storm offenders
pub struct IPBlacklist {
    /// Temporarily banned IPs with expiry time and reason
    temp_blacklist: HashMap<IpAddr, (Instant, String)>,
    /// Abnormal close timestamps inside the storm window, oldest first
    abnormal_closes: HashMap<IpAddr, VecDeque<Instant>>,
    storm_window: Duration,
    storm_threshold: usize,
    ban_duration: Duration,
}

impl IPBlacklist {
    pub fn new(storm_window: Duration, storm_threshold: usize, ban_duration: Duration) -> Self {
        Self {
            temp_blacklist: HashMap::new(),
            abnormal_closes: HashMap::new(),
            storm_window,
            storm_threshold: storm_threshold.max(1),
            ban_duration,
        }
    }

    /// Check if an IP is currently banned
    pub fn is_blacklisted(&mut self, ip: IpAddr) -> Option<String> {
        let now = Instant::now();
        if let Some((expiry, reason)) = self.temp_blacklist.get(&ip) {
            if now < *expiry {
                let remaining = expiry.duration_since(now).as_secs();
                return Some(format!("Banned for {}s: {}", remaining, reason));
            }
            // Expired, remove it
            self.temp_blacklist.remove(&ip);
        }
        None
    }

    /// Record an abnormal close for an IP.
    /// Returns true if this close reached the storm threshold and banned the IP.
    pub fn record_abnormal_close(&mut self, ip: IpAddr, reason: &str) -> bool {
        let now = Instant::now();
        let window = self.storm_window;
        let closes = self.abnormal_closes.entry(ip).or_default();

        while let Some(first) = closes.front() {
            if now.duration_since(*first) < window {
                break;
            }
            closes.pop_front();
        }
        closes.push_back(now);
        let count = closes.len();

        tracing::debug!(
            "⚠️  Abnormal close #{} from {} within {}s: {}",
            count,
            ip,
            window.as_secs(),
            reason
        );

        if count >= self.storm_threshold {
            self.abnormal_closes.remove(&ip);
            let ban_reason = format!("reset storm ({} abnormal closes): {}", count, reason);
            self.add_temp_ban(ip, self.ban_duration, &ban_reason);
            tracing::warn!(
                "🚫 Banned {} for {}s after {} abnormal closes",
                ip,
                self.ban_duration.as_secs(),
                count
            );
            return true;
        }
        false
    }

    /// Add a temporary ban
    pub fn add_temp_ban(&mut self, ip: IpAddr, duration: Duration, reason: &str) {
        let expiry = Instant::now() + duration;
        self.temp_blacklist.insert(ip, (expiry, reason.to_string()));
    }

    pub fn remove_ban(&mut self, ip: IpAddr) -> bool {
        self.temp_blacklist.remove(&ip).is_some()
    }

    /// Clean up expired bans and stale close windows (call periodically)
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        let window = self.storm_window;

        self.temp_blacklist.retain(|_, (expiry, _)| now < *expiry);
        self.abnormal_closes.retain(|_, closes| {
            closes
                .back()
                .map(|last| now.duration_since(*last) < window)
                .unwrap_or(false)
        });
    }

    /// (banned IPs, IPs with recent abnormal closes)
    pub fn stats(&self) -> (usize, usize) {
        (self.temp_blacklist.len(), self.abnormal_closes.len())
    }
}
