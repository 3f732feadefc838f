// Threat detection controller
// Failed-attempt accounting, account lockout, IP blocking, suspicious
// activity windows. All state is in-process; counters decay on the cleanup
// tick and on successful authentication.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::app_config::ThreatSettings;
use crate::models::threat::{
    AccountLockout, BruteForceAttempt, ThreatEvent, ThreatEventKind, ThreatSeverity,
};
use crate::services::monitoring::MonitoringService;

/// Bounded threat-event ring
const MAX_THREAT_EVENTS: usize = 1000;

/// Cleanup tick interval for the spawned background task
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, serde::Serialize)]
pub struct ThreatStats {
    pub active_lockouts: usize,
    pub blocked_ips: usize,
    pub tracked_attempts: usize,
    pub recorded_events: usize,
}

pub struct ThreatDetectionService {
    settings: ThreatSettings,
    lockouts: DashMap<String, AccountLockout>,
    /// Keyed by `"<ip>:<user_id>"`
    attempts: DashMap<String, BruteForceAttempt>,
    /// IP to block expiry
    blocked_ips: DashMap<String, DateTime<Utc>>,
    events: Mutex<VecDeque<ThreatEvent>>,
    monitoring: Arc<MonitoringService>,
}

fn attempt_key(ip: &str, user_id: &str) -> String {
    format!("{}:{}", ip, user_id)
}

impl ThreatDetectionService {
    pub fn new(settings: ThreatSettings, monitoring: Arc<MonitoringService>) -> Self {
        Self {
            settings,
            lockouts: DashMap::new(),
            attempts: DashMap::new(),
            blocked_ips: DashMap::new(),
            events: Mutex::new(VecDeque::with_capacity(MAX_THREAT_EVENTS)),
            monitoring,
        }
    }

    fn push_event(&self, event: ThreatEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= MAX_THREAT_EVENTS {
                events.pop_front();
            }
            events.push_back(event);
        }
        self.monitoring.increment("threat.events");
    }

    /// Record a failed authentication attempt for a user from an IP.
    #[instrument(skip(self, metadata))]
    pub fn record_failed_attempt(
        &self,
        user_id: &str,
        ip: &str,
        user_agent: Option<&str>,
        metadata: Option<serde_json::Value>,
    ) {
        let now = Utc::now();

        // Per-(ip, user) brute-force accounting
        let attempts_for_pair = {
            let mut entry = self
                .attempts
                .entry(attempt_key(ip, user_id))
                .or_insert_with(|| BruteForceAttempt {
                    ip_address: ip.to_string(),
                    user_id: user_id.to_string(),
                    attempts: 0,
                    first_attempt: now,
                    last_attempt: now,
                    blocked: false,
                    block_expires: None,
                });
            entry.attempts += 1;
            entry.last_attempt = now;
            entry.attempts
        };

        // Cross-user counting for the IP: a credential-stuffing source hits
        // many accounts below any single account's threshold
        if self.settings.enable_ip_blocking {
            let window_start =
                now - ChronoDuration::seconds(self.settings.brute_force_window as i64);
            let ip_total: u32 = self
                .attempts
                .iter()
                .filter(|e| e.ip_address == ip && e.last_attempt >= window_start)
                .map(|e| e.attempts)
                .sum();

            if ip_total > self.settings.max_failed_attempts * 2 && !self.is_ip_blocked(ip) {
                self.block_ip(ip, "brute force across accounts");
            }
        }

        // Account lockout accounting
        let mut locked_now = false;
        {
            let mut lockout = self
                .lockouts
                .entry(user_id.to_string())
                .or_insert_with(|| AccountLockout {
                    user_id: user_id.to_string(),
                    reason: "failed_attempts".to_string(),
                    lockout_until: now - ChronoDuration::seconds(1),
                    failed_attempts: 0,
                    last_attempt: now,
                    ip_addresses: Vec::new(),
                });
            eprintln!("DEBUG entry addr={:p} before_incr={}", &*lockout, lockout.failed_attempts);
            lockout.failed_attempts += 1;
            lockout.last_attempt = now;
            if !lockout.ip_addresses.iter().any(|known| known == ip) {
                lockout.ip_addresses.push(ip.to_string());
            }

            eprintln!("DEBUG attempts={} max={} enable={} locked={}", lockout.failed_attempts, self.settings.max_failed_attempts, self.settings.enable_auto_lockout, lockout.is_locked(now));
            if self.settings.enable_auto_lockout
                && lockout.failed_attempts >= self.settings.max_failed_attempts
                && !lockout.is_locked(now)
            {
                lockout.lockout_until =
                    now + ChronoDuration::seconds(self.settings.lockout_duration as i64);
                lockout.reason = "brute_force".to_string();
                locked_now = true;
            }
            eprintln!("DEBUG after: lockout_until={} now={} self={:p}", lockout.lockout_until, now, self);
        }
        eprintln!("DEBUG post-block mapsize={}", self.lockouts.len());

        let severity = if locked_now {
            ThreatSeverity::High
        } else {
            ThreatSeverity::Medium
        };
        let mut event = ThreatEvent::new(
            ThreatEventKind::BruteForce,
            severity,
            format!("failed authentication attempt ({})", attempts_for_pair),
        )
        .with_user(user_id)
        .with_ip(ip);
        event.metadata = metadata;
        if let Some(ua) = user_agent {
            let meta = event.metadata.get_or_insert(serde_json::json!({}));
            if let Some(obj) = meta.as_object_mut() {
                obj.insert("user_agent".to_string(), serde_json::json!(ua));
            }
        }
        self.push_event(event);

        if locked_now {
            warn!(user_id, ip, "Account locked after repeated failures");
            self.monitoring.increment("threat.lockouts");
            self.push_event(
                ThreatEvent::new(
                    ThreatEventKind::AccountLocked,
                    ThreatSeverity::High,
                    format!(
                        "account locked for {} seconds",
                        self.settings.lockout_duration
                    ),
                )
                .with_user(user_id)
                .with_ip(ip),
            );
        }

        self.monitoring.increment("threat.failed_attempts");
    }

    /// Clear all negative state for a user after a successful login.
    #[instrument(skip(self))]
    pub fn record_successful_auth(&self, user_id: &str, ip: Option<&str>) {
        self.lockouts.remove(user_id);
        self.attempts.retain(|_, entry| entry.user_id != user_id);
        if let Some(ip) = ip {
            if self.blocked_ips.remove(ip).is_some() {
                info!(ip, "IP unblocked after successful authentication");
            }
        }
        self.monitoring.increment("threat.successful_auths");
    }

    pub fn is_account_locked(&self, user_id: &str) -> bool {
        let now = Utc::now();
        if let Some(lockout) = self.lockouts.get(user_id) {
            if lockout.is_locked(now) {
                return true;
            }
            // Lapsed lockout: evict lazily so the next failure starts a
            // fresh counting window
            drop(lockout);
            self.lockouts.remove(user_id);
        }
        false
    }

    pub fn get_lockout(&self, user_id: &str) -> Option<AccountLockout> {
        self.lockouts
            .get(user_id)
            .filter(|l| l.is_locked(Utc::now()))
            .map(|l| l.clone())
    }

    pub fn is_ip_blocked(&self, ip: &str) -> bool {
        if let Some(expires) = self.blocked_ips.get(ip) {
            if *expires > Utc::now() {
                return true;
            }
            drop(expires);
            self.blocked_ips.remove(ip);
        }
        false
    }

    fn block_ip(&self, ip: &str, why: &str) {
        let until = Utc::now() + ChronoDuration::seconds(self.settings.ip_block_duration as i64);
        self.blocked_ips.insert(ip.to_string(), until);
        warn!(ip, why, "IP blocked");
        self.monitoring.increment("threat.ip_blocks");
        self.push_event(
            ThreatEvent::new(
                ThreatEventKind::IpBlocked,
                ThreatSeverity::High,
                format!("IP blocked: {}", why),
            )
            .with_ip(ip),
        );
    }

    /// Window-scoped suspicion check for an IP; blocks and reports when the
    /// activity threshold is exceeded.
    #[instrument(skip(self))]
    pub fn check_ip_blocking(&self, ip: &str) -> bool {
        if !self.settings.enable_ip_blocking {
            return false;
        }
        if self.is_ip_blocked(ip) {
            return true;
        }

        let window_start =
            Utc::now() - ChronoDuration::seconds(self.settings.brute_force_window as i64);
        let recent: u32 = self
            .attempts
            .iter()
            .filter(|e| e.ip_address == ip && e.last_attempt >= window_start)
            .map(|e| e.attempts)
            .sum();

        if recent > self.settings.suspicious_activity_threshold {
            self.push_event(
                ThreatEvent::new(
                    ThreatEventKind::SuspiciousActivity,
                    ThreatSeverity::High,
                    format!("{} attempts inside the activity window", recent),
                )
                .with_ip(ip),
            );
            self.block_ip(ip, "suspicious activity");
            return true;
        }
        false
    }

    /// Evict decayed state. Runs on the background tick and is also safe to
    /// call directly.
    pub fn cleanup(&self) {
        let now = Utc::now();
        let window_start =
            now - ChronoDuration::seconds(self.settings.brute_force_window as i64);

        let before_lockouts = self.lockouts.len();
        self.lockouts
            .retain(|_, lockout| lockout.is_locked(now) || lockout.last_attempt >= window_start);

        let before_attempts = self.attempts.len();
        self.attempts
            .retain(|_, entry| entry.last_attempt >= window_start);

        self.blocked_ips.retain(|_, expires| *expires > now);

        if let Ok(mut events) = self.events.lock() {
            while events.len() > MAX_THREAT_EVENTS {
                events.pop_front();
            }
        }

        debug!(
            evicted_lockouts = before_lockouts - self.lockouts.len(),
            evicted_attempts = before_attempts - self.attempts.len(),
            "Threat state cleanup"
        );
    }

    /// Spawn the periodic cleanup task. The task stops when the service is
    /// dropped by all other holders.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match weak.upgrade() {
                    Some(service) => service.cleanup(),
                    None => break,
                }
            }
        })
    }

    /// Most recent events, newest last.
    pub fn recent_events(&self, limit: usize) -> Vec<ThreatEvent> {
        match self.events.lock() {
            Ok(events) => events.iter().rev().take(limit).rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn stats(&self) -> ThreatStats {
        ThreatStats {
            active_lockouts: self.lockouts.len(),
            blocked_ips: self.blocked_ips.len(),
            tracked_attempts: self.attempts.len(),
            recorded_events: self.events.lock().map(|e| e.len()).unwrap_or(0),
        }
    }

    pub fn is_healthy(&self) -> bool {
        // Lock health is the only internal failure mode
        self.events.lock().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_config::AppConfig;

    fn service_with(settings: ThreatSettings) -> ThreatDetectionService {
        ThreatDetectionService::new(settings, Arc::new(MonitoringService::with_noop_sink()))
    }

    fn service() -> ThreatDetectionService {
        service_with(AppConfig::for_test().threat)
    }

    #[test]
    fn test_lockout_after_max_failed_attempts() {
        let threat = service();

        for _ in 0..4 {
            threat.record_failed_attempt("u1", "10.0.0.2", None, None);
            assert!(!threat.is_account_locked("u1"));
        }
        threat.record_failed_attempt("u1", "10.0.0.2", None, None);
        assert!(threat.is_account_locked("u1"));

        let lockout = threat.get_lockout("u1").unwrap();
        assert_eq!(lockout.failed_attempts, 5);
        assert!(lockout.lockout_until > Utc::now());
        assert!(lockout.ip_addresses.contains(&"10.0.0.2".to_string()));
    }

    #[test]
    fn test_lockout_expires() {
        let mut settings = AppConfig::for_test().threat;
        settings.lockout_duration = 0; // expires immediately
        let threat = service_with(settings);

        for _ in 0..5 {
            threat.record_failed_attempt("u1", "10.0.0.2", None, None);
        }
        assert!(!threat.is_account_locked("u1"));
    }

    #[test]
    fn test_successful_auth_clears_state() {
        let threat = service();
        for _ in 0..5 {
            threat.record_failed_attempt("u1", "10.0.0.2", None, None);
        }
        assert!(threat.is_account_locked("u1"));

        threat.record_successful_auth("u1", Some("10.0.0.2"));
        assert!(!threat.is_account_locked("u1"));
        assert_eq!(threat.stats().tracked_attempts, 0);
    }

    #[test]
    fn test_auto_lockout_can_be_disabled() {
        let mut settings = AppConfig::for_test().threat;
        settings.enable_auto_lockout = false;
        let threat = service_with(settings);

        for _ in 0..10 {
            threat.record_failed_attempt("u1", "10.0.0.2", None, None);
        }
        assert!(!threat.is_account_locked("u1"));
    }

    #[test]
    fn test_ip_blocked_across_users() {
        let threat = service();

        // max_failed_attempts * 2 = 10; spread across users so no single
        // account locks first
        for i in 0..11 {
            threat.record_failed_attempt(&format!("user-{}", i), "10.9.9.9", None, None);
        }
        assert!(threat.is_ip_blocked("10.9.9.9"));
        // Another IP is unaffected
        assert!(!threat.is_ip_blocked("10.0.0.1"));
    }

    #[test]
    fn test_check_ip_blocking_suspicious_window() {
        let threat = service();

        for i in 0..6 {
            threat.record_failed_attempt(&format!("user-{}", i), "10.8.8.8", None, None);
        }
        // 6 attempts is under the threshold of 10
        assert!(!threat.check_ip_blocking("10.8.8.8"));

        for i in 6..11 {
            threat.record_failed_attempt(&format!("user-{}", i), "10.8.8.8", None, None);
        }
        assert!(threat.check_ip_blocking("10.8.8.8"));
        assert!(threat.is_ip_blocked("10.8.8.8"));
    }

    #[test]
    fn test_event_ring_is_bounded() {
        let mut settings = AppConfig::for_test().threat;
        settings.enable_auto_lockout = false;
        settings.enable_ip_blocking = false;
        let threat = service_with(settings);

        for i in 0..(MAX_THREAT_EVENTS + 50) {
            threat.record_failed_attempt(&format!("u{}", i), "10.0.0.2", None, None);
        }
        assert_eq!(threat.stats().recorded_events, MAX_THREAT_EVENTS);
    }

    #[test]
    fn test_cleanup_evicts_decayed_state() {
        let mut settings = AppConfig::for_test().threat;
        settings.brute_force_window = 0; // everything is immediately stale
        settings.enable_auto_lockout = false;
        let threat = service_with(settings);

        threat.record_failed_attempt("u1", "10.0.0.2", None, None);
        threat.cleanup();
        assert_eq!(threat.stats().tracked_attempts, 0);
        assert_eq!(threat.stats().active_lockouts, 0);
    }

    #[test]
    fn test_events_carry_context() {
        let threat = service();
        threat.record_failed_attempt(
            "u1",
            "10.0.0.2",
            Some("curl/8.0"),
            Some(serde_json::json!({"path": "/login"})),
        );

        let events = threat.recent_events(10);
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.user_id.as_deref(), Some("u1"));
        assert_eq!(event.ip_address.as_deref(), Some("10.0.0.2"));
        let meta = event.metadata.as_ref().unwrap();
        assert_eq!(meta["user_agent"], "curl/8.0");
        assert_eq!(meta["path"], "/login");
    }
}
