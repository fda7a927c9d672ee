//! Proxy group selection
//!
//! Each group keeps health for its members. Connection attempts and the
//! periodic probe both feed it; three failures in a row mark a member
//! unhealthy until its next success.

use leaf_config::{GroupPolicy, ProxyGroup};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Consecutive failures before a member counts as down
const MAX_FAILURES: u32 = 3;

/// Latency slot value for "never measured"
const UNKNOWN_LATENCY: u64 = u64::MAX;

/// Health of one group member
#[derive(Debug)]
pub struct MemberHealth {
    latency_ms: AtomicU64,
    failures: AtomicU32,
}

impl MemberHealth {
    fn new() -> Self {
        Self {
            latency_ms: AtomicU64::new(UNKNOWN_LATENCY),
            failures: AtomicU32::new(0),
        }
    }

    /// Record a successful connect
    pub fn record_success(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis().min(u64::MAX as u128 - 1) as u64, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Record a failed connect
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.failures.load(Ordering::Relaxed) < MAX_FAILURES
    }

    /// Last measured connect latency
    pub fn latency(&self) -> Option<Duration> {
        match self.latency_ms.load(Ordering::Relaxed) {
            UNKNOWN_LATENCY => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Runtime state of a `[Proxy Group]`
#[derive(Debug)]
pub struct GroupState {
    name: String,
    policy: GroupPolicy,
    members: Vec<(String, MemberHealth)>,
    fail_timeout: Duration,
    check_interval: Duration,
}

impl GroupState {
    pub fn new(group: &ProxyGroup) -> Self {
        Self {
            name: group.name.clone(),
            policy: group.policy,
            members: group
                .members
                .iter()
                .map(|m| (m.clone(), MemberHealth::new()))
                .collect(),
            fail_timeout: Duration::from_secs(group.fail_timeout_secs()),
            check_interval: Duration::from_secs(group.check_interval_secs()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> GroupPolicy {
        self.policy
    }

    /// Time budget for a single member attempt
    pub fn fail_timeout(&self) -> Duration {
        self.fail_timeout
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|(name, _)| name.as_str())
    }

    pub fn health(&self, member: &str) -> Option<&MemberHealth> {
        self.members
            .iter()
            .find(|(name, _)| name == member)
            .map(|(_, health)| health)
    }

    /// Members in the order a connection should try them
    pub fn candidates(&self) -> Vec<&str> {
        match self.policy {
            GroupPolicy::Failover => {
                let (healthy, down): (Vec<_>, Vec<_>) =
                    self.members.iter().partition(|(_, h)| h.is_healthy());
                healthy
                    .into_iter()
                    .chain(down)
                    .map(|(name, _)| name.as_str())
                    .collect()
            }
            GroupPolicy::UrlTest => {
                let (mut healthy, down): (Vec<_>, Vec<_>) =
                    self.members.iter().partition(|(_, h)| h.is_healthy());
                // Stable sort keeps config order among equal or unknown latencies.
                healthy.sort_by_key(|(_, h)| h.latency().unwrap_or(Duration::MAX));
                healthy
                    .into_iter()
                    .chain(down)
                    .map(|(name, _)| name.as_str())
                    .collect()
            }
            GroupPolicy::Select => self.member_names().collect(),
            GroupPolicy::Random => {
                let mut names: Vec<&str> = self.member_names().collect();
                names.shuffle(&mut rand::thread_rng());
                names
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaf_config::Params;

    fn group(policy: GroupPolicy, members: &[&str]) -> GroupState {
        GroupState::new(&ProxyGroup {
            name: "G".into(),
            policy,
            members: members.iter().map(|m| m.to_string()).collect(),
            params: Params::new(),
        })
    }

    #[test]
    fn test_member_health() {
        let health = MemberHealth::new();
        assert!(health.is_healthy());
        assert_eq!(health.latency(), None);

        for _ in 0..MAX_FAILURES {
            health.record_failure();
        }
        assert!(!health.is_healthy());

        health.record_success(Duration::from_millis(42));
        assert!(health.is_healthy());
        assert_eq!(health.latency(), Some(Duration::from_millis(42)));
    }

    #[test]
    fn test_failover_demotes_unhealthy() {
        let g = group(GroupPolicy::Failover, &["A", "B", "C"]);
        assert_eq!(g.candidates(), vec!["A", "B", "C"]);

        for _ in 0..MAX_FAILURES {
            g.health("A").unwrap().record_failure();
        }
        assert_eq!(g.candidates(), vec!["B", "C", "A"]);
    }

    #[test]
    fn test_url_test_orders_by_latency() {
        let g = group(GroupPolicy::UrlTest, &["A", "B", "C"]);
        g.health("A").unwrap().record_success(Duration::from_millis(300));
        g.health("C").unwrap().record_success(Duration::from_millis(20));
        assert_eq!(g.candidates(), vec!["C", "A", "B"]);
    }

    #[test]
    fn test_select_keeps_order() {
        let g = group(GroupPolicy::Select, &["B", "A"]);
        for _ in 0..MAX_FAILURES {
            g.health("B").unwrap().record_failure();
        }
        assert_eq!(g.candidates(), vec!["B", "A"]);
    }

    #[test]
    fn test_random_is_a_permutation() {
        let g = group(GroupPolicy::Random, &["A", "B", "C", "D"]);
        let mut picked = g.candidates();
        picked.sort();
        assert_eq!(picked, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_group_params() {
        let g = GroupState::new(&ProxyGroup {
            name: "G".into(),
            policy: GroupPolicy::Failover,
            members: vec!["A".into()],
            params: Params::new(),
        });
        assert_eq!(g.fail_timeout(), Duration::from_secs(3));
        assert_eq!(g.check_interval(), Duration::from_secs(600));
        assert_eq!(g.name(), "G");
    }
}
