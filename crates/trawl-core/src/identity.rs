//! Per-request network identity rotation.
//!
//! Every fetch attempt presents a proxy (optional) and a client signature
//! (User-Agent). The rotator hands these out from the configured pools;
//! empty pools mean "no proxy" and [`DEFAULT_USER_AGENT`] respectively.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::models::Identity;

/// Signature used when the configured pool is empty.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// How the next pool element is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationPolicy {
    #[default]
    RoundRobin,
    Random,
}

impl fmt::Display for RotationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationPolicy::RoundRobin => write!(f, "round-robin"),
            RotationPolicy::Random => write!(f, "random"),
        }
    }
}

impl FromStr for RotationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(RotationPolicy::RoundRobin),
            "random" => Ok(RotationPolicy::Random),
            _ => Err(format!("Unknown rotation policy: {s}")),
        }
    }
}

/// Hands out identities from the proxy and user-agent pools.
///
/// The round-robin cursor is a single atomic counter: each call claims a
/// unique ticket with `fetch_add`, so concurrent callers can neither skip
/// nor duplicate a slot.
#[derive(Debug)]
pub struct IdentityRotator {
    proxies: Vec<String>,
    user_agents: Vec<String>,
    policy: RotationPolicy,
    cursor: AtomicUsize,
}

impl IdentityRotator {
    pub fn new(proxies: Vec<String>, user_agents: Vec<String>, policy: RotationPolicy) -> Self {
        Self {
            proxies,
            user_agents,
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Pick the identity for the next fetch attempt.
    pub fn next(&self) -> Identity {
        let ticket = match self.policy {
            RotationPolicy::RoundRobin => Some(self.cursor.fetch_add(1, Ordering::Relaxed)),
            RotationPolicy::Random => None,
        };

        let proxy = pick(&self.proxies, ticket).cloned();
        let user_agent = pick(&self.user_agents, ticket)
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Identity { proxy, user_agent }
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }
}

fn pick(pool: &[String], ticket: Option<usize>) -> Option<&String> {
    if pool.is_empty() {
        return None;
    }
    let idx = match ticket {
        Some(t) => t % pool.len(),
        None => rand::rng().random_range(0..pool.len()),
    };
    pool.get(idx)
}
