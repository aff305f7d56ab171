//! Per-agent and per-domain quota limiter
//!
//! Two key-addressed tables gate admission: each configured key carries a
//! stream counter and a token bucket. An absent entry means no limit.
//! Stream slots are taken with a reserve-then-commit protocol so a paired
//! acquire/release always leaves both counters unchanged.

use crate::bucket::TokenBucket;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

/// Quota errors, ordered by the check that produced them
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuotaError {
    #[error("agent stream limit exceeded")]
    AgentStreamLimit,

    #[error("domain stream limit exceeded")]
    DomainStreamLimit,

    #[error("agent rate limit exceeded")]
    AgentRateLimit,

    #[error("domain rate limit exceeded")]
    DomainRateLimit,

    #[error("global stream limit exceeded")]
    GlobalStreamLimit,

    #[error("global connection limit exceeded")]
    GlobalConnectionLimit,
}

struct AgentLimit {
    max_streams: u32,
    max_bandwidth: u64,
    rate_limit: u32,
    bucket: TokenBucket,
    current_streams: Mutex<u32>,
}

struct DomainLimit {
    max_streams: u32,
    rate_limit: u32,
    bucket: TokenBucket,
    current_streams: Mutex<u32>,
}

/// Observable state of an agent limit
#[derive(Debug, Clone, PartialEq)]
pub struct AgentLimitSnapshot {
    pub agent_id: String,
    pub max_streams: u32,
    pub max_bandwidth: u64,
    pub rate_limit: u32,
    pub current_streams: u32,
    pub tokens: f64,
}

/// Observable state of a domain limit
#[derive(Debug, Clone, PartialEq)]
pub struct DomainLimitSnapshot {
    pub domain: String,
    pub max_streams: u32,
    pub rate_limit: u32,
    pub current_streams: u32,
    pub tokens: f64,
}

/// Shared quota limiter
pub struct QuotaLimiter {
    agent_limits: RwLock<HashMap<String, Arc<AgentLimit>>>,
    domain_limits: RwLock<HashMap<String, Arc<DomainLimit>>>,

    max_connections: usize,
    max_streams: usize,
    global_streams: AtomicUsize,
}

impl QuotaLimiter {
    /// Create a limiter with global maxima; zero means unlimited
    pub fn new(max_connections: usize, max_streams: usize) -> Self {
        Self {
            agent_limits: RwLock::new(HashMap::new()),
            domain_limits: RwLock::new(HashMap::new()),
            max_connections,
            max_streams,
            global_streams: AtomicUsize::new(0),
        }
    }

    /// Install or replace the limit for an agent
    ///
    /// Replacement resets the bucket to full and the stream counter to zero;
    /// callers must not replace a limit while streams are in flight for it.
    pub fn set_agent_limit(&self, agent_id: &str, max_streams: u32, max_bandwidth: u64, rate: u32) {
        debug!(agent_id, max_streams, rate, "installing agent limit");
        self.agent_limits.write().unwrap().insert(
            agent_id.to_string(),
            Arc::new(AgentLimit {
                max_streams,
                max_bandwidth,
                rate_limit: rate,
                bucket: TokenBucket::new(rate as i64, rate as f64),
                current_streams: Mutex::new(0),
            }),
        );
    }

    /// Install or replace the limit for a domain
    pub fn set_domain_limit(&self, domain: &str, max_streams: u32, rate: u32) {
        debug!(domain, max_streams, rate, "installing domain limit");
        self.domain_limits.write().unwrap().insert(
            domain.to_string(),
            Arc::new(DomainLimit {
                max_streams,
                rate_limit: rate,
                bucket: TokenBucket::new(rate as i64, rate as f64),
                current_streams: Mutex::new(0),
            }),
        );
    }

    /// Evaluate all limits gating one inbound request
    ///
    /// Rate tokens are consumed here; stream caps are only observed. The
    /// first failing check determines the error.
    pub fn check_request(&self, agent_id: &str, domain: &str) -> Result<(), QuotaError> {
        if let Some(limit) = self.agent_limit_entry(agent_id) {
            if !limit.bucket.allow() {
                return Err(QuotaError::AgentRateLimit);
            }
        }

        if let Some(limit) = self.domain_limit_entry(domain) {
            if !limit.bucket.allow() {
                return Err(QuotaError::DomainRateLimit);
            }
        }

        if let Some(limit) = self.agent_limit_entry(agent_id) {
            if *limit.current_streams.lock().unwrap() >= limit.max_streams {
                return Err(QuotaError::AgentStreamLimit);
            }
        }

        if let Some(limit) = self.domain_limit_entry(domain) {
            if *limit.current_streams.lock().unwrap() >= limit.max_streams {
                return Err(QuotaError::DomainStreamLimit);
            }
        }

        if self.max_streams > 0 && self.global_streams.load(Ordering::SeqCst) >= self.max_streams {
            return Err(QuotaError::GlobalStreamLimit);
        }

        Ok(())
    }

    /// Take one stream slot for the agent/domain pair
    ///
    /// Caps are re-tested under each counter's lock, so a race with
    /// `check_request` cannot overshoot. A reservation that fails halfway is
    /// unwound before the error is returned.
    pub fn acquire_stream(&self, agent_id: &str, domain: &str) -> Result<(), QuotaError> {
        let agent = self.agent_limit_entry(agent_id);
        if let Some(ref limit) = agent {
            let mut current = limit.current_streams.lock().unwrap();
            if *current >= limit.max_streams {
                return Err(QuotaError::AgentStreamLimit);
            }
            *current += 1;
        }

        let domain_limit = self.domain_limit_entry(domain);
        if let Some(ref limit) = domain_limit {
            let mut current = limit.current_streams.lock().unwrap();
            if *current >= limit.max_streams {
                drop(current);
                release_slot(agent.as_deref().map(|l| &l.current_streams));
                return Err(QuotaError::DomainStreamLimit);
            }
            *current += 1;
        }

        if self.max_streams > 0 {
            let taken = self
                .global_streams
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    (v < self.max_streams).then_some(v + 1)
                });
            if taken.is_err() {
                release_slot(domain_limit.as_deref().map(|l| &l.current_streams));
                release_slot(agent.as_deref().map(|l| &l.current_streams));
                return Err(QuotaError::GlobalStreamLimit);
            }
        } else {
            self.global_streams.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Return the slot taken by `acquire_stream`; counters clamp at zero
    pub fn release_stream(&self, agent_id: &str, domain: &str) {
        release_slot(self.agent_limit_entry(agent_id).as_deref().map(|l| &l.current_streams));
        release_slot(self.domain_limit_entry(domain).as_deref().map(|l| &l.current_streams));

        let _ = self
            .global_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    /// Gate a new agent connection against the global connection cap
    pub fn check_connection(&self, active_connections: usize) -> Result<(), QuotaError> {
        if self.max_connections > 0 && active_connections >= self.max_connections {
            return Err(QuotaError::GlobalConnectionLimit);
        }
        Ok(())
    }

    /// Streams currently held across all agents and domains
    pub fn global_streams(&self) -> usize {
        self.global_streams.load(Ordering::SeqCst)
    }

    pub fn agent_limit(&self, agent_id: &str) -> Option<AgentLimitSnapshot> {
        let limit = self.agent_limit_entry(agent_id)?;
        let (tokens, _) = limit.bucket.stats();
        let current_streams = *limit.current_streams.lock().unwrap();
        Some(AgentLimitSnapshot {
            agent_id: agent_id.to_string(),
            max_streams: limit.max_streams,
            max_bandwidth: limit.max_bandwidth,
            rate_limit: limit.rate_limit,
            current_streams,
            tokens,
        })
    }

    pub fn domain_limit(&self, domain: &str) -> Option<DomainLimitSnapshot> {
        let limit = self.domain_limit_entry(domain)?;
        let (tokens, _) = limit.bucket.stats();
        let current_streams = *limit.current_streams.lock().unwrap();
        Some(DomainLimitSnapshot {
            domain: domain.to_string(),
            max_streams: limit.max_streams,
            rate_limit: limit.rate_limit,
            current_streams,
            tokens,
        })
    }

    fn agent_limit_entry(&self, agent_id: &str) -> Option<Arc<AgentLimit>> {
        self.agent_limits.read().unwrap().get(agent_id).cloned()
    }

    fn domain_limit_entry(&self, domain: &str) -> Option<Arc<DomainLimit>> {
        self.domain_limits.read().unwrap().get(domain).cloned()
    }
}

fn release_slot(counter: Option<&Mutex<u32>>) {
    if let Some(counter) = counter {
        let mut current = counter.lock().unwrap();
        *current = current.saturating_sub(1);
    }
}
