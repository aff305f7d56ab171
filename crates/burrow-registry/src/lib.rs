//! Tunnel registry mapping public domains to agent connections
//!
//! The forward index resolves `full_domain -> Tunnel`; the reverse index
//! tracks which domains belong to each connection so a dying connection can
//! drop all of its tunnels in one sweep. Records hold the connection id,
//! never a live connection reference.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("domain mismatch")]
    DomainMismatch,

    #[error("domain already registered")]
    DomainAlreadyRegistered,

    #[error("tunnel not found")]
    TunnelNotFound,
}

/// One tunnel record: a public domain bound to an agent connection
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub domain: String,
    pub subdomain: String,
    pub full_domain: String,
    pub connection_id: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,

    // unix millis, updated with fetch_max so a stale reader can never
    // overwrite a newer access time
    last_access: Arc<AtomicI64>,
}

impl Tunnel {
    pub fn last_access(&self) -> DateTime<Utc> {
        let millis = self.last_access.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
    }

    fn touch(&self) {
        self.last_access
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// In-memory tunnel registry
pub struct Registry {
    tunnels: RwLock<HashMap<String, Tunnel>>,
    conn_tunnels: RwLock<HashMap<String, HashSet<String>>>,
    base_domain: String,
}

impl Registry {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            tunnels: RwLock::new(HashMap::new()),
            conn_tunnels: RwLock::new(HashMap::new()),
            base_domain: base_domain.into(),
        }
    }

    /// Register a tunnel for `subdomain` under the base domain
    ///
    /// A non-empty `domain` must agree with the computed full domain.
    /// Re-registering from the same connection refreshes metadata and
    /// returns the existing record; any other connection gets a conflict.
    pub fn register_tunnel(
        &self,
        domain: &str,
        subdomain: &str,
        connection_id: &str,
        agent_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Tunnel, RegistryError> {
        let full_domain = self.build_full_domain(subdomain);

        if !domain.is_empty() && domain != full_domain {
            warn!(domain, full_domain, "rejecting tunnel with mismatched domain");
            return Err(RegistryError::DomainMismatch);
        }

        let mut tunnels = self.tunnels.write().unwrap();

        if let Some(existing) = tunnels.get_mut(&full_domain) {
            if existing.connection_id != connection_id {
                return Err(RegistryError::DomainAlreadyRegistered);
            }
            // same connection re-registering: refresh in place
            existing.metadata = metadata;
            existing.touch();
            return Ok(existing.clone());
        }

        let tunnel = Tunnel {
            domain: domain.to_string(),
            subdomain: subdomain.to_string(),
            full_domain: full_domain.clone(),
            connection_id: connection_id.to_string(),
            agent_id: agent_id.to_string(),
            created_at: Utc::now(),
            metadata,
            last_access: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        };

        tunnels.insert(full_domain.clone(), tunnel.clone());

        // lock order: forward index before reverse index
        self.conn_tunnels
            .write()
            .unwrap()
            .entry(connection_id.to_string())
            .or_default()
            .insert(full_domain.clone());

        info!(full_domain, connection_id, agent_id, "tunnel registered");
        Ok(tunnel)
    }

    /// Look up the tunnel for a full domain
    ///
    /// Refreshes `last_access` without blocking the lookup: the timestamp is
    /// atomic and monotonic, so no write lock and no background task.
    pub fn get_tunnel(&self, full_domain: &str) -> Option<Tunnel> {
        let tunnels = self.tunnels.read().unwrap();
        let tunnel = tunnels.get(full_domain)?;
        tunnel.touch();
        Some(tunnel.clone())
    }

    /// Remove a tunnel from both indices
    pub fn unregister_tunnel(&self, full_domain: &str) -> Result<(), RegistryError> {
        let tunnel = {
            let mut tunnels = self.tunnels.write().unwrap();
            tunnels.remove(full_domain).ok_or(RegistryError::TunnelNotFound)?
        };

        let mut conn_tunnels = self.conn_tunnels.write().unwrap();
        if let Some(domains) = conn_tunnels.get_mut(&tunnel.connection_id) {
            domains.remove(full_domain);
            if domains.is_empty() {
                conn_tunnels.remove(&tunnel.connection_id);
            }
        }

        debug!(full_domain, connection_id = %tunnel.connection_id, "tunnel unregistered");
        Ok(())
    }

    /// Drop every tunnel owned by a connection
    ///
    /// Snapshots the reverse entry under the read lock, then unregisters
    /// each domain one at a time, so the two index locks are never held
    /// together here.
    pub fn unregister_connection_tunnels(&self, connection_id: &str) {
        let domains: Vec<String> = {
            let conn_tunnels = self.conn_tunnels.read().unwrap();
            match conn_tunnels.get(connection_id) {
                Some(domains) => domains.iter().cloned().collect(),
                None => return,
            }
        };

        info!(connection_id, count = domains.len(), "dropping tunnels for connection");
        for domain in domains {
            let _ = self.unregister_tunnel(&domain);
        }
    }

    /// All registered tunnels
    pub fn list_tunnels(&self) -> Vec<Tunnel> {
        self.tunnels.read().unwrap().values().cloned().collect()
    }

    /// All tunnels owned by one connection
    pub fn connection_tunnels(&self, connection_id: &str) -> Vec<Tunnel> {
        let domains: Vec<String> = {
            let conn_tunnels = self.conn_tunnels.read().unwrap();
            match conn_tunnels.get(connection_id) {
                Some(domains) => domains.iter().cloned().collect(),
                None => return Vec::new(),
            }
        };

        let tunnels = self.tunnels.read().unwrap();
        domains.iter().filter_map(|d| tunnels.get(d).cloned()).collect()
    }

    pub fn base_domain(&self) -> &str {
        &self.base_domain
    }

    fn build_full_domain(&self, subdomain: &str) -> String {
        if subdomain.is_empty() {
            self.base_domain.clone()
        } else {
            format!("{}.{}", subdomain, self.base_domain)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new("localhost")
    }

    #[test]
    fn test_register_lookup_unregister() {
        let reg = registry();

        reg.register_tunnel("", "example", "conn-1", "agent-1", HashMap::new())
            .unwrap();

        let tunnel = reg.get_tunnel("example.localhost").unwrap();
        assert_eq!(tunnel.agent_id, "agent-1");
        assert_eq!(tunnel.connection_id, "conn-1");
        assert_eq!(tunnel.full_domain, "example.localhost");

        reg.unregister_tunnel("example.localhost").unwrap();
        assert!(reg.get_tunnel("example.localhost").is_none());
    }

    #[test]
    fn test_empty_subdomain_maps_to_base_domain() {
        let reg = registry();

        reg.register_tunnel("", "", "conn-1", "agent-1", HashMap::new())
            .unwrap();

        assert!(reg.get_tunnel("localhost").is_some());
    }

    #[test]
    fn test_domain_mismatch() {
        let reg = registry();

        let result = reg.register_tunnel("wrong.example", "example", "conn-1", "agent-1", HashMap::new());
        assert_eq!(result.unwrap_err(), RegistryError::DomainMismatch);
    }

    #[test]
    fn test_explicit_matching_domain_accepted() {
        let reg = registry();

        reg.register_tunnel("example.localhost", "example", "conn-1", "agent-1", HashMap::new())
            .unwrap();
        assert!(reg.get_tunnel("example.localhost").is_some());
    }

    #[test]
    fn test_duplicate_domain() {
        let reg = registry();

        reg.register_tunnel("", "example", "conn-1", "agent-1", HashMap::new())
            .unwrap();

        // different connection: conflict
        let result = reg.register_tunnel("", "example", "conn-2", "agent-2", HashMap::new());
        assert_eq!(result.unwrap_err(), RegistryError::DomainAlreadyRegistered);

        // same connection: metadata refresh on the existing record
        let mut metadata = HashMap::new();
        metadata.insert("k".to_string(), "v".to_string());
        let tunnel = reg
            .register_tunnel("", "example", "conn-1", "agent-1", metadata)
            .unwrap();
        assert_eq!(tunnel.metadata.get("k"), Some(&"v".to_string()));
        assert_eq!(reg.list_tunnels().len(), 1);
    }

    #[test]
    fn test_connection_close_cleanup() {
        let reg = registry();

        reg.register_tunnel("", "one", "conn-1", "agent-1", HashMap::new()).unwrap();
        reg.register_tunnel("", "two", "conn-1", "agent-1", HashMap::new()).unwrap();
        reg.register_tunnel("", "three", "conn-2", "agent-2", HashMap::new()).unwrap();

        reg.unregister_connection_tunnels("conn-1");

        assert!(reg.get_tunnel("one.localhost").is_none());
        assert!(reg.get_tunnel("two.localhost").is_none());
        assert!(reg.get_tunnel("three.localhost").is_some());
        assert!(reg.connection_tunnels("conn-1").is_empty());
    }

    #[test]
    fn test_repeated_unregister_is_not_found() {
        let reg = registry();

        reg.register_tunnel("", "example", "conn-1", "agent-1", HashMap::new())
            .unwrap();
        reg.unregister_tunnel("example.localhost").unwrap();

        assert_eq!(
            reg.unregister_tunnel("example.localhost").unwrap_err(),
            RegistryError::TunnelNotFound
        );
    }

    #[test]
    fn test_indices_stay_consistent() {
        let reg = registry();

        reg.register_tunnel("", "a", "conn-1", "agent-1", HashMap::new()).unwrap();
        reg.register_tunnel("", "b", "conn-1", "agent-1", HashMap::new()).unwrap();

        let forward: HashSet<String> =
            reg.list_tunnels().into_iter().map(|t| t.full_domain).collect();
        let reverse: HashSet<String> = reg
            .connection_tunnels("conn-1")
            .into_iter()
            .map(|t| t.full_domain)
            .collect();
        assert_eq!(forward, reverse);

        reg.unregister_tunnel("a.localhost").unwrap();
        assert_eq!(reg.connection_tunnels("conn-1").len(), 1);
    }

    #[test]
    fn test_lookup_refreshes_last_access() {
        let reg = registry();

        reg.register_tunnel("", "example", "conn-1", "agent-1", HashMap::new())
            .unwrap();
        let before = reg.get_tunnel("example.localhost").unwrap().last_access();

        std::thread::sleep(std::time::Duration::from_millis(5));
        reg.get_tunnel("example.localhost").unwrap();

        let after = reg.get_tunnel("example.localhost").unwrap().last_access();
        assert!(after >= before);
    }
}
