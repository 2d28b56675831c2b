use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::raft::NodeAddr;

/// Cluster configuration shared by every node, read from `config.json`.
///
/// The file lists the UDP ports of all cluster members; each node finds its
/// peers by removing its own port from the list. Every member binds to
/// 127.0.0.1.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub ports: Vec<u16>,
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,
}

fn default_election_timeout_min_ms() -> u64 {
    150
}

fn default_election_timeout_max_ms() -> u64 {
    300
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            bail!("config lists no cluster ports");
        }
        if self.election_timeout_min_ms == 0
            || self.election_timeout_max_ms < self.election_timeout_min_ms
        {
            bail!(
                "invalid election timeout bounds {}..{}",
                self.election_timeout_min_ms,
                self.election_timeout_max_ms
            );
        }
        Ok(())
    }

    /// The rest of the cluster must know this node to send to it; a port
    /// missing from the shared list is a deployment mistake.
    pub fn require_member(&self, port: u16) -> Result<()> {
        if !self.ports.contains(&port) {
            bail!("port {} is not listed in the cluster configuration", port);
        }
        Ok(())
    }

    /// Every cluster member except the node itself.
    pub fn peers(&self, own_port: u16) -> Vec<NodeAddr> {
        self.ports
            .iter()
            .filter(|port| **port != own_port)
            .map(|port| NodeAddr::new("127.0.0.1", *port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"ports": [5001, 5002, 5003]}"#).unwrap();
        assert_eq!(config.ports, vec![5001, 5002, 5003]);
        assert_eq!(config.election_timeout_min_ms, 150);
        assert_eq!(config.election_timeout_max_ms, 300);
    }

    #[test]
    fn test_parse_with_timing_overrides() {
        let config: Config = serde_json::from_str(
            r#"{"ports": [5001], "election_timeout_min_ms": 200, "election_timeout_max_ms": 400}"#,
        )
        .unwrap();
        assert_eq!(config.election_timeout_min_ms, 200);
        assert_eq!(config.election_timeout_max_ms, 400);
    }

    #[test]
    fn test_membership_check() {
        let config: Config = serde_json::from_str(r#"{"ports": [5001, 5002]}"#).unwrap();
        assert!(config.require_member(5001).is_ok());
        assert!(config.require_member(9999).is_err());
    }

    #[test]
    fn test_peers_exclude_own_port() {
        let config: Config = serde_json::from_str(r#"{"ports": [5001, 5002, 5003]}"#).unwrap();
        let peers = config.peers(5002);
        assert_eq!(
            peers,
            vec![
                NodeAddr::new("127.0.0.1", 5001),
                NodeAddr::new("127.0.0.1", 5003)
            ]
        );
    }

    #[test]
    fn test_invalid_timeout_bounds_rejected() {
        let config: Config = serde_json::from_str(
            r#"{"ports": [5001], "election_timeout_min_ms": 300, "election_timeout_max_ms": 150}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
