//! Server configuration: defaults, TOML file, then CLI/env overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use silo_membership::{MembershipConfig, RingConfig, TableBackend};

/// Everything needed to run one silo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// address the liveness transport (and table service) bind to
    pub bind: String,
    /// UDP port for pings and gossip
    pub port: u16,
    /// silo generation. allocated from the clock when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<i32>,
    /// logical silo name. defaults to "silo-{port}"
    pub silo_name: String,
    /// host name recorded in the membership row
    pub host_name: String,
    /// deployment whose rows this silo reads and writes
    pub deployment_id: String,
    /// client gateway port advertised in the table (0 = none)
    pub proxy_port: u16,
    /// TCP port to serve the local table to other silos (0 = disabled)
    pub table_service_port: u16,
    /// timeout for a single remote table call
    #[serde(with = "humantime_serde")]
    pub table_call_timeout: Duration,
    pub table: TableBackend,
    pub membership: MembershipConfig,
    pub ring: RingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 11111,
            generation: None,
            silo_name: String::new(),
            host_name: "localhost".into(),
            deployment_id: "dev".into(),
            proxy_port: 0,
            table_service_port: 0,
            table_call_timeout: Duration::from_secs(5),
            table: TableBackend::Memory,
            membership: MembershipConfig::default(),
            ring: RingConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        Self::from_toml(&text).map_err(|e| format!("invalid config file '{}': {e}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// The silo name, falling back to one derived from the port.
    pub fn resolved_silo_name(&self) -> String {
        if self.silo_name.is_empty() {
            format!("silo-{}", self.port)
        } else {
            self.silo_name.clone()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.membership.validate().map_err(|e| e.to_string())?;
        if self.ring.num_buckets_per_silo == 0 {
            return Err("ring.num_buckets_per_silo must be > 0".into());
        }
        if self.table_service_port != 0 && matches!(self.table, TableBackend::Remote { .. }) {
            return Err("table_service_port requires a local table backend (memory or file)".into());
        }
        if self.table_call_timeout.is_zero() {
            return Err("table_call_timeout must be > 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_roundtrips() {
        let cfg = ServerConfig::default();
        let text = cfg.to_toml().unwrap();
        assert!(text.contains("[membership]"));
        assert!(text.contains("kind = \"memory\""));
        assert_eq!(ServerConfig::from_toml(&text).unwrap(), cfg);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg = ServerConfig::from_toml(
            r#"
            port = 12000
            deployment_id = "prod"

            [table]
            kind = "remote"
            addr = "10.0.0.5:30000"

            [membership]
            probe_timeout = "2s"
            num_votes_for_death_declaration = 3

            [ring]
            use_virtual_buckets = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.port, 12000);
        assert_eq!(cfg.deployment_id, "prod");
        assert_eq!(
            cfg.table,
            TableBackend::Remote {
                addr: "10.0.0.5:30000".parse().unwrap()
            }
        );
        assert_eq!(cfg.membership.probe_timeout, Duration::from_secs(2));
        assert_eq!(cfg.membership.num_votes_for_death_declaration, 3);
        assert_eq!(cfg.membership.num_probed_silos, 3);
        assert!(!cfg.ring.use_virtual_buckets);
        assert_eq!(cfg.ring.num_buckets_per_silo, 30);
        assert_eq!(cfg.resolved_silo_name(), "silo-12000");
        cfg.validate().unwrap();
    }

    #[test]
    fn file_backend_path() {
        let cfg = ServerConfig::from_toml(
            r#"
            [table]
            kind = "file"
            path = "/var/lib/silo/members.json"
            "#,
        )
        .unwrap();
        assert!(matches!(cfg.table, TableBackend::File { ref path } if path.ends_with("members.json")));
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut cfg = ServerConfig {
            table_service_port: 30000,
            table: TableBackend::Remote {
                addr: "127.0.0.1:30000".parse().unwrap(),
            },
            ..Default::default()
        };
        assert!(cfg.validate().unwrap_err().contains("table_service_port"));

        cfg.table = TableBackend::Memory;
        cfg.validate().unwrap();

        cfg.membership.num_probed_silos = 0;
        assert!(cfg.validate().unwrap_err().contains("num_probed_silos"));
    }

    #[test]
    fn from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silo.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        let err = ServerConfig::from_file(&path).unwrap_err();
        assert!(err.contains("silo.toml"));
        assert!(ServerConfig::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
