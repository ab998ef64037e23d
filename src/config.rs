//! Daemon configuration: loaded from a TOML file. Parsing only — no
//! schema DSL, no live reload beyond the SIGHUP log-reopen handled in
//! `daemon.rs`.

use crate::error::{JalError, Result};
use crate::types::RecordType;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

fn default_poll_time() -> u64 {
    5
}

fn default_pending_digest_max() -> usize {
    128
}

fn default_pending_digest_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
pub struct PeerConfig {
    pub hosts: Vec<String>,
    #[serde(default)]
    pub publish_allow: Vec<RecordTypeName>,
    #[serde(default)]
    pub subscribe_allow: Vec<RecordTypeName>,
}

/// `RecordType` isn't directly `Deserialize` with lowercase TOML strings
/// without a small adaptor, since the wire/storage type is shared with
/// code that must not accidentally accept arbitrary casing.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordTypeName {
    Journal,
    Audit,
    Log,
}

impl From<RecordTypeName> for RecordType {
    fn from(name: RecordTypeName) -> Self {
        match name {
            RecordTypeName::Journal => RecordType::Journal,
            RecordTypeName::Audit => RecordType::Audit,
            RecordTypeName::Log => RecordType::Log,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub db_root: PathBuf,
    #[serde(default)]
    pub schemas_root: Option<PathBuf>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    #[serde(default)]
    pub public_cert: Option<PathBuf>,
    #[serde(default)]
    pub remote_cert_dir: Option<PathBuf>,

    #[serde(default = "default_pending_digest_max")]
    pub pending_digest_max: usize,
    #[serde(default = "default_pending_digest_timeout")]
    pub pending_digest_timeout: u64,
    #[serde(default = "default_poll_time")]
    pub poll_time: u64,

    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub daemonise: bool,
    #[serde(default)]
    pub debug: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| JalError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.enable_tls && (self.private_key.is_none() || self.public_cert.is_none()) {
            return Err(JalError::Config(
                "enable_tls requires private_key and public_cert".to_string(),
            ));
        }
        if self.enable_tls && self.remote_cert_dir.is_none() {
            return Err(JalError::Config(
                "enable_tls requires remote_cert_dir for peer pinning".to_string(),
            ));
        }
        Ok(())
    }

    /// Builds the hostname/IP → policy map the peer-policy module consults
    /// per connection, expanding each peer entry's `hosts` list.
    pub fn peer_policy_map(&self) -> HashMap<String, (u8, u8)> {
        let mut map = HashMap::new();
        for peer in &self.peers {
            let publish = peer
                .publish_allow
                .iter()
                .fold(0u8, |acc, t| acc | RecordType::from(*t).bit());
            let subscribe = peer
                .subscribe_allow
                .iter()
                .fold(0u8, |acc, t| acc | RecordType::from(*t).bit());
            for host in &peer.hosts {
                map.insert(host.clone(), (publish, subscribe));
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jald.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(contents.as_bytes())
            .unwrap();
        (dir, path)
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let (_dir, path) = write_config(
            r#"
            host = "127.0.0.1"
            port = 1234
            db_root = "/tmp/jald-db"
            "#,
        );
        let config = Config::load(&path).unwrap();
        assert_eq!(config.port, 1234);
        assert_eq!(config.poll_time, 5);
        assert!(!config.enable_tls);
    }

    #[test]
    fn tls_without_key_material_is_rejected() {
        let (_dir, path) = write_config(
            r#"
            host = "127.0.0.1"
            port = 1234
            db_root = "/tmp/jald-db"
            enable_tls = true
            "#,
        );
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn peer_policy_map_expands_hosts_and_masks() {
        let (_dir, path) = write_config(
            r#"
            host = "127.0.0.1"
            port = 1234
            db_root = "/tmp/jald-db"

            [[peers]]
            hosts = ["collector-a", "collector-b"]
            publish_allow = ["audit", "log"]
            subscribe_allow = []
            "#,
        );
        let config = Config::load(&path).unwrap();
        let map = config.peer_policy_map();
        let (publish, subscribe) = map["collector-a"];
        assert_eq!(publish, RecordType::Audit.bit() | RecordType::Log.bit());
        assert_eq!(subscribe, 0);
        assert_eq!(map["collector-b"], (publish, subscribe));
    }
}
