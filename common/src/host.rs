//! Host descriptors and their JSON representation

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// How a host authenticates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Credential {
    Password(String),
    KeyFile(std::path::PathBuf),
    /// use whatever identities the transport finds on its own (agent, default keys)
    Default,
}

/// Immutable description of one remote host
///
/// The pool addresses connections by [`HostDescriptor::identity`], which is the hostname
/// alone: two descriptors differing only in port, user or credential collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "HostRecord", into = "HostRecord")]
pub struct HostDescriptor {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub label: Option<String>,
}

impl HostDescriptor {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            credential: Credential::Default,
            label: None,
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Key used to address this host within a pool
    pub fn identity(&self) -> &str {
        &self.hostname
    }

    /// Label if one was given, hostname otherwise
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.hostname)
    }
}

impl std::fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
    }
}

/// Flat record form used by host files and provisioning scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_filename: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl TryFrom<HostRecord> for HostDescriptor {
    type Error = anyhow::Error;

    fn try_from(record: HostRecord) -> Result<Self, Self::Error> {
        if record.hostname.is_empty() {
            return Err(anyhow!("host record has an empty hostname"));
        }
        let credential = match (record.password, record.key_filename) {
            (Some(_), Some(_)) => {
                return Err(anyhow!(
                    "host {} specifies both a password and a key file, pick one",
                    record.hostname
                ));
            }
            (Some(password), None) => Credential::Password(password),
            (None, Some(key)) => Credential::KeyFile(key),
            (None, None) => Credential::Default,
        };
        Ok(Self {
            hostname: record.hostname,
            port: record.port.unwrap_or(DEFAULT_SSH_PORT),
            username: record.username,
            credential,
            label: record.label,
        })
    }
}

impl From<HostDescriptor> for HostRecord {
    fn from(host: HostDescriptor) -> Self {
        let (password, key_filename) = match host.credential {
            Credential::Password(password) => (Some(password), None),
            Credential::KeyFile(key) => (None, Some(key)),
            Credential::Default => (None, None),
        };
        Self {
            hostname: host.hostname,
            port: Some(host.port),
            username: host.username,
            password,
            key_filename,
            label: host.label,
        }
    }
}

/// Parse an ordered JSON array of host records
pub fn parse_hosts(json: &str) -> anyhow::Result<Vec<HostDescriptor>> {
    serde_json::from_str(json).context("failed parsing host list")
}

/// Load an ordered JSON array of host records from a file
pub async fn load_hosts(path: &std::path::Path) -> anyhow::Result<Vec<HostDescriptor>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed reading host file {:?}", path))?;
    parse_hosts(&json).with_context(|| format!("invalid host file {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_defaults_port_and_credential() {
        let hosts = parse_hosts(r#"[{"hostname": "alpha", "username": "ubuntu"}]"#).unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].port, 22);
        assert_eq!(hosts[0].credential, Credential::Default);
        assert_eq!(hosts[0].display_name(), "alpha");
    }

    #[test]
    fn record_keeps_order_and_fields() {
        let hosts = parse_hosts(
            r#"[
                {"hostname": "b", "username": "root", "port": 2222, "password": "pw"},
                {"hostname": "a", "username": "root", "key_filename": "/k", "label": "gpu-0"}
            ]"#,
        )
        .unwrap();
        assert_eq!(hosts[0].identity(), "b");
        assert_eq!(hosts[0].port, 2222);
        assert_eq!(hosts[0].credential, Credential::Password("pw".to_string()));
        assert_eq!(hosts[1].identity(), "a");
        assert_eq!(
            hosts[1].credential,
            Credential::KeyFile(std::path::PathBuf::from("/k"))
        );
        assert_eq!(hosts[1].display_name(), "gpu-0");
    }

    #[test]
    fn password_and_key_are_exclusive() {
        let error = parse_hosts(
            r#"[{"hostname": "a", "username": "u", "password": "x", "key_filename": "/k"}]"#,
        )
        .unwrap_err();
        assert!(format!("{error:#}").contains("both a password and a key file"));
    }

    #[test]
    fn descriptor_survives_serialization() {
        let host = HostDescriptor::new("node", "admin")
            .with_port(2200)
            .with_credential(Credential::KeyFile("/id".into()))
            .with_label("worker");
        let json = serde_json::to_string(&vec![host.clone()]).unwrap();
        assert_eq!(parse_hosts(&json).unwrap(), vec![host]);
    }

    #[tokio::test]
    async fn missing_host_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let error = load_hosts(&tmp.path().join("nope.json")).await.unwrap_err();
        assert!(format!("{error:#}").contains("failed reading host file"));
    }
}
