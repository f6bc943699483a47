//! Fabric configuration service (spec §4.D) and the on-disk policy file
//! formats it loads: fabric-policy JSON, authorization JSON, and a
//! key=value general policy file.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::authz::{AuthKey, AuthorizationState, Direction};
use crate::fabric::{BrokerNode, FabricConfig, FabricConfigBuilder, FabricConfigError, HubNode};

#[derive(Debug, Error)]
pub enum ConfigurationLoadError {
    #[error("failed to read `{path}`: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("failed to parse `{path}`: {source}")]
    Json { path: String, source: serde_json::Error },
    #[error(transparent)]
    Fabric(#[from] FabricConfigError),
}

#[derive(Debug, Deserialize)]
struct FabricPolicyBroker {
    id: String,
    hostname: String,
    port: u32,
    #[serde(rename = "parentId")]
    parent_id: Option<String>,
    #[serde(rename = "serviceZone")]
    service_zone: Option<String>,
    #[serde(rename = "altHostname")]
    alt_hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FabricPolicyHub {
    id: String,
    #[serde(rename = "primaryBroker")]
    primary_broker: String,
    #[serde(rename = "secondaryBroker")]
    secondary_broker: String,
    #[serde(rename = "parentId")]
    parent_id: Option<String>,
    #[serde(rename = "serviceZone")]
    service_zone: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FabricPolicyFile {
    #[serde(default)]
    brokers: Vec<FabricPolicyBroker>,
    #[serde(default)]
    hubs: Vec<FabricPolicyHub>,
}

pub fn load_fabric_config(path: &Path) -> Result<FabricConfig, ConfigurationLoadError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigurationLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let parsed: FabricPolicyFile = serde_json::from_str(&text).map_err(|source| ConfigurationLoadError::Json {
        path: path.display().to_string(),
        source,
    })?;
    let mut builder = FabricConfigBuilder::new();
    for hub in parsed.hubs {
        builder = builder.hub(HubNode {
            id: hub.id,
            primary_broker: hub.primary_broker,
            secondary_broker: hub.secondary_broker,
            service_zone: hub.service_zone,
            parent_id: hub.parent_id,
        });
    }
    for broker in parsed.brokers {
        builder = builder.broker(BrokerNode {
            id: broker.id,
            hostname: broker.hostname,
            port: broker.port,
            ip_address: broker.alt_hostname,
            service_zone: broker.service_zone,
            parent_id: broker.parent_id,
        });
    }
    Ok(builder.build()?)
}

#[derive(Debug, Deserialize)]
struct AuthorizationEntry {
    topic: String,
    clients: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AuthorizationFile {
    #[serde(default)]
    send: Vec<AuthorizationEntry>,
    #[serde(default)]
    receive: Vec<AuthorizationEntry>,
}

/// `send` entries gate publish; `receive` entries gate subscribe. Entries
/// list client ids; certificate-hash entries are added separately by
/// callers that resolve a cert hash out of band.
pub fn load_authorization(path: &Path) -> Result<AuthorizationState, ConfigurationLoadError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigurationLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let parsed: AuthorizationFile = serde_json::from_str(&text).map_err(|source| ConfigurationLoadError::Json {
        path: path.display().to_string(),
        source,
    })?;
    let mut state = AuthorizationState::new();
    for entry in parsed.send {
        for client in entry.clients {
            state.allow(Direction::Publish, entry.topic.clone(), AuthKey::ClientId(client));
        }
    }
    for entry in parsed.receive {
        for client in entry.clients {
            state.allow(Direction::Subscribe, entry.topic.clone(), AuthKey::ClientId(client));
        }
    }
    Ok(state)
}

/// General broker policy: a flat key=value text file. Blank lines and
/// lines starting with `#` are ignored.
#[derive(Debug, Clone, Default)]
pub struct GeneralPolicy {
    values: BTreeMap<String, String>,
}

impl GeneralPolicy {
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        GeneralPolicy { values }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigurationLoadError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigurationLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn keep_alive_minutes(&self) -> Option<u32> {
        self.get("keepAlive").and_then(|v| v.parse().ok())
    }

    pub fn connection_limit(&self) -> Option<u32> {
        self.get("connectionLimit").and_then(|v| v.parse().ok())
    }
}

/// Implemented by subsystems that need to react to a fabric-configuration
/// change: the bridge-configuration handler, the service registry (zone
/// cache invalidation), and the topic-cache service.
pub trait FabricConfigurationListener {
    fn on_configuration_updated(&mut self, config: &FabricConfig);
}

/// Holds the current configuration as an immutable snapshot; replaces the
/// pointer wholesale on `set_configuration` rather than mutating in place.
pub struct FabricConfigurationService {
    current: FabricConfig,
}

impl FabricConfigurationService {
    pub fn new(initial: FabricConfig) -> Self {
        FabricConfigurationService { current: initial }
    }

    pub fn current(&self) -> &FabricConfig {
        &self.current
    }

    /// Replaces the configuration if it differs from the current one,
    /// notifying every listener in order. Returns whether it changed.
    pub fn set_configuration(&mut self, new_config: FabricConfig, listeners: &mut [&mut dyn FabricConfigurationListener]) -> bool {
        if new_config == self.current {
            return false;
        }
        self.current = new_config;
        info!("fabric configuration changed, notifying listeners");
        for listener in listeners {
            listener.on_configuration_updated(&self.current);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn general_policy_parses_keys_and_ignores_comments() {
        let policy = GeneralPolicy::parse("# comment\nkeepAlive=5\nconnectionLimit=100\n\n");
        assert_eq!(policy.keep_alive_minutes(), Some(5));
        assert_eq!(policy.connection_limit(), Some(100));
    }

    #[test]
    fn fabric_policy_json_round_trips_into_fabric_config() {
        let json = r#"{
            "brokers": [{"id": "root", "hostname": "root.example", "port": 8883}],
            "hubs": [{"id": "h1", "primaryBroker": "p", "secondaryBroker": "s", "parentId": "root"}]
        }"#;
        let dir = std::env::temp_dir().join(format!("fabric-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("fabric.json");
        fs::write(&path, json).unwrap();
        let config = load_fabric_config(&path).unwrap();
        assert!(config.broker_node("root").is_some());
        assert!(config.hub_node("h1").is_some());
        fs::remove_dir_all(&dir).ok();
    }

    struct CountingListener {
        calls: u32,
    }
    impl FabricConfigurationListener for CountingListener {
        fn on_configuration_updated(&mut self, _config: &FabricConfig) {
            self.calls += 1;
        }
    }

    #[test]
    fn set_configuration_skips_notification_when_unchanged() {
        let initial = FabricConfigBuilder::new().build().unwrap();
        let mut svc = FabricConfigurationService::new(initial);
        let mut listener = CountingListener { calls: 0 };
        let same = FabricConfigBuilder::new().build().unwrap();
        let changed = svc.set_configuration(same, &mut [&mut listener]);
        assert!(!changed);
        assert_eq!(listener.calls, 0);

        let different = FabricConfigBuilder::new()
            .broker(BrokerNode {
                id: "a".into(),
                hostname: "a.example".into(),
                port: 1,
                ip_address: None,
                service_zone: None,
                parent_id: None,
            })
            .build()
            .unwrap();
        let changed = svc.set_configuration(different, &mut [&mut listener]);
        assert!(changed);
        assert_eq!(listener.calls, 1);
    }
}
