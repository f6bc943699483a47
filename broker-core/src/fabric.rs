//! Fabric configuration service (spec §4.D): the static/policy-driven tree
//! of hubs and brokers that bridge selection and zone computation are
//! derived from.

use std::cell::RefCell;
use std::collections::BTreeMap;

/// A hub is a primary/secondary sibling pair acting as one logical unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubNode {
    pub id: String,
    pub primary_broker: String,
    pub secondary_broker: String,
    pub service_zone: Option<String>,
    pub parent_id: Option<String>,
}

/// A single broker's placement in the fabric tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerNode {
    pub id: String,
    pub hostname: String,
    pub port: u32,
    pub ip_address: Option<String>,
    pub service_zone: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone)]
enum Node {
    Hub(HubNode),
    Broker(BrokerNode),
}

impl Node {
    fn id_str(&self) -> &str {
        match self {
            Node::Hub(h) => &h.id,
            Node::Broker(b) => &b.id,
        }
    }

    fn parent_id(&self) -> Option<&str> {
        match self {
            Node::Hub(h) => h.parent_id.as_deref(),
            Node::Broker(b) => b.parent_id.as_deref(),
        }
    }

    fn own_zone(&self) -> Option<&str> {
        match self {
            Node::Hub(h) => h.service_zone.as_deref(),
            Node::Broker(b) => b.service_zone.as_deref(),
        }
    }
}

/// An immutable snapshot of the fabric tree. A broker id may be a plain
/// broker node, or the primary/secondary member of a hub node, but never
/// more than one of either (the loader is responsible for rejecting
/// duplicates before a snapshot is built).
#[derive(Debug, Clone)]
pub struct FabricConfig {
    nodes: Vec<Node>,
    /// broker id -> index into `nodes` of the node that *contains* it (for
    /// hub members this is the hub node, not a synthetic broker node).
    by_broker_id: BTreeMap<String, usize>,
    /// hub id -> index, for parent-chain walks that land on a hub by id.
    by_hub_id: BTreeMap<String, usize>,
    zone_cache: RefCell<BTreeMap<String, Vec<String>>>,
}

impl PartialEq for FabricConfig {
    fn eq(&self, other: &Self) -> bool {
        // Node identity and shape, not the memoized zone cache.
        self.nodes.len() == other.nodes.len()
            && self
                .nodes
                .iter()
                .zip(other.nodes.iter())
                .all(|(a, b)| match (a, b) {
                    (Node::Hub(x), Node::Hub(y)) => x == y,
                    (Node::Broker(x), Node::Broker(y)) => x == y,
                    _ => false,
                })
    }
}

impl Eq for FabricConfig {}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FabricConfigError {
    #[error("broker id `{0}` is a member of more than one hub or broker node")]
    DuplicateBrokerId(String),
    #[error("hub id `{0}` already used")]
    DuplicateHubId(String),
    #[error("parent id `{0}` does not reference a known node")]
    UnknownParent(String),
    #[error("parent chain starting at `{0}` cycles")]
    Cycle(String),
}

pub struct FabricConfigBuilder {
    nodes: Vec<Node>,
}

impl FabricConfigBuilder {
    pub fn new() -> Self {
        FabricConfigBuilder { nodes: Vec::new() }
    }

    pub fn hub(mut self, hub: HubNode) -> Self {
        self.nodes.push(Node::Hub(hub));
        self
    }

    pub fn broker(mut self, broker: BrokerNode) -> Self {
        self.nodes.push(Node::Broker(broker));
        self
    }

    pub fn build(self) -> Result<FabricConfig, FabricConfigError> {
        let mut by_broker_id = BTreeMap::new();
        let mut by_hub_id = BTreeMap::new();
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                Node::Hub(h) => {
                    if by_hub_id.insert(h.id.clone(), idx).is_some() {
                        return Err(FabricConfigError::DuplicateHubId(h.id.clone()));
                    }
                    for member in [&h.primary_broker, &h.secondary_broker] {
                        if by_broker_id.insert(member.clone(), idx).is_some() {
                            return Err(FabricConfigError::DuplicateBrokerId(member.clone()));
                        }
                    }
                }
                Node::Broker(b) => {
                    if by_broker_id.insert(b.id.clone(), idx).is_some() {
                        return Err(FabricConfigError::DuplicateBrokerId(b.id.clone()));
                    }
                }
            }
        }
        // Parent references must resolve, by hub id or by broker id (for
        // plain broker parents) — never into the middle of a hub's member.
        for node in &self.nodes {
            if let Some(parent) = node.parent_id() {
                let resolves = by_hub_id.contains_key(parent)
                    || self.nodes.iter().any(|n| matches!(n, Node::Broker(b) if b.id == parent));
                if !resolves {
                    return Err(FabricConfigError::UnknownParent(parent.to_string()));
                }
            }
        }
        let config = FabricConfig {
            nodes: self.nodes,
            by_broker_id,
            by_hub_id,
            zone_cache: RefCell::new(BTreeMap::new()),
        };
        config.check_acyclic()?;
        Ok(config)
    }
}

impl Default for FabricConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricConfig {
    fn node_for_broker(&self, broker_id: &str) -> Option<&Node> {
        self.by_broker_id.get(broker_id).map(|&idx| &self.nodes[idx])
    }

    fn parent_chain_nodes<'a>(&'a self, start: &'a Node) -> Result<Vec<&'a Node>, FabricConfigError> {
        let mut chain = Vec::new();
        let mut current = start;
        let mut seen = std::collections::HashSet::new();
        loop {
            if !seen.insert(current.id_str().to_string()) {
                return Err(FabricConfigError::Cycle(start.id_str().to_string()));
            }
            chain.push(current);
            match current.parent_id() {
                None => break,
                Some(parent_id) => {
                    let parent = self
                        .by_hub_id
                        .get(parent_id)
                        .map(|&idx| &self.nodes[idx])
                        .or_else(|| {
                            self.nodes
                                .iter()
                                .find(|n| matches!(n, Node::Broker(b) if b.id == parent_id))
                        });
                    match parent {
                        Some(p) => current = p,
                        None => break,
                    }
                }
            }
        }
        Ok(chain)
    }

    fn check_acyclic(&self) -> Result<(), FabricConfigError> {
        for node in &self.nodes {
            self.parent_chain_nodes(node)?;
        }
        Ok(())
    }

    /// The broker's zone list: its own zone (if any) prepended to its
    /// parent chain's zones, memoized on first read. Hub membership
    /// overrides a broker's individual parent chain with the hub's.
    pub fn service_zone_list(&self, broker_id: &str) -> Vec<String> {
        if let Some(cached) = self.zone_cache.borrow().get(broker_id) {
            return cached.clone();
        }
        let list = match self.node_for_broker(broker_id) {
            None => Vec::new(),
            Some(node) => {
                let chain = self.parent_chain_nodes(node).unwrap_or_default();
                chain.iter().filter_map(|n| n.own_zone()).map(str::to_string).collect()
            }
        };
        self.zone_cache.borrow_mut().insert(broker_id.to_string(), list.clone());
        list
    }

    pub fn broker_node(&self, broker_id: &str) -> Option<&BrokerNode> {
        match self.node_for_broker(broker_id)? {
            Node::Broker(b) => Some(b),
            Node::Hub(_) => None,
        }
    }

    pub fn hub_node(&self, hub_id: &str) -> Option<&HubNode> {
        self.by_hub_id.get(hub_id).and_then(|&idx| match &self.nodes[idx] {
            Node::Hub(h) => Some(h),
            Node::Broker(_) => None,
        })
    }

    /// The hub a broker id belongs to, if it is a hub member (either side).
    pub fn hub_for_broker(&self, broker_id: &str) -> Option<&HubNode> {
        match self.node_for_broker(broker_id)? {
            Node::Hub(h) if h.primary_broker == broker_id || h.secondary_broker == broker_id => Some(h),
            _ => None,
        }
    }

    pub fn parent_id_of(&self, broker_id: &str) -> Option<&str> {
        self.node_for_broker(broker_id)?.parent_id()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(id: &str, primary: &str, secondary: &str, zone: Option<&str>, parent: Option<&str>) -> HubNode {
        HubNode {
            id: id.into(),
            primary_broker: primary.into(),
            secondary_broker: secondary.into(),
            service_zone: zone.map(String::from),
            parent_id: parent.map(String::from),
        }
    }

    fn broker(id: &str, zone: Option<&str>, parent: Option<&str>) -> BrokerNode {
        BrokerNode {
            id: id.into(),
            hostname: format!("{id}.example"),
            port: 8883,
            ip_address: None,
            service_zone: zone.map(String::from),
            parent_id: parent.map(String::from),
        }
    }

    #[test]
    fn zone_list_walks_parent_chain() {
        let config = FabricConfigBuilder::new()
            .broker(broker("root", Some("us"), None))
            .broker(broker("mid", Some("east"), Some("root")))
            .broker(broker("leaf", None, Some("mid")))
            .build()
            .unwrap();
        assert_eq!(config.service_zone_list("leaf"), vec!["east", "us"]);
        assert_eq!(config.service_zone_list("mid"), vec!["east", "us"]);
        assert_eq!(config.service_zone_list("root"), vec!["us"]);
    }

    #[test]
    fn hub_member_uses_hub_zone_not_own_parent() {
        let config = FabricConfigBuilder::new()
            .broker(broker("root", Some("global"), None))
            .hub(hub("h1", "p", "s", Some("hubzone"), Some("root")))
            .build()
            .unwrap();
        assert_eq!(config.service_zone_list("p"), vec!["hubzone", "global"]);
        assert_eq!(config.service_zone_list("s"), vec!["hubzone", "global"]);
    }

    #[test]
    fn duplicate_broker_id_rejected() {
        let err = FabricConfigBuilder::new()
            .broker(broker("dup", None, None))
            .broker(broker("dup", None, None))
            .build()
            .unwrap_err();
        assert_eq!(err, FabricConfigError::DuplicateBrokerId("dup".into()));
    }

    #[test]
    fn unknown_parent_rejected() {
        let err = FabricConfigBuilder::new()
            .broker(broker("leaf", None, Some("ghost")))
            .build()
            .unwrap_err();
        assert_eq!(err, FabricConfigError::UnknownParent("ghost".into()));
    }

    #[test]
    fn unknown_broker_zone_list_is_empty() {
        let config = FabricConfigBuilder::new().broker(broker("a", None, None)).build().unwrap();
        assert!(config.service_zone_list("nonexistent").is_empty());
    }
}
