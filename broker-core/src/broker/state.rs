use std::collections::{BTreeMap, BTreeSet};

use crate::wildcard;

/// Role of a peer in the fabric tree relative to the broker that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Parent,
    Child,
}

/// Static/slowly-changing fields reported for a broker, either locally or
/// via a peer's state event (spec §3 "Broker record").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerRecord {
    pub id: String,
    pub hostname: String,
    pub port: u32,
    pub web_socket_port: Option<u32>,
    pub ttl_seconds: u64,
    pub start_time: u64,
    pub policy_hostname: String,
    pub policy_ip_address: String,
    pub policy_hub_name: String,
    pub policy_port: u32,
    pub broker_version: String,
    pub connection_limit: u32,
    pub topic_routing_enabled: bool,
    pub managing_authority: String,
}

impl BrokerRecord {
    pub fn new(id: impl Into<String>) -> Self {
        BrokerRecord {
            id: id.into(),
            hostname: "UNKNOWN".into(),
            port: 0,
            web_socket_port: None,
            ttl_seconds: 0,
            start_time: 0,
            policy_hostname: String::new(),
            policy_ip_address: String::new(),
            policy_hub_name: String::new(),
            policy_port: 0,
            broker_version: String::new(),
            connection_limit: 0,
            topic_routing_enabled: false,
            managing_authority: String::new(),
        }
    }
}

/// Policy-reported fields for the distinguished "this process" broker.
/// Always read in preference to the generic [`BrokerRecord`] for the local
/// id (spec §3).
#[derive(Debug, Clone, Default)]
pub struct LocalBrokerProperties {
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub hub: Option<String>,
    pub port: Option<u32>,
    pub web_socket_port: Option<u32>,
    pub managing_authority: Option<String>,
    pub connection_limit: Option<u32>,
}

/// A broker record plus its position and subscriptions in the fabric
/// (spec §3 "Broker state").
#[derive(Debug, Clone)]
pub struct BrokerState {
    pub record: BrokerRecord,
    pub peers: BTreeMap<String, PeerRole>,
    pub topics: BTreeSet<String>,
    pub pending_topics: BTreeSet<String>,
    pending_wildcard_count: u32,
    pub wildcard_count: u32,
    pub topics_change_counter: u64,
    pub registration_time: u64,
}

impl BrokerState {
    pub fn new(record: BrokerRecord, registration_time: u64) -> Self {
        BrokerState {
            record,
            peers: BTreeMap::new(),
            topics: BTreeSet::new(),
            pending_topics: BTreeSet::new(),
            pending_wildcard_count: 0,
            wildcard_count: 0,
            topics_change_counter: 0,
            registration_time,
        }
    }

    /// Adds `topic` to the current set. Returns whether it was newly added.
    pub fn add_topic(&mut self, topic: &str) -> bool {
        let added = self.topics.insert(topic.to_string());
        if added {
            if wildcard::contains_wildcard(topic) {
                self.wildcard_count += 1;
            }
            self.topics_change_counter += 1;
        }
        added
    }

    /// Removes `topic` from the current set. Returns whether it was present.
    pub fn remove_topic(&mut self, topic: &str) -> bool {
        let removed = self.topics.remove(topic);
        if removed {
            if wildcard::contains_wildcard(topic) {
                self.wildcard_count = self.wildcard_count.saturating_sub(1);
            }
            self.topics_change_counter += 1;
        }
        removed
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }

    /// Whether this broker is subscribed to `topic` directly or via a
    /// wildcard pattern it holds.
    pub fn is_subscriber(&self, topic: &str) -> bool {
        if self.topics.contains(topic) {
            return true;
        }
        if self.wildcard_count == 0 {
            return false;
        }
        self.topics
            .iter()
            .filter(|t| wildcard::contains_wildcard(t))
            .any(|pattern| wildcard::matches(pattern, topic))
    }

    pub fn clear_pending_topics(&mut self) {
        self.pending_topics.clear();
        self.pending_wildcard_count = 0;
    }

    pub fn add_pending_topics<'a>(&mut self, topics: impl IntoIterator<Item = &'a str>, wildcard_count: u32) {
        for t in topics {
            self.pending_topics.insert(t.to_string());
        }
        self.pending_wildcard_count = wildcard_count;
    }

    /// Swaps the pending topic batch into the current set, per the
    /// batched-update protocol used for `/mcafee/event/dxl/broker/topics`.
    pub fn swap_pending_topics(&mut self) {
        std::mem::swap(&mut self.topics, &mut self.pending_topics);
        self.wildcard_count = self.pending_wildcard_count;
        self.pending_topics.clear();
        self.pending_wildcard_count = 0;
        self.topics_change_counter += 1;
    }
}
