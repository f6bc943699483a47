//! Topic-subscription cache (spec §4.C): one incrementally-built cache per
//! outgoing bridge peer, answering "is there a subscriber reachable that
//! way?" without re-walking the fabric on every publish.

use std::collections::{BTreeMap, HashSet};

use tracing::trace;

use crate::broker::BrokerRegistry;
use crate::wildcard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Start,
    Building,
    Completed,
}

/// Per-bridge cache. `reachable` is computed once, at `Start`; `Building`
/// then copies one broker's topic set per call, so lookups themselves
/// drive construction rather than blocking on a single large traversal.
struct BridgeTopicCache {
    reachable: Vec<String>,
    cursor: usize,
    state: BuildState,
    topics: HashSet<String>,
    wildcard_count: u32,
    routing_enabled: bool,
}

impl BridgeTopicCache {
    fn new() -> Self {
        BridgeTopicCache {
            reachable: Vec::new(),
            cursor: 0,
            state: BuildState::Start,
            topics: HashSet::new(),
            wildcard_count: 0,
            routing_enabled: true,
        }
    }

    fn index_of(&self, broker_id: &str) -> Option<usize> {
        self.reachable.iter().position(|id| id == broker_id)
    }

    /// A broker is "already visited" by this cache's incremental builder
    /// once its index is below the cursor, or the cache is fully Completed.
    fn already_visited(&self, broker_id: &str) -> bool {
        match self.index_of(broker_id) {
            None => false,
            Some(idx) => self.state == BuildState::Completed || idx < self.cursor,
        }
    }

    fn advance(&mut self, peer: &str, local_broker_id: &str, registry: &BrokerRegistry) {
        match self.state {
            BuildState::Start => {
                let mut order = Vec::new();
                let mut routing_enabled = true;
                let mut visited = HashSet::new();
                collect_reachable(
                    registry,
                    peer,
                    local_broker_id,
                    &mut visited,
                    &mut order,
                    &mut routing_enabled,
                );
                self.reachable = order;
                self.routing_enabled = routing_enabled;
                if !routing_enabled {
                    // Conservative short-circuit: we already know the answer
                    // is always "true" while routing is disabled anywhere on
                    // the subtree, so there's no need to copy topic sets.
                    self.state = BuildState::Completed;
                } else {
                    self.state = BuildState::Building;
                    self.cursor = 0;
                }
            }
            BuildState::Building => {
                if let Some(id) = self.reachable.get(self.cursor).cloned() {
                    if let Some(state) = registry.get(&id) {
                        for topic in &state.topics {
                            if self.topics.insert(topic.clone()) && wildcard::contains_wildcard(topic) {
                                self.wildcard_count += 1;
                            }
                        }
                    }
                }
                self.cursor += 1;
                if self.cursor >= self.reachable.len() {
                    self.state = BuildState::Completed;
                }
            }
            BuildState::Completed => {}
        }
    }

    fn lookup(&self, topic: &str) -> (bool, bool) {
        match self.state {
            BuildState::Start => (false, false),
            BuildState::Building => (false, false),
            BuildState::Completed => {
                if !self.routing_enabled {
                    return (true, true);
                }
                let direct = self.topics.contains(topic);
                let wild = self.wildcard_count > 0
                    && self
                        .topics
                        .iter()
                        .filter(|t| wildcard::contains_wildcard(t))
                        .any(|pattern| wildcard::matches(pattern, topic));
                (true, direct || wild)
            }
        }
    }

    fn on_topic_added(&mut self, broker_id: &str, topic: &str) {
        if !self.already_visited(broker_id) {
            return;
        }
        if self.topics.insert(topic.to_string()) && wildcard::contains_wildcard(topic) {
            self.wildcard_count += 1;
        }
    }

    fn on_topic_removed(&mut self, broker_id: &str, topic: &str, registry: &BrokerRegistry) {
        if !self.already_visited(broker_id) {
            return;
        }
        let visited_upper = if self.state == BuildState::Completed {
            self.reachable.len()
        } else {
            self.cursor
        };
        let still_held = self.reachable[..visited_upper]
            .iter()
            .filter(|id| id.as_str() != broker_id)
            .any(|id| registry.get(id).map(|s| s.has_topic(topic)).unwrap_or(false));
        if !still_held {
            if self.topics.remove(topic) && wildcard::contains_wildcard(topic) {
                self.wildcard_count = self.wildcard_count.saturating_sub(1);
            }
        }
    }
}

/// Walks the subtree reachable from `start`, never crossing back through
/// `exclude_id` (the local broker this cache belongs to) — mirrors
/// `FindBrokersVisitor::allowVisit`, which refuses to enter the local broker
/// from any direction.
fn collect_reachable(
    registry: &BrokerRegistry,
    start: &str,
    exclude_id: &str,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
    routing_enabled: &mut bool,
) {
    if start == exclude_id {
        return;
    }
    if !visited.insert(start.to_string()) {
        return;
    }
    let Some(state) = registry.get(start) else {
        return;
    };
    if !state.record.topic_routing_enabled {
        *routing_enabled = false;
    }
    order.push(start.to_string());
    for peer in state.peers.keys() {
        if peer != exclude_id {
            collect_reachable(registry, peer, exclude_id, visited, order, routing_enabled);
        }
    }
}

/// One per broker; owns one [`BridgeTopicCache`] per outgoing bridge peer.
pub struct TopicCacheService {
    local_broker_id: String,
    enabled: bool,
    disabled_until: Option<u64>,
    caches: BTreeMap<String, BridgeTopicCache>,
}

impl TopicCacheService {
    pub fn new(local_broker_id: impl Into<String>) -> Self {
        TopicCacheService {
            local_broker_id: local_broker_id.into(),
            enabled: true,
            disabled_until: None,
            caches: BTreeMap::new(),
        }
    }

    /// Per-tick poll: clears `disabled_until` once it has elapsed,
    /// transitioning back to enabled (fresh, per spec: disabled -> enabled
    /// is always a fresh start).
    pub fn tick(&mut self, now: u64) {
        if let Some(until) = self.disabled_until {
            if now >= until {
                self.disabled_until = None;
                self.enabled = true;
                self.caches.clear();
                trace!("topic cache re-enabled after delay");
            }
        }
    }

    pub fn topic_add(&mut self, broker_id: &str, topic: &str) {
        if !self.enabled {
            return;
        }
        for cache in self.caches.values_mut() {
            cache.on_topic_added(broker_id, topic);
        }
    }

    pub fn topic_remove(&mut self, broker_id: &str, topic: &str, registry: &BrokerRegistry) {
        if !self.enabled {
            return;
        }
        for cache in self.caches.values_mut() {
            cache.on_topic_removed(broker_id, topic, registry);
        }
    }

    /// Returns `(valid, result)`. `valid` is false while the cache for this
    /// bridge is still being built; the caller must fall back to a
    /// non-cached lookup in that case (spec §3, topic-subscription cache
    /// invariant).
    pub fn is_subscriber(&mut self, bridge_peer: &str, topic: &str, registry: &BrokerRegistry) -> (bool, bool) {
        if !self.enabled {
            return (false, false);
        }
        let cache = self
            .caches
            .entry(bridge_peer.to_string())
            .or_insert_with(BridgeTopicCache::new);
        cache.advance(bridge_peer, &self.local_broker_id, registry);
        cache.lookup(topic)
    }

    pub fn clear(&mut self) {
        self.caches.clear();
    }

    /// Zeroes all state and parks the service disabled until `now + delay`.
    /// Used by handlers that expect a burst of churn (fabric change) to
    /// avoid rebuilding caches mid-storm.
    pub fn clear_with_delay(&mut self, now: u64, delay_seconds: u64) {
        self.caches.clear();
        self.enabled = false;
        self.disabled_until = Some(now + delay_seconds);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerRecord, PeerRole};

    fn line_topology() -> BrokerRegistry {
        let mut reg = BrokerRegistry::new("A");
        for id in ["A", "B", "C"] {
            let mut rec = BrokerRecord::new(id);
            rec.topic_routing_enabled = true;
            reg.add_broker(rec, 0);
        }
        reg.add_peer("A", "B", PeerRole::Child);
        reg.add_peer("B", "A", PeerRole::Parent);
        reg.add_peer("B", "C", PeerRole::Child);
        reg.add_peer("C", "B", PeerRole::Parent);
        reg
    }

    #[test]
    fn builds_incrementally_until_completed() {
        let mut reg = line_topology();
        reg.add_topic("C", "x/y");
        let mut svc = TopicCacheService::new("A");
        // B and C are reachable via the "B" bridge; cursor advances one per call.
        let (valid, _) = svc.is_subscriber("B", "x/y", &reg);
        assert!(!valid, "still building on first call");
        let (valid, result) = svc.is_subscriber("B", "x/y", &reg);
        assert!(valid);
        assert!(result);
    }

    #[test]
    fn routing_disabled_anywhere_forces_valid_true_result_true() {
        let mut reg = line_topology();
        reg.get_mut("C").unwrap().record.topic_routing_enabled = false;
        let mut svc = TopicCacheService::new("A");
        let (valid, result) = svc.is_subscriber("B", "unrelated/topic", &reg);
        assert!(valid);
        assert!(result);
    }

    #[test]
    fn incremental_topic_add_after_completion_is_visible() {
        let mut reg = line_topology();
        let mut svc = TopicCacheService::new("A");
        // Drive to completion.
        svc.is_subscriber("B", "z", &reg);
        svc.is_subscriber("B", "z", &reg);
        let (_, result) = svc.is_subscriber("B", "z", &reg);
        assert!(!result);

        reg.add_topic("C", "z");
        svc.topic_add("C", "z");
        let (valid, result) = svc.is_subscriber("B", "z", &reg);
        assert!(valid);
        assert!(result);
    }

    #[test]
    fn disabled_service_never_reports_valid() {
        let reg = line_topology();
        let mut svc = TopicCacheService::new("A");
        svc.clear_with_delay(0, 30);
        let (valid, _) = svc.is_subscriber("B", "x", &reg);
        assert!(!valid);
        svc.tick(30);
        assert!(svc.is_enabled());
    }
}
