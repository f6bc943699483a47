use std::collections::{BTreeMap, HashSet};

use tracing::{debug, trace, warn};

use crate::time::{Clock, TTL_GRACE_SECONDS};

use super::state::{BrokerRecord, BrokerState, LocalBrokerProperties, PeerRole};

/// Shortest-path-to-next-hop memo, keyed by `(from, to)`. See
/// [`RoutingCache::invalidate_edge`] for the exact invalidation predicate,
/// recovered verbatim from the original `Cache::invalidate` (spec §10).
#[derive(Debug, Default)]
pub struct RoutingCache {
    entries: BTreeMap<(String, String), String>,
}

impl RoutingCache {
    pub fn get(&self, from: &str, to: &str) -> Option<&str> {
        self.entries
            .get(&(from.to_string(), to.to_string()))
            .map(String::as_str)
    }

    pub fn put(&mut self, from: &str, to: &str, next: &str) {
        if from.is_empty() || to.is_empty() || next.is_empty() {
            return;
        }
        self.entries.insert((from.to_string(), to.to_string()), next.to_string());
    }

    /// Removes the literal `(from, to)` entry, then removes every entry
    /// whose key mentions `to` on either side and whose cached next-hop is
    /// `from` — the node at `from` no longer has an edge that could lead
    /// through it towards `to`.
    pub fn invalidate_edge(&mut self, from: &str, to: &str) {
        self.entries.remove(&(from.to_string(), to.to_string()));
        self.entries
            .retain(|(k_from, k_to), next| !((k_from == to || k_to == to) && next == from));
    }

    /// Removes every entry that mentions `id` at all — used when a broker
    /// is evicted from the registry outright (TTL expiry or explicit
    /// removal), since every path through it is now stale.
    pub fn invalidate_node(&mut self, id: &str) {
        self.entries
            .retain(|(k_from, k_to), next| k_from != id && k_to != id && next != id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Caller-supplied traversal policy for [`BrokerRegistry::depth_first_traversal`].
/// `allow_visit` gates descent into a neighbour; `visit` is invoked for
/// every broker actually visited and its return value controls whether the
/// traversal continues.
pub trait FabricVisitor {
    fn allow_visit(&self, registry: &BrokerRegistry, to: &str) -> bool;
    fn visit(&mut self, registry: &BrokerRegistry, to: &str) -> bool;
}

/// The adjacency graph of the fabric plus local-broker bookkeeping.
pub struct BrokerRegistry {
    states: BTreeMap<String, BrokerState>,
    cache: RoutingCache,
    local_id: String,
    local: LocalBrokerProperties,
    last_maintenance: u64,
}

impl BrokerRegistry {
    pub fn new(local_id: impl Into<String>) -> Self {
        BrokerRegistry {
            states: BTreeMap::new(),
            cache: RoutingCache::default(),
            local_id: local_id.into(),
            local: LocalBrokerProperties::default(),
            last_maintenance: 0,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local(&self) -> &LocalBrokerProperties {
        &self.local
    }

    pub fn local_mut(&mut self) -> &mut LocalBrokerProperties {
        &mut self.local
    }

    pub fn cache(&self) -> &RoutingCache {
        &self.cache
    }

    /// Adds a broker, or updates it in place if it already exists.
    pub fn add_broker(&mut self, record: BrokerRecord, now: u64) {
        let id = record.id.clone();
        match self.states.get_mut(&id) {
            Some(existing) => existing.record = record,
            None => {
                self.states.insert(id.clone(), BrokerState::new(record, now));
            }
        }
        trace!(broker = %id, "broker added or updated");
    }

    pub fn exists(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&BrokerState> {
        self.states.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut BrokerState> {
        self.states.get_mut(id)
    }

    pub fn all_states(&self) -> impl Iterator<Item = (&String, &BrokerState)> {
        self.states.iter()
    }

    /// Removes a broker and every edge referencing it. The local broker is
    /// never removed by this path (spec §4.B, TTL upkeep).
    pub fn remove_broker(&mut self, id: &str) -> bool {
        if id == self.local_id {
            warn!("refusing to remove the local broker from the registry");
            return false;
        }
        if self.states.remove(id).is_none() {
            return false;
        }
        for state in self.states.values_mut() {
            state.peers.remove(id);
        }
        self.cache.invalidate_node(id);
        debug!(broker = %id, "broker removed");
        true
    }

    pub fn update_ttl(&mut self, id: &str, ttl_seconds: u64, now: u64) -> bool {
        match self.states.get_mut(id) {
            Some(state) => {
                state.record.ttl_seconds = ttl_seconds;
                state.registration_time = now;
                true
            }
            None => false,
        }
    }

    /// Adds a directed peer edge from `id` to `peer`, failing if `peer` is
    /// unknown (spec §4.B, "addPeer referencing an unknown broker fails").
    pub fn add_peer(&mut self, id: &str, peer: &str, role: PeerRole) -> bool {
        if !self.states.contains_key(peer) {
            return false;
        }
        match self.states.get_mut(id) {
            Some(state) => {
                state.peers.insert(peer.to_string(), role);
                self.cache.invalidate_edge(id, peer);
                self.cache.invalidate_edge(peer, id);
                true
            }
            None => false,
        }
    }

    pub fn remove_peer(&mut self, id: &str, peer: &str) -> bool {
        let removed = match self.states.get_mut(id) {
            Some(state) => state.peers.remove(peer).is_some(),
            None => false,
        };
        if removed {
            self.cache.invalidate_edge(id, peer);
            self.cache.invalidate_edge(peer, id);
        }
        removed
    }

    /// Atomically replaces all of `id`'s peers with the given parent and
    /// child sets (spec §4.B, "set all peers of a broker atomically").
    /// Fails without mutating anything if `id`, or any entry in `parents`/
    /// `children`, is not a known broker (same invariant `add_peer`
    /// enforces one edge at a time).
    pub fn set_peers(&mut self, id: &str, parents: &[String], children: &[String]) -> bool {
        if !self.states.contains_key(id) {
            return false;
        }
        if parents.iter().chain(children).any(|peer| !self.states.contains_key(peer)) {
            return false;
        }
        let state = self.states.get_mut(id).expect("existence checked above");
        let old: Vec<String> = state.peers.keys().cloned().collect();
        state.peers.clear();
        for p in parents {
            state.peers.insert(p.clone(), PeerRole::Parent);
        }
        for c in children {
            state.peers.insert(c.clone(), PeerRole::Child);
        }
        for p in &old {
            self.cache.invalidate_edge(id, p);
            self.cache.invalidate_edge(p, id);
        }
        true
    }

    pub fn add_topic(&mut self, id: &str, topic: &str) -> bool {
        self.states.get_mut(id).map(|s| s.add_topic(topic)).unwrap_or(false)
    }

    pub fn remove_topic(&mut self, id: &str, topic: &str) -> bool {
        self.states
            .get_mut(id)
            .map(|s| s.remove_topic(topic))
            .unwrap_or(false)
    }

    /// Groups `id`'s current topics into batches whose serialized size does
    /// not exceed `char_budget` characters, for outbound state transfer on
    /// `/mcafee/event/dxl/broker/topics`.
    pub fn topic_batches(&self, id: &str, char_budget: usize) -> Vec<Vec<String>> {
        let state = match self.states.get(id) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let mut batches = Vec::new();
        let mut current = Vec::new();
        let mut current_len = 0usize;
        for topic in &state.topics {
            if current_len + topic.len() > char_budget && !current.is_empty() {
                batches.push(std::mem::take(&mut current));
                current_len = 0;
            }
            current_len += topic.len();
            current.push(topic.clone());
        }
        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Depth-first traversal starting at `start`. The start node is always
    /// visited; every neighbour is gated by `visitor.allow_visit` before
    /// being descended into.
    pub fn depth_first_traversal(&self, start: &str, visitor: &mut dyn FabricVisitor) {
        let mut visited = HashSet::new();
        self.dfs_visit(start, &mut visited, visitor);
    }

    fn dfs_visit(&self, id: &str, visited: &mut HashSet<String>, visitor: &mut dyn FabricVisitor) -> bool {
        if !visited.insert(id.to_string()) {
            return true;
        }
        if !visitor.visit(self, id) {
            return false;
        }
        let Some(state) = self.states.get(id) else {
            return true;
        };
        for peer in state.peers.keys() {
            if visited.contains(peer) {
                continue;
            }
            if !visitor.allow_visit(self, peer) {
                continue;
            }
            if !self.dfs_visit(peer, visited, visitor) {
                return false;
            }
        }
        true
    }

    /// Returns the next hop from `from` towards `to`, or `None` if no path
    /// exists. Consults the routing cache first; a miss triggers a DFS and
    /// memoizes the result (spec §4.B "Routing algorithm").
    pub fn next_broker(&mut self, from: &str, to: &str) -> Option<String> {
        if from == to || from.is_empty() || to.is_empty() {
            return None;
        }
        if let Some(hit) = self.cache.get(from, to) {
            return Some(hit.to_string());
        }
        let mut visited = HashSet::new();
        visited.insert(from.to_string());
        let next = self.find_next_hop(from, to, &mut visited);
        if let Some(ref hop) = next {
            self.cache.put(from, to, hop);
        }
        next
    }

    fn find_next_hop(&self, from: &str, to: &str, visited: &mut HashSet<String>) -> Option<String> {
        let state = self.states.get(from)?;
        for neighbor in state.peers.keys() {
            if visited.contains(neighbor) {
                continue;
            }
            if neighbor == to {
                return Some(neighbor.clone());
            }
            visited.insert(neighbor.clone());
            if self.subtree_contains(neighbor, to, visited) {
                return Some(neighbor.clone());
            }
        }
        None
    }

    fn subtree_contains(&self, start: &str, target: &str, visited: &mut HashSet<String>) -> bool {
        if start == target {
            return true;
        }
        let Some(state) = self.states.get(start) else {
            return false;
        };
        for neighbor in state.peers.keys() {
            if visited.contains(neighbor) {
                continue;
            }
            visited.insert(neighbor.clone());
            if neighbor == target || self.subtree_contains(neighbor, target, visited) {
                return true;
            }
        }
        false
    }

    /// Whether any broker reachable from `broker` via `peer` is subscribed
    /// to `topic` (directly or via wildcard). Conservatively returns `true`
    /// without further checking once any broker on the path has topic
    /// routing disabled — see spec §9's pinned ambiguity and SPEC_FULL §11.
    pub fn is_subscriber_in_hierarchy(&self, broker: &str, peer: &str, topic: &str) -> bool {
        let mut visited = HashSet::new();
        visited.insert(broker.to_string());
        self.check_subtree_for_subscriber(peer, topic, &mut visited)
    }

    fn check_subtree_for_subscriber(&self, id: &str, topic: &str, visited: &mut HashSet<String>) -> bool {
        if !visited.insert(id.to_string()) {
            return false;
        }
        let Some(state) = self.states.get(id) else {
            return false;
        };
        if !state.record.topic_routing_enabled {
            return true;
        }
        if state.is_subscriber(topic) {
            return true;
        }
        state
            .peers
            .keys()
            .any(|peer| self.check_subtree_for_subscriber(peer, topic, visited))
    }

    /// Evicts every non-local broker whose TTL has elapsed past the grace
    /// period. Returns the ids evicted, so callers (the pipeline's
    /// maintenance handler) can cascade invalidation to dependent caches.
    pub fn run_maintenance(&mut self, clock: &dyn Clock) -> Vec<String> {
        let now = clock.now();
        self.last_maintenance = now;
        let expired: Vec<String> = self
            .states
            .iter()
            .filter(|(id, state)| {
                id.as_str() != self.local_id
                    && now.saturating_sub(state.registration_time) > state.record.ttl_seconds + TTL_GRACE_SECONDS
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.remove_broker(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TestClock;

    fn line_topology() -> BrokerRegistry {
        let mut reg = BrokerRegistry::new("A");
        for id in ["A", "B", "C"] {
            let mut rec = BrokerRecord::new(id);
            rec.topic_routing_enabled = true;
            rec.ttl_seconds = 120;
            reg.add_broker(rec, 0);
        }
        reg.add_peer("A", "B", PeerRole::Child);
        reg.add_peer("B", "A", PeerRole::Parent);
        reg.add_peer("B", "C", PeerRole::Child);
        reg.add_peer("C", "B", PeerRole::Parent);
        reg
    }

    #[test]
    fn next_hop_on_three_broker_line() {
        let mut reg = line_topology();
        assert_eq!(reg.next_broker("A", "C").as_deref(), Some("B"));
        reg.remove_peer("B", "C");
        assert_eq!(reg.next_broker("A", "C"), None);
    }

    #[test]
    fn routing_cache_is_invalidated_transitively() {
        let mut reg = line_topology();
        assert_eq!(reg.next_broker("A", "C").as_deref(), Some("B"));
        assert!(reg.cache().len() > 0);
        reg.remove_peer("B", "C");
        // stale (A, C) -> B entry must be gone, not merely stale-but-cached
        assert_eq!(reg.cache().get("A", "C"), None);
    }

    #[test]
    fn topic_routing_skip_reports_true_when_subscribed() {
        let mut reg = line_topology();
        reg.add_topic("B", "x/y");
        assert!(reg.is_subscriber_in_hierarchy("A", "B", "x/y"));
        reg.remove_topic("B", "x/y");
        assert!(!reg.is_subscriber_in_hierarchy("A", "B", "x/y"));
    }

    #[test]
    fn routing_disabled_broker_forces_conservative_true() {
        let mut reg = line_topology();
        reg.get_mut("B").unwrap().record.topic_routing_enabled = false;
        assert!(reg.is_subscriber_in_hierarchy("A", "B", "anything/at/all"));
    }

    #[test]
    fn local_broker_survives_ttl_expiry() {
        let mut reg = BrokerRegistry::new("A");
        let mut rec = BrokerRecord::new("A");
        rec.ttl_seconds = 10;
        reg.add_broker(rec, 0);
        let clock = TestClock::new(10_000);
        let expired = reg.run_maintenance(&clock);
        assert!(expired.is_empty());
        assert!(reg.exists("A"));
    }

    #[test]
    fn remote_broker_is_evicted_after_ttl_plus_grace() {
        let mut reg = BrokerRegistry::new("A");
        reg.add_broker(BrokerRecord::new("A"), 0);
        let mut rec = BrokerRecord::new("B");
        rec.ttl_seconds = 10;
        reg.add_broker(rec, 0);
        let clock = TestClock::new(10 + crate::time::TTL_GRACE_SECONDS + 1);
        let expired = reg.run_maintenance(&clock);
        assert_eq!(expired, vec!["B".to_string()]);
        assert!(!reg.exists("B"));
    }

    #[test]
    fn unknown_peer_lookup_returns_none_never_fabricated() {
        let reg = BrokerRegistry::new("A");
        assert!(reg.get("ghost").is_none());
    }

    #[test]
    fn add_peer_to_unknown_broker_fails() {
        let mut reg = BrokerRegistry::new("A");
        reg.add_broker(BrokerRecord::new("A"), 0);
        assert!(!reg.add_peer("A", "ghost", PeerRole::Child));
    }

    #[test]
    fn set_peers_replaces_edges_atomically() {
        let mut reg = line_topology();
        reg.add_broker(BrokerRecord::new("D"), 0);
        assert!(reg.set_peers("B", &["A".to_string()], &["D".to_string()]));
        let state = reg.get("B").unwrap();
        assert_eq!(state.peers.get("A"), Some(&PeerRole::Parent));
        assert_eq!(state.peers.get("D"), Some(&PeerRole::Child));
        assert!(!state.peers.contains_key("C"));
    }

    #[test]
    fn set_peers_referencing_unknown_broker_fails_without_mutating() {
        let mut reg = line_topology();
        let before: Vec<_> = reg.get("B").unwrap().peers.keys().cloned().collect();
        assert!(!reg.set_peers("B", &["ghost".to_string()], &[]));
        let after: Vec<_> = reg.get("B").unwrap().peers.keys().cloned().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn set_peers_on_unknown_broker_fails() {
        let mut reg = BrokerRegistry::new("A");
        reg.add_broker(BrokerRecord::new("A"), 0);
        assert!(!reg.set_peers("ghost", &[], &[]));
    }
}
