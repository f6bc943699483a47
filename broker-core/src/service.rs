//! Service registry (spec §4.G): registrations indexed by id, by type, and
//! by request topic, with zone-aware round-robin selection and TTL expiry.

use std::collections::{BTreeMap, BTreeSet};

use crate::fabric::FabricConfig;
use crate::time::TTL_GRACE_SECONDS;

pub const EVENT_TO_REQUEST_PREFIX_PROP: &str = "eventToRequestPrefix";
pub const EVENT_TO_REQUEST_TOPIC_PROP: &str = "eventToRequestTopic";

#[derive(Debug, Clone)]
pub struct ServiceRegistration {
    pub service_id: String,
    pub service_type: String,
    pub request_topics: BTreeSet<String>,
    pub registering_client_id: String,
    pub registering_client_instance_id: String,
    pub registering_broker_id: String,
    pub registering_tenant_id: String,
    pub target_tenant_ids: BTreeSet<String>,
    pub ttl_minutes: u32,
    pub registration_time: u64,
    pub metadata: BTreeMap<String, String>,
    pub cert_hashes: BTreeSet<String>,
    pub managed_client: bool,
}

impl ServiceRegistration {
    pub fn is_local(&self, local_broker_id: &str) -> bool {
        self.registering_broker_id == local_broker_id
    }

    pub fn is_expired(&self, now: u64) -> bool {
        let ttl_seconds = u64::from(self.ttl_minutes) * 60;
        now > self.registration_time + ttl_seconds + TTL_GRACE_SECONDS
    }

    /// Remaining TTL in minutes as of `now` (spec §4.G "ADJUSTED-TTL"):
    /// the TTL the registration was stamped with, minus elapsed time.
    /// Used to pick the more-current of two conflicting registrations for
    /// the same service id arriving from different brokers.
    pub fn adjusted_ttl_minutes(&self, now: u64) -> u32 {
        let elapsed_minutes = now.saturating_sub(self.registration_time) / 60;
        self.ttl_minutes.saturating_sub(elapsed_minutes as u32)
    }

    /// Whether `other` is a re-announcement of the same identity as `self`
    /// (same type, topics, broker, and client) rather than a genuinely
    /// different registration that happens to reuse the same service id.
    fn identifies_same_service_as(&self, other: &ServiceRegistration) -> bool {
        self.service_type == other.service_type
            && self.request_topics == other.request_topics
            && self.registering_broker_id == other.registering_broker_id
            && self.registering_client_id == other.registering_client_id
    }

    fn event_to_request_prefix(&self) -> Option<&str> {
        self.metadata.get(EVENT_TO_REQUEST_PREFIX_PROP).map(String::as_str)
    }

    fn event_to_request_topics(&self) -> impl Iterator<Item = &str> {
        self.metadata
            .iter()
            .filter(|(k, _)| k.starts_with(EVENT_TO_REQUEST_TOPIC_PROP))
            .map(|(_, v)| v.as_str())
    }
}

/// Visibility gate for a querying tenant against a registration's tenant
/// fields (spec §4.G multi-tenant visibility): visible if the registration
/// belongs to the querying tenant, or the registration is from an operator
/// tenant whose (possibly empty) target-tenant set permits it.
fn visible_to_tenant(reg: &ServiceRegistration, ops_tenant: &str, querying_tenant: &str) -> bool {
    if reg.registering_tenant_id == querying_tenant {
        return true;
    }
    if reg.registering_tenant_id == ops_tenant {
        return reg.target_tenant_ids.is_empty() || reg.target_tenant_ids.contains(querying_tenant);
    }
    false
}

#[derive(Default)]
struct TopicServices {
    service_ids: Vec<String>,
    /// zone name -> indices into `service_ids` registered in that zone;
    /// populated lazily and invalidated on fabric change.
    zones: Option<BTreeMap<String, Vec<usize>>>,
    /// Next index to try, per zone, for round-robin.
    cursors: BTreeMap<String, usize>,
}

impl TopicServices {
    fn invalidate_zones(&mut self) {
        self.zones = None;
    }
}

pub struct ServiceRegistry {
    local_broker_id: String,
    ops_tenant: String,
    by_id: BTreeMap<String, ServiceRegistration>,
    by_type: BTreeMap<String, BTreeSet<String>>,
    by_topic: BTreeMap<String, TopicServices>,
    event_to_request_prefix: BTreeMap<String, String>,
    local_count: u32,
}

impl ServiceRegistry {
    pub fn new(local_broker_id: impl Into<String>, ops_tenant: impl Into<String>) -> Self {
        ServiceRegistry {
            local_broker_id: local_broker_id.into(),
            ops_tenant: ops_tenant.into(),
            by_id: BTreeMap::new(),
            by_type: BTreeMap::new(),
            by_topic: BTreeMap::new(),
            event_to_request_prefix: BTreeMap::new(),
            local_count: 0,
        }
    }

    /// Registers or merges `reg` (spec §4.G "Registration merge"). If
    /// `reg.service_id` already has a stored registration from a
    /// *different* broker whose remaining TTL is larger, the update is
    /// ignored outright (the nearer broker's data is more current).
    /// Otherwise, if every identifying field matches the stored record,
    /// it is refreshed in place; if any identifying field differs, the
    /// old record's indices are torn down and the new one is indexed
    /// fresh. `now` is the clock reading used to compute adjusted TTLs.
    pub fn register(&mut self, reg: ServiceRegistration, now: u64) {
        if let Some(existing) = self.by_id.get(&reg.service_id) {
            if reg.registering_broker_id != existing.registering_broker_id && reg.adjusted_ttl_minutes(now) < existing.adjusted_ttl_minutes(now) {
                return;
            }
            if existing.identifies_same_service_as(&reg) {
                self.apply_metadata(&reg);
                self.by_id.insert(reg.service_id.clone(), reg);
                return;
            }
            let stale = self.by_id.remove(&reg.service_id).expect("just matched via get");
            self.deindex(&stale);
        }
        self.insert_fresh(reg);
    }

    fn apply_metadata(&mut self, reg: &ServiceRegistration) {
        if let Some(prefix) = reg.event_to_request_prefix() {
            for topic in reg.event_to_request_topics() {
                self.event_to_request_prefix.insert(topic.to_string(), prefix.to_string());
            }
        }
    }

    fn insert_fresh(&mut self, reg: ServiceRegistration) {
        if reg.is_local(&self.local_broker_id) {
            self.local_count += 1;
        }
        self.apply_metadata(&reg);
        self.by_type.entry(reg.service_type.clone()).or_default().insert(reg.service_id.clone());
        for topic in &reg.request_topics {
            let entry = self.by_topic.entry(topic.clone()).or_default();
            entry.service_ids.push(reg.service_id.clone());
            entry.invalidate_zones();
        }
        self.by_id.insert(reg.service_id.clone(), reg);
    }

    /// Removes `reg`'s by-type and by-topic index entries and undoes its
    /// local-count contribution, without touching `by_id` (the caller has
    /// already removed or is about to replace the `by_id` entry itself).
    fn deindex(&mut self, reg: &ServiceRegistration) {
        if reg.is_local(&self.local_broker_id) {
            self.local_count = self.local_count.saturating_sub(1);
        }
        if let Some(ids) = self.by_type.get_mut(&reg.service_type) {
            ids.remove(&reg.service_id);
        }
        for topic in &reg.request_topics {
            if let Some(entry) = self.by_topic.get_mut(topic) {
                entry.service_ids.retain(|id| id != &reg.service_id);
                entry.invalidate_zones();
            }
        }
    }

    pub fn unregister(&mut self, service_id: &str) -> Option<ServiceRegistration> {
        self.do_unregister(service_id, None)
    }

    /// Authenticated unregister: only removes the service if `client_id`
    /// and `tenant_id` both match the original registration.
    pub fn unregister_authenticated(&mut self, service_id: &str, client_id: &str, tenant_id: &str) -> Option<ServiceRegistration> {
        self.do_unregister(service_id, Some((client_id, tenant_id)))
    }

    fn do_unregister(&mut self, service_id: &str, auth: Option<(&str, &str)>) -> Option<ServiceRegistration> {
        let reg = self.by_id.get(service_id)?;
        if let Some((client_id, tenant_id)) = auth {
            if reg.registering_client_id != client_id || reg.registering_tenant_id != tenant_id {
                return None;
            }
        }
        let reg = self.by_id.remove(service_id)?;
        self.deindex(&reg);
        Some(reg)
    }

    pub fn find_by_id(&self, service_id: &str, querying_tenant: &str) -> Option<&ServiceRegistration> {
        let reg = self.by_id.get(service_id)?;
        visible_to_tenant(reg, &self.ops_tenant, querying_tenant).then_some(reg)
    }

    pub fn find_by_type(&self, service_type: &str, querying_tenant: &str) -> Vec<&ServiceRegistration> {
        self.by_type
            .get(service_type)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_id.get(id))
            .filter(|reg| visible_to_tenant(reg, &self.ops_tenant, querying_tenant))
            .collect()
    }

    pub fn request_prefix_for_event(&self, event_topic: &str) -> Option<&str> {
        self.event_to_request_prefix.get(event_topic).map(String::as_str)
    }

    pub fn is_event_to_request_enabled(&self) -> bool {
        !self.event_to_request_prefix.is_empty()
    }

    /// Invalidates every topic's zone partition. Called after a fabric
    /// configuration change, since zone membership may have shifted.
    pub fn invalidate_zones(&mut self) {
        for entry in self.by_topic.values_mut() {
            entry.invalidate_zones();
        }
    }

    fn ensure_zones(&mut self, topic: &str, fabric: &FabricConfig) {
        let Some(entry) = self.by_topic.get_mut(topic) else {
            return;
        };
        if entry.zones.is_some() {
            return;
        }
        let mut zones: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, service_id) in entry.service_ids.iter().enumerate() {
            let Some(reg) = self.by_id.get(service_id) else { continue };
            let zone_list = fabric.service_zone_list(&reg.registering_broker_id);
            let zone = zone_list.first().cloned().unwrap_or_default();
            zones.entry(zone).or_default().push(idx);
        }
        entry.zones = Some(zones);
    }

    /// Next service for `topic` visible to `querying_tenant`, round-robining
    /// within the caller's own zone chain before falling back to further
    /// zones. `reachable` decides whether a non-local service's broker is
    /// currently routable (spec §4.G condition (a)); `authorized` gates on
    /// the client hosting the service (condition (c)).
    pub fn next_service(
        &mut self,
        topic: &str,
        querying_tenant: &str,
        now: u64,
        fabric: &FabricConfig,
        caller_zone_chain: &[String],
        reachable: impl Fn(&str) -> bool,
        authorized: impl Fn(&ServiceRegistration) -> bool,
    ) -> Option<String> {
        self.ensure_zones(topic, fabric);
        let entry = self.by_topic.get(topic)?;
        let zones = entry.zones.clone()?;
        let service_ids = entry.service_ids.clone();
        let cursors = entry.cursors.clone();

        let ordered_zones: Vec<String> = if caller_zone_chain.is_empty() {
            zones.keys().cloned().collect()
        } else {
            caller_zone_chain.to_vec()
        };

        for zone in ordered_zones {
            let Some(indices) = zones.get(&zone) else { continue };
            if indices.is_empty() {
                continue;
            }
            let cursor = *cursors.get(&zone).unwrap_or(&0);
            for step in 0..indices.len() {
                let pos = (cursor + step) % indices.len();
                let idx = indices[pos];
                let service_id = &service_ids[idx];
                let Some(reg) = self.by_id.get(service_id) else { continue };
                if reg.is_expired(now) {
                    continue;
                }
                if !visible_to_tenant(reg, &self.ops_tenant, querying_tenant) {
                    continue;
                }
                if !(reg.is_local(&self.local_broker_id) || reachable(&reg.registering_broker_id)) {
                    continue;
                }
                if !authorized(reg) {
                    continue;
                }
                let service_id = service_id.clone();
                self.by_topic.get_mut(topic).unwrap().cursors.insert(zone, (pos + 1) % indices.len());
                return Some(service_id);
            }
        }
        None
    }

    pub fn check_service_ttls(&mut self, now: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .by_id
            .iter()
            .filter(|(_, reg)| reg.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.unregister(id);
        }
        expired
    }

    pub fn local_service_count(&self) -> u32 {
        self.local_count
    }

    pub fn all_services(&self, querying_tenant: &str) -> Vec<&ServiceRegistration> {
        self.by_id
            .values()
            .filter(|reg| visible_to_tenant(reg, &self.ops_tenant, querying_tenant))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricConfigBuilder;

    fn registration(id: &str, topic: &str, broker: &str, tenant: &str) -> ServiceRegistration {
        ServiceRegistration {
            service_id: id.into(),
            service_type: "svc".into(),
            request_topics: [topic.to_string()].into_iter().collect(),
            registering_client_id: format!("client-{id}"),
            registering_client_instance_id: "inst-1".into(),
            registering_broker_id: broker.into(),
            registering_tenant_id: tenant.into(),
            target_tenant_ids: BTreeSet::new(),
            ttl_minutes: 60,
            registration_time: 0,
            metadata: BTreeMap::new(),
            cert_hashes: BTreeSet::new(),
            managed_client: false,
        }
    }

    #[test]
    fn round_robin_alternates_and_reselects_on_ttl_expiry() {
        let fabric = FabricConfigBuilder::new().build().unwrap();
        let mut reg = ServiceRegistry::new("local", "ops");
        let mut s1 = registration("s1", "t", "local", "T");
        s1.ttl_minutes = 1;
        reg.register(s1, 0);
        reg.register(registration("s2", "t", "local", "T"), 0);

        let pick1 = reg.next_service("t", "T", 0, &fabric, &[], |_| true, |_| true);
        let pick2 = reg.next_service("t", "T", 0, &fabric, &[], |_| true, |_| true);
        let pick3 = reg.next_service("t", "T", 0, &fabric, &[], |_| true, |_| true);
        assert_eq!(pick1.as_deref(), Some("s1"));
        assert_eq!(pick2.as_deref(), Some("s2"));
        assert_eq!(pick3.as_deref(), Some("s1"));

        // s1's TTL (1 min + grace) elapses; the third call should now skip it.
        let pick4 = reg.next_service("t", "T", 10_000, &fabric, &[], |_| true, |_| true);
        assert_eq!(pick4.as_deref(), Some("s2"));
    }

    #[test]
    fn ops_tenant_registration_visible_only_to_targets() {
        let mut svc = ServiceRegistry::new("local", "ops");
        let mut r = registration("s1", "t", "local", "ops");
        r.target_tenant_ids.insert("T1".to_string());
        svc.register(r, 0);
        assert!(svc.find_by_id("s1", "T1").is_some());
        assert!(svc.find_by_id("s1", "T2").is_none());
    }

    #[test]
    fn authenticated_unregister_requires_matching_client_and_tenant() {
        let mut svc = ServiceRegistry::new("local", "ops");
        svc.register(registration("s1", "t", "local", "T"), 0);
        assert!(svc.unregister_authenticated("s1", "wrong-client", "T").is_none());
        assert!(svc.unregister_authenticated("s1", "client-s1", "T").is_some());
    }

    #[test]
    fn event_to_request_mapping_tracked() {
        let mut svc = ServiceRegistry::new("local", "ops");
        let mut r = registration("s1", "t", "local", "T");
        r.metadata.insert(EVENT_TO_REQUEST_PREFIX_PROP.to_string(), "/req".to_string());
        r.metadata.insert(format!("{EVENT_TO_REQUEST_TOPIC_PROP}1"), "/event/a".to_string());
        svc.register(r, 0);
        assert!(svc.is_event_to_request_enabled());
        assert_eq!(svc.request_prefix_for_event("/event/a"), Some("/req"));
    }

    #[test]
    fn reregistration_from_same_broker_refreshes_ttl_in_place_without_duplicating() {
        let mut svc = ServiceRegistry::new("local", "ops");
        svc.register(registration("s1", "t", "broker-1", "T"), 0);
        let mut renewal = registration("s1", "t", "broker-1", "T");
        renewal.registration_time = 30;
        svc.register(renewal, 30);
        assert_eq!(svc.by_topic.get("t").unwrap().service_ids, vec!["s1".to_string()]);
        assert_eq!(svc.find_by_id("s1", "T").unwrap().registration_time, 30);
    }

    #[test]
    fn stale_update_from_a_farther_broker_is_ignored() {
        let mut svc = ServiceRegistry::new("local", "ops");
        let mut fresh = registration("s1", "t", "broker-near", "T");
        fresh.ttl_minutes = 60;
        fresh.registration_time = 100;
        svc.register(fresh, 100);

        // A different broker resends the same id with a much smaller
        // remaining TTL (it is relaying aged data); the nearer broker's
        // record must win.
        let mut stale = registration("s1", "t", "broker-far", "T");
        stale.ttl_minutes = 1;
        stale.registration_time = 100;
        svc.register(stale, 100);

        let stored = svc.find_by_id("s1", "T").unwrap();
        assert_eq!(stored.registering_broker_id, "broker-near");
    }

    #[test]
    fn update_with_different_identifying_fields_replaces_and_reindexes() {
        let mut svc = ServiceRegistry::new("local", "ops");
        svc.register(registration("s1", "old-topic", "local", "T"), 0);
        svc.register(registration("s1", "new-topic", "local", "T"), 0);
        assert!(svc.by_topic.get("old-topic").map(|t| t.service_ids.is_empty()).unwrap_or(true));
        assert_eq!(svc.by_topic.get("new-topic").unwrap().service_ids, vec!["s1".to_string()]);
        assert_eq!(svc.local_service_count(), 1);
    }
}
