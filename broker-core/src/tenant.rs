//! Tenant metrics (spec §4.H): per-tenant byte/connection/service counters
//! with sticky "exceeded" flags, and per-client subscription counts against
//! a per-tenant limit. The broker's own tenant (the "ops tenant") is exempt
//! from every limit.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
struct ByteCounter {
    sent: u64,
    exceeded: bool,
}

#[derive(Debug, Clone, Default)]
struct TenantCounts {
    bytes: ByteCounter,
    connections: u32,
    services: u32,
}

pub struct TenantMetricsService {
    ops_tenant: String,
    byte_limit: u64,
    connection_limit: u32,
    service_limit: u32,
    subscription_limit: u32,
    counts: BTreeMap<String, TenantCounts>,
    subscriptions_by_client: BTreeMap<String, u32>,
    client_tenant: BTreeMap<String, String>,
}

/// Returned when a limit transitions from below to above threshold, so the
/// caller can emit the corresponding broker-to-broker limit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitTransition {
    None,
    JustExceeded,
}

impl TenantMetricsService {
    pub fn new(ops_tenant: impl Into<String>, byte_limit: u64, connection_limit: u32, service_limit: u32, subscription_limit: u32) -> Self {
        TenantMetricsService {
            ops_tenant: ops_tenant.into(),
            byte_limit,
            connection_limit,
            service_limit,
            subscription_limit,
            counts: BTreeMap::new(),
            subscriptions_by_client: BTreeMap::new(),
            client_tenant: BTreeMap::new(),
        }
    }

    fn is_ops(&self, tenant: &str) -> bool {
        tenant == self.ops_tenant
    }

    /// Adds `bytes` to the tenant's running total. Returns whether the
    /// tenant remains under (or at) its limit, and the observed limit
    /// transition. Ops tenants are always reported allowed / no transition.
    pub fn update_sent_byte_count(&mut self, tenant: &str, bytes: u64) -> (bool, LimitTransition) {
        if self.is_ops(tenant) {
            return (true, LimitTransition::None);
        }
        let entry = self.counts.entry(tenant.to_string()).or_default();
        let was_exceeded = entry.bytes.exceeded;
        entry.bytes.sent += bytes;
        let now_exceeded = entry.bytes.sent > self.byte_limit;
        entry.bytes.exceeded = now_exceeded;
        let transition = if !was_exceeded && now_exceeded {
            LimitTransition::JustExceeded
        } else {
            LimitTransition::None
        };
        (!now_exceeded, transition)
    }

    pub fn mark_exceeds_byte(&mut self, tenant: &str) {
        self.counts.entry(tenant.to_string()).or_default().bytes.exceeded = true;
    }

    pub fn reset_byte_counts(&mut self, tenant: &str) {
        if let Some(entry) = self.counts.get_mut(tenant) {
            entry.bytes = ByteCounter::default();
        }
    }

    pub fn update_connection_count(&mut self, tenant: &str, delta: i32) {
        let entry = self.counts.entry(tenant.to_string()).or_default();
        entry.connections = (entry.connections as i64 + delta as i64).max(0) as u32;
    }

    pub fn is_connection_allowed(&self, tenant: &str) -> bool {
        if self.is_ops(tenant) {
            return true;
        }
        self.counts.get(tenant).map(|c| c.connections).unwrap_or(0) < self.connection_limit
    }

    pub fn update_service_count(&mut self, tenant: &str, delta: i32) {
        let entry = self.counts.entry(tenant.to_string()).or_default();
        entry.services = (entry.services as i64 + delta as i64).max(0) as u32;
    }

    pub fn is_service_registration_allowed(&self, tenant: &str) -> bool {
        if self.is_ops(tenant) {
            return true;
        }
        self.counts.get(tenant).map(|c| c.services).unwrap_or(0) < self.service_limit
    }

    /// Subscription counts are tracked per client, but enforced against the
    /// client's tenant limit: a new client cannot subscribe once the
    /// tenant's total is already at or above the limit, regardless of how
    /// few subscriptions that particular client holds.
    pub fn is_subscription_allowed(&self, tenant: &str, _client_id: &str) -> bool {
        if self.is_ops(tenant) {
            return true;
        }
        let total: u32 = self
            .subscriptions_by_client
            .iter()
            .filter(|(cid, _)| self.client_tenant.get(cid.as_str()).map(String::as_str) == Some(tenant))
            .map(|(_, count)| *count)
            .sum();
        total < self.subscription_limit
    }

    pub fn record_subscription(&mut self, tenant: &str, client_id: &str) {
        self.client_tenant.insert(client_id.to_string(), tenant.to_string());
        *self.subscriptions_by_client.entry(client_id.to_string()).or_insert(0) += 1;
    }

    pub fn unregister_client(&mut self, client_id: &str) {
        self.subscriptions_by_client.remove(client_id);
        self.client_tenant.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_limit_transition_then_reset() {
        let mut svc = TenantMetricsService::new("ops", 100, 10, 10, 10);
        let (allowed, transition) = svc.update_sent_byte_count("T", 60);
        assert!(allowed);
        assert_eq!(transition, LimitTransition::None);
        let (allowed, transition) = svc.update_sent_byte_count("T", 60);
        assert!(!allowed);
        assert_eq!(transition, LimitTransition::JustExceeded);
        svc.reset_byte_counts("T");
        let (allowed, transition) = svc.update_sent_byte_count("T", 60);
        assert!(allowed);
        assert_eq!(transition, LimitTransition::None);
    }

    #[test]
    fn ops_tenant_exempt_from_byte_limit() {
        let mut svc = TenantMetricsService::new("ops", 10, 10, 10, 10);
        let (allowed, transition) = svc.update_sent_byte_count("ops", 1000);
        assert!(allowed);
        assert_eq!(transition, LimitTransition::None);
    }

    #[test]
    fn connection_count_never_negative() {
        let mut svc = TenantMetricsService::new("ops", 10, 10, 10, 10);
        svc.update_connection_count("T", -5);
        assert!(svc.is_connection_allowed("T"));
        svc.update_connection_count("T", 1);
        assert!(svc.is_connection_allowed("T"));
    }

    #[test]
    fn service_limit_enforced_for_regular_tenant() {
        let mut svc = TenantMetricsService::new("ops", 10, 10, 1, 10);
        assert!(svc.is_service_registration_allowed("T"));
        svc.update_service_count("T", 1);
        assert!(!svc.is_service_registration_allowed("T"));
    }

    #[test]
    fn subscription_limit_enforced_across_clients_of_the_same_tenant() {
        let mut svc = TenantMetricsService::new("ops", 10, 10, 10, 2);
        svc.record_subscription("T", "client-a");
        svc.record_subscription("T", "client-a");
        assert!(!svc.is_subscription_allowed("T", "client-a"));
        // A brand-new client of the same over-limit tenant must not be
        // allowed to subscribe just because it personally holds zero
        // subscriptions yet.
        assert!(!svc.is_subscription_allowed("T", "client-b"));
    }

    #[test]
    fn subscription_limit_is_per_tenant_not_global() {
        let mut svc = TenantMetricsService::new("ops", 10, 10, 10, 1);
        svc.record_subscription("T1", "client-a");
        assert!(!svc.is_subscription_allowed("T1", "client-a"));
        assert!(svc.is_subscription_allowed("T2", "client-b"));
    }

    #[test]
    fn ops_tenant_exempt_from_subscription_limit() {
        let mut svc = TenantMetricsService::new("ops", 10, 10, 10, 1);
        svc.record_subscription("ops", "client-a");
        svc.record_subscription("ops", "client-a");
        assert!(svc.is_subscription_allowed("ops", "client-a"));
    }
}
