//! Broker-to-broker control event builders (spec §4.M): constructs the
//! well-known topics and JSON payloads other brokers expect, given the
//! current state of the subsystems that own that data.

use serde::Serialize;
use serde_json::Value;

use crate::broker::{BrokerRecord, BrokerState};
use crate::revocation::RevocationStore;
use crate::service::ServiceRegistration;

pub mod topics {
    pub const BROKER_STATE: &str = "/mcafee/event/dxl/broker/state";
    pub const BROKER_TOPICS: &str = "/mcafee/event/dxl/broker/topics";
    pub const TOPIC_ADDED: &str = "/mcafee/event/dxl/broker/topicadded";
    pub const TOPIC_REMOVED: &str = "/mcafee/event/dxl/broker/topicremoved";
    pub const FABRIC_CHANGE: &str = "/mcafee/event/dxl/fabricchange";
    pub const SERVICE_REGISTER_EVENT: &str = "/mcafee/event/dxl/svcregistry/register";
    pub const SERVICE_UNREGISTER_EVENT: &str = "/mcafee/event/dxl/svcregistry/unregister";
    pub const SERVICE_REGISTER_REQUEST: &str = "/mcafee/request/dxl/svcregistry/register";
    pub const SERVICE_UNREGISTER_REQUEST: &str = "/mcafee/request/dxl/svcregistry/unregister";
    pub const TENANT_LIMIT_EXCEEDED: &str = "/mcafee/event/dxl/tenant/limit/exceeded";
    pub const TENANT_LIMIT_RESET: &str = "/mcafee/event/dxl/tenant/limit/reset";
    pub const REVOKED_LIST: &str = "/mcafee/event/dxl/certs/revokedlist";

    /// Always-route / queue-full-override prefixes (spec §4.J/§4.K): topics
    /// under these are never subject to topic-based bridge routing checks
    /// nor to the pre-insert-queue-full rejection.
    pub const BROKER_EVENT_PREFIX: &str = "/mcafee/event/dxl/broker";
    pub const BROKER_REQUEST_PREFIX: &str = "/mcafee/request/dxl/broker";
    pub const CLIENT_PREFIX: &str = "/mcafee/client/";

    pub fn broker_registry_query() -> &'static str {
        "/mcafee/request/dxl/brokerregistry/query"
    }
    pub fn service_registry_query() -> &'static str {
        "/mcafee/request/dxl/serviceregistry/query"
    }
    pub fn client_registry_query() -> &'static str {
        "/mcafee/request/dxl/clientregistry/query"
    }
    pub fn topic_registry_query() -> &'static str {
        "/mcafee/request/dxl/topicregistry/query"
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BrokerStatePayload<'a> {
    id: &'a str,
    hostname: &'a str,
    port: u32,
    ttl: u64,
    start_time: u64,
    broker_version: &'a str,
    topic_routing_enabled: bool,
}

pub fn build_broker_state_event(record: &BrokerRecord) -> Value {
    serde_json::to_value(BrokerStatePayload {
        id: &record.id,
        hostname: &record.hostname,
        port: record.port,
        ttl: record.ttl_seconds,
        start_time: record.start_time,
        broker_version: &record.broker_version,
        topic_routing_enabled: record.topic_routing_enabled,
    })
    .expect("broker state payload is always serializable")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BrokerTopicsPayload<'a> {
    broker_id: &'a str,
    topics: Vec<&'a str>,
    start: bool,
    end: bool,
}

/// One batch of the broker's full topic set. `start`/`end` mark the first
/// and last batch of a multi-part send, per the batched-update protocol.
pub fn build_broker_topics_event(broker_id: &str, state: &BrokerState, batch: &[String], start: bool, end: bool) -> Value {
    let _ = state;
    serde_json::to_value(BrokerTopicsPayload {
        broker_id,
        topics: batch.iter().map(String::as_str).collect(),
        start,
        end,
    })
    .expect("broker topics payload is always serializable")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TopicDeltaPayload<'a> {
    broker_id: &'a str,
    topic: &'a str,
}

pub fn build_topic_added_event(broker_id: &str, topic: &str) -> Value {
    serde_json::to_value(TopicDeltaPayload { broker_id, topic }).expect("topic delta payload is always serializable")
}

pub fn build_topic_removed_event(broker_id: &str, topic: &str) -> Value {
    serde_json::to_value(TopicDeltaPayload { broker_id, topic }).expect("topic delta payload is always serializable")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceRegisterPayload<'a> {
    service_id: &'a str,
    service_type: &'a str,
    request_topics: Vec<&'a str>,
    broker_guid: &'a str,
    client_guid: &'a str,
    tenant_guid: &'a str,
    ttl_mins: u32,
}

pub fn build_service_register_event(reg: &ServiceRegistration) -> Value {
    serde_json::to_value(ServiceRegisterPayload {
        service_id: &reg.service_id,
        service_type: &reg.service_type,
        request_topics: reg.request_topics.iter().map(String::as_str).collect(),
        broker_guid: &reg.registering_broker_id,
        client_guid: &reg.registering_client_id,
        tenant_guid: &reg.registering_tenant_id,
        ttl_mins: reg.ttl_minutes,
    })
    .expect("service register payload is always serializable")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceUnregisterPayload<'a> {
    service_id: &'a str,
    broker_guid: &'a str,
}

pub fn build_service_unregister_event(service_id: &str, broker_id: &str) -> Value {
    serde_json::to_value(ServiceUnregisterPayload {
        service_id,
        broker_guid: broker_id,
    })
    .expect("service unregister payload is always serializable")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TenantLimitPayload<'a> {
    tenant_id: &'a str,
}

pub fn build_tenant_limit_exceeded_event(tenant_id: &str) -> Value {
    serde_json::to_value(TenantLimitPayload { tenant_id }).expect("tenant limit payload is always serializable")
}

pub fn build_tenant_limit_reset_event(tenant_id: &str) -> Value {
    serde_json::to_value(TenantLimitPayload { tenant_id }).expect("tenant limit payload is always serializable")
}

#[derive(Debug, Serialize)]
struct RevokedListPayload {
    hashes: Vec<String>,
}

pub fn build_revoked_list_event(store: &RevocationStore, additions: &[String]) -> Value {
    let _ = store;
    serde_json::to_value(RevokedListPayload {
        hashes: additions.to_vec(),
    })
    .expect("revoked list payload is always serializable")
}

#[derive(Debug, Serialize)]
struct FabricChangePayload {
    reason: &'static str,
}

pub fn build_fabric_change_event() -> Value {
    serde_json::to_value(FabricChangePayload { reason: "configuration-reload" }).expect("fabric change payload is always serializable")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_state_event_carries_core_fields() {
        let record = BrokerRecord::new("b1");
        let value = build_broker_state_event(&record);
        assert_eq!(value["id"], "b1");
        assert_eq!(value["hostname"], "UNKNOWN");
    }

    #[test]
    fn topic_delta_events_name_broker_and_topic() {
        let added = build_topic_added_event("b1", "x/y");
        assert_eq!(added["brokerId"], "b1");
        assert_eq!(added["topic"], "x/y");
    }
}
