//! Bridge configuration factory (spec §4.L): given a fabric configuration
//! and the local broker id, produces the ordered list of bridge candidates.

use crate::fabric::FabricConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeCandidate {
    pub broker_id: String,
    pub host: String,
    pub port: u32,
    /// True when `host` is an IP-address variant of a candidate that was
    /// also added by hostname; IP variants are tried as a fallback for the
    /// same logical peer, never round-robined independently.
    pub is_ip_variant: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfiguration {
    pub candidates: Vec<BridgeCandidate>,
    /// False whenever a primary-hub-member variant was prioritized onto the
    /// front of the list; true when every candidate is an equally-weighted
    /// parent option worth round-robining across.
    pub is_round_robin: bool,
    pub initial_index: usize,
}

/// Builds the bridge candidate list for `local_broker_id` within `fabric`.
/// `index_seed` selects the starting offset into the round-robin candidates
/// (spec: "an initial index is randomized... to balance across instances");
/// callers derive it however they see fit (e.g. from wall-clock jitter) —
/// this function stays deterministic given its inputs.
pub fn build_bridge_configuration(fabric: &FabricConfig, local_broker_id: &str, index_seed: u64) -> BridgeConfiguration {
    let mut candidates = Vec::new();
    let mut prioritized = false;

    if let Some(hub) = fabric.hub_for_broker(local_broker_id) {
        if hub.secondary_broker == local_broker_id {
            if let Some(primary) = fabric.broker_node(&hub.primary_broker) {
                push_host_and_ip(&mut candidates, &hub.primary_broker, primary);
                prioritized = true;
            }
        }
    }

    match fabric.parent_id_of(local_broker_id) {
        Some(parent_id) => {
            if let Some(parent_broker) = fabric.broker_node(parent_id) {
                push_host_and_ip(&mut candidates, parent_id, parent_broker);
            } else if let Some(parent_hub) = fabric.hub_node(parent_id) {
                let mut members = [&parent_hub.primary_broker, &parent_hub.secondary_broker];
                members.sort();
                for member_id in members {
                    if let Some(member) = fabric.broker_node(member_id) {
                        push_host_and_ip(&mut candidates, member_id, member);
                    }
                }
            }
        }
        None => {}
    }

    let is_round_robin = !prioritized;
    let round_robin_len = candidates.len().max(1);
    let initial_index = if is_round_robin {
        (index_seed % round_robin_len as u64) as usize
    } else {
        0
    };

    BridgeConfiguration {
        candidates,
        is_round_robin,
        initial_index,
    }
}

fn push_host_and_ip(candidates: &mut Vec<BridgeCandidate>, broker_id: &str, broker: &crate::fabric::BrokerNode) {
    candidates.push(BridgeCandidate {
        broker_id: broker_id.to_string(),
        host: broker.hostname.clone(),
        port: broker.port,
        is_ip_variant: false,
    });
    if let Some(ip) = &broker.ip_address {
        candidates.push(BridgeCandidate {
            broker_id: broker_id.to_string(),
            host: ip.clone(),
            port: broker.port,
            is_ip_variant: true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{BrokerNode, FabricConfigBuilder, HubNode};

    fn broker_with_ip(id: &str, parent: Option<&str>, ip: Option<&str>) -> BrokerNode {
        BrokerNode {
            id: id.into(),
            hostname: format!("{id}.example"),
            port: 8883,
            ip_address: ip.map(String::from),
            service_zone: None,
            parent_id: parent.map(String::from),
        }
    }

    #[test]
    fn secondary_hub_member_prioritizes_primary() {
        let fabric = FabricConfigBuilder::new()
            .broker(broker_with_ip("root", None, None))
            .hub(HubNode {
                id: "h1".into(),
                primary_broker: "p".into(),
                secondary_broker: "s".into(),
                service_zone: None,
                parent_id: Some("root".into()),
            })
            .broker(broker_with_ip("p", None, Some("10.0.0.1")))
            .build()
            .unwrap();

        let config = build_bridge_configuration(&fabric, "s", 0);
        assert!(!config.is_round_robin);
        assert_eq!(config.candidates[0].broker_id, "p");
        assert_eq!(config.candidates[0].host, "p.example");
        assert_eq!(config.candidates[1].host, "10.0.0.1");
        assert!(config.candidates[1].is_ip_variant);
    }

    #[test]
    fn broker_parent_is_round_robin_candidate() {
        let fabric = FabricConfigBuilder::new()
            .broker(broker_with_ip("root", None, None))
            .broker(broker_with_ip("leaf", Some("root"), None))
            .build()
            .unwrap();
        let config = build_bridge_configuration(&fabric, "leaf", 5);
        assert!(config.is_round_robin);
        assert_eq!(config.candidates.len(), 1);
        assert_eq!(config.initial_index, 0);
    }

    #[test]
    fn hub_parent_orders_members_lexicographically() {
        let fabric = FabricConfigBuilder::new()
            .hub(HubNode {
                id: "h1".into(),
                primary_broker: "zeta".into(),
                secondary_broker: "alpha".into(),
                service_zone: None,
                parent_id: None,
            })
            .broker(broker_with_ip("zeta", None, None))
            .broker(broker_with_ip("alpha", None, None))
            .broker(broker_with_ip("leaf", Some("h1"), None))
            .build()
            .unwrap();
        let config = build_bridge_configuration(&fabric, "leaf", 0);
        assert_eq!(config.candidates[0].broker_id, "alpha");
        assert_eq!(config.candidates[1].broker_id, "zeta");
    }

    #[test]
    fn no_parent_yields_empty_round_robin_candidates() {
        let fabric = FabricConfigBuilder::new().broker(broker_with_ip("root", None, None)).build().unwrap();
        let config = build_bridge_configuration(&fabric, "root", 7);
        assert!(config.candidates.is_empty());
        assert!(config.is_round_robin);
        assert_eq!(config.initial_index, 0);
    }
}
