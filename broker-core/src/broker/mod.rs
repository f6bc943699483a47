//! Broker registry (spec §4.B): the adjacency graph of brokers, their
//! current topic subscriptions, and a shortest-path routing cache.

mod registry;
mod state;

pub use registry::{BrokerRegistry, FabricVisitor, RoutingCache};
pub use state::{BrokerRecord, BrokerState, LocalBrokerProperties, PeerRole};
