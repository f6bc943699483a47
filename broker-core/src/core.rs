//! The composing value (spec §9 "Singletons → explicit context"): every
//! subsystem in this crate as a field of one [`BrokerCore`], threaded
//! through the pipeline instead of reached via global statics.

use crate::authz::AuthorizationState;
use crate::broker::{BrokerRecord, BrokerRegistry};
use crate::configuration::FabricConfigurationService;
use crate::fabric::FabricConfigBuilder;
use crate::message::Message;
use crate::pipeline::{
    AuthorizationHandler, Dispatcher, HandlerOutcome, InsertDestination, InsertHandler, InsertOutcome, MessageContext, MessageRoutingHandler,
    NoDestinationFinalizeHandler, PublishAuthorizationHandler, PublishHandler,
};
use crate::revocation::RevocationStore;
use crate::service::ServiceRegistry;
use crate::tenant::TenantMetricsService;
use crate::time::{Clock, SystemClock};
use crate::topic_cache::TopicCacheService;

/// Tuning knobs that vary by deployment rather than by request; everything
/// else lives on the subsystems themselves.
pub struct BrokerCoreConfig {
    pub local_broker_id: String,
    pub ops_tenant_id: String,
    pub tenant_byte_limit: u64,
    pub tenant_connection_limit: u32,
    pub tenant_service_limit: u32,
    pub tenant_subscription_limit: u32,
}

/// Owns every subsystem this crate implements, composed as plain fields.
/// No subsystem reaches for global state; a host constructs exactly one of
/// these and threads `&mut` (or per-subsystem borrows) through handlers.
pub struct BrokerCore {
    pub registry: BrokerRegistry,
    pub fabric: FabricConfigurationService,
    pub services: ServiceRegistry,
    pub topic_cache: TopicCacheService,
    pub authorization: AuthorizationState,
    pub revocation: RevocationStore,
    pub tenants: TenantMetricsService,
    pub dispatcher: Dispatcher,
    pub clock: Box<dyn Clock + Send + Sync>,
}

impl BrokerCore {
    pub fn new(config: BrokerCoreConfig) -> Self {
        let empty_fabric = FabricConfigBuilder::new().build().expect("empty fabric config always builds");
        let mut registry = BrokerRegistry::new(&config.local_broker_id);
        registry.add_broker(BrokerRecord::new(config.local_broker_id.clone()), 0);
        BrokerCore {
            registry,
            fabric: FabricConfigurationService::new(empty_fabric),
            services: ServiceRegistry::new(config.local_broker_id.clone(), config.ops_tenant_id.clone()),
            topic_cache: TopicCacheService::new(config.local_broker_id.clone()),
            authorization: AuthorizationState::new(),
            revocation: RevocationStore::new(),
            tenants: TenantMetricsService::new(
                config.ops_tenant_id,
                config.tenant_byte_limit,
                config.tenant_connection_limit,
                config.tenant_service_limit,
                config.tenant_subscription_limit,
            ),
            dispatcher: {
                let mut dispatcher = Dispatcher::new();
                dispatcher.register_finalize_handler(Box::new(NoDestinationFinalizeHandler));
                dispatcher
            },
            clock: Box::new(SystemClock),
        }
    }

    /// Runs the periodic housekeeping shared across subsystems: broker TTL
    /// eviction, topic-cache enable/disable ticks, service TTL eviction,
    /// and revocation-store flush. Returns the revocation additions, if
    /// any, so the caller can push them to the transport's revocation view
    /// and emit the broker-to-broker revoked-list event.
    pub fn run_maintenance(&mut self) -> std::io::Result<Vec<String>> {
        let now = self.clock.now();
        let evicted = self.registry.run_maintenance(self.clock.as_ref());
        for id in &evicted {
            tracing::info!(broker_id = %id, "evicted broker after ttl + grace");
        }
        self.topic_cache.tick(now);
        let expired_services = self.services.check_service_ttls(now);
        for id in &expired_services {
            tracing::debug!(service_id = %id, "service ttl expired");
        }
        self.revocation.run_maintenance()
    }

    /// Runs the authorization handler (spec §4.K) ahead of the dispatcher's
    /// own publish-phase chain, for the same reason [`Self::dispatch_insert_for_destination`]
    /// runs message-routing itself: [`PublishAuthorizationHandler`] borrows
    /// `self.authorization`, which a `'static`-bounded handler registered on
    /// `Dispatcher` cannot hold.
    pub fn dispatch_publish(&mut self, ctx: &MessageContext, now: u64) -> HandlerOutcome {
        let inner = AuthorizationHandler {
            local_broker_id: self.registry.local_id().to_string(),
        };
        let handler = PublishAuthorizationHandler {
            inner: &inner,
            state: &self.authorization,
        };
        if handler.handle(ctx) == HandlerOutcome::Reject {
            return HandlerOutcome::Reject;
        }
        self.dispatcher.publish(ctx, now)
    }

    /// Runs the store phase, then the service-lookup handler (spec §4.K):
    /// for a parsed request with no destination already set, resolves the
    /// next service for its topic (zone-aware, via [`ServiceRegistry::next_service`])
    /// and rewrites the request's destination broker/client ids to target
    /// that service instance. Lives here rather than as a boxed
    /// [`crate::pipeline::StoreHandler`] because it needs `self.services` and
    /// `self.fabric` borrowed together with the dispatcher's in-flight
    /// context, which a `'static`-bounded handler registered on `Dispatcher`
    /// cannot hold (`Dispatcher` is a sibling field, not an owner, of those
    /// subsystems on `BrokerCore`).
    pub fn dispatch_store(&mut self, ctx: MessageContext, now: u64) -> u64 {
        let frame_id = self.dispatcher.store(ctx);
        self.resolve_service_for_request(frame_id, now);
        frame_id
    }

    fn resolve_service_for_request(&mut self, frame_id: u64, now: u64) {
        let (topic, querying_tenant) = {
            let Some(ctx) = self.dispatcher.context_mut(frame_id) else { return };
            if !ctx.is_insert_enabled() {
                return;
            }
            let Some(request) = ctx.get_dxl_request() else { return };
            if !request.destination_client_ids.is_empty() || !request.destination_broker_ids.is_empty() {
                return;
            }
            (ctx.topic.clone(), request.source_tenant_id.clone())
        };
        let local_broker_id = self.registry.local_id().to_string();
        let caller_zone_chain = self.fabric.current().service_zone_list(&local_broker_id);
        let registry = &self.registry;
        let service_id = self.services.next_service(
            &topic,
            &querying_tenant,
            now,
            self.fabric.current(),
            &caller_zone_chain,
            |broker_id| broker_id == local_broker_id.as_str() || registry.exists(broker_id),
            |_reg| true,
        );
        let Some(service_id) = service_id else {
            tracing::debug!(frame_id, topic = %topic, "no service found for request topic");
            return;
        };
        let Some(reg) = self.services.find_by_id(&service_id, &querying_tenant) else {
            return;
        };
        let target_broker = reg.registering_broker_id.clone();
        let target_client = reg.registering_client_id.clone();
        if let Some(ctx) = self.dispatcher.context_mut(frame_id) {
            if let Some(message) = ctx.parsed_mut() {
                message.add_destination_broker(target_broker);
                message.add_destination_client(target_client);
            }
        }
    }

    /// Runs the message-routing handler (spec §4.K) ahead of the
    /// dispatcher's own insert-phase chain: like [`Self::resolve_service_for_request`],
    /// it needs `self.registry` borrowed alongside the in-flight context, so
    /// it runs here rather than as a boxed [`crate::pipeline::InsertHandler`].
    /// Only once routing accepts the destination does the dispatcher's
    /// queue-full check, registered generic insert handlers, and
    /// destination-count/rate bookkeeping run.
    pub fn dispatch_insert_for_destination(
        &mut self,
        frame_id: u64,
        destination: &InsertDestination,
        destination_queue_full: bool,
        now: u64,
    ) -> (InsertOutcome, Option<Message>) {
        let routing = MessageRoutingHandler {
            local_broker_id: self.registry.local_id(),
            registry: &self.registry,
        };
        let passes_routing = match self.dispatcher.context_mut(frame_id) {
            Some(ctx) => routing.handle(ctx, destination),
            None => return (InsertOutcome::Rejected, None),
        };
        if !passes_routing {
            return (InsertOutcome::Rejected, None);
        }
        self.dispatcher.insert_for_destination(frame_id, destination, destination_queue_full, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BrokerCoreConfig {
        BrokerCoreConfig {
            local_broker_id: "local".into(),
            ops_tenant_id: "ops".into(),
            tenant_byte_limit: 1_000_000,
            tenant_connection_limit: 1000,
            tenant_service_limit: 1000,
            tenant_subscription_limit: 1000,
        }
    }

    #[test]
    fn new_core_has_only_the_local_broker_registered() {
        let core = BrokerCore::new(config());
        assert!(core.registry.exists("local"));
        assert_eq!(core.registry.local_id(), "local");
    }

    #[test]
    fn run_maintenance_does_not_panic_on_an_empty_core() {
        let mut core = BrokerCore::new(config());
        let additions = core.run_maintenance().unwrap();
        assert!(additions.is_empty());
    }

    fn registration(service_id: &str, topic: &str, broker: &str, tenant: &str) -> crate::service::ServiceRegistration {
        crate::service::ServiceRegistration {
            service_id: service_id.into(),
            service_type: "svc".into(),
            request_topics: [topic.to_string()].into_iter().collect(),
            registering_client_id: format!("client-{service_id}"),
            registering_client_instance_id: "inst-1".into(),
            registering_broker_id: broker.into(),
            registering_tenant_id: tenant.into(),
            target_tenant_ids: Default::default(),
            ttl_minutes: 60,
            registration_time: 0,
            metadata: Default::default(),
            cert_hashes: Default::default(),
            managed_client: false,
        }
    }

    #[test]
    fn dispatch_store_resolves_a_request_with_no_destination_to_the_registered_service() {
        let mut core = BrokerCore::new(config());
        core.services.register(registration("s1", "/svc/topic", "local", "ops"), 0);
        let mut ctx = MessageContext::new(1, "c1", false, "/svc/topic", vec![]);
        ctx.set_parsed(crate::message::Message::new(
            "msg-1",
            crate::message::KindFields::Request(crate::message::RequestFields::default()),
        ));
        let frame_id = core.dispatch_store(ctx, 0);
        let finalized = core.dispatcher.finalize(frame_id).unwrap();
        let message = finalized.parsed().unwrap();
        assert!(message.destination_client_ids.contains("client-s1"));
        assert!(message.destination_broker_ids.contains("local"));
    }

    #[test]
    fn dispatch_store_leaves_no_destination_when_no_service_is_registered() {
        let mut core = BrokerCore::new(config());
        let mut ctx = MessageContext::new(1, "c1", false, "/svc/topic", vec![]);
        ctx.set_parsed(crate::message::Message::new(
            "msg-1",
            crate::message::KindFields::Request(crate::message::RequestFields::default()),
        ));
        let frame_id = core.dispatch_store(ctx, 0);
        let finalized = core.dispatcher.finalize(frame_id).unwrap();
        assert!(finalized.is_service_not_found_enabled());
    }

    #[test]
    fn dispatch_insert_for_destination_rejects_a_destination_broker_id_not_listed() {
        let mut core = BrokerCore::new(config());
        let mut ctx = MessageContext::new(1, "c1", false, "x/y", vec![]);
        let mut message = crate::message::Message::new("msg-1", crate::message::KindFields::Event);
        message.add_destination_broker("some-other-broker");
        ctx.set_parsed(message);
        let frame_id = core.dispatch_store(ctx, 0);
        let destination = InsertDestination {
            client_id: "client-1",
            is_bridge: false,
            tenant_id: "",
        };
        let (outcome, _) = core.dispatch_insert_for_destination(frame_id, &destination, false, 0);
        assert_eq!(outcome, InsertOutcome::Rejected);
    }

    #[test]
    fn dispatch_publish_rejects_unauthorized_publishers() {
        let mut core = BrokerCore::new(config());
        let ctx = MessageContext::new(1, "c1", false, "x/y", vec![]);
        assert_eq!(core.dispatch_publish(&ctx, 0), HandlerOutcome::Reject);
        core.authorization.allow(crate::authz::Direction::Publish, "x/y", crate::authz::AuthKey::ClientId(ctx.canonical_source_id.clone()));
        assert_eq!(core.dispatch_publish(&ctx, 0), HandlerOutcome::Continue);
    }
}
