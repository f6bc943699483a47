//! Message context and pipeline dispatcher (spec §4.I / §4.J / §4.K): the
//! four-stage publish → store → insert-per-destination → finalize flow that
//! threads a frame through every other subsystem in this crate.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::authz::{AuthKey, AuthorizationState, Direction};
use crate::broker::BrokerRegistry;
use crate::error::reply_codes;
use crate::events::topics;
use crate::message::{ErrorFields, KindFields, Message, MessageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Publish,
    Store,
    InsertPerDestination,
    Finalize,
}

/// Result of a publish-phase or store-phase handler: whether the frame may
/// continue, and (for store) whether insert should proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Continue,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContextFlags(u8);

impl ContextFlags {
    const LOCAL: u8 = 1 << 0;
    const OPS: u8 = 1 << 1;
    const INSERT_ENABLED: u8 = 1 << 2;
    const SERVICE_NOT_FOUND_ENABLED: u8 = 1 << 3;
    const CLIENT_SPECIFIC_PAYLOAD_GENERATED: u8 = 1 << 4;
    const OVERLOADED: u8 = 1 << 5;

    fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// Per-frame bookkeeping, allocated at store-phase entry and freed after
/// finalize. Flags are readable/writable by any handler in any later
/// phase (spec §4.I).
pub struct MessageContext {
    pub frame_id: u64,
    pub source_client_id: String,
    pub canonical_source_id: String,
    pub is_source_bridge: bool,
    pub topic: String,
    pub raw_payload: Vec<u8>,
    parsed: Option<Message>,
    flags: ContextFlags,
    pub destination_count: u32,
}

impl MessageContext {
    pub fn new(frame_id: u64, source_client_id: impl Into<String>, is_source_bridge: bool, topic: impl Into<String>, raw_payload: Vec<u8>) -> Self {
        let source_client_id = source_client_id.into();
        MessageContext {
            frame_id,
            canonical_source_id: source_client_id.clone(),
            source_client_id,
            is_source_bridge,
            topic: topic.into(),
            raw_payload,
            parsed: None,
            flags: ContextFlags(ContextFlags::INSERT_ENABLED),
            destination_count: 0,
        }
    }

    pub fn is_dxl_message(&self) -> bool {
        self.parsed.is_some()
    }

    pub fn parsed(&self) -> Option<&Message> {
        self.parsed.as_ref()
    }

    pub fn parsed_mut(&mut self) -> Option<&mut Message> {
        self.parsed.as_mut()
    }

    pub fn set_parsed(&mut self, message: Message) {
        self.parsed = Some(message);
    }

    pub fn get_dxl_event(&self) -> Option<&Message> {
        self.parsed.as_ref().filter(|m| m.kind() == MessageKind::Event)
    }

    pub fn get_dxl_request(&self) -> Option<&Message> {
        self.parsed.as_ref().filter(|m| m.kind() == MessageKind::Request)
    }

    pub fn is_local(&self) -> bool {
        self.flags.contains(ContextFlags::LOCAL)
    }

    pub fn set_local(&mut self, value: bool) {
        self.flags.set(ContextFlags::LOCAL, value);
    }

    pub fn is_ops(&self) -> bool {
        self.flags.contains(ContextFlags::OPS)
    }

    pub fn set_ops(&mut self, value: bool) {
        self.flags.set(ContextFlags::OPS, value);
    }

    pub fn is_insert_enabled(&self) -> bool {
        self.flags.contains(ContextFlags::INSERT_ENABLED)
    }

    pub fn disable_insert(&mut self) {
        self.flags.remove(ContextFlags::INSERT_ENABLED);
    }

    pub fn is_service_not_found_enabled(&self) -> bool {
        self.flags.contains(ContextFlags::SERVICE_NOT_FOUND_ENABLED)
    }

    pub fn enable_service_not_found(&mut self) {
        self.flags.insert(ContextFlags::SERVICE_NOT_FOUND_ENABLED);
    }

    pub fn client_specific_payload_generated(&self) -> bool {
        self.flags.contains(ContextFlags::CLIENT_SPECIFIC_PAYLOAD_GENERATED)
    }

    pub fn mark_client_specific_payload_generated(&mut self) {
        self.flags.insert(ContextFlags::CLIENT_SPECIFIC_PAYLOAD_GENERATED);
    }

    /// Set once a destination's queue was found full during insert (spec
    /// §4.J): the no-destination finalize handler checks this so it does
    /// not also emit service-not-found for a request that already got a
    /// service-overloaded reply.
    pub fn is_overloaded(&self) -> bool {
        self.flags.contains(ContextFlags::OVERLOADED)
    }

    fn mark_overloaded(&mut self) {
        self.flags.insert(ContextFlags::OVERLOADED);
    }
}

pub trait PublishHandler: Send + Sync {
    fn handle(&self, ctx: &MessageContext) -> HandlerOutcome;
}

pub trait StoreHandler: Send + Sync {
    /// Whether this handler only fires when the source is a bridge
    /// connection (spec: `requires-bridge-source`).
    fn requires_bridge_source(&self) -> bool {
        false
    }
    fn handle(&self, ctx: &mut MessageContext) -> bool;
}

/// One candidate recipient for the insert phase (spec §4.J/§4.K): the
/// transport supplies what it already knows about the connection the
/// message is about to be enqueued to.
pub struct InsertDestination<'a> {
    pub client_id: &'a str,
    pub is_bridge: bool,
    pub tenant_id: &'a str,
}

pub trait InsertHandler: Send + Sync {
    fn handle(&self, ctx: &mut MessageContext, destination: &InsertDestination) -> bool;
}

pub trait FinalizeHandler: Send + Sync {
    fn handle(&self, ctx: &mut MessageContext);
}

/// Outcome of [`Dispatcher::insert_for_destination`]: whether the recipient
/// was accepted, rejected by a handler, or rejected because its transport
/// queue was full (spec §4.J pre-insert-queue-full callback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Delivered,
    Rejected,
    Overloaded,
}

/// Authorization handler (spec §4.K): delegates to [`AuthorizationState`],
/// swapping the lookup key to the local broker id when the context's LOCAL
/// flag is set so broker-to-broker traffic is keyed by broker id.
pub struct AuthorizationHandler {
    pub local_broker_id: String,
}

impl AuthorizationHandler {
    fn key_for(&self, ctx: &MessageContext) -> AuthKey {
        if ctx.is_local() {
            AuthKey::ClientId(self.local_broker_id.clone())
        } else {
            AuthKey::ClientId(ctx.canonical_source_id.clone())
        }
    }
}

pub struct PublishAuthorizationHandler<'a> {
    pub inner: &'a AuthorizationHandler,
    pub state: &'a AuthorizationState,
}

impl PublishHandler for PublishAuthorizationHandler<'_> {
    fn handle(&self, ctx: &MessageContext) -> HandlerOutcome {
        let key = self.inner.key_for(ctx);
        if self.state.is_authorized(Direction::Publish, &key, &ctx.topic) {
            HandlerOutcome::Continue
        } else {
            HandlerOutcome::Reject
        }
    }
}

/// No-destination finalize handler for requests (spec §4.J): if a parsed
/// request still has insert enabled but nothing was delivered, synthesize
/// a service-not-found error reply. Does not fire if the reason for zero
/// destinations was a full queue — that request already got a
/// service-overloaded reply from `insert_for_destination`.
pub struct NoDestinationFinalizeHandler;

impl FinalizeHandler for NoDestinationFinalizeHandler {
    fn handle(&self, ctx: &mut MessageContext) {
        let is_request = matches!(ctx.parsed(), Some(m) if m.kind() == MessageKind::Request);
        if is_request && ctx.is_insert_enabled() && ctx.destination_count == 0 && !ctx.is_overloaded() {
            ctx.enable_service_not_found();
            debug!(frame_id = ctx.frame_id, "request had no destination, service-not-found pending");
        }
    }
}

/// Message-routing insert handler (spec §4.K): decides, per candidate
/// recipient, whether this frame should actually be delivered there.
/// Grounded on `MessageRoutingHandler::onInsertMessage` (opendxl-broker):
/// non-DXL frames and destinations are always passed through (multi-tenant
/// rejection only applies to recognized messages); for a bridge
/// destination, an explicit `destination_broker_ids` set gates membership
/// directly, otherwise topic-based routing decides unless the topic is
/// one of the always-route prefixes; for a client destination,
/// destination-broker and destination-client filtering apply, with the
/// LOCAL context flag additionally accepting a match on the local broker
/// id; finally, cross-tenant delivery is gated unless the source is ops,
/// the target tenant is explicitly listed, or source and target tenants
/// match.
pub struct MessageRoutingHandler<'a> {
    pub local_broker_id: &'a str,
    pub registry: &'a BrokerRegistry,
}

impl InsertHandler for MessageRoutingHandler<'_> {
    fn handle(&self, ctx: &mut MessageContext, destination: &InsertDestination) -> bool {
        let Some(message) = ctx.parsed() else {
            return true;
        };

        if !message.destination_broker_ids.is_empty() && !message.destination_broker_ids.contains(self.local_broker_id) {
            return false;
        }

        if destination.is_bridge {
            if !message.destination_broker_ids.is_empty() {
                if !message.destination_broker_ids.contains(destination.client_id) {
                    return false;
                }
            } else if ctx.topic.starts_with(topics::CLIENT_PREFIX) || ctx.topic.starts_with(topics::BROKER_EVENT_PREFIX) {
                // always-route prefixes bypass topic-based routing entirely
            } else if message.kind() == MessageKind::Event && !self.registry.is_subscriber_in_hierarchy(self.local_broker_id, destination.client_id, &ctx.topic) {
                return false;
            }
        } else if !message.destination_client_ids.is_empty()
            && !message.destination_client_ids.contains(destination.client_id)
            && !(ctx.is_local() && message.destination_client_ids.contains(self.local_broker_id))
        {
            return false;
        }

        if !message.destination_tenant_ids.is_empty() {
            if !message.destination_tenant_ids.contains(destination.tenant_id) {
                return false;
            }
        } else if !ctx.is_ops() && message.source_tenant_id != destination.tenant_id {
            return false;
        }

        true
    }
}

/// Ordered handler registrations for one phase: all global handlers, plus
/// per-topic handlers that additionally fire for an exact topic match.
struct PhaseHandlers<H: ?Sized> {
    global: Vec<Box<H>>,
}

impl<H: ?Sized> Default for PhaseHandlers<H> {
    fn default() -> Self {
        PhaseHandlers { global: Vec::new() }
    }
}

/// A sampled rate counter, reset on a fixed window (spec §4.J "sampled
/// publish-rate and destination-rate counters, reset on a configurable
/// window"): counts events in the current window and, once the window
/// elapses, freezes the completed window's rate (events/second) as the
/// last-sampled value before starting a fresh window.
struct RateCounter {
    window_seconds: u64,
    window_start: u64,
    count_in_window: u64,
    last_sampled_rate: f64,
}

impl RateCounter {
    fn new(window_seconds: u64) -> Self {
        RateCounter {
            window_seconds: window_seconds.max(1),
            window_start: 0,
            count_in_window: 0,
            last_sampled_rate: 0.0,
        }
    }

    fn record(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.window_start);
        if elapsed >= self.window_seconds {
            self.last_sampled_rate = self.count_in_window as f64 / self.window_seconds as f64;
            self.window_start = now;
            self.count_in_window = 0;
        }
        self.count_in_window += 1;
    }

    fn sampled_rate(&self) -> f64 {
        self.last_sampled_rate
    }
}

/// The pipeline dispatcher (spec §4.J). Handler registration is explicit
/// and owned by one [`Dispatcher`] value rather than a process-wide
/// singleton (spec §9 "Singletons → explicit context").
pub struct Dispatcher {
    publish_handlers: PhaseHandlers<dyn PublishHandler>,
    store_handlers: PhaseHandlers<dyn StoreHandler>,
    insert_handlers: PhaseHandlers<dyn InsertHandler>,
    finalize_handlers: PhaseHandlers<dyn FinalizeHandler>,
    topic_store_handlers: BTreeMap<String, Box<dyn StoreHandler>>,
    topic_publish_handlers: BTreeMap<String, Box<dyn PublishHandler>>,
    in_flight: BTreeMap<u64, MessageContext>,
    publish_rate: RateCounter,
    destination_rate: RateCounter,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_RATE_WINDOW_SECONDS: u64 = 60;

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_rate_window(DEFAULT_RATE_WINDOW_SECONDS)
    }

    /// As [`Dispatcher::new`], but with an explicit publish/destination
    /// rate-counter window instead of the default 60-second one.
    pub fn with_rate_window(window_seconds: u64) -> Self {
        Dispatcher {
            publish_handlers: PhaseHandlers::default(),
            store_handlers: PhaseHandlers::default(),
            insert_handlers: PhaseHandlers::default(),
            finalize_handlers: PhaseHandlers::default(),
            topic_store_handlers: BTreeMap::new(),
            topic_publish_handlers: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            publish_rate: RateCounter::new(window_seconds),
            destination_rate: RateCounter::new(window_seconds),
        }
    }

    pub fn register_publish_handler(&mut self, handler: Box<dyn PublishHandler>) {
        self.publish_handlers.global.push(handler);
    }

    pub fn register_topic_publish_handler(&mut self, topic: impl Into<String>, handler: Box<dyn PublishHandler>) {
        self.topic_publish_handlers.insert(topic.into(), handler);
    }

    pub fn register_store_handler(&mut self, handler: Box<dyn StoreHandler>) {
        self.store_handlers.global.push(handler);
    }

    pub fn register_topic_store_handler(&mut self, topic: impl Into<String>, handler: Box<dyn StoreHandler>) {
        self.topic_store_handlers.insert(topic.into(), handler);
    }

    pub fn register_insert_handler(&mut self, handler: Box<dyn InsertHandler>) {
        self.insert_handlers.global.push(handler);
    }

    pub fn register_finalize_handler(&mut self, handler: Box<dyn FinalizeHandler>) {
        self.finalize_handlers.global.push(handler);
    }

    /// Runs the publish phase: all global publish handlers, then any
    /// handler registered for this exact topic (spec §4.J "publish: all
    /// global publish handlers, then any topic-specific handler for the
    /// exact topic"). Samples the publish-rate counter for `now`.
    pub fn publish(&mut self, ctx: &MessageContext, now: u64) -> HandlerOutcome {
        self.publish_rate.record(now);
        for handler in &self.publish_handlers.global {
            if handler.handle(ctx) == HandlerOutcome::Reject {
                return HandlerOutcome::Reject;
            }
        }
        if let Some(handler) = self.topic_publish_handlers.get(&ctx.topic) {
            if handler.handle(ctx) == HandlerOutcome::Reject {
                return HandlerOutcome::Reject;
            }
        }
        HandlerOutcome::Continue
    }

    pub fn publish_rate(&self) -> f64 {
        self.publish_rate.sampled_rate()
    }

    pub fn destination_rate(&self) -> f64 {
        self.destination_rate.sampled_rate()
    }

    /// Runs the store phase for a newly-allocated context, inserting it
    /// into the in-flight table. Store handlers that fail are logged and
    /// continue (spec: exceptions in store are caught per-handler); a
    /// handler returning `false` disables insert but does not abort. If
    /// any handler left the parsed message dirty, it is re-serialized and
    /// the new payload replaces `raw_payload` before the transport ever
    /// sees it (spec §4.J "if dirty after store, the dispatcher
    /// re-serializes and returns the new payload to the transport").
    pub fn store(&mut self, mut ctx: MessageContext) -> u64 {
        let frame_id = ctx.frame_id;
        for handler in &self.store_handlers.global {
            if handler.requires_bridge_source() && !ctx.is_source_bridge {
                debug!(frame_id, "store handler requires bridge source, disabling insert");
                ctx.disable_insert();
                continue;
            }
            if !handler.handle(&mut ctx) {
                ctx.disable_insert();
            }
        }
        if let Some(topic_handler) = self.topic_store_handlers.get(&ctx.topic) {
            if !topic_handler.requires_bridge_source() || ctx.is_source_bridge {
                if !topic_handler.handle(&mut ctx) {
                    ctx.disable_insert();
                }
            } else {
                ctx.disable_insert();
            }
        }
        if matches!(ctx.parsed(), Some(m) if m.is_dirty()) {
            let reencoded = crate::codec::encode(ctx.parsed().expect("checked above"));
            ctx.raw_payload = reencoded;
            ctx.parsed_mut().expect("checked above").clear_dirty();
        }
        self.in_flight.insert(frame_id, ctx);
        frame_id
    }

    /// Runs insert-phase handlers for one candidate recipient (spec §4.J).
    /// Before the handler chain, a full destination queue is checked: the
    /// pre-insert-queue-full callback lets bridge destinations, non-DXL
    /// messages, and broker-event/broker-request/client-prefixed topics
    /// through regardless; any other request instead gets a
    /// service-overloaded reply synthesized and the insert rejected (and
    /// the context's OVERLOADED flag set, so the no-destination finalize
    /// handler does not also fire). Accepted destinations increment the
    /// context's count and sample the destination-rate counter.
    pub fn insert_for_destination(&mut self, frame_id: u64, destination: &InsertDestination, destination_queue_full: bool, now: u64) -> (InsertOutcome, Option<Message>) {
        let Some(ctx) = self.in_flight.get_mut(&frame_id) else {
            warn!(frame_id, "insert phase ran with no in-flight context");
            return (InsertOutcome::Rejected, None);
        };
        if destination_queue_full && !Self::queue_full_override(ctx, destination) {
            ctx.mark_overloaded();
            let reply = ctx.get_dxl_request().map(service_overloaded_reply);
            debug!(frame_id, dest = destination.client_id, "destination queue full, rejecting insert");
            return (InsertOutcome::Overloaded, reply);
        }
        for handler in &self.insert_handlers.global {
            if !handler.handle(ctx, destination) {
                return (InsertOutcome::Rejected, None);
            }
        }
        ctx.destination_count += 1;
        self.destination_rate.record(now);
        (InsertOutcome::Delivered, None)
    }

    fn queue_full_override(ctx: &MessageContext, destination: &InsertDestination) -> bool {
        destination.is_bridge
            || !ctx.is_dxl_message()
            || ctx.topic.starts_with(topics::BROKER_EVENT_PREFIX)
            || ctx.topic.starts_with(topics::BROKER_REQUEST_PREFIX)
            || ctx.topic.starts_with(topics::CLIENT_PREFIX)
    }

    /// Runs finalize handlers and frees the context.
    pub fn finalize(&mut self, frame_id: u64) -> Option<MessageContext> {
        let mut ctx = self.in_flight.remove(&frame_id)?;
        for handler in &self.finalize_handlers.global {
            handler.handle(&mut ctx);
        }
        Some(ctx)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Grants a handler constructed with cross-subsystem borrows (e.g.
    /// [`MessageRoutingHandler`]) one-shot access to an in-flight context,
    /// without requiring it be boxed into the dispatcher's handler lists
    /// (those require `'static` and this crate's subsystems are sibling
    /// fields on `BrokerCore`, not owned by the dispatcher).
    pub fn context_mut(&mut self, frame_id: u64) -> Option<&mut MessageContext> {
        self.in_flight.get_mut(&frame_id)
    }
}

/// Service-overloaded / service-not-found replies synthesized by the
/// dispatcher rather than surfaced from internal bookkeeping errors
/// (spec §6).
fn error_reply(request: &Message, code: &str) -> Message {
    let mut reply = Message::new(
        format!("{}-error", request.message_id),
        KindFields::Error(ErrorFields {
            code: code.to_string(),
            error_message: String::new(),
        }),
    );
    reply.source_broker_id = request.source_broker_id.clone();
    reply.add_destination_client(request.source_client_id.clone());
    reply
}

pub fn service_not_found_reply(request: &Message) -> Message {
    error_reply(request, reply_codes::SERVICE_UNAVAILABLE)
}

pub fn service_overloaded_reply(request: &Message) -> Message {
    error_reply(request, reply_codes::SERVICE_OVERLOADED)
}
