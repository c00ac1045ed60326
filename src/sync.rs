// =============================================================================
// Matrixon Client SDK - Response Processor / Event Dispatcher
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-03-21
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Decomposes a sync response into its typed sub-streams, annotates every
//   event with its provenance (EventSource) and room, resolves the event
//   class, parses content through the type registry, and fans events out to
//   registered handlers. Dispatch is synchronous and single-threaded relative
//   to the sync loop to preserve per-room ordering.
//
// Features:
//   • EventSource provenance bitmask for listener filtering
//   • Global, type-scoped and whole-response listeners with deregistration
//   • State-key override: state events stay state events in any bucket
//   • Listener panics trapped at the process boundary, never unwound
//     through the sync loop
//
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ruma::{OwnedRoomId, OwnedUserId, UserId};
use tracing::{debug, warn};

use matrixon_client_common::{ClientError, Result};

use crate::events::{Event, EventClass, EventType, EventTypeRegistry};
use crate::responses::{Filter, SyncResponse};

/// Default wait between failed sync attempts.
const FAILED_SYNC_BACKOFF: Duration = Duration::from_secs(10);

/// Where in the sync response an event was found: a room section bit
/// (presence/join/invite/leave) combined with a stream bit
/// (state/timeline/ephemeral/account data/to-device).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventSource(u16);

impl EventSource {
    pub const PRESENCE: EventSource = EventSource(1);
    pub const JOIN: EventSource = EventSource(1 << 1);
    pub const INVITE: EventSource = EventSource(1 << 2);
    pub const LEAVE: EventSource = EventSource(1 << 3);
    pub const ACCOUNT_DATA: EventSource = EventSource(1 << 4);
    pub const TIMELINE: EventSource = EventSource(1 << 5);
    pub const STATE: EventSource = EventSource(1 << 6);
    pub const EPHEMERAL: EventSource = EventSource(1 << 7);
    pub const TO_DEVICE: EventSource = EventSource(1 << 8);

    /// True when every bit of `other` is set in `self`.
    pub fn contains(self, other: EventSource) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when `self` and `other` share any bit.
    pub fn intersects(self, other: EventSource) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventSource {
    type Output = EventSource;

    fn bitor(self, rhs: EventSource) -> EventSource {
        EventSource(self.0 | rhs.0)
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stream = if self.contains(Self::PRESENCE) {
            "presence"
        } else if self.contains(Self::TO_DEVICE) {
            "to-device"
        } else if self.contains(Self::STATE) {
            "state"
        } else if self.contains(Self::TIMELINE) {
            "timeline"
        } else if self.contains(Self::EPHEMERAL) {
            "ephemeral"
        } else if self.contains(Self::ACCOUNT_DATA) {
            "account data"
        } else {
            return write!(f, "unknown ({})", self.0);
        };
        if self.contains(Self::JOIN) {
            write!(f, "joined room {stream}")
        } else if self.contains(Self::INVITE) {
            write!(f, "invited room {stream}")
        } else if self.contains(Self::LEAVE) {
            write!(f, "left room {stream}")
        } else {
            f.write_str(stream)
        }
    }
}

/// Resolve the effective class of an event from its provenance and state-key
/// presence. Pure function: re-classifying with the same inputs always
/// yields the same class.
///
/// A non-null state key always wins, because state events can legitimately
/// appear in non-state buckets (e.g. membership changes in a timeline).
pub fn classify(source: EventSource, has_state_key: bool) -> EventClass {
    if has_state_key {
        EventClass::State
    } else if source == EventSource::PRESENCE || source.intersects(EventSource::EPHEMERAL) {
        EventClass::Ephemeral
    } else if source.intersects(EventSource::ACCOUNT_DATA) {
        EventClass::AccountData
    } else if source == EventSource::TO_DEVICE {
        EventClass::ToDevice
    } else {
        EventClass::Message
    }
}

/// Handler for a single dispatched event.
pub type EventHandler = Arc<dyn Fn(EventSource, &Event) + Send + Sync>;

/// Handler for a whole sync response, invoked before per-event dispatch.
/// Returning `false` stops processing of this response entirely. The
/// response is mutable so handlers can prune it (see [`OldEventIgnorer`]).
pub type SyncHandler = Arc<dyn Fn(&mut SyncResponse, &str) -> bool + Send + Sync>;

/// Policy for content parse failures. Returning `true` dispatches the event
/// with raw content only; `false` drops it.
pub type ParseErrorHandler = Arc<dyn Fn(&Event, &serde_json::Error) -> bool + Send + Sync>;

/// Which handler list a [`HandlerHandle`] points into.
#[derive(Debug, Clone, PartialEq, Eq)]
enum HandlerScope {
    Sync,
    Global,
    Typed(EventType),
}

/// Deregistration handle returned by every registration method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerHandle {
    id: u64,
    scope: HandlerScope,
}

/// Listener registry owned by the client instance.
///
/// Per event, dispatch order is: all global listeners in registration order,
/// then all listeners scoped to the event's class-qualified type. Handlers
/// run synchronously on the sync loop's task; long-running work must be
/// handed off elsewhere or it stalls the next poll.
pub struct Dispatcher {
    next_id: AtomicU64,
    sync_handlers: RwLock<Vec<(u64, SyncHandler)>>,
    global_handlers: RwLock<Vec<(u64, EventHandler)>>,
    typed_handlers: RwLock<HashMap<EventType, Vec<(u64, EventHandler)>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sync_handlers: RwLock::new(Vec::new()),
            global_handlers: RwLock::new(Vec::new()),
            typed_handlers: RwLock::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a whole-response listener.
    pub fn on_sync(&self, handler: SyncHandler) -> HandlerHandle {
        let id = self.next_id();
        self.sync_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        HandlerHandle {
            id,
            scope: HandlerScope::Sync,
        }
    }

    /// Register a listener for every dispatched event.
    pub fn on_event(&self, handler: EventHandler) -> HandlerHandle {
        let id = self.next_id();
        self.global_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handler));
        HandlerHandle {
            id,
            scope: HandlerScope::Global,
        }
    }

    /// Register a listener for one class-qualified event type.
    pub fn on_event_type(&self, event_type: EventType, handler: EventHandler) -> HandlerHandle {
        let id = self.next_id();
        self.typed_handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type.clone())
            .or_default()
            .push((id, handler));
        HandlerHandle {
            id,
            scope: HandlerScope::Typed(event_type),
        }
    }

    /// Remove a previously registered listener. Returns whether it was
    /// still registered.
    pub fn remove(&self, handle: &HandlerHandle) -> bool {
        match &handle.scope {
            HandlerScope::Sync => {
                let mut handlers = self
                    .sync_handlers
                    .write()
                    .unwrap_or_else(|e| e.into_inner());
                let before = handlers.len();
                handlers.retain(|(id, _)| *id != handle.id);
                handlers.len() != before
            }
            HandlerScope::Global => {
                let mut handlers = self
                    .global_handlers
                    .write()
                    .unwrap_or_else(|e| e.into_inner());
                let before = handlers.len();
                handlers.retain(|(id, _)| *id != handle.id);
                handlers.len() != before
            }
            HandlerScope::Typed(event_type) => {
                let mut handlers = self
                    .typed_handlers
                    .write()
                    .unwrap_or_else(|e| e.into_inner());
                match handlers.get_mut(event_type) {
                    Some(list) => {
                        let before = list.len();
                        list.retain(|(id, _)| *id != handle.id);
                        list.len() != before
                    }
                    None => false,
                }
            }
        }
    }

    /// Run the whole-response listeners. Returns `false` if any vetoed.
    fn run_sync_handlers(&self, response: &mut SyncResponse, since: &str) -> bool {
        let handlers: Vec<SyncHandler> = self
            .sync_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            if !handler(response, since) {
                return false;
            }
        }
        true
    }

    /// Fan one event out: global listeners first, then type-scoped ones.
    pub fn dispatch(&self, source: EventSource, event: &Event) {
        let global: Vec<EventHandler> = self
            .global_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in global {
            handler(source, event);
        }
        let typed: Vec<EventHandler> = self
            .typed_handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event.event_type())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in typed {
            handler(source, event);
        }
    }
}

/// Processes sync responses and decides the loop's failure policy.
pub trait Syncer: Send + Sync {
    /// Process one sync response. `since` is the cursor the poll was made
    /// with (empty on the initial sync). An error stops the sync loop.
    fn process_response(&self, response: SyncResponse, since: &str) -> Result<usize>;

    /// Called when a poll fails. `Ok(wait)` sleeps and continues the loop;
    /// `Err` stops it permanently.
    fn on_failed_sync(&self, error: &ClientError) -> Result<Duration>;

    /// The filter definition to create when the store holds no filter id.
    fn filter_definition(&self, user_id: &UserId) -> Filter;
}

/// Default [`Syncer`]: observer-pattern dispatch through a [`Dispatcher`],
/// content parsing through an [`EventTypeRegistry`], 10-second backoff on
/// failed polls (fatal on `M_UNKNOWN_TOKEN`).
pub struct DefaultSyncer {
    dispatcher: Dispatcher,
    registry: RwLock<EventTypeRegistry>,
    parse_event_content: bool,
    parse_error_handler: RwLock<ParseErrorHandler>,
    filter: RwLock<Filter>,
}

impl Default for DefaultSyncer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DefaultSyncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefaultSyncer")
            .field("parse_event_content", &self.parse_event_content)
            .finish_non_exhaustive()
    }
}

impl DefaultSyncer {
    pub fn new() -> Self {
        Self {
            dispatcher: Dispatcher::new(),
            registry: RwLock::new(EventTypeRegistry::with_defaults()),
            parse_event_content: true,
            parse_error_handler: RwLock::new(Arc::new(|_, _| false)),
            filter: RwLock::new(Filter::default_sync_filter()),
        }
    }

    /// The listener registry of this syncer.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Replace the filter definition created at loop startup.
    pub fn set_filter(&self, filter: Filter) {
        *self.filter.write().unwrap_or_else(|e| e.into_inner()) = filter;
    }

    /// Register a content parser for a custom event type.
    pub fn register_parser(&self, event_type: EventType, parser: crate::events::ContentParser) {
        self.registry
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .register(event_type, parser);
    }

    /// Replace the parse-failure policy.
    pub fn set_parse_error_handler(&self, handler: ParseErrorHandler) {
        *self
            .parse_error_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = handler;
    }

    /// Emission order: to-device, presence, global
    /// account data, then per-room streams. Within a joined room: state,
    /// timeline, ephemeral, account data — timeline events may reference
    /// state that was just updated, and ephemeral/account data are defined
    /// to occur after the timeline.
    fn process_inner(&self, response: SyncResponse, since: &str) -> usize {
        let mut response = response;
        if !self.dispatcher.run_sync_handlers(&mut response, since) {
            debug!("Sync response processing vetoed by sync handler");
            return 0;
        }

        let mut dispatched = 0;
        dispatched += self.process_events(None, response.to_device.events, EventSource::TO_DEVICE);
        dispatched += self.process_events(None, response.presence.events, EventSource::PRESENCE);
        dispatched += self.process_events(
            None,
            response.account_data.events,
            EventSource::ACCOUNT_DATA,
        );

        for (room_id, room) in response.rooms.join {
            dispatched += self.process_events(
                Some(&room_id),
                room.state.events,
                EventSource::JOIN | EventSource::STATE,
            );
            dispatched += self.process_events(
                Some(&room_id),
                room.timeline.events,
                EventSource::JOIN | EventSource::TIMELINE,
            );
            dispatched += self.process_events(
                Some(&room_id),
                room.ephemeral.events,
                EventSource::JOIN | EventSource::EPHEMERAL,
            );
            dispatched += self.process_events(
                Some(&room_id),
                room.account_data.events,
                EventSource::JOIN | EventSource::ACCOUNT_DATA,
            );
        }
        for (room_id, room) in response.rooms.invite {
            dispatched += self.process_events(
                Some(&room_id),
                room.invite_state.events,
                EventSource::INVITE | EventSource::STATE,
            );
        }
        for (room_id, room) in response.rooms.leave {
            dispatched += self.process_events(
                Some(&room_id),
                room.state.events,
                EventSource::LEAVE | EventSource::STATE,
            );
            dispatched += self.process_events(
                Some(&room_id),
                room.timeline.events,
                EventSource::LEAVE | EventSource::TIMELINE,
            );
        }
        dispatched
    }

    fn process_events(
        &self,
        room_id: Option<&OwnedRoomId>,
        events: Vec<Event>,
        source: EventSource,
    ) -> usize {
        let mut dispatched = 0;
        for event in events {
            if self.process_event(room_id, event, source) {
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Annotate, classify, parse and dispatch one event. Returns whether the
    /// event reached the dispatcher.
    fn process_event(&self, room_id: Option<&OwnedRoomId>, mut event: Event, source: EventSource) -> bool {
        // The wire format omits the room id; it is implied by map position.
        event.room_id = room_id.cloned();
        event.class = classify(source, event.state_key.is_some());

        if self.parse_event_content {
            let parse_result = self
                .registry
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .parse(&event.event_type(), &event.content);
            match parse_result {
                Some(Ok(parsed)) => event.content.parsed = Some(parsed),
                Some(Err(error)) => {
                    let keep = {
                        let handler = self
                            .parse_error_handler
                            .read()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        handler(&event, &error)
                    };
                    if !keep {
                        warn!(
                            event_type = %event.kind,
                            "Dropping event with unparseable content: {error}"
                        );
                        return false;
                    }
                }
                None => {}
            }
        }

        self.dispatcher.dispatch(source, &event);
        true
    }
}

impl Syncer for DefaultSyncer {
    fn process_response(&self, response: SyncResponse, since: &str) -> Result<usize> {
        // Listener panics must not unwind through the sync loop; convert
        // them into a fatal error carrying the cursor in effect.
        let outcome = catch_unwind(AssertUnwindSafe(|| self.process_inner(response, since)));
        match outcome {
            Ok(dispatched) => Ok(dispatched),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                Err(ClientError::ListenerPanic {
                    since: since.to_string(),
                    message,
                })
            }
        }
    }

    fn on_failed_sync(&self, error: &ClientError) -> Result<Duration> {
        if error.errcode() == Some("M_UNKNOWN_TOKEN") {
            return Err(error.clone());
        }
        Ok(FAILED_SYNC_BACKOFF)
    }

    fn filter_definition(&self, _user_id: &UserId) -> Filter {
        self.filter
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Sync handler that prunes rooms whose timeline contains our own join, so a
/// client toggled in and out of a room does not re-process the backfill the
/// server sends along with the join.
pub struct OldEventIgnorer {
    pub user_id: OwnedUserId,
}

impl OldEventIgnorer {
    pub fn new(user_id: OwnedUserId) -> Self {
        Self { user_id }
    }

    /// Register on a dispatcher; returns the deregistration handle.
    pub fn register(self, dispatcher: &Dispatcher) -> HandlerHandle {
        let user_id = self.user_id;
        dispatcher.on_sync(Arc::new(move |response: &mut SyncResponse, since: &str| {
            if since.is_empty() {
                // Initial sync is all backfill; skip it entirely.
                return false;
            }
            let mut pruned: Vec<OwnedRoomId> = Vec::new();
            for (room_id, room) in &response.rooms.join {
                for event in room.timeline.events.iter().rev() {
                    if event.kind != "m.room.member"
                        || event.state_key.as_deref() != Some(user_id.as_str())
                    {
                        continue;
                    }
                    let membership = event
                        .content
                        .raw
                        .get("membership")
                        .and_then(|v| v.as_str());
                    if membership == Some("join") {
                        pruned.push(room_id.clone());
                        break;
                    }
                }
            }
            for room_id in pruned {
                response.rooms.join.remove(&room_id);
                response.rooms.invite.remove(&room_id);
            }
            true
        }))
    }
}
