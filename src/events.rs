// =============================================================================
// Matrixon Client SDK - Event Model
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
//   The event data model for the sync engine: the wire-level Event struct,
//   its class (state / message / ephemeral / account data / to-device), and
//   the pluggable registry that maps event type tags to content parsers.
//
// Features:
//   • Tagged-union Event with raw and typed content
//   • Event class resolved during dispatch, not from the wire
//   • Strategy-table content parsing (type tag → parser function)
//   • Typed contents for the state projection (member, power levels,
//     encryption) and the common message/ephemeral/account-data types
//
// =============================================================================

use std::collections::HashMap;
use std::fmt;

use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where an event lives in the protocol, independent of which sync bucket it
/// arrived in. A membership event is a state event even when the server hands
/// it to us inside a timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EventClass {
    /// Regular timeline event (messages, reactions, ...)
    #[default]
    Message,
    /// Event with a state key, current-value-wins room configuration
    State,
    /// Non-persisted signal: typing, receipts, presence
    Ephemeral,
    /// Per-account configuration, global or room-scoped
    AccountData,
    /// Direct device-to-device event
    ToDevice,
}

/// An event type tag plus the class it belongs to.
///
/// Typed listeners and content parsers are keyed by this pair, so an
/// `m.room.member` state event and a hypothetical `m.room.member` message
/// event would never share handlers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventType {
    pub class: EventClass,
    pub name: String,
}

impl EventType {
    pub fn new(class: EventClass, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
        }
    }

    pub fn state(name: impl Into<String>) -> Self {
        Self::new(EventClass::State, name)
    }

    pub fn message(name: impl Into<String>) -> Self {
        Self::new(EventClass::Message, name)
    }

    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self::new(EventClass::Ephemeral, name)
    }

    pub fn account_data(name: impl Into<String>) -> Self {
        Self::new(EventClass::AccountData, name)
    }

    pub fn to_device(name: impl Into<String>) -> Self {
        Self::new(EventClass::ToDevice, name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Raw event content plus the optional typed variant produced by the parser
/// registry. The raw JSON object is always retained so listeners can read
/// fields the typed structs do not model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(flatten)]
    pub raw: serde_json::Map<String, Value>,
    #[serde(skip)]
    pub parsed: Option<EventContent>,
}

impl Content {
    /// The raw content as an owned `serde_json::Value` object.
    pub fn as_value(&self) -> Value {
        Value::Object(self.raw.clone())
    }
}

/// A single event as found in a sync response.
///
/// `room_id` is not part of the wire format (it is implied by the position of
/// the event in the response) and is injected by the response processor
/// before dispatch. `class` likewise is resolved during dispatch from the
/// event's source and state-key presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Wire event type tag, e.g. `m.room.message`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<OwnedUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<OwnedEventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_server_ts: Option<i64>,
    #[serde(default)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
    /// Room this event belongs to; attached during dispatch
    #[serde(skip)]
    pub room_id: Option<OwnedRoomId>,
    /// Effective class; resolved during dispatch
    #[serde(skip)]
    pub class: EventClass,
}

impl Event {
    /// The class-qualified type of this event, as used for listener and
    /// parser lookup.
    pub fn event_type(&self) -> EventType {
        EventType::new(self.class, self.kind.clone())
    }

    /// Typed content, if the registry parsed it.
    pub fn parsed_content(&self) -> Option<&EventContent> {
        self.content.parsed.as_ref()
    }
}

/// Room membership states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    Join,
    Leave,
    Invite,
    Ban,
    Knock,
}

/// `m.room.member` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEventContent {
    pub membership: Membership,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn default_power_level_50() -> i64 {
    50
}

/// `m.room.power_levels` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerLevelsEventContent {
    #[serde(default)]
    pub users: HashMap<OwnedUserId, i64>,
    #[serde(default)]
    pub users_default: i64,
    #[serde(default)]
    pub events: HashMap<String, i64>,
    #[serde(default)]
    pub events_default: i64,
    #[serde(default = "default_power_level_50")]
    pub state_default: i64,
    #[serde(default = "default_power_level_50")]
    pub ban: i64,
    #[serde(default = "default_power_level_50")]
    pub kick: i64,
    #[serde(default = "default_power_level_50")]
    pub redact: i64,
    #[serde(default)]
    pub invite: i64,
}

impl Default for PowerLevelsEventContent {
    fn default() -> Self {
        Self {
            users: HashMap::new(),
            users_default: 0,
            events: HashMap::new(),
            events_default: 0,
            state_default: 50,
            ban: 50,
            kick: 50,
            redact: 50,
            invite: 0,
        }
    }
}

impl PowerLevelsEventContent {
    /// Effective power level of a user, falling back to `users_default`.
    pub fn user_level(&self, user_id: &UserId) -> i64 {
        self.users
            .get(user_id)
            .copied()
            .unwrap_or(self.users_default)
    }
}

/// `m.room.encryption` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionEventContent {
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_period_msgs: Option<u64>,
}

fn default_federate() -> bool {
    true
}

/// `m.room.create` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEventContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<OwnedUserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_version: Option<String>,
    #[serde(rename = "m.federate", default = "default_federate")]
    pub federate: bool,
}

/// `m.room.name` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomNameEventContent {
    #[serde(default)]
    pub name: String,
}

/// `m.room.topic` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEventContent {
    #[serde(default)]
    pub topic: String,
}

/// `m.room.message` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEventContent {
    pub msgtype: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `m.typing` content
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypingEventContent {
    #[serde(default)]
    pub user_ids: Vec<OwnedUserId>,
}

/// `m.presence` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEventContent {
    pub presence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_ago: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,
    #[serde(default)]
    pub currently_active: bool,
}

/// `m.fully_read` content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullyReadEventContent {
    pub event_id: OwnedEventId,
}

/// Parsed, typed event content. One variant per event type the SDK models;
/// everything else stays raw-only.
#[derive(Debug, Clone, PartialEq)]
pub enum EventContent {
    Member(MemberEventContent),
    PowerLevels(PowerLevelsEventContent),
    Encryption(EncryptionEventContent),
    Create(CreateEventContent),
    RoomName(RoomNameEventContent),
    Topic(TopicEventContent),
    Message(MessageEventContent),
    Typing(TypingEventContent),
    Presence(PresenceEventContent),
    /// `m.receipt` payloads are keyed by arbitrary event ids; kept raw
    Receipt(Value),
    /// `m.direct`: user id → list of direct rooms
    DirectChats(HashMap<OwnedUserId, Vec<OwnedRoomId>>),
    FullyRead(FullyReadEventContent),
}

/// Parser function for one event type. Takes the raw content object and
/// produces the typed variant.
pub type ContentParser = fn(&Value) -> serde_json::Result<EventContent>;

fn parse_member(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<MemberEventContent>(value.clone()).map(EventContent::Member)
}

fn parse_power_levels(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<PowerLevelsEventContent>(value.clone()).map(EventContent::PowerLevels)
}

fn parse_encryption(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<EncryptionEventContent>(value.clone()).map(EventContent::Encryption)
}

fn parse_create(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<CreateEventContent>(value.clone()).map(EventContent::Create)
}

fn parse_room_name(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<RoomNameEventContent>(value.clone()).map(EventContent::RoomName)
}

fn parse_topic(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<TopicEventContent>(value.clone()).map(EventContent::Topic)
}

fn parse_message(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<MessageEventContent>(value.clone()).map(EventContent::Message)
}

fn parse_typing(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<TypingEventContent>(value.clone()).map(EventContent::Typing)
}

fn parse_presence(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<PresenceEventContent>(value.clone()).map(EventContent::Presence)
}

fn parse_receipt(value: &Value) -> serde_json::Result<EventContent> {
    Ok(EventContent::Receipt(value.clone()))
}

fn parse_direct_chats(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<HashMap<OwnedUserId, Vec<OwnedRoomId>>>(value.clone())
        .map(EventContent::DirectChats)
}

fn parse_fully_read(value: &Value) -> serde_json::Result<EventContent> {
    serde_json::from_value::<FullyReadEventContent>(value.clone()).map(EventContent::FullyRead)
}

/// Registry mapping event type tags to content parsers.
///
/// The response processor consults this table for every event; unknown types
/// are dispatched with raw content only. Callers can register parsers for
/// custom event types before starting the sync loop.
#[derive(Debug, Clone)]
pub struct EventTypeRegistry {
    parsers: HashMap<EventType, ContentParser>,
}

impl EventTypeRegistry {
    /// An empty registry, for callers that want full control.
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// A registry pre-populated with the standard Matrix event types the SDK
    /// has typed contents for.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(EventType::state("m.room.member"), parse_member);
        registry.register(EventType::state("m.room.power_levels"), parse_power_levels);
        registry.register(EventType::state("m.room.encryption"), parse_encryption);
        registry.register(EventType::state("m.room.create"), parse_create);
        registry.register(EventType::state("m.room.name"), parse_room_name);
        registry.register(EventType::state("m.room.topic"), parse_topic);
        registry.register(EventType::message("m.room.message"), parse_message);
        registry.register(EventType::ephemeral("m.typing"), parse_typing);
        registry.register(EventType::ephemeral("m.receipt"), parse_receipt);
        registry.register(EventType::ephemeral("m.presence"), parse_presence);
        registry.register(EventType::account_data("m.direct"), parse_direct_chats);
        registry.register(EventType::account_data("m.fully_read"), parse_fully_read);
        registry
    }

    /// Register (or replace) the parser for an event type.
    pub fn register(&mut self, event_type: EventType, parser: ContentParser) {
        self.parsers.insert(event_type, parser);
    }

    /// Parse the content of an event. `None` means no parser is registered
    /// for this type.
    pub fn parse(&self, event_type: &EventType, content: &Content) -> Option<serde_json::Result<EventContent>> {
        let parser = self.parsers.get(event_type)?;
        Some(parser(&content.as_value()))
    }
}

impl Default for EventTypeRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
