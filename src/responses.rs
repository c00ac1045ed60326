// =============================================================================
// Matrixon Client SDK - Wire Types
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
//   Wire-level request/response shapes for the sync engine: the /sync
//   response with its joined/invited/left room maps, the filter definition
//   posted at loop startup, and the standard Matrix error envelope.
//
// References:
//   • Matrix spec: https://spec.matrix.org/ (GET /sync, POST /user/{id}/filter)
//
// =============================================================================

use std::collections::HashMap;

use ruma::{OwnedRoomId, OwnedUserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::Event;

/// A list of events under an `events` key, as used by every sync sub-section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Timeline section of a room's sync entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimelineSync {
    #[serde(default)]
    pub events: Vec<Event>,
    /// True when the server elided events between this batch and the last one
    #[serde(default)]
    pub limited: bool,
    /// Pagination token for fetching the elided gap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

/// Lazy-load member summary of a room.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LazyLoadSummary {
    #[serde(rename = "m.heroes", default, skip_serializing_if = "Option::is_none")]
    pub heroes: Option<Vec<OwnedUserId>>,
    #[serde(
        rename = "m.joined_member_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub joined_member_count: Option<u64>,
    #[serde(
        rename = "m.invited_member_count",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub invited_member_count: Option<u64>,
}

/// Unread counts for a joined room.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnreadNotificationCounts {
    #[serde(default)]
    pub highlight_count: i64,
    #[serde(default)]
    pub notification_count: i64,
}

/// Sync entry for a room the account is joined to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinedRoomSync {
    #[serde(default)]
    pub summary: LazyLoadSummary,
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: TimelineSync,
    #[serde(default)]
    pub ephemeral: EventList,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_notifications: Option<UnreadNotificationCounts>,
}

/// Sync entry for a room the account is invited to. Only stripped state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvitedRoomSync {
    #[serde(default)]
    pub invite_state: EventList,
}

/// Sync entry for a room the account has left.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeftRoomSync {
    #[serde(default)]
    pub summary: LazyLoadSummary,
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: TimelineSync,
}

/// The three room maps of a sync response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomsSync {
    #[serde(default)]
    pub join: HashMap<OwnedRoomId, JoinedRoomSync>,
    #[serde(default)]
    pub invite: HashMap<OwnedRoomId, InvitedRoomSync>,
    #[serde(default)]
    pub leave: HashMap<OwnedRoomId, LeftRoomSync>,
}

/// Device list deltas. Carried verbatim; crypto handling is out of scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceLists {
    #[serde(default)]
    pub changed: Vec<OwnedUserId>,
    #[serde(default)]
    pub left: Vec<OwnedUserId>,
}

/// One complete poll interval: everything that happened since the cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Cursor to resume from on the next poll
    pub next_batch: String,
    #[serde(default)]
    pub presence: EventList,
    #[serde(default)]
    pub account_data: EventList,
    #[serde(default)]
    pub to_device: EventList,
    #[serde(default)]
    pub device_lists: DeviceLists,
    #[serde(default)]
    pub device_one_time_keys_count: HashMap<String, i64>,
    #[serde(default)]
    pub rooms: RoomsSync,
}

/// Response of the filter creation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespCreateFilter {
    pub filter_id: String,
}

/// Standard Matrix error envelope returned on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespError {
    #[serde(default)]
    pub errcode: String,
    #[serde(default)]
    pub error: String,
    /// Milliseconds to wait before retrying, sent with M_LIMIT_EXCEEDED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Filter on one event list (timeline, state, ephemeral, account data).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub senders: Option<Vec<OwnedUserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_senders: Option<Vec<OwnedUserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lazy_load_members: Option<bool>,
}

/// Room section of a filter definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<FilterPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<FilterPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<FilterPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<FilterPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Vec<OwnedRoomId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_rooms: Option<Vec<OwnedRoomId>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_leave: bool,
}

/// Server-stored filter definition posted once per account lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<FilterPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<FilterPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomFilter>,
}

impl Filter {
    /// The default sync filter: timeline capped at 50 events per room.
    pub fn default_sync_filter() -> Self {
        Filter {
            room: Some(RoomFilter {
                timeline: Some(FilterPart {
                    limit: Some(50),
                    ..FilterPart::default()
                }),
                ..RoomFilter::default()
            }),
            ..Filter::default()
        }
    }
}
