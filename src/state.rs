// =============================================================================
// Matrixon Client SDK - In-Memory State Projection
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
//   A read model of room state, maintained by event listeners attached to
//   the dispatcher. Tracks the state fragments a client typically needs
//   between polls: per-room membership, power levels, and the encryption
//   flag. Last write wins; the projection never invents or merges state.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tracing::warn;

use crate::events::{
    EncryptionEventContent, EventClass, EventContent, EventType, Membership,
    PowerLevelsEventContent,
};
use crate::sync::{Dispatcher, HandlerHandle};

/// One user's membership in one room, as last told by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipEntry {
    pub membership: Membership,
    pub displayname: Option<String>,
    pub avatar_url: Option<String>,
}

/// In-memory projection of the room state carried by sync responses.
///
/// Attach it to a dispatcher before starting the sync loop; it then stays
/// current as responses are processed. Each state family sits behind its own
/// lock, so a membership read never contends with a power-levels write.
#[derive(Debug, Default)]
pub struct StateProjection {
    memberships: RwLock<HashMap<OwnedRoomId, HashMap<OwnedUserId, MembershipEntry>>>,
    power_levels: RwLock<HashMap<OwnedRoomId, PowerLevelsEventContent>>,
    encryption: RwLock<HashMap<OwnedRoomId, EncryptionEventContent>>,
}

impl StateProjection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register the projection's listeners on a dispatcher. The returned
    /// handles deregister the projection again.
    pub fn attach(self: &Arc<Self>, dispatcher: &Dispatcher) -> Vec<HandlerHandle> {
        let mut handles = Vec::with_capacity(3);

        let projection = Arc::clone(self);
        handles.push(dispatcher.on_event_type(
            EventType::state("m.room.member"),
            Arc::new(move |_, event| {
                // state-key override: only apply events that resolved as state
                if event.class != EventClass::State {
                    return;
                }
                let (Some(room_id), Some(state_key)) = (&event.room_id, &event.state_key) else {
                    return;
                };
                let Ok(user_id) = state_key.parse::<OwnedUserId>() else {
                    warn!(state_key = %state_key, "Membership event with non-user state key");
                    return;
                };
                let Some(EventContent::Member(content)) = event.parsed_content() else {
                    return;
                };
                projection
                    .memberships
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(room_id.clone())
                    .or_default()
                    .insert(
                        user_id,
                        MembershipEntry {
                            membership: content.membership,
                            displayname: content.displayname.clone(),
                            avatar_url: content.avatar_url.clone(),
                        },
                    );
            }),
        ));

        let projection = Arc::clone(self);
        handles.push(dispatcher.on_event_type(
            EventType::state("m.room.power_levels"),
            Arc::new(move |_, event| {
                if event.class != EventClass::State {
                    return;
                }
                let Some(room_id) = &event.room_id else {
                    return;
                };
                let Some(EventContent::PowerLevels(content)) = event.parsed_content() else {
                    return;
                };
                projection
                    .power_levels
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(room_id.clone(), content.clone());
            }),
        ));

        let projection = Arc::clone(self);
        handles.push(dispatcher.on_event_type(
            EventType::state("m.room.encryption"),
            Arc::new(move |_, event| {
                if event.class != EventClass::State {
                    return;
                }
                let Some(room_id) = &event.room_id else {
                    return;
                };
                let Some(EventContent::Encryption(content)) = event.parsed_content() else {
                    return;
                };
                projection
                    .encryption
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(room_id.clone(), content.clone());
            }),
        ));

        handles
    }

    /// The last known membership of a user in a room.
    pub fn membership(&self, room_id: &RoomId, user_id: &UserId) -> Option<MembershipEntry> {
        self.memberships
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .and_then(|members| members.get(user_id))
            .cloned()
    }

    /// All tracked members of a room.
    pub fn members(&self, room_id: &RoomId) -> HashMap<OwnedUserId, MembershipEntry> {
        self.memberships
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The room's power levels, if any power-levels event was seen.
    pub fn power_levels(&self, room_id: &RoomId) -> Option<PowerLevelsEventContent> {
        self.power_levels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }

    /// A user's effective power level in a room; defaults apply when no
    /// power-levels event was seen.
    pub fn power_level(&self, room_id: &RoomId, user_id: &UserId) -> i64 {
        self.power_levels(room_id)
            .unwrap_or_default()
            .user_level(user_id)
    }

    /// Whether the room has announced encryption.
    pub fn is_encrypted(&self, room_id: &RoomId) -> bool {
        self.encryption
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(room_id)
    }

    /// The room's encryption settings, if announced.
    pub fn encryption(&self, room_id: &RoomId) -> Option<EncryptionEventContent> {
        self.encryption
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room_id)
            .cloned()
    }
}
