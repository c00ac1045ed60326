// =============================================================================
// Matrixon Client SDK - Library Crate
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
//   A Matrix client-side sync engine: long-polls /sync against a homeserver,
//   persists the cursor crash-safely, classifies and dispatches events to
//   registered listeners, and maintains an in-memory projection of the room
//   state a client typically needs (membership, power levels, encryption).
//
// Features:
//   • Crash-safe long-poll loop with supersede semantics
//   • Retrying HTTP executor with rate-limit awareness
//   • Observer-pattern event dispatch with typed content parsing
//   • Pluggable cursor/filter stores (in-memory or server account data)
//
// =============================================================================

pub mod client;
pub mod events;
pub mod http;
pub mod responses;
pub mod state;
pub mod store;
pub mod sync;

pub use client::{Client, ClientBuilder, PresenceState, DEFAULT_SYNC_TIMEOUT};
pub use events::{
    Event, EventClass, EventContent, EventType, EventTypeRegistry, Membership,
};
pub use http::{
    HttpExecutor, HttpExecutorConfig, HttpRequest, RequestInfo, RequestObserver, ResponseOutcome,
};
pub use responses::{Filter, SyncResponse};
pub use state::{MembershipEntry, StateProjection};
pub use store::{AccountDataSyncStore, MemorySyncStore, SyncStore};
pub use sync::{
    DefaultSyncer, Dispatcher, EventSource, HandlerHandle, OldEventIgnorer, Syncer,
};

pub use matrixon_client_common::{ClientError, RequestContext, Result};

// Re-export the Matrix identifier types used throughout the public API.
pub use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
