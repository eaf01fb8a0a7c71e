//! Push event classification.
//!
//! Push packets (id `0`) carry an `UPDATE` or `DELETE` kind and the path of
//! the resource that changed. [`PushEvent::from_packet`] maps the path onto a
//! typed [`Resource`].
//!
//! # Routes
//!
//! `*` matches any single segment; paths must match in length.
//!
//! | Path | Resource | Type name |
//! |------|----------|-----------|
//! | `rooms/*/messages/*` | [`Resource::RoomMessage`] | `room-message` |
//! | `rooms/*/participants/*` | [`Resource::RoomParticipant`] | `room-participant` |
//! | `rooms/*/subscribers/*` | [`Resource::RoomSubscriber`] | `room-subscriber` |
//! | `rooms/*/owners/*` | [`Resource::RoomOwner`] | `room-owner` |
//! | `rooms/*/moderators/*` | [`Resource::RoomModerator`] | `room-moderator` |
//! | `rooms/*/members/*` | [`Resource::RoomMember`] | `room-member` |
//! | `rooms/*/announcers/*` | [`Resource::RoomAnnouncer`] | `room-announcer` |
//! | `rooms/*/count` | [`Resource::RoomCount`] | `room-count` |
//! | `rooms/*` | [`Resource::Room`] | `room` |
//! | `users/*/ban` | [`Resource::UserBan`] | `user-ban` |
//! | `users/*` | [`Resource::User`] | `user` |
//! | `apps/*` | [`Resource::App`] | `app` |
//! | `session` | [`Resource::Session`] | `session` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use super::packet::{Kind, Packet, Value};

// ============================================================================
// Resource
// ============================================================================

/// Resource type a push event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// A message posted in a room.
    RoomMessage,
    /// A user currently present in a room.
    RoomParticipant,
    /// A user subscribed to a room.
    RoomSubscriber,
    /// A room owner.
    RoomOwner,
    /// A room moderator.
    RoomModerator,
    /// A room member.
    RoomMember,
    /// A room announcer.
    RoomAnnouncer,
    /// Participant/subscriber counters of a room.
    RoomCount,
    /// A room.
    Room,
    /// A user ban.
    UserBan,
    /// A user.
    User,
    /// An application.
    App,
    /// The current session.
    Session,
    /// A path no route matched.
    Unknown,
}

impl Resource {
    /// Returns the event type name.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::RoomMessage => "room-message",
            Self::RoomParticipant => "room-participant",
            Self::RoomSubscriber => "room-subscriber",
            Self::RoomOwner => "room-owner",
            Self::RoomModerator => "room-moderator",
            Self::RoomMember => "room-member",
            Self::RoomAnnouncer => "room-announcer",
            Self::RoomCount => "room-count",
            Self::Room => "room",
            Self::UserBan => "user-ban",
            Self::User => "user",
            Self::App => "app",
            Self::Session => "session",
            Self::Unknown => "unknown",
        }
    }

    /// Returns `true` if the path carries a room id in its second segment.
    #[inline]
    #[must_use]
    pub const fn is_room_scoped(self) -> bool {
        matches!(
            self,
            Self::RoomMessage
                | Self::RoomParticipant
                | Self::RoomSubscriber
                | Self::RoomOwner
                | Self::RoomModerator
                | Self::RoomMember
                | Self::RoomAnnouncer
                | Self::RoomCount
        )
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

// ============================================================================
// Routes
// ============================================================================

/// `None` matches any segment.
type Route = (&'static [Option<&'static str>], Resource);

/// Ordered route table; the first match wins.
const ROUTES: &[Route] = &[
    (&[Some("rooms"), None, Some("messages"), None], Resource::RoomMessage),
    (&[Some("rooms"), None, Some("participants"), None], Resource::RoomParticipant),
    (&[Some("rooms"), None, Some("subscribers"), None], Resource::RoomSubscriber),
    (&[Some("rooms"), None, Some("owners"), None], Resource::RoomOwner),
    (&[Some("rooms"), None, Some("moderators"), None], Resource::RoomModerator),
    (&[Some("rooms"), None, Some("members"), None], Resource::RoomMember),
    (&[Some("rooms"), None, Some("announcers"), None], Resource::RoomAnnouncer),
    (&[Some("rooms"), None, Some("count")], Resource::RoomCount),
    (&[Some("rooms"), None], Resource::Room),
    (&[Some("users"), None, Some("ban")], Resource::UserBan),
    (&[Some("users"), None], Resource::User),
    (&[Some("apps"), None], Resource::App),
    (&[Some("session")], Resource::Session),
];

fn matches_route(path: &[String], pattern: &[Option<&str>]) -> bool {
    path.len() == pattern.len()
        && path
            .iter()
            .zip(pattern)
            .all(|(segment, expected)| expected.is_none_or(|e| e == segment.as_str()))
}

/// Classifies a path against the route table.
#[must_use]
pub fn classify(path: &[String]) -> Resource {
    ROUTES
        .iter()
        .find(|(pattern, _)| matches_route(path, pattern))
        .map_or(Resource::Unknown, |(_, resource)| *resource)
}

// ============================================================================
// PushEvent
// ============================================================================

/// A typed server-pushed change notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    /// `UPDATE` or `DELETE`.
    pub kind: Kind,
    /// Classified resource type.
    pub resource: Resource,
    /// Owning room, for room-scoped resources.
    pub room_id: Option<u64>,
    /// Owning user, for user bans.
    pub user_id: Option<u64>,
    /// Original path segments.
    pub path: Vec<String>,
    /// Resource body as sent by the server.
    pub payload: Value,
}

impl PushEvent {
    /// Builds a push event from a packet.
    ///
    /// A room or user id segment that is not an integer leaves the event
    /// [`Resource::Unknown`].
    #[must_use]
    pub fn from_packet(packet: &Packet) -> Self {
        let mut resource = classify(&packet.path);
        let owner_id = packet.path.get(1).and_then(|s| s.parse::<u64>().ok());

        let (room_id, user_id) = match resource {
            r if r.is_room_scoped() => (owner_id, None),
            Resource::UserBan => (None, owner_id),
            _ => (None, None),
        };
        if (resource.is_room_scoped() && room_id.is_none())
            || (resource == Resource::UserBan && user_id.is_none())
        {
            resource = Resource::Unknown;
        }

        Self {
            kind: packet.kind,
            resource,
            room_id,
            user_id,
            path: packet.path.clone(),
            payload: packet.payload.clone(),
        }
    }

    /// Returns the event type name.
    #[inline]
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.resource.type_name()
    }

    /// Returns `true` for deletions.
    #[inline]
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind == Kind::Delete
    }
}

// ============================================================================
// Tests
// ============================================================================
