//! Room membership index.
//!
//! Rooms are created implicitly on first join and removed when their last
//! member leaves; a lookup of an absent room yields an empty set, never an
//! error. Each join/leave updates the room's member set and the
//! connection's membership back-references together.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use uuid::Uuid;

use super::registry::ConnectionHandle;

pub struct RoomIndex {
    rooms: DashMap<String, HashSet<Uuid>>,
}

impl RoomIndex {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a connection to a room, creating the room on first join.
    pub fn join(&self, handle: &ConnectionHandle, room: &str) {
        handle.track_room(room);
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(handle.id);
        tracing::debug!(connection_id = %handle.id, room = %room, "Joined room");
    }

    /// Remove a connection from a room. No-op if it was not a member.
    pub fn leave(&self, handle: &ConnectionHandle, room: &str) {
        if !handle.untrack_room(room) {
            return;
        }
        self.remove_member(handle.id, room);
        tracing::debug!(connection_id = %handle.id, room = %room, "Left room");
    }

    /// Unconditionally remove a connection from a room, on both sides.
    /// Cleanup for a join that lost the race against teardown: the teardown
    /// sweep may have drained the handle's membership set before the join's
    /// index insert landed, in which case [`Self::leave`]'s back-reference
    /// guard would skip the removal.
    pub(crate) fn discard(&self, handle: &ConnectionHandle, room: &str) {
        handle.untrack_room(room);
        self.remove_member(handle.id, room);
    }

    /// Remove a connection from every room in its membership set. Called
    /// exactly once per disconnect, from the hub teardown path.
    pub fn leave_all(&self, handle: &ConnectionHandle) {
        for room in handle.take_rooms() {
            self.remove_member(handle.id, &room);
        }
    }

    fn remove_member(&self, connection_id: Uuid, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&connection_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
    }

    /// Member ids for a room. Empty for an unknown room.
    pub fn member_ids(&self, room: &str) -> Vec<Uuid> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    pub fn room_names(&self) -> Vec<String> {
        self.rooms.iter().map(|r| r.key().clone()).collect()
    }

    /// Member counts per room, for health/stats reporting.
    pub fn counts(&self) -> HashMap<String, usize> {
        self.rooms
            .iter()
            .map(|r| (r.key().clone(), r.value().len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

impl Default for RoomIndex {
    fn default() -> Self {
        Self::new()
    }
}
