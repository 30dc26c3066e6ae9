//! Participants of a document session and their cursor/selection presence.
//!
//! Cursors are not transformed: after a remote edit a cursor may point at
//! a stale line/column until its owner sends a fresh one.

use serde::{Deserialize, Serialize};

use crate::protocol::{ConnectionId, UserInfo};

/// Cursor location in editor coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

impl CursorPosition {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// Selection between two cursor positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start: CursorPosition,
    pub end: CursorPosition,
}

impl SelectionRange {
    pub fn new(start: CursorPosition, end: CursorPosition) -> Self {
        Self { start, end }
    }

    /// Order the endpoints so that `start <= end`.
    pub fn normalized(self) -> Self {
        if self.end < self.start {
            Self {
                start: self.end,
                end: self.start,
            }
        } else {
            self
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }
}

/// Public view of a participant, as sent to other participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub display_name: String,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
}

/// Server-side participant state.
#[derive(Debug, Clone)]
pub struct Participant {
    info: ParticipantInfo,
    /// Newest version this participant is known to have seen.
    last_base_version: u64,
}

impl Participant {
    pub fn new(connection_id: ConnectionId, user: UserInfo, joined_at_version: u64) -> Self {
        Self {
            info: ParticipantInfo {
                connection_id,
                user_id: user.id,
                display_name: user.name,
                cursor: None,
                selection: None,
            },
            last_base_version: joined_at_version,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.info.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.info.user_id
    }

    pub fn info(&self) -> &ParticipantInfo {
        &self.info
    }

    pub fn last_base_version(&self) -> u64 {
        self.last_base_version
    }

    pub fn set_cursor(&mut self, position: CursorPosition) {
        self.info.cursor = Some(position);
    }

    pub fn set_selection(&mut self, range: SelectionRange) {
        self.info.selection = Some(range.normalized());
    }

    pub fn rename(&mut self, display_name: String) {
        self.info.display_name = display_name;
    }

    /// Record that the participant has seen `version`. Never moves backwards.
    pub fn observe_version(&mut self, version: u64) {
        self.last_base_version = self.last_base_version.max(version);
    }

    /// Restart version tracking after a resynchronizing join.
    pub fn resync(&mut self, version: u64) {
        self.last_base_version = version;
    }
}

/// Participants in join order.
///
/// Join order is only used to make participant lists and cursor broadcasts
/// deterministic; it plays no part in transformation.
#[derive(Debug, Default)]
pub struct ParticipantList {
    entries: Vec<Participant>,
}

impl ParticipantList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a participant. Returns `false` if the connection is already present.
    pub fn insert(&mut self, participant: Participant) -> bool {
        if self.contains(participant.connection_id()) {
            return false;
        }
        self.entries.push(participant);
        true
    }

    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<Participant> {
        let index = self
            .entries
            .iter()
            .position(|p| p.connection_id() == connection_id)?;
        Some(self.entries.remove(index))
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&Participant> {
        self.entries.iter().find(|p| p.connection_id() == connection_id)
    }

    pub fn get_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Participant> {
        self.entries
            .iter_mut()
            .find(|p| p.connection_id() == connection_id)
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.get(connection_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.entries.iter()
    }

    /// Public views in join order.
    pub fn infos(&self) -> Vec<ParticipantInfo> {
        self.entries.iter().map(|p| p.info.clone()).collect()
    }

    /// Lowest version any connected participant may still submit against.
    pub fn min_base_version(&self) -> Option<u64> {
        self.entries.iter().map(|p| p.last_base_version).min()
    }
}
