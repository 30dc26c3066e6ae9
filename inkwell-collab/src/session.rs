//! Per-document session: authoritative content, version and operation log.
//!
//! ```text
//!            join                    last leave             persisted
//!  (none) ─────────► Active ─────────────────────► Draining ──────────► Closed
//!                      ▲                               │
//!                      └───────────── join ────────────┘
//! ```
//!
//! Incoming client operations are transformed against every logged
//! operation newer than their base version, applied, logged and broadcast to
//! every participant (the originator included). All of this happens under
//! the session's mutex, so no other mutation can interleave between reading
//! the log and appending to it.
//!
//! The session never performs I/O. Persistence is requested through
//! [`PersistRequest`] values that the caller saves elsewhere and reports
//! back with [`DocumentSession::mark_persisted`] or
//! [`DocumentSession::persist_failed`].
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems (1989)

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use inkwell_ot::{apply_operation, char_len, transform_operation, Operation, OtError};

use crate::channel::ParticipantChannel;
use crate::presence::{CursorPosition, Participant, ParticipantInfo, ParticipantList, SelectionRange};
use crate::protocol::{ConnectionId, DocumentId, ServerEvent, UserInfo};
use crate::store::{DocumentMetadata, StoreError, StoredDocument};

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum participants per document
    pub max_participants: usize,
    /// Request a persist after this many applied operations
    pub persist_every_ops: u64,
    /// Interval of the periodic persist cycle
    pub persist_interval: Duration,
    /// Upper bound on retained log entries, whatever the participants' base versions
    pub max_log_entries: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_participants: 100,
            persist_every_ops: 50,
            persist_interval: Duration::from_secs(10),
            max_log_entries: 10_000,
        }
    }
}

impl SessionConfig {
    /// Small limits and a fast persist cycle.
    pub fn for_testing() -> Self {
        Self {
            max_participants: 8,
            persist_every_ops: 5,
            persist_interval: Duration::from_millis(50),
            max_log_entries: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// At least one participant connected
    Active,
    /// Last participant left; final persist pending
    Draining,
    /// Terminal; the registry drops the session
    Closed,
}

/// An applied operation and the version it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub operation: Operation,
    pub version: u64,
}

/// Synchronization baseline handed to a joining participant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub document_id: DocumentId,
    pub content: String,
    pub version: u64,
    pub metadata: DocumentMetadata,
    pub participants: Vec<ParticipantInfo>,
}

impl SessionSnapshot {
    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::State {
            document_id: self.document_id.clone(),
            content: self.content.clone(),
            version: self.version,
            metadata: self.metadata.clone(),
            participants: self.participants.clone(),
        }
    }
}

/// Result of a successfully applied client operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOperation {
    /// The operation as transformed and applied by the server
    pub operation: Operation,
    pub version: u64,
    pub user_id: String,
}

/// Content to hand to the document store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub document_id: DocumentId,
    pub content: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Participants still connected
    Remaining(usize),
    /// Last participant left; save this before the session can close
    Drain(PersistRequest),
    /// Last participant left while a save was in flight
    Draining,
    /// Last participant left and nothing needed saving
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AfterPersist {
    Idle,
    /// The draining session is fully saved
    Closed,
    /// Content moved on while saving; save again
    Again(PersistRequest),
}

/// Session-level errors. Each rejects one request; the session stays usable.
#[derive(Debug, Clone)]
pub enum SessionError {
    UnknownParticipant(ConnectionId),
    /// Base version is negative, ahead of the server, or older than the log
    StaleBaseVersion { base: i64, current: u64, oldest: u64 },
    /// Algebra failure while transforming or applying
    Operation(OtError),
    /// Session closed while the request was waiting
    SessionClosed,
    /// Participant limit reached
    SessionFull(usize),
    /// Loading the document failed
    Store(StoreError),
}

impl SessionError {
    /// Server version to report alongside a rejection, where it matters.
    pub fn current_version(&self) -> Option<u64> {
        match self {
            SessionError::StaleBaseVersion { current, .. } => Some(*current),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownParticipant(id) => write!(f, "Connection {id} has not joined this document"),
            Self::StaleBaseVersion { base, current, oldest } => write!(
                f,
                "Stale base version {base} (current {current}, oldest accepted {oldest})"
            ),
            Self::Operation(e) => write!(f, "{e}"),
            Self::SessionClosed => write!(f, "Session closed"),
            Self::SessionFull(max) => write!(f, "Session full ({max} participants)"),
            Self::Store(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<OtError> for SessionError {
    fn from(e: OtError) -> Self {
        SessionError::Operation(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Store(e)
    }
}

pub struct DocumentSession {
    document_id: DocumentId,
    content: String,
    version: u64,
    metadata: DocumentMetadata,
    participants: ParticipantList,
    log: VecDeque<LogEntry>,
    /// Oldest base version the log can still transform from
    log_floor: u64,
    status: SessionStatus,
    config: SessionConfig,
    channel: Arc<dyn ParticipantChannel>,
    persisted_version: u64,
    ops_since_persist: u64,
    persist_in_flight: bool,
}

impl DocumentSession {
    /// Create a session seeded from stored content, or empty at version 0.
    pub fn new(
        document_id: DocumentId,
        stored: Option<StoredDocument>,
        config: SessionConfig,
        channel: Arc<dyn ParticipantChannel>,
    ) -> Self {
        let (content, version, metadata) = match stored {
            Some(doc) => (doc.content, doc.version, doc.metadata),
            None => (String::new(), 0, DocumentMetadata::new(document_id.clone())),
        };

        Self {
            document_id,
            content,
            version,
            metadata,
            participants: ParticipantList::new(),
            log: VecDeque::new(),
            log_floor: version,
            status: SessionStatus::Active,
            config,
            channel,
            persisted_version: version,
            ops_since_persist: 0,
            persist_in_flight: false,
        }
    }

    // ─── Accessors ───────────────────────────────────────────────

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.status == SessionStatus::Closed
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn participants(&self) -> Vec<ParticipantInfo> {
        self.participants.infos()
    }

    pub fn has_participant(&self, connection_id: ConnectionId) -> bool {
        self.participants.contains(connection_id)
    }

    pub fn log(&self) -> impl Iterator<Item = &LogEntry> {
        self.log.iter()
    }

    /// Oldest base version still accepted.
    pub fn oldest_base_version(&self) -> u64 {
        self.log_floor
    }

    pub fn persisted_version(&self) -> u64 {
        self.persisted_version
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            document_id: self.document_id.clone(),
            content: self.content.clone(),
            version: self.version,
            metadata: self.metadata.clone(),
            participants: self.participants.infos(),
        }
    }

    // ─── Membership ──────────────────────────────────────────────

    /// Register a participant and send it the current state.
    ///
    /// Joining again on the same connection resynchronizes it: a fresh
    /// snapshot is sent and the others are not notified.
    pub fn join(
        &mut self,
        connection_id: ConnectionId,
        user: UserInfo,
    ) -> Result<SessionSnapshot, SessionError> {
        if self.status == SessionStatus::Closed {
            return Err(SessionError::SessionClosed);
        }

        if let Some(existing) = self.participants.get_mut(connection_id) {
            existing.rename(user.name);
            existing.resync(self.version);
            let snapshot = self.snapshot();
            self.channel.send_to(connection_id, Arc::new(snapshot.to_event()));
            log::debug!("Connection {connection_id} resynced {} at v{}", self.document_id, self.version);
            return Ok(snapshot);
        }

        if self.participants.len() >= self.config.max_participants {
            return Err(SessionError::SessionFull(self.config.max_participants));
        }

        if self.status == SessionStatus::Draining {
            log::info!("Session {} revived while draining", self.document_id);
            self.status = SessionStatus::Active;
        }

        let participant = Participant::new(connection_id, user, self.version);
        let info = participant.info().clone();
        self.participants.insert(participant);
        self.channel.subscribe(&self.document_id, connection_id);

        let snapshot = self.snapshot();
        self.channel.send_to(connection_id, Arc::new(snapshot.to_event()));
        self.channel.broadcast(
            &self.document_id,
            Arc::new(ServerEvent::ParticipantJoined {
                document_id: self.document_id.clone(),
                participant: info.clone(),
            }),
            Some(connection_id),
        );

        log::info!(
            "{} ({}) joined {} at v{} [{} connected]",
            info.display_name,
            connection_id,
            self.document_id,
            self.version,
            self.participants.len()
        );
        Ok(snapshot)
    }

    /// Remove a participant. The last leave starts draining.
    pub fn leave(&mut self, connection_id: ConnectionId) -> Result<LeaveOutcome, SessionError> {
        let participant = self
            .participants
            .remove(connection_id)
            .ok_or(SessionError::UnknownParticipant(connection_id))?;

        self.channel.unsubscribe(&self.document_id, connection_id);
        self.channel.broadcast(
            &self.document_id,
            Arc::new(ServerEvent::ParticipantLeft {
                document_id: self.document_id.clone(),
                connection_id,
            }),
            Some(connection_id),
        );
        log::info!(
            "{} ({}) left {}",
            participant.info().display_name,
            connection_id,
            self.document_id
        );

        if !self.participants.is_empty() {
            self.trim_log();
            return Ok(LeaveOutcome::Remaining(self.participants.len()));
        }

        self.status = SessionStatus::Draining;
        self.log.clear();
        self.log_floor = self.version;

        if self.persist_in_flight {
            return Ok(LeaveOutcome::Draining);
        }
        match self.take_persist_request() {
            Some(request) => {
                log::info!("Session {} draining, final save at v{}", self.document_id, self.version);
                Ok(LeaveOutcome::Drain(request))
            }
            None => {
                self.status = SessionStatus::Closed;
                log::info!("Session {} closed", self.document_id);
                Ok(LeaveOutcome::Closed)
            }
        }
    }

    // ─── Editing ─────────────────────────────────────────────────

    /// Transform, apply, log and broadcast a client operation.
    ///
    /// On error nothing changes and nothing is broadcast.
    pub fn apply_client_operation(
        &mut self,
        connection_id: ConnectionId,
        operation: Operation,
        base_version: i64,
    ) -> Result<AppliedOperation, SessionError> {
        if self.status == SessionStatus::Closed {
            return Err(SessionError::SessionClosed);
        }
        let user_id = self
            .participants
            .get(connection_id)
            .ok_or(SessionError::UnknownParticipant(connection_id))?
            .user_id()
            .to_string();

        let stale = SessionError::StaleBaseVersion {
            base: base_version,
            current: self.version,
            oldest: self.log_floor,
        };
        let base = u64::try_from(base_version).map_err(|_| stale.clone())?;
        if base > self.version || base < self.log_floor {
            return Err(stale);
        }

        operation.validate()?;

        let mut transformed = operation;
        for entry in self.log.iter().filter(|e| e.version > base) {
            transformed = transform_operation(&transformed, &entry.operation)?;
        }
        let content = apply_operation(&self.content, &transformed)?;
        // Log deletes with the count actually removed; later transforms
        // add to it.
        if let Operation::Delete { count, .. } = &mut transformed {
            *count = char_len(&self.content) - char_len(&content);
        }

        self.content = content;
        self.version += 1;
        self.ops_since_persist += 1;
        self.log.push_back(LogEntry {
            operation: transformed.clone(),
            version: self.version,
        });
        if let Some(participant) = self.participants.get_mut(connection_id) {
            participant.observe_version(base);
        }
        self.trim_log();

        log::debug!(
            "{}: v{} {:?} from {} (base v{})",
            self.document_id,
            self.version,
            transformed,
            user_id,
            base
        );

        self.channel.broadcast(
            &self.document_id,
            Arc::new(ServerEvent::Operation {
                document_id: self.document_id.clone(),
                operation: transformed.clone(),
                version: self.version,
                user_id: user_id.clone(),
            }),
            None,
        );

        Ok(AppliedOperation {
            operation: transformed,
            version: self.version,
            user_id,
        })
    }

    pub fn update_cursor(
        &mut self,
        connection_id: ConnectionId,
        position: CursorPosition,
    ) -> Result<(), SessionError> {
        self.participants
            .get_mut(connection_id)
            .ok_or(SessionError::UnknownParticipant(connection_id))?
            .set_cursor(position);

        log::trace!("{}: cursor {connection_id} -> {position:?}", self.document_id);
        self.channel.broadcast(
            &self.document_id,
            Arc::new(ServerEvent::Cursor {
                document_id: self.document_id.clone(),
                connection_id,
                position,
            }),
            Some(connection_id),
        );
        Ok(())
    }

    pub fn update_selection(
        &mut self,
        connection_id: ConnectionId,
        range: SelectionRange,
    ) -> Result<(), SessionError> {
        let range = range.normalized();
        self.participants
            .get_mut(connection_id)
            .ok_or(SessionError::UnknownParticipant(connection_id))?
            .set_selection(range);

        log::trace!("{}: selection {connection_id} -> {range:?}", self.document_id);
        self.channel.broadcast(
            &self.document_id,
            Arc::new(ServerEvent::Selection {
                document_id: self.document_id.clone(),
                connection_id,
                range,
            }),
            Some(connection_id),
        );
        Ok(())
    }

    /// Drop entries no connected participant can still reference.
    fn trim_log(&mut self) {
        if let Some(min_base) = self.participants.min_base_version() {
            while self.log.front().is_some_and(|e| e.version <= min_base) {
                self.pop_log_front();
            }
        }
        while self.log.len() > self.config.max_log_entries {
            self.pop_log_front();
        }
    }

    fn pop_log_front(&mut self) {
        if let Some(entry) = self.log.pop_front() {
            self.log_floor = entry.version;
        }
    }

    // ─── Persistence ─────────────────────────────────────────────

    /// Enough operations have accumulated for an eager save.
    pub fn persist_due(&self) -> bool {
        !self.persist_in_flight
            && self.version > self.persisted_version
            && self.ops_since_persist >= self.config.persist_every_ops
    }

    /// Start a save of unsaved content. `None` if clean or a save is running.
    pub fn take_persist_request(&mut self) -> Option<PersistRequest> {
        if self.persist_in_flight || self.version <= self.persisted_version {
            return None;
        }
        self.persist_in_flight = true;
        self.ops_since_persist = 0;
        Some(PersistRequest {
            document_id: self.document_id.clone(),
            content: self.content.clone(),
            version: self.version,
        })
    }

    /// Record a successful save and notify participants.
    pub fn mark_persisted(&mut self, version: u64, metadata: DocumentMetadata) -> AfterPersist {
        self.persist_in_flight = false;
        if version >= self.persisted_version {
            self.persisted_version = version;
            self.metadata = metadata;
        }

        self.channel.broadcast(
            &self.document_id,
            Arc::new(ServerEvent::Saved {
                document_id: self.document_id.clone(),
                version,
            }),
            None,
        );
        log::info!("Saved {} at v{}", self.document_id, version);

        if self.status != SessionStatus::Draining {
            return AfterPersist::Idle;
        }
        match self.take_persist_request() {
            Some(request) => AfterPersist::Again(request),
            None => {
                self.status = SessionStatus::Closed;
                log::info!("Session {} closed", self.document_id);
                AfterPersist::Closed
            }
        }
    }

    /// Record a failed save. The next persist cycle retries.
    pub fn persist_failed(&mut self) {
        self.persist_in_flight = false;
    }

    // ─── Diagnostics ─────────────────────────────────────────────

    /// Re-apply the retained log to `baseline` (content at `baseline_version`).
    ///
    /// Returns the content after every logged version, oldest first.
    pub fn replay_log(
        &self,
        baseline: &str,
        baseline_version: u64,
    ) -> Result<Vec<(u64, String)>, SessionError> {
        if baseline_version < self.log_floor || baseline_version > self.version {
            return Err(SessionError::StaleBaseVersion {
                base: baseline_version as i64,
                current: self.version,
                oldest: self.log_floor,
            });
        }

        let mut content = baseline.to_string();
        let mut states = Vec::new();
        for entry in self.log.iter().filter(|e| e.version > baseline_version) {
            content = apply_operation(&content, &entry.operation)?;
            states.push((entry.version, content.clone()));
        }
        Ok(states)
    }
}
