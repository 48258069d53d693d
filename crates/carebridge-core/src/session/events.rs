//! Session event types for UI collaborators.
//!
//! This module defines the contract between the session and whatever renders
//! the conversation. The session never draws anything itself; it emits
//! `SessionEvent`s over an unbounded channel, in the order they happened.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::transport::Role;

/// Global counter for generating unique entry IDs.
static ENTRY_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transcript entry.
///
/// IDs are monotonically increasing and unique within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

impl EntryId {
    /// Generates a new unique entry ID.
    pub fn new() -> Self {
        EntryId(ENTRY_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

/// UI-facing record of one message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub id: EntryId,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// More content is expected for this entry.
    pub streaming: bool,
    /// The entry describes a failed exchange.
    pub is_error: bool,
}

impl TranscriptEntry {
    /// Creates a new user entry.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            is_error: false,
        }
    }

    /// Creates an empty streaming assistant entry.
    pub fn assistant_streaming() -> Self {
        Self {
            id: EntryId::new(),
            role: Role::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            streaming: true,
            is_error: false,
        }
    }

    /// Creates a finalized assistant entry that takes over `id`.
    pub fn assistant(id: EntryId, content: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            is_error: false,
        }
    }

    /// Creates an assistant error entry that takes over `id`.
    pub fn error(id: EntryId, content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::assistant(id, content)
        }
    }
}

/// Notifications emitted by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new entry was added (user input or the streaming placeholder).
    EntryAppended(TranscriptEntry),

    /// The streaming entry's content changed; `content` is the full text so far.
    EntryDelta { id: EntryId, content: String },

    /// The streaming entry completed; replaces the entry with the same id.
    EntryFinalized(TranscriptEntry),

    /// The exchange failed; replaces the streaming entry with an error entry.
    EntryFailed(TranscriptEntry),

    /// Transcript and history were reset.
    Cleared,
}

/// Channel-based event sender (unbounded, order preserving).
pub type SessionEventTx = mpsc::UnboundedSender<SessionEvent>;

/// Channel-based event receiver.
pub type SessionEventRx = mpsc::UnboundedReceiver<SessionEvent>;

/// Creates an event channel for a session and its UI.
pub fn create_event_channel() -> (SessionEventTx, SessionEventRx) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_ids_are_monotonic() {
        let first = EntryId::new();
        let second = EntryId::new();
        assert!(second > first);
    }

    #[test]
    fn test_error_entry_keeps_id() {
        let placeholder = TranscriptEntry::assistant_streaming();
        let error = TranscriptEntry::error(placeholder.id, "Sorry");
        assert_eq!(error.id, placeholder.id);
        assert!(error.is_error);
        assert!(!error.streaming);
        assert_eq!(error.role, Role::Assistant);
    }
}
