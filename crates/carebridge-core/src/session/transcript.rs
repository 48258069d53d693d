//! UI-side transcript model built from `SessionEvent`s.

use super::events::{EntryId, SessionEvent, TranscriptEntry};

/// Ordered list of transcript entries as a UI would display them.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one session event.
    pub fn apply(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::EntryAppended(entry) => self.entries.push(entry.clone()),
            SessionEvent::EntryDelta { id, content } => {
                if let Some(entry) = self.get_mut(*id) {
                    entry.content.clone_from(content);
                }
            }
            SessionEvent::EntryFinalized(entry) | SessionEvent::EntryFailed(entry) => {
                match self.get_mut(entry.id) {
                    Some(existing) => *existing = entry.clone(),
                    None => self.entries.push(entry.clone()),
                }
            }
            SessionEvent::Cleared => self.entries.clear(),
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn get(&self, id: EntryId) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true while an entry is still receiving content.
    pub fn is_streaming(&self) -> bool {
        self.entries.iter().any(|entry| entry.streaming)
    }

    fn get_mut(&mut self, id: EntryId) -> Option<&mut TranscriptEntry> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_then_finalize_replaces_in_place() {
        let mut transcript = Transcript::new();
        let user = TranscriptEntry::user("hi");
        let placeholder = TranscriptEntry::assistant_streaming();
        let id = placeholder.id;

        transcript.apply(&SessionEvent::EntryAppended(user));
        transcript.apply(&SessionEvent::EntryAppended(placeholder));
        assert!(transcript.is_streaming());

        transcript.apply(&SessionEvent::EntryDelta {
            id,
            content: "Hel".to_string(),
        });
        assert_eq!(transcript.get(id).unwrap().content, "Hel");

        transcript.apply(&SessionEvent::EntryFinalized(TranscriptEntry::assistant(
            id, "Hello",
        )));
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript.last().unwrap().content, "Hello");
        assert!(!transcript.is_streaming());
    }

    #[test]
    fn test_delta_for_unknown_entry_is_ignored() {
        let mut transcript = Transcript::new();
        transcript.apply(&SessionEvent::EntryDelta {
            id: EntryId::new(),
            content: "ghost".to_string(),
        });
        assert!(transcript.is_empty());
    }

    #[test]
    fn test_cleared_empties_transcript() {
        let mut transcript = Transcript::new();
        transcript.apply(&SessionEvent::EntryAppended(TranscriptEntry::user("hi")));
        transcript.apply(&SessionEvent::Cleared);
        assert!(transcript.is_empty());
    }
}
