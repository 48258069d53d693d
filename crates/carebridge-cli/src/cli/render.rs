//! Plain-text rendering of session events.

use std::io::{self, Write};

use carebridge_core::session::SessionEvent;
use carebridge_core::transport::Role;

/// Prints assistant text incrementally.
///
/// Deltas carry the accumulated content of the entry, so only the part not
/// yet printed is written.
pub struct Printer<W: Write> {
    out: W,
    printed: usize,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W) -> Self {
        Self { out, printed: 0 }
    }

    /// Renders one event.
    ///
    /// # Errors
    /// Returns an error if writing to the output fails.
    pub fn apply(&mut self, event: &SessionEvent) -> io::Result<()> {
        match event {
            SessionEvent::EntryAppended(entry) => {
                if entry.role == Role::Assistant {
                    self.printed = 0;
                }
            }
            SessionEvent::EntryDelta { content, .. } => self.write_unprinted(content)?,
            SessionEvent::EntryFinalized(entry) => {
                self.write_unprinted(&entry.content)?;
                self.end_line()?;
            }
            SessionEvent::EntryFailed(entry) => {
                self.end_line()?;
                writeln!(self.out, "{}", entry.content)?;
            }
            SessionEvent::Cleared => {
                self.end_line()?;
                writeln!(self.out, "(conversation cleared)")?;
            }
        }
        self.out.flush()
    }

    /// Writes a raw string (prompts, notices).
    ///
    /// # Errors
    /// Returns an error if writing to the output fails.
    pub fn write_str(&mut self, text: &str) -> io::Result<()> {
        self.out.write_all(text.as_bytes())?;
        self.out.flush()
    }

    /// Terminates a partially printed answer.
    ///
    /// # Errors
    /// Returns an error if writing to the output fails.
    pub fn end_line(&mut self) -> io::Result<()> {
        if self.printed > 0 {
            writeln!(self.out)?;
            self.printed = 0;
        }
        Ok(())
    }

    fn write_unprinted(&mut self, content: &str) -> io::Result<()> {
        if let Some(rest) = content.get(self.printed..) {
            self.out.write_all(rest.as_bytes())?;
            self.printed = content.len();
        }
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}
