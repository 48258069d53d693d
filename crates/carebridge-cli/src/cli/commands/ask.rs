//! Ask command handler.

use anyhow::{Context, Result};
use carebridge_core::session::{ChatSession, SessionEvent, SessionEventRx};
use carebridge_core::transport::HttpTransport;

use crate::cli::render::Printer;

/// Sends `prompt`, streams the answer to stdout and fails if the exchange
/// ends in an error entry.
pub async fn run(
    mut session: ChatSession<HttpTransport>,
    mut events: SessionEventRx,
    prompt: &str,
) -> Result<()> {
    session.send(prompt).context("send prompt")?;

    let mut printer = Printer::new(std::io::stdout());
    let mut failure = None;
    loop {
        let busy = session.process_next().await;
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::EntryFailed(entry) = &event {
                printer.end_line().context("write answer")?;
                failure = Some(entry.content.clone());
            } else {
                printer.apply(&event).context("write answer")?;
            }
        }
        if !busy {
            break;
        }
    }

    match failure {
        Some(message) => anyhow::bail!("{message}"),
        None => Ok(()),
    }
}
