//! Interactive chat loop.
//!
//! Reads one message per stdin line and streams answers to stdout. Input
//! and exchange progress are multiplexed on the caller's task, so the
//! session is only ever touched from here. Lines that arrive while an
//! answer is streaming are queued and sent once the session is idle again;
//! only `/clear` takes effect immediately.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use carebridge_core::session::{ChatSession, SessionEventRx};
use carebridge_core::transport::HttpTransport;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::cli::render::Printer;

const PROMPT: &str = "> ";

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Quit,
    Clear,
    Message(&'a str),
}

fn parse_line(line: &str) -> Command<'_> {
    match line.trim() {
        "/quit" | "/exit" => Command::Quit,
        "/clear" => Command::Clear,
        text => Command::Message(text),
    }
}

/// Stdin lines waiting for the session to become idle.
#[derive(Debug)]
struct InputQueue {
    pending: VecDeque<String>,
    open: bool,
}

impl InputQueue {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            open: true,
        }
    }

    /// Accepts a line read from stdin.
    ///
    /// Returns true if `/clear` should be applied right away.
    fn push(&mut self, line: String, busy: bool) -> bool {
        if busy && parse_line(&line) == Command::Clear {
            self.pending.clear();
            return true;
        }
        self.pending.push_back(line);
        false
    }

    /// Stops reading input; queued lines are still processed.
    fn close(&mut self) {
        self.open = false;
    }

    /// Returns true when nothing more will come from this queue.
    fn is_finished(&self) -> bool {
        !self.open && self.pending.is_empty()
    }
}

pub async fn run(
    mut session: ChatSession<HttpTransport>,
    mut events: SessionEventRx,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut printer = Printer::new(std::io::stdout());
    let mut input = InputQueue::new();
    let mut prompted = false;
    let mut quitting = false;

    printer
        .write_str("CareBridge chat. /clear resets the conversation, /quit exits.\n")
        .context("write banner")?;

    loop {
        while !quitting
            && session.state().is_idle()
            && let Some(line) = input.pending.pop_front()
        {
            prompted = false;
            match parse_line(&line) {
                Command::Quit => quitting = true,
                Command::Clear => session.clear(),
                Command::Message(text) => {
                    if let Err(rejected) = session.send(text) {
                        tracing::debug!(%rejected, "Input not sent");
                    }
                }
            }
            while let Ok(event) = events.try_recv() {
                printer.apply(&event).context("write transcript")?;
            }
        }
        if quitting {
            input.close();
            input.pending.clear();
        }

        if input.open && !prompted && session.state().is_idle() {
            printer.write_str(PROMPT).context("write prompt")?;
            prompted = true;
        }

        let busy = !session.state().is_idle();
        if !busy && input.is_finished() {
            break;
        }
        tokio::select! {
            line = lines.next_line(), if input.open => {
                match line.context("read stdin")? {
                    Some(line) => {
                        if input.push(line, busy) {
                            prompted = false;
                            session.clear();
                        }
                    }
                    None => input.close(),
                }
            }
            _ = session.process_next(), if busy => {}
        }

        while let Ok(event) = events.try_recv() {
            printer.apply(&event).context("write transcript")?;
        }
    }

    printer.end_line().context("write transcript")?;
    Ok(())
}
