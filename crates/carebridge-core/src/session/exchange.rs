//! Background task driving one exchange.
//!
//! The task opens the transport, runs chunks through the frame decoder and
//! the interpreter, and forwards generation-tagged updates to the session.
//! It never touches session state.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::protocol::{FrameDecoder, StreamSignal, interpret};
use crate::transport::{ChatError, ChatRequest, ChatTransport};

/// Progress of an exchange, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExchangeUpdate {
    /// The transport accepted the request; chunks follow.
    Opened,
    Signal(StreamSignal),
    /// The stream closed without a terminal frame.
    Ended,
    Failed(ChatError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tagged {
    pub generation: u64,
    pub update: ExchangeUpdate,
}

pub(crate) type UpdateTx = mpsc::UnboundedSender<Tagged>;
pub(crate) type UpdateRx = mpsc::UnboundedReceiver<Tagged>;

struct Forwarder {
    tx: UpdateTx,
    generation: u64,
}

impl Forwarder {
    /// Returns false once the session is gone.
    fn send(&self, update: ExchangeUpdate) -> bool {
        self.tx
            .send(Tagged {
                generation: self.generation,
                update,
            })
            .is_ok()
    }

    /// Returns false when no further lines should be processed.
    fn line(&self, line: &str) -> bool {
        match interpret(line) {
            Some(signal) => {
                let terminal = signal.is_terminal();
                self.send(ExchangeUpdate::Signal(signal)) && !terminal
            }
            None => true,
        }
    }
}

pub(crate) async fn run_exchange<T: ChatTransport>(
    transport: Arc<T>,
    request: ChatRequest,
    generation: u64,
    idle_timeout: Option<Duration>,
    tx: UpdateTx,
) {
    let forward = Forwarder { tx, generation };

    let mut chunks = match transport.open(request).await {
        Ok(chunks) => chunks,
        Err(err) => {
            forward.send(ExchangeUpdate::Failed(err));
            return;
        }
    };
    if !forward.send(ExchangeUpdate::Opened) {
        return;
    }

    let mut decoder = FrameDecoder::new();
    loop {
        let next = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, chunks.next()).await {
                Ok(next) => next,
                Err(_elapsed) => {
                    forward.send(ExchangeUpdate::Failed(ChatError::network(format!(
                        "No data received for {}s",
                        limit.as_secs()
                    ))));
                    return;
                }
            },
            None => chunks.next().await,
        };

        match next {
            Some(Ok(bytes)) => {
                for line in decoder.feed(&bytes) {
                    if !forward.line(&line) {
                        return;
                    }
                }
            }
            Some(Err(err)) => {
                forward.send(ExchangeUpdate::Failed(err));
                return;
            }
            None => break,
        }
    }

    if let Some(line) = decoder.finish()
        && !forward.line(&line)
    {
        return;
    }
    forward.send(ExchangeUpdate::Ended);
}
