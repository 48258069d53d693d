//! Wire protocol for the chat stream.
//!
//! The backend answers a chat request with newline-delimited frames:
//!
//! ```text
//! data: {"text":"Found "}
//! data: {"text":"1 patient."}
//! event: done
//! data: {}
//! ```
//!
//! - `decoder`: splits raw byte chunks into complete lines
//! - `interpreter`: classifies lines into `StreamSignal`s

pub mod decoder;
pub mod interpreter;

pub use decoder::FrameDecoder;
pub use interpreter::{StreamSignal, interpret};
