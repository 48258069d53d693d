//! Streaming transport to the chat backend.
//!
//! A transport opens one request per send and hands back the response body
//! as an ordered stream of raw byte chunks. Failures before the first chunk
//! are returned from `open`; failures while reading surface as stream items.

mod http;
pub mod shared;

use bytes::Bytes;
use futures_util::stream::BoxStream;

pub use http::HttpTransport;
pub use shared::{ChatError, ChatErrorKind, ChatRequest, ChatResult, Role, Turn, USER_AGENT};

/// Boxed stream of response body chunks.
pub type ChunkStream = BoxStream<'static, ChatResult<Bytes>>;

/// Opens streamed chat responses.
pub trait ChatTransport: Send + Sync + 'static {
    /// Sends `request` and returns the response body as a chunk stream.
    ///
    /// # Errors
    /// Returns `NetworkFailure` if the backend cannot be reached and
    /// `ProtocolFailure` for a non-success status.
    fn open(&self, request: ChatRequest) -> impl Future<Output = ChatResult<ChunkStream>> + Send;
}
