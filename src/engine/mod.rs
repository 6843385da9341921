//! Chat engine
//!
//! Stream decoding, the transcript reducer that applies decoded replies, and
//! the status poller for server-side processing.

pub mod chat;
pub mod poll;
pub mod stream;

pub use chat::{
    ChatRequest, ChatTransport, ChunkStream, SendOutcome, SessionContext, TranscriptReducer,
};
pub use poll::{poll_until_settled, PollOutcome, PollPolicy, ProcessingStatus};
