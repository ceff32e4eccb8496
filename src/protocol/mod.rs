//! Wire protocol for the realtime session: outbound message builders and
//! the inbound frame decoder.

pub mod events;
pub mod messages;

pub use events::{ServerEvent, ToolCallRequest, decode_frame};
