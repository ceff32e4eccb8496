//! Assistant orchestration: the dispatcher that ties the live session to
//! audio, tools, and the transcript.

pub mod coordinator;
pub(crate) mod messages;
