//! Commands sent from [`AssistantCoordinator`](super::coordinator::AssistantCoordinator)
//! handles to the dispatcher task.

use crate::error::Result;
use tokio::sync::oneshot;

/// One request to the dispatcher. Every command carries its reply channel.
#[derive(Debug)]
pub(crate) enum Command {
    Connect(oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<()>),
    StartRecording(oneshot::Sender<Result<()>>),
    StopRecording(oneshot::Sender<()>),
    SendText(String, oneshot::Sender<Result<()>>),
}
