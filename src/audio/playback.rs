//! Speaker playback pipeline.
//!
//! A FIFO of PCM16 chunks drained by exactly one consumer task, so chunks
//! play in arrival order and never overlap. `interrupt` empties the queue
//! without waiting for the chunk currently being written.

use crate::audio::device::PlaybackDevice;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Queue {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl Queue {
    fn chunks(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.chunks().pop_front()
    }
}

/// Ordered, interruptible speaker output.
pub struct PlaybackPipeline {
    queue: Arc<Queue>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PlaybackPipeline {
    /// Start the consumer. Write failures are reported on `errors` and the
    /// failed chunk is dropped.
    pub fn start(
        device: Box<dyn PlaybackDevice>,
        errors: Option<mpsc::UnboundedSender<String>>,
    ) -> Self {
        let queue = Arc::new(Queue::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(consume(
            device,
            Arc::clone(&queue),
            cancel.clone(),
            errors,
        ));
        Self {
            queue,
            cancel,
            task: Some(task),
        }
    }

    /// Append a chunk. Empty chunks are ignored.
    pub fn enqueue(&self, pcm: Vec<u8>) {
        if pcm.is_empty() {
            return;
        }
        self.queue.chunks().push_back(pcm);
        self.queue.notify.notify_one();
    }

    /// Discard every queued chunk. Returns how many were dropped.
    pub fn interrupt(&self) -> usize {
        let dropped = {
            let mut q = self.queue.chunks();
            let n = q.len();
            q.clear();
            n
        };
        if dropped > 0 {
            debug!(dropped, "playback interrupted");
        }
        dropped
    }

    /// Chunks waiting to be played.
    pub fn pending(&self) -> usize {
        self.queue.chunks().len()
    }

    /// Stop the consumer, drop queued audio, and release the device.
    pub async fn shutdown(mut self) {
        self.interrupt();
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn consume(
    mut device: Box<dyn PlaybackDevice>,
    queue: Arc<Queue>,
    cancel: CancellationToken,
    errors: Option<mpsc::UnboundedSender<String>>,
) {
    let mut played = 0u64;
    loop {
        let chunk = match queue.pop() {
            Some(chunk) => chunk,
            None => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = queue.notify.notified() => {}
                }
                continue;
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = device.write(&chunk) => r,
        };
        match result {
            Ok(()) => played += 1,
            Err(e) => {
                warn!("playback write failed: {e}");
                if let Some(tx) = &errors {
                    let _ = tx.send(e.to_string());
                }
            }
        }
    }
    device.release();
    info!(played, "playback stopped");
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::test_utils::RecordingPlayback;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn plays_in_order() {
        let (device, log) = RecordingPlayback::new(Duration::ZERO);
        let playback = PlaybackPipeline::start(Box::new(device), None);
        playback.enqueue(vec![1]);
        playback.enqueue(vec![2, 2]);
        playback.enqueue(vec![3, 3, 3]);
        timeout(WAIT, log.wait_for_writes(3)).await.unwrap();
        assert_eq!(log.writes(), vec![vec![1], vec![2, 2], vec![3, 3, 3]]);
        playback.shutdown().await;
        assert!(log.is_released());
    }

    #[tokio::test]
    async fn interrupt_discards_queued_chunks() {
        // Slow device keeps the first chunk in flight.
        let (device, log) = RecordingPlayback::new(Duration::from_millis(200));
        let playback = PlaybackPipeline::start(Box::new(device), None);
        playback.enqueue(vec![1]);
        timeout(WAIT, log.wait_for_started(1)).await.unwrap();
        playback.enqueue(vec![2]);
        playback.enqueue(vec![3]);
        assert_eq!(playback.pending(), 2);

        assert_eq!(playback.interrupt(), 2);
        assert_eq!(playback.pending(), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(log.writes(), vec![vec![1]]);
        playback.shutdown().await;
    }

    #[tokio::test]
    async fn playback_resumes_after_interrupt() {
        let (device, log) = RecordingPlayback::new(Duration::ZERO);
        let playback = PlaybackPipeline::start(Box::new(device), None);
        playback.interrupt();
        playback.enqueue(vec![9]);
        timeout(WAIT, log.wait_for_writes(1)).await.unwrap();
        assert_eq!(log.writes(), vec![vec![9]]);
        playback.shutdown().await;
    }

    #[tokio::test]
    async fn write_errors_are_reported_and_skipped() {
        let (device, log) = RecordingPlayback::failing_first(Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let playback = PlaybackPipeline::start(Box::new(device), Some(tx));
        playback.enqueue(vec![1]);
        playback.enqueue(vec![2]);
        let err = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(err.contains("device busy"));
        timeout(WAIT, log.wait_for_writes(1)).await.unwrap();
        assert_eq!(log.writes(), vec![vec![2]]);
        playback.shutdown().await;
    }

    #[tokio::test]
    async fn empty_chunks_are_ignored() {
        let (device, _log) = RecordingPlayback::new(Duration::ZERO);
        let playback = PlaybackPipeline::start(Box::new(device), None);
        playback.enqueue(Vec::new());
        assert_eq!(playback.pending(), 0);
        playback.shutdown().await;
    }
}
