//! Bounded queue between the frame producers of a bridge and the remote stream.
//!
//! Control frames are never dropped: when the queue is full their producer
//! waits. Audio frames evict the oldest queued audio frame instead, so stale
//! audio is shed first and the relative order of control frames is untouched.

use futures_util::stream;
use sonic_bridge_core::{OutboundFrame, OutboundFrames};
use std::{collections::VecDeque, pin::pin, sync::Arc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("outbound queue is closed")]
    Closed,
    #[error("outbound queue no longer accepts frames from producers")]
    Halted,
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<OutboundFrame>,
    closed: bool,
    halted: bool,
    dropped_audio: u64,
}

#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            capacity: capacity.max(1),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        })
    }

    /// Enqueues a frame, waiting for room if it is a control frame.
    pub async fn push(&self, frame: OutboundFrame) -> Result<(), QueueError> {
        self.enqueue(frame, false).await
    }

    /// Enqueues a teardown frame. Unlike [`push`](Self::push) this still works
    /// after [`halt_producers`](Self::halt_producers).
    pub async fn push_final(&self, frame: OutboundFrame) -> Result<(), QueueError> {
        self.enqueue(frame, true).await
    }

    async fn enqueue(&self, frame: OutboundFrame, teardown: bool) -> Result<(), QueueError> {
        loop {
            let mut room = pin!(self.not_full.notified());
            room.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.halted && !teardown {
                    return Err(QueueError::Halted);
                }
                if state.frames.len() < self.capacity {
                    state.frames.push_back(frame);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
                if frame.is_audio() {
                    if let Some(oldest) = state.frames.iter().position(OutboundFrame::is_audio) {
                        state.frames.remove(oldest);
                        state.dropped_audio += 1;
                        if state.dropped_audio.is_power_of_two() {
                            warn!(dropped = state.dropped_audio, "Outbound queue full; shedding stale audio.");
                        }
                        state.frames.push_back(frame);
                        drop(state);
                        self.not_empty.notify_one();
                        return Ok(());
                    }
                }
                debug!(event = frame.name(), "Outbound queue full; waiting for room.");
            }
            room.await;
        }
    }

    /// Takes the next frame, waiting if the queue is empty. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<OutboundFrame> {
        loop {
            let mut ready = pin!(self.not_empty.notified());
            ready.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if let Some(frame) = state.frames.pop_front() {
                    drop(state);
                    self.not_full.notify_waiters();
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Makes every waiting and future [`push`](Self::push) fail with
    /// [`QueueError::Halted`]. Used at the start of teardown so that no
    /// producer stays blocked on a stalled remote stream.
    pub async fn halt_producers(&self) {
        self.state.lock().await.halted = true;
        self.not_full.notify_waiters();
    }

    /// Stops accepting frames. Frames already queued are still delivered.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        self.not_empty.notify_one();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.frames.len()
    }

    pub async fn dropped_audio(&self) -> u64 {
        self.state.lock().await.dropped_audio
    }

    /// The consumer side as a frame stream, ending once closed and drained.
    pub fn frames(self: &Arc<Self>) -> OutboundFrames {
        Box::pin(stream::unfold(self.clone(), |queue| async move {
            queue.pop().await.map(|frame| (frame, queue))
        }))
    }
}
