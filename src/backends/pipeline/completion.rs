// SPDX-License-Identifier: GPL-3.0-only

//! Per-pipeline completion channels
//!
//! Pipelines never call into the core directly. Each one owns a
//! [`CompletionSender`] that only enqueues; a dedicated worker per pipeline
//! drains the channel and hands messages to the [`CompletionHandler`]. Messages
//! from one pipeline are therefore handled in the order that pipeline sent
//! them, while different pipelines are handled concurrently.

use super::frame_loop::{LoopAction, WorkerLoop};
use super::types::{NotifyMessage, PipelineMessage, PipelineResult};
use crate::backends::metadata::MetadataHandle;
use crate::constants::timing;
use crate::multicam::types::{FrameNumber, PartialResultKind, PipelineId};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Receives pipeline messages on the completion worker threads
pub trait CompletionHandler: Send + Sync {
    fn handle(&self, message: PipelineMessage);
}

/// Enqueue-only handle given to one pipeline
#[derive(Clone)]
pub struct CompletionSender {
    pipeline_id: PipelineId,
    tx: Sender<PipelineMessage>,
}

impl CompletionSender {
    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    /// Returns false when the router has gone away
    pub fn send(&self, message: PipelineMessage) -> bool {
        if message.pipeline_id() != self.pipeline_id {
            warn!(
                sender = self.pipeline_id,
                claimed = message.pipeline_id(),
                "Pipeline reported through another pipeline's channel"
            );
        }
        self.tx.send(message).is_ok()
    }

    pub fn send_result(&self, result: PipelineResult) -> bool {
        self.send(PipelineMessage::Result(result))
    }

    pub fn send_partial(
        &self,
        frame_number: FrameNumber,
        kind: PartialResultKind,
        metadata: MetadataHandle,
    ) -> bool {
        self.send(PipelineMessage::Partial {
            pipeline_id: self.pipeline_id,
            frame_number,
            kind,
            metadata,
        })
    }

    pub fn send_notify(&self, frame_number: FrameNumber, message: NotifyMessage) -> bool {
        self.send(PipelineMessage::Notify {
            pipeline_id: self.pipeline_id,
            frame_number,
            message,
        })
    }
}

/// Owns the receiving ends and their worker loops
pub struct CompletionRouter {
    receivers: Mutex<Vec<Option<Receiver<PipelineMessage>>>>,
    workers: Mutex<Vec<WorkerLoop>>,
}

impl CompletionRouter {
    /// Create one channel per pipeline
    pub fn channels(pipeline_count: usize) -> (Self, Vec<CompletionSender>) {
        let mut receivers = Vec::with_capacity(pipeline_count);
        let mut senders = Vec::with_capacity(pipeline_count);

        for pipeline_id in 0..pipeline_count {
            let (tx, rx) = mpsc::channel();
            senders.push(CompletionSender { pipeline_id, tx });
            receivers.push(Some(rx));
        }

        (
            Self {
                receivers: Mutex::new(receivers),
                workers: Mutex::new(Vec::new()),
            },
            senders,
        )
    }

    pub fn pipeline_count(&self) -> usize {
        self.receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Spawn one worker per channel feeding `handler`
    pub fn start(&mut self, handler: Arc<dyn CompletionHandler>) {
        let receivers = self.receivers.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        for (pipeline_id, slot) in receivers.iter_mut().enumerate() {
            let Some(rx) = slot.take() else {
                debug!(pipeline = pipeline_id, "Completion worker already running");
                continue;
            };
            let handler = Arc::clone(&handler);
            let name = format!("completion-{}", pipeline_id);

            workers.push(WorkerLoop::start(&name, move || {
                match rx.recv_timeout(timing::COMPLETION_POLL_INTERVAL) {
                    Ok(message) => {
                        handler.handle(message);
                        LoopAction::Continue
                    }
                    Err(RecvTimeoutError::Timeout) => LoopAction::Continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        debug!(pipeline = pipeline_id, "Completion channel closed");
                        LoopAction::Stop
                    }
                }
            }));
        }
    }

    /// Stop and join every worker. Messages still queued are dropped.
    pub fn stop(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in workers.iter_mut() {
            worker.stop();
        }
        workers.clear();
    }
}

impl Drop for CompletionRouter {
    fn drop(&mut self) {
        self.stop();
    }
}
