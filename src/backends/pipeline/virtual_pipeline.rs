// SPDX-License-Identifier: GPL-3.0-only

//! Simulated physical pipelines
//!
//! Each pipeline runs a worker loop that consumes submitted requests in order
//! and reports shutter, partial metadata and full results through its
//! completion sender. Useful for driving a logical camera session without
//! hardware; failures and stalls can be injected per pipeline.

use super::PipelineSession;
use super::completion::CompletionSender;
use super::frame_loop::{LoopAction, WorkerLoop};
use super::types::{BackendResult, BufferStatus, NotifyMessage, PipelineRequest, PipelineResult};
use crate::backends::metadata::{MetadataHandle, Tag, TagMap, TagValue};
use crate::constants::{fusion, timing};
use crate::errors::{LogicalErrorKind, PipelineError};
use crate::multicam::types::{FrameNumber, PartialResultKind, PipelineId, SceneState};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tags copied from request settings into result metadata
const ECHOED_TAGS: [Tag; 7] = [
    Tag::ZoomRatio,
    Tag::LensFocalLength,
    Tag::SensorSensitivity,
    Tag::AeRegions,
    Tag::AfRegions,
    Tag::AwbRegions,
    Tag::MasterCamera,
];

/// AE converged
const AE_STATE_CONVERGED: i64 = 2;
/// AF passively focused
const AF_STATE_FOCUSED: i64 = 2;

#[derive(Debug, Clone)]
pub struct VirtualPipelineConfig {
    /// Scene reported in result metadata
    pub scene: SceneState,
    /// Emit driver and processing-graph partials before each result
    pub emit_partials: bool,
    /// Extra latency before each pipeline reports its result
    pub result_delays: Vec<Duration>,
    /// Time `activate` blocks while the sensor starts streaming
    pub activation_delay: Duration,
}

impl Default for VirtualPipelineConfig {
    fn default() -> Self {
        Self {
            scene: SceneState {
                lux_index: 50.0,
                focus_distance_cm: fusion::FOCUS_DISTANCE_CM_MAX,
            },
            emit_partials: true,
            result_delays: Vec::new(),
            activation_delay: timing::VIRTUAL_ACTIVATION_DELAY,
        }
    }
}

struct Shared {
    config: VirtualPipelineConfig,
    active: Vec<AtomicBool>,
    stalled: Vec<AtomicBool>,
    /// Bumped by flush; requests stamped with an older epoch are abandoned
    epoch: AtomicU64,
    failures: Mutex<HashSet<(PipelineId, FrameNumber)>>,
    scene: Mutex<SceneState>,
    closed: AtomicBool,
    processed: AtomicU64,
}

pub struct VirtualPipelineSession {
    shared: Arc<Shared>,
    queues: Vec<Sender<(u64, PipelineRequest)>>,
    workers: Mutex<Vec<WorkerLoop>>,
}

impl VirtualPipelineSession {
    /// One simulated pipeline per completion sender
    pub fn new(config: VirtualPipelineConfig, senders: Vec<CompletionSender>) -> Self {
        let count = senders.len();
        let shared = Arc::new(Shared {
            scene: Mutex::new(config.scene),
            config,
            active: (0..count).map(|_| AtomicBool::new(false)).collect(),
            stalled: (0..count).map(|_| AtomicBool::new(false)).collect(),
            epoch: AtomicU64::new(0),
            failures: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            processed: AtomicU64::new(0),
        });

        let mut queues = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for sender in senders {
            let (tx, rx) = mpsc::channel::<(u64, PipelineRequest)>();
            let shared = Arc::clone(&shared);
            let name = format!("virtual-pipeline-{}", sender.pipeline_id());

            workers.push(WorkerLoop::start(&name, move || {
                match rx.recv_timeout(timing::COMPLETION_POLL_INTERVAL) {
                    Ok((epoch, request)) => {
                        process(&shared, &sender, epoch, request);
                        LoopAction::Continue
                    }
                    Err(RecvTimeoutError::Timeout) => LoopAction::Continue,
                    Err(RecvTimeoutError::Disconnected) => LoopAction::Stop,
                }
            }));
            queues.push(tx);
        }

        info!(pipelines = count, "Virtual pipeline session started");
        Self {
            shared,
            queues,
            workers: Mutex::new(workers),
        }
    }

    /// Report an error instead of a result for one frame on one pipeline
    pub fn fail_frame(&self, pipeline_id: PipelineId, frame_number: FrameNumber) {
        self.shared
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((pipeline_id, frame_number));
    }

    /// A stalled pipeline silently swallows requests
    pub fn set_stalled(&self, pipeline_id: PipelineId, stalled: bool) {
        if let Some(flag) = self.shared.stalled.get(pipeline_id) {
            flag.store(stalled, Ordering::SeqCst);
        }
    }

    /// Scene reported by subsequent results
    pub fn set_scene(&self, scene: SceneState) {
        *self.shared.scene.lock().unwrap_or_else(PoisonError::into_inner) = scene;
    }

    /// Requests that produced a result or an error
    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    /// Stop every worker; later calls fail with [`PipelineError::Closed`]
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker in workers.iter_mut() {
            worker.stop();
        }
        workers.clear();
        info!("Virtual pipeline session stopped");
    }

    fn check(&self, pipeline_id: PipelineId) -> BackendResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Closed);
        }
        if pipeline_id >= self.queues.len() {
            return Err(PipelineError::UnknownPipeline(pipeline_id));
        }
        Ok(())
    }
}

impl PipelineSession for VirtualPipelineSession {
    fn pipeline_count(&self) -> usize {
        self.queues.len()
    }

    fn activate(&self, pipeline_id: PipelineId) -> BackendResult<()> {
        self.check(pipeline_id)?;
        if !self.shared.active[pipeline_id].load(Ordering::SeqCst) {
            std::thread::sleep(self.shared.config.activation_delay);
            self.shared.active[pipeline_id].store(true, Ordering::SeqCst);
            debug!(pipeline = pipeline_id, "Virtual pipeline streaming");
        }
        Ok(())
    }

    fn deactivate(&self, pipeline_id: PipelineId) -> BackendResult<()> {
        self.check(pipeline_id)?;
        self.shared.active[pipeline_id].store(false, Ordering::SeqCst);
        debug!(pipeline = pipeline_id, "Virtual pipeline in low power");
        Ok(())
    }

    fn is_active(&self, pipeline_id: PipelineId) -> bool {
        self.shared
            .active
            .get(pipeline_id)
            .is_some_and(|a| a.load(Ordering::SeqCst))
    }

    fn submit(&self, requests: Vec<PipelineRequest>) -> BackendResult<()> {
        for request in &requests {
            self.check(request.pipeline_id)?;
        }

        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        for request in requests {
            let pipeline_id = request.pipeline_id;
            if !self.is_active(pipeline_id) {
                warn!(pipeline = pipeline_id, frame = request.frame_number, "Request for inactive pipeline");
            }
            self.queues[pipeline_id]
                .send((epoch, request))
                .map_err(|_| PipelineError::SubmitFailed(format!("pipeline {} queue closed", pipeline_id)))?;
        }
        Ok(())
    }

    fn flush(&self) -> BackendResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::Closed);
        }
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        info!(epoch, "Virtual pipelines flushed");
        Ok(())
    }
}

impl Drop for VirtualPipelineSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn process(shared: &Shared, sender: &CompletionSender, epoch: u64, request: PipelineRequest) {
    let pipeline_id = sender.pipeline_id();
    let frame_number = request.frame_number;

    if epoch != shared.epoch.load(Ordering::SeqCst) {
        debug!(pipeline = pipeline_id, frame = frame_number, "Abandoning flushed request");
        return;
    }
    if shared.stalled[pipeline_id].load(Ordering::SeqCst) {
        debug!(pipeline = pipeline_id, frame = frame_number, "Stalled pipeline dropped request");
        return;
    }

    let PipelineRequest {
        output_buffers,
        input_buffer,
        input_metadata,
        output_metadata,
        ..
    } = request;

    // Settings are consumed here; the input entry goes back to its pool
    let settings = input_metadata.snapshot();
    drop(input_metadata);

    let timestamp_ns = chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|ns| ns as u64)
        .unwrap_or_default();
    sender.send_notify(frame_number, NotifyMessage::Shutter { timestamp_ns });

    if shared.config.emit_partials {
        let mut driver = TagMap::new();
        driver.insert(Tag::AeState, TagValue::Int(AE_STATE_CONVERGED));
        sender.send_partial(
            frame_number,
            PartialResultKind::Driver,
            MetadataHandle::detached(frame_number, driver),
        );
        let mut chi = TagMap::new();
        chi.insert(Tag::AfState, TagValue::Int(AF_STATE_FOCUSED));
        sender.send_partial(
            frame_number,
            PartialResultKind::Chi,
            MetadataHandle::detached(frame_number, chi),
        );
    }

    let failed = shared
        .failures
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&(pipeline_id, frame_number));
    if failed {
        shared.processed.fetch_add(1, Ordering::SeqCst);
        sender.send_notify(frame_number, NotifyMessage::Error(LogicalErrorKind::Result));
        return;
    }

    if let Some(delay) = shared.config.result_delays.get(pipeline_id)
        && !delay.is_zero()
    {
        std::thread::sleep(*delay);
    }

    let scene = *shared.scene.lock().unwrap_or_else(PoisonError::into_inner);
    for tag in ECHOED_TAGS {
        if let Some(value) = settings.get(&tag) {
            output_metadata.set(tag, value.clone());
        }
    }
    output_metadata.set(Tag::SensorTimestamp, TagValue::Int(timestamp_ns as i64));
    output_metadata.set(Tag::LuxIndex, TagValue::Float(scene.lux_index));
    output_metadata.set(Tag::FocusDistanceCm, TagValue::Float(scene.focus_distance_cm));
    output_metadata.set(Tag::AeState, TagValue::Int(AE_STATE_CONVERGED));
    output_metadata.set(Tag::AfState, TagValue::Int(AF_STATE_FOCUSED));

    let output_buffers = output_buffers
        .into_iter()
        .map(|mut b| {
            b.status = BufferStatus::Ok;
            b.release_fence = None;
            b
        })
        .collect();

    shared.processed.fetch_add(1, Ordering::SeqCst);
    sender.send_result(PipelineResult {
        pipeline_id,
        frame_number,
        metadata: output_metadata,
        output_buffers,
        input_buffer,
    });
}
