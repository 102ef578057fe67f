// SPDX-License-Identifier: GPL-3.0-only

//! Fan-in of physical pipeline results
//!
//! Every completion worker calls into one [`ResultAggregator`]. Per callback
//! the aggregation map lock is held only to look up, mutate and possibly
//! remove one record; wire translation happens before taking the lock and
//! the outward result is built and sent after releasing it.
//!
//! Frames are keyed by frame number alone and never batched, so each frame
//! produces exactly one terminal event: a [`LogicalEvent::Result`] or a
//! [`LogicalEvent::Error`]. Terminal events leave in frame-number order: a
//! finished frame waits in the ready queue while a lower frame is in flight.
//! Lock order is records, then ready.

pub mod partial;
pub mod record;

pub use partial::{EarlyDelivery, PartialRing};
pub use record::{AggregationRecord, Contribution, ResultRemap};

use crate::backends::metadata::{MetadataHandle, MetadataStore, Tag, TagMap, TagValue, WireBlob};
use crate::backends::pipeline::{CompletionHandler, NotifyMessage, PipelineMessage, PipelineResult};
use crate::constants::aggregation;
use crate::errors::{AdmissionError, LogicalErrorKind, ProtocolError};
use crate::multicam::controller::remap;
use crate::multicam::types::{
    FrameNumber, LogicalEvent, LogicalEventSender, PartialResult, PartialResultKind, PipelineId,
    SceneState,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// How a pipeline error for one frame is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorPolicy {
    /// Deliver the frame with the failed contribution marked as an error
    #[default]
    BestEffort,
    /// Drop the frame and notify the caller right away
    Fatal,
}

/// Snapshot of the aggregator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregatorStats {
    pub results_emitted: u64,
    pub errors_emitted: u64,
    pub protocol_violations: u64,
    pub partials_forwarded: u64,
    pub shutters_forwarded: u64,
    pub frames_flushed: u64,
}

#[derive(Default)]
struct StatsCounters {
    results_emitted: AtomicU64,
    errors_emitted: AtomicU64,
    protocol_violations: AtomicU64,
    partials_forwarded: AtomicU64,
    shutters_forwarded: AtomicU64,
    frames_flushed: AtomicU64,
}

/// What a pipeline is to a frame, looked up before translating its metadata
struct Role {
    is_logical: bool,
    remap: Option<ResultRemap>,
}

/// How a finished frame resolves once every lower frame has been delivered
enum Outcome {
    Result(AggregationRecord),
    Error(LogicalErrorKind),
}

type RecordMap = BTreeMap<FrameNumber, AggregationRecord>;

pub struct ResultAggregator {
    records: Mutex<RecordMap>,
    ready: Mutex<BTreeMap<FrameNumber, Outcome>>,
    early: Mutex<PartialRing>,
    store: Arc<dyn MetadataStore>,
    events: LogicalEventSender,
    error_policy: ErrorPolicy,
    scene: Arc<Mutex<SceneState>>,
    stats: StatsCounters,
}

impl ResultAggregator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        events: LogicalEventSender,
        error_policy: ErrorPolicy,
        scene: Arc<Mutex<SceneState>>,
    ) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            ready: Mutex::new(BTreeMap::new()),
            early: Mutex::new(PartialRing::new(aggregation::MAX_OUTSTANDING_REQUESTS)),
            store,
            events,
            error_policy,
            scene,
            stats: StatsCounters::default(),
        }
    }

    /// Register a frame before any of its pipeline requests is submitted
    pub fn insert(&self, record: AggregationRecord) -> Result<(), AdmissionError> {
        let mut records = self.lock_records();
        let frame_number = record.frame_number;
        if records.contains_key(&frame_number) || self.lock_ready().contains_key(&frame_number) {
            return Err(AdmissionError::DuplicateFrame(frame_number));
        }
        records.insert(frame_number, record);
        Ok(())
    }

    /// Remove a record without delivering anything; used when submit fails.
    ///
    /// Frames that were only waiting on this one are delivered.
    pub fn discard(&self, frame_number: FrameNumber) -> Option<AggregationRecord> {
        let mut records = self.lock_records();
        let record = records.remove(&frame_number)?;
        self.settle(records, None);
        Some(record)
    }

    pub fn contains(&self, frame_number: FrameNumber) -> bool {
        let records = self.lock_records();
        records.contains_key(&frame_number) || self.lock_ready().contains_key(&frame_number)
    }

    /// Number of frames whose terminal event has not been delivered
    pub fn in_flight(&self) -> usize {
        let records = self.lock_records();
        records.len() + self.lock_ready().len()
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.error_policy
    }

    pub fn stats(&self) -> AggregatorStats {
        let s = &self.stats;
        AggregatorStats {
            results_emitted: s.results_emitted.load(Ordering::Relaxed),
            errors_emitted: s.errors_emitted.load(Ordering::Relaxed),
            protocol_violations: s.protocol_violations.load(Ordering::Relaxed),
            partials_forwarded: s.partials_forwarded.load(Ordering::Relaxed),
            shutters_forwarded: s.shutters_forwarded.load(Ordering::Relaxed),
            frames_flushed: s.frames_flushed.load(Ordering::Relaxed),
        }
    }

    /// Full result of one pipeline for one frame
    pub fn on_pipeline_result(&self, result: PipelineResult) {
        let PipelineResult {
            pipeline_id,
            frame_number,
            metadata,
            output_buffers,
            input_buffer,
        } = result;

        let Some(role) = self.role(frame_number, pipeline_id) else {
            self.store.release(metadata);
            self.protocol_violation(ProtocolError::UnknownFrame(frame_number));
            return;
        };

        let physical = self.store.translate_to_wire_format(&metadata).map_err(|e| {
            warn!(frame = frame_number, pipeline = pipeline_id, error = %e, "Result metadata translation failed");
            LogicalErrorKind::Result
        });
        let logical = role
            .is_logical
            .then(|| self.logical_metadata(frame_number, &metadata, role.remap.as_ref(), &physical));
        self.store.release(metadata);

        let contribution = Contribution {
            physical,
            logical,
            output_buffers,
            input_buffer,
        };

        let mut records = self.lock_records();
        let Some(record) = records.get_mut(&frame_number) else {
            drop(records);
            self.protocol_violation(ProtocolError::UnknownFrame(frame_number));
            return;
        };
        let violation = match record.accept(pipeline_id, contribution) {
            Ok(v) => v,
            Err(e) => {
                drop(records);
                self.protocol_violation(e);
                return;
            }
        };
        if record.is_complete() {
            if let Some(record) = records.remove(&frame_number) {
                self.settle(records, Some((frame_number, Outcome::Result(record))));
            }
        } else {
            debug!(
                frame = frame_number,
                pipeline = pipeline_id,
                awaiting = ?record.requested(),
                "Frame partially received"
            );
            drop(records);
        }

        if let Some(v) = violation {
            self.protocol_violation(v);
        }
    }

    /// A pipeline reported failure for a frame instead of a result
    pub fn on_pipeline_error(
        &self,
        pipeline_id: PipelineId,
        frame_number: FrameNumber,
        kind: LogicalErrorKind,
    ) {
        warn!(
            frame = frame_number,
            pipeline = pipeline_id,
            kind = %kind,
            policy = ?self.error_policy,
            "Pipeline reported an error"
        );

        match self.error_policy {
            ErrorPolicy::Fatal => {
                let mut records = self.lock_records();
                if records.remove(&frame_number).is_none() {
                    drop(records);
                    self.protocol_violation(ProtocolError::UnknownFrame(frame_number));
                    return;
                }
                let kind = match kind {
                    LogicalErrorKind::Device => LogicalErrorKind::Device,
                    _ => LogicalErrorKind::Request,
                };
                self.settle(records, Some((frame_number, Outcome::Error(kind))));
            }
            ErrorPolicy::BestEffort => {
                let mut records = self.lock_records();
                let Some(record) = records.get_mut(&frame_number) else {
                    drop(records);
                    self.protocol_violation(ProtocolError::UnknownFrame(frame_number));
                    return;
                };
                if let Err(e) = record.fail(pipeline_id, kind) {
                    drop(records);
                    self.protocol_violation(e);
                    return;
                }
                if record.is_complete()
                    && let Some(record) = records.remove(&frame_number)
                {
                    self.settle(records, Some((frame_number, Outcome::Result(record))));
                }
            }
        }
    }

    /// Early metadata; forwarded at most once per kind, only from the logical pipeline
    pub fn on_partial_result(
        &self,
        pipeline_id: PipelineId,
        frame_number: FrameNumber,
        kind: PartialResultKind,
        metadata: MetadataHandle,
    ) {
        let Some(role) = self.role(frame_number, pipeline_id) else {
            debug!(frame = frame_number, pipeline = pipeline_id, "Partial for finished frame dropped");
            return;
        };
        if !role.is_logical {
            return;
        }
        if !self.claim(frame_number, EarlyDelivery::Partial(kind)) {
            debug!(frame = frame_number, kind = ?kind, "Partial already forwarded");
            return;
        }

        let mut tags = metadata.snapshot();
        self.store.release(metadata);
        if let Some(r) = &role.remap {
            tags = remap::remap_logical_result_metadata(&tags, &r.source, &r.reference);
        }

        match WireBlob::encode(&tags) {
            Ok(blob) => {
                self.stats.partials_forwarded.fetch_add(1, Ordering::Relaxed);
                self.send(LogicalEvent::Partial(PartialResult {
                    frame_number,
                    kind,
                    metadata: blob,
                }));
            }
            Err(e) => warn!(frame = frame_number, error = %e, "Partial metadata translation failed"),
        }
    }

    pub fn on_notify(&self, pipeline_id: PipelineId, frame_number: FrameNumber, message: NotifyMessage) {
        match message {
            NotifyMessage::Shutter { timestamp_ns } => {
                let is_logical = self
                    .role(frame_number, pipeline_id)
                    .is_some_and(|r| r.is_logical);
                if is_logical && self.claim(frame_number, EarlyDelivery::Shutter) {
                    self.stats.shutters_forwarded.fetch_add(1, Ordering::Relaxed);
                    self.send(LogicalEvent::Shutter {
                        frame_number,
                        timestamp_ns,
                    });
                }
            }
            NotifyMessage::Error(kind) => self.on_pipeline_error(pipeline_id, frame_number, kind),
        }
    }

    /// Resolve every in-flight frame.
    ///
    /// Frames whose logical metadata arrived get a best-effort result; the
    /// rest get a request error. The map is empty afterwards.
    pub fn drain(&self) -> usize {
        let mut records = self.lock_records();
        let flushed = std::mem::take(&mut *records);
        let count = flushed.len();

        let outcomes = flushed.into_values().map(|record| {
            let frame_number = record.frame_number;
            info!(
                frame = frame_number,
                awaiting = ?record.requested(),
                has_logical = record.has_logical_metadata(),
                "Flushing in-flight frame"
            );
            self.stats.frames_flushed.fetch_add(1, Ordering::Relaxed);
            let outcome = if record.has_logical_metadata() {
                Outcome::Result(record)
            } else {
                Outcome::Error(LogicalErrorKind::Request)
            };
            (frame_number, outcome)
        });
        self.settle(records, outcomes);

        self.early
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        count
    }

    fn logical_metadata(
        &self,
        frame_number: FrameNumber,
        metadata: &MetadataHandle,
        remap: Option<&ResultRemap>,
        physical: &Result<WireBlob, LogicalErrorKind>,
    ) -> Result<WireBlob, LogicalErrorKind> {
        let tags = metadata.snapshot();
        let tags = match remap {
            Some(r) => remap::remap_logical_result_metadata(&tags, &r.source, &r.reference),
            None => tags,
        };
        self.update_scene(&tags);

        if remap.is_none() {
            return physical.clone();
        }
        WireBlob::encode(&tags).map_err(|e| {
            warn!(frame = frame_number, error = %e, "Logical metadata translation failed");
            LogicalErrorKind::Result
        })
    }

    fn update_scene(&self, tags: &TagMap) {
        let lux = tags.get(&Tag::LuxIndex).and_then(TagValue::as_float);
        let focus = tags.get(&Tag::FocusDistanceCm).and_then(TagValue::as_float);
        if lux.is_none() && focus.is_none() {
            return;
        }
        let mut scene = self.scene.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lux) = lux {
            scene.lux_index = lux;
        }
        if let Some(focus) = focus {
            scene.focus_distance_cm = focus;
        }
    }

    fn role(&self, frame_number: FrameNumber, pipeline_id: PipelineId) -> Option<Role> {
        let records = self.lock_records();
        let record = records.get(&frame_number)?;
        let is_logical = record.logical_pipeline_id == pipeline_id;
        Some(Role {
            is_logical,
            remap: if is_logical {
                record.logical_remap.clone()
            } else {
                None
            },
        })
    }

    fn claim(&self, frame_number: FrameNumber, delivery: EarlyDelivery) -> bool {
        self.early
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .claim(frame_number, delivery)
    }

    /// Queue finished frames and deliver every one no lower frame is holding back
    fn settle(
        &self,
        records: MutexGuard<'_, RecordMap>,
        finished: impl IntoIterator<Item = (FrameNumber, Outcome)>,
    ) {
        let mut ready = self.lock_ready();
        ready.extend(finished);

        let held = match records.keys().next() {
            Some(&lowest) => ready.split_off(&lowest),
            None => BTreeMap::new(),
        };
        drop(records);

        if let Some((&first, _)) = held.first_key_value() {
            debug!(frame = first, waiting = held.len(), "Finished frames held for earlier frames");
        }

        // Sent under the ready lock so concurrent callers cannot interleave
        let deliverable = std::mem::replace(&mut *ready, held);
        for (frame_number, outcome) in deliverable {
            match outcome {
                Outcome::Result(record) => self.emit_result(record, LogicalErrorKind::Result),
                Outcome::Error(kind) => self.emit_error(frame_number, kind),
            }
        }
    }

    fn emit_result(&self, record: AggregationRecord, missing: LogicalErrorKind) {
        let result = record.into_result(missing);
        info!(
            frame = result.frame_number,
            logical_pipeline = result.logical_pipeline_id,
            buffers = result.output_buffers.len(),
            physical = result.physical_metadata.len(),
            complete = result.is_complete(),
            "Logical result ready"
        );
        self.stats.results_emitted.fetch_add(1, Ordering::Relaxed);
        self.send(LogicalEvent::Result(result));
    }

    fn emit_error(&self, frame_number: FrameNumber, kind: LogicalErrorKind) {
        warn!(frame = frame_number, kind = %kind, "Delivering logical error");
        self.stats.errors_emitted.fetch_add(1, Ordering::Relaxed);
        self.send(LogicalEvent::Error { frame_number, kind });
    }

    fn send(&self, event: LogicalEvent) {
        if self.events.send(event).is_err() {
            debug!("Logical event receiver dropped");
        }
    }

    fn protocol_violation(&self, error: ProtocolError) {
        self.stats.protocol_violations.fetch_add(1, Ordering::Relaxed);
        warn!(error = %error, "Pipeline protocol violation, callback dropped");
    }

    fn lock_records(&self) -> MutexGuard<'_, RecordMap> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ready(&self) -> MutexGuard<'_, BTreeMap<FrameNumber, Outcome>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CompletionHandler for ResultAggregator {
    fn handle(&self, message: PipelineMessage) {
        match message {
            PipelineMessage::Result(result) => self.on_pipeline_result(result),
            PipelineMessage::Partial {
                pipeline_id,
                frame_number,
                kind,
                metadata,
            } => self.on_partial_result(pipeline_id, frame_number, kind, metadata),
            PipelineMessage::Notify {
                pipeline_id,
                frame_number,
                message,
            } => self.on_notify(pipeline_id, frame_number, message),
        }
    }
}
