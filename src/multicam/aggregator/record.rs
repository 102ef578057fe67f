// SPDX-License-Identifier: GPL-3.0-only

//! Per-frame aggregation state

use crate::backends::metadata::WireBlob;
use crate::backends::pipeline::{Stream, StreamBuffer, StreamId};
use crate::errors::{LogicalErrorKind, ProtocolError};
use crate::multicam::types::{
    CameraDescriptor, CameraId, ControllerResult, FrameNumber, LogicalResult, PhysicalMetadata,
    PipelineId,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Descriptors needed to bring the logical pipeline's metadata back into the
/// caller's reference camera
#[derive(Debug, Clone)]
pub struct ResultRemap {
    pub source: CameraDescriptor,
    pub reference: CameraDescriptor,
}

/// What one pipeline delivered for a frame, already in wire format
#[derive(Debug)]
pub struct Contribution {
    pub physical: Result<WireBlob, LogicalErrorKind>,
    /// Set only for the frame's logical pipeline
    pub logical: Option<Result<WireBlob, LogicalErrorKind>>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
}

/// State of one in-flight frame.
///
/// Created by the dispatcher before submit, mutated only by the aggregator
/// under its map lock, removed the moment it completes.
#[derive(Debug)]
pub struct AggregationRecord {
    pub frame_number: FrameNumber,
    pub logical_pipeline_id: PipelineId,
    /// Decision the frame was dispatched with; never mutated
    pub controller_result: ControllerResult,
    pub logical_remap: Option<ResultRemap>,
    /// Dispatched pipelines and their cameras, in request order
    request_order: Vec<(PipelineId, CameraId)>,
    requested: Vec<PipelineId>,
    logical_metadata: Option<Result<WireBlob, LogicalErrorKind>>,
    output_buffers: Vec<StreamBuffer>,
    input_buffer: Option<StreamBuffer>,
    physical: Vec<(PipelineId, Result<WireBlob, LogicalErrorKind>)>,
    /// internal stream id -> caller stream object
    stream_restore: HashMap<StreamId, Arc<Stream>>,
}

impl AggregationRecord {
    pub fn new(
        frame_number: FrameNumber,
        logical_pipeline_id: PipelineId,
        request_order: Vec<(PipelineId, CameraId)>,
        controller_result: ControllerResult,
    ) -> Self {
        let requested = request_order.iter().map(|(p, _)| *p).collect();
        Self {
            frame_number,
            logical_pipeline_id,
            controller_result,
            logical_remap: None,
            request_order,
            requested,
            logical_metadata: None,
            output_buffers: Vec::new(),
            input_buffer: None,
            physical: Vec::new(),
            stream_restore: HashMap::new(),
        }
    }

    pub fn with_remap(mut self, remap: Option<ResultRemap>) -> Self {
        self.logical_remap = remap;
        self
    }

    pub fn with_stream_restore(mut self, restore: HashMap<StreamId, Arc<Stream>>) -> Self {
        self.stream_restore = restore;
        self
    }

    /// Pipelines still awaited
    pub fn requested(&self) -> &[PipelineId] {
        &self.requested
    }

    pub fn is_awaiting(&self, pipeline_id: PipelineId) -> bool {
        self.requested.contains(&pipeline_id)
    }

    pub fn has_logical_metadata(&self) -> bool {
        self.logical_metadata.is_some()
    }

    /// Nothing left to wait for
    pub fn is_complete(&self) -> bool {
        self.requested.is_empty() && self.logical_metadata.is_some()
    }

    /// Fold one pipeline's result into the record.
    ///
    /// A second input buffer is reported and discarded; the rest of the
    /// contribution is still accepted.
    pub fn accept(
        &mut self,
        pipeline_id: PipelineId,
        contribution: Contribution,
    ) -> Result<Option<ProtocolError>, ProtocolError> {
        if !self.is_awaiting(pipeline_id) {
            return Err(ProtocolError::UnexpectedPipeline {
                frame_number: self.frame_number,
                pipeline_id,
            });
        }
        if contribution.logical.is_some()
            && (pipeline_id != self.logical_pipeline_id || self.logical_metadata.is_some())
        {
            return Err(ProtocolError::DuplicateLogicalClaim {
                frame_number: self.frame_number,
                pipeline_id,
            });
        }

        let mut violation = None;
        self.output_buffers.extend(contribution.output_buffers);
        if let Some(input) = contribution.input_buffer {
            if self.input_buffer.is_some() {
                violation = Some(ProtocolError::DuplicateInputBuffer {
                    frame_number: self.frame_number,
                    pipeline_id,
                });
            } else {
                self.input_buffer = Some(input);
            }
        }

        if let Some(logical) = contribution.logical {
            self.logical_metadata = Some(logical);
        }
        self.physical.push((pipeline_id, contribution.physical));
        self.requested.retain(|p| *p != pipeline_id);
        Ok(violation)
    }

    /// Record a failed contribution in place of a result
    pub fn fail(&mut self, pipeline_id: PipelineId, kind: LogicalErrorKind) -> Result<(), ProtocolError> {
        if !self.is_awaiting(pipeline_id) {
            return Err(ProtocolError::UnexpectedPipeline {
                frame_number: self.frame_number,
                pipeline_id,
            });
        }
        if pipeline_id == self.logical_pipeline_id && self.logical_metadata.is_none() {
            self.logical_metadata = Some(Err(kind));
        }
        self.physical.push((pipeline_id, Err(kind)));
        self.requested.retain(|p| *p != pipeline_id);
        Ok(())
    }

    /// Build the caller-facing result.
    ///
    /// Contributions that never arrived are reported as `missing`.
    pub fn into_result(self, missing: LogicalErrorKind) -> LogicalResult {
        let AggregationRecord {
            frame_number,
            logical_pipeline_id,
            request_order,
            logical_metadata,
            output_buffers,
            input_buffer,
            mut physical,
            stream_restore,
            ..
        } = self;

        let physical_metadata = request_order
            .iter()
            .map(|(pipeline_id, camera_id)| {
                let metadata = physical
                    .iter()
                    .position(|(p, _)| p == pipeline_id)
                    .map(|i| physical.swap_remove(i).1)
                    .unwrap_or(Err(missing));
                PhysicalMetadata {
                    camera_id: *camera_id,
                    metadata,
                }
            })
            .collect();

        let restore = |buffer: StreamBuffer| match stream_restore.get(&buffer.stream.id) {
            Some(original) => buffer.retarget(Arc::clone(original)),
            None => buffer,
        };

        LogicalResult {
            frame_number,
            logical_pipeline_id,
            metadata: logical_metadata.unwrap_or(Err(missing)),
            output_buffers: output_buffers.into_iter().map(restore).collect(),
            input_buffer: input_buffer.map(restore),
            physical_metadata,
        }
    }
}
