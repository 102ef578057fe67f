// SPDX-License-Identifier: GPL-3.0-only
// Shared types for the physical pipeline abstraction

//! Shared types for physical pipelines

use crate::backends::metadata::MetadataHandle;
use crate::errors::{LogicalErrorKind, PipelineError};
use crate::multicam::types::{CameraId, FrameNumber, PartialResultKind, PipelineId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Caller-assigned stream id
pub type StreamId = u32;

/// What a stream is consumed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamUsage {
    #[default]
    Preview,
    Video,
    Snapshot,
}

/// An output stream as declared by the caller, or an internal per-pipeline stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub width: u32,
    pub height: u32,
    pub usage: StreamUsage,
    /// Set when the stream targets one physical camera explicitly
    pub physical_camera_id: Option<CameraId>,
}

impl Stream {
    pub fn new(id: StreamId, width: u32, height: u32, usage: StreamUsage) -> Self {
        Self {
            id,
            width,
            height,
            usage,
            physical_camera_id: None,
        }
    }

    /// Bind the stream to one physical camera
    pub fn for_camera(mut self, camera_id: CameraId) -> Self {
        self.physical_camera_id = Some(camera_id);
        self
    }

    pub fn is_logical(&self) -> bool {
        self.physical_camera_id.is_none()
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream {} {}x{} {:?}", self.id, self.width, self.height, self.usage)?;
        if let Some(camera) = self.physical_camera_id {
            write!(f, " (camera {})", camera)?;
        }
        Ok(())
    }
}

/// Opaque buffer allocated by the buffer collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Sync fence file descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence(pub i32);

/// Fill status of a returned buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferStatus {
    #[default]
    Ok,
    Error,
}

/// Buffer bound to a stream, as it travels through a request
#[derive(Debug, Clone)]
pub struct StreamBuffer {
    pub stream: Arc<Stream>,
    pub buffer: BufferHandle,
    pub acquire_fence: Option<Fence>,
    pub release_fence: Option<Fence>,
    pub status: BufferStatus,
}

impl StreamBuffer {
    pub fn new(stream: Arc<Stream>, buffer: BufferHandle) -> Self {
        Self {
            stream,
            buffer,
            acquire_fence: None,
            release_fence: None,
            status: BufferStatus::Ok,
        }
    }

    /// Same buffer attached to a different stream object
    pub fn retarget(&self, stream: Arc<Stream>) -> Self {
        Self {
            stream,
            ..self.clone()
        }
    }
}

/// Correlation data carried through a pipeline untouched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestPrivate {
    pub stream_index: PipelineId,
}

/// One physical-camera-scoped capture request
#[derive(Debug)]
pub struct PipelineRequest {
    pub frame_number: FrameNumber,
    pub pipeline_id: PipelineId,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
    /// Settings; the pipeline drops it once consumed
    pub input_metadata: MetadataHandle,
    /// Entry the pipeline fills and hands back in its result
    pub output_metadata: MetadataHandle,
    pub private: RequestPrivate,
}

/// Full result of one pipeline for one frame
#[derive(Debug)]
pub struct PipelineResult {
    pub pipeline_id: PipelineId,
    pub frame_number: FrameNumber,
    pub metadata: MetadataHandle,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
}

/// Asynchronous notifications from a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyMessage {
    Shutter { timestamp_ns: u64 },
    Error(LogicalErrorKind),
}

/// Everything a pipeline can report, as queued on its completion channel
#[derive(Debug)]
pub enum PipelineMessage {
    Result(PipelineResult),
    Partial {
        pipeline_id: PipelineId,
        frame_number: FrameNumber,
        kind: PartialResultKind,
        metadata: MetadataHandle,
    },
    Notify {
        pipeline_id: PipelineId,
        frame_number: FrameNumber,
        message: NotifyMessage,
    },
}

impl PipelineMessage {
    pub fn pipeline_id(&self) -> PipelineId {
        match self {
            PipelineMessage::Result(r) => r.pipeline_id,
            PipelineMessage::Partial { pipeline_id, .. } => *pipeline_id,
            PipelineMessage::Notify { pipeline_id, .. } => *pipeline_id,
        }
    }

    pub fn frame_number(&self) -> FrameNumber {
        match self {
            PipelineMessage::Result(r) => r.frame_number,
            PipelineMessage::Partial { frame_number, .. } => *frame_number,
            PipelineMessage::Notify { frame_number, .. } => *frame_number,
        }
    }
}

/// Result type for pipeline collaborator operations
pub type BackendResult<T> = Result<T, PipelineError>;
