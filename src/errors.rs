// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the multi-camera core
//!
//! Synchronous failures (admission, resource, controller, collaborator) are
//! returned to the caller of the failing operation. Failures that surface
//! after a request was admitted are delivered asynchronously as
//! [`LogicalErrorKind`] events; protocol violations are only logged.

use crate::multicam::types::{CameraId, FrameNumber, PipelineId};
use std::fmt;
use std::time::Duration;

/// Result type alias using MultiCamError
pub type MultiCamResult<T> = Result<T, MultiCamError>;

/// Crate-level error type
#[derive(Debug, Clone, PartialEq)]
pub enum MultiCamError {
    /// Request rejected before any pipeline request was built
    Admission(AdmissionError),
    /// Pool exhaustion or allocation failure while dispatching
    Resource(ResourceError),
    /// Transition controller could not be (re)configured
    Controller(ControllerError),
    /// The pipeline collaborator refused an operation
    Pipeline(PipelineError),
    /// Metadata collaborator failure
    Metadata(MetadataError),
    /// Configuration errors
    Config(String),
    /// Filesystem errors
    Io(String),
}

/// Bad request shape
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionError {
    /// Logical and physical settings are not all-null or all-non-null
    SettingsNullityMismatch,
    /// A physical settings entry names a camera outside this logical camera
    UnknownPhysicalCamera(CameraId),
    /// An output target is tagged with a camera outside this logical camera
    UnknownStreamCamera(CameraId),
    /// The request carries no output buffers
    NoOutputBuffers,
    /// First request of a session carried no settings to repeat
    MissingInitialSettings,
    /// The frame number is already in flight
    DuplicateFrame(FrameNumber),
    /// The session is flushing or torn down
    SessionClosed,
}

/// Resource exhaustion on the dispatch path
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceError {
    /// No metadata entry became free within the timeout
    MetadataPoolExhausted {
        frame_number: FrameNumber,
        timeout: Duration,
    },
    /// A collaborator failed to allocate
    AllocationFailed(String),
}

/// Transition controller configuration errors
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// No physical cameras were supplied
    NoCameras,
    /// Two descriptors share a camera id
    DuplicateCamera(CameraId),
    /// Geometry that cannot produce a field of view
    InvalidGeometry { camera_id: CameraId, reason: String },
    /// A margin or threshold is out of range
    InvalidPolicy(String),
    /// Camera id not known to the controller
    UnknownCamera(CameraId),
}

/// Errors reported by the pipeline collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Pipeline id does not exist
    UnknownPipeline(PipelineId),
    /// Hardware streaming could not be brought up
    ActivationFailed { pipeline_id: PipelineId, reason: String },
    /// The batch was refused
    SubmitFailed(String),
    /// The pipeline layer has been shut down
    Closed,
}

/// Errors reported by the metadata collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataError {
    /// Acquisition timed out
    Timeout(Duration),
    /// Serialising to the wire format failed
    Encoding(String),
    /// A wire blob could not be decoded
    Decoding(String),
}

/// Error kinds delivered asynchronously for an admitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalErrorKind {
    /// The device is unusable; no further results will arrive
    Device,
    /// The whole request failed; no result will be delivered for it
    Request,
    /// Result metadata for the frame is missing or incomplete
    Result,
    /// One or more output buffers could not be filled
    Buffer,
}

/// Callback contract violations. Logged and dropped, never propagated.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Result for a frame that is not (or no longer) in flight
    UnknownFrame(FrameNumber),
    /// A second pipeline claimed the logical role for one frame
    DuplicateLogicalClaim {
        frame_number: FrameNumber,
        pipeline_id: PipelineId,
    },
    /// More than one input buffer returned for one frame
    DuplicateInputBuffer {
        frame_number: FrameNumber,
        pipeline_id: PipelineId,
    },
    /// Result from a pipeline that was not part of the frame
    UnexpectedPipeline {
        frame_number: FrameNumber,
        pipeline_id: PipelineId,
    },
}

impl fmt::Display for MultiCamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MultiCamError::Admission(e) => write!(f, "Request rejected: {}", e),
            MultiCamError::Resource(e) => write!(f, "Resource error: {}", e),
            MultiCamError::Controller(e) => write!(f, "Controller error: {}", e),
            MultiCamError::Pipeline(e) => write!(f, "Pipeline error: {}", e),
            MultiCamError::Metadata(e) => write!(f, "Metadata error: {}", e),
            MultiCamError::Config(msg) => write!(f, "Configuration error: {}", msg),
            MultiCamError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionError::SettingsNullityMismatch => {
                write!(f, "logical and physical settings must be all-null or all-non-null")
            }
            AdmissionError::UnknownPhysicalCamera(id) => {
                write!(f, "physical settings for unknown camera {}", id)
            }
            AdmissionError::UnknownStreamCamera(id) => {
                write!(f, "output stream targets unknown camera {}", id)
            }
            AdmissionError::NoOutputBuffers => write!(f, "request has no output buffers"),
            AdmissionError::MissingInitialSettings => {
                write!(f, "first request must carry settings")
            }
            AdmissionError::DuplicateFrame(frame) => {
                write!(f, "frame {} is already in flight", frame)
            }
            AdmissionError::SessionClosed => write!(f, "session is closed"),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceError::MetadataPoolExhausted {
                frame_number,
                timeout,
            } => write!(
                f,
                "no metadata entry for frame {} within {:?}",
                frame_number, timeout
            ),
            ResourceError::AllocationFailed(msg) => write!(f, "allocation failed: {}", msg),
        }
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::NoCameras => write!(f, "no physical cameras configured"),
            ControllerError::DuplicateCamera(id) => write!(f, "camera {} listed twice", id),
            ControllerError::InvalidGeometry { camera_id, reason } => {
                write!(f, "invalid geometry for camera {}: {}", camera_id, reason)
            }
            ControllerError::InvalidPolicy(msg) => write!(f, "invalid policy: {}", msg),
            ControllerError::UnknownCamera(id) => write!(f, "unknown camera {}", id),
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::UnknownPipeline(id) => write!(f, "unknown pipeline {}", id),
            PipelineError::ActivationFailed {
                pipeline_id,
                reason,
            } => write!(f, "pipeline {} failed to activate: {}", pipeline_id, reason),
            PipelineError::SubmitFailed(msg) => write!(f, "submit failed: {}", msg),
            PipelineError::Closed => write!(f, "pipeline session closed"),
        }
    }
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::Timeout(timeout) => write!(f, "acquire timed out after {:?}", timeout),
            MetadataError::Encoding(msg) => write!(f, "encoding failed: {}", msg),
            MetadataError::Decoding(msg) => write!(f, "decoding failed: {}", msg),
        }
    }
}

impl fmt::Display for LogicalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalErrorKind::Device => write!(f, "device"),
            LogicalErrorKind::Request => write!(f, "request"),
            LogicalErrorKind::Result => write!(f, "result"),
            LogicalErrorKind::Buffer => write!(f, "buffer"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::UnknownFrame(frame) => write!(f, "result for unknown frame {}", frame),
            ProtocolError::DuplicateLogicalClaim {
                frame_number,
                pipeline_id,
            } => write!(
                f,
                "pipeline {} claimed logical role for frame {} twice",
                pipeline_id, frame_number
            ),
            ProtocolError::DuplicateInputBuffer {
                frame_number,
                pipeline_id,
            } => write!(
                f,
                "pipeline {} returned a second input buffer for frame {}",
                pipeline_id, frame_number
            ),
            ProtocolError::UnexpectedPipeline {
                frame_number,
                pipeline_id,
            } => write!(
                f,
                "pipeline {} is not part of frame {}",
                pipeline_id, frame_number
            ),
        }
    }
}

impl std::error::Error for MultiCamError {}
impl std::error::Error for AdmissionError {}
impl std::error::Error for ResourceError {}
impl std::error::Error for ControllerError {}
impl std::error::Error for PipelineError {}
impl std::error::Error for MetadataError {}
impl std::error::Error for ProtocolError {}

impl From<AdmissionError> for MultiCamError {
    fn from(err: AdmissionError) -> Self {
        MultiCamError::Admission(err)
    }
}

impl From<ResourceError> for MultiCamError {
    fn from(err: ResourceError) -> Self {
        MultiCamError::Resource(err)
    }
}

impl From<ControllerError> for MultiCamError {
    fn from(err: ControllerError) -> Self {
        MultiCamError::Controller(err)
    }
}

impl From<PipelineError> for MultiCamError {
    fn from(err: PipelineError) -> Self {
        MultiCamError::Pipeline(err)
    }
}

impl From<MetadataError> for MultiCamError {
    fn from(err: MetadataError) -> Self {
        MultiCamError::Metadata(err)
    }
}

impl From<std::io::Error> for MultiCamError {
    fn from(err: std::io::Error) -> Self {
        MultiCamError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MultiCamError {
    fn from(err: serde_json::Error) -> Self {
        MultiCamError::Config(err.to_string())
    }
}
