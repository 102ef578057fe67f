// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for the logical camera core

use crate::backends::metadata::{TagMap, WireBlob};
use crate::backends::pipeline::StreamBuffer;
use crate::errors::LogicalErrorKind;
use serde::{Deserialize, Serialize};

/// Stable id of a physical camera sensor
pub type CameraId = u32;

/// Index of a physical pipeline inside a session (same order as the camera list)
pub type PipelineId = usize;

/// Monotonically increasing id correlating a logical request with its result
pub type FrameNumber = u64;

/// Rectangle in a camera's active-array pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn right(&self) -> i32 {
        self.left + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.top + self.height as i32
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Weighted metering window (AE/AF/AWB regions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedRegion {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub weight: i32,
}

/// Valid sensor sensitivity (ISO) range of one camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitivityRange {
    pub min: i32,
    pub max: i32,
}

impl SensitivityRange {
    pub fn span(&self) -> i32 {
        self.max - self.min
    }

    pub fn clamp(&self, value: i32) -> i32 {
        value.clamp(self.min, self.max)
    }
}

impl Default for SensitivityRange {
    fn default() -> Self {
        Self { min: 100, max: 3200 }
    }
}

/// Zoom window expressed in logical zoom ratios
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomRange {
    pub min: f32,
    pub max: f32,
}

impl ZoomRange {
    pub fn contains(&self, zoom: f32) -> bool {
        zoom >= self.min && zoom <= self.max
    }

    pub fn center(&self) -> f32 {
        (self.min + self.max) / 2.0
    }
}

/// Static description of one physical camera. Immutable for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub camera_id: CameraId,
    /// Lens focal length in millimetres
    pub focal_length_mm: f32,
    /// Pixel pitch in micrometres
    pub pixel_pitch_um: f32,
    /// Full active pixel array
    pub active_array: Rect,
    /// Portion of the active array that maps onto the shared field of view
    pub fov_rect: Rect,
    pub sensitivity: SensitivityRange,
    /// Calibration offsets relative to the reference camera, in pixels
    #[serde(default)]
    pub calibration_offset: (i32, i32),
    /// Explicit zoom window, used when smooth transition is disabled
    #[serde(default)]
    pub zoom_range: Option<ZoomRange>,
    #[serde(default = "default_true")]
    pub smooth_transition: bool,
    /// Keep this camera streaming regardless of zoom
    #[serde(default)]
    pub always_on: bool,
}

fn default_true() -> bool {
    true
}

impl CameraDescriptor {
    /// Horizontal field of view proxy: sensor width over focal length
    pub fn field_of_view(&self) -> f32 {
        if self.focal_length_mm > 0.0 {
            self.active_array.width as f32 * self.pixel_pitch_um / self.focal_length_mm
        } else {
            0.0
        }
    }
}

/// Low-power state requested for a physical camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LpmMode {
    /// Sensor fully streaming
    #[default]
    None,
    /// Sensor suspended
    SensorSuspend,
    /// Sensor streams, frames dropped before processing
    FrameDrop,
}

/// Hardware frame synchronisation between sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncMode {
    #[default]
    NoSync,
    /// Sensors run with hardware sync enabled
    HwSync,
    /// Hardware sync plus phase injection
    HybridSync,
}

/// Activity bit for one physical camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCamera {
    pub camera_id: CameraId,
    pub is_active: bool,
}

/// Per-frame decision snapshot produced by the transition controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerResult {
    pub master_camera_id: CameraId,
    /// One entry per physical camera, in pipeline order
    pub active_cameras: Vec<ActiveCamera>,
    pub num_active_cameras: usize,
    pub snapshot_fusion_enabled: bool,
    /// Bit `i` set when pipeline `i` is active
    pub active_map: u32,
}

impl ControllerResult {
    pub fn is_active(&self, camera_id: CameraId) -> bool {
        self.active_cameras
            .iter()
            .any(|c| c.camera_id == camera_id && c.is_active)
    }

    /// Pipeline ids with the active bit set, ascending
    pub fn active_pipelines(&self) -> Vec<PipelineId> {
        self.active_cameras
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn master_pipeline(&self) -> Option<PipelineId> {
        self.active_cameras
            .iter()
            .position(|c| c.camera_id == self.master_camera_id)
    }
}

/// Scene statistics fed back from delivered results into the next decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SceneState {
    pub lux_index: f32,
    pub focus_distance_cm: f32,
}

impl Default for SceneState {
    // Fusion stays off until a result reports the scene
    fn default() -> Self {
        Self {
            lux_index: 0.0,
            focus_distance_cm: crate::constants::fusion::FOCUS_DISTANCE_CM_MAX,
        }
    }
}

/// Per-camera settings supplied by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalSettings {
    pub camera_id: CameraId,
    pub settings: Option<TagMap>,
}

/// One logical capture request as submitted by the caller
#[derive(Debug, Clone)]
pub struct LogicalRequest {
    pub frame_number: FrameNumber,
    /// `None` repeats the previous request's settings
    pub settings: Option<TagMap>,
    pub physical_settings: Vec<PhysicalSettings>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
    /// Bitmask of pipelines whose full-resolution path a snapshot needs
    pub snapshot_active_mask: u32,
}

impl LogicalRequest {
    pub fn new(frame_number: FrameNumber, settings: Option<TagMap>) -> Self {
        Self {
            frame_number,
            settings,
            physical_settings: Vec::new(),
            output_buffers: Vec::new(),
            input_buffer: None,
            snapshot_active_mask: 0,
        }
    }

    pub fn with_output(mut self, buffer: StreamBuffer) -> Self {
        self.output_buffers.push(buffer);
        self
    }

    pub fn with_input(mut self, buffer: StreamBuffer) -> Self {
        self.input_buffer = Some(buffer);
        self
    }

    pub fn with_physical_settings(mut self, camera_id: CameraId, settings: Option<TagMap>) -> Self {
        self.physical_settings.push(PhysicalSettings {
            camera_id,
            settings,
        });
        self
    }
}

/// Physical-camera metadata entry of a logical result
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalMetadata {
    pub camera_id: CameraId,
    /// `Err` when the pipeline failed or the frame was flushed before it reported
    pub metadata: Result<WireBlob, LogicalErrorKind>,
}

/// One aggregated result delivered to the caller
#[derive(Debug, Clone)]
pub struct LogicalResult {
    pub frame_number: FrameNumber,
    pub logical_pipeline_id: PipelineId,
    /// Outward-facing metadata, `Err` when the logical contribution is missing
    pub metadata: Result<WireBlob, LogicalErrorKind>,
    pub output_buffers: Vec<StreamBuffer>,
    pub input_buffer: Option<StreamBuffer>,
    /// One entry per requested physical pipeline, in request order
    pub physical_metadata: Vec<PhysicalMetadata>,
}

impl LogicalResult {
    /// True when every contribution arrived without error
    pub fn is_complete(&self) -> bool {
        self.metadata.is_ok() && self.physical_metadata.iter().all(|p| p.metadata.is_ok())
    }
}

/// Which early metadata stream a partial result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartialResultKind {
    /// Driver-produced early metadata
    Driver,
    /// Early metadata produced by the processing graph itself
    Chi,
}

/// Early, incomplete metadata snapshot
#[derive(Debug, Clone)]
pub struct PartialResult {
    pub frame_number: FrameNumber,
    pub kind: PartialResultKind,
    pub metadata: WireBlob,
}

/// Everything delivered to the caller, in delivery order
#[derive(Debug, Clone)]
pub enum LogicalEvent {
    /// Start of exposure for a frame
    Shutter {
        frame_number: FrameNumber,
        timestamp_ns: u64,
    },
    Partial(PartialResult),
    Result(LogicalResult),
    Error {
        frame_number: FrameNumber,
        kind: LogicalErrorKind,
    },
}

impl LogicalEvent {
    pub fn frame_number(&self) -> FrameNumber {
        match self {
            LogicalEvent::Shutter { frame_number, .. } => *frame_number,
            LogicalEvent::Partial(p) => p.frame_number,
            LogicalEvent::Result(r) => r.frame_number,
            LogicalEvent::Error { frame_number, .. } => *frame_number,
        }
    }

    /// Results and errors end a frame; shutter and partials do not
    pub fn is_terminal(&self) -> bool {
        matches!(self, LogicalEvent::Result(_) | LogicalEvent::Error { .. })
    }
}

/// Sender half of the caller-facing delivery channel
pub type LogicalEventSender = tokio::sync::mpsc::UnboundedSender<LogicalEvent>;

/// Receiver half of the caller-facing delivery channel
pub type LogicalEventReceiver = tokio::sync::mpsc::UnboundedReceiver<LogicalEvent>;
