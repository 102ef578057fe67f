// SPDX-License-Identifier: GPL-3.0-only

//! Logical-to-internal stream substitution
//!
//! Each logical output stream gets one internal stream object per physical
//! pipeline. Buffers travel through a pipeline attached to the internal stream
//! and are re-attached to the caller's original `Arc<Stream>` on the way out.

use crate::backends::pipeline::{Stream, StreamId, StreamUsage};
use crate::multicam::types::{CameraId, PipelineId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Internal stream ids are allocated above this value
pub const INTERNAL_STREAM_BASE: StreamId = 0x8000_0000;

#[derive(Debug, Default)]
pub struct StreamMap {
    /// (caller stream id, pipeline) -> internal stream
    internal: HashMap<(StreamId, PipelineId), Arc<Stream>>,
    next_internal_id: StreamId,
    video_selected: bool,
}

impl StreamMap {
    pub fn new() -> Self {
        Self {
            next_internal_id: INTERNAL_STREAM_BASE,
            ..Self::default()
        }
    }

    /// Replace the stream configuration. Internal streams are created for
    /// every logical stream on every pipeline.
    pub fn configure(&mut self, streams: &[Arc<Stream>], cameras: &[CameraId]) {
        self.internal.clear();
        self.next_internal_id = INTERNAL_STREAM_BASE;
        self.video_selected = streams.iter().any(|s| s.usage == StreamUsage::Video);

        for stream in streams.iter().filter(|s| s.is_logical()) {
            for (pipeline_id, camera_id) in cameras.iter().enumerate() {
                self.internal_for(stream, pipeline_id, *camera_id);
            }
        }
        debug!(
            streams = streams.len(),
            internal = self.internal.len(),
            video = self.video_selected,
            "Stream map configured"
        );
    }

    /// A video stream is part of the configuration
    pub fn video_selected(&self) -> bool {
        self.video_selected
    }

    /// Internal stream standing in for `stream` on `pipeline_id`.
    ///
    /// Unknown streams are registered on first use.
    pub fn internal_for(
        &mut self,
        stream: &Arc<Stream>,
        pipeline_id: PipelineId,
        camera_id: CameraId,
    ) -> Arc<Stream> {
        if let Some(internal) = self.internal.get(&(stream.id, pipeline_id)) {
            return Arc::clone(internal);
        }

        let id = self.next_internal_id;
        self.next_internal_id = self.next_internal_id.wrapping_add(1).max(INTERNAL_STREAM_BASE);

        let internal = Arc::new(Stream {
            id,
            width: stream.width,
            height: stream.height,
            usage: stream.usage,
            physical_camera_id: Some(camera_id),
        });
        self.internal.insert((stream.id, pipeline_id), Arc::clone(&internal));
        internal
    }

    pub fn len(&self) -> usize {
        self.internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.internal.is_empty()
    }
}
