// SPDX-License-Identifier: GPL-3.0-only

//! Fan-out of one logical request into per-pipeline requests
//!
//! Runs on the caller's submission thread. Admission checks happen before
//! anything is acquired; the aggregation record is registered before any
//! pipeline is activated or submitted to, so the first completion always
//! finds it.

use crate::backends::metadata::{CameraIdentity, MetadataHandle, MetadataStore, Tag, TagMap, TagValue};
use crate::backends::pipeline::{
    BackendResult, PipelineRequest, PipelineSession, RequestPrivate, Stream, StreamBuffer,
    StreamId,
};
use crate::constants::{timing, transition};
use crate::errors::{AdmissionError, ControllerError, MetadataError, MultiCamResult, ResourceError};
use crate::multicam::aggregator::{AggregationRecord, ResultAggregator, ResultRemap};
use crate::multicam::controller::{ControllerConfig, TransitionController};
use crate::multicam::streams::StreamMap;
use crate::multicam::types::{
    CameraId, ControllerResult, FrameNumber, LogicalRequest, PipelineId, SceneState,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Collaborators borrowed for one dispatch
pub struct DispatchContext<'a> {
    pub pipelines: &'a dyn PipelineSession,
    pub store: &'a dyn MetadataStore,
    pub aggregator: &'a ResultAggregator,
    /// Latest scene statistics reported by results
    pub scene: SceneState,
}

pub struct RequestDispatcher {
    logical_camera_id: CameraId,
    controller: TransitionController,
    streams: StreamMap,
    /// Stream configuration as last supplied by the caller
    configured_streams: Vec<Arc<Stream>>,
    last_settings: Option<TagMap>,
    /// Pipelines that already received their identity tag
    identity_sent: HashSet<PipelineId>,
    /// Activations requested but not yet reported active
    pending_activation: HashSet<PipelineId>,
    dispatched: u64,
}

impl RequestDispatcher {
    pub fn new(logical_camera_id: CameraId, controller: TransitionController) -> Self {
        Self {
            logical_camera_id,
            controller,
            streams: StreamMap::new(),
            configured_streams: Vec::new(),
            last_settings: None,
            identity_sent: HashSet::new(),
            pending_activation: HashSet::new(),
            dispatched: 0,
        }
    }

    pub fn controller(&self) -> &TransitionController {
        &self.controller
    }

    pub fn stream_map(&self) -> &StreamMap {
        &self.streams
    }

    /// Frames dispatched since creation
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Install a new stream configuration; a video stream turns fusion off
    pub fn configure_streams(&mut self, streams: &[Arc<Stream>]) -> Result<(), ControllerError> {
        let cameras = self.camera_ids();
        self.streams.configure(streams, &cameras);
        self.configured_streams = streams.to_vec();

        let video = self.streams.video_selected();
        if video != self.controller.config().video_stream_selected {
            let config = ControllerConfig {
                video_stream_selected: video,
                ..self.controller.config().clone()
            };
            self.controller.reconfigure(config)?;
        }
        Ok(())
    }

    /// Reconfigure the controller. A changed camera set resets per-pipeline state.
    pub fn reconfigure(&mut self, config: ControllerConfig) -> Result<(), ControllerError> {
        let before = self.camera_ids();
        let config = ControllerConfig {
            video_stream_selected: config.video_stream_selected || self.streams.video_selected(),
            ..config
        };
        self.controller.reconfigure(config)?;

        if self.camera_ids() != before {
            self.identity_sent.clear();
            self.pending_activation.clear();
            let cameras = self.camera_ids();
            self.streams.configure(&self.configured_streams, &cameras);
        }
        Ok(())
    }

    /// Validate, fan out and submit one logical request.
    ///
    /// Returns the controller decision the frame was dispatched with.
    pub fn dispatch(
        &mut self,
        request: LogicalRequest,
        ctx: &DispatchContext<'_>,
    ) -> MultiCamResult<ControllerResult> {
        let frame_number = request.frame_number;
        let settings = self.validate(&request, ctx.aggregator).inspect_err(|e| {
            warn!(frame = frame_number, error = %e, "Capture request rejected");
        })?;

        let zoom = float_tag(&settings, Tag::ZoomRatio).unwrap_or(transition::INITIAL_ZOOM);
        let lux = float_tag(&settings, Tag::LuxIndex).unwrap_or(ctx.scene.lux_index);
        let focus = float_tag(&settings, Tag::FocusDistanceCm).unwrap_or(ctx.scene.focus_distance_cm);

        // Committed only once the frame is submitted
        let decision = self
            .controller
            .decide(zoom, lux, focus, request.snapshot_active_mask);
        let master = decision
            .master_pipeline()
            .unwrap_or(self.controller.primary_pipeline());
        let logical = self.logical_pipeline(frame_number, &settings, master);
        let cameras = self.camera_ids();

        // Route buffers, substituting internal streams for logical ones
        let LogicalRequest {
            output_buffers,
            input_buffer,
            physical_settings,
            ..
        } = request;

        let mut routed: BTreeMap<PipelineId, Vec<StreamBuffer>> = BTreeMap::new();
        let mut restore = HashMap::new();
        for buffer in output_buffers {
            let (pipeline_id, buffer) = self.route(buffer, logical, &cameras, &mut restore)?;
            routed.entry(pipeline_id).or_default().push(buffer);
        }
        let mut input = match input_buffer {
            Some(buffer) => Some(self.route(buffer, logical, &cameras, &mut restore)?),
            None => None,
        };

        let required: BTreeSet<PipelineId> = decision
            .active_pipelines()
            .into_iter()
            .chain([logical])
            .chain(routed.keys().copied())
            .chain(input.as_ref().map(|(pipeline_id, _)| *pipeline_id))
            .collect();

        let overrides: HashMap<CameraId, TagMap> = physical_settings
            .into_iter()
            .filter_map(|p| p.settings.map(|s| (p.camera_id, s)))
            .collect();

        let low_power = TagValue::LowPower(self.controller.low_power_modes(&decision));
        let sync = TagValue::Sync(self.controller.policy().sync_mode);

        let mut requests = Vec::with_capacity(required.len());
        for &pipeline_id in &required {
            let camera_id = cameras[pipeline_id];
            let mut tags = self.controller.settings_for_pipeline(&settings, pipeline_id);
            if let Some(physical) = overrides.get(&camera_id) {
                tags.extend(physical.iter().map(|(tag, value)| (*tag, value.clone())));
            }
            tags.insert(Tag::MasterCamera, TagValue::Bool(pipeline_id == master));
            tags.insert(Tag::LowPowerMode, low_power.clone());
            tags.insert(Tag::SyncMode, sync.clone());
            if !self.identity_sent.contains(&pipeline_id) {
                tags.insert(
                    Tag::CameraIdentity,
                    TagValue::Identity(CameraIdentity {
                        current_camera_id: camera_id,
                        logical_camera_id: self.logical_camera_id,
                        master_camera_id: decision.master_camera_id,
                    }),
                );
            }

            let input_metadata = acquire(ctx.store, frame_number)?;
            for (tag, value) in tags {
                ctx.store.set_tag(&input_metadata, tag, value);
            }
            let output_metadata = acquire(ctx.store, frame_number)?;

            requests.push(PipelineRequest {
                frame_number,
                pipeline_id,
                output_buffers: routed.remove(&pipeline_id).unwrap_or_default(),
                input_buffer: input
                    .take_if(|(target, _)| *target == pipeline_id)
                    .map(|(_, buffer)| buffer),
                input_metadata,
                output_metadata,
                private: RequestPrivate {
                    stream_index: pipeline_id,
                },
            });
        }

        let remap = (logical != self.controller.primary_pipeline()).then(|| ResultRemap {
            source: self.controller.cameras()[logical].clone(),
            reference: self.controller.cameras()[self.controller.primary_pipeline()].clone(),
        });
        let order = required.iter().map(|&p| (p, cameras[p])).collect();
        let record = AggregationRecord::new(frame_number, logical, order, decision.clone())
            .with_remap(remap)
            .with_stream_restore(restore);
        ctx.aggregator.insert(record)?;

        if let Err(e) = self.activate_required(&required, ctx.pipelines) {
            ctx.aggregator.discard(frame_number);
            error!(frame = frame_number, error = %e, "Pipeline activation failed");
            return Err(e.into());
        }

        if let Err(e) = ctx.pipelines.submit(requests) {
            ctx.aggregator.discard(frame_number);
            error!(frame = frame_number, error = %e, "Pipeline submit failed");
            return Err(e.into());
        }

        self.controller.commit(&decision);
        if self.controller.policy().lpm_enabled {
            self.deactivate_unneeded(&required, ctx.pipelines);
        }

        self.identity_sent.extend(required.iter().copied());
        self.last_settings = Some(settings);
        self.dispatched += 1;

        debug!(
            frame = frame_number,
            master = decision.master_camera_id,
            logical_pipeline = logical,
            pipelines = ?required,
            "Dispatched logical request"
        );
        if self.dispatched % timing::FRAME_LOG_INTERVAL == 0 {
            info!(
                frames = self.dispatched,
                master = decision.master_camera_id,
                active = decision.num_active_cameras,
                in_flight = ctx.aggregator.in_flight(),
                "Dispatch progress"
            );
        }

        Ok(decision)
    }

    fn validate(
        &self,
        request: &LogicalRequest,
        aggregator: &ResultAggregator,
    ) -> Result<TagMap, AdmissionError> {
        let has_settings = request.settings.is_some();
        if request
            .physical_settings
            .iter()
            .any(|p| p.settings.is_some() != has_settings)
        {
            return Err(AdmissionError::SettingsNullityMismatch);
        }
        if let Some(unknown) = request
            .physical_settings
            .iter()
            .find(|p| self.controller.descriptor(p.camera_id).is_none())
        {
            return Err(AdmissionError::UnknownPhysicalCamera(unknown.camera_id));
        }
        if request.output_buffers.is_empty() {
            return Err(AdmissionError::NoOutputBuffers);
        }
        if let Some(camera_id) = request
            .output_buffers
            .iter()
            .chain(request.input_buffer.as_ref())
            .filter_map(|b| b.stream.physical_camera_id)
            .find(|id| self.controller.descriptor(*id).is_none())
        {
            return Err(AdmissionError::UnknownStreamCamera(camera_id));
        }
        if aggregator.contains(request.frame_number) {
            return Err(AdmissionError::DuplicateFrame(request.frame_number));
        }

        match (&request.settings, &self.last_settings) {
            (Some(settings), _) => Ok(settings.clone()),
            (None, Some(previous)) => Ok(previous.clone()),
            (None, None) => Err(AdmissionError::MissingInitialSettings),
        }
    }

    /// Pipeline whose metadata becomes the caller-visible result.
    ///
    /// Nearest focal length to the requested one, within tolerance; the
    /// master otherwise. A requested focal length with no match is logged.
    fn logical_pipeline(
        &self,
        frame_number: FrameNumber,
        settings: &TagMap,
        master: PipelineId,
    ) -> PipelineId {
        let Some(requested) = float_tag(settings, Tag::LensFocalLength) else {
            return master;
        };

        let nearest = self
            .controller
            .cameras()
            .iter()
            .enumerate()
            .map(|(p, c)| (p, (c.focal_length_mm - requested).abs()))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

        match nearest {
            Some((pipeline_id, diff))
                if diff <= requested.abs() * transition::FOCAL_LENGTH_MATCH_TOLERANCE =>
            {
                pipeline_id
            }
            _ => {
                warn!(
                    frame = frame_number,
                    focal_length = requested,
                    fallback = master,
                    "No camera matches requested focal length, using master pipeline"
                );
                master
            }
        }
    }

    fn route(
        &mut self,
        buffer: StreamBuffer,
        logical: PipelineId,
        cameras: &[CameraId],
        restore: &mut HashMap<StreamId, Arc<Stream>>,
    ) -> Result<(PipelineId, StreamBuffer), AdmissionError> {
        match buffer.stream.physical_camera_id {
            None => {
                let internal = self
                    .streams
                    .internal_for(&buffer.stream, logical, cameras[logical]);
                restore.insert(internal.id, Arc::clone(&buffer.stream));
                Ok((logical, buffer.retarget(internal)))
            }
            Some(camera_id) => {
                let pipeline_id = self
                    .controller
                    .pipeline_of(camera_id)
                    .ok_or(AdmissionError::UnknownStreamCamera(camera_id))?;
                Ok((pipeline_id, buffer))
            }
        }
    }

    fn activate_required(
        &mut self,
        required: &BTreeSet<PipelineId>,
        pipelines: &dyn PipelineSession,
    ) -> BackendResult<()> {
        self.pending_activation.retain(|p| !pipelines.is_active(*p));

        for &pipeline_id in required {
            if pipelines.is_active(pipeline_id) || self.pending_activation.contains(&pipeline_id) {
                continue;
            }
            info!(pipeline = pipeline_id, "Activating pipeline");
            pipelines.activate(pipeline_id)?;
            self.pending_activation.insert(pipeline_id);
        }
        Ok(())
    }

    fn deactivate_unneeded(&mut self, required: &BTreeSet<PipelineId>, pipelines: &dyn PipelineSession) {
        for pipeline_id in 0..pipelines.pipeline_count() {
            if required.contains(&pipeline_id) {
                continue;
            }
            let pending = self.pending_activation.remove(&pipeline_id);
            if !pending && !pipelines.is_active(pipeline_id) {
                continue;
            }
            match pipelines.deactivate(pipeline_id) {
                Ok(()) => info!(pipeline = pipeline_id, "Pipeline moved to low power"),
                Err(e) => warn!(pipeline = pipeline_id, error = %e, "Failed to deactivate pipeline"),
            }
        }
    }

    fn camera_ids(&self) -> Vec<CameraId> {
        self.controller.cameras().iter().map(|c| c.camera_id).collect()
    }
}

fn float_tag(tags: &TagMap, tag: Tag) -> Option<f32> {
    tags.get(&tag).and_then(TagValue::as_float)
}

fn acquire(store: &dyn MetadataStore, frame_number: FrameNumber) -> Result<MetadataHandle, ResourceError> {
    store.acquire(frame_number).map_err(|e| match e {
        MetadataError::Timeout(timeout) => ResourceError::MetadataPoolExhausted {
            frame_number,
            timeout,
        },
        other => ResourceError::AllocationFailed(other.to_string()),
    })
}
