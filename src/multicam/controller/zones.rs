// SPDX-License-Identifier: GPL-3.0-only

//! Zone tables derived from camera geometry
//!
//! Each camera gets a zoom window in which it is the natural master. Adjacent
//! cameras (ordered by field of view, widest first) share a boundary ratio;
//! around each boundary lie the transition band (both stream), the fusion band
//! (snapshot fusion possible) and the hysteresis band (master keeps its role).

use super::policy::ControllerPolicy;
use crate::errors::ControllerError;
use crate::multicam::types::{CameraDescriptor, CameraId, PipelineId, ZoomRange};
use serde::Serialize;
use std::collections::HashSet;

/// Zoom window of one camera
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CameraZone {
    pub camera_id: CameraId,
    pub pipeline_id: PipelineId,
    pub zoom: ZoomRange,
    /// Field-of-view ratio relative to the primary camera
    pub adjusted_fov_ratio: f32,
}

/// Boundary between two adjacent cameras
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TransitionZone {
    /// Wider camera of the pair
    pub left_pipeline: PipelineId,
    /// Narrower camera of the pair
    pub right_pipeline: PipelineId,
    pub transition_ratio: f32,
    /// Both cameras stream inside `[low, high]`
    pub low: f32,
    pub high: f32,
    pub fusion_low: f32,
    pub fusion_high: f32,
    /// Distance past the boundary before the master gives up its role
    pub hysteresis: f32,
    pub smooth_transition_enabled: bool,
}

impl TransitionZone {
    pub fn involves(&self, pipeline_id: PipelineId) -> bool {
        self.left_pipeline == pipeline_id || self.right_pipeline == pipeline_id
    }

    /// The other camera of the pair
    pub fn neighbour_of(&self, pipeline_id: PipelineId) -> Option<PipelineId> {
        if self.left_pipeline == pipeline_id {
            Some(self.right_pipeline)
        } else if self.right_pipeline == pipeline_id {
            Some(self.left_pipeline)
        } else {
            None
        }
    }

    pub fn in_transition_band(&self, zoom: f32) -> bool {
        zoom >= self.low && zoom <= self.high
    }

    pub fn in_fusion_band(&self, zoom: f32) -> bool {
        zoom >= self.fusion_low && zoom <= self.fusion_high
    }
}

/// Zones for one camera set, computed once per (re)configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneTable {
    pub primary_pipeline: PipelineId,
    /// Ordered widest to narrowest
    pub cameras: Vec<CameraZone>,
    pub transitions: Vec<TransitionZone>,
}

impl ZoneTable {
    /// Derive zones for `cameras` (pipeline order) under `policy`
    pub fn compute(
        cameras: &[CameraDescriptor],
        policy: &ControllerPolicy,
    ) -> Result<Self, ControllerError> {
        validate_cameras(cameras)?;
        policy.validate()?;

        let primary_pipeline = match policy.primary_camera_id {
            Some(id) => cameras
                .iter()
                .position(|c| c.camera_id == id)
                .ok_or(ControllerError::UnknownCamera(id))?,
            None => widest(cameras),
        };
        let primary_fov = cameras[primary_pipeline].field_of_view();

        let ratios: Vec<f32> = cameras
            .iter()
            .map(|c| primary_fov / c.field_of_view())
            .collect();

        let mut order: Vec<PipelineId> = (0..cameras.len()).collect();
        order.sort_by(|&a, &b| {
            ratios[a]
                .total_cmp(&ratios[b])
                .then(cameras[a].camera_id.cmp(&cameras[b].camera_id))
        });

        // Paired sensors (often with identical optics) share one window
        if !policy.selects_master_by_zoom() {
            let zoom = ZoomRange {
                min: ratios[primary_pipeline],
                max: policy.max_user_zoom,
            };
            if !(zoom.min < zoom.max) {
                return Err(ControllerError::InvalidPolicy(format!(
                    "max_user_zoom {} is below the primary camera ratio",
                    policy.max_user_zoom
                )));
            }
            let cameras = order
                .iter()
                .map(|&pipeline_id| CameraZone {
                    camera_id: cameras[pipeline_id].camera_id,
                    pipeline_id,
                    zoom,
                    adjusted_fov_ratio: ratios[pipeline_id],
                })
                .collect();
            return Ok(Self {
                primary_pipeline,
                cameras,
                transitions: Vec::new(),
            });
        }

        // boundaries[k] separates order[k] and order[k + 1]
        let boundaries: Vec<f32> = order
            .windows(2)
            .map(|pair| boundary_ratio(&cameras[pair[0]], &cameras[pair[1]], ratios[pair[1]]))
            .collect();

        let last = order.len() - 1;
        let mut zones = Vec::with_capacity(order.len());
        for (k, &pipeline_id) in order.iter().enumerate() {
            let camera = &cameras[pipeline_id];
            let min = if k == 0 {
                match (camera.smooth_transition, camera.zoom_range) {
                    (false, Some(range)) => range.min,
                    _ => ratios[pipeline_id],
                }
            } else {
                boundaries[k - 1]
            };
            let max = if k == last {
                match (camera.smooth_transition, camera.zoom_range) {
                    (false, Some(range)) => range.max.min(policy.max_user_zoom),
                    _ => policy.max_user_zoom,
                }
            } else {
                boundaries[k]
            };

            if !(min < max) {
                return Err(ControllerError::InvalidGeometry {
                    camera_id: camera.camera_id,
                    reason: format!("zoom window [{}, {}] is empty", min, max),
                });
            }

            zones.push(CameraZone {
                camera_id: camera.camera_id,
                pipeline_id,
                zoom: ZoomRange { min, max },
                adjusted_fov_ratio: ratios[pipeline_id],
            });
        }

        let transitions = zones
            .windows(2)
            .map(|pair| {
                let (left, right) = (&pair[0], &pair[1]);
                let ratio = left.zoom.max;
                let smooth = cameras[left.pipeline_id].smooth_transition
                    && cameras[right.pipeline_id].smooth_transition;
                transition_zone(left, right, ratio, smooth, policy)
            })
            .collect();

        Ok(Self {
            primary_pipeline,
            cameras: zones,
            transitions,
        })
    }

    pub fn zone_for(&self, pipeline_id: PipelineId) -> Option<&CameraZone> {
        self.cameras.iter().find(|z| z.pipeline_id == pipeline_id)
    }

    /// Transition zones bordering `pipeline_id`
    pub fn transitions_of(
        &self,
        pipeline_id: PipelineId,
    ) -> impl Iterator<Item = &TransitionZone> + '_ {
        self.transitions
            .iter()
            .filter(move |t| t.involves(pipeline_id))
    }

    /// Zoom range the caller can reach
    pub fn zoom_limits(&self) -> ZoomRange {
        let min = self.cameras.first().map(|z| z.zoom.min).unwrap_or(1.0);
        let max = self.cameras.last().map(|z| z.zoom.max).unwrap_or(1.0);
        ZoomRange { min, max }
    }

    /// Zone of `pipeline_id` widened by the hysteresis of its boundaries
    pub fn hysteresis_band(&self, pipeline_id: PipelineId) -> Option<ZoomRange> {
        let zone = self.zone_for(pipeline_id)?;
        let mut band = zone.zoom;
        for t in self.transitions_of(pipeline_id) {
            if t.right_pipeline == pipeline_id {
                band.min = zone.zoom.min - t.hysteresis;
            } else {
                band.max = zone.zoom.max + t.hysteresis;
            }
        }
        Some(band)
    }
}

fn validate_cameras(cameras: &[CameraDescriptor]) -> Result<(), ControllerError> {
    if cameras.is_empty() {
        return Err(ControllerError::NoCameras);
    }
    if cameras.len() > 32 {
        return Err(ControllerError::InvalidPolicy(format!(
            "at most 32 cameras supported, got {}",
            cameras.len()
        )));
    }

    let mut seen = HashSet::new();
    for camera in cameras {
        if !seen.insert(camera.camera_id) {
            return Err(ControllerError::DuplicateCamera(camera.camera_id));
        }

        let invalid = |reason: &str| ControllerError::InvalidGeometry {
            camera_id: camera.camera_id,
            reason: reason.to_string(),
        };
        if !(camera.focal_length_mm > 0.0 && camera.focal_length_mm.is_finite()) {
            return Err(invalid("focal length must be positive"));
        }
        if !(camera.pixel_pitch_um > 0.0 && camera.pixel_pitch_um.is_finite()) {
            return Err(invalid("pixel pitch must be positive"));
        }
        if camera.active_array.is_empty() || camera.fov_rect.is_empty() {
            return Err(invalid("active array and field-of-view rectangle must be non-empty"));
        }
        if camera.sensitivity.span() <= 0 {
            return Err(invalid("sensitivity range is empty"));
        }
        if let Some(range) = camera.zoom_range
            && !(range.min > 0.0 && range.min < range.max)
        {
            return Err(invalid("zoom range must satisfy 0 < min < max"));
        }
    }
    Ok(())
}

fn widest(cameras: &[CameraDescriptor]) -> PipelineId {
    let mut best = 0;
    for (i, camera) in cameras.iter().enumerate().skip(1) {
        let fov = camera.field_of_view();
        let best_fov = cameras[best].field_of_view();
        if fov > best_fov || (fov == best_fov && camera.camera_id < cameras[best].camera_id) {
            best = i;
        }
    }
    best
}

/// Zoom ratio at which `right` takes over from `left`
fn boundary_ratio(left: &CameraDescriptor, right: &CameraDescriptor, right_ratio: f32) -> f32 {
    if left.smooth_transition && right.smooth_transition {
        return right_ratio;
    }
    // The camera that cannot zoom smoothly dictates where the switch happens
    match (right.smooth_transition, right.zoom_range, left.zoom_range) {
        (false, Some(range), _) => range.min,
        (_, _, Some(range)) if !left.smooth_transition => range.max,
        _ => right_ratio,
    }
}

fn transition_zone(
    left: &CameraZone,
    right: &CameraZone,
    ratio: f32,
    smooth: bool,
    policy: &ControllerPolicy,
) -> TransitionZone {
    let low = (ratio - ratio * policy.transition_margin).max(left.zoom.min);
    let high = (ratio + ratio * policy.transition_margin).min(right.zoom.max);
    let fusion_low = (ratio - ratio * policy.fusion_margin).max(low);
    let fusion_high = (ratio + ratio * policy.fusion_margin).min(high);

    TransitionZone {
        left_pipeline: left.pipeline_id,
        right_pipeline: right.pipeline_id,
        transition_ratio: ratio,
        low,
        high,
        fusion_low,
        fusion_high,
        hysteresis: ratio * policy.hysteresis_margin,
        smooth_transition_enabled: smooth,
    }
}
