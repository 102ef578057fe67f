// SPDX-License-Identifier: GPL-3.0-only

//! Transition controller
//!
//! Decides per request which physical cameras stream, which one is master,
//! which ones sit in low power, and whether snapshot fusion is allowed. The
//! zone table is computed on (re)configuration; [`TransitionController::get_result`]
//! only reads it plus the previous decision (for hysteresis).

pub mod policy;
pub mod remap;
pub mod zones;

pub use policy::{ControllerKind, ControllerPolicy};
pub use zones::{CameraZone, TransitionZone, ZoneTable};

use crate::backends::metadata::{LpmEntry, TagMap};
use crate::constants::transition;
use crate::errors::ControllerError;
use crate::multicam::types::{
    ActiveCamera, CameraDescriptor, CameraId, ControllerResult, LpmMode, PipelineId,
    WeightedRegion,
};
use tracing::{debug, info, warn};

/// Everything the controller is configured from
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Physical cameras in pipeline order
    pub cameras: Vec<CameraDescriptor>,
    pub policy: ControllerPolicy,
    /// A video stream is part of the stream configuration
    pub video_stream_selected: bool,
}

/// Per-session zoom/master/low-power decision maker
#[derive(Debug)]
pub struct TransitionController {
    config: ControllerConfig,
    zones: ZoneTable,
    previous: ControllerResult,
}

impl TransitionController {
    pub fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        let zones = ZoneTable::compute(&config.cameras, &config.policy)?;
        let mut controller = Self {
            previous: ControllerResult {
                master_camera_id: config.cameras[zones.primary_pipeline].camera_id,
                active_cameras: Vec::new(),
                num_active_cameras: 0,
                snapshot_fusion_enabled: false,
                active_map: 0,
            },
            config,
            zones,
        };
        controller.previous = controller.initial_result();

        info!(
            cameras = controller.config.cameras.len(),
            kind = controller.config.policy.kind.display_name(),
            master = controller.previous.master_camera_id,
            "Transition controller configured"
        );
        Ok(controller)
    }

    /// Recompute zones for a new configuration.
    ///
    /// On error the current configuration stays in effect. The previous
    /// result survives when the camera set is unchanged.
    pub fn reconfigure(&mut self, config: ControllerConfig) -> Result<(), ControllerError> {
        let zones = ZoneTable::compute(&config.cameras, &config.policy)?;

        let same_cameras = config.cameras.len() == self.config.cameras.len()
            && config
                .cameras
                .iter()
                .zip(&self.config.cameras)
                .all(|(a, b)| a.camera_id == b.camera_id);

        self.config = config;
        self.zones = zones;
        if !same_cameras {
            self.previous = self.initial_result();
        }

        info!(
            cameras = self.config.cameras.len(),
            kind = self.config.policy.kind.display_name(),
            video = self.config.video_stream_selected,
            kept_previous = same_cameras,
            "Transition controller reconfigured"
        );
        Ok(())
    }

    /// Decide master, active set and fusion eligibility for one request and
    /// keep the decision as the hysteresis reference for the next one
    pub fn get_result(
        &mut self,
        zoom: f32,
        lux: f32,
        focus_distance_cm: f32,
        snapshot_active_mask: u32,
    ) -> ControllerResult {
        let result = self.decide(zoom, lux, focus_distance_cm, snapshot_active_mask);
        self.commit(&result);
        result
    }

    /// Compute a decision without recording it.
    ///
    /// The previous result only changes through [`Self::commit`], so a
    /// request that fails after this call leaves master and hysteresis alone.
    pub fn decide(
        &self,
        zoom: f32,
        lux: f32,
        focus_distance_cm: f32,
        snapshot_active_mask: u32,
    ) -> ControllerResult {
        if !zoom.is_finite() {
            warn!(zoom, "Non-finite zoom, keeping previous controller result");
            return self.previous.clone();
        }

        let limits = self.zones.zoom_limits();
        let zoom = zoom.clamp(limits.min, limits.max);
        let keep = self.previous.master_pipeline();

        let Some(master) = self.select_master(zoom, keep) else {
            warn!(zoom, "No camera zone covers zoom, keeping previous controller result");
            return self.previous.clone();
        };

        let result = self.build_result(master, zoom, lux, focus_distance_cm, snapshot_active_mask);
        debug!(
            zoom,
            lux,
            focus_cm = focus_distance_cm,
            master = result.master_camera_id,
            active_map = result.active_map,
            fusion = result.snapshot_fusion_enabled,
            "Controller result"
        );
        result
    }

    /// Record a decision that was acted on
    pub fn commit(&mut self, result: &ControllerResult) {
        if result.master_camera_id != self.previous.master_camera_id {
            info!(
                from = self.previous.master_camera_id,
                to = result.master_camera_id,
                "Master camera switched"
            );
        }
        self.previous = result.clone();
    }

    /// Remap a metering region between two cameras' active arrays
    pub fn translate_region(
        &self,
        region: &WeightedRegion,
        from_camera_id: CameraId,
        to_camera_id: CameraId,
    ) -> Result<WeightedRegion, ControllerError> {
        let from = self
            .descriptor(from_camera_id)
            .ok_or(ControllerError::UnknownCamera(from_camera_id))?;
        let to = self
            .descriptor(to_camera_id)
            .ok_or(ControllerError::UnknownCamera(to_camera_id))?;
        Ok(remap::translate_region(region, from, to))
    }

    /// Settings written against the primary camera, translated for `pipeline_id`
    pub fn settings_for_pipeline(&self, settings: &TagMap, pipeline_id: PipelineId) -> TagMap {
        match self.config.cameras.get(pipeline_id) {
            Some(target) => remap::remap_logical_settings(settings, self.primary(), target),
            None => settings.clone(),
        }
    }

    /// Result metadata of `pipeline_id`, translated back to the primary camera
    pub fn result_to_primary(&self, metadata: &TagMap, pipeline_id: PipelineId) -> TagMap {
        match self.config.cameras.get(pipeline_id) {
            Some(source) => remap::remap_logical_result_metadata(metadata, source, self.primary()),
            None => metadata.clone(),
        }
    }

    /// Low-power state of every camera under `result`
    pub fn low_power_modes(&self, result: &ControllerResult) -> Vec<LpmEntry> {
        result
            .active_cameras
            .iter()
            .enumerate()
            .map(|(pipeline_id, camera)| {
                let mode = if camera.is_active || !self.config.policy.lpm_enabled {
                    LpmMode::None
                } else if pipeline_id == self.zones.primary_pipeline {
                    self.config.policy.lpm_main
                } else {
                    self.config.policy.lpm_aux
                };
                LpmEntry {
                    camera_id: camera.camera_id,
                    mode,
                }
            })
            .collect()
    }

    pub fn previous_result(&self) -> &ControllerResult {
        &self.previous
    }

    pub fn zones(&self) -> &ZoneTable {
        &self.zones
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn policy(&self) -> &ControllerPolicy {
        &self.config.policy
    }

    pub fn cameras(&self) -> &[CameraDescriptor] {
        &self.config.cameras
    }

    pub fn descriptor(&self, camera_id: CameraId) -> Option<&CameraDescriptor> {
        self.config.cameras.iter().find(|c| c.camera_id == camera_id)
    }

    pub fn pipeline_of(&self, camera_id: CameraId) -> Option<PipelineId> {
        self.config.cameras.iter().position(|c| c.camera_id == camera_id)
    }

    pub fn primary_pipeline(&self) -> PipelineId {
        self.zones.primary_pipeline
    }

    fn primary(&self) -> &CameraDescriptor {
        &self.config.cameras[self.zones.primary_pipeline]
    }

    fn initial_result(&self) -> ControllerResult {
        let limits = self.zones.zoom_limits();
        let zoom = transition::INITIAL_ZOOM.clamp(limits.min, limits.max);
        let master = self
            .select_master(zoom, None)
            .unwrap_or(self.zones.primary_pipeline);
        self.build_result(master, zoom, 0.0, 0.0, 0)
    }

    fn select_master(&self, zoom: f32, keep: Option<PipelineId>) -> Option<PipelineId> {
        if !self.config.policy.selects_master_by_zoom() {
            return Some(self.zones.primary_pipeline);
        }

        if let Some(current) = keep
            && let Some(band) = self.zones.hysteresis_band(current)
            && band.contains(zoom)
        {
            return Some(current);
        }

        self.zones
            .cameras
            .iter()
            .filter(|zone| zone.zoom.contains(zoom))
            .min_by(|a, b| {
                let da = (a.zoom.center() - zoom).abs();
                let db = (b.zoom.center() - zoom).abs();
                da.total_cmp(&db).then(a.camera_id.cmp(&b.camera_id))
            })
            .map(|zone| zone.pipeline_id)
    }

    /// Camera that would fuse with `master` at this zoom
    fn fusion_partner(&self, master: PipelineId, zoom: f32) -> Option<PipelineId> {
        if self.config.policy.fusion_needs_zoom_band() {
            self.zones
                .transitions_of(master)
                .find(|t| t.in_fusion_band(zoom))
                .and_then(|t| t.neighbour_of(master))
        } else {
            (0..self.config.cameras.len()).find(|&p| p != master)
        }
    }

    fn build_result(
        &self,
        master: PipelineId,
        zoom: f32,
        lux: f32,
        focus_distance_cm: f32,
        snapshot_active_mask: u32,
    ) -> ControllerResult {
        let policy = &self.config.policy;
        let partner = self.fusion_partner(master, zoom);
        let fusion = policy.snapshot_fusion_enabled
            && !self.config.video_stream_selected
            && lux >= policy.fusion_lux_min
            && focus_distance_cm >= policy.fusion_focus_min_cm
            && partner.is_some();

        let in_transition = |pipeline_id: PipelineId| {
            self.zones.transitions_of(master).any(|t| {
                t.neighbour_of(master) == Some(pipeline_id) && t.in_transition_band(zoom)
            })
        };

        let active_cameras: Vec<ActiveCamera> = self
            .config
            .cameras
            .iter()
            .enumerate()
            .map(|(pipeline_id, camera)| {
                let snapshot = pipeline_id < 32 && snapshot_active_mask & (1 << pipeline_id) != 0;
                let is_active = pipeline_id == master
                    || camera.always_on
                    || !policy.lpm_enabled
                    || in_transition(pipeline_id)
                    || (fusion && partner == Some(pipeline_id))
                    || snapshot;
                ActiveCamera {
                    camera_id: camera.camera_id,
                    is_active,
                }
            })
            .collect();

        let active_map = active_cameras
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_active)
            .fold(0u32, |map, (i, _)| map | (1 << i));

        ControllerResult {
            master_camera_id: self.config.cameras[master].camera_id,
            num_active_cameras: active_cameras.iter().filter(|c| c.is_active).count(),
            active_cameras,
            snapshot_fusion_enabled: fusion,
            active_map,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multicam::types::{Rect, SensitivityRange};

    fn camera(id: CameraId, focal: f32) -> CameraDescriptor {
        CameraDescriptor {
            camera_id: id,
            focal_length_mm: focal,
            pixel_pitch_um: 1.0,
            active_array: Rect::new(0, 0, 4000, 3000),
            fov_rect: Rect::new(0, 0, 4000, 3000),
            sensitivity: SensitivityRange::default(),
            calibration_offset: (0, 0),
            zoom_range: None,
            smooth_transition: true,
            always_on: false,
        }
    }

    fn two_camera_config() -> ControllerConfig {
        ControllerConfig {
            cameras: vec![camera(0, 4.0), camera(1, 8.0)],
            policy: ControllerPolicy {
                max_user_zoom: 4.0,
                ..ControllerPolicy::default()
            },
            video_stream_selected: false,
        }
    }

    #[test]
    fn test_initial_result_uses_widest_camera() {
        let controller = TransitionController::new(two_camera_config()).unwrap();
        let result = controller.previous_result();
        assert_eq!(result.master_camera_id, 0);
        assert!(result.is_active(0));
        assert!(!result.is_active(1));
    }

    #[test]
    fn test_non_finite_zoom_keeps_previous() {
        let mut controller = TransitionController::new(two_camera_config()).unwrap();
        let before = controller.get_result(3.0, 5.0, 50.0, 0);
        let after = controller.get_result(f32::NAN, 5.0, 50.0, 0);
        assert_eq!(before, after);
    }

    #[test]
    fn test_decide_does_not_move_master_until_committed() {
        let mut controller = TransitionController::new(two_camera_config()).unwrap();
        let tele = controller.decide(3.5, 5.0, 50.0, 0);
        assert_eq!(tele.master_camera_id, 1);
        assert_eq!(controller.previous_result().master_camera_id, 0);

        // Uncommitted, the wide master keeps its hysteresis band
        assert_eq!(controller.decide(2.05, 5.0, 50.0, 0).master_camera_id, 0);

        controller.commit(&tele);
        assert_eq!(controller.previous_result(), &tele);
        assert_eq!(controller.decide(2.05, 5.0, 50.0, 0).master_camera_id, 1);
    }

    #[test]
    fn test_zoom_clamped_to_limits() {
        let mut controller = TransitionController::new(two_camera_config()).unwrap();
        assert_eq!(controller.get_result(100.0, 5.0, 50.0, 0).master_camera_id, 1);
        assert_eq!(controller.get_result(0.1, 5.0, 50.0, 0).master_camera_id, 0);
    }

    #[test]
    fn test_snapshot_mask_forces_camera_active() {
        let mut controller = TransitionController::new(two_camera_config()).unwrap();
        let result = controller.get_result(1.1, 5.0, 50.0, 0b10);
        assert_eq!(result.master_camera_id, 0);
        assert!(result.is_active(1));
        assert_eq!(result.active_map, 0b11);
    }

    #[test]
    fn test_video_stream_disables_fusion() {
        let mut config = two_camera_config();
        config.video_stream_selected = true;
        let mut controller = TransitionController::new(config).unwrap();
        assert!(!controller.get_result(2.0, 5.0, 50.0, 0).snapshot_fusion_enabled);
    }

    #[test]
    fn test_macro_focus_disables_fusion() {
        let mut controller = TransitionController::new(two_camera_config()).unwrap();
        assert!(!controller.get_result(2.0, 5.0, 5.0, 0).snapshot_fusion_enabled);
    }

    #[test]
    fn test_lpm_disabled_keeps_everything_active() {
        let mut config = two_camera_config();
        config.policy = ControllerPolicy::for_kind(ControllerKind::BayerMono);
        let mut controller = TransitionController::new(config).unwrap();
        let result = controller.get_result(3.5, 5.0, 50.0, 0);
        // Bayer-mono pins the master to the primary camera
        assert_eq!(result.master_camera_id, 0);
        assert_eq!(result.num_active_cameras, 2);
        assert!(
            controller
                .low_power_modes(&result)
                .iter()
                .all(|e| e.mode == LpmMode::None)
        );
    }

    #[test]
    fn test_always_on_camera_stays_active() {
        let mut config = two_camera_config();
        config.cameras[1].always_on = true;
        let mut controller = TransitionController::new(config).unwrap();
        assert!(controller.get_result(1.0, 5.0, 50.0, 0).is_active(1));
    }

    #[test]
    fn test_inactive_cameras_get_low_power_modes() {
        let mut controller = TransitionController::new(two_camera_config()).unwrap();
        let result = controller.get_result(3.5, 5.0, 50.0, 0);
        let modes = controller.low_power_modes(&result);
        assert_eq!(modes[0].mode, LpmMode::FrameDrop);
        assert_eq!(modes[1].mode, LpmMode::None);
    }

    #[test]
    fn test_failed_reconfigure_keeps_old_zones() {
        let mut controller = TransitionController::new(two_camera_config()).unwrap();
        let zones = controller.zones().clone();
        let bad = ControllerConfig {
            cameras: Vec::new(),
            ..two_camera_config()
        };
        assert_eq!(controller.reconfigure(bad), Err(ControllerError::NoCameras));
        assert_eq!(controller.zones(), &zones);
    }

    #[test]
    fn test_reconfigure_is_idempotent() {
        let mut controller = TransitionController::new(two_camera_config()).unwrap();
        controller.get_result(3.0, 5.0, 50.0, 0);
        let previous = controller.previous_result().clone();

        controller.reconfigure(two_camera_config()).unwrap();
        let zones = controller.zones().clone();
        controller.reconfigure(two_camera_config()).unwrap();

        assert_eq!(controller.zones(), &zones);
        assert_eq!(controller.previous_result(), &previous);
    }

    #[test]
    fn test_translate_region_unknown_camera() {
        let controller = TransitionController::new(two_camera_config()).unwrap();
        let region = WeightedRegion {
            left: 0,
            top: 0,
            right: 10,
            bottom: 10,
            weight: 1,
        };
        assert_eq!(
            controller.translate_region(&region, 0, 7),
            Err(ControllerError::UnknownCamera(7))
        );
        assert_eq!(controller.translate_region(&region, 0, 1), Ok(region));
    }
}
