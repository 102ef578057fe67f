// SPDX-License-Identifier: GPL-3.0-only

//! Data-driven controller policies
//!
//! Controller variants differ only in parameters, never in the shape of the
//! decision, so one controller consumes a [`ControllerPolicy`] selected at
//! configuration time.

use crate::constants::{fusion, transition};
use crate::errors::ControllerError;
use crate::multicam::types::{CameraId, LpmMode, SyncMode};
use serde::{Deserialize, Serialize};

/// Logical camera flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ControllerKind {
    /// Cameras with different fields of view, master follows zoom
    #[default]
    MultiFov,
    /// Colour + monochrome pair, colour camera always master
    BayerMono,
    /// Real-time bokeh pair, primary camera always master
    Rtb,
}

impl ControllerKind {
    pub const ALL: [ControllerKind; 3] = [
        ControllerKind::MultiFov,
        ControllerKind::BayerMono,
        ControllerKind::Rtb,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            ControllerKind::MultiFov => "Multi-FOV",
            ControllerKind::BayerMono => "Bayer-Mono",
            ControllerKind::Rtb => "Real-time bokeh",
        }
    }
}

/// Parameters steering the transition controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerPolicy {
    pub kind: ControllerKind,
    /// Camera whose coordinate space the caller uses; widest when unset
    pub primary_camera_id: Option<CameraId>,
    /// Put cameras outside the transition band into low power
    pub lpm_enabled: bool,
    pub snapshot_fusion_enabled: bool,
    pub hysteresis_margin: f32,
    pub transition_margin: f32,
    pub fusion_margin: f32,
    pub fusion_lux_min: f32,
    pub fusion_focus_min_cm: f32,
    pub max_user_zoom: f32,
    pub sync_mode: SyncMode,
    /// Low-power state of an inactive primary camera
    pub lpm_main: LpmMode,
    /// Low-power state of any other inactive camera
    pub lpm_aux: LpmMode,
}

impl Default for ControllerPolicy {
    fn default() -> Self {
        Self::for_kind(ControllerKind::MultiFov)
    }
}

impl ControllerPolicy {
    /// Defaults for one controller flavour
    pub fn for_kind(kind: ControllerKind) -> Self {
        let base = Self {
            kind,
            primary_camera_id: None,
            lpm_enabled: true,
            snapshot_fusion_enabled: true,
            hysteresis_margin: transition::HYSTERESIS_MARGIN,
            transition_margin: transition::TRANSITION_MARGIN,
            fusion_margin: transition::FUSION_MARGIN,
            fusion_lux_min: fusion::LUX_INDEX_MIN,
            fusion_focus_min_cm: fusion::FOCUS_DISTANCE_CM_MIN,
            max_user_zoom: transition::MAX_USER_ZOOM,
            sync_mode: SyncMode::NoSync,
            lpm_main: LpmMode::FrameDrop,
            lpm_aux: LpmMode::SensorSuspend,
        };

        match kind {
            ControllerKind::MultiFov => base,
            // Both sensors feed every frame
            ControllerKind::BayerMono | ControllerKind::Rtb => Self {
                lpm_enabled: false,
                sync_mode: SyncMode::HwSync,
                ..base
            },
        }
    }

    /// Whether zoom decides the master
    pub fn selects_master_by_zoom(&self) -> bool {
        self.kind == ControllerKind::MultiFov
    }

    /// Whether fusion is restricted to the fusion zoom band
    pub fn fusion_needs_zoom_band(&self) -> bool {
        self.kind == ControllerKind::MultiFov
    }

    pub fn validate(&self) -> Result<(), ControllerError> {
        let margins = [
            ("hysteresis_margin", self.hysteresis_margin),
            ("transition_margin", self.transition_margin),
            ("fusion_margin", self.fusion_margin),
        ];
        for (name, value) in margins {
            if !value.is_finite() || !(0.0..1.0).contains(&value) {
                return Err(ControllerError::InvalidPolicy(format!(
                    "{} must be in [0, 1), got {}",
                    name, value
                )));
            }
        }
        if !self.max_user_zoom.is_finite() || self.max_user_zoom <= 0.0 {
            return Err(ControllerError::InvalidPolicy(format!(
                "max_user_zoom must be positive, got {}",
                self.max_user_zoom
            )));
        }
        Ok(())
    }
}
