// SPDX-License-Identifier: GPL-3.0-only

use crate::backends::metadata::MetadataPool;
use crate::constants::{aggregation, timing};
use crate::errors::{MultiCamError, MultiCamResult};
use crate::multicam::controller::{ControllerConfig, ControllerPolicy, ZoneTable};
use crate::multicam::session::SessionConfig;
use crate::multicam::types::{CameraDescriptor, CameraId, Rect, SensitivityRange};
use crate::multicam::ErrorPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result aggregation settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    /// How a pipeline error for a frame is resolved
    pub error_policy: ErrorPolicy,
    /// How long dispatch waits for a free metadata entry
    pub metadata_acquire_timeout_ms: u64,
    /// Number of metadata entries in the pool
    pub metadata_pool_capacity: usize,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::default(),
            metadata_acquire_timeout_ms: timing::METADATA_ACQUIRE_TIMEOUT.as_millis() as u64,
            metadata_pool_capacity: aggregation::METADATA_POOL_CAPACITY,
        }
    }
}

impl AggregationSettings {
    pub fn metadata_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_acquire_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Camera id presented to the caller
    pub logical_camera_id: CameraId,
    /// Physical cameras in pipeline order
    pub cameras: Vec<CameraDescriptor>,
    /// Transition controller policy
    pub policy: ControllerPolicy,
    /// Result aggregation settings
    pub aggregation: AggregationSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logical_camera_id: 0,
            cameras: vec![wide_camera(), tele_camera()],
            policy: ControllerPolicy::default(),
            aggregation: AggregationSettings::default(),
        }
    }
}

impl Config {
    /// `<config dir>/multicam/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("multicam").join("config.json"))
    }

    pub fn load(path: &Path) -> MultiCamResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        debug!(path = %path.display(), cameras = config.cameras.len(), "Loaded configuration");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> MultiCamResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        info!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Configuration at the default path, or defaults if missing or invalid
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            debug!("No config directory, using defaults");
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unusable configuration");
                Self::default()
            }
        }
    }

    /// Check that the camera set and policy produce a zone table
    pub fn validate(&self) -> MultiCamResult<()> {
        ZoneTable::compute(&self.cameras, &self.policy)?;
        if self.aggregation.metadata_pool_capacity == 0 {
            return Err(MultiCamError::Config(
                "metadata_pool_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            cameras: self.cameras.clone(),
            policy: self.policy.clone(),
            video_stream_selected: false,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            logical_camera_id: self.logical_camera_id,
            controller: self.controller_config(),
            error_policy: self.aggregation.error_policy,
        }
    }

    /// Metadata pool sized by the aggregation settings
    pub fn metadata_pool(&self) -> MetadataPool {
        MetadataPool::new(
            self.aggregation.metadata_pool_capacity,
            self.aggregation.metadata_acquire_timeout(),
        )
    }
}

fn wide_camera() -> CameraDescriptor {
    CameraDescriptor {
        camera_id: 0,
        focal_length_mm: 4.0,
        pixel_pitch_um: 1.0,
        active_array: Rect::new(0, 0, 4000, 3000),
        fov_rect: Rect::new(0, 0, 4000, 3000),
        sensitivity: SensitivityRange { min: 100, max: 3200 },
        calibration_offset: (0, 0),
        zoom_range: None,
        smooth_transition: true,
        always_on: false,
    }
}

fn tele_camera() -> CameraDescriptor {
    CameraDescriptor {
        camera_id: 1,
        focal_length_mm: 8.0,
        sensitivity: SensitivityRange { min: 50, max: 1600 },
        ..wide_camera()
    }
}
