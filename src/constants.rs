// SPDX-License-Identifier: GPL-3.0-only

//! Crate-wide tunables for transition control and aggregation

use std::time::Duration;

/// Transition zone geometry
pub mod transition {
    /// Hysteresis band around each zone boundary, as a fraction of the boundary ratio
    pub const HYSTERESIS_MARGIN: f32 = 0.05;

    /// Half-width of the zone in which both neighbours stream (LPM off)
    pub const TRANSITION_MARGIN: f32 = 0.20;

    /// Half-width of the zone in which snapshot fusion may run
    pub const FUSION_MARGIN: f32 = 0.10;

    /// Largest zoom ratio a caller may request
    pub const MAX_USER_ZOOM: f32 = 8.0;

    /// Zoom ratio used to seed the controller after (re)configuration
    pub const INITIAL_ZOOM: f32 = 1.0;

    /// Relative tolerance when matching a requested focal length to a camera
    pub const FOCAL_LENGTH_MATCH_TOLERANCE: f32 = 0.10;
}

/// Snapshot fusion eligibility thresholds
pub mod fusion {
    /// Minimum lux index; darker scenes never fuse
    pub const LUX_INDEX_MIN: f32 = 1.0;

    /// Minimum focus distance in centimetres; macro scenes never fuse
    pub const FOCUS_DISTANCE_CM_MIN: f32 = 15.0;

    /// Focus distance reported when the lens is at infinity
    pub const FOCUS_DISTANCE_CM_MAX: f32 = 1000.0;
}

/// Result aggregation
pub mod aggregation {
    /// Number of frame slots tracked for partial-result delivery
    pub const MAX_OUTSTANDING_REQUESTS: usize = 128;

    /// Metadata entries held by the default pool
    pub const METADATA_POOL_CAPACITY: usize = 64;
}

/// Timing constants
pub mod timing {
    use super::Duration;

    /// How long metadata acquisition waits for a free pool entry
    pub const METADATA_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(500);

    /// Poll interval of completion worker loops
    pub const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(20);

    /// Simulated time a virtual pipeline needs to start streaming
    pub const VIRTUAL_ACTIVATION_DELAY: Duration = Duration::from_millis(5);

    /// Log a dispatch summary every Nth frame
    pub const FRAME_LOG_INTERVAL: u64 = 30;
}

/// Percentage formatting for log output (e.g. "5%")
pub fn format_margin(margin: f32) -> String {
    format!("{:.0}%", margin * 100.0)
}
