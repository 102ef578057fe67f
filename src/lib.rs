// SPDX-License-Identifier: GPL-3.0-only

//! Logical multi-camera orchestration
//!
//! Presents several physical cameras (wide, tele, ...) as one logical camera.
//! Each logical capture request is fanned out to the physical pipelines the
//! transition controller selects, and the per-pipeline results are fanned
//! back in to exactly one logical result per frame.
//!
//! # Architecture
//!
//! - [`multicam`]: transition controller, dispatcher, aggregator and session
//! - [`backends`]: metadata store and physical pipeline collaborators
//! - [`config`]: camera set and policy configuration
//! - [`constants`]: tuning values
//! - [`errors`]: error types
//!
//! # Example
//!
//! ```ignore
//! let config = Config::default();
//! let (router, senders) = CompletionRouter::channels(config.cameras.len());
//! let pipelines = Arc::new(VirtualPipelineSession::new(VirtualPipelineConfig::default(), senders));
//! let store = Arc::new(config.metadata_pool());
//! let (session, mut events) =
//!     LogicalCameraSession::new(config.session_config(), pipelines, store, router)?;
//! ```

pub mod backends;
pub mod config;
pub mod constants;
pub mod errors;
pub mod multicam;

// Re-export commonly used types
pub use config::Config;
pub use errors::{MultiCamError, MultiCamResult};
pub use multicam::{
    ControllerConfig, ControllerPolicy, LogicalCameraSession, LogicalEvent, LogicalRequest,
    LogicalResult, SessionConfig, TransitionController,
};
