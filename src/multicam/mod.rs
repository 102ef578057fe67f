// SPDX-License-Identifier: GPL-3.0-only

//! Logical multi-camera core
//!
//! One logical capture request fans out into per-camera pipeline requests and
//! the per-camera results fan back in to one logical result.
//!
//! ```text
//!  LogicalRequest
//!       │
//!       ▼
//!  RequestDispatcher ──get_result──▶ TransitionController
//!       │  (one PipelineRequest per required pipeline)
//!       ▼
//!  PipelineSession ──▶ CompletionRouter ──▶ ResultAggregator ──▶ LogicalEvent
//! ```

pub mod aggregator;
pub mod controller;
pub mod dispatcher;
pub mod session;
pub mod streams;
pub mod types;

pub use aggregator::{AggregatorStats, ErrorPolicy, ResultAggregator};
pub use controller::{
    ControllerConfig, ControllerKind, ControllerPolicy, TransitionController, ZoneTable,
};
pub use dispatcher::RequestDispatcher;
pub use session::{LogicalCameraSession, SessionConfig};
pub use streams::StreamMap;
pub use types::*;
