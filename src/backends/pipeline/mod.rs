// SPDX-License-Identifier: GPL-3.0-only

//! Physical pipeline abstraction
//!
//! ```text
//! ┌─────────────────────┐
//! │  RequestDispatcher  │  ← one batch per logical request
//! └──────────┬──────────┘
//!            ▼
//! ┌─────────────────────┐
//! │ PipelineSession     │  ← activate / submit / flush
//! └──────────┬──────────┘
//!            ▼ (async, per pipeline)
//! ┌─────────────────────┐
//! │ CompletionRouter    │  ← one channel + worker per pipeline
//! └──────────┬──────────┘
//!            ▼
//! ┌─────────────────────┐
//! │  ResultAggregator   │
//! └─────────────────────┘
//! ```

pub mod completion;
pub mod frame_loop;
pub mod types;
pub mod virtual_pipeline;

pub use completion::{CompletionHandler, CompletionRouter, CompletionSender};
pub use types::*;
pub use virtual_pipeline::{VirtualPipelineConfig, VirtualPipelineSession};

/// Pipeline collaborator contract
///
/// Results are not returned from these calls: each pipeline reports through
/// the [`CompletionSender`] it was constructed with.
pub trait PipelineSession: Send + Sync {
    /// Number of physical pipelines; ids are `0..pipeline_count()`
    fn pipeline_count(&self) -> usize;

    /// Bring a pipeline's sensor to full streaming. May block briefly.
    fn activate(&self, pipeline_id: usize) -> BackendResult<()>;

    /// Put a pipeline into low-power mode
    fn deactivate(&self, pipeline_id: usize) -> BackendResult<()>;

    fn is_active(&self, pipeline_id: usize) -> bool;

    /// Submit one request per pipeline as a single batch
    fn submit(&self, requests: Vec<PipelineRequest>) -> BackendResult<()>;

    /// Abandon queued work; in-flight frames may still report
    fn flush(&self) -> BackendResult<()>;
}
