// SPDX-License-Identifier: GPL-3.0-only

//! Logical camera session
//!
//! Owns the transition controller (through the dispatcher), the aggregator and
//! the completion workers. Explicitly constructed and dependency-injected: any
//! number of independent sessions may exist in one process.

use crate::backends::metadata::MetadataStore;
use crate::backends::pipeline::{CompletionRouter, PipelineSession, Stream};
use crate::errors::{AdmissionError, MultiCamError, MultiCamResult};
use crate::multicam::aggregator::{AggregatorStats, ErrorPolicy, ResultAggregator};
use crate::multicam::controller::{ControllerConfig, TransitionController, ZoneTable};
use crate::multicam::dispatcher::{DispatchContext, RequestDispatcher};
use crate::multicam::types::{
    CameraId, ControllerResult, LogicalEventReceiver, LogicalRequest, SceneState,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};
use uuid::Uuid;

/// Everything a session is built from
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Camera id presented to the caller
    pub logical_camera_id: CameraId,
    pub controller: ControllerConfig,
    pub error_policy: ErrorPolicy,
}

pub struct LogicalCameraSession {
    id: Uuid,
    pipelines: Arc<dyn PipelineSession>,
    store: Arc<dyn MetadataStore>,
    aggregator: Arc<ResultAggregator>,
    dispatcher: Mutex<RequestDispatcher>,
    router: CompletionRouter,
    scene: Arc<Mutex<SceneState>>,
    closed: AtomicBool,
}

impl LogicalCameraSession {
    /// Build a session and start its completion workers.
    ///
    /// `router` must own the receiving ends of the senders the pipelines
    /// report through. Logical results arrive on the returned receiver.
    pub fn new(
        config: SessionConfig,
        pipelines: Arc<dyn PipelineSession>,
        store: Arc<dyn MetadataStore>,
        mut router: CompletionRouter,
    ) -> MultiCamResult<(Self, LogicalEventReceiver)> {
        check_pipeline_count(&config.controller, pipelines.as_ref())?;
        if router.pipeline_count() != pipelines.pipeline_count() {
            return Err(MultiCamError::Config(format!(
                "{} completion channels for {} pipelines",
                router.pipeline_count(),
                pipelines.pipeline_count()
            )));
        }

        let controller = TransitionController::new(config.controller)?;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let scene = Arc::new(Mutex::new(SceneState::default()));
        let aggregator = Arc::new(ResultAggregator::new(
            Arc::clone(&store),
            tx,
            config.error_policy,
            Arc::clone(&scene),
        ));
        router.start(aggregator.clone());

        let id = Uuid::new_v4();
        info!(
            session = %id,
            logical_camera = config.logical_camera_id,
            pipelines = pipelines.pipeline_count(),
            policy = ?config.error_policy,
            "Logical camera session opened"
        );

        Ok((
            Self {
                id,
                pipelines,
                store,
                aggregator,
                dispatcher: Mutex::new(RequestDispatcher::new(config.logical_camera_id, controller)),
                router,
                scene,
                closed: AtomicBool::new(false),
            },
            rx,
        ))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Declare the caller's output streams
    pub fn configure_streams(&self, streams: &[Arc<Stream>]) -> MultiCamResult<()> {
        self.lock_dispatcher().configure_streams(streams)?;
        Ok(())
    }

    /// Recompute zones for a new camera set or policy
    pub fn reconfigure(&self, config: ControllerConfig) -> MultiCamResult<()> {
        check_pipeline_count(&config, self.pipelines.as_ref())?;
        self.lock_dispatcher().reconfigure(config)?;
        Ok(())
    }

    /// Synchronous admission and fan-out; the result arrives asynchronously.
    ///
    /// Returns the controller decision the frame was dispatched with.
    pub fn submit_capture_request(&self, request: LogicalRequest) -> MultiCamResult<ControllerResult> {
        let mut dispatcher = self.lock_dispatcher();
        // close() sets the flag before flushing under this lock, so a request
        // that waited on the lock sees it here
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdmissionError::SessionClosed.into());
        }
        let scene = *self.scene.lock().unwrap_or_else(PoisonError::into_inner);
        let ctx = DispatchContext {
            pipelines: self.pipelines.as_ref(),
            store: self.store.as_ref(),
            aggregator: &self.aggregator,
            scene,
        };
        dispatcher.dispatch(request, &ctx)
    }

    /// Abandon queued pipeline work and resolve every in-flight frame.
    ///
    /// Each in-flight frame gets exactly one terminal event. Returns the
    /// number of frames resolved.
    pub fn flush(&self) -> MultiCamResult<usize> {
        // Holding the dispatcher keeps new frames out while draining
        let _dispatcher = self.lock_dispatcher();
        info!(session = %self.id, in_flight = self.aggregator.in_flight(), "Flushing session");

        let flushed = self.pipelines.flush();
        if let Err(e) = &flushed {
            error!(session = %self.id, error = %e, "Pipeline flush failed, draining anyway");
        }
        let drained = self.aggregator.drain();
        flushed?;
        Ok(drained)
    }

    /// Refuse further requests, flush, and stop the completion workers
    pub fn close(&self) -> MultiCamResult<usize> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let drained = self.flush();
        self.router.stop();
        info!(session = %self.id, "Logical camera session closed");
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.aggregator.in_flight()
    }

    pub fn stats(&self) -> AggregatorStats {
        self.aggregator.stats()
    }

    /// Scene statistics as last reported by a logical result
    pub fn scene(&self) -> SceneState {
        *self.scene.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decision used for the most recent request
    pub fn last_decision(&self) -> ControllerResult {
        self.lock_dispatcher().controller().previous_result().clone()
    }

    pub fn zones(&self) -> ZoneTable {
        self.lock_dispatcher().controller().zones().clone()
    }

    fn lock_dispatcher(&self) -> std::sync::MutexGuard<'_, RequestDispatcher> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for LogicalCameraSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(session = %self.id, error = %e, "Error while closing session");
        }
    }
}

fn check_pipeline_count(config: &ControllerConfig, pipelines: &dyn PipelineSession) -> MultiCamResult<()> {
    if config.cameras.len() != pipelines.pipeline_count() {
        return Err(MultiCamError::Config(format!(
            "{} cameras configured for {} pipelines",
            config.cameras.len(),
            pipelines.pipeline_count()
        )));
    }
    Ok(())
}
