// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for logical camera sessions: fan-out, fan-in and flush

use multicam::Config;
use multicam::backends::metadata::{MetadataPool, Tag, TagMap, TagValue};
use multicam::backends::pipeline::{
    BackendResult, BufferHandle, CompletionRouter, CompletionSender, NotifyMessage,
    PipelineRequest, PipelineResult, PipelineSession, Stream, StreamBuffer, StreamUsage,
    VirtualPipelineConfig, VirtualPipelineSession,
};
use multicam::errors::{
    AdmissionError, LogicalErrorKind, MultiCamError, PipelineError, ResourceError,
};
use multicam::multicam::streams::INTERNAL_STREAM_BASE;
use multicam::multicam::{
    ErrorPolicy, FrameNumber, LogicalCameraSession, LogicalEvent, LogicalEventReceiver,
    LogicalRequest, LogicalResult, PipelineId, SceneState,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);
const QUIET_PERIOD: Duration = Duration::from_millis(100);

/// Pipelines that hold every submitted request until the test completes it
#[derive(Default)]
struct ScriptedPipelines {
    requests: Mutex<Vec<PipelineRequest>>,
    active: Mutex<HashSet<PipelineId>>,
    activations: Mutex<Vec<PipelineId>>,
    fail_submit: AtomicBool,
    /// Flush reports that it started, then waits to be released
    flush_gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl ScriptedPipelines {
    /// Remove the queued request of `pipeline_id` for `frame_number`
    fn take(&self, pipeline_id: PipelineId, frame_number: FrameNumber) -> PipelineRequest {
        let mut requests = self.requests.lock().unwrap();
        let index = requests
            .iter()
            .position(|r| r.pipeline_id == pipeline_id && r.frame_number == frame_number)
            .unwrap_or_else(|| panic!("no request for pipeline {} frame {}", pipeline_id, frame_number));
        requests.remove(index)
    }

    fn pipelines_for(&self, frame_number: FrameNumber) -> Vec<PipelineId> {
        let mut pipelines: Vec<_> = self
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.frame_number == frame_number)
            .map(|r| r.pipeline_id)
            .collect();
        pipelines.sort();
        pipelines
    }
}

impl PipelineSession for ScriptedPipelines {
    fn pipeline_count(&self) -> usize {
        2
    }

    fn activate(&self, pipeline_id: usize) -> BackendResult<()> {
        self.active.lock().unwrap().insert(pipeline_id);
        self.activations.lock().unwrap().push(pipeline_id);
        Ok(())
    }

    fn deactivate(&self, pipeline_id: usize) -> BackendResult<()> {
        self.active.lock().unwrap().remove(&pipeline_id);
        Ok(())
    }

    fn is_active(&self, pipeline_id: usize) -> bool {
        self.active.lock().unwrap().contains(&pipeline_id)
    }

    fn submit(&self, requests: Vec<PipelineRequest>) -> BackendResult<()> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(PipelineError::SubmitFailed("scripted failure".to_string()));
        }
        self.requests.lock().unwrap().extend(requests);
        Ok(())
    }

    fn flush(&self) -> BackendResult<()> {
        let gate = self.flush_gate.lock().unwrap().take();
        if let Some((started, release)) = gate {
            started.send(()).unwrap();
            release.recv().unwrap();
        }
        self.requests.lock().unwrap().clear();
        Ok(())
    }
}

struct Harness {
    session: LogicalCameraSession,
    events: LogicalEventReceiver,
    pipelines: Arc<ScriptedPipelines>,
    senders: Vec<CompletionSender>,
    store: Arc<MetadataPool>,
    preview: Arc<Stream>,
}

impl Harness {
    fn new(error_policy: ErrorPolicy) -> Self {
        Self::with_pool(error_policy, MetadataPool::new(32, Duration::from_millis(50)))
    }

    fn with_pool(error_policy: ErrorPolicy, pool: MetadataPool) -> Self {
        let mut config = Config::default();
        config.aggregation.error_policy = error_policy;

        let (router, senders) = CompletionRouter::channels(2);
        let pipelines = Arc::new(ScriptedPipelines::default());
        let store = Arc::new(pool);
        let (session, events) = LogicalCameraSession::new(
            config.session_config(),
            pipelines.clone(),
            store.clone(),
            router,
        )
        .unwrap();

        let preview = Arc::new(Stream::new(1, 1280, 720, StreamUsage::Preview));
        session.configure_streams(std::slice::from_ref(&preview)).unwrap();

        Self {
            session,
            events,
            pipelines,
            senders,
            store,
            preview,
        }
    }

    fn request(&self, frame_number: FrameNumber, zoom: f32) -> LogicalRequest {
        LogicalRequest::new(frame_number, Some(zoom_settings(zoom))).with_output(StreamBuffer::new(
            self.preview.clone(),
            BufferHandle(frame_number),
        ))
    }

    /// Answer the queued request like a pipeline would
    fn complete(&self, pipeline_id: PipelineId, frame_number: FrameNumber) {
        let request = self.pipelines.take(pipeline_id, frame_number);
        request.output_metadata.set(Tag::LuxIndex, TagValue::Float(5.0));
        request.output_metadata.set(Tag::SensorSensitivity, TagValue::Int(50));
        assert!(self.senders[pipeline_id].send_result(PipelineResult {
            pipeline_id,
            frame_number,
            metadata: request.output_metadata,
            output_buffers: request.output_buffers,
            input_buffer: request.input_buffer,
        }));
    }

    async fn next_event(&mut self) -> LogicalEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn next_result(&mut self) -> LogicalResult {
        match self.next_event().await {
            LogicalEvent::Result(result) => result,
            other => panic!("expected result, got {:?}", other),
        }
    }

    async fn assert_quiet(&mut self) {
        let waited = tokio::time::timeout(QUIET_PERIOD, self.events.recv()).await;
        assert!(waited.is_err(), "unexpected event: {:?}", waited);
    }
}

fn zoom_settings(zoom: f32) -> TagMap {
    let mut settings = TagMap::new();
    settings.insert(Tag::ZoomRatio, TagValue::Float(zoom));
    settings
}

/// Session over simulated pipelines
struct VirtualHarness {
    session: LogicalCameraSession,
    events: LogicalEventReceiver,
    pipelines: Arc<VirtualPipelineSession>,
    store: Arc<MetadataPool>,
    preview: Arc<Stream>,
}

impl VirtualHarness {
    fn new() -> Self {
        let config = Config::default();
        let (router, senders) = CompletionRouter::channels(config.cameras.len());
        let pipelines = Arc::new(VirtualPipelineSession::new(
            VirtualPipelineConfig::default(),
            senders,
        ));
        let store = Arc::new(config.metadata_pool());
        let (session, events) = LogicalCameraSession::new(
            config.session_config(),
            pipelines.clone(),
            store.clone(),
            router,
        )
        .unwrap();

        let preview = Arc::new(Stream::new(0, 1920, 1080, StreamUsage::Preview));
        session.configure_streams(std::slice::from_ref(&preview)).unwrap();

        Self {
            session,
            events,
            pipelines,
            store,
            preview,
        }
    }

    fn request(&self, frame_number: FrameNumber, zoom: f32) -> LogicalRequest {
        LogicalRequest::new(frame_number, Some(zoom_settings(zoom))).with_output(StreamBuffer::new(
            self.preview.clone(),
            BufferHandle(frame_number),
        ))
    }

    async fn next_event(&mut self) -> LogicalEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    /// Skip shutter and partials up to the next result or error
    async fn next_terminal(&mut self) -> LogicalEvent {
        loop {
            let event = self.next_event().await;
            if event.is_terminal() {
                return event;
            }
        }
    }

    async fn wait_processed(&self, count: u64) {
        tokio::time::timeout(EVENT_TIMEOUT, async {
            while self.pipelines.processed() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipelines did not process requests");
    }

    fn shutdown(self) {
        self.session.close().unwrap();
        self.pipelines.shutdown();
        assert_eq!(self.store.outstanding(), 0);
    }
}

#[tokio::test]
async fn test_result_emitted_once_all_pipelines_report() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    // Asking for the tele focal length makes pipeline 1 the logical pipeline
    let mut settings = zoom_settings(2.0);
    settings.insert(Tag::LensFocalLength, TagValue::Float(8.0));
    let request = LogicalRequest::new(42, Some(settings))
        .with_output(StreamBuffer::new(h.preview.clone(), BufferHandle(42)));
    let decision = h.session.submit_capture_request(request).unwrap();
    assert_eq!(decision.active_map, 0b11);
    assert_eq!(h.pipelines.pipelines_for(42), vec![0, 1]);

    h.complete(1, 42);
    h.assert_quiet().await;
    assert_eq!(h.session.in_flight(), 1);

    h.complete(0, 42);
    let result = h.next_result().await;
    assert_eq!(result.frame_number, 42);
    assert_eq!(result.logical_pipeline_id, 1);
    assert!(result.is_complete());
    assert_eq!(result.physical_metadata.len(), 2);
    let cameras: Vec<_> = result.physical_metadata.iter().map(|p| p.camera_id).collect();
    assert_eq!(cameras, vec![0, 1]);

    // Tele sensitivity is reported in the wide camera's range
    let logical = result.metadata.unwrap().decode().unwrap();
    assert_eq!(logical.get(&Tag::SensorSensitivity), Some(&TagValue::Int(100)));

    h.assert_quiet().await;
    assert_eq!(h.session.in_flight(), 0);
    assert_eq!(h.store.outstanding(), 0);
}

#[tokio::test]
async fn test_single_active_pipeline_result() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(1, 1.0)).unwrap();
    assert_eq!(h.pipelines.pipelines_for(1), vec![0]);

    h.complete(0, 1);
    let result = h.next_result().await;
    assert_eq!(result.logical_pipeline_id, 0);
    assert_eq!(result.physical_metadata.len(), 1);
    assert_eq!(result.output_buffers.len(), 1);
}

#[tokio::test]
async fn test_flush_resolves_partially_received_frame() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(7, 2.0)).unwrap();
    h.complete(0, 7);
    h.assert_quiet().await;

    assert_eq!(h.session.flush().unwrap(), 1);
    assert_eq!(h.session.in_flight(), 0);

    let result = h.next_result().await;
    assert_eq!(result.frame_number, 7);
    assert!(result.metadata.is_ok());
    assert!(!result.is_complete());
    let missing = result
        .physical_metadata
        .iter()
        .find(|p| p.camera_id == 1)
        .unwrap();
    assert_eq!(missing.metadata, Err(LogicalErrorKind::Result));

    // Exactly one terminal delivery
    h.assert_quiet().await;
}

#[tokio::test]
async fn test_flush_without_logical_metadata_reports_request_error() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(7, 2.0)).unwrap();
    // Pipeline 1 is not the logical pipeline for a wide-master frame
    h.complete(1, 7);
    h.assert_quiet().await;

    assert_eq!(h.session.flush().unwrap(), 1);
    match h.next_event().await {
        LogicalEvent::Error { frame_number, kind } => {
            assert_eq!(frame_number, 7);
            assert_eq!(kind, LogicalErrorKind::Request);
        }
        other => panic!("expected error, got {:?}", other),
    }
    h.assert_quiet().await;
    assert_eq!(h.store.outstanding(), 0);
}

#[tokio::test]
async fn test_late_result_after_flush_is_dropped() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(3, 1.0)).unwrap();
    let request = h.pipelines.take(0, 3);
    h.session.flush().unwrap();
    assert!(matches!(h.next_event().await, LogicalEvent::Error { .. }));

    h.senders[0].send_result(PipelineResult {
        pipeline_id: 0,
        frame_number: 3,
        metadata: request.output_metadata,
        output_buffers: request.output_buffers,
        input_buffer: None,
    });
    h.assert_quiet().await;
    assert_eq!(h.session.stats().protocol_violations, 1);
}

#[tokio::test]
async fn test_logical_stream_object_round_trips() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(5, 1.0)).unwrap();
    {
        let requests = h.pipelines.requests.lock().unwrap();
        let stream = &requests[0].output_buffers[0].stream;
        assert!(stream.id >= INTERNAL_STREAM_BASE);
        assert!(!Arc::ptr_eq(stream, &h.preview));
    }

    h.complete(0, 5);
    let result = h.next_result().await;
    assert_eq!(result.output_buffers.len(), 1);
    assert!(Arc::ptr_eq(&result.output_buffers[0].stream, &h.preview));
    assert_eq!(result.output_buffers[0].buffer, BufferHandle(5));
}

#[tokio::test]
async fn test_physical_stream_routed_to_its_camera() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);
    let raw = Arc::new(Stream::new(2, 4000, 3000, StreamUsage::Snapshot).for_camera(1));

    let request = h
        .request(9, 1.0)
        .with_output(StreamBuffer::new(raw.clone(), BufferHandle(900)));
    h.session.submit_capture_request(request).unwrap();

    // Pipeline 1 is woken for the buffer even though zoom does not need it
    assert_eq!(h.pipelines.pipelines_for(9), vec![0, 1]);
    assert!(h.pipelines.activations.lock().unwrap().contains(&1));

    h.complete(1, 9);
    h.complete(0, 9);
    let result = h.next_result().await;
    assert_eq!(result.output_buffers.len(), 2);
    assert!(
        result
            .output_buffers
            .iter()
            .any(|b| Arc::ptr_eq(&b.stream, &raw))
    );
}

#[tokio::test]
async fn test_admission_errors() {
    let h = Harness::new(ErrorPolicy::BestEffort);

    let no_settings = LogicalRequest::new(1, None)
        .with_output(StreamBuffer::new(h.preview.clone(), BufferHandle(1)));
    assert_eq!(
        h.session.submit_capture_request(no_settings).unwrap_err(),
        MultiCamError::Admission(AdmissionError::MissingInitialSettings)
    );

    let no_buffers = LogicalRequest::new(1, Some(zoom_settings(1.0)));
    assert_eq!(
        h.session.submit_capture_request(no_buffers).unwrap_err(),
        MultiCamError::Admission(AdmissionError::NoOutputBuffers)
    );

    let mismatch = h.request(1, 1.0).with_physical_settings(1, None);
    assert_eq!(
        h.session.submit_capture_request(mismatch).unwrap_err(),
        MultiCamError::Admission(AdmissionError::SettingsNullityMismatch)
    );

    let unknown = h.request(1, 1.0).with_physical_settings(9, Some(TagMap::new()));
    assert_eq!(
        h.session.submit_capture_request(unknown).unwrap_err(),
        MultiCamError::Admission(AdmissionError::UnknownPhysicalCamera(9))
    );

    let stray = Arc::new(Stream::new(3, 640, 480, StreamUsage::Preview).for_camera(7));
    let unknown_stream = LogicalRequest::new(1, Some(zoom_settings(1.0)))
        .with_output(StreamBuffer::new(stray, BufferHandle(1)));
    assert_eq!(
        h.session.submit_capture_request(unknown_stream).unwrap_err(),
        MultiCamError::Admission(AdmissionError::UnknownStreamCamera(7))
    );

    // Rejected requests leave nothing behind
    assert_eq!(h.session.in_flight(), 0);
    assert!(h.pipelines.requests.lock().unwrap().is_empty());
    assert_eq!(h.store.outstanding(), 0);

    h.session.submit_capture_request(h.request(1, 1.0)).unwrap();
    assert_eq!(
        h.session.submit_capture_request(h.request(1, 1.0)).unwrap_err(),
        MultiCamError::Admission(AdmissionError::DuplicateFrame(1))
    );
}

#[tokio::test]
async fn test_repeated_settings_reuse_previous() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(1, 2.0)).unwrap();
    let repeat = LogicalRequest::new(2, None)
        .with_output(StreamBuffer::new(h.preview.clone(), BufferHandle(2)));
    let decision = h.session.submit_capture_request(repeat).unwrap();
    assert_eq!(decision.active_map, 0b11);

    let request = h.pipelines.take(0, 2);
    assert_eq!(
        request.input_metadata.get(Tag::ZoomRatio),
        Some(TagValue::Float(2.0))
    );
    drop(request);

    h.session.flush().unwrap();
    for _ in 0..2 {
        assert!(h.next_event().await.is_terminal());
    }
}

#[tokio::test]
async fn test_vendor_tags_injected_per_pipeline() {
    let h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(1, 2.0)).unwrap();
    h.session.submit_capture_request(h.request(2, 2.0)).unwrap();

    let wide = h.pipelines.take(0, 1);
    let tele = h.pipelines.take(1, 1);
    assert_eq!(wide.input_metadata.get(Tag::MasterCamera), Some(TagValue::Bool(true)));
    assert_eq!(tele.input_metadata.get(Tag::MasterCamera), Some(TagValue::Bool(false)));
    assert!(wide.input_metadata.get(Tag::LowPowerMode).is_some());
    assert!(wide.input_metadata.get(Tag::SyncMode).is_some());
    assert_eq!(wide.private.stream_index, 0);
    assert_eq!(tele.private.stream_index, 1);

    match tele.input_metadata.get(Tag::CameraIdentity) {
        Some(TagValue::Identity(identity)) => {
            assert_eq!(identity.current_camera_id, 1);
            assert_eq!(identity.logical_camera_id, 0);
            assert_eq!(identity.master_camera_id, 0);
        }
        other => panic!("expected identity, got {:?}", other),
    }

    // Identity is only sent with a pipeline's first request
    let second = h.pipelines.take(1, 2);
    assert!(second.input_metadata.get(Tag::CameraIdentity).is_none());
}

#[tokio::test]
async fn test_best_effort_error_still_delivers_result() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(11, 2.0)).unwrap();
    assert!(h.senders[1].send_notify(11, NotifyMessage::Error(LogicalErrorKind::Result)));
    drop(h.pipelines.take(1, 11));
    h.complete(0, 11);

    let result = h.next_result().await;
    assert!(result.metadata.is_ok());
    let tele = result
        .physical_metadata
        .iter()
        .find(|p| p.camera_id == 1)
        .unwrap();
    assert_eq!(tele.metadata, Err(LogicalErrorKind::Result));
}

#[tokio::test]
async fn test_fatal_error_drops_frame() {
    let mut h = Harness::new(ErrorPolicy::Fatal);

    h.session.submit_capture_request(h.request(12, 2.0)).unwrap();
    assert!(h.senders[1].send_notify(12, NotifyMessage::Error(LogicalErrorKind::Buffer)));

    match h.next_event().await {
        LogicalEvent::Error { frame_number, kind } => {
            assert_eq!(frame_number, 12);
            assert_eq!(kind, LogicalErrorKind::Request);
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(h.session.in_flight(), 0);

    // The surviving pipeline's late result is dropped
    h.complete(0, 12);
    h.assert_quiet().await;
}

#[tokio::test]
async fn test_shutter_forwarded_once_from_logical_pipeline() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(4, 2.0)).unwrap();
    let shutter = NotifyMessage::Shutter { timestamp_ns: 1234 };
    assert!(h.senders[1].send_notify(4, shutter));
    assert!(h.senders[0].send_notify(4, shutter));
    assert!(h.senders[0].send_notify(4, shutter));

    match h.next_event().await {
        LogicalEvent::Shutter {
            frame_number,
            timestamp_ns,
        } => {
            assert_eq!(frame_number, 4);
            assert_eq!(timestamp_ns, 1234);
        }
        other => panic!("expected shutter, got {:?}", other),
    }
    h.assert_quiet().await;
    assert_eq!(h.session.stats().shutters_forwarded, 1);
}

#[tokio::test]
async fn test_pool_exhaustion_rejects_without_leaking() {
    let h = Harness::with_pool(
        ErrorPolicy::BestEffort,
        MetadataPool::new(2, Duration::from_millis(20)),
    );

    // Two pipelines need four entries
    let err = h.session.submit_capture_request(h.request(1, 2.0)).unwrap_err();
    assert!(matches!(
        err,
        MultiCamError::Resource(ResourceError::MetadataPoolExhausted { frame_number: 1, .. })
    ));
    assert_eq!(h.session.in_flight(), 0);
    assert_eq!(h.store.outstanding(), 0);
    assert!(h.pipelines.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_failure_discards_record() {
    let h = Harness::new(ErrorPolicy::BestEffort);
    h.pipelines.fail_submit.store(true, Ordering::SeqCst);

    let err = h.session.submit_capture_request(h.request(1, 1.0)).unwrap_err();
    assert!(matches!(err, MultiCamError::Pipeline(PipelineError::SubmitFailed(_))));
    assert_eq!(h.session.in_flight(), 0);
    assert_eq!(h.store.outstanding(), 0);

    // The frame number can be reused once the failure is reported
    h.pipelines.fail_submit.store(false, Ordering::SeqCst);
    h.session.submit_capture_request(h.request(1, 1.0)).unwrap();
}

#[tokio::test]
async fn test_closed_session_refuses_requests() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    h.session.submit_capture_request(h.request(1, 1.0)).unwrap();
    assert_eq!(h.session.close().unwrap(), 1);
    assert!(h.session.is_closed());
    assert!(h.next_event().await.is_terminal());

    assert_eq!(
        h.session.submit_capture_request(h.request(2, 1.0)).unwrap_err(),
        MultiCamError::Admission(AdmissionError::SessionClosed)
    );
}

#[tokio::test]
async fn test_sessions_are_independent() {
    let mut a = Harness::new(ErrorPolicy::BestEffort);
    let mut b = Harness::new(ErrorPolicy::BestEffort);
    assert_ne!(a.session.id(), b.session.id());

    a.session.submit_capture_request(a.request(1, 1.0)).unwrap();
    b.session.submit_capture_request(b.request(1, 1.0)).unwrap();

    a.complete(0, 1);
    assert_eq!(a.next_result().await.frame_number, 1);
    b.assert_quiet().await;
    assert_eq!(b.session.in_flight(), 1);
}

#[tokio::test]
async fn test_virtual_pipelines_end_to_end() {
    let mut h = VirtualHarness::new();

    let frames = 12u64;
    for frame in 0..frames {
        let zoom = 1.0 + frame as f32 * 0.25;
        h.session.submit_capture_request(h.request(frame, zoom)).unwrap();
    }

    let mut terminal: HashMap<FrameNumber, usize> = HashMap::new();
    let mut shutters: HashSet<FrameNumber> = HashSet::new();
    let mut last_terminal = None;
    while terminal.len() < frames as usize {
        let event = h.next_event().await;
        match &event {
            LogicalEvent::Shutter { frame_number, .. } => {
                assert!(shutters.insert(*frame_number), "duplicate shutter");
            }
            LogicalEvent::Result(result) => {
                assert!(shutters.contains(&result.frame_number), "result before shutter");
                assert!(Arc::ptr_eq(&result.output_buffers[0].stream, &h.preview));
            }
            _ => {}
        }
        if event.is_terminal() {
            assert!(last_terminal < Some(event.frame_number()), "out of order delivery");
            last_terminal = Some(event.frame_number());
            *terminal.entry(event.frame_number()).or_default() += 1;
        }
    }
    assert!(terminal.values().all(|&count| count == 1));

    // The scene reported by the pipelines feeds later decisions
    assert_eq!(h.session.scene().lux_index, 50.0);

    h.shutdown();
}

#[tokio::test]
async fn test_results_delivered_in_frame_order() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);

    // Leaving the transition band drops the tele pipeline for frame 2
    h.session.submit_capture_request(h.request(1, 2.0)).unwrap();
    h.session.submit_capture_request(h.request(2, 1.0)).unwrap();
    assert_eq!(h.pipelines.pipelines_for(1), vec![0, 1]);
    assert_eq!(h.pipelines.pipelines_for(2), vec![0]);

    h.complete(0, 1);
    h.complete(0, 2);
    h.assert_quiet().await;
    assert_eq!(h.session.in_flight(), 2);

    h.complete(1, 1);
    assert_eq!(h.next_result().await.frame_number, 1);
    assert_eq!(h.next_result().await.frame_number, 2);
    h.assert_quiet().await;
    assert_eq!(h.session.in_flight(), 0);
}

#[tokio::test]
async fn test_submit_waiting_on_close_is_refused() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);
    h.session.submit_capture_request(h.request(1, 1.0)).unwrap();

    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    *h.pipelines.flush_gate.lock().unwrap() = Some((started_tx, release_rx));

    let late = h.request(2, 1.0);
    let session = &h.session;
    std::thread::scope(|s| {
        let closer = s.spawn(|| session.close());
        // close() now holds the dispatcher while flushing
        started_rx.recv().unwrap();
        let submitter = s.spawn(move || session.submit_capture_request(late));
        std::thread::sleep(QUIET_PERIOD);
        release_tx.send(()).unwrap();

        assert_eq!(closer.join().unwrap().unwrap(), 1);
        assert_eq!(
            submitter.join().unwrap().unwrap_err(),
            MultiCamError::Admission(AdmissionError::SessionClosed)
        );
    });

    assert_eq!(h.next_event().await.frame_number(), 1);
    h.assert_quiet().await;
    assert_eq!(h.session.in_flight(), 0);
    assert!(h.pipelines.requests.lock().unwrap().is_empty());
    assert_eq!(h.store.outstanding(), 0);
}

#[tokio::test]
async fn test_rejected_request_keeps_master() {
    let h = Harness::new(ErrorPolicy::BestEffort);
    assert_eq!(
        h.session.submit_capture_request(h.request(1, 1.0)).unwrap().master_camera_id,
        0
    );

    h.pipelines.fail_submit.store(true, Ordering::SeqCst);
    assert!(h.session.submit_capture_request(h.request(2, 3.5)).is_err());
    assert_eq!(h.session.last_decision().master_camera_id, 0);

    // Still inside the wide camera's hysteresis band
    h.pipelines.fail_submit.store(false, Ordering::SeqCst);
    let decision = h.session.submit_capture_request(h.request(3, 2.05)).unwrap();
    assert_eq!(decision.master_camera_id, 0);
}

#[tokio::test]
async fn test_physical_input_buffer_routed_to_its_camera() {
    let mut h = Harness::new(ErrorPolicy::BestEffort);
    let reprocess = Arc::new(Stream::new(4, 4000, 3000, StreamUsage::Snapshot).for_camera(1));

    let request = h
        .request(6, 1.0)
        .with_input(StreamBuffer::new(reprocess.clone(), BufferHandle(600)));
    h.session.submit_capture_request(request).unwrap();
    assert_eq!(h.pipelines.pipelines_for(6), vec![0, 1]);

    let tele = h.pipelines.take(1, 6);
    let input = tele.input_buffer.as_ref().unwrap();
    assert!(Arc::ptr_eq(&input.stream, &reprocess));
    let wide = h.pipelines.take(0, 6);
    assert!(wide.input_buffer.is_none());

    for request in [wide, tele] {
        let pipeline_id = request.pipeline_id;
        assert!(h.senders[pipeline_id].send_result(PipelineResult {
            pipeline_id,
            frame_number: 6,
            metadata: request.output_metadata,
            output_buffers: request.output_buffers,
            input_buffer: request.input_buffer,
        }));
    }
    let result = h.next_result().await;
    assert!(Arc::ptr_eq(&result.input_buffer.unwrap().stream, &reprocess));
}

#[tokio::test]
async fn test_flush_resolves_frame_stuck_on_stalled_pipeline() {
    let mut h = VirtualHarness::new();
    h.pipelines.set_stalled(1, true);

    h.session.submit_capture_request(h.request(0, 2.0)).unwrap();
    h.wait_processed(1).await;
    tokio::time::sleep(QUIET_PERIOD).await;
    assert_eq!(h.session.in_flight(), 1);

    assert_eq!(h.session.flush().unwrap(), 1);
    match h.next_terminal().await {
        LogicalEvent::Result(result) => {
            assert_eq!(result.frame_number, 0);
            assert!(result.metadata.is_ok());
            let tele = result
                .physical_metadata
                .iter()
                .find(|p| p.camera_id == 1)
                .unwrap();
            assert_eq!(tele.metadata, Err(LogicalErrorKind::Result));
        }
        other => panic!("expected result, got {:?}", other),
    }
    let quiet = tokio::time::timeout(QUIET_PERIOD, h.events.recv()).await;
    assert!(quiet.is_err(), "unexpected event: {:?}", quiet);

    // Once unstalled the pipeline serves new frames again
    h.pipelines.set_stalled(1, false);
    h.session.submit_capture_request(h.request(1, 2.0)).unwrap();
    match h.next_terminal().await {
        LogicalEvent::Result(result) => {
            assert_eq!(result.frame_number, 1);
            assert!(result.is_complete());
        }
        other => panic!("expected result, got {:?}", other),
    }

    h.shutdown();
}

#[tokio::test]
async fn test_low_light_result_disables_fusion_for_next_request() {
    let mut h = VirtualHarness::new();

    // No scene has been reported before the first result
    assert!(!h.session.submit_capture_request(h.request(0, 2.0)).unwrap().snapshot_fusion_enabled);
    assert_eq!(h.next_terminal().await.frame_number(), 0);

    h.pipelines.set_scene(SceneState {
        lux_index: 0.5,
        ..VirtualPipelineConfig::default().scene
    });
    // Decided from the bright scene of frame 0
    assert!(h.session.submit_capture_request(h.request(1, 2.0)).unwrap().snapshot_fusion_enabled);
    assert_eq!(h.next_terminal().await.frame_number(), 1);
    assert_eq!(h.session.scene().lux_index, 0.5);

    let decision = h.session.submit_capture_request(h.request(2, 2.0)).unwrap();
    assert!(!decision.snapshot_fusion_enabled);
    // Both cameras still stream inside the transition band
    assert_eq!(decision.active_map, 0b11);
    assert_eq!(h.next_terminal().await.frame_number(), 2);

    h.shutdown();
}
