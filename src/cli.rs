// SPDX-License-Identifier: GPL-3.0-only

//! Command-line commands for inspecting zones and simulating a logical camera

use chrono::Local;
use multicam::Config;
use multicam::backends::metadata::{Tag, TagMap, TagValue};
use multicam::backends::pipeline::{
    BufferHandle, CompletionRouter, PipelineSession, Stream, StreamBuffer, StreamUsage,
    VirtualPipelineConfig, VirtualPipelineSession,
};
use multicam::multicam::{
    LogicalCameraSession, LogicalEvent, LogicalRequest, SceneState, ZoneTable,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Stream id of the simulated preview output
const PREVIEW_STREAM_ID: u32 = 0;

/// Options for the zoom sweep
pub struct SimulateOptions {
    pub frames: u64,
    pub zoom_from: f32,
    pub zoom_to: f32,
    pub lux: f32,
    pub interval_ms: u64,
}

/// Load an explicit config file, or the default one when present
pub fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(Config::load(path)?),
        None => Ok(Config::load_or_default()),
    }
}

/// Print the zoom zones derived from the configured cameras
pub fn print_zones(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let zones = ZoneTable::compute(&config.cameras, &config.policy)?;
    let limits = zones.zoom_limits();

    println!(
        "Controller: {} ({} cameras)",
        config.policy.kind.display_name(),
        config.cameras.len()
    );
    println!("Zoom range: {:.2}x - {:.2}x", limits.min, limits.max);
    println!();

    println!("Cameras (widest first):");
    for zone in &zones.cameras {
        let primary = if zone.pipeline_id == zones.primary_pipeline {
            " (primary)"
        } else {
            ""
        };
        println!(
            "  [{}] camera {}: {:.2}x - {:.2}x, fov ratio {:.3}{}",
            zone.pipeline_id,
            zone.camera_id,
            zone.zoom.min,
            zone.zoom.max,
            zone.adjusted_fov_ratio,
            primary
        );
    }

    if zones.transitions.is_empty() {
        return Ok(());
    }

    println!();
    println!("Transitions:");
    for transition in &zones.transitions {
        println!(
            "  pipelines {} <-> {} at {:.2}x",
            transition.left_pipeline, transition.right_pipeline, transition.transition_ratio
        );
        println!(
            "      both streaming: {:.2}x - {:.2}x",
            transition.low, transition.high
        );
        println!(
            "      fusion:         {:.2}x - {:.2}x",
            transition.fusion_low, transition.fusion_high
        );
        println!("      hysteresis:     {:.2}", transition.hysteresis);
        if !transition.smooth_transition_enabled {
            println!("      smooth transition disabled");
        }
    }

    Ok(())
}

/// Sweep zoom across the configured cameras using software pipelines
pub fn simulate(
    config: &Config,
    options: SimulateOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    if options.frames == 0 {
        return Err("Frame count must be at least 1".into());
    }

    let (router, senders) = CompletionRouter::channels(config.cameras.len());
    let virtual_config = VirtualPipelineConfig {
        scene: SceneState {
            lux_index: options.lux,
            ..VirtualPipelineConfig::default().scene
        },
        ..VirtualPipelineConfig::default()
    };
    let pipelines = Arc::new(VirtualPipelineSession::new(virtual_config, senders));
    let store = Arc::new(config.metadata_pool());

    let (session, mut events) = LogicalCameraSession::new(
        config.session_config(),
        pipelines.clone() as Arc<dyn PipelineSession>,
        store.clone(),
        router,
    )?;

    let preview = Arc::new(Stream::new(PREVIEW_STREAM_ID, 1920, 1080, StreamUsage::Preview));
    session.configure_streams(std::slice::from_ref(&preview))?;

    println!("Session {}", session.id());
    println!(
        "Sweeping zoom {:.2}x -> {:.2}x over {} frames (press Ctrl+C to stop early)",
        options.zoom_from, options.zoom_to, options.frames
    );
    println!();

    // Set up Ctrl+C handler
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    let rt = tokio::runtime::Runtime::new()?;
    let receiver = rt.spawn(async move {
        let mut tally = EventTally::default();
        while let Some(event) = events.recv().await {
            tally.record(&event);
        }
        tally
    });

    let mut master = None;
    let mut submitted = 0u64;
    for frame_number in 0..options.frames {
        if stop_flag.load(Ordering::SeqCst) {
            println!();
            println!("Stopping early...");
            break;
        }

        let zoom = sweep_zoom(&options, frame_number);
        // Zoom changes every frame, so settings are always sent
        let mut settings = TagMap::new();
        settings.insert(Tag::ZoomRatio, TagValue::Float(zoom));
        let request = LogicalRequest::new(frame_number, Some(settings))
            .with_output(StreamBuffer::new(preview.clone(), BufferHandle(frame_number)));

        match session.submit_capture_request(request) {
            Ok(decision) => {
                submitted += 1;
                if master != Some(decision.master_camera_id) {
                    println!(
                        "[{}] frame {:>4} zoom {:.2}x: master camera {} (active map {:#06b}, fusion {})",
                        Local::now().format("%H:%M:%S%.3f"),
                        frame_number,
                        zoom,
                        decision.master_camera_id,
                        decision.active_map,
                        if decision.snapshot_fusion_enabled { "on" } else { "off" }
                    );
                    master = Some(decision.master_camera_id);
                }
            }
            Err(e) => {
                eprintln!("Frame {} rejected: {}", frame_number, e);
            }
        }

        std::thread::sleep(Duration::from_millis(options.interval_ms));
    }

    let flushed = session.close()?;
    let stats = session.stats();
    let processed = pipelines.processed();
    drop(session);
    pipelines.shutdown();

    let tally = rt.block_on(receiver)?;

    println!();
    println!("Submitted:        {}", submitted);
    println!("Results:          {} ({} incomplete)", tally.results, tally.incomplete);
    println!("Errors:           {}", tally.errors);
    println!("Shutters:         {}", tally.shutters);
    println!("Partials:         {}", tally.partials);
    println!("Flushed on close: {}", flushed);
    println!("Pipeline requests processed: {}", processed);
    println!("Protocol violations: {}", stats.protocol_violations);
    println!("Metadata entries outstanding: {}", store.outstanding());

    Ok(())
}

/// Print the effective configuration, optionally writing it to disk
pub fn show_config(
    config: &Config,
    path: Option<PathBuf>,
    write: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(config)?);

    if write {
        let Some(path) = path.or_else(Config::default_path) else {
            return Err("No config directory available, pass --config".into());
        };
        config.save(&path)?;
        println!();
        println!("Configuration written: {}", path.display());
    }

    Ok(())
}

/// Linear zoom ramp from `zoom_from` at frame 0 to `zoom_to` at the last frame
fn sweep_zoom(options: &SimulateOptions, frame_number: u64) -> f32 {
    if options.frames <= 1 {
        return options.zoom_from;
    }
    let t = frame_number as f32 / (options.frames - 1) as f32;
    options.zoom_from + (options.zoom_to - options.zoom_from) * t
}

#[derive(Debug, Default)]
struct EventTally {
    results: u64,
    incomplete: u64,
    errors: u64,
    shutters: u64,
    partials: u64,
}

impl EventTally {
    fn record(&mut self, event: &LogicalEvent) {
        match event {
            LogicalEvent::Shutter { .. } => self.shutters += 1,
            LogicalEvent::Partial(_) => self.partials += 1,
            LogicalEvent::Result(result) => {
                self.results += 1;
                if !result.is_complete() {
                    self.incomplete += 1;
                }
            }
            LogicalEvent::Error { frame_number, kind } => {
                self.errors += 1;
                eprintln!("Frame {} failed: {}", frame_number, kind);
            }
        }
    }
}
