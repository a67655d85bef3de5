//! # Color Tracker Operation
//!
//! Perception operation that turns per-frame color-blob detections into
//! confirmed geodetic target reports.
//!
//! Frame capture and color segmentation run in an external vision process,
//! which writes one JSON line per frame:
//!
//! ```json
//! {"width": 640, "height": 480, "detections": [[312.0, 198.5], [80.0, 402.0]]}
//! ```
//!
//! The tracker reads those lines on a blocking worker, samples the vehicle
//! pose for every frame, and feeds a [`TargetAcquisitionEngine`]. The source
//! is followed like `tail -f`: reaching its end only pauses the worker.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{parse_params, Operation, OperationContext};
use crate::error::{GatewayError, Result};
use crate::link::FlightLink;
use crate::tracking::{CameraGeometry, FrameSize, PixelPoint, TargetAcquisitionEngine, TrackerConfig};

/// Registry kind
pub const KIND: &str = "color_tracker";

/// Pause while the source has no new frame
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Parameters accepted in `request_start_operation`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ColorTrackerParams {
    /// Detection stream written by the vision process
    #[serde(default = "default_detections_source")]
    pub detections_source: PathBuf,

    #[serde(default = "default_fov")]
    pub camera_fov_h: f64,

    #[serde(default = "default_fov")]
    pub camera_fov_v: f64,

    #[serde(default = "default_fixed_pitch")]
    pub camera_fixed_pitch: f64,

    #[serde(default = "default_confirmation_frames")]
    pub confirmation_frames: u32,

    #[serde(default = "default_pixel_threshold")]
    pub pixel_threshold: f64,

    #[serde(default = "default_unseen_threshold")]
    pub unseen_threshold: u32,

    /// Pause between frames; 0 reads as fast as the source delivers
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

fn default_detections_source() -> PathBuf {
    PathBuf::from("/run/telemetry-gateway/detections.jsonl")
}

fn default_fov() -> f64 {
    58.5
}

fn default_fixed_pitch() -> f64 {
    -90.0
}

fn default_confirmation_frames() -> u32 {
    20
}

fn default_pixel_threshold() -> f64 {
    100.0
}

fn default_unseen_threshold() -> u32 {
    50
}

fn default_frame_interval_ms() -> u64 {
    20
}

impl ColorTrackerParams {
    fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            confirmation_frames: self.confirmation_frames,
            pixel_threshold: self.pixel_threshold,
            unseen_threshold: self.unseen_threshold,
            camera: CameraGeometry {
                fov_h: self.camera_fov_h,
                fov_v: self.camera_fov_v,
                fixed_pitch: self.camera_fixed_pitch,
            },
        }
    }

    fn validate(&self) -> Result<()> {
        if self.confirmation_frames == 0 {
            return Err(invalid("confirmation_frames must be at least 1"));
        }
        if self.unseen_threshold == 0 {
            return Err(invalid("unseen_threshold must be at least 1"));
        }
        if !(self.pixel_threshold > 0.0) {
            return Err(invalid("pixel_threshold must be positive"));
        }
        if !(self.camera_fov_h > 0.0 && self.camera_fov_h < 180.0)
            || !(self.camera_fov_v > 0.0 && self.camera_fov_v < 180.0)
        {
            return Err(invalid("camera field of view must be within (0, 180) degrees"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> GatewayError {
    GatewayError::OperationStartFailure(format!("Invalid {} parameters: {}", KIND, msg))
}

/// Detections of one frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectionFrame {
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub detections: Vec<PixelPoint>,
}

impl DetectionFrame {
    pub fn size(&self) -> FrameSize {
        FrameSize { width: self.width, height: self.height }
    }
}

/// Blocking producer of detection frames.
pub trait DetectionSource: Send {
    /// Next frame, or `Ok(None)` if no complete frame is available yet.
    fn next_frame(&mut self) -> Result<Option<DetectionFrame>>;
}

/// Newline-delimited JSON frames read from a file or FIFO.
///
/// Blank and malformed lines are skipped. A trailing line without its
/// newline is kept until the writer completes it.
#[derive(Debug)]
pub struct JsonLinesSource<R> {
    reader: R,
    line: String,
}

impl JsonLinesSource<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line: String::new() }
    }
}

impl<R: BufRead + Send> DetectionSource for JsonLinesSource<R> {
    fn next_frame(&mut self) -> Result<Option<DetectionFrame>> {
        loop {
            let read = self.reader.read_line(&mut self.line)?;
            if read == 0 || !self.line.ends_with('\n') {
                return Ok(None);
            }

            let line = std::mem::take(&mut self.line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_str(line) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!("Skipping malformed detection frame: {}", e),
            }
        }
    }
}

/// Running color tracker instance.
pub struct ColorTracker {
    params: ColorTrackerParams,
    context: OperationContext,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ColorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColorTracker")
            .field("params", &self.params)
            .field("running", &self.worker.is_some())
            .finish_non_exhaustive()
    }
}

/// Registry factory
pub fn create(context: OperationContext) -> Result<Box<dyn Operation>> {
    Ok(Box::new(ColorTracker::new(context)?))
}

impl ColorTracker {
    /// # Errors
    ///
    /// Returns [`GatewayError::OperationStartFailure`] for invalid parameters.
    pub fn new(context: OperationContext) -> Result<Self> {
        let params: ColorTrackerParams = parse_params(&context.params)?;
        params.validate()?;
        Ok(Self {
            params,
            context,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    pub fn params(&self) -> &ColorTrackerParams {
        &self.params
    }
}

#[async_trait]
impl Operation for ColorTracker {
    async fn start(&mut self) -> Result<bool> {
        if self.worker.is_some() {
            warn!("Color tracker already running");
            return Ok(false);
        }

        // Opening a FIFO blocks until its writer appears, so only existence
        // is checked here and the worker opens it.
        if let Err(e) = std::fs::metadata(&self.params.detections_source) {
            error!(
                "Cannot open detection source {}: {}",
                self.params.detections_source.display(),
                e
            );
            return Ok(false);
        }

        let engine = TargetAcquisitionEngine::new(
            self.params.tracker_config(),
            KIND,
            self.context.sink.clone(),
        );
        let link = Arc::clone(&self.context.link);
        let interval = Duration::from_millis(self.params.frame_interval_ms);
        let path = self.params.detections_source.clone();

        self.stop.store(false, Ordering::Release);
        let stop = Arc::clone(&self.stop);
        self.worker = Some(tokio::task::spawn_blocking(move || {
            let source = match JsonLinesSource::open(&path) {
                Ok(source) => source,
                Err(e) => {
                    error!("Cannot open detection source {}: {}", path.display(), e);
                    return;
                }
            };
            run_tracker(Box::new(source), engine, link, stop, interval)
        }));

        info!(
            "Color tracker reading detections from {}",
            self.params.detections_source.display()
        );
        Ok(true)
    }

    async fn stop(&mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker
                .await
                .map_err(|e| GatewayError::OperationFault(format!("Color tracker worker failed: {}", e)))?;
        }
        Ok(())
    }
}

/// Worker body. Returns when stopped or on a read failure; the source is
/// dropped on every exit path.
fn run_tracker(
    mut source: Box<dyn DetectionSource>,
    mut engine: TargetAcquisitionEngine,
    link: Arc<dyn FlightLink>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut frames: u64 = 0;

    while !stop.load(Ordering::Acquire) {
        match source.next_frame() {
            Ok(Some(frame)) => {
                let vehicle = link.telemetry_snapshot();
                engine.update(&frame.detections, &vehicle, frame.size());
                frames += 1;
            }
            Ok(None) => {
                std::thread::sleep(IDLE_POLL);
                continue;
            }
            Err(e) => {
                error!("Detection source read failed: {}", e);
                break;
            }
        }

        if !interval.is_zero() {
            std::thread::sleep(interval);
        }
    }

    debug!("Color tracker processed {} frames", frames);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::{MockFlightLink, VehicleState};
    use crate::operation::{
        OperationParams, OperationRegistry, OperationResult, OperationSupervisor, OutputSink,
    };
    use serde_json::json;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn params(value: serde_json::Value) -> OperationParams {
        value.as_object().cloned().unwrap_or_default()
    }

    fn context(params: OperationParams) -> (OperationContext, tokio::sync::mpsc::UnboundedReceiver<OperationResult>) {
        let mut link = MockFlightLink::new();
        link.expect_telemetry_snapshot().returning(|| VehicleState {
            lat: 41.0,
            lon: 29.0,
            alt: 50.0,
            yaw: 0.0,
            pitch: 0.0,
        });
        let (sink, rx) = OutputSink::channel();
        (OperationContext { link: Arc::new(link), sink, params }, rx)
    }

    fn frames_file(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_param_defaults() {
        let params: ColorTrackerParams = parse_params(&OperationParams::new()).unwrap();
        assert_eq!(params.camera_fov_h, 58.5);
        assert_eq!(params.camera_fov_v, 58.5);
        assert_eq!(params.camera_fixed_pitch, -90.0);
        assert_eq!(params.confirmation_frames, 20);
        assert_eq!(params.pixel_threshold, 100.0);
        assert_eq!(params.unseen_threshold, 50);
        assert_eq!(params.frame_interval_ms, 20);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let (ctx, _rx) = context(params(json!({"confirmation_frames": 0})));
        assert!(matches!(
            ColorTracker::new(ctx),
            Err(GatewayError::OperationStartFailure(_))
        ));

        let (ctx, _rx) = context(params(json!({"pixel_threshold": "far"})));
        assert!(matches!(
            ColorTracker::new(ctx),
            Err(GatewayError::OperationStartFailure(_))
        ));
    }

    #[test]
    fn test_json_lines_source_skips_noise() {
        let input = "\n{\"width\":640,\"height\":480,\"detections\":[[1,2]]}\nnot json\n{\"width\":320,\"height\":240}\n";
        let mut source = JsonLinesSource::new(Cursor::new(input));

        let first = source.next_frame().unwrap().unwrap();
        assert_eq!(first.size(), FrameSize { width: 640, height: 480 });
        assert_eq!(first.detections, vec![PixelPoint { x: 1.0, y: 2.0 }]);

        let second = source.next_frame().unwrap().unwrap();
        assert!(second.detections.is_empty());

        assert!(source.next_frame().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_source_refuses_start() {
        let (ctx, _rx) = context(params(json!({
            "detections_source": "/nonexistent/detections.jsonl"
        })));
        let mut tracker = ColorTracker::new(ctx).unwrap();
        assert!(!tracker.start().await.unwrap());
        tracker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_confirmed_target_reported_once() {
        let frame = r#"{"width":640,"height":480,"detections":[[320,240]]}"#;
        let file = frames_file(&[frame; 6]);

        let (ctx, mut rx) = context(params(json!({
            "detections_source": file.path(),
            "confirmation_frames": 3,
            "frame_interval_ms": 0
        })));
        let mut tracker = ColorTracker::new(ctx).unwrap();
        assert!(tracker.start().await.unwrap());

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no report within timeout")
            .expect("sink closed");
        match result {
            OperationResult::TargetDetected { operation_type, lat, lon, .. } => {
                assert_eq!(operation_type, KIND);
                assert!((lat - 41.0).abs() < 1e-9);
                assert!((lon - 29.0).abs() < 1e-9);
            }
            other => panic!("Expected target report, got: {:?}", other),
        }

        tracker.stop().await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let mut file = NamedTempFile::new().unwrap();
        let mut source = JsonLinesSource::open(file.path()).unwrap();
        assert!(source.next_frame().unwrap().is_none());

        write!(file, "{{\"width\":640,").unwrap();
        file.flush().unwrap();
        assert!(source.next_frame().unwrap().is_none());

        writeln!(file, "\"height\":480,\"detections\":[[5,6]]}}").unwrap();
        file.flush().unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.detections, vec![PixelPoint { x: 5.0, y: 6.0 }]);
    }

    #[tokio::test]
    async fn test_frames_appended_after_start_are_tracked() {
        let mut file = frames_file(&[]);
        let (ctx, mut rx) = context(params(json!({
            "detections_source": file.path(),
            "confirmation_frames": 3,
            "frame_interval_ms": 0
        })));
        let mut tracker = ColorTracker::new(ctx).unwrap();
        assert!(tracker.start().await.unwrap());

        // Let the worker reach the end of the empty source first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        for _ in 0..5 {
            writeln!(file, r#"{{"width":640,"height":480,"detections":[[320,240]]}}"#).unwrap();
        }
        file.flush().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("appended frames were not tracked")
            .expect("sink closed");
        assert!(matches!(result, OperationResult::TargetDetected { .. }));

        tracker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_fifo_without_writer_does_not_block_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("detections.fifo");
        let status = std::process::Command::new("mkfifo").arg(&fifo).status().unwrap();
        assert!(status.success());

        let mut link = MockFlightLink::new();
        link.expect_is_ready().return_const(true);
        link.expect_telemetry_snapshot().returning(VehicleState::default);
        let mut registry = OperationRegistry::new();
        registry.register(KIND, create);
        let (sink, _rx) = OutputSink::channel();
        let supervisor =
            OperationSupervisor::new(registry, Arc::new(link), sink, Duration::from_millis(200));

        let started = tokio::time::timeout(
            Duration::from_secs(3),
            supervisor.start(KIND, params(json!({"detections_source": fifo})), Some("cam".into())),
        )
        .await
        .expect("start blocked on the FIFO");
        assert_eq!(started.unwrap(), "cam");

        let stopped = tokio::time::timeout(Duration::from_secs(3), supervisor.shutdown_all())
            .await
            .expect("shutdown blocked on the FIFO");
        assert_eq!(stopped, 1);

        // Release the abandoned worker so the runtime can shut down.
        let writer = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().write(true).open(&fifo).map(drop)
        });
        tokio::time::timeout(Duration::from_secs(3), writer)
            .await
            .expect("worker never opened the FIFO")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_start_refused() {
        let file = frames_file(&[]);
        let (ctx, _rx) = context(params(json!({
            "detections_source": file.path(),
            "frame_interval_ms": 0
        })));
        let mut tracker = ColorTracker::new(ctx).unwrap();
        assert!(tracker.start().await.unwrap());
        assert!(!tracker.start().await.unwrap());
        tracker.stop().await.unwrap();
    }
}
