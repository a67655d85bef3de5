//! # Target Acquisition Engine
//!
//! Greedy nearest-neighbor, single-hypothesis tracker that debounces noisy
//! per-frame detections before reporting them.
//!
//! Per update cycle:
//!
//! 1. Each detection is projected to a geodetic fix; detections without one
//!    are dropped before association.
//! 2. Each remaining detection is associated with the nearest tracked target
//!    within `pixel_threshold`, or starts a new target at confirmation 1.
//! 3. Unmatched targets age by one frame.
//! 4. Targets whose confirmation count reached `confirmation_frames` are
//!    reported once.
//! 5. Targets unseen for `unseen_threshold` frames are dropped, silently.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::geodetic::{project, CameraGeometry, FrameSize, GeoFix, PixelPoint};
use crate::link::VehicleState;
use crate::operation::{timestamp_now, OperationResult, OutputSink};

/// Tracker tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Consecutive sightings required before a target is reported
    pub confirmation_frames: u32,
    /// Maximum pixel distance for associating a detection with a target
    pub pixel_threshold: f64,
    /// Missed frames after which a target is dropped
    pub unseen_threshold: u32,
    pub camera: CameraGeometry,
}

/// One physically tracked object.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    id: Uuid,
    pixel: PixelPoint,
    fix: GeoFix,
    confirmations: u32,
    frames_unseen: u32,
    reported: bool,
}

impl Target {
    fn new(pixel: PixelPoint, fix: GeoFix) -> Self {
        Self {
            id: Uuid::new_v4(),
            pixel,
            fix,
            confirmations: 1,
            frames_unseen: 0,
            reported: false,
        }
    }

    /// Refresh position and advance confirmation, capped at `max_confirmations`.
    ///
    /// The fix keeps updating after the target has been reported.
    fn observe(&mut self, pixel: PixelPoint, fix: GeoFix, max_confirmations: u32) {
        self.pixel = pixel;
        self.fix = fix;
        self.frames_unseen = 0;
        if self.confirmations < max_confirmations {
            self.confirmations += 1;
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pixel(&self) -> PixelPoint {
        self.pixel
    }

    pub fn fix(&self) -> GeoFix {
        self.fix
    }

    pub fn confirmations(&self) -> u32 {
        self.confirmations
    }

    pub fn frames_unseen(&self) -> u32 {
        self.frames_unseen
    }

    pub fn is_reported(&self) -> bool {
        self.reported
    }
}

/// Active target set of one running perception operation.
#[derive(Debug)]
pub struct TargetAcquisitionEngine {
    config: TrackerConfig,
    operation_type: String,
    sink: OutputSink,
    // Creation order; association ties go to the oldest target.
    targets: Vec<Target>,
}

impl TargetAcquisitionEngine {
    /// # Arguments
    ///
    /// * `config` - Tracker tuning and camera geometry
    /// * `operation_type` - Label attached to every report
    /// * `sink` - Where confirmed targets are reported
    pub fn new(config: TrackerConfig, operation_type: impl Into<String>, sink: OutputSink) -> Self {
        Self {
            config,
            operation_type: operation_type.into(),
            sink,
            targets: Vec::new(),
        }
    }

    /// Run one update cycle. Returns the number of targets reported.
    pub fn update(
        &mut self,
        detections: &[PixelPoint],
        vehicle: &VehicleState,
        frame: FrameSize,
    ) -> usize {
        let mut matched = vec![false; self.targets.len()];

        for &pixel in detections {
            let Some(fix) = project(frame, pixel, vehicle, &self.config.camera) else {
                continue;
            };

            match self.nearest(pixel) {
                Some(index) => {
                    self.targets[index].observe(pixel, fix, self.config.confirmation_frames);
                    matched[index] = true;
                }
                None => {
                    let target = Target::new(pixel, fix);
                    debug!("New target {} at ({:.0}, {:.0})", target.id, pixel.x, pixel.y);
                    self.targets.push(target);
                    matched.push(true);
                }
            }
        }

        for (target, seen) in self.targets.iter_mut().zip(&matched) {
            if !seen {
                target.frames_unseen += 1;
            }
        }

        let mut reported = 0;
        for target in &mut self.targets {
            if target.reported || target.confirmations < self.config.confirmation_frames {
                continue;
            }
            info!(
                "Target {} confirmed at ({:.7}, {:.7})",
                target.id, target.fix.lat, target.fix.lon
            );
            self.sink.send(OperationResult::TargetDetected {
                operation_type: self.operation_type.clone(),
                id: target.id.to_string(),
                lat: target.fix.lat,
                lon: target.fix.lon,
                timestamp: timestamp_now(),
            });
            target.reported = true;
            reported += 1;
        }

        let unseen_threshold = self.config.unseen_threshold;
        self.targets.retain(|target| {
            let keep = target.frames_unseen < unseen_threshold;
            if !keep {
                debug!("Dropping target {} after {} unseen frames", target.id, target.frames_unseen);
            }
            keep
        });

        reported
    }

    /// Index of the closest target strictly within `pixel_threshold`.
    fn nearest(&self, pixel: PixelPoint) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (index, target) in self.targets.iter().enumerate() {
            let distance = pixel.distance(&target.pixel);
            if distance >= self.config.pixel_threshold {
                continue;
            }
            if best.map_or(true, |(_, min)| distance < min) {
                best = Some((index, distance));
            }
        }
        best.map(|(index, _)| index)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
}
