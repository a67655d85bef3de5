//! Target tracking: pixel-to-ground projection and detection debouncing.

pub mod engine;
pub mod geodetic;

pub use engine::{Target, TargetAcquisitionEngine, TrackerConfig};
pub use geodetic::{project, CameraGeometry, FrameSize, GeoFix, PixelPoint};
