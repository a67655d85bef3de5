//! # Geodetic Projection
//!
//! Projects a pixel-space detection onto the ground plane and converts the
//! resulting north/east offset into latitude/longitude.
//!
//! ## Model
//!
//! 1. The pixel offset from frame center maps linearly onto ± half the field
//!    of view on each axis.
//! 2. Bearing = vehicle yaw + horizontal angular offset.
//! 3. Depression = −(vehicle pitch + camera mount pitch + vertical offset).
//! 4. Ground distance = altitude / tan(depression).
//! 5. North/east offsets are applied with a flat-Earth approximation:
//!    `dLat = north / R`, `dLon = east / (R · cos(lat))`.
//!
//! Valid for targets within a few hundred meters of the vehicle.
//!
//! ```
//! use telemetry_gateway::link::VehicleState;
//! use telemetry_gateway::tracking::geodetic::{project, CameraGeometry, FrameSize, PixelPoint};
//!
//! let camera = CameraGeometry { fov_h: 60.0, fov_v: 60.0, fixed_pitch: -90.0 };
//! let vehicle = VehicleState { lat: 41.0, lon: 29.0, alt: 50.0, yaw: 0.0, pitch: 0.0 };
//! let frame = FrameSize { width: 640, height: 480 };
//!
//! // Straight down at frame center lands under the vehicle.
//! let fix = project(frame, PixelPoint { x: 320.0, y: 240.0 }, &vehicle, &camera).unwrap();
//! assert!((fix.lat - 41.0).abs() < 1e-9);
//! assert!((fix.lon - 29.0).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};

use crate::link::VehicleState;

/// WGS-84 equatorial radius in meters
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

/// Minimum altitude for a usable depression angle
pub const MIN_ALTITUDE_M: f64 = 0.5;

/// Minimum depression angle; at or above the horizon the fix is undefined
pub const MIN_DEPRESSION_DEG: f64 = 1.0;

/// Pixel coordinates, origin at the top-left corner.
///
/// Deserializes from either `{"x": .., "y": ..}` or `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: f64,
    pub y: f64,
}

impl PixelPoint {
    pub fn distance(&self, other: &PixelPoint) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Frame dimensions in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

/// Camera optics and mount, all in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraGeometry {
    pub fov_h: f64,
    pub fov_v: f64,
    /// Mount pitch relative to the airframe; −90 looks straight down
    pub fixed_pitch: f64,
}

/// Latitude/longitude in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoFix {
    pub lat: f64,
    pub lon: f64,
}

/// Geodetic fix of `pixel`, or `None` when the geometry does not allow one
/// (vehicle too low, target at or above the horizon, empty frame).
pub fn project(
    frame: FrameSize,
    pixel: PixelPoint,
    vehicle: &VehicleState,
    camera: &CameraGeometry,
) -> Option<GeoFix> {
    if vehicle.alt <= MIN_ALTITUDE_M || frame.width == 0 || frame.height == 0 {
        return None;
    }

    let half_w = f64::from(frame.width) / 2.0;
    let half_h = f64::from(frame.height) / 2.0;
    let dx = pixel.x - half_w;
    let dy = half_h - pixel.y;

    let yaw_offset = (dx / half_w) * (camera.fov_h / 2.0);
    let pitch_offset = (dy / half_h) * (camera.fov_v / 2.0);

    let bearing = (vehicle.yaw + yaw_offset).to_radians();
    let depression = -(vehicle.pitch + camera.fixed_pitch + pitch_offset);
    if depression <= MIN_DEPRESSION_DEG {
        return None;
    }

    let ground_distance = vehicle.alt / depression.to_radians().tan();
    let north = ground_distance * bearing.cos();
    let east = ground_distance * bearing.sin();

    let d_lat = north / EARTH_RADIUS_M;
    let d_lon = east / (EARTH_RADIUS_M * vehicle.lat.to_radians().cos());

    Some(GeoFix {
        lat: vehicle.lat + d_lat.to_degrees(),
        lon: vehicle.lon + d_lon.to_degrees(),
    })
}
