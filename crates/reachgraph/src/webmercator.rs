//! Web-mercator projection and pixel arithmetic.
//!
//! Every grid operation in this crate happens in mercator pixel space, so
//! the projection is expressed through the projected world size `CE`
//! instead of the earth radius: the world spans `[-CE/2, CE/2]` on both
//! axes and `z_scale(zoom)` pixels per axis at a given zoom level. Points
//! are `[x, y]` pairs, matching the flat geometry arrays of the kernel.

use std::f64::consts::PI;

/// side length of the projected world in web-mercator units
pub const CE: f64 = 40075016.68557849;

/// pixel edge length of a map tile
pub const TILE_SIZE: u32 = 256;

/// latitude bound beyond which the projection degenerates
pub const MAX_LATITUDE: f64 = 85.0;

/// number of pixels along one axis of the world at `zoom`.
///
/// 2^zoom is the number of tiles, scaled by the pixels per tile.
pub fn z_scale(zoom: u8) -> f64 {
    (TILE_SIZE as f64) * 2.0f64.powi(zoom as i32)
}

/// web-mercator units covered by a single pixel at `zoom`
pub fn pixel_size(zoom: u8) -> f64 {
    CE / z_scale(zoom)
}

/// Projects a `[longitude, latitude]` WGS84 point into EPSG:3857.
/// Latitudes are clamped to `±MAX_LATITUDE` where the projection is
/// defined.
pub fn wgs84_to_webmercator(point: [f64; 2]) -> [f64; 2] {
    let lng = point[0].clamp(-180.0, 180.0);
    let lat = point[1].clamp(-MAX_LATITUDE, MAX_LATITUDE);
    [
        lng / 360.0 * CE,
        (PI / 4.0 + lat.to_radians() / 2.0).tan().ln() / (2.0 * PI) * CE,
    ]
}

/// Inverse of [`wgs84_to_webmercator`], returning `[longitude, latitude]`.
pub fn webmercator_to_wgs84(point: [f64; 2]) -> [f64; 2] {
    let lng = (point[0] / CE * 360.0).clamp(-180.0, 180.0);
    let lat = (2.0 * (point[1] / CE * 2.0 * PI).exp().atan() - PI / 2.0).to_degrees();
    [lng, lat.clamp(-MAX_LATITUDE, MAX_LATITUDE)]
}

pub fn mercator_x_to_pixel(x: f64, zoom: u8) -> f64 {
    (x + CE / 2.0) / pixel_size(zoom)
}

pub fn mercator_y_to_pixel(y: f64, zoom: u8) -> f64 {
    (CE / 2.0 - y) / pixel_size(zoom)
}

pub fn pixel_to_mercator_x(px: f64, zoom: u8) -> f64 {
    px * pixel_size(zoom) - CE / 2.0
}

pub fn pixel_to_mercator_y(py: f64, zoom: u8) -> f64 {
    CE / 2.0 - py * pixel_size(zoom)
}
