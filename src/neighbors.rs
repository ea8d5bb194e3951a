//! # Neighbor Resolution
//!
//! Same-precision adjacency computed geometrically: step the cell center by one
//! cell width/height in each compass direction and re-encode. Steps that leave
//! the valid coordinate range are dropped, so polar and antimeridian cells have
//! fewer neighbors.

use crate::error::MapResult;
use crate::geohash::{self, CellBounds};

/// Compass offsets as (latitude steps, longitude steps), self first.
const OFFSETS: [(f64, f64); 9] = [
    (0.0, 0.0),
    (1.0, 0.0),
    (1.0, 1.0),
    (0.0, 1.0),
    (-1.0, 1.0),
    (-1.0, 0.0),
    (-1.0, -1.0),
    (0.0, -1.0),
    (1.0, -1.0),
];

/// The cell itself followed by up to eight adjacent cells of the same
/// precision, de-duplicated in compass order (N, NE, E, SE, S, SW, W, NW).
pub fn neighbors(key: &str) -> MapResult<Vec<String>> {
    let bounds = geohash::decode(key)?;
    let center = bounds.center();
    let height = bounds.height_degrees();
    let width = bounds.width_degrees();
    let precision = key.len();

    let mut keys: Vec<String> = Vec::with_capacity(OFFSETS.len());
    for (lat_step, lon_step) in OFFSETS {
        let latitude = center.latitude + lat_step * height;
        let longitude = center.longitude + lon_step * width;
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            continue;
        }
        let neighbor = geohash::encode(latitude, longitude, precision)?;
        if !keys.contains(&neighbor) {
            keys.push(neighbor);
        }
    }
    Ok(keys)
}

/// Cells at `precision` around the center of `bounds` that intersect it. When
/// `bounds` is no larger than one cell in either dimension this covers it
/// completely.
pub fn covering_keys(bounds: &CellBounds, precision: usize) -> MapResult<Vec<String>> {
    let center = bounds.center();
    let center_key = geohash::encode(center.latitude, center.longitude, precision)?;
    let mut covering = Vec::new();
    for key in neighbors(&center_key)? {
        if geohash::decode(&key)?.intersects(bounds) {
            covering.push(key);
        }
    }
    Ok(covering)
}
