//! # Geohash Codec
//!
//! Encodes latitude/longitude pairs into prefix-sortable cell keys and back.
//! Bits alternate between longitude and latitude (longitude first), five bits
//! per output symbol. A key of length `n` is always contained in the cell of
//! its length `n - 1` prefix.

use crate::error::{MapError, MapResult};
use crate::geo::{validate_coordinates, GeoPoint, METERS_PER_DEGREE};
use serde::{Deserialize, Serialize};

/// The 32-symbol geohash alphabet (no `a`, `i`, `l`, `o`).
pub const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

pub const MIN_PRECISION: usize = 1;
pub const MAX_PRECISION: usize = 12;

const BITS_PER_SYMBOL: usize = 5;

/// A decimal-degree rectangle. `south < north` and `west < east`; the
/// antimeridian is never crossed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl CellBounds {
    /// Validated constructor for caller-supplied boxes.
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> MapResult<Self> {
        validate_coordinates(north, east)?;
        validate_coordinates(south, west)?;
        if south >= north {
            return Err(MapError::invalid(format!(
                "south {south} must be below north {north}"
            )));
        }
        if west >= east {
            return Err(MapError::invalid(format!(
                "west {west} must be below east {east}"
            )));
        }
        Ok(Self {
            north,
            south,
            east,
            west,
        })
    }

    pub fn center(&self) -> GeoPoint {
        center(self)
    }

    /// Inclusive on every edge.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.south
            && latitude <= self.north
            && longitude >= self.west
            && longitude <= self.east
    }

    pub fn intersects(&self, other: &CellBounds) -> bool {
        self.south <= other.north
            && other.south <= self.north
            && self.west <= other.east
            && other.west <= self.east
    }

    pub fn width_degrees(&self) -> f64 {
        self.east - self.west
    }

    pub fn height_degrees(&self) -> f64 {
        self.north - self.south
    }
}

/// Encode a coordinate into a geohash of `precision` symbols.
///
/// A value lying exactly on a subdivision midpoint falls into the upper half.
pub fn encode(latitude: f64, longitude: f64, precision: usize) -> MapResult<String> {
    validate_coordinates(latitude, longitude)?;
    validate_precision(precision)?;

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut key = String::with_capacity(precision);
    let mut symbol = 0usize;
    let mut bit = 0usize;
    let mut even = true;

    while key.len() < precision {
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if longitude >= mid {
                symbol = (symbol << 1) | 1;
                lon_lo = mid;
            } else {
                symbol <<= 1;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if latitude >= mid {
                symbol = (symbol << 1) | 1;
                lat_lo = mid;
            } else {
                symbol <<= 1;
                lat_hi = mid;
            }
        }
        even = !even;
        bit += 1;
        if bit == BITS_PER_SYMBOL {
            key.push(BASE32[symbol] as char);
            symbol = 0;
            bit = 0;
        }
    }

    Ok(key)
}

/// Decode a geohash into the rectangle it names.
pub fn decode(key: &str) -> MapResult<CellBounds> {
    validate_key(key)?;

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;

    for byte in key.bytes() {
        let value = symbol_value(byte)
            .ok_or_else(|| MapError::invalid(format!("invalid geohash symbol in {key:?}")))?;
        for shift in (0..BITS_PER_SYMBOL).rev() {
            let set = (value >> shift) & 1 == 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if set {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if set {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }

    Ok(CellBounds {
        north: lat_hi,
        south: lat_lo,
        east: lon_hi,
        west: lon_lo,
    })
}

/// Midpoint of a rectangle.
pub fn center(bounds: &CellBounds) -> GeoPoint {
    GeoPoint::new(
        (bounds.north + bounds.south) / 2.0,
        (bounds.east + bounds.west) / 2.0,
    )
}

pub fn validate_precision(precision: usize) -> MapResult<()> {
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err(MapError::invalid(format!(
            "precision {precision} outside [{MIN_PRECISION}, {MAX_PRECISION}]"
        )));
    }
    Ok(())
}

/// Checks length and alphabet of a geohash key.
pub fn validate_key(key: &str) -> MapResult<()> {
    validate_precision(key.len())?;
    if let Some(bad) = key.bytes().find(|b| symbol_value(*b).is_none()) {
        return Err(MapError::invalid(format!(
            "geohash {key:?} contains symbol {:?} outside the alphabet",
            bad as char
        )));
    }
    Ok(())
}

fn symbol_value(byte: u8) -> Option<usize> {
    BASE32.iter().position(|candidate| *candidate == byte)
}

/// Width and height in degrees of every cell at `precision`.
pub fn cell_dimensions_degrees(precision: usize) -> (f64, f64) {
    let bits = precision * BITS_PER_SYMBOL;
    let lon_bits = (bits + 1) / 2;
    let lat_bits = bits / 2;
    (
        360.0 / 2f64.powi(lon_bits as i32),
        180.0 / 2f64.powi(lat_bits as i32),
    )
}

/// Approximate width and height in meters of a cell at `precision` centred on
/// `latitude`.
pub fn cell_dimensions_meters(precision: usize, latitude: f64) -> (f64, f64) {
    let (width, height) = cell_dimensions_degrees(precision);
    let shrink = latitude.to_radians().cos().abs().max(1e-6);
    (
        width * METERS_PER_DEGREE * shrink,
        height * METERS_PER_DEGREE,
    )
}

/// Finest precision, at most `max_precision`, whose cells are at least
/// `radius_meters` on their shorter side. A 3x3 neighborhood at that precision
/// covers every point within the radius of any point in the center cell.
///
/// Cell width is measured at the most poleward latitude the radius can reach,
/// where cells are narrowest. Radii no precision can cover are rejected.
pub fn precision_for_radius(
    radius_meters: f64,
    latitude: f64,
    max_precision: usize,
) -> MapResult<usize> {
    let max_precision = max_precision.clamp(MIN_PRECISION, MAX_PRECISION);
    (MIN_PRECISION..=max_precision)
        .rev()
        .find(|precision| {
            let (_, height_degrees) = cell_dimensions_degrees(*precision);
            let poleward = (latitude.abs() + height_degrees).min(90.0);
            let (width, _) = cell_dimensions_meters(*precision, poleward);
            let (_, height) = cell_dimensions_meters(*precision, latitude);
            width.min(height) >= radius_meters
        })
        .ok_or_else(|| {
            MapError::invalid(format!(
                "radius {radius_meters} m at latitude {latitude} exceeds the largest coverable area"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn encodes_reference_points() {
        assert_eq!(encode(42.6, -5.6, 5).unwrap(), "ezs42");
        assert_eq!(encode(57.64911, 10.40744, 11).unwrap(), "u4pruydqqvj");
    }

    #[test]
    fn san_francisco_round_trip_contains_point() {
        let key = encode(37.7749, -122.4194, 6).unwrap();
        assert_eq!(key.len(), 6);
        assert!(key.starts_with("9q8y"));
        let bounds = decode(&key).unwrap();
        assert!(bounds.contains(37.7749, -122.4194));
    }

    #[test]
    fn decoded_cell_contains_encoded_point() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..2_000 {
            let lat = rng.random_range(-90.0..=90.0);
            let lon = rng.random_range(-180.0..=180.0);
            let precision = rng.random_range(MIN_PRECISION..=MAX_PRECISION);
            let key = encode(lat, lon, precision).unwrap();
            let bounds = decode(&key).unwrap();
            assert!(bounds.contains(lat, lon), "{key} does not contain ({lat}, {lon})");
        }
    }

    #[test]
    fn longer_keys_nest_inside_prefixes() {
        let long = encode(-33.8688, 151.2093, 9).unwrap();
        let short = encode(-33.8688, 151.2093, 4).unwrap();
        assert!(long.starts_with(&short));
        let inner = decode(&long).unwrap();
        let outer = decode(&short).unwrap();
        assert!(outer.contains(inner.north, inner.east));
        assert!(outer.contains(inner.south, inner.west));
    }

    #[test]
    fn midpoint_ties_take_upper_half() {
        // (0, 0) sits on the first split of both axes.
        assert_eq!(encode(0.0, 0.0, 1).unwrap(), "s");
        assert_eq!(encode(90.0, 180.0, 3).unwrap(), "zzz");
        assert_eq!(encode(-90.0, -180.0, 3).unwrap(), "000");
    }

    #[test]
    fn rejects_malformed_keys_and_inputs() {
        assert!(matches!(decode("9q8a"), Err(MapError::InvalidArgument(_))));
        assert!(matches!(decode(""), Err(MapError::InvalidArgument(_))));
        assert!(decode("9Q8").is_err());
        assert!(encode(10.0, 10.0, 0).is_err());
        assert!(encode(10.0, 10.0, 13).is_err());
        assert!(encode(100.0, 10.0, 5).is_err());
    }

    #[test]
    fn cell_dimensions_match_decoded_cells() {
        for precision in MIN_PRECISION..=MAX_PRECISION {
            let key = encode(12.5, 45.25, precision).unwrap();
            let bounds = decode(&key).unwrap();
            let (width, height) = cell_dimensions_degrees(precision);
            assert!((bounds.width_degrees() - width).abs() < 1e-9);
            assert!((bounds.height_degrees() - height).abs() < 1e-9);
        }
    }

    #[test]
    fn radius_precision_selection() {
        assert_eq!(precision_for_radius(1_000.0, 37.77, 6).unwrap(), 5);
        assert_eq!(precision_for_radius(100.0, 0.0, 6).unwrap(), 6);
        assert_eq!(precision_for_radius(500_000.0, 0.0, 6).unwrap(), 2);
        assert!(precision_for_radius(6_000_000.0, 1.0, 6).is_err());
        assert!(precision_for_radius(50_000_000.0, 0.0, 6).is_err());
    }
}
