use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::geo::GeoPoint;
use crate::geohash;
use crate::model::{ActivityKind, AllianceRef, MapActivity, TerritorySnapshot};

const ALLIANCES: [(&str, &str, &str); 4] = [
    ("alliance-red", "Red Banner", "RED"),
    ("alliance-blue", "Blue Tide", "BLU"),
    ("alliance-gold", "Golden Hand", "GLD"),
    ("alliance-ash", "Ashen Court", "ASH"),
];

const STRUCTURES: [&str; 4] = ["outpost", "fort", "tower", "citadel"];

#[derive(Debug, Clone)]
pub struct GeneratedMap {
    pub territories: Vec<TerritorySnapshot>,
    pub activities: Vec<MapActivity>,
}

fn jitter(rng: &mut StdRng, center: GeoPoint, spread_degrees: f64) -> GeoPoint {
    let latitude = center.latitude + rng.random_range(-spread_degrees..=spread_degrees);
    let longitude = center.longitude + rng.random_range(-spread_degrees..=spread_degrees);
    GeoPoint::new(latitude.clamp(-90.0, 90.0), longitude.clamp(-180.0, 180.0))
}

/// Territories scattered uniformly within `spread_degrees` of `center`.
/// `allied_probability` of them belong to one of four alliances.
pub fn generate_territories(
    count: usize,
    center: GeoPoint,
    spread_degrees: f64,
    allied_probability: f64,
    seed: u64,
) -> Vec<TerritorySnapshot> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut territories = Vec::with_capacity(count);
    for i in 0..count {
        let point = jitter(&mut rng, center, spread_degrees);
        let mut territory = TerritorySnapshot::new(
            format!("territory_{:06}", i),
            point.latitude,
            point.longitude,
        )
        .with_owner(format!("user_{:04}", rng.random_range(0..500)), format!("Player {i}"));
        if rng.random_bool(allied_probability) {
            let (id, name, tag) = ALLIANCES[rng.random_range(0..ALLIANCES.len())];
            territory = territory.with_alliance(AllianceRef::new(id, name, tag));
        }
        territory.level = rng.random_range(1..=10);
        territory.structure_type = STRUCTURES[rng.random_range(0..STRUCTURES.len())].to_string();
        territory.is_contested = rng.random_bool(0.1);
        territory.is_shielded = rng.random_bool(0.2);
        territory.defense_rating = rng.random_range(0..1000);
        territory.total_blocks = rng.random_range(1..64);
        territories.push(territory);
    }
    territories
}

/// Activities spread like [`generate_territories`], with timestamps in
/// `[start, start + window_millis)`.
pub fn generate_activities(
    count: usize,
    center: GeoPoint,
    spread_degrees: f64,
    start: i64,
    window_millis: i64,
    seed: u64,
) -> Vec<MapActivity> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut activities = Vec::with_capacity(count);
    for i in 0..count {
        let point = jitter(&mut rng, center, spread_degrees);
        let actor = format!("Player {}", rng.random_range(0..50));
        let kind = match rng.random_range(0..3) {
            0 => ActivityKind::Claim,
            1 => ActivityKind::Attack {
                defender: format!("Player {}", rng.random_range(0..50)),
            },
            _ => ActivityKind::Conquest {
                defender: format!("Player {}", rng.random_range(0..50)),
            },
        };
        let geohash = match geohash::encode(point.latitude, point.longitude, 12) {
            Ok(geohash) => geohash,
            Err(_) => continue,
        };
        activities.push(MapActivity {
            id: format!("activity_{:06}", i),
            description: format!("{actor} {}", kind.activity_type()),
            kind,
            actor_name: actor,
            latitude: point.latitude,
            longitude: point.longitude,
            geohash,
            timestamp: start + rng.random_range(0..window_millis.max(1)),
        });
    }
    activities
}

pub fn generate_map(
    territory_count: usize,
    activity_count: usize,
    center: GeoPoint,
    spread_degrees: f64,
    seed: u64,
) -> GeneratedMap {
    GeneratedMap {
        territories: generate_territories(territory_count, center, spread_degrees, 0.7, seed),
        activities: generate_activities(
            activity_count,
            center,
            spread_degrees,
            0,
            3_600_000,
            seed.wrapping_add(1),
        ),
    }
}
