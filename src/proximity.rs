//! # Proximity
//!
//! Nearby-player lookups over the heartbeat index. Every query refreshes the
//! caller's own heartbeat first, then fans out over the 3x3 neighborhood of
//! cells large enough to contain the requested radius.

use crate::clock::{duration_millis, Clock};
use crate::config::ProximityConfig;
use crate::error::{MapError, MapResult};
use crate::geo::{haversine_meters, validate_coordinates, validate_radius};
use crate::geohash;
use crate::model::{NearbyPlayer, PlayerLocationHeartbeat, PlayerProfile};
use crate::neighbors::neighbors;
use crate::store::LocationStore;
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves display data for user ids. Owned by the account subsystem.
pub trait ProfileDirectory: Send + Sync {
    fn profile(&self, user_id: &str) -> MapResult<Option<PlayerProfile>>;
}

/// Profile directory held in process.
#[derive(Debug, Default)]
pub struct InMemoryProfiles {
    profiles: RwLock<HashMap<String, PlayerProfile>>,
}

impl InMemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, profile: PlayerProfile) {
        self.profiles
            .write()
            .insert(profile.user_id.clone(), profile);
    }
}

impl ProfileDirectory for InMemoryProfiles {
    fn profile(&self, user_id: &str) -> MapResult<Option<PlayerProfile>> {
        Ok(self.profiles.read().get(user_id).cloned())
    }
}

pub struct ProximityFinder {
    locations: Arc<dyn LocationStore>,
    profiles: Arc<dyn ProfileDirectory>,
    clock: Arc<dyn Clock>,
    config: ProximityConfig,
}

impl ProximityFinder {
    pub fn new(
        locations: Arc<dyn LocationStore>,
        profiles: Arc<dyn ProfileDirectory>,
        clock: Arc<dyn Clock>,
        config: ProximityConfig,
    ) -> Self {
        Self {
            locations,
            profiles,
            clock,
            config,
        }
    }

    /// Record where `user_id` is now. Last write wins.
    pub fn heartbeat(
        &self,
        user_id: &str,
        latitude: f64,
        longitude: f64,
    ) -> MapResult<PlayerLocationHeartbeat> {
        if user_id.trim().is_empty() {
            return Err(MapError::Unauthenticated);
        }
        validate_coordinates(latitude, longitude)?;
        let heartbeat = PlayerLocationHeartbeat {
            user_id: user_id.to_string(),
            latitude,
            longitude,
            geohash: geohash::encode(latitude, longitude, self.config.heartbeat_precision)?,
            last_updated: self.clock.now_millis(),
        };
        self.locations.upsert_heartbeat(&heartbeat)?;
        Ok(heartbeat)
    }

    /// Players with a fresh heartbeat within `radius_meters`, nearest first.
    pub fn query(
        &self,
        user_id: &str,
        latitude: f64,
        longitude: f64,
        radius_meters: f64,
        limit: usize,
    ) -> MapResult<Vec<NearbyPlayer>> {
        validate_radius(radius_meters)?;
        validate_coordinates(latitude, longitude)?;
        let precision = geohash::precision_for_radius(
            radius_meters,
            latitude,
            self.config.heartbeat_precision,
        )?;
        let own = self.heartbeat(user_id, latitude, longitude)?;
        let now = own.last_updated;
        let freshness = duration_millis(self.config.freshness());
        let fresh_after = now.saturating_sub(freshness);

        let center_key = geohash::encode(latitude, longitude, precision)?;
        let keys = neighbors(&center_key)?;
        let batches: Vec<Vec<PlayerLocationHeartbeat>> = keys
            .par_iter()
            .map(|key| match self.locations.heartbeats_in_cell(key, fresh_after, user_id) {
                Ok(found) => found,
                Err(err) => {
                    warn!(key = %key, error = %err, "heartbeat lookup failed, treating cell as empty");
                    Vec::new()
                }
            })
            .collect();

        let origin = own.location();
        let mut seen = HashSet::new();
        let mut candidates: Vec<(f64, PlayerLocationHeartbeat)> = batches
            .into_iter()
            .flatten()
            .filter(|heartbeat| seen.insert(heartbeat.user_id.clone()))
            .map(|heartbeat| (haversine_meters(&origin, &heartbeat.location()), heartbeat))
            .filter(|(distance, _)| *distance <= radius_meters)
            .collect();
        candidates.sort_by(|(a, ha), (b, hb)| {
            a.total_cmp(b).then_with(|| ha.user_id.cmp(&hb.user_id))
        });
        candidates.truncate(limit);
        debug!(user_id, %center_key, found = candidates.len(), "nearby players resolved");

        Ok(candidates
            .into_iter()
            .map(|(distance, heartbeat)| self.describe(heartbeat, distance, now, freshness))
            .collect())
    }

    fn describe(
        &self,
        heartbeat: PlayerLocationHeartbeat,
        distance: f64,
        now: i64,
        freshness: i64,
    ) -> NearbyPlayer {
        let profile = match self.profiles.profile(&heartbeat.user_id) {
            Ok(profile) => profile,
            Err(err) => {
                warn!(user_id = %heartbeat.user_id, error = %err, "profile lookup failed");
                None
            }
        };
        let (display_name, alliance_id) = match profile {
            Some(profile) => (profile.display_name, profile.alliance_id),
            None => (heartbeat.user_id.clone(), None),
        };
        NearbyPlayer {
            display_name,
            alliance_id,
            latitude: heartbeat.latitude,
            longitude: heartbeat.longitude,
            distance_meters: distance.round() as u64,
            is_online: now - heartbeat.last_updated < freshness,
            last_seen: heartbeat.last_updated,
            user_id: heartbeat.user_id,
        }
    }
}
