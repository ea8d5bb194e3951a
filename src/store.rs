//! # Store Module
//!
//! Storage capabilities the index is built on: exact-key reads, conditional
//! writes and ordered prefix scans. [`MemoryStore`] implements them in
//! process; [`crate::persistence::PersistentStore`] implements them on RocksDB.

use crate::error::{MapError, MapResult};
use crate::model::{MapActivity, PlayerLocationHeartbeat, TileAggregate};
use hashbrown::{HashMap, HashSet};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// A tile together with its optimistic concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedTile {
    pub tile: TileAggregate,
    pub version: u64,
}

/// Tile aggregates keyed by geohash plus the territory locator.
pub trait TileStore: Send + Sync {
    fn get_tile(&self, key: &str) -> MapResult<Option<VersionedTile>>;

    /// Write `tile` only if the stored version still equals `expected`
    /// (`None` meaning "no tile yet"). Returns `false` when the version moved.
    fn put_tile(&self, tile: &TileAggregate, expected: Option<u64>) -> MapResult<bool>;

    /// All stored tiles whose key starts with `prefix`, in key order.
    fn scan_tiles(&self, prefix: &str) -> MapResult<Vec<TileAggregate>>;

    /// Tile key a territory is currently indexed under.
    fn territory_tile(&self, territory_id: &str) -> MapResult<Option<String>>;

    /// Record (or clear, with `None`) the tile a territory lives in.
    fn set_territory_tile(&self, territory_id: &str, key: Option<&str>) -> MapResult<()>;
}

/// Player heartbeats keyed by user id with a geohash secondary index.
pub trait LocationStore: Send + Sync {
    /// Last write wins; at most one heartbeat per user.
    fn upsert_heartbeat(&self, heartbeat: &PlayerLocationHeartbeat) -> MapResult<()>;

    fn heartbeat(&self, user_id: &str) -> MapResult<Option<PlayerLocationHeartbeat>>;

    /// Heartbeats whose geohash starts with `prefix`, updated strictly after
    /// `fresh_after`, excluding `exclude_user`.
    fn heartbeats_in_cell(
        &self,
        prefix: &str,
        fresh_after: i64,
        exclude_user: &str,
    ) -> MapResult<Vec<PlayerLocationHeartbeat>>;

    /// Delete up to `limit` heartbeats last updated before `cutoff`.
    fn delete_heartbeats_before(&self, cutoff: i64, limit: usize) -> MapResult<usize>;

    fn heartbeat_count(&self) -> MapResult<usize>;
}

/// Activity records keyed by id, indexed by geohash and timestamp.
pub trait ActivityStore: Send + Sync {
    /// Idempotent on activity id.
    fn append_activity(&self, activity: &MapActivity) -> MapResult<()>;

    /// Activities whose geohash starts with `prefix`.
    fn activities_in_cell(&self, prefix: &str) -> MapResult<Vec<MapActivity>>;

    /// Up to `limit` of the oldest activities with a timestamp before
    /// `cutoff`, oldest first.
    fn activities_before(&self, cutoff: i64, limit: usize) -> MapResult<Vec<MapActivity>>;

    /// Delete `activities` and their index entries. Returns how many were
    /// still stored.
    fn delete_activities(&self, activities: &[MapActivity]) -> MapResult<usize>;

    fn activity_count(&self) -> MapResult<usize>;
}

/// Everything the map service needs from one backend.
pub trait MapStore: TileStore + LocationStore + ActivityStore {}

impl<T: TileStore + LocationStore + ActivityStore> MapStore for T {}

#[derive(Debug, Default)]
struct MemoryState {
    tiles: BTreeMap<String, VersionedTile>,
    locator: HashMap<String, String>,
    heartbeats: HashMap<String, PlayerLocationHeartbeat>,
    heartbeat_cells: BTreeSet<(String, String)>,
    activities: HashMap<String, MapActivity>,
    activity_cells: BTreeSet<(String, String)>,
    activity_times: BTreeSet<(i64, String)>,
    failing_tiles: HashSet<String>,
}

/// In-process store backed by ordered maps. Used by tests and single-node
/// deployments without a data directory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read touching tile `key` fail, to exercise degraded
    /// fan-out paths.
    pub fn fail_tile_reads(&self, key: &str) {
        self.state.write().failing_tiles.insert(key.to_string());
    }

    pub fn tile_count(&self) -> usize {
        self.state.read().tiles.len()
    }
}

fn unavailable(key: &str) -> MapError {
    MapError::Store {
        message: format!("tile {key} unavailable"),
        retryable: true,
    }
}

fn prefix_range<'a>(
    set: &'a BTreeSet<(String, String)>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a (String, String)> + 'a {
    set.range((prefix.to_string(), String::new())..)
        .take_while(move |(cell, _)| cell.starts_with(prefix))
}

impl TileStore for MemoryStore {
    fn get_tile(&self, key: &str) -> MapResult<Option<VersionedTile>> {
        let state = self.state.read();
        if state.failing_tiles.contains(key) {
            return Err(unavailable(key));
        }
        Ok(state.tiles.get(key).cloned())
    }

    fn put_tile(&self, tile: &TileAggregate, expected: Option<u64>) -> MapResult<bool> {
        let mut state = self.state.write();
        let current = state.tiles.get(&tile.key).map(|stored| stored.version);
        if current != expected {
            return Ok(false);
        }
        let version = current.map_or(1, |v| v + 1);
        state.tiles.insert(
            tile.key.clone(),
            VersionedTile {
                tile: tile.clone(),
                version,
            },
        );
        Ok(true)
    }

    fn scan_tiles(&self, prefix: &str) -> MapResult<Vec<TileAggregate>> {
        let state = self.state.read();
        if state
            .failing_tiles
            .iter()
            .any(|key| key.starts_with(prefix) || prefix.starts_with(key.as_str()))
        {
            return Err(unavailable(prefix));
        }
        Ok(state
            .tiles
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, stored)| stored.tile.clone())
            .collect())
    }

    fn territory_tile(&self, territory_id: &str) -> MapResult<Option<String>> {
        Ok(self.state.read().locator.get(territory_id).cloned())
    }

    fn set_territory_tile(&self, territory_id: &str, key: Option<&str>) -> MapResult<()> {
        let mut state = self.state.write();
        match key {
            Some(key) => {
                state
                    .locator
                    .insert(territory_id.to_string(), key.to_string());
            }
            None => {
                state.locator.remove(territory_id);
            }
        }
        Ok(())
    }
}

impl LocationStore for MemoryStore {
    fn upsert_heartbeat(&self, heartbeat: &PlayerLocationHeartbeat) -> MapResult<()> {
        let mut state = self.state.write();
        if let Some(previous) = state
            .heartbeats
            .insert(heartbeat.user_id.clone(), heartbeat.clone())
        {
            state
                .heartbeat_cells
                .remove(&(previous.geohash, previous.user_id));
        }
        state
            .heartbeat_cells
            .insert((heartbeat.geohash.clone(), heartbeat.user_id.clone()));
        Ok(())
    }

    fn heartbeat(&self, user_id: &str) -> MapResult<Option<PlayerLocationHeartbeat>> {
        Ok(self.state.read().heartbeats.get(user_id).cloned())
    }

    fn heartbeats_in_cell(
        &self,
        prefix: &str,
        fresh_after: i64,
        exclude_user: &str,
    ) -> MapResult<Vec<PlayerLocationHeartbeat>> {
        let state = self.state.read();
        Ok(prefix_range(&state.heartbeat_cells, prefix)
            .filter(|(_, user_id)| user_id != exclude_user)
            .filter_map(|(_, user_id)| state.heartbeats.get(user_id))
            .filter(|heartbeat| heartbeat.last_updated > fresh_after)
            .cloned()
            .collect())
    }

    fn delete_heartbeats_before(&self, cutoff: i64, limit: usize) -> MapResult<usize> {
        let mut state = self.state.write();
        let mut stale: Vec<(i64, String)> = state
            .heartbeats
            .values()
            .filter(|heartbeat| heartbeat.last_updated < cutoff)
            .map(|heartbeat| (heartbeat.last_updated, heartbeat.user_id.clone()))
            .collect();
        stale.sort();
        stale.truncate(limit);
        for (_, user_id) in &stale {
            if let Some(removed) = state.heartbeats.remove(user_id) {
                state
                    .heartbeat_cells
                    .remove(&(removed.geohash, removed.user_id));
            }
        }
        Ok(stale.len())
    }

    fn heartbeat_count(&self) -> MapResult<usize> {
        Ok(self.state.read().heartbeats.len())
    }
}

impl ActivityStore for MemoryStore {
    fn append_activity(&self, activity: &MapActivity) -> MapResult<()> {
        let mut state = self.state.write();
        if let Some(previous) = state
            .activities
            .insert(activity.id.clone(), activity.clone())
        {
            state
                .activity_cells
                .remove(&(previous.geohash.clone(), previous.id.clone()));
            state
                .activity_times
                .remove(&(previous.timestamp, previous.id));
        }
        state
            .activity_cells
            .insert((activity.geohash.clone(), activity.id.clone()));
        state
            .activity_times
            .insert((activity.timestamp, activity.id.clone()));
        Ok(())
    }

    fn activities_in_cell(&self, prefix: &str) -> MapResult<Vec<MapActivity>> {
        let state = self.state.read();
        Ok(prefix_range(&state.activity_cells, prefix)
            .filter_map(|(_, id)| state.activities.get(id))
            .cloned()
            .collect())
    }

    fn activities_before(&self, cutoff: i64, limit: usize) -> MapResult<Vec<MapActivity>> {
        let state = self.state.read();
        Ok(state
            .activity_times
            .iter()
            .take_while(|(timestamp, _)| *timestamp < cutoff)
            .take(limit)
            .filter_map(|(_, id)| state.activities.get(id))
            .cloned()
            .collect())
    }

    fn delete_activities(&self, activities: &[MapActivity]) -> MapResult<usize> {
        let mut state = self.state.write();
        let mut deleted = 0;
        for activity in activities {
            if let Some(stored) = state.activities.remove(&activity.id) {
                state
                    .activity_times
                    .remove(&(stored.timestamp, stored.id.clone()));
                state.activity_cells.remove(&(stored.geohash, stored.id));
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn activity_count(&self) -> MapResult<usize> {
        Ok(self.state.read().activities.len())
    }
}
