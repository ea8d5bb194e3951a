//! # Tile Reconciler
//!
//! Folds territory snapshots and activity records into per-cell tile
//! aggregates. Every tile mutation is an optimistic read-modify-write: read the
//! tile with its version, apply the change, recompute derived fields and write
//! back only if the version has not moved. Lost races are retried a bounded
//! number of times.
//!
//! Updates to one territory can touch two tiles and the locator, so they are
//! serialized on a striped lock keyed by territory id. Different territories
//! still race only on tile versions.

use crate::clock::Clock;
use crate::config::{IndexConfig, TERRITORY_LOCK_STRIPES};
use crate::error::{MapError, MapResult};
use crate::geo::validate_coordinates;
use crate::geohash;
use crate::model::{MapActivity, TerritoryPatch, TerritorySnapshot, TileAggregate};
use crate::store::{ActivityStore, TileStore};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

/// What `apply` did with a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Indexed {
        key: String,
        /// Tile the territory was removed from when its coordinates moved it
        /// to a different cell.
        relocated_from: Option<String>,
    },
    /// The snapshot had no usable location.
    Skipped,
}

pub struct TileReconciler {
    tiles: Arc<dyn TileStore>,
    activities: Arc<dyn ActivityStore>,
    clock: Arc<dyn Clock>,
    config: IndexConfig,
    territory_locks: Vec<Mutex<()>>,
}

impl TileReconciler {
    pub fn new(
        tiles: Arc<dyn TileStore>,
        activities: Arc<dyn ActivityStore>,
        clock: Arc<dyn Clock>,
        config: IndexConfig,
    ) -> Self {
        Self {
            tiles,
            activities,
            clock,
            config,
            territory_locks: (0..TERRITORY_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn tile_precision(&self) -> usize {
        self.config.tile_precision
    }

    /// Upsert `snapshot` into the tile owning its coordinates.
    pub fn apply(&self, territory_id: &str, snapshot: TerritorySnapshot) -> MapResult<ApplyOutcome> {
        if territory_id.trim().is_empty() {
            return Err(MapError::invalid("territory id is required"));
        }
        let _guard = self.territory_lock(territory_id);
        self.apply_locked(territory_id, snapshot)
    }

    fn apply_locked(
        &self,
        territory_id: &str,
        mut snapshot: TerritorySnapshot,
    ) -> MapResult<ApplyOutcome> {
        if let Err(err) = validate_coordinates(snapshot.latitude, snapshot.longitude) {
            warn!(territory_id, error = %err, "skipping territory without a usable location");
            return Ok(ApplyOutcome::Skipped);
        }
        snapshot.id = territory_id.to_string();
        let key = geohash::encode(
            snapshot.latitude,
            snapshot.longitude,
            self.config.tile_precision,
        )?;
        let previous = self.tiles.territory_tile(territory_id)?;

        self.mutate_tile(&key, |tile| {
            tile.upsert_territory(snapshot.clone());
            true
        })?;

        let relocated_from = match previous.as_deref() {
            Some(old_key) if old_key != key => {
                self.mutate_tile(old_key, |tile| tile.remove_territory(territory_id).is_some())?;
                debug!(territory_id, from = old_key, to = %key, "territory relocated");
                Some(old_key.to_string())
            }
            _ => None,
        };
        if previous.as_deref() != Some(key.as_str()) {
            self.tiles.set_territory_tile(territory_id, Some(&key))?;
        }

        Ok(ApplyOutcome::Indexed {
            key,
            relocated_from,
        })
    }

    /// Merge `patch` over the currently indexed snapshot and apply the result.
    pub fn apply_patch(&self, territory_id: &str, patch: TerritoryPatch) -> MapResult<ApplyOutcome> {
        if territory_id.trim().is_empty() {
            return Err(MapError::invalid("territory id is required"));
        }
        let _guard = self.territory_lock(territory_id);
        let base = self.indexed_snapshot(territory_id)?;
        match patch.merge(territory_id, base.as_ref()) {
            Some(merged) => self.apply_locked(territory_id, merged),
            None => {
                warn!(territory_id, "skipping patch for unindexed territory without coordinates");
                Ok(ApplyOutcome::Skipped)
            }
        }
    }

    /// Drop a territory from its tile and the locator. Returns whether it was
    /// indexed.
    pub fn remove(&self, territory_id: &str) -> MapResult<bool> {
        let _guard = self.territory_lock(territory_id);
        let Some(key) = self.tiles.territory_tile(territory_id)? else {
            return Ok(false);
        };
        let removed =
            self.mutate_tile(&key, |tile| tile.remove_territory(territory_id).is_some())?;
        self.tiles.set_territory_tile(territory_id, None)?;
        Ok(removed)
    }

    /// The snapshot currently indexed for `territory_id`, if any.
    pub fn indexed_snapshot(&self, territory_id: &str) -> MapResult<Option<TerritorySnapshot>> {
        let Some(key) = self.tiles.territory_tile(territory_id)? else {
            return Ok(None);
        };
        Ok(self
            .tiles
            .get_tile(&key)?
            .and_then(|stored| stored.tile.territory(territory_id).cloned()))
    }

    /// Persist an activity and push it onto its tile's feed. Returns the tile
    /// key.
    pub fn record_activity(&self, activity: MapActivity) -> MapResult<String> {
        self.activities.append_activity(&activity)?;
        let key = activity.tile_key(self.config.tile_precision).to_string();
        self.mutate_tile(&key, |tile| tile.recent_activity.push(activity.clone()))?;
        Ok(key)
    }

    /// Remove feed entries older than `cutoff` from one tile.
    pub fn prune_feed(&self, key: &str, cutoff: i64) -> MapResult<usize> {
        let mut pruned = 0;
        self.mutate_tile(key, |tile| {
            pruned = tile.recent_activity.prune_before(cutoff);
            pruned > 0
        })?;
        Ok(pruned)
    }

    fn territory_lock(&self, territory_id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        territory_id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.territory_locks.len() as u64) as usize;
        self.territory_locks[stripe].lock()
    }

    /// Optimistic read-modify-write of one tile. `change` returns `false` to
    /// abandon the write; the result reports whether a write happened.
    fn mutate_tile(
        &self,
        key: &str,
        mut change: impl FnMut(&mut TileAggregate) -> bool,
    ) -> MapResult<bool> {
        for attempt in 1..=self.config.max_cas_attempts {
            let (mut tile, expected) = match self.tiles.get_tile(key)? {
                Some(stored) => (stored.tile, Some(stored.version)),
                None => (
                    TileAggregate::empty(key, self.config.activity_feed_capacity)?,
                    None,
                ),
            };
            tile.recent_activity.set_capacity(self.config.activity_feed_capacity);
            if !change(&mut tile) {
                return Ok(false);
            }
            tile.refresh(self.clock.now_millis());
            if self.tiles.put_tile(&tile, expected)? {
                return Ok(true);
            }
            debug!(key, attempt, "tile version moved, retrying");
        }
        warn!(key, attempts = self.config.max_cas_attempts, "giving up on contended tile");
        Err(MapError::Conflict {
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{ActivityKind, AllianceRef};
    use crate::store::{MemoryStore, VersionedTile};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    const SF: (f64, f64) = (37.7749, -122.4194);
    const OAKLAND: (f64, f64) = (37.8044, -122.2712);

    fn reconciler() -> (Arc<MemoryStore>, Arc<ManualClock>, TileReconciler) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let reconciler = TileReconciler::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            IndexConfig::default(),
        );
        (store, clock, reconciler)
    }

    fn territory(id: &str, at: (f64, f64), alliance: &str) -> TerritorySnapshot {
        TerritorySnapshot::new(id, at.0, at.1)
            .with_alliance(AllianceRef::new(alliance, format!("{alliance} guild"), alliance))
    }

    fn stored(store: &MemoryStore, key: &str) -> TileAggregate {
        store.get_tile(key).unwrap().unwrap().tile
    }

    #[test]
    fn dominant_alliance_follows_counts() {
        let (store, _, reconciler) = reconciler();
        reconciler.apply("t1", territory("t1", SF, "A")).unwrap();
        reconciler.apply("t2", territory("t2", SF, "B")).unwrap();
        let outcome = reconciler.apply("t3", territory("t3", SF, "A")).unwrap();

        let ApplyOutcome::Indexed { key, relocated_from } = outcome else {
            panic!("expected indexed outcome");
        };
        assert_eq!(relocated_from, None);
        let tile = stored(&store, &key);
        assert_eq!(tile.total_territories, 3);
        let dominant = tile.dominant_alliance.unwrap();
        assert_eq!(dominant.id, "A");
        assert_eq!(dominant.territory_count, 2);
        assert_eq!(tile.last_updated, 1_000);
    }

    #[test]
    fn reapplying_replaces_in_place() {
        let (store, clock, reconciler) = reconciler();
        reconciler.apply("t1", territory("t1", SF, "A")).unwrap();
        reconciler.apply("t2", territory("t2", SF, "B")).unwrap();
        clock.set(2_000);
        reconciler.apply("t1", territory("t1", SF, "B")).unwrap();

        let key = store.territory_tile("t1").unwrap().unwrap();
        let tile = stored(&store, &key);
        assert_eq!(tile.total_territories, 2);
        assert_eq!(tile.territories[0].id, "t1");
        assert_eq!(tile.dominant_alliance.unwrap().id, "B");
        assert_eq!(tile.last_updated, 2_000);
    }

    #[test]
    fn invalid_coordinates_are_skipped() {
        let (store, _, reconciler) = reconciler();
        let outcome = reconciler
            .apply("t1", TerritorySnapshot::new("t1", 91.0, 0.0))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped);
        let outcome = reconciler
            .apply("t1", TerritorySnapshot::new("t1", f64::NAN, 0.0))
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped);
        assert_eq!(store.tile_count(), 0);
        assert!(reconciler.apply("", territory("t1", SF, "A")).is_err());
    }

    #[test]
    fn relocation_moves_between_tiles() {
        let (store, _, reconciler) = reconciler();
        reconciler.apply("t1", territory("t1", SF, "A")).unwrap();
        reconciler.apply("t2", territory("t2", SF, "A")).unwrap();
        let sf_key = store.territory_tile("t1").unwrap().unwrap();

        let outcome = reconciler.apply("t1", territory("t1", OAKLAND, "A")).unwrap();
        let ApplyOutcome::Indexed { key, relocated_from } = outcome else {
            panic!("expected indexed outcome");
        };
        assert_ne!(key, sf_key);
        assert_eq!(relocated_from.as_deref(), Some(sf_key.as_str()));
        assert_eq!(store.territory_tile("t1").unwrap().as_deref(), Some(key.as_str()));

        let old = stored(&store, &sf_key);
        assert_eq!(old.total_territories, 1);
        assert!(old.territory("t1").is_none());
        assert_eq!(stored(&store, &key).total_territories, 1);
    }

    #[test]
    fn patch_merges_over_indexed_snapshot() {
        let (store, _, reconciler) = reconciler();
        let mut original = territory("t1", SF, "A");
        original.level = 4;
        original.owner_name = "ann".to_string();
        reconciler.apply("t1", original).unwrap();

        let patch = TerritoryPatch {
            is_contested: Some(true),
            alliance: Some(None),
            ..Default::default()
        };
        reconciler.apply_patch("t1", patch).unwrap();

        let merged = reconciler.indexed_snapshot("t1").unwrap().unwrap();
        assert_eq!(merged.level, 4);
        assert_eq!(merged.owner_name, "ann");
        assert!(merged.is_contested);
        assert_eq!(merged.alliance_id, None);
        let key = store.territory_tile("t1").unwrap().unwrap();
        assert_eq!(stored(&store, &key).dominant_alliance, None);

        let orphan = TerritoryPatch {
            level: Some(2),
            ..Default::default()
        };
        assert_eq!(
            reconciler.apply_patch("t9", orphan).unwrap(),
            ApplyOutcome::Skipped
        );
    }

    #[test]
    fn remove_drops_territory_and_locator() {
        let (store, _, reconciler) = reconciler();
        reconciler.apply("t1", territory("t1", SF, "A")).unwrap();
        let key = store.territory_tile("t1").unwrap().unwrap();

        assert!(reconciler.remove("t1").unwrap());
        assert_eq!(store.territory_tile("t1").unwrap(), None);
        let tile = stored(&store, &key);
        assert_eq!(tile.total_territories, 0);
        assert_eq!(tile.dominant_alliance, None);
        assert!(!reconciler.remove("t1").unwrap());
    }

    #[test]
    fn activities_land_in_the_owning_feed() {
        let (store, _, reconciler) = reconciler();
        for (i, actor) in ["ann", "bob", "ann"].iter().enumerate() {
            let activity = MapActivity {
                id: format!("a{i}"),
                kind: ActivityKind::Claim,
                actor_name: actor.to_string(),
                description: "claimed".to_string(),
                latitude: SF.0,
                longitude: SF.1,
                geohash: geohash::encode(SF.0, SF.1, 12).unwrap(),
                timestamp: 100 + i as i64,
            };
            reconciler.record_activity(activity).unwrap();
        }
        let key = geohash::encode(SF.0, SF.1, 5).unwrap();
        let tile = stored(&store, &key);
        assert_eq!(tile.recent_activity.len(), 3);
        assert_eq!(tile.recent_activity.iter().next().unwrap().id, "a2");
        assert_eq!(tile.active_player_count, 2);
        assert_eq!(store.activity_count().unwrap(), 3);

        assert_eq!(reconciler.prune_feed(&key, 102).unwrap(), 2);
        assert_eq!(stored(&store, &key).active_player_count, 1);
        assert_eq!(reconciler.prune_feed(&key, 102).unwrap(), 0);
    }

    /// Tile store whose conditional writes lose the race a fixed number of
    /// times.
    struct Contended {
        inner: MemoryStore,
        losses: AtomicUsize,
    }

    impl TileStore for Contended {
        fn get_tile(&self, key: &str) -> MapResult<Option<VersionedTile>> {
            self.inner.get_tile(key)
        }

        fn put_tile(&self, tile: &TileAggregate, expected: Option<u64>) -> MapResult<bool> {
            if self.losses.load(Ordering::SeqCst) > 0 {
                self.losses.fetch_sub(1, Ordering::SeqCst);
                return Ok(false);
            }
            self.inner.put_tile(tile, expected)
        }

        fn scan_tiles(&self, prefix: &str) -> MapResult<Vec<TileAggregate>> {
            self.inner.scan_tiles(prefix)
        }

        fn territory_tile(&self, territory_id: &str) -> MapResult<Option<String>> {
            self.inner.territory_tile(territory_id)
        }

        fn set_territory_tile(&self, territory_id: &str, key: Option<&str>) -> MapResult<()> {
            self.inner.set_territory_tile(territory_id, key)
        }
    }

    #[test]
    fn lost_races_retry_then_conflict() {
        let tiles = Arc::new(Contended {
            inner: MemoryStore::new(),
            losses: AtomicUsize::new(3),
        });
        let activities = Arc::new(MemoryStore::new());
        let reconciler = TileReconciler::new(
            tiles.clone(),
            activities,
            Arc::new(ManualClock::new(0)),
            IndexConfig::default(),
        );
        assert!(matches!(
            reconciler.apply("t1", territory("t1", SF, "A")).unwrap(),
            ApplyOutcome::Indexed { .. }
        ));

        tiles.losses.store(usize::MAX / 2, Ordering::SeqCst);
        let err = reconciler.apply("t2", territory("t2", SF, "A")).unwrap_err();
        assert!(matches!(err, MapError::Conflict { .. }));
        assert!(err.is_retryable());
    }

    /// Tile store whose locator reads stall, so overlapping updates to one
    /// territory both see the same previous tile unless they are serialized.
    struct SlowLocator {
        inner: MemoryStore,
    }

    impl TileStore for SlowLocator {
        fn get_tile(&self, key: &str) -> MapResult<Option<VersionedTile>> {
            self.inner.get_tile(key)
        }

        fn put_tile(&self, tile: &TileAggregate, expected: Option<u64>) -> MapResult<bool> {
            self.inner.put_tile(tile, expected)
        }

        fn scan_tiles(&self, prefix: &str) -> MapResult<Vec<TileAggregate>> {
            self.inner.scan_tiles(prefix)
        }

        fn territory_tile(&self, territory_id: &str) -> MapResult<Option<String>> {
            thread::sleep(Duration::from_millis(20));
            self.inner.territory_tile(territory_id)
        }

        fn set_territory_tile(&self, territory_id: &str, key: Option<&str>) -> MapResult<()> {
            self.inner.set_territory_tile(territory_id, key)
        }
    }

    #[test]
    fn overlapping_move_and_update_leave_one_copy() {
        let tiles = Arc::new(SlowLocator {
            inner: MemoryStore::new(),
        });
        let reconciler = Arc::new(TileReconciler::new(
            tiles.clone(),
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
            IndexConfig::default(),
        ));
        reconciler.apply("t1", territory("t1", SF, "A")).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = [OAKLAND, SF]
            .into_iter()
            .map(|at| {
                let reconciler = reconciler.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    reconciler.apply("t1", territory("t1", at, "B")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let located = tiles.territory_tile("t1").unwrap().unwrap();
        let holders: Vec<_> = tiles
            .scan_tiles("9q")
            .unwrap()
            .into_iter()
            .filter(|tile| tile.territory("t1").is_some())
            .map(|tile| tile.key)
            .collect();
        assert_eq!(holders, vec![located]);
    }
}
