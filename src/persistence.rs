use crate::error::MapResult;
use crate::model::{MapActivity, PlayerLocationHeartbeat, TileAggregate};
use crate::store::{ActivityStore, LocationStore, TileStore, VersionedTile};
use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use std::num::NonZeroUsize;
use std::path::Path;

const CF_TILES: &str = "tiles";
const CF_TERRITORY_LOCATOR: &str = "territory_locator";
const CF_LOCATIONS: &str = "locations";
const CF_INDEX_LOCATION_GEOHASH: &str = "index_location_geohash";
const CF_ACTIVITIES: &str = "activities";
const CF_INDEX_ACTIVITY_GEOHASH: &str = "index_activity_geohash";
const CF_INDEX_ACTIVITY_TIME: &str = "index_activity_time";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: [&str; 8] = [
    CF_TILES,
    CF_TERRITORY_LOCATOR,
    CF_LOCATIONS,
    CF_INDEX_LOCATION_GEOHASH,
    CF_ACTIVITIES,
    CF_INDEX_ACTIVITY_GEOHASH,
    CF_INDEX_ACTIVITY_TIME,
    CF_METADATA,
];

const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;
const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StoredTile {
    version: u64,
    tile: TileAggregate,
}

/// RocksDB-backed implementation of every store trait.
///
/// Tile writes are compare-and-put under `tile_write_lock`; heartbeat and
/// activity writes keep their secondary indexes in the same `WriteBatch` as
/// the primary record.
pub struct PersistentStore {
    db: DB,
    cache: Mutex<LruCache<String, VersionedTile>>,
    tile_write_lock: Mutex<()>,
    location_write_lock: Mutex<()>,
    activity_write_lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path)?;
        validate_or_init_manifest(&db)?;
        let capacity = NonZeroUsize::new(options.cache_capacity)
            .ok_or_else(|| anyhow!("tile cache capacity must be non-zero"))?;
        Ok(Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
            tile_write_lock: Mutex::new(()),
            location_write_lock: Mutex::new(()),
            activity_write_lock: Mutex::new(()),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("missing {name} column family"))
    }

    fn load_tile(&self, key: &str) -> Result<Option<VersionedTile>> {
        if let Some(cached) = self.cache.lock().get(key) {
            return Ok(Some(cached.clone()));
        }
        let Some(bytes) = self.db.get_cf(self.cf(CF_TILES)?, key.as_bytes())? else {
            return Ok(None);
        };
        let stored: StoredTile = bincode::deserialize(&bytes)?;
        let versioned = VersionedTile {
            tile: stored.tile,
            version: stored.version,
        };
        self.cache.lock().put(key.to_string(), versioned.clone());
        Ok(Some(versioned))
    }

    fn write_tile(&self, tile: &TileAggregate, expected: Option<u64>) -> Result<bool> {
        let _guard = self.tile_write_lock.lock();
        let current = self.load_tile(&tile.key)?.map(|stored| stored.version);
        if current != expected {
            return Ok(false);
        }
        let version = current.map_or(1, |v| v + 1);
        let bytes = bincode::serialize(&StoredTile {
            version,
            tile: tile.clone(),
        })?;
        self.db.put_cf(self.cf(CF_TILES)?, tile.key.as_bytes(), bytes)?;
        self.cache.lock().put(
            tile.key.clone(),
            VersionedTile {
                tile: tile.clone(),
                version,
            },
        );
        Ok(true)
    }

    fn scan_tile_prefix(&self, prefix: &str) -> Result<Vec<TileAggregate>> {
        let cf = self.cf(CF_TILES)?;
        let mut tiles = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, value) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let stored: StoredTile = bincode::deserialize(&value)?;
            tiles.push(stored.tile);
        }
        Ok(tiles)
    }

    fn load_heartbeat(&self, user_id: &str) -> Result<Option<PlayerLocationHeartbeat>> {
        let Some(bytes) = self.db.get_cf(self.cf(CF_LOCATIONS)?, user_id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn write_heartbeat(&self, heartbeat: &PlayerLocationHeartbeat) -> Result<()> {
        let _guard = self.location_write_lock.lock();
        let locations = self.cf(CF_LOCATIONS)?;
        let index = self.cf(CF_INDEX_LOCATION_GEOHASH)?;
        let mut batch = WriteBatch::default();
        if let Some(previous) = self.load_heartbeat(&heartbeat.user_id)? {
            batch.delete_cf(index, encode_cell_index(&previous.geohash, &previous.user_id));
        }
        batch.put_cf(
            locations,
            heartbeat.user_id.as_bytes(),
            bincode::serialize(heartbeat)?,
        );
        batch.put_cf(
            index,
            encode_cell_index(&heartbeat.geohash, &heartbeat.user_id),
            b"",
        );
        self.db.write(batch)?;
        Ok(())
    }

    fn scan_heartbeats(
        &self,
        prefix: &str,
        fresh_after: i64,
        exclude_user: &str,
    ) -> Result<Vec<PlayerLocationHeartbeat>> {
        let index = self.cf(CF_INDEX_LOCATION_GEOHASH)?;
        let mut heartbeats = Vec::new();
        for entry in self
            .db
            .iterator_cf(index, IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let Some((_, user_id)) = decode_cell_index(&key) else {
                continue;
            };
            if user_id == exclude_user {
                continue;
            }
            if let Some(heartbeat) = self.load_heartbeat(&user_id)? {
                if heartbeat.last_updated > fresh_after {
                    heartbeats.push(heartbeat);
                }
            }
        }
        Ok(heartbeats)
    }

    fn purge_heartbeats(&self, cutoff: i64, limit: usize) -> Result<usize> {
        let _guard = self.location_write_lock.lock();
        let locations = self.cf(CF_LOCATIONS)?;
        let index = self.cf(CF_INDEX_LOCATION_GEOHASH)?;
        let mut stale = Vec::new();
        for entry in self.db.iterator_cf(locations, IteratorMode::Start) {
            let (_, value) = entry?;
            let heartbeat: PlayerLocationHeartbeat = bincode::deserialize(&value)?;
            if heartbeat.last_updated < cutoff {
                stale.push(heartbeat);
            }
        }
        stale.sort_by(|a, b| {
            a.last_updated
                .cmp(&b.last_updated)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        stale.truncate(limit);
        if stale.is_empty() {
            return Ok(0);
        }
        let mut batch = WriteBatch::default();
        for heartbeat in &stale {
            batch.delete_cf(locations, heartbeat.user_id.as_bytes());
            batch.delete_cf(index, encode_cell_index(&heartbeat.geohash, &heartbeat.user_id));
        }
        self.db.write(batch)?;
        Ok(stale.len())
    }

    fn load_activity(&self, id: &str) -> Result<Option<MapActivity>> {
        let Some(bytes) = self.db.get_cf(self.cf(CF_ACTIVITIES)?, id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn write_activity(&self, activity: &MapActivity) -> Result<()> {
        let _guard = self.activity_write_lock.lock();
        let activities = self.cf(CF_ACTIVITIES)?;
        let by_cell = self.cf(CF_INDEX_ACTIVITY_GEOHASH)?;
        let by_time = self.cf(CF_INDEX_ACTIVITY_TIME)?;
        let mut batch = WriteBatch::default();
        if let Some(previous) = self.load_activity(&activity.id)? {
            batch.delete_cf(by_cell, encode_cell_index(&previous.geohash, &previous.id));
            batch.delete_cf(by_time, encode_time_index(previous.timestamp, &previous.id));
        }
        batch.put_cf(activities, activity.id.as_bytes(), bincode::serialize(activity)?);
        batch.put_cf(by_cell, encode_cell_index(&activity.geohash, &activity.id), b"");
        batch.put_cf(by_time, encode_time_index(activity.timestamp, &activity.id), b"");
        self.db.write(batch)?;
        Ok(())
    }

    fn scan_activities(&self, prefix: &str) -> Result<Vec<MapActivity>> {
        let by_cell = self.cf(CF_INDEX_ACTIVITY_GEOHASH)?;
        let mut activities = Vec::new();
        for entry in self
            .db
            .iterator_cf(by_cell, IteratorMode::From(prefix.as_bytes(), Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let Some((_, id)) = decode_cell_index(&key) else {
                continue;
            };
            if let Some(activity) = self.load_activity(&id)? {
                activities.push(activity);
            }
        }
        Ok(activities)
    }

    fn expired_activities(&self, cutoff: i64, limit: usize) -> Result<Vec<MapActivity>> {
        let by_time = self.cf(CF_INDEX_ACTIVITY_TIME)?;
        let mut expired = Vec::new();
        for entry in self.db.iterator_cf(by_time, IteratorMode::Start) {
            if expired.len() >= limit {
                break;
            }
            let (key, _) = entry?;
            let Some((timestamp, id)) = decode_time_index(&key) else {
                continue;
            };
            if timestamp >= cutoff {
                break;
            }
            if let Some(activity) = self.load_activity(&id)? {
                expired.push(activity);
            }
        }
        Ok(expired)
    }

    fn purge_activities(&self, targets: &[MapActivity]) -> Result<usize> {
        let _guard = self.activity_write_lock.lock();
        let activities = self.cf(CF_ACTIVITIES)?;
        let by_cell = self.cf(CF_INDEX_ACTIVITY_GEOHASH)?;
        let by_time = self.cf(CF_INDEX_ACTIVITY_TIME)?;
        let mut batch = WriteBatch::default();
        let mut deleted = 0;
        for target in targets {
            let Some(stored) = self.load_activity(&target.id)? else {
                continue;
            };
            batch.delete_cf(activities, stored.id.as_bytes());
            batch.delete_cf(by_cell, encode_cell_index(&stored.geohash, &stored.id));
            batch.delete_cf(by_time, encode_time_index(stored.timestamp, &stored.id));
            deleted += 1;
        }
        if deleted > 0 {
            self.db.write(batch)?;
        }
        Ok(deleted)
    }

    fn count_entries(&self, name: &str) -> Result<usize> {
        let mut count = 0;
        for entry in self.db.iterator_cf(self.cf(name)?, IteratorMode::Start) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

impl TileStore for PersistentStore {
    fn get_tile(&self, key: &str) -> MapResult<Option<VersionedTile>> {
        Ok(self.load_tile(key)?)
    }

    fn put_tile(&self, tile: &TileAggregate, expected: Option<u64>) -> MapResult<bool> {
        Ok(self.write_tile(tile, expected)?)
    }

    fn scan_tiles(&self, prefix: &str) -> MapResult<Vec<TileAggregate>> {
        Ok(self.scan_tile_prefix(prefix)?)
    }

    fn territory_tile(&self, territory_id: &str) -> MapResult<Option<String>> {
        let cf = self.cf(CF_TERRITORY_LOCATOR)?;
        let value = self
            .db
            .get_cf(cf, territory_id.as_bytes())
            .map_err(anyhow::Error::from)?;
        Ok(value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn set_territory_tile(&self, territory_id: &str, key: Option<&str>) -> MapResult<()> {
        let cf = self.cf(CF_TERRITORY_LOCATOR)?;
        let result = match key {
            Some(key) => self.db.put_cf(cf, territory_id.as_bytes(), key.as_bytes()),
            None => self.db.delete_cf(cf, territory_id.as_bytes()),
        };
        result.map_err(anyhow::Error::from)?;
        Ok(())
    }
}

impl LocationStore for PersistentStore {
    fn upsert_heartbeat(&self, heartbeat: &PlayerLocationHeartbeat) -> MapResult<()> {
        Ok(self.write_heartbeat(heartbeat)?)
    }

    fn heartbeat(&self, user_id: &str) -> MapResult<Option<PlayerLocationHeartbeat>> {
        Ok(self.load_heartbeat(user_id)?)
    }

    fn heartbeats_in_cell(
        &self,
        prefix: &str,
        fresh_after: i64,
        exclude_user: &str,
    ) -> MapResult<Vec<PlayerLocationHeartbeat>> {
        Ok(self.scan_heartbeats(prefix, fresh_after, exclude_user)?)
    }

    fn delete_heartbeats_before(&self, cutoff: i64, limit: usize) -> MapResult<usize> {
        Ok(self.purge_heartbeats(cutoff, limit)?)
    }

    fn heartbeat_count(&self) -> MapResult<usize> {
        Ok(self.count_entries(CF_LOCATIONS)?)
    }
}

impl ActivityStore for PersistentStore {
    fn append_activity(&self, activity: &MapActivity) -> MapResult<()> {
        Ok(self.write_activity(activity)?)
    }

    fn activities_in_cell(&self, prefix: &str) -> MapResult<Vec<MapActivity>> {
        Ok(self.scan_activities(prefix)?)
    }

    fn activities_before(&self, cutoff: i64, limit: usize) -> MapResult<Vec<MapActivity>> {
        Ok(self.expired_activities(cutoff, limit)?)
    }

    fn delete_activities(&self, activities: &[MapActivity]) -> MapResult<usize> {
        Ok(self.purge_activities(activities)?)
    }

    fn activity_count(&self) -> MapResult<usize> {
        Ok(self.count_entries(CF_ACTIVITIES)?)
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: impl AsRef<Path>) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = COLUMN_FAMILIES
        .iter()
        .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
        .collect::<Vec<_>>();
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

/// `geohash \0 id`; the geohash leads so prefix scans select a cell.
fn encode_cell_index(geohash: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(geohash.len() + 1 + id.len());
    key.extend_from_slice(geohash.as_bytes());
    key.push(0);
    key.extend_from_slice(id.as_bytes());
    key
}

fn decode_cell_index(key: &[u8]) -> Option<(String, String)> {
    let split = key.iter().position(|b| *b == 0)?;
    let geohash = std::str::from_utf8(&key[..split]).ok()?;
    let id = std::str::from_utf8(&key[split + 1..]).ok()?;
    Some((geohash.to_string(), id.to_string()))
}

/// Sign-flipped big-endian timestamp followed by the id, so byte order is
/// chronological order.
fn encode_time_index(timestamp: i64, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + id.len());
    key.extend_from_slice(&((timestamp as u64) ^ (1 << 63)).to_be_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn decode_time_index(key: &[u8]) -> Option<(i64, String)> {
    if key.len() < 8 {
        return None;
    }
    let raw = u64::from_be_bytes(key[..8].try_into().ok()?);
    let id = std::str::from_utf8(&key[8..]).ok()?;
    Some(((raw ^ (1 << 63)) as i64, id.to_string()))
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActivityKind, TerritorySnapshot};
    use tempfile::tempdir;

    fn activity(id: &str, at: i64) -> MapActivity {
        MapActivity {
            id: id.to_string(),
            kind: ActivityKind::Claim,
            actor_name: "ann".to_string(),
            description: "claimed".to_string(),
            latitude: 37.7749,
            longitude: -122.4194,
            geohash: "9q8yyk8yuv00".to_string(),
            timestamp: at,
        }
    }

    #[test]
    fn tiles_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path();

        let store = PersistentStore::open(path).unwrap();
        let mut tile = TileAggregate::empty("9q8yy", 10).unwrap();
        tile.upsert_territory(TerritorySnapshot::new("t1", 37.7749, -122.4194));
        tile.refresh(5);
        assert!(store.put_tile(&tile, None).unwrap());
        store.set_territory_tile("t1", Some("9q8yy")).unwrap();
        drop(store);

        let store = PersistentStore::open(path).unwrap();
        let loaded = store.get_tile("9q8yy").unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.tile, tile);
        assert_eq!(store.territory_tile("t1").unwrap().as_deref(), Some("9q8yy"));
        assert!(!store.put_tile(&tile, None).unwrap());
        assert!(store.put_tile(&tile, Some(1)).unwrap());
    }

    #[test]
    fn prefix_scan_stops_at_boundary() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        for key in ["9q8yy", "9q8yz", "9q8z0", "9q900"] {
            store
                .put_tile(&TileAggregate::empty(key, 10).unwrap(), None)
                .unwrap();
        }
        let keys: Vec<_> = store
            .scan_tiles("9q8y")
            .unwrap()
            .into_iter()
            .map(|t| t.key)
            .collect();
        assert_eq!(keys, vec!["9q8yy", "9q8yz"]);
    }

    #[test]
    fn heartbeat_index_follows_moves() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        let mut heartbeat = PlayerLocationHeartbeat {
            user_id: "u1".to_string(),
            latitude: 37.7749,
            longitude: -122.4194,
            geohash: "9q8yyk".to_string(),
            last_updated: 10,
        };
        store.upsert_heartbeat(&heartbeat).unwrap();
        heartbeat.geohash = "9q8yym".to_string();
        heartbeat.last_updated = 20;
        store.upsert_heartbeat(&heartbeat).unwrap();

        assert_eq!(store.heartbeat_count().unwrap(), 1);
        assert!(store.heartbeats_in_cell("9q8yyk", 0, "").unwrap().is_empty());
        assert_eq!(store.heartbeats_in_cell("9q8yy", 0, "").unwrap().len(), 1);
        assert!(store.heartbeats_in_cell("9q8yy", 0, "u1").unwrap().is_empty());
        assert_eq!(store.delete_heartbeats_before(21, 10).unwrap(), 1);
        assert_eq!(store.heartbeat_count().unwrap(), 0);
    }

    #[test]
    fn activity_time_index_deletes_oldest_first() {
        let dir = tempdir().unwrap();
        let store = PersistentStore::open(dir.path()).unwrap();
        for (id, at) in [("a", 300), ("b", 100), ("c", 200), ("d", 400)] {
            store.append_activity(&activity(id, at)).unwrap();
        }
        let expired = store.activities_before(350, 2).unwrap();
        let ids: Vec<_> = expired.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(store.delete_activities(&expired).unwrap(), 2);
        assert_eq!(store.activity_count().unwrap(), 2);
        assert_eq!(store.activities_in_cell("9q8yy").unwrap().len(), 2);
        let expired = store.activities_before(350, 2).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(store.delete_activities(&expired).unwrap(), 1);
        assert!(store.activities_before(350, 2).unwrap().is_empty());
    }

    #[test]
    fn time_index_orders_negative_timestamps() {
        let early = encode_time_index(-5, "x");
        let late = encode_time_index(5, "x");
        assert!(early < late);
        assert_eq!(decode_time_index(&early), Some((-5, "x".to_string())));
    }
}
