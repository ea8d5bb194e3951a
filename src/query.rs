//! # Spatial Queries
//!
//! Read paths over the tile index. Every query resolves a small set of geohash
//! cells, fans out one store read per cell in parallel and applies an exact
//! geometric filter afterwards. A cell whose read fails is logged and treated
//! as empty so one bad cell never fails the whole query.

use crate::config::IndexConfig;
use crate::error::{MapError, MapResult};
use crate::geo::{haversine_meters, validate_coordinates, validate_radius, GeoPoint};
use crate::geohash::{self, CellBounds};
use crate::model::{
    HeatmapLayer, HeatmapPoint, MapActivity, TerritorySnapshot, TileAggregate, TileFilters,
};
use crate::neighbors::{covering_keys, neighbors};
use crate::store::{ActivityStore, TileStore};
use hashbrown::HashSet;
use rayon::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// Tiles around a point, self first.
#[derive(Debug, Clone, PartialEq)]
pub struct TilesNear {
    pub center_key: String,
    pub tiles: Vec<TileAggregate>,
}

pub struct SpatialQueryEngine {
    tiles: Arc<dyn TileStore>,
    activities: Arc<dyn ActivityStore>,
    config: IndexConfig,
}

impl SpatialQueryEngine {
    pub fn new(
        tiles: Arc<dyn TileStore>,
        activities: Arc<dyn ActivityStore>,
        config: IndexConfig,
    ) -> Self {
        Self {
            tiles,
            activities,
            config,
        }
    }

    /// The cell containing the point plus its neighbors at `precision`.
    /// Missing cells come back as well-formed empty tiles.
    pub fn tiles_near(
        &self,
        latitude: f64,
        longitude: f64,
        precision: usize,
        filters: &TileFilters,
    ) -> MapResult<TilesNear> {
        validate_coordinates(latitude, longitude)?;
        geohash::validate_precision(precision)?;
        filters.validate()?;

        let center_key = geohash::encode(latitude, longitude, precision)?;
        let keys = neighbors(&center_key)?;
        let tiles = keys
            .par_iter()
            .map(|key| self.load_cell(key))
            .collect::<MapResult<Vec<_>>>()?;
        let tiles = tiles.iter().map(|tile| tile.filtered(filters)).collect();
        debug!(%center_key, cells = keys.len(), "resolved map tiles");
        Ok(TilesNear { center_key, tiles })
    }

    /// Territories whose coordinates fall inside `bounds`, at most `limit`.
    pub fn territories_in_box(
        &self,
        bounds: &CellBounds,
        limit: usize,
    ) -> MapResult<Vec<TerritorySnapshot>> {
        let tiles = self.covering_tiles(bounds)?;
        let mut seen = HashSet::new();
        let territories = tiles
            .into_iter()
            .flat_map(|tile| tile.territories)
            .filter(|t| bounds.contains(t.latitude, t.longitude))
            .filter(|t| seen.insert(t.id.clone()))
            .take(limit)
            .collect();
        Ok(territories)
    }

    /// Activities within `radius_meters` of the point, newest first.
    pub fn recent_activity(
        &self,
        latitude: f64,
        longitude: f64,
        radius_meters: f64,
        limit: usize,
    ) -> MapResult<Vec<MapActivity>> {
        validate_coordinates(latitude, longitude)?;
        validate_radius(radius_meters)?;

        let origin = GeoPoint::new(latitude, longitude);
        let precision =
            geohash::precision_for_radius(radius_meters, latitude, self.config.tile_precision)?;
        let center_key = geohash::encode(latitude, longitude, precision)?;
        let keys = neighbors(&center_key)?;
        let batches: Vec<Vec<MapActivity>> = keys
            .par_iter()
            .map(|key| match self.activities.activities_in_cell(key) {
                Ok(found) => found,
                Err(err) => {
                    warn!(key = %key, error = %err, "activity lookup failed, treating cell as empty");
                    Vec::new()
                }
            })
            .collect();

        let mut seen = HashSet::new();
        let mut activities: Vec<MapActivity> = batches
            .into_iter()
            .flatten()
            .filter(|a| haversine_meters(&origin, &a.location()) <= radius_meters)
            .filter(|a| seen.insert(a.id.clone()))
            .collect();
        activities.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        activities.truncate(limit);
        Ok(activities)
    }

    /// One point per non-empty tile whose center lies in `bounds`, intensity
    /// relative to the hottest tile.
    pub fn heatmap(&self, bounds: &CellBounds, layer: HeatmapLayer) -> MapResult<Vec<HeatmapPoint>> {
        let tiles = self.covering_tiles(bounds)?;
        let values: Vec<(GeoPoint, usize)> = tiles
            .iter()
            .filter(|tile| bounds.contains(tile.center.latitude, tile.center.longitude))
            .map(|tile| (tile.center, layer.value(tile)))
            .filter(|(_, value)| *value > 0)
            .collect();
        let Some(max) = values.iter().map(|(_, value)| *value).max() else {
            return Ok(Vec::new());
        };
        Ok(values
            .into_iter()
            .map(|(center, value)| HeatmapPoint {
                latitude: center.latitude,
                longitude: center.longitude,
                intensity: value as f64 / max as f64,
            })
            .collect())
    }

    /// Stored tiles under the coarse cells covering `bounds`, in key order per
    /// covering cell.
    fn covering_tiles(&self, bounds: &CellBounds) -> MapResult<Vec<TileAggregate>> {
        let precision = self.config.covering_precision;
        let (max_width, max_height) = geohash::cell_dimensions_degrees(precision);
        if bounds.width_degrees() > max_width || bounds.height_degrees() > max_height {
            return Err(MapError::invalid(format!(
                "box of {:.4}x{:.4} degrees exceeds the {:.4}x{:.4} degree query limit",
                bounds.width_degrees(),
                bounds.height_degrees(),
                max_width,
                max_height
            )));
        }
        let keys = covering_keys(bounds, precision)?;
        let batches: Vec<Vec<TileAggregate>> = keys
            .par_iter()
            .map(|key| match self.tiles.scan_tiles(key) {
                Ok(found) => found,
                Err(err) => {
                    warn!(key = %key, error = %err, "tile scan failed, treating cell as empty");
                    Vec::new()
                }
            })
            .collect();
        Ok(batches.into_iter().flatten().collect())
    }

    fn load_cell(&self, key: &str) -> MapResult<TileAggregate> {
        match self.read_cell(key) {
            Ok(tile) => Ok(tile),
            Err(err) => {
                warn!(key, error = %err, "tile read failed, treating cell as empty");
                TileAggregate::empty(key, self.config.activity_feed_capacity)
            }
        }
    }

    /// Tile for `key` at any precision: stored tiles are read directly,
    /// coarser cells merge the tiles beneath them and finer cells restrict
    /// their parent tile.
    fn read_cell(&self, key: &str) -> MapResult<TileAggregate> {
        let capacity = self.config.activity_feed_capacity;
        let tile_precision = self.config.tile_precision;
        let precision = key.len();

        if precision == tile_precision {
            return match self.tiles.get_tile(key)? {
                Some(stored) => Ok(stored.tile),
                None => TileAggregate::empty(key, capacity),
            };
        }

        if precision < tile_precision {
            let stored = self.tiles.scan_tiles(key)?;
            let last_updated = stored.iter().map(|t| t.last_updated).max().unwrap_or(0);
            let mut territories = Vec::new();
            let mut activities = Vec::new();
            for tile in stored {
                territories.extend(tile.territories);
                activities.extend(tile.recent_activity.iter().cloned());
            }
            return TileAggregate::from_parts(key, territories, activities, capacity, last_updated);
        }

        let Some(parent) = self.tiles.get_tile(&key[..tile_precision])? else {
            return TileAggregate::empty(key, capacity);
        };
        let parent = parent.tile;
        let territories = parent
            .territories
            .iter()
            .filter(|t| {
                geohash::encode(t.latitude, t.longitude, precision)
                    .map(|encoded| encoded == key)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let activities = parent
            .recent_activity
            .iter()
            .filter(|a| a.geohash.starts_with(key))
            .cloned()
            .collect::<Vec<_>>();
        TileAggregate::from_parts(key, territories, activities, capacity, parent.last_updated)
    }
}
