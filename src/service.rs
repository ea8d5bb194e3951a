//! # Map Service
//!
//! The request-style operations exposed to game clients and to the internal
//! gameplay pipeline. Requests are validated and defaulted here, identity is
//! checked before any store access, and the blocking index work runs on the
//! tokio blocking pool under a per-request deadline.

use crate::clock::Clock;
use crate::config::{
    GeoTileConfig, ACTIVITY_GEOHASH_PRECISION, DEFAULT_ACTIVITY_LIMIT,
    DEFAULT_ACTIVITY_RADIUS_METERS, DEFAULT_AREA_LIMIT, DEFAULT_MAP_TILE_PRECISION,
    DEFAULT_NEARBY_LIMIT, DEFAULT_NEARBY_RADIUS_METERS, MAX_RESULT_LIMIT,
};
use crate::error::{MapError, MapResult};
use crate::geo::{validate_coordinates, validate_radius};
use crate::geohash::{self, CellBounds};
use crate::model::{
    ActivityKind, ActivityType, HeatmapLayer, HeatmapPoint, MapActivity, NearbyPlayer,
    TerritoryPatch, TerritorySnapshot, TileAggregate, TileFilters,
};
use crate::proximity::{ProfileDirectory, ProximityFinder};
use crate::query::SpatialQueryEngine;
use crate::reconciler::{ApplyOutcome, TileReconciler};
use crate::retention::{ActivityRetention, RetentionReport};
use crate::store::{ActivityStore, LocationStore, MapStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapTilesRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub precision: Option<usize>,
    pub filters: TileFilters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapTilesResponse {
    pub tiles: Vec<TileAggregate>,
    pub center_key: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AreaRequest {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TerritoriesResponse {
    pub territories: Vec<TerritorySnapshot>,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RadiusRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_meters: Option<f64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NearbyPlayersResponse {
    pub players: Vec<NearbyPlayer>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecentActivityResponse {
    pub activities: Vec<MapActivity>,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatmapRequest {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
    pub layer: HeatmapLayer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeatmapResponse {
    pub points: Vec<HeatmapPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordActivityRequest {
    /// Generated when absent. Re-recording an id is idempotent.
    pub id: Option<String>,
    pub activity_type: ActivityType,
    pub actor_name: String,
    pub target_name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub description: String,
    /// Defaults to now.
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordActivityResponse {
    pub activity_id: String,
    pub tile_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub activity_count: usize,
    pub heartbeat_count: usize,
}

struct Components {
    reconciler: Arc<TileReconciler>,
    queries: SpatialQueryEngine,
    proximity: ProximityFinder,
    retention: ActivityRetention,
    activities: Arc<dyn ActivityStore>,
    locations: Arc<dyn LocationStore>,
    clock: Arc<dyn Clock>,
}

/// Cheap to clone; every clone shares the same components.
#[derive(Clone)]
pub struct MapService {
    components: Arc<Components>,
    timeout: Duration,
}

impl MapService {
    pub fn new<S: MapStore + 'static>(
        store: Arc<S>,
        profiles: Arc<dyn ProfileDirectory>,
        clock: Arc<dyn Clock>,
        config: &GeoTileConfig,
    ) -> Self {
        let reconciler = Arc::new(TileReconciler::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            config.index.clone(),
        ));
        let components = Components {
            queries: SpatialQueryEngine::new(store.clone(), store.clone(), config.index.clone()),
            proximity: ProximityFinder::new(
                store.clone(),
                profiles,
                clock.clone(),
                config.proximity.clone(),
            ),
            retention: ActivityRetention::new(
                store.clone(),
                store.clone(),
                reconciler.clone(),
                clock.clone(),
                config.retention.clone(),
            ),
            reconciler,
            activities: store.clone(),
            locations: store,
            clock,
        };
        Self {
            components: Arc::new(components),
            timeout: config.storage.timeout(),
        }
    }

    pub async fn get_map_tiles(&self, request: MapTilesRequest) -> MapResult<MapTilesResponse> {
        validate_coordinates(request.latitude, request.longitude)?;
        let precision = request.precision.unwrap_or(DEFAULT_MAP_TILE_PRECISION);
        geohash::validate_precision(precision)?;
        request.filters.validate()?;

        self.run("get_map_tiles", move |c| {
            let near = c.queries.tiles_near(
                request.latitude,
                request.longitude,
                precision,
                &request.filters,
            )?;
            Ok(MapTilesResponse {
                tiles: near.tiles,
                center_key: near.center_key,
                timestamp: c.clock.now_millis(),
            })
        })
        .await
    }

    pub async fn get_territories_in_area(
        &self,
        request: AreaRequest,
    ) -> MapResult<TerritoriesResponse> {
        let bounds = CellBounds::new(request.north, request.south, request.east, request.west)?;
        let limit = resolve_limit(request.limit, DEFAULT_AREA_LIMIT)?;

        self.run("get_territories_in_area", move |c| {
            let territories = c.queries.territories_in_box(&bounds, limit)?;
            Ok(TerritoriesResponse {
                count: territories.len(),
                territories,
            })
        })
        .await
    }

    /// Requires a caller identity; the caller's heartbeat is refreshed as a
    /// side effect.
    pub async fn get_nearby_players(
        &self,
        caller: Option<String>,
        request: RadiusRequest,
    ) -> MapResult<NearbyPlayersResponse> {
        let user_id = caller
            .filter(|id| !id.trim().is_empty())
            .ok_or(MapError::Unauthenticated)?;
        validate_coordinates(request.latitude, request.longitude)?;
        let radius = request.radius_meters.unwrap_or(DEFAULT_NEARBY_RADIUS_METERS);
        validate_radius(radius)?;
        let limit = resolve_limit(request.limit, DEFAULT_NEARBY_LIMIT)?;

        self.run("get_nearby_players", move |c| {
            let players = c.proximity.query(
                &user_id,
                request.latitude,
                request.longitude,
                radius,
                limit,
            )?;
            Ok(NearbyPlayersResponse {
                count: players.len(),
                players,
            })
        })
        .await
    }

    pub async fn get_recent_activity(
        &self,
        request: RadiusRequest,
    ) -> MapResult<RecentActivityResponse> {
        validate_coordinates(request.latitude, request.longitude)?;
        let radius = request
            .radius_meters
            .unwrap_or(DEFAULT_ACTIVITY_RADIUS_METERS);
        validate_radius(radius)?;
        let limit = resolve_limit(request.limit, DEFAULT_ACTIVITY_LIMIT)?;

        self.run("get_recent_activity", move |c| {
            let activities =
                c.queries
                    .recent_activity(request.latitude, request.longitude, radius, limit)?;
            Ok(RecentActivityResponse {
                count: activities.len(),
                activities,
            })
        })
        .await
    }

    pub async fn get_heatmap_data(&self, request: HeatmapRequest) -> MapResult<HeatmapResponse> {
        let bounds = CellBounds::new(request.north, request.south, request.east, request.west)?;
        self.run("get_heatmap_data", move |c| {
            Ok(HeatmapResponse {
                points: c.queries.heatmap(&bounds, request.layer)?,
            })
        })
        .await
    }

    pub async fn record_map_activity(
        &self,
        request: RecordActivityRequest,
    ) -> MapResult<RecordActivityResponse> {
        if request.actor_name.trim().is_empty() {
            return Err(MapError::invalid("actor name is required"));
        }
        validate_coordinates(request.latitude, request.longitude)?;
        let kind = ActivityKind::from_parts(
            request.activity_type,
            &request.actor_name,
            request.target_name,
            &request.description,
        )?;
        let id = match request.id {
            Some(id) if id.trim().is_empty() => {
                return Err(MapError::invalid("activity id must not be blank"))
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };
        let geohash = geohash::encode(
            request.latitude,
            request.longitude,
            ACTIVITY_GEOHASH_PRECISION,
        )?;

        self.run("record_map_activity", move |c| {
            let activity = MapActivity {
                id,
                kind,
                actor_name: request.actor_name,
                description: request.description,
                latitude: request.latitude,
                longitude: request.longitude,
                geohash,
                timestamp: request.timestamp.unwrap_or_else(|| c.clock.now_millis()),
            };
            let activity_id = activity.id.clone();
            let tile_key = c.reconciler.record_activity(activity)?;
            debug!(%activity_id, %tile_key, "activity recorded");
            Ok(RecordActivityResponse {
                activity_id,
                tile_key,
            })
        })
        .await
    }

    pub async fn update_map_tile(
        &self,
        territory_id: String,
        patch: TerritoryPatch,
    ) -> MapResult<ApplyOutcome> {
        if territory_id.trim().is_empty() {
            return Err(MapError::invalid("territory id is required"));
        }
        self.run("update_map_tile", move |c| {
            c.reconciler.apply_patch(&territory_id, patch)
        })
        .await
    }

    pub async fn remove_territory(&self, territory_id: String) -> MapResult<bool> {
        if territory_id.trim().is_empty() {
            return Err(MapError::invalid("territory id is required"));
        }
        self.run("remove_territory", move |c| c.reconciler.remove(&territory_id))
            .await
    }

    /// One bounded retention sweep.
    pub async fn run_retention(&self) -> MapResult<RetentionReport> {
        self.run("run_retention", |c| c.retention.run_once()).await
    }

    pub async fn health(&self) -> MapResult<HealthReport> {
        self.run("health", |c| {
            Ok(HealthReport {
                activity_count: c.activities.activity_count()?,
                heartbeat_count: c.locations.heartbeat_count()?,
            })
        })
        .await
    }

    async fn run<T, F>(&self, operation: &'static str, work: F) -> MapResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Components) -> MapResult<T> + Send + 'static,
    {
        let components = self.components.clone();
        let task = tokio::task::spawn_blocking(move || work(&components));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(MapError::Store {
                message: format!("{operation} worker failed: {err}"),
                retryable: false,
            }),
            Err(_) => Err(MapError::Timeout(operation.to_string())),
        }
    }
}

fn resolve_limit(limit: Option<usize>, default: usize) -> MapResult<usize> {
    match limit {
        None => Ok(default),
        Some(0) => Err(MapError::invalid("limit must be positive")),
        Some(limit) => Ok(limit.min(MAX_RESULT_LIMIT)),
    }
}
