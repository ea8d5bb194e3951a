//! # gRPC Server Implementation
//!
//! Exposes [`MapService`] as `geotile.v1.MapService`.

use crate::error::MapError;
use crate::geohash::CellBounds;
use crate::model::{
    ActivityType, AllianceRef, HeatmapLayer, MapActivity, NearbyPlayer, TerritoryPatch,
    TerritorySnapshot, TileAggregate, TileFilters,
};
use crate::reconciler::ApplyOutcome;
use crate::service::{
    AreaRequest, HeatmapRequest, MapService, MapTilesRequest, RadiusRequest, RecordActivityRequest,
};
use tonic::{Request, Response, Status};

// Include the generated gRPC code
pub mod proto {
    tonic::include_proto!("geotile.v1");
}

use proto::map_service_server::{MapService as MapServiceRpc, MapServiceServer};

/// Metadata key carrying the authenticated caller, set by the gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

/// gRPC service implementation
#[derive(Clone)]
pub struct MapGrpcService {
    service: MapService,
}

impl MapGrpcService {
    pub fn new(service: MapService) -> Self {
        Self { service }
    }

    pub fn into_server(self) -> MapServiceServer<Self> {
        MapServiceServer::new(self)
    }
}

pub fn status_from(err: MapError) -> Status {
    let message = err.to_string();
    match err {
        MapError::InvalidArgument(_) => Status::invalid_argument(message),
        MapError::Unauthenticated => Status::unauthenticated(message),
        MapError::Timeout(_) => Status::deadline_exceeded(message),
        MapError::Conflict { .. } => Status::aborted(message),
        MapError::Store {
            retryable: true, ..
        } => Status::unavailable(message),
        MapError::Store { .. } => Status::internal(message),
    }
}

fn caller_identity<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn non_zero_limit(limit: u32) -> Option<usize> {
    (limit > 0).then_some(limit as usize)
}

fn non_zero_radius(radius: f64) -> Option<f64> {
    (radius != 0.0).then_some(radius)
}

fn required_bounds(bounds: Option<proto::Bounds>) -> Result<proto::Bounds, Status> {
    bounds.ok_or_else(|| Status::invalid_argument("bounds are required"))
}

fn bounds_to_proto(bounds: &CellBounds) -> proto::Bounds {
    proto::Bounds {
        north: bounds.north,
        south: bounds.south,
        east: bounds.east,
        west: bounds.west,
    }
}

fn territory_to_proto(territory: TerritorySnapshot) -> proto::Territory {
    proto::Territory {
        id: territory.id,
        latitude: territory.latitude,
        longitude: territory.longitude,
        owner_id: territory.owner_id,
        owner_name: territory.owner_name,
        alliance_id: territory.alliance_id,
        alliance_name: territory.alliance_name,
        alliance_tag: territory.alliance_tag,
        level: territory.level,
        structure_type: territory.structure_type,
        is_contested: territory.is_contested,
        is_shielded: territory.is_shielded,
        defense_rating: territory.defense_rating,
        total_blocks: territory.total_blocks,
    }
}

fn activity_type_to_proto(activity_type: ActivityType) -> proto::ActivityType {
    match activity_type {
        ActivityType::Conquest => proto::ActivityType::Conquest,
        ActivityType::Defense => proto::ActivityType::Defense,
        ActivityType::Claim => proto::ActivityType::Claim,
        ActivityType::Attack => proto::ActivityType::Attack,
        ActivityType::WorldEvent => proto::ActivityType::WorldEvent,
        ActivityType::AllianceWar => proto::ActivityType::AllianceWar,
    }
}

fn activity_type_from_proto(value: i32) -> Result<ActivityType, Status> {
    match proto::ActivityType::try_from(value) {
        Ok(proto::ActivityType::Conquest) => Ok(ActivityType::Conquest),
        Ok(proto::ActivityType::Defense) => Ok(ActivityType::Defense),
        Ok(proto::ActivityType::Claim) => Ok(ActivityType::Claim),
        Ok(proto::ActivityType::Attack) => Ok(ActivityType::Attack),
        Ok(proto::ActivityType::WorldEvent) => Ok(ActivityType::WorldEvent),
        Ok(proto::ActivityType::AllianceWar) => Ok(ActivityType::AllianceWar),
        Ok(proto::ActivityType::Unspecified) | Err(_) => {
            Err(Status::invalid_argument("activity kind is required"))
        }
    }
}

fn layer_from_proto(value: i32) -> Result<HeatmapLayer, Status> {
    match proto::HeatmapLayer::try_from(value) {
        Ok(proto::HeatmapLayer::Unspecified | proto::HeatmapLayer::Territories) => {
            Ok(HeatmapLayer::Territories)
        }
        Ok(proto::HeatmapLayer::Activity) => Ok(HeatmapLayer::Activity),
        Ok(proto::HeatmapLayer::Contested) => Ok(HeatmapLayer::Contested),
        Err(_) => Err(Status::invalid_argument(format!(
            "unknown heatmap layer {value}"
        ))),
    }
}

fn activity_to_proto(activity: MapActivity) -> proto::Activity {
    proto::Activity {
        kind: activity_type_to_proto(activity.kind.activity_type()) as i32,
        target_name: activity.kind.target_name().map(str::to_string),
        id: activity.id,
        actor_name: activity.actor_name,
        description: activity.description,
        latitude: activity.latitude,
        longitude: activity.longitude,
        geohash: activity.geohash,
        timestamp: activity.timestamp,
    }
}

fn tile_to_proto(tile: TileAggregate) -> proto::Tile {
    proto::Tile {
        bounds: Some(bounds_to_proto(&tile.bounds)),
        center_latitude: tile.center.latitude,
        center_longitude: tile.center.longitude,
        total_territories: tile.total_territories as u64,
        recent_activity: tile
            .recent_activity
            .iter()
            .cloned()
            .map(activity_to_proto)
            .collect(),
        active_player_count: tile.active_player_count as u64,
        dominant_alliance: tile
            .dominant_alliance
            .map(|dominant| proto::DominantAlliance {
                id: dominant.id,
                name: dominant.name,
                tag: dominant.tag,
                territory_count: dominant.territory_count as u64,
            }),
        last_updated: tile.last_updated,
        territories: tile.territories.into_iter().map(territory_to_proto).collect(),
        key: tile.key,
    }
}

fn player_to_proto(player: NearbyPlayer) -> proto::NearbyPlayer {
    proto::NearbyPlayer {
        user_id: player.user_id,
        display_name: player.display_name,
        alliance_id: player.alliance_id,
        latitude: player.latitude,
        longitude: player.longitude,
        distance_meters: player.distance_meters,
        is_online: player.is_online,
        last_seen: player.last_seen,
    }
}

fn filters_from_proto(filters: Option<proto::Filters>) -> TileFilters {
    let Some(filters) = filters else {
        return TileFilters::default();
    };
    TileFilters {
        show_contested: filters.show_contested.unwrap_or(true),
        show_shielded: filters.show_shielded.unwrap_or(true),
        alliance_filter: filters.alliance_filter.filter(|id| !id.is_empty()),
        min_level: filters.min_level,
        max_level: filters.max_level,
    }
}

fn patch_from_proto(patch: proto::TerritoryPatch) -> TerritoryPatch {
    let alliance = if patch.clear_alliance {
        Some(None)
    } else {
        patch.alliance_id.map(|id| {
            Some(AllianceRef::new(
                id,
                patch.alliance_name.unwrap_or_default(),
                patch.alliance_tag.unwrap_or_default(),
            ))
        })
    };
    TerritoryPatch {
        latitude: patch.latitude,
        longitude: patch.longitude,
        owner_id: patch.owner_id,
        owner_name: patch.owner_name,
        alliance,
        level: patch.level,
        structure_type: patch.structure_type,
        is_contested: patch.is_contested,
        is_shielded: patch.is_shielded,
        defense_rating: patch.defense_rating,
        total_blocks: patch.total_blocks,
    }
}

#[tonic::async_trait]
impl MapServiceRpc for MapGrpcService {
    async fn get_map_tiles(
        &self,
        request: Request<proto::GetMapTilesRequest>,
    ) -> Result<Response<proto::GetMapTilesResponse>, Status> {
        let req = request.into_inner();
        let response = self
            .service
            .get_map_tiles(MapTilesRequest {
                latitude: req.latitude,
                longitude: req.longitude,
                precision: (req.precision > 0).then_some(req.precision as usize),
                filters: filters_from_proto(req.filters),
            })
            .await
            .map_err(status_from)?;
        Ok(Response::new(proto::GetMapTilesResponse {
            tiles: response.tiles.into_iter().map(tile_to_proto).collect(),
            center_key: response.center_key,
            timestamp: response.timestamp,
        }))
    }

    async fn get_territories_in_area(
        &self,
        request: Request<proto::GetTerritoriesInAreaRequest>,
    ) -> Result<Response<proto::GetTerritoriesInAreaResponse>, Status> {
        let req = request.into_inner();
        let bounds = required_bounds(req.bounds)?;
        let response = self
            .service
            .get_territories_in_area(AreaRequest {
                north: bounds.north,
                south: bounds.south,
                east: bounds.east,
                west: bounds.west,
                limit: non_zero_limit(req.limit),
            })
            .await
            .map_err(status_from)?;
        Ok(Response::new(proto::GetTerritoriesInAreaResponse {
            count: response.count as u64,
            territories: response
                .territories
                .into_iter()
                .map(territory_to_proto)
                .collect(),
        }))
    }

    async fn get_nearby_players(
        &self,
        request: Request<proto::GetNearbyPlayersRequest>,
    ) -> Result<Response<proto::GetNearbyPlayersResponse>, Status> {
        let caller = caller_identity(&request);
        let req = request.into_inner();
        let response = self
            .service
            .get_nearby_players(
                caller,
                RadiusRequest {
                    latitude: req.latitude,
                    longitude: req.longitude,
                    radius_meters: non_zero_radius(req.radius_meters),
                    limit: non_zero_limit(req.limit),
                },
            )
            .await
            .map_err(status_from)?;
        Ok(Response::new(proto::GetNearbyPlayersResponse {
            count: response.count as u64,
            players: response.players.into_iter().map(player_to_proto).collect(),
        }))
    }

    async fn get_recent_activity(
        &self,
        request: Request<proto::GetRecentActivityRequest>,
    ) -> Result<Response<proto::GetRecentActivityResponse>, Status> {
        let req = request.into_inner();
        let response = self
            .service
            .get_recent_activity(RadiusRequest {
                latitude: req.latitude,
                longitude: req.longitude,
                radius_meters: non_zero_radius(req.radius_meters),
                limit: non_zero_limit(req.limit),
            })
            .await
            .map_err(status_from)?;
        Ok(Response::new(proto::GetRecentActivityResponse {
            count: response.count as u64,
            activities: response
                .activities
                .into_iter()
                .map(activity_to_proto)
                .collect(),
        }))
    }

    async fn get_heatmap_data(
        &self,
        request: Request<proto::GetHeatmapDataRequest>,
    ) -> Result<Response<proto::GetHeatmapDataResponse>, Status> {
        let req = request.into_inner();
        let bounds = required_bounds(req.bounds)?;
        let layer = layer_from_proto(req.layer)?;
        let response = self
            .service
            .get_heatmap_data(HeatmapRequest {
                north: bounds.north,
                south: bounds.south,
                east: bounds.east,
                west: bounds.west,
                layer,
            })
            .await
            .map_err(status_from)?;
        Ok(Response::new(proto::GetHeatmapDataResponse {
            count: response.points.len() as u64,
            points: response
                .points
                .into_iter()
                .map(|point| proto::HeatmapPoint {
                    latitude: point.latitude,
                    longitude: point.longitude,
                    intensity: point.intensity,
                })
                .collect(),
        }))
    }

    async fn record_map_activity(
        &self,
        request: Request<proto::RecordMapActivityRequest>,
    ) -> Result<Response<proto::RecordMapActivityResponse>, Status> {
        let req = request.into_inner();
        let activity_type = activity_type_from_proto(req.kind)?;
        let response = self
            .service
            .record_map_activity(RecordActivityRequest {
                id: req.id,
                activity_type,
                actor_name: req.actor_name,
                target_name: req.target_name,
                latitude: req.latitude,
                longitude: req.longitude,
                description: req.description,
                timestamp: req.timestamp,
            })
            .await
            .map_err(status_from)?;
        Ok(Response::new(proto::RecordMapActivityResponse {
            activity_id: response.activity_id,
            tile_key: response.tile_key,
        }))
    }

    async fn update_map_tile(
        &self,
        request: Request<proto::UpdateMapTileRequest>,
    ) -> Result<Response<proto::UpdateMapTileResponse>, Status> {
        let req = request.into_inner();
        let patch = patch_from_proto(req.patch.unwrap_or_default());
        let outcome = self
            .service
            .update_map_tile(req.territory_id, patch)
            .await
            .map_err(status_from)?;
        let response = match outcome {
            ApplyOutcome::Indexed {
                key,
                relocated_from,
            } => proto::UpdateMapTileResponse {
                indexed: true,
                tile_key: key,
                relocated_from,
            },
            ApplyOutcome::Skipped => proto::UpdateMapTileResponse::default(),
        };
        Ok(Response::new(response))
    }

    async fn remove_territory(
        &self,
        request: Request<proto::RemoveTerritoryRequest>,
    ) -> Result<Response<proto::RemoveTerritoryResponse>, Status> {
        let req = request.into_inner();
        let removed = self
            .service
            .remove_territory(req.territory_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(proto::RemoveTerritoryResponse { removed }))
    }

    async fn run_retention(
        &self,
        _request: Request<proto::RunRetentionRequest>,
    ) -> Result<Response<proto::RunRetentionResponse>, Status> {
        let report = self.service.run_retention().await.map_err(status_from)?;
        Ok(Response::new(proto::RunRetentionResponse {
            activities_deleted: report.activities_deleted as u64,
            heartbeats_deleted: report.heartbeats_deleted as u64,
            tiles_pruned: report.tiles_pruned as u64,
            has_more: report.has_more,
        }))
    }

    async fn health_check(
        &self,
        _request: Request<proto::HealthCheckRequest>,
    ) -> Result<Response<proto::HealthCheckResponse>, Status> {
        let health = self.service.health().await.map_err(status_from)?;
        Ok(Response::new(proto::HealthCheckResponse {
            status: "ok".to_string(),
            activity_count: health.activity_count as u64,
            heartbeat_count: health.heartbeat_count as u64,
        }))
    }
}
