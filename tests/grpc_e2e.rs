use geotile_rs::grpc::proto::{
    self, map_service_client::MapServiceClient, GetMapTilesRequest, GetNearbyPlayersRequest,
    GetTerritoriesInAreaRequest, RecordMapActivityRequest, UpdateMapTileRequest,
};
use geotile_rs::grpc::USER_ID_HEADER;
use tonic::{Code, Request};

mod support;

use support::{memory_service, spawn_server, SAN_FRANCISCO};

async fn connect() -> anyhow::Result<MapServiceClient<tonic::transport::Channel>> {
    let (_, _, service) = memory_service();
    let (addr, _handle) = spawn_server(service).await?;
    Ok(MapServiceClient::connect(format!("http://{}", addr)).await?)
}

#[tokio::test]
async fn update_then_read_tiles_over_grpc() -> anyhow::Result<()> {
    let mut client = connect().await?;
    let (lat, lon) = SAN_FRANCISCO;

    let updated = client
        .update_map_tile(UpdateMapTileRequest {
            territory_id: "t1".to_string(),
            patch: Some(proto::TerritoryPatch {
                latitude: Some(lat),
                longitude: Some(lon),
                alliance_id: Some("A".to_string()),
                alliance_name: Some("Alpha".to_string()),
                alliance_tag: Some("ALP".to_string()),
                is_contested: Some(true),
                ..Default::default()
            }),
        })
        .await?
        .into_inner();
    assert!(updated.indexed);
    assert_eq!(updated.tile_key, "9q8yy");
    assert_eq!(updated.relocated_from, None);

    let tiles = client
        .get_map_tiles(GetMapTilesRequest {
            latitude: lat,
            longitude: lon,
            precision: 0,
            filters: None,
        })
        .await?
        .into_inner();
    assert_eq!(tiles.center_key, "9q8yy");
    assert_eq!(tiles.tiles.len(), 9);
    let center = &tiles.tiles[0];
    assert_eq!(center.total_territories, 1);
    assert_eq!(center.dominant_alliance.as_ref().map(|d| d.tag.as_str()), Some("ALP"));

    let filtered = client
        .get_map_tiles(GetMapTilesRequest {
            latitude: lat,
            longitude: lon,
            precision: 5,
            filters: Some(proto::Filters {
                show_contested: Some(false),
                ..Default::default()
            }),
        })
        .await?
        .into_inner();
    assert_eq!(filtered.tiles[0].total_territories, 0);

    let area = client
        .get_territories_in_area(GetTerritoriesInAreaRequest {
            bounds: Some(proto::Bounds {
                north: lat + 0.01,
                south: lat - 0.01,
                east: lon + 0.01,
                west: lon - 0.01,
            }),
            limit: 0,
        })
        .await?
        .into_inner();
    assert_eq!(area.count, 1);
    assert_eq!(area.territories[0].alliance_name.as_deref(), Some("Alpha"));
    Ok(())
}

#[tokio::test]
async fn nearby_players_requires_caller_metadata() -> anyhow::Result<()> {
    let mut client = connect().await?;
    let (lat, lon) = SAN_FRANCISCO;
    let request = GetNearbyPlayersRequest {
        latitude: lat,
        longitude: lon,
        radius_meters: 0.0,
        limit: 0,
    };

    let err = client
        .get_nearby_players(Request::new(request.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let mut authed = Request::new(request);
    authed.metadata_mut().insert(USER_ID_HEADER, "user-1".parse()?);
    let response = client.get_nearby_players(authed).await?.into_inner();
    assert_eq!(response.count, 0);

    let health = client
        .health_check(proto::HealthCheckRequest {})
        .await?
        .into_inner();
    assert_eq!(health.status, "ok");
    assert_eq!(health.heartbeat_count, 1);
    Ok(())
}

#[tokio::test]
async fn invalid_requests_map_to_status_codes() -> anyhow::Result<()> {
    let mut client = connect().await?;

    let err = client
        .record_map_activity(RecordMapActivityRequest {
            kind: proto::ActivityType::Unspecified as i32,
            actor_name: "ann".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client
        .get_territories_in_area(GetTerritoriesInAreaRequest {
            bounds: Some(proto::Bounds {
                north: 40.0,
                south: 30.0,
                east: -110.0,
                west: -120.0,
            }),
            limit: 10,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client
        .get_map_tiles(GetMapTilesRequest {
            latitude: 91.0,
            longitude: 0.0,
            precision: 5,
            filters: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let recorded = client
        .record_map_activity(RecordMapActivityRequest {
            kind: proto::ActivityType::WorldEvent as i32,
            actor_name: "system".to_string(),
            latitude: SAN_FRANCISCO.0,
            longitude: SAN_FRANCISCO.1,
            description: "Meteor shower".to_string(),
            ..Default::default()
        })
        .await?
        .into_inner();
    assert!(!recorded.activity_id.is_empty());
    assert_eq!(recorded.tile_key, "9q8yy");

    let sweep = client
        .run_retention(proto::RunRetentionRequest {})
        .await?
        .into_inner();
    assert_eq!(sweep.activities_deleted, 0);
    assert!(!sweep.has_more);
    Ok(())
}
