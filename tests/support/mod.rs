use std::net::SocketAddr;
use std::sync::Arc;

use geotile_rs::config::{GeoTileConfig, IndexConfig};
use geotile_rs::grpc::MapGrpcService;
use geotile_rs::model::AllianceRef;
use geotile_rs::{
    InMemoryProfiles, ManualClock, MapService, MapStore, MemoryStore, TerritorySnapshot,
    TileReconciler,
};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

#[allow(dead_code)]
pub const SAN_FRANCISCO: (f64, f64) = (37.7749, -122.4194);

#[allow(dead_code)]
pub const START_MILLIS: i64 = 1_700_000_000_000;

#[allow(dead_code)]
pub fn allied_territory(id: &str, latitude: f64, longitude: f64, alliance: &str) -> TerritorySnapshot {
    TerritorySnapshot::new(id, latitude, longitude).with_alliance(AllianceRef::new(
        alliance,
        format!("{alliance} alliance"),
        alliance,
    ))
}

#[allow(dead_code)]
pub fn reconciler_over<S: MapStore + 'static>(
    store: Arc<S>,
    clock: Arc<ManualClock>,
) -> TileReconciler {
    TileReconciler::new(store.clone(), store, clock, IndexConfig::default())
}

#[allow(dead_code)]
pub fn memory_service() -> (Arc<MemoryStore>, Arc<ManualClock>, MapService) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let service = MapService::new(
        store.clone(),
        Arc::new(InMemoryProfiles::new()),
        clock.clone(),
        &GeoTileConfig::default(),
    );
    (store, clock, service)
}

#[allow(dead_code)]
pub async fn spawn_server(service: MapService) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        Server::builder()
            .add_service(MapGrpcService::new(service).into_server())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("map server");
    });
    Ok((addr, handle))
}
