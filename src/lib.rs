//! # GeoTile
//!
//! Geospatial tile index for a location-based strategy game. Territories,
//! activity and player positions are bucketed into geohash cells so map
//! viewports, box queries and nearby-player lookups become a handful of
//! prefix reads against an ordered key-value store.

pub mod clock;
pub mod config;
pub mod error;
pub mod geo;
pub mod geohash;
pub mod grpc;
pub mod model;
pub mod neighbors;
pub mod persistence;
pub mod proximity;
pub mod query;
pub mod reconciler;
pub mod retention;
pub mod service;
pub mod store;
pub mod test_support;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::GeoTileConfig;
pub use error::{MapError, MapResult};
pub use geo::GeoPoint;
pub use geohash::CellBounds;
pub use model::{
    ActivityKind, ActivityType, HeatmapLayer, MapActivity, TerritoryPatch, TerritorySnapshot,
    TileAggregate, TileFilters,
};
pub use persistence::PersistentStore;
pub use proximity::{InMemoryProfiles, ProfileDirectory, ProximityFinder};
pub use query::SpatialQueryEngine;
pub use reconciler::{ApplyOutcome, TileReconciler};
pub use retention::{ActivityRetention, RetentionReport};
pub use service::MapService;
pub use store::{ActivityStore, LocationStore, MapStore, MemoryStore, TileStore};
