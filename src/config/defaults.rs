//! Default constants for geotile configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Network Defaults
// =============================================================================

/// Default gRPC listen address
pub const DEFAULT_LISTEN_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 50070);

// =============================================================================
// Index Defaults
// =============================================================================

/// Geohash precision tiles are stored at (~4.9 km x 4.9 km cells)
pub const DEFAULT_TILE_PRECISION: usize = 5;

/// Precision of the coarse cell used to bound box queries (~39 km x 19.5 km)
pub const DEFAULT_COVERING_PRECISION: usize = 4;

/// Entries kept in each tile's recent activity feed
pub const DEFAULT_ACTIVITY_FEED_CAPACITY: usize = 50;

/// Optimistic tile writes attempted before reporting a conflict
pub const DEFAULT_MAX_CAS_ATTEMPTS: usize = 8;

/// Locks serializing updates to the same territory
pub const TERRITORY_LOCK_STRIPES: usize = 64;

/// Precision activity records are indexed at
pub const ACTIVITY_GEOHASH_PRECISION: usize = 12;

// =============================================================================
// Request Defaults
// =============================================================================

pub const DEFAULT_MAP_TILE_PRECISION: usize = 5;
pub const DEFAULT_AREA_LIMIT: usize = 100;
pub const DEFAULT_NEARBY_RADIUS_METERS: f64 = 1_000.0;
pub const DEFAULT_NEARBY_LIMIT: usize = 50;
pub const DEFAULT_ACTIVITY_RADIUS_METERS: f64 = 5_000.0;
pub const DEFAULT_ACTIVITY_LIMIT: usize = 50;

/// Hard upper bound on any requested result limit
pub const MAX_RESULT_LIMIT: usize = 500;

// =============================================================================
// Proximity Defaults
// =============================================================================

/// Precision heartbeats are indexed at (~1.2 km x 0.6 km cells)
pub const DEFAULT_HEARTBEAT_PRECISION: usize = 6;

/// Heartbeats older than this are neither nearby nor online (seconds)
pub const DEFAULT_FRESHNESS_SECS: u64 = 300;

// =============================================================================
// Retention Defaults
// =============================================================================

/// Activity records older than this are swept (seconds)
pub const DEFAULT_ACTIVITY_MAX_AGE_SECS: u64 = 3_600;

/// Heartbeats older than this are swept (seconds)
pub const DEFAULT_HEARTBEAT_MAX_AGE_SECS: u64 = 3_600;

/// Deletions per sweep, shared by activities and heartbeats
pub const DEFAULT_RETENTION_BATCH_LIMIT: usize = 500;

/// Interval between scheduled sweeps (seconds)
pub const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 3_600;

// =============================================================================
// Storage Defaults
// =============================================================================

/// Deadline for a single request's store work (milliseconds)
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;

/// Decoded tiles kept in the RocksDB read cache
pub const DEFAULT_TILE_CACHE_ENTRIES: usize = 10_000;
