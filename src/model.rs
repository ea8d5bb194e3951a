//! # Data Model
//!
//! Denormalized territory snapshots, per-cell tile aggregates with their
//! derived fields, activity records and player heartbeats.

use crate::error::{MapError, MapResult};
use crate::geo::GeoPoint;
use crate::geohash::{self, CellBounds};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// A territory as the gameplay subsystem last reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerritorySnapshot {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub owner_id: String,
    pub owner_name: String,
    pub alliance_id: Option<String>,
    pub alliance_name: Option<String>,
    pub alliance_tag: Option<String>,
    pub level: u32,
    pub structure_type: String,
    pub is_contested: bool,
    pub is_shielded: bool,
    pub defense_rating: u32,
    pub total_blocks: u32,
}

impl TerritorySnapshot {
    /// Minimal snapshot; the remaining fields take neutral defaults.
    pub fn new(id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            id: id.into(),
            latitude,
            longitude,
            owner_id: String::new(),
            owner_name: String::new(),
            alliance_id: None,
            alliance_name: None,
            alliance_tag: None,
            level: 1,
            structure_type: String::new(),
            is_contested: false,
            is_shielded: false,
            defense_rating: 0,
            total_blocks: 0,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>, owner_name: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self.owner_name = owner_name.into();
        self
    }

    pub fn with_alliance(mut self, alliance: AllianceRef) -> Self {
        self.set_alliance(Some(alliance));
        self
    }

    pub fn set_alliance(&mut self, alliance: Option<AllianceRef>) {
        match alliance {
            Some(alliance) => {
                self.alliance_id = Some(alliance.id);
                self.alliance_name = Some(alliance.name);
                self.alliance_tag = Some(alliance.tag);
            }
            None => {
                self.alliance_id = None;
                self.alliance_name = None;
                self.alliance_tag = None;
            }
        }
    }

    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllianceRef {
    pub id: String,
    pub name: String,
    pub tag: String,
}

impl AllianceRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tag: tag.into(),
        }
    }
}

/// Partial territory update. `None` leaves the indexed value untouched;
/// `alliance: Some(None)` clears the alliance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerritoryPatch {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub owner_id: Option<String>,
    pub owner_name: Option<String>,
    pub alliance: Option<Option<AllianceRef>>,
    pub level: Option<u32>,
    pub structure_type: Option<String>,
    pub is_contested: Option<bool>,
    pub is_shielded: Option<bool>,
    pub defense_rating: Option<u32>,
    pub total_blocks: Option<u32>,
}

impl TerritoryPatch {
    /// Overlay the patch on `base`. Returns `None` when the result would have
    /// no location.
    pub fn merge(self, territory_id: &str, base: Option<&TerritorySnapshot>) -> Option<TerritorySnapshot> {
        let latitude = self.latitude.or_else(|| base.map(|b| b.latitude))?;
        let longitude = self.longitude.or_else(|| base.map(|b| b.longitude))?;
        let mut merged = match base {
            Some(base) => base.clone(),
            None => TerritorySnapshot::new(territory_id, latitude, longitude),
        };
        merged.id = territory_id.to_string();
        merged.latitude = latitude;
        merged.longitude = longitude;
        if let Some(owner_id) = self.owner_id {
            merged.owner_id = owner_id;
        }
        if let Some(owner_name) = self.owner_name {
            merged.owner_name = owner_name;
        }
        if let Some(alliance) = self.alliance {
            merged.set_alliance(alliance);
        }
        if let Some(level) = self.level {
            merged.level = level;
        }
        if let Some(structure_type) = self.structure_type {
            merged.structure_type = structure_type;
        }
        if let Some(is_contested) = self.is_contested {
            merged.is_contested = is_contested;
        }
        if let Some(is_shielded) = self.is_shielded {
            merged.is_shielded = is_shielded;
        }
        if let Some(defense_rating) = self.defense_rating {
            merged.defense_rating = defense_rating;
        }
        if let Some(total_blocks) = self.total_blocks {
            merged.total_blocks = total_blocks;
        }
        Some(merged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DominantAlliance {
    pub id: String,
    pub name: String,
    pub tag: String,
    pub territory_count: usize,
}

/// Alliance with the strictly highest territory count. Territories without an
/// alliance are ignored; ties go to the alliance met first while scanning in
/// territory order.
pub fn dominant_alliance(territories: &[TerritorySnapshot]) -> Option<DominantAlliance> {
    let mut tallies: Vec<DominantAlliance> = Vec::new();
    for territory in territories {
        let Some(alliance_id) = territory.alliance_id.as_deref() else {
            continue;
        };
        match tallies.iter_mut().find(|tally| tally.id == alliance_id) {
            Some(tally) => tally.territory_count += 1,
            None => tallies.push(DominantAlliance {
                id: alliance_id.to_string(),
                name: territory.alliance_name.clone().unwrap_or_default(),
                tag: territory.alliance_tag.clone().unwrap_or_default(),
                territory_count: 1,
            }),
        }
    }

    let mut best: Option<DominantAlliance> = None;
    for tally in tallies {
        let better = best
            .as_ref()
            .map_or(true, |current| tally.territory_count > current.territory_count);
        if better {
            best = Some(tally);
        }
    }
    best
}

/// Closed set of activity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Conquest,
    Defense,
    Claim,
    Attack,
    WorldEvent,
    AllianceWar,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Conquest => "conquest",
            ActivityType::Defense => "defense",
            ActivityType::Claim => "claim",
            ActivityType::Attack => "attack",
            ActivityType::WorldEvent => "world_event",
            ActivityType::AllianceWar => "alliance_war",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Activity payload, one variant per type carrying only what that type needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Conquest { defender: String },
    Defense { attacker: String },
    Claim,
    Attack { defender: String },
    WorldEvent { event_name: String },
    AllianceWar {
        attacker_alliance: String,
        defender_alliance: String,
    },
}

impl ActivityKind {
    /// Build a kind from a flat request. `actor` is the attacking alliance for
    /// alliance wars; world events fall back to `description` for their name.
    pub fn from_parts(
        activity_type: ActivityType,
        actor: &str,
        target: Option<String>,
        description: &str,
    ) -> MapResult<Self> {
        let target = target.filter(|t| !t.trim().is_empty());
        let require = |target: Option<String>| {
            target.ok_or_else(|| {
                MapError::invalid(format!("{activity_type} activity requires a target name"))
            })
        };
        Ok(match activity_type {
            ActivityType::Conquest => ActivityKind::Conquest {
                defender: require(target)?,
            },
            ActivityType::Defense => ActivityKind::Defense {
                attacker: require(target)?,
            },
            ActivityType::Claim => ActivityKind::Claim,
            ActivityType::Attack => ActivityKind::Attack {
                defender: require(target)?,
            },
            ActivityType::WorldEvent => ActivityKind::WorldEvent {
                event_name: target.unwrap_or_else(|| description.to_string()),
            },
            ActivityType::AllianceWar => ActivityKind::AllianceWar {
                attacker_alliance: actor.to_string(),
                defender_alliance: require(target)?,
            },
        })
    }

    pub fn activity_type(&self) -> ActivityType {
        match self {
            ActivityKind::Conquest { .. } => ActivityType::Conquest,
            ActivityKind::Defense { .. } => ActivityType::Defense,
            ActivityKind::Claim => ActivityType::Claim,
            ActivityKind::Attack { .. } => ActivityType::Attack,
            ActivityKind::WorldEvent { .. } => ActivityType::WorldEvent,
            ActivityKind::AllianceWar { .. } => ActivityType::AllianceWar,
        }
    }

    pub fn target_name(&self) -> Option<&str> {
        match self {
            ActivityKind::Conquest { defender } | ActivityKind::Attack { defender } => {
                Some(defender)
            }
            ActivityKind::Defense { attacker } => Some(attacker),
            ActivityKind::AllianceWar {
                defender_alliance, ..
            } => Some(defender_alliance),
            ActivityKind::WorldEvent { event_name } => Some(event_name),
            ActivityKind::Claim => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapActivity {
    pub id: String,
    pub kind: ActivityKind,
    pub actor_name: String,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Full-precision geohash used by the activity indexes.
    pub geohash: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

impl MapActivity {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// Key of the tile at `precision` owning this activity.
    pub fn tile_key(&self, precision: usize) -> &str {
        &self.geohash[..precision.min(self.geohash.len())]
    }
}

/// Bounded, most-recent-first activity feed. Pushing past capacity evicts the
/// oldest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityFeed {
    capacity: usize,
    entries: VecDeque<MapActivity>,
}

impl ActivityFeed {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns `false` when an activity with the same id is already present.
    pub fn push(&mut self, activity: MapActivity) -> bool {
        if self.entries.iter().any(|entry| entry.id == activity.id) {
            return false;
        }
        self.entries.push_front(activity);
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
        true
    }

    /// Drop entries older than `cutoff`; returns how many were removed.
    pub fn prune_before(&mut self, cutoff: i64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.timestamp >= cutoff);
        before - self.entries.len()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.entries.truncate(self.capacity);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapActivity> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build a feed from entries in any order; newest entries win.
    pub fn from_entries(capacity: usize, entries: impl IntoIterator<Item = MapActivity>) -> Self {
        let mut sorted: Vec<MapActivity> = entries.into_iter().collect();
        sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let mut feed = Self::with_capacity(capacity);
        for entry in sorted {
            feed.push(entry);
        }
        feed
    }
}

/// Aggregate record for one geohash cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileAggregate {
    pub key: String,
    pub bounds: CellBounds,
    pub center: GeoPoint,
    /// Insertion ordered, unique by territory id.
    pub territories: Vec<TerritorySnapshot>,
    pub total_territories: usize,
    pub recent_activity: ActivityFeed,
    pub active_player_count: usize,
    pub dominant_alliance: Option<DominantAlliance>,
    pub last_updated: i64,
}

impl TileAggregate {
    /// Well-formed aggregate for a cell with nothing in it.
    pub fn empty(key: &str, feed_capacity: usize) -> MapResult<Self> {
        let bounds = geohash::decode(key)?;
        Ok(Self {
            key: key.to_string(),
            bounds,
            center: bounds.center(),
            territories: Vec::new(),
            total_territories: 0,
            recent_activity: ActivityFeed::with_capacity(feed_capacity),
            active_player_count: 0,
            dominant_alliance: None,
            last_updated: 0,
        })
    }

    /// Aggregate for `key` synthesized from loose parts, e.g. when merging
    /// finer tiles or restricting a coarser one.
    pub fn from_parts(
        key: &str,
        territories: Vec<TerritorySnapshot>,
        activities: impl IntoIterator<Item = MapActivity>,
        feed_capacity: usize,
        last_updated: i64,
    ) -> MapResult<Self> {
        let mut tile = Self::empty(key, feed_capacity)?;
        tile.territories = territories;
        tile.recent_activity = ActivityFeed::from_entries(feed_capacity, activities);
        tile.recompute();
        tile.last_updated = last_updated;
        Ok(tile)
    }

    pub fn territory(&self, territory_id: &str) -> Option<&TerritorySnapshot> {
        self.territories.iter().find(|t| t.id == territory_id)
    }

    /// Insert or fully replace a territory, keeping its original position.
    pub fn upsert_territory(&mut self, snapshot: TerritorySnapshot) {
        match self.territories.iter_mut().find(|t| t.id == snapshot.id) {
            Some(existing) => *existing = snapshot,
            None => self.territories.push(snapshot),
        }
    }

    pub fn remove_territory(&mut self, territory_id: &str) -> Option<TerritorySnapshot> {
        let index = self.territories.iter().position(|t| t.id == territory_id)?;
        Some(self.territories.remove(index))
    }

    /// Recompute every derived field from territories and the feed.
    pub fn recompute(&mut self) {
        self.total_territories = self.territories.len();
        self.dominant_alliance = dominant_alliance(&self.territories);
        let mut actors: Vec<&str> = self
            .recent_activity
            .iter()
            .map(|activity| activity.actor_name.as_str())
            .collect();
        actors.sort_unstable();
        actors.dedup();
        self.active_player_count = actors.len();
    }

    /// Recompute and stamp.
    pub fn refresh(&mut self, now: i64) {
        self.recompute();
        self.last_updated = now;
    }

    pub fn contested_count(&self) -> usize {
        self.territories.iter().filter(|t| t.is_contested).count()
    }

    /// Copy with only the territories `filters` accepts; stored data is never
    /// touched.
    pub fn filtered(&self, filters: &TileFilters) -> TileAggregate {
        if filters.is_noop() {
            return self.clone();
        }
        let mut tile = self.clone();
        tile.territories.retain(|territory| filters.accepts(territory));
        tile.recompute();
        tile
    }
}

/// Post-filters for map tile requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileFilters {
    pub show_contested: bool,
    pub show_shielded: bool,
    pub alliance_filter: Option<String>,
    pub min_level: Option<u32>,
    pub max_level: Option<u32>,
}

impl Default for TileFilters {
    fn default() -> Self {
        Self {
            show_contested: true,
            show_shielded: true,
            alliance_filter: None,
            min_level: None,
            max_level: None,
        }
    }
}

impl TileFilters {
    pub fn is_noop(&self) -> bool {
        *self == TileFilters::default()
    }

    pub fn accepts(&self, territory: &TerritorySnapshot) -> bool {
        if !self.show_contested && territory.is_contested {
            return false;
        }
        if !self.show_shielded && territory.is_shielded {
            return false;
        }
        if let Some(alliance) = &self.alliance_filter {
            if territory.alliance_id.as_deref() != Some(alliance.as_str()) {
                return false;
            }
        }
        if self.min_level.is_some_and(|min| territory.level < min) {
            return false;
        }
        if self.max_level.is_some_and(|max| territory.level > max) {
            return false;
        }
        true
    }

    pub fn validate(&self) -> MapResult<()> {
        if let (Some(min), Some(max)) = (self.min_level, self.max_level) {
            if min > max {
                return Err(MapError::invalid(format!(
                    "min_level {min} exceeds max_level {max}"
                )));
            }
        }
        Ok(())
    }
}

/// Last known position of a player; one per user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerLocationHeartbeat {
    pub user_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub geohash: String,
    pub last_updated: i64,
}

impl PlayerLocationHeartbeat {
    pub fn location(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    pub user_id: String,
    pub display_name: String,
    pub alliance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbyPlayer {
    pub user_id: String,
    pub display_name: String,
    pub alliance_id: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Rounded to the nearest meter.
    pub distance_meters: u64,
    pub is_online: bool,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeatmapLayer {
    Territories,
    Activity,
    Contested,
}

impl HeatmapLayer {
    pub fn value(&self, tile: &TileAggregate) -> usize {
        match self {
            HeatmapLayer::Territories => tile.total_territories,
            HeatmapLayer::Activity => tile.recent_activity.len(),
            HeatmapLayer::Contested => tile.contested_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatmapPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// In (0, 1], relative to the hottest point of the response.
    pub intensity: f64,
}
