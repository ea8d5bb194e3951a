//! Scheduled cleanup of expired activity records and stale heartbeats.

use crate::clock::{duration_millis, Clock};
use crate::config::RetentionConfig;
use crate::error::MapResult;
use crate::model::MapActivity;
use crate::reconciler::TileReconciler;
use crate::store::{ActivityStore, LocationStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub activities_deleted: usize,
    pub heartbeats_deleted: usize,
    /// Tiles whose recent-activity feed lost entries.
    pub tiles_pruned: usize,
    /// The deletion budget ran out before the sweep could prove it was done.
    pub has_more: bool,
}

impl RetentionReport {
    fn absorb(&mut self, other: RetentionReport) {
        self.activities_deleted += other.activities_deleted;
        self.heartbeats_deleted += other.heartbeats_deleted;
        self.tiles_pruned += other.tiles_pruned;
        self.has_more = other.has_more;
    }
}

pub struct ActivityRetention {
    activities: Arc<dyn ActivityStore>,
    locations: Arc<dyn LocationStore>,
    reconciler: Arc<TileReconciler>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl ActivityRetention {
    pub fn new(
        activities: Arc<dyn ActivityStore>,
        locations: Arc<dyn LocationStore>,
        reconciler: Arc<TileReconciler>,
        clock: Arc<dyn Clock>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            activities,
            locations,
            reconciler,
            clock,
            config,
        }
    }

    /// One bounded sweep. Activities are deleted oldest first; whatever budget
    /// is left goes to stale heartbeats.
    ///
    /// A tile feed is pruned before the records that expired it are deleted,
    /// so records behind a failed prune survive for the next sweep. Such a
    /// failure is returned after the other tiles' records are deleted.
    pub fn run_once(&self) -> MapResult<RetentionReport> {
        let now = self.clock.now_millis();
        let activity_cutoff = now.saturating_sub(duration_millis(self.config.activity_max_age()));
        let heartbeat_cutoff = now.saturating_sub(duration_millis(self.config.heartbeat_max_age()));
        let budget = self.config.batch_limit;

        let expired = self.activities.activities_before(activity_cutoff, budget)?;
        let precision = self.reconciler.tile_precision();
        let mut by_tile: BTreeMap<&str, Vec<&MapActivity>> = BTreeMap::new();
        for activity in &expired {
            by_tile
                .entry(activity.tile_key(precision))
                .or_default()
                .push(activity);
        }

        let mut tiles_pruned = 0;
        let mut removable = Vec::with_capacity(expired.len());
        let mut failure = None;
        for (key, batch) in by_tile {
            match self.reconciler.prune_feed(key, activity_cutoff) {
                Ok(pruned) => {
                    if pruned > 0 {
                        tiles_pruned += 1;
                    }
                    removable.extend(batch.into_iter().cloned());
                }
                Err(err) => {
                    warn!(key, error = %err, "failed to prune tile activity feed");
                    failure.get_or_insert(err);
                }
            }
        }
        let activities_deleted = self.activities.delete_activities(&removable)?;
        if let Some(err) = failure {
            return Err(err);
        }

        let remaining = budget.saturating_sub(activities_deleted);
        let heartbeats_deleted = if remaining > 0 {
            self.locations
                .delete_heartbeats_before(heartbeat_cutoff, remaining)?
        } else {
            0
        };

        let report = RetentionReport {
            activities_deleted,
            heartbeats_deleted,
            tiles_pruned,
            has_more: activities_deleted + heartbeats_deleted >= budget,
        };
        if report.activities_deleted + report.heartbeats_deleted > 0 {
            info!(
                activities = report.activities_deleted,
                heartbeats = report.heartbeats_deleted,
                tiles = report.tiles_pruned,
                has_more = report.has_more,
                "retention sweep"
            );
        }
        Ok(report)
    }

    /// Repeat sweeps until one finishes within budget or `max_passes` runs out.
    pub fn run_until_exhausted(&self, max_passes: usize) -> MapResult<RetentionReport> {
        let mut total = RetentionReport::default();
        for _ in 0..max_passes {
            let report = self.run_once()?;
            total.absorb(report);
            if !report.has_more {
                break;
            }
        }
        Ok(total)
    }
}
