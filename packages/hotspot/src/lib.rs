#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Flood hotspot detection.
//!
//! Reduces the rolling window of flood reports to the set of spatially
//! dense, temporally persistent clusters, and replaces the stored
//! hotspot set with the result.

pub mod dbscan;

use std::sync::Arc;

use chrono::Duration;
use flood_map_config::HotspotConfig;
use flood_map_database::{DbError, SpatialStore};
use flood_map_flood_models::clock::Clock;
use flood_map_flood_models::{Hotspot, NewHotspot};
use thiserror::Error;

use crate::dbscan::{ClusterSummary, canonical_order, cluster, summarize};

/// Errors from a hotspot recomputation.
#[derive(Debug, Error)]
pub enum HotspotError {
    /// Store read or write failed.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Detection thresholds are unusable.
    #[error("Invalid hotspot parameters: {message}")]
    InvalidParameters {
        /// Which threshold was wrong.
        message: String,
    },
}

/// Runs hotspot detection against a store.
pub struct HotspotDetector {
    store: Arc<dyn SpatialStore>,
    clock: Arc<dyn Clock>,
    config: HotspotConfig,
}

impl HotspotDetector {
    /// Creates a detector using `config` as the default thresholds.
    #[must_use]
    pub fn new(store: Arc<dyn SpatialStore>, clock: Arc<dyn Clock>, config: HotspotConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// The configured default thresholds.
    #[must_use]
    pub const fn config(&self) -> &HotspotConfig {
        &self.config
    }

    /// Recomputes hotspots with the configured thresholds.
    ///
    /// # Errors
    ///
    /// See [`Self::recompute_hotspots`].
    pub async fn recompute(&self) -> Result<Vec<Hotspot>, HotspotError> {
        self.recompute_hotspots(self.config).await
    }

    /// Clusters the non-rejected reports of the last `params.window_days`
    /// days and replaces the stored hotspot set with every cluster that
    /// has at least `params.min_points` reports spread over at least
    /// `params.min_distinct_days` calendar days.
    ///
    /// Each hotspot is attributed to the most common zone among its
    /// reports, or failing that the zone containing its centroid, and
    /// carries that zone's last known rainfall. An empty window yields
    /// an empty set, which still replaces whatever was stored.
    ///
    /// # Errors
    ///
    /// * [`HotspotError::InvalidParameters`] if `window_days` is zero,
    ///   `eps_distance` is not a positive finite number, or either count
    ///   threshold is zero
    /// * [`HotspotError::Db`] if the store fails; the previous hotspot
    ///   set is then left in place
    pub async fn recompute_hotspots(
        &self,
        params: HotspotConfig,
    ) -> Result<Vec<Hotspot>, HotspotError> {
        validate(&params)?;

        let since = self.clock.now() - Duration::days(i64::from(params.window_days));
        let mut reports = self.store.points_in_window(since).await?;
        reports.sort_by(canonical_order);

        let locations: Vec<_> = reports.iter().map(|r| r.location).collect();
        let clusters = cluster(&locations, params.eps_distance, params.min_points);
        log::debug!(
            "Clustered {} reports into {} candidate clusters",
            reports.len(),
            clusters.len()
        );

        let mut detected = Vec::new();
        for members in &clusters {
            let Some(summary) = summarize(&reports, members) else {
                continue;
            };

            if summary.report_count < params.min_points
                || summary.distinct_days < params.min_distinct_days
            {
                log::trace!(
                    "Dropping cluster at {:?}: {} reports over {} days",
                    summary.centroid,
                    summary.report_count,
                    summary.distinct_days
                );
                continue;
            }

            detected.push(self.to_hotspot(summary).await?);
        }

        let stored = self.store.replace_hotspots(detected).await?;
        log::info!(
            "Hotspot detection found {} hotspots from {} reports in the last {} days",
            stored.len(),
            reports.len(),
            params.window_days
        );

        Ok(stored)
    }

    async fn to_hotspot(&self, summary: ClusterSummary) -> Result<NewHotspot, HotspotError> {
        let zone = match summary.dominant_zone {
            Some(zone_id) => self.store.get_zone(zone_id).await?,
            None => self.store.zone_for_point(summary.centroid).await?,
        };

        Ok(NewHotspot {
            centroid: summary.centroid,
            frequency: summary.report_count as u64,
            zone_id: zone.as_ref().map(|z| z.id),
            avg_rainfall_mm: zone.as_ref().map_or(0.0, |z| z.last_rainfall_mm),
            last_occurrence: summary.last_occurrence,
        })
    }
}

fn validate(params: &HotspotConfig) -> Result<(), HotspotError> {
    if params.window_days == 0 {
        return Err(HotspotError::InvalidParameters {
            message: "window_days must be at least 1".to_string(),
        });
    }
    if !(params.eps_distance.is_finite() && params.eps_distance > 0.0) {
        return Err(HotspotError::InvalidParameters {
            message: format!("eps_distance must be positive, got {}", params.eps_distance),
        });
    }
    if params.min_points == 0 {
        return Err(HotspotError::InvalidParameters {
            message: "min_points must be at least 1".to_string(),
        });
    }
    if params.min_distinct_days == 0 {
        return Err(HotspotError::InvalidParameters {
            message: "min_distinct_days must be at least 1".to_string(),
        });
    }
    Ok(())
}
