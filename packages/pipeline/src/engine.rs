//! The flood risk engine.
//!
//! A recomputation cycle runs as a strict one-way pipeline:
//!
//! 1. retry zone attribution for reports that have none,
//! 2. detect hotspots and replace the stored set,
//! 3. score every zone that has a centroid, reading the hotspot counts
//!    produced in step 2.
//!
//! Each zone's derived fields are written in a single store call, and a
//! failure on one zone is logged and skipped without touching the rest.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use flood_map_config::FloodMapConfig;
use flood_map_database::SpatialStore;
use flood_map_flood_models::clock::Clock;
use flood_map_flood_models::{
    GeoPoint, Hotspot, ModerationStatus, NewReport, Report, RiskLevel, Severity, Zone, ZoneRisk,
    ZoneRiskUpdate,
};
use flood_map_hotspot::HotspotDetector;
use flood_map_risk::{RiskInputs, RiskModel, validate_multiplier};
use flood_map_weather::{RainfallCache, RainfallProvider};
use serde::{Deserialize, Serialize};

use crate::PipelineError;

/// An incoming citizen flood report, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSubmission {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Severity label (`LOW`, `MEDIUM` or `HIGH`).
    pub severity: String,
    /// Optional free-text note.
    pub note: Option<String>,
    /// Identity token of the submitter.
    pub submitted_by: String,
}

/// What one recomputation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Previously unattributed reports that were matched to a zone.
    pub reports_classified: usize,
    /// Hotspots stored after detection.
    pub hotspots: usize,
    /// Zones whose derived fields were written.
    pub zones_scored: usize,
    /// Zones without a centroid, which cannot be scored.
    pub zones_skipped: usize,
    /// Zones whose scoring failed.
    pub zones_failed: usize,
    /// Whether a stop request ended the cycle before every zone was visited.
    pub interrupted: bool,
}

/// Outcome of a what-if simulation for one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Zone primary key.
    pub zone_id: i64,
    /// Zone display name.
    pub name: String,
    /// Stored score.
    pub original_score: f64,
    /// Stored level.
    pub original_level: RiskLevel,
    /// Score under the simulated rainfall.
    pub simulated_score: f64,
    /// Level under the simulated rainfall.
    pub simulated_level: RiskLevel,
}

/// Operator overview.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dashboard {
    /// Reports of any status.
    pub total_reports: u64,
    /// Standing hotspots.
    pub total_hotspots: usize,
    /// Zones currently at [`RiskLevel::High`].
    pub high_risk_zones: usize,
    /// Newest reports first.
    pub recent_reports: Vec<Report>,
    /// Every zone's risk view, by zone id.
    pub zones: Vec<ZoneRisk>,
}

/// Scores zones, detects hotspots, and serves the results.
pub struct RiskEngine {
    store: Arc<dyn SpatialStore>,
    clock: Arc<dyn Clock>,
    rainfall: RainfallCache,
    detector: HotspotDetector,
    model: RiskModel,
    recurrence_window: Duration,
}

impl RiskEngine {
    /// Builds an engine from validated configuration.
    #[must_use]
    pub fn new(
        store: Arc<dyn SpatialStore>,
        provider: Arc<dyn RainfallProvider>,
        clock: Arc<dyn Clock>,
        config: &FloodMapConfig,
    ) -> Self {
        Self {
            rainfall: RainfallCache::new(
                Arc::clone(&store),
                provider,
                Arc::clone(&clock),
                &config.rainfall,
            ),
            detector: HotspotDetector::new(Arc::clone(&store), Arc::clone(&clock), config.hotspot),
            model: RiskModel::from_config(&config.risk),
            recurrence_window: Duration::days(i64::from(config.risk.recurrence_window_days)),
            store,
            clock,
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<dyn SpatialStore> {
        &self.store
    }

    /// Runs a full recomputation cycle.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_until(|| false).await
    }

    /// Runs a recomputation cycle, checking `should_stop` before each zone.
    ///
    /// A stop request never interrupts a zone mid-write: the zone being
    /// scored finishes, and the remaining zones keep their previous
    /// values. Failures are logged and counted, never returned.
    pub async fn run_cycle_until<F>(&self, should_stop: F) -> CycleReport
    where
        F: Fn() -> bool + Send + Sync,
    {
        let start = Instant::now();
        let mut report = CycleReport::default();
        log::info!("Starting flood risk recomputation cycle");

        match self.classify_unassigned().await {
            Ok(count) => report.reports_classified = count,
            Err(e) => log::error!("Zone classification of pending reports failed: {e}"),
        }

        match self.detector.recompute().await {
            Ok(hotspots) => report.hotspots = hotspots.len(),
            Err(e) => log::error!("Hotspot detection failed, keeping previous hotspots: {e}"),
        }

        let zones = match self.store.all_zones().await {
            Ok(zones) => zones,
            Err(e) => {
                log::error!("Failed to list zones, skipping scoring: {e}");
                return report;
            }
        };

        let hotspot_counts = match self.hotspot_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                log::error!("Failed to read hotspots, skipping scoring: {e}");
                return report;
            }
        };

        for zone in &zones {
            if should_stop() {
                log::info!("Stop requested, ending cycle before zone {}", zone.id);
                report.interrupted = true;
                break;
            }

            let Some(centroid) = zone.centroid else {
                log::debug!("Zone {} has no centroid, not scoring", zone.id);
                report.zones_skipped += 1;
                continue;
            };

            let hotspot_count = hotspot_counts.get(&zone.id).copied().unwrap_or(0);
            match self.score_zone(zone, centroid, hotspot_count).await {
                Ok(update) => {
                    report.zones_scored += 1;
                    log::debug!(
                        "Zone {} ({}) scored {:.3} {}",
                        zone.id,
                        zone.name,
                        update.risk_score,
                        update.risk_level
                    );
                }
                Err(e) => {
                    report.zones_failed += 1;
                    log::error!("Failed to recompute risk for zone {}: {e}", zone.id);
                }
            }
        }

        log::info!(
            "Recomputation cycle finished in {:.2?}: {} zones scored, {} failed, {} skipped, {} hotspots",
            start.elapsed(),
            report.zones_scored,
            report.zones_failed,
            report.zones_skipped,
            report.hotspots
        );

        report
    }

    async fn hotspot_counts(&self) -> Result<BTreeMap<i64, u64>, PipelineError> {
        let mut counts = BTreeMap::new();
        for hotspot in self.store.hotspots().await? {
            if let Some(zone_id) = hotspot.zone_id {
                *counts.entry(zone_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn score_zone(
        &self,
        zone: &Zone,
        centroid: GeoPoint,
        hotspot_count: u64,
    ) -> Result<ZoneRiskUpdate, PipelineError> {
        let rainfall_mm = self.rainfall.get_rainfall(zone.id, centroid).await;
        let now = self.clock.now();
        let recent = self
            .store
            .reports_count(zone.id, now - self.recurrence_window)
            .await?;
        let total = self
            .store
            .reports_count(zone.id, DateTime::<Utc>::MIN_UTC)
            .await?;

        let assessment = self.model.score(&RiskInputs {
            rainfall_mm,
            recurrence_rate: self.model.recurrence_rate(recent),
            hotspot_persistence: self.model.hotspot_persistence(hotspot_count),
            drainage_stress: zone.drainage_stress,
            population_exposure: zone.population_exposure,
        });

        let update = ZoneRiskUpdate {
            risk_score: assessment.score,
            risk_level: assessment.level,
            rainfall_mm,
            report_count: total,
            hotspot_count,
            computed_at: now,
        };
        self.store.upsert_zone_risk(zone.id, update).await?;

        Ok(update)
    }

    /// Rescores a single zone outside the periodic cycle.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::ZoneNotFound`] if the zone does not exist
    /// * [`PipelineError::Validation`] if the zone has no centroid
    /// * [`PipelineError::Db`] if the store fails
    pub async fn recompute_zone(&self, zone_id: i64) -> Result<ZoneRisk, PipelineError> {
        let zone = self.zone(zone_id).await?;
        let centroid = zone.centroid.ok_or_else(|| PipelineError::Validation {
            message: format!("zone {zone_id} has no centroid"),
        })?;

        let hotspot_count = self
            .hotspot_counts()
            .await?
            .get(&zone_id)
            .copied()
            .unwrap_or(0);
        self.score_zone(&zone, centroid, hotspot_count).await?;

        Ok(ZoneRisk::from(&self.zone(zone_id).await?))
    }

    async fn zone(&self, zone_id: i64) -> Result<Zone, PipelineError> {
        self.store
            .get_zone(zone_id)
            .await?
            .ok_or(PipelineError::ZoneNotFound { zone_id })
    }

    /// The current hotspot set.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Db`] if the store fails.
    pub async fn get_hotspots(&self) -> Result<Vec<Hotspot>, PipelineError> {
        Ok(self.store.hotspots().await?)
    }

    /// The stored risk of one zone.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::ZoneNotFound`] for an unknown zone, or
    /// [`PipelineError::Db`] if the store fails.
    pub async fn get_zone_risk(&self, zone_id: i64) -> Result<ZoneRisk, PipelineError> {
        Ok(ZoneRisk::from(&self.zone(zone_id).await?))
    }

    /// The stored risk of every zone, by zone id.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Db`] if the store fails.
    pub async fn zone_risks(&self) -> Result<Vec<ZoneRisk>, PipelineError> {
        Ok(self
            .store
            .all_zones()
            .await?
            .iter()
            .map(ZoneRisk::from)
            .collect())
    }

    /// Scores a zone as if its last rainfall were multiplied by
    /// `rainfall_multiplier`, using current recurrence and hotspot counts.
    /// Nothing is written.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Risk`] if the multiplier is outside `[0.1, 10]`
    /// * [`PipelineError::ZoneNotFound`] for an unknown zone
    /// * [`PipelineError::Db`] if the store fails
    pub async fn simulate(
        &self,
        zone_id: i64,
        rainfall_multiplier: f64,
    ) -> Result<SimulationResult, PipelineError> {
        validate_multiplier(rainfall_multiplier)?;

        let zone = self.zone(zone_id).await?;
        let hotspot_count = self
            .hotspot_counts()
            .await?
            .get(&zone_id)
            .copied()
            .unwrap_or(0);

        self.simulate_zone(&zone, rainfall_multiplier, hotspot_count)
            .await
    }

    /// Runs [`Self::simulate`] for every zone.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Risk`] if the multiplier is outside `[0.1, 10]`
    /// * [`PipelineError::Db`] if the store fails
    pub async fn simulate_all(
        &self,
        rainfall_multiplier: f64,
    ) -> Result<Vec<SimulationResult>, PipelineError> {
        validate_multiplier(rainfall_multiplier)?;

        let counts = self.hotspot_counts().await?;
        let mut results = Vec::new();
        for zone in self.store.all_zones().await? {
            let hotspot_count = counts.get(&zone.id).copied().unwrap_or(0);
            results.push(
                self.simulate_zone(&zone, rainfall_multiplier, hotspot_count)
                    .await?,
            );
        }

        Ok(results)
    }

    async fn simulate_zone(
        &self,
        zone: &Zone,
        rainfall_multiplier: f64,
        hotspot_count: u64,
    ) -> Result<SimulationResult, PipelineError> {
        let recent = self
            .store
            .reports_count(zone.id, self.clock.now() - self.recurrence_window)
            .await?;

        let simulated = self.model.simulate(
            zone,
            rainfall_multiplier,
            self.model.recurrence_rate(recent),
            self.model.hotspot_persistence(hotspot_count),
        )?;

        Ok(SimulationResult {
            zone_id: zone.id,
            name: zone.name.clone(),
            original_score: zone.risk_score,
            original_level: zone.risk_level,
            simulated_score: simulated.score,
            simulated_level: simulated.level,
        })
    }

    /// Validates and stores a citizen report as [`ModerationStatus::Pending`].
    ///
    /// The containing zone is attached when the lookup succeeds; a lookup
    /// failure leaves the report unattributed for the next cycle to retry.
    /// When a zone is attached its risk is recomputed in the background,
    /// and a failure there is only logged.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Validation`] for out-of-range coordinates or an
    ///   unknown severity
    /// * [`PipelineError::Db`] if the report cannot be stored
    pub async fn submit_report(
        self: &Arc<Self>,
        submission: ReportSubmission,
    ) -> Result<Report, PipelineError> {
        let location = GeoPoint::new(submission.latitude, submission.longitude);
        if !location.is_valid() {
            return Err(PipelineError::Validation {
                message: format!(
                    "coordinates ({}, {}) are outside latitude [-90, 90] / longitude [-180, 180]",
                    submission.latitude, submission.longitude
                ),
            });
        }

        let severity =
            Severity::parse(&submission.severity).map_err(|e| PipelineError::Validation {
                message: e.to_string(),
            })?;

        let zone_id = match self.store.zone_for_point(location).await {
            Ok(zone) => zone.map(|z| z.id),
            Err(e) => {
                log::warn!("Zone lookup failed for new report, leaving it unattributed: {e}");
                None
            }
        };

        let report = self
            .store
            .insert_report(NewReport {
                location,
                severity,
                note: submission.note,
                submitted_by: submission.submitted_by,
                zone_id,
                created_at: self.clock.now(),
            })
            .await?;
        log::info!(
            "Stored {} report {} in zone {:?}",
            report.severity,
            report.id,
            report.zone_id
        );

        if let Some(zone_id) = report.zone_id {
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = engine.recompute_zone(zone_id).await {
                    log::warn!("Background risk recompute for zone {zone_id} failed: {e}");
                }
            });
        }

        Ok(report)
    }

    /// Attaches a zone to every non-rejected report that has none and
    /// now falls inside a zone boundary. Returns how many were attached.
    ///
    /// A failure on one report is logged and that report is left for the
    /// next pass; the remaining reports are still attempted.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Db`] if the unattributed reports cannot
    /// be listed.
    pub async fn classify_unassigned(&self) -> Result<usize, PipelineError> {
        let mut classified = 0;
        for report in self.store.unassigned_reports().await? {
            let zone = match self.store.zone_for_point(report.location).await {
                Ok(Some(zone)) => zone,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("Zone lookup failed for report {}: {e}", report.id);
                    continue;
                }
            };

            match self.store.set_report_zone(report.id, Some(zone.id)).await {
                Ok(()) => classified += 1,
                Err(e) => {
                    log::warn!(
                        "Failed to attribute report {} to zone {}: {e}",
                        report.id,
                        zone.id
                    );
                }
            }
        }

        if classified > 0 {
            log::info!("Attributed {classified} pending reports to zones");
        }
        Ok(classified)
    }

    /// Sets a report's moderation status.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Db`] if the report does not exist or the
    /// store fails.
    pub async fn moderate_report(
        &self,
        report_id: i64,
        status: ModerationStatus,
    ) -> Result<(), PipelineError> {
        self.store.set_report_status(report_id, status).await?;
        log::info!("Report {report_id} marked {status}");
        Ok(())
    }

    /// Totals, the newest `recent_limit` reports, and every zone's risk.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Db`] if the store fails.
    pub async fn dashboard(&self, recent_limit: usize) -> Result<Dashboard, PipelineError> {
        let zones = self.zone_risks().await?;

        Ok(Dashboard {
            total_reports: self.store.total_reports().await?,
            total_hotspots: self.store.hotspots().await?.len(),
            high_risk_zones: zones.iter().filter(|z| z.level == RiskLevel::High).count(),
            recent_reports: self.store.recent_reports(recent_limit).await?,
            zones,
        })
    }
}
