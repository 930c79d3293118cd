#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Flood risk pipeline.
//!
//! [`engine::RiskEngine`] wires the store, rainfall cache, hotspot
//! detector and risk model together and exposes the operations callers
//! use: scoring, queries, what-if simulation, report ingestion and
//! moderation. [`scheduler::RecomputationScheduler`] drives the engine's
//! recomputation cycle on a fixed interval.

pub mod engine;
pub mod scheduler;

use flood_map_database::DbError;
use flood_map_hotspot::HotspotError;
use flood_map_risk::RiskError;
use thiserror::Error;

pub use engine::{CycleReport, Dashboard, ReportSubmission, RiskEngine, SimulationResult};
pub use scheduler::{CycleOutcome, RecomputationScheduler, SchedulerState};

/// Errors surfaced by pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Store failure.
    #[error(transparent)]
    Db(#[from] DbError),

    /// Hotspot detection failure.
    #[error(transparent)]
    Hotspot(#[from] HotspotError),

    /// Invalid simulation input.
    #[error(transparent)]
    Risk(#[from] RiskError),

    /// Invalid caller input.
    #[error("Validation error: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// The requested zone does not exist.
    #[error("Zone {zone_id} not found")]
    ZoneNotFound {
        /// The missing zone id.
        zone_id: i64,
    },
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fakes shared by the engine and scheduler tests.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use flood_map_config::FloodMapConfig;
    use flood_map_database::{DbError, MemoryStore, SpatialStore};
    use flood_map_flood_models::clock::ManualClock;
    use flood_map_flood_models::{
        GeoPoint, Hotspot, ModerationStatus, NewHotspot, NewReport, NewZone, RainfallCacheEntry,
        RainfallReading, Report, Severity, Zone, ZoneRiskUpdate,
    };
    use flood_map_weather::{RainfallProvider, WeatherError};

    use crate::RiskEngine;

    pub fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_718_000_000, 0).unwrap()
    }

    fn square(lng: f64, lat: f64, size: f64) -> String {
        format!(
            r#"{{"type":"Polygon","coordinates":[[[{lng},{lat}],[{e},{lat}],[{e},{n}],[{lng},{n}],[{lng},{lat}]]]}}"#,
            e = lng + size,
            n = lat + size,
        )
    }

    /// North and South share an edge; Unmapped has no boundary or centroid.
    pub fn zones() -> Vec<NewZone> {
        vec![
            NewZone {
                name: "North".to_string(),
                boundary_geojson: Some(square(77.0, 28.1, 0.1)),
                centroid: Some(GeoPoint::new(28.15, 77.05)),
                drainage_stress: 0.5,
                population_exposure: 0.5,
            },
            NewZone {
                name: "South".to_string(),
                boundary_geojson: Some(square(77.0, 28.0, 0.1)),
                centroid: Some(GeoPoint::new(28.05, 77.05)),
                drainage_stress: 0.5,
                population_exposure: 0.5,
            },
            NewZone {
                name: "Unmapped".to_string(),
                boundary_geojson: None,
                centroid: None,
                drainage_stress: 0.5,
                population_exposure: 0.5,
            },
        ]
    }

    pub fn report_at(location: GeoPoint, zone_id: Option<i64>, days_ago: i64) -> NewReport {
        NewReport {
            location,
            severity: Severity::Medium,
            note: None,
            submitted_by: "public".to_string(),
            zone_id,
            created_at: now() - chrono::Duration::days(days_ago),
        }
    }

    /// Always returns the same reading, optionally after a delay.
    pub struct FixedProvider {
        pub reading: RainfallReading,
        pub delay: Duration,
        pub calls: AtomicUsize,
    }

    impl FixedProvider {
        pub fn new(rain_1h_mm: f64) -> Self {
            Self {
                reading: RainfallReading {
                    rain_1h_mm,
                    rain_3h_mm: 0.0,
                },
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn slow(rain_1h_mm: f64, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(rain_1h_mm)
            }
        }
    }

    #[async_trait]
    impl RainfallProvider for FixedProvider {
        async fn fetch(&self, _location: GeoPoint) -> Result<RainfallReading, WeatherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.reading)
        }
    }

    /// A [`MemoryStore`] that can fail writes for one zone or one report,
    /// or panic once when zones are listed.
    #[derive(Default)]
    pub struct FlakyStore {
        pub inner: MemoryStore,
        pub fail_zone: Option<i64>,
        pub fail_report: Option<i64>,
        pub panic_next_listing: AtomicBool,
    }

    #[async_trait]
    impl SpatialStore for FlakyStore {
        async fn points_in_window(&self, since: DateTime<Utc>) -> Result<Vec<Report>, DbError> {
            self.inner.points_in_window(since).await
        }

        async fn zone_for_point(&self, point: GeoPoint) -> Result<Option<Zone>, DbError> {
            self.inner.zone_for_point(point).await
        }

        async fn all_zones(&self) -> Result<Vec<Zone>, DbError> {
            assert!(
                !self.panic_next_listing.swap(false, Ordering::SeqCst),
                "zone listing exploded"
            );
            self.inner.all_zones().await
        }

        async fn get_zone(&self, zone_id: i64) -> Result<Option<Zone>, DbError> {
            self.inner.get_zone(zone_id).await
        }

        async fn reports_count(
            &self,
            zone_id: i64,
            since: DateTime<Utc>,
        ) -> Result<u64, DbError> {
            self.inner.reports_count(zone_id, since).await
        }

        async fn hotspots(&self) -> Result<Vec<Hotspot>, DbError> {
            self.inner.hotspots().await
        }

        async fn replace_hotspots(
            &self,
            hotspots: Vec<NewHotspot>,
        ) -> Result<Vec<Hotspot>, DbError> {
            self.inner.replace_hotspots(hotspots).await
        }

        async fn upsert_zone_risk(
            &self,
            zone_id: i64,
            update: ZoneRiskUpdate,
        ) -> Result<(), DbError> {
            if self.fail_zone == Some(zone_id) {
                return Err(DbError::Conversion {
                    message: format!("simulated write failure for zone {zone_id}"),
                });
            }
            self.inner.upsert_zone_risk(zone_id, update).await
        }

        async fn upsert_rainfall_cache(&self, entry: RainfallCacheEntry) -> Result<(), DbError> {
            self.inner.upsert_rainfall_cache(entry).await
        }

        async fn get_rainfall_cache(
            &self,
            zone_id: i64,
        ) -> Result<Option<RainfallCacheEntry>, DbError> {
            self.inner.get_rainfall_cache(zone_id).await
        }

        async fn insert_zones(&self, zones: Vec<NewZone>) -> Result<Vec<Zone>, DbError> {
            self.inner.insert_zones(zones).await
        }

        async fn insert_report(&self, report: NewReport) -> Result<Report, DbError> {
            self.inner.insert_report(report).await
        }

        async fn set_report_zone(
            &self,
            report_id: i64,
            zone_id: Option<i64>,
        ) -> Result<(), DbError> {
            if self.fail_report == Some(report_id) {
                return Err(DbError::Conversion {
                    message: format!("simulated write failure for report {report_id}"),
                });
            }
            self.inner.set_report_zone(report_id, zone_id).await
        }

        async fn set_report_status(
            &self,
            report_id: i64,
            status: ModerationStatus,
        ) -> Result<(), DbError> {
            self.inner.set_report_status(report_id, status).await
        }

        async fn unassigned_reports(&self) -> Result<Vec<Report>, DbError> {
            self.inner.unassigned_reports().await
        }

        async fn recent_reports(&self, limit: usize) -> Result<Vec<Report>, DbError> {
            self.inner.recent_reports(limit).await
        }

        async fn total_reports(&self) -> Result<u64, DbError> {
            self.inner.total_reports().await
        }
    }

    pub fn engine(
        store: Arc<dyn SpatialStore>,
        provider: Arc<dyn RainfallProvider>,
    ) -> Arc<RiskEngine> {
        Arc::new(RiskEngine::new(
            store,
            provider,
            Arc::new(ManualClock::new(now())),
            &FloodMapConfig::default(),
        ))
    }
}
