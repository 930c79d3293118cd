#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Spatial store for the flood map.
//!
//! [`SpatialStore`] is the seam between the risk engine and persistence.
//! Two implementations ship here:
//!
//! - [`memory::MemoryStore`]: lock-protected maps, used by tests and
//!   short-lived tools.
//! - [`duck::DuckDbStore`]: a `DuckDB` file with the zone boundaries
//!   mirrored into an in-memory R-tree for point-in-polygon lookups.
//!
//! Both guarantee that a zone's derived fields and a zone's rainfall
//! cache entry are replaced in a single step, and that the hotspot set
//! is swapped as a whole, so readers never see partial writes.

pub mod duck;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flood_map_flood_models::{
    GeoPoint, Hotspot, ModerationStatus, NewHotspot, NewReport, NewZone, RainfallCacheEntry,
    Report, Zone, ZoneRiskUpdate,
};

pub use duck::DuckDbStore;
pub use memory::MemoryStore;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// `DuckDB` query error.
    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    /// A blocking store task panicked or was cancelled.
    #[error("Store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Filesystem error while opening the database.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The referenced row does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Kind of row (`"zone"`, `"report"`).
        entity: &'static str,
        /// The missing primary key.
        id: i64,
    },

    /// Data conversion error.
    #[error("Data conversion error: {message}")]
    Conversion {
        /// Description of what went wrong.
        message: String,
    },
}

/// Storage operations consumed by the risk engine.
///
/// Reports marked [`ModerationStatus::Rejected`] are invisible to
/// [`points_in_window`](Self::points_in_window) and
/// [`reports_count`](Self::reports_count).
#[async_trait]
pub trait SpatialStore: Send + Sync {
    /// Non-rejected reports created at or after `since`.
    async fn points_in_window(&self, since: DateTime<Utc>) -> Result<Vec<Report>, DbError>;

    /// The zone whose boundary contains `point`, if any.
    async fn zone_for_point(&self, point: GeoPoint) -> Result<Option<Zone>, DbError>;

    /// Every zone, ordered by id.
    async fn all_zones(&self) -> Result<Vec<Zone>, DbError>;

    /// A single zone.
    async fn get_zone(&self, zone_id: i64) -> Result<Option<Zone>, DbError>;

    /// Non-rejected reports attributed to `zone_id` created at or after `since`.
    async fn reports_count(&self, zone_id: i64, since: DateTime<Utc>) -> Result<u64, DbError>;

    /// The current hotspot set.
    async fn hotspots(&self) -> Result<Vec<Hotspot>, DbError>;

    /// Atomically replaces the hotspot set, assigning fresh ids in order.
    async fn replace_hotspots(&self, hotspots: Vec<NewHotspot>) -> Result<Vec<Hotspot>, DbError>;

    /// Writes every derived field of a zone in one step.
    async fn upsert_zone_risk(&self, zone_id: i64, update: ZoneRiskUpdate)
    -> Result<(), DbError>;

    /// Inserts or overwrites the rainfall cache entry for `entry.zone_id`.
    async fn upsert_rainfall_cache(&self, entry: RainfallCacheEntry) -> Result<(), DbError>;

    /// The cached rainfall for a zone, regardless of age.
    async fn get_rainfall_cache(&self, zone_id: i64)
    -> Result<Option<RainfallCacheEntry>, DbError>;

    /// Adds zones from reference data and refreshes the spatial index.
    async fn insert_zones(&self, zones: Vec<NewZone>) -> Result<Vec<Zone>, DbError>;

    /// Stores a new report as [`ModerationStatus::Pending`].
    async fn insert_report(&self, report: NewReport) -> Result<Report, DbError>;

    /// Sets or clears a report's zone association.
    async fn set_report_zone(&self, report_id: i64, zone_id: Option<i64>) -> Result<(), DbError>;

    /// Sets a report's moderation status.
    async fn set_report_status(
        &self,
        report_id: i64,
        status: ModerationStatus,
    ) -> Result<(), DbError>;

    /// Non-rejected reports that have no zone association yet.
    async fn unassigned_reports(&self) -> Result<Vec<Report>, DbError>;

    /// The newest `limit` reports of any status, newest first.
    async fn recent_reports(&self, limit: usize) -> Result<Vec<Report>, DbError>;

    /// Total number of stored reports of any status.
    async fn total_reports(&self) -> Result<u64, DbError>;
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behavior every [`SpatialStore`] must share. Each implementation's
    //! test module runs these against a fresh store.

    use super::*;
    use chrono::Duration;
    use flood_map_flood_models::{RainfallReading, RiskLevel, Severity};

    pub fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_718_000_000, 0).unwrap()
    }

    fn square(lng: f64, lat: f64, size: f64) -> String {
        format!(
            r#"{{"type":"Polygon","coordinates":[[[{lng},{lat}],[{e},{lat}],[{e},{n}],[{lng},{n}],[{lng},{lat}]]]}}"#,
            e = lng + size,
            n = lat + size,
        )
    }

    pub fn two_zones() -> Vec<NewZone> {
        vec![
            NewZone {
                name: "North".to_string(),
                boundary_geojson: Some(square(77.0, 28.1, 0.1)),
                centroid: Some(GeoPoint::new(28.15, 77.05)),
                drainage_stress: 0.7,
                population_exposure: 0.3,
            },
            NewZone {
                name: "South".to_string(),
                boundary_geojson: Some(square(77.0, 28.0, 0.1)),
                centroid: Some(GeoPoint::new(28.05, 77.05)),
                drainage_stress: 0.5,
                population_exposure: 0.5,
            },
        ]
    }

    pub fn report_at(lat: f64, lng: f64, zone_id: Option<i64>, at: DateTime<Utc>) -> NewReport {
        NewReport {
            location: GeoPoint::new(lat, lng),
            severity: Severity::Medium,
            note: None,
            submitted_by: "public".to_string(),
            zone_id,
            created_at: at,
        }
    }

    pub async fn zones_and_lookup(store: &dyn SpatialStore) {
        let zones = store.insert_zones(two_zones()).await.unwrap();
        assert_eq!(zones.len(), 2);
        assert!(zones[0].id < zones[1].id);

        let all = store.all_zones().await.unwrap();
        assert_eq!(all.iter().map(|z| z.name.as_str()).collect::<Vec<_>>(), ["North", "South"]);
        assert!((all[0].drainage_stress - 0.7).abs() < 1e-12);
        assert_eq!(all[0].risk_level, RiskLevel::Low);

        let north = store
            .zone_for_point(GeoPoint::new(28.15, 77.05))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(north.id, zones[0].id);
        let south = store
            .zone_for_point(GeoPoint::new(28.05, 77.05))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(south.id, zones[1].id);
        assert!(store
            .zone_for_point(GeoPoint::new(30.0, 77.05))
            .await
            .unwrap()
            .is_none());

        assert!(store.get_zone(zones[1].id).await.unwrap().is_some());
        assert!(store.get_zone(9_999).await.unwrap().is_none());
    }

    pub async fn reports_window_and_counts(store: &dyn SpatialStore) {
        let zones = store.insert_zones(two_zones()).await.unwrap();
        let north = zones[0].id;

        let old = store
            .insert_report(report_at(28.15, 77.05, Some(north), t0() - Duration::days(40)))
            .await
            .unwrap();
        let recent = store
            .insert_report(report_at(28.15, 77.05, Some(north), t0() - Duration::days(2)))
            .await
            .unwrap();
        let rejected = store
            .insert_report(report_at(28.15, 77.05, Some(north), t0() - Duration::days(1)))
            .await
            .unwrap();
        let unassigned = store
            .insert_report(report_at(28.05, 77.05, None, t0()))
            .await
            .unwrap();

        assert_eq!(recent.status, ModerationStatus::Pending);
        assert!(old.id < recent.id);

        store
            .set_report_status(rejected.id, ModerationStatus::Rejected)
            .await
            .unwrap();

        let window = store
            .points_in_window(t0() - Duration::days(30))
            .await
            .unwrap();
        let ids: Vec<i64> = window.iter().map(|r| r.id).collect();
        assert!(ids.contains(&recent.id));
        assert!(ids.contains(&unassigned.id));
        assert!(!ids.contains(&old.id));
        assert!(!ids.contains(&rejected.id));

        assert_eq!(
            store
                .reports_count(north, t0() - Duration::days(30))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .reports_count(north, DateTime::<Utc>::MIN_UTC)
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.total_reports().await.unwrap(), 4);

        let pending = store.unassigned_reports().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, unassigned.id);

        store
            .set_report_zone(unassigned.id, Some(zones[1].id))
            .await
            .unwrap();
        assert!(store.unassigned_reports().await.unwrap().is_empty());

        let newest = store.recent_reports(2).await.unwrap();
        assert_eq!(
            newest.iter().map(|r| r.id).collect::<Vec<_>>(),
            [unassigned.id, rejected.id]
        );
        assert_eq!(newest[0].zone_id, Some(zones[1].id));

        let err = store
            .set_report_status(9_999, ModerationStatus::Approved)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { entity: "report", .. }));
    }

    pub async fn hotspots_are_replaced_wholesale(store: &dyn SpatialStore) {
        let first = vec![
            NewHotspot {
                centroid: GeoPoint::new(28.1, 77.1),
                frequency: 4,
                zone_id: Some(1),
                avg_rainfall_mm: 3.5,
                last_occurrence: t0(),
            },
            NewHotspot {
                centroid: GeoPoint::new(28.2, 77.2),
                frequency: 6,
                zone_id: None,
                avg_rainfall_mm: 0.0,
                last_occurrence: t0() - Duration::hours(5),
            },
        ];
        let stored = store.replace_hotspots(first).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(store.hotspots().await.unwrap(), stored);

        let second = vec![NewHotspot {
            centroid: GeoPoint::new(28.3, 77.3),
            frequency: 3,
            zone_id: Some(2),
            avg_rainfall_mm: 1.0,
            last_occurrence: t0(),
        }];
        let stored = store.replace_hotspots(second).await.unwrap();
        let current = store.hotspots().await.unwrap();
        assert_eq!(current, stored);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].frequency, 3);

        assert!(store.replace_hotspots(Vec::new()).await.unwrap().is_empty());
        assert!(store.hotspots().await.unwrap().is_empty());
    }

    pub async fn zone_risk_and_rainfall_upserts(store: &dyn SpatialStore) {
        let zones = store.insert_zones(two_zones()).await.unwrap();
        let zone_id = zones[0].id;

        let update = ZoneRiskUpdate {
            risk_score: 0.64,
            risk_level: RiskLevel::High,
            rainfall_mm: 22.0,
            report_count: 9,
            hotspot_count: 2,
            computed_at: t0(),
        };
        store.upsert_zone_risk(zone_id, update).await.unwrap();

        let zone = store.get_zone(zone_id).await.unwrap().unwrap();
        assert!((zone.risk_score - 0.64).abs() < 1e-12);
        assert_eq!(zone.risk_level, RiskLevel::High);
        assert!((zone.last_rainfall_mm - 22.0).abs() < 1e-12);
        assert_eq!(zone.report_count, 9);
        assert_eq!(zone.hotspot_count, 2);
        assert_eq!(zone.risk_updated_at, Some(t0()));

        let err = store.upsert_zone_risk(9_999, update).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { entity: "zone", .. }));

        assert!(store.get_rainfall_cache(zone_id).await.unwrap().is_none());
        let entry = RainfallCacheEntry {
            zone_id,
            reading: RainfallReading {
                rain_1h_mm: 2.0,
                rain_3h_mm: 6.0,
            },
            fetched_at: t0(),
        };
        store.upsert_rainfall_cache(entry).await.unwrap();
        let newer = RainfallCacheEntry {
            fetched_at: t0() + Duration::minutes(45),
            reading: RainfallReading {
                rain_1h_mm: 5.0,
                rain_3h_mm: 0.0,
            },
            ..entry
        };
        store.upsert_rainfall_cache(newer).await.unwrap();
        assert_eq!(store.get_rainfall_cache(zone_id).await.unwrap(), Some(newer));
    }
}
