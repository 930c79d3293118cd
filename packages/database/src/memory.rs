//! In-memory [`SpatialStore`].
//!
//! Every table sits behind its own `RwLock`. Writers replace whole
//! records under the write lock, and the hotspot set is an `Arc` that
//! is swapped in one assignment, so readers see either the old or the
//! new state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flood_map_flood_models::{
    GeoPoint, Hotspot, ModerationStatus, NewHotspot, NewReport, NewZone, RainfallCacheEntry,
    Report, Zone, ZoneRiskUpdate,
};
use flood_map_spatial::ZoneIndex;

use crate::{DbError, SpatialStore};

struct ZoneTable {
    zones: BTreeMap<i64, Zone>,
    index: ZoneIndex,
}

/// A [`SpatialStore`] held entirely in process memory.
pub struct MemoryStore {
    zones: RwLock<ZoneTable>,
    reports: RwLock<BTreeMap<i64, Report>>,
    hotspots: RwLock<Arc<Vec<Hotspot>>>,
    rainfall: RwLock<BTreeMap<i64, RainfallCacheEntry>>,
    next_zone_id: AtomicI64,
    next_report_id: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            zones: RwLock::new(ZoneTable {
                zones: BTreeMap::new(),
                index: ZoneIndex::empty(),
            }),
            reports: RwLock::new(BTreeMap::new()),
            hotspots: RwLock::new(Arc::new(Vec::new())),
            rainfall: RwLock::new(BTreeMap::new()),
            next_zone_id: AtomicI64::new(1),
            next_report_id: AtomicI64::new(1),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl SpatialStore for MemoryStore {
    async fn points_in_window(&self, since: DateTime<Utc>) -> Result<Vec<Report>, DbError> {
        Ok(read(&self.reports)
            .values()
            .filter(|r| r.status.counts_toward_risk() && r.created_at >= since)
            .cloned()
            .collect())
    }

    async fn zone_for_point(&self, point: GeoPoint) -> Result<Option<Zone>, DbError> {
        let table = read(&self.zones);
        Ok(table
            .index
            .lookup(point)
            .and_then(|id| table.zones.get(&id))
            .cloned())
    }

    async fn all_zones(&self) -> Result<Vec<Zone>, DbError> {
        Ok(read(&self.zones).zones.values().cloned().collect())
    }

    async fn get_zone(&self, zone_id: i64) -> Result<Option<Zone>, DbError> {
        Ok(read(&self.zones).zones.get(&zone_id).cloned())
    }

    async fn reports_count(&self, zone_id: i64, since: DateTime<Utc>) -> Result<u64, DbError> {
        let count = read(&self.reports)
            .values()
            .filter(|r| {
                r.zone_id == Some(zone_id) && r.status.counts_toward_risk() && r.created_at >= since
            })
            .count();
        Ok(count as u64)
    }

    async fn hotspots(&self) -> Result<Vec<Hotspot>, DbError> {
        let current = Arc::clone(&read(&self.hotspots));
        Ok(current.as_ref().clone())
    }

    async fn replace_hotspots(&self, hotspots: Vec<NewHotspot>) -> Result<Vec<Hotspot>, DbError> {
        let replacement: Vec<Hotspot> = hotspots
            .into_iter()
            .zip(1_i64..)
            .map(|(hotspot, id)| Hotspot::from_new(id, hotspot))
            .collect();

        *write(&self.hotspots) = Arc::new(replacement.clone());

        Ok(replacement)
    }

    async fn upsert_zone_risk(
        &self,
        zone_id: i64,
        update: ZoneRiskUpdate,
    ) -> Result<(), DbError> {
        let mut table = write(&self.zones);
        let zone = table.zones.get_mut(&zone_id).ok_or(DbError::NotFound {
            entity: "zone",
            id: zone_id,
        })?;
        zone.apply(&update);
        Ok(())
    }

    async fn upsert_rainfall_cache(&self, entry: RainfallCacheEntry) -> Result<(), DbError> {
        write(&self.rainfall).insert(entry.zone_id, entry);
        Ok(())
    }

    async fn get_rainfall_cache(
        &self,
        zone_id: i64,
    ) -> Result<Option<RainfallCacheEntry>, DbError> {
        Ok(read(&self.rainfall).get(&zone_id).copied())
    }

    async fn insert_zones(&self, zones: Vec<NewZone>) -> Result<Vec<Zone>, DbError> {
        let mut table = write(&self.zones);

        let inserted: Vec<Zone> = zones
            .into_iter()
            .map(|zone| Zone::from_new(self.next_zone_id.fetch_add(1, Ordering::Relaxed), zone))
            .collect();

        for zone in &inserted {
            table.zones.insert(zone.id, zone.clone());
        }

        let all: Vec<Zone> = table.zones.values().cloned().collect();
        table.index = ZoneIndex::build(&all);

        Ok(inserted)
    }

    async fn insert_report(&self, report: NewReport) -> Result<Report, DbError> {
        let stored = Report {
            id: self.next_report_id.fetch_add(1, Ordering::Relaxed),
            location: report.location,
            severity: report.severity,
            note: report.note,
            submitted_by: report.submitted_by,
            zone_id: report.zone_id,
            created_at: report.created_at,
            status: ModerationStatus::Pending,
        };
        write(&self.reports).insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn set_report_zone(&self, report_id: i64, zone_id: Option<i64>) -> Result<(), DbError> {
        let mut reports = write(&self.reports);
        let report = reports.get_mut(&report_id).ok_or(DbError::NotFound {
            entity: "report",
            id: report_id,
        })?;
        report.zone_id = zone_id;
        Ok(())
    }

    async fn set_report_status(
        &self,
        report_id: i64,
        status: ModerationStatus,
    ) -> Result<(), DbError> {
        let mut reports = write(&self.reports);
        let report = reports.get_mut(&report_id).ok_or(DbError::NotFound {
            entity: "report",
            id: report_id,
        })?;
        report.status = status;
        Ok(())
    }

    async fn unassigned_reports(&self) -> Result<Vec<Report>, DbError> {
        Ok(read(&self.reports)
            .values()
            .filter(|r| r.zone_id.is_none() && r.status.counts_toward_risk())
            .cloned()
            .collect())
    }

    async fn recent_reports(&self, limit: usize) -> Result<Vec<Report>, DbError> {
        let mut reports: Vec<Report> = read(&self.reports).values().cloned().collect();
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        reports.truncate(limit);
        Ok(reports)
    }

    async fn total_reports(&self) -> Result<u64, DbError> {
        Ok(read(&self.reports).len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[tokio::test]
    async fn zones_and_lookup() {
        conformance::zones_and_lookup(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn reports_window_and_counts() {
        conformance::reports_window_and_counts(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn hotspots_are_replaced_wholesale() {
        conformance::hotspots_are_replaced_wholesale(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn zone_risk_and_rainfall_upserts() {
        conformance::zone_risk_and_rainfall_upserts(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn reader_holding_old_hotspot_set_is_unaffected_by_swap() {
        let store = MemoryStore::new();
        store
            .replace_hotspots(vec![NewHotspot {
                centroid: GeoPoint::new(28.1, 77.1),
                frequency: 4,
                zone_id: None,
                avg_rainfall_mm: 0.0,
                last_occurrence: conformance::t0(),
            }])
            .await
            .unwrap();

        let before = store.hotspots().await.unwrap();
        store.replace_hotspots(Vec::new()).await.unwrap();

        assert_eq!(before.len(), 1);
        assert!(store.hotspots().await.unwrap().is_empty());
    }
}
