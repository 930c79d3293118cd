//! `DuckDB`-backed [`SpatialStore`].
//!
//! Timestamps are stored as epoch milliseconds. Zone boundaries live in
//! the `zones` table as `GeoJSON` text and are mirrored into a
//! [`ZoneIndex`] that is rebuilt whenever zones are inserted.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{Connection, Row, params};
use flood_map_flood_models::{
    GeoPoint, Hotspot, ModerationStatus, NewHotspot, NewReport, NewZone, RainfallCacheEntry,
    RainfallReading, Report, RiskLevel, Severity, Zone, ZoneRiskUpdate,
};
use flood_map_spatial::ZoneIndex;

use crate::{DbError, SpatialStore};

const ZONE_COLUMNS: &str = "id, name, boundary_geojson, centroid_lat, centroid_lng, \
     risk_score, risk_level, last_rainfall_mm, report_count, hotspot_count, \
     drainage_stress, population_exposure, risk_updated_at";

const REPORT_COLUMNS: &str =
    "id, lat, lng, severity, note, submitted_by, zone_id, created_at, status";

/// A [`SpatialStore`] persisted in a `DuckDB` database.
///
/// Queries run on Tokio's blocking pool, so a long transaction never
/// stalls the runtime's worker threads.
pub struct DuckDbStore {
    conn: Arc<Mutex<Connection>>,
    zone_index: RwLock<ZoneIndex>,
}

impl DuckDbStore {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the parent directory cannot be created, the
    /// connection fails, or stored zones cannot be loaded.
    pub fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        log::info!("Opening flood map database at {}", path.display());
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a throwaway in-memory database.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the connection or schema creation fails.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        create_schema(&conn)?;
        let zones = load_zones(&conn)?;
        log::debug!("Loaded {} zones into the spatial index", zones.len());

        Ok(Self {
            zone_index: RwLock::new(ZoneIndex::build(&zones)),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, DbError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut conn)
        })
        .await?
    }
}

fn create_schema(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE SEQUENCE IF NOT EXISTS zone_id_seq START 1;
        CREATE SEQUENCE IF NOT EXISTS report_id_seq START 1;

        CREATE TABLE IF NOT EXISTS zones (
            id BIGINT PRIMARY KEY,
            name TEXT NOT NULL,
            boundary_geojson TEXT,
            centroid_lat DOUBLE,
            centroid_lng DOUBLE,
            risk_score DOUBLE NOT NULL DEFAULT 0,
            risk_level TEXT NOT NULL DEFAULT 'LOW',
            last_rainfall_mm DOUBLE NOT NULL DEFAULT 0,
            report_count BIGINT NOT NULL DEFAULT 0,
            hotspot_count BIGINT NOT NULL DEFAULT 0,
            drainage_stress DOUBLE NOT NULL,
            population_exposure DOUBLE NOT NULL,
            risk_updated_at BIGINT
        );

        CREATE TABLE IF NOT EXISTS reports (
            id BIGINT PRIMARY KEY,
            lat DOUBLE NOT NULL,
            lng DOUBLE NOT NULL,
            severity TEXT NOT NULL,
            note TEXT,
            submitted_by TEXT NOT NULL,
            zone_id BIGINT,
            created_at BIGINT NOT NULL,
            status TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS hotspots (
            id BIGINT NOT NULL,
            lat DOUBLE NOT NULL,
            lng DOUBLE NOT NULL,
            frequency BIGINT NOT NULL,
            zone_id BIGINT,
            avg_rainfall_mm DOUBLE NOT NULL,
            last_occurrence BIGINT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rainfall_cache (
            zone_id BIGINT PRIMARY KEY,
            rain_1h_mm DOUBLE NOT NULL,
            rain_3h_mm DOUBLE NOT NULL,
            fetched_at BIGINT NOT NULL
        );",
    )?;
    Ok(())
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, DbError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| DbError::Conversion {
        message: format!("timestamp {millis} ms is out of range"),
    })
}

fn count_to_i64(value: u64) -> Result<i64, DbError> {
    i64::try_from(value).map_err(|_| DbError::Conversion {
        message: format!("count {value} does not fit in BIGINT"),
    })
}

fn count_from_i64(value: i64) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::Conversion {
        message: format!("negative count {value}"),
    })
}

fn zone_from_row(row: &Row<'_>) -> Result<Zone, DbError> {
    let centroid_lat: Option<f64> = row.get(3)?;
    let centroid_lng: Option<f64> = row.get(4)?;
    let risk_level: String = row.get(6)?;
    let risk_updated_at: Option<i64> = row.get(12)?;

    Ok(Zone {
        id: row.get(0)?,
        name: row.get(1)?,
        boundary_geojson: row.get(2)?,
        centroid: centroid_lat
            .zip(centroid_lng)
            .map(|(lat, lng)| GeoPoint::new(lat, lng)),
        risk_score: row.get(5)?,
        risk_level: risk_level.parse::<RiskLevel>().map_err(|_| DbError::Conversion {
            message: format!("unknown risk level {risk_level:?}"),
        })?,
        last_rainfall_mm: row.get(7)?,
        report_count: count_from_i64(row.get(8)?)?,
        hotspot_count: count_from_i64(row.get(9)?)?,
        drainage_stress: row.get(10)?,
        population_exposure: row.get(11)?,
        risk_updated_at: risk_updated_at.map(millis_to_datetime).transpose()?,
    })
}

fn report_from_row(row: &Row<'_>) -> Result<Report, DbError> {
    let severity: String = row.get(3)?;
    let status: String = row.get(8)?;

    Ok(Report {
        id: row.get(0)?,
        location: GeoPoint::new(row.get(1)?, row.get(2)?),
        severity: Severity::parse(&severity).map_err(|e| DbError::Conversion {
            message: e.to_string(),
        })?,
        note: row.get(4)?,
        submitted_by: row.get(5)?,
        zone_id: row.get(6)?,
        created_at: millis_to_datetime(row.get(7)?)?,
        status: ModerationStatus::parse(&status).map_err(|e| DbError::Conversion {
            message: e.to_string(),
        })?,
    })
}

fn hotspot_from_row(row: &Row<'_>) -> Result<Hotspot, DbError> {
    Ok(Hotspot {
        id: row.get(0)?,
        centroid: GeoPoint::new(row.get(1)?, row.get(2)?),
        frequency: count_from_i64(row.get(3)?)?,
        zone_id: row.get(4)?,
        avg_rainfall_mm: row.get(5)?,
        last_occurrence: millis_to_datetime(row.get(6)?)?,
    })
}

fn load_zones(conn: &Connection) -> Result<Vec<Zone>, DbError> {
    let mut stmt = conn.prepare(&format!("SELECT {ZONE_COLUMNS} FROM zones ORDER BY id"))?;
    let mut rows = stmt.query([])?;

    let mut zones = Vec::new();
    while let Some(row) = rows.next()? {
        zones.push(zone_from_row(row)?);
    }
    Ok(zones)
}

fn load_zone(conn: &Connection, zone_id: i64) -> Result<Option<Zone>, DbError> {
    let mut stmt = conn.prepare(&format!("SELECT {ZONE_COLUMNS} FROM zones WHERE id = ?"))?;
    let mut rows = stmt.query(params![zone_id])?;

    match rows.next()? {
        Some(row) => Ok(Some(zone_from_row(row)?)),
        None => Ok(None),
    }
}

fn query_reports(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<Report>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;

    let mut reports = Vec::new();
    while let Some(row) = rows.next()? {
        reports.push(report_from_row(row)?);
    }
    Ok(reports)
}

fn load_report(conn: &Connection, report_id: i64) -> Result<Report, DbError> {
    query_reports(
        conn,
        &format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?"),
        params![report_id],
    )?
    .pop()
    .ok_or(DbError::NotFound {
        entity: "report",
        id: report_id,
    })
}

#[async_trait]
impl SpatialStore for DuckDbStore {
    async fn points_in_window(&self, since: DateTime<Utc>) -> Result<Vec<Report>, DbError> {
        let since = since.timestamp_millis();
        self.with_conn(move |conn| {
            query_reports(
                conn,
                &format!(
                    "SELECT {REPORT_COLUMNS} FROM reports
                     WHERE status <> 'REJECTED' AND created_at >= ?
                     ORDER BY id"
                ),
                params![since],
            )
        })
        .await
    }

    async fn zone_for_point(&self, point: GeoPoint) -> Result<Option<Zone>, DbError> {
        let zone_id = self
            .zone_index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .lookup(point);

        match zone_id {
            Some(id) => self.with_conn(move |conn| load_zone(conn, id)).await,
            None => Ok(None),
        }
    }

    async fn all_zones(&self) -> Result<Vec<Zone>, DbError> {
        self.with_conn(|conn| load_zones(conn)).await
    }

    async fn get_zone(&self, zone_id: i64) -> Result<Option<Zone>, DbError> {
        self.with_conn(move |conn| load_zone(conn, zone_id)).await
    }

    async fn reports_count(&self, zone_id: i64, since: DateTime<Utc>) -> Result<u64, DbError> {
        let since = since.timestamp_millis();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM reports
                 WHERE zone_id = ? AND status <> 'REJECTED' AND created_at >= ?",
                params![zone_id, since],
                |row| row.get(0),
            )?;
            count_from_i64(count)
        })
        .await
    }

    async fn hotspots(&self) -> Result<Vec<Hotspot>, DbError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, lat, lng, frequency, zone_id, avg_rainfall_mm, last_occurrence
                 FROM hotspots ORDER BY id",
            )?;
            let mut rows = stmt.query([])?;

            let mut hotspots = Vec::new();
            while let Some(row) = rows.next()? {
                hotspots.push(hotspot_from_row(row)?);
            }
            Ok(hotspots)
        })
        .await
    }

    async fn replace_hotspots(&self, hotspots: Vec<NewHotspot>) -> Result<Vec<Hotspot>, DbError> {
        let replacement: Vec<Hotspot> = hotspots
            .into_iter()
            .zip(1_i64..)
            .map(|(hotspot, id)| Hotspot::from_new(id, hotspot))
            .collect();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM hotspots", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO hotspots
                     (id, lat, lng, frequency, zone_id, avg_rainfall_mm, last_occurrence)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )?;
                for hotspot in &replacement {
                    stmt.execute(params![
                        hotspot.id,
                        hotspot.centroid.latitude,
                        hotspot.centroid.longitude,
                        count_to_i64(hotspot.frequency)?,
                        hotspot.zone_id,
                        hotspot.avg_rainfall_mm,
                        hotspot.last_occurrence.timestamp_millis(),
                    ])?;
                }
            }
            tx.commit()?;

            Ok(replacement)
        })
        .await
    }

    async fn upsert_zone_risk(
        &self,
        zone_id: i64,
        update: ZoneRiskUpdate,
    ) -> Result<(), DbError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE zones SET
                    risk_score = ?,
                    risk_level = ?,
                    last_rainfall_mm = ?,
                    report_count = ?,
                    hotspot_count = ?,
                    risk_updated_at = ?
                 WHERE id = ?",
                params![
                    update.risk_score,
                    update.risk_level.as_ref(),
                    update.rainfall_mm,
                    count_to_i64(update.report_count)?,
                    count_to_i64(update.hotspot_count)?,
                    update.computed_at.timestamp_millis(),
                    zone_id,
                ],
            )?;

            if changed == 0 {
                return Err(DbError::NotFound {
                    entity: "zone",
                    id: zone_id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn upsert_rainfall_cache(&self, entry: RainfallCacheEntry) -> Result<(), DbError> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO rainfall_cache (zone_id, rain_1h_mm, rain_3h_mm, fetched_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (zone_id) DO UPDATE SET
                    rain_1h_mm = EXCLUDED.rain_1h_mm,
                    rain_3h_mm = EXCLUDED.rain_3h_mm,
                    fetched_at = EXCLUDED.fetched_at",
                params![
                    entry.zone_id,
                    entry.reading.rain_1h_mm,
                    entry.reading.rain_3h_mm,
                    entry.fetched_at.timestamp_millis(),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_rainfall_cache(
        &self,
        zone_id: i64,
    ) -> Result<Option<RainfallCacheEntry>, DbError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT rain_1h_mm, rain_3h_mm, fetched_at FROM rainfall_cache WHERE zone_id = ?",
            )?;
            let mut rows = stmt.query(params![zone_id])?;

            let Some(row) = rows.next()? else {
                return Ok(None);
            };

            Ok(Some(RainfallCacheEntry {
                zone_id,
                reading: RainfallReading {
                    rain_1h_mm: row.get(0)?,
                    rain_3h_mm: row.get(1)?,
                },
                fetched_at: millis_to_datetime(row.get(2)?)?,
            }))
        })
        .await
    }

    async fn insert_zones(&self, zones: Vec<NewZone>) -> Result<Vec<Zone>, DbError> {
        let (inserted, index, total) = self
            .with_conn(move |conn| {
                let mut inserted = Vec::with_capacity(zones.len());

                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO zones
                         (id, name, boundary_geojson, centroid_lat, centroid_lng,
                          drainage_stress, population_exposure)
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )?;
                    for zone in zones {
                        let id: i64 = tx.query_row("SELECT nextval('zone_id_seq')", [], |row| {
                            row.get(0)
                        })?;
                        stmt.execute(params![
                            id,
                            zone.name,
                            zone.boundary_geojson,
                            zone.centroid.map(|c| c.latitude),
                            zone.centroid.map(|c| c.longitude),
                            zone.drainage_stress,
                            zone.population_exposure,
                        ])?;
                        inserted.push(Zone::from_new(id, zone));
                    }
                }
                tx.commit()?;

                let all = load_zones(conn)?;
                Ok((inserted, ZoneIndex::build(&all), all.len()))
            })
            .await?;

        *self
            .zone_index
            .write()
            .unwrap_or_else(PoisonError::into_inner) = index;
        log::info!("Inserted {} zones ({total} total indexed)", inserted.len());

        Ok(inserted)
    }

    async fn insert_report(&self, report: NewReport) -> Result<Report, DbError> {
        self.with_conn(move |conn| {
            let id: i64 =
                conn.query_row("SELECT nextval('report_id_seq')", [], |row| row.get(0))?;

            conn.execute(
                "INSERT INTO reports
                 (id, lat, lng, severity, note, submitted_by, zone_id, created_at, status)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    report.location.latitude,
                    report.location.longitude,
                    report.severity.as_ref(),
                    report.note.as_deref(),
                    report.submitted_by,
                    report.zone_id,
                    report.created_at.timestamp_millis(),
                    ModerationStatus::Pending.as_ref(),
                ],
            )?;

            load_report(conn, id)
        })
        .await
    }

    async fn set_report_zone(&self, report_id: i64, zone_id: Option<i64>) -> Result<(), DbError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE reports SET zone_id = ? WHERE id = ?",
                params![zone_id, report_id],
            )?;

            if changed == 0 {
                return Err(DbError::NotFound {
                    entity: "report",
                    id: report_id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn set_report_status(
        &self,
        report_id: i64,
        status: ModerationStatus,
    ) -> Result<(), DbError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE reports SET status = ? WHERE id = ?",
                params![status.as_ref(), report_id],
            )?;

            if changed == 0 {
                return Err(DbError::NotFound {
                    entity: "report",
                    id: report_id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn unassigned_reports(&self) -> Result<Vec<Report>, DbError> {
        self.with_conn(|conn| {
            query_reports(
                conn,
                &format!(
                    "SELECT {REPORT_COLUMNS} FROM reports
                     WHERE zone_id IS NULL AND status <> 'REJECTED'
                     ORDER BY id"
                ),
                params![],
            )
        })
        .await
    }

    async fn recent_reports(&self, limit: usize) -> Result<Vec<Report>, DbError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            query_reports(
                conn,
                &format!(
                    "SELECT {REPORT_COLUMNS} FROM reports
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?"
                ),
                params![limit],
            )
        })
        .await
    }

    async fn total_reports(&self) -> Result<u64, DbError> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM reports", [], |row| row.get(0))?;
            count_from_i64(count)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    fn store() -> DuckDbStore {
        DuckDbStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn zones_and_lookup() {
        conformance::zones_and_lookup(&store()).await;
    }

    #[tokio::test]
    async fn reports_window_and_counts() {
        conformance::reports_window_and_counts(&store()).await;
    }

    #[tokio::test]
    async fn hotspots_are_replaced_wholesale() {
        conformance::hotspots_are_replaced_wholesale(&store()).await;
    }

    #[tokio::test]
    async fn zone_risk_and_rainfall_upserts() {
        conformance::zone_risk_and_rainfall_upserts(&store()).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn busy_connection_does_not_stall_the_runtime() {
        let store = Arc::new(store());
        let held = store.conn.lock().unwrap();

        let query = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.total_reports().await }
        });

        // The query waits on the blocking pool while this task keeps running.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!query.is_finished());

        drop(held);
        assert_eq!(query.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn reopening_a_file_restores_the_zone_index() {
        let dir = std::env::temp_dir().join(format!(
            "flood_map_duck_{}_{}",
            std::process::id(),
            conformance::t0().timestamp()
        ));
        let path = dir.join("flood.duckdb");
        let _ = std::fs::remove_dir_all(&dir);

        {
            let store = DuckDbStore::open(&path).unwrap();
            store.insert_zones(conformance::two_zones()).await.unwrap();
        }

        let reopened = DuckDbStore::open(&path).unwrap();
        let zone = reopened
            .zone_for_point(GeoPoint::new(28.05, 77.05))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(zone.name, "South");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
