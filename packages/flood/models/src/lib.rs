#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Flood report, zone, hotspot and rainfall types.
//!
//! These are the shared shapes passed between the store, the hotspot
//! detector, the rainfall cache and the risk pipeline. Reports are
//! citizen-submitted facts, zones are administrative polygons carrying
//! derived risk state, and hotspots are the derived clusters that get
//! replaced wholesale on every recomputation cycle.

pub mod clock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Default drainage stress and population exposure for zones that have
/// no externally supplied value.
pub const DEFAULT_EXOGENOUS_FACTOR: f64 = 0.5;

/// A WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
}

impl GeoPoint {
    /// Creates a point from latitude and longitude.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether both coordinates are finite and within WGS84 bounds.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// How bad the flooding looked to the person reporting it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// Shallow water, passable.
    Low,
    /// Ankle to knee deep.
    Medium,
    /// Impassable or entering buildings.
    High,
}

impl Severity {
    /// Parses a severity label (`LOW`, `MEDIUM` or `HIGH`).
    ///
    /// # Errors
    ///
    /// Returns [`InvalidSeverityError`] for any other input. Labels are
    /// not case-folded or trimmed.
    pub fn parse(value: &str) -> Result<Self, InvalidSeverityError> {
        value.parse().map_err(|_| InvalidSeverityError {
            value: value.to_string(),
        })
    }
}

/// Error returned when a severity label is not one of the known levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidSeverityError {
    /// The rejected label.
    pub value: String,
}

impl std::fmt::Display for InvalidSeverityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid severity {:?}: expected LOW, MEDIUM or HIGH",
            self.value
        )
    }
}

impl std::error::Error for InvalidSeverityError {}

/// Moderation state of a report.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ModerationStatus {
    /// Not reviewed yet.
    #[default]
    Pending,
    /// Confirmed by a moderator.
    Approved,
    /// Discarded by a moderator. Rejected reports never feed scoring.
    Rejected,
}

impl ModerationStatus {
    /// Parses a moderation status label.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidStatusError`] if the label is unknown.
    pub fn parse(value: &str) -> Result<Self, InvalidStatusError> {
        value.parse().map_err(|_| InvalidStatusError {
            value: value.to_string(),
        })
    }

    /// Whether reports in this state participate in clustering and counts.
    #[must_use]
    pub const fn counts_toward_risk(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Error returned when a moderation status label is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStatusError {
    /// The rejected label.
    pub value: String,
}

impl std::fmt::Display for InvalidStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid moderation status {:?}: expected PENDING, APPROVED or REJECTED",
            self.value
        )
    }
}

impl std::error::Error for InvalidStatusError {}

/// Categorical flood risk for a zone.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// Score below 0.3.
    #[default]
    Low,
    /// Score in `[0.3, 0.6)`.
    Medium,
    /// Score of 0.6 or above.
    High,
}

/// A stored flood report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Primary key.
    pub id: i64,
    /// Where the flooding was observed.
    pub location: GeoPoint,
    /// Reported severity.
    pub severity: Severity,
    /// Optional free-text note from the reporter.
    pub note: Option<String>,
    /// Identity token of the submitter.
    pub submitted_by: String,
    /// Zone containing the report, once classified.
    pub zone_id: Option<i64>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Moderation state.
    pub status: ModerationStatus,
}

/// A report that has been validated but not yet stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReport {
    /// Where the flooding was observed.
    pub location: GeoPoint,
    /// Reported severity.
    pub severity: Severity,
    /// Optional free-text note.
    pub note: Option<String>,
    /// Identity token of the submitter.
    pub submitted_by: String,
    /// Zone containing the report, if already known.
    pub zone_id: Option<i64>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
}

/// An administrative zone ("ward") and its derived risk state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    /// Primary key.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Boundary as a `GeoJSON` `Polygon` or `MultiPolygon` geometry.
    pub boundary_geojson: Option<String>,
    /// Representative point used for weather lookups.
    pub centroid: Option<GeoPoint>,
    /// Latest risk score in `[0, 1]`.
    pub risk_score: f64,
    /// Latest risk level.
    pub risk_level: RiskLevel,
    /// Rainfall (hourly-equivalent mm) used for the latest score.
    pub last_rainfall_mm: f64,
    /// Non-rejected reports attributed to this zone.
    pub report_count: u64,
    /// Standing hotspots attributed to this zone.
    pub hotspot_count: u64,
    /// Normalized drainage stress in `[0, 1]`.
    pub drainage_stress: f64,
    /// Normalized population exposure in `[0, 1]`.
    pub population_exposure: f64,
    /// When the derived fields were last written.
    pub risk_updated_at: Option<DateTime<Utc>>,
}

/// Reference data for a zone before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewZone {
    /// Display name.
    pub name: String,
    /// Boundary as a `GeoJSON` geometry string.
    pub boundary_geojson: Option<String>,
    /// Representative point.
    pub centroid: Option<GeoPoint>,
    /// Normalized drainage stress.
    pub drainage_stress: f64,
    /// Normalized population exposure.
    pub population_exposure: f64,
}

impl Zone {
    /// Builds a stored zone with empty derived state.
    #[must_use]
    pub fn from_new(id: i64, zone: NewZone) -> Self {
        Self {
            id,
            name: zone.name,
            boundary_geojson: zone.boundary_geojson,
            centroid: zone.centroid,
            risk_score: 0.0,
            risk_level: RiskLevel::Low,
            last_rainfall_mm: 0.0,
            report_count: 0,
            hotspot_count: 0,
            drainage_stress: zone.drainage_stress,
            population_exposure: zone.population_exposure,
            risk_updated_at: None,
        }
    }

    /// Applies a derived-field update in place.
    pub fn apply(&mut self, update: &ZoneRiskUpdate) {
        self.risk_score = update.risk_score;
        self.risk_level = update.risk_level;
        self.last_rainfall_mm = update.rainfall_mm;
        self.report_count = update.report_count;
        self.hotspot_count = update.hotspot_count;
        self.risk_updated_at = Some(update.computed_at);
    }
}

/// The full set of derived fields written for a zone in one commit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneRiskUpdate {
    /// Risk score in `[0, 1]`.
    pub risk_score: f64,
    /// Risk level derived from the score.
    pub risk_level: RiskLevel,
    /// Rainfall used for the score.
    pub rainfall_mm: f64,
    /// Non-rejected reports attributed to the zone.
    pub report_count: u64,
    /// Hotspots attributed to the zone.
    pub hotspot_count: u64,
    /// When the update was computed.
    pub computed_at: DateTime<Utc>,
}

/// Read-only view of a zone's risk, as served to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneRisk {
    /// Zone primary key.
    pub zone_id: i64,
    /// Zone display name.
    pub name: String,
    /// Latest risk score.
    pub score: f64,
    /// Latest risk level.
    pub level: RiskLevel,
    /// Rainfall used for the latest score.
    pub rainfall_mm: f64,
    /// Non-rejected reports attributed to the zone.
    pub report_count: u64,
    /// Hotspots attributed to the zone.
    pub hotspot_count: u64,
    /// When the score was computed, `None` if never scored.
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Zone> for ZoneRisk {
    fn from(zone: &Zone) -> Self {
        Self {
            zone_id: zone.id,
            name: zone.name.clone(),
            score: zone.risk_score,
            level: zone.risk_level,
            rainfall_mm: zone.last_rainfall_mm,
            report_count: zone.report_count,
            hotspot_count: zone.hotspot_count,
            updated_at: zone.risk_updated_at,
        }
    }
}

/// A detected hotspot before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewHotspot {
    /// Mean location of the contributing reports.
    pub centroid: GeoPoint,
    /// Number of reports in the defining cluster.
    pub frequency: u64,
    /// Owning zone, if one could be attributed.
    pub zone_id: Option<i64>,
    /// Rainfall of the owning zone at detection time.
    pub avg_rainfall_mm: f64,
    /// Timestamp of the most recent contributing report.
    pub last_occurrence: DateTime<Utc>,
}

/// A persisted hotspot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    /// Primary key, reassigned on every replacement.
    pub id: i64,
    /// Mean location of the contributing reports.
    pub centroid: GeoPoint,
    /// Number of reports in the defining cluster.
    pub frequency: u64,
    /// Owning zone, if one could be attributed.
    pub zone_id: Option<i64>,
    /// Rainfall of the owning zone at detection time.
    pub avg_rainfall_mm: f64,
    /// Timestamp of the most recent contributing report.
    pub last_occurrence: DateTime<Utc>,
}

impl Hotspot {
    /// Attaches a primary key to a detected hotspot.
    #[must_use]
    pub fn from_new(id: i64, hotspot: NewHotspot) -> Self {
        Self {
            id,
            centroid: hotspot.centroid,
            frequency: hotspot.frequency,
            zone_id: hotspot.zone_id,
            avg_rainfall_mm: hotspot.avg_rainfall_mm,
            last_occurrence: hotspot.last_occurrence,
        }
    }
}

/// Rainfall accumulations returned by a weather provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RainfallReading {
    /// Accumulation over the last hour, mm.
    pub rain_1h_mm: f64,
    /// Accumulation over the last three hours, mm.
    pub rain_3h_mm: f64,
}

impl RainfallReading {
    /// Hourly-equivalent rainfall rate: `rain_1h + rain_3h / 3`.
    #[must_use]
    pub fn hourly_rate(&self) -> f64 {
        self.rain_1h_mm + self.rain_3h_mm / 3.0
    }
}

/// A cached rainfall reading for one zone.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RainfallCacheEntry {
    /// Zone the reading belongs to.
    pub zone_id: i64,
    /// The reading.
    pub reading: RainfallReading,
    /// When the reading was fetched from the provider.
    pub fetched_at: DateTime<Utc>,
}

impl RainfallCacheEntry {
    /// An entry is fresh only while `now - fetched_at < ttl`.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now.signed_duration_since(self.fetched_at) < ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_parses_known_labels_only() {
        assert_eq!(Severity::parse("LOW").unwrap(), Severity::Low);
        assert_eq!(Severity::parse("MEDIUM").unwrap(), Severity::Medium);
        assert_eq!(Severity::parse("HIGH").unwrap(), Severity::High);
        assert!(Severity::parse("low").is_err());
        assert!(Severity::parse("SEVERE").is_err());
        assert!(Severity::parse("").is_err());
    }

    #[test]
    fn moderation_status_round_trips_through_labels() {
        for status in [
            ModerationStatus::Pending,
            ModerationStatus::Approved,
            ModerationStatus::Rejected,
        ] {
            assert_eq!(ModerationStatus::parse(status.as_ref()).unwrap(), status);
        }
        assert!(ModerationStatus::parse("DELETED").is_err());
        assert!(!ModerationStatus::Rejected.counts_toward_risk());
        assert!(ModerationStatus::Pending.counts_toward_risk());
    }

    #[test]
    fn risk_level_serializes_screaming_case() {
        let json = serde_json::to_string(&RiskLevel::Medium).unwrap();
        assert_eq!(json, "\"MEDIUM\"");
        assert_eq!(RiskLevel::High.to_string(), "HIGH");
    }

    #[test]
    fn hourly_rate_normalizes_three_hour_accumulation() {
        let reading = RainfallReading {
            rain_1h_mm: 4.0,
            rain_3h_mm: 9.0,
        };
        assert!((reading.hourly_rate() - 7.0).abs() < 1e-12);
    }

    #[test]
    fn cache_entry_expires_exactly_at_ttl() {
        let fetched_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let entry = RainfallCacheEntry {
            zone_id: 1,
            reading: RainfallReading {
                rain_1h_mm: 1.0,
                rain_3h_mm: 0.0,
            },
            fetched_at,
        };
        let ttl = Duration::minutes(30);
        assert!(entry.is_fresh(fetched_at, ttl));
        assert!(entry.is_fresh(fetched_at + Duration::seconds(1799), ttl));
        assert!(!entry.is_fresh(fetched_at + ttl, ttl));
    }

    #[test]
    fn geo_point_bounds() {
        assert!(GeoPoint::new(28.6, 77.2).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn zone_apply_overwrites_every_derived_field() {
        let mut zone = Zone::from_new(
            7,
            NewZone {
                name: "Ward 7".to_string(),
                boundary_geojson: None,
                centroid: Some(GeoPoint::new(28.6, 77.2)),
                drainage_stress: 0.4,
                population_exposure: 0.6,
            },
        );
        let computed_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        zone.apply(&ZoneRiskUpdate {
            risk_score: 0.72,
            risk_level: RiskLevel::High,
            rainfall_mm: 31.0,
            report_count: 12,
            hotspot_count: 2,
            computed_at,
        });

        let view = ZoneRisk::from(&zone);
        assert_eq!(view.zone_id, 7);
        assert_eq!(view.level, RiskLevel::High);
        assert_eq!(view.report_count, 12);
        assert_eq!(view.hotspot_count, 2);
        assert_eq!(view.updated_at, Some(computed_at));
        assert!((zone.drainage_stress - 0.4).abs() < f64::EPSILON);
    }
}
