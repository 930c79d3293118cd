#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! In-memory spatial index for zone attribution.
//!
//! Builds an R-tree over zone boundary polygons and answers
//! point-in-polygon lookups, so reports and hotspot centroids can be
//! attributed to the zone containing them. Also parses zone boundary
//! `GeoJSON` (single geometries and whole feature collections) and
//! derives centroids for weather lookups.

use flood_map_flood_models::{DEFAULT_EXOGENOUS_FACTOR, GeoPoint, NewZone, Zone};
use geo::{Area, Centroid, Contains, MultiPolygon};
use geojson::GeoJson;
use rstar::{AABB, RTree, RTreeObject};
use thiserror::Error;

/// Property names checked, in order, for a zone's display name.
const NAME_PROPERTIES: &[&str] = &["ward_name", "Ward_Name", "name", "NAME"];

/// Errors from parsing zone boundary data.
#[derive(Debug, Error)]
pub enum SpatialError {
    /// The document is not valid `GeoJSON`.
    #[error("GeoJSON parse error: {0}")]
    GeoJson(#[from] geojson::Error),

    /// The document parsed but has the wrong shape.
    #[error("Unsupported zone data: {message}")]
    Unsupported {
        /// What was wrong.
        message: String,
    },
}

/// A zone polygon stored in the R-tree.
struct ZoneEntry {
    zone_id: i64,
    area: f64,
    envelope: AABB<[f64; 2]>,
    polygon: MultiPolygon<f64>,
}

impl RTreeObject for ZoneEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-tree over zone boundaries.
///
/// Built once from the zone table and swapped wholesale when zones are
/// reloaded.
pub struct ZoneIndex {
    zones: RTree<ZoneEntry>,
}

impl ZoneIndex {
    /// Builds an index from every zone with a parseable boundary.
    ///
    /// Zones without a boundary are skipped silently; zones whose
    /// boundary fails to parse are skipped with a warning.
    #[must_use]
    pub fn build(zones: &[Zone]) -> Self {
        let mut entries = Vec::with_capacity(zones.len());

        for zone in zones {
            let Some(geojson_str) = zone.boundary_geojson.as_deref() else {
                continue;
            };

            let Some(polygon) = parse_geojson_to_multipolygon(geojson_str) else {
                log::warn!("Failed to parse boundary GeoJSON for zone {}", zone.id);
                continue;
            };

            entries.push(ZoneEntry {
                zone_id: zone.id,
                area: polygon.unsigned_area(),
                envelope: compute_envelope(&polygon),
                polygon,
            });
        }

        log::debug!("Built zone index with {} boundaries", entries.len());

        Self {
            zones: RTree::bulk_load(entries),
        }
    }

    /// An index with no zones; every lookup misses.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            zones: RTree::new(),
        }
    }

    /// Number of indexed zone boundaries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.zones.size()
    }

    /// Whether the index holds no boundaries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.zones.size() == 0
    }

    /// Looks up the zone containing a point.
    ///
    /// Zones can overlap at shared edges or in sloppy source data; the
    /// smallest containing zone wins, then the lowest zone id.
    #[must_use]
    pub fn lookup(&self, point: GeoPoint) -> Option<i64> {
        let geo_point = geo::Point::new(point.longitude, point.latitude);
        let query_env = AABB::from_point([point.longitude, point.latitude]);

        let mut best: Option<&ZoneEntry> = None;

        for entry in self.zones.locate_in_envelope_intersecting(&query_env) {
            if entry.polygon.contains(&geo_point) {
                match best {
                    None => best = Some(entry),
                    Some(current)
                        if entry.area < current.area
                            || (entry.area == current.area && entry.zone_id < current.zone_id) =>
                    {
                        best = Some(entry);
                    }
                    _ => {}
                }
            }
        }

        best.map(|e| e.zone_id)
    }
}

/// Parse a `GeoJSON` string into a [`MultiPolygon`].
/// Handles both `Polygon` and `MultiPolygon` geometry types.
#[must_use]
pub fn parse_geojson_to_multipolygon(geojson_str: &str) -> Option<MultiPolygon<f64>> {
    let geojson: GeoJson = geojson_str.parse().ok()?;
    if let GeoJson::Geometry(geom) = geojson {
        geometry_to_multipolygon(geom)
    } else {
        None
    }
}

/// Centroid of a boundary geometry string, if it parses.
#[must_use]
pub fn boundary_centroid(geojson_str: &str) -> Option<GeoPoint> {
    let polygon = parse_geojson_to_multipolygon(geojson_str)?;
    polygon
        .centroid()
        .map(|point| GeoPoint::new(point.y(), point.x()))
}

/// Parses a `GeoJSON` `FeatureCollection` of zone boundaries.
///
/// The zone name comes from the first present of `ward_name`,
/// `Ward_Name`, `name` or `NAME`. Optional numeric `drainage_stress` and
/// `population_exposure` properties are used when they lie in `[0, 1]`;
/// otherwise the default of 0.5 applies. Features without a name or a
/// polygonal geometry are skipped with a warning.
///
/// # Errors
///
/// Returns [`SpatialError`] if the text is not `GeoJSON` or is not a
/// `FeatureCollection`.
pub fn parse_zone_collection(geojson_str: &str) -> Result<Vec<NewZone>, SpatialError> {
    let GeoJson::FeatureCollection(collection) = geojson_str.parse::<GeoJson>()? else {
        return Err(SpatialError::Unsupported {
            message: "expected a FeatureCollection".to_string(),
        });
    };

    let mut zones = Vec::with_capacity(collection.features.len());

    for (idx, feature) in collection.features.into_iter().enumerate() {
        let properties = feature.properties.unwrap_or_default();

        let name = NAME_PROPERTIES
            .iter()
            .find_map(|key| properties.get(*key).and_then(serde_json::Value::as_str))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);

        let Some(name) = name else {
            log::warn!("Skipping zone feature {idx}: no name property");
            continue;
        };

        let Some(geometry) = feature.geometry else {
            log::warn!("Skipping zone {name}: no geometry");
            continue;
        };

        let Ok(boundary_geojson) = serde_json::to_string(&geometry) else {
            log::warn!("Skipping zone {name}: geometry could not be serialized");
            continue;
        };

        let Some(polygon) = geometry_to_multipolygon(geometry) else {
            log::warn!("Skipping zone {name}: geometry is not a Polygon or MultiPolygon");
            continue;
        };

        let centroid = polygon
            .centroid()
            .map(|point| GeoPoint::new(point.y(), point.x()));

        zones.push(NewZone {
            drainage_stress: unit_property(&properties, "drainage_stress", &name),
            population_exposure: unit_property(&properties, "population_exposure", &name),
            name,
            boundary_geojson: Some(boundary_geojson),
            centroid,
        });
    }

    log::info!("Parsed {} zone boundaries", zones.len());

    Ok(zones)
}

fn unit_property(properties: &geojson::JsonObject, key: &str, zone_name: &str) -> f64 {
    match properties.get(key).and_then(serde_json::Value::as_f64) {
        Some(value) if (0.0..=1.0).contains(&value) => value,
        Some(value) => {
            log::warn!(
                "Zone {zone_name}: {key}={value} outside [0, 1], using {DEFAULT_EXOGENOUS_FACTOR}"
            );
            DEFAULT_EXOGENOUS_FACTOR
        }
        None => DEFAULT_EXOGENOUS_FACTOR,
    }
}

fn geometry_to_multipolygon(geom: geojson::Geometry) -> Option<MultiPolygon<f64>> {
    let geo_geom: geo::Geometry<f64> = geom.try_into().ok()?;
    match geo_geom {
        geo::Geometry::MultiPolygon(mp) => Some(mp),
        geo::Geometry::Polygon(p) => Some(MultiPolygon(vec![p])),
        _ => None,
    }
}

/// Compute the bounding box envelope for a [`MultiPolygon`].
fn compute_envelope(mp: &MultiPolygon<f64>) -> AABB<[f64; 2]> {
    use geo::BoundingRect;

    mp.bounding_rect().map_or_else(
        || AABB::from_point([0.0, 0.0]),
        |rect| AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
    )
}
