//! Density-based clustering of report locations.
//!
//! Classic DBSCAN over planar `[longitude, latitude]` coordinates with an
//! R-tree for the neighborhood queries. The result depends only on the
//! order of the input slice, so callers sort reports into a canonical
//! order first (see [`canonical_order`]).

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, NaiveDate, Utc};
use flood_map_flood_models::{GeoPoint, Report};
use rstar::RTree;
use rstar::primitives::GeomWithData;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    Unvisited,
    Noise,
    Cluster(usize),
}

/// Orders reports by latitude, longitude, creation time, then id.
///
/// Sorting by this key before clustering makes the output independent of
/// the order rows came back from the store.
#[must_use]
pub fn canonical_order(a: &Report, b: &Report) -> Ordering {
    a.location
        .latitude
        .total_cmp(&b.location.latitude)
        .then(a.location.longitude.total_cmp(&b.location.longitude))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Partitions `points` into density-connected clusters.
///
/// Two points are neighbors when their Euclidean distance is at most
/// `eps` (a point is its own neighbor). A point with at least
/// `min_points` neighbors is a core point; clusters grow from core
/// points and absorb every neighbor, and points reached from no core
/// point are noise. A border point reachable from several clusters
/// belongs to the one with the lowest index.
///
/// Returns member indices per cluster, each list sorted, with clusters
/// in discovery order.
#[must_use]
pub fn cluster(points: &[GeoPoint], eps: f64, min_points: usize) -> Vec<Vec<usize>> {
    let tree = RTree::bulk_load(
        points
            .iter()
            .enumerate()
            .map(|(i, p)| GeomWithData::new([p.longitude, p.latitude], i))
            .collect(),
    );
    let eps_squared = eps * eps;

    let neighbors = |i: usize| -> Vec<usize> {
        let p = points[i];
        let mut found: Vec<usize> = tree
            .locate_within_distance([p.longitude, p.latitude], eps_squared)
            .map(|entry| entry.data)
            .collect();
        found.sort_unstable();
        found
    };

    let mut labels = vec![Label::Unvisited; points.len()];
    let mut clusters: Vec<Vec<usize>> = Vec::new();

    for i in 0..points.len() {
        if labels[i] != Label::Unvisited {
            continue;
        }

        let seeds = neighbors(i);
        if seeds.len() < min_points {
            labels[i] = Label::Noise;
            continue;
        }

        let id = clusters.len();
        labels[i] = Label::Cluster(id);
        let mut members = vec![i];
        let mut queue: VecDeque<usize> = seeds.into_iter().collect();

        while let Some(j) = queue.pop_front() {
            match labels[j] {
                Label::Cluster(_) => {}
                Label::Noise => {
                    labels[j] = Label::Cluster(id);
                    members.push(j);
                }
                Label::Unvisited => {
                    labels[j] = Label::Cluster(id);
                    members.push(j);

                    let reach = neighbors(j);
                    if reach.len() >= min_points {
                        queue.extend(reach);
                    }
                }
            }
        }

        members.sort_unstable();
        clusters.push(members);
    }

    clusters
}

/// Aggregate facts about one cluster of reports.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSummary {
    /// Number of reports in the cluster.
    pub report_count: usize,
    /// Number of distinct UTC calendar days among the reports.
    pub distinct_days: usize,
    /// Mean report location.
    pub centroid: GeoPoint,
    /// Most common zone among the reports, ties to the lowest id.
    pub dominant_zone: Option<i64>,
    /// Latest report timestamp.
    pub last_occurrence: DateTime<Utc>,
}

/// Summarizes the reports at `members`.
///
/// Returns `None` for an empty member list.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn summarize(reports: &[Report], members: &[usize]) -> Option<ClusterSummary> {
    let last_occurrence = members.iter().map(|&i| reports[i].created_at).max()?;

    let days: BTreeSet<NaiveDate> = members
        .iter()
        .map(|&i| reports[i].created_at.date_naive())
        .collect();

    let (lat_sum, lng_sum) = members.iter().fold((0.0, 0.0), |(lat, lng), &i| {
        (
            lat + reports[i].location.latitude,
            lng + reports[i].location.longitude,
        )
    });
    let n = members.len() as f64;

    let mut zone_counts: BTreeMap<i64, usize> = BTreeMap::new();
    for &i in members {
        if let Some(zone_id) = reports[i].zone_id {
            *zone_counts.entry(zone_id).or_default() += 1;
        }
    }
    // BTreeMap iterates ascending, and max_by_key keeps the last maximum,
    // so walk it in reverse to let the lowest id win ties.
    let dominant_zone = zone_counts
        .into_iter()
        .rev()
        .max_by_key(|&(_, count)| count)
        .map(|(zone_id, _)| zone_id);

    Some(ClusterSummary {
        report_count: members.len(),
        distinct_days: days.len(),
        centroid: GeoPoint::new(lat_sum / n, lng_sum / n),
        dominant_zone,
        last_occurrence,
    })
}
