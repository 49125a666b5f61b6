use crate::types::{District, JoinedRecord, ShareRow};
use geo::{Centroid, Point};
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

/// What the inner join left behind.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinReport {
    /// Share rows whose district has no geometry
    pub dropped_vote_rows: usize,
    /// Distinct districts among those rows
    pub dropped_vote_districts: usize,
    /// Geometries with no vote rows
    pub dropped_geometries: usize,
}

/// Reduces each district polygon to its geometric centroid.
pub fn centroids(districts: &[District]) -> HashMap<&str, Point<f64>> {
    districts
        .iter()
        .filter_map(|d| d.geometry.centroid().map(|c| (d.id.as_str(), c)))
        .collect()
}

/// Inner join of share rows to district centroids on the district identifier.
/// Unmatched rows and geometries are dropped and counted.
pub fn join_centroids(districts: &[District], rows: Vec<ShareRow>) -> (Vec<JoinedRecord>, JoinReport) {
    let points = centroids(districts);
    let mut report = JoinReport::default();
    let mut matched: HashSet<&str> = HashSet::new();
    let mut missing: HashSet<String> = HashSet::new();

    let mut joined = Vec::with_capacity(rows.len());
    for share in rows {
        match points.get_key_value(share.district_id.as_str()) {
            Some((&id, &point)) => {
                matched.insert(id);
                joined.push(JoinedRecord { point, share });
            }
            None => {
                report.dropped_vote_rows += 1;
                missing.insert(share.district_id);
            }
        }
    }
    report.dropped_vote_districts = missing.len();
    report.dropped_geometries = districts
        .iter()
        .filter(|d| !matched.contains(d.id.as_str()))
        .count();

    info!("Joined {} share rows to district centroids", joined.len());
    if report.dropped_vote_rows > 0 || report.dropped_geometries > 0 {
        warn!(
            "Join dropped {} share rows ({} districts without geometry) and {} geometries without votes",
            report.dropped_vote_rows, report.dropped_vote_districts, report.dropped_geometries
        );
    }
    (joined, report)
}

/// Splits joined records into per-party training sets, skipping NaN shares.
pub fn by_party(records: &[JoinedRecord]) -> HashMap<String, Vec<(Point<f64>, f64)>> {
    let mut out: HashMap<String, Vec<(Point<f64>, f64)>> = HashMap::new();
    for r in records {
        let entry = out.entry(r.share.party.clone()).or_default();
        if r.share.district_share.is_finite() {
            entry.push((r.point, r.share.district_share));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, MultiPolygon};

    fn district(id: &str, x: f64) -> District {
        District {
            id: id.to_string(),
            geometry: MultiPolygon::new(vec![polygon![
                (x: x, y: 0.0),
                (x: x + 2.0, y: 0.0),
                (x: x + 2.0, y: 2.0),
                (x: x, y: 2.0),
                (x: x, y: 0.0),
            ]]),
        }
    }

    fn row(district: &str, party: &str, share: f64) -> ShareRow {
        ShareRow {
            district_id: district.to_string(),
            party: party.to_string(),
            count: 1,
            district_share: share,
            national_share: 0.5,
        }
    }

    #[test]
    fn centroid_is_geometric_centre() {
        let districts = vec![district("01010001", 10.0)];
        let points = centroids(&districts);
        assert_eq!(points["01010001"], Point::new(11.0, 1.0));
    }

    #[test]
    fn join_miss_is_dropped_and_counted() {
        let districts = vec![district("01010001", 0.0), district("01010003", 4.0)];
        let rows = vec![
            row("01010001", "S", 0.6),
            row("01010001", "M", 0.4),
            row("01010002", "S", 0.5),
            row("01010002", "M", 0.5),
        ];

        let (joined, report) = join_centroids(&districts, rows);

        assert_eq!(joined.len(), 2);
        assert!(joined.iter().all(|j| j.share.district_id == "01010001"));
        assert_eq!(
            report,
            JoinReport {
                dropped_vote_rows: 2,
                dropped_vote_districts: 1,
                dropped_geometries: 1,
            }
        );
    }

    #[test]
    fn nan_shares_are_left_out_of_training_sets() {
        let districts = vec![district("01010001", 0.0), district("01010002", 4.0)];
        let rows = vec![row("01010001", "S", 1.0), row("01010002", "S", f64::NAN)];
        let (joined, _) = join_centroids(&districts, rows);

        let sets = by_party(&joined);
        assert_eq!(sets["S"], vec![(Point::new(1.0, 1.0), 1.0)]);
    }
}
