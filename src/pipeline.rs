use crate::config::AppConfig;
use crate::error::FitError;
use crate::grid::{self, Boundary};
use crate::processing::{self, JoinReport};
use crate::render::{self, MapFrame};
use crate::smoothing::Smoother;
use crate::tidy::{self, Normalized};
use crate::types::{District, GridPoint, JoinedRecord, PartyPrediction, RawDistrictRow};
use anyhow::{anyhow, Result};
use geo::{MultiPolygon, Point};
use rayon::prelude::*;
use tracing::{info, warn};

/// Result of smoothing every party on the shared grid.
pub struct Surfaces {
    pub predictions: Vec<PartyPrediction>,
    /// Parties whose fit failed, with the reason
    pub failed: Vec<(String, FitError)>,
}

/// Loaded inputs before any analysis.
pub struct Sources {
    pub table: Vec<RawDistrictRow>,
    pub districts: Vec<District>,
    pub counties: Vec<MultiPolygon<f64>>,
}

/// Everything the run produced, kept for reporting.
pub struct Outcome {
    pub normalized: Normalized,
    pub join: JoinReport,
    pub grid_points: usize,
    pub surfaces: Surfaces,
}

/// Fits one surface per party in parallel and evaluates it on the grid.
/// A party that cannot be fitted is reported and left out.
pub fn smooth_parties(
    smoother: &dyn Smoother,
    records: &[JoinedRecord],
    parties: &[(String, f64)],
    grid: &[GridPoint],
    clamp_range: f64,
) -> Surfaces {
    let training = processing::by_party(records);
    let queries: Vec<Point<f64>> = grid.iter().map(|g| g.point).collect();

    let results: Vec<(String, Result<PartyPrediction, FitError>)> = parties
        .par_iter()
        .map(|(party, national_share)| {
            let set = training.get(party).map(Vec::as_slice).unwrap_or(&[]);
            let (points, shares): (Vec<Point<f64>>, Vec<f64>) = set.iter().copied().unzip();
            let result = smoother.fit(&points, &shares).map(|model| {
                let predicted = model.predict(&queries);
                PartyPrediction {
                    party: party.clone(),
                    national_share: *national_share,
                    cells: render::prediction_cells(grid, &predicted, *national_share, clamp_range),
                }
            });
            (party.clone(), result)
        })
        .collect();

    let mut surfaces = Surfaces {
        predictions: Vec::new(),
        failed: Vec::new(),
    };
    for (party, result) in results {
        match result {
            Ok(prediction) => {
                let (lo, hi) = prediction
                    .cells
                    .iter()
                    .map(|c| c.predicted_share)
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
                info!(
                    "{}: {} grid cells, predicted share {:.3}..{:.3}",
                    party,
                    prediction.cells.len(),
                    lo,
                    hi
                );
                surfaces.predictions.push(prediction);
            }
            Err(e) => {
                warn!("{}: fit failed, panel omitted: {}", party, e);
                surfaces.failed.push((party, e));
            }
        }
    }
    surfaces
}

/// Normalize, join, smooth and render from already loaded sources.
pub fn run(config: &AppConfig, smoother: &dyn Smoother, sources: Sources) -> Result<Outcome> {
    let normalized = tidy::normalize(&sources.table, &config.table.excluded_party_codes);
    info!(
        "{} retained votes across {} parties",
        normalized.rows.iter().map(|r| r.count).sum::<u64>(),
        normalized.parties.len()
    );
    if !normalized.zero_vote_districts.is_empty() {
        warn!(
            "{} districts have no retained votes; their shares are undefined",
            normalized.zero_vote_districts.len()
        );
    }

    let (records, join) = processing::join_centroids(&sources.districts, normalized.rows.clone());

    let boundary = Boundary::new(&sources.counties);
    let bbox = boundary
        .bounding_rect()
        .ok_or_else(|| anyhow!("County layer has no polygons to define the national boundary"))?;
    let grid = grid::clipped_grid(&boundary, config.model.grid_resolution);

    let surfaces = smooth_parties(
        smoother,
        &records,
        &normalized.parties,
        &grid,
        config.output.clamp_log2_range,
    );

    let frame = MapFrame {
        bbox,
        cell: grid::cell_size(bbox, config.model.grid_resolution),
        counties: &sources.counties,
    };
    render::render_map(&config.output, &frame, &surfaces.predictions)?;

    Ok(Outcome {
        normalized,
        join,
        grid_points: grid.len(),
        surfaces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smoothing::{KernelSmoother, ThinPlateSpline};
    use crate::types::ShareRow;
    use approx::assert_abs_diff_eq;
    use geo::polygon;

    fn square(cx: f64, cy: f64, half: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: cx - half, y: cy - half),
            (x: cx + half, y: cy - half),
            (x: cx + half, y: cy + half),
            (x: cx - half, y: cy + half),
            (x: cx - half, y: cy - half),
        ]])
    }

    fn two_district_sources() -> Sources {
        Sources {
            table: vec![
                RawDistrictRow {
                    district_id: "01010001".into(),
                    counts: vec![("X".into(), 80), ("Y".into(), 20)],
                },
                RawDistrictRow {
                    district_id: "01010002".into(),
                    counts: vec![("X".into(), 20), ("Y".into(), 80)],
                },
            ],
            districts: vec![
                District {
                    id: "01010001".into(),
                    geometry: square(0.0, 0.0, 1.0),
                },
                District {
                    id: "01010002".into(),
                    geometry: square(10.0, 0.0, 1.0),
                },
            ],
            counties: vec![MultiPolygon::new(vec![polygon![
                (x: -1.0, y: -1.0), (x: 11.0, y: -1.0), (x: 11.0, y: 1.0), (x: -1.0, y: 1.0), (x: -1.0, y: -1.0),
            ]])],
        }
    }

    fn share<'a>(rows: &'a [ShareRow], district: &str, party: &str) -> &'a ShareRow {
        rows.iter()
            .find(|r| r.district_id == district && r.party == party)
            .unwrap()
    }

    #[test]
    fn two_district_scenario_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.model.grid_resolution = (12, 2);
        config.output.path = dir.path().join("map.png");
        config.output.width = 400;
        config.output.height = 200;
        config.output.labels = false;

        let outcome = run(&config, &ThinPlateSpline::new(25), two_district_sources()).unwrap();

        let rows = &outcome.normalized.rows;
        assert_abs_diff_eq!(share(rows, "01010001", "X").district_share, 0.8, epsilon = 1e-12);
        assert_abs_diff_eq!(share(rows, "01010002", "X").district_share, 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(share(rows, "01010001", "X").national_share, 0.5, epsilon = 1e-12);
        assert_eq!(outcome.join, JoinReport::default());
        assert_eq!(outcome.grid_points, 24);
        assert!(outcome.surfaces.failed.is_empty());
        assert_eq!(outcome.surfaces.predictions.len(), 2);

        let x = outcome
            .surfaces
            .predictions
            .iter()
            .find(|p| p.party == "X")
            .unwrap();
        // lattice column centres are at -0.5, 0.5, ..., 10.5; pick the one at x = 5.5
        let near_mid = x
            .cells
            .iter()
            .find(|c| (c.point.x() - 5.5).abs() < 1e-9)
            .unwrap();
        assert!((0.2..=0.8).contains(&near_mid.predicted_share));
        for cell in &x.cells {
            assert!((-1.0..=1.0).contains(&cell.display_ratio));
        }
        assert!(config.output.path.exists());
    }

    #[test]
    fn midpoint_prediction_for_each_smoother() {
        let sources = two_district_sources();
        let normalized = tidy::normalize(&sources.table, &[]);
        let (records, _) = processing::join_centroids(&sources.districts, normalized.rows);
        let grid = vec![GridPoint {
            point: Point::new(5.0, 0.0),
        }];

        let smoothers: Vec<Box<dyn Smoother>> =
            vec![Box::new(ThinPlateSpline::new(25)), Box::new(KernelSmoother::new(5.0))];
        for smoother in &smoothers {
            let surfaces = smooth_parties(smoother.as_ref(), &records, &normalized.parties, &grid, 1.0);
            let x = surfaces.predictions.iter().find(|p| p.party == "X").unwrap();
            let cell = x.cells[0];
            assert!((0.2..=0.8).contains(&cell.predicted_share));
            assert!((-1.0..=1.0).contains(&cell.display_ratio));
        }
    }

    #[test]
    fn failed_party_does_not_stop_the_others() {
        let mut sources = two_district_sources();
        sources.table[0].counts.push(("Z".into(), 5));
        sources.table[1].counts.push(("Z".into(), 0));
        let normalized = tidy::normalize(&sources.table, &[]);
        let mut rows = normalized.rows.clone();
        // Z is left with a single location
        rows.retain(|r| !(r.party == "Z" && r.district_id == "01010002"));
        let (records, _) = processing::join_centroids(&sources.districts, rows);
        let grid = vec![GridPoint {
            point: Point::new(5.0, 0.0),
        }];

        let surfaces = smooth_parties(&ThinPlateSpline::new(25), &records, &normalized.parties, &grid, 1.0);

        let fitted: Vec<&str> = surfaces.predictions.iter().map(|p| p.party.as_str()).collect();
        assert_eq!(fitted.len(), 2);
        assert!(fitted.contains(&"X") && fitted.contains(&"Y"));
        assert_eq!(surfaces.failed.len(), 1);
        assert_eq!(surfaces.failed[0].0, "Z");
    }
}
