use crate::config::{ModelConfig, SmootherKind};
use crate::error::FitError;
use geo::Point;
use nalgebra::{DMatrix, DVector};
use rstar::primitives::GeomWithData;
use rstar::RTree;

const MIN_LOCATIONS: usize = 2;

// GCV search grid, log10 of the multiplier on the balanced lambda
const LOG_LAMBDA_MIN: f64 = -6.0;
const LOG_LAMBDA_MAX: f64 = 3.0;
const LOG_LAMBDA_STEP: f64 = 0.25;

pub trait Smoother: Send + Sync {
    fn fit(&self, points: &[Point<f64>], targets: &[f64]) -> Result<Box<dyn SurfaceModel>, FitError>;
}

pub trait SurfaceModel: Send + Sync {
    fn predict(&self, points: &[Point<f64>]) -> Vec<f64>;
}

pub fn from_config(config: &ModelConfig) -> Box<dyn Smoother> {
    match config.smoother {
        SmootherKind::ThinPlate => Box::new(ThinPlateSpline::new(config.smoothing_complexity)),
        SmootherKind::Kernel => Box::new(KernelSmoother::new(config.kernel_bandwidth)),
    }
}

fn distinct_locations(points: &[Point<f64>], targets: &[f64]) -> Result<Vec<[f64; 2]>, FitError> {
    if points.len() != targets.len() {
        return Err(FitError::LengthMismatch {
            coords: points.len(),
            targets: targets.len(),
        });
    }
    if targets.iter().any(|t| !t.is_finite())
        || points.iter().any(|p| !p.x().is_finite() || !p.y().is_finite())
    {
        return Err(FitError::NonFinite);
    }
    let mut locations: Vec<[f64; 2]> = points.iter().map(|p| [p.x(), p.y()]).collect();
    locations.sort_by(|a, b| a[0].total_cmp(&b[0]).then(a[1].total_cmp(&b[1])));
    locations.dedup();
    if locations.len() < MIN_LOCATIONS {
        return Err(FitError::TooFewLocations {
            needed: MIN_LOCATIONS,
            got: locations.len(),
        });
    }
    Ok(locations)
}

// isotropic centring and scaling
#[derive(Debug, Clone, Copy)]
struct Frame {
    cx: f64,
    cy: f64,
    scale: f64,
}

impl Frame {
    fn new(points: &[Point<f64>]) -> Self {
        let n = points.len() as f64;
        let cx = points.iter().map(|p| p.x()).sum::<f64>() / n;
        let cy = points.iter().map(|p| p.y()).sum::<f64>() / n;
        let ms = points
            .iter()
            .map(|p| (p.x() - cx).powi(2) + (p.y() - cy).powi(2))
            .sum::<f64>()
            / n;
        let scale = if ms > 0.0 { ms.sqrt() } else { 1.0 };
        Self { cx, cy, scale }
    }

    fn apply(&self, x: f64, y: f64) -> [f64; 2] {
        [(x - self.cx) / self.scale, (y - self.cy) / self.scale]
    }
}

fn tps_radial(a: [f64; 2], b: [f64; 2]) -> f64 {
    let r2 = (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2);
    if r2 > 0.0 {
        // r² log r
        0.5 * r2 * r2.ln()
    } else {
        0.0
    }
}

// farthest-point sampling from the first sorted location
fn select_knots(locations: &[[f64; 2]], count: usize) -> Vec<[f64; 2]> {
    if locations.len() <= count {
        return locations.to_vec();
    }
    let d2 = |a: [f64; 2], b: [f64; 2]| (a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2);
    let mut knots = vec![locations[0]];
    let mut nearest: Vec<f64> = locations.iter().map(|&l| d2(l, locations[0])).collect();
    while knots.len() < count {
        let (idx, _) = nearest
            .iter()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, &d)| if d > best.1 { (i, d) } else { best });
        let knot = locations[idx];
        knots.push(knot);
        for (slot, &l) in nearest.iter_mut().zip(locations) {
            *slot = slot.min(d2(l, knot));
        }
    }
    knots
}

/// Orthonormal basis (columns) of radial coefficient vectors with `Tᵀδ = 0`.
fn constraint_basis(knots: &[[f64; 2]]) -> Result<DMatrix<f64>, FitError> {
    let m = knots.len();
    let t = DMatrix::from_fn(m, 3, |i, j| match j {
        0 => 1.0,
        1 => knots[i][0],
        _ => knots[i][1],
    });
    let ttt_pinv = t
        .tr_mul(&t)
        .pseudo_inverse(1e-10)
        .map_err(|e| FitError::Solve(e.to_string()))?;
    let projector = DMatrix::<f64>::identity(m, m) - &t * ttt_pinv * t.transpose();
    let eigen = projector.symmetric_eigen();
    let columns: Vec<DVector<f64>> = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .filter(|(_, v)| **v > 0.5)
        .map(|(i, _)| eigen.eigenvectors.column(i).into_owned())
        .collect();
    if columns.is_empty() {
        Ok(DMatrix::zeros(m, 0))
    } else {
        Ok(DMatrix::from_columns(&columns))
    }
}

#[derive(Debug, Clone)]
pub struct ThinPlateSpline {
    basis_dim: usize,
}

impl ThinPlateSpline {
    pub fn new(basis_dim: usize) -> Self {
        Self { basis_dim }
    }
}

impl Smoother for ThinPlateSpline {
    fn fit(&self, points: &[Point<f64>], targets: &[f64]) -> Result<Box<dyn SurfaceModel>, FitError> {
        let locations = distinct_locations(points, targets)?;
        let frame = Frame::new(points);
        let scaled: Vec<[f64; 2]> = locations.iter().map(|l| frame.apply(l[0], l[1])).collect();
        let knots = select_knots(&scaled, self.basis_dim);
        let z = constraint_basis(&knots)?;
        let (n, m, q) = (points.len(), knots.len(), z.ncols());

        let data: Vec<[f64; 2]> = points.iter().map(|p| frame.apply(p.x(), p.y())).collect();
        let e_data = DMatrix::from_fn(n, m, |i, j| tps_radial(data[i], knots[j]));
        let e_knots = DMatrix::from_fn(m, m, |i, j| tps_radial(knots[i], knots[j]));

        let mut x = DMatrix::<f64>::zeros(n, 3 + q);
        for (i, d) in data.iter().enumerate() {
            x[(i, 0)] = 1.0;
            x[(i, 1)] = d[0];
            x[(i, 2)] = d[1];
        }
        let mut s = DMatrix::<f64>::zeros(3 + q, 3 + q);
        if q > 0 {
            x.view_mut((0, 3), (n, q)).copy_from(&(&e_data * &z));
            let omega = z.tr_mul(&(&e_knots * &z));
            let omega = (&omega + omega.transpose()) * 0.5;
            s.view_mut((3, 3), (q, q)).copy_from(&omega);
        }

        let y = DVector::from_column_slice(targets);
        let (beta, lambda) = solve_gcv(&x, &s, &y)?;
        tracing::debug!(n, knots = m, lambda, "thin-plate spline fitted");

        let radial = if q > 0 {
            &z * beta.rows(3, q)
        } else {
            DVector::zeros(m)
        };
        Ok(Box::new(ThinPlateModel {
            frame,
            polynomial: [beta[0], beta[1], beta[2]],
            knots,
            radial: radial.iter().copied().collect(),
        }))
    }
}

/// Penalized least squares `(XᵀX + λS)β = Xᵀy` with λ picked by GCV; ties go to the larger λ.
fn solve_gcv(x: &DMatrix<f64>, s: &DMatrix<f64>, y: &DVector<f64>) -> Result<(DVector<f64>, f64), FitError> {
    let n = y.len() as f64;
    let p = x.ncols();
    let xtx = x.tr_mul(x);
    let xty = x.tr_mul(y);
    let balance = if s.trace() > 0.0 {
        xtx.trace() / s.trace()
    } else {
        1.0
    };
    let jitter = 1e-10 * xtx.trace().max(f64::MIN_POSITIVE) / p as f64;
    let base = &xtx + DMatrix::<f64>::identity(p, p) * jitter;

    let steps = ((LOG_LAMBDA_MAX - LOG_LAMBDA_MIN) / LOG_LAMBDA_STEP).round() as usize;
    let mut best: Option<(f64, f64, DVector<f64>)> = None;
    for step in (0..=steps).rev() {
        let lambda = balance * 10f64.powf(LOG_LAMBDA_MIN + step as f64 * LOG_LAMBDA_STEP);
        let a = &base + s * lambda;
        let Some(inv) = a
            .clone()
            .cholesky()
            .map(|c| c.inverse())
            .or_else(|| a.pseudo_inverse(1e-12).ok())
        else {
            continue;
        };
        let beta = &inv * &xty;
        let edf = (&inv * &xtx).trace();
        let rss = (y - x * &beta).norm_squared();
        let denom = n - edf;
        let gcv = if denom > 1e-8 {
            n * rss / (denom * denom)
        } else {
            f64::INFINITY
        };
        let better = match &best {
            None => true,
            Some((g, _, _)) => gcv < *g,
        };
        if better {
            best = Some((gcv, lambda, beta));
        }
    }
    best.map(|(_, lambda, beta)| (beta, lambda))
        .ok_or_else(|| FitError::Solve("no smoothing parameter gave a solvable system".into()))
}

#[derive(Debug, Clone)]
struct ThinPlateModel {
    frame: Frame,
    polynomial: [f64; 3],
    knots: Vec<[f64; 2]>,
    radial: Vec<f64>,
}

impl SurfaceModel for ThinPlateModel {
    fn predict(&self, points: &[Point<f64>]) -> Vec<f64> {
        points
            .iter()
            .map(|p| {
                let q = self.frame.apply(p.x(), p.y());
                let [a, b, c] = self.polynomial;
                let radial: f64 = self
                    .knots
                    .iter()
                    .zip(&self.radial)
                    .map(|(&k, w)| w * tps_radial(q, k))
                    .sum();
                a + b * q[0] + c * q[1] + radial
            })
            .collect()
    }
}

/// Gaussian Nadaraya-Watson, cut off at four bandwidths with a nearest-neighbour fallback.
#[derive(Debug, Clone)]
pub struct KernelSmoother {
    bandwidth: f64,
}

impl KernelSmoother {
    pub fn new(bandwidth: f64) -> Self {
        Self { bandwidth }
    }
}

impl Smoother for KernelSmoother {
    fn fit(&self, points: &[Point<f64>], targets: &[f64]) -> Result<Box<dyn SurfaceModel>, FitError> {
        distinct_locations(points, targets)?;
        let observations = points
            .iter()
            .zip(targets)
            .map(|(p, &t)| GeomWithData::new([p.x(), p.y()], t))
            .collect();
        Ok(Box::new(KernelModel {
            bandwidth: self.bandwidth,
            tree: RTree::bulk_load(observations),
        }))
    }
}

struct KernelModel {
    bandwidth: f64,
    tree: RTree<GeomWithData<[f64; 2], f64>>,
}

impl SurfaceModel for KernelModel {
    fn predict(&self, points: &[Point<f64>]) -> Vec<f64> {
        let cutoff = (4.0 * self.bandwidth).powi(2);
        let denom = 2.0 * self.bandwidth * self.bandwidth;
        points
            .iter()
            .map(|p| {
                let q = [p.x(), p.y()];
                let (mut num, mut den) = (0.0, 0.0);
                for obs in self.tree.locate_within_distance(q, cutoff) {
                    let g = obs.geom();
                    let w = (-((g[0] - q[0]).powi(2) + (g[1] - q[1]).powi(2)) / denom).exp();
                    num += w * obs.data;
                    den += w;
                }
                if den > 0.0 {
                    num / den
                } else {
                    self.tree.nearest_neighbor(&q).map_or(f64::NAN, |o| o.data)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn lattice(n: usize, step: f64) -> Vec<Point<f64>> {
        (0..n)
            .flat_map(|i| (0..n).map(move |j| Point::new(i as f64 * step, j as f64 * step)))
            .collect()
    }

    #[test]
    fn two_districts_interpolate_between_shares() {
        let points = vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)];
        let model = ThinPlateSpline::new(25).fit(&points, &[0.8, 0.2]).unwrap();
        let mid = model.predict(&[Point::new(5.0, 0.0)])[0];
        assert!((0.2..=0.8).contains(&mid), "midpoint prediction {}", mid);
        assert_abs_diff_eq!(mid, 0.5, epsilon = 1e-6);
    }

    #[test]
    fn plane_is_reproduced() {
        let points = lattice(12, 7_000.0);
        let plane = |p: &Point<f64>| 0.1 + 2e-6 * p.x() - 1e-6 * p.y();
        let targets: Vec<f64> = points.iter().map(plane).collect();
        let model = ThinPlateSpline::new(25).fit(&points, &targets).unwrap();

        let queries = vec![Point::new(3_500.0, 12_345.0), Point::new(50_000.0, 70_000.0)];
        for (q, v) in queries.iter().zip(model.predict(&queries)) {
            assert_abs_diff_eq!(v, plane(q), epsilon = 1e-5);
        }
    }

    #[test]
    fn smooth_surface_is_recovered() {
        let points = lattice(20, 0.5);
        let f = |p: &Point<f64>| 0.3 + 0.2 * (p.x() / 3.0).sin() * (p.y() / 4.0).cos();
        let targets: Vec<f64> = points.iter().map(f).collect();
        let model = ThinPlateSpline::new(25).fit(&points, &targets).unwrap();

        let queries: Vec<Point<f64>> = (0..10)
            .map(|i| Point::new(0.45 + i as f64 * 0.9, 9.0 - i as f64 * 0.85))
            .collect();
        let predicted = model.predict(&queries);
        let rms = (queries
            .iter()
            .zip(&predicted)
            .map(|(q, v)| (v - f(q)).powi(2))
            .sum::<f64>()
            / queries.len() as f64)
            .sqrt();
        assert!(rms < 0.03, "rms error {}", rms);
    }

    #[test]
    fn fit_does_not_depend_on_row_order() {
        let points = lattice(9, 1.0);
        let targets: Vec<f64> = points.iter().map(|p| (p.x() * p.y()).sqrt() / 10.0).collect();
        let forward = ThinPlateSpline::new(25).fit(&points, &targets).unwrap();

        let mut rev_points = points.clone();
        let mut rev_targets = targets.clone();
        rev_points.reverse();
        rev_targets.reverse();
        let backward = ThinPlateSpline::new(25).fit(&rev_points, &rev_targets).unwrap();

        let queries = vec![Point::new(2.5, 3.5), Point::new(7.2, 0.4)];
        for (a, b) in forward.predict(&queries).iter().zip(backward.predict(&queries)) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn knot_budget_is_respected() {
        let locations: Vec<[f64; 2]> = (0..100).map(|i| [i as f64, (i * i % 17) as f64]).collect();
        let knots = select_knots(&locations, 25);
        assert_eq!(knots.len(), 25);
        assert_eq!(knots[0], locations[0]);
        let mut unique = knots.clone();
        unique.dedup();
        assert_eq!(unique.len(), 25);
    }

    #[test]
    fn degenerate_inputs_fail() {
        let smoother = ThinPlateSpline::new(25);
        let same = vec![Point::new(1.0, 1.0); 3];
        assert_eq!(
            smoother.fit(&same, &[0.1, 0.2, 0.3]).err(),
            Some(FitError::TooFewLocations { needed: 2, got: 1 })
        );
        assert_eq!(
            smoother.fit(&same, &[0.1]).err(),
            Some(FitError::LengthMismatch { coords: 3, targets: 1 })
        );
        let points = vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0)];
        assert_eq!(smoother.fit(&points, &[0.1, f64::NAN]).err(), Some(FitError::NonFinite));
    }

    #[test]
    fn kernel_smoother_averages_neighbours() {
        let points = vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)];
        let model = KernelSmoother::new(5.0).fit(&points, &[0.8, 0.2]).unwrap();
        let out = model.predict(&[Point::new(5.0, 0.0), Point::new(0.0, 0.0), Point::new(500.0, 0.0)]);
        assert_abs_diff_eq!(out[0], 0.5, epsilon = 1e-12);
        assert!(out[1] > 0.5 && out[1] < 0.8);
        // nothing within range, falls back to the nearest district
        assert_abs_diff_eq!(out[2], 0.2, epsilon = 1e-12);
    }
}
