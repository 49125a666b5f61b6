use crate::config::CrsChoice;
use crate::error::PipelineError;
use anyhow::Result;
use geo::{Coord, MapCoords, MultiPolygon};
use std::fs;
use std::path::Path;

// GRS80
const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_222_101;

const CENTRAL_MERIDIAN: f64 = 15.0;
const SCALE: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Crs {
    Sweref99Tm,
    /// Longitude/latitude degrees on SWEREF99/WGS 84
    Geographic,
}

impl Crs {
    pub fn resolve(choice: CrsChoice, shapefile: &Path) -> Result<Crs> {
        match choice {
            CrsChoice::Sweref99tm => Ok(Crs::Sweref99Tm),
            CrsChoice::Wgs84 => Ok(Crs::Geographic),
            CrsChoice::Auto => {
                let prj = shapefile.with_extension("prj");
                match fs::read_to_string(&prj) {
                    Ok(wkt) => Ok(Crs::from_wkt(&wkt).map_err(|reason| {
                        PipelineError::UnsupportedCrs {
                            path: prj.display().to_string(),
                            reason,
                        }
                    })?),
                    Err(_) => {
                        tracing::warn!("No {:?}, assuming SWEREF99 TM", prj);
                        Ok(Crs::Sweref99Tm)
                    }
                }
            }
        }
    }

    pub fn from_wkt(wkt: &str) -> Result<Crs, String> {
        let upper = wkt.to_uppercase();
        if upper.trim_start().starts_with("GEOGCS") {
            return Ok(Crs::Geographic);
        }
        if !upper.trim_start().starts_with("PROJCS") {
            return Err("not a PROJCS or GEOGCS definition".into());
        }
        let normalized = upper.replace(['_', ' '], "");
        if normalized.contains("SWEREF99TM") {
            return Ok(Crs::Sweref99Tm);
        }
        let is_tm = normalized.contains("TRANSVERSEMERCATOR")
            && wkt_parameter(&upper, "CENTRAL_MERIDIAN") == Some(CENTRAL_MERIDIAN)
            && wkt_parameter(&upper, "SCALE_FACTOR") == Some(SCALE)
            && wkt_parameter(&upper, "FALSE_EASTING") == Some(FALSE_EASTING);
        if is_tm {
            Ok(Crs::Sweref99Tm)
        } else {
            Err("only SWEREF99 TM and geographic coordinates are supported".into())
        }
    }

    pub fn to_sweref99tm(self, geometry: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        match self {
            Crs::Sweref99Tm => geometry.clone(),
            Crs::Geographic => geometry.map_coords(|c| {
                let (east, north) = project_tm(c.y, c.x);
                Coord { x: east, y: north }
            }),
        }
    }
}

fn wkt_parameter(wkt: &str, name: &str) -> Option<f64> {
    let key = format!("PARAMETER[\"{}\",", name);
    let start = wkt.find(&key)? + key.len();
    let rest = &wkt[start..];
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

// Gauss-Krüger forward, degrees to (easting, northing)
pub fn project_tm(lat: f64, lon: f64) -> (f64, f64) {
    let e2 = F * (2.0 - F);
    let n = F / (2.0 - F);
    let a_roof = A / (1.0 + n) * (1.0 + n.powi(2) / 4.0 + n.powi(4) / 64.0);

    let ca = e2;
    let cb = (5.0 * e2.powi(2) - e2.powi(3)) / 6.0;
    let cc = (104.0 * e2.powi(3) - 45.0 * e2.powi(4)) / 120.0;
    let cd = 1237.0 * e2.powi(4) / 1260.0;

    let beta = [
        n / 2.0 - 2.0 * n.powi(2) / 3.0 + 5.0 * n.powi(3) / 16.0 + 41.0 * n.powi(4) / 180.0,
        13.0 * n.powi(2) / 48.0 - 3.0 * n.powi(3) / 5.0 + 557.0 * n.powi(4) / 1440.0,
        61.0 * n.powi(3) / 240.0 - 103.0 * n.powi(4) / 140.0,
        49561.0 * n.powi(4) / 161_280.0,
    ];

    let phi = lat.to_radians();
    let d_lambda = (lon - CENTRAL_MERIDIAN).to_radians();
    let s2 = phi.sin().powi(2);
    let phi_star = phi - phi.sin() * phi.cos() * (ca + cb * s2 + cc * s2.powi(2) + cd * s2.powi(3));

    let xi = (phi_star.tan() / d_lambda.cos()).atan();
    let eta = (phi_star.cos() * d_lambda.sin()).atanh();

    let mut north = xi;
    let mut east = eta;
    for (j, b) in beta.iter().enumerate() {
        let k = 2.0 * (j as f64 + 1.0);
        north += b * (k * xi).sin() * (k * eta).cosh();
        east += b * (k * xi).cos() * (k * eta).sinh();
    }

    (
        SCALE * a_roof * east + FALSE_EASTING,
        SCALE * a_roof * north,
    )
}
