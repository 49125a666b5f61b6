use crate::config::InputConfig;
use crate::error::PipelineError;
use crate::projection::Crs;
use crate::types::District;
use anyhow::{anyhow, Context, Result};
use geo::MultiPolygon;
use shapefile::dbase::FieldValue;
use shapefile::{Reader, Shape};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, warn};

pub fn load_districts(path: &Path, config: &InputConfig) -> Result<Vec<District>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("District geometry file has no extension"))?;

    let mut districts = match extension.as_str() {
        "shp" => load_shapefile_districts(path, &config.district_id_field)?,
        "json" | "geojson" => load_geojson_districts(path, &config.district_id_field)?,
        _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
    };

    let mut seen = HashSet::new();
    for district in &districts {
        if !seen.insert(district.id.as_str()) {
            return Err(PipelineError::DuplicateDistrict(district.id.clone()).into());
        }
    }

    let crs = Crs::resolve(config.district_crs, path)?;
    if crs != Crs::Sweref99Tm {
        for district in &mut districts {
            district.geometry = crs.to_sweref99tm(&district.geometry);
        }
    }

    info!("Loaded geometry for {} districts ({:?})", districts.len(), crs);
    Ok(districts)
}

/// County outlines in SWEREF99 TM, the frame districts are brought into too.
pub fn load_counties(path: &Path, config: &InputConfig) -> Result<Vec<MultiPolygon<f64>>> {
    let crs = Crs::resolve(config.county_crs, path)?;
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut counties = Vec::new();
    for result in reader.iter_shapes_and_records() {
        let (shape, _record) = result?;
        if let Some(geometry) = shape_to_multipolygon(shape)? {
            counties.push(crs.to_sweref99tm(&geometry));
        }
    }
    info!("Loaded {} county outlines ({:?})", counties.len(), crs);
    Ok(counties)
}

fn shape_to_multipolygon(shape: Shape) -> Result<Option<MultiPolygon<f64>>> {
    let geometry = match shape {
        Shape::Polygon(polygon) => {
            let geo_polygon: MultiPolygon<f64> = polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?;
            geo_polygon
        }
        Shape::PolygonM(polygon) => {
            let geo_polygon: MultiPolygon<f64> = polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?;
            geo_polygon
        }
        Shape::PolygonZ(polygon) => {
            let geo_polygon: MultiPolygon<f64> = polygon
                .try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?;
            geo_polygon
        }
        _ => return Ok(None),
    };
    Ok(Some(geometry))
}

fn load_shapefile_districts(path: &Path, id_field: &str) -> Result<Vec<District>> {
    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let mut districts = Vec::new();
    let mut unnamed = 0usize;
    for result in reader.iter_shapes_and_records() {
        let (shape, record) = result?;

        let id_value = record
            .get(id_field)
            .ok_or_else(|| anyhow!("Join column '{}' not found in Shapefile", id_field))?;
        let id = match id_value {
            FieldValue::Character(Some(s)) => s.trim().to_string(),
            FieldValue::Numeric(Some(n)) if n.fract() == 0.0 && *n >= 0.0 => format!("{:08}", *n as u64),
            FieldValue::Numeric(Some(n)) => {
                return Err(anyhow!("Join column '{}' holds {} which is not a district code", id_field, n))
            }
            FieldValue::Character(None) | FieldValue::Numeric(None) => {
                unnamed += 1;
                continue;
            }
            other => return Err(anyhow!("Unexpected type for join column: {:?}", other)),
        };

        if let Some(geometry) = shape_to_multipolygon(shape)? {
            districts.push(District { id, geometry });
        }
    }
    if unnamed > 0 {
        warn!("Skipped {} district shapes without an identifier", unnamed);
    }
    Ok(districts)
}

fn load_geojson_districts(path: &Path, id_field: &str) -> Result<Vec<District>> {
    use geojson::GeoJson;

    let file = File::open(path)
        .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
    let geojson = GeoJson::from_reader(BufReader::new(file)).context("Failed to parse GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut districts = Vec::new();
    for feature in collection.features {
        let id_val = feature
            .properties
            .as_ref()
            .and_then(|props| props.get(id_field));

        let id = match id_val {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => match n.as_u64() {
                Some(code) => format!("{:08}", code),
                None => continue,
            },
            _ => continue,
        };

        let geometry = match feature.geometry {
            Some(geom) => {
                let valid_geo: geo::Geometry<f64> = geom
                    .value
                    .try_into()
                    .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;
                match valid_geo {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => continue,
                }
            }
            None => continue,
        };

        districts.push(District { id, geometry });
    }
    Ok(districts)
}
