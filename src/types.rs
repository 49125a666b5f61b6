use geo::{MultiPolygon, Point};

/// An electoral district with its boundary in the projected district CRS.
#[derive(Debug, Clone)]
pub struct District {
    pub id: String,
    pub geometry: MultiPolygon<f64>,
}

/// One row of the wide vote table after code columns are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDistrictRow {
    pub district_id: String,
    /// (party code, raw count), in column order
    pub counts: Vec<(String, u64)>,
}

/// Long-form (district, party) row with both shares populated.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareRow {
    pub district_id: String,
    pub party: String,
    pub count: u64,
    /// NaN when the district has no retained votes
    pub district_share: f64,
    pub national_share: f64,
}

/// A share row carrying its district's representative point.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRecord {
    pub point: Point<f64>,
    pub share: ShareRow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub point: Point<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictionCell {
    pub point: Point<f64>,
    pub predicted_share: f64,
    /// Clamped log2 of predicted over national share
    pub display_ratio: f64,
}

/// Everything the renderer needs for one party's panel.
#[derive(Debug, Clone)]
pub struct PartyPrediction {
    pub party: String,
    pub national_share: f64,
    pub cells: Vec<PredictionCell>,
}
