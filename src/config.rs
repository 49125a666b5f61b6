use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub input: InputConfig,
    pub table: TableConfig,
    pub model: ModelConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InputConfig {
    pub cache_dir: PathBuf,
    pub votes_url: String,
    pub votes_file: String,
    pub districts_url: String,
    pub districts_archive: String,
    /// Path of the district shapefile inside the extracted archive
    pub districts_member: String,
    pub counties_url: String,
    pub counties_archive: String,
    pub counties_member: String,
    pub district_id_field: String,
    pub district_crs: CrsChoice,
    pub county_crs: CrsChoice,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("data"),
            votes_url: "https://data.val.se/val/val2018/statistik/2018_R_per_valdistrikt.skv".into(),
            votes_file: "2018_R_per_valdistrikt.skv".into(),
            districts_url: "https://data.val.se/val/val2018/valgeografi/valdistrikt.zip".into(),
            districts_archive: "valdistrikt.zip".into(),
            districts_member: "valdistrikt.shp".into(),
            counties_url: "https://www.scb.se/contentassets/3443fea3fa6640f7a57ee22238a9ff4c/lan_scb.zip".into(),
            counties_archive: "lan_scb.zip".into(),
            counties_member: "LanSweref99TM/Lan_Sweref99TM_region.shp".into(),
            district_id_field: "Lkfv".into(),
            district_crs: CrsChoice::Auto,
            county_crs: CrsChoice::Auto,
        }
    }
}

/// How the county layer's coordinate reference system is determined.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CrsChoice {
    /// Read the `.prj` sidecar next to the shapefile
    Auto,
    Sweref99tm,
    Wgs84,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TableConfig {
    pub delimiter: char,
    pub encoding: Encoding,
    pub region_column: String,
    pub subregion_column: String,
    pub local_column: String,
    /// Regex selecting raw-count columns; the `party` group is the party code
    pub count_column_pattern: String,
    pub excluded_party_codes: Vec<String>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            delimiter: ';',
            encoding: Encoding::Latin1,
            region_column: "LAN".into(),
            subregion_column: "KOM".into(),
            local_column: "VALDIST".into(),
            count_column_pattern: r"^(?P<party>[A-ZÅÄÖ]{1,5})(?:\s+röster)?$".into(),
            excluded_party_codes: vec!["OG".into(), "ÖVR".into()],
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[serde(alias = "utf8", rename = "utf-8")]
    Utf8,
    #[serde(alias = "iso-8859-1")]
    Latin1,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SmootherKind {
    ThinPlate,
    Kernel,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConfig {
    pub smoother: SmootherKind,
    /// Basis dimension of the thin-plate smoother
    pub smoothing_complexity: usize,
    /// Gaussian bandwidth in metres, kernel smoother only
    pub kernel_bandwidth: f64,
    /// Lattice points along (x, y)
    pub grid_resolution: (usize, usize),
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            smoother: SmootherKind::ThinPlate,
            smoothing_complexity: 25,
            kernel_bandwidth: 40_000.0,
            grid_resolution: (100, 300),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Panels per row
    pub columns: usize,
    pub clamp_log2_range: f64,
    /// Draw titles, captions and legend text (needs system fonts)
    pub labels: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("party_popularity.png"),
            width: 1600,
            height: 1400,
            columns: 4,
            clamp_log2_range: 1.0,
            labels: true,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise falls back to the built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (nx, ny) = self.model.grid_resolution;
        if nx == 0 || ny == 0 {
            bail!("grid_resolution must be at least 1 in both directions, got ({nx}, {ny})");
        }
        if self.model.smoothing_complexity < 4 {
            bail!(
                "smoothing_complexity must be at least 4, got {}",
                self.model.smoothing_complexity
            );
        }
        if !(self.model.kernel_bandwidth > 0.0) {
            bail!("kernel_bandwidth must be positive");
        }
        if !(self.output.clamp_log2_range > 0.0) {
            bail!("clamp_log2_range must be positive");
        }
        if !self.table.delimiter.is_ascii() {
            bail!("delimiter must be a single ASCII character, got {:?}", self.table.delimiter);
        }
        if self.output.columns == 0 {
            bail!("output.columns must be at least 1");
        }
        self.table.count_regex()?;
        Ok(())
    }
}

impl TableConfig {
    pub fn count_regex(&self) -> Result<Regex> {
        let re = Regex::new(&self.count_column_pattern)
            .with_context(|| format!("Invalid count_column_pattern: {}", self.count_column_pattern))?;
        if !re.capture_names().any(|n| n == Some("party")) {
            return Err(anyhow!("count_column_pattern needs a named `party` group"));
        }
        Ok(re)
    }
}
