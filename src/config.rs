use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result, anyhow, ensure};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub input: InputConfig,
    #[serde(default)]
    pub columns: ColumnConfig,
    #[serde(default)]
    pub regions: RegionFieldConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub map: MapConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InputConfig {
    /// Region polygons, `.geojson`/`.json` or `.shp`
    pub boundaries: PathBuf,
    pub occurrences: Option<PathBuf>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub quoting: bool,
}

/// Darwin Core column names in the occurrence file.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ColumnConfig {
    pub id: String,
    pub species: String,
    pub state_province: String,
    pub locality: String,
    pub event_date: String,
    pub longitude: String,
    pub latitude: String,
}

impl Default for ColumnConfig {
    fn default() -> Self {
        ColumnConfig {
            id: "gbifID".into(),
            species: "species".into(),
            state_province: "stateProvince".into(),
            locality: "locality".into(),
            event_date: "eventDate".into(),
            longitude: "decimalLongitude".into(),
            latitude: "decimalLatitude".into(),
        }
    }
}

/// Attribute names on the boundary layer.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegionFieldConfig {
    pub code: String,
    pub canton: String,
    pub province: String,
}

impl Default for RegionFieldConfig {
    fn default() -> Self {
        RegionFieldConfig {
            code: "CODNUM".into(),
            canton: "NCANTON".into(),
            province: "provincia".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub min_zoom: u8,
    pub max_zoom: u8,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            dir: PathBuf::from("output"),
            min_zoom: 5,
            max_zoom: 12,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MapConfig {
    /// [lat, lon]
    pub center: [f64; 2],
    pub zoom: u8,
    pub bins: usize,
    pub palette: Vec<String>,
    pub fill_opacity: f64,
    pub line_opacity: f64,
    pub bar_color: String,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            center: [10.0, -84.0],
            zoom: 7,
            bins: 8,
            // ColorBrewer Greens, 8 classes
            palette: ["#f7fcf5", "#e5f5e0", "#c7e9c0", "#a1d99b", "#74c476", "#41ab5d", "#238b45", "#005a32"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            fill_opacity: 0.5,
            line_opacity: 1.0,
            bar_color: "#41ab5d".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub max_upload_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig { port: 8501, max_upload_mb: 200 }
    }
}

fn default_delimiter() -> char {
    '\t'
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.output.min_zoom <= self.output.max_zoom,
            "output.min_zoom ({}) is greater than output.max_zoom ({})",
            self.output.min_zoom,
            self.output.max_zoom
        );
        ensure!(self.output.max_zoom <= 22, "output.max_zoom must be at most 22");
        ensure!(self.map.bins > 0, "map.bins must be at least 1");
        ensure!(!self.map.palette.is_empty(), "map.palette must not be empty");
        if !self.input.delimiter.is_ascii() {
            return Err(anyhow!("input.delimiter must be a single ASCII character"));
        }
        Ok(())
    }

    pub fn delimiter_byte(&self) -> u8 {
        // validate() guarantees ASCII
        self.input.delimiter as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [input]
            boundaries = "datos/cantones/cantones.geojson"
            "#,
        )
        .unwrap();

        assert_eq!(config.input.delimiter, '\t');
        assert!(config.input.quoting);
        assert!(config.input.occurrences.is_none());
        assert_eq!(config.columns.id, "gbifID");
        assert_eq!(config.regions.code, "CODNUM");
        assert_eq!(config.map.center, [10.0, -84.0]);
        assert_eq!(config.map.palette.len(), 8);
        assert_eq!(config.server.port, 8501);
    }

    #[test]
    fn overrides_are_read() {
        let config = AppConfig::from_toml(
            r#"
            [input]
            boundaries = "areas.shp"
            occurrences = "gbif.csv"
            delimiter = ","

            [regions]
            code = "ID"

            [output]
            dir = "out"
            min_zoom = 3
            max_zoom = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.delimiter_byte(), b',');
        assert_eq!(config.regions.code, "ID");
        assert_eq!(config.regions.canton, "NCANTON");
        assert_eq!(config.output.dir, PathBuf::from("out"));
        assert_eq!(config.output.max_zoom, 4);
    }

    #[test]
    fn rejects_inverted_zoom_range() {
        let err = AppConfig::from_toml(
            r#"
            [input]
            boundaries = "a.geojson"
            [output]
            min_zoom = 9
            max_zoom = 2
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("min_zoom"));
    }

    #[test]
    fn rejects_empty_palette() {
        let err = AppConfig::from_toml(
            r#"
            [input]
            boundaries = "a.geojson"
            [map]
            palette = []
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("palette"));
    }
}
