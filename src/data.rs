use crate::config::{AppConfig, ColumnConfig, RegionFieldConfig};
use crate::processing::RegionLayer;
use crate::types::{Occurrence, OccurrenceSet, Region};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use geo::MultiPolygon;
use shapefile::Reader;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{info, warn};

/// Settings for reading an occurrence table.
#[derive(Debug, Clone)]
pub struct OccurrenceFormat {
    pub delimiter: u8,
    pub quoting: bool,
    pub columns: ColumnConfig,
}

impl OccurrenceFormat {
    pub fn from_config(config: &AppConfig) -> Self {
        OccurrenceFormat {
            delimiter: config.delimiter_byte(),
            quoting: config.input.quoting,
            columns: config.columns.clone(),
        }
    }
}

pub fn load_occurrences(path: &Path, format: &OccurrenceFormat) -> Result<OccurrenceSet> {
    info!("Loading occurrences from {:?}", path);
    let file = File::open(path)
        .with_context(|| format!("Failed to open occurrence file: {:?}", path))?;
    read_occurrences(BufReader::new(file), format)
        .with_context(|| format!("Failed to read occurrence file: {:?}", path))
}

struct ColumnIndices {
    id: usize,
    species: usize,
    state_province: usize,
    locality: usize,
    event_date: usize,
    longitude: usize,
    latitude: usize,
}

impl ColumnIndices {
    fn resolve(headers: &StringRecord, columns: &ColumnConfig) -> Result<Self> {
        let find = |name: &str| {
            headers.iter().position(|h| h.trim() == name)
                .ok_or_else(|| anyhow!("Column '{}' not found in occurrence file", name))
        };
        Ok(ColumnIndices {
            id: find(columns.id.as_str())?,
            species: find(columns.species.as_str())?,
            state_province: find(columns.state_province.as_str())?,
            locality: find(columns.locality.as_str())?,
            event_date: find(columns.event_date.as_str())?,
            longitude: find(columns.longitude.as_str())?,
            latitude: find(columns.latitude.as_str())?,
        })
    }
}

/// Parses a Darwin Core table, dropping rows without a species.
pub fn read_occurrences<R: Read>(reader: R, format: &OccurrenceFormat) -> Result<OccurrenceSet> {
    let mut rdr = ReaderBuilder::new()
        .delimiter(format.delimiter)
        .quoting(format.quoting)
        .from_reader(reader);
    let headers = rdr.headers().context("Failed to read header row")?.clone();
    let cols = ColumnIndices::resolve(&headers, &format.columns)?;

    let mut set = OccurrenceSet::default();

    for (row, result) in rdr.records().enumerate() {
        // header is line 1
        let line = row + 2;
        let record = result.with_context(|| format!("Malformed row at line {}", line))?;

        let species = match non_empty(&record, cols.species) {
            Some(s) => s,
            None => {
                set.dropped_without_species += 1;
                continue;
            }
        };

        let event_date = match non_empty(&record, cols.event_date) {
            Some(raw) => Some(parse_event_date(&raw)
                .with_context(|| format!("Invalid eventDate at line {}", line))?),
            None => None,
        };

        set.records.push(Occurrence {
            id: non_empty(&record, cols.id),
            species,
            state_province: non_empty(&record, cols.state_province),
            locality: non_empty(&record, cols.locality),
            event_date,
            longitude: parse_coordinate(record.get(cols.longitude)),
            latitude: parse_coordinate(record.get(cols.latitude)),
        });
    }

    info!(
        "Loaded {} occurrences ({} dropped without species)",
        set.records.len(),
        set.dropped_without_species
    );
    Ok(set)
}

fn non_empty(record: &StringRecord, idx: usize) -> Option<String> {
    record.get(idx)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_coordinate(value: Option<&str>) -> Option<f64> {
    value
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Parses the date forms found in GBIF downloads. Intervals keep their start.
pub fn parse_event_date(raw: &str) -> Result<NaiveDateTime> {
    let value = raw.trim();
    let value = value.split_once('/').map(|(start, _)| start).unwrap_or(value);

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc).naive_utc());
    }
    // Zulu suffix as an explicit offset so `%z` covers it
    let zoned = match value.strip_suffix('Z') {
        Some(local) => format!("{}+0000", local),
        None => value.to_string(),
    };
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z", "%Y-%m-%d %H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(&zoned, fmt) {
            return Ok(dt.with_timezone(&Utc).naive_utc());
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_time(chrono::NaiveTime::MIN));
    }
    if value.len() == 7 {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", value), "%Y-%m-%d") {
            return Ok(date.and_time(chrono::NaiveTime::MIN));
        }
    }
    if value.len() == 4 {
        if let Some(date) = value.parse::<i32>().ok().and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1)) {
            return Ok(date.and_time(chrono::NaiveTime::MIN));
        }
    }
    Err(anyhow!("Unrecognised date '{}'", raw))
}

/// Region codes stored as floats must be whole numbers.
fn integral_code(value: f64) -> Option<i64> {
    (value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64).then(|| value as i64)
}

pub fn load_regions(config: &AppConfig) -> Result<RegionLayer> {
    let path = &config.input.boundaries;
    info!("Loading boundaries from {:?}", path);

    let extension = path.extension()
        .and_then(|e| e.to_str())
        .map(|s: &str| s.to_lowercase())
        .ok_or_else(|| anyhow!("Boundary file has no extension"))?;

    let regions = match extension.as_str() {
        "shp" => load_shapefile_regions(path, &config.regions)?,
        "json" | "geojson" => {
            let file = File::open(path)
                .with_context(|| format!("Failed to open GeoJSON file: {:?}", path))?;
            read_geojson_regions(BufReader::new(file), &config.regions)?
        }
        _ => return Err(anyhow!("Unsupported geometry format: {}", extension)),
    };

    info!("Loaded {} regions", regions.len());
    RegionLayer::new(regions)
}

fn load_shapefile_regions(path: &Path, fields: &RegionFieldConfig) -> Result<Vec<Region>> {
    use shapefile::dbase::FieldValue;

    let mut reader = Reader::from_path(path)
        .with_context(|| format!("Failed to open Shapefile: {:?}", path))?;

    let text = |value: Option<&FieldValue>| match value {
        Some(FieldValue::Character(Some(s))) | Some(FieldValue::Memo(s)) => s.trim().to_string(),
        _ => String::new(),
    };

    let mut regions = Vec::new();

    for (n, result) in reader.iter_shapes_and_records().enumerate() {
        let (shape, record) = result?;

        let code = match record.get(fields.code.as_str()) {
            Some(FieldValue::Numeric(Some(v))) | Some(FieldValue::Double(v)) => integral_code(*v),
            Some(FieldValue::Float(Some(v))) => integral_code(f64::from(*v)),
            Some(FieldValue::Integer(v)) => Some(*v as i64),
            Some(FieldValue::Character(Some(s))) => s.trim().parse().ok(),
            Some(_) => None,
            None => bail!("Code field '{}' not found in Shapefile", fields.code),
        }
        .ok_or_else(|| anyhow!("Shape {} has no usable '{}' code", n, fields.code))?;

        let geometry: MultiPolygon<f64> = match shape {
            shapefile::Shape::Polygon(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygon: {:?}", e))?,
            shapefile::Shape::PolygonM(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygonM: {:?}", e))?,
            shapefile::Shape::PolygonZ(polygon) => polygon.try_into()
                .map_err(|e| anyhow!("Failed to convert polygonZ: {:?}", e))?,
            _ => {
                warn!("Skipping non-polygon shape for region {}", code);
                continue;
            }
        };

        regions.push(Region {
            code,
            canton: text(record.get(fields.canton.as_str())),
            province: text(record.get(fields.province.as_str())),
            geometry,
        });
    }

    Ok(regions)
}

pub fn read_geojson_regions<R: Read>(reader: R, fields: &RegionFieldConfig) -> Result<Vec<Region>> {
    use geojson::GeoJson;
    use serde_json::Value as Json;

    // warning: this loads the whole file into memory.
    let geojson = GeoJson::from_reader(reader).context("Failed to parse GeoJSON")?;

    let collection = match geojson {
        GeoJson::FeatureCollection(fc) => fc,
        _ => return Err(anyhow!("GeoJSON must be a FeatureCollection")),
    };

    let mut regions = Vec::new();

    for (n, feature) in collection.features.into_iter().enumerate() {
        let props = feature.properties.as_ref();
        let prop = |name: &str| props.and_then(|p| p.get(name));

        let code = match prop(fields.code.as_str()) {
            Some(Json::Number(v)) => v.as_i64().or_else(|| v.as_f64().and_then(integral_code)),
            Some(Json::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| anyhow!("Feature {} has no usable '{}' code", n, fields.code))?;

        let text = |name: &str| match prop(name) {
            Some(Json::String(s)) => s.trim().to_string(),
            Some(Json::Number(v)) => v.to_string(),
            _ => String::new(),
        };
        let canton = text(fields.canton.as_str());
        let province = text(fields.province.as_str());

        let geometry = match feature.geometry {
            Some(geo) => {
                let valid_geo: geo::Geometry<f64> = geo.value.try_into()
                    .map_err(|e| anyhow!("Failed to convert geojson geometry: {:?}", e))?;

                match valid_geo {
                    geo::Geometry::MultiPolygon(mp) => mp,
                    geo::Geometry::Polygon(p) => MultiPolygon::new(vec![p]),
                    _ => {
                        warn!("Skipping region {} with non-polygon geometry", code);
                        continue;
                    }
                }
            }
            None => {
                warn!("Skipping region {} without geometry", code);
                continue;
            }
        };

        regions.push(Region { code, canton, province, geometry });
    }

    Ok(regions)
}
