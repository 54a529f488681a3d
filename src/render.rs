use crate::charts::bar_chart_svg;
use crate::config::AppConfig;
use crate::layers::{canton_layer, cluster_layer, province_layer};
use crate::processing::{cluster_points, Analysis, RegionLayer};
use crate::types::{GroupBy, GroupCount, ProvinceArea};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::info;

/// Totals and exclusion tallies for one species selection.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub species: String,
    pub records: usize,
    pub counted: u64,
    pub without_geometry: usize,
    pub unmatched: usize,
    pub without_id: usize,
    pub by_province: Vec<GroupCount>,
    pub by_canton: Vec<GroupCount>,
}

impl Summary {
    pub fn new(analysis: &Analysis<'_>, layer: &RegionLayer) -> Self {
        let counts = &analysis.counts;
        Summary {
            species: analysis.species.clone(),
            records: counts.total,
            counted: counts.matched(),
            without_geometry: counts.without_geometry,
            unmatched: counts.unmatched,
            without_id: counts.without_id,
            by_province: counts.charted(layer, GroupBy::Province),
            by_canton: counts.charted(layer, GroupBy::Canton),
        }
    }
}

/// Writes the full artifact set for one species into `config.output.dir`.
pub fn write_outputs(
    config: &AppConfig,
    layer: &RegionLayer,
    provinces: &[ProvinceArea],
    analysis: &Analysis<'_>,
) -> Result<Summary> {
    let dir = &config.output.dir;
    info!("Writing outputs for {} to {:?}", analysis.species, dir);
    fs::create_dir_all(dir.join("clusters")).context("Failed to create output directory")?;

    write_records_csv(&dir.join("records.csv"), analysis)?;

    let summary = Summary::new(analysis, layer);
    for (group, rows) in [(GroupBy::Canton, &summary.by_canton), (GroupBy::Province, &summary.by_province)] {
        write_counts_csv(&dir.join(format!("counts_by_{}.csv", group.as_str())), rows)?;
        let svg = bar_chart_svg(rows, group, &config.map.bar_color)?;
        write_file(&dir.join(format!("chart_{}.svg", group.as_str())), svg.as_bytes())?;
    }

    let cantons = canton_layer(layer, &analysis.counts, &config.map);
    write_file(&dir.join("cantons.geojson"), &serde_json::to_vec(&cantons)?)?;
    let provinces = province_layer(provinces, layer, &analysis.counts, &config.map);
    write_file(&dir.join("provinces.geojson"), &serde_json::to_vec(&provinces)?)?;

    for zoom in config.output.min_zoom..=config.output.max_zoom {
        let clusters = cluster_points(&analysis.records, zoom);
        let fc = cluster_layer(&clusters, zoom);
        write_file(&dir.join("clusters").join(format!("{}.geojson", zoom)), &serde_json::to_vec(&fc)?)?;
    }

    let json = serde_json::to_vec_pretty(&summary).context("Failed to serialise summary")?;
    write_file(&dir.join("summary.json"), &json)?;

    Ok(summary)
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))
}

fn write_records_csv(path: &Path, analysis: &Analysis<'_>) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    wtr.write_record(["Species", "Province", "Locality", "Date"])?;
    for row in analysis.rows() {
        wtr.write_record([&row.species, &row.province, &row.locality, &row.date])?;
    }
    wtr.flush()?;
    Ok(())
}

fn write_counts_csv(path: &Path, rows: &[GroupCount]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {:?}", path))?;
    wtr.write_record(["key", "label", "count"])?;
    for row in rows {
        wtr.write_record([row.key.as_str(), row.label.as_str(), row.count.to_string().as_str()])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::{CANTONES, OCCURRENCES};
    use crate::data::{read_geojson_regions, read_occurrences, OccurrenceFormat};
    use crate::dissolve::dissolve_provinces;
    use crate::processing::run;

    #[test]
    fn writes_every_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::from_toml("[input]\nboundaries = \"c.geojson\"").unwrap();
        config.output.dir = dir.path().to_path_buf();
        config.output.min_zoom = 6;
        config.output.max_zoom = 7;

        let format = OccurrenceFormat::from_config(&config);
        let set = read_occurrences(OCCURRENCES.as_bytes(), &format).unwrap();
        let regions = read_geojson_regions(CANTONES.as_bytes(), &config.regions).unwrap();
        let layer = RegionLayer::new(regions).unwrap();
        let provinces = dissolve_provinces(&layer);
        let analysis = run(&set, &layer, None).unwrap();

        let summary = write_outputs(&config, &layer, &provinces, &analysis).unwrap();
        assert_eq!(summary.species, "Ara macao");
        assert_eq!(summary.records, 3);
        assert_eq!(summary.counted, 2);
        assert_eq!(summary.without_geometry, 1);
        assert_eq!(summary.by_province.len(), 1);
        assert_eq!(summary.by_province[0].count, 2);

        for name in [
            "records.csv",
            "counts_by_canton.csv",
            "counts_by_province.csv",
            "chart_canton.svg",
            "chart_province.svg",
            "cantons.geojson",
            "provinces.geojson",
            "clusters/6.geojson",
            "clusters/7.geojson",
            "summary.json",
        ] {
            assert!(dir.path().join(name).exists(), "missing {}", name);
        }

        let records = fs::read_to_string(dir.path().join("records.csv")).unwrap();
        assert!(records.starts_with("Species,Province,Locality,Date"));
        assert_eq!(records.lines().count(), 4);

        let cantons = fs::read_to_string(dir.path().join("counts_by_canton.csv")).unwrap();
        assert!(cantons.contains("101,San José,1"));
        assert!(cantons.contains("102,Escazú,1"));
    }
}
