//! GeoJSON overlays for the map: canton and province choropleths and the
//! clustered occurrence points.

use crate::config::MapConfig;
use crate::processing::{RegionCounts, RegionLayer};
use crate::types::{GroupBy, PointCluster, ProvinceArea};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject};
use serde_json::{json, Value};

/// Equal-interval classes over the observed value range.
#[derive(Debug, Clone)]
pub struct Classifier {
    pub breaks: Vec<f64>,
    pub colors: Vec<String>,
}

impl Classifier {
    pub fn equal_interval(values: &[u64], bins: usize, palette: &[String]) -> Self {
        let bins = bins.max(1);
        let min = values.iter().copied().min().unwrap_or(0) as f64;
        let max = values.iter().copied().max().unwrap_or(0) as f64;
        let breaks = (0..=bins)
            .map(|i| min + (max - min) * i as f64 / bins as f64)
            .collect();
        let colors = (0..bins)
            .map(|class| palette[class * palette.len() / bins].clone())
            .collect();
        Classifier { breaks, colors }
    }

    pub fn bins(&self) -> usize {
        self.colors.len()
    }

    pub fn class(&self, value: u64) -> usize {
        let min = self.breaks[0];
        let max = self.breaks[self.breaks.len() - 1];
        if max <= min {
            return 0;
        }
        let class = ((value as f64 - min) / (max - min) * self.bins() as f64).floor() as usize;
        class.min(self.bins() - 1)
    }

    pub fn color(&self, value: u64) -> &str {
        &self.colors[self.class(value)]
    }
}

fn object(value: Value) -> JsonObject {
    match value {
        Value::Object(map) => map,
        _ => JsonObject::new(),
    }
}

fn feature(geometry: geojson::Value, properties: Value) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(geometry)),
        id: None,
        properties: Some(object(properties)),
        foreign_members: None,
    }
}

fn choropleth(features: Vec<Feature>, classifier: &Classifier, map: &MapConfig, group: GroupBy) -> FeatureCollection {
    let legend = match group {
        GroupBy::Canton => "Occurrence records per canton",
        GroupBy::Province => "Occurrence records per province",
    };
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(object(json!({
            "name": format!("{} choropleth", group.as_str()),
            "legend": legend,
            "breaks": classifier.breaks,
            "colors": classifier.colors,
            "fill_opacity": map.fill_opacity,
            "line_opacity": map.line_opacity,
        }))),
    }
}

/// One feature per canton, zero-count cantons included.
pub fn canton_layer(layer: &RegionLayer, counts: &RegionCounts, map: &MapConfig) -> FeatureCollection {
    let values: Vec<u64> = counts.counts.values().copied().collect();
    let classifier = Classifier::equal_interval(&values, map.bins, &map.palette);

    let features = layer
        .regions()
        .iter()
        .map(|region| {
            let count = counts.count(region.code);
            feature(
                geojson::Value::from(&region.geometry),
                json!({
                    "code": region.code,
                    "canton": region.canton,
                    "province": region.province,
                    "count": count,
                    "class": classifier.class(count),
                    "fill": classifier.color(count),
                }),
            )
        })
        .collect();

    choropleth(features, &classifier, map, GroupBy::Canton)
}

/// One feature per dissolved province, shaded by the province total.
pub fn province_layer(
    provinces: &[ProvinceArea],
    layer: &RegionLayer,
    counts: &RegionCounts,
    map: &MapConfig,
) -> FeatureCollection {
    let totals = counts.grouped(layer, GroupBy::Province);
    let total_of = |name: &str| {
        totals.iter().find(|row| row.key == name).map(|row| row.count).unwrap_or(0)
    };
    let values: Vec<u64> = provinces.iter().map(|p| total_of(&p.name)).collect();
    let classifier = Classifier::equal_interval(&values, map.bins, &map.palette);

    let features = provinces
        .iter()
        .zip(values)
        .map(|(province, count)| {
            feature(
                geojson::Value::from(&province.geometry),
                json!({
                    "province": province.name,
                    "count": count,
                    "class": classifier.class(count),
                    "fill": classifier.color(count),
                }),
            )
        })
        .collect();

    choropleth(features, &classifier, map, GroupBy::Province)
}

pub fn cluster_layer(clusters: &[PointCluster], zoom: u8) -> FeatureCollection {
    let features = clusters
        .iter()
        .map(|cluster| {
            let mut properties = json!({
                "count": cluster.count,
                "tile": [cluster.tile.0, cluster.tile.1],
            });
            if let Some(row) = &cluster.popup {
                properties["species"] = json!(row.species);
                properties["province"] = json!(row.province);
                properties["date"] = json!(row.date);
            }
            feature(geojson::Value::from(&cluster.center), properties)
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(object(json!({ "name": "clustered records", "zoom": zoom }))),
    }
}
