use crate::processing::RegionLayer;
use crate::types::ProvinceArea;
use geo::BooleanOps;
use geo::MultiPolygon;
use rayon::prelude::*;
use tracing::info;

/// Merges canton outlines into one geometry per province, in first-seen order.
pub fn dissolve_provinces(layer: &RegionLayer) -> Vec<ProvinceArea> {
    let mut names: Vec<&str> = Vec::new();
    for region in layer.regions() {
        if !names.contains(&region.province.as_str()) {
            names.push(&region.province);
        }
    }

    info!("Dissolving {} cantons into {} provinces...", layer.len(), names.len());

    names
        .par_iter()
        .map(|name| {
            let geometry = layer
                .regions()
                .iter()
                .filter(|r| r.province == *name)
                .fold(MultiPolygon::new(vec![]), |acc, region| {
                    if acc.0.is_empty() {
                        region.geometry.clone()
                    } else {
                        acc.union(&region.geometry)
                    }
                });
            ProvinceArea {
                name: name.to_string(),
                geometry,
            }
        })
        .collect()
}
