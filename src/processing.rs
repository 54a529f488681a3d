use crate::types::{GroupBy, GroupCount, Occurrence, OccurrenceSet, PointCluster, RecordRow, Region};
use anyhow::{Result, anyhow, bail};
use geo::algorithm::bounding_rect::BoundingRect;
use geo::algorithm::intersects::Intersects;
use geo::Point;
use rayon::prelude::*;
use rstar::{RTree, RTreeObject, AABB};
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use tracing::{info, warn};

// Web Mercator is undefined past this latitude
const MAX_MERCATOR_LAT: f64 = 85.051_128_78;

// Wrapper for RTree indexing
struct RegionEnvelope {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for RegionEnvelope {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

/// The immutable boundary layer with a bounding-box index for point lookup.
pub struct RegionLayer {
    regions: Vec<Region>,
    tree: RTree<RegionEnvelope>,
}

impl RegionLayer {
    pub fn new(regions: Vec<Region>) -> Result<Self> {
        let mut seen = HashMap::new();
        for (i, region) in regions.iter().enumerate() {
            if let Some(first) = seen.insert(region.code, i) {
                bail!(
                    "Region code {} appears twice in the boundary layer (features {} and {})",
                    region.code,
                    first,
                    i
                );
            }
        }

        let items: Vec<RegionEnvelope> = regions
            .iter()
            .enumerate()
            .filter_map(|(index, region)| {
                let rect = region.geometry.bounding_rect()?;
                Some(RegionEnvelope {
                    index,
                    aabb: AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                })
            })
            .collect();

        info!("Built spatial index for {} regions", items.len());
        Ok(RegionLayer {
            regions,
            tree: RTree::bulk_load(items),
        })
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region covering `point`, boundary included. On a shared edge the
    /// region listed first in the layer wins.
    pub fn locate(&self, point: &Point<f64>) -> Option<&Region> {
        let envelope = AABB::from_point([point.x(), point.y()]);
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .filter(|candidate| self.regions[candidate.index].geometry.intersects(point))
            .map(|candidate| candidate.index)
            .min()
            .map(|index| &self.regions[index])
    }
}

/// Per-region occurrence counts for one species, with every excluded record accounted for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCounts {
    /// Every region code in the layer, zero counts included
    pub counts: BTreeMap<i64, u64>,
    pub total: usize,
    pub without_geometry: usize,
    pub unmatched: usize,
    pub without_id: usize,
}

enum JoinOutcome {
    Matched(i64),
    NoGeometry,
    Unmatched,
    NoId,
}

/// Spatial join of `records` against `layer` followed by a count per region code.
pub fn aggregate(records: &[&Occurrence], layer: &RegionLayer) -> RegionCounts {
    let outcomes: Vec<JoinOutcome> = records
        .par_iter()
        .map(|record| {
            let Some(point) = record.point() else {
                return JoinOutcome::NoGeometry;
            };
            match layer.locate(&point) {
                None => JoinOutcome::Unmatched,
                Some(_) if record.id.is_none() => JoinOutcome::NoId,
                Some(region) => JoinOutcome::Matched(region.code),
            }
        })
        .collect();

    let mut counts: BTreeMap<i64, u64> = layer.regions().iter().map(|r| (r.code, 0)).collect();
    let mut result = RegionCounts {
        counts: BTreeMap::new(),
        total: records.len(),
        without_geometry: 0,
        unmatched: 0,
        without_id: 0,
    };

    for outcome in outcomes {
        match outcome {
            JoinOutcome::Matched(code) => *counts.entry(code).or_default() += 1,
            JoinOutcome::NoGeometry => result.without_geometry += 1,
            JoinOutcome::Unmatched => result.unmatched += 1,
            JoinOutcome::NoId => result.without_id += 1,
        }
    }
    result.counts = counts;

    if result.excluded() > 0 {
        warn!(
            "{} of {} records not counted in any region ({} without coordinates, {} outside every region, {} without identifier)",
            result.excluded(),
            result.total,
            result.without_geometry,
            result.unmatched,
            result.without_id
        );
    }

    result
}

impl RegionCounts {
    pub fn matched(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn excluded(&self) -> usize {
        self.without_geometry + self.unmatched + self.without_id
    }

    pub fn count(&self, code: i64) -> u64 {
        self.counts.get(&code).copied().unwrap_or(0)
    }

    /// Counts collapsed by `group`, zero groups included, in layer order.
    pub fn grouped(&self, layer: &RegionLayer, group: GroupBy) -> Vec<GroupCount> {
        match group {
            GroupBy::Canton => layer
                .regions()
                .iter()
                .map(|region| GroupCount {
                    key: region.code.to_string(),
                    label: region.canton.clone(),
                    count: self.count(region.code),
                })
                .collect(),
            GroupBy::Province => {
                let mut order: Vec<String> = Vec::new();
                let mut totals: HashMap<&str, u64> = HashMap::new();
                for region in layer.regions() {
                    if !totals.contains_key(region.province.as_str()) {
                        order.push(region.province.clone());
                    }
                    *totals.entry(region.province.as_str()).or_default() += self.count(region.code);
                }
                order
                    .into_iter()
                    .map(|province| {
                        let count = totals[province.as_str()];
                        GroupCount {
                            key: province.clone(),
                            label: province,
                            count,
                        }
                    })
                    .collect()
            }
        }
    }

    /// Rows for bar charts: positive counts only, highest first, ties by label.
    pub fn charted(&self, layer: &RegionLayer, group: GroupBy) -> Vec<GroupCount> {
        let mut rows: Vec<GroupCount> = self
            .grouped(layer, group)
            .into_iter()
            .filter(|row| row.count > 0)
            .collect();
        rows.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.label.cmp(&b.label)));
        rows
    }
}

/// Picks the requested species, or the first one alphabetically.
pub fn resolve_species(set: &OccurrenceSet, requested: Option<&str>) -> Result<String> {
    let species = set.species();
    match requested {
        Some(name) if species.iter().any(|s| s == name) => Ok(name.to_string()),
        Some(name) => Err(anyhow!("Species '{}' does not occur in the uploaded file", name)),
        None => species
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("The occurrence file has no records with a species")),
    }
}

/// Everything computed for one species selection.
pub struct Analysis<'a> {
    pub species: String,
    pub records: Vec<&'a Occurrence>,
    pub counts: RegionCounts,
}

impl Analysis<'_> {
    pub fn rows(&self) -> Vec<RecordRow> {
        self.records.iter().map(|r| RecordRow::from(*r)).collect()
    }
}

/// Filter to one species and aggregate. Pure: same inputs, same counts.
pub fn run<'a>(set: &'a OccurrenceSet, layer: &RegionLayer, species: Option<&str>) -> Result<Analysis<'a>> {
    let species = resolve_species(set, species)?;
    let records = set.filter_species(&species);
    info!("Aggregating {} records of {}", records.len(), species);
    let counts = aggregate(&records, layer);
    Ok(Analysis { species, records, counts })
}

/// Tile cell containing a lon/lat at `zoom`.
pub fn lon_lat_to_tile(lon: f64, lat: f64, zoom: u8) -> (u32, u32) {
    let n = 2.0_f64.powi(zoom as i32);
    let lat = lat.clamp(-MAX_MERCATOR_LAT, MAX_MERCATOR_LAT);
    let lon = lon.clamp(-180.0, 180.0);
    let x_t = (lon + 180.0) / 360.0 * n;
    let lat_rad = lat.to_radians();
    let y_t = (1.0 - (lat_rad.tan() + (1.0 / lat_rad.cos())).ln() / PI) / 2.0 * n;

    let max = n as u32 - 1;
    ((x_t as u32).min(max), (y_t.max(0.0) as u32).min(max))
}

/// Groups located records into one cluster per occupied tile cell.
pub fn cluster_points(records: &[&Occurrence], zoom: u8) -> Vec<PointCluster> {
    let mut cells: BTreeMap<(u32, u32), Vec<&Occurrence>> = BTreeMap::new();
    for record in records {
        if let Some(point) = record.point() {
            cells.entry(lon_lat_to_tile(point.x(), point.y(), zoom)).or_default().push(record);
        }
    }

    cells
        .into_iter()
        .map(|(tile, members)| {
            let count = members.len();
            let (sum_x, sum_y) = members
                .iter()
                .filter_map(|m| m.point())
                .fold((0.0, 0.0), |(x, y), p| (x + p.x(), y + p.y()));
            PointCluster {
                tile,
                center: Point::new(sum_x / count as f64, sum_y / count as f64),
                count,
                popup: (count == 1).then(|| RecordRow::from(members[0])),
            }
        })
        .collect()
}
