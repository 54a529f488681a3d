use chrono::NaiveDateTime;
use geo::{MultiPolygon, Point};
use serde::Serialize;

/// One cleaned Darwin Core occurrence row.
#[derive(Debug, Clone, PartialEq)]
pub struct Occurrence {
    pub id: Option<String>,
    pub species: String,
    pub state_province: Option<String>,
    pub locality: Option<String>,
    pub event_date: Option<NaiveDateTime>,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

impl Occurrence {
    /// Point geometry, present only when both coordinates are finite numbers.
    pub fn point(&self) -> Option<Point<f64>> {
        match (self.longitude, self.latitude) {
            (Some(lon), Some(lat)) if lon.is_finite() && lat.is_finite() => Some(Point::new(lon, lat)),
            _ => None,
        }
    }
}

/// Occurrences left after cleaning, plus how many rows were dropped for a missing species.
#[derive(Debug, Clone, Default)]
pub struct OccurrenceSet {
    pub records: Vec<Occurrence>,
    pub dropped_without_species: usize,
}

impl OccurrenceSet {
    /// Distinct species, alphabetically sorted.
    pub fn species(&self) -> Vec<String> {
        let mut species: Vec<String> = self.records.iter().map(|r| r.species.clone()).collect();
        species.sort();
        species.dedup();
        species
    }

    pub fn filter_species(&self, species: &str) -> Vec<&Occurrence> {
        self.records.iter().filter(|r| r.species == species).collect()
    }
}

/// An administrative polygon (canton) with its province.
#[derive(Debug, Clone)]
pub struct Region {
    pub code: i64,
    pub canton: String,
    pub province: String,
    pub geometry: MultiPolygon<f64>,
}

/// Cantons dissolved into a single province outline.
#[derive(Debug, Clone)]
pub struct ProvinceArea {
    pub name: String,
    pub geometry: MultiPolygon<f64>,
}

/// Attribute used to group per-region counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupBy {
    Province,
    Canton,
}

impl GroupBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupBy::Province => "province",
            GroupBy::Canton => "canton",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub key: String,
    pub label: String,
    pub count: u64,
}

/// A row of the filtered-records table.
#[derive(Debug, Clone, Serialize)]
pub struct RecordRow {
    pub species: String,
    pub province: String,
    pub locality: String,
    pub date: String,
}

impl From<&Occurrence> for RecordRow {
    fn from(record: &Occurrence) -> Self {
        RecordRow {
            species: record.species.clone(),
            province: record.state_province.clone().unwrap_or_default(),
            locality: record.locality.clone().unwrap_or_default(),
            date: format_date(record.event_date.as_ref()),
        }
    }
}

pub fn format_date(date: Option<&NaiveDateTime>) -> String {
    date.map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct PointCluster {
    pub tile: (u32, u32),
    pub center: Point<f64>,
    pub count: usize,
    // Only set for single-member clusters
    pub popup: Option<RecordRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn occurrence(species: &str, lon: Option<f64>, lat: Option<f64>) -> Occurrence {
        Occurrence {
            id: Some("1".into()),
            species: species.into(),
            state_province: None,
            locality: None,
            event_date: None,
            longitude: lon,
            latitude: lat,
        }
    }

    #[test]
    fn point_requires_both_finite_coordinates() {
        assert!(occurrence("a", Some(-84.0), Some(10.0)).point().is_some());
        assert!(occurrence("a", None, Some(10.0)).point().is_none());
        assert!(occurrence("a", Some(f64::NAN), Some(10.0)).point().is_none());
        assert!(occurrence("a", Some(-84.0), Some(f64::INFINITY)).point().is_none());
    }

    #[test]
    fn species_list_is_sorted_and_distinct() {
        let set = OccurrenceSet {
            records: vec![
                occurrence("Zamia fairchildiana", None, None),
                occurrence("Ara macao", None, None),
                occurrence("Zamia fairchildiana", None, None),
            ],
            dropped_without_species: 0,
        };
        assert_eq!(set.species(), vec!["Ara macao", "Zamia fairchildiana"]);
        assert_eq!(set.filter_species("Zamia fairchildiana").len(), 2);
        assert!(set.filter_species("Panthera onca").is_empty());
    }
}
