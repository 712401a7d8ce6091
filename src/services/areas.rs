//! Catalog area tags and the region each one covers.
//!
//! A query coordinate is mapped to the first area whose bounding box contains
//! it; that area's product is then resolved from the catalog.

/// A geographic bounding box in WGS84 degrees, edges inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        }
    }

    /// Longitude is wrapped onto [-180, 180) before the check.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let lon = (lon + 180.0).rem_euclid(360.0) - 180.0;
        lat >= self.min_lat && lat <= self.max_lat && lon >= self.min_lon && lon <= self.max_lon
    }
}

/// Ordered list of (area tag, coverage). Earlier entries win where boxes overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaTable {
    areas: Vec<(String, BoundingBox)>,
}

impl AreaTable {
    pub fn new(areas: Vec<(String, BoundingBox)>) -> Self {
        Self { areas }
    }

    /// Area tag covering `(lat, lon)`, if any.
    pub fn area_for(&self, lat: f64, lon: f64) -> Option<&str> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        self.areas
            .iter()
            .find(|(_, bounds)| bounds.contains(lat, lon))
            .map(|(area, _)| area.as_str())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.areas.iter().map(|(area, _)| area.as_str())
    }

    /// Parse `name=min_lat,max_lat,min_lon,max_lon;name=...`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut areas = Vec::new();
        for item in raw.split(';').map(str::trim).filter(|item| !item.is_empty()) {
            let (name, bounds) = item
                .split_once('=')
                .ok_or_else(|| format!("'{}' is not of the form name=bounds", item))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(format!("'{}' has an empty area name", item));
            }

            let numbers = bounds
                .split(',')
                .map(|n| n.trim().parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| format!("bounds of '{}': {}", name, e))?;
            let [min_lat, max_lat, min_lon, max_lon] = numbers[..] else {
                return Err(format!(
                    "bounds of '{}' need 4 numbers, got {}",
                    name,
                    numbers.len()
                ));
            };
            if !(min_lat < max_lat && min_lon < max_lon) {
                return Err(format!("bounds of '{}' are empty", name));
            }

            areas.push((name.to_string(), BoundingBox::new(min_lat, max_lat, min_lon, max_lon)));
        }

        if areas.is_empty() {
            return Err("no areas listed".to_string());
        }
        Ok(Self { areas })
    }
}

impl Default for AreaTable {
    /// The two MET Norway isobaric regions.
    fn default() -> Self {
        Self::new(vec![
            (
                "southern_norway".to_string(),
                BoundingBox::new(54.0, 65.0, 0.0, 20.0),
            ),
            (
                "northern_norway".to_string(),
                BoundingBox::new(64.0, 72.5, 5.0, 33.0),
            ),
        ])
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// "south" covers the sample product grid (59–60°N, 10–11°E), "north" a
    /// separate region further north.
    pub(crate) fn test_areas() -> AreaTable {
        AreaTable::new(vec![
            ("south".to_string(), BoundingBox::new(55.0, 62.0, 5.0, 15.0)),
            ("north".to_string(), BoundingBox::new(66.0, 72.0, 12.0, 25.0)),
        ])
    }

    #[test]
    fn test_area_for_picks_containing_box() {
        let areas = test_areas();
        assert_eq!(areas.area_for(60.0, 10.0), Some("south"));
        assert_eq!(areas.area_for(70.0, 18.0), Some("north"));
        assert_eq!(areas.area_for(0.0, 0.0), None);
        assert_eq!(areas.area_for(f64::NAN, 10.0), None);
    }

    #[test]
    fn test_overlap_goes_to_first_listed() {
        let areas = AreaTable::default();
        assert_eq!(areas.area_for(64.5, 12.0), Some("southern_norway"));
        assert_eq!(areas.area_for(69.6, 18.9), Some("northern_norway"));
    }

    #[test]
    fn test_contains_wraps_longitude() {
        let bounds = BoundingBox::new(50.0, 60.0, -10.0, 10.0);
        assert!(bounds.contains(55.0, 355.0));
        assert!(!bounds.contains(55.0, 20.0));
    }

    #[test]
    fn test_parse() {
        let areas = AreaTable::parse("south=55,62,5,15; north = 66,72,12,25").unwrap();
        assert_eq!(areas, test_areas());
        assert_eq!(areas.names().collect::<Vec<_>>(), vec!["south", "north"]);

        assert!(AreaTable::parse("").is_err());
        assert!(AreaTable::parse("south").is_err());
        assert!(AreaTable::parse("south=55,62,5").is_err());
        assert!(AreaTable::parse("south=62,55,5,15").is_err());
        assert!(AreaTable::parse("south=a,62,5,15").is_err());
        assert!(AreaTable::parse("=55,62,5,15").is_err());
    }
}
