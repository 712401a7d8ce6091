//! Per-location isobaric profiles.
//!
//! `get_profile` runs the whole pipeline for one query: map the coordinate to
//! the catalog area covering it, resolve that area's product, load its decoded
//! grid (memo, SQLite cache or download), pick the nearest grid point and
//! derive every layer there.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::errors::IsobaricError;
use crate::services::areas::AreaTable;
use crate::services::derivation::{self, DerivedLayerValues, WindShear};
use crate::services::grib::{DecodedGrid, GridCoordinate, GridVectors};
use crate::services::met::{AvailabilityEntry, AvailabilityResolver};
use crate::services::product::ProductRepository;

/// One pressure level of a profile: the raw reading and what was derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileLayer {
    pub vectors: GridVectors,
    pub values: DerivedLayerValues,
}

impl ProfileLayer {
    pub fn pressure_hpa(&self) -> u32 {
        self.values.pressure_hpa
    }
}

/// Shear between two adjacent layers, `lower` being the higher-pressure one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerShear {
    pub lower_hpa: u32,
    pub upper_hpa: u32,
    pub shear: Option<WindShear>,
}

/// Wind and temperature profile at one grid point.
#[derive(Debug, Clone)]
pub struct Profile {
    pub area: String,
    /// Valid time of the product the profile was taken from.
    pub time: DateTime<Utc>,
    /// Update marker of that product.
    pub updated: DateTime<Utc>,
    pub grid_point: GridCoordinate,
    /// Distance from the query point to `grid_point`, degrees.
    pub distance_deg: f64,
    /// Ordered by descending pressure: the layer nearest the ground first.
    pub layers: Vec<ProfileLayer>,
}

impl Profile {
    /// Build the profile at the grid point nearest `(lat, lon)`.
    pub fn from_grid(
        grid: &DecodedGrid,
        entry: &AvailabilityEntry,
        lat: f64,
        lon: f64,
    ) -> Result<Self, IsobaricError> {
        let out_of_bounds = || IsobaricError::OutOfBounds { lat, lon };
        if !lat.is_finite() || !lon.is_finite() {
            return Err(out_of_bounds());
        }

        let (grid_point, distance_deg) = grid.nearest(lat, lon).ok_or_else(out_of_bounds)?;
        let levels = grid.vectors_at(&grid_point).ok_or_else(out_of_bounds)?;

        let mut values: Vec<DerivedLayerValues> = levels
            .iter()
            .rev()
            .map(|(&pressure, vectors)| derivation::derive(vectors, pressure))
            .collect();
        derivation::true_altitudes(&mut values);

        let layers = levels
            .values()
            .rev()
            .zip(values)
            .map(|(vectors, values)| ProfileLayer {
                vectors: *vectors,
                values,
            })
            .collect();

        Ok(Self {
            area: entry.area.clone(),
            time: grid.time,
            updated: entry.updated,
            grid_point,
            distance_deg,
            layers,
        })
    }

    #[cfg(test)]
    pub fn layer(&self, pressure_hpa: u32) -> Option<&ProfileLayer> {
        self.layers.iter().find(|l| l.pressure_hpa() == pressure_hpa)
    }

    /// Shear across every adjacent pair of layers, bottom to top.
    pub fn shears(&self) -> Vec<LayerShear> {
        self.layers
            .windows(2)
            .map(|pair| LayerShear {
                lower_hpa: pair[0].pressure_hpa(),
                upper_hpa: pair[1].pressure_hpa(),
                shear: derivation::shear(&pair[0].vectors, &pair[1].vectors),
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct ProfileService {
    resolver: AvailabilityResolver,
    repository: Arc<ProductRepository>,
    areas: Arc<AreaTable>,
    /// Area the background poller keeps warm.
    poll_area: String,
}

impl ProfileService {
    pub fn new(
        resolver: AvailabilityResolver,
        repository: Arc<ProductRepository>,
        areas: AreaTable,
        poll_area: &str,
    ) -> Self {
        Self {
            resolver,
            repository,
            areas: Arc::new(areas),
            poll_area: poll_area.to_string(),
        }
    }

    /// Area the background poller keeps warm.
    pub fn area(&self) -> &str {
        &self.poll_area
    }

    pub fn resolver(&self) -> &AvailabilityResolver {
        &self.resolver
    }

    pub fn repository(&self) -> &Arc<ProductRepository> {
        &self.repository
    }

    /// Profile at `(lat, lon)` from the product valid closest to `time`.
    ///
    /// A coordinate outside every configured area is
    /// [`IsobaricError::OutOfBounds`] without any upstream request. Otherwise
    /// the first failing stage's error is returned unchanged.
    pub async fn get_profile(
        &self,
        lat: f64,
        lon: f64,
        time: DateTime<Utc>,
    ) -> Result<Profile, IsobaricError> {
        let area = self
            .areas
            .area_for(lat, lon)
            .ok_or(IsobaricError::OutOfBounds { lat, lon })?;
        let entry = self.resolver.resolve_availability_at(area, time).await?;
        let loaded = self.repository.load_grid(&entry).await?;
        Profile::from_grid(&loaded.grid, &entry, lat, lon)
    }

    /// Like [`get_profile`](Self::get_profile), but gives up with
    /// [`IsobaricError::Cancelled`] as soon as `cancel` fires. A cancelled
    /// query never leaves a partially written cache entry behind.
    pub async fn get_profile_cancellable(
        &self,
        lat: f64,
        lon: f64,
        time: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Profile, IsobaricError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Profile query at ({}, {}) cancelled", lat, lon);
                Err(IsobaricError::Cancelled)
            }
            result = self.get_profile(lat, lon, time) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::ProductCacheStore;
    use crate::services::areas::tests::test_areas;
    use crate::services::grib::testdata::{sample_product, Grib2Builder};
    use crate::services::met::tests::catalog_row;
    use crate::services::met::ProductFetcher;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const UPDATED: &str = "2025-05-01T00:00:00Z";

    fn valid_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-05-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    async fn mount_catalog(server: &MockServer, expected: u64) {
        let uri = format!("{}/grib/south", server.uri());
        Mock::given(method("GET"))
            .and(path("/available.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                catalog_row("south", "2025-05-01T00:00:00Z", UPDATED, &uri),
            ])))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mount_product(server: &MockServer, bytes: Vec<u8>, delay: Duration) {
        Mock::given(method("GET"))
            .and(path("/grib/south"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes).set_delay(delay))
            .mount(server)
            .await;
    }

    fn service(server: &MockServer, store: ProductCacheStore) -> ProfileService {
        let client = reqwest::Client::new();
        let resolver = AvailabilityResolver::new(
            client.clone(),
            &format!("{}/available.json", server.uri()),
            "test",
            Duration::from_secs(5),
        );
        let fetcher = ProductFetcher::new(client, "test", Duration::from_secs(5));
        let repository = Arc::new(ProductRepository::new(store, fetcher));
        ProfileService::new(resolver, repository, test_areas(), "south")
    }

    #[tokio::test]
    async fn test_first_query_fetches_second_does_not() {
        let server = MockServer::start().await;
        mount_catalog(&server, 2).await;
        Mock::given(method("GET"))
            .and(path("/grib/south"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(sample_product()))
            .expect(1)
            .mount(&server)
            .await;

        let store = ProductCacheStore::open_memory().await.unwrap();
        let service = service(&server, store.clone());

        service.get_profile(60.0, 10.0, valid_time()).await.unwrap();
        assert_eq!(store.marker().await.unwrap().as_deref(), Some(UPDATED));
        assert_eq!(store.stats().await.unwrap().product_count, 1);

        service.get_profile(59.5, 10.5, valid_time()).await.unwrap();
        assert_eq!(service.repository().stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_profile_layers_and_derived_values() {
        let server = MockServer::start().await;
        mount_catalog(&server, 1).await;
        mount_product(&server, sample_product(), Duration::ZERO).await;

        let service = service(&server, ProductCacheStore::open_memory().await.unwrap());
        let profile = service.get_profile(59.9, 10.1, valid_time()).await.unwrap();

        assert_eq!(profile.area, "south");
        assert_eq!(profile.time, valid_time());
        assert_eq!(profile.grid_point, GridCoordinate::new(60_000_000, 10_000_000));
        let pressures: Vec<u32> = profile.layers.iter().map(|l| l.pressure_hpa()).collect();
        assert_eq!(pressures, vec![1000, 850, 500]);

        let layer = profile.layer(850).unwrap();
        assert!((layer.values.wind_speed_ms.unwrap() - 5.0).abs() < 1e-9);
        assert!((layer.values.wind_from_direction_deg.unwrap() - 216.869_897_645_844).abs() < 1e-6);
        assert!((layer.values.air_temperature_c.unwrap() - 5.0).abs() < 1e-9);

        let altitudes: Vec<f64> = profile.layers.iter().map(|l| l.values.altitude_m).collect();
        assert!(altitudes.windows(2).all(|w| w[0] < w[1]));
        assert!(profile.layers.iter().all(|l| l.values.true_altitude_m.is_some()));

        let shears = profile.shears();
        assert_eq!(shears.len(), 2);
        assert_eq!((shears[0].lower_hpa, shears[0].upper_hpa), (1000, 850));
        // calm below, (3, 4) above: difference (-3, -4), i.e. from the north-east
        let s = shears[0].shear.unwrap();
        assert!((s.speed_ms - 5.0).abs() < 1e-9);
        assert!((s.direction_deg - 36.869_897_645_844).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_far_away_query_is_out_of_bounds() {
        let server = MockServer::start().await;
        // No area covers (0, 0), so nothing upstream is asked.
        mount_catalog(&server, 0).await;

        let service = service(&server, ProductCacheStore::open_memory().await.unwrap());
        let result = service.get_profile(0.0, 0.0, valid_time()).await;
        assert!(matches!(result, Err(IsobaricError::OutOfBounds { .. })));
    }

    #[tokio::test]
    async fn test_query_inside_area_but_off_grid_is_out_of_bounds() {
        let server = MockServer::start().await;
        mount_catalog(&server, 1).await;
        mount_product(&server, sample_product(), Duration::ZERO).await;

        let service = service(&server, ProductCacheStore::open_memory().await.unwrap());
        let result = service.get_profile(61.5, 11.5, valid_time()).await;
        assert!(matches!(result, Err(IsobaricError::OutOfBounds { .. })));
    }

    #[tokio::test]
    async fn test_query_is_served_from_the_area_covering_it() {
        let server = MockServer::start().await;
        let south_uri = format!("{}/grib/south", server.uri());
        let north_uri = format!("{}/grib/north", server.uri());
        Mock::given(method("GET"))
            .and(path("/available.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                catalog_row("south", "2025-05-01T00:00:00Z", UPDATED, &south_uri),
                catalog_row("north", "2025-05-01T00:00:00Z", UPDATED, &north_uri),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/grib/south"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(sample_product()))
            .expect(0)
            .mount(&server)
            .await;
        let filled = |v: f64| vec![Some(v); 4];
        let north = Grib2Builder::new(2, 2)
            .with_origin(70.0, 18.0)
            .with_temperature(850, filled(260.0))
            .with_wind(850, filled(2.0), filled(0.0))
            .build();
        Mock::given(method("GET"))
            .and(path("/grib/north"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(north))
            .expect(1)
            .mount(&server)
            .await;

        let store = ProductCacheStore::open_memory().await.unwrap();
        let service = service(&server, store.clone());
        let profile = service.get_profile(70.0, 18.0, valid_time()).await.unwrap();

        assert_eq!(profile.area, "north");
        assert_eq!(profile.grid_point, GridCoordinate::new(70_000_000, 18_000_000));
        assert!((profile.layer(850).unwrap().values.air_temperature_c.unwrap() + 13.15).abs() < 1e-9);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.keys, vec!["north/2025-05-01T00:00:00Z".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_wind_layer_is_absent_not_zero() {
        let server = MockServer::start().await;
        mount_catalog(&server, 1).await;
        let filled = |v: f64| vec![Some(v); 4];
        let product = Grib2Builder::new(2, 2)
            .with_temperature(850, filled(270.0))
            .with_temperature(500, filled(250.0))
            .with_wind(850, filled(1.0), filled(1.0))
            .build();
        mount_product(&server, product, Duration::ZERO).await;

        let service = service(&server, ProductCacheStore::open_memory().await.unwrap());
        let profile = service.get_profile(60.0, 10.0, valid_time()).await.unwrap();

        let upper = profile.layer(500).unwrap();
        assert_eq!(upper.values.wind_speed_ms, None);
        assert_eq!(upper.values.wind_from_direction_deg, None);
        assert!(upper.values.air_temperature_c.is_some());
        assert_eq!(profile.shears()[0].shear, None);
    }

    #[tokio::test]
    async fn test_catalog_failure_is_availability_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let service = service(&server, ProductCacheStore::open_memory().await.unwrap());
        let result = service.get_profile(60.0, 10.0, valid_time()).await;
        assert!(matches!(result, Err(IsobaricError::Availability(_))));
    }

    #[tokio::test]
    async fn test_cancelled_query_leaves_cache_untouched() {
        let server = MockServer::start().await;
        mount_catalog(&server, 1).await;
        mount_product(&server, sample_product(), Duration::from_secs(2)).await;

        let store = ProductCacheStore::open_memory().await.unwrap();
        let service = service(&server, store.clone());
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            })
        };

        let result = service
            .get_profile_cancellable(60.0, 10.0, valid_time(), &cancel)
            .await;
        canceller.await.unwrap();

        assert!(matches!(result, Err(IsobaricError::Cancelled)));
        assert_eq!(store.stats().await.unwrap().product_count, 0);
        assert_eq!(store.marker().await.unwrap(), None);
    }
}
