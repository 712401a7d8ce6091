//! MET Norway isobaric GRIB2 catalog and product download.
//!
//! See: https://api.met.no/weatherapi/isobaricgrib/1.0/documentation

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderValue, USER_AGENT};
use serde::Deserialize;
use std::time::{Duration, Instant};

use crate::errors::IsobaricError;

/// One catalog row: the product covering `valid_time` for `area`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityEntry {
    pub area: String,
    pub valid_time: DateTime<Utc>,
    /// When the product was last regenerated upstream.
    pub updated: DateTime<Utc>,
    pub uri: String,
}

impl AvailabilityEntry {
    /// Canonical form of `updated`, used as the cache's update marker.
    pub fn marker(&self) -> String {
        self.updated.to_rfc3339_opts(SecondsFormat::Secs, true)
    }

    /// Cache key of the product: `"{area}/{valid time}"`.
    pub fn timestamp_key(&self) -> String {
        format!(
            "{}/{}",
            self.area,
            self.valid_time.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }
}

// --- catalog JSON response types ---

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[allow(dead_code)] // Part of the catalog format; selection goes by params
    endpoint: Option<String>,
    params: CatalogParams,
    updated: String,
    uri: String,
}

#[derive(Debug, Deserialize)]
struct CatalogParams {
    area: String,
    time: String,
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn user_agent_header(user_agent: &str) -> Result<HeaderValue, String> {
    HeaderValue::from_str(user_agent).map_err(|e| format!("Invalid User-Agent: {}", e))
}

/// Finds the currently valid isobaric product for an area.
#[derive(Debug, Clone)]
pub struct AvailabilityResolver {
    client: reqwest::Client,
    catalog_url: String,
    user_agent: String,
    timeout: Duration,
}

impl AvailabilityResolver {
    pub fn new(
        client: reqwest::Client,
        catalog_url: &str,
        user_agent: &str,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            catalog_url: catalog_url.to_string(),
            user_agent: user_agent.to_string(),
            timeout,
        }
    }

    /// Entry for `area` whose valid time is closest to now.
    pub async fn resolve_availability(
        &self,
        area: &str,
    ) -> Result<AvailabilityEntry, IsobaricError> {
        self.resolve_availability_at(area, Utc::now()).await
    }

    /// Entry for `area` whose valid time is closest to `time`.
    ///
    /// One catalog request, no retries. Does not touch the cache.
    pub async fn resolve_availability_at(
        &self,
        area: &str,
        time: DateTime<Utc>,
    ) -> Result<AvailabilityEntry, IsobaricError> {
        let entries = self.fetch_catalog().await?;
        let entry = select_entry(&entries, area, time)?;

        tracing::debug!(
            "Resolved isobaric product for '{}' at {}: valid {}, updated {}",
            area,
            time,
            entry.valid_time,
            entry.marker()
        );
        Ok(entry)
    }

    /// Download and parse the full catalog.
    pub async fn fetch_catalog(&self) -> Result<Vec<AvailabilityEntry>, IsobaricError> {
        let user_agent = user_agent_header(&self.user_agent).map_err(IsobaricError::Availability)?;

        let response = self
            .client
            .get(&self.catalog_url)
            .header(USER_AGENT, user_agent)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(IsobaricError::Availability(format!(
                "catalog returned HTTP {}",
                response.status()
            )));
        }

        let raw: Vec<CatalogEntry> = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.request_error(e)
            } else {
                IsobaricError::Availability(format!("malformed catalog response: {}", e))
            }
        })?;

        let total = raw.len();
        let entries: Vec<AvailabilityEntry> = raw
            .into_iter()
            .filter_map(|entry| {
                let valid_time = parse_timestamp(&entry.params.time);
                let updated = parse_timestamp(&entry.updated);
                match (valid_time, updated) {
                    (Some(valid_time), Some(updated)) => Some(AvailabilityEntry {
                        area: entry.params.area,
                        valid_time,
                        updated,
                        uri: entry.uri,
                    }),
                    _ => {
                        tracing::warn!(
                            "Ignoring catalog entry with bad timestamps (time '{}', updated '{}')",
                            entry.params.time,
                            entry.updated
                        );
                        None
                    }
                }
            })
            .collect();

        tracing::debug!(
            "Catalog listed {} entries ({} usable)",
            total,
            entries.len()
        );
        Ok(entries)
    }

    fn request_error(&self, e: reqwest::Error) -> IsobaricError {
        if e.is_timeout() {
            IsobaricError::Availability(format!(
                "catalog request timed out after {}s",
                self.timeout.as_secs_f64()
            ))
        } else {
            IsobaricError::Availability(format!("catalog request failed: {}", e))
        }
    }
}

/// Pick the entry for `area` closest to `time`; ties go to the earlier valid time.
pub fn select_entry(
    entries: &[AvailabilityEntry],
    area: &str,
    time: DateTime<Utc>,
) -> Result<AvailabilityEntry, IsobaricError> {
    let target = time.timestamp();
    entries
        .iter()
        .filter(|entry| entry.area == area)
        .min_by_key(|entry| {
            let ts = entry.valid_time.timestamp();
            ((ts - target).unsigned_abs(), ts)
        })
        .cloned()
        .ok_or_else(|| {
            IsobaricError::Availability(format!("no isobaric product listed for area '{}'", area))
        })
}

/// Downloads raw product payloads.
#[derive(Debug, Clone)]
pub struct ProductFetcher {
    client: reqwest::Client,
    user_agent: String,
    timeout: Duration,
}

impl ProductFetcher {
    pub fn new(client: reqwest::Client, user_agent: &str, timeout: Duration) -> Self {
        Self {
            client,
            user_agent: user_agent.to_string(),
            timeout,
        }
    }

    /// GET `uri` and return the whole body. The timeout covers the body too,
    /// so a returned `Ok` always holds the complete payload.
    pub async fn fetch(&self, uri: &str) -> Result<Vec<u8>, IsobaricError> {
        let user_agent = user_agent_header(&self.user_agent).map_err(IsobaricError::Fetching)?;
        let started = Instant::now();

        let response = self
            .client
            .get(uri)
            .header(USER_AGENT, user_agent)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(IsobaricError::Fetching(format!(
                "product download returned HTTP {}",
                response.status()
            )));
        }

        let bytes = response.bytes().await.map_err(|e| self.request_error(e))?;

        tracing::info!(
            "Fetched isobaric product {} ({} bytes in {} ms)",
            uri,
            bytes.len(),
            started.elapsed().as_millis()
        );
        Ok(bytes.to_vec())
    }

    fn request_error(&self, e: reqwest::Error) -> IsobaricError {
        if e.is_timeout() {
            IsobaricError::Fetching(format!(
                "product download timed out after {}s",
                self.timeout.as_secs_f64()
            ))
        } else {
            IsobaricError::Fetching(format!("product download failed: {}", e))
        }
    }
}
