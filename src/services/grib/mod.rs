//! Isobaric GRIB2 grid decoder.
//!
//! Turns a raw product (optionally gzip-wrapped) into a [`DecodedGrid`]: a
//! mapping from grid coordinate to pressure level to [`GridVectors`].
//! Variables are located by semantic role through a [`RoleTable`], never by
//! their position in the file, so reordered or renamed products still decode.

mod sections;
mod unpacking;

#[cfg(test)]
pub(crate) mod testdata;

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;

use crate::errors::IsobaricError;
use sections::{Field, GridDefinition};

/// GRIB2 level type code for isobaric surfaces (value in Pa).
const LEVEL_TYPE_ISOBARIC: u8 = 100;

const MICRODEGREES: f64 = 1_000_000.0;

/// Upper bound on unpacked values held at once (fields × points), and on
/// grid entries (levels × points) in the assembled grid.
const MAX_DECODED_VALUES: usize = 50_000_000;

/// Largest payload accepted after gunzip.
const MAX_UNCOMPRESSED_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GribError {
    #[error("invalid GRIB2 format: {0}")]
    InvalidFormat(String),

    #[error("invalid section {section}: {reason}")]
    InvalidSection { section: u8, reason: String },

    #[error("truncated payload: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("unsupported {0}")]
    Unsupported(String),

    #[error("unpacking failed: {0}")]
    Unpacking(String),
}

impl From<GribError> for IsobaricError {
    fn from(err: GribError) -> Self {
        IsobaricError::Parsing(err.to_string())
    }
}

/// The physical quantity a GRIB2 parameter carries, independent of its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum VariableRole {
    Temperature,
    EastwardWind,
    NorthwardWind,
}

impl VariableRole {
    pub const ALL: [VariableRole; 3] = [
        VariableRole::Temperature,
        VariableRole::EastwardWind,
        VariableRole::NorthwardWind,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            VariableRole::Temperature => "air temperature",
            VariableRole::EastwardWind => "eastward wind",
            VariableRole::NorthwardWind => "northward wind",
        }
    }
}

/// (discipline, category, number) → role lookup.
#[derive(Debug, Clone)]
pub struct RoleTable {
    roles: HashMap<(u8, u8, u8), VariableRole>,
}

impl RoleTable {
    pub fn empty() -> Self {
        Self {
            roles: HashMap::new(),
        }
    }

    pub fn add(&mut self, discipline: u8, category: u8, number: u8, role: VariableRole) {
        self.roles.insert((discipline, category, number), role);
    }

    pub fn role(&self, discipline: u8, category: u8, number: u8) -> Option<VariableRole> {
        self.roles.get(&(discipline, category, number)).copied()
    }
}

impl Default for RoleTable {
    /// WMO code table 4.2, discipline 0.
    fn default() -> Self {
        let mut table = Self::empty();
        table.add(0, 0, 0, VariableRole::Temperature); // TMP
        table.add(0, 2, 2, VariableRole::EastwardWind); // UGRD
        table.add(0, 2, 3, VariableRole::NorthwardWind); // VGRD
        table
    }
}

/// A published grid point, in microdegrees exactly as the product defines it.
/// Longitude is normalised to [-180°, 180°).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridCoordinate {
    pub lat_micro: i32,
    pub lon_micro: i32,
}

impl GridCoordinate {
    pub fn new(lat_micro: i64, lon_micro: i64) -> Self {
        let lon = (lon_micro + 180_000_000).rem_euclid(360_000_000) - 180_000_000;
        Self {
            lat_micro: lat_micro as i32,
            lon_micro: lon as i32,
        }
    }

    pub fn lat(&self) -> f64 {
        self.lat_micro as f64 / MICRODEGREES
    }

    pub fn lon(&self) -> f64 {
        self.lon_micro as f64 / MICRODEGREES
    }
}

/// Raw reading at one grid point and pressure level. A variable the product
/// does not carry there is `None`, never zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GridVectors {
    /// Kelvin, as published.
    pub temperature: Option<f64>,
    /// Eastward wind component, m/s.
    pub u: Option<f64>,
    /// Northward wind component, m/s.
    pub v: Option<f64>,
}

/// Shape of the regular lat/lon grid shared by every decoded variable.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    pub ni: u32,
    pub nj: u32,
    /// Longitude increment, degrees.
    pub di_deg: f64,
    /// Latitude increment, degrees.
    pub dj_deg: f64,
}

impl GridGeometry {
    /// Length of one cell diagonal, degrees.
    pub fn cell_diagonal_deg(&self) -> f64 {
        self.di_deg.hypot(self.dj_deg)
    }
}

/// A decoded isobaric product.
#[derive(Debug, Clone)]
pub struct DecodedGrid {
    /// Valid time of the product.
    pub time: DateTime<Utc>,
    pub geometry: GridGeometry,
    pub points: BTreeMap<GridCoordinate, BTreeMap<u32, GridVectors>>,
}

impl DecodedGrid {
    /// Published pressure levels, hPa, ascending.
    pub fn levels(&self) -> Vec<u32> {
        self.points
            .values()
            .next()
            .map(|levels| levels.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Nearest published grid point to `(lat, lon)` and its distance in degrees.
    ///
    /// Distance is Euclidean in degrees with the longitude difference wrapped.
    /// Returns `None` when the nearest point is more than one cell diagonal
    /// away, i.e. the query lies outside the product's coverage.
    pub fn nearest(&self, lat: f64, lon: f64) -> Option<(GridCoordinate, f64)> {
        let (coordinate, distance) = self
            .points
            .keys()
            .map(|c| {
                let dlat = c.lat() - lat;
                let dlon = (c.lon() - lon + 180.0).rem_euclid(360.0) - 180.0;
                (*c, dlat.hypot(dlon))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))?;

        if distance > self.geometry.cell_diagonal_deg() {
            return None;
        }
        Some((coordinate, distance))
    }

    /// Per-level vectors at a grid point.
    pub fn vectors_at(&self, coordinate: &GridCoordinate) -> Option<&BTreeMap<u32, GridVectors>> {
        self.points.get(coordinate)
    }
}

/// Decode a product using the default WMO role table.
#[cfg(test)]
pub fn decode(bytes: &[u8]) -> Result<DecodedGrid, IsobaricError> {
    decode_with(bytes, &RoleTable::default())
}

/// Decode a product, resolving variables through `roles`.
pub fn decode_with(bytes: &[u8], roles: &RoleTable) -> Result<DecodedGrid, IsobaricError> {
    let payload = maybe_gunzip(bytes)?;
    let messages = sections::split_messages(&payload)?;

    let mut grid: Option<GridDefinition> = None;
    let mut valid_time: Option<DateTime<Utc>> = None;
    let mut seen_levels: BTreeSet<u32> = BTreeSet::new();
    let mut seen_roles: BTreeSet<VariableRole> = BTreeSet::new();
    let mut values: HashMap<(VariableRole, u32), Vec<Option<f64>>> = HashMap::new();
    let mut skipped = 0usize;

    for message in &messages {
        for field in sections::parse_message(message)? {
            let Some((role, level_hpa)) = classify(&field, roles) else {
                continue;
            };
            seen_levels.insert(level_hpa);
            seen_roles.insert(role);

            check_decoded_size(values.len() + 1, &field)?;
            match unpack_field(&field, &mut grid, &mut valid_time) {
                Ok(unpacked) => {
                    values.insert((role, level_hpa), unpacked);
                }
                Err(e @ GribError::Unsupported(_)) | Err(e @ GribError::Unpacking(_)) => {
                    skipped += 1;
                    tracing::warn!(
                        "Skipping {} at {} hPa, leaving it absent: {}",
                        role.name(),
                        level_hpa,
                        e
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    for role in VariableRole::ALL {
        if !seen_roles.contains(&role) {
            return Err(IsobaricError::Parsing(format!(
                "product has no {} on isobaric levels",
                role.name()
            )));
        }
    }

    let grid = grid.ok_or_else(|| {
        IsobaricError::Parsing("no isobaric field could be unpacked".to_string())
    })?;
    let time = valid_time.ok_or_else(|| {
        IsobaricError::Parsing("product valid time is unknown".to_string())
    })?;

    if seen_levels.len().saturating_mul(grid.num_points as usize) > MAX_DECODED_VALUES {
        return Err(IsobaricError::Parsing(format!(
            "{} levels of {} points exceed the decode limit",
            seen_levels.len(),
            grid.num_points
        )));
    }
    let points = assemble(&grid, &seen_levels, &values);

    tracing::debug!(
        "Decoded isobaric grid: {} messages, {} levels, {} points, {} fields skipped",
        messages.len(),
        seen_levels.len(),
        points.len(),
        skipped
    );

    Ok(DecodedGrid {
        time,
        geometry: GridGeometry {
            ni: grid.ni,
            nj: grid.nj,
            di_deg: grid.di as f64 / MICRODEGREES,
            dj_deg: grid.dj as f64 / MICRODEGREES,
        },
        points,
    })
}

/// Refuse to unpack a field that would push the unpacked values past
/// [`MAX_DECODED_VALUES`].
fn check_decoded_size(fields: usize, field: &Field<'_>) -> Result<(), GribError> {
    let Ok(grid) = field.grid.as_ref() else {
        return Ok(());
    };
    if fields.saturating_mul(grid.num_points as usize) > MAX_DECODED_VALUES {
        return Err(GribError::InvalidFormat(format!(
            "{} fields of {} points exceed the decode limit",
            fields, grid.num_points
        )));
    }
    Ok(())
}

/// Role and pressure level (hPa) of a field, or `None` if it is not needed.
fn classify(field: &Field<'_>, roles: &RoleTable) -> Option<(VariableRole, u32)> {
    let product = field.product.as_ref().ok()?;
    let role = roles.role(
        field.discipline,
        product.parameter_category,
        product.parameter_number,
    )?;
    if product.level_type != LEVEL_TYPE_ISOBARIC {
        return None;
    }
    let level_hpa = (product.level_value() / 100.0).round();
    if !(level_hpa > 0.0 && level_hpa < 2000.0) {
        return None;
    }
    Some((role, level_hpa as u32))
}

/// Unpack one field, checking its grid against the one already established.
fn unpack_field(
    field: &Field<'_>,
    grid: &mut Option<GridDefinition>,
    valid_time: &mut Option<DateTime<Utc>>,
) -> Result<Vec<Option<f64>>, GribError> {
    let field_grid = field.grid.clone()?;
    let representation = field.representation.clone()?;
    let bitmap = field.bitmap.clone()?;
    let product = field.product.clone()?;

    match grid {
        Some(existing) if *existing != field_grid => {
            return Err(GribError::InvalidFormat(format!(
                "inconsistent grid dimensions: {}x{} vs {}x{}",
                existing.ni, existing.nj, field_grid.ni, field_grid.nj
            )));
        }
        Some(_) => {}
        None => *grid = Some(field_grid.clone()),
    }

    let field_time = match product.forecast_offset() {
        Some(offset) => field
            .reference_time
            .checked_add_signed(offset)
            .ok_or_else(|| GribError::InvalidSection {
                section: 4,
                reason: format!(
                    "forecast time {} (unit {}) is out of range",
                    product.forecast_time, product.time_unit
                ),
            })?,
        None => field.reference_time,
    };
    match valid_time {
        Some(t) if *t != field_time => {
            tracing::warn!(
                "Field valid at {} in a product valid at {}; keeping {}",
                field_time,
                t,
                t
            );
        }
        Some(_) => {}
        None => *valid_time = Some(field_time),
    }

    unpacking::unpack_simple(
        field.data,
        &representation,
        field_grid.num_points as usize,
        bitmap,
    )
}

/// Grid coordinate of the `index`-th point in scanning order.
fn coordinate_of(grid: &GridDefinition, index: usize) -> GridCoordinate {
    let (i, j) = if grid.scanning_mode & 0x20 != 0 {
        (index / grid.nj as usize, index % grid.nj as usize)
    } else {
        (index % grid.ni as usize, index / grid.ni as usize)
    };
    let lon_step = if grid.scanning_mode & 0x80 != 0 { -1 } else { 1 };
    let lat_step = if grid.scanning_mode & 0x40 != 0 { 1 } else { -1 };

    GridCoordinate::new(
        grid.la1 as i64 + lat_step * j as i64 * grid.dj as i64,
        grid.lo1 as i64 + lon_step * i as i64 * grid.di as i64,
    )
}

fn assemble(
    grid: &GridDefinition,
    levels: &BTreeSet<u32>,
    values: &HashMap<(VariableRole, u32), Vec<Option<f64>>>,
) -> BTreeMap<GridCoordinate, BTreeMap<u32, GridVectors>> {
    let value = |role: VariableRole, level: u32, index: usize| -> Option<f64> {
        values
            .get(&(role, level))
            .and_then(|field| field.get(index).copied().flatten())
    };

    (0..grid.num_points as usize)
        .map(|index| {
            let per_level = levels
                .iter()
                .map(|&level| {
                    (
                        level,
                        GridVectors {
                            temperature: value(VariableRole::Temperature, level, index),
                            u: value(VariableRole::EastwardWind, level, index),
                            v: value(VariableRole::NorthwardWind, level, index),
                        },
                    )
                })
                .collect();
            (coordinate_of(grid, index), per_level)
        })
        .collect()
}

/// Products may arrive gzip-compressed; GRIB2 itself never starts with 1f 8b.
fn maybe_gunzip(bytes: &[u8]) -> Result<std::borrow::Cow<'_, [u8]>, IsobaricError> {
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(bytes)
            .take(MAX_UNCOMPRESSED_BYTES + 1)
            .read_to_end(&mut decoded)
            .map_err(|e| IsobaricError::Parsing(format!("gzip decompression failed: {}", e)))?;
        if decoded.len() as u64 > MAX_UNCOMPRESSED_BYTES {
            return Err(IsobaricError::Parsing(format!(
                "decompressed product exceeds {} bytes",
                MAX_UNCOMPRESSED_BYTES
            )));
        }
        Ok(std::borrow::Cow::Owned(decoded))
    } else {
        Ok(std::borrow::Cow::Borrowed(bytes))
    }
}
