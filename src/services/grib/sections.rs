//! GRIB2 section parsing (WMO FM 92 GRIB Edition 2).
//!
//! A message is walked section by section. Sections 3 to 7 may repeat inside
//! one message, so every Section 7 yields a [`Field`] built from the most
//! recent grid, product, representation and bitmap sections seen before it.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use super::GribError;

/// Length of Section 0 (Indicator).
pub const INDICATOR_LEN: usize = 16;

/// Section 8 marker closing every message.
const END_MARKER: &[u8; 4] = b"7777";

/// Largest grid accepted, in points. Far above any regional isobaric product;
/// a larger declaration is treated as corrupt rather than allocated.
pub const MAX_GRID_POINTS: u32 = 4_000_000;

/// Section 0: Indicator Section (16 bytes)
#[derive(Debug, Clone)]
pub struct Indicator {
    pub discipline: u8,
    pub message_length: u64,
}

/// Section 1: Identification Section
#[derive(Debug, Clone)]
pub struct Identification {
    pub reference_time: DateTime<Utc>,
}

/// Section 3: Grid Definition Section, template 3.0 (regular lat/lon).
///
/// Coordinates are in microdegrees as published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridDefinition {
    pub num_points: u32,
    pub ni: u32,
    pub nj: u32,
    pub la1: i32,
    pub lo1: i32,
    pub la2: i32,
    pub lo2: i32,
    pub di: u32,
    pub dj: u32,
    pub scanning_mode: u8,
}

/// Section 4: Product Definition Section (templates sharing the 4.0 layout).
#[derive(Debug, Clone)]
pub struct ProductDefinition {
    pub parameter_category: u8,
    pub parameter_number: u8,
    pub time_unit: u8,
    pub forecast_time: u32,
    pub level_type: u8,
    pub level_scale_factor: i32,
    pub level_scaled_value: u32,
}

impl ProductDefinition {
    /// Value of the first fixed surface, with its scale factor applied.
    pub fn level_value(&self) -> f64 {
        self.level_scaled_value as f64 / 10f64.powi(self.level_scale_factor)
    }

    /// Forecast offset from the reference time, if the time unit is known.
    pub fn forecast_offset(&self) -> Option<Duration> {
        let t = self.forecast_time as i64;
        let offset = match self.time_unit {
            0 => Duration::minutes(t),
            1 => Duration::hours(t),
            2 => Duration::days(t),
            10 => Duration::hours(3 * t),
            11 => Duration::hours(6 * t),
            12 => Duration::hours(12 * t),
            13 => Duration::seconds(t),
            _ => return None,
        };
        Some(offset)
    }
}

/// Section 5: Data Representation Section, template 5.0 (simple packing).
#[derive(Debug, Clone)]
pub struct DataRepresentation {
    /// Number of packed values (points present in the bitmap).
    pub num_packed: u32,
    pub reference_value: f32,
    pub binary_scale_factor: i32,
    pub decimal_scale_factor: i32,
    pub bits_per_value: u8,
}

/// One decodable field: everything needed to unpack a Section 7.
#[derive(Debug, Clone)]
pub struct Field<'a> {
    pub discipline: u8,
    pub reference_time: DateTime<Utc>,
    pub grid: Result<GridDefinition, GribError>,
    pub product: Result<ProductDefinition, GribError>,
    pub representation: Result<DataRepresentation, GribError>,
    pub bitmap: Result<Option<&'a [u8]>, GribError>,
    pub data: &'a [u8],
}

// ===== Integer helpers =====
//
// GRIB2 signed integers use sign-and-magnitude, not two's complement.

fn u16_at(d: &[u8], i: usize) -> u16 {
    u16::from_be_bytes([d[i], d[i + 1]])
}

fn u32_at(d: &[u8], i: usize) -> u32 {
    u32::from_be_bytes([d[i], d[i + 1], d[i + 2], d[i + 3]])
}

fn grib_i8(b: u8) -> i32 {
    let magnitude = (b & 0x7f) as i32;
    if b & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn grib_i16(d: &[u8], i: usize) -> i32 {
    let raw = u16_at(d, i);
    let magnitude = (raw & 0x7fff) as i32;
    if raw & 0x8000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn grib_i32(d: &[u8], i: usize) -> i32 {
    let raw = u32_at(d, i);
    let magnitude = (raw & 0x7fff_ffff) as i32;
    if raw & 0x8000_0000 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

fn require_len(section: u8, data: &[u8], needed: usize) -> Result<(), GribError> {
    if data.len() < needed {
        return Err(GribError::InvalidSection {
            section,
            reason: format!("needs at least {} bytes, got {}", needed, data.len()),
        });
    }
    Ok(())
}

// ===== Parsing Functions =====

/// Parse Section 0 (Indicator) from the start of a message.
pub fn parse_indicator(data: &[u8]) -> Result<Indicator, GribError> {
    if data.len() < INDICATOR_LEN {
        return Err(GribError::Truncated {
            needed: INDICATOR_LEN,
            available: data.len(),
        });
    }

    if &data[0..4] != b"GRIB" {
        return Err(GribError::InvalidFormat(
            "Invalid GRIB magic bytes".to_string(),
        ));
    }

    // Octets 5-6 reserved, 7 discipline, 8 edition, 9-16 total length
    let discipline = data[6];
    let edition = data[7];
    if edition != 2 {
        return Err(GribError::InvalidFormat(format!(
            "Expected GRIB edition 2, got {}",
            edition
        )));
    }

    let message_length = u64::from_be_bytes([
        data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
    ]);

    Ok(Indicator {
        discipline,
        message_length,
    })
}

/// Parse Section 1 (Identification).
pub fn parse_identification(section: &[u8]) -> Result<Identification, GribError> {
    require_len(1, section, 21)?;

    let year = u16_at(section, 12);
    let (month, day) = (section[14], section[15]);
    let (hour, minute, second) = (section[16], section[17], section[18]);

    let reference_time = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
        .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32))
        .ok_or_else(|| GribError::InvalidSection {
            section: 1,
            reason: format!(
                "Invalid date: {}-{:02}-{:02} {:02}:{:02}:{:02}",
                year, month, day, hour, minute, second
            ),
        })?;

    Ok(Identification {
        reference_time: DateTime::<Utc>::from_naive_utc_and_offset(reference_time, Utc),
    })
}

/// Parse Section 3 (Grid Definition). Only template 3.0 is supported.
pub fn parse_grid_definition(section: &[u8]) -> Result<GridDefinition, GribError> {
    require_len(3, section, 14)?;

    let num_points = u32_at(section, 6);
    if num_points > MAX_GRID_POINTS {
        return Err(GribError::InvalidSection {
            section: 3,
            reason: format!(
                "{} data points exceeds the limit of {}",
                num_points, MAX_GRID_POINTS
            ),
        });
    }
    let template = u16_at(section, 12);
    if template != 0 {
        return Err(GribError::Unsupported(format!(
            "grid definition template 3.{}",
            template
        )));
    }
    require_len(3, section, 72)?;

    // Template 3.0, offsets from section start:
    // 30 Ni, 34 Nj, 46 La1, 50 Lo1, 55 La2, 59 Lo2, 63 Di, 67 Dj, 71 scanning mode
    let grid = GridDefinition {
        num_points,
        ni: u32_at(section, 30),
        nj: u32_at(section, 34),
        la1: grib_i32(section, 46),
        lo1: grib_i32(section, 50),
        la2: grib_i32(section, 55),
        lo2: grib_i32(section, 59),
        di: u32_at(section, 63),
        dj: u32_at(section, 67),
        scanning_mode: section[71],
    };

    if grid.ni == 0 || grid.nj == 0 || grid.ni as u64 * grid.nj as u64 != num_points as u64 {
        return Err(GribError::InvalidSection {
            section: 3,
            reason: format!(
                "{}x{} grid does not match {} data points",
                grid.ni, grid.nj, num_points
            ),
        });
    }
    if grid.scanning_mode & 0x10 != 0 {
        return Err(GribError::Unsupported(
            "boustrophedonic scanning mode".to_string(),
        ));
    }

    Ok(grid)
}

/// Parse Section 4 (Product Definition).
///
/// Templates 4.0 to 4.15 share the first 34 octets, which is all that is read.
pub fn parse_product_definition(section: &[u8]) -> Result<ProductDefinition, GribError> {
    require_len(4, section, 9)?;

    let template = u16_at(section, 7);
    if template > 15 {
        return Err(GribError::Unsupported(format!(
            "product definition template 4.{}",
            template
        )));
    }
    require_len(4, section, 34)?;

    Ok(ProductDefinition {
        parameter_category: section[9],
        parameter_number: section[10],
        time_unit: section[17],
        forecast_time: u32_at(section, 18),
        level_type: section[22],
        level_scale_factor: grib_i8(section[23]),
        level_scaled_value: u32_at(section, 24),
    })
}

/// Parse Section 5 (Data Representation). Only template 5.0 is supported.
pub fn parse_data_representation(section: &[u8]) -> Result<DataRepresentation, GribError> {
    require_len(5, section, 11)?;

    let num_packed = u32_at(section, 5);
    let template = u16_at(section, 9);
    if template != 0 {
        return Err(GribError::Unsupported(format!(
            "data representation template 5.{}",
            template
        )));
    }
    require_len(5, section, 20)?;

    Ok(DataRepresentation {
        num_packed,
        reference_value: f32::from_be_bytes([section[11], section[12], section[13], section[14]]),
        binary_scale_factor: grib_i16(section, 15),
        decimal_scale_factor: grib_i16(section, 17),
        bits_per_value: section[19],
    })
}

/// Split a buffer into its GRIB2 messages.
///
/// Bytes between messages are skipped up to the next `GRIB` magic. A buffer
/// without any message, or a message whose declared length runs past the end
/// of the buffer, is an error.
pub fn split_messages(data: &[u8]) -> Result<Vec<&[u8]>, GribError> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while let Some(start) = find_magic(data, offset) {
        let indicator = parse_indicator(&data[start..])?;
        let length = usize::try_from(indicator.message_length).map_err(|_| {
            GribError::InvalidFormat("message length does not fit in memory".to_string())
        })?;
        if length < INDICATOR_LEN + END_MARKER.len() {
            return Err(GribError::InvalidFormat(format!(
                "message length {} is too short",
                length
            )));
        }
        let end = start
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or(GribError::Truncated {
                needed: length,
                available: data.len() - start,
            })?;

        messages.push(&data[start..end]);
        offset = end;
    }

    if messages.is_empty() {
        return Err(GribError::InvalidFormat(
            "no GRIB2 messages found".to_string(),
        ));
    }
    Ok(messages)
}

fn find_magic(data: &[u8], from: usize) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(4)
        .position(|w| w == b"GRIB")
        .map(|pos| from + pos)
}

/// Walk the sections of one message and collect its fields.
pub fn parse_message(message: &[u8]) -> Result<Vec<Field<'_>>, GribError> {
    let indicator = parse_indicator(message)?;
    if !message.ends_with(END_MARKER) {
        return Err(GribError::InvalidFormat(
            "message does not end with '7777'".to_string(),
        ));
    }
    let body_end = message.len() - END_MARKER.len();

    let mut identification: Option<Identification> = None;
    let mut grid: Option<Result<GridDefinition, GribError>> = None;
    let mut product: Option<Result<ProductDefinition, GribError>> = None;
    let mut representation: Option<Result<DataRepresentation, GribError>> = None;
    let mut bitmap: Result<Option<&[u8]>, GribError> = Ok(None);
    let mut fields = Vec::new();

    let mut offset = INDICATOR_LEN;
    while offset < body_end {
        if body_end - offset < 5 {
            return Err(GribError::Truncated {
                needed: offset + 5,
                available: body_end,
            });
        }
        let section_length = u32_at(message, offset) as usize;
        let section_number = message[offset + 4];
        if section_length < 5 || offset + section_length > body_end {
            return Err(GribError::InvalidSection {
                section: section_number,
                reason: format!(
                    "length {} at offset {} exceeds message body",
                    section_length, offset
                ),
            });
        }
        let section = &message[offset..offset + section_length];

        match section_number {
            1 => identification = Some(parse_identification(section)?),
            2 => {} // local use
            3 => grid = Some(parse_grid_definition(section)),
            4 => product = Some(parse_product_definition(section)),
            5 => representation = Some(parse_data_representation(section)),
            6 => {
                require_len(6, section, 6)?;
                bitmap = match section[5] {
                    0 => Ok(Some(&section[6..])),
                    254 => bitmap, // reuse the previously defined bitmap
                    255 => Ok(None),
                    other => Err(GribError::Unsupported(format!(
                        "predefined bitmap {}",
                        other
                    ))),
                };
            }
            7 => {
                let reference_time = identification
                    .as_ref()
                    .map(|id| id.reference_time)
                    .ok_or_else(|| missing_before_data(1))?;
                fields.push(Field {
                    discipline: indicator.discipline,
                    reference_time,
                    grid: grid.clone().ok_or_else(|| missing_before_data(3))?,
                    product: product.clone().ok_or_else(|| missing_before_data(4))?,
                    representation: representation
                        .clone()
                        .ok_or_else(|| missing_before_data(5))?,
                    bitmap: bitmap.clone(),
                    data: &section[5..],
                });
            }
            other => {
                return Err(GribError::InvalidSection {
                    section: other,
                    reason: "unknown section number".to_string(),
                })
            }
        }

        offset += section_length;
    }

    Ok(fields)
}

fn missing_before_data(section: u8) -> GribError {
    GribError::InvalidSection {
        section,
        reason: "section missing before data section".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_magnitude_integers() {
        assert_eq!(grib_i8(0x02), 2);
        assert_eq!(grib_i8(0x82), -2);
        assert_eq!(grib_i16(&[0x80, 0x03], 0), -3);
        assert_eq!(grib_i16(&[0x00, 0x03], 0), 3);
        assert_eq!(grib_i32(&[0x80, 0x00, 0x00, 0x05], 0), -5);
    }

    #[test]
    fn test_parse_indicator_rejects_bad_magic() {
        let mut data = vec![0u8; 16];
        data[0..4].copy_from_slice(b"BUFR");
        assert!(matches!(
            parse_indicator(&data),
            Err(GribError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_parse_indicator_rejects_edition_1() {
        let mut data = vec![0u8; 16];
        data[0..4].copy_from_slice(b"GRIB");
        data[7] = 1;
        assert!(parse_indicator(&data).is_err());
    }

    #[test]
    fn test_parse_indicator_short_input() {
        assert!(matches!(
            parse_indicator(b"GRIB"),
            Err(GribError::Truncated { .. })
        ));
    }

    #[test]
    fn test_split_messages_empty_buffer() {
        assert!(split_messages(b"not a grib file at all").is_err());
    }

    #[test]
    fn test_parse_grid_definition_rejects_oversized_grid() {
        let mut section = vec![0u8; 72];
        section[0..4].copy_from_slice(&72u32.to_be_bytes());
        section[4] = 3;
        section[6..10].copy_from_slice(&(65_535u32 * 65_535).to_be_bytes());
        section[30..34].copy_from_slice(&65_535u32.to_be_bytes());
        section[34..38].copy_from_slice(&65_535u32.to_be_bytes());

        match parse_grid_definition(&section) {
            Err(GribError::InvalidSection { section: 3, reason }) => {
                assert!(reason.contains("exceeds the limit"), "{}", reason)
            }
            other => panic!("expected invalid section 3, got {:?}", other),
        }
    }

    #[test]
    fn test_product_forecast_offset_units() {
        let mut pd = ProductDefinition {
            parameter_category: 0,
            parameter_number: 0,
            time_unit: 1,
            forecast_time: 6,
            level_type: 100,
            level_scale_factor: 0,
            level_scaled_value: 85000,
        };
        assert_eq!(pd.forecast_offset(), Some(Duration::hours(6)));
        pd.time_unit = 11;
        assert_eq!(pd.forecast_offset(), Some(Duration::hours(36)));
        pd.time_unit = 99;
        assert_eq!(pd.forecast_offset(), None);
        assert_eq!(pd.level_value(), 85000.0);
    }
}
