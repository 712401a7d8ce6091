//! GRIB2 simple packing (data representation template 5.0).
//!
//! value = (R + X * 2^E) / 10^D, where X is the packed integer.

use super::sections::{DataRepresentation, MAX_GRID_POINTS};
use super::GribError;

/// Unpack one field into `num_points` values, `None` where the bitmap marks a
/// point as missing. Packed data holds values for present points only.
pub fn unpack_simple(
    data: &[u8],
    representation: &DataRepresentation,
    num_points: usize,
    bitmap: Option<&[u8]>,
) -> Result<Vec<Option<f64>>, GribError> {
    if num_points > MAX_GRID_POINTS as usize {
        return Err(GribError::InvalidFormat(format!(
            "{} points exceeds the limit of {}",
            num_points, MAX_GRID_POINTS
        )));
    }

    let present = match bitmap {
        Some(bm) => {
            if bm.len() * 8 < num_points {
                return Err(GribError::Unpacking(format!(
                    "bitmap covers {} points, grid has {}",
                    bm.len() * 8,
                    num_points
                )));
            }
            (0..num_points).filter(|&i| bit_set(bm, i)).count()
        }
        None => num_points,
    };

    if present != representation.num_packed as usize {
        return Err(GribError::Unpacking(format!(
            "{} points present but {} values packed",
            present, representation.num_packed
        )));
    }

    let bits = representation.bits_per_value as usize;
    if bits > 32 {
        return Err(GribError::Unpacking(format!(
            "Invalid number of bits: {}",
            bits
        )));
    }
    let needed_bytes = (present * bits).div_ceil(8);
    if data.len() < needed_bytes {
        return Err(GribError::Truncated {
            needed: needed_bytes,
            available: data.len(),
        });
    }

    let reference = representation.reference_value as f64;
    let binary_scale = 2f64.powi(representation.binary_scale_factor);
    let decimal_scale = 10f64.powi(representation.decimal_scale_factor);

    let mut values = Vec::with_capacity(num_points);
    let mut bit_position = 0;

    for i in 0..num_points {
        if let Some(bm) = bitmap {
            if !bit_set(bm, i) {
                values.push(None);
                continue;
            }
        }

        let packed = if bits == 0 {
            0
        } else {
            extract_bits(data, bit_position, bits)
        };
        bit_position += bits;

        values.push(Some((reference + packed as f64 * binary_scale) / decimal_scale));
    }

    Ok(values)
}

fn bit_set(bitmap: &[u8], index: usize) -> bool {
    (bitmap[index / 8] >> (7 - (index % 8))) & 1 == 1
}

/// Read `num_bits` (1..=32) starting at `start_bit`, MSB first.
/// Callers guarantee the range lies inside `data`.
fn extract_bits(data: &[u8], start_bit: usize, num_bits: usize) -> u32 {
    let mut result = 0u32;

    for i in 0..num_bits {
        let absolute_bit = start_bit + i;
        let bit = (data[absolute_bit / 8] >> (7 - (absolute_bit % 8))) & 1;
        result = (result << 1) | bit as u32;
    }

    result
}
