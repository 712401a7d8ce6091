//! Physical quantities derived from raw isobaric vectors.
//!
//! Directions follow the meteorological "from" convention: 0°/360° is wind
//! from the north, 90° from the east. A missing input yields a missing
//! output; nothing here substitutes zero for absent data.

use serde::Serialize;
use utoipa::ToSchema;

use crate::services::grib::GridVectors;

const KELVIN_OFFSET: f64 = 273.15;

/// Specific gas constant for dry air, J/(kg·K).
const R_DRY_AIR: f64 = 287.05;

/// Standard gravity, m/s².
const GRAVITY: f64 = 9.80665;

/// ICAO standard atmosphere: (pressure hPa, geopotential altitude m),
/// pressure descending.
const STANDARD_ATMOSPHERE: [(f64, f64); 17] = [
    (1013.25, 0.0),
    (1000.0, 111.0),
    (925.0, 762.0),
    (850.0, 1457.0),
    (700.0, 3012.0),
    (500.0, 5574.0),
    (400.0, 7185.0),
    (300.0, 9164.0),
    (250.0, 10363.0),
    (200.0, 11784.0),
    (150.0, 13608.0),
    (100.0, 16180.0),
    (70.0, 18442.0),
    (50.0, 20576.0),
    (30.0, 23849.0),
    (20.0, 26481.0),
    (10.0, 31055.0),
];

/// Values derived for one pressure level.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DerivedLayerValues {
    pub pressure_hpa: u32,
    /// Standard-atmosphere altitude, metres.
    pub altitude_m: f64,
    /// Hypsometric altitude from the layer temperatures, metres.
    /// Filled in at profile level; see [`true_altitudes`].
    pub true_altitude_m: Option<f64>,
    pub air_temperature_c: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub wind_from_direction_deg: Option<f64>,
}

/// Wind shear between two layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct WindShear {
    pub speed_ms: f64,
    pub direction_deg: f64,
}

/// Map any angle in degrees onto [0, 360).
pub fn normalize_360(degrees: f64) -> f64 {
    let normalized = degrees.rem_euclid(360.0);
    // rem_euclid of a tiny negative value rounds up to exactly 360.0
    if normalized >= 360.0 {
        0.0
    } else {
        normalized
    }
}

pub fn wind_speed(u: f64, v: f64) -> f64 {
    u.hypot(v)
}

/// Direction the wind blows from. Calm air (u = v = 0) reports 0°.
pub fn wind_from_direction(u: f64, v: f64) -> f64 {
    if u == 0.0 && v == 0.0 {
        return 0.0;
    }
    normalize_360((-u).atan2(-v).to_degrees())
}

/// Standard-atmosphere altitude for a pressure, metres.
///
/// Interpolates linearly in ln(p) between the tabulated standard levels and
/// clamps to the table ends, so the result is non-increasing in pressure and
/// never extrapolated outside [10, 1013.25] hPa.
pub fn pressure_to_altitude(pressure_hpa: f64) -> f64 {
    let (first_p, first_h) = STANDARD_ATMOSPHERE[0];
    let (last_p, last_h) = STANDARD_ATMOSPHERE[STANDARD_ATMOSPHERE.len() - 1];
    if pressure_hpa >= first_p {
        return first_h;
    }
    if pressure_hpa <= last_p {
        return last_h;
    }

    for pair in STANDARD_ATMOSPHERE.windows(2) {
        let (p_hi, h_lo) = pair[0];
        let (p_lo, h_hi) = pair[1];
        if pressure_hpa <= p_hi && pressure_hpa >= p_lo {
            let fraction = (p_hi / pressure_hpa).ln() / (p_hi / p_lo).ln();
            return h_lo + fraction * (h_hi - h_lo);
        }
    }
    last_h
}

/// Derive physical values for one layer.
pub fn derive(vectors: &GridVectors, pressure_hpa: u32) -> DerivedLayerValues {
    let wind = vectors.u.zip(vectors.v);
    DerivedLayerValues {
        pressure_hpa,
        altitude_m: pressure_to_altitude(pressure_hpa as f64),
        true_altitude_m: None,
        air_temperature_c: vectors.temperature.map(|k| k - KELVIN_OFFSET),
        wind_speed_ms: wind.map(|(u, v)| wind_speed(u, v)),
        wind_from_direction_deg: wind.map(|(u, v)| wind_from_direction(u, v)),
    }
}

/// Wind shear as the vector difference `lower - upper`, where `lower` is the
/// layer at lower altitude (higher pressure).
///
/// Swapping the arguments keeps the speed and turns the direction by 180°,
/// except for zero shear, which reports 0° either way like calm wind.
/// `None` if either layer lacks a wind component.
pub fn shear(lower: &GridVectors, upper: &GridVectors) -> Option<WindShear> {
    let du = lower.u? - upper.u?;
    let dv = lower.v? - upper.v?;
    Some(WindShear {
        speed_ms: wind_speed(du, dv),
        direction_deg: wind_from_direction(du, dv),
    })
}

/// Thickness between two pressure levels from their temperatures (kelvin),
/// by the hypsometric equation with the layer mean temperature.
pub fn hypsometric_thickness(
    lower_hpa: f64,
    upper_hpa: f64,
    lower_temp_k: f64,
    upper_temp_k: f64,
) -> f64 {
    let mean_temp = (lower_temp_k + upper_temp_k) / 2.0;
    R_DRY_AIR * mean_temp / GRAVITY * (lower_hpa / upper_hpa).ln()
}

/// Fill in `true_altitude_m` for layers ordered by descending pressure.
///
/// The lowest layer is anchored at its standard altitude; each layer above
/// adds the hypsometric thickness. The chain stops at the first layer whose
/// temperature (or the one below it) is missing.
pub fn true_altitudes(layers: &mut [DerivedLayerValues]) {
    let Some(first) = layers.first_mut() else {
        return;
    };
    if first.air_temperature_c.is_none() {
        return;
    }
    first.true_altitude_m = Some(first.altitude_m);

    for i in 1..layers.len() {
        let (below, above) = layers.split_at_mut(i);
        let below = &below[i - 1];
        let above = &mut above[0];

        let (Some(base), Some(t_below), Some(t_above)) = (
            below.true_altitude_m,
            below.air_temperature_c,
            above.air_temperature_c,
        ) else {
            return;
        };
        let thickness = hypsometric_thickness(
            below.pressure_hpa as f64,
            above.pressure_hpa as f64,
            t_below + KELVIN_OFFSET,
            t_above + KELVIN_OFFSET,
        );
        above.true_altitude_m = Some(base + thickness);
    }
}
