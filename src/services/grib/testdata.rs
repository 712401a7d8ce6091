//! Synthetic GRIB2 products for tests.
//!
//! Regular lat/lon grid (template 3.0), isobaric product (4.0) and simple
//! packing (5.0) with two decimal digits, plus a bitmap whenever a field has
//! missing points.

/// One field of the product: a parameter at a pressure level.
#[derive(Debug, Clone)]
pub(crate) struct FieldSpec {
    category: u8,
    number: u8,
    pressure_hpa: u32,
    values: Vec<Option<f64>>,
    packing_template: u16,
}

impl FieldSpec {
    pub(crate) fn new(category: u8, number: u8, pressure_hpa: u32, values: Vec<Option<f64>>) -> Self {
        Self {
            category,
            number,
            pressure_hpa,
            values,
            packing_template: 0,
        }
    }

    /// Declare a different data representation template (the packed bits
    /// stay simple-packed; only the template number changes).
    pub(crate) fn with_packing_template(mut self, template: u16) -> Self {
        self.packing_template = template;
        self
    }
}

/// Builder for GRIB2 payloads.
pub(crate) struct Grib2Builder {
    ni: u32,
    nj: u32,
    la1: i64,
    lo1: i64,
    di: u32,
    dj: u32,
    scanning_mode: u8,
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    forecast_hours: u32,
    declared_grid: Option<(u32, u32)>,
    fields: Vec<FieldSpec>,
}

impl Grib2Builder {
    pub(crate) fn new(ni: u32, nj: u32) -> Self {
        Self {
            ni,
            nj,
            la1: 60_000_000,
            lo1: 10_000_000,
            di: 500_000,
            dj: 500_000,
            scanning_mode: 0b0000_0000, // +i, -j, i consecutive
            year: 2025,
            month: 5,
            day: 1,
            hour: 0,
            forecast_hours: 0,
            declared_grid: None,
            fields: Vec::new(),
        }
    }

    pub(crate) fn with_origin(mut self, lat: f64, lon: f64) -> Self {
        self.la1 = (lat * 1e6).round() as i64;
        self.lo1 = (lon * 1e6).round() as i64;
        self
    }

    pub(crate) fn with_increment(mut self, degrees: f64) -> Self {
        let micro = (degrees * 1e6).round() as u32;
        self.di = micro;
        self.dj = micro;
        self
    }

    pub(crate) fn with_reference_time(mut self, year: u16, month: u8, day: u8, hour: u8) -> Self {
        self.year = year;
        self.month = month;
        self.day = day;
        self.hour = hour;
        self
    }

    pub(crate) fn with_forecast_hours(mut self, hours: u32) -> Self {
        self.forecast_hours = hours;
        self
    }

    /// Declare `ni` x `nj` points in section 3 and every section 5 whatever
    /// the field values are, as a corrupt product would.
    pub(crate) fn with_declared_grid(mut self, ni: u32, nj: u32) -> Self {
        self.declared_grid = Some((ni, nj));
        self
    }

    pub(crate) fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Temperature in kelvin.
    pub(crate) fn with_temperature(self, pressure_hpa: u32, values: Vec<Option<f64>>) -> Self {
        self.with_field(FieldSpec::new(0, 0, pressure_hpa, values))
    }

    pub(crate) fn with_wind(self, pressure_hpa: u32, u: Vec<Option<f64>>, v: Vec<Option<f64>>) -> Self {
        self.with_field(FieldSpec::new(2, 2, pressure_hpa, u))
            .with_field(FieldSpec::new(2, 3, pressure_hpa, v))
    }

    /// One message per field, concatenated.
    pub(crate) fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for field in &self.fields {
            out.extend_from_slice(&self.message(std::slice::from_ref(field)));
        }
        out
    }

    /// A single message carrying every field (sections 4-7 repeated).
    pub(crate) fn build_single_message(&self) -> Vec<u8> {
        self.message(&self.fields)
    }

    fn message(&self, fields: &[FieldSpec]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.section1());
        body.extend_from_slice(&self.section3());
        for field in fields {
            body.extend_from_slice(&self.section4(field));
            let (section5, section6, section7) = self.data_sections(field);
            body.extend_from_slice(&section5);
            body.extend_from_slice(&section6);
            body.extend_from_slice(&section7);
        }

        let total = 16 + body.len() + 4;
        let mut message = Vec::with_capacity(total);
        message.extend_from_slice(b"GRIB");
        message.extend_from_slice(&[0, 0]);
        message.push(0); // discipline: meteorological
        message.push(2); // edition
        message.extend_from_slice(&(total as u64).to_be_bytes());
        message.extend_from_slice(&body);
        message.extend_from_slice(b"7777");
        message
    }

    fn section1(&self) -> Vec<u8> {
        let mut s = Vec::with_capacity(21);
        s.extend_from_slice(&21u32.to_be_bytes());
        s.push(1);
        s.extend_from_slice(&88u16.to_be_bytes()); // Oslo
        s.extend_from_slice(&0u16.to_be_bytes());
        s.push(2); // master table version
        s.push(0); // local table version
        s.push(1); // start of forecast
        s.extend_from_slice(&self.year.to_be_bytes());
        s.extend_from_slice(&[self.month, self.day, self.hour, 0, 0]);
        s.push(0); // operational
        s.push(1); // forecast
        s
    }

    fn section3(&self) -> Vec<u8> {
        let (la2, lo2) = self.last_point();
        let (ni, nj) = self.declared_grid.unwrap_or((self.ni, self.nj));
        let mut s = Vec::with_capacity(72);
        s.extend_from_slice(&72u32.to_be_bytes());
        s.push(3);
        s.push(0); // source
        s.extend_from_slice(&(ni * nj).to_be_bytes());
        s.push(0);
        s.push(0);
        s.extend_from_slice(&0u16.to_be_bytes()); // template 3.0
        s.push(6); // spherical earth, r = 6371229 m
        s.push(0);
        s.extend_from_slice(&0u32.to_be_bytes());
        s.push(0);
        s.extend_from_slice(&0u32.to_be_bytes());
        s.push(0);
        s.extend_from_slice(&0u32.to_be_bytes());
        s.extend_from_slice(&ni.to_be_bytes());
        s.extend_from_slice(&nj.to_be_bytes());
        s.extend_from_slice(&0u32.to_be_bytes()); // basic angle
        s.extend_from_slice(&u32::MAX.to_be_bytes()); // subdivisions
        s.extend_from_slice(&sign_magnitude_32(self.la1));
        s.extend_from_slice(&sign_magnitude_32(self.lo1));
        s.push(0b0011_0000); // i and j increments given
        s.extend_from_slice(&sign_magnitude_32(la2));
        s.extend_from_slice(&sign_magnitude_32(lo2));
        s.extend_from_slice(&self.di.to_be_bytes());
        s.extend_from_slice(&self.dj.to_be_bytes());
        s.push(self.scanning_mode);
        debug_assert_eq!(s.len(), 72);
        s
    }

    fn last_point(&self) -> (i64, i64) {
        let lat_step = if self.scanning_mode & 0x40 != 0 { 1 } else { -1 };
        let lon_step = if self.scanning_mode & 0x80 != 0 { -1 } else { 1 };
        (
            self.la1 + lat_step * (self.nj as i64 - 1) * self.dj as i64,
            self.lo1 + lon_step * (self.ni as i64 - 1) * self.di as i64,
        )
    }

    fn section4(&self, field: &FieldSpec) -> Vec<u8> {
        let mut s = Vec::with_capacity(34);
        s.extend_from_slice(&34u32.to_be_bytes());
        s.push(4);
        s.extend_from_slice(&0u16.to_be_bytes()); // no coordinate values
        s.extend_from_slice(&0u16.to_be_bytes()); // template 4.0
        s.push(field.category);
        s.push(field.number);
        s.push(2); // forecast
        s.push(0);
        s.push(0);
        s.extend_from_slice(&0u16.to_be_bytes());
        s.push(0);
        s.push(1); // hours
        s.extend_from_slice(&self.forecast_hours.to_be_bytes());
        s.push(100); // isobaric surface
        s.push(0);
        s.extend_from_slice(&(field.pressure_hpa * 100).to_be_bytes()); // Pa
        s.push(255); // no second surface
        s.push(0);
        s.extend_from_slice(&0u32.to_be_bytes());
        debug_assert_eq!(s.len(), 34);
        s
    }

    fn data_sections(&self, field: &FieldSpec) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        const DECIMAL_SCALE: i32 = 2;

        let scaled: Vec<i64> = field
            .values
            .iter()
            .flatten()
            .map(|v| (v * 10f64.powi(DECIMAL_SCALE)).round() as i64)
            .collect();
        let reference = scaled.iter().copied().min().unwrap_or(0);
        let max_delta = scaled.iter().map(|s| s - reference).max().unwrap_or(0) as u64;
        let bits = if max_delta == 0 {
            0
        } else {
            64 - max_delta.leading_zeros() as u8
        };

        let mut s5 = Vec::with_capacity(21);
        s5.extend_from_slice(&21u32.to_be_bytes());
        s5.push(5);
        let num_packed = self
            .declared_grid
            .map_or(scaled.len() as u32, |(ni, nj)| ni * nj);
        s5.extend_from_slice(&num_packed.to_be_bytes());
        s5.extend_from_slice(&field.packing_template.to_be_bytes());
        s5.extend_from_slice(&(reference as f32).to_be_bytes());
        s5.extend_from_slice(&0u16.to_be_bytes()); // E
        s5.extend_from_slice(&(DECIMAL_SCALE as u16).to_be_bytes()); // D
        s5.push(bits);
        s5.push(0); // floating point

        let has_missing = field.values.iter().any(Option::is_none);
        let mut s6 = Vec::new();
        if has_missing {
            let mut bitmap = vec![0u8; field.values.len().div_ceil(8)];
            for (i, v) in field.values.iter().enumerate() {
                if v.is_some() {
                    bitmap[i / 8] |= 0x80 >> (i % 8);
                }
            }
            s6.extend_from_slice(&(6 + bitmap.len() as u32).to_be_bytes());
            s6.push(6);
            s6.push(0);
            s6.extend_from_slice(&bitmap);
        } else {
            s6.extend_from_slice(&6u32.to_be_bytes());
            s6.push(6);
            s6.push(255);
        }

        let mut packed = BitWriter::default();
        for value in &scaled {
            packed.write((value - reference) as u64, bits);
        }
        let packed = packed.finish();
        let mut s7 = Vec::with_capacity(5 + packed.len());
        s7.extend_from_slice(&(5 + packed.len() as u32).to_be_bytes());
        s7.push(7);
        s7.extend_from_slice(&packed);

        (s5, s6, s7)
    }
}

fn sign_magnitude_32(value: i64) -> [u8; 4] {
    let magnitude = value.unsigned_abs() as u32 & 0x7fff_ffff;
    let raw = if value < 0 {
        magnitude | 0x8000_0000
    } else {
        magnitude
    };
    raw.to_be_bytes()
}

#[derive(Default)]
struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    fn write(&mut self, value: u64, bits: u8) {
        for shift in (0..bits).rev() {
            if self.bit_len % 8 == 0 {
                self.bytes.push(0);
            }
            if (value >> shift) & 1 == 1 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bit_len % 8);
            }
            self.bit_len += 1;
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// 3×3 grid at 60–59°N, 10–11°E (0.5° spacing) with temperature and wind at
/// 1000, 850 and 500 hPa. Wind is u = 3, v = 4 everywhere at 850 hPa and
/// calm elsewhere; temperature falls 10 K per level from 288.15 K.
pub(crate) fn sample_product() -> Vec<u8> {
    const POINTS: usize = 9;
    let filled = |v: f64| vec![Some(v); POINTS];

    Grib2Builder::new(3, 3)
        .with_temperature(1000, filled(288.15))
        .with_temperature(850, filled(278.15))
        .with_temperature(500, filled(268.15))
        .with_wind(1000, filled(0.0), filled(0.0))
        .with_wind(850, filled(3.0), filled(4.0))
        .with_wind(500, filled(0.0), filled(0.0))
        .build()
}
