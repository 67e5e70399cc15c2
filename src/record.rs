//! Sample records and their on-disk CSV encoding

/// One set of compensated sensor readings.
///
/// All four values are scaled integers, straight out of the datasheet's
/// fixed-point formulas: humidity in milli-%RH, temperature in 0.01 °C,
/// pressure in Pa, gas resistance in Ω.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Measurements {
    pub humidity: i32,
    pub temperature: i32,
    pub pressure: i32,
    pub gas_resistance: i32,
}

impl Measurements {
    /// Sentinel pattern held until the first successful poll.
    pub const UNSET: Self = Self {
        humidity: i32::MIN,
        temperature: i32::MIN,
        pressure: i32::MIN,
        gas_resistance: i32::MIN,
    };
}

/// One queue entry: readings plus the monotonic timestamp taken when the
/// producer sampled them. Immutable once enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SampleRecord {
    pub timestamp_ms: u64,
    pub readings: Measurements,
}

/// Worst case CSV line: four signed 11-char numbers, 3 commas, newline.
pub const MAX_RECORD_LEN: usize = 48;

/// Encode one record as `humidity,temperature,pressure,gas_resistance\n`.
/// Returns the number of bytes written.
pub fn encode_csv(record: &SampleRecord, buf: &mut [u8; MAX_RECORD_LEN]) -> usize {
    let r = &record.readings;
    let mut pos = 0;
    for (i, value) in [r.humidity, r.temperature, r.pressure, r.gas_resistance]
        .into_iter()
        .enumerate()
    {
        if i > 0 {
            buf[pos] = b',';
            pos += 1;
        }
        pos += fmt_i32(value, &mut buf[pos..]);
    }
    buf[pos] = b'\n';
    pos + 1
}

/// Minimal signed decimal formatter. No locale, no floats, no `core::fmt`.
/// Returns the number of bytes written; `out` must hold at least 11 bytes.
pub fn fmt_i32(value: i32, out: &mut [u8]) -> usize {
    // widen so that i32::MIN survives negation
    let mut n = value as i64;
    let mut pos = 0;
    if n < 0 {
        out[0] = b'-';
        pos = 1;
        n = -n;
    }
    let mut digits = [0u8; 10];
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        count += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    for i in 0..count {
        out[pos + i] = digits[count - 1 - i];
    }
    pos + count
}
