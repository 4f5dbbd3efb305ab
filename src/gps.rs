/*!
Decoder for the GPS timing header that some cameras embed in the first bytes of
every frame.

The header is a fixed big-endian layout of 44 bytes:

| Bytes | Field |
|-------|-------|
| 0-3   | sequence number |
| 4     | short sequence id |
| 5-6   | width |
| 7-8   | height |
| 9-12  | packed latitude (`SDDMMMMMMM`) |
| 13-16 | packed longitude (`SDDDMMMMMM`) |
| 17-24 | start event: flag, seconds, 24-bit ticks |
| 25-32 | end event |
| 33-40 | now event |
| 41-43 | free-running pulse counter |

Ticks come from a 10 MHz oscillator, so dividing by ten yields microseconds.
Seconds count from the vendor epoch, Julian Date 2450000.5.

Decoding is a pure byte transform: any buffer of at least [`HEADER_LEN`] bytes
decodes, garbage in yields a structurally valid (if meaningless) record.
*/

use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Number of header bytes read from the start of a frame.
pub const HEADER_LEN: usize = 44;

/// Julian Date of the vendor's second counter origin.
pub const EPOCH_JD: f64 = 2450000.5;

/// Julian Date of the Unix epoch.
const UNIX_EPOCH_JD: f64 = 2440587.5;

/// Seconds between the vendor epoch and the Unix epoch (9413 days).
const EPOCH_UNIX_OFFSET: i64 = 9413 * 86400;

/// Microseconds from 0001-01-01 to the vendor epoch, for SER frame timestamps.
pub const SER_EPOCH_OFFSET_US: u64 = 62_948_880_000_000_000;

/// Packed coordinates above this value denote the southern/western hemisphere.
const SIGN_THRESHOLD: u32 = 1_000_000_000;

const SEQ_OFFSET: usize = 0;
const SHORT_SEQ_OFFSET: usize = 4;
const WIDTH_OFFSET: usize = 5;
const HEIGHT_OFFSET: usize = 7;
const LATITUDE_OFFSET: usize = 9;
const LONGITUDE_OFFSET: usize = 13;
const START_OFFSET: usize = 17;
const END_OFFSET: usize = 25;
const NOW_OFFSET: usize = 33;
const PULSE_OFFSET: usize = 41;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Receiver state reported in the high nibble of the now-event flag.
pub enum GpsState {
    /// Receiver powered.
    On,
    /// Searching for satellites.
    Searching,
    /// Acquiring lock.
    Locking,
    /// Locked, timestamps are disciplined.
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// One shutter event (start, end or "now") from the header.
pub struct ShutterEvent {
    /// Event flag byte.
    pub flag: u8,
    /// Whole seconds since the vendor epoch.
    pub seconds: u32,
    /// Raw 24-bit sub-second tick count (0.1 us per tick).
    pub ticks: u32,
}

impl ShutterEvent {
    /// Sub-second part in microseconds.
    pub fn microseconds(&self) -> f64 {
        self.ticks as f64 / 10.0
    }

    /// Julian Date of the event.
    pub fn julian_date(&self) -> f64 {
        (self.seconds as f64 + self.microseconds() / 1e6) / 86400.0 + EPOCH_JD
    }

    /// UTC time of the event, truncated to whole microseconds.
    ///
    /// Returns `None` only if the instant is outside chrono's range, which a
    /// 32-bit second counter cannot reach.
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        let secs = self.seconds as i64 + EPOCH_UNIX_OFFSET;
        let nanos = (self.ticks / 10).min(999_999) * 1_000;
        DateTime::from_timestamp(secs, nanos)
    }

    /// ISO-8601 timestamp with millisecond precision, e.g. `2023-04-01T12:00:00.050`.
    pub fn iso8601(&self) -> String {
        let millis = (self.microseconds() / 1000.0) as u32;
        match self.to_datetime() {
            Some(dt) => format!("{}.{:03}", dt.format("%Y-%m-%dT%H:%M:%S"), millis),
            None => format!("JD {:.8}", self.julian_date()),
        }
    }

    /// Timestamp in microseconds since 0001-01-01, as used by SER video files.
    pub fn ser_timestamp(&self) -> u64 {
        self.seconds as u64 * 1_000_000 + (self.ticks / 10) as u64 + SER_EPOCH_OFFSET_US
    }
}

impl Display for ShutterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "flag {} @ {} s + {:.1} us ({})",
            self.flag,
            self.seconds,
            self.microseconds(),
            self.iso8601()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Timing and location record decoded from a frame's embedded header.
pub struct FrameMetadata {
    /// Frame sequence number.
    pub sequence: u32,
    /// Short (temporary) sequence id.
    pub short_sequence: u8,
    /// Frame width reported by the timing module.
    pub width: u16,
    /// Frame height reported by the timing module.
    pub height: u16,
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Shutter opened.
    pub start: ShutterEvent,
    /// Shutter closed.
    pub end: ShutterEvent,
    /// Time the header was written.
    pub now: ShutterEvent,
    /// Free-running pulse counter (oscillator ticks per PPS).
    pub pulse_counter: u32,
}

impl FrameMetadata {
    /// Decode the header at the start of `buf`.
    ///
    /// # Errors
    /// [`Error::BufferTooSmall`] if `buf` is shorter than [`HEADER_LEN`].
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        let reader = HeaderReader::new(buf)?;
        Ok(Self {
            sequence: reader.u32(SEQ_OFFSET),
            short_sequence: reader.u8(SHORT_SEQ_OFFSET),
            width: reader.u16(WIDTH_OFFSET),
            height: reader.u16(HEIGHT_OFFSET),
            latitude: decode_latitude(reader.u32(LATITUDE_OFFSET)),
            longitude: decode_longitude(reader.u32(LONGITUDE_OFFSET)),
            start: reader.event(START_OFFSET),
            end: reader.event(END_OFFSET),
            now: reader.event(NOW_OFFSET),
            pulse_counter: reader.u24(PULSE_OFFSET),
        })
    }

    /// Receiver state from the high nibble of the now-event flag.
    pub fn gps_state(&self) -> Option<GpsState> {
        match self.now.flag >> 4 {
            0 => Some(GpsState::On),
            1 => Some(GpsState::Searching),
            2 => Some(GpsState::Locking),
            3 => Some(GpsState::Locked),
            _ => None,
        }
    }

    /// Exposure length measured by the timing module, in seconds.
    pub fn measured_exposure(&self) -> f64 {
        (self.end.seconds as f64 - self.start.seconds as f64)
            + (self.end.microseconds() - self.start.microseconds()) / 1e6
    }
}

impl Display for FrameMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "GPS header #{} ({}): {} x {}, lat {:.6}, lon {:.6}",
            self.sequence,
            self.short_sequence,
            self.width,
            self.height,
            self.latitude,
            self.longitude
        )?;
        writeln!(f, "\tStart: {}", self.start)?;
        writeln!(f, "\tEnd: {}", self.end)?;
        writeln!(f, "\tNow: {}", self.now)?;
        write!(f, "\tPulse counter: {}", self.pulse_counter)
    }
}

/// Convert a packed `SDDMMMMMMM` latitude to decimal degrees.
pub fn decode_latitude(packed: u32) -> f64 {
    let degrees = ((packed % 1_000_000_000) / 10_000_000) as f64;
    let minutes = (packed % 10_000_000) as f64 / 6_000_000.0;
    apply_sign(packed, degrees + minutes)
}

/// Convert a packed `SDDDMMMMMM` longitude to decimal degrees.
pub fn decode_longitude(packed: u32) -> f64 {
    let degrees = ((packed % 1_000_000_000) / 1_000_000) as f64;
    let minutes = (packed % 1_000_000) as f64 / 600_000.0;
    apply_sign(packed, degrees + minutes)
}

// The hardware marks negative coordinates by pushing the packed value past
// the threshold rather than with a sign bit.
fn apply_sign(packed: u32, magnitude: f64) -> f64 {
    if packed > SIGN_THRESHOLD {
        -magnitude
    } else {
        magnitude
    }
}

/// Convert seconds since the vendor epoch (plus microseconds) to a Julian Date.
pub fn julian_date(seconds: u32, microseconds: f64) -> f64 {
    (seconds as f64 + microseconds / 1e6) / 86400.0 + EPOCH_JD
}

/// Convert a Julian Date to UTC.
pub fn julian_to_datetime(jd: f64) -> Option<DateTime<Utc>> {
    let unix = (jd - UNIX_EPOCH_JD) * 86400.0;
    if !unix.is_finite() {
        return None;
    }
    let secs = unix.floor();
    let nanos = ((unix - secs) * 1e9) as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}

/// Bounds-checked big-endian reads at fixed offsets.
struct HeaderReader<'a> {
    buf: &'a [u8; HEADER_LEN],
}

impl<'a> HeaderReader<'a> {
    fn new(buf: &'a [u8]) -> Result<Self, Error> {
        let buf = buf
            .get(..HEADER_LEN)
            .and_then(|head| head.try_into().ok())
            .ok_or(Error::BufferTooSmall(buf.len()))?;
        Ok(Self { buf })
    }

    fn u8(&self, at: usize) -> u8 {
        self.buf[at]
    }

    fn u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.buf[at], self.buf[at + 1]])
    }

    fn u24(&self, at: usize) -> u32 {
        u32::from_be_bytes([0, self.buf[at], self.buf[at + 1], self.buf[at + 2]])
    }

    fn u32(&self, at: usize) -> u32 {
        u32::from_be_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ])
    }

    fn event(&self, at: usize) -> ShutterEvent {
        ShutterEvent {
            flag: self.u8(at),
            seconds: self.u32(at + 1),
            ticks: self.u24(at + 5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use rand::Rng;

    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn put_u24(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 3].copy_from_slice(&v.to_be_bytes()[1..]);
    }

    fn sample_header() -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        put_u32(&mut buf, 0, 42);
        buf[4] = 7;
        buf[5..7].copy_from_slice(&1920u16.to_be_bytes());
        buf[7..9].copy_from_slice(&1080u16.to_be_bytes());
        put_u32(&mut buf, 9, 200_000_000);
        put_u32(&mut buf, 13, 1_120_000_000);
        buf[17] = 1;
        put_u32(&mut buf, 18, 1000);
        put_u24(&mut buf, 22, 50);
        buf[25] = 2;
        put_u32(&mut buf, 26, 1002);
        put_u24(&mut buf, 30, 5_000_000);
        buf[33] = 0x31;
        put_u32(&mut buf, 34, 1003);
        put_u24(&mut buf, 38, 9_999_999);
        put_u24(&mut buf, 41, 10_000_123);
        buf
    }

    #[test]
    fn test_decode_fields() {
        let meta = FrameMetadata::decode(&sample_header()).unwrap();
        assert_eq!(meta.sequence, 42);
        assert_eq!(meta.short_sequence, 7);
        assert_eq!(meta.width, 1920);
        assert_eq!(meta.height, 1080);
        assert_eq!(meta.start.flag, 1);
        assert_eq!(meta.start.seconds, 1000);
        assert_eq!(meta.start.ticks, 50);
        assert_eq!(meta.start.microseconds(), 5.0);
        assert_eq!(meta.end.flag, 2);
        assert_eq!(meta.end.seconds, 1002);
        assert_eq!(meta.end.microseconds(), 500_000.0);
        assert_eq!(meta.now.seconds, 1003);
        assert_eq!(meta.pulse_counter, 10_000_123);
        assert_eq!(meta.gps_state(), Some(GpsState::Locked));
        assert!((meta.measured_exposure() - 2.499995).abs() < 1e-9);
    }

    #[test]
    fn test_coordinate_sign() {
        assert_eq!(decode_latitude(200_000_000), 20.0);
        assert_eq!(decode_latitude(1_200_000_000), -20.0);
        assert_eq!(decode_longitude(120_000_000), 120.0);
        assert_eq!(decode_longitude(1_120_000_000), -120.0);
        // Exactly the threshold is not negative.
        assert_eq!(decode_latitude(1_000_000_000), 0.0);
    }

    #[test]
    fn test_coordinate_minutes() {
        // 45 degrees 30 minutes: minutes are stored as MMMMMMM = 30 * 100000.
        let lat = decode_latitude(453_000_000);
        assert!((lat - 45.5).abs() < 1e-9);
        let lon = decode_longitude(1_010_300_000);
        assert!((lon + 10.5).abs() < 1e-9);
    }

    #[test]
    fn test_header_coordinates() {
        let meta = FrameMetadata::decode(&sample_header()).unwrap();
        assert_eq!(meta.latitude, 20.0);
        assert_eq!(meta.longitude, -120.0);
    }

    #[test]
    fn test_short_buffer() {
        let buf = sample_header();
        assert_eq!(
            FrameMetadata::decode(&buf[..HEADER_LEN - 1]),
            Err(Error::BufferTooSmall(HEADER_LEN - 1))
        );
        assert!(FrameMetadata::decode(&buf[..HEADER_LEN]).is_ok());
        assert_eq!(FrameMetadata::decode(&[]), Err(Error::BufferTooSmall(0)));
    }

    #[test]
    fn test_millisecond_component() {
        let event = ShutterEvent {
            flag: 1,
            seconds: 1000,
            ticks: 500_000,
        };
        assert_eq!(event.microseconds(), 50_000.0);
        let iso = event.iso8601();
        assert!(iso.ends_with(".050"), "{iso}");
        let dt = event.to_datetime().unwrap();
        assert_eq!(dt.timestamp_subsec_millis(), 50);
    }

    #[test]
    fn test_epoch() {
        // Second zero is JD 2450000.5, i.e. 1995-10-10T00:00:00 UTC.
        let event = ShutterEvent {
            flag: 0,
            seconds: 0,
            ticks: 0,
        };
        assert_eq!(event.julian_date(), EPOCH_JD);
        assert_eq!(event.iso8601(), "1995-10-10T00:00:00.000");
        let dt = event.to_datetime().unwrap();
        assert_eq!((dt.year(), dt.month(), dt.day()), (1995, 10, 10));
        assert_eq!(dt.hour(), 0);
    }

    #[test]
    fn test_julian_conversions_agree() {
        let event = ShutterEvent {
            flag: 0,
            seconds: 86_400 * 365 + 3_661,
            ticks: 1_234_567,
        };
        assert_eq!(
            julian_date(event.seconds, event.microseconds()),
            event.julian_date()
        );
        let from_jd = julian_to_datetime(event.julian_date()).unwrap();
        let direct = event.to_datetime().unwrap();
        let delta = (from_jd - direct).num_milliseconds().abs();
        assert!(delta <= 1, "{from_jd} vs {direct}");
    }

    #[test]
    fn test_ser_timestamp() {
        let event = ShutterEvent {
            flag: 1,
            seconds: 2,
            ticks: 30,
        };
        assert_eq!(event.ser_timestamp(), 2_000_003 + SER_EPOCH_OFFSET_US);
    }

    #[test]
    fn test_garbage_never_panics() {
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let len = rng.gen_range(HEADER_LEN..HEADER_LEN + 32);
            let buf: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let meta = FrameMetadata::decode(&buf).unwrap();
            assert!(meta.start.ticks < 1 << 24);
            assert!(meta.latitude.is_finite());
            let _ = meta.start.iso8601();
            let _ = meta.to_string();
        }
    }
}
