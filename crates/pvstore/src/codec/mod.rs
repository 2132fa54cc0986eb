//! Sample codec.
//!
//! Turns a [`Sample`] into a flat byte record and back. Records are written little-endian, followed by a
//! CRC32 of everything before it:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ seconds_into_year u32 │ nanos u32 │ status i32 │ severity i32 │
//! ├──────────────────────────────────────────────────────────┤
//! │ flags u8 │ kind tag u8 │ value payload (per ValueKind)    │
//! ├──────────────────────────────────────────────────────────┤
//! │ repeat_count u32        (flags & HAS_REPEAT_COUNT)        │
//! │ field count u16 + pairs (flags & HAS_FIELDS)              │
//! ├──────────────────────────────────────────────────────────┤
//! │ crc32 u32                                                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The year is not stored per record; it comes from the file header and is passed to [`decode`].

pub mod escape;
pub mod header;

pub use escape::{escape, unescape, ESCAPE_CHAR, NEWLINE_CHAR};
pub use header::PayloadInfo;

use crate::error::{Result, StoreError};
use crate::time::{to_year_second, YearSecondTimestamp};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

const HAS_REPEAT_COUNT: u8 = 0b001;
const HAS_FIELDS: u8 = 0b010;
const FIELD_ACTUAL_CHANGE: u8 = 0b100;

/// Fixed-size prefix: secs, nanos, status, severity, flags, kind.
const FIXED_PREFIX_SIZE: usize = 18;

/// Trailing checksum size.
const CRC_SIZE: usize = 4;

/// The closed set of value shapes a PV can archive.
///
/// Tags are stable on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    /// Single string.
    ScalarString = 0,
    /// Single 16-bit integer.
    ScalarShort = 1,
    /// Single 32-bit float.
    ScalarFloat = 2,
    /// Single enum index.
    ScalarEnum = 3,
    /// Single signed byte.
    ScalarByte = 4,
    /// Single 32-bit integer.
    ScalarInt = 5,
    /// Single 64-bit float.
    ScalarDouble = 6,
    /// Array of strings.
    WaveformString = 7,
    /// Array of 16-bit integers.
    WaveformShort = 8,
    /// Array of 32-bit floats.
    WaveformFloat = 9,
    /// Array of enum indices.
    WaveformEnum = 10,
    /// Array of bytes.
    WaveformByte = 11,
    /// Array of 32-bit integers.
    WaveformInt = 12,
    /// Array of 64-bit floats.
    WaveformDouble = 13,
    /// Opaque structured payload.
    GenericBytes = 14,
}

impl ValueKind {
    /// Every kind, in tag order.
    pub const ALL: [ValueKind; 15] = [
        Self::ScalarString,
        Self::ScalarShort,
        Self::ScalarFloat,
        Self::ScalarEnum,
        Self::ScalarByte,
        Self::ScalarInt,
        Self::ScalarDouble,
        Self::WaveformString,
        Self::WaveformShort,
        Self::WaveformFloat,
        Self::WaveformEnum,
        Self::WaveformByte,
        Self::WaveformInt,
        Self::WaveformDouble,
        Self::GenericBytes,
    ];

    /// On-disk tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Looks a kind up by its on-disk tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    /// Returns true for array-valued kinds.
    pub fn is_waveform(self) -> bool {
        matches!(
            self,
            Self::WaveformString
                | Self::WaveformShort
                | Self::WaveformFloat
                | Self::WaveformEnum
                | Self::WaveformByte
                | Self::WaveformInt
                | Self::WaveformDouble
                | Self::GenericBytes
        )
    }

    /// Canonical name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScalarString => "DBR_SCALAR_STRING",
            Self::ScalarShort => "DBR_SCALAR_SHORT",
            Self::ScalarFloat => "DBR_SCALAR_FLOAT",
            Self::ScalarEnum => "DBR_SCALAR_ENUM",
            Self::ScalarByte => "DBR_SCALAR_BYTE",
            Self::ScalarInt => "DBR_SCALAR_INT",
            Self::ScalarDouble => "DBR_SCALAR_DOUBLE",
            Self::WaveformString => "DBR_WAVEFORM_STRING",
            Self::WaveformShort => "DBR_WAVEFORM_SHORT",
            Self::WaveformFloat => "DBR_WAVEFORM_FLOAT",
            Self::WaveformEnum => "DBR_WAVEFORM_ENUM",
            Self::WaveformByte => "DBR_WAVEFORM_BYTE",
            Self::WaveformInt => "DBR_WAVEFORM_INT",
            Self::WaveformDouble => "DBR_WAVEFORM_DOUBLE",
            Self::GenericBytes => "DBR_V4_GENERIC_BYTES",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed sample value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// See [`ValueKind::ScalarString`].
    ScalarString(String),
    /// See [`ValueKind::ScalarShort`].
    ScalarShort(i16),
    /// See [`ValueKind::ScalarFloat`].
    ScalarFloat(f32),
    /// See [`ValueKind::ScalarEnum`].
    ScalarEnum(i16),
    /// See [`ValueKind::ScalarByte`].
    ScalarByte(i8),
    /// See [`ValueKind::ScalarInt`].
    ScalarInt(i32),
    /// See [`ValueKind::ScalarDouble`].
    ScalarDouble(f64),
    /// See [`ValueKind::WaveformString`].
    WaveformString(Vec<String>),
    /// See [`ValueKind::WaveformShort`].
    WaveformShort(Vec<i16>),
    /// See [`ValueKind::WaveformFloat`].
    WaveformFloat(Vec<f32>),
    /// See [`ValueKind::WaveformEnum`].
    WaveformEnum(Vec<i16>),
    /// See [`ValueKind::WaveformByte`].
    WaveformByte(Vec<u8>),
    /// See [`ValueKind::WaveformInt`].
    WaveformInt(Vec<i32>),
    /// See [`ValueKind::WaveformDouble`].
    WaveformDouble(Vec<f64>),
    /// See [`ValueKind::GenericBytes`].
    GenericBytes(Vec<u8>),
}

impl Value {
    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::ScalarString(_) => ValueKind::ScalarString,
            Self::ScalarShort(_) => ValueKind::ScalarShort,
            Self::ScalarFloat(_) => ValueKind::ScalarFloat,
            Self::ScalarEnum(_) => ValueKind::ScalarEnum,
            Self::ScalarByte(_) => ValueKind::ScalarByte,
            Self::ScalarInt(_) => ValueKind::ScalarInt,
            Self::ScalarDouble(_) => ValueKind::ScalarDouble,
            Self::WaveformString(_) => ValueKind::WaveformString,
            Self::WaveformShort(_) => ValueKind::WaveformShort,
            Self::WaveformFloat(_) => ValueKind::WaveformFloat,
            Self::WaveformEnum(_) => ValueKind::WaveformEnum,
            Self::WaveformByte(_) => ValueKind::WaveformByte,
            Self::WaveformInt(_) => ValueKind::WaveformInt,
            Self::WaveformDouble(_) => ValueKind::WaveformDouble,
            Self::GenericBytes(_) => ValueKind::GenericBytes,
        }
    }

    /// Number of elements: 1 for scalars, the array length for waveforms.
    pub fn element_count(&self) -> usize {
        match self {
            Self::WaveformString(v) => v.len(),
            Self::WaveformShort(v) | Self::WaveformEnum(v) => v.len(),
            Self::WaveformFloat(v) => v.len(),
            Self::WaveformByte(v) | Self::GenericBytes(v) => v.len(),
            Self::WaveformInt(v) => v.len(),
            Self::WaveformDouble(v) => v.len(),
            _ => 1,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::ScalarString(s) => put_str(out, s)?,
            Self::ScalarShort(v) | Self::ScalarEnum(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::ScalarFloat(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::ScalarByte(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::ScalarInt(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::ScalarDouble(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::WaveformString(values) => {
                put_len(out, values.len())?;
                for s in values {
                    put_str(out, s)?;
                }
            }
            Self::WaveformShort(values) | Self::WaveformEnum(values) => {
                put_len(out, values.len())?;
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Self::WaveformFloat(values) => {
                put_len(out, values.len())?;
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Self::WaveformByte(bytes) | Self::GenericBytes(bytes) => {
                put_len(out, bytes.len())?;
                out.extend_from_slice(bytes);
            }
            Self::WaveformInt(values) => {
                put_len(out, values.len())?;
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            Self::WaveformDouble(values) => {
                put_len(out, values.len())?;
                for v in values {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    fn read_from(kind: ValueKind, cursor: &mut Cursor<'_>) -> Result<Self> {
        Ok(match kind {
            ValueKind::ScalarString => Self::ScalarString(cursor.string()?),
            ValueKind::ScalarShort => Self::ScalarShort(cursor.i16()?),
            ValueKind::ScalarFloat => Self::ScalarFloat(f32::from_le_bytes(cursor.array()?)),
            ValueKind::ScalarEnum => Self::ScalarEnum(cursor.i16()?),
            ValueKind::ScalarByte => Self::ScalarByte(i8::from_le_bytes(cursor.array()?)),
            ValueKind::ScalarInt => Self::ScalarInt(cursor.i32()?),
            ValueKind::ScalarDouble => Self::ScalarDouble(f64::from_le_bytes(cursor.array()?)),
            ValueKind::WaveformString => {
                let count = cursor.count(4)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(cursor.string()?);
                }
                Self::WaveformString(values)
            }
            ValueKind::WaveformShort | ValueKind::WaveformEnum => {
                let count = cursor.count(2)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(cursor.i16()?);
                }
                if kind == ValueKind::WaveformShort {
                    Self::WaveformShort(values)
                } else {
                    Self::WaveformEnum(values)
                }
            }
            ValueKind::WaveformFloat => {
                let count = cursor.count(4)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(f32::from_le_bytes(cursor.array()?));
                }
                Self::WaveformFloat(values)
            }
            ValueKind::WaveformByte | ValueKind::GenericBytes => {
                let count = cursor.count(1)?;
                let bytes = cursor.take(count)?.to_vec();
                if kind == ValueKind::WaveformByte {
                    Self::WaveformByte(bytes)
                } else {
                    Self::GenericBytes(bytes)
                }
            }
            ValueKind::WaveformInt => {
                let count = cursor.count(4)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(cursor.i32()?);
                }
                Self::WaveformInt(values)
            }
            ValueKind::WaveformDouble => {
                let count = cursor.count(8)?;
                let mut values = Vec::with_capacity(count);
                for _ in 0..count {
                    values.push(f64::from_le_bytes(cursor.array()?));
                }
                Self::WaveformDouble(values)
            }
        })
    }
}

/// One archived sample of a process variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Year the timestamp is relative to.
    pub year: i16,
    /// Seconds since the start of `year`.
    pub seconds_into_year: u32,
    /// Sub-second nanoseconds.
    pub nanos: u32,
    /// Alarm status code.
    pub status: i32,
    /// Alarm severity code.
    pub severity: i32,
    /// The value.
    pub value: Value,
    /// Number of identical samples this one stands for, if reduced upstream.
    pub repeat_count: Option<u32>,
    /// Side-channel field values (units, limits, ...).
    pub field_values: BTreeMap<String, String>,
    /// True when `field_values` reflects an actual change rather than a periodic copy.
    pub field_actual_change: bool,
}

impl Sample {
    /// Creates a sample at `ts` with no alarm.
    pub fn new(ts: DateTime<Utc>, value: Value) -> Self {
        Self::at(to_year_second(&ts), value)
    }

    /// Creates a sample at an already decomposed timestamp.
    pub fn at(ts: YearSecondTimestamp, value: Value) -> Self {
        Self {
            year: ts.year,
            seconds_into_year: ts.seconds_into_year,
            nanos: ts.nanos,
            status: 0,
            severity: 0,
            value,
            repeat_count: None,
            field_values: BTreeMap::new(),
            field_actual_change: false,
        }
    }

    /// Sets alarm status and severity.
    pub fn with_alarm(mut self, status: i32, severity: i32) -> Self {
        self.status = status;
        self.severity = severity;
        self
    }

    /// Sets the repeat count.
    pub fn with_repeat_count(mut self, repeat_count: u32) -> Self {
        self.repeat_count = Some(repeat_count);
        self
    }

    /// Adds a side-channel field value.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.field_values.insert(name.into(), value.into());
        self
    }

    /// Marks the field values as an actual change.
    pub fn with_field_actual_change(mut self, changed: bool) -> Self {
        self.field_actual_change = changed;
        self
    }

    /// Timestamp as year and seconds-into-year.
    pub fn year_second(&self) -> YearSecondTimestamp {
        YearSecondTimestamp::new(self.year, self.seconds_into_year, self.nanos)
    }

    /// Timestamp as a UTC instant.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.year_second().to_datetime()
    }

    /// Timestamp as whole epoch seconds.
    pub fn epoch_seconds(&self) -> i64 {
        self.year_second().epoch_seconds()
    }

    /// Kind of the carried value.
    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }
}

/// Encodes a sample into an unescaped record.
///
/// # Errors
///
/// Returns [`StoreError::RecordTooLarge`] if a string, waveform or field map is longer than the
/// record format can describe.
pub fn encode(sample: &Sample) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(FIXED_PREFIX_SIZE + 16 + CRC_SIZE);
    out.extend_from_slice(&sample.seconds_into_year.to_le_bytes());
    out.extend_from_slice(&sample.nanos.to_le_bytes());
    out.extend_from_slice(&sample.status.to_le_bytes());
    out.extend_from_slice(&sample.severity.to_le_bytes());

    let mut flags = 0u8;
    if sample.repeat_count.is_some() {
        flags |= HAS_REPEAT_COUNT;
    }
    if !sample.field_values.is_empty() {
        flags |= HAS_FIELDS;
    }
    if sample.field_actual_change {
        flags |= FIELD_ACTUAL_CHANGE;
    }
    out.push(flags);
    out.push(sample.value.kind().tag());
    sample.value.write_to(&mut out)?;

    if let Some(repeat_count) = sample.repeat_count {
        out.extend_from_slice(&repeat_count.to_le_bytes());
    }
    if !sample.field_values.is_empty() {
        put_count(&mut out, sample.field_values.len(), "field map")?;
        for (name, value) in &sample.field_values {
            put_str(&mut out, name)?;
            put_str(&mut out, value)?;
        }
    }

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Encodes a sample as an escaped, newline-terminated line.
///
/// # Errors
///
/// Same as [`encode`].
pub fn encode_line(sample: &Sample) -> Result<Vec<u8>> {
    let record = encode(sample)?;
    let mut line = Vec::with_capacity(record.len() + 8);
    escape::escape_into(&record, &mut line);
    line.push(NEWLINE_CHAR);
    Ok(line)
}

/// Decodes an unescaped record for a file whose header declares `year`.
///
/// # Errors
///
/// Returns a corruption error (see [`StoreError::is_corruption`]) for truncated records, unknown
/// tags, bad UTF-8, trailing bytes or a checksum mismatch.
pub fn decode(year: i16, bytes: &[u8]) -> Result<Sample> {
    decode_record(year, bytes).inspect_err(|err| {
        warn!("Undecodable {} byte record: {}", bytes.len(), err);
        debug!("Undecodable record bytes: {}", hex::encode(bytes));
    })
}

/// Unescapes and decodes one line (without its newline).
pub fn decode_line(year: i16, line: &[u8]) -> Result<Sample> {
    let record = unescape(line)?;
    decode(year, &record)
}

fn decode_record(year: i16, bytes: &[u8]) -> Result<Sample> {
    let body = verify_crc(bytes)?;
    let mut cursor = Cursor::new(body);

    let seconds_into_year = cursor.u32()?;
    let nanos = cursor.u32()?;
    let status = cursor.i32()?;
    let severity = cursor.i32()?;
    let flags = cursor.u8()?;
    let tag = cursor.u8()?;
    let kind = ValueKind::from_tag(tag)
        .ok_or_else(|| StoreError::decode(bytes.len(), format!("unknown value tag {}", tag)))?;
    let value = Value::read_from(kind, &mut cursor)?;

    let repeat_count = if flags & HAS_REPEAT_COUNT != 0 {
        Some(cursor.u32()?)
    } else {
        None
    };
    let mut field_values = BTreeMap::new();
    if flags & HAS_FIELDS != 0 {
        let count = cursor.u16()?;
        for _ in 0..count {
            let name = cursor.string()?;
            let value = cursor.string()?;
            field_values.insert(name, value);
        }
    }
    cursor.finish()?;

    Ok(Sample {
        year,
        seconds_into_year,
        nanos,
        status,
        severity,
        value,
        repeat_count,
        field_values,
        field_actual_change: flags & FIELD_ACTUAL_CHANGE != 0,
    })
}

/// Checks the trailing CRC and returns the body it covers.
pub(crate) fn verify_crc(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < CRC_SIZE {
        return Err(StoreError::decode(bytes.len(), "record shorter than checksum"));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - CRC_SIZE);
    let mut buf = [0u8; CRC_SIZE];
    buf.copy_from_slice(crc_bytes);
    let expected = u32::from_le_bytes(buf);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(StoreError::ChecksumMismatch { expected, actual });
    }
    Ok(body)
}

pub(crate) fn put_len(out: &mut Vec<u8>, len: usize) -> Result<()> {
    let len = u32::try_from(len).map_err(|_| StoreError::RecordTooLarge {
        what: "length prefix",
        len,
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Writes a `u16` entry count.
pub(crate) fn put_count(out: &mut Vec<u8>, count: usize, what: &'static str) -> Result<()> {
    let count = u16::try_from(count).map_err(|_| StoreError::RecordTooLarge { what, len: count })?;
    out.extend_from_slice(&count.to_le_bytes());
    Ok(())
}

pub(crate) fn put_str(out: &mut Vec<u8>, s: &str) -> Result<()> {
    put_len(out, s.len())?;
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked little-endian reader over a record body.
pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let remaining = self.bytes.len() - self.pos;
        if n > remaining {
            return Err(StoreError::decode(
                self.bytes.len(),
                format!("need {} bytes at offset {}, {} left", n, self.pos, remaining),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(crate) fn i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    /// Reads an element count and checks it fits in the remaining bytes.
    pub(crate) fn count(&mut self, min_element_size: usize) -> Result<usize> {
        let count = self.u32()? as usize;
        let remaining = self.bytes.len() - self.pos;
        if count.saturating_mul(min_element_size) > remaining {
            return Err(StoreError::decode(
                self.bytes.len(),
                format!("element count {} exceeds remaining {} bytes", count, remaining),
            ));
        }
        Ok(count)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let len = self.count(1)?;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|err| StoreError::decode(self.bytes.len(), format!("invalid UTF-8: {}", err)))
    }

    pub(crate) fn finish(&self) -> Result<()> {
        if self.pos != self.bytes.len() {
            return Err(StoreError::decode(
                self.bytes.len(),
                format!("{} trailing bytes", self.bytes.len() - self.pos),
            ));
        }
        Ok(())
    }
}
