//! Partition file header record.
//!
//! The first line of every partition file is an escaped [`PayloadInfo`]. It is written once when the
//! file is created and never touched again.
//!
//! ```text
//! magic "APVS" │ version u16 │ kind tag u8 │ year i16 │ element_count u32 (0 = unknown)
//! pv_name (u32 len + utf8) │ header count u16 │ (name, value)* │ crc32 u32
//! ```

use super::{put_count, put_str, verify_crc, Cursor, ValueKind, NEWLINE_CHAR};
use crate::error::{Result, StoreError};

/// Magic bytes at the start of every header record: "APVS".
pub const HEADER_MAGIC: [u8; 4] = *b"APVS";

/// Current header format version.
pub const HEADER_VERSION: u16 = 1;

/// Per-file metadata carried by the header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadInfo {
    /// PV the file belongs to.
    pub pv_name: String,
    /// Value kind of every record in the file.
    pub kind: ValueKind,
    /// Year that record seconds-into-year values are relative to.
    pub year: i16,
    /// Waveform element count, if known.
    pub element_count: Option<u32>,
    /// Free-form key/value headers.
    pub headers: Vec<(String, String)>,
}

impl PayloadInfo {
    /// Creates a header for `pv_name`.
    pub fn new(pv_name: impl Into<String>, kind: ValueKind, year: i16) -> Self {
        Self {
            pv_name: pv_name.into(),
            kind,
            year,
            element_count: None,
            headers: Vec::new(),
        }
    }

    /// Sets the element count.
    pub fn with_element_count(mut self, element_count: u32) -> Self {
        self.element_count = Some(element_count);
        self
    }

    /// Adds a free-form header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Encodes the header into an unescaped record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordTooLarge`] if the header map or a string is too long to encode.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(32 + self.pv_name.len());
        out.extend_from_slice(&HEADER_MAGIC);
        out.extend_from_slice(&HEADER_VERSION.to_le_bytes());
        out.push(self.kind.tag());
        out.extend_from_slice(&self.year.to_le_bytes());
        out.extend_from_slice(&self.element_count.unwrap_or(0).to_le_bytes());
        put_str(&mut out, &self.pv_name)?;
        put_count(&mut out, self.headers.len(), "header map")?;
        for (name, value) in &self.headers {
            put_str(&mut out, name)?;
            put_str(&mut out, value)?;
        }
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Encodes the header as an escaped, newline-terminated line.
    ///
    /// # Errors
    ///
    /// Same as [`PayloadInfo::encode`].
    pub fn encode_line(&self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        super::escape::escape_into(&self.encode()?, &mut line);
        line.push(NEWLINE_CHAR);
        Ok(line)
    }

    /// Decodes an unescaped header record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let body = verify_crc(bytes)?;
        let mut cursor = Cursor::new(body);

        let magic: [u8; 4] = cursor.array()?;
        if magic != HEADER_MAGIC {
            return Err(StoreError::decode(
                bytes.len(),
                format!("invalid header magic {:?}", magic),
            ));
        }
        let version = cursor.u16()?;
        if version != HEADER_VERSION {
            return Err(StoreError::decode(
                bytes.len(),
                format!("unsupported header version {}", version),
            ));
        }
        let tag = cursor.u8()?;
        let kind = ValueKind::from_tag(tag)
            .ok_or_else(|| StoreError::decode(bytes.len(), format!("unknown value tag {}", tag)))?;
        let year = cursor.i16()?;
        let element_count = match cursor.u32()? {
            0 => None,
            n => Some(n),
        };
        let pv_name = cursor.string()?;
        let count = cursor.u16()?;
        let mut headers = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let name = cursor.string()?;
            let value = cursor.string()?;
            headers.push((name, value));
        }
        cursor.finish()?;

        Ok(Self {
            pv_name,
            kind,
            year,
            element_count,
            headers,
        })
    }

    /// Unescapes and decodes a header line (without its newline).
    pub fn decode_line(line: &[u8]) -> Result<Self> {
        let record = super::unescape(line)?;
        Self::decode(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let info = PayloadInfo::new("ABC:DEF", ValueKind::WaveformDouble, 2024)
            .with_element_count(1024)
            .with_header("EGU", "mA");
        let line = info.encode_line().unwrap();
        let decoded = PayloadInfo::decode_line(&line[..line.len() - 1]).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut record = PayloadInfo::new("X", ValueKind::ScalarInt, 2024).encode().unwrap();
        record[0] = b'Z';
        let len = record.len();
        let crc = crc32fast::hash(&record[..len - 4]);
        record[len - 4..].copy_from_slice(&crc.to_le_bytes());
        assert!(PayloadInfo::decode(&record).is_err());
    }

    #[test]
    fn test_header_rejects_truncation() {
        let record = PayloadInfo::new("X", ValueKind::ScalarInt, 2024).encode().unwrap();
        assert!(PayloadInfo::decode(&record[..record.len() / 2]).is_err());
    }

    #[test]
    fn test_header_rejects_oversized_header_map() {
        let mut info = PayloadInfo::new("X", ValueKind::ScalarInt, 2024);
        info.headers = (0..70_000).map(|i| (i.to_string(), String::new())).collect();
        assert!(matches!(
            info.encode_line(),
            Err(StoreError::RecordTooLarge { len: 70_000, .. })
        ));
    }
}
