//! Partition file summary: header, first and last records, and the extent of trustworthy data.
//!
//! The tail of a partition file can be torn by a crash or overwritten by garbage. [`FileInfo::read`]
//! walks backward from the end, discarding lines that fail to decode, until it finds a good record.
//! Lines that fail to decode at the head of the data section are skipped the same way going forward.
//! Corruption never makes it fail; it only narrows
//! [`FileInfo::first_event_position`]..[`FileInfo::valid_data_end`].

use crate::codec::{self, PayloadInfo, Sample, ValueKind};
use crate::error::{Result, StoreError};
use crate::line::{LineByteStream, ReverseLineReader};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Maximum corrupt lines discarded from the tail before falling back to a forward scan.
pub const MAX_TAIL_RECOVERY_ATTEMPTS: usize = 1000;

/// Maximum corrupt lines skipped at the head of the data section looking for the first record.
pub const MAX_HEAD_RECOVERY_ATTEMPTS: usize = 1000;

/// Summary of one partition file.
#[derive(Debug, Clone)]
pub struct FileInfo {
    path: PathBuf,
    payload: PayloadInfo,
    file_size: u64,
    data_start: u64,
    first_event: Option<Sample>,
    first_event_position: u64,
    last_event: Option<Sample>,
    last_event_position: u64,
    valid_data_end: u64,
}

impl FileInfo {
    /// Reads the header and locates the first and last decodable records.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MissingHeader`] for a zero-byte file or an unparsable header, and I/O
    /// errors. A corrupt tail is not an error.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut stream = LineByteStream::open(&path)?;
        let file_size = stream.file_size();
        if file_size == 0 {
            return Err(StoreError::MissingHeader {
                path,
                reason: "zero byte file".to_string(),
            });
        }

        let payload = match stream.read_line()? {
            Some(line) => {
                PayloadInfo::decode_line(line).map_err(|err| StoreError::MissingHeader {
                    path: path.clone(),
                    reason: err.to_string(),
                })?
            }
            None => {
                return Err(StoreError::MissingHeader {
                    path,
                    reason: "header line is not terminated".to_string(),
                })
            }
        };
        let data_start = stream.position();
        let year = payload.year;

        let mut first_event = None;
        let mut first_event_position = data_start;
        for _ in 0..MAX_HEAD_RECOVERY_ATTEMPTS {
            let start = stream.position();
            let Some(line) = stream.read_line()? else {
                break;
            };
            match codec::decode_line(year, line) {
                Ok(sample) => {
                    first_event = Some(sample);
                    first_event_position = start;
                    break;
                }
                Err(err) if err.is_corruption() => {
                    warn!(
                        "Skipping corrupt record at {} in {}: {}",
                        start,
                        path.display(),
                        err
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let mut info = Self {
            path,
            payload,
            file_size,
            data_start,
            first_event,
            first_event_position,
            last_event: None,
            last_event_position: first_event_position,
            valid_data_end: first_event_position,
        };
        if !info.recover_tail()? {
            info.scan_forward()?;
        }

        if info.has_corrupt_tail() {
            warn!(
                "{} has {} unusable bytes after offset {}",
                info.path.display(),
                info.file_size - info.valid_data_end,
                info.valid_data_end
            );
        }
        Ok(info)
    }

    /// Walks backward from the end of the file. Returns false if the retry budget ran out.
    fn recover_tail(&mut self) -> Result<bool> {
        let year = self.payload.year;
        let mut reader =
            ReverseLineReader::open(&self.path, self.first_event_position, self.file_size)?;

        for _ in 0..MAX_TAIL_RECOVERY_ATTEMPTS {
            let line_end = reader.upper();
            let (start, line) = match reader.next_line() {
                Ok(Some(found)) => found,
                Ok(None) => return Ok(true),
                Err(err) if err.is_corruption() => {
                    warn!("Giving up on tail of {}: {}", self.path.display(), err);
                    return Ok(true);
                }
                Err(err) => return Err(err),
            };
            match codec::decode_line(year, &line) {
                Ok(sample) => {
                    self.last_event = Some(sample);
                    self.last_event_position = start;
                    self.valid_data_end = line_end;
                    return Ok(true);
                }
                Err(err) if err.is_corruption() => {
                    debug!(
                        "Discarding corrupt line at {} in {}: {}",
                        start,
                        self.path.display(),
                        err
                    );
                }
                Err(err) => return Err(err),
            }
        }

        warn!(
            "No decodable record within {} lines of the end of {}; scanning forward",
            MAX_TAIL_RECOVERY_ATTEMPTS,
            self.path.display()
        );
        Ok(false)
    }

    /// Keeps the longest decodable prefix of the data section.
    fn scan_forward(&mut self) -> Result<()> {
        let year = self.payload.year;
        let mut stream =
            LineByteStream::open_range(&self.path, self.first_event_position, self.file_size)?;
        loop {
            let start = stream.position();
            let Some(line) = stream.read_line()? else {
                break;
            };
            match codec::decode_line(year, line) {
                Ok(sample) => {
                    self.last_event = Some(sample);
                    self.last_event_position = start;
                    self.valid_data_end = stream.position();
                }
                Err(err) if err.is_corruption() => break,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Logs a PV name mismatch. Returns false on a mismatch.
    pub fn check_pv_name(&self, pv_name: &str) -> bool {
        if self.payload.pv_name == pv_name {
            return true;
        }
        error!(
            "File {} is for PV {} but was opened for {}",
            self.path.display(),
            self.payload.pv_name,
            pv_name
        );
        false
    }

    /// Logs a PV name mismatch and rejects a value kind mismatch.
    pub fn check_payload(&self, pv_name: &str, kind: ValueKind) -> Result<()> {
        self.check_pv_name(pv_name);
        if self.payload.kind != kind {
            return Err(StoreError::TypeMismatch {
                expected: kind.to_string(),
                found: self.payload.kind.to_string(),
            });
        }
        Ok(())
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The decoded header.
    pub fn payload(&self) -> &PayloadInfo {
        &self.payload
    }

    /// PV named in the header.
    pub fn pv_name(&self) -> &str {
        &self.payload.pv_name
    }

    /// Year declared in the header.
    pub fn year(&self) -> i16 {
        self.payload.year
    }

    /// Value kind declared in the header.
    pub fn kind(&self) -> ValueKind {
        self.payload.kind
    }

    /// File size when it was read.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Offset of the first data record (just after the header line).
    pub fn data_start(&self) -> u64 {
        self.data_start
    }

    /// First decodable data record.
    pub fn first_event(&self) -> Option<&Sample> {
        self.first_event.as_ref()
    }

    /// Offset of the line holding [`FileInfo::first_event`]. Readers start here, past any corrupt
    /// lines at the head of the data section.
    pub fn first_event_position(&self) -> u64 {
        self.first_event_position
    }

    /// True when the file holds nothing after its header.
    pub fn is_header_only(&self) -> bool {
        self.file_size == self.data_start
    }

    /// Last decodable data record.
    pub fn last_event(&self) -> Option<&Sample> {
        self.last_event.as_ref()
    }

    /// Offset of the line holding [`FileInfo::last_event`].
    pub fn last_event_position(&self) -> u64 {
        self.last_event_position
    }

    /// Offset just past the newline of the last decodable record.
    pub fn valid_data_end(&self) -> u64 {
        self.valid_data_end
    }

    /// True when bytes after [`FileInfo::valid_data_end`] could not be decoded.
    pub fn has_corrupt_tail(&self) -> bool {
        self.valid_data_end < self.file_size
    }
}
