//! Iterates the records between two byte offsets.

use crate::codec::{self, Sample};
use crate::error::Result;
use crate::line::LineByteStream;
use std::path::Path;
use tracing::warn;

/// Decodes every complete line in a byte range.
///
/// The start offset is snapped forward to the next line start, so an offset in the middle of a
/// record never produces a partial record. Pass the offset of the newline that ends the previous
/// line to start exactly at a record.
pub struct PositionalIter {
    stream: LineByteStream,
    year: i16,
    done: bool,
}

impl PositionalIter {
    /// Opens `path` for records in `[start, end)` of a file whose header declares `year`.
    pub fn new(path: impl AsRef<Path>, year: i16, start: u64, end: u64) -> Result<Self> {
        let mut stream = LineByteStream::open_range(path, start, end)?;
        let done = !stream.seek_to_first_new_line()?;
        Ok(Self { stream, year, done })
    }
}

impl Iterator for PositionalIter {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let position = self.stream.position();
        let decoded = match self.stream.read_line() {
            Ok(Some(line)) => codec::decode_line(self.year, line),
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(err) => Err(err),
        };
        if let Err(err) = &decoded {
            warn!(
                "Stopping read of {} at offset {}: {}",
                self.stream.path().display(),
                position,
                err
            );
            self.done = true;
        }
        Some(decoded)
    }
}
