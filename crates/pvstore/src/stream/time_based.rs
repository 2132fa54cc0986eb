//! Sequential scan fallback for when byte offsets are unknown.
//!
//! A two-slot window slides over the data section until it straddles the query start:
//!
//! ```text
//!   ... [e1 < start] [e2 >= start] ...
//!        ▲ first yielded record (the most recent value before the window)
//! ```

use crate::codec::{self, Sample};
use crate::error::Result;
use crate::line::LineByteStream;
use crate::time::YearSecondTimestamp;
use std::path::Path;
use tracing::warn;

/// Yields the latest record before `start` followed by every record before `end`.
pub struct TimeBasedIter {
    stream: LineByteStream,
    year: i16,
    start: YearSecondTimestamp,
    end: YearSecondTimestamp,
    pending: Option<Sample>,
    positioned: bool,
    done: bool,
}

impl TimeBasedIter {
    /// Scans the lines of `path` in `[data_start, data_end)` for the query `[start, end)`.
    pub fn new(
        path: impl AsRef<Path>,
        year: i16,
        data_start: u64,
        data_end: u64,
        start: YearSecondTimestamp,
        end: YearSecondTimestamp,
    ) -> Result<Self> {
        Ok(Self {
            stream: LineByteStream::open_range(path, data_start, data_end)?,
            year,
            start,
            end,
            pending: None,
            positioned: false,
            done: false,
        })
    }

    /// Next decodable record. A record that fails to decode ends the usable data.
    fn read_next(&mut self) -> Result<Option<Sample>> {
        let position = self.stream.position();
        let Some(line) = self.stream.read_line()? else {
            return Ok(None);
        };
        match codec::decode_line(self.year, line) {
            Ok(sample) => Ok(Some(sample)),
            Err(err) if err.is_corruption() => {
                warn!(
                    "Ending scan of {} at corrupt record at offset {}: {}",
                    self.stream.path().display(),
                    position,
                    err
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Slides the window until its second slot is at or after `start`.
    fn position_window(&mut self) -> Result<Option<Sample>> {
        let Some(mut first) = self.read_next()? else {
            return Ok(None);
        };
        loop {
            match self.read_next()? {
                Some(second) if second.year_second() < self.start => first = second,
                second => {
                    self.pending = second;
                    return Ok(Some(first));
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Option<Sample>> {
        if !self.positioned {
            self.positioned = true;
            return self.position_window();
        }
        match self.pending.take() {
            Some(sample) => Ok(Some(sample)),
            None => self.read_next(),
        }
    }
}

impl Iterator for TimeBasedIter {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(sample)) if sample.year_second() < self.end => Some(Ok(sample)),
            Ok(_) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
