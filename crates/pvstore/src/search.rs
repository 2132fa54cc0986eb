//! Binary search over the line boundaries of a partition file.
//!
//! The search bisects byte offsets, snapping each midpoint forward to the next line start and decoding
//! the line there plus the one after it. It settles on the last record strictly before the target:
//!
//! ```text
//!   record[i] < target <= record[i + 1]      -> StayWhereYouAre (return i)
//!   record[i] >= target                      -> GoLeft
//!   record[i + 1] < target                   -> GoRight
//! ```
//!
//! A missing `record[i + 1]` counts as infinitely late, so a target past the last record settles on
//! the last record.

use crate::codec::{self, Sample};
use crate::error::{Result, StoreError};
use crate::info::FileInfo;
use crate::line::LineByteStream;
use crate::time::YearSecondTimestamp;
use tracing::{debug, error};

/// Upper bound on bisection steps per search.
pub const MAX_SEARCH_ITERATIONS: usize = 1000;

/// Direction chosen by a [`LineComparator`] after looking at a midpoint line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// The answer lies before the midpoint.
    GoLeft,
    /// The answer lies after the midpoint.
    GoRight,
    /// The midpoint line is the answer.
    StayWhereYouAre,
}

/// Decides the next step of a search from the midpoint line and the line after it.
pub trait LineComparator {
    /// Compares escaped lines (without their newlines). `next` is `None` at the end of the range.
    fn compare(&self, line: &[u8], next: Option<&[u8]>) -> Result<NextStep>;
}

/// Byte extent of one record line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinePosition {
    /// Offset of the first byte of the line.
    pub start: u64,
    /// Offset just past the line's newline.
    pub end: u64,
}

/// Finds the last record strictly before a target timestamp within one year's file.
#[derive(Debug, Clone, Copy)]
pub struct SecondsIntoYearComparator {
    year: i16,
    target: (u32, u32),
}

impl SecondsIntoYearComparator {
    /// Creates a comparator for records of `year` against `target` seconds-into-year and nanos.
    pub fn new(year: i16, target_seconds: u32, target_nanos: u32) -> Self {
        Self {
            year,
            target: (target_seconds, target_nanos),
        }
    }

    fn key(&self, line: &[u8]) -> Result<(u32, u32)> {
        let sample: Sample = codec::decode_line(self.year, line)?;
        if sample.seconds_into_year > i32::MAX as u32 {
            error!(
                "Record decodes to impossible seconds-into-year {}",
                sample.seconds_into_year
            );
            return Err(StoreError::ImpossibleTimestamp {
                seconds: sample.seconds_into_year,
            });
        }
        Ok((sample.seconds_into_year, sample.nanos))
    }
}

impl LineComparator for SecondsIntoYearComparator {
    fn compare(&self, line: &[u8], next: Option<&[u8]>) -> Result<NextStep> {
        if self.key(line)? >= self.target {
            return Ok(NextStep::GoLeft);
        }
        let next_key = match next {
            Some(next) => self.key(next)?,
            None => (u32::MAX, u32::MAX),
        };
        if self.target <= next_key {
            Ok(NextStep::StayWhereYouAre)
        } else {
            Ok(NextStep::GoRight)
        }
    }
}

/// Bisects `[min, max]` in `stream`, returning the line the comparator settles on.
///
/// Each midpoint is snapped forward with [`LineByteStream::seek_to_first_new_line`], so `min` should be
/// the offset of a newline (or 0) and `max` the offset of the last newline in the range. Returns
/// `Ok(None)` when the search is inconclusive.
///
/// # Errors
///
/// Propagates comparator errors (corrupt lines, impossible timestamps) and I/O errors.
pub fn binary_search<C: LineComparator>(
    stream: &mut LineByteStream,
    min: u64,
    max: u64,
    comparator: &C,
) -> Result<Option<LinePosition>> {
    let mut min = min;
    let mut max = max;

    for _ in 0..MAX_SEARCH_ITERATIONS {
        if min > max {
            break;
        }
        let mid = min + (max - min) / 2;
        stream.seek_to(mid);

        let step = if !stream.seek_to_first_new_line()? {
            NextStep::GoLeft
        } else {
            let start = stream.position();
            match stream.read_line()?.map(<[u8]>::to_vec) {
                None => NextStep::GoLeft,
                Some(line) => {
                    let end = stream.position();
                    let next = stream.read_line()?;
                    match comparator.compare(&line, next)? {
                        NextStep::StayWhereYouAre => {
                            return Ok(Some(LinePosition { start, end }));
                        }
                        step => step,
                    }
                }
            }
        };

        match step {
            NextStep::GoLeft => {
                if mid == 0 {
                    break;
                }
                max = mid - 1;
            }
            _ => min = mid + 1,
        }
    }

    debug!(
        "Search of {} between {} and {} was inconclusive",
        stream.path().display(),
        min,
        max
    );
    Ok(None)
}

/// Locates the last record of `info`'s file strictly before `target`.
///
/// Returns `Ok(None)` when the target is in a different year than the file or the search cannot
/// bracket it.
pub fn locate(info: &FileInfo, target: YearSecondTimestamp) -> Result<Option<LinePosition>> {
    if target.year != info.year() || info.valid_data_end() <= info.first_event_position() {
        return Ok(None);
    }
    let mut stream = LineByteStream::open_range(info.path(), 0, info.valid_data_end())?;
    let comparator = SecondsIntoYearComparator::new(info.year(), target.seconds_into_year, target.nanos);
    binary_search(
        &mut stream,
        info.first_event_position() - 1,
        info.valid_data_end() - 1,
        &comparator,
    )
}
