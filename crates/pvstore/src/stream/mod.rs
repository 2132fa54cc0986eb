//! Read-side event streams.
//!
//! - [`PositionalIter`]: records between two byte offsets
//! - [`TimeBasedIter`]: sequential scan filtered by time
//! - [`FileBackedEventStream`]: picks one of the two for a query on one file
//! - [`MultiFileEventStream`]: chains per-file streams in chronological order

pub mod file_backed;
pub mod multi;
pub mod positional;
pub mod time_based;

pub use file_backed::{FileBackedEventStream, SeekCase};
pub use multi::MultiFileEventStream;
pub use positional::PositionalIter;
pub use time_based::TimeBasedIter;

use crate::codec::Sample;
use crate::error::Result;

/// The iterator handed out by [`FileBackedEventStream::open`].
pub enum EventIter {
    /// Offsets were known.
    Positional(PositionalIter),
    /// Offsets were unknown; the file is scanned.
    TimeBased(TimeBasedIter),
    /// Nothing to read.
    Empty,
}

impl EventIter {
    /// True when the iterator reads by byte offsets.
    pub fn is_positional(&self) -> bool {
        matches!(self, Self::Positional(_))
    }
}

impl Iterator for EventIter {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Positional(iter) => iter.next(),
            Self::TimeBased(iter) => iter.next(),
            Self::Empty => None,
        }
    }
}
