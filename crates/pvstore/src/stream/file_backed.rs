//! Event stream over one partition file.
//!
//! A query `[start, end)` returns the records inside the window plus the latest record strictly
//! before `start`. Where the window falls relative to the file's first and last records decides how
//! much searching is needed:
//!
//! ```text
//!                       first ─────────── last
//!  1 BeforeFile   [──)                              empty
//!  2 EndsInside   [──────────────)                  search end
//!  3 SpansFile    [──────────────────────────────)  whole data section
//!  4 Inside               [─────────)               search start and end
//!  5 StartsInside         [──────────────────────)  search start
//!  6 AfterFile                             [──)     last record only
//! ```
//!
//! A search that cannot settle falls back to [`TimeBasedIter`] over the same bounds.

use super::{EventIter, PositionalIter, TimeBasedIter};
use crate::codec::ValueKind;
use crate::error::{Result, StoreError};
use crate::info::FileInfo;
use crate::search::{self, LinePosition};
use crate::time::YearSecondTimestamp;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Where a query window falls relative to a file's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekCase {
    /// The window ends at or before the first record.
    BeforeFile,
    /// The window starts at or before the first record and ends inside the file.
    EndsInside,
    /// The window covers every record.
    SpansFile,
    /// The window starts and ends inside the file.
    Inside,
    /// The window starts inside the file and ends after its last record.
    StartsInside,
    /// The window starts after the last record.
    AfterFile,
}

impl SeekCase {
    /// Classifies `[start, end)` against records spanning `first..=last`.
    pub fn classify(
        first: YearSecondTimestamp,
        last: YearSecondTimestamp,
        start: YearSecondTimestamp,
        end: YearSecondTimestamp,
    ) -> Self {
        if start <= first {
            if end <= first {
                Self::BeforeFile
            } else if end <= last {
                Self::EndsInside
            } else {
                Self::SpansFile
            }
        } else if start > last {
            Self::AfterFile
        } else if end <= last {
            Self::Inside
        } else {
            Self::StartsInside
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Unopened,
    Streaming,
    Closed,
}

/// A single-use event stream over one partition file.
///
/// # Examples
/// ```rust,ignore
/// use alopex_pvstore::stream::FileBackedEventStream;
///
/// let mut stream = FileBackedEventStream::with_range("PV:NAME", path, start, end);
/// for sample in stream.open()? {
///     println!("{}", sample?.timestamp());
/// }
/// ```
#[derive(Debug)]
pub struct FileBackedEventStream {
    pv_name: String,
    path: PathBuf,
    start: YearSecondTimestamp,
    end: YearSecondTimestamp,
    expected_kind: Option<ValueKind>,
    use_search: bool,
    force_time_based: bool,
    state: StreamState,
}

impl FileBackedEventStream {
    /// Streams every record in the file.
    pub fn whole_file(pv_name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::with_range(
            pv_name,
            path,
            YearSecondTimestamp::MIN,
            YearSecondTimestamp::MAX,
        )
    }

    /// Streams the records of the file in `[start, end)` plus the latest one before `start`.
    pub fn with_range(
        pv_name: impl Into<String>,
        path: impl AsRef<Path>,
        start: YearSecondTimestamp,
        end: YearSecondTimestamp,
    ) -> Self {
        Self {
            pv_name: pv_name.into(),
            path: path.as_ref().to_path_buf(),
            start,
            end,
            expected_kind: None,
            use_search: true,
            force_time_based: false,
            state: StreamState::Unopened,
        }
    }

    /// Enables or disables the binary search. Without it, windows that need a search are scanned.
    pub fn with_search(mut self, use_search: bool) -> Self {
        self.use_search = use_search;
        self
    }

    /// Fails [`FileBackedEventStream::open`] with [`StoreError::TypeMismatch`] unless the file header
    /// declares `kind`.
    pub fn with_expected_kind(mut self, kind: ValueKind) -> Self {
        self.expected_kind = Some(kind);
        self
    }

    /// Always scans sequentially, even where offsets are known.
    pub fn with_force_time_based(mut self, force: bool) -> Self {
        self.force_time_based = force;
        self
    }

    /// PV this stream was opened for.
    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the stream. Can be called once.
    ///
    /// A file whose header or data cannot be read yields an empty iterator.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IteratorAlreadyOpened`] on a second call, [`StoreError::TypeMismatch`]
    /// when an expected kind was set and the header declares another, and I/O errors.
    pub fn open(&mut self) -> Result<EventIter> {
        if self.state != StreamState::Unopened {
            return Err(StoreError::IteratorAlreadyOpened);
        }
        self.state = StreamState::Streaming;

        let info = match FileInfo::read(&self.path) {
            Ok(info) => info,
            Err(err) if err.is_corruption() => {
                warn!(
                    "No usable data in {} for {}: {}",
                    self.path.display(),
                    self.pv_name,
                    err
                );
                return Ok(EventIter::Empty);
            }
            Err(err) => return Err(err),
        };
        match self.expected_kind {
            Some(kind) => info.check_payload(&self.pv_name, kind)?,
            None => {
                info.check_pv_name(&self.pv_name);
            }
        }
        self.iter_for(&info)
    }

    /// Marks the stream closed. Further [`FileBackedEventStream::open`] calls fail.
    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }

    /// True once [`FileBackedEventStream::open`] has been called.
    pub fn is_opened(&self) -> bool {
        self.state != StreamState::Unopened
    }

    fn iter_for(&self, info: &FileInfo) -> Result<EventIter> {
        let (Some(first), Some(last)) = (info.first_event(), info.last_event()) else {
            debug!("{} has no records", self.path.display());
            return Ok(EventIter::Empty);
        };
        if self.end < self.start {
            return Ok(EventIter::Empty);
        }

        let case = SeekCase::classify(first.year_second(), last.year_second(), self.start, self.end);
        debug!("Query on {} is {:?}", self.path.display(), case);
        if case == SeekCase::BeforeFile {
            return Ok(EventIter::Empty);
        }
        if self.force_time_based {
            return self.time_based(info);
        }

        let data_start = info.first_event_position() - 1;
        let data_end = info.valid_data_end();
        let range = match case {
            SeekCase::SpansFile => Some((data_start, data_end)),
            SeekCase::AfterFile => Some((info.last_event_position() - 1, data_end)),
            _ if !self.use_search => None,
            SeekCase::EndsInside => self
                .search(info, self.end)?
                .map(|end| (data_start, end.end)),
            SeekCase::Inside => match self.search(info, self.start)? {
                Some(start) => self
                    .search(info, self.end)?
                    .map(|end| (start.start - 1, end.end)),
                None => None,
            },
            SeekCase::StartsInside => self
                .search(info, self.start)?
                .map(|start| (start.start - 1, data_end)),
            SeekCase::BeforeFile => None,
        };

        match range {
            Some((start, end)) => Ok(EventIter::Positional(PositionalIter::new(
                &self.path,
                info.year(),
                start,
                end,
            )?)),
            None => self.time_based(info),
        }
    }

    /// Runs the locator. Corruption met while searching counts as an inconclusive search.
    fn search(&self, info: &FileInfo, target: YearSecondTimestamp) -> Result<Option<LinePosition>> {
        match search::locate(info, target) {
            Ok(found) => Ok(found),
            Err(err) if err.is_corruption() => {
                error!(
                    "Search for {} in {} failed, scanning instead: {}",
                    target,
                    self.path.display(),
                    err
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn time_based(&self, info: &FileInfo) -> Result<EventIter> {
        Ok(EventIter::TimeBased(TimeBasedIter::new(
            &self.path,
            info.year(),
            info.first_event_position(),
            info.valid_data_end(),
            self.start,
            self.end,
        )?))
    }
}
