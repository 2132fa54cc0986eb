//! Append state machine.
//!
//! One [`AppendState`] per PV remembers the last accepted timestamp and the partition currently
//! open for writing. Each incoming sample goes through four steps:
//!
//! ```text
//!   gate ──► boundary check ──► prepare (if no file open) ──► write
//!    │            │                   │
//!    │            │                   ├─ missing: copy sibling or create with header
//!    │            │                   ├─ empty: write header
//!    │            │                   └─ existing: validate, truncate corrupt tail
//!    │            └─ past the partition end: close, pick the next path
//!    └─ not after the last accepted sample: drop
//! ```
//!
//! The output file is closed on every exit from [`AppendState::append`], including errors.

use crate::codec::{self, PayloadInfo, Sample};
use crate::error::{Result, StoreError};
use crate::info::FileInfo;
use crate::lifecycle::partition::PartitionLayout;
use crate::stream::FileBackedEventStream;
use crate::time::YearSecondTimestamp;
use dashmap::DashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// Chunk size for raw partition copies.
pub const BULK_COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// How [`AppendState::bulk_append`] brought a partition in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAppend {
    /// The data section was copied byte for byte.
    Copied {
        /// Bytes copied.
        bytes: u64,
    },
    /// The block could not be trusted as a whole and went through the per-record gate.
    PerRecord {
        /// Records written.
        events: usize,
    },
    /// The source had no records.
    Empty,
}

/// Per-PV append state.
pub struct AppendState {
    pv_name: String,
    layout: PartitionLayout,
    writer: Option<BufWriter<File>>,
    current_path: Option<PathBuf>,
    current_extension: Option<String>,
    next_boundary: Option<i64>,
    last_known: YearSecondTimestamp,
    previous_year: i16,
}

impl AppendState {
    /// Creates a state for `pv_name`, seeded from the PV's last sample on disk, if any.
    pub fn new(pv_name: impl Into<String>, layout: PartitionLayout, last_known: Option<&Sample>) -> Self {
        let last_known = last_known
            .map(Sample::year_second)
            .unwrap_or_else(|| YearSecondTimestamp::new(1970, 0, 0));
        Self {
            pv_name: pv_name.into(),
            layout,
            writer: None,
            current_path: None,
            current_extension: None,
            next_boundary: None,
            last_known,
            previous_year: last_known.year,
        }
    }

    /// PV this state writes for.
    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    /// Timestamp of the last accepted sample.
    pub fn last_known_timestamp(&self) -> YearSecondTimestamp {
        self.last_known
    }

    /// Partition file most recently written.
    pub fn current_path(&self) -> Option<&Path> {
        self.current_path.as_deref()
    }

    /// Appends `events` to the PV's partition files with `extension`.
    ///
    /// Samples that are not strictly after the last accepted one are dropped. When a target file does
    /// not exist yet and `copy_from` names another extension whose sibling file exists, the sibling is
    /// copied first.
    ///
    /// # Errors
    ///
    /// Any I/O error aborts the call; the caller should retry the whole batch. Returns
    /// [`StoreError::PvNameMismatch`] or [`StoreError::TypeMismatch`] if an existing file belongs to
    /// another PV or holds another value kind.
    pub fn append(
        &mut self,
        events: impl IntoIterator<Item = Sample>,
        extension: &str,
        copy_from: Option<&str>,
    ) -> Result<usize> {
        self.append_results(events.into_iter().map(Ok), extension, copy_from)
    }

    /// Like [`AppendState::append`], for a stream that may fail part way.
    pub fn append_results(
        &mut self,
        events: impl IntoIterator<Item = Result<Sample>>,
        extension: &str,
        copy_from: Option<&str>,
    ) -> Result<usize> {
        let result = self.append_inner(events, extension, copy_from);
        self.finish(result)
    }

    /// Brings in a whole partition file from another store.
    ///
    /// If the source block's first sample passes the gate and its last sample falls in the same
    /// destination partition, the data section is copied byte for byte. The internal order of the
    /// block is trusted. Otherwise the block is appended record by record.
    pub fn bulk_append(
        &mut self,
        source: &FileInfo,
        extension: &str,
        copy_from: Option<&str>,
    ) -> Result<BulkAppend> {
        let (Some(first), Some(last)) = (source.first_event(), source.last_event()) else {
            return Ok(BulkAppend::Empty);
        };

        let first_epoch = first.epoch_seconds();
        let same_partition = self.layout.path_for(&self.pv_name, first_epoch, extension)
            == self.layout.path_for(&self.pv_name, last.epoch_seconds(), extension);
        if self.rejects(first) || last.year_second() < first.year_second() || !same_partition {
            debug!(
                "Appending {} for {} record by record",
                source.path().display(),
                self.pv_name
            );
            return self.append_per_record(source, extension, copy_from);
        }

        let result = self.bulk_copy(source, first, extension, copy_from);
        let copied = self.finish(result)?;
        match copied {
            Some(bytes) => {
                self.refresh_from_disk()?;
                Ok(BulkAppend::Copied { bytes })
            }
            None => self.append_per_record(source, extension, copy_from),
        }
    }

    fn append_per_record(
        &mut self,
        source: &FileInfo,
        extension: &str,
        copy_from: Option<&str>,
    ) -> Result<BulkAppend> {
        let mut stream = FileBackedEventStream::whole_file(source.pv_name(), source.path())
            .with_expected_kind(source.kind());
        let events = self.append_results(stream.open()?, extension, copy_from)?;
        Ok(BulkAppend::PerRecord { events })
    }

    /// Copies the source data section. Returns `None` if the destination already holds later data.
    fn bulk_copy(
        &mut self,
        source: &FileInfo,
        first: &Sample,
        extension: &str,
        copy_from: Option<&str>,
    ) -> Result<Option<u64>> {
        self.roll_to(first.epoch_seconds(), extension)?;
        self.prepare(first, extension, copy_from)?;
        if self.rejects(first) {
            return Ok(None);
        }

        let Some(writer) = self.writer.as_mut() else {
            return Ok(None);
        };
        let mut input = File::open(source.path())?;
        input.seek(SeekFrom::Start(source.first_event_position()))?;
        let mut remaining = source.valid_data_end() - source.first_event_position();
        let mut buf = vec![0u8; BULK_COPY_CHUNK_SIZE];
        let mut copied = 0u64;
        while remaining > 0 {
            let want = remaining.min(BULK_COPY_CHUNK_SIZE as u64) as usize;
            input.read_exact(&mut buf[..want])?;
            writer.write_all(&buf[..want])?;
            remaining -= want as u64;
            copied += want as u64;
        }
        debug!(
            "Copied {} bytes from {} for {}",
            copied,
            source.path().display(),
            self.pv_name
        );
        Ok(Some(copied))
    }

    fn append_inner(
        &mut self,
        events: impl IntoIterator<Item = Result<Sample>>,
        extension: &str,
        copy_from: Option<&str>,
    ) -> Result<usize> {
        let mut written = 0;
        for sample in events {
            let sample = sample?;
            if self.rejects(&sample) {
                debug!(
                    "Skipping event for {} at {}: not after last known {}",
                    self.pv_name,
                    sample.year_second(),
                    self.last_known
                );
                continue;
            }

            let epoch_seconds = sample.epoch_seconds();
            let past_boundary = self.next_boundary.map_or(true, |next| epoch_seconds >= next);
            if past_boundary || self.current_extension.as_deref() != Some(extension) {
                self.roll_to(epoch_seconds, extension)?;
            }

            if self.writer.is_none() {
                self.prepare(&sample, extension, copy_from)?;
                if self.rejects(&sample) {
                    debug!(
                        "Skipping event for {} at {}: file already holds data up to {}",
                        self.pv_name,
                        sample.year_second(),
                        self.last_known
                    );
                    continue;
                }
            }

            if let Some(writer) = self.writer.as_mut() {
                writer.write_all(&codec::encode_line(&sample)?)?;
                self.observe(&sample);
                written += 1;
            }
        }
        Ok(written)
    }

    /// Closes the open file and targets the partition holding `epoch_seconds`.
    fn roll_to(&mut self, epoch_seconds: i64, extension: &str) -> Result<()> {
        self.close_stream()?;
        let granularity = self.layout.granularity();
        self.current_path = Some(self.layout.path_for(&self.pv_name, epoch_seconds, extension));
        self.current_extension = Some(extension.to_string());
        self.next_boundary = Some(granularity.next_partition_first_second(epoch_seconds));
        Ok(())
    }

    /// Opens the current partition file for appending, creating or repairing it as needed.
    fn prepare(&mut self, sample: &Sample, extension: &str, copy_from: Option<&str>) -> Result<()> {
        let Some(path) = self.current_path.clone() else {
            return Err(StoreError::InvalidConfig(format!(
                "no partition selected for {}",
                self.pv_name
            )));
        };

        if !path.exists() {
            if let Some(copy_extension) = copy_from.filter(|ext| *ext != extension) {
                let sibling = self
                    .layout
                    .path_for(&self.pv_name, sample.epoch_seconds(), copy_extension);
                if sibling.exists() {
                    debug!(
                        "Seeding {} from {}",
                        path.display(),
                        sibling.display()
                    );
                    fs::copy(&sibling, &path)?;
                }
            }
        }

        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create_new(true).write(true).open(&path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&self.header_for(sample).encode_line()?)?;
            self.writer = Some(writer);
            return Ok(());
        }

        if fs::metadata(&path)?.len() == 0 {
            let file = OpenOptions::new().append(true).open(&path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&self.header_for(sample).encode_line()?)?;
            self.writer = Some(writer);
            return Ok(());
        }

        match FileInfo::read(&path) {
            Ok(info) => {
                if info.pv_name() != self.pv_name {
                    return Err(StoreError::PvNameMismatch {
                        expected: self.pv_name.clone(),
                        found: info.pv_name().to_string(),
                    });
                }
                info.check_payload(&self.pv_name, sample.kind())?;
                if info.has_corrupt_tail() {
                    warn!(
                        "Truncating {} from {} to {} bytes",
                        path.display(),
                        info.file_size(),
                        info.valid_data_end()
                    );
                    OpenOptions::new()
                        .write(true)
                        .open(&path)?
                        .set_len(info.valid_data_end())?;
                }
                if let Some(last) = info.last_event() {
                    self.observe(last);
                }
                let file = OpenOptions::new().append(true).open(&path)?;
                self.writer = Some(BufWriter::new(file));
            }
            Err(err) if err.is_corruption() => {
                warn!("Recreating {}: {}", path.display(), err);
                let file = OpenOptions::new()
                    .write(true)
                    .truncate(true)
                    .open(&path)?;
                let mut writer = BufWriter::new(file);
                writer.write_all(&self.header_for(sample).encode_line()?)?;
                self.writer = Some(writer);
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn header_for(&self, sample: &Sample) -> PayloadInfo {
        let header = PayloadInfo::new(self.pv_name.clone(), sample.kind(), sample.year);
        if sample.kind().is_waveform() {
            header.with_element_count(sample.value.element_count() as u32)
        } else {
            header
        }
    }

    /// Re-reads the end of the current file after a raw copy.
    fn refresh_from_disk(&mut self) -> Result<()> {
        let Some(path) = self.current_path.clone() else {
            return Ok(());
        };
        let info = FileInfo::read(&path)?;
        if info.has_corrupt_tail() {
            warn!(
                "Copied data in {} ends with {} unusable bytes",
                path.display(),
                info.file_size() - info.valid_data_end()
            );
        }
        if let Some(last) = info.last_event() {
            self.observe(last);
        }
        Ok(())
    }

    fn rejects(&self, sample: &Sample) -> bool {
        sample.year_second() <= self.last_known || sample.year < self.previous_year
    }

    fn observe(&mut self, sample: &Sample) {
        let ts = sample.year_second();
        if ts > self.last_known {
            self.last_known = ts;
        }
        self.previous_year = self.previous_year.max(sample.year);
    }

    fn close_stream(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Closes the output on every exit path, keeping the first error.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        let closed = self.close_stream();
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close_err)) => {
                error!(
                    "Failed to close partition file for {}: {:?}",
                    self.pv_name, close_err
                );
                Err(err)
            }
        }
    }
}

/// Per-PV [`AppendState`]s, created on first use.
///
/// Entries live as long as the registry; there is one per PV ever appended to.
#[derive(Default)]
pub struct AppendRegistry {
    states: DashMap<String, Arc<Mutex<AppendState>>>,
}

impl AppendRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state for `pv_name`, creating it with `create` on first use.
    pub fn get_or_create(
        &self,
        pv_name: &str,
        create: impl FnOnce() -> Result<AppendState>,
    ) -> Result<Arc<Mutex<AppendState>>> {
        if let Some(state) = self.states.get(pv_name) {
            return Ok(Arc::clone(state.value()));
        }
        let state = create()?;
        Ok(Arc::clone(
            self.states
                .entry(pv_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(state)))
                .value(),
        ))
    }

    /// Number of PVs with state.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True when no PV has state.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
