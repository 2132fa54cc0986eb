//! Plain file store.
//!
//! [`PlainStore`] ties the pieces together for one storage tier: appends go through the per-PV
//! [`AppendRegistry`], reads chain [`FileBackedEventStream`]s over the partitions a query touches,
//! and ETL lists, stages, commits and deletes whole partitions.
//!
//! ```text
//!   append_data ──► AppendRegistry ──► AppendState ──► <root>/<key><partition>.pvs
//!   get_data    ──► PartitionLayout ──► FileBackedEventStream* ──► MultiFileEventStream
//!   ETL         ──► etl_streams ──► append_to_etl_append_data ──► .pvsappend
//!                                    commit_etl_append_data    ──► .pvs
//!                                    mark_for_deletion (source store)
//! ```

use crate::append::{AppendRegistry, AppendState, BulkAppend};
use crate::codec::Sample;
use crate::config::{validate_hold_gather, StoreConfig};
use crate::error::{Result, StoreError};
use crate::info::FileInfo;
use crate::lifecycle::etl::{self, EtlInfo, HoldGatherPolicy};
use crate::lifecycle::partition::PartitionLayout;
use crate::stream::{FileBackedEventStream, MultiFileEventStream};
use crate::time::YearSecondTimestamp;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A storage tier of plain partition files under one root folder.
///
/// # Examples
/// ```rust,ignore
/// use alopex_pvstore::config::StoreConfig;
/// use alopex_pvstore::store::PlainStore;
///
/// let store = PlainStore::new(StoreConfig::new("STS", "/arch/sts"))?;
/// store.append_data("ABC:DEF", samples)?;
/// for sample in store.get_data("ABC:DEF", start, end)? {
///     println!("{}", sample?.timestamp());
/// }
/// ```
pub struct PlainStore {
    config: StoreConfig,
    layout: PartitionLayout,
    appenders: AppendRegistry,
}

impl PlainStore {
    /// Creates a store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if the configuration does not validate.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let layout = PartitionLayout::new(
            &config.root_folder,
            config.granularity,
            config.key_mapping.clone(),
        );
        info!(
            "Opened store {} at {} with {:?} partitions",
            config.name,
            config.root_folder.display(),
            config.granularity
        );
        Ok(Self {
            config,
            layout,
            appenders: AppendRegistry::new(),
        })
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Partition layout.
    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Sets the hold count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if `hold` would fall below the gather count.
    pub fn set_hold(&mut self, hold: u32) -> Result<()> {
        validate_hold_gather(hold, self.config.gather)?;
        self.config.hold = hold;
        Ok(())
    }

    /// Sets the gather count.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if `gather` would exceed the hold count.
    pub fn set_gather(&mut self, gather: u32) -> Result<()> {
        validate_hold_gather(self.config.hold, gather)?;
        self.config.gather = gather;
        Ok(())
    }

    /// Appends samples for `pv_name`, returning how many were written.
    ///
    /// Samples not strictly after the PV's last stored sample are dropped.
    pub fn append_data(
        &self,
        pv_name: &str,
        events: impl IntoIterator<Item = Sample>,
    ) -> Result<usize> {
        let state = self.append_state(pv_name)?;
        let mut state = state.lock().unwrap_or_else(|err| err.into_inner());
        state.append(events, &self.config.extension, None)
    }

    /// Streams the samples of `pv_name` in `[start, end)` plus the latest one before `start`.
    ///
    /// Only the first and last partition are filtered by time; partitions in between are read whole.
    pub fn get_data(
        &self,
        pv_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<MultiFileEventStream> {
        let start_ys = YearSecondTimestamp::from(start);
        let end_ys = YearSecondTimestamp::from(end);
        if end_ys < start_ys {
            return Ok(MultiFileEventStream::empty());
        }

        let files = self.layout.paths_with_data(
            pv_name,
            start.timestamp(),
            end.timestamp(),
            &self.config.extension,
        )?;
        debug!(
            "{}: {} files for {} in [{}, {})",
            self.config.name,
            files.len(),
            pv_name,
            start_ys,
            end_ys
        );

        let needs_anchor = match files.first() {
            Some(first) => !self.has_event_before(&first.path, start_ys)?,
            None => true,
        };
        let anchor = if needs_anchor {
            self.last_event_before(pv_name, start.timestamp())?
        } else {
            None
        };

        let last_index = files.len().saturating_sub(1);
        let streams: Vec<FileBackedEventStream> = files
            .into_iter()
            .enumerate()
            .map(|(index, file)| {
                let stream = if index == 0 || index == last_index {
                    FileBackedEventStream::with_range(pv_name, &file.path, start_ys, end_ys)
                } else {
                    FileBackedEventStream::whole_file(pv_name, &file.path)
                };
                stream.with_search(self.config.use_search_for_positions)
            })
            .collect();

        let stream = MultiFileEventStream::new(streams);
        Ok(match anchor {
            Some(sample) => stream.with_leading_sample(sample),
            None => stream,
        })
    }

    /// The latest sample of `pv_name` at or before `at`.
    pub fn data_at_time(&self, pv_name: &str, at: DateTime<Utc>) -> Result<Option<Sample>> {
        let mut latest = None;
        for sample in self.get_data(pv_name, at, at + Duration::nanoseconds(1))? {
            match sample {
                Ok(sample) => latest = Some(sample),
                Err(err) if err.is_corruption() => {
                    warn!("Stopping read for {} at {}: {}", pv_name, at, err);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(latest)
    }

    /// The newest sample stored for `pv_name`.
    pub fn last_known_event(&self, pv_name: &str) -> Result<Option<Sample>> {
        for file in self
            .layout
            .all_paths(pv_name, &self.config.extension)?
            .into_iter()
            .rev()
        {
            if let Some(last) = read_info(&file.path)?.and_then(|info| info.last_event().cloned()) {
                return Ok(Some(last));
            }
        }
        Ok(None)
    }

    /// The oldest sample stored for `pv_name`.
    pub fn first_known_event(&self, pv_name: &str) -> Result<Option<Sample>> {
        for file in self.layout.all_paths(pv_name, &self.config.extension)? {
            if let Some(first) = read_info(&file.path)?.and_then(|info| info.first_event().cloned())
            {
                return Ok(Some(first));
            }
        }
        Ok(None)
    }

    /// Closed partitions of `pv_name` that ETL may move at `now`.
    pub fn etl_streams(&self, pv_name: &str, now: DateTime<Utc>) -> Result<Vec<EtlInfo>> {
        let policy = HoldGatherPolicy::new(self.config.hold, self.config.gather)?;
        etl::select_etl_partitions(
            &self.layout,
            pv_name,
            &self.config.extension,
            &policy,
            now.timestamp(),
        )
    }

    /// Deletes a partition listed by [`PlainStore::etl_streams`] if it is unchanged.
    pub fn mark_for_deletion(&self, info: &EtlInfo) -> Result<bool> {
        etl::mark_for_deletion(info)
    }

    /// Stages a partition from another store into this store's append files.
    ///
    /// Staging files start as copies of the matching main files, so committing them replaces the
    /// main files with a superset of their data.
    pub fn append_to_etl_append_data(&self, pv_name: &str, source: &EtlInfo) -> Result<BulkAppend> {
        let source_info = FileInfo::read(&source.path)?;
        if source_info.pv_name() != pv_name {
            return Err(StoreError::PvNameMismatch {
                expected: pv_name.to_string(),
                found: source_info.pv_name().to_string(),
            });
        }
        let state = self.append_state(pv_name)?;
        let mut state = state.lock().unwrap_or_else(|err| err.into_inner());
        let appended = state.bulk_append(
            &source_info,
            &self.config.append_extension(),
            Some(&self.config.extension),
        )?;
        debug!(
            "{}: staged {} for {} as {:?}",
            self.config.name,
            source.path.display(),
            pv_name,
            appended
        );
        Ok(appended)
    }

    /// Moves every staged append file of `pv_name` onto its main file. Returns the files moved.
    pub fn commit_etl_append_data(&self, pv_name: &str) -> Result<usize> {
        let append_extension = self.config.append_extension();
        let staged = self.layout.all_paths(pv_name, &append_extension)?;
        for file in &staged {
            let dest = main_path_for(&file.path, &append_extension, &self.config.extension)?;
            fs::rename(&file.path, &dest)?;
            debug!("Committed {} to {}", file.path.display(), dest.display());
        }
        Ok(staged.len())
    }

    /// Bytes on disk for `pv_name`, main and staged files together.
    pub fn space_consumed_by_pv(&self, pv_name: &str) -> Result<u64> {
        let mut total = 0;
        for extension in [self.config.extension.clone(), self.config.append_extension()] {
            for file in self.layout.all_paths(pv_name, &extension)? {
                match fs::metadata(&file.path) {
                    Ok(metadata) => total += metadata.len(),
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(total)
    }

    /// Copies every sample of `old_name` into `new_name`, returning how many were written.
    ///
    /// Headers carry the PV name, so partitions are rewritten record by record rather than copied.
    /// The files of `old_name` are left in place.
    pub fn rename_pv(&self, old_name: &str, new_name: &str) -> Result<usize> {
        if old_name == new_name {
            return Ok(0);
        }
        let state = self.append_state(new_name)?;
        let mut copied = 0;
        for file in self.layout.all_paths(old_name, &self.config.extension)? {
            let Some(info) = read_info(&file.path)? else {
                continue;
            };
            if info.first_event().is_none() {
                continue;
            }
            let mut stream = FileBackedEventStream::whole_file(old_name, &file.path)
                .with_expected_kind(info.kind());
            let mut state = state.lock().unwrap_or_else(|err| err.into_inner());
            let written = state.append_results(stream.open()?, &self.config.extension, None)?;
            debug!(
                "Copied {} samples from {} to {}",
                written,
                file.path.display(),
                new_name
            );
            copied += written;
        }
        info!(
            "{}: copied {} samples of {} to {}",
            self.config.name, copied, old_name, new_name
        );
        Ok(copied)
    }

    fn append_state(&self, pv_name: &str) -> Result<Arc<Mutex<AppendState>>> {
        self.appenders.get_or_create(pv_name, || {
            let last_known = self.last_known_event(pv_name)?;
            debug!(
                "Creating append state for {} seeded at {:?}",
                pv_name,
                last_known.as_ref().map(Sample::year_second)
            );
            Ok(AppendState::new(
                pv_name,
                self.layout.clone(),
                last_known.as_ref(),
            ))
        })
    }

    fn has_event_before(&self, path: &Path, start: YearSecondTimestamp) -> Result<bool> {
        Ok(read_info(path)?
            .and_then(|info| info.first_event().map(Sample::year_second))
            .is_some_and(|first| first < start))
    }

    /// Last sample of the newest partition that ends before `before` and holds data.
    fn last_event_before(&self, pv_name: &str, before: i64) -> Result<Option<Sample>> {
        for file in self
            .layout
            .paths_ending_before(pv_name, before, &self.config.extension)?
        {
            if let Some(last) = read_info(&file.path)?.and_then(|info| info.last_event().cloned()) {
                return Ok(Some(last));
            }
        }
        Ok(None)
    }
}

/// Reads a partition's info, treating missing, empty and unreadable files as holding nothing.
fn read_info(path: &Path) -> Result<Option<FileInfo>> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.len() == 0 => {
            debug!("Ignoring zero byte file {}", path.display());
            return Ok(None);
        }
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    match FileInfo::read(path) {
        Ok(info) => Ok(Some(info)),
        Err(err) if err.is_corruption() => {
            warn!("Cannot read header of {}: {}", path.display(), err);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn main_path_for(staged: &Path, append_extension: &str, extension: &str) -> Result<PathBuf> {
    let stem = staged
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| name.strip_suffix(append_extension))
        .ok_or_else(|| StoreError::InvalidFileName(staged.display().to_string()))?;
    Ok(staged.with_file_name(format!("{}{}", stem, extension)))
}
