//! Time-based partition layout for on-disk organization.
//!
//! Each PV owns one file per partition. The PV name is mapped to a directory and a file prefix, and
//! the partition name is appended to the prefix:
//!
//! ```text
//! PV "ABC:DEF", Day granularity, 2024-03-14
//!   key   ABC/DEF:
//!   path  <root>/ABC/DEF:2024_03_14.pvs
//! ```
//!
//! Partition names sort lexicographically in chronological order, so a sorted directory listing is a
//! timeline.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const SECONDS_PER_DAY: i64 = 86_400;

/// Supported partition sizes.
///
/// # Examples
/// ```rust,ignore
/// use alopex_pvstore::lifecycle::partition::Granularity;
///
/// let name = Granularity::Day.partition_name(1_710_428_400);
/// assert_eq!(name, "2024_03_14");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Granularity {
    /// Five-minute partitions.
    Min5,
    /// Fifteen-minute partitions.
    Min15,
    /// Thirty-minute partitions.
    Min30,
    /// One-hour partitions.
    Hour,
    /// One-day partitions.
    Day,
    /// Calendar-month partitions.
    Month,
    /// Calendar-year partitions.
    Year,
}

impl Granularity {
    /// Every granularity, finest first.
    pub const ALL: [Granularity; 7] = [
        Self::Min5,
        Self::Min15,
        Self::Min30,
        Self::Hour,
        Self::Day,
        Self::Month,
        Self::Year,
    ];

    /// Nominal partition length in seconds. Months count as 30 days and years as 365.
    pub fn approx_seconds(self) -> i64 {
        match self {
            Self::Min5 => 300,
            Self::Min15 => 900,
            Self::Min30 => 1_800,
            Self::Hour => 3_600,
            Self::Day => SECONDS_PER_DAY,
            Self::Month => 30 * SECONDS_PER_DAY,
            Self::Year => 365 * SECONDS_PER_DAY,
        }
    }

    fn minute_chunk(self) -> Option<u32> {
        match self {
            Self::Min5 => Some(5),
            Self::Min15 => Some(15),
            Self::Min30 => Some(30),
            _ => None,
        }
    }

    /// True for partitions of a fixed length in seconds.
    fn is_fixed_length(self) -> bool {
        !matches!(self, Self::Month | Self::Year)
    }

    /// Number of `_`-separated fields in a partition name.
    fn name_fields(self) -> usize {
        match self {
            Self::Year => 1,
            Self::Month => 2,
            Self::Day => 3,
            Self::Hour => 4,
            Self::Min5 | Self::Min15 | Self::Min30 => 5,
        }
    }

    /// First second of the partition containing `epoch_seconds`.
    pub fn partition_start(self, epoch_seconds: i64) -> i64 {
        if self.is_fixed_length() {
            return epoch_seconds - epoch_seconds.rem_euclid(self.approx_seconds());
        }
        let t = civil(epoch_seconds);
        let month = if self == Self::Year { 1 } else { t.month() };
        civil_seconds(t.year(), month, 1, 0, 0).unwrap_or(epoch_seconds)
    }

    /// First second of the partition after the one containing `epoch_seconds`.
    pub fn next_partition_first_second(self, epoch_seconds: i64) -> i64 {
        let start = self.partition_start(epoch_seconds);
        if self.is_fixed_length() {
            return start + self.approx_seconds();
        }
        let t = civil(start);
        let (year, month) = match self {
            Self::Year => (t.year() + 1, 1),
            _ if t.month() == 12 => (t.year() + 1, 1),
            _ => (t.year(), t.month() + 1),
        };
        civil_seconds(year, month, 1, 0, 0).unwrap_or(start + self.approx_seconds())
    }

    /// Last second of the partition before the one containing `epoch_seconds`.
    pub fn previous_partition_last_second(self, epoch_seconds: i64) -> i64 {
        self.partition_start(epoch_seconds) - 1
    }

    /// Name of the partition containing `epoch_seconds`.
    pub fn partition_name(self, epoch_seconds: i64) -> String {
        let t = civil(self.partition_start(epoch_seconds));
        let (year, month, day) = (t.year(), t.month(), t.day());
        match self {
            Self::Year => format!("{:04}", year),
            Self::Month => format!("{:04}_{:02}", year, month),
            Self::Day => format!("{:04}_{:02}_{:02}", year, month, day),
            Self::Hour => format!("{:04}_{:02}_{:02}_{:02}", year, month, day, t.hour()),
            Self::Min5 | Self::Min15 | Self::Min30 => format!(
                "{:04}_{:02}_{:02}_{:02}_{:02}",
                year,
                month,
                day,
                t.hour(),
                t.minute()
            ),
        }
    }

    /// Recovers the inclusive `(first, last)` seconds covered by a partition name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidFileName`] if the name does not follow this granularity's scheme.
    pub fn bounds_from_name(self, name: &str) -> Result<(i64, i64)> {
        let invalid = || StoreError::InvalidFileName(format!("{} for {:?}", name, self));
        let fields = name
            .split('_')
            .map(|field| {
                if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                field.parse::<u32>().ok()
            })
            .collect::<Option<Vec<u32>>>()
            .ok_or_else(invalid)?;
        if fields.len() != self.name_fields() {
            return Err(invalid());
        }

        let field = |index: usize, default: u32| fields.get(index).copied().unwrap_or(default);
        let year = i32::try_from(field(0, 0)).map_err(|_| invalid())?;
        let (month, day, hour, minute) = (field(1, 1), field(2, 1), field(3, 0), field(4, 0));
        if !self.minute_chunk().map_or(true, |chunk| minute % chunk == 0) {
            return Err(invalid());
        }
        let start = civil_seconds(year, month, day, hour, minute).ok_or_else(invalid)?;
        Ok((start, self.next_partition_first_second(start) - 1))
    }
}

/// Maps PV names to partition keys.
///
/// # Examples
/// ```rust,ignore
/// use alopex_pvstore::lifecycle::partition::KeyMapping;
///
/// assert_eq!(KeyMapping::default().key_for("ABC:DEF"), "ABC/DEF:");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapping {
    separators: Vec<char>,
    terminator: char,
}

impl Default for KeyMapping {
    fn default() -> Self {
        Self {
            separators: vec![':', '-'],
            terminator: ':',
        }
    }
}

impl KeyMapping {
    /// Creates a mapping that turns each of `separators` into a directory level.
    pub fn new(separators: impl IntoIterator<Item = char>, terminator: char) -> Self {
        Self {
            separators: separators.into_iter().collect(),
            terminator,
        }
    }

    /// The key for `pv_name`: separators replaced by `/`, followed by the terminator.
    pub fn key_for(&self, pv_name: &str) -> String {
        let mut key: String = pv_name
            .chars()
            .map(|c| if self.separators.contains(&c) { '/' } else { c })
            .collect();
        key.push(self.terminator);
        key
    }
}

/// One partition file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFile {
    /// Full file path.
    pub path: PathBuf,
    /// Partition name taken from the file name.
    pub name: String,
    /// First second covered by the partition.
    pub start: i64,
    /// Last second covered by the partition.
    pub end: i64,
}

/// Provides filesystem paths for partition files.
///
/// # Examples
/// ```rust,ignore
/// use alopex_pvstore::lifecycle::partition::{Granularity, KeyMapping, PartitionLayout};
///
/// let layout = PartitionLayout::new("/data", Granularity::Day, KeyMapping::default());
/// let path = layout.path_for("ABC:DEF", 1_710_428_400, ".pvs");
/// ```
#[derive(Debug, Clone)]
pub struct PartitionLayout {
    /// Root data directory.
    root: PathBuf,
    granularity: Granularity,
    key_mapping: KeyMapping,
}

impl PartitionLayout {
    /// Creates a new partition layout under `root`.
    pub fn new(root: impl AsRef<Path>, granularity: Granularity, key_mapping: KeyMapping) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            granularity,
            key_mapping,
        }
    }

    /// Returns the root data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the partition granularity.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Returns the key mapping.
    pub fn key_mapping(&self) -> &KeyMapping {
        &self.key_mapping
    }

    /// Directory holding the PV's files and the file name prefix within it.
    fn pv_location(&self, pv_name: &str) -> (PathBuf, String) {
        let key = self.key_mapping.key_for(pv_name);
        let mut components: Vec<&str> = key.split('/').collect();
        let prefix = components.pop().unwrap_or_default().to_string();
        let dir = components
            .into_iter()
            .filter(|component| !component.is_empty())
            .fold(self.root.clone(), |dir, component| dir.join(component));
        (dir, prefix)
    }

    /// Builds the path of the partition file holding `epoch_seconds`.
    pub fn path_for(&self, pv_name: &str, epoch_seconds: i64, extension: &str) -> PathBuf {
        let (dir, prefix) = self.pv_location(pv_name);
        dir.join(format!(
            "{}{}{}",
            prefix,
            self.granularity.partition_name(epoch_seconds),
            extension
        ))
    }

    /// Lists the PV's partition files with `extension`, sorted by file name.
    ///
    /// Files whose partition name does not parse are skipped. A missing directory yields an empty
    /// list.
    pub fn all_paths(&self, pv_name: &str, extension: &str) -> Result<Vec<PartitionFile>> {
        let (dir, prefix) = self.pv_location(pv_name);
        let mut files = Vec::new();

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let file_name = match path.file_name().and_then(|name| name.to_str()) {
                Some(name) => name,
                None => continue,
            };
            let Some(name) = file_name
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_suffix(extension))
            else {
                continue;
            };
            match self.granularity.bounds_from_name(name) {
                Ok((start, end)) => files.push(PartitionFile {
                    name: name.to_string(),
                    path,
                    start,
                    end,
                }),
                Err(err) => warn!("Skipping {}: {}", path.display(), err),
            }
        }

        files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(files)
    }

    /// Files whose partitions overlap `[start, end]` (epoch seconds).
    pub fn paths_with_data(
        &self,
        pv_name: &str,
        start: i64,
        end: i64,
        extension: &str,
    ) -> Result<Vec<PartitionFile>> {
        Ok(self
            .all_paths(pv_name, extension)?
            .into_iter()
            .filter(|file| file.end >= start && file.start <= end)
            .collect())
    }

    /// Files of partitions that closed before the partition containing `now`.
    pub fn paths_before_current_partition(
        &self,
        pv_name: &str,
        now: i64,
        extension: &str,
    ) -> Result<Vec<PartitionFile>> {
        let last_closed = self.granularity.previous_partition_last_second(now);
        self.paths_with_data(pv_name, 1, last_closed, extension)
    }

    /// Files whose partition ends before `start`, newest first.
    pub fn paths_ending_before(
        &self,
        pv_name: &str,
        start: i64,
        extension: &str,
    ) -> Result<Vec<PartitionFile>> {
        let mut files: Vec<PartitionFile> = self
            .all_paths(pv_name, extension)?
            .into_iter()
            .filter(|file| file.end < start)
            .collect();
        files.reverse();
        Ok(files)
    }
}

/// Calendar fields of a UTC instant. Out-of-range inputs collapse to the Unix epoch.
fn civil(epoch_seconds: i64) -> NaiveDateTime {
    DateTime::from_timestamp(epoch_seconds, 0)
        .unwrap_or_default()
        .naive_utc()
}

/// Epoch seconds of a UTC calendar minute, or `None` if the fields name no such minute.
fn civil_seconds(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> Option<i64> {
    NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, 0)
        .map(|t| t.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn epoch(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().timestamp()
    }

    #[test]
    fn test_partition_names() {
        let ts = epoch(2024, 3, 14, 15, 37, 26);
        assert_eq!(Granularity::Year.partition_name(ts), "2024");
        assert_eq!(Granularity::Month.partition_name(ts), "2024_03");
        assert_eq!(Granularity::Day.partition_name(ts), "2024_03_14");
        assert_eq!(Granularity::Hour.partition_name(ts), "2024_03_14_15");
        assert_eq!(Granularity::Min5.partition_name(ts), "2024_03_14_15_35");
        assert_eq!(Granularity::Min15.partition_name(ts), "2024_03_14_15_30");
        assert_eq!(Granularity::Min30.partition_name(ts), "2024_03_14_15_30");
    }

    #[test]
    fn test_next_partition_first_second() {
        let ts = epoch(2024, 12, 31, 23, 59, 59);
        assert_eq!(Granularity::Year.next_partition_first_second(ts), epoch(2025, 1, 1, 0, 0, 0));
        assert_eq!(Granularity::Month.next_partition_first_second(ts), epoch(2025, 1, 1, 0, 0, 0));
        assert_eq!(Granularity::Day.next_partition_first_second(ts), epoch(2025, 1, 1, 0, 0, 0));

        let ts = epoch(2024, 2, 10, 7, 44, 1);
        assert_eq!(Granularity::Month.next_partition_first_second(ts), epoch(2024, 3, 1, 0, 0, 0));
        assert_eq!(Granularity::Hour.next_partition_first_second(ts), epoch(2024, 2, 10, 8, 0, 0));
        assert_eq!(Granularity::Min5.next_partition_first_second(ts), epoch(2024, 2, 10, 7, 45, 0));
        assert_eq!(Granularity::Min15.next_partition_first_second(ts), epoch(2024, 2, 10, 7, 45, 0));
        assert_eq!(Granularity::Min30.next_partition_first_second(ts), epoch(2024, 2, 10, 8, 0, 0));
    }

    #[test]
    fn test_previous_partition_last_second() {
        let ts = epoch(2024, 3, 1, 0, 10, 0);
        assert_eq!(
            Granularity::Year.previous_partition_last_second(ts),
            epoch(2023, 12, 31, 23, 59, 59)
        );
        assert_eq!(
            Granularity::Month.previous_partition_last_second(ts),
            epoch(2024, 2, 29, 23, 59, 59)
        );
        assert_eq!(
            Granularity::Day.previous_partition_last_second(ts),
            epoch(2024, 2, 29, 23, 59, 59)
        );
        assert_eq!(
            Granularity::Hour.previous_partition_last_second(ts),
            epoch(2024, 2, 29, 23, 59, 59)
        );
        assert_eq!(
            Granularity::Min15.previous_partition_last_second(ts),
            epoch(2024, 2, 29, 23, 59, 59)
        );
        assert_eq!(
            Granularity::Min5.previous_partition_last_second(ts),
            epoch(2024, 3, 1, 0, 9, 59)
        );
    }

    #[test]
    fn test_bounds_from_name() {
        assert_eq!(
            Granularity::Year.bounds_from_name("2024").unwrap(),
            (epoch(2024, 1, 1, 0, 0, 0), epoch(2024, 12, 31, 23, 59, 59))
        );
        assert_eq!(
            Granularity::Month.bounds_from_name("2024_02").unwrap(),
            (epoch(2024, 2, 1, 0, 0, 0), epoch(2024, 2, 29, 23, 59, 59))
        );
        assert_eq!(
            Granularity::Hour.bounds_from_name("2024_03_14_15").unwrap(),
            (epoch(2024, 3, 14, 15, 0, 0), epoch(2024, 3, 14, 15, 59, 59))
        );
        assert_eq!(
            Granularity::Min15.bounds_from_name("2024_03_14_15_45").unwrap(),
            (epoch(2024, 3, 14, 15, 45, 0), epoch(2024, 3, 14, 15, 59, 59))
        );
    }

    #[test]
    fn test_bounds_from_name_rejects_bad_names() {
        assert!(Granularity::Day.bounds_from_name("2024_03").is_err());
        assert!(Granularity::Day.bounds_from_name("2024_02_30").is_err());
        assert!(Granularity::Day.bounds_from_name("2024_13_01").is_err());
        assert!(Granularity::Min15.bounds_from_name("2024_03_14_15_40").is_err());
        assert!(Granularity::Hour.bounds_from_name("2024_03_14_xx").is_err());
        assert!(Granularity::Year.bounds_from_name("").is_err());
    }

    #[test]
    fn test_names_roundtrip_every_granularity() {
        let ts = epoch(2023, 11, 5, 22, 18, 3);
        for granularity in Granularity::ALL {
            let name = granularity.partition_name(ts);
            let (start, end) = granularity.bounds_from_name(&name).unwrap();
            assert!(start <= ts && ts <= end, "{:?}", granularity);
            assert_eq!(start, granularity.partition_start(ts));
            assert_eq!(end + 1, granularity.next_partition_first_second(ts));
        }
    }

    #[test]
    fn test_key_mapping() {
        let mapping = KeyMapping::default();
        assert_eq!(mapping.key_for("ABC:DEF"), "ABC/DEF:");
        assert_eq!(mapping.key_for("XF:31ID-BI{Cam:1}"), "XF/31ID/BI{Cam/1}:");
    }

    #[test]
    fn test_path_for() {
        let layout = PartitionLayout::new("/data", Granularity::Day, KeyMapping::default());
        assert_eq!(
            layout.path_for("ABC:DEF", epoch(2024, 3, 14, 12, 0, 0), ".pvs"),
            PathBuf::from("/data/ABC/DEF:2024_03_14.pvs")
        );
        assert_eq!(
            layout.path_for("SIMPLE", epoch(2024, 3, 14, 12, 0, 0), ".pvs"),
            PathBuf::from("/data/SIMPLE:2024_03_14.pvs")
        );
    }

    #[test]
    fn test_listing() {
        let temp_dir = TempDir::new().unwrap();
        let layout = PartitionLayout::new(temp_dir.path(), Granularity::Day, KeyMapping::default());
        assert!(layout.all_paths("ABC:DEF", ".pvs").unwrap().is_empty());

        let days = [
            epoch(2024, 3, 12, 1, 0, 0),
            epoch(2024, 3, 13, 1, 0, 0),
            epoch(2024, 3, 15, 1, 0, 0),
        ];
        for day in days {
            let path = layout.path_for("ABC:DEF", day, ".pvs");
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"").unwrap();
        }
        let dir = temp_dir.path().join("ABC");
        fs::write(dir.join("DEF:garbage.pvs"), b"").unwrap();
        fs::write(dir.join("DEF:2024_03_14.pvsappend"), b"").unwrap();
        fs::write(dir.join("DEFG:2024_03_14.pvs"), b"").unwrap();

        let names: Vec<String> = layout
            .all_paths("ABC:DEF", ".pvs")
            .unwrap()
            .into_iter()
            .map(|file| file.name)
            .collect();
        assert_eq!(names, vec!["2024_03_12", "2024_03_13", "2024_03_15"]);

        let with_data = layout
            .paths_with_data("ABC:DEF", epoch(2024, 3, 13, 23, 0, 0), epoch(2024, 3, 14, 5, 0, 0), ".pvs")
            .unwrap();
        assert_eq!(with_data.len(), 1);
        assert_eq!(with_data[0].name, "2024_03_13");

        let before = layout
            .paths_before_current_partition("ABC:DEF", epoch(2024, 3, 15, 8, 0, 0), ".pvs")
            .unwrap();
        assert_eq!(before.len(), 2);

        let previous: Vec<String> = layout
            .paths_ending_before("ABC:DEF", epoch(2024, 3, 15, 0, 0, 0), ".pvs")
            .unwrap()
            .into_iter()
            .map(|file| file.name)
            .collect();
        assert_eq!(previous, vec!["2024_03_13", "2024_03_12"]);

        assert!(layout
            .paths_ending_before("ABC:DEF", epoch(2024, 3, 12, 6, 0, 0), ".pvs")
            .unwrap()
            .is_empty());
    }
}
