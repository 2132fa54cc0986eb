//! ETL hold/gather selection of closed partitions.
//!
//! `hold` keeps a number of partitions in this store before anything moves; `gather` is how many
//! move per pass once the hold is satisfied:
//!
//! ```text
//!   oldest ──────────────────────────────────────────────► now
//!   [p0][p1][p2][p3][p4][p5][p6] (current)
//!        ▲gather watermark   ▲hold watermark
//!   eligible: oldest first, while first event <= gather watermark,
//!             and only once the oldest first event <= hold watermark
//! ```
//!
//! `hold == gather == 0` makes every closed partition eligible immediately.

use crate::codec::{Sample, ValueKind};
use crate::config::validate_hold_gather;
use crate::error::Result;
use crate::info::FileInfo;
use crate::lifecycle::partition::{Granularity, PartitionLayout};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, error, info, warn};

/// Watermark policy deciding which closed partitions ETL may move.
pub trait EtlPolicy: Send + Sync {
    /// Partitions the oldest data must age before anything moves.
    fn hold(&self) -> u32;

    /// Partitions moved per pass.
    fn gather(&self) -> u32;

    /// True when every closed partition is eligible.
    fn moves_everything(&self) -> bool {
        self.hold() == 0 && self.gather() == 0
    }

    /// Partitions whose first event is at or before this second satisfy the hold.
    fn hold_watermark(&self, granularity: Granularity, now: i64) -> i64 {
        granularity.previous_partition_last_second(
            now - granularity.approx_seconds() * i64::from(self.hold()),
        )
    }

    /// Partitions whose first event is at or before this second are gathered.
    fn gather_watermark(&self, granularity: Granularity, now: i64) -> i64 {
        let partitions = i64::from(self.hold()) - (i64::from(self.gather()) - 1);
        granularity.previous_partition_last_second(now - granularity.approx_seconds() * partitions)
    }
}

/// Hold/gather counts, validated so that `hold >= gather`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldGatherPolicy {
    hold: u32,
    gather: u32,
}

impl HoldGatherPolicy {
    /// Creates a policy.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::InvalidConfig`] if `hold < gather`.
    pub fn new(hold: u32, gather: u32) -> Result<Self> {
        validate_hold_gather(hold, gather)?;
        Ok(Self { hold, gather })
    }
}

impl EtlPolicy for HoldGatherPolicy {
    fn hold(&self) -> u32 {
        self.hold
    }

    fn gather(&self) -> u32 {
        self.gather
    }
}

/// A closed partition selected for migration.
#[derive(Debug, Clone)]
pub struct EtlInfo {
    /// PV the partition belongs to.
    pub pv_name: String,
    /// Value kind from the file header.
    pub kind: ValueKind,
    /// Partition file.
    pub path: PathBuf,
    /// Granularity of the source store.
    pub granularity: Granularity,
    /// First record of the partition.
    pub first_event: Sample,
    /// File size when the partition was listed; `-1` when unknown.
    pub size: i64,
}

/// Lists the closed partitions of `pv_name` that ETL may move at `now` (epoch seconds).
///
/// Zero-byte and header-only files are skipped, and deleted once they are older than `hold + 1`
/// partitions. Files with an unreadable header or no decodable record are skipped and kept. Both the hold and the gather watermark stop the scan at the first partition that
/// fails them, and at most `gather` partitions are returned.
pub fn select_etl_partitions<P: EtlPolicy + ?Sized>(
    layout: &PartitionLayout,
    pv_name: &str,
    extension: &str,
    policy: &P,
    now: i64,
) -> Result<Vec<EtlInfo>> {
    let granularity = layout.granularity();
    let hold_watermark = policy.hold_watermark(granularity, now);
    let gather_watermark = policy.gather_watermark(granularity, now);
    let stale_after = (i64::from(policy.hold()) + 1) * granularity.approx_seconds();

    let mut hold_satisfied = false;
    let mut eligible = Vec::new();

    for file in layout.paths_before_current_partition(pv_name, now, extension)? {
        let size = match fs::metadata(&file.path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("{} disappeared before ETL", file.path.display());
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        if size == 0 {
            delete_if_stale(&file.path, now, stale_after);
            continue;
        }
        let (kind, first_event) = match FileInfo::read(&file.path) {
            Ok(info) if info.is_header_only() => {
                delete_if_stale(&file.path, now, stale_after);
                continue;
            }
            Ok(info) => match info.first_event().cloned() {
                Some(first_event) => (info.kind(), first_event),
                None => {
                    warn!(
                        "No decodable record in {}; leaving it in place",
                        file.path.display()
                    );
                    continue;
                }
            },
            Err(err) if err.is_corruption() => {
                warn!("Skipping unreadable partition {}: {}", file.path.display(), err);
                continue;
            }
            Err(err) => return Err(err),
        };

        let first_seconds = first_event.epoch_seconds();
        let etl_info = EtlInfo {
            pv_name: pv_name.to_string(),
            kind,
            path: file.path,
            granularity,
            first_event,
            size: size as i64,
        };

        if policy.moves_everything() {
            eligible.push(etl_info);
            continue;
        }
        if !hold_satisfied {
            if first_seconds > hold_watermark {
                debug!(
                    "Hold not satisfied for {}: first event {} after {}",
                    pv_name, first_seconds, hold_watermark
                );
                break;
            }
            hold_satisfied = true;
        }
        if first_seconds > gather_watermark || eligible.len() >= policy.gather() as usize {
            debug!(
                "Gather stops for {} at first event {} (watermark {})",
                pv_name, first_seconds, gather_watermark
            );
            break;
        }
        eligible.push(etl_info);
    }

    Ok(eligible)
}

/// Deletes a listed partition if it has not changed size since it was listed.
///
/// Returns true if the file was deleted. A file that is already gone is not an error.
pub fn mark_for_deletion(info: &EtlInfo) -> Result<bool> {
    let size = match fs::metadata(&info.path) {
        Ok(metadata) => metadata.len() as i64,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!("{} is already gone", info.path.display());
            return Ok(false);
        }
        Err(err) => return Err(err.into()),
    };
    if info.size == -1 {
        warn!(
            "No listed size for {}; deleting without checking",
            info.path.display()
        );
    } else if info.size != size {
        error!(
            "{} changed since it was listed ({} bytes, now {}); not deleting",
            info.path.display(),
            info.size,
            size
        );
        return Ok(false);
    }
    fs::remove_file(&info.path)?;
    info!("Deleted {} after ETL", info.path.display());
    Ok(true)
}

fn delete_if_stale(path: &Path, now: i64, stale_after: i64) {
    let modified = fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|age| age.as_secs() as i64);
    let Some(modified) = modified else {
        return;
    };
    if now - modified > stale_after {
        info!("Deleting stale empty partition {}", path.display());
        if let Err(err) = fs::remove_file(path) {
            error!("Failed to delete {}: {:?}", path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::AppendState;
    use crate::codec::{PayloadInfo, Value};
    use crate::lifecycle::partition::KeyMapping;
    use tempfile::TempDir;

    const DAY: i64 = 86_400;

    #[derive(Debug)]
    struct Fixed(u32, u32);

    impl EtlPolicy for Fixed {
        fn hold(&self) -> u32 {
            self.0
        }
        fn gather(&self) -> u32 {
            self.1
        }
    }

    fn create_test_layout() -> (TempDir, PartitionLayout) {
        let temp_dir = TempDir::new().unwrap();
        let layout = PartitionLayout::new(temp_dir.path(), Granularity::Day, KeyMapping::default());
        (temp_dir, layout)
    }

    /// One sample at 01:00 of each of `days` days starting 2024-01-01.
    fn write_days(layout: &PartitionLayout, days: i64) {
        let start = crate::time::start_of_year_epoch_seconds(2024);
        let samples: Vec<Sample> = (0..days)
            .map(|day| {
                let ts = crate::time::from_epoch_seconds(start + day * DAY + 3_600, 0);
                Sample::new(ts, Value::ScalarInt(day as i32))
            })
            .collect();
        let mut state = AppendState::new("ETL:PV", layout.clone(), None);
        state.append(samples, ".pvs", None).unwrap();
    }

    fn day_start(day: i64) -> i64 {
        crate::time::start_of_year_epoch_seconds(2024) + day * DAY
    }

    #[test]
    fn test_watermarks() {
        let policy = Fixed(5, 3);
        let now = day_start(10) + 7_200;
        assert_eq!(policy.hold_watermark(Granularity::Day, now), day_start(5) - 1);
        assert_eq!(policy.gather_watermark(Granularity::Day, now), day_start(7) - 1);
    }

    #[test]
    fn test_policy_rejects_hold_below_gather() {
        assert!(HoldGatherPolicy::new(2, 3).is_err());
        assert!(HoldGatherPolicy::new(3, 3).is_ok());
    }

    #[test]
    fn test_hold_not_satisfied_selects_nothing() {
        let (_temp_dir, layout) = create_test_layout();
        write_days(&layout, 5);
        let now = day_start(5) + 60;
        let eligible = select_etl_partitions(&layout, "ETL:PV", ".pvs", &Fixed(7, 3), now).unwrap();
        assert!(eligible.is_empty());
    }

    #[test]
    fn test_gather_limits_selection() {
        let (_temp_dir, layout) = create_test_layout();
        write_days(&layout, 10);
        let now = day_start(10) + 60;
        let eligible = select_etl_partitions(&layout, "ETL:PV", ".pvs", &Fixed(5, 3), now).unwrap();
        assert_eq!(eligible.len(), 3);
        assert_eq!(eligible[0].first_event.value, Value::ScalarInt(0));
        assert_eq!(eligible[2].first_event.value, Value::ScalarInt(2));
        assert!(eligible.iter().all(|info| info.kind == ValueKind::ScalarInt));
    }

    #[test]
    fn test_zero_zero_moves_every_closed_partition() {
        let (_temp_dir, layout) = create_test_layout();
        write_days(&layout, 4);
        let now = day_start(3) + 60;
        let eligible = select_etl_partitions(&layout, "ETL:PV", ".pvs", &Fixed(0, 0), now).unwrap();
        assert_eq!(eligible.len(), 3);
    }

    #[test]
    fn test_stale_zero_byte_file_deleted() {
        let (_temp_dir, layout) = create_test_layout();
        let path = layout.path_for("ETL:PV", day_start(0), ".pvs");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"").unwrap();

        let later = chrono::Utc::now().timestamp() + 10 * DAY;
        let eligible =
            select_etl_partitions(&layout, "ETL:PV", ".pvs", &Fixed(0, 0), later).unwrap();
        assert!(eligible.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_header_only_file_deleted() {
        let (_temp_dir, layout) = create_test_layout();
        let path = layout.path_for("ETL:PV", day_start(0), ".pvs");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, PayloadInfo::new("ETL:PV", ValueKind::ScalarInt, 2024).encode_line().unwrap()).unwrap();

        let later = chrono::Utc::now().timestamp() + 10 * DAY;
        let eligible =
            select_etl_partitions(&layout, "ETL:PV", ".pvs", &Fixed(0, 0), later).unwrap();
        assert!(eligible.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn test_unreadable_files_kept() {
        let (_temp_dir, layout) = create_test_layout();
        let garbage_header = layout.path_for("ETL:PV", day_start(0), ".pvs");
        fs::create_dir_all(garbage_header.parent().unwrap()).unwrap();
        fs::write(&garbage_header, b"not a header\n").unwrap();
        let no_records = layout.path_for("ETL:PV", day_start(1), ".pvs");
        let mut bytes = PayloadInfo::new("ETL:PV", ValueKind::ScalarInt, 2024).encode_line().unwrap();
        bytes.extend_from_slice(b"bitrot\n");
        fs::write(&no_records, bytes).unwrap();

        let later = chrono::Utc::now().timestamp() + 10 * DAY;
        let eligible =
            select_etl_partitions(&layout, "ETL:PV", ".pvs", &Fixed(0, 0), later).unwrap();
        assert!(eligible.is_empty());
        assert!(garbage_header.exists());
        assert!(no_records.exists());
    }

    #[test]
    fn test_mark_for_deletion_checks_size() {
        let (_temp_dir, layout) = create_test_layout();
        write_days(&layout, 2);
        let now = day_start(2) + 60;
        let mut eligible =
            select_etl_partitions(&layout, "ETL:PV", ".pvs", &Fixed(0, 0), now).unwrap();
        assert_eq!(eligible.len(), 2);

        let mut changed = eligible.remove(0);
        changed.size += 1;
        assert!(!mark_for_deletion(&changed).unwrap());
        assert!(changed.path.exists());

        let unchanged = eligible.remove(0);
        assert!(mark_for_deletion(&unchanged).unwrap());
        assert!(!unchanged.path.exists());
        assert!(!mark_for_deletion(&unchanged).unwrap());

        changed.size = -1;
        assert!(mark_for_deletion(&changed).unwrap());
    }
}
