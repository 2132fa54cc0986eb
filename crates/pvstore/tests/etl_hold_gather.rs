//! Integration tests for ETL selection and migration between two stores.
//!
//! These tests verify:
//! - A pass never selects more than `gather` partitions, nor any past the gather watermark
//! - `hold == gather == 0` moves every closed partition
//! - A full stage/commit/delete cycle moves data without loss or reordering
//! - Partitions with damaged records are moved or kept, never deleted unread

use alopex_pvstore::codec::{encode_line, PayloadInfo};
use alopex_pvstore::lifecycle::{EtlPolicy, Granularity, HoldGatherPolicy};
use alopex_pvstore::{PlainStore, Sample, StoreConfig, StoreError, Value, ValueKind};
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;

const PV: &str = "ETL:HOLD:GATHER";

fn create_test_store(name: &str, hold: u32, gather: u32) -> (TempDir, PlainStore) {
    let temp_dir = TempDir::new().unwrap();
    let config = StoreConfig::new(name, temp_dir.path())
        .with_granularity(Granularity::Day)
        .with_hold_gather(hold, gather);
    (temp_dir, PlainStore::new(config).unwrap())
}

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + Duration::days(n)
}

/// One sample an hour for `days` days.
fn fill(store: &PlainStore, days: i64) {
    let events = (0..days * 24).map(|hour| {
        let at = day(0) + Duration::hours(hour);
        Sample::new(at, Value::ScalarShort((hour % 1000) as i16))
    });
    store.append_data(PV, events).unwrap();
}

// ============================================================================
// Selection
// ============================================================================

#[test]
fn test_hold_must_cover_gather() {
    let (_temp_dir, mut store) = create_test_store("src", 3, 2);
    assert!(matches!(
        store.set_gather(4),
        Err(StoreError::InvalidConfig(_))
    ));
    assert!(HoldGatherPolicy::new(1, 2).is_err());
}

#[test]
fn test_hold_gates_selection() {
    let (_temp_dir, store) = create_test_store("src", 5, 2);
    fill(&store, 8);
    assert!(store.etl_streams(PV, day(5) + Duration::hours(1)).unwrap().is_empty());

    let eligible = store.etl_streams(PV, day(6) + Duration::hours(1)).unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].first_event.timestamp(), day(0));

    let eligible = store.etl_streams(PV, day(8) + Duration::hours(1)).unwrap();
    assert_eq!(eligible.len(), 2);
    assert_eq!(eligible[1].first_event.timestamp(), day(1));
}

#[test]
fn test_zero_zero_moves_all_closed_partitions() {
    let (_temp_dir, store) = create_test_store("src", 0, 0);
    fill(&store, 6);
    let eligible = store.etl_streams(PV, day(5) + Duration::hours(1)).unwrap();
    assert_eq!(eligible.len(), 5);
    assert!(eligible
        .windows(2)
        .all(|pair| pair[0].first_event.timestamp() < pair[1].first_event.timestamp()));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_selection_bounded_by_gather(
        partitions in 1i64..15,
        hold in 0u32..8,
        gather_seed in 0u32..8,
        now_day in 0i64..20,
    ) {
        let gather = gather_seed.min(hold);
        let (_temp_dir, store) = create_test_store("src", hold, gather);
        fill(&store, partitions);

        let now = day(now_day) + Duration::hours(3);
        let eligible = store.etl_streams(PV, now).unwrap();
        let policy = HoldGatherPolicy::new(hold, gather).unwrap();

        if hold == 0 && gather == 0 {
            let closed = partitions.min(now_day) as usize;
            prop_assert_eq!(eligible.len(), closed);
        } else {
            prop_assert!(eligible.len() <= gather as usize);
            let watermark = policy.gather_watermark(Granularity::Day, now.timestamp());
            for info in &eligible {
                prop_assert!(info.first_event.epoch_seconds() <= watermark);
            }
        }
        for info in &eligible {
            prop_assert!(info.first_event.timestamp() < day(now_day));
        }
    }
}

// ============================================================================
// Migration
// ============================================================================

#[test]
fn test_daily_etl_cycle_moves_everything_in_order() {
    let (_src_dir, source) = create_test_store("src", 2, 1);
    let (_dest_dir, dest) = create_test_store("dest", 5, 3);
    fill(&source, 10);

    let mut moved = 0;
    for today in 1..=11 {
        let now = day(today) + Duration::minutes(5);
        for info in source.etl_streams(PV, now).unwrap() {
            dest.append_to_etl_append_data(PV, &info).unwrap();
            dest.commit_etl_append_data(PV).unwrap();
            assert!(source.mark_for_deletion(&info).unwrap());
            moved += 1;
        }
    }
    assert_eq!(moved, 9);
    assert_eq!(source.layout().all_paths(PV, ".pvs").unwrap().len(), 1);

    let migrated: Vec<DateTime<Utc>> = dest
        .get_data(PV, day(0), day(9))
        .unwrap()
        .map(|sample| sample.unwrap().timestamp())
        .collect();
    assert_eq!(migrated.len(), 9 * 24);
    assert_eq!(migrated[0], day(0));
    assert!(migrated.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_changed_partition_not_deleted() {
    let (_temp_dir, source) = create_test_store("src", 0, 0);
    fill(&source, 3);
    let eligible = source.etl_streams(PV, day(2) + Duration::hours(1)).unwrap();
    assert_eq!(eligible.len(), 2);

    let mut bytes = fs::read(&eligible[0].path).unwrap();
    bytes.extend_from_slice(b"late\n");
    fs::write(&eligible[0].path, bytes).unwrap();

    assert!(!source.mark_for_deletion(&eligible[0]).unwrap());
    assert!(eligible[0].path.exists());
    assert!(source.mark_for_deletion(&eligible[1]).unwrap());
}

#[test]
fn test_staging_merges_with_existing_destination_data() {
    let (_src_dir, source) = create_test_store("src", 0, 0);
    let (_dest_dir, dest) = create_test_store("dest", 0, 0);

    let early = day(0) + Duration::hours(1);
    dest.append_data(PV, vec![Sample::new(early, Value::ScalarShort(-1))])
        .unwrap();
    let later: Vec<Sample> = (2..6)
        .map(|hour| Sample::new(day(0) + Duration::hours(hour), Value::ScalarShort(hour as i16)))
        .collect();
    source.append_data(PV, later).unwrap();

    let eligible = source.etl_streams(PV, day(1) + Duration::hours(1)).unwrap();
    assert_eq!(eligible.len(), 1);
    dest.append_to_etl_append_data(PV, &eligible[0]).unwrap();
    dest.commit_etl_append_data(PV).unwrap();

    let values: Vec<Value> = dest
        .get_data(PV, day(0), day(1))
        .unwrap()
        .map(|sample| sample.unwrap().value)
        .collect();
    assert_eq!(
        values,
        vec![
            Value::ScalarShort(-1),
            Value::ScalarShort(2),
            Value::ScalarShort(3),
            Value::ScalarShort(4),
            Value::ScalarShort(5),
        ]
    );
}

// ============================================================================
// Damaged partitions
// ============================================================================

#[test]
fn test_corrupt_first_record_moved_not_deleted() {
    let (_src_dir, source) = create_test_store("src", 0, 0);
    let (_dest_dir, dest) = create_test_store("dest", 0, 0);

    let path = source.layout().path_for(PV, day(0).timestamp(), ".pvs");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut bytes = PayloadInfo::new(PV, ValueKind::ScalarShort, 2024).encode_line().unwrap();
    bytes.extend_from_slice(b"bitrot\n");
    for hour in 0..24 {
        let at = day(0) + Duration::hours(hour);
        bytes.extend(encode_line(&Sample::new(at, Value::ScalarShort(hour as i16))).unwrap());
    }
    fs::write(&path, bytes).unwrap();

    let unreadable = source.layout().path_for(PV, day(1).timestamp(), ".pvs");
    fs::write(&unreadable, b"not a header\n").unwrap();

    let eligible = source.etl_streams(PV, day(30)).unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].path, path);
    assert_eq!(eligible[0].first_event.timestamp(), day(0));
    assert!(unreadable.exists());

    dest.append_to_etl_append_data(PV, &eligible[0]).unwrap();
    dest.commit_etl_append_data(PV).unwrap();
    assert!(source.mark_for_deletion(&eligible[0]).unwrap());

    let migrated = dest.get_data(PV, day(0), day(1)).unwrap().count();
    assert_eq!(migrated, 24);
    assert!(unreadable.exists());
}
