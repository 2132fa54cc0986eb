//! Partition layout and ETL lifecycle.

pub mod etl;
pub mod partition;

pub use etl::{mark_for_deletion, select_etl_partitions, EtlInfo, EtlPolicy, HoldGatherPolicy};
pub use partition::{Granularity, KeyMapping, PartitionFile, PartitionLayout};
