//! Alopex PV Store - partitioned plain-file storage for archived process-variable samples
//!
//! Each PV's history is split into time partitions, one append-only file per partition. A file is
//! a header line followed by one escaped record per line, ordered by time.
//!
//! # Components
//!
//! - [`AppendState`]: per-PV writer with partition rollover and tail repair
//! - [`FileInfo`]: header, first/last record and the last good byte of a file
//! - [`FileBackedEventStream`] / [`MultiFileEventStream`]: time-window reads over one or many files
//! - [`lifecycle::etl`]: hold/gather selection of partitions ready to move to the next tier
//! - [`PlainStore`]: the facade tying these together
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_pvstore::{PlainStore, Sample, StoreConfig, Value};
//! use alopex_pvstore::lifecycle::Granularity;
//!
//! let config = StoreConfig::new("STS", "/arch/sts").with_granularity(Granularity::Hour);
//! let store = PlainStore::new(config)?;
//!
//! store.append_data("ABC:DEF", vec![Sample::new(now, Value::ScalarDouble(0.75))])?;
//!
//! for sample in store.get_data("ABC:DEF", start, end)? {
//!     let sample = sample?;
//!     println!("{} {:?}", sample.timestamp(), sample.value);
//! }
//! ```

#![deny(missing_docs)]

pub mod append;
pub mod codec;
pub mod config;
pub mod error;
pub mod info;
pub mod lifecycle;
pub mod line;
pub mod search;
pub mod store;
pub mod stream;
pub mod time;

pub use append::{AppendRegistry, AppendState, BulkAppend};
pub use codec::{PayloadInfo, Sample, Value, ValueKind};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use info::FileInfo;
pub use store::PlainStore;
pub use stream::{FileBackedEventStream, MultiFileEventStream, SeekCase};
pub use time::YearSecondTimestamp;
