//! Store configuration.

use crate::error::{Result, StoreError};
use crate::lifecycle::partition::{Granularity, KeyMapping};
use std::path::PathBuf;

/// Default partition file extension.
pub const DEFAULT_EXTENSION: &str = ".pvs";

/// Default number of partitions a PV's oldest data must age before ETL moves it.
pub const DEFAULT_HOLD: u32 = 5;

/// Default number of partitions moved per ETL pass.
pub const DEFAULT_GATHER: u32 = 3;

/// Configuration for a [`crate::store::PlainStore`].
///
/// # Examples
/// ```rust,ignore
/// use alopex_pvstore::config::StoreConfig;
/// use alopex_pvstore::lifecycle::partition::Granularity;
///
/// let config = StoreConfig::new("STS", "/arch/sts")
///     .with_granularity(Granularity::Hour)
///     .with_hold_gather(2, 1);
/// config.validate()?;
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Identifier of the store, used in log messages.
    pub name: String,
    /// Directory under which partition files are kept.
    pub root_folder: PathBuf,
    /// Partition size.
    pub granularity: Granularity,
    /// File extension of partition files, including the dot.
    pub extension: String,
    /// Partitions the oldest data must age before ETL.
    pub hold: u32,
    /// Partitions moved per ETL pass.
    pub gather: u32,
    /// PV name to key mapping.
    pub key_mapping: KeyMapping,
    /// Use binary search to find byte offsets. When false, reads scan sequentially.
    pub use_search_for_positions: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "store".to_string(),
            root_folder: PathBuf::from("."),
            granularity: Granularity::Hour,
            extension: DEFAULT_EXTENSION.to_string(),
            hold: DEFAULT_HOLD,
            gather: DEFAULT_GATHER,
            key_mapping: KeyMapping::default(),
            use_search_for_positions: true,
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with defaults for everything but the name and root folder.
    pub fn new(name: impl Into<String>, root_folder: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root_folder: root_folder.into(),
            ..Self::default()
        }
    }

    /// Sets the partition granularity.
    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    /// Sets the file extension.
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    /// Sets hold and gather together.
    pub fn with_hold_gather(mut self, hold: u32, gather: u32) -> Self {
        self.hold = hold;
        self.gather = gather;
        self
    }

    /// Sets the key mapping.
    pub fn with_key_mapping(mut self, key_mapping: KeyMapping) -> Self {
        self.key_mapping = key_mapping;
        self
    }

    /// Enables or disables binary search for byte offsets.
    pub fn with_search_for_positions(mut self, enabled: bool) -> Self {
        self.use_search_for_positions = enabled;
        self
    }

    /// Extension of the staging files written during ETL.
    pub fn append_extension(&self) -> String {
        format!("{}append", self.extension)
    }

    /// Checks the configuration invariants.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if `hold < gather` or the extension is empty.
    pub fn validate(&self) -> Result<()> {
        validate_hold_gather(self.hold, self.gather)?;
        if self.extension.is_empty() {
            return Err(StoreError::InvalidConfig(
                "extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) fn validate_hold_gather(hold: u32, gather: u32) -> Result<()> {
    if hold < gather {
        return Err(StoreError::InvalidConfig(format!(
            "hold ({}) must be at least gather ({})",
            hold, gather
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.extension, DEFAULT_EXTENSION);
        assert_eq!(config.hold, DEFAULT_HOLD);
        assert_eq!(config.gather, DEFAULT_GATHER);
        assert_eq!(config.granularity, Granularity::Hour);
        assert!(config.use_search_for_positions);
        assert!(config.validate().is_ok());
        assert_eq!(config.append_extension(), ".pvsappend");
    }

    #[test]
    fn test_hold_below_gather_rejected() {
        let config = StoreConfig::new("x", "/tmp").with_hold_gather(1, 2);
        assert!(matches!(
            config.validate(),
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(StoreConfig::new("x", "/tmp")
            .with_hold_gather(0, 0)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_empty_extension_rejected() {
        assert!(StoreConfig::default().with_extension("").validate().is_err());
    }
}
