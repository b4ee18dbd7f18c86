//! Configuration for contexts, pools and cache sizing.

use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default bound on pooled resources when no explicit cache size is given.
pub const DEFAULT_MAX_POOL_SIZE: usize = 1000;

/// Settings for how pools bring new resources up.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// How long an acquire waits for a resource that is still starting.
    ///
    /// The wait is advisory: when it elapses a warning is logged and the
    /// resource is handed out anyway.
    pub start_timeout: Duration,
    /// Poll interval while waiting for a starting resource.
    pub start_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_millis(30_000),
            start_poll_interval: Duration::from_millis(5),
        }
    }
}

impl PoolConfig {
    /// Validate pool configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.start_poll_interval.is_zero() {
            return Err(Error::configuration(
                "start_poll_interval must be greater than zero",
            ));
        }
        if self.start_poll_interval > self.start_timeout {
            return Err(Error::configuration(format!(
                "start_poll_interval ({:?}) must not exceed start_timeout ({:?})",
                self.start_poll_interval, self.start_timeout
            )));
        }
        Ok(())
    }
}

/// Settings owned by a [`Context`](crate::Context).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ContextConfig {
    /// Bound applied when a cache is created with a size of zero or less.
    pub max_pool_size: usize,
    /// Track per-endpoint hit counts in producer/consumer caches.
    pub extended_statistics: bool,
    /// Emit sending/sent events from producer caches.
    pub event_notification: bool,
    /// Pool start-up behaviour.
    pub pool: PoolConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            extended_statistics: false,
            event_notification: false,
            pool: PoolConfig::default(),
        }
    }
}

impl ContextConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(Error::configuration("max_pool_size must be greater than 0"));
        }
        self.pool.validate()
    }
}

/// The `cacheSize` option as given by a caller.
///
/// Positive values bound the cache explicitly. Zero and negative values fall
/// back to the context default; a negative value additionally asks producer
/// caches to skip pooling altogether.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(from = "i32", into = "i32"))]
pub enum CacheSize {
    /// Use the context-wide default.
    Default,
    /// Explicit bound.
    Bounded(usize),
    /// Do not cache; create and stop a resource per use.
    Disabled,
}

impl From<i32> for CacheSize {
    fn from(value: i32) -> Self {
        match value {
            0 => Self::Default,
            v if v < 0 => Self::Disabled,
            v => Self::Bounded(v as usize),
        }
    }
}

impl From<CacheSize> for i32 {
    fn from(value: CacheSize) -> Self {
        match value {
            CacheSize::Default => 0,
            CacheSize::Bounded(n) => i32::try_from(n).unwrap_or(i32::MAX),
            CacheSize::Disabled => -1,
        }
    }
}

impl CacheSize {
    /// Resolve to a concrete capacity, using `default` for non-positive sizes.
    #[must_use]
    pub fn resolve(self, default: usize) -> usize {
        match self {
            Self::Bounded(n) => n,
            Self::Default | Self::Disabled => default,
        }
    }

    /// Whether pooling is switched off.
    #[must_use]
    pub fn is_disabled(self) -> bool {
        self == Self::Disabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults() {
        let config = ContextConfig::default();
        assert_eq!(config.max_pool_size, 1000);
        assert_eq!(config.pool.start_timeout, Duration::from_secs(30));
        assert_eq!(config.pool.start_poll_interval, Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation() {
        assert!(ContextConfig { max_pool_size: 0, ..Default::default() }.validate().is_err());
        assert!(PoolConfig { start_poll_interval: Duration::ZERO, ..Default::default() }.validate().is_err());
        assert!(
            PoolConfig {
                start_timeout: Duration::from_millis(1),
                start_poll_interval: Duration::from_millis(5),
            }
            .validate()
            .is_err()
        );
    }

    #[rstest]
    #[case(25, CacheSize::Bounded(25), 25, false)]
    #[case(0, CacheSize::Default, 1000, false)]
    #[case(-1, CacheSize::Disabled, 1000, true)]
    #[case(-50, CacheSize::Disabled, 1000, true)]
    fn cache_size_resolution(
        #[case] raw: i32,
        #[case] expected: CacheSize,
        #[case] capacity: usize,
        #[case] disabled: bool,
    ) {
        let size = CacheSize::from(raw);
        assert_eq!(size, expected);
        assert_eq!(size.resolve(DEFAULT_MAX_POOL_SIZE), capacity);
        assert_eq!(size.is_disabled(), disabled);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn context_config_from_json() {
        let config: ContextConfig = serde_json::from_str(
            r#"{ "max_pool_size": 50, "extended_statistics": true }"#,
        )
        .unwrap();
        assert_eq!(config.max_pool_size, 50);
        assert!(config.extended_statistics);
        assert!(!config.event_notification);
        assert_eq!(config.pool, PoolConfig::default());

        let size: CacheSize = serde_json::from_str("-1").unwrap();
        assert!(size.is_disabled());
    }
}
