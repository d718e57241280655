//! Viewer configuration
//!
//! One configuration surface for cache bounds, concurrency limits, scroll
//! classification and prefetch windows. Configuration can be loaded from a
//! TOML file, overlaid from `FOLIO_*` environment variables, or built
//! programmatically with the `with_*` methods.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use folio_cache::CacheBound;
use folio_scheduler::{ClassifierConfig, PrefetchPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Configuration for a viewer session.
///
/// Exactly one of `max_cache_entries` and `max_cache_bytes` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ViewerConfig {
    /// Entry-count eviction bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cache_entries: Option<usize>,
    /// Byte eviction bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cache_bytes: Option<usize>,
    /// Fetch admission window
    pub max_concurrent_fetches: usize,
    /// Render admission window, independent of fetches
    pub max_concurrent_rerenders: usize,
    /// Eviction and reclaim protection radius around the current page
    pub keep_window_radius: u32,
    /// Page crossings per second that classify scrolling as fast
    pub fast_scroll_threshold: f32,
    /// Window over which page crossings are counted
    pub fast_scroll_window_ms: u64,
    /// Quiet period before scrolling counts as idle
    pub idle_debounce_ms: u64,
    /// Pages prefetched ahead of the scroll direction
    pub prefetch_ahead_count: u32,
    /// Pages prefetched behind the scroll direction
    pub prefetch_behind_count: u32,
    /// Fixed render slot pool size; unset for unpooled layouts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_slot_count: Option<usize>,
    /// Fetch attempts per page before the failure is surfaced
    pub max_fetch_attempts: u32,
    /// Delay before the first fetch retry
    pub retry_backoff_ms: u64,
    /// Cap on any single retry delay
    pub max_retry_backoff_ms: u64,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: Some(64),
            max_cache_bytes: None,
            max_concurrent_fetches: 4,
            max_concurrent_rerenders: 2,
            keep_window_radius: 2,
            fast_scroll_threshold: 10.0,
            fast_scroll_window_ms: 1000,
            idle_debounce_ms: 150,
            prefetch_ahead_count: 3,
            prefetch_behind_count: 1,
            render_slot_count: None,
            max_fetch_attempts: 3,
            retry_backoff_ms: 200,
            max_retry_backoff_ms: 5000,
        }
    }
}

const ENV_MAX_CACHE_ENTRIES: &str = "FOLIO_MAX_CACHE_ENTRIES";
const ENV_MAX_CACHE_BYTES: &str = "FOLIO_MAX_CACHE_BYTES";

impl ViewerConfig {
    /// Bound the cache by entry count.
    pub fn with_max_cache_entries(mut self, entries: usize) -> Self {
        self.max_cache_entries = Some(entries);
        self.max_cache_bytes = None;
        self
    }

    /// Bound the cache by cumulative payload bytes.
    pub fn with_max_cache_bytes(mut self, bytes: usize) -> Self {
        self.max_cache_bytes = Some(bytes);
        self.max_cache_entries = None;
        self
    }

    /// Sets the fetch concurrency limit.
    pub fn with_max_concurrent_fetches(mut self, fetches: usize) -> Self {
        self.max_concurrent_fetches = fetches;
        self
    }

    /// Sets the render concurrency limit, independent of fetches.
    pub fn with_max_concurrent_rerenders(mut self, renders: usize) -> Self {
        self.max_concurrent_rerenders = renders;
        self
    }

    /// Sets the radius protected from eviction and slot reclamation.
    pub fn with_keep_window_radius(mut self, radius: u32) -> Self {
        self.keep_window_radius = radius;
        self
    }

    /// Sets the fast-scroll threshold in pages per second.
    pub fn with_fast_scroll_threshold(mut self, threshold: f32) -> Self {
        self.fast_scroll_threshold = threshold;
        self
    }

    /// Sets the sliding window used to measure scroll velocity.
    pub fn with_fast_scroll_window_ms(mut self, window_ms: u64) -> Self {
        self.fast_scroll_window_ms = window_ms;
        self
    }

    /// Sets the quiet period before scrolling counts as idle.
    pub fn with_idle_debounce_ms(mut self, debounce_ms: u64) -> Self {
        self.idle_debounce_ms = debounce_ms;
        self
    }

    /// Sets the directional prefetch window.
    pub fn with_prefetch(mut self, ahead: u32, behind: u32) -> Self {
        self.prefetch_ahead_count = ahead;
        self.prefetch_behind_count = behind;
        self
    }

    /// Use a fixed pool of `slots` render slots (virtualized layout).
    pub fn with_render_slots(mut self, slots: usize) -> Self {
        self.render_slot_count = Some(slots);
        self
    }

    /// Sets the fetch retry limits.
    pub fn with_retry(mut self, max_attempts: u32, backoff_ms: u64, max_backoff_ms: u64) -> Self {
        self.max_fetch_attempts = max_attempts;
        self.retry_backoff_ms = backoff_ms;
        self.max_retry_backoff_ms = max_backoff_ms;
        self
    }

    /// Returns the default configuration file path for the current platform.
    ///
    /// - Linux: ~/.config/folio/viewer.toml
    /// - macOS: ~/Library/Application Support/folio/viewer.toml
    /// - Windows: %APPDATA%\folio\viewer.toml
    pub fn default_config_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("folio").join("viewer.toml"),
            None => PathBuf::from("folio").join("viewer.toml"),
        }
    }

    /// Loads configuration from environment variables, overlaid on defaults.
    ///
    /// Every key has a `FOLIO_` prefixed, upper-case variable, for example
    /// `FOLIO_MAX_CACHE_ENTRIES` or `FOLIO_IDLE_DEBOUNCE_MS`. Setting
    /// `FOLIO_MAX_CACHE_BYTES` alone switches the cache to a byte bound.
    ///
    /// # Errors
    /// Returns an error if a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let entries = env_value::<usize>(ENV_MAX_CACHE_ENTRIES)?;
        let bytes = env_value::<usize>(ENV_MAX_CACHE_BYTES)?;
        match (entries, bytes) {
            (Some(entries), Some(bytes)) => {
                config.max_cache_entries = Some(entries);
                config.max_cache_bytes = Some(bytes);
            }
            (Some(entries), None) => config = config.with_max_cache_entries(entries),
            (None, Some(bytes)) => config = config.with_max_cache_bytes(bytes),
            (None, None) => {}
        }

        overlay(&mut config.max_concurrent_fetches, "FOLIO_MAX_CONCURRENT_FETCHES")?;
        overlay(&mut config.max_concurrent_rerenders, "FOLIO_MAX_CONCURRENT_RERENDERS")?;
        overlay(&mut config.keep_window_radius, "FOLIO_KEEP_WINDOW_RADIUS")?;
        overlay(&mut config.fast_scroll_threshold, "FOLIO_FAST_SCROLL_THRESHOLD")?;
        overlay(&mut config.fast_scroll_window_ms, "FOLIO_FAST_SCROLL_WINDOW_MS")?;
        overlay(&mut config.idle_debounce_ms, "FOLIO_IDLE_DEBOUNCE_MS")?;
        overlay(&mut config.prefetch_ahead_count, "FOLIO_PREFETCH_AHEAD_COUNT")?;
        overlay(&mut config.prefetch_behind_count, "FOLIO_PREFETCH_BEHIND_COUNT")?;
        overlay(&mut config.max_fetch_attempts, "FOLIO_MAX_FETCH_ATTEMPTS")?;
        overlay(&mut config.retry_backoff_ms, "FOLIO_RETRY_BACKOFF_MS")?;
        overlay(&mut config.max_retry_backoff_ms, "FOLIO_MAX_RETRY_BACKOFF_MS")?;
        if let Some(slots) = env_value::<usize>("FOLIO_RENDER_SLOT_COUNT")? {
            config.render_slot_count = Some(slots);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every key optional):
    /// ```toml
    /// max_cache_entries = 64
    /// max_concurrent_fetches = 4
    /// keep_window_radius = 2
    /// idle_debounce_ms = 150
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    ///
    /// A document that sets only `max_cache_bytes` selects the byte bound.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let keys: toml::Table = toml::from_str(toml_str)?;
        let mut config: ViewerConfig = toml::from_str(toml_str)?;

        if keys.contains_key("max_cache_bytes") && !keys.contains_key("max_cache_entries") {
            config.max_cache_entries = None;
        }

        config.validate()?;
        Ok(config)
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Check every setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache_bound()?;

        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::invalid("max_concurrent_fetches", "must be at least 1"));
        }
        if self.max_concurrent_rerenders == 0 {
            return Err(ConfigError::invalid("max_concurrent_rerenders", "must be at least 1"));
        }
        if !self.fast_scroll_threshold.is_finite() || self.fast_scroll_threshold <= 0.0 {
            return Err(ConfigError::invalid(
                "fast_scroll_threshold",
                "must be a positive number",
            ));
        }
        if self.fast_scroll_window_ms == 0 {
            return Err(ConfigError::invalid("fast_scroll_window_ms", "must be at least 1"));
        }
        if self.idle_debounce_ms == 0 {
            return Err(ConfigError::invalid("idle_debounce_ms", "must be at least 1"));
        }
        if self.render_slot_count == Some(0) {
            return Err(ConfigError::invalid("render_slot_count", "must be at least 1"));
        }
        if self.max_fetch_attempts == 0 {
            return Err(ConfigError::invalid("max_fetch_attempts", "must be at least 1"));
        }
        if self.max_retry_backoff_ms < self.retry_backoff_ms {
            return Err(ConfigError::Conflict(
                "max_retry_backoff_ms is smaller than retry_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// The cache eviction bound.
    pub fn cache_bound(&self) -> Result<CacheBound, ConfigError> {
        match (self.max_cache_entries, self.max_cache_bytes) {
            (Some(_), Some(_)) => Err(ConfigError::Conflict(
                "max_cache_entries and max_cache_bytes are mutually exclusive".to_string(),
            )),
            (None, None) => Err(ConfigError::Conflict(
                "one of max_cache_entries or max_cache_bytes must be set".to_string(),
            )),
            (Some(0), None) => Err(ConfigError::invalid("max_cache_entries", "must be at least 1")),
            (None, Some(0)) => Err(ConfigError::invalid("max_cache_bytes", "must be at least 1")),
            (Some(entries), None) => Ok(CacheBound::Entries(entries)),
            (None, Some(bytes)) => Ok(CacheBound::Bytes(bytes)),
        }
    }

    /// Scroll classifier settings.
    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            fast_threshold: self.fast_scroll_threshold,
            window: Duration::from_millis(self.fast_scroll_window_ms),
            idle_debounce: Duration::from_millis(self.idle_debounce_ms),
        }
    }

    /// Band calculator settings.
    pub fn prefetch_policy(&self) -> PrefetchPolicy {
        PrefetchPolicy {
            ahead: self.prefetch_ahead_count,
            behind: self.prefetch_behind_count,
            keep_window: self.keep_window_radius,
        }
    }

    /// Fetch retry settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_fetch_attempts,
            base_delay: Duration::from_millis(self.retry_backoff_ms),
            max_delay: Duration::from_millis(self.max_retry_backoff_ms),
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::invalid(name, format!("cannot parse {value:?}"))),
        Err(_) => Ok(None),
    }
}

fn overlay<T: FromStr>(field: &mut T, name: &str) -> Result<(), ConfigError> {
    if let Some(value) = env_value(name)? {
        *field = value;
    }
    Ok(())
}
