use crate::core::ThreadSupportLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the requested thread level
pub const ENV_THREAD_LEVEL: &str = "MPIGUARD_THREAD_LEVEL";

/// Environment variable holding the wait slice in milliseconds
pub const ENV_WAIT_SLICE_MS: &str = "MPIGUARD_WAIT_SLICE_MS";

/// Environment variable toggling native frees during finalization
pub const ENV_FREE_ON_FINALIZE: &str = "MPIGUARD_FREE_ON_FINALIZE";

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Level passed to `init_thread` by `Session::init`
    pub requested_level: ThreadSupportLevel,

    /// Longest uninterrupted wait while holding the gate exclusively
    ///
    /// Below `Multiple`, blocking completions wait in slices of this length
    /// and let other threads' calls through in between.
    pub wait_slice: Duration,

    /// Free derived communicators and groups before finalizing the runtime
    pub free_on_finalize: bool,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            requested_level: ThreadSupportLevel::Multiple,
            wait_slice: Duration::from_millis(5),
            free_on_finalize: true,
        }
    }

    /// Set the requested thread level
    pub fn requested_level(mut self, level: ThreadSupportLevel) -> Self {
        self.requested_level = level;
        self
    }

    /// Set the wait slice
    pub fn wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice = slice;
        self
    }

    /// Set whether finalization frees derived handles
    pub fn free_on_finalize(mut self, free: bool) -> Self {
        self.free_on_finalize = free;
        self
    }

    /// Load from the process environment, falling back to defaults
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    ///
    /// # Examples
    ///
    /// ```
    /// use mpiguard::{SessionConfig, ThreadSupportLevel};
    ///
    /// let config = SessionConfig::from_lookup(|key| match key {
    ///     "MPIGUARD_THREAD_LEVEL" => Some("funneled".to_string()),
    ///     _ => None,
    /// })
    /// .unwrap();
    /// assert_eq!(config.requested_level, ThreadSupportLevel::Funneled);
    /// ```
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(level) = lookup(ENV_THREAD_LEVEL) {
            config.requested_level = level.parse()?;
        }

        if let Some(ms) = lookup(ENV_WAIT_SLICE_MS) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| format!("{} must be an integer, got '{}'", ENV_WAIT_SLICE_MS, ms))?;
            config.wait_slice = Duration::from_millis(ms);
        }

        if let Some(flag) = lookup(ENV_FREE_ON_FINALIZE) {
            config.free_on_finalize = match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_FREE_ON_FINALIZE, other
                    ));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.wait_slice.is_zero() {
            return Err("wait_slice must be > 0".to_string());
        }

        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.requested_level, ThreadSupportLevel::Multiple);
        assert_eq!(config.wait_slice, Duration::from_millis(5));
        assert!(config.free_on_finalize);
    }

    #[test]
    fn test_builder_pattern() {
        let config = SessionConfig::new()
            .requested_level(ThreadSupportLevel::Serialized)
            .wait_slice(Duration::from_millis(20))
            .free_on_finalize(false);

        assert_eq!(config.requested_level, ThreadSupportLevel::Serialized);
        assert_eq!(config.wait_slice, Duration::from_millis(20));
        assert!(!config.free_on_finalize);
    }

    #[test]
    fn test_from_lookup() {
        let config = SessionConfig::from_lookup(lookup(&[
            (ENV_THREAD_LEVEL, "MPI_THREAD_SERIALIZED"),
            (ENV_WAIT_SLICE_MS, "12"),
            (ENV_FREE_ON_FINALIZE, "off"),
        ]))
        .unwrap();

        assert_eq!(config.requested_level, ThreadSupportLevel::Serialized);
        assert_eq!(config.wait_slice, Duration::from_millis(12));
        assert!(!config.free_on_finalize);
    }

    #[test]
    fn test_from_lookup_empty_uses_defaults() {
        let config = SessionConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_invalid_values() {
        assert!(SessionConfig::from_lookup(lookup(&[(ENV_THREAD_LEVEL, "parallel")])).is_err());
        assert!(SessionConfig::from_lookup(lookup(&[(ENV_WAIT_SLICE_MS, "soon")])).is_err());
        assert!(SessionConfig::from_lookup(lookup(&[(ENV_WAIT_SLICE_MS, "0")])).is_err());
        assert!(SessionConfig::from_lookup(lookup(&[(ENV_FREE_ON_FINALIZE, "maybe")])).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(SessionConfig::new().validate().is_ok());
        assert!(SessionConfig::new().wait_slice(Duration::ZERO).validate().is_err());
    }
}
