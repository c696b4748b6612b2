// SPDX-License-Identifier: CEPL-1.0
use std::time::Duration;

use ember_core::{EngineError, Origin};
use serde::Deserialize;

use crate::swapchain::DEFAULT_FRAMES_IN_FLIGHT;

/// Construction parameters; the `[render]` table of `ember.toml`.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub app_name: String,
    /// major, minor, patch
    pub app_version: [u32; 3],
    pub frames_in_flight: u32,
    pub fence_timeout_ms: u64,
    pub vsync: bool,
    pub validation: bool,
    pub scratch_arena_bytes: usize,
    pub swapchain_arena_bytes: usize,
    pub upload_arena_bytes: usize,
    pub clear_color: [f32; 4],
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            app_name: "ember".to_owned(),
            app_version: [0, 1, 0],
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            fence_timeout_ms: 2_000,
            vsync: true,
            validation: cfg!(debug_assertions),
            scratch_arena_bytes: 64 * 1024,
            swapchain_arena_bytes: 16 * 1024,
            upload_arena_bytes: 4 * 1024,
            clear_color: [0.02, 0.02, 0.04, 1.0],
        }
    }
}

impl EngineConfig {
    /// Applies `EMBER_VALIDATION` and `EMBER_FRAMES_IN_FLIGHT`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        match var("EMBER_VALIDATION").as_deref() {
            Some("1") => self.validation = true,
            Some("0") => self.validation = false,
            Some(other) => tracing::warn!("ignoring EMBER_VALIDATION={other}"),
            None => {}
        }
        if let Some(raw) = var("EMBER_FRAMES_IN_FLIGHT") {
            match raw.parse() {
                Ok(n) => self.frames_in_flight = n,
                Err(_) => tracing::warn!("ignoring EMBER_FRAMES_IN_FLIGHT={raw}"),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let bad = |msg: &str| Err(EngineError::fatal(Origin::InitializationFailed, msg));
        if self.frames_in_flight == 0 {
            return bad("frames_in_flight must be at least 1");
        }
        if self.fence_timeout_ms == 0 {
            return bad("fence_timeout_ms must be positive");
        }
        if self.scratch_arena_bytes == 0
            || self.swapchain_arena_bytes == 0
            || self.upload_arena_bytes == 0
        {
            return bad("arena sizes must be non-zero");
        }
        Ok(())
    }

    #[inline]
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.frames_in_flight, 2);
        assert_eq!(cfg.fence_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg: EngineConfig = toml::from_str("frames_in_flight = 3\nvsync = false\n").unwrap();
        assert_eq!(cfg.frames_in_flight, 3);
        assert!(!cfg.vsync);
        assert_eq!(cfg.upload_arena_bytes, 4 * 1024);
    }

    #[test]
    fn test_env_overrides() {
        let cfg = EngineConfig::default().with_overrides(|key| match key {
            "EMBER_VALIDATION" => Some("0".into()),
            "EMBER_FRAMES_IN_FLIGHT" => Some("3".into()),
            _ => None,
        });
        assert!(!cfg.validation);
        assert_eq!(cfg.frames_in_flight, 3);

        let kept = EngineConfig::default().with_overrides(|key| match key {
            "EMBER_FRAMES_IN_FLIGHT" => Some("many".into()),
            _ => None,
        });
        assert_eq!(kept.frames_in_flight, 2);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let cfg = EngineConfig {
            frames_in_flight: 0,
            ..EngineConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.origin, Origin::InitializationFailed);

        let cfg = EngineConfig {
            upload_arena_bytes: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
