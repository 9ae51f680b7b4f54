use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tunables for a playback session. Field defaults are the design
/// defaults; a JSON file or CLI flags can override any of them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PlaybackConfig {
    /// Inactivity window after which the session is ended.
    pub session_timeout_ms: u64,
    /// Deadline for a page load once navigation has started.
    pub navigation_timeout_ms: u64,
    /// How long the page controller polls for a step's target element.
    pub element_find_timeout_ms: u64,
    /// How long a tab gets to report TAB_READY after a navigation.
    pub tab_ready_timeout_ms: u64,
    pub max_action_retries: u32,
    pub max_element_find_retries: u32,
    pub max_healing_retries: u32,
    /// Heals at or above this confidence are accepted without asking.
    pub healing_confidence_high: f64,
    /// Heals between medium-high and high may consult the AI validator.
    pub healing_confidence_medium_high: f64,
    /// Heals between medium and high require user confirmation.
    pub healing_confidence_medium: f64,
    /// Base delay for transport-level message retries.
    pub transport_retry_base_ms: u64,
    pub transport_max_retries: u32,
    pub advance_delays: AdvanceDelays,
}

/// Pause between a validated action and UI teardown, so the user sees
/// confirmation before the walkthrough moves on.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AdvanceDelays {
    pub click_ms: u64,
    pub select_ms: u64,
    pub input_ms: u64,
    pub other_ms: u64,
}

impl Default for AdvanceDelays {
    fn default() -> Self {
        AdvanceDelays {
            click_ms: 60,
            select_ms: 120,
            input_ms: 150,
            other_ms: 100,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        PlaybackConfig {
            session_timeout_ms: 30 * 60 * 1000,
            navigation_timeout_ms: 30 * 1000,
            element_find_timeout_ms: 5 * 1000,
            tab_ready_timeout_ms: 10 * 1000,
            max_action_retries: 3,
            max_element_find_retries: 2,
            max_healing_retries: 1,
            healing_confidence_high: 0.85,
            healing_confidence_medium_high: 0.70,
            healing_confidence_medium: 0.60,
            transport_retry_base_ms: 500,
            transport_max_retries: 3,
            advance_delays: AdvanceDelays::default(),
        }
    }
}

impl PlaybackConfig {
    /// Loads overrides from a JSON file. Missing fields keep their
    /// defaults; a missing file is an error (the caller asked for it).
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| {
            format!("reading playback config {}", path.display())
        })?;
        serde_json::from_str(&contents).with_context(|| {
            format!("parsing playback config {}", path.display())
        })
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn navigation_timeout(&self) -> Duration {
        Duration::from_millis(self.navigation_timeout_ms)
    }

    pub fn element_find_timeout(&self) -> Duration {
        Duration::from_millis(self.element_find_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_values() {
        let config = PlaybackConfig::default();
        assert_eq!(config.session_timeout_ms, 1_800_000);
        assert_eq!(config.navigation_timeout_ms, 30_000);
        assert_eq!(config.max_action_retries, 3);
        assert_eq!(config.healing_confidence_high, 0.85);
        assert_eq!(config.advance_delays.input_ms, 150);
    }

    #[test]
    fn partial_override_keeps_defaults() {
        let config: PlaybackConfig =
            serde_json::from_str(r#"{"navigation_timeout_ms": 5000}"#)
                .unwrap();
        assert_eq!(config.navigation_timeout_ms, 5000);
        assert_eq!(config.session_timeout_ms, 1_800_000);
    }
}
