//! Canvas configuration, fixed at startup and passed explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::model::{BoardDims, Color};

/// Who bulk rectangle placements are attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RectAttribution {
    /// Administrative blanks with no actor.
    #[default]
    Anonymous,
    /// The privileged actor that issued the rectangle.
    Actor,
}

impl FromStr for RectAttribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "anonymous" => Ok(Self::Anonymous),
            "actor" => Ok(Self::Actor),
            other => Err(ConfigError::UnknownAttribution(other.to_string())),
        }
    }
}

impl fmt::Display for RectAttribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::Actor => f.write_str("actor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("board dimensions must be non-zero, got {0}")]
    EmptyBoard(BoardDims),

    #[error("color bit depth must be between 1 and 4, got {0}")]
    BitDepth(u8),

    #[error("admin rectangle size must be at least 1")]
    RectSize,

    #[error("unknown rectangle attribution '{0}' (expected 'anonymous' or 'actor')")]
    UnknownAttribution(String),
}

/// 2017-04-01T00:00:00Z
const ACCOUNT_AGE_CUTOFF_SECS: i64 = 1_491_004_800;

/// Canvas configuration.
#[derive(Debug, Clone)]
pub struct PlaceConfig {
    pub board_width: u32,
    pub board_height: u32,
    /// Bits per cell. The snapshot codec packs nibbles, so at most 4.
    pub color_bit_depth: u8,
    /// Minimum time between two placements by the same actor.
    pub cooldown_duration: Duration,
    /// Waits at or below this are forgiven to absorb clock and network skew.
    pub cooldown_grace: Duration,
    /// Largest width or height an admin rectangle may request.
    pub admin_rect_max_size: u32,
    /// Accounts created at or after this instant may not place.
    pub account_age_cutoff: DateTime<Utc>,
    /// How long an encoded snapshot is served before it is re-materialized.
    pub snapshot_max_age: Duration,
    /// Extra attempts for a failed durable append.
    pub write_retries: u32,
    pub retry_backoff: Duration,
    pub rect_attribution: RectAttribution,
    /// Broadcast namespace for placement events.
    pub namespace: String,
}

impl Default for PlaceConfig {
    fn default() -> Self {
        Self {
            board_width: 1000,
            board_height: 1000,
            color_bit_depth: 4,
            cooldown_duration: Duration::from_secs(120),
            cooldown_grace: Duration::from_secs(2),
            admin_rect_max_size: 100,
            account_age_cutoff: DateTime::from_timestamp(ACCOUNT_AGE_CUTOFF_SECS, 0).unwrap_or_default(),
            snapshot_max_age: Duration::from_secs(1),
            write_retries: 2,
            retry_backoff: Duration::from_millis(50),
            rect_attribution: RectAttribution::Anonymous,
            namespace: "/place".to_string(),
        }
    }
}

impl PlaceConfig {
    /// Small board, short cooldown, no retry backoff.
    pub fn for_testing() -> Self {
        Self {
            board_width: 16,
            board_height: 16,
            cooldown_duration: Duration::from_secs(10),
            admin_rect_max_size: 8,
            snapshot_max_age: Duration::from_millis(100),
            retry_backoff: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn dims(&self) -> BoardDims {
        BoardDims::new(self.board_width, self.board_height)
    }

    /// Highest valid palette index for the configured bit depth.
    pub fn max_color(&self) -> Color {
        ((1u16 << self.color_bit_depth) - 1) as Color
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.board_width == 0 || self.board_height == 0 {
            return Err(ConfigError::EmptyBoard(self.dims()));
        }
        if !(1..=4).contains(&self.color_bit_depth) {
            return Err(ConfigError::BitDepth(self.color_bit_depth));
        }
        if self.admin_rect_max_size == 0 {
            return Err(ConfigError::RectSize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = PlaceConfig::default();
        assert_eq!(config.dims(), BoardDims::new(1000, 1000));
        assert_eq!(config.max_color(), 15);
        assert_eq!(config.cooldown_duration, Duration::from_secs(120));
        assert_eq!(config.cooldown_grace, Duration::from_secs(2));
        assert_eq!(config.namespace, "/place");
        assert_eq!(config.account_age_cutoff.to_rfc3339(), "2017-04-01T00:00:00+00:00");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_for_testing_is_valid() {
        let config = PlaceConfig::for_testing();
        assert_eq!(config.dims(), BoardDims::new(16, 16));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_max_color_follows_bit_depth() {
        let config = PlaceConfig {
            color_bit_depth: 3,
            ..PlaceConfig::default()
        };
        assert_eq!(config.max_color(), 7);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty = PlaceConfig {
            board_width: 0,
            ..PlaceConfig::default()
        };
        assert!(matches!(empty.validate(), Err(ConfigError::EmptyBoard(_))));

        let deep = PlaceConfig {
            color_bit_depth: 8,
            ..PlaceConfig::default()
        };
        assert_eq!(deep.validate(), Err(ConfigError::BitDepth(8)));

        let no_rect = PlaceConfig {
            admin_rect_max_size: 0,
            ..PlaceConfig::default()
        };
        assert_eq!(no_rect.validate(), Err(ConfigError::RectSize));
    }

    #[test]
    fn test_rect_attribution_parse() {
        assert_eq!("actor".parse::<RectAttribution>().unwrap(), RectAttribution::Actor);
        assert_eq!(
            "anonymous".parse::<RectAttribution>().unwrap(),
            RectAttribution::Anonymous
        );
        assert!("admin".parse::<RectAttribution>().is_err());
        assert_eq!(RectAttribution::Actor.to_string(), "actor");
    }
}
