//! Error taxonomy for the placement path.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Validation failure kinds, reported per request field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldErrorKind {
    /// Coordinate or size outside the allowed range.
    BadNumber,
    /// Color outside the palette.
    BadColor,
}

/// One offending request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    #[serde(rename = "error")]
    pub kind: FieldErrorKind,
}

impl FieldError {
    pub fn bad_number(field: &'static str) -> Self {
        Self {
            field,
            kind: FieldErrorKind::BadNumber,
        }
    }

    pub fn bad_color(field: &'static str) -> Self {
        Self {
            field,
            kind: FieldErrorKind::BadColor,
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FieldErrorKind::BadNumber => write!(f, "{}: bad number", self.field),
            FieldErrorKind::BadColor => write!(f, "{}: bad color", self.field),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForbiddenReason {
    /// Account created at or after the cutoff.
    AccountTooNew,
    Banned,
    Suspended,
    /// Operation reserved for administrators.
    NotPrivileged,
}

impl fmt::Display for ForbiddenReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::AccountTooNew => "account created after the cutoff",
            Self::Banned => "actor is banned",
            Self::Suspended => "actor is suspended",
            Self::NotPrivileged => "administrators only",
        };
        f.write_str(text)
    }
}

fn describe_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlaceError {
    /// Every offending field is listed, never just the first.
    #[error("invalid argument: {}", describe_fields(.fields))]
    InvalidArgument { fields: Vec<FieldError> },

    #[error("forbidden: {reason}")]
    Forbidden { reason: ForbiddenReason },

    #[error("rate limited, retry in {wait_seconds:.1}s")]
    RateLimited { wait_seconds: f64 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Internal only: the cache is rebuilt and the caller never sees this.
    #[error("cache inconsistent: {0}")]
    CacheInconsistent(String),
}

impl PlaceError {
    pub fn forbidden(reason: ForbiddenReason) -> Self {
        Self::Forbidden { reason }
    }

    /// Whether the same request may succeed if resubmitted later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::StorageUnavailable(_))
    }
}
