use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capabilities::{GenerationFailure, KvError};
use crate::config::ConfigError;
use crate::model::RecipeValidationError;
use crate::{truncate_utf8_safe, UnixTimeMs, MAX_ERROR_DETAILS_LENGTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeErrorKind {
    Network,
    Timeout,
    Generation,
    Validation,
    Unknown,
}

impl RecipeErrorKind {
    pub const ALL: [Self; 5] = [
        Self::Network,
        Self::Timeout,
        Self::Generation,
        Self::Validation,
        Self::Unknown,
    ];

    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Generation => "GENERATION_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// The one stable, non-technical message shown for this kind.
    #[must_use]
    pub const fn user_facing_message(self) -> &'static str {
        match self {
            Self::Network => {
                "Unable to connect. Please check your internet connection and try again."
            }
            Self::Timeout => "Generating your recipe took too long. Please try again.",
            Self::Generation => {
                "We couldn't create a recipe from those ingredients. Please try again."
            }
            Self::Validation => "Please check your ingredients and try again.",
            Self::Unknown => "Something went wrong. Please try again.",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Generation | Self::Unknown)
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::Network => 0,
            Self::Timeout => 1,
            Self::Generation => 2,
            Self::Validation => 3,
            Self::Unknown => 4,
        }
    }
}

impl std::fmt::Display for RecipeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// The single user-visible failure held by the generation controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeError {
    pub kind: RecipeErrorKind,
    pub message: String,
    pub details: Option<String>,
    pub timestamp: UnixTimeMs,
}

impl RecipeError {
    #[must_use]
    pub fn new(kind: RecipeErrorKind) -> Self {
        Self {
            kind,
            message: kind.user_facing_message().to_string(),
            details: None,
            timestamp: UnixTimeMs::now(),
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        let mut details = details.into();
        truncate_utf8_safe(&mut details, MAX_ERROR_DETAILS_LENGTH);
        self.details = Some(details);
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for RecipeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(details) = &self.details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RecipeError {}

impl From<GenerationFailure> for RecipeError {
    fn from(failure: GenerationFailure) -> Self {
        let kind = match &failure {
            GenerationFailure::Connectivity(_) => RecipeErrorKind::Network,
            GenerationFailure::TimedOut { .. } => RecipeErrorKind::Timeout,
            GenerationFailure::InvalidInput(_) => RecipeErrorKind::Validation,
            GenerationFailure::Unproducible(_) => RecipeErrorKind::Generation,
            GenerationFailure::Other(_) => RecipeErrorKind::Unknown,
        };
        RecipeError::new(kind).with_details(failure.to_string())
    }
}

impl From<RecipeValidationError> for RecipeError {
    fn from(e: RecipeValidationError) -> Self {
        RecipeError::new(RecipeErrorKind::Generation).with_details(e.to_string())
    }
}

/// Failures while assembling the core at startup.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_distinct_message() {
        let mut messages: Vec<_> = RecipeErrorKind::ALL
            .iter()
            .map(|k| k.user_facing_message())
            .collect();
        messages.sort_unstable();
        messages.dedup();
        assert_eq!(messages.len(), RecipeErrorKind::ALL.len());
    }

    #[test]
    fn failure_classification() {
        let cases = [
            (GenerationFailure::Connectivity("dns".into()), RecipeErrorKind::Network),
            (GenerationFailure::TimedOut { elapsed_ms: 30_000 }, RecipeErrorKind::Timeout),
            (GenerationFailure::InvalidInput("empty".into()), RecipeErrorKind::Validation),
            (GenerationFailure::Unproducible("refused".into()), RecipeErrorKind::Generation),
            (GenerationFailure::Other("500".into()), RecipeErrorKind::Unknown),
        ];
        for (failure, kind) in cases {
            let error = RecipeError::from(failure);
            assert_eq!(error.kind, kind);
            assert_eq!(error.message, kind.user_facing_message());
            assert!(error.details.is_some());
        }
    }

    #[test]
    fn details_are_bounded() {
        let error = RecipeError::new(RecipeErrorKind::Unknown).with_details("x".repeat(4096));
        assert!(error.details.unwrap().len() <= MAX_ERROR_DETAILS_LENGTH);
    }

    #[test]
    fn parse_failures_become_generation_errors() {
        let error = RecipeError::from(RecipeValidationError::NoSteps);
        assert_eq!(error.kind, RecipeErrorKind::Generation);
    }

    #[test]
    fn validation_is_not_retryable() {
        assert!(!RecipeErrorKind::Validation.is_retryable());
        assert!(RecipeErrorKind::Network.is_retryable());
    }
}
