use async_trait::async_trait;
use thiserror::Error;

/// Typed failure reported by the remote generation call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationFailure {
    #[error("connectivity lost: {0}")]
    Connectivity(String),

    #[error("generation timed out after {elapsed_ms}ms")]
    TimedOut { elapsed_ms: u64 },

    /// The service rejected the request itself.
    #[error("request rejected: {0}")]
    InvalidInput(String),

    /// The service answered but could not produce a recipe.
    #[error("could not produce a recipe: {0}")]
    Unproducible(String),

    #[error("{0}")]
    Other(String),
}

/// The remote recipe-generation call. Assumed safe to retry.
#[async_trait]
pub trait RecipeGenerator: Send + Sync {
    /// Returns the raw recipe payload; parsing happens in the controller.
    async fn generate(&self, ingredients: &[String]) -> Result<serde_json::Value, GenerationFailure>;
}
