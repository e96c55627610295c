use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImagePipelineError {
    #[error("image not found: {uri}")]
    NotFound { uri: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("io error: {0}")]
    Io(String),
}

/// The platform's image loader. It owns the disk tier.
#[async_trait]
pub trait ImagePipeline: Send + Sync {
    /// Returns the encoded bytes, from the platform disk cache or the network.
    async fn load(&self, uri: &str) -> Result<Bytes, ImagePipelineError>;

    /// Warms the disk tier for a batch of URIs.
    async fn prefetch(&self, uris: &[String]) -> Result<(), ImagePipelineError>;

    async fn evict_disk(&self) -> Result<(), ImagePipelineError>;

    /// Drops any decoded bitmaps the platform keeps on its side.
    async fn evict_memory(&self) -> Result<(), ImagePipelineError> {
        Ok(())
    }
}
