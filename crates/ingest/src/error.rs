use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    /// The speech cannot be chunked; fatal to that speech only.
    #[error("invalid input for speech {speech_id}: {reason}")]
    InvalidInput { speech_id: String, reason: String },

    #[error("invalid chunker config: {0}")]
    InvalidConfig(String),
}
