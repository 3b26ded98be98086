use aggregate::AggregateError;
use extract::{InvokeError, StateError};
use ingest::ChunkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Invoke(#[from] InvokeError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error("batch cancelled")]
    Cancelled,
}
