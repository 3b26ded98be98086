pub mod chunk;
pub mod chunker;
pub mod error;
pub mod speech;

pub use chunk::Chunk;
pub use chunker::{Chunker, ChunkerConfig, SizeUnit, reassemble};
pub use error::ChunkError;
pub use speech::Speech;
