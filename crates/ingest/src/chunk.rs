use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub speech_id: String,
    pub chunk_id: String,
    pub ordinal: usize,
    pub text: String,
    pub offset: (usize, usize), // [start, end) byte positions in the speech text
    /// Leading bytes of `text` that repeat the tail of the previous chunk.
    pub overlap: usize,
}

impl Chunk {
    pub fn new(
        speech_id: String,
        ordinal: usize,
        text: String,
        offset: (usize, usize),
        overlap: usize,
    ) -> Self {
        let chunk_id = Self::generate_chunk_id(&speech_id, &text, offset);

        Self {
            speech_id,
            chunk_id,
            ordinal,
            text,
            offset,
            overlap,
        }
    }

    fn generate_chunk_id(speech_id: &str, text: &str, offset: (usize, usize)) -> String {
        let mut hasher = Sha256::new();
        hasher.update(speech_id.as_bytes());
        hasher.update(text.as_bytes());
        hasher.update(offset.0.to_string().as_bytes());
        hasher.update(offset.1.to_string().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
    }

    /// The part of the chunk not already covered by its predecessor.
    pub fn unique_text(&self) -> &str {
        &self.text[self.overlap..]
    }

    /// Character length of `unique_text`, used to weigh chunks against each
    /// other without counting overlap twice.
    pub fn unique_len(&self) -> usize {
        self.unique_text().chars().count()
    }

    /// Estimate token count (rough: 1.3 tokens per word)
    pub fn estimated_tokens(&self) -> usize {
        let word_count = self.text.split_whitespace().count();
        (word_count as f64 * 1.3) as usize
    }
}
