use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

use crate::chunk::Chunk;
use crate::error::ChunkError;
use crate::speech::Speech;

/// Unit the size budget is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeUnit {
    Chars,
    /// Estimated tokens, ~1.3 per whitespace-separated word.
    Tokens,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub max_size: usize,
    pub overlap: usize,
    pub unit: SizeUnit,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_size: 512,
            overlap: 50,
            unit: SizeUnit::Chars,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.max_size == 0 {
            return Err(ChunkError::InvalidConfig(
                "max_size must be greater than zero".to_string(),
            ));
        }
        if self.overlap >= self.max_size {
            return Err(ChunkError::InvalidConfig(format!(
                "overlap ({}) must be smaller than max_size ({})",
                self.overlap, self.max_size
            )));
        }
        Ok(())
    }
}

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    pub fn chunk_speech(&self, speech: &Speech) -> Result<Vec<Chunk>, ChunkError> {
        self.chunk_text(speech.id(), speech.text())
    }

    /// Split `text` into ordered chunks that each fit the budget.
    ///
    /// Consecutive chunks share up to `overlap` units; `Chunk::overlap`
    /// records how many leading bytes repeat the previous chunk so that
    /// [`reassemble`] can restore the input exactly.
    pub fn chunk_text(&self, speech_id: &str, text: &str) -> Result<Vec<Chunk>, ChunkError> {
        if text.trim().is_empty() {
            return Err(ChunkError::InvalidInput {
                speech_id: speech_id.to_string(),
                reason: "speech text is empty".to_string(),
            });
        }

        if self.measure(text) <= self.config.max_size {
            return Ok(vec![Chunk::new(
                speech_id.to_string(),
                0,
                text.to_string(),
                (0, text.len()),
                0,
            )]);
        }

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut covered = 0;

        loop {
            let end = self.find_end(text, start, covered);
            chunks.push(Chunk::new(
                speech_id.to_string(),
                chunks.len(),
                text[start..end].to_string(),
                (start, end),
                covered - start,
            ));

            if end >= text.len() {
                break;
            }

            covered = end;
            start = self.overlap_start(text, start, end);
        }

        Ok(chunks)
    }

    /// Pick the end of the chunk beginning at `start`. The result always lies
    /// past `covered` (the end of the previous chunk) so every chunk
    /// contributes new text.
    fn find_end(&self, text: &str, start: usize, covered: usize) -> usize {
        let rest = &text[start..];
        if self.measure(rest) <= self.config.max_size {
            return text.len();
        }
        let floor = covered.saturating_sub(start);

        // Sentence ends first, then word boundaries, then a hard cut.
        if let Some(end) = self.greedy_end(rest, rest.split_sentence_bound_indices(), floor) {
            return start + end;
        }
        if let Some(end) = self.greedy_end(rest, rest.split_word_bound_indices(), floor) {
            return start + end;
        }
        start + self.hard_cut(rest, floor)
    }

    fn greedy_end<'a>(
        &self,
        rest: &str,
        segments: impl Iterator<Item = (usize, &'a str)>,
        floor: usize,
    ) -> Option<usize> {
        let mut best = None;
        for (idx, segment) in segments {
            let end = idx + segment.len();
            if self.measure(&rest[..end]) > self.config.max_size {
                break;
            }
            best = Some(end);
        }
        best.filter(|&end| end > floor)
    }

    fn hard_cut(&self, rest: &str, floor: usize) -> usize {
        match self.config.unit {
            SizeUnit::Chars => {
                let cut = rest
                    .char_indices()
                    .nth(self.config.max_size)
                    .map(|(idx, _)| idx)
                    .unwrap_or(rest.len());
                if cut > floor {
                    cut
                } else {
                    next_char_boundary(rest, floor)
                }
            }
            // A single word can outgrow a token budget only when the budget is
            // tiny; take words until the chunk makes progress.
            SizeUnit::Tokens => rest
                .split_word_bound_indices()
                .map(|(idx, word)| idx + word.len())
                .find(|&end| end > floor)
                .unwrap_or(rest.len()),
        }
    }

    /// Where the next chunk starts: the earliest word start inside
    /// `start..end` whose tail still fits the overlap budget. Never `start`
    /// itself, so the walk always moves forward.
    fn overlap_start(&self, text: &str, start: usize, end: usize) -> usize {
        if self.config.overlap == 0 {
            return end;
        }

        let window = &text[start..end];
        let mut next = end;
        for (idx, segment) in window.split_word_bound_indices().rev() {
            if idx == 0 {
                break;
            }
            if segment.trim().is_empty() {
                continue;
            }
            let candidate = start + idx;
            if self.measure(&text[candidate..end]) > self.config.overlap {
                break;
            }
            next = candidate;
        }
        next
    }

    fn measure(&self, text: &str) -> usize {
        match self.config.unit {
            SizeUnit::Chars => text.chars().count(),
            SizeUnit::Tokens => estimate_tokens(text),
        }
    }
}

fn estimate_tokens(text: &str) -> usize {
    let word_count = text.split_whitespace().count();
    (word_count as f64 * 1.3) as usize
}

fn next_char_boundary(text: &str, from: usize) -> usize {
    (from + 1..=text.len())
        .find(|&idx| text.is_char_boundary(idx))
        .unwrap_or(text.len())
}

/// Concatenate chunks with their overlap removed.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut ordered: Vec<&Chunk> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.ordinal);
    ordered.iter().map(|c| c.unique_text()).collect()
}
