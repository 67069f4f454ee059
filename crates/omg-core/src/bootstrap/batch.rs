//! Packs chunks into character-budgeted batches (spec §4.7 stage 3).

use super::chunk::Chunk;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub index: usize,
    pub chunks: Vec<Chunk>,
}

impl Batch {
    pub fn total_chars(&self) -> usize {
        self.chunks.iter().map(|c| c.text.len()).sum()
    }
}

/// Greedily packs chunks into batches up to `char_budget`. A single chunk
/// larger than the budget passes through alone in its own batch.
pub fn batch_chunks(chunks: Vec<Chunk>, char_budget: usize) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut current_chars = 0usize;

    for chunk in chunks {
        let chunk_len = chunk.text.len();
        if !current.is_empty() && current_chars + chunk_len > char_budget {
            batches.push(Batch {
                index: batches.len(),
                chunks: std::mem::take(&mut current),
            });
            current_chars = 0;
        }
        current_chars += chunk_len;
        current.push(chunk);
    }

    if !current.is_empty() {
        batches.push(Batch {
            index: batches.len(),
            chunks: current,
        });
    }

    batches
}
