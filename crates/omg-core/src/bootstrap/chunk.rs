//! Reads labeled source text and splits it into character-budgeted chunks
//! (spec §4.7 stages 1-2).

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub label: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
}

/// Default token budget per chunk (6000 tokens at 4 chars/token).
pub const DEFAULT_TOKEN_BUDGET: u64 = 6_000;

pub fn char_budget_from_tokens(token_budget: u64) -> usize {
    (token_budget * 4) as usize
}

/// Drops empty/whitespace-only entries, sorts by label, then splits each
/// surviving entry's trimmed text on a fixed character budget.
pub fn chunk_sources(entries: &[SourceEntry], char_budget: usize) -> Vec<Chunk> {
    let mut sorted: Vec<&SourceEntry> = entries
        .iter()
        .filter(|e| !e.text.trim().is_empty())
        .collect();
    sorted.sort_by(|a, b| a.label.cmp(&b.label));

    let mut chunks = Vec::new();
    for entry in sorted {
        let trimmed = entry.text.trim();
        let char_indices: Vec<usize> = trimmed.char_indices().map(|(i, _)| i).collect();
        let mut chunk_index = 0;
        let mut start = 0;
        while start < char_indices.len() {
            let end = (start + char_budget).min(char_indices.len());
            let byte_start = char_indices[start];
            let byte_end = char_indices.get(end).copied().unwrap_or(trimmed.len());
            chunks.push(Chunk {
                source: entry.label.clone(),
                chunk_index,
                text: trimmed[byte_start..byte_end].to_string(),
            });
            chunk_index += 1;
            start = end;
        }
    }
    chunks
}
