//! Line-anchored text chunker.
//!
//! Splits text into overlapping chunks whose boundaries always fall on line
//! breaks, so every chunk can be cited as `path#Lstart-Lend`. Token budgets
//! are approximate: a line's cost is its whitespace-separated word count.
//!
//! Each chunk carries a SHA-256 hash of its **exact** text (no
//! normalization), used for change detection and as the embedding cache key.

use sha2::{Digest, Sha256};

/// A chunk of text anchored to 1-based, inclusive line numbers.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub start_line: i32,
    pub end_line: i32,
    pub text: String,
    /// SHA-256 hex of `text`.
    pub hash: String,
}

/// Split `text` into line-aligned chunks of roughly `tokens` tokens, with
/// consecutive chunks overlapping by roughly `overlap` tokens.
///
/// Guarantees:
/// - boundaries never split a line; `start_line` is monotonically
///   non-decreasing and every chunk holds at least one line,
/// - identical input and parameters produce byte-identical chunks,
/// - empty input produces an empty vec.
pub fn chunk_text(text: &str, tokens: usize, overlap: usize) -> Vec<TextChunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let costs: Vec<usize> = lines.iter().map(|l| l.split_whitespace().count()).collect();
    let budget = tokens.max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let mut end = start;
        let mut used = 0usize;
        while end < lines.len() {
            used += costs[end];
            end += 1;
            if used >= budget {
                break;
            }
        }

        let body = lines[start..end].join("\n");
        chunks.push(TextChunk {
            start_line: (start + 1) as i32,
            end_line: end as i32,
            hash: hash_text(&body),
            text: body,
        });

        if end >= lines.len() {
            break;
        }

        // Walk back from the boundary until ~overlap tokens are covered,
        // while keeping forward progress of at least one line.
        let mut next = end;
        let mut covered = 0usize;
        while next > start + 1 && covered < overlap {
            next -= 1;
            covered += costs[next];
        }
        start = next.max(start + 1);
    }

    chunks
}

/// SHA-256 hex digest of a text, shared by the chunker and the indexer's
/// file-level aggregate hashes.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_nothing() {
        assert!(chunk_text("", 100, 10).is_empty());
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_text("hello world", 100, 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
        assert_eq!(chunks[0].text, "hello world");
    }

    #[test]
    fn boundaries_never_split_lines() {
        let text = "one two three\nfour five six\nseven eight nine\nten eleven twelve";
        let chunks = chunk_text(text, 4, 0);
        let lines: Vec<&str> = text.lines().collect();
        for c in &chunks {
            let expected = lines[(c.start_line - 1) as usize..c.end_line as usize].join("\n");
            assert_eq!(c.text, expected);
        }
    }

    #[test]
    fn start_lines_monotonic_and_progressing() {
        let text = (0..40)
            .map(|i| format!("word{} word{} word{}", i, i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_text(&text, 6, 3);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line > pair[0].start_line);
            assert!(pair[0].start_line <= pair[0].end_line);
        }
        assert_eq!(chunks.last().unwrap().end_line as usize, 40);
    }

    #[test]
    fn consecutive_chunks_overlap() {
        let text = (0..12)
            .map(|i| format!("alpha{} beta{}", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        // 2 tokens per line, budget 6 => 3 lines per chunk, overlap 2 => 1 line back
        let chunks = chunk_text(&text, 6, 2);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line <= pair[0].end_line);
        }
    }

    #[test]
    fn zero_overlap_produces_disjoint_chunks() {
        let text = (0..9)
            .map(|i| format!("tok{} tok{} tok{}", i, i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_text(&text, 3, 0);
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start_line, pair[0].end_line + 1);
        }
    }

    #[test]
    fn overlap_larger_than_budget_still_progresses() {
        let text = (0..20)
            .map(|i| format!("w{}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_text(&text, 2, 50);
        assert!(chunks.len() >= 10);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line > pair[0].start_line);
        }
    }

    #[test]
    fn deterministic() {
        let text = "Meeting with Alice about budget\nFollow up on Thursday\nShip the report";
        let a = chunk_text(text, 5, 2);
        let b = chunk_text(text, 5, 2);
        assert_eq!(a, b);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.hash, y.hash);
        }
    }

    #[test]
    fn hash_is_of_exact_text() {
        let chunks = chunk_text("  Padded line  ", 100, 0);
        assert_eq!(chunks[0].hash, hash_text("  Padded line  "));
    }

    #[test]
    fn whitespace_only_input_is_one_chunk() {
        let chunks = chunk_text("   \n   \n   ", 10, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 3);
    }
}
