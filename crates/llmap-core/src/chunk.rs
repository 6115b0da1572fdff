//! Line-boundary source chunker.
//!
//! Splits source text that is too large for one model request into
//! [`SourceChunk`]s of at most `max_chars` characters. Splitting happens on
//! line boundaries so every chunk is a run of whole lines and a snippet's
//! line range can be mapped back to the file by adding the chunk's
//! `line_offset`.
//!
//! # Algorithm
//!
//! 1. Accumulate lines into a buffer until adding the next line would
//!    exceed `max_chars`.
//! 2. When exceeded, flush the buffer as a chunk and start a new one.
//! 3. If a single line exceeds `max_chars`, hard-split it at a char
//!    boundary; the pieces share that line's offset.
//! 4. Guarantee at least one chunk (even for empty text).
//!
//! # Example
//!
//! ```rust
//! use llmap_core::chunk::chunk_lines;
//!
//! let chunks = chunk_lines("fn a() {}\nfn b() {}\n", 10);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[1].line_offset, 1);
//! ```

/// A contiguous run of source lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChunk {
    /// Position of the chunk, contiguous from 0.
    pub index: usize,
    /// Number of file lines before the chunk's first line.
    pub line_offset: usize,
    pub text: String,
}

/// Split `text` into chunks of at most `max_chars` on line boundaries.
pub fn chunk_lines(text: &str, max_chars: usize) -> Vec<SourceChunk> {
    let max_chars = max_chars.max(1);
    if text.len() <= max_chars {
        return vec![SourceChunk {
            index: 0,
            line_offset: 0,
            text: text.to_string(),
        }];
    }

    let mut chunks: Vec<SourceChunk> = Vec::new();
    let mut buf = String::new();
    let mut buf_offset = 0usize;

    for (line_no, line) in text.split_inclusive('\n').enumerate() {
        if buf.len() + line.len() > max_chars && !buf.is_empty() {
            push(&mut chunks, std::mem::take(&mut buf), buf_offset);
        }
        if buf.is_empty() {
            buf_offset = line_no;
        }

        if line.len() > max_chars {
            let mut remaining = line;
            while !remaining.is_empty() {
                let mut split_at = snap_to_char_boundary(remaining, max_chars);
                if split_at == 0 {
                    split_at = remaining
                        .char_indices()
                        .nth(1)
                        .map(|(i, _)| i)
                        .unwrap_or(remaining.len());
                }
                push(&mut chunks, remaining[..split_at].to_string(), line_no);
                remaining = &remaining[split_at..];
            }
            continue;
        }

        buf.push_str(line);
    }

    if !buf.is_empty() {
        push(&mut chunks, buf, buf_offset);
    }

    chunks
}

fn push(chunks: &mut Vec<SourceChunk>, text: String, line_offset: usize) {
    let index = chunks.len();
    chunks.push(SourceChunk {
        index,
        line_offset,
        text,
    });
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_lines("class A {}\n", 1000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].line_offset, 0);
    }

    #[test]
    fn test_empty_text() {
        let chunks = chunk_lines("", 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "");
    }

    #[test]
    fn test_chunks_preserve_all_text_and_offsets() {
        let text = (0..40)
            .map(|i| format!("line number {}\n", i))
            .collect::<String>();
        let chunks = chunk_lines(&text, 64);
        assert!(chunks.len() > 1);
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, text);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
            let first_line = c.text.lines().next().unwrap();
            assert_eq!(first_line, format!("line number {}", c.line_offset));
        }
    }

    #[test]
    fn test_oversized_line_is_hard_split() {
        let text = format!("short\n{}\nend\n", "x".repeat(25));
        let chunks = chunk_lines(&text, 10);
        assert!(chunks.iter().all(|c| c.text.len() <= 10));
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, text);
        assert!(chunks.iter().filter(|c| c.text.starts_with('x')).all(|c| c.line_offset == 1));
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_lines(text, 7);
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, text);
    }
}
