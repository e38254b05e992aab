use crate::config::ChunkingConfig;

/// A piece of the payload with its position in the chunk sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub seq: i32,
    pub text: String,
}

/// Split a payload with the configured splitter. `seq` is contiguous from 0.
pub fn split(config: &ChunkingConfig, text: &str) -> Vec<Chunk> {
    let pieces = match config {
        ChunkingConfig::Character {
            chunk_size,
            chunk_overlap,
            separator,
            ..
        } => split_character(text, separator, *chunk_size, *chunk_overlap),
        ChunkingConfig::Recursive {
            chunk_size,
            chunk_overlap,
            separators,
            ..
        } => split_recursive(text, separators, *chunk_size, *chunk_overlap),
    };

    pieces
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .enumerate()
        .map(|(i, text)| Chunk {
            seq: i as i32,
            text,
        })
        .collect()
}

fn split_character(
    text: &str,
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let splits: Vec<&str> = if separator.is_empty() {
        vec![text]
    } else {
        text.split(separator).collect()
    };

    // Oversized pieces are hard-wrapped before merging so no chunk ever
    // exceeds chunk_size.
    let mut wrapped: Vec<String> = Vec::new();
    for piece in splits {
        if piece.chars().count() > chunk_size {
            wrapped.extend(hard_wrap(piece, chunk_size, chunk_overlap));
        } else {
            wrapped.push(piece.to_string());
        }
    }

    merge_splits(&wrapped, separator, chunk_size, chunk_overlap)
}

fn split_recursive(
    text: &str,
    separators: &[String],
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    if separators.is_empty() {
        return hard_wrap(text, chunk_size, chunk_overlap);
    }

    // First separator that occurs in the text; the last one is the fallback.
    let mut sep_index = separators.len() - 1;
    for (i, sep) in separators.iter().enumerate() {
        if sep.is_empty() || text.contains(sep.as_str()) {
            sep_index = i;
            break;
        }
    }
    let separator = &separators[sep_index];
    let rest = &separators[sep_index + 1..];

    let splits: Vec<String> = if separator.is_empty() {
        return hard_wrap(text, chunk_size, chunk_overlap);
    } else {
        text.split(separator.as_str()).map(str::to_string).collect()
    };

    let mut chunks: Vec<String> = Vec::new();
    let mut good: Vec<String> = Vec::new();
    for piece in splits {
        if piece.chars().count() <= chunk_size {
            good.push(piece);
        } else {
            if !good.is_empty() {
                chunks.extend(merge_splits(&good, separator, chunk_size, chunk_overlap));
                good.clear();
            }
            if rest.is_empty() {
                chunks.extend(hard_wrap(&piece, chunk_size, chunk_overlap));
            } else {
                chunks.extend(split_recursive(&piece, rest, chunk_size, chunk_overlap));
            }
        }
    }
    if !good.is_empty() {
        chunks.extend(merge_splits(&good, separator, chunk_size, chunk_overlap));
    }
    chunks
}

/// Fixed-size windows over an oversized piece; step shrinks by the overlap.
fn hard_wrap(piece: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chars: Vec<char> = piece.chars().collect();
    let step = chunk_size.saturating_sub(chunk_overlap).max(1);
    let mut out = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        out.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    out
}

/// Greedily pack splits into chunks no longer than chunk_size, carrying
/// up to chunk_overlap characters of trailing splits into the next chunk.
fn merge_splits(
    splits: &[String],
    separator: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<String> {
    let sep_len = separator.chars().count();
    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut total = 0usize;

    for split in splits {
        let len = split.chars().count();
        let added = len + if current.is_empty() { 0 } else { sep_len };
        if total + added > chunk_size && !current.is_empty() {
            chunks.push(current.join(separator));
            while total > chunk_overlap
                || (total + len + if current.len() > 1 { sep_len } else { 0 } > chunk_size
                    && total > 0)
            {
                let first_len = current[0].chars().count();
                total -= first_len + if current.len() > 1 { sep_len } else { 0 };
                current.remove(0);
                if current.is_empty() {
                    break;
                }
            }
        }
        total += len + if current.is_empty() { 0 } else { sep_len };
        current.push(split);
    }

    if !current.is_empty() {
        chunks.push(current.join(separator));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(chunk_size: usize, chunk_overlap: usize) -> ChunkingConfig {
        ChunkingConfig::Character {
            chunk_column: "body".to_string(),
            chunk_size,
            chunk_overlap,
            separator: "\n\n".to_string(),
        }
    }

    fn recursive(chunk_size: usize, chunk_overlap: usize) -> ChunkingConfig {
        ChunkingConfig::Recursive {
            chunk_column: "body".to_string(),
            chunk_size,
            chunk_overlap,
            separators: vec![
                "\n\n".to_string(),
                "\n".to_string(),
                " ".to_string(),
                "".to_string(),
            ],
        }
    }

    #[test]
    fn test_short_text_is_one_chunk() {
        let chunks = split(&character(800, 0), &"a".repeat(400));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[0].text.len(), 400);
    }

    #[test]
    fn test_oversized_text_wraps_at_chunk_size() {
        let chunks = split(&character(800, 0), &"a".repeat(900));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text.len(), 800);
        assert_eq!(chunks[1].text.len(), 100);

        let chunks = split(&character(800, 0), &"a".repeat(1700));
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.seq).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let chunks = split(&character(800, 0), &"a".repeat(2500));
        assert_eq!(chunks.len(), 4);
    }

    #[test]
    fn test_overlap_repeats_window_tail() {
        let text: String = ('a'..='z').cycle().take(1000).collect();
        let chunks = split(&character(800, 200), &text);
        assert_eq!(chunks.len(), 2);
        let tail: String = chunks[0].text.chars().skip(600).collect();
        let head: String = chunks[1].text.chars().take(200).collect();
        assert_eq!(tail, head);
    }

    #[test]
    fn test_separator_boundaries_respected() {
        let text = format!("{}\n\n{}", "a".repeat(300), "b".repeat(300));
        let chunks = split(&character(400, 0), &text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].text.chars().all(|c| c == 'a'));
        assert!(chunks[1].text.chars().all(|c| c == 'b'));
    }

    #[test]
    fn test_small_pieces_merge() {
        let text = format!("{}\n\n{}", "a".repeat(100), "b".repeat(100));
        let chunks = split(&character(400, 0), &text);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("\n\n"));
    }

    #[test]
    fn test_empty_payload_produces_no_chunks() {
        assert!(split(&character(800, 0), "").is_empty());
        assert!(split(&character(800, 0), "   \n\n  ").is_empty());
    }

    #[test]
    fn test_recursive_prefers_paragraphs() {
        let text = format!(
            "{}\n\n{}\n\n{}",
            "a".repeat(300),
            "b".repeat(300),
            "c".repeat(300)
        );
        let chunks = split(&recursive(700, 0), &text);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 700);
        }
    }

    #[test]
    fn test_recursive_falls_through_to_words() {
        let text = ["word"; 300].join(" ");
        let chunks = split(&recursive(100, 0), &text);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.text.chars().count() <= 100);
            assert!(!chunk.text.starts_with(' '));
        }
    }

    #[test]
    fn test_recursive_hard_wraps_unbreakable_text() {
        let chunks = split(&recursive(100, 0), &"x".repeat(250));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text.len(), 100);
        assert_eq!(chunks[2].text.len(), 50);
    }

    #[test]
    fn test_seq_is_contiguous_from_zero() {
        let text = format!("{}\n\n{}\n\n{}", "a".repeat(500), "", "b".repeat(500));
        let chunks = split(&character(400, 0), &text);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as i32);
        }
    }
}
