// Segmenter
// Plans ordered, overlapping character windows over a document
//
// Chunk i covers [cursor, min(cursor + chunk_size, len)); the next cursor is
// end - overlap_size. When section hints are supplied, a window end may be
// pulled back onto the nearest preceding hint that lies within overlap_size of
// the size-based end, so sections are not split mid-way.

use crate::models::{ChunkSpec, Document};

use super::errors::ConfigurationError;

/// Validate chunking parameters.
pub fn validate_chunking(chunk_size: usize, overlap_size: usize) -> Result<(), ConfigurationError> {
    if chunk_size == 0 {
        return Err(ConfigurationError::ZeroChunkSize);
    }
    if overlap_size == 0 {
        return Err(ConfigurationError::ZeroOverlap);
    }
    if chunk_size <= overlap_size {
        return Err(ConfigurationError::OverlapNotSmallerThanChunk {
            chunk_size,
            overlap_size,
        });
    }
    Ok(())
}

/// Plan chunks over a document of `len` characters.
///
/// `structure_hints` must be character offsets; they are treated as advisory
/// and never break coverage or ordering.
pub fn plan(
    len: usize,
    chunk_size: usize,
    overlap_size: usize,
    structure_hints: Option<&[usize]>,
) -> Result<Vec<ChunkSpec>, ConfigurationError> {
    validate_chunking(chunk_size, overlap_size)?;

    let mut chunks = Vec::new();
    if len == 0 {
        return Ok(chunks);
    }

    let hints: Vec<usize> = match structure_hints {
        Some(h) => {
            let mut h: Vec<usize> = h.iter().copied().filter(|&o| o > 0 && o < len).collect();
            h.sort_unstable();
            h.dedup();
            h
        }
        None => Vec::new(),
    };

    let mut cursor = 0usize;
    let mut prev_end = 0usize;
    loop {
        let size_end = (cursor + chunk_size).min(len);
        let end = if size_end < len {
            snap_to_hint(&hints, cursor, size_end, overlap_size)
        } else {
            size_end
        };

        chunks.push(ChunkSpec {
            index: chunks.len(),
            start: cursor,
            end,
            overlap_with_prev: if chunks.is_empty() { 0 } else { prev_end - cursor },
        });

        if end == len {
            break;
        }
        prev_end = end;
        cursor = end - overlap_size;
    }

    Ok(chunks)
}

/// Plan chunks for a [`Document`], using its section hints when enabled.
pub fn plan_document(
    document: &Document,
    chunk_size: usize,
    overlap_size: usize,
    use_hints: bool,
) -> Result<Vec<ChunkSpec>, ConfigurationError> {
    let hints = if use_hints { document.section_hints() } else { None };
    plan(document.char_len(), chunk_size, overlap_size, hints)
}

/// Largest hint h with `size_end - overlap < h <= size_end` and
/// `h > cursor + overlap` (so the next window still starts after `cursor`).
fn snap_to_hint(hints: &[usize], cursor: usize, size_end: usize, overlap_size: usize) -> usize {
    let window_floor = size_end.saturating_sub(overlap_size).max(cursor + overlap_size);
    // First hint strictly greater than size_end; the candidate sits just before it.
    let idx = hints.partition_point(|&h| h <= size_end);
    match idx.checked_sub(1).map(|i| hints[i]) {
        Some(h) if h > window_floor => h,
        _ => size_end,
    }
}
