use crate::error::{ChunkerError, Result};
use crate::language::Language;
use crate::types::{Chunk, ChunkBoundary, ChunkKind, LineSpan};
use std::path::Path;

/// Chunk extraction capability.
///
/// Implementations return line boundaries only; text, identity and fallback are
/// handled by [`chunk_source`] so every chunker produces chunks the same way.
pub trait Chunker: Send + Sync {
    fn chunk(&self, source: &[u8], language: Language) -> Result<Vec<ChunkBoundary>>;
}

/// Why a file ended up as a single whole-file chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// The chunker has no grammar for this language
    Unsupported,
    /// The chunker failed (parse error, invalid boundaries, ...)
    Failed(String),
    /// The chunker succeeded but found nothing to extract
    Empty,
}

/// Chunks produced for one file version
#[derive(Debug, Clone)]
pub struct ChunkedFile {
    pub chunks: Vec<Chunk>,
    pub fallback: Option<FallbackReason>,
}

/// Run `chunker` over one file and attach text and identity to every boundary.
///
/// Any chunker error or empty result yields one whole-file chunk, so a file with
/// content always produces at least one chunk. Blank files produce none.
pub fn chunk_source(chunker: &dyn Chunker, path: &str, text: &str) -> ChunkedFile {
    if text.trim().is_empty() {
        return ChunkedFile {
            chunks: Vec::new(),
            fallback: None,
        };
    }

    let language = Language::from_path(path);
    let lines: Vec<&str> = text.lines().collect();

    let attempt = chunker
        .chunk(text.as_bytes(), language)
        .and_then(|boundaries| materialize(path, &lines, boundaries));

    let fallback = match attempt {
        Ok(chunks) if !chunks.is_empty() => {
            return ChunkedFile {
                chunks,
                fallback: None,
            }
        }
        Ok(_) => FallbackReason::Empty,
        Err(err) if err.is_unsupported() => FallbackReason::Unsupported,
        Err(err) => {
            log::warn!("Chunking failed for {path}, using whole-file chunk: {err}");
            FallbackReason::Failed(err.to_string())
        }
    };

    ChunkedFile {
        chunks: vec![whole_file_chunk(path, text)],
        fallback: Some(fallback),
    }
}

/// One chunk spanning the entire file, named after the file.
#[must_use]
pub fn whole_file_chunk(path: &str, text: &str) -> Chunk {
    let line_count = text.lines().count().max(1);
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    Chunk::new(
        path,
        LineSpan::new(1, line_count),
        ChunkKind::File,
        name,
        text,
    )
}

fn materialize(path: &str, lines: &[&str], boundaries: Vec<ChunkBoundary>) -> Result<Vec<Chunk>> {
    let mut chunks: Vec<Chunk> = Vec::with_capacity(boundaries.len());
    for boundary in boundaries {
        let span = boundary.span;
        if !span.is_valid() || span.end_line > lines.len() {
            return Err(ChunkerError::InvalidBoundaries {
                start: span.start_line,
                end: span.end_line,
            });
        }
        let text = lines[span.start_line - 1..span.end_line].join("\n");
        let chunk = Chunk::new(path, span, boundary.kind, boundary.name, text);
        if chunks.iter().any(|existing| existing.id == chunk.id) {
            continue;
        }
        chunks.push(chunk);
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast_analyzer::TreeSitterChunker;
    use pretty_assertions::assert_eq;

    struct FailingChunker;

    impl Chunker for FailingChunker {
        fn chunk(&self, _source: &[u8], _language: Language) -> Result<Vec<ChunkBoundary>> {
            Err(ChunkerError::parse("boom"))
        }
    }

    struct OutOfRangeChunker;

    impl Chunker for OutOfRangeChunker {
        fn chunk(&self, _source: &[u8], _language: Language) -> Result<Vec<ChunkBoundary>> {
            Ok(vec![ChunkBoundary::new(
                LineSpan::new(1, 99),
                ChunkKind::Function,
                "ghost",
            )])
        }
    }

    #[test]
    fn structural_chunks_carry_exact_text() {
        let text = "def a():\n    return 1\n\ndef b():\n    return 2\n";
        let file = chunk_source(&TreeSitterChunker::new(), "pkg/m.py", text);
        assert_eq!(file.fallback, None);
        assert_eq!(file.chunks.len(), 2);
        assert_eq!(file.chunks[0].text, "def a():\n    return 1");
        assert_eq!(file.chunks[1].name, "b");
        assert_eq!(file.chunks[1].span, LineSpan::new(4, 5));
    }

    #[test]
    fn failure_falls_back_to_whole_file() {
        let text = "line one\nline two\n";
        let file = chunk_source(&FailingChunker, "docs/notes.py", text);
        assert_eq!(file.fallback, Some(FallbackReason::Failed("Parse error: boom".into())));
        assert_eq!(file.chunks.len(), 1);
        let chunk = &file.chunks[0];
        assert_eq!(chunk.kind, ChunkKind::File);
        assert_eq!(chunk.name, "notes.py");
        assert_eq!(chunk.span, LineSpan::new(1, 2));
        assert_eq!(chunk.text, text);
    }

    #[test]
    fn invalid_boundaries_fall_back() {
        let file = chunk_source(&OutOfRangeChunker, "a.py", "x = 1\n");
        assert!(matches!(file.fallback, Some(FallbackReason::Failed(_))));
        assert_eq!(file.chunks[0].kind, ChunkKind::File);
    }

    #[test]
    fn unsupported_and_empty_outputs_fall_back() {
        let file = chunk_source(&TreeSitterChunker::new(), "README.md", "# Title\n");
        assert_eq!(file.fallback, Some(FallbackReason::Unsupported));

        let file = chunk_source(&TreeSitterChunker::new(), "settings.py", "DEBUG = True\n");
        assert_eq!(file.fallback, Some(FallbackReason::Empty));
        assert_eq!(file.chunks[0].name, "settings.py");
    }

    #[test]
    fn blank_file_has_no_chunks() {
        let file = chunk_source(&TreeSitterChunker::new(), "empty.py", "  \n\n");
        assert!(file.chunks.is_empty());
        assert_eq!(file.fallback, None);
    }
}
