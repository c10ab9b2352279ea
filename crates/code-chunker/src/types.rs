use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Structural role of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Free function (methods stay inside their class chunk)
    Function,
    /// Class-like container (class, struct, enum, trait, impl, interface)
    Class,
    /// Whole-file fallback
    File,
}

impl ChunkKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::File => "file",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive, 1-indexed line range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LineSpan {
    pub start_line: usize,
    pub end_line: usize,
}

impl LineSpan {
    #[must_use]
    pub const fn new(start_line: usize, end_line: usize) -> Self {
        Self {
            start_line,
            end_line,
        }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.start_line >= 1 && self.start_line <= self.end_line
    }

    #[must_use]
    pub const fn line_count(&self) -> usize {
        self.end_line.saturating_sub(self.start_line) + 1
    }

    /// True when `other` lies entirely inside this span.
    #[must_use]
    pub const fn contains(&self, other: &LineSpan) -> bool {
        other.start_line >= self.start_line && other.end_line <= self.end_line
    }
}

/// Boundary produced by a [`crate::Chunker`] before text is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBoundary {
    pub span: LineSpan,
    pub kind: ChunkKind,
    pub name: String,
}

impl ChunkBoundary {
    pub fn new(span: LineSpan, kind: ChunkKind, name: impl Into<String>) -> Self {
        Self {
            span,
            kind,
            name: name.into(),
        }
    }
}

/// A contiguous region of a source file, immutable for a given file version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Content-addressed identity, see [`chunk_id`]
    pub id: String,

    /// Path relative to the project root, `/`-separated
    pub path: String,

    pub span: LineSpan,
    pub kind: ChunkKind,
    pub name: String,
    pub text: String,
}

impl Chunk {
    /// Build a chunk and derive its id from path, span and text.
    pub fn new(
        path: impl Into<String>,
        span: LineSpan,
        kind: ChunkKind,
        name: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let text = text.into();
        Self {
            id: chunk_id(&path, span, &text),
            path,
            span,
            kind,
            name: name.into(),
            text,
        }
    }

    #[must_use]
    pub const fn start_line(&self) -> usize {
        self.span.start_line
    }

    #[must_use]
    pub const fn end_line(&self) -> usize {
        self.span.end_line
    }
}

/// Hex SHA-256 of raw bytes.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Chunk identity: first 32 hex chars of SHA-256 over `(path, span, contentHash)`.
#[must_use]
pub fn chunk_id(path: &str, span: LineSpan, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update((span.start_line as u64).to_le_bytes());
    hasher.update((span.end_line as u64).to_le_bytes());
    hasher.update(content_hash(text.as_bytes()).as_bytes());
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(32);
    hex
}
