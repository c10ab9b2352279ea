use crate::ignore_filter::{IgnoreFilter, CODESEARCH_IGNORE_FILE};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

pub const MAX_FILE_SIZE_BYTES: u64 = 1_048_576;

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_BYTES: usize = 2 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    /// Root-relative path with `/` separators; the key used in index state.
    pub rel_path: String,
    pub size: u64,
    pub mtime_ms: u64,
}

/// Scanner for finding indexable files in a project
pub struct FileScanner {
    root: PathBuf,
    filter: IgnoreFilter,
    max_file_bytes: u64,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>, max_file_bytes: u64) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            filter: IgnoreFilter::for_root(&root),
            root,
            max_file_bytes,
        }
    }

    pub fn filter(&self) -> &IgnoreFilter {
        &self.filter
    }

    /// Walk the root (ignore-rule aware, symlinks not followed) and return
    /// files sorted by relative path.
    pub fn scan(&self) -> Vec<ScannedFile> {
        let mut files = Vec::new();

        let mut builder = WalkBuilder::new(&self.root);
        builder
            .hidden(false) // hidden entries are judged by IgnoreFilter
            .parents(false)
            .ignore(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(true)
            .require_git(false)
            .follow_links(false)
            .add_custom_ignore_filename(CODESEARCH_IGNORE_FILE);
        let filter = self.filter.clone();
        builder.filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            entry.depth() == 0 || !is_dir || filter.should_descend(entry.path())
        });

        for result in builder.build() {
            let entry = match result {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Failed to read entry: {e}");
                    continue;
                }
            };
            let Some(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }

            let path = entry.path();
            if !self.filter.should_index(path) {
                continue;
            }
            let Some(rel_path) = relative_key(&self.root, path) else {
                continue;
            };

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    log::warn!("Failed to stat {}: {e}", path.display());
                    continue;
                }
            };
            if meta.len() > self.max_file_bytes {
                log::debug!(
                    "Skipping large file {} ({} bytes > {})",
                    path.display(),
                    meta.len(),
                    self.max_file_bytes
                );
                continue;
            }

            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));

            files.push(ScannedFile {
                path: path.to_path_buf(),
                rel_path,
                size: meta.len(),
                mtime_ms,
            });
        }

        files.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        log::info!("Found {} indexable files", files.len());
        files
    }
}

pub(crate) fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// NUL bytes in the leading window mark a file as binary.
pub fn is_probably_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    window.contains(&0)
}
