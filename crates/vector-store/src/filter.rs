use crate::error::{Result, VectorStoreError};
use crate::types::RecordMetadata;
use codesearch_chunker::ChunkKind;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};

/// Equality filter over record metadata. All present conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_glob: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChunkKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MetadataFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.path.is_none()
            && self.path_prefix.is_none()
            && self.path_glob.is_none()
            && self.kind.is_none()
            && self.name.is_none()
    }

    /// Validate and prepare the filter for repeated matching.
    pub fn compile(&self) -> Result<CompiledFilter> {
        let glob = match self.path_glob.as_deref() {
            Some(pattern) => Some(
                Glob::new(pattern)
                    .map_err(|e| VectorStoreError::InvalidFilter(format!("path_glob: {e}")))?
                    .compile_matcher(),
            ),
            None => None,
        };
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(VectorStoreError::InvalidFilter(
                    "name must not be empty".to_string(),
                ));
            }
        }
        Ok(CompiledFilter {
            filter: self.clone(),
            glob,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledFilter {
    filter: MetadataFilter,
    glob: Option<GlobMatcher>,
}

impl CompiledFilter {
    #[must_use]
    pub fn matches(&self, meta: &RecordMetadata) -> bool {
        let f = &self.filter;
        if f.path.as_deref().is_some_and(|p| p != meta.path) {
            return false;
        }
        if f
            .path_prefix
            .as_deref()
            .is_some_and(|prefix| !meta.path.starts_with(prefix))
        {
            return false;
        }
        if f.kind.is_some_and(|kind| kind != meta.kind) {
            return false;
        }
        if f.name.as_deref().is_some_and(|name| name != meta.name) {
            return false;
        }
        if let Some(glob) = &self.glob {
            if !glob.is_match(&meta.path) {
                return false;
            }
        }
        true
    }
}
