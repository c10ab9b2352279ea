use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Component, Path, PathBuf};

pub const CODESEARCH_IGNORE_FILE: &str = ".codesearchignore";
pub const GITIGNORE_FILE: &str = ".gitignore";

/// Directory names never indexed, at any depth.
const IGNORED_SCOPES: &[&str] = &[
    ".codesearch",
    ".git",
    ".hg",
    ".svn",
    ".venv",
    "venv",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".tox",
    "node_modules",
    "target",
    "dist",
    "build",
    ".next",
    ".idea",
    ".vscode",
    "coverage",
];

const NOISE_FILE_NAMES: &[&str] = &[
    ".env",
    ".ds_store",
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "bun.lockb",
    "cargo.lock",
    "poetry.lock",
    "pipfile.lock",
    "composer.lock",
    "gemfile.lock",
    "go.sum",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "pyc", "pyo", "pyd", "so", "dylib", "dll", "exe", "o", "a", "class", "jar", "war", "wasm",
    "bin", "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "pdf", "zip", "gz", "tgz", "bz2",
    "xz", "7z", "rar", "tar", "woff", "woff2", "ttf", "otf", "eot", "mp3", "mp4", "mov", "wav",
    "sqlite", "db",
];

/// Decides which paths under a project root are indexable.
///
/// Combines built-in scopes (VCS metadata, virtualenvs, build output, the
/// index's own state directory) with the root `.gitignore` and
/// `.codesearchignore` rules. Nested ignore files are honored by the
/// scanner's walker; this filter only carries root-level rules, which is what
/// the watcher needs to classify single events.
#[derive(Clone)]
pub struct IgnoreFilter {
    root: PathBuf,
    rules: Option<Gitignore>,
}

impl std::fmt::Debug for IgnoreFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IgnoreFilter")
            .field("root", &self.root)
            .field("rules", &self.rules.as_ref().map(Gitignore::num_ignores))
            .finish()
    }
}

impl IgnoreFilter {
    /// Load project rules from `root`. Unreadable or malformed ignore files
    /// are logged and skipped.
    pub fn for_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let mut builder = GitignoreBuilder::new(&root);
        let mut any = false;
        for name in [GITIGNORE_FILE, CODESEARCH_IGNORE_FILE] {
            let path = root.join(name);
            if !path.is_file() {
                continue;
            }
            if let Some(err) = builder.add(&path) {
                log::warn!("Ignoring malformed rules in {}: {err}", path.display());
            }
            any = true;
        }

        let rules = if any {
            match builder.build() {
                Ok(rules) => Some(rules),
                Err(err) => {
                    log::warn!("Failed to build ignore rules for {}: {err}", root.display());
                    None
                }
            }
        } else {
            None
        };

        Self { root, rules }
    }

    /// Filter with built-in scopes only.
    pub fn defaults(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            rules: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute under the root, or root-relative) names a
    /// file that should be indexed. Paths outside the root never are.
    pub fn should_index(&self, path: &Path) -> bool {
        let Some(rel) = self.relative(path) else {
            return false;
        };
        let Some(file_name) = rel.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        if let Some(parent) = rel.parent() {
            if has_ignored_component(parent) {
                return false;
            }
        }
        if is_ignored_scope_name(file_name) || is_noise_file(file_name) {
            return false;
        }
        if file_name.starts_with('.') {
            return false;
        }
        if has_binary_extension(file_name) {
            return false;
        }

        !self.matches_rules(&rel, false)
    }

    /// Whether a directory should be walked into.
    pub fn should_descend(&self, dir: &Path) -> bool {
        let Some(rel) = self.relative(dir) else {
            return false;
        };
        if rel.as_os_str().is_empty() {
            return true;
        }
        if has_ignored_component(&rel) {
            return false;
        }
        !self.matches_rules(&rel, true)
    }

    /// Whether a change to `path` means the rules must be reloaded.
    pub fn is_rules_file(&self, path: &Path) -> bool {
        self.relative(path).is_some_and(|rel| {
            rel == Path::new(GITIGNORE_FILE) || rel == Path::new(CODESEARCH_IGNORE_FILE)
        })
    }

    fn matches_rules(&self, rel: &Path, is_dir: bool) -> bool {
        self.rules
            .as_ref()
            .is_some_and(|rules| rules.matched_path_or_any_parents(rel, is_dir).is_ignore())
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?
        } else {
            path
        };

        let mut clean = PathBuf::new();
        for component in rel.components() {
            match component {
                Component::Normal(part) => clean.push(part),
                Component::CurDir => {}
                // `..`, roots and prefixes would escape the project
                _ => return None,
            }
        }
        Some(clean)
    }
}

fn has_ignored_component(rel: &Path) -> bool {
    rel.components().any(|component| match component {
        Component::Normal(name) => {
            let name = name.to_string_lossy();
            is_ignored_scope_name(&name) || name.starts_with('.')
        }
        _ => false,
    })
}

fn is_ignored_scope_name(name: &str) -> bool {
    let lowered = name.to_lowercase();
    IGNORED_SCOPES.iter().any(|ignored| *ignored == lowered)
}

fn is_noise_file(name: &str) -> bool {
    NOISE_FILE_NAMES
        .iter()
        .any(|candidate| name.eq_ignore_ascii_case(candidate))
}

fn has_binary_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            BINARY_EXTENSIONS
                .iter()
                .any(|candidate| ext.eq_ignore_ascii_case(candidate))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_scopes_are_excluded() {
        let filter = IgnoreFilter::defaults("/project");
        assert!(filter.should_index(Path::new("src/app.py")));
        assert!(filter.should_index(Path::new("/project/src/app.py")));

        assert!(!filter.should_index(Path::new("venv/lib/site.py")));
        assert!(!filter.should_index(Path::new("pkg/__pycache__/mod.py")));
        assert!(!filter.should_index(Path::new(".git/config")));
        assert!(!filter.should_index(Path::new(".codesearch/state.json")));
        assert!(!filter.should_index(Path::new("node_modules/x/index.js")));
        assert!(!filter.should_index(Path::new("app/mod.pyc")));
        assert!(!filter.should_index(Path::new(".env")));
        assert!(!filter.should_index(Path::new("Cargo.lock")));
    }

    #[test]
    fn paths_outside_root_are_rejected() {
        let filter = IgnoreFilter::defaults("/project");
        assert!(!filter.should_index(Path::new("/elsewhere/app.py")));
        assert!(!filter.should_index(Path::new("../app.py")));
        assert!(!filter.should_index(Path::new("")));
    }

    #[test]
    fn project_rules_apply_to_files_and_dirs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "generated/\n*.log\n").unwrap();
        std::fs::write(dir.path().join(".codesearchignore"), "fixtures/big_*.py\n").unwrap();

        let filter = IgnoreFilter::for_root(dir.path());
        assert!(filter.should_index(Path::new("src/main.py")));
        assert!(!filter.should_index(Path::new("debug.log")));
        assert!(!filter.should_index(Path::new("generated/api.py")));
        assert!(!filter.should_descend(Path::new("generated")));
        assert!(!filter.should_index(Path::new("fixtures/big_table.py")));
        assert!(filter.should_index(Path::new("fixtures/small.py")));
    }

    #[test]
    fn recognizes_rules_files() {
        let filter = IgnoreFilter::defaults("/project");
        assert!(filter.is_rules_file(Path::new("/project/.gitignore")));
        assert!(filter.is_rules_file(Path::new(".codesearchignore")));
        assert!(!filter.is_rules_file(Path::new("sub/.gitignore")));
    }
}
