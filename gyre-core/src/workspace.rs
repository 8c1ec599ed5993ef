//! Workspace Backend
//!
//! File access for tools, scoped to a workspace root. Paths are
//! workspace-relative; backends enforce escape protection. The local
//! filesystem implementation lives here; remote backends implement the
//! same trait elsewhere.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `list_files` returns at most this many entries.
pub const LIST_FILES_MAX_RESULTS: usize = 500;

/// Dependency/cache roots reported as a single summary entry instead of
/// being walked, unless the listing base is inside them.
pub const HEAVY_DIRS: &[&str] = &[
    "node_modules",
    "target",
    ".git",
    ".venv",
    "venv",
    "__pycache__",
    "dist",
    "build",
    ".cache",
];

/// Metadata for a workspace path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub is_file: bool,
    pub is_dir: bool,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

/// Storage operations the workspace tools consume. Implementations are
/// stateless across calls.
#[async_trait]
pub trait WorkspaceBackend: Send + Sync {
    /// Relative paths under `base` matching `glob`, sorted, capped at
    /// [`LIST_FILES_MAX_RESULTS`]. Heavy dependency roots appear as a
    /// single `dir/` entry unless `base` points inside them.
    async fn list_files(&self, base: &str, glob: &str) -> Result<Vec<String>>;

    async fn read_text(&self, path: &str) -> Result<String>;

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>>;

    /// Returns the number of bytes written.
    async fn write_text(&self, path: &str, content: &str, append: bool) -> Result<u64>;

    async fn file_info(&self, path: &str) -> Result<Option<FileInfo>>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn is_file(&self, path: &str) -> Result<bool>;

    async fn mkdir(&self, path: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Glob matching
// ---------------------------------------------------------------------------

/// Match a posix-style relative path against a glob supporting `**`.
pub fn glob_match(path: &str, pattern: &str) -> bool {
    let mut regex = String::from("^");
    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if pattern[i..].starts_with("**/") {
            regex.push_str("(?:.+/)?");
            i += 3;
        } else if pattern[i..].starts_with("**") {
            regex.push_str(".*");
            i += 2;
        } else if bytes[i] == b'*' {
            regex.push_str("[^/]*");
            i += 1;
        } else if bytes[i] == b'?' {
            regex.push_str("[^/]");
            i += 1;
        } else {
            let ch = pattern[i..].chars().next().unwrap();
            regex.push_str(&regex::escape(&ch.to_string()));
            i += ch.len_utf8();
        }
    }
    regex.push('$');
    regex::Regex::new(&regex).map(|re| re.is_match(path)).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Local backend
// ---------------------------------------------------------------------------

/// Workspace backend over a local directory.
#[derive(Debug, Clone)]
pub struct LocalWorkspaceBackend {
    root: PathBuf,
}

impl LocalWorkspaceBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path, rejecting escapes. The check is
    /// lexical so it also covers paths that do not exist yet.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let mut depth: i32 = 0;
        let mut cleaned = PathBuf::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => {
                    depth += 1;
                    cleaned.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        bail!("Path escapes workspace: {path}");
                    }
                    cleaned.pop();
                }
                Component::RootDir | Component::Prefix(_) => {
                    bail!("Path escapes workspace: {path}");
                }
            }
        }
        Ok(self.root.join(cleaned))
    }

    fn relative(&self, target: &Path) -> String {
        target
            .strip_prefix(&self.root)
            .unwrap_or(target)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

fn is_heavy_dir(name: &str) -> bool {
    HEAVY_DIRS.contains(&name)
}

/// Recursive walk collecting relative file paths; heavy roots become a
/// single `dir/` summary entry.
fn walk_collect(
    base: &Path,
    dir: &Path,
    summarize_heavy: bool,
    out: &mut Vec<(String, bool)>,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name().to_string_lossy().to_lowercase());

    for entry in entries {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        if file_type.is_symlink() {
            continue;
        }
        let rel = path
            .strip_prefix(base)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        if file_type.is_dir() {
            let name = entry.file_name().to_string_lossy().to_string();
            if summarize_heavy && is_heavy_dir(&name) {
                out.push((format!("{rel}/"), true));
                continue;
            }
            walk_collect(base, &path, summarize_heavy, out)?;
        } else {
            out.push((rel, false));
        }
    }
    Ok(())
}

#[async_trait]
impl WorkspaceBackend for LocalWorkspaceBackend {
    async fn list_files(&self, base: &str, glob: &str) -> Result<Vec<String>> {
        let root = self.resolve(base)?;
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        // A base that is itself a dependency root is listed in full.
        let base_inside_heavy = Path::new(base)
            .components()
            .any(|c| matches!(c, Component::Normal(part) if is_heavy_dir(&part.to_string_lossy())));

        let pattern = if glob.is_empty() { "**/*" } else { glob }.to_string();
        let walk_root = root.clone();
        let entries = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            let _ = walk_collect(&walk_root, &walk_root, !base_inside_heavy, &mut out);
            out
        })
        .await
        .context("list_files walk failed")?;

        let mut files: Vec<String> = entries
            .into_iter()
            .filter(|(rel, is_summary)| *is_summary || glob_match(rel, &pattern))
            .map(|(rel, _)| rel)
            .collect();
        files.sort();
        files.truncate(LIST_FILES_MAX_RESULTS);
        Ok(files)
    }

    async fn read_text(&self, path: &str) -> Result<String> {
        let target = self.resolve(path)?;
        tokio::fs::read_to_string(&target)
            .await
            .with_context(|| format!("failed to read {path}"))
    }

    async fn read_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .with_context(|| format!("failed to read {path}"))
    }

    async fn write_text(&self, path: &str, content: &str, append: bool) -> Result<u64> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await?;
            file.write_all(content.as_bytes()).await?;
        } else {
            tokio::fs::write(&target, content).await?;
        }
        Ok(content.len() as u64)
    }

    async fn file_info(&self, path: &str) -> Result<Option<FileInfo>> {
        let target = self.resolve(path)?;
        let metadata = match tokio::fs::metadata(&target).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let modified_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let suffix = target
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()));
        Ok(Some(FileInfo {
            path: self.relative(&target),
            is_file: metadata.is_file(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified_at,
            suffix: if metadata.is_file() { suffix } else { None },
        }))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::metadata(&target).await.is_ok())
    }

    async fn is_file(&self, path: &str) -> Result<bool> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::metadata(&target)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalWorkspaceBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalWorkspaceBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("src/lib.rs", "**/*.rs"));
        assert!(glob_match("lib.rs", "**/*.rs"));
        assert!(glob_match("a/b/c.txt", "a/**"));
        assert!(!glob_match("src/lib.rs", "*.rs"));
        assert!(glob_match("notes.md", "notes.?d"));
    }

    #[test]
    fn resolve_rejects_escapes() {
        let (_dir, backend) = backend();
        assert!(backend.resolve("../outside.txt").is_err());
        assert!(backend.resolve("a/../../outside.txt").is_err());
        assert!(backend.resolve("/etc/passwd").is_err());
        assert!(backend.resolve("a/./b/../c.txt").is_ok());
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let (_dir, backend) = backend();
        let written = backend.write_text("notes/a.txt", "hello", false).await.unwrap();
        assert_eq!(written, 5);
        assert_eq!(backend.read_text("notes/a.txt").await.unwrap(), "hello");

        backend.write_text("notes/a.txt", " world", true).await.unwrap();
        assert_eq!(backend.read_text("notes/a.txt").await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn list_files_filters_and_sorts() {
        let (_dir, backend) = backend();
        backend.write_text("b.rs", "", false).await.unwrap();
        backend.write_text("a.rs", "", false).await.unwrap();
        backend.write_text("sub/c.rs", "", false).await.unwrap();
        backend.write_text("readme.md", "", false).await.unwrap();

        let files = backend.list_files(".", "**/*.rs").await.unwrap();
        assert_eq!(files, vec!["a.rs", "b.rs", "sub/c.rs"]);
    }

    #[tokio::test]
    async fn heavy_dirs_are_summarized() {
        let (_dir, backend) = backend();
        backend
            .write_text("node_modules/pkg/index.js", "x", false)
            .await
            .unwrap();
        backend.write_text("src/main.rs", "", false).await.unwrap();

        let files = backend.list_files(".", "**/*").await.unwrap();
        assert!(files.contains(&"node_modules/".to_string()));
        assert!(files.contains(&"src/main.rs".to_string()));
        assert!(!files.iter().any(|f| f.contains("index.js")));

        // Explicitly listing inside the heavy root walks it.
        let inner = backend.list_files("node_modules", "**/*").await.unwrap();
        assert_eq!(inner, vec!["pkg/index.js"]);
    }

    #[tokio::test]
    async fn file_info_reports_metadata() {
        let (_dir, backend) = backend();
        backend.write_text("a.txt", "hello", false).await.unwrap();

        let info = backend.file_info("a.txt").await.unwrap().unwrap();
        assert!(info.is_file);
        assert!(!info.is_dir);
        assert_eq!(info.size, 5);
        assert_eq!(info.suffix.as_deref(), Some(".txt"));

        assert!(backend.file_info("missing.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mkdir_and_exists() {
        let (_dir, backend) = backend();
        backend.mkdir("deep/nested").await.unwrap();
        assert!(backend.exists("deep/nested").await.unwrap());
        assert!(!backend.is_file("deep/nested").await.unwrap());
    }
}
