use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::SandboxError;

const SUMMARY_PREVIEW_CHARS: usize = 50;

/// Filesystem access confined to one canonical root directory.
///
/// Paths are checked lexically before any filesystem call, then again after
/// canonicalization so symlinks cannot lead outside the root.
#[derive(Debug, Clone)]
pub struct SandboxedFiles {
    root: PathBuf,
    read_max_bytes: u64,
}

impl SandboxedFiles {
    pub fn new(root: impl Into<PathBuf>, read_max_bytes: u64) -> Result<Self, SandboxError> {
        let root = root.into();
        let canonical_root = root.canonicalize().map_err(|error| SandboxError::Resolve {
            path: root.display().to_string(),
            reason: error.to_string(),
        })?;

        if !canonical_root.is_dir() {
            return Err(SandboxError::NotDirectory(
                canonical_root.display().to_string(),
            ));
        }

        Ok(Self {
            root: canonical_root,
            read_max_bytes,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a user-supplied path to an existing canonical path inside the root.
    ///
    /// A leading `/` or `\` is read as root-relative.
    pub fn resolve(&self, raw: &str) -> Result<PathBuf, SandboxError> {
        let relative = lexically_contained(raw)?;
        let candidate = self.root.join(&relative);
        let canonical = candidate
            .canonicalize()
            .map_err(|error| SandboxError::Resolve {
                path: raw.trim().to_string(),
                reason: error.to_string(),
            })?;

        self.ensure_inside_root(&canonical)?;
        Ok(canonical)
    }

    fn ensure_inside_root(&self, canonical: &Path) -> Result<(), SandboxError> {
        if canonical.starts_with(&self.root) {
            Ok(())
        } else {
            Err(SandboxError::Escape(canonical.display().to_string()))
        }
    }

    fn display_relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) if relative.as_os_str().is_empty() => ".".to_string(),
            Ok(relative) => relative.display().to_string(),
            Err(_) => path.display().to_string(),
        }
    }

    /// Lists a directory: directories first, then files, each group by
    /// case-insensitive name.
    pub fn list(&self, raw: &str) -> Result<String, SandboxError> {
        let raw = if raw.trim().is_empty() { "." } else { raw };
        let dir = self.resolve(raw)?;
        if !dir.is_dir() {
            return Err(SandboxError::NotDirectory(self.display_relative(&dir)));
        }

        let read_dir = fs::read_dir(&dir).map_err(|error| SandboxError::Io {
            operation: "listing",
            path: self.display_relative(&dir),
            reason: error.to_string(),
        })?;

        let mut entries: Vec<(bool, String, u64)> = read_dir
            .filter_map(Result::ok)
            .map(|entry| {
                let metadata = entry.metadata().ok();
                let is_dir = metadata.as_ref().is_some_and(fs::Metadata::is_dir);
                let size = metadata.map_or(0, |metadata| metadata.len());
                (is_dir, entry.file_name().to_string_lossy().into_owned(), size)
            })
            .collect();

        entries.sort_by(|left, right| {
            right
                .0
                .cmp(&left.0)
                .then_with(|| left.1.to_lowercase().cmp(&right.1.to_lowercase()))
        });

        if entries.is_empty() {
            return Ok(format!("{} is empty", self.display_relative(&dir)));
        }

        Ok(entries
            .into_iter()
            .map(|(is_dir, name, size)| {
                if is_dir {
                    format!("[DIR] {name}")
                } else {
                    format!("[FILE] {name} ({}KB)", size / 1024)
                }
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Reads a UTF-8 file no larger than the configured limit.
    pub fn read(&self, raw: &str) -> Result<String, SandboxError> {
        let path = self.resolve(raw)?;
        self.read_resolved(&path)
    }

    fn read_resolved(&self, path: &Path) -> Result<String, SandboxError> {
        if path.is_dir() {
            return Err(SandboxError::IsDirectory(self.display_relative(path)));
        }

        let size = fs::metadata(path)
            .map_err(|error| SandboxError::Io {
                operation: "inspecting",
                path: self.display_relative(path),
                reason: error.to_string(),
            })?
            .len();
        if size > self.read_max_bytes {
            return Err(SandboxError::TooLarge {
                size_kib: size / 1024,
                limit_kib: self.read_max_bytes / 1024,
            });
        }

        let bytes = fs::read(path).map_err(|error| SandboxError::Io {
            operation: "reading",
            path: self.display_relative(path),
            reason: error.to_string(),
        })?;
        String::from_utf8(bytes).map_err(|_| SandboxError::NotUtf8)
    }

    /// Applies `path|search|replace` as one literal substitution.
    ///
    /// When `search` is absent verbatim, a single retry uses it trimmed and
    /// `replace` without one leading space. The file is untouched on failure.
    pub fn diff(&self, args: &str) -> Result<String, SandboxError> {
        let mut parts = args.splitn(3, '|');
        let (Some(raw_path), Some(search), Some(replace)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(SandboxError::InvalidArguments(
                "Expected path|search|replace".to_string(),
            ));
        };

        if search.is_empty() {
            return Err(SandboxError::InvalidArguments(
                "Search text must not be empty".to_string(),
            ));
        }

        let path = self.resolve(raw_path.trim())?;
        let content = self.read_resolved(&path)?;
        let display = self.display_relative(&path);

        let (search, replace) = if content.contains(search) {
            (search, replace)
        } else {
            let trimmed = search.trim();
            if trimmed.is_empty() || !content.contains(trimmed) {
                return Err(SandboxError::SearchNotFound(display));
            }
            (trimmed, replace.strip_prefix(' ').unwrap_or(replace))
        };

        let updated = content.replacen(search, replace, 1);
        fs::write(&path, updated).map_err(|error| SandboxError::Io {
            operation: "writing",
            path: display.clone(),
            reason: error.to_string(),
        })?;

        Ok(format!(
            "Replaced '{}' with '{}' in {display}",
            preview(search),
            preview(replace)
        ))
    }
}

/// Normalizes `raw` to a relative path that cannot climb above its base.
fn lexically_contained(raw: &str) -> Result<PathBuf, SandboxError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::EmptyPath);
    }

    let relative = trimmed.trim_start_matches(['/', '\\']);
    let mut normalized = PathBuf::new();
    let mut depth = 0usize;

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                normalized.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(SandboxError::Escape(trimmed.to_string()));
                }
                normalized.pop();
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::Escape(trimmed.to_string()));
            }
        }
    }

    Ok(normalized)
}

fn preview(text: &str) -> String {
    if text.chars().count() <= SUMMARY_PREVIEW_CHARS {
        return text.to_string();
    }
    let mut shortened: String = text.chars().take(SUMMARY_PREVIEW_CHARS).collect();
    shortened.push_str("...");
    shortened
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, SandboxedFiles) {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = SandboxedFiles::new(dir.path(), 100 * 1024).expect("sandbox root");
        (dir, files)
    }

    #[test]
    fn parent_escapes_are_rejected_before_filesystem_access() {
        assert_eq!(
            lexically_contained("../../etc/passwd"),
            Err(SandboxError::Escape("../../etc/passwd".to_string()))
        );
        assert_eq!(
            lexically_contained("a/../../b"),
            Err(SandboxError::Escape("a/../../b".to_string()))
        );
        assert_eq!(
            lexically_contained("/config/./server.yml").expect("root-relative"),
            PathBuf::from("config/server.yml")
        );
        assert_eq!(lexically_contained("  "), Err(SandboxError::EmptyPath));
    }

    #[test]
    fn resolve_rejects_missing_and_escaping_paths() {
        let (_dir, files) = sandbox();

        assert!(matches!(
            files.resolve("../../etc/passwd"),
            Err(SandboxError::Escape(_))
        ));
        assert!(matches!(
            files.resolve("missing.txt"),
            Err(SandboxError::Resolve { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_root_is_rejected() {
        let (dir, files) = sandbox();
        let outside = tempfile::tempdir().expect("outside dir");
        std::fs::write(outside.path().join("secret.txt"), "s").expect("write secret");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link"))
            .expect("create symlink");

        assert!(matches!(
            files.read("link/secret.txt"),
            Err(SandboxError::Escape(_))
        ));
    }

    #[test]
    fn list_orders_directories_first_case_insensitively() {
        let (dir, files) = sandbox();
        fs::create_dir(dir.path().join("beta")).expect("dir");
        fs::create_dir(dir.path().join("Alpha")).expect("dir");
        fs::write(dir.path().join("zeta.txt"), vec![b'x'; 2048]).expect("file");
        fs::write(dir.path().join("Gamma.txt"), "g").expect("file");

        assert_eq!(
            files.list("").expect("list root"),
            "[DIR] Alpha\n[DIR] beta\n[FILE] Gamma.txt (0KB)\n[FILE] zeta.txt (2KB)"
        );
        assert!(matches!(
            files.list("zeta.txt"),
            Err(SandboxError::NotDirectory(_))
        ));
    }

    #[test]
    fn read_rejects_directories_and_oversized_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files = SandboxedFiles::new(dir.path(), 1024).expect("sandbox");
        fs::create_dir(dir.path().join("sub")).expect("dir");
        fs::write(dir.path().join("big.txt"), vec![b'a'; 4096]).expect("big");
        fs::write(dir.path().join("small.txt"), "hello").expect("small");

        assert!(matches!(
            files.read("sub"),
            Err(SandboxError::IsDirectory(_))
        ));
        assert_eq!(
            files.read("big.txt"),
            Err(SandboxError::TooLarge {
                size_kib: 4,
                limit_kib: 1
            })
        );
        assert_eq!(files.read("/small.txt").expect("read"), "hello");
    }

    #[test]
    fn diff_replaces_first_literal_occurrence_only() {
        let (dir, files) = sandbox();
        let path = dir.path().join("server.yml");
        fs::write(&path, "port: 1 (x+)\nport: 1 (x+)\n").expect("write");

        let summary = files
            .diff("server.yml|port: 1 (x+)|port: 2 (x+)")
            .expect("diff should apply");

        assert_eq!(
            fs::read_to_string(&path).expect("read back"),
            "port: 2 (x+)\nport: 1 (x+)\n"
        );
        assert_eq!(summary, "Replaced 'port: 1 (x+)' with 'port: 2 (x+)' in server.yml");
    }

    #[test]
    fn diff_retries_once_with_trimmed_search() {
        let (dir, files) = sandbox();
        let path = dir.path().join("motd.txt");
        fs::write(&path, "welcome home").expect("write");

        files
            .diff("motd.txt | welcome | hello")
            .expect("trimmed retry should apply");

        assert_eq!(fs::read_to_string(&path).expect("read"), "hello  home");
    }

    #[test]
    fn diff_with_absent_search_leaves_file_unchanged() {
        let (dir, files) = sandbox();
        let path = dir.path().join("motd.txt");
        fs::write(&path, "welcome").expect("write");

        assert_eq!(
            files.diff("motd.txt|goodbye|hello"),
            Err(SandboxError::SearchNotFound("motd.txt".to_string()))
        );
        assert_eq!(fs::read_to_string(&path).expect("read"), "welcome");
    }

    #[test]
    fn diff_requires_three_parts_and_non_empty_search() {
        let (_dir, files) = sandbox();

        assert!(matches!(
            files.diff("motd.txt|only"),
            Err(SandboxError::InvalidArguments(_))
        ));
        assert!(matches!(
            files.diff("motd.txt||x"),
            Err(SandboxError::InvalidArguments(_))
        ));
    }

    #[test]
    fn diff_keeps_pipes_inside_replacement() {
        let (dir, files) = sandbox();
        let path = dir.path().join("a.txt");
        fs::write(&path, "x").expect("write");

        files.diff("a.txt|x|y|z").expect("diff");
        assert_eq!(fs::read_to_string(&path).expect("read"), "y|z");
    }

    #[test]
    fn summary_preview_shortens_long_text() {
        let long = "a".repeat(80);
        assert_eq!(preview(&long), format!("{}...", "a".repeat(50)));
        assert_eq!(preview("short"), "short");
    }
}
