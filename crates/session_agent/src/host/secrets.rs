use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::collaborators::SecretSink;

/// Writes each verification code to its own owner-readable file.
#[derive(Debug, Clone)]
pub struct FileSecretSink {
    dir: PathBuf,
}

impl FileSecretSink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path_for(&self, user_id: &str, capability: &str) -> PathBuf {
        self.dir.join(format!(
            "{}-{}.code",
            sanitize_segment(user_id),
            sanitize_segment(capability)
        ))
    }
}

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

fn open_private(path: &Path) -> std::io::Result<fs::File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

impl SecretSink for FileSecretSink {
    fn deliver(&self, user_id: &str, capability: &str, secret: &str) -> Result<String, String> {
        fs::create_dir_all(&self.dir).map_err(|error| {
            format!(
                "failed to create secret directory {}: {error}",
                self.dir.display()
            )
        })?;

        let path = self.path_for(user_id, capability);
        let mut file = open_private(&path)
            .map_err(|error| format!("failed to open {}: {error}", path.display()))?;
        file.write_all(secret.as_bytes())
            .map_err(|error| format!("failed to write {}: {error}", path.display()))?;

        Ok(format!("The code was written to {}", path.display()))
    }

    fn revoke(&self, user_id: &str, capability: &str) {
        let _ = fs::remove_file(self.path_for(user_id, capability));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deliver_writes_code_and_revoke_removes_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileSecretSink::new(dir.path().join("codes"));

        let hint = sink.deliver("alice", "read", "123456").expect("deliver");
        let path = sink.path_for("alice", "read");

        assert!(hint.contains(&path.display().to_string()));
        assert_eq!(fs::read_to_string(&path).expect("read code"), "123456");

        sink.revoke("alice", "read");
        assert!(!path.exists());
    }

    #[test]
    fn user_ids_cannot_escape_the_secret_dir() {
        let sink = FileSecretSink::new("/codes");
        let path = sink.path_for("../../etc/passwd", "ls");

        assert_eq!(path, PathBuf::from("/codes/------etc-passwd-ls.code"));
    }

    #[cfg(unix)]
    #[test]
    fn code_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let sink = FileSecretSink::new(dir.path());
        sink.deliver("alice", "diff", "654321").expect("deliver");

        let mode = fs::metadata(sink.path_for("alice", "diff"))
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
