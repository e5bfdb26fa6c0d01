use std::path::{Path, PathBuf};

pub const TRANSCRIPT_DIR: &str = "transcripts";

#[must_use]
pub fn transcript_root(base: &Path) -> PathBuf {
    base.join(TRANSCRIPT_DIR)
}

#[must_use]
pub fn sanitize_for_filename(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' | ' ' | '.' => '-',
            _ => c,
        })
        .collect()
}

#[must_use]
pub fn transcript_file_name(created_at: &str, user_id: &str, session_id: &str) -> String {
    format!(
        "{}_{}_{}.jsonl",
        sanitize_for_filename(created_at),
        sanitize_for_filename(user_id),
        session_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_cannot_escape_the_transcript_root() {
        let name = transcript_file_name("2026-02-14T00:00:00Z", "../evil/user", "abc");
        assert_eq!(name, "2026-02-14T00-00-00Z_---evil-user_abc.jsonl");
        assert!(!name.contains('/'));
    }
}
