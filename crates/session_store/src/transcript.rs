use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::SessionStoreError;
use crate::paths::transcript_file_name;
use crate::schema::{Message, Role};

pub const TRANSCRIPT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderRecordType {
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryRecordType {
    Entry,
}

/// First line of every transcript file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptHeader {
    #[serde(rename = "type")]
    pub record_type: HeaderRecordType,
    pub version: u32,
    pub session_id: String,
    pub user_id: String,
    pub created_at: String,
}

impl TranscriptHeader {
    #[must_use]
    pub fn v1(
        session_id: impl Into<String>,
        user_id: impl Into<String>,
        created_at: impl Into<String>,
    ) -> Self {
        Self {
            record_type: HeaderRecordType::Session,
            version: TRANSCRIPT_VERSION,
            session_id: session_id.into(),
            user_id: user_id.into(),
            created_at: created_at.into(),
        }
    }
}

/// One appended conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptEntry {
    #[serde(rename = "type")]
    pub record_type: EntryRecordType,
    pub ts: String,
    pub id: u64,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_time_ms: Option<u64>,
}

impl TranscriptEntry {
    #[must_use]
    pub fn from_message(message: &Message, ts: impl Into<String>) -> Self {
        Self {
            record_type: EntryRecordType::Entry,
            ts: ts.into(),
            id: message.id,
            role: message.role,
            content: message.content.clone(),
            thought: message.thought.clone(),
            thinking_time_ms: message.thinking_time_ms,
        }
    }
}

/// A transcript loaded back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    pub header: TranscriptHeader,
    pub entries: Vec<TranscriptEntry>,
}

/// Append-only JSONL transcript of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptWriter {
    path: PathBuf,
}

impl TranscriptWriter {
    /// Creates a new transcript file under `root` and writes its header line.
    pub fn create(root: &Path, user_id: &str, session_id: &str) -> Result<Self, SessionStoreError> {
        fs::create_dir_all(root)
            .map_err(|source| SessionStoreError::io("creating transcript directory", root, source))?;

        let created_at = now_rfc3339()?;
        let path = root.join(transcript_file_name(&created_at, user_id, session_id));
        let header = TranscriptHeader::v1(session_id, user_id, created_at);

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| SessionStoreError::io("creating transcript file", &path, source))?;
        write_json_line(&path, &mut file, &header)?;

        Ok(Self { path })
    }

    /// Wraps an existing transcript file for appending.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &Message) -> Result<(), SessionStoreError> {
        let entry = TranscriptEntry::from_message(message, now_rfc3339()?);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|source| {
                SessionStoreError::io("opening transcript file for append", &self.path, source)
            })?;
        write_json_line(&self.path, &mut file, &entry)
    }

    /// Reads and validates a transcript file.
    pub fn read(path: &Path) -> Result<Transcript, SessionStoreError> {
        let file = File::open(path)
            .map_err(|source| SessionStoreError::io("opening transcript file", path, source))?;
        let reader = BufReader::new(file);

        let mut header: Option<TranscriptHeader> = None;
        let mut entries = Vec::new();
        let mut seen_ids = HashSet::new();

        for (line_index, line_result) in reader.lines().enumerate() {
            let line_number = line_index + 1;
            let line = line_result
                .map_err(|source| SessionStoreError::io_line(path, line_number, source))?;
            let value = parse_json_line(path, line_number, &line)?;
            let record_type = value.get("type").and_then(Value::as_str).unwrap_or_default();

            if line_number == 1 {
                if record_type != "session" {
                    return Err(SessionStoreError::InvalidHeaderRecord {
                        path: path.to_path_buf(),
                        line: line_number,
                    });
                }
                let parsed: TranscriptHeader = serde_json::from_value(value)
                    .map_err(|source| SessionStoreError::json_line(path, line_number, source))?;
                validate_header_line(path, line_number, &parsed)?;
                header = Some(parsed);
                continue;
            }

            if record_type != "entry" {
                return Err(SessionStoreError::InvalidEntryRecord {
                    path: path.to_path_buf(),
                    line: line_number,
                });
            }
            let entry: TranscriptEntry = serde_json::from_value(value)
                .map_err(|source| SessionStoreError::json_line(path, line_number, source))?;
            validate_rfc3339(path, line_number, "ts", &entry.ts)?;
            if !seen_ids.insert(entry.id) {
                return Err(SessionStoreError::DuplicateEntryId {
                    path: path.to_path_buf(),
                    line: line_number,
                    id: entry.id,
                });
            }
            entries.push(entry);
        }

        let header = header.ok_or_else(|| SessionStoreError::MissingHeader {
            path: path.to_path_buf(),
        })?;

        Ok(Transcript { header, entries })
    }
}

pub(crate) fn now_rfc3339() -> Result<String, SessionStoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(SessionStoreError::ClockFormat)
}

fn write_json_line<T: Serialize>(
    path: &Path,
    file: &mut File,
    record: &T,
) -> Result<(), SessionStoreError> {
    let mut line = serde_json::to_string(record)
        .map_err(|source| SessionStoreError::json_serialize(path, source))?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .map_err(|source| SessionStoreError::io("writing transcript line", path, source))
}

fn parse_json_line(path: &Path, line_number: usize, line: &str) -> Result<Value, SessionStoreError> {
    serde_json::from_str::<Value>(line)
        .map_err(|source| SessionStoreError::json_line(path, line_number, source))
}

fn validate_header_line(
    path: &Path,
    line_number: usize,
    header: &TranscriptHeader,
) -> Result<(), SessionStoreError> {
    if header.version != TRANSCRIPT_VERSION {
        return Err(SessionStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            line: line_number,
            found: header.version,
        });
    }

    validate_rfc3339(path, line_number, "created_at", &header.created_at)
}

fn validate_rfc3339(
    path: &Path,
    line_number: usize,
    field: &'static str,
    value: &str,
) -> Result<(), SessionStoreError> {
    if OffsetDateTime::parse(value, &Rfc3339).is_err() {
        return Err(SessionStoreError::InvalidTimestamp {
            path: path.to_path_buf(),
            line: line_number,
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}
