//! Per-user conversation state and its append-only transcript files.

mod error;
mod paths;
mod schema;
mod session;
mod store;
mod transcript;

pub use error::SessionStoreError;
pub use paths::{transcript_file_name, transcript_root};
pub use schema::{
    FileOp, GenerationStatus, Message, Mode, PendingAction, PendingCommand, Role,
    ThoughtSnapshot,
};
pub use session::{
    estimate_tokens, Session, MAX_HISTORY, MAX_THOUGHT_SNAPSHOTS, MAX_TOOL_CALL_HISTORY,
};
pub use store::{SessionStore, SharedSession};
pub use transcript::{
    EntryRecordType, HeaderRecordType, Transcript, TranscriptEntry, TranscriptHeader,
    TranscriptWriter,
};
