//! Attachment uploads and video reference parsing.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use tracetech_config::RecordPatch;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::remote::ObjectStore;

/// Kind of file attached to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Report,
    Image,
}

impl AttachmentKind {
    fn folder(self) -> &'static str {
        match self {
            AttachmentKind::Report => "documents",
            AttachmentKind::Image => "images",
        }
    }
}

/// Object path for an upload: `<folder>/<millis>_<file name>`.
pub fn object_path(kind: AttachmentKind, file_name: &str, at: DateTime<Utc>) -> String {
    let name: String = file_name
        .rsplit(&['/', '\\'][..])
        .next()
        .unwrap_or(file_name)
        .to_string();
    format!("{}/{}_{}", kind.folder(), at.timestamp_millis(), name)
}

/// Upload `bytes` and return the record patch that references the result.
pub async fn upload(
    store: &dyn ObjectStore,
    kind: AttachmentKind,
    file_name: &str,
    bytes: Vec<u8>,
) -> Result<RecordPatch> {
    if file_name.trim().is_empty() {
        return Err(SyncError::missing_fields(&["file name"]));
    }
    let path = object_path(kind, file_name, Utc::now());
    let size = bytes.len();
    let reference = store.upload(bytes, &path).await?;
    debug!(path = %path, size, "uploaded attachment");

    let mut patch = RecordPatch::default();
    match kind {
        AttachmentKind::Report => patch.report_ref = Some(reference),
        AttachmentKind::Image => patch.image_ref = Some(reference),
    }
    Ok(patch)
}

fn video_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^.*(youtu\.be/|v/|u/\w/|embed/|watch\?v=|&v=)([^#&?]*).*").ok())
        .as_ref()
}

/// Extract the 11-character YouTube video id from a URL.
pub fn youtube_id(url: &str) -> Option<&str> {
    video_pattern()?
        .captures(url)
        .and_then(|captures| captures.get(2))
        .map(|id| id.as_str())
        .filter(|id| id.chars().count() == 11)
}

/// Embeddable URL for a video reference, when it points at YouTube.
pub fn embed_url(url: &str) -> Option<String> {
    youtube_id(url).map(|id| format!("https://www.youtube.com/embed/{}", id))
}
