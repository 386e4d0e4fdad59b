// file_states table: transfer status of file entities.
//
// Upload:   pending -> uploading -> completed
//                   \-> failed -> pending (retry)
//           pending | uploading | failed -> cancelled
// Download: none -> pending -> downloading -> completed | failed

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{invalid_value, parse_timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    None,
    Pending,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Failed, Pending)
                | (Pending | Uploading | Failed, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    None,
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (None | Failed | Completed, Pending)
                | (Pending, Downloading)
                | (Downloading, Completed)
                | (Downloading, Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub id: String,
    pub upload_status: UploadStatus,
    pub upload_progress: u8,
    pub upload_error: Option<String>,
    pub download_status: DownloadStatus,
    pub download_progress: u8,
    pub updated_at: DateTime<Utc>,
}

impl FileState {
    /// State of a file created on this device, waiting to be uploaded.
    pub fn new_upload(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_owned(),
            upload_status: UploadStatus::Pending,
            upload_progress: 0,
            upload_error: None,
            download_status: DownloadStatus::None,
            download_progress: 0,
            updated_at: now,
        }
    }
}

pub struct FileStateStore;

impl FileStateStore {
    pub fn insert(conn: &Connection, state: &FileState) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO file_states \
             (id, upload_status, upload_progress, upload_error, download_status, download_progress, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                state.id,
                state.upload_status.as_str(),
                state.upload_progress,
                state.upload_error,
                state.download_status.as_str(),
                state.download_progress,
                state.updated_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("failed to write file state `{}`", state.id))?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<FileState>> {
        conn.query_row(
            "SELECT id, upload_status, upload_progress, upload_error, download_status, download_progress, \
                    updated_at \
             FROM file_states WHERE id = ?1",
            params![id],
            row_to_file_state,
        )
        .optional()
        .with_context(|| format!("failed to read file state `{id}`"))
    }

    /// Move the upload state machine; rejects transitions it does not allow.
    pub fn set_upload(
        conn: &Connection,
        id: &str,
        next: UploadStatus,
        progress: u8,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FileState> {
        let mut state = Self::get(conn, id)?.with_context(|| format!("no file state for `{id}`"))?;
        if state.upload_status != next && !state.upload_status.can_transition_to(next) {
            bail!("invalid upload transition for `{id}`: {} -> {}", state.upload_status.as_str(), next.as_str());
        }
        state.upload_status = next;
        state.upload_progress = progress.min(100);
        state.upload_error = error.map(str::to_owned);
        state.updated_at = now;
        Self::insert(conn, &state)?;
        Ok(state)
    }

    /// Move the download state machine; rejects transitions it does not allow.
    pub fn set_download(
        conn: &Connection,
        id: &str,
        next: DownloadStatus,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<FileState> {
        let mut state = Self::get(conn, id)?.unwrap_or(FileState {
            id: id.to_owned(),
            upload_status: UploadStatus::None,
            upload_progress: 0,
            upload_error: None,
            download_status: DownloadStatus::None,
            download_progress: 0,
            updated_at: now,
        });
        if state.download_status != next && !state.download_status.can_transition_to(next) {
            bail!(
                "invalid download transition for `{id}`: {} -> {}",
                state.download_status.as_str(),
                next.as_str()
            );
        }
        state.download_status = next;
        state.download_progress = progress.min(100);
        state.updated_at = now;
        Self::insert(conn, &state)?;
        Ok(state)
    }

    /// Cancel a not-yet-completed upload. Returns whether anything was cancelled.
    pub fn cancel_upload(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool> {
        match Self::get(conn, id)? {
            Some(state) if state.upload_status.can_transition_to(UploadStatus::Cancelled) => {
                Self::set_upload(conn, id, UploadStatus::Cancelled, state.upload_progress, None, now)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        let changed = conn
            .execute("DELETE FROM file_states WHERE id = ?1", params![id])
            .with_context(|| format!("failed to delete file state `{id}`"))?;
        Ok(changed > 0)
    }
}

fn row_to_file_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileState> {
    let upload: String = row.get(1)?;
    let download: String = row.get(4)?;
    let updated_at: String = row.get(6)?;
    Ok(FileState {
        id: row.get(0)?,
        upload_status: UploadStatus::parse(&upload).ok_or_else(|| invalid_value(1, "upload status", &upload))?,
        upload_progress: row.get(2)?,
        upload_error: row.get(3)?,
        download_status: DownloadStatus::parse(&download)
            .ok_or_else(|| invalid_value(4, "download status", &download))?,
        download_progress: row.get(5)?,
        updated_at: parse_timestamp(6, &updated_at)?,
    })
}
