use std::{collections::HashSet, path::Path, time::UNIX_EPOCH};

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use shared::{
    protocol::{
        AbortUploadRequest, ClientFrame, CompleteUploadRequest, CompleteUploadResponse,
        DownloadUrlResponse, ListPartsResponse, StartUploadRequest, StartUploadResponse,
    },
    Attachment, AttachmentId, UploadId,
};

use crate::{ChatClient, Destination};

/// Non-final parts this size keep the object store happy; smaller chunks are
/// rejected by most S3-compatible backends.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// What makes two selections of "the same file" resumable: name, size, and
/// mtime all match. Any change means the previous session is garbage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIdentity {
    pub file_name: String,
    pub size_bytes: u64,
    pub modified_secs: i64,
}

#[derive(Debug, Clone)]
pub struct UploadSource {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub modified_secs: i64,
}

impl UploadSource {
    pub fn from_bytes(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: Vec<u8>,
        modified_secs: i64,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes,
            modified_secs,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>, mime_type: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read '{}'", path.display()))?;
        let metadata = tokio::fs::metadata(path).await?;
        let modified_secs = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        Ok(Self {
            file_name,
            mime_type: mime_type.into(),
            bytes,
            modified_secs,
        })
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            file_name: self.file_name.clone(),
            size_bytes: self.bytes.len() as u64,
            modified_secs: self.modified_secs,
        }
    }

    pub fn sha256_hex(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        hex::encode(hasher.finalize())
    }

    fn total_parts(&self, chunk_size: usize) -> usize {
        self.bytes.len().div_ceil(chunk_size).max(1)
    }

    fn chunk(&self, part_number: usize, chunk_size: usize) -> &[u8] {
        let start = (part_number - 1) * chunk_size;
        let end = (start + chunk_size).min(self.bytes.len());
        &self.bytes[start..end]
    }
}

/// A multipart upload in progress. Held while an upload is interrupted so the
/// next attempt at the same file can skip the parts the server already has.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub identity: FileIdentity,
    pub upload_id: UploadId,
    pub attachment_id: AttachmentId,
    pub storage_key: String,
    pub chunk_size: usize,
}

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub attachment: Attachment,
    pub parts_uploaded: usize,
    pub parts_skipped: usize,
}

impl ChatClient {
    /// Runs the resumable upload pipeline end to end: reuse or start a
    /// session, skip parts the server already holds, upload the rest in
    /// order, complete with a full-file checksum, then announce the
    /// attachment on the realtime channel.
    ///
    /// On any failure the session is put back so the next attempt resumes;
    /// it is cleared only after the announcement went out.
    pub async fn upload_and_send(
        &self,
        source: &UploadSource,
        destination: &Destination,
    ) -> Result<UploadOutcome> {
        let session = self.take_or_start_session(source).await?;
        match self.run_upload(&session, source, destination).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let mut guard = self.inner.lock().await;
                guard.upload_session = Some(session);
                Err(err)
            }
        }
    }

    /// Abandons the held upload session, server-side and locally. Returns
    /// whether there was a session to abort.
    pub async fn abort_upload(&self) -> Result<bool> {
        let session = { self.inner.lock().await.upload_session.take() };
        let Some(session) = session else {
            return Ok(false);
        };
        self.abort_session(&session).await;
        Ok(true)
    }

    /// Single-shot path for payloads that fit one request. The stored
    /// attachment is announced on the realtime channel just like a
    /// multipart upload.
    pub async fn upload_small(
        &self,
        source: &UploadSource,
        destination: &Destination,
    ) -> Result<Attachment> {
        let file_name = source.file_name.clone();
        let mime_type = source.mime_type.clone();
        let bytes = source.bytes.clone();
        let url = format!("{}/api/files/upload", self.server_url());
        let response = self
            .gateway()
            .send(move |http| {
                let part = Part::bytes(bytes.clone())
                    .file_name(file_name.clone())
                    .mime_str(&mime_type)
                    .unwrap_or_else(|_| Part::bytes(bytes.clone()).file_name(file_name.clone()));
                http.post(url.clone()).multipart(Form::new().part("file", part))
            })
            .await?
            .error_for_status()?;
        let body: CompleteUploadResponse = response.json().await?;
        self.announce_attachment(destination, &body.attachment.id)
            .await?;
        info!(attachment_id = %body.attachment.id, "upload announced");
        Ok(body.attachment)
    }

    pub async fn download_url(&self, attachment_id: &AttachmentId) -> Result<String> {
        let response = self
            .gateway()
            .send(|http| {
                http.get(format!(
                    "{}/api/files/{}/url",
                    self.server_url(),
                    attachment_id
                ))
            })
            .await?
            .error_for_status()?;
        let body: DownloadUrlResponse = response.json().await?;
        Ok(body.url)
    }

    async fn take_or_start_session(&self, source: &UploadSource) -> Result<UploadSession> {
        let held = { self.inner.lock().await.upload_session.take() };
        if let Some(session) = held {
            if session.identity == source.identity() {
                info!(
                    upload_id = %session.upload_id,
                    file_name = %source.file_name,
                    "resuming held upload session"
                );
                return Ok(session);
            }
            // A different file was selected; the old session is dead weight.
            self.abort_session(&session).await;
        }

        let response = self
            .gateway()
            .send(|http| {
                http.post(format!("{}/api/files/multipart/start", self.server_url()))
                    .json(&StartUploadRequest {
                        file_name: source.file_name.clone(),
                        mime_type: source.mime_type.clone(),
                    })
            })
            .await?
            .error_for_status()?;
        let body: StartUploadResponse = response.json().await?;
        debug!(upload_id = %body.upload_id, "started multipart upload");
        Ok(UploadSession {
            identity: source.identity(),
            upload_id: body.upload_id,
            attachment_id: body.attachment_id,
            storage_key: body.storage_key,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    async fn run_upload(
        &self,
        session: &UploadSession,
        source: &UploadSource,
        destination: &Destination,
    ) -> Result<UploadOutcome> {
        // The server's part listing, not local bookkeeping, decides what is
        // already done.
        let completed = self.list_uploaded_parts(session).await?;
        let total_parts = source.total_parts(session.chunk_size);

        let mut parts_uploaded = 0;
        let mut parts_skipped = 0;
        for part_number in 1..=total_parts {
            if completed.contains(&(part_number as i32)) {
                parts_skipped += 1;
                continue;
            }
            self.upload_part(session, source, part_number).await?;
            parts_uploaded += 1;
        }
        debug!(
            upload_id = %session.upload_id,
            parts_uploaded,
            parts_skipped,
            "all parts present"
        );

        let attachment = self.complete_upload(session, source).await?;
        self.announce_attachment(destination, &attachment.id).await?;
        info!(attachment_id = %attachment.id, "upload announced");

        Ok(UploadOutcome {
            attachment,
            parts_uploaded,
            parts_skipped,
        })
    }

    async fn list_uploaded_parts(&self, session: &UploadSession) -> Result<HashSet<i32>> {
        let response = self
            .gateway()
            .send(|http| {
                http.get(format!("{}/api/files/multipart/parts", self.server_url()))
                    .query(&[
                        ("upload_id", session.upload_id.as_str()),
                        ("storage_key", session.storage_key.as_str()),
                    ])
            })
            .await?
            .error_for_status()?;
        let body: ListPartsResponse = response.json().await?;
        Ok(body.parts.into_iter().map(|part| part.part_number).collect())
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        source: &UploadSource,
        part_number: usize,
    ) -> Result<()> {
        let chunk = source.chunk(part_number, session.chunk_size).to_vec();
        let upload_id = session.upload_id.to_string();
        let storage_key = session.storage_key.clone();
        let file_name = source.file_name.clone();
        let url = format!("{}/api/files/multipart/part", self.server_url());

        self.gateway()
            .send(move |http| {
                let form = Form::new()
                    .text("upload_id", upload_id.clone())
                    .text("storage_key", storage_key.clone())
                    .text("part_number", part_number.to_string())
                    .part("file", Part::bytes(chunk.clone()).file_name(file_name.clone()));
                http.post(url.clone()).multipart(form)
            })
            .await?
            .error_for_status()
            .with_context(|| format!("part {part_number} rejected"))?;
        Ok(())
    }

    async fn complete_upload(
        &self,
        session: &UploadSession,
        source: &UploadSource,
    ) -> Result<Attachment> {
        let expected_sha256 = source.sha256_hex();
        let response = self
            .gateway()
            .send(|http| {
                http.post(format!("{}/api/files/multipart/complete", self.server_url()))
                    .json(&CompleteUploadRequest {
                        upload_id: session.upload_id.clone(),
                        storage_key: session.storage_key.clone(),
                        attachment_id: session.attachment_id.clone(),
                        file_name: source.file_name.clone(),
                        mime_type: source.mime_type.clone(),
                        expected_sha256: expected_sha256.clone(),
                    })
            })
            .await?
            .error_for_status()
            .context("complete rejected; parts or checksum did not line up")?;
        let body: CompleteUploadResponse = response.json().await?;
        Ok(body.attachment)
    }

    async fn announce_attachment(
        &self,
        destination: &Destination,
        attachment_id: &AttachmentId,
    ) -> Result<()> {
        let frame = match destination {
            Destination::Friend(user_id) => ClientFrame::FileMessage {
                to_user_id: Some(user_id.clone()),
                room_id: None,
                attachment_id: attachment_id.clone(),
            },
            Destination::Group(room_id) => ClientFrame::FileMessage {
                to_user_id: None,
                room_id: Some(room_id.clone()),
                attachment_id: attachment_id.clone(),
            },
        };
        self.send_frame(&frame)
            .await
            .context("attachment stored but announcement failed")
    }

    async fn abort_session(&self, session: &UploadSession) {
        let result = self
            .gateway()
            .send(|http| {
                http.post(format!("{}/api/files/multipart/abort", self.server_url()))
                    .json(&AbortUploadRequest {
                        upload_id: session.upload_id.clone(),
                        storage_key: session.storage_key.clone(),
                    })
            })
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!(upload_id = %session.upload_id, "aborted upload session");
            }
            Ok(response) => {
                warn!(
                    upload_id = %session.upload_id,
                    status = %response.status(),
                    "server refused upload abort"
                );
            }
            Err(err) => {
                warn!(upload_id = %session.upload_id, "upload abort failed: {err}");
            }
        }
    }
}
