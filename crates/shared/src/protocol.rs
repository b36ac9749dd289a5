use serde::{Deserialize, Serialize};

use crate::domain::{
    Attachment, AttachmentId, FriendSummary, GroupSummary, Message, MessageId, RoomId, UploadId,
    UserId, UserProfile,
};

// ---------------------------------------------------------------------------
// Auth

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub user: UserProfile,
}

/// Login and refresh responses carry the token pair in camelCase; the refresh
/// token is rotated on every successful refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: String,
}

// ---------------------------------------------------------------------------
// Message history

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendsResponse {
    #[serde(default)]
    pub friends: Vec<FriendSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsResponse {
    #[serde(default)]
    pub groups: Vec<GroupSummary>,
}

// ---------------------------------------------------------------------------
// Files

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartUploadRequest {
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartUploadResponse {
    pub upload_id: UploadId,
    pub attachment_id: AttachmentId,
    pub storage_key: String,
    pub file_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A part the object store already holds. The store reports PascalCase keys,
/// our own part-upload acknowledgement uses snake_case; accept both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedPart {
    #[serde(alias = "PartNumber")]
    pub part_number: i32,
    #[serde(default, alias = "ETag")]
    pub etag: Option<String>,
    #[serde(default, alias = "Size")]
    pub size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPartsResponse {
    #[serde(default)]
    pub parts: Vec<UploadedPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUploadRequest {
    pub upload_id: UploadId,
    pub storage_key: String,
    pub attachment_id: AttachmentId,
    pub file_name: String,
    pub mime_type: String,
    pub expected_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    pub attachment: Attachment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortUploadRequest {
    pub upload_id: UploadId,
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadUrlResponse {
    pub url: String,
}

// ---------------------------------------------------------------------------
// Realtime frames

/// Frames this client writes to the socket. Flat JSON with a `type`
/// discriminator so the wire reads `{"type":"friend_message","to_user_id":..}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping,
    /// Reply to a server-sent ping, carrying the local unix time.
    Pong {
        ts: i64,
    },
    FriendMessage {
        to_user_id: UserId,
        content: String,
    },
    GroupMessage {
        room_id: RoomId,
        content: String,
    },
    FileMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_user_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
        attachment_id: AttachmentId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentFramePayload {
    pub attachment_id: AttachmentId,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<i64>,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessageFrame {
    /// Absent on frames the server relays before assigning an id; the
    /// receiver synthesizes a placeholder.
    #[serde(default)]
    pub id: Option<MessageId>,
    pub from_user_id: UserId,
    #[serde(default)]
    pub to_user_id: Option<UserId>,
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<AttachmentId>,
    #[serde(default)]
    pub attachment: Option<AttachmentFramePayload>,
    pub timestamp: i64,
    /// 0 when the server has not assigned one yet; the authoritative copy
    /// arrives later through the pull path with the same id.
    #[serde(default)]
    pub sequence_id: i64,
}

/// Frames the server pushes. `image_message` is an alias the server emits for
/// image attachments; this client treats it as a file message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ping {
        #[serde(default)]
        ts: Option<i64>,
    },
    Pong {
        ts: i64,
    },
    FriendMessage(InboundMessageFrame),
    GroupMessage(InboundMessageFrame),
    FileMessage(InboundMessageFrame),
    ImageMessage(InboundMessageFrame),
}
