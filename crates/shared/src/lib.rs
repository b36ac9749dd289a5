pub mod domain;
pub mod error;
pub mod protocol;

pub use domain::{
    Attachment, AttachmentId, ContentType, FriendSummary, GroupSummary, Message, MessageId, RoomId,
    UploadId, UserId, UserProfile,
};
pub use error::{ApiError, ErrorCode};

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
