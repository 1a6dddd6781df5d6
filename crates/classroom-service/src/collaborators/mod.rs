//! Backend collaborators.
//!
//! The session gateway never touches persistence directly. User and class
//! lookups, attendance records and chat history live in the backend API and
//! are reached through three narrow traits:
//!
//! | Trait | Operations |
//! |-------|------------|
//! | [`DirectoryClient`] | `find_user_by_id`, `find_class_by_id` |
//! | [`AttendanceClient`] | `record_attendance_event` |
//! | [`ChatClient`] | `create_chat_message` |
//!
//! [`HttpBackendClient`] implements all three against the backend's internal
//! HTTP API.

mod http;

pub use http::HttpBackendClient;

use crate::errors::CsError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A user as known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: ParticipantId,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// A class as known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub class_id: RoomId,
    #[serde(default)]
    pub class_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Joined,
    Left,
}

impl AttendanceStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Joined => "joined",
            AttendanceStatus::Left => "left",
        }
    }
}

/// A chat message after the backend persisted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub message_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub user: UserRecord,
}

#[async_trait]
pub trait DirectoryClient: Send + Sync {
    /// Fails with `CsError::NotFound` for an unknown user.
    async fn find_user_by_id(&self, user: &ParticipantId) -> Result<UserRecord, CsError>;

    /// Fails with `CsError::NotFound` for an unknown class.
    async fn find_class_by_id(&self, class: &RoomId) -> Result<ClassRecord, CsError>;
}

#[async_trait]
pub trait AttendanceClient: Send + Sync {
    async fn record_attendance_event(
        &self,
        user: &ParticipantId,
        class: &RoomId,
        status: AttendanceStatus,
    ) -> Result<(), CsError>;
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Persist a message and return it with its server-assigned id and
    /// timestamp.
    async fn create_chat_message(
        &self,
        message: &str,
        user: &ParticipantId,
        class: &RoomId,
    ) -> Result<ChatMessageRecord, CsError>;
}

/// The collaborator set handed to the session gateway.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn DirectoryClient>,
    pub attendance: Arc<dyn AttendanceClient>,
    pub chat: Arc<dyn ChatClient>,
}

impl Collaborators {
    /// Use one backend for all three roles.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: DirectoryClient + AttendanceClient + ChatClient + 'static,
    {
        Self {
            directory: Arc::clone(&backend) as Arc<dyn DirectoryClient>,
            attendance: Arc::clone(&backend) as Arc<dyn AttendanceClient>,
            chat: backend,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_attendance_status_serialization() {
        assert_eq!(
            serde_json::to_string(&AttendanceStatus::Joined).unwrap(),
            "\"joined\""
        );
        assert_eq!(
            serde_json::to_string(&AttendanceStatus::Left).unwrap(),
            "\"left\""
        );
        assert_eq!(AttendanceStatus::Left.as_str(), "left");
    }

    #[test]
    fn test_chat_record_deserialization() {
        let json = r#"{
            "message_id": "2f1c",
            "message": "hello",
            "created_at": "2026-03-01T10:00:00Z",
            "user": {"user_id": "u-1", "full_name": "Ada Lovelace", "role": "student"}
        }"#;
        let record: ChatMessageRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.message_id, "2f1c");
        assert_eq!(record.user.full_name, "Ada Lovelace");
        assert_eq!(record.user.role.as_deref(), Some("student"));
    }

    #[test]
    fn test_class_name_is_optional() {
        let record: ClassRecord = serde_json::from_str(r#"{"class_id": "c-1"}"#).unwrap();
        assert_eq!(record.class_id.as_str(), "c-1");
        assert!(record.class_name.is_empty());
    }
}
