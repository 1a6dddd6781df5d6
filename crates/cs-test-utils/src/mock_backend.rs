//! Mock backend API.
//!
//! Implements all three collaborator traits in memory. Attendance events and
//! chat messages are recorded for later assertions. Each write path can be
//! switched to fail with `BackendUnavailable` or slowed down.
//!
//! # Example
//!
//! ```rust,ignore
//! use cs_test_utils::MockBackend;
//!
//! let backend = MockBackend::builder()
//!     .with_user("alice", "Alice Liddell")
//!     .with_class("class-1")
//!     .build();
//! ```

use async_trait::async_trait;
use chrono::Utc;
use classroom_service::collaborators::{
    AttendanceClient, AttendanceStatus, ChatClient, ChatMessageRecord, ClassRecord,
    DirectoryClient, UserRecord,
};
use classroom_service::errors::CsError;
use common::types::{ParticipantId, RoomId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// One recorded attendance event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceEvent {
    pub user: ParticipantId,
    pub class: RoomId,
    pub status: AttendanceStatus,
}

/// In-memory backend for gateway tests.
#[derive(Debug, Default)]
pub struct MockBackend {
    users: HashMap<ParticipantId, UserRecord>,
    classes: HashMap<RoomId, ClassRecord>,
    /// Unknown users and classes resolve instead of failing with `NotFound`.
    permissive: bool,
    attendance: Mutex<Vec<AttendanceEvent>>,
    chat: Mutex<Vec<ChatMessageRecord>>,
    fail_attendance: AtomicBool,
    fail_chat: AtomicBool,
    attendance_delays: Mutex<HashMap<AttendanceStatus, Duration>>,
    chat_delay: Mutex<Option<Duration>>,
    next_message_id: AtomicU64,
}

impl MockBackend {
    /// Create a new MockBackend builder.
    #[must_use]
    pub fn builder() -> MockBackendBuilder {
        MockBackendBuilder::default()
    }

    /// A backend that knows every user and class. Unknown users are named
    /// after their id.
    #[must_use]
    pub fn permissive() -> Self {
        Self::builder().permissive().build()
    }

    /// Every attendance event recorded so far, in order.
    pub fn attendance_events(&self) -> Vec<AttendanceEvent> {
        self.attendance.lock().unwrap().clone()
    }

    /// Attendance statuses recorded for one participant in one class.
    pub fn attendance_for(&self, user: &str, class: &str) -> Vec<AttendanceStatus> {
        self.attendance
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.user.as_str() == user && e.class.as_str() == class)
            .map(|e| e.status)
            .collect()
    }

    /// Every chat message persisted so far, in order.
    pub fn chat_messages(&self) -> Vec<ChatMessageRecord> {
        self.chat.lock().unwrap().clone()
    }

    /// Make `record_attendance_event` fail until switched back.
    pub fn set_attendance_failure(&self, fail: bool) {
        self.fail_attendance.store(fail, Ordering::SeqCst);
    }

    /// Make `create_chat_message` fail until switched back.
    pub fn set_chat_failure(&self, fail: bool) {
        self.fail_chat.store(fail, Ordering::SeqCst);
    }

    /// Hold every `status` attendance record for `delay` before storing it.
    pub fn delay_attendance(&self, status: AttendanceStatus, delay: Duration) {
        self.attendance_delays.lock().unwrap().insert(status, delay);
    }

    /// Hold every chat message for `delay` before persisting it.
    pub fn set_chat_delay(&self, delay: Duration) {
        *self.chat_delay.lock().unwrap() = Some(delay);
    }

    fn user(&self, user: &ParticipantId) -> Option<UserRecord> {
        self.users.get(user).cloned().or_else(|| {
            self.permissive.then(|| UserRecord {
                user_id: user.clone(),
                full_name: user.to_string(),
                role: None,
            })
        })
    }
}

#[async_trait]
impl DirectoryClient for MockBackend {
    async fn find_user_by_id(&self, user: &ParticipantId) -> Result<UserRecord, CsError> {
        self.user(user)
            .ok_or_else(|| CsError::NotFound("user not found".to_string()))
    }

    async fn find_class_by_id(&self, class: &RoomId) -> Result<ClassRecord, CsError> {
        match self.classes.get(class) {
            Some(record) => Ok(record.clone()),
            None if self.permissive => Ok(ClassRecord {
                class_id: class.clone(),
                class_name: class.to_string(),
            }),
            None => Err(CsError::NotFound("class not found".to_string())),
        }
    }
}

#[async_trait]
impl AttendanceClient for MockBackend {
    async fn record_attendance_event(
        &self,
        user: &ParticipantId,
        class: &RoomId,
        status: AttendanceStatus,
    ) -> Result<(), CsError> {
        let delay = self.attendance_delays.lock().unwrap().get(&status).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_attendance.load(Ordering::SeqCst) {
            return Err(CsError::BackendUnavailable(
                "attendance endpoint returned 503".to_string(),
            ));
        }
        self.attendance.lock().unwrap().push(AttendanceEvent {
            user: user.clone(),
            class: class.clone(),
            status,
        });
        Ok(())
    }
}

#[async_trait]
impl ChatClient for MockBackend {
    async fn create_chat_message(
        &self,
        message: &str,
        user: &ParticipantId,
        _class: &RoomId,
    ) -> Result<ChatMessageRecord, CsError> {
        let delay = *self.chat_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_chat.load(Ordering::SeqCst) {
            return Err(CsError::BackendUnavailable(
                "chat endpoint returned 503".to_string(),
            ));
        }
        let user = self
            .user(user)
            .ok_or_else(|| CsError::NotFound("user not found".to_string()))?;
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ChatMessageRecord {
            message_id: format!("msg-{id}"),
            message: message.to_string(),
            created_at: Utc::now(),
            user,
        };
        self.chat.lock().unwrap().push(record.clone());
        Ok(record)
    }
}

/// Builder for MockBackend configuration.
#[derive(Debug, Default)]
pub struct MockBackendBuilder {
    users: HashMap<ParticipantId, UserRecord>,
    classes: HashMap<RoomId, ClassRecord>,
    permissive: bool,
}

impl MockBackendBuilder {
    /// Register a known user.
    #[must_use]
    pub fn with_user(mut self, user_id: &str, full_name: &str) -> Self {
        let user_id = ParticipantId::from(user_id);
        self.users.insert(
            user_id.clone(),
            UserRecord {
                user_id,
                full_name: full_name.to_string(),
                role: None,
            },
        );
        self
    }

    /// Register a known class.
    #[must_use]
    pub fn with_class(mut self, class_id: &str) -> Self {
        let class_name = format!("Class {class_id}");
        let class_id = RoomId::from(class_id);
        self.classes.insert(
            class_id.clone(),
            ClassRecord {
                class_id,
                class_name,
            },
        );
        self
    }

    /// Resolve unknown users and classes instead of failing.
    #[must_use]
    pub fn permissive(mut self) -> Self {
        self.permissive = true;
        self
    }

    /// Build the MockBackend.
    #[must_use]
    pub fn build(self) -> MockBackend {
        MockBackend {
            users: self.users,
            classes: self.classes,
            permissive: self.permissive,
            ..MockBackend::default()
        }
    }
}
