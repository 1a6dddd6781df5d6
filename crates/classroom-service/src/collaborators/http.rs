//! HTTP client for the backend's internal API.
//!
//! # Endpoints
//!
//! - `GET /internal/users/{id}`
//! - `GET /internal/classes/{id}`
//! - `POST /internal/attendance`
//! - `POST /internal/chat-messages`
//!
//! Every request carries the service token as a bearer credential. Status
//! mapping: 404 to `NotFound`, 401/403 to `Unauthorized`, 400 to
//! `Validation`, 5xx and connection failures to `BackendUnavailable`, and an
//! expired request deadline to `Timeout`.

use super::{
    AttendanceClient, AttendanceStatus, ChatClient, ChatMessageRecord, ClassRecord,
    DirectoryClient, UserRecord,
};
use crate::errors::CsError;
use crate::observability::metrics::record_backend_call_latency;
use async_trait::async_trait;
use common::secret::{ExposeSecret, SecretString};
use common::types::{ParticipantId, RoomId};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{error, instrument, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct AttendanceRequest<'a> {
    user_id: &'a ParticipantId,
    class_id: &'a RoomId,
    status: AttendanceStatus,
}

#[derive(Debug, Serialize)]
struct ChatMessageRequest<'a> {
    message: &'a str,
    user_id: &'a ParticipantId,
    class_id: &'a RoomId,
}

/// Backend API client implementing every collaborator trait.
#[derive(Clone)]
pub struct HttpBackendClient {
    client: Client,
    base_url: String,
    service_token: SecretString,
}

impl HttpBackendClient {
    /// Create a new backend client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the backend (e.g., "http://backend:3001")
    /// * `service_token` - Bearer token for the internal API
    /// * `request_timeout` - Deadline for a whole request
    ///
    /// # Errors
    ///
    /// Returns `CsError::Internal` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        service_token: SecretString,
        request_timeout: Duration,
    ) -> Result<Self, CsError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
            .build()
            .map_err(|e| {
                error!(target: "cs.collaborators", error = %e, "Failed to build HTTP client");
                CsError::Internal(format!("failed to build HTTP client: {e}"))
            })?;

        let base_url: String = base_url.into();
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(&self, operation: &'static str, request: RequestBuilder) -> Result<Response, CsError> {
        let start = Instant::now();
        let result = request
            .bearer_auth(self.service_token.expose_secret())
            .send()
            .await;
        record_backend_call_latency(operation, start.elapsed());

        let response = result.map_err(|e| {
            if e.is_timeout() {
                warn!(target: "cs.collaborators", operation, "Backend request timed out");
                CsError::Timeout(format!("backend {operation} timed out"))
            } else {
                warn!(target: "cs.collaborators", operation, error = %e, "Backend request failed");
                CsError::BackendUnavailable(format!("backend {operation} failed: {e}"))
            }
        })?;

        check_status(operation, response).await
    }

    async fn json<T: DeserializeOwned>(operation: &'static str, response: Response) -> Result<T, CsError> {
        response.json().await.map_err(|e| {
            error!(target: "cs.collaborators", operation, error = %e, "Failed to parse backend response");
            CsError::Internal(format!("invalid backend {operation} response: {e}"))
        })
    }
}

/// Map non-success statuses to errors.
async fn check_status(operation: &'static str, response: Response) -> Result<Response, CsError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::NOT_FOUND => Err(CsError::NotFound(match operation {
            "find_user" => "user not found".to_string(),
            "find_class" => "class not found".to_string(),
            _ => "user or class not found".to_string(),
        })),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            warn!(target: "cs.collaborators", operation, status = %status, "Backend rejected request");
            Err(CsError::Unauthorized("request rejected by backend".to_string()))
        }
        StatusCode::BAD_REQUEST => {
            let body = response.text().await.unwrap_or_default();
            warn!(target: "cs.collaborators", operation, body = %body, "Backend returned bad request");
            Err(CsError::Validation("request rejected as invalid".to_string()))
        }
        s if s.is_server_error() => {
            warn!(target: "cs.collaborators", operation, status = %status, "Backend returned server error");
            Err(CsError::BackendUnavailable(format!(
                "backend {operation} returned {status}"
            )))
        }
        _ => {
            warn!(target: "cs.collaborators", operation, status = %status, "Unexpected backend response");
            Err(CsError::Internal(format!(
                "unexpected backend {operation} status {status}"
            )))
        }
    }
}

#[async_trait]
impl DirectoryClient for HttpBackendClient {
    #[instrument(skip_all, fields(user_id = %user))]
    async fn find_user_by_id(&self, user: &ParticipantId) -> Result<UserRecord, CsError> {
        let url = self.url(&format!("/internal/users/{user}"));
        let response = self.send("find_user", self.client.get(url)).await?;
        Self::json("find_user", response).await
    }

    #[instrument(skip_all, fields(class_id = %class))]
    async fn find_class_by_id(&self, class: &RoomId) -> Result<ClassRecord, CsError> {
        let url = self.url(&format!("/internal/classes/{class}"));
        let response = self.send("find_class", self.client.get(url)).await?;
        Self::json("find_class", response).await
    }
}

#[async_trait]
impl AttendanceClient for HttpBackendClient {
    #[instrument(skip_all, fields(user_id = %user, class_id = %class, status = status.as_str()))]
    async fn record_attendance_event(
        &self,
        user: &ParticipantId,
        class: &RoomId,
        status: AttendanceStatus,
    ) -> Result<(), CsError> {
        let body = AttendanceRequest {
            user_id: user,
            class_id: class,
            status,
        };
        let request = self.client.post(self.url("/internal/attendance")).json(&body);
        self.send("record_attendance", request).await?;
        Ok(())
    }
}

#[async_trait]
impl ChatClient for HttpBackendClient {
    #[instrument(skip_all, fields(user_id = %user, class_id = %class))]
    async fn create_chat_message(
        &self,
        message: &str,
        user: &ParticipantId,
        class: &RoomId,
    ) -> Result<ChatMessageRecord, CsError> {
        let body = ChatMessageRequest {
            message,
            user_id: user,
            class_id: class,
        };
        let request = self
            .client
            .post(self.url("/internal/chat-messages"))
            .json(&body);
        let response = self.send("create_chat_message", request).await?;
        Self::json("create_chat_message", response).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> HttpBackendClient {
        HttpBackendClient::new(
            server.uri(),
            SecretString::from("svc-token"),
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_find_user_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/users/u-1"))
            .and(header("authorization", "Bearer svc-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "user_id": "u-1",
                "full_name": "Ada Lovelace",
                "role": "teacher"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let user = client(&server)
            .find_user_by_id(&ParticipantId::from("u-1"))
            .await
            .unwrap();
        assert_eq!(user.full_name, "Ada Lovelace");
        assert_eq!(user.role.as_deref(), Some("teacher"));
    }

    #[tokio::test]
    async fn test_unknown_class_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/internal/classes/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .find_class_by_id(&RoomId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsError::NotFound(ref msg) if msg == "class not found"));
    }

    #[tokio::test]
    async fn test_rejected_token_is_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client(&server)
            .find_user_by_id(&ParticipantId::from("u-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_retriable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/attendance"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server)
            .record_attendance_event(
                &ParticipantId::from("u-1"),
                &RoomId::from("c-1"),
                AttendanceStatus::Joined,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CsError::BackendUnavailable(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_record_attendance_posts_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/attendance"))
            .and(body_json(json!({
                "user_id": "u-1",
                "class_id": "c-1",
                "status": "left"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .record_attendance_event(
                &ParticipantId::from("u-1"),
                &RoomId::from("c-1"),
                AttendanceStatus::Left,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_chat_message_returns_persisted_record() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/internal/chat-messages"))
            .and(body_json(json!({
                "message": "hello class",
                "user_id": "u-1",
                "class_id": "c-1"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "message_id": "m-42",
                "message": "hello class",
                "created_at": "2026-03-01T10:00:00Z",
                "user": {"user_id": "u-1", "full_name": "Ada Lovelace"}
            })))
            .mount(&server)
            .await;

        let record = client(&server)
            .create_chat_message("hello class", &ParticipantId::from("u-1"), &RoomId::from("c-1"))
            .await
            .unwrap();
        assert_eq!(record.message_id, "m-42");
        assert_eq!(record.user.user_id.as_str(), "u-1");
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(500))
                    .set_body_json(json!({"class_id": "c-1"})),
            )
            .mount(&server)
            .await;

        let client = HttpBackendClient::new(
            server.uri(),
            SecretString::from("svc-token"),
            Duration::from_millis(100),
        )
        .unwrap();
        let err = client
            .find_class_by_id(&RoomId::from("c-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_internal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let err = client(&server)
            .find_user_by_id(&ParticipantId::from("u-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CsError::Internal(_)));
    }

    #[test]
    fn test_trailing_slash_is_trimmed() {
        let client = HttpBackendClient::new(
            "http://backend:3001/",
            SecretString::from("t"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.url("/internal/users/a"), "http://backend:3001/internal/users/a");
    }
}
