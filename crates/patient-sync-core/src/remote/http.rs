//! REST implementation of the remote patient service.
//!
//! | call   | request                                             |
//! |--------|-----------------------------------------------------|
//! | list   | `GET /patients?updated_since=..&search=..&limit=..` |
//! | get    | `GET /patients/{id}`                                |
//! | create | `POST /patients` + `Idempotency-Key`                |
//! | update | `PATCH /patients/{id}` + `Idempotency-Key`, `If-Match` |
//! | delete | `DELETE /patients/{id}` + `Idempotency-Key`, `If-Match` |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, IF_MATCH};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ListParams, RemoteError, RemotePatient, RemotePatientService, RemoteResult};
use crate::models::{PatientData, PatientPatch};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Longest error body carried into an error message.
const MAX_ERROR_BODY: usize = 500;

pub struct HttpPatientService {
    base_url: String,
    client: Client,
}

impl HttpPatientService {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self::with_client(base_url, client))
    }

    /// Use a preconfigured client (auth headers, proxies).
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "remote call rejected");
        Err(status_to_error(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let response = self.send(request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

#[async_trait]
impl RemotePatientService for HttpPatientService {
    async fn list_patients(&self, params: &ListParams) -> RemoteResult<Vec<RemotePatient>> {
        let request = self.client.get(self.url("/patients")).query(params);
        self.send_json(request).await
    }

    async fn get_patient(&self, remote_id: &str) -> RemoteResult<RemotePatient> {
        let request = self.client.get(self.url(&format!("/patients/{remote_id}")));
        self.send_json(request).await
    }

    async fn create_patient(
        &self,
        payload: &PatientData,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemotePatient> {
        let request = self
            .client
            .post(self.url("/patients"))
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string())
            .json(payload);
        self.send_json(request).await
    }

    async fn update_patient(
        &self,
        remote_id: &str,
        patch: &PatientPatch,
        base_version: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemotePatient> {
        let request = self
            .client
            .patch(self.url(&format!("/patients/{remote_id}")))
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string())
            .header(IF_MATCH, base_version.to_string())
            .json(patch);
        self.send_json(request).await
    }

    async fn delete_patient(
        &self,
        remote_id: &str,
        base_version: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("/patients/{remote_id}")))
            .header(IDEMPOTENCY_KEY, idempotency_key.to_string())
            .header(IF_MATCH, base_version.to_string());
        self.send(request).await.map(|_| ())
    }
}

/// Classify a non-success response.
///
/// A conflict body, when present, is the server's current record.
pub(crate) fn status_to_error(status: StatusCode, body: &str) -> RemoteError {
    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            let current = serde_json::from_str::<RemotePatient>(body).ok().map(Box::new);
            RemoteError::Conflict { current }
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => RemoteError::NotFound(truncate(body)),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(format!("HTTP {}", status.as_u16()))
        }
        s if s.is_client_error() => RemoteError::Validation(truncate(body)),
        s => RemoteError::Transient(format!("HTTP {}: {}", s.as_u16(), truncate(body))),
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else if e.is_decode() {
        RemoteError::Decode(e.to_string())
    } else {
        warn!(error = %e, "remote request failed");
        RemoteError::Transient(e.to_string())
    }
}

fn truncate(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const ADA: &str = r#"{
        "id": "p-1",
        "version": 1,
        "first_name": "Ada",
        "last_name": "Lovelace",
        "updated_at": "2024-03-01T12:00:00Z"
    }"#;

    fn service(server: &mockito::ServerGuard) -> HttpPatientService {
        HttpPatientService::new(server.url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_to_error(StatusCode::CONFLICT, ADA),
            RemoteError::Conflict { current: Some(ref p) } if p.version == 1
        ));
        assert!(matches!(
            status_to_error(StatusCode::PRECONDITION_FAILED, ""),
            RemoteError::Conflict { current: None }
        ));
        assert!(matches!(
            status_to_error(StatusCode::NOT_FOUND, "gone"),
            RemoteError::NotFound(_)
        ));
        assert!(matches!(
            status_to_error(StatusCode::UNPROCESSABLE_ENTITY, "last_name required"),
            RemoteError::Validation(ref msg) if msg == "last_name required"
        ));
        assert!(status_to_error(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(status_to_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
    }

    #[test]
    fn test_truncate_long_bodies() {
        let body = "é".repeat(400);
        let truncated = truncate(&body);
        assert!(truncated.ends_with("... (truncated)"));
        assert!(truncated.len() < body.len());
    }

    #[tokio::test]
    async fn test_create_sends_idempotency_key() {
        let mut server = mockito::Server::new_async().await;
        let key = Uuid::new_v4();
        let mock = server
            .mock("POST", "/patients")
            .match_header("idempotency-key", key.to_string().as_str())
            .match_body(Matcher::PartialJson(serde_json::json!({
                "first_name": "Ada",
                "last_name": "Lovelace"
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(ADA)
            .create_async()
            .await;

        let created = service(&server)
            .create_patient(&PatientData::new("Ada", "Lovelace"), key)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(created.id, "p-1");
        assert_eq!(created.version, 1);
        assert_eq!(created.data.full_name(), "Ada Lovelace");
    }

    #[tokio::test]
    async fn test_update_conflict_carries_server_state() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PATCH", "/patients/p-1")
            .match_header("if-match", "0")
            .with_status(409)
            .with_body(ADA)
            .create_async()
            .await;

        let patch = PatientPatch {
            phone: Some(Some("555-0100".into())),
            ..Default::default()
        };
        let err = service(&server)
            .update_patient("p-1", &patch, 0, Uuid::new_v4())
            .await
            .unwrap_err();

        mock.assert_async().await;
        match err {
            RemoteError::Conflict { current: Some(current) } => assert_eq!(current.id, "p-1"),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let mut server = mockito::Server::new_async().await;
        let delete = server
            .mock("DELETE", "/patients/p-1")
            .match_header("if-match", "3")
            .with_status(204)
            .create_async()
            .await;
        let list = server
            .mock("GET", "/patients")
            .match_query(Matcher::UrlEncoded("search".into(), "ada".into()))
            .with_status(200)
            .with_body(format!("[{ADA}]"))
            .create_async()
            .await;

        let svc = service(&server);
        svc.delete_patient("p-1", 3, Uuid::new_v4()).await.unwrap();
        let params = ListParams {
            search: Some("ada".into()),
            ..Default::default()
        };
        let patients = svc.list_patients(&params).await.unwrap();

        delete.assert_async().await;
        list.assert_async().await;
        assert_eq!(patients.len(), 1);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/patients/p-1")
            .with_status(503)
            .create_async()
            .await;

        let err = service(&server).get_patient("p-1").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_garbage_body_is_decode_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/patients/p-1")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let err = service(&server).get_patient("p-1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Decode(_)));
        assert!(!err.is_transient());
    }
}
