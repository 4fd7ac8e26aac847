//! ==============================================================================
//! repository.rs - oneM2M repository client
//! ==============================================================================
//!
//! purpose:
//!     create content instances in a container and fetch the latest one.
//!     the loops only see the `Repository` trait, so the http polling
//!     transport can be swapped without touching publisher.rs / poller.rs.
//!
//! wire format (Mobius over http):
//!     create: POST {base}/{ae}/{cnt}      body {"m2m:cin": {"con": "<json>"}}  -> 201
//!     latest: GET  {base}/{ae}/{cnt}/la                                        -> 200
//!
//!     every request carries X-M2M-RI (fresh uuid), X-M2M-Origin and X-M2M-RVI;
//!     create also sends `Content-Type: application/json;ty=4`.
//!
//! ==============================================================================

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::domain::{ContainerPath, RepositoryEntry};

const HEADER_REQUEST_ID: &str = "X-M2M-RI";
const HEADER_ORIGIN: &str = "X-M2M-Origin";
const HEADER_RELEASE: &str = "X-M2M-RVI";
const CONTENT_TYPE_CREATE_CIN: &str = "application/json;ty=4";
const BODY_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// timeout, refused connection, reset: skip the cycle
    #[error("request failed: {0}")]
    Transient(#[from] reqwest::Error),

    #[error("repository replied {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("malformed response body: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
}

/// a create the repository accepted with 201
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Accepted {
    pub resource_id: Option<String>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// create a new content instance whose `con` is `content`
    async fn create(&self, path: &ContainerPath, content: String) -> Result<Accepted, RepositoryError>;

    /// latest content instance of the container, `None` when there is none
    async fn fetch_latest(&self, path: &ContainerPath) -> Result<Option<RepositoryEntry>, RepositoryError>;
}

#[derive(Serialize)]
struct CreateBody<'a> {
    #[serde(rename = "m2m:cin")]
    cin: CreateCin<'a>,
}

#[derive(Serialize)]
struct CreateCin<'a> {
    con: &'a str,
}

#[derive(Deserialize)]
struct CinEnvelope {
    #[serde(rename = "m2m:cin")]
    cin: Option<Map<String, Value>>,
}

impl CinEnvelope {
    fn into_entry(self) -> Option<RepositoryEntry> {
        let cin = self.cin.filter(|cin| !cin.is_empty())?;
        Some(RepositoryEntry {
            resource_id: cin
                .get("ri")
                .and_then(Value::as_str)
                .filter(|ri| !ri.is_empty())
                .map(str::to_string),
            content: cin.get("con").cloned(),
        })
    }
}

/// http client for one originator
#[derive(Clone)]
pub struct HttpRepository {
    client: reqwest::Client,
    base_url: String,
    originator: String,
    release_version: String,
}

impl HttpRepository {
    pub fn new(
        base_url: impl Into<String>,
        originator: impl Into<String>,
        release_version: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, RepositoryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            originator: originator.into(),
            release_version: release_version.into(),
        })
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(%method, %url, %request_id, "repository request");
        self.client
            .request(method, url)
            .header(ACCEPT, "application/json")
            .header(HEADER_REQUEST_ID, request_id)
            .header(HEADER_ORIGIN, &self.originator)
            .header(HEADER_RELEASE, &self.release_version)
    }
}

#[async_trait]
impl Repository for HttpRepository {
    async fn create(&self, path: &ContainerPath, content: String) -> Result<Accepted, RepositoryError> {
        let body = CreateBody { cin: CreateCin { con: &content } };
        let response = self
            .request(reqwest::Method::POST, path.url(&self.base_url))
            .header(CONTENT_TYPE, CONTENT_TYPE_CREATE_CIN)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status != StatusCode::CREATED {
            return Err(protocol_error(status, &text));
        }

        // the created resource is echoed back; a body we can't read is still a success
        let resource_id = serde_json::from_str::<CinEnvelope>(&text)
            .ok()
            .and_then(CinEnvelope::into_entry)
            .and_then(|entry| entry.resource_id);
        Ok(Accepted { resource_id })
    }

    async fn fetch_latest(&self, path: &ContainerPath) -> Result<Option<RepositoryEntry>, RepositoryError> {
        let response = self
            .request(reqwest::Method::GET, path.latest_url(&self.base_url))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if status != StatusCode::OK {
            return Err(protocol_error(status, &text));
        }

        let envelope: CinEnvelope = serde_json::from_str(&text)?;
        Ok(envelope.into_entry())
    }
}

fn protocol_error(status: StatusCode, body: &str) -> RepositoryError {
    RepositoryError::Protocol {
        status: status.as_u16(),
        body: excerpt(body),
    }
}

/// first 200 characters, never splitting a character
fn excerpt(body: &str) -> String {
    match body.char_indices().nth(BODY_EXCERPT_CHARS) {
        Some((end, _)) => body[..end].to_string(),
        None => body.to_string(),
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::get;
    use axum::Router;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// one recorded request against the fake cse
    #[derive(Debug, Clone)]
    struct Seen {
        headers: HeaderMap,
        body: Option<Value>,
    }

    #[derive(Clone)]
    struct FakeCse {
        status: AxumStatus,
        reply: String,
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    async fn latest(State(cse): State<FakeCse>, headers: HeaderMap) -> (AxumStatus, String) {
        cse.seen.lock().unwrap().push(Seen { headers, body: None });
        (cse.status, cse.reply.clone())
    }

    async fn create(
        State(cse): State<FakeCse>,
        headers: HeaderMap,
        body: String,
    ) -> (AxumStatus, String) {
        let body = serde_json::from_str(&body).ok();
        cse.seen.lock().unwrap().push(Seen { headers, body });
        (cse.status, cse.reply.clone())
    }

    async fn slow(State(_): State<FakeCse>) -> AxumStatus {
        tokio::time::sleep(Duration::from_secs(5)).await;
        AxumStatus::OK
    }

    /// serve a fake Mobius on an ephemeral port, returning its base url
    async fn serve(status: AxumStatus, reply: impl Into<String>) -> (String, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let cse = FakeCse { status, reply: reply.into(), seen: seen.clone() };
        let app = Router::new()
            .route("/Mobius/FAN_AE/CMD/la", get(latest))
            .route("/Mobius/DHT_AE/DATA", axum::routing::post(create))
            .route("/Mobius/SLOW_AE/CMD/la", get(slow))
            .with_state(cse);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/Mobius", addr), seen)
    }

    fn client(base_url: &str) -> HttpRepository {
        HttpRepository::new(base_url, "SM2", "4", Duration::from_secs(3)).unwrap()
    }

    fn cmd() -> ContainerPath {
        ContainerPath::new("FAN_AE", "CMD")
    }

    #[tokio::test]
    async fn test_fetch_latest() {
        let reply = json!({"m2m:cin": {"ri": "4-20240101", "con": "{\"fan\": \"on\"}", "cs": 13}});
        let (base, seen) = serve(AxumStatus::OK, reply.to_string()).await;

        let entry = client(&base).fetch_latest(&cmd()).await.unwrap().unwrap();
        assert_eq!(entry.resource_id.as_deref(), Some("4-20240101"));
        assert_eq!(entry.content, Some(json!("{\"fan\": \"on\"}")));

        let seen = seen.lock().unwrap();
        let headers = &seen[0].headers;
        assert_eq!(headers["x-m2m-origin"], "SM2");
        assert_eq!(headers["x-m2m-rvi"], "4");
        assert_eq!(headers["accept"], "application/json");
        assert!(uuid::Uuid::parse_str(headers["x-m2m-ri"].to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_request_ids_are_fresh() {
        let (base, seen) = serve(AxumStatus::OK, "{}").await;
        let repo = client(&base);
        repo.fetch_latest(&cmd()).await.unwrap();
        repo.fetch_latest(&cmd()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_ne!(seen[0].headers["x-m2m-ri"], seen[1].headers["x-m2m-ri"]);
    }

    #[tokio::test]
    async fn test_fetch_latest_without_envelope() {
        let (base, _) = serve(AxumStatus::OK, "{}").await;
        assert_eq!(client(&base).fetch_latest(&cmd()).await.unwrap(), None);

        let (base, _) = serve(AxumStatus::OK, r#"{"m2m:cin": {}}"#).await;
        assert_eq!(client(&base).fetch_latest(&cmd()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_latest_empty_resource_id() {
        let (base, _) = serve(AxumStatus::OK, r#"{"m2m:cin": {"ri": "", "con": "x"}}"#).await;
        let entry = client(&base).fetch_latest(&cmd()).await.unwrap().unwrap();
        assert_eq!(entry.resource_id, None);
    }

    #[tokio::test]
    async fn test_fetch_latest_not_ok() {
        let (base, _) = serve(AxumStatus::NOT_FOUND, r#"{"m2m:dbg": "resource does not exist"}"#).await;
        match client(&base).fetch_latest(&cmd()).await {
            Err(RepositoryError::Protocol { status, body }) => {
                assert_eq!(status, 404);
                assert!(body.contains("does not exist"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_latest_garbage_body() {
        let (base, _) = serve(AxumStatus::OK, "<html>proxy error</html>").await;
        let result = client(&base).fetch_latest(&cmd()).await;
        assert!(matches!(result, Err(RepositoryError::InvalidEnvelope(_))));
    }

    #[tokio::test]
    async fn test_create() {
        let reply = json!({"m2m:cin": {"ri": "4-20240102", "con": "{}"}});
        let (base, seen) = serve(AxumStatus::CREATED, reply.to_string()).await;
        let repo = HttpRepository::new(&base, "SM", "4", Duration::from_secs(5)).unwrap();

        let accepted = repo
            .create(&ContainerPath::new("DHT_AE", "DATA"), r#"{"temp":23.0,"hum":55.0}"#.to_string())
            .await
            .unwrap();
        assert_eq!(accepted.resource_id.as_deref(), Some("4-20240102"));

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].headers["content-type"], "application/json;ty=4");
        assert_eq!(seen[0].headers["x-m2m-origin"], "SM");
        assert_eq!(
            seen[0].body,
            Some(json!({"m2m:cin": {"con": "{\"temp\":23.0,\"hum\":55.0}"}}))
        );
    }

    #[tokio::test]
    async fn test_create_accepts_empty_reply() {
        let (base, _) = serve(AxumStatus::CREATED, "").await;
        let repo = HttpRepository::new(&base, "SM", "4", Duration::from_secs(5)).unwrap();
        let accepted = repo.create(&ContainerPath::new("DHT_AE", "DATA"), "{}".to_string()).await.unwrap();
        assert_eq!(accepted, Accepted::default());
    }

    #[tokio::test]
    async fn test_create_rejected_truncates_body() {
        let (base, _) = serve(AxumStatus::FORBIDDEN, "x".repeat(500)).await;
        let repo = HttpRepository::new(&base, "SM", "4", Duration::from_secs(5)).unwrap();
        match repo.create(&ContainerPath::new("DHT_AE", "DATA"), "{}".to_string()).await {
            Err(RepositoryError::Protocol { status, body }) => {
                assert_eq!(status, 403);
                assert_eq!(body.len(), BODY_EXCERPT_CHARS);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = client(&format!("http://{}/Mobius", addr)).fetch_latest(&cmd()).await;
        assert!(matches!(result, Err(RepositoryError::Transient(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let (base, _) = serve(AxumStatus::OK, "{}").await;
        let repo = HttpRepository::new(&base, "SM2", "4", Duration::from_millis(100)).unwrap();
        let result = repo.fetch_latest(&ContainerPath::new("SLOW_AE", "CMD")).await;
        match result {
            Err(RepositoryError::Transient(e)) => assert!(e.is_timeout()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let body = "é".repeat(300);
        let cut = excerpt(&body);
        assert_eq!(cut.chars().count(), BODY_EXCERPT_CHARS);
        assert_eq!(excerpt("short"), "short");
    }
}
