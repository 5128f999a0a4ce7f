//! Microsoft Graph request pipeline
//!
//! Every Graph call goes through [`GraphClient::execute`] (JSON) or
//! [`GraphClient::download`] (raw bytes): acquire a bearer token, send with a
//! hard deadline, retry once with a fresh token on 401, and classify any
//! non-success status into an [`AppError`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::auth::{AccessToken, AuthManager};
use crate::errors::{AppError, AppResult};

/// Retry-After fallback when the header is absent or unparsable
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Decoded Graph response
#[derive(Debug, Clone, PartialEq)]
pub enum GraphResponse {
    Json(Value),
    /// 204, or a success with an empty body
    NoContent,
}

impl GraphResponse {
    /// JSON body, with `{"status":"success"}` standing in for no content
    pub fn into_json(self) -> Value {
        match self {
            Self::Json(v) => v,
            Self::NoContent => json!({ "status": "success" }),
        }
    }
}

/// Raw successful response
struct RawResponse {
    status: StatusCode,
    body: Bytes,
}

/// Authenticated Graph client shared by all tool handlers
pub struct GraphClient {
    auth: Arc<AuthManager>,
    base_url: String,
    scopes: Vec<String>,
    timeout: Duration,
    http: Mutex<Option<reqwest::Client>>,
}

impl GraphClient {
    pub fn new(
        auth: Arc<AuthManager>,
        base_url: impl Into<String>,
        scopes: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            auth,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            scopes,
            timeout,
            http: Mutex::new(None),
        }
    }

    /// Send one Graph request and decode the JSON result
    ///
    /// `path` is relative to the base URL and must start with `/`.
    ///
    /// # Errors
    ///
    /// - `AuthRequired` when no token can be acquired
    /// - `Unauthorized`, `Forbidden`, `NotFound`, `RateLimited`, `Provider`
    ///   per the response status
    /// - `Timeout` when no response arrives within the deadline
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(String, String)]>,
        body: Option<&Value>,
    ) -> AppResult<GraphResponse> {
        let raw = self.send_authorized(method, path, query, body).await?;
        if raw.status == StatusCode::NO_CONTENT || raw.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(GraphResponse::NoContent);
        }
        serde_json::from_slice(&raw.body)
            .map(GraphResponse::Json)
            .map_err(|e| AppError::Provider(format!("invalid JSON from Graph for {path}: {e}")))
    }

    pub async fn get(&self, path: &str, query: &[(String, String)]) -> AppResult<Value> {
        self.execute(Method::GET, path, Some(query), None)
            .await
            .map(GraphResponse::into_json)
    }

    pub async fn post(&self, path: &str, body: &Value) -> AppResult<Value> {
        self.execute(Method::POST, path, None, Some(body))
            .await
            .map(GraphResponse::into_json)
    }

    pub async fn patch(&self, path: &str, body: &Value) -> AppResult<Value> {
        self.execute(Method::PATCH, path, None, Some(body))
            .await
            .map(GraphResponse::into_json)
    }

    pub async fn delete(&self, path: &str) -> AppResult<Value> {
        self.execute(Method::DELETE, path, None, None)
            .await
            .map(GraphResponse::into_json)
    }

    /// Fetch a binary resource (e.g. attachment `$value`)
    pub async fn download(&self, path: &str) -> AppResult<Bytes> {
        self.send_authorized(Method::GET, path, None, None)
            .await
            .map(|raw| raw.body)
    }

    /// Drop the pooled connection; the next request opens a new one
    pub async fn close(&self) {
        if self.http.lock().await.take().is_some() {
            tracing::debug!("closed Graph HTTP client");
        }
    }

    async fn client(&self) -> AppResult<reqwest::Client> {
        let mut guard = self.http.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn send_authorized(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(String, String)]>,
        body: Option<&Value>,
    ) -> AppResult<RawResponse> {
        let mut retried = false;
        loop {
            let token = self.auth.acquire_token(&self.scopes).await?;
            let (status, headers, bytes) =
                self.send_once(&token, method.clone(), path, query, body).await?;

            if status.is_success() {
                tracing::debug!(method = %method, path, status = status.as_u16(), "graph call ok");
                return Ok(RawResponse {
                    status,
                    body: bytes,
                });
            }
            if status == StatusCode::UNAUTHORIZED && !retried {
                tracing::info!(
                    method = %method,
                    path,
                    "graph rejected token; retrying with a fresh one"
                );
                self.auth.invalidate(&token.bearer).await;
                retried = true;
                continue;
            }

            let err = classify_status(status, &headers, &bytes);
            tracing::warn!(
                method = %method,
                path,
                status = status.as_u16(),
                code = err.kind().as_str(),
                retryable = err.is_retryable(),
                "graph call failed"
            );
            return Err(err);
        }
    }

    async fn send_once(
        &self,
        token: &AccessToken,
        method: Method,
        path: &str,
        query: Option<&[(String, String)]>,
        body: Option<&Value>,
    ) -> AppResult<(StatusCode, HeaderMap, Bytes)> {
        let client = self.client().await?;
        let url = format!("{}{}", self.base_url, path);
        let mut request = client
            .request(method.clone(), &url)
            .bearer_auth(token.bearer.expose_secret())
            .header(CONTENT_TYPE, "application/json");
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, bytes))
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) if e.is_timeout() => Err(timeout_error(&method, path, self.timeout)),
            Ok(Err(e)) => Err(AppError::Provider(format!(
                "request to Graph failed ({method} {path}): {e}"
            ))),
            Err(_) => Err(timeout_error(&method, path, self.timeout)),
        }
    }
}

fn timeout_error(method: &Method, path: &str, timeout: Duration) -> AppError {
    AppError::Timeout(format!(
        "{method} {path} exceeded {}s",
        timeout.as_secs_f32()
    ))
}

/// Map a non-success Graph status to an error kind
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> AppError {
    let message = provider_message(body).unwrap_or_else(|| {
        status
            .canonical_reason()
            .unwrap_or("unknown error")
            .to_owned()
    });
    match status {
        StatusCode::UNAUTHORIZED => AppError::Unauthorized(message),
        StatusCode::FORBIDDEN => AppError::Forbidden(message),
        StatusCode::NOT_FOUND => AppError::NotFound(message),
        StatusCode::TOO_MANY_REQUESTS => AppError::RateLimited {
            retry_after_secs: retry_after(headers),
        },
        _ => AppError::Provider(format!("Graph returned {}: {message}", status.as_u16())),
    }
}

/// `error.message` from a Graph error body
fn provider_message(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .filter(|m| !m.trim().is_empty())
        .map(str::to_owned)
}

fn retry_after(headers: &HeaderMap) -> u64 {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use reqwest::Method;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{GraphClient, GraphResponse};
    use crate::auth::graph_scopes;
    use crate::auth::testing::signed_in;
    use crate::errors::{AppError, ErrorKind};

    async fn signed_in_client(server: &MockServer, dir: &tempfile::TempDir) -> GraphClient {
        let auth = signed_in(dir.path()).await;
        GraphClient::new(
            Arc::new(auth),
            server.uri(),
            graph_scopes(),
            Duration::from_millis(500),
        )
    }

    async fn mount_status(server: &MockServer, status: u16, body: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/me/messages/x"))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .mount(server)
            .await;
    }

    fn graph_error(message: &str) -> serde_json::Value {
        json!({ "error": { "code": "SomeCode", "message": message } })
    }

    #[tokio::test]
    async fn success_returns_json_with_bearer_and_query() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/me/messages"))
            .and(header("authorization", "Bearer access-1"))
            .and(query_param("$top", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
            .mount(&server)
            .await;

        let client = signed_in_client(&server, &dir).await;
        let value = client
            .get("/me/messages", &[("$top".to_owned(), "5".to_owned())])
            .await
            .expect("list");
        assert_eq!(value, json!({ "value": [] }));
    }

    #[tokio::test]
    async fn no_content_is_a_success_marker() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("DELETE"))
            .and(path("/me/events/e1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = signed_in_client(&server, &dir).await;
        let response = client
            .execute(Method::DELETE, "/me/events/e1", None, None)
            .await
            .expect("delete");
        assert_eq!(response, GraphResponse::NoContent);
        assert_eq!(response.into_json(), json!({ "status": "success" }));
    }

    #[tokio::test]
    async fn accepted_with_empty_body_is_no_content() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("POST"))
            .and(path("/me/sendMail"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/me/messages/m1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("  \n"))
            .mount(&server)
            .await;

        let client = signed_in_client(&server, &dir).await;
        let sent = client
            .execute(
                Method::POST,
                "/me/sendMail",
                None,
                Some(&json!({ "message": { "subject": "hi" } })),
            )
            .await
            .expect("send");
        assert_eq!(sent, GraphResponse::NoContent);

        let patched = client
            .execute(Method::PATCH, "/me/messages/m1", None, Some(&json!({ "isRead": true })))
            .await
            .expect("patch");
        assert_eq!(patched, GraphResponse::NoContent);
    }

    #[tokio::test]
    async fn status_codes_map_to_error_kinds() {
        for (status, kind) in [
            (403, ErrorKind::Forbidden),
            (404, ErrorKind::NotFound),
            (500, ErrorKind::ProviderError),
        ] {
            let server = MockServer::start().await;
            let dir = tempfile::tempdir().expect("tempdir");
            mount_status(&server, status, graph_error("boom detail")).await;
            let client = signed_in_client(&server, &dir).await;
            let err = client.get("/me/messages/x", &[]).await.expect_err("must fail");
            assert_eq!(err.kind(), kind, "status {status}");
            assert!(err.to_string().contains("boom detail"), "status {status}");
        }
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/me/messages/x"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;
        let client = signed_in_client(&server, &dir).await;
        let err = client.get("/me/messages/x", &[]).await.expect_err("must fail");
        assert_eq!(err.retry_after_secs(), Some(7));
    }

    #[tokio::test]
    async fn rate_limit_without_header_defaults_to_sixty() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        mount_status(&server, 429, graph_error("slow down")).await;
        let client = signed_in_client(&server, &dir).await;
        let err = client.get("/me/messages/x", &[]).await.expect_err("must fail");
        assert!(matches!(err, AppError::RateLimited { retry_after_secs: 60 }));
    }

    #[tokio::test]
    async fn unauthorized_retries_once_with_fresh_token() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("authorization", "Bearer access-1"))
            .respond_with(ResponseTemplate::new(401).set_body_json(graph_error("expired")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/me"))
            .and(header("authorization", "Bearer access-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "displayName": "Ada" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = signed_in_client(&server, &dir).await;
        let value = client.get("/me", &[]).await.expect("retried");
        assert_eq!(value["displayName"], "Ada");
    }

    #[tokio::test]
    async fn persistent_unauthorized_surfaces_after_one_retry() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(401).set_body_json(graph_error("revoked")))
            .expect(2)
            .mount(&server)
            .await;

        let client = signed_in_client(&server, &dir).await;
        let err = client.get("/me", &[]).await.expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({}))
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;

        let client = signed_in_client(&server, &dir).await;
        let err = client.get("/me", &[]).await.expect_err("must time out");
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn client_reopens_after_close() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "1" })))
            .mount(&server)
            .await;

        let client = signed_in_client(&server, &dir).await;
        client.get("/me", &[]).await.expect("first");
        client.close().await;
        client.close().await;
        client.get("/me", &[]).await.expect("after close");
    }

    #[tokio::test]
    async fn download_returns_raw_bytes() {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().expect("tempdir");
        Mock::given(method("GET"))
            .and(path("/me/messages/m/attachments/a/$value"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8, 159, 146, 150]))
            .mount(&server)
            .await;

        let client = signed_in_client(&server, &dir).await;
        let bytes = client
            .download("/me/messages/m/attachments/a/$value")
            .await
            .expect("download");
        assert_eq!(bytes.as_ref(), &[0u8, 159, 146, 150]);
    }
}
