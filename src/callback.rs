//! Loopback listener for the interactive consent redirect
//!
//! Serves `GET /callback` on `127.0.0.1:<port>` until the identity provider
//! redirects the browser back with either a code or an error, then hands the
//! query parameters to the waiting `auth` command and shuts down.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::auth::CallbackParams;
use crate::config::LOOPBACK_HOST;
use crate::errors::{AppError, AppResult};

#[derive(Clone)]
struct CallbackState {
    sender: Arc<Mutex<Option<oneshot::Sender<CallbackParams>>>>,
    shutdown: CancellationToken,
}

/// Router for the redirect endpoint
///
/// The first request carrying `code` or `error` is delivered on `sender`
/// and cancels `shutdown`; later requests only get the HTML page.
fn callback_router(sender: oneshot::Sender<CallbackParams>, shutdown: CancellationToken) -> Router {
    let state = CallbackState {
        sender: Arc::new(Mutex::new(Some(sender))),
        shutdown,
    };
    Router::new()
        .route("/callback", get(handle_callback))
        .with_state(state)
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let page = match (&params.code, &params.error) {
        (_, Some(error)) => {
            let detail = params.error_description.as_deref().unwrap_or_default();
            (
                StatusCode::BAD_REQUEST,
                Html(format!(
                    "<html><body><h1>Sign-in failed</h1><p>{}</p><p>{}</p></body></html>",
                    escape_html(error),
                    escape_html(detail)
                )),
            )
                .into_response()
        }
        (Some(_), None) => Html(
            "<html><body><h1>Sign-in complete</h1><p>You can close this window.</p></body></html>",
        )
        .into_response(),
        (None, None) => return StatusCode::NOT_FOUND.into_response(),
    };

    if let Some(sender) = state.sender.lock().await.take() {
        let _ = sender.send(params);
        state.shutdown.cancel();
    }
    page
}

/// Wait for one redirect on the loopback port
///
/// # Errors
///
/// - `Io` if the port cannot be bound
/// - `Timeout` if no redirect arrives within `wait`
pub async fn wait_for_callback(port: u16, wait: Duration) -> AppResult<CallbackParams> {
    let listener = tokio::net::TcpListener::bind((LOOPBACK_HOST, port))
        .await
        .map_err(|e| AppError::Io(format!("failed to listen on {LOOPBACK_HOST}:{port}: {e}")))?;
    tracing::info!(port, "waiting for sign-in redirect");

    let (tx, rx) = oneshot::channel();
    let shutdown = CancellationToken::new();
    let app = callback_router(tx, shutdown.clone());
    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
    });

    let result = tokio::time::timeout(wait, rx).await;
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "callback listener failed"),
        Err(e) => tracing::warn!(error = %e, "callback listener task failed"),
    }

    match result {
        Ok(Ok(params)) => Ok(params),
        Ok(Err(_)) => Err(AppError::Internal(
            "callback listener stopped before a redirect arrived".to_owned(),
        )),
        Err(_) => Err(AppError::Timeout(format!(
            "no sign-in redirect within {}s",
            wait.as_secs()
        ))),
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use super::{callback_router, escape_html};

    async fn call(uri: &str) -> (StatusCode, Option<super::CallbackParams>, bool) {
        let (tx, mut rx) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let response = callback_router(tx, shutdown.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).expect("request"))
            .await
            .expect("response");
        (response.status(), rx.try_recv().ok(), shutdown.is_cancelled())
    }

    #[tokio::test]
    async fn code_is_delivered_and_listener_stops() {
        let (status, params, stopped) = call("/callback?code=abc&state=s1&session_state=x").await;
        assert_eq!(status, StatusCode::OK);
        let params = params.expect("params delivered");
        assert_eq!(params.code.as_deref(), Some("abc"));
        assert_eq!(params.state.as_deref(), Some("s1"));
        assert!(stopped);
    }

    #[tokio::test]
    async fn provider_error_is_delivered_with_bad_request() {
        let (status, params, stopped) =
            call("/callback?error=access_denied&error_description=cancelled").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(params.expect("params").error.as_deref(), Some("access_denied"));
        assert!(stopped);
    }

    #[tokio::test]
    async fn unrelated_requests_are_ignored() {
        let (status, params, stopped) = call("/callback").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(params.is_none());
        assert!(!stopped);

        let (status, _, _) = call("/favicon.ico").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("<b>\"x\" & 'y'</b>"), "&lt;b&gt;&quot;x&quot; &amp; &#39;y&#39;&lt;/b&gt;");
    }
}
