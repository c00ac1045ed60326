// =============================================================================
// Matrixon Client SDK - HTTP Request Executor
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-03-21
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The single primitive every endpoint call goes through: builds one HTTP
//   request with JSON (de)serialization, correlates attempts under a
//   monotonic request id, and applies a bounded retry policy with binary
//   exponential backoff. Rate-limit responses honor the server-specified
//   Retry-After delay. Large responses can be streamed to a file instead of
//   buffered in memory.
//
// Features:
//   • Bounded retries on transport errors and HTTP 502/503/504
//   • Rate-limit aware (429 + Retry-After header or retry_after_ms body)
//   • Parsed Matrix error envelopes on terminal failures
//   • Request/response observer hooks for metrics
//   • Streaming download into a caller-supplied file path
//
// =============================================================================

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use matrixon_client_common::{ClientError, RequestContext, Result};

use crate::responses::RespError;

/// Default base delay for the exponential backoff between retries.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(4);

/// Default whole-request timeout. Long polls must stay well below this.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);

/// How much of an unrecognized error body is kept on the error.
const BODY_EXCERPT_LEN: usize = 512;

/// Identity of one outbound request attempt, passed to observers and logged
/// on every attempt.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Monotonic per-executor request id
    pub id: u64,
    /// 1-based attempt number within this request
    pub attempt: u32,
    pub method: Method,
    pub url: Url,
}

/// What came back from one attempt, as seen by observers.
#[derive(Debug, Clone)]
pub enum ResponseOutcome {
    /// A response arrived with this status code
    Status(u16),
    /// The attempt failed below HTTP (connect, timeout, ...)
    TransportError(String),
}

/// Metrics/inspection hook invoked around every request attempt, independent
/// of whether the attempt is retried afterwards.
pub trait RequestObserver: Send + Sync {
    fn on_request(&self, info: &RequestInfo);
    fn on_response(&self, info: &RequestInfo, outcome: &ResponseOutcome);
}

/// One outbound request. Body is pre-serialized JSON so that retries can
/// resend it without re-serializing.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub body: Option<serde_json::Value>,
    /// Total attempts allowed; `None` uses the executor default
    pub max_attempts: Option<u32>,
    /// Per-request timeout override (used by long polls)
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
            max_attempts: None,
            timeout: None,
        }
    }

    /// Attach a JSON body.
    pub fn with_json<B: Serialize>(mut self, body: &B) -> Result<Self> {
        let value = serde_json::to_value(body).map_err(|e| ClientError::Decode {
            context: RequestContext {
                method: self.method.to_string(),
                url: self.url.to_string(),
                attempts: 0,
            },
            message: format!("failed to encode request body: {e}"),
        })?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Executes HTTP requests with retry, rate-limit handling and logging.
///
/// One executor is shared by the sync loop driver, the endpoint helpers and
/// the server-backed sync store. Retry sleeps block only the calling task;
/// unrelated concurrent requests are unaffected.
pub struct HttpExecutor {
    client: reqwest::Client,
    user_agent: String,
    access_token: RwLock<Option<String>>,
    default_max_attempts: u32,
    base_backoff: Duration,
    rate_limit_backoff: bool,
    request_counter: AtomicU64,
    observers: RwLock<Vec<Arc<dyn RequestObserver>>>,
}

impl std::fmt::Debug for HttpExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpExecutor")
            .field("user_agent", &self.user_agent)
            .field("default_max_attempts", &self.default_max_attempts)
            .field("base_backoff", &self.base_backoff)
            .field("rate_limit_backoff", &self.rate_limit_backoff)
            .finish_non_exhaustive()
    }
}

/// Configuration for building an [`HttpExecutor`].
#[derive(Debug, Clone)]
pub struct HttpExecutorConfig {
    pub user_agent: String,
    pub access_token: Option<String>,
    /// Total attempts per request (1 = no retries)
    pub max_attempts: u32,
    pub base_backoff: Duration,
    /// When false, 429 responses surface immediately instead of sleeping
    pub rate_limit_backoff: bool,
    pub request_timeout: Duration,
}

impl Default for HttpExecutorConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("matrixon-client/", env!("CARGO_PKG_VERSION")).to_string(),
            access_token: None,
            max_attempts: 1,
            base_backoff: DEFAULT_BASE_BACKOFF,
            rate_limit_backoff: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl HttpExecutor {
    pub fn new(config: HttpExecutorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            user_agent: config.user_agent,
            access_token: RwLock::new(config.access_token),
            default_max_attempts: config.max_attempts.max(1),
            base_backoff: config.base_backoff,
            rate_limit_backoff: config.rate_limit_backoff,
            request_counter: AtomicU64::new(0),
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Replace the bearer token used for all subsequent requests.
    pub fn set_access_token(&self, token: Option<String>) {
        *self
            .access_token
            .write()
            .unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// Register an observer invoked around every attempt.
    pub fn add_observer(&self, observer: Arc<dyn RequestObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Execute a request and decode the 2xx response body as JSON.
    pub async fn execute<R: DeserializeOwned>(&self, request: HttpRequest) -> Result<R> {
        let context = RequestContext {
            method: request.method.to_string(),
            url: request.url.to_string(),
            attempts: 0,
        };
        let bytes = self.execute_raw(request).await?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode {
            context,
            message: e.to_string(),
        })
    }

    /// Execute a request and return the raw 2xx response body.
    pub async fn execute_raw(&self, request: HttpRequest) -> Result<Vec<u8>> {
        let response = self.request_with_retries(&request).await?;
        let context = self.context_for(&request, 0);
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ClientError::Transport {
                context,
                message: format!("failed to read response body: {e}"),
            })
    }

    /// Execute a request and stream the 2xx response body to `path`,
    /// bounding peak memory for large payloads. Returns the byte count.
    pub async fn execute_to_file(&self, request: HttpRequest, path: &Path) -> Result<u64> {
        let response = self.request_with_retries(&request).await?;
        let context = self.context_for(&request, 0);
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| ClientError::Store(format!("failed to create {}: {e}", path.display())))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::Transport {
                context: context.clone(),
                message: format!("failed to read response body: {e}"),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ClientError::Store(format!("failed to write {}: {e}", path.display())))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| ClientError::Store(format!("failed to flush {}: {e}", path.display())))?;
        Ok(written)
    }

    /// Retry loop shared by all execute variants. Returns the first 2xx
    /// response; classifies and possibly retries everything else.
    async fn request_with_retries(&self, request: &HttpRequest) -> Result<reqwest::Response> {
        let max_attempts = request.max_attempts.unwrap_or(self.default_max_attempts).max(1);
        let request_id = self.request_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let mut backoff = self.base_backoff;
        let mut attempt: u32 = 1;

        loop {
            let info = RequestInfo {
                id: request_id,
                attempt,
                method: request.method.clone(),
                url: request.url.clone(),
            };
            match self.attempt_once(request, &info).await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if !error.is_retryable() || attempt >= max_attempts {
                        return Err(error);
                    }
                    let delay = match &error {
                        ClientError::RateLimited { retry_after, .. } => {
                            if !self.rate_limit_backoff {
                                return Err(error);
                            }
                            retry_after.unwrap_or(backoff)
                        }
                        _ => backoff,
                    };
                    warn!(
                        request_id,
                        attempt,
                        "Request failed ({error}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt: send, notify observers, classify the outcome.
    async fn attempt_once(
        &self,
        request: &HttpRequest,
        info: &RequestInfo,
    ) -> Result<reqwest::Response> {
        self.notify_request(info);

        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .header(reqwest::header::USER_AGENT, &self.user_agent);
        if let Some(token) = self
            .access_token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
        {
            builder = builder.bearer_auth(token);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        match &request.body {
            Some(body) => {
                debug!(
                    request_id = info.id,
                    attempt = info.attempt,
                    "req: {} {} {}",
                    info.method,
                    info.url,
                    body
                );
                builder = builder.json(body);
            }
            None if request.method != Method::GET && request.method != Method::HEAD => {
                // Some servers reject JSON endpoints without a JSON body.
                debug!(
                    request_id = info.id,
                    attempt = info.attempt,
                    "req: {} {} {{}}",
                    info.method,
                    info.url
                );
                builder = builder.json(&serde_json::json!({}));
            }
            None => {
                debug!(
                    request_id = info.id,
                    attempt = info.attempt,
                    "req: {} {}",
                    info.method,
                    info.url
                );
            }
        }

        let context = self.context_for(request, info.attempt);
        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                self.notify_response(info, &ResponseOutcome::TransportError(error.to_string()));
                return Err(ClientError::Transport {
                    context,
                    message: error.to_string(),
                });
            }
        };
        let status = response.status();
        self.notify_response(info, &ResponseOutcome::Status(status.as_u16()));

        if status.is_success() {
            return Ok(response);
        }

        // Read the body on every non-2xx response so the terminal error can
        // carry the Matrix error envelope, retryable statuses included.
        let retry_after_header = parse_retry_after(response.headers());
        let body = response.bytes().await.unwrap_or_default();
        let envelope: Option<RespError> = serde_json::from_slice::<RespError>(&body)
            .ok()
            .filter(|e| !e.errcode.is_empty());

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after_header.or_else(|| {
                envelope
                    .as_ref()
                    .and_then(|e| e.retry_after_ms)
                    .map(Duration::from_millis)
            });
            return Err(ClientError::RateLimited {
                context,
                retry_after,
                errcode: envelope.map(|e| e.errcode),
            });
        }

        let (errcode, message, excerpt) = match envelope {
            Some(envelope) => (Some(envelope.errcode), Some(envelope.error), None),
            None => {
                let excerpt = String::from_utf8_lossy(&body);
                (
                    None,
                    None,
                    Some(excerpt.chars().take(BODY_EXCERPT_LEN).collect::<String>()),
                )
            }
        };

        if matches!(
            status,
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
        ) {
            return Err(ClientError::Server {
                context,
                status: status.as_u16(),
                errcode,
                message,
                body: excerpt,
            });
        }

        Err(ClientError::Http {
            context,
            status: status.as_u16(),
            errcode,
            message,
            body: excerpt,
        })
    }

    fn context_for(&self, request: &HttpRequest, attempts: u32) -> RequestContext {
        RequestContext {
            method: request.method.to_string(),
            url: request.url.to_string(),
            attempts,
        }
    }

    fn notify_request(&self, info: &RequestInfo) {
        // Clone out of the lock so an observer may register further
        // observers without deadlocking.
        let observers: Vec<Arc<dyn RequestObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.on_request(info);
        }
    }

    fn notify_response(&self, info: &RequestInfo, outcome: &ResponseOutcome) {
        let observers: Vec<Arc<dyn RequestObserver>> = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.on_response(info, outcome);
        }
    }
}

/// Parse a `Retry-After` header value: integer seconds or an HTTP-date.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (when.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

/// Build a client-API URL under `/_matrix/client/r0` with percent-encoded
/// path segments.
pub(crate) fn client_api_url(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            ClientError::InvalidConfig("homeserver URL cannot be used as a base".to_string())
        })?;
        path.pop_if_empty();
        path.extend(["_matrix", "client", "r0"]);
        path.extend(segments);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_integer_seconds() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(RETRY_AFTER, "2".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(2)));
    }

    #[test]
    fn retry_after_http_date() {
        let when = Utc::now() + chrono::Duration::seconds(30);
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(RETRY_AFTER, when.to_rfc2822().parse().unwrap());
        let parsed = parse_retry_after(&headers).expect("date should parse");
        assert!(parsed <= Duration::from_secs(30));
        assert!(parsed >= Duration::from_secs(25));
    }

    #[test]
    fn retry_after_garbage_is_none() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), None);
    }

    #[test]
    fn client_api_url_encodes_segments() {
        let base = Url::parse("https://matrix.example.org").unwrap();
        let url = client_api_url(&base, &["user", "@alice:example.org", "filter"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/r0/user/@alice:example.org/filter"
        );
    }

    #[test]
    fn request_body_encoding_failure_surfaces() {
        let url = Url::parse("https://matrix.example.org/").unwrap();
        // maps with non-string keys cannot be encoded as JSON objects
        let body = std::collections::HashMap::from([(vec![1u8], "value")]);
        let request = HttpRequest::new(Method::POST, url).with_json(&body);
        assert!(matches!(request, Err(ClientError::Decode { .. })));
    }

    struct NoopObserver;

    impl RequestObserver for NoopObserver {
        fn on_request(&self, _info: &RequestInfo) {}
        fn on_response(&self, _info: &RequestInfo, _outcome: &ResponseOutcome) {}
    }

    /// Registers another observer from inside its own callback.
    struct SelfRegisteringObserver {
        executor: std::sync::Mutex<Option<Arc<HttpExecutor>>>,
    }

    impl RequestObserver for SelfRegisteringObserver {
        fn on_request(&self, _info: &RequestInfo) {
            if let Some(executor) = self
                .executor
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
            {
                executor.add_observer(Arc::new(NoopObserver));
            }
        }

        fn on_response(&self, _info: &RequestInfo, _outcome: &ResponseOutcome) {}
    }

    #[test]
    fn observer_may_register_observers_from_its_callback() {
        let executor = Arc::new(HttpExecutor::new(HttpExecutorConfig::default()).unwrap());
        executor.add_observer(Arc::new(SelfRegisteringObserver {
            executor: std::sync::Mutex::new(Some(Arc::clone(&executor))),
        }));

        let info = RequestInfo {
            id: 1,
            attempt: 1,
            method: Method::GET,
            url: Url::parse("https://matrix.example.org/").unwrap(),
        };
        executor.notify_request(&info);

        let count = executor
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len();
        assert_eq!(count, 2);
    }
}
