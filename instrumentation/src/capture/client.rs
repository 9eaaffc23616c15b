//! Network capture source for `reqwest`.
//!
//! [`CapturingClient`] wraps a [`reqwest::Client`] and records every call it
//! executes while a session is installed. The caller gets back exactly what
//! the inner client returned: the same error on failure, and on success a
//! response with the same status, version, headers, URL and body bytes.
//!
//! When response bodies are captured, the body stream is tapped rather than
//! read up front. The record is published once the caller has read the body
//! to the end (or dropped the response), so capture never delays the caller.
//! The tapped response keeps the original extensions and body size hint, so
//! `content_length()` and `remote_addr()` report what they would have.
//!
//! A call whose future is dropped before the response arrives (a timeout,
//! `select!` or an aborted task) is discarded without a record.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), reqwest::Error> {
//! let _session = server_devtools::start(Default::default());
//! let client = server_devtools::capturing_client();
//!
//! let response = client.get("https://api.example.com/health").send().await?;
//! println!("{}", response.text().await?);
//! # Ok(())
//! # }
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http;
use http_body::{Body as HttpBody, Frame, SizeHint};
use reqwest::header::HeaderMap;
use reqwest::{Body, Client, IntoUrl, Method, Request, RequestBuilder, Response, ResponseBuilderExt};
use tracing::trace;

use super::network::{CallId, NetworkTracker, ResponseBody, ResponseInfo};
use super::{fail_open, CaptureHooks};
use crate::error::CaptureError;
use crate::types::{Headers, NetworkSource};

/// A `reqwest` client that records its calls into the installed session.
#[derive(Debug, Clone)]
pub struct CapturingClient {
    inner: Client,
    hooks: Arc<CaptureHooks>,
}

/// Builder returned by the request helpers. Send it with
/// [`CapturingClient::send`] or [`CapturingRequestBuilder::send`].
#[derive(Debug)]
pub struct CapturingRequestBuilder {
    client: CapturingClient,
    builder: RequestBuilder,
}

impl CapturingRequestBuilder {
    /// Adjusts the underlying `reqwest` builder.
    #[must_use]
    pub fn map(self, f: impl FnOnce(RequestBuilder) -> RequestBuilder) -> Self {
        Self {
            client: self.client,
            builder: f(self.builder),
        }
    }

    #[must_use]
    pub fn header(self, name: &str, value: &str) -> Self {
        self.map(|builder| builder.header(name, value))
    }

    #[must_use]
    pub fn body(self, body: impl Into<Body>) -> Self {
        self.map(|builder| builder.body(body))
    }

    /// Builds and executes the request.
    ///
    /// # Errors
    ///
    /// Returns the same error the inner client would.
    pub async fn send(self) -> reqwest::Result<Response> {
        self.client.send(self.builder).await
    }
}

impl CapturingClient {
    /// Wraps a default `reqwest::Client`.
    #[must_use]
    pub fn new(hooks: Arc<CaptureHooks>) -> Self {
        Self::with_client(Client::new(), hooks)
    }

    /// Wraps an existing client.
    #[must_use]
    pub fn with_client(inner: Client, hooks: Arc<CaptureHooks>) -> Self {
        Self { inner, hooks }
    }

    /// Returns the wrapped client. Calls made on it directly are not captured.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> CapturingRequestBuilder {
        CapturingRequestBuilder {
            client: self.clone(),
            builder: self.inner.request(method, url),
        }
    }

    pub fn get<U: IntoUrl>(&self, url: U) -> CapturingRequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post<U: IntoUrl>(&self, url: U) -> CapturingRequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put<U: IntoUrl>(&self, url: U) -> CapturingRequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn patch<U: IntoUrl>(&self, url: U) -> CapturingRequestBuilder {
        self.request(Method::PATCH, url)
    }

    pub fn delete<U: IntoUrl>(&self, url: U) -> CapturingRequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn head<U: IntoUrl>(&self, url: U) -> CapturingRequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Builds and executes a request made with the inner client's builder.
    ///
    /// # Errors
    ///
    /// Returns the same error the inner client would.
    pub async fn send(&self, builder: RequestBuilder) -> reqwest::Result<Response> {
        self.execute(builder.build()?).await
    }

    /// Executes a request, recording it if a session is installed.
    ///
    /// In-memory request bodies are captured. Streaming request bodies are
    /// sent untouched and recorded as absent.
    ///
    /// # Errors
    ///
    /// Returns the same error the inner client would.
    pub async fn execute(&self, request: Request) -> reqwest::Result<Response> {
        let Some(capture) = self.hooks.current() else {
            return self.inner.execute(request).await;
        };
        let tracker = Arc::clone(capture.network());
        let started = Instant::now();

        let call = fail_open("network start", || PendingCall::open(tracker, &request));
        let result = self.inner.execute(request).await;
        let Some(call) = call else {
            return result;
        };
        let (tracker, id) = call.disarm();

        match result {
            Ok(response) => Ok(record_response(tracker, id, started.elapsed(), response)),
            Err(error) => {
                let elapsed = started.elapsed();
                fail_open("network fail", || {
                    tracker.fail(id, &error, Some(elapsed)).map(drop)
                });
                Err(error)
            }
        }
    }
}

/// A started call that is abandoned if dropped before being handed on.
struct PendingCall {
    tracker: Arc<NetworkTracker>,
    id: CallId,
    armed: bool,
}

impl PendingCall {
    fn open(tracker: Arc<NetworkTracker>, request: &Request) -> Result<Self, CaptureError> {
        let id = tracker.start(
            NetworkSource::Reqwest,
            Some(request.method().as_str()),
            request.url().as_str(),
            header_map(request.headers()),
        );
        let call = Self {
            tracker,
            id,
            armed: true,
        };
        if let Some(bytes) = request.body().and_then(Body::as_bytes) {
            call.tracker.append_request_body(id, bytes)?;
        }
        Ok(call)
    }

    fn disarm(mut self) -> (Arc<NetworkTracker>, CallId) {
        self.armed = false;
        (Arc::clone(&self.tracker), self.id)
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.armed {
            trace!(call = %self.id, "Discarding cancelled call");
            self.tracker.abandon(self.id);
        }
    }
}

/// Flattens a header map, joining repeated headers with `", "`.
#[must_use]
pub fn header_map(headers: &HeaderMap) -> Headers {
    let mut out = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        out.entry(name.as_str().to_string())
            .and_modify(|existing: &mut String| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    out
}

fn record_response(
    tracker: Arc<NetworkTracker>,
    id: CallId,
    elapsed: Duration,
    response: Response,
) -> Response {
    let status = response.status();
    let info = ResponseInfo::new(status.as_u16(), status.canonical_reason().unwrap_or_default())
        .with_headers(header_map(response.headers()))
        .with_duration(elapsed);

    let Some(budget) = tracker.response_body_budget(id) else {
        fail_open("network finish", || tracker.finish(id, info).map(drop));
        return response;
    };

    // Converting to `http::Response` keeps head, extensions and body but not
    // the URL, which travels back in as an extension.
    let Ok(url) = http::Response::builder().url(response.url().clone()).body(()) else {
        fail_open("network finish", || tracker.finish(id, info).map(drop));
        return response;
    };
    let (mut parts, inner) = http::Response::<Body>::from(response).into_parts();
    parts.extensions.extend(url.into_parts().0.extensions);

    let tap = BodyTap {
        tracker,
        id,
        pending: Some(info),
        buffer: Vec::new(),
        budget,
    };
    let body = TappedBody { inner, tap };
    Response::from(http::Response::from_parts(parts, Body::wrap(body)))
}

/// Buffers body bytes for a pending call and closes it exactly once.
struct BodyTap {
    tracker: Arc<NetworkTracker>,
    id: CallId,
    pending: Option<ResponseInfo>,
    buffer: Vec<u8>,
    budget: usize,
}

impl BodyTap {
    fn push(&mut self, chunk: &[u8]) {
        let room = self.budget.saturating_sub(self.buffer.len());
        self.buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn complete(&mut self, body: ResponseBody) {
        let Some(info) = self.pending.take() else {
            return;
        };
        let (tracker, id) = (&self.tracker, self.id);
        fail_open("network finish", || {
            tracker.finish(id, info.with_body(body)).map(drop)
        });
    }

    fn complete_buffered(&mut self) {
        let bytes = std::mem::take(&mut self.buffer);
        self.complete(ResponseBody::Bytes(bytes));
    }
}

impl Drop for BodyTap {
    fn drop(&mut self) {
        // Response dropped before its body was read to the end.
        self.complete(ResponseBody::NotCaptured);
    }
}

/// Response body that copies data frames into a [`BodyTap`] as the caller
/// reads. Size hint and end-of-stream come from the inner body.
struct TappedBody {
    inner: Body,
    tap: BodyTap,
}

impl HttpBody for TappedBody {
    type Data = Bytes;
    type Error = reqwest::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, reqwest::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            Some(Ok(frame)) => {
                if let Some(chunk) = frame.data_ref() {
                    this.tap.push(chunk);
                }
            }
            Some(Err(_)) => this.tap.complete(ResponseBody::Unreadable),
            None => this.tap.complete_buffered(),
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
