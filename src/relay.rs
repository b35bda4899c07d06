//! Range-aware streaming relay.
//!
//! Opens the upstream media request, mirrors the client's `Range`, rewrites the
//! response headers and pipes the body through a bounded channel. Once the
//! response head has been returned, failures can only truncate the body.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::{
    body::{Body, Bytes},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{
            ACCEPT, ACCEPT_LANGUAGE, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH,
            CONTENT_RANGE, CONTENT_TYPE, RANGE, REFERER, USER_AGENT,
        },
    },
    response::Response,
};
use futures::Stream;
use rand::seq::IndexedRandom;
use thiserror::Error;
use tokio::{
    sync::mpsc,
    time::{Duration, timeout},
};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, Span, debug, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::validator::{PLATFORM, extract_video_id};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MEDIA_CONTENT_TYPE: &str = "video/mp4";
const UPSTREAM_REFERER: &str = "https://www.tiktok.com/";
const UPSTREAM_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const CHANNEL_CAPACITY: usize = 16;

const USER_AGENTS: [&str; 5] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

/// Direct media location plus the page it was resolved from.
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub direct_url: Url,
    pub source_url: Url,
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub range: Option<HeaderValue>,
    pub client_id: String,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("could not reach the media server: {0}")]
    UpstreamConnect(#[source] reqwest::Error),
    #[error("the media server did not answer within {}s", .0.as_secs())]
    UpstreamTimeout(Duration),
    #[error("media transfer interrupted: {0}")]
    UpstreamStream(String),
    #[error("could not build the {0} header")]
    InvalidHeader(&'static str),
    #[error("the server is shutting down")]
    ShuttingDown,
}

/// Shared upstream client and timing for every relay.
#[derive(Debug, Clone)]
pub struct Relay {
    client: reqwest::Client,
    idle_timeout: Duration,
    shutdown: CancellationToken,
}

impl Relay {
    pub fn new(idle_timeout: Duration) -> Result<Self, reqwest::Error> {
        // No whole-request timeout: long transfers are bounded per chunk instead.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            idle_timeout,
            shutdown: CancellationToken::new(),
        })
    }

    /// Open transfers are cut off once `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Starts relaying `media` and returns the response head once upstream answers.
    ///
    /// The body keeps streaming in a background task after this returns.
    pub async fn relay(
        &self,
        media: &ResolvedMedia,
        request: &RelayRequest,
    ) -> Result<Response, RelayError> {
        let relay_id = Uuid::new_v4();
        let span = info_span!("relay", %relay_id, client = %request.client_id);
        self.start(media, request).instrument(span).await
    }

    async fn start(
        &self,
        media: &ResolvedMedia,
        request: &RelayRequest,
    ) -> Result<Response, RelayError> {
        debug!(
            "Connecting upstream to {}",
            media.direct_url.host_str().unwrap_or("unknown host")
        );
        let upstream = timeout(
            self.idle_timeout,
            self.client
                .get(media.direct_url.clone())
                .headers(upstream_headers(request))
                .send(),
        )
        .await
        .map_err(|_| RelayError::UpstreamTimeout(self.idle_timeout))?
        .map_err(RelayError::UpstreamConnect)?;

        let status = downstream_status(upstream.status(), upstream.headers());
        let headers = downstream_headers(upstream.headers(), &media.source_url)?;
        info!(
            upstream_status = %upstream.status(),
            %status,
            range = request.range.is_some(),
            "Upstream headers received, streaming"
        );

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(
            pump(
                upstream,
                tx,
                cancel.clone(),
                self.shutdown.clone(),
                self.idle_timeout,
            )
            .instrument(Span::current()),
        );

        let mut response = Response::new(Body::from_stream(RelayBody {
            rx,
            _cancel_on_drop: cancel.drop_guard(),
        }));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

fn upstream_headers(request: &RelayRequest) -> HeaderMap {
    let user_agent = USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0]);

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(user_agent));
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static(UPSTREAM_ACCEPT_LANGUAGE),
    );
    headers.insert(REFERER, HeaderValue::from_static(UPSTREAM_REFERER));
    if let Some(range) = &request.range {
        headers.insert(RANGE, range.clone());
    }
    headers
}

/// Any upstream `Content-Range` means a partial body, whatever status was sent.
fn downstream_status(upstream: StatusCode, headers: &HeaderMap) -> StatusCode {
    if headers.contains_key(CONTENT_RANGE) {
        StatusCode::PARTIAL_CONTENT
    } else {
        upstream
    }
}

fn downstream_headers(upstream: &HeaderMap, source_url: &Url) -> Result<HeaderMap, RelayError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(MEDIA_CONTENT_TYPE));
    headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    for name in [CONTENT_LENGTH, CONTENT_RANGE] {
        if let Some(value) = upstream.get(&name) {
            headers.insert(name, value.clone());
        }
    }

    let disposition = content_disposition(source_url);
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&disposition)
            .map_err(|_| RelayError::InvalidHeader("Content-Disposition"))?,
    );

    Ok(headers)
}

pub fn content_disposition(source_url: &Url) -> String {
    let video_id = extract_video_id(source_url).unwrap_or_else(|| "video".to_string());
    format!("attachment; filename=\"{PLATFORM}-{video_id}.mp4\"")
}

#[derive(Debug)]
enum PumpOutcome {
    Completed,
    ClientGone,
    Truncated(RelayError),
}

async fn pump(
    mut upstream: reqwest::Response,
    tx: mpsc::Sender<io::Result<Bytes>>,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    idle_timeout: Duration,
) {
    let mut forwarded: u64 = 0;

    let outcome = 'pump: loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break 'pump PumpOutcome::ClientGone,
            _ = shutdown.cancelled() => {
                break 'pump PumpOutcome::Truncated(RelayError::ShuttingDown);
            }
            next = timeout(idle_timeout, upstream.chunk()) => next,
        };

        let chunk = match next {
            Ok(Ok(Some(chunk))) => chunk,
            Ok(Ok(None)) => break PumpOutcome::Completed,
            Ok(Err(error)) => {
                break PumpOutcome::Truncated(RelayError::UpstreamStream(error.to_string()));
            }
            Err(_) => {
                break PumpOutcome::Truncated(RelayError::UpstreamStream(format!(
                    "no data for {}s",
                    idle_timeout.as_secs()
                )));
            }
        };

        forwarded += chunk.len() as u64;
        let sent = tokio::select! {
            _ = shutdown.cancelled() => {
                break 'pump PumpOutcome::Truncated(RelayError::ShuttingDown);
            }
            sent = tx.send(Ok(chunk)) => sent,
        };
        if sent.is_err() {
            break PumpOutcome::ClientGone;
        }
    };

    // dropping the response here closes the upstream connection
    drop(upstream);

    match outcome {
        PumpOutcome::Completed => info!(forwarded, "Relay completed"),
        PumpOutcome::ClientGone => info!(forwarded, "Client disconnected, upstream aborted"),
        PumpOutcome::Truncated(error) => {
            warn!(forwarded, "Relay truncated: {error}");
            let _ = tx.send(Err(io::Error::other(error))).await;
        }
    }
}

/// Downstream body. Dropping it cancels the upstream pump.
struct RelayBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    _cancel_on_drop: DropGuard,
}

impl Stream for RelayBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex},
    };

    use axum::{
        Router,
        body::to_bytes,
        extract::Request,
        response::IntoResponse,
        routing::get,
    };
    use tokio::net::TcpListener;

    use super::*;

    async fn spawn_upstream(app: Router) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn media(addr: SocketAddr, source: &str) -> ResolvedMedia {
        ResolvedMedia {
            direct_url: Url::parse(&format!("http://{addr}/file.mp4")).unwrap(),
            source_url: Url::parse(source).unwrap(),
        }
    }

    fn request(range: Option<&'static str>) -> RelayRequest {
        RelayRequest {
            range: range.map(HeaderValue::from_static),
            client_id: "127.0.0.1".to_string(),
        }
    }

    fn relay() -> Relay {
        Relay::new(Duration::from_secs(5)).unwrap()
    }

    const SOURCE: &str = "https://www.tiktok.com/@user/video/1234567890";

    #[tokio::test]
    async fn content_range_forces_partial_content() {
        // upstream claims 200 but serves a range
        let upstream = Router::new().route(
            "/file.mp4",
            get(|| async {
                (
                    StatusCode::OK,
                    [(CONTENT_RANGE, "bytes 0-99/1000")],
                    vec![7u8; 100],
                )
            }),
        );
        let addr = spawn_upstream(upstream).await;

        let response = relay()
            .relay(&media(addr, SOURCE), &request(Some("bytes=0-99")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 0-99/1000");
        assert_eq!(response.headers()[CONTENT_LENGTH], "100");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 100);
    }

    #[tokio::test]
    async fn status_is_mirrored_without_content_range() {
        let upstream = Router::new().route(
            "/file.mp4",
            get(|| async { (StatusCode::NOT_FOUND, [(CONTENT_TYPE, "text/html")], "gone") }),
        );
        let addr = spawn_upstream(upstream).await;

        let response = relay()
            .relay(&media(addr, SOURCE), &request(None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(CONTENT_RANGE).is_none());
        assert_eq!(response.headers()[CONTENT_TYPE], "video/mp4");
        assert_eq!(response.headers()[ACCEPT_RANGES], "bytes");
    }

    #[tokio::test]
    async fn upstream_request_carries_browser_headers_and_range() {
        let seen: Arc<Mutex<Option<HeaderMap>>> = Arc::default();
        let captured = Arc::clone(&seen);
        let upstream = Router::new().route(
            "/file.mp4",
            get(move |request: Request| {
                let captured = Arc::clone(&captured);
                async move {
                    *captured.lock().unwrap() = Some(request.headers().clone());
                    (StatusCode::OK, "ok").into_response()
                }
            }),
        );
        let addr = spawn_upstream(upstream).await;

        let response = relay()
            .relay(&media(addr, SOURCE), &request(Some("bytes=100-199")))
            .await
            .unwrap();
        to_bytes(response.into_body(), usize::MAX).await.unwrap();

        let headers = seen.lock().unwrap().clone().unwrap();
        assert_eq!(headers[RANGE], "bytes=100-199");
        assert_eq!(headers[REFERER], "https://www.tiktok.com/");
        assert_eq!(headers[ACCEPT], "*/*");
        assert_eq!(headers[ACCEPT_LANGUAGE], "en-US,en;q=0.9");
        let user_agent = headers[USER_AGENT].to_str().unwrap();
        assert!(USER_AGENTS.iter().any(|candidate| *candidate == user_agent));
    }

    #[tokio::test]
    async fn range_is_not_invented() {
        let seen: Arc<Mutex<Option<HeaderMap>>> = Arc::default();
        let captured = Arc::clone(&seen);
        let upstream = Router::new().route(
            "/file.mp4",
            get(move |request: Request| {
                let captured = Arc::clone(&captured);
                async move {
                    *captured.lock().unwrap() = Some(request.headers().clone());
                    "ok"
                }
            }),
        );
        let addr = spawn_upstream(upstream).await;

        let response = relay()
            .relay(&media(addr, SOURCE), &request(None))
            .await
            .unwrap();
        to_bytes(response.into_body(), usize::MAX).await.unwrap();

        let headers = seen.lock().unwrap().clone().unwrap();
        assert!(headers.get(RANGE).is_none());
    }

    #[tokio::test]
    async fn content_length_is_only_forwarded_when_present() {
        let upstream = Router::new().route(
            "/file.mp4",
            get(|| async {
                let chunks = futures::stream::iter([
                    Ok::<_, io::Error>(Bytes::from_static(b"abc")),
                    Ok(Bytes::from_static(b"def")),
                ]);
                Body::from_stream(chunks)
            }),
        );
        let addr = spawn_upstream(upstream).await;

        let response = relay()
            .relay(&media(addr, SOURCE), &request(None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONTENT_LENGTH).is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"abcdef");
    }

    #[tokio::test]
    async fn upstream_failure_after_headers_truncates_the_body() {
        let upstream = Router::new().route(
            "/file.mp4",
            get(|| async {
                let chunks = futures::stream::unfold(0, |step| async move {
                    match step {
                        0 => Some((Ok(Bytes::from_static(b"partial")), 1)),
                        1 => {
                            // let the head and first chunk reach the relay
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Some((Err(io::Error::other("disk on fire")), 2))
                        }
                        _ => None,
                    }
                });
                ([(CONTENT_LENGTH, "1000")], Body::from_stream(chunks))
            }),
        );
        let addr = spawn_upstream(upstream).await;

        let response = relay()
            .relay(&media(addr, SOURCE), &request(None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_LENGTH], "1000");
        assert!(to_bytes(response.into_body(), usize::MAX).await.is_err());
    }

    #[tokio::test]
    async fn connection_failure_is_reported_before_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = relay().relay(&media(addr, SOURCE), &request(None)).await;
        assert!(matches!(result, Err(RelayError::UpstreamConnect(_))));
    }

    #[tokio::test]
    async fn silent_upstream_times_out_before_headers() {
        let upstream = Router::new().route(
            "/file.mp4",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let addr = spawn_upstream(upstream).await;

        let relay = Relay::new(Duration::from_millis(100)).unwrap();
        let result = relay.relay(&media(addr, SOURCE), &request(None)).await;
        assert!(matches!(result, Err(RelayError::UpstreamTimeout(_))));
    }

    #[tokio::test]
    async fn dropping_the_body_cancels_the_pump() {
        let (closed_tx, closed_rx) = tokio::sync::oneshot::channel::<()>();
        let closed_tx = Arc::new(Mutex::new(Some(closed_tx)));
        let upstream = Router::new().route(
            "/file.mp4",
            get(move || {
                let closed_tx = Arc::clone(&closed_tx);
                async move {
                    // endless body; the guard fires once the relay stops reading
                    struct NotifyOnDrop(Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>>);
                    impl Drop for NotifyOnDrop {
                        fn drop(&mut self) {
                            if let Some(tx) = self.0.lock().unwrap().take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    let guard = NotifyOnDrop(closed_tx);
                    let chunks = futures::stream::unfold(guard, |guard| async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Some((Ok::<_, io::Error>(Bytes::from_static(b"frame")), guard))
                    });
                    Body::from_stream(chunks)
                }
            }),
        );
        let addr = spawn_upstream(upstream).await;

        let response = relay()
            .relay(&media(addr, SOURCE), &request(None))
            .await
            .unwrap();
        drop(response);

        tokio::time::timeout(Duration::from_secs(5), closed_rx)
            .await
            .expect("upstream connection should close after the client goes away")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_aborts_open_transfers() {
        let upstream = Router::new().route(
            "/file.mp4",
            get(|| async {
                let chunks = futures::stream::unfold((), |()| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Some((Ok::<_, io::Error>(Bytes::from_static(b"frame")), ()))
                });
                Body::from_stream(chunks)
            }),
        );
        let addr = spawn_upstream(upstream).await;

        let shutdown = CancellationToken::new();
        let relay = relay().with_shutdown(shutdown.clone());
        let response = relay
            .relay(&media(addr, SOURCE), &request(None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        shutdown.cancel();
        let body = tokio::time::timeout(
            Duration::from_secs(5),
            to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .expect("the body should end once the server shuts down");
        assert!(body.is_err());
    }

    #[test]
    fn disposition_uses_the_video_id_or_falls_back() {
        let with_id = Url::parse(SOURCE).unwrap();
        assert_eq!(
            content_disposition(&with_id),
            "attachment; filename=\"tiktok-1234567890.mp4\""
        );

        let without_id = Url::parse("https://www.tiktok.com/@user").unwrap();
        assert_eq!(
            content_disposition(&without_id),
            "attachment; filename=\"tiktok-video.mp4\""
        );
    }

    #[test]
    fn forced_partial_status_only_with_content_range() {
        let mut headers = HeaderMap::new();
        assert_eq!(downstream_status(StatusCode::OK, &headers), StatusCode::OK);

        headers.insert(CONTENT_RANGE, HeaderValue::from_static("bytes 0-99/1000"));
        assert_eq!(
            downstream_status(StatusCode::OK, &headers),
            StatusCode::PARTIAL_CONTENT
        );
    }
}
