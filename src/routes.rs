use std::{collections::HashSet, net::SocketAddr, sync::Arc};

use anyhow::{Context, bail};
use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, State, rejection::QueryRejection},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{ACCEPT_RANGES, ALLOW, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE},
    },
    response::{Html, IntoResponse, Response},
    routing::get,
};
use chrono::{SecondsFormat, Utc};
use serde::Deserialize;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    config::non_empty,
    error::{ApiError, panic_response},
    extractor::{ExtractError, MediaResolver},
    rate_limit::{RateLimitExceeded, RateLimiter},
    relay::{Relay, RelayError, RelayRequest, ResolvedMedia},
    validator::{ValidationError, validate_source_url},
};

const INDEX_PAGE: &str = include_str!("../static/index.html");
const UNAVAILABLE_HINT: &str = "The video might be private or unavailable.";

#[derive(Clone)]
pub struct AppState {
    pub rate_limiter: Arc<RateLimiter>,
    pub resolver: Arc<dyn MediaResolver>,
    pub relay: Relay,
    pub trust_proxy_headers: bool,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    url: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/web", get(index))
        .route("/web/", get(index))
        .route("/health", get(health))
        .route("/download", get(download).head(download_head))
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

/// Refused without running the download pipeline.
async fn download_head() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, [(ALLOW, "GET")]).into_response()
}

/// Validate, admit, resolve, then relay. Each stage gates the next.
async fn download(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| {
        debug!("Rejected query string: {rejection}");
        ApiError::bad_request(
            "Invalid TikTok URL",
            "INVALID_URL",
            "The url query parameter must be given exactly once.",
        )
    })?;

    let raw_url = query.url.as_deref().and_then(non_empty).ok_or_else(|| {
        ApiError::bad_request(
            "Missing URL parameter",
            "MISSING_URL",
            "Please provide a TikTok video URL in the query parameter: ?url=<tiktok_url>",
        )
    })?;

    let source = validate_source_url(raw_url)?;
    debug!(video_id = ?source.video_id, "Accepted {}", source.url);

    let client_id = client_ip_for_request(state.trust_proxy_headers, &headers, addr);
    state
        .rate_limiter
        .check(&client_id)
        .await
        .inspect_err(|_| info!("Rate limit reached for {client_id}"))?;

    let direct_url = state
        .resolver
        .resolve(&source.url)
        .await
        .inspect_err(|error| warn!("Extraction failed for {}: {error}", source.url))?;
    debug!("Resolved {} to {}", source.url, direct_url.host_str().unwrap_or("?"));

    let media = ResolvedMedia {
        direct_url,
        source_url: source.url,
    };
    let request = RelayRequest {
        range: headers.get(RANGE).cloned(),
        client_id,
    };

    let response = state
        .relay
        .relay(&media, &request)
        .await
        .inspect_err(|error| warn!("Relay failed before streaming: {error}"))?;
    Ok(response)
}

impl From<ValidationError> for ApiError {
    fn from(error: ValidationError) -> Self {
        ApiError::bad_request(
            "Invalid TikTok URL",
            "INVALID_URL",
            format!("Please provide a valid TikTok video URL ({error})."),
        )
    }
}

impl From<RateLimitExceeded> for ApiError {
    fn from(error: RateLimitExceeded) -> Self {
        let window = match error.window.as_secs() {
            60 => "minute".to_string(),
            1 => "second".to_string(),
            seconds => format!("{seconds} seconds"),
        };
        // rounded up to whole seconds
        let retry_after = error.retry_after.as_secs()
            + u64::from(error.retry_after.subsec_nanos() > 0);

        ApiError::too_many_requests(
            format!("Maximum {} requests per {window} allowed", error.max_requests),
            retry_after.max(1),
        )
    }
}

impl From<ExtractError> for ApiError {
    fn from(error: ExtractError) -> Self {
        match error {
            ExtractError::Failed(message) => ApiError::internal(
                "Extraction failed",
                "EXTRACTION_FAILED",
                format!("Video extraction failed: {message}. {UNAVAILABLE_HINT}"),
            ),
            ExtractError::Timeout(limit) => ApiError::internal(
                "Extraction failed",
                "EXTRACTION_TIMEOUT",
                format!(
                    "Video extraction timed out after {}s. {UNAVAILABLE_HINT}",
                    limit.as_secs()
                ),
            ),
            ExtractError::Spawn { program, source } => {
                error!("Could not run {program}: {source}");
                ApiError::internal(
                    "Extraction failed",
                    "EXTRACTION_FAILED",
                    format!("Failed to extract video URL. {UNAVAILABLE_HINT}"),
                )
            }
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        match error {
            RelayError::InvalidHeader(_) => ApiError::internal(
                "Internal server error",
                "INTERNAL_ERROR",
                "An unexpected error occurred",
            ),
            other => ApiError::internal("Streaming failed", "STREAM_FAILED", other.to_string()),
        }
    }
}

fn extract_client_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

/// Rate-limit key for a request: the socket address unless proxies are trusted.
fn client_ip_for_request(trust_proxy_headers: bool, headers: &HeaderMap, addr: SocketAddr) -> String {
    if trust_proxy_headers {
        extract_client_ip(headers).unwrap_or_else(|| addr.ip().to_string())
    } else {
        addr.ip().to_string()
    }
}

pub fn build_cors_layer(configured: &[String]) -> anyhow::Result<CorsLayer> {
    let normalized_origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin).with_context(|| {
                format!("Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com")
            })
        })
        .collect::<anyhow::Result<HashSet<_>>>()?;

    if normalized_origins.is_empty() {
        info!("ALLOWED_ORIGINS is not set; cross-origin requests are refused.");
    } else {
        info!(
            "CORS allow-list loaded with {} origin(s): {:?}",
            normalized_origins.len(),
            normalized_origins
        );
    }

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(|value| normalize_origin(value).ok());
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!("CORS origin check raw={origin:?} normalized={normalized:?} allowed={allowed}");
        allowed
    });

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET])
        .allow_headers([RANGE])
        .expose_headers([CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, ACCEPT_RANGES]))
}

fn normalize_origin(value: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(value)?;
    let host = parsed
        .host_str()
        .context("origin has no host")?
        .to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        other => bail!("unsupported origin scheme {other}"),
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        bail!("origin must not carry a path, query or fragment");
    }

    match parsed.port() {
        Some(port) if port != default_port => Ok(format!("{scheme}://{host}:{port}")),
        _ => Ok(format!("{scheme}://{host}")),
    }
}
