use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use url::Url;

/// Short platform name, used in download filenames.
pub const PLATFORM: &str = "tiktok";

const SUPPORTED_HOSTS: [&str; 5] = [
    "tiktok.com",
    "www.tiktok.com",
    "m.tiktok.com",
    "vm.tiktok.com",
    "vt.tiktok.com",
];

/// The id must fill the whole path segment.
static VIDEO_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/video/(\d+)(?:/|$)").expect("video id pattern is valid")
});

/// A source page URL that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoSource {
    pub url: Url,
    pub video_id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("the value is not a valid absolute URL")]
    Malformed,
    #[error("only http and https URLs are supported")]
    UnsupportedScheme,
    #[error("host {0:?} is not a TikTok domain")]
    UnsupportedHost(String),
    #[error("the URL does not point to a video or a user profile")]
    NotAVideo,
}

pub fn validate_source_url(input: &str) -> Result<VideoSource, ValidationError> {
    let url = Url::parse(input.trim()).map_err(|_| ValidationError::Malformed)?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::UnsupportedScheme);
    }

    let host = url
        .host_str()
        .map(str::to_ascii_lowercase)
        .ok_or(ValidationError::Malformed)?;
    if !SUPPORTED_HOSTS.contains(&host.as_str()) {
        return Err(ValidationError::UnsupportedHost(host));
    }

    let video_id = extract_video_id(&url);
    let has_handle = url
        .path_segments()
        .into_iter()
        .flatten()
        .any(|segment| segment.len() > 1 && segment.starts_with('@'));

    if video_id.is_none() && !has_handle {
        return Err(ValidationError::NotAVideo);
    }

    Ok(VideoSource { url, video_id })
}

/// Numeric id following `/video/` in the URL path, if any.
pub fn extract_video_id(url: &Url) -> Option<String> {
    VIDEO_ID_PATTERN
        .captures(url.path())
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
}
