//! Resolution of source page URLs into direct media URLs.
//!
//! The relay only depends on [`MediaResolver`]. The default backend shells out
//! to `yt-dlp -g`, which prints the direct, watermark-free media URL.

use std::{io::ErrorKind, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Diagnostic lines starting with this marker are advisories, not failures.
const ADVISORY_MARKER: &str = "WARNING";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0}")]
    Failed(String),
    #[error("extraction did not finish within {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Resolves a validated source page URL into a fetchable media URL.
    async fn resolve(&self, source: &Url) -> Result<Url, ExtractError>;
}

/// Runs `yt-dlp` (or a compatible program) once per resolution.
#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::with_args(
            program,
            ["-g", "--no-warnings", "--no-playlist"]
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            timeout,
        )
    }

    /// Uses `args` in front of the source URL instead of the `yt-dlp` defaults.
    pub fn with_args(program: impl Into<PathBuf>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(&self, source: &Url) -> Result<Url, ExtractError> {
        let program = self.program.display().to_string();
        debug!("Resolving {source} with {program}");

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(source.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.timeout, child)
            .await
            .map_err(|_| {
                warn!("{program} timed out after {:?} for {source}", self.timeout);
                ExtractError::Timeout(self.timeout)
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    warn!("{program} is not installed or not on PATH");
                }
                ExtractError::Spawn {
                    program: program.clone(),
                    source: error,
                }
            })?;

        if !output.status.success() {
            return Err(ExtractError::Failed(failure_message(&output.stderr)));
        }

        parse_resolver_output(&output.stdout, &output.stderr)
    }
}

/// Interprets the captured output of a successful resolver run.
pub fn parse_resolver_output(stdout: &[u8], stderr: &[u8]) -> Result<Url, ExtractError> {
    let diagnostics = String::from_utf8_lossy(stderr);
    if let Some(fatal) = diagnostics
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with(ADVISORY_MARKER))
    {
        return Err(ExtractError::Failed(format!("yt-dlp error: {fatal}")));
    }

    let stdout = String::from_utf8_lossy(stdout);
    let mut lines = stdout.lines().map(str::trim).filter(|line| !line.is_empty());
    let candidate = lines
        .next()
        .ok_or_else(|| ExtractError::Failed("Failed to extract video URL".to_string()))?;
    if lines.next().is_some() {
        return Err(ExtractError::Failed(
            "yt-dlp returned more than one media URL".to_string(),
        ));
    }

    match Url::parse(candidate) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(url),
        _ => Err(ExtractError::Failed("Failed to extract video URL".to_string())),
    }
}

fn failure_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp exited with an error")
        .to_string()
}
