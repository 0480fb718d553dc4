use super::super::http_pool::HttpPool;
use crate::api::SourceRef;
use crate::downloader::{Fetched, Resolver};
use crate::errors::{AppError, Result};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

// stderr fragments that mean retrying cannot help
const PERMANENT_MARKERS: &[&str] = &[
    "video unavailable",
    "private video",
    "not available",
    "has been removed",
    "unsupported url",
    "no video formats",
    "requested format is not available",
    "sign in to confirm your age",
    "404",
];

/// Resolves page URLs and search queries through the `yt-dlp` binary, then streams the media
/// URL it prints over the HTTP pool.
pub struct YtDlpResolver {
    ytdlp_path: String,
    pool: Arc<HttpPool>,
}

impl YtDlpResolver {
    pub fn new(ytdlp_path: impl Into<String>, pool: Arc<HttpPool>) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
            pool,
        }
    }

    fn target_for(query: &str) -> String {
        if query.starts_with("http://") || query.starts_with("https://") {
            query.to_string()
        } else {
            format!("ytsearch1:{}", query)
        }
    }

    /// Asks yt-dlp for the best audio-only stream URL.
    pub async fn media_url(&self, query: &str) -> Result<String> {
        let target = Self::target_for(query);
        log::info!("🚀 [YTDLP] Running: {} --get-url -f bestaudio --no-playlist {}", self.ytdlp_path, target);

        let output = Command::new(&self.ytdlp_path)
            .args([
                "--get-url",
                "-f",
                "bestaudio",
                "--no-playlist",
                "--no-warnings",
                &target,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    AppError::PermanentFetch(format!("yt-dlp not found at '{}'", self.ytdlp_path))
                }
                _ => AppError::TransientFetch(format!("failed to run yt-dlp: {}", e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::error!("❌ [YTDLP] exit {}: {}", output.status, stderr.trim());
            return Err(classify_ytdlp_failure(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(url) => {
                log::debug!("✅ [YTDLP] Media URL resolved for {}", query);
                Ok(url.to_string())
            }
            None => Err(AppError::PermanentFetch(format!("yt-dlp returned no url for {}", query))),
        }
    }
}

/// Splits yt-dlp failures into "the content is gone" and "try again later".
pub fn classify_ytdlp_failure(stderr: &str) -> AppError {
    let lowered = stderr.to_lowercase();
    let message = stderr.trim().to_string();
    if PERMANENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        AppError::PermanentFetch(message)
    } else {
        AppError::TransientFetch(message)
    }
}

#[async_trait::async_trait]
impl Resolver for YtDlpResolver {
    async fn resolve(&self, source: &SourceRef) -> Result<Fetched> {
        let query = match source {
            SourceRef::YtDlp(query) => query,
            other => return Err(AppError::PermanentFetch(format!("yt-dlp resolver cannot handle {}", other))),
        };
        let url = self.media_url(query).await?;
        self.pool.open_stream(&url).await
    }

    fn supports(&self, source: &SourceRef) -> bool {
        matches!(source, SourceRef::YtDlp(_))
    }

    fn get_name(&self) -> &str {
        "yt-dlp"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn queries_become_searches() {
        assert_eq!(YtDlpResolver::target_for("lofi beats"), "ytsearch1:lofi beats");
        assert_eq!(
            YtDlpResolver::target_for("https://youtu.be/abc"),
            "https://youtu.be/abc"
        );
    }

    #[test]
    fn classifies_stderr() {
        assert!(matches!(
            classify_ytdlp_failure("ERROR: [youtube] abc: Video unavailable"),
            AppError::PermanentFetch(_)
        ));
        assert!(matches!(
            classify_ytdlp_failure("ERROR: Private video. Sign in if you've been granted access"),
            AppError::PermanentFetch(_)
        ));
        assert!(classify_ytdlp_failure("ERROR: Unable to download webpage: timed out").is_transient());
    }

    #[tokio::test]
    async fn missing_binary_is_permanent() {
        let pool = Arc::new(HttpPool::new(1, Duration::from_secs(5)).unwrap());
        let resolver = YtDlpResolver::new("/nonexistent/yt-dlp-binary", pool);
        let err = resolver
            .resolve(&SourceRef::YtDlp("anything".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::PermanentFetch(_)));
    }
}
