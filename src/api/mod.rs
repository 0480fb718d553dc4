// Track references handed to the download pipeline. Catalog search lives outside this crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Opaque resolver input, tagged by the backend that understands it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum SourceRef {
    /// Direct link to an audio payload.
    Http(String),
    /// Audio file on local disk.
    File(PathBuf),
    /// Page URL or free-text query handed to yt-dlp.
    YtDlp(String),
}

impl SourceRef {
    /// Parses a user-supplied source string.
    ///
    /// `http(s)://` links to common audio extensions are fetched directly, other web pages go
    /// through yt-dlp, existing paths and `file://` URLs are local files, and anything else is
    /// treated as a search query.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if let Ok(url) = url::Url::parse(input) {
            match url.scheme() {
                "file" => {
                    if let Ok(path) = url.to_file_path() {
                        return SourceRef::File(path);
                    }
                }
                "http" | "https" => {
                    let is_audio = url
                        .path_segments()
                        .and_then(|mut segments| segments.next_back())
                        .and_then(|last| last.rsplit_once('.'))
                        .map(|(_, ext)| crate::utils::is_audio_extension(ext))
                        .unwrap_or(false);
                    return if is_audio {
                        SourceRef::Http(input.to_string())
                    } else {
                        SourceRef::YtDlp(input.to_string())
                    };
                }
                _ => {}
            }
        }

        let path = PathBuf::from(input);
        if path.exists() {
            SourceRef::File(path)
        } else {
            SourceRef::YtDlp(input.to_string())
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Http(url) => write!(f, "{}", url),
            SourceRef::File(path) => write!(f, "{}", path.display()),
            SourceRef::YtDlp(query) => write!(f, "yt-dlp:{}", query),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration_ms: Option<u64>,
    pub source: SourceRef,
}

impl TrackInfo {
    /// Builds a track whose id is derived from its source, so the same source always maps to the
    /// same cache key.
    pub fn from_source(source: SourceRef) -> Self {
        let title = match &source {
            SourceRef::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| source.to_string()),
            SourceRef::Http(url) | SourceRef::YtDlp(url) => url.clone(),
        };
        Self {
            id: crate::utils::track_id_for(&source),
            title,
            artist: None,
            duration_ms: None,
            source,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.artist {
            Some(artist) => format!("{} - {}", artist, self.title),
            None => self.title.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_direct_audio_link() {
        assert_eq!(
            SourceRef::parse("https://cdn.example.com/a/song.mp3"),
            SourceRef::Http("https://cdn.example.com/a/song.mp3".to_string())
        );
    }

    #[test]
    fn parse_web_page_goes_through_ytdlp() {
        assert_eq!(
            SourceRef::parse("https://www.youtube.com/watch?v=abc"),
            SourceRef::YtDlp("https://www.youtube.com/watch?v=abc".to_string())
        );
    }

    #[test]
    fn parse_free_text_is_a_query() {
        assert_eq!(
            SourceRef::parse("  daft punk around the world "),
            SourceRef::YtDlp("daft punk around the world".to_string())
        );
    }

    #[test]
    fn parse_existing_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("x.flac");
        std::fs::write(&path, b"fLaC").unwrap();
        assert_eq!(SourceRef::parse(path.to_str().unwrap()), SourceRef::File(path));
    }

    #[test]
    fn same_source_same_id() {
        let a = TrackInfo::from_source(SourceRef::YtDlp("q".into()));
        let b = TrackInfo::from_source(SourceRef::YtDlp("q".into()));
        let c = TrackInfo::from_source(SourceRef::Http("q".into()));
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }
}
