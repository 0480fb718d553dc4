use crate::api::SourceRef;
use crate::errors::Result;
use log::info;
use sha2::{Digest, Sha256};

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "flac", "wav", "ogg", "oga", "mp4"];

/// Sanitizes a filename by removing invalid characters
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

pub fn is_audio_extension(ext: &str) -> bool {
    let ext = ext.to_ascii_lowercase();
    AUDIO_EXTENSIONS.contains(&ext.as_str())
}

/// Stable track identity for a source. Survives restarts, so it can key the on-disk cache.
pub fn track_id_for(source: &SourceRef) -> String {
    let (prefix, raw) = match source {
        SourceRef::Http(url) => ("http", url.clone()),
        SourceRef::File(path) => ("file", path.to_string_lossy().to_string()),
        SourceRef::YtDlp(query) => ("ytdlp", query.clone()),
    };
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(b":");
    hasher.update(raw.as_bytes());
    let digest = hasher.finalize();
    // First 8 bytes, 16 hex chars
    format!("{}-{}", prefix, hex::encode(&digest[..8]))
}

/// Creates a directory if it doesn't exist
pub async fn ensure_dir_exists(path: &std::path::Path) -> Result<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path).await?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Generates a unique name for temp files
pub fn generate_download_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn format_file_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

pub fn format_duration_ms(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_filename("a/b:c?d"), "a_b_c_d");
        assert_eq!(sanitize_filename("plain-name_1"), "plain-name_1");
    }

    #[test]
    fn track_ids_are_stable() {
        let source = SourceRef::Http("https://example.com/a.mp3".into());
        assert_eq!(track_id_for(&source), track_id_for(&source.clone()));
        assert!(track_id_for(&source).starts_with("http-"));
    }

    #[test]
    fn track_id_is_truncated_sha256_of_kind_and_source() {
        let source = SourceRef::File("/music/a.flac".into());
        assert_eq!(track_id_for(&source), "file-c751309306865676");
        let other = SourceRef::YtDlp("/music/a.flac".into());
        let digest = |id: String| id.split_once('-').map(|(_, d)| d.to_string());
        assert_ne!(digest(track_id_for(&other)), digest(track_id_for(&source)));
    }

    #[test]
    fn formats_sizes_and_durations() {
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(10 * 1024 * 1024), "10.0 MB");
        assert_eq!(format_duration_ms(125_000), "2:05");
    }

    #[test]
    fn audio_extensions() {
        assert!(is_audio_extension("MP3"));
        assert!(!is_audio_extension("html"));
    }
}
