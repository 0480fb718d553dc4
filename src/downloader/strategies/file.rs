use crate::api::SourceRef;
use crate::downloader::{Fetched, Resolver};
use crate::errors::{AppError, Result};
use futures::StreamExt;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

/// Reads local audio files. Lets the same pipeline play a library on disk.
pub struct FileResolver {
    chunk_size: usize,
}

impl FileResolver {
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Default for FileResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Resolver for FileResolver {
    async fn resolve(&self, source: &SourceRef) -> Result<Fetched> {
        let path = match source {
            SourceRef::File(path) => path.clone(),
            other => return Err(AppError::PermanentFetch(format!("file resolver cannot handle {}", other))),
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::PermanentFetch(format!("{} does not exist", path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        let content_length = file.metadata().await.ok().map(|m| m.len());
        log::info!("📁 [FILE] Reading {:?}", path);

        let chunk_size = self.chunk_size;
        let stream = futures::stream::unfold(Some(file), move |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; chunk_size];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => {
                    buf.truncate(n);
                    Some((Ok(buf), Some(file)))
                }
                Err(e) => Some((Err(AppError::from(e)), None)),
            }
        })
        .boxed();

        Ok(Fetched {
            stream,
            content_length,
        })
    }

    fn supports(&self, source: &SourceRef) -> bool {
        matches!(source, SourceRef::File(_))
    }

    fn get_name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reads_file_in_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("song.flac");
        std::fs::write(&path, b"0123456789").unwrap();

        let resolver = FileResolver::with_chunk_size(4);
        let fetched = resolver.resolve(&SourceRef::File(path)).await.unwrap();
        assert_eq!(fetched.content_length, Some(10));

        let chunks: Vec<Vec<u8>> = fetched.stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"0123456789");
    }

    #[tokio::test]
    async fn missing_file_is_permanent() {
        let resolver = FileResolver::new();
        let err = resolver
            .resolve(&SourceRef::File("/definitely/not/here.mp3".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AppError::PermanentFetch(_)));
        assert!(!err.is_transient());
    }
}
