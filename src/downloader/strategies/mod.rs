pub mod file;
pub mod http;
pub mod ytdlp;

// Re-export resolvers for easy access
pub use file::FileResolver;
pub use http::HttpResolver;
pub use ytdlp::YtDlpResolver;

use crate::api::SourceRef;
use crate::downloader::{Fetched, Resolver};
use crate::errors::{AppError, Result};
use std::sync::Arc;

/// Dispatches each source to the first resolver that claims it.
pub struct CompositeResolver {
    resolvers: Vec<Arc<dyn Resolver>>,
}

impl CompositeResolver {
    pub fn new(resolvers: Vec<Arc<dyn Resolver>>) -> Self {
        Self { resolvers }
    }

    fn pick(&self, source: &SourceRef) -> Option<&Arc<dyn Resolver>> {
        self.resolvers.iter().find(|r| r.supports(source))
    }
}

#[async_trait::async_trait]
impl Resolver for CompositeResolver {
    async fn resolve(&self, source: &SourceRef) -> Result<Fetched> {
        match self.pick(source) {
            Some(resolver) => {
                log::debug!("🔀 [RESOLVE] {} -> {}", source, resolver.get_name());
                resolver.resolve(source).await
            }
            None => Err(AppError::PermanentFetch(format!("no resolver for {}", source))),
        }
    }

    fn supports(&self, source: &SourceRef) -> bool {
        self.pick(source).is_some()
    }

    fn get_name(&self) -> &str {
        "composite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn routes_by_source_kind() {
        let composite = CompositeResolver::new(vec![Arc::new(FileResolver::new())]);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        std::fs::write(&path, b"RIFF").unwrap();

        assert!(composite.supports(&SourceRef::File(path.clone())));
        assert!(composite.resolve(&SourceRef::File(path)).await.is_ok());
    }

    #[tokio::test]
    async fn unclaimed_source_is_permanent() {
        let composite = CompositeResolver::new(vec![Arc::new(FileResolver::new())]);
        let source = SourceRef::Http("http://example.com/a.mp3".into());
        assert!(!composite.supports(&source));
        let err = composite.resolve(&source).await.err().unwrap();
        assert!(matches!(err, AppError::PermanentFetch(_)));
    }
}
