use super::super::http_pool::HttpPool;
use crate::api::SourceRef;
use crate::downloader::{Fetched, Resolver};
use crate::errors::{AppError, Result};
use std::sync::Arc;

/// Fetches direct audio links over the shared HTTP pool.
pub struct HttpResolver {
    pool: Arc<HttpPool>,
}

impl HttpResolver {
    pub fn new(pool: Arc<HttpPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Resolver for HttpResolver {
    async fn resolve(&self, source: &SourceRef) -> Result<Fetched> {
        match source {
            SourceRef::Http(url) => {
                log::info!("🌐 [HTTP] Fetching {}", url);
                self.pool.open_stream(url).await
            }
            other => Err(AppError::PermanentFetch(format!("http resolver cannot handle {}", other))),
        }
    }

    fn supports(&self, source: &SourceRef) -> bool {
        matches!(source, SourceRef::Http(_))
    }

    fn get_name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::http_pool::tests::serve;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn resolves_direct_link() {
        let url = serve("200 OK", b"abc").await;
        let resolver = HttpResolver::new(Arc::new(HttpPool::new(1, Duration::from_secs(5)).unwrap()));
        let fetched = resolver.resolve(&SourceRef::Http(url)).await.unwrap();
        let chunks: Vec<_> = fetched.stream.collect().await;
        let body: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap()).collect();
        assert_eq!(body, b"abc");
    }

    #[test]
    fn only_claims_http_sources() {
        let resolver = HttpResolver::new(Arc::new(HttpPool::new(1, Duration::from_secs(5)).unwrap()));
        assert!(resolver.supports(&SourceRef::Http("http://x/a.mp3".into())));
        assert!(!resolver.supports(&SourceRef::YtDlp("query".into())));
    }
}
