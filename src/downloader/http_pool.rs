use std::time::Duration;
use futures_util::StreamExt;
use reqwest::{Client, ClientBuilder, Proxy, StatusCode};
use crate::downloader::Fetched;
use crate::errors::{is_transient_status, AppError, Result};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Shared HTTP client for audio fetches. Retrying is the worker pool's job, so every call here
/// makes exactly one request.
pub struct HttpPool {
    client: Client,
    max_connections: usize,
    timeout: Duration,
}

impl HttpPool {
    pub fn new(max_connections: usize, timeout: Duration) -> Result<Self> {
        let client = Self::builder(max_connections, timeout).build()?;
        Ok(Self {
            client,
            max_connections,
            timeout,
        })
    }

    fn builder(max_connections: usize, timeout: Duration) -> ClientBuilder {
        ClientBuilder::new()
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .user_agent(USER_AGENT)
            .gzip(true)
            .brotli(true)
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
    }

    pub fn with_proxy(mut self, proxy_url: &str) -> Result<Self> {
        let proxy = Proxy::all(proxy_url)?;
        self.client = Self::builder(self.max_connections, self.timeout)
            .proxy(proxy)
            .build()?;
        log::info!("🌐 [HTTP] Using proxy {}", proxy_url);
        Ok(self)
    }

    /// Issues one GET and hands back the body as a chunk stream.
    pub async fn open_stream(&self, url: &str) -> Result<Fetched> {
        log::debug!("🌐 [HTTP] GET {}", url);
        let response = self
            .client
            .get(url)
            .header("Accept", "audio/webm,audio/*,*/*;q=0.9")
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Cache-Control", "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(AppError::from))
            .boxed();

        Ok(Fetched {
            stream,
            content_length,
        })
    }
}

/// Maps a failed response status onto the retry taxonomy.
pub fn classify_status(status: StatusCode, url: &str) -> AppError {
    let message = format!("HTTP {} for {}", status, url);
    if is_transient_status(status.as_u16()) {
        AppError::TransientFetch(message)
    } else {
        AppError::PermanentFetch(message)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned response per connection on a random local port.
    pub(crate) async fn serve(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let head = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nContent-Type: audio/mpeg\r\nConnection: close\r\n\r\n",
                        status_line,
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{}/track.mp3", addr)
    }

    async fn collect(fetched: Fetched) -> Vec<u8> {
        let mut stream = fetched.stream;
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk.unwrap());
        }
        data
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "u").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "u").is_transient());
        assert!(!classify_status(StatusCode::NOT_FOUND, "u").is_transient());
        assert!(!classify_status(StatusCode::FORBIDDEN, "u").is_transient());
    }

    #[tokio::test]
    async fn streams_successful_body() {
        let url = serve("200 OK", b"ID3 fake audio").await;
        let pool = HttpPool::new(2, Duration::from_secs(5)).unwrap();
        let fetched = pool.open_stream(&url).await.unwrap();
        assert_eq!(fetched.content_length, Some(14));
        assert_eq!(collect(fetched).await, b"ID3 fake audio");
    }

    #[tokio::test]
    async fn not_found_is_permanent() {
        let url = serve("404 Not Found", b"").await;
        let pool = HttpPool::new(2, Duration::from_secs(5)).unwrap();
        let err = pool.open_stream(&url).await.err().unwrap();
        assert!(matches!(err, AppError::PermanentFetch(_)));
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let url = serve("503 Service Unavailable", b"").await;
        let pool = HttpPool::new(2, Duration::from_secs(5)).unwrap();
        let err = pool.open_stream(&url).await.err().unwrap();
        assert!(err.is_transient());
    }
}
