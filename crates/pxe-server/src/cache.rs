//! Image cache client
//!
//! Files that match no boot method and are not on disk may still be in the local image
//! cache, served over HTTP at `http://localhost:5248/images/`.

use crate::error::{PxeError, Result};
use crate::reader::BootReader;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Source for boot images that are not under the TFTP root.
#[async_trait::async_trait]
pub trait ImageCache: Send + Sync {
    async fn get(&self, file_name: &str) -> Result<BootReader>;
}

/// Legacy GRUB asks for optional `.lst` files; missing ones read as empty.
pub fn is_optional(file_name: &str) -> bool {
    file_name.contains(".lst")
}

/// Fetches boot images from the rack's image cache over HTTP.
#[derive(Debug, Clone)]
pub struct HttpImageCache {
    client: Client,
    base_url: String,
}

impl HttpImageCache {
    /// Fails when `base_url` does not parse.
    pub fn new(base_url: &str) -> Result<Self> {
        reqwest::Url::parse(base_url)
            .map_err(|e| PxeError::Configuration(format!("Invalid image cache URL {base_url}: {e}")))?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Where `file_name` lives in the cache.
    pub fn url_for(&self, file_name: &str) -> String {
        format!("{}/{}", self.base_url, file_name.trim_matches('/'))
    }
}

#[async_trait::async_trait]
impl ImageCache for HttpImageCache {
    async fn get(&self, file_name: &str) -> Result<BootReader> {
        let url = self.url_for(file_name);
        debug!("Fetching {} from the image cache", url);

        let response = self.client.get(&url).send().await?;
        if response.status() != StatusCode::OK {
            if is_optional(file_name) {
                return Ok(BootReader::empty());
            }
            return Err(PxeError::FileNotFound(file_name.to_string()));
        }
        Ok(BootReader::from(response.bytes().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;

    async fn serve() -> String {
        let router = Router::new().route("/images/bootx64.efi", get(|| async { "EFI" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/images/")
    }

    #[test]
    fn test_url_for_strips_slashes() {
        let cache = HttpImageCache::new("http://localhost:5248/images/").unwrap();
        assert_eq!(cache.url_for("/bootx64.efi"), "http://localhost:5248/images/bootx64.efi");
    }

    #[tokio::test]
    async fn test_cache_hit_and_miss() {
        let cache = HttpImageCache::new(&serve().await).unwrap();

        let reader = cache.get("/bootx64.efi").await.unwrap();
        assert_eq!(&reader.into_bytes().await.unwrap()[..], b"EFI");

        assert!(matches!(
            cache.get("missing.efi").await,
            Err(PxeError::FileNotFound(_))
        ));

        let optional = cache.get("grub/x86_64-efi/command.lst").await.unwrap();
        assert_eq!(optional.size(), 0);
    }
}
