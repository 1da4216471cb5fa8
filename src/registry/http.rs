//! Registry client over HTTP, backed by the content cache

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::{CacheKey, ContentCache};
use crate::config::HTTP_CACHE_NAMESPACE;
use crate::error::RegistryError;
use crate::registry::RegistryClient;

pub struct HttpRegistryClient {
    client: reqwest::Client,
    base_url: String,
    cache: Arc<ContentCache>,
}

impl HttpRegistryClient {
    pub fn new(client: reqwest::Client, base_url: &str, cache: Arc<ContentCache>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            cache,
        }
    }

    fn cache_key(&self, method: &str, path: &str) -> CacheKey {
        CacheKey::for_request(method, path, &[("base_url", &self.base_url)])
    }

    fn cached(&self, key: &CacheKey) -> Option<serde_json::Value> {
        match self.cache.get(key) {
            Ok(Some(payload)) => serde_json::from_str(&payload).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Content cache read failed: {}", e);
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn fetch_json_data(
        &self,
        method: &str,
        path: &str,
        cache_ttl: Option<Duration>,
    ) -> Result<serde_json::Value, RegistryError> {
        let key = self.cache_key(method, path);
        if cache_ttl.is_some()
            && let Some(value) = self.cached(&key)
        {
            debug!("Content cache hit for {} {}", method, path);
            return Ok(value);
        }

        let method_value = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| RegistryError::InvalidResponse(format!("Unsupported method: {}", method)))?;
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.request(method_value, &url).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            warn!("Registry returned status {}: {}", status, url);
            return Err(RegistryError::InvalidResponse(format!(
                "Unexpected status: {}",
                status
            )));
        }

        let body = response.text().await?;
        let value: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            warn!("Failed to parse registry response: {}", e);
            RegistryError::InvalidResponse(e.to_string())
        })?;

        if let Some(ttl) = cache_ttl
            && let Err(e) = self.cache.put(&key, HTTP_CACHE_NAMESPACE, &body, ttl)
        {
            warn!("Content cache write failed: {}", e);
        }

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn client(server: &Server, cache: Arc<ContentCache>) -> HttpRegistryClient {
        HttpRegistryClient::new(reqwest::Client::new(), &server.url(), cache)
    }

    #[tokio::test]
    async fn cached_responses_skip_the_network() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/boards")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"id": "uno", "name": "Uno"}]"#)
            .expect(1)
            .create_async()
            .await;
        let cache = Arc::new(ContentCache::in_memory().unwrap());
        let registry = client(&server, cache);

        let ttl = Some(Duration::from_secs(60));
        let first = registry.fetch_json_data("GET", "/v2/boards", ttl).await.unwrap();
        let second = registry.fetch_json_data("GET", "/v2/boards", ttl).await.unwrap();

        mock.assert_async().await;
        assert_eq!(first, second);
        assert_eq!(first[0]["id"], "uno");
    }

    #[tokio::test]
    async fn uncached_requests_always_hit_the_network() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/boards")
            .with_status(200)
            .with_body("[]")
            .expect(2)
            .create_async()
            .await;
        let registry = client(&server, Arc::new(ContentCache::in_memory().unwrap()));

        registry.fetch_json_data("GET", "/v2/boards", None).await.unwrap();
        registry.fetch_json_data("GET", "/v2/boards", None).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn invalidated_namespace_forces_refetch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v3/packages/tool/gcc")
            .with_status(200)
            .with_body(r#"{"name": "gcc", "versions": []}"#)
            .expect(2)
            .create_async()
            .await;
        let cache = Arc::new(ContentCache::in_memory().unwrap());
        let registry = client(&server, cache.clone());
        let ttl = Some(Duration::from_secs(60));

        registry.fetch_json_data("GET", "/v3/packages/tool/gcc", ttl).await.unwrap();
        cache.invalidate(HTTP_CACHE_NAMESPACE).unwrap();
        registry.fetch_json_data("GET", "/v3/packages/tool/gcc", ttl).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn not_found_is_reported() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v3/packages/tool/missing")
            .with_status(404)
            .create_async()
            .await;
        let registry = client(&server, Arc::new(ContentCache::in_memory().unwrap()));

        let result = registry
            .fetch_json_data("GET", "/v3/packages/tool/missing", None)
            .await;

        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/v2/boards")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;
        let registry = client(&server, Arc::new(ContentCache::in_memory().unwrap()));

        let result = registry.fetch_json_data("GET", "/v2/boards", None).await;

        assert!(matches!(result, Err(RegistryError::InvalidResponse(_))));
    }
}
