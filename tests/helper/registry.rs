//! Registry test utilities

use mockito::{Mock, Server, ServerGuard};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// Mock registry serving package metadata and artifacts
pub struct RegistryServer {
    server: ServerGuard,
}

/// Mocks created for one published package
pub struct Published {
    pub metadata: Mock,
    pub artifacts: Vec<Mock>,
}

impl RegistryServer {
    pub async fn start() -> Self {
        Self {
            server: Server::new_async().await,
        }
    }

    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Publish `versions` of a package; each archive is served under `/files/`
    pub async fn publish(
        &mut self,
        kind: &str,
        name: &str,
        versions: &[(&str, Vec<u8>)],
    ) -> Published {
        let mut artifacts = Vec::new();
        let mut entries = Vec::new();
        for (version, archive) in versions {
            let file_path = format!("/files/{}-{}.tar.gz", name, version);
            let mock = self
                .server
                .mock("GET", file_path.as_str())
                .with_status(200)
                .with_body(archive)
                .create_async()
                .await;
            artifacts.push(mock);
            entries.push(json!({
                "name": version,
                "files": [{
                    "download_url": format!("{}{}", self.server.url(), file_path),
                    "checksum": {"sha256": sha256_hex(archive)},
                    "system": "*"
                }]
            }));
        }

        let metadata = self
            .server
            .mock("GET", format!("/v3/packages/{}/{}", kind, name).as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"name": name, "versions": entries}).to_string())
            .create_async()
            .await;

        Published {
            metadata,
            artifacts,
        }
    }

    /// Serve a file that fails with `status`
    pub async fn failing_file(&mut self, file_name: &str, status: usize) -> Mock {
        self.server
            .mock("GET", format!("/files/{}", file_name).as_str())
            .with_status(status)
            .create_async()
            .await
    }

    /// Publish a package whose only version points at a failing file
    pub async fn publish_broken(&mut self, kind: &str, name: &str, version: &str) -> Published {
        let file_name = format!("{}-{}.tar.gz", name, version);
        let artifact = self.failing_file(&file_name, 404).await;
        let metadata = self
            .server
            .mock("GET", format!("/v3/packages/{}/{}", kind, name).as_str())
            .with_status(200)
            .with_body(
                json!({
                    "name": name,
                    "versions": [{
                        "name": version,
                        "files": [{"download_url": format!("{}/files/{}", self.server.url(), file_name)}]
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;
        Published {
            metadata,
            artifacts: vec![artifact],
        }
    }

    pub async fn boards(&mut self, boards: Value) -> Mock {
        self.server
            .mock("GET", "/v2/boards")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(boards.to_string())
            .create_async()
            .await
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
