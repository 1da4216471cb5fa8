//! Archive and settings fixtures

use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::{Value, json};

use embedpm::config::{DownloadConfig, Settings};

pub const ENGINE_VERSION: &str = "2.5.0";

/// Settings rooted in `core_dir` talking to a mock registry
pub fn test_settings(core_dir: &Path, registry_url: &str) -> Settings {
    Settings {
        core_dir: core_dir.to_path_buf(),
        engine_version: ENGINE_VERSION.to_string(),
        registry_url: registry_url.to_string(),
        download: DownloadConfig {
            max_attempts: 2,
            backoff_base_ms: 1,
            ..DownloadConfig::default()
        },
        disable_progress: true,
        core_packages: Vec::new(),
    }
}

pub fn tar_gz(files: &[(String, String)]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// Platform archive with a descriptor and a single board
pub fn platform_archive(
    name: &str,
    version: &str,
    engine: Option<&str>,
    packages: Value,
) -> Vec<u8> {
    let mut descriptor = json!({
        "name": name,
        "version": version,
        "packages": packages,
    });
    if let Some(engine) = engine {
        descriptor["engines"] = json!({"core": engine});
    }
    let board = json!({
        "name": format!("{} Mini", name),
        "mcu": "wmc32",
        "frameworks": ["bare"],
    });
    tar_gz(&[
        (format!("{}/platform.json", name), descriptor.to_string()),
        (format!("{}/boards/{}_mini.json", name, name), board.to_string()),
    ])
}

pub fn tool_archive(name: &str, version: &str) -> Vec<u8> {
    tar_gz(&[
        (
            format!("{}/package.json", name),
            json!({"name": name, "version": version}).to_string(),
        ),
        (format!("{}/bin/{}", name, name), format!("#!/bin/sh\necho {}\n", version)),
    ])
}

/// Declares `toolchain-widget@^1.0.0`
pub fn widget_toolchain() -> Value {
    json!({"toolchain-widget": {"type": "toolchain", "version": "^1.0.0"}})
}
