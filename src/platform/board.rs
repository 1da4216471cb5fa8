use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PackageError, PackageResult};

const BOARDS_DIR: &str = "boards";

/// A board definition, either shipped by an installed platform or
/// registered in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardConfig {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub mcu: Option<String>,
    #[serde(default)]
    pub frameworks: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Load `boards/<id>.json` from a platform directory.
///
/// Board files that fail to parse are skipped with a warning rather than
/// hiding every other board of the platform.
pub fn load_boards(platform_dir: &Path, platform_name: &str) -> PackageResult<Vec<BoardConfig>> {
    let dir = platform_dir.join(BOARDS_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PackageError::Io(e)),
    };

    let mut boards = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let Some(id) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
            continue;
        };
        let content = std::fs::read_to_string(&path)?;
        match serde_json::from_str::<BoardConfig>(&content) {
            Ok(mut board) => {
                board.id = id;
                board.platform = Some(platform_name.to_string());
                boards.push(board);
            }
            Err(e) => warn!("Skipping malformed board {:?}: {}", path, e),
        }
    }
    boards.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(boards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_boards_reads_json_files_and_sets_ids() {
        let temp_dir = TempDir::new().unwrap();
        let boards_dir = temp_dir.path().join("boards");
        std::fs::create_dir_all(&boards_dir).unwrap();
        std::fs::write(
            boards_dir.join("widget_mini.json"),
            r#"{"name": "Widget Mini", "mcu": "wx32", "frameworks": ["core"], "upload": {"speed": 115200}}"#,
        )
        .unwrap();
        std::fs::write(boards_dir.join("broken.json"), "{").unwrap();
        std::fs::write(boards_dir.join("README.md"), "# boards").unwrap();

        let boards = load_boards(temp_dir.path(), "widgetplatform").unwrap();

        assert_eq!(boards.len(), 1);
        let board = &boards[0];
        assert_eq!(board.id, "widget_mini");
        assert_eq!(board.platform.as_deref(), Some("widgetplatform"));
        assert_eq!(board.frameworks, vec!["core".to_string()]);
        assert_eq!(board.extra["upload"]["speed"], 115200);
    }

    #[test]
    fn load_boards_without_boards_dir_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        assert!(load_boards(temp_dir.path(), "p").unwrap().is_empty());
    }
}
