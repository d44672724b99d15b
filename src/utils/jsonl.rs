//! Newline-delimited JSON appends.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

/// Append one JSON record as a single line, creating parent directories as needed.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
    line.push('\n');
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_append_creates_and_grows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/out.jsonl");

        append_jsonl(&path, &json!({"keyword": "a"})).unwrap();
        append_jsonl(&path, &json!({"keyword": "b"})).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], r#"{"keyword":"b"}"#);
    }

    #[test]
    fn test_non_ascii_is_written_verbatim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        append_jsonl(&path, &json!({"keyword": "咖啡"})).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("咖啡"));
    }
}
