use anyhow::Result;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Pure logic: map a tenant-supplied name onto a single safe path segment.
///
/// Bytes outside `[A-Za-z0-9_-]` are percent-encoded and the empty name maps
/// to a lone `%`, so distinct names never share a segment and no segment can
/// be `.`, `..` or contain a separator.
pub fn path_segment(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut segment = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') {
            segment.push(char::from(byte));
        } else {
            segment.push_str(&format!("%{:02X}", byte));
        }
    }
    segment
}

/// Pure logic: the directory holding everything owned by `project` under `root`.
pub fn project_dir(root: &Path, project: &str) -> PathBuf {
    root.join(path_segment(project))
}

/// Execution logic: append one line to `path`, creating parent directories.
///
/// The line is written with a single `write_all` on a file opened in append
/// mode, so concurrent writers of line-sized records do not interleave.
pub async fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(record.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_segment_sanitises() {
        assert_eq!(path_segment("plant-7"), "plant-7");
        assert_eq!(path_segment("../etc"), "%2E%2E%2Fetc");
        assert_eq!(path_segment(".."), "%2E%2E");
        assert_eq!(path_segment(""), "%");
        assert_eq!(path_segment("a/b c"), "a%2Fb%20c");
    }

    #[test]
    fn test_path_segment_keeps_names_apart() {
        let names = ["tenant/a", "tenant_a", "tenant%2Fa", "tenant a", "", "%"];
        let segments: std::collections::HashSet<String> =
            names.iter().map(|n| path_segment(n)).collect();
        assert_eq!(segments.len(), names.len());
    }

    #[tokio::test]
    async fn test_append_line_creates_dirs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("log.jsonl");

        append_line(&path, "one").await?;
        append_line(&path, "two").await?;

        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content, "one\ntwo\n");
        Ok(())
    }
}
