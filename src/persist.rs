//! JSON file persistence helpers

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

/// Write `value` as pretty JSON, atomically replacing `path`
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json).await
}

/// Write bytes to a temporary sibling, then rename over `path`
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a JSON file; `None` if it does not exist
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Load every `*.json` file in `dir`, failing on the first unreadable one
pub async fn read_json_dir<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut items = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(items),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            paths.push(path);
        }
    }
    paths.sort();
    for path in paths {
        let bytes = tokio::fs::read(&path).await?;
        items.push(serde_json::from_slice(&bytes)?);
    }
    Ok(items)
}

/// Remove `*.json` files in `dir` whose stem is not in `keep`
pub async fn prune_json_dir(dir: &Path, keep: &std::collections::HashSet<String>) -> Result<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if !keep.contains(stem) {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("value.json");
        write_json(&path, &vec![1, 2, 3]).await.unwrap();

        let back: Option<Vec<u32>> = read_json(&path).await.unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert!(!path.with_extension("tmp").exists());

        let missing: Option<Vec<u32>> = read_json(&dir.path().join("none.json")).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_read_dir_strict() {
        let dir = tempfile::tempdir().unwrap();
        write_json(&dir.path().join("a.json"), &1u32).await.unwrap();
        write_json(&dir.path().join("b.json"), &2u32).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let values: Vec<u32> = read_json_dir(dir.path()).await.unwrap();
        assert_eq!(values, vec![1, 2]);

        std::fs::write(dir.path().join("c.json"), "not json").unwrap();
        assert!(read_json_dir::<u32>(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_prune() {
        let dir = tempfile::tempdir().unwrap();
        write_json(&dir.path().join("keep.json"), &1u32).await.unwrap();
        write_json(&dir.path().join("drop.json"), &2u32).await.unwrap();

        let keep: HashSet<String> = ["keep".to_string()].into_iter().collect();
        assert_eq!(prune_json_dir(dir.path(), &keep).await.unwrap(), 1);
        assert!(dir.path().join("keep.json").exists());
        assert!(!dir.path().join("drop.json").exists());
    }
}
