//! On-disk cache of the last published send bundle, one JSON file per field.
//!
//! A resource restarted by a graph swap restores its outputs from here
//! without needing a fresh apply. An unset field is stored as a file
//! containing `null`; a field absent from the bundle has no file, so the
//! cache preserves the absent / unset / empty distinction.

use std::path::Path;

use serde_json::Value;

use crate::error::Result;
use crate::send::SendBundle;

const EXT: &str = "json";

/// Persists `bundle` beneath `dir`, replacing any previous cache.
pub async fn store(dir: &Path, bundle: &SendBundle) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    // Drop files for fields no longer in the bundle.
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == EXT) {
            let stale = path
                .file_stem()
                .and_then(|s| s.to_str())
                .is_none_or(|field| bundle.get(field).is_none());
            if stale {
                tokio::fs::remove_file(&path).await?;
            }
        }
    }
    for (field, value) in bundle.iter() {
        let encoded = match value {
            Some(v) => serde_json::to_vec(v)?,
            None => b"null".to_vec(),
        };
        tokio::fs::write(dir.join(format!("{field}.{EXT}")), encoded).await?;
    }
    Ok(())
}

/// Restores the cached bundle, or `None` when nothing was ever stored.
pub async fn load(dir: &Path) -> Result<Option<SendBundle>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut bundle = SendBundle::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.extension().is_some_and(|e| e == EXT) {
            continue;
        }
        let Some(field) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
            continue;
        };
        let raw = tokio::fs::read(&path).await?;
        let value: Value = serde_json::from_slice(&raw)?;
        match value {
            Value::Null => bundle.insert(&field, None),
            other => bundle.insert(&field, Some(other)),
        }
    }
    if bundle.is_empty() {
        Ok(None)
    } else {
        Ok(Some(bundle))
    }
}
