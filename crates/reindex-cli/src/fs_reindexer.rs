use crate::catalog::FsCatalog;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reindex_core::{ItemReindexer, TargetDescriptor, WorkItem};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Index entry written for every reindexed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub item: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    pub bytes: u64,
    pub sha256: String,
    pub indexed_at_unix_ms: u64,
}

/// Fingerprints each file and records it under `<index_dir>/<target>/`.
pub struct FsReindexer {
    catalog: Arc<FsCatalog>,
    index_dir: PathBuf,
}

impl FsReindexer {
    pub fn new(catalog: Arc<FsCatalog>, index_dir: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            index_dir: index_dir.into(),
        }
    }

    pub fn entry_path(&self, target: &TargetDescriptor, item: &str) -> PathBuf {
        let digest = hex(&Sha256::digest(item.as_bytes()));
        self.index_dir
            .join(format!("{}{}", target.kind.id_prefix(), sanitize(&target.key)))
            .join(format!("{}.json", &digest[..16]))
    }
}

#[async_trait]
impl ItemReindexer for FsReindexer {
    async fn reindex_one(&self, target: &TargetDescriptor, item: &WorkItem) -> Result<()> {
        let root = self
            .catalog
            .root_of(target.kind, &target.key)
            .with_context(|| format!("{} '{}' left the catalog", target.kind, target.key))?;
        let path = root.join(&item.id);
        let content = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        if content.is_empty() {
            anyhow::bail!("empty document, nothing to index");
        }

        let entry = IndexEntry {
            item: item.id.clone(),
            source: item.source.clone(),
            index_name: target.index_name.clone(),
            bytes: content.len() as u64,
            sha256: hex(&Sha256::digest(&content)),
            indexed_at_unix_ms: unix_ms(),
        };
        write_atomic(&self.entry_path(target, &item.id), &serde_json::to_vec_pretty(&entry)?).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
