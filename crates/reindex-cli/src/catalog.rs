use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reindex_core::{TargetCatalog, TargetDescriptor, TargetKind, WorkItem};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

pub const VECTOR_BACKEND: &str = "vector_store";

fn default_backend() -> String {
    VECTOR_BACKEND.to_string()
}

/// One `[[targets]]` entry of the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetEntry {
    pub kind: String,
    pub key: String,
    /// Directory holding the target's documents, relative to the config file.
    pub root: PathBuf,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    targets: Vec<TargetEntry>,
}

#[derive(Debug, Clone)]
struct Resolved {
    kind: TargetKind,
    root: PathBuf,
    entry: TargetEntry,
}

/// Targets declared in the config file; each target's items are the files
/// under its root directory.
#[derive(Debug, Clone, Default)]
pub struct FsCatalog {
    targets: Vec<Resolved>,
}

impl FsCatalog {
    pub fn from_toml_str(raw: &str, base_dir: &Path) -> Result<Self> {
        let file: CatalogFile = toml::from_str(raw).context("invalid [[targets]] table")?;
        let mut targets = Vec::with_capacity(file.targets.len());
        for entry in file.targets {
            let kind: TargetKind = entry
                .kind
                .parse()
                .with_context(|| format!("target '{}'", entry.key))?;
            let root = if entry.root.is_absolute() {
                entry.root.clone()
            } else {
                base_dir.join(&entry.root)
            };
            targets.push(Resolved { kind, root, entry });
        }
        Ok(Self { targets })
    }

    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&raw, base_dir)
    }

    pub fn entries(&self) -> impl Iterator<Item = (TargetKind, &TargetEntry)> {
        self.targets.iter().map(|t| (t.kind, &t.entry))
    }

    pub fn root_of(&self, kind: TargetKind, key: &str) -> Option<&Path> {
        self.find(kind, key).map(|t| t.root.as_path())
    }

    fn find(&self, kind: TargetKind, key: &str) -> Option<&Resolved> {
        self.targets
            .iter()
            .find(|t| t.kind == kind && t.entry.key == key)
    }
}

#[async_trait]
impl TargetCatalog for FsCatalog {
    async fn resolve_target(
        &self,
        kind: TargetKind,
        key: &str,
    ) -> anyhow::Result<Option<TargetDescriptor>> {
        Ok(self.find(kind, key).map(|t| TargetDescriptor {
            kind,
            key: t.entry.key.clone(),
            backend: t.entry.backend.clone(),
            index_name: t.entry.index_name.clone(),
        }))
    }

    fn check_eligible(&self, target: &TargetDescriptor) -> Result<(), String> {
        if target.backend == VECTOR_BACKEND {
            Ok(())
        } else {
            Err(format!(
                "backend '{}' is not a vector index; only '{VECTOR_BACKEND}' targets can be reindexed",
                target.backend
            ))
        }
    }

    async fn list_items(&self, target: &TargetDescriptor) -> anyhow::Result<Vec<WorkItem>> {
        let root = self
            .root_of(target.kind, &target.key)
            .with_context(|| format!("{} '{}' left the catalog", target.kind, target.key))?
            .to_path_buf();
        tokio::task::spawn_blocking(move || scan_root(&root)).await?
    }
}

fn scan_root(root: &Path) -> Result<Vec<WorkItem>> {
    if !root.is_dir() {
        anyhow::bail!("target root {} is not a directory", root.display());
    }
    let mut items = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
    for entry in walker {
        let entry = entry.with_context(|| format!("walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let components: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        let id = components.join("/");
        let item = if components.len() > 1 {
            WorkItem::new(id).with_source(components[0].clone())
        } else {
            WorkItem::new(id)
        };
        items.push(item);
    }
    debug!("Found {} files under {}", items.len(), root.display());
    Ok(items)
}
