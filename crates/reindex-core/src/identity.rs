use crate::{ReindexError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Class of resource a reindex run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    DocumentLibrary,
    DocumentProcess,
    ContentReferenceType,
}

impl TargetKind {
    pub const ALL: [Self; 3] = [
        Self::DocumentLibrary,
        Self::DocumentProcess,
        Self::ContentReferenceType,
    ];

    /// Identity prefix. No prefix is a prefix of another, so the kind is
    /// recoverable from any identity string.
    #[must_use]
    pub const fn id_prefix(self) -> &'static str {
        match self {
            Self::DocumentLibrary => "library-",
            Self::DocumentProcess => "process-",
            Self::ContentReferenceType => "cr-reindex-",
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DocumentLibrary => "document_library",
            Self::DocumentProcess => "document_process",
            Self::ContentReferenceType => "content_reference_type",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::DocumentLibrary => "Document library",
            Self::DocumentProcess => "Document process",
            Self::ContentReferenceType => "Content reference type",
        };
        f.write_str(label)
    }
}

impl FromStr for TargetKind {
    type Err = ReindexError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "document_library" | "library" => Ok(Self::DocumentLibrary),
            "document_process" | "process" => Ok(Self::DocumentProcess),
            "content_reference_type" | "content_reference" | "cr" => {
                Ok(Self::ContentReferenceType)
            }
            other => Err(ReindexError::InvalidTarget(format!(
                "unknown target kind '{other}'"
            ))),
        }
    }
}

/// Deterministic addressing key for one reindex target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String")]
pub struct OrchestrationId(String);

impl OrchestrationId {
    /// Derive the identity for `(kind, key)`.
    ///
    /// Every call path (start, attach, status) must go through here so the
    /// same logical target always maps to the same orchestration.
    pub fn resolve(kind: TargetKind, key: &str) -> Result<Self> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ReindexError::InvalidTarget(format!(
                "{kind} key must not be empty"
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(ReindexError::InvalidTarget(format!(
                "{kind} key must not contain control characters"
            )));
        }
        Ok(Self(format!("{}{key}", kind.id_prefix())))
    }

    /// Parse an identity string received from a caller (e.g. a status query).
    pub fn parse(raw: &str) -> Result<Self> {
        let (kind, key) = split_identity(raw)?;
        Self::resolve(kind, key)
    }

    #[must_use]
    pub fn target_kind(&self) -> TargetKind {
        // Constructed only through `resolve` (deserialization goes through
        // `parse`), so a prefix always matches.
        split_identity(&self.0)
            .map(|(kind, _)| kind)
            .unwrap_or(TargetKind::DocumentLibrary)
    }

    #[must_use]
    pub fn target_key(&self) -> &str {
        split_identity(&self.0).map(|(_, key)| key).unwrap_or("")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrchestrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrchestrationId {
    type Err = ReindexError;

    fn from_str(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

impl TryFrom<String> for OrchestrationId {
    type Error = ReindexError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

fn split_identity(raw: &str) -> Result<(TargetKind, &str)> {
    TargetKind::ALL
        .into_iter()
        .find_map(|kind| raw.strip_prefix(kind.id_prefix()).map(|key| (kind, key)))
        .ok_or_else(|| ReindexError::UnknownIdentity(raw.to_string()))
}
