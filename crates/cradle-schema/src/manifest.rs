use crate::SchemaError;
use serde::{Deserialize, Serialize};

/// A release the update orchestrator can install: where to fetch it and
/// what it contains.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseDescriptor {
    pub tag: String,
    pub variant: String,
    /// Interpreter version of the bundled master environment. Queried from
    /// the new interpreter when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
    /// Archive parts, concatenated in order after download.
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comfyui_ref: Option<String>,
}

impl ReleaseDescriptor {
    pub fn from_json(s: &str) -> Result<Self, SchemaError> {
        let release: ReleaseDescriptor = serde_json::from_str(s)?;
        release.validate()?;
        Ok(release)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.tag.trim().is_empty() {
            return Err(SchemaError::InvalidRelease("release tag is empty".to_owned()));
        }
        if self.variant.trim().is_empty() {
            return Err(SchemaError::InvalidRelease("variant is empty".to_owned()));
        }
        if self.urls.is_empty() {
            return Err(SchemaError::InvalidRelease(
                "release lists no download URLs".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Contents of `<root>/manifest.json`: what release is currently installed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallManifest {
    pub release_tag: String,
    /// Platform + accelerator identifier, e.g. `win-x64-cu128`.
    pub variant: String,
    /// Version of the bundled master interpreter, e.g. `3.12.9`.
    pub python_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comfyui_ref: Option<String>,
    pub installed_at: String,
}

impl InstallManifest {
    pub fn new(release_tag: &str, variant: &str, python_version: &str) -> Self {
        Self {
            release_tag: release_tag.to_owned(),
            variant: variant.to_owned(),
            python_version: python_version.to_owned(),
            comfyui_ref: None,
            installed_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn from_json(s: &str) -> Result<Self, SchemaError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> Result<String, SchemaError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// `major.minor` part of the interpreter version, used to locate
    /// `lib/python<major.minor>/site-packages`.
    pub fn python_minor(&self) -> Option<String> {
        let mut parts = self.python_version.split('.');
        let major = parts.next()?;
        let minor = parts.next()?;
        if major.is_empty() || minor.is_empty() {
            return None;
        }
        Some(format!("{major}.{minor}"))
    }
}
