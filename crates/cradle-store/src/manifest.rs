use crate::layout::InstallLayout;
use crate::StoreError;
use cradle_schema::InstallManifest;
use std::fs;
use std::path::Path;

/// Read `manifest.json` from `path`; `None` when the file does not exist.
pub fn read_manifest_at(path: &Path) -> Result<Option<InstallManifest>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(InstallManifest::from_json(&content)?))
}

/// Read the manifest of an installation; `None` when none is installed.
pub fn read_manifest(layout: &InstallLayout) -> Result<Option<InstallManifest>, StoreError> {
    read_manifest_at(&layout.manifest_path())
}

/// Atomically replace the manifest of an installation.
pub fn write_manifest(layout: &InstallLayout, manifest: &InstallManifest) -> Result<(), StoreError> {
    let content = manifest.to_json()?;
    crate::write_atomic(&layout.manifest_path(), content.as_bytes())
}
