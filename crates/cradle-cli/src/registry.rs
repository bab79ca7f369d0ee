//! Installation record kept next to the installation it describes.
//!
//! The CLI manages one installation per root, so the registry is a single
//! `.cradle/installation.json` file written atomically on every change.

use cradle_core::{CoreError, InstallationRepository};
use cradle_schema::{Installation, InstallationId, InstallationPatch};
use cradle_store::{write_atomic, InstallLayout};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

const RECORD_FILE: &str = "installation.json";

pub struct JsonFileRepository {
    path: PathBuf,
}

impl JsonFileRepository {
    pub fn new(layout: &InstallLayout) -> Self {
        Self {
            path: layout.state_dir().join(RECORD_FILE),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// The installation registered at this root.
    pub fn current(&self) -> Result<Installation, CoreError> {
        if !self.path.is_file() {
            return Err(CoreError::InstallationNotFound(format!(
                "no installation registered at {} (run `cradle init`)",
                self.path.display()
            )));
        }
        let content = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write `installation` as the record, replacing any existing one.
    pub fn save(&self, installation: &Installation) -> Result<(), CoreError> {
        let json = serde_json::to_string_pretty(installation)?;
        write_atomic(&self.path, json.as_bytes())?;
        debug!("wrote {}", self.path.display());
        Ok(())
    }
}

impl InstallationRepository for JsonFileRepository {
    fn load(&self, id: &InstallationId) -> Result<Installation, CoreError> {
        let installation = self.current()?;
        if installation.id != *id {
            return Err(CoreError::InstallationNotFound(id.to_string()));
        }
        Ok(installation)
    }

    fn apply(
        &self,
        id: &InstallationId,
        patch: &InstallationPatch,
    ) -> Result<Installation, CoreError> {
        let mut installation = self.load(id)?;
        if patch.is_empty() {
            return Ok(installation);
        }
        installation.apply(patch);
        self.save(&installation)?;
        Ok(installation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cradle_schema::{EnvName, InstallSource};

    #[test]
    fn missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(&InstallLayout::new(dir.path()));
        assert!(!repo.exists());
        assert!(matches!(
            repo.current(),
            Err(CoreError::InstallationNotFound(_))
        ));
    }

    #[test]
    fn patch_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(&InstallLayout::new(dir.path()));
        let installation = Installation::new("main", dir.path(), InstallSource::Standalone);
        repo.save(&installation).unwrap();

        let patch = InstallationPatch {
            active_env: Some(EnvName::from("cpu")),
            ..InstallationPatch::default()
        };
        let id = InstallationId::from("main");
        repo.apply(&id, &patch).unwrap();

        let reloaded = JsonFileRepository::new(&InstallLayout::new(dir.path()))
            .load(&id)
            .unwrap();
        assert_eq!(reloaded.active_env.as_deref(), Some("cpu"));
    }

    #[test]
    fn other_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::new(&InstallLayout::new(dir.path()));
        repo.save(&Installation::new("main", dir.path(), InstallSource::Standalone))
            .unwrap();
        assert!(repo.load(&InstallationId::from("other")).is_err());
    }
}
