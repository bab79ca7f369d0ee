//! Access to installation records.
//!
//! The engine never reads or writes the registry itself. Operations return
//! an [`InstallationPatch`]; whoever dispatched the operation hands it to an
//! [`InstallationRepository`].

use crate::CoreError;
use cradle_schema::{Installation, InstallationId, InstallationPatch};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub trait InstallationRepository: Send + Sync {
    fn load(&self, id: &InstallationId) -> Result<Installation, CoreError>;

    /// Apply `patch` to the stored record and return the updated record.
    fn apply(
        &self,
        id: &InstallationId,
        patch: &InstallationPatch,
    ) -> Result<Installation, CoreError>;
}

/// In-memory repository, used by tests and short-lived tools.
#[derive(Default)]
pub struct MemoryRepository {
    records: Mutex<BTreeMap<InstallationId, Installation>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, installation: Installation) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(installation.id.clone(), installation);
    }
}

impl InstallationRepository for MemoryRepository {
    fn load(&self, id: &InstallationId) -> Result<Installation, CoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::InstallationNotFound(id.to_string()))
    }

    fn apply(
        &self,
        id: &InstallationId,
        patch: &InstallationPatch,
    ) -> Result<Installation, CoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records
            .get_mut(id)
            .ok_or_else(|| CoreError::InstallationNotFound(id.to_string()))?;
        if !patch.is_empty() {
            record.apply(patch);
            debug!("applied patch to installation {id}");
        }
        Ok(record.clone())
    }
}
