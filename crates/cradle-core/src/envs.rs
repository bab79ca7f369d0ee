//! Named runtime environments derived from the master environment.
//!
//! An environment is created in two steps: the interpreter tooling makes a
//! bare environment rooted at the master interpreter, then the master
//! environment's package directory is copied into it with the concurrent
//! copy engine. Creation is all-or-nothing: a WAL entry removes the
//! half-built directory if the process dies, and a failure in-process
//! deletes it before the error is returned.

use crate::CoreError;
use cradle_runtime::{resign_binaries, PythonTooling};
use cradle_schema::{
    validate_env_name, EnvMethod, EnvName, Installation, InstallationPatch,
};
use cradle_store::{
    copy_tree, find_site_packages, python_executable, remove_tree, CancelToken, CopyOptions,
    CopyProgress, CopyReport, InstallLayout, Phase, ProgressEvent, ProgressSink, RollbackStep,
    WalOpKind, WriteAheadLog,
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct EnvManager<'a> {
    layout: &'a InstallLayout,
    wal: &'a WriteAheadLog,
    tooling: &'a dyn PythonTooling,
    copy: CopyOptions,
    python_override: Option<&'a Path>,
}

impl<'a> EnvManager<'a> {
    pub fn new(
        layout: &'a InstallLayout,
        wal: &'a WriteAheadLog,
        tooling: &'a dyn PythonTooling,
        copy: CopyOptions,
        python_override: Option<&'a Path>,
    ) -> Self {
        Self {
            layout,
            wal,
            tooling,
            copy,
            python_override,
        }
    }

    /// Interpreter of the master environment.
    pub fn master_python(&self) -> Result<PathBuf, CoreError> {
        if let Some(python) = self.python_override {
            return Ok(python.to_path_buf());
        }
        let master = self.layout.master_env_dir();
        if !master.is_dir() {
            return Err(CoreError::MasterEnvMissing(master));
        }
        Ok(python_executable(&master))
    }

    /// Names of all environments on disk, sorted. Hidden entries (including
    /// in-flight delete and recreate leftovers) are not environments.
    pub fn list(&self) -> Result<Vec<String>, CoreError> {
        let dir = self.layout.envs_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().is_dir() {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_env_name(name).is_ok() && self.layout.env_path(name).is_dir()
    }

    /// The configured active environment if it is still on disk, otherwise
    /// the first environment found, otherwise `None`.
    pub fn resolve_active(&self, installation: &Installation) -> Result<Option<EnvName>, CoreError> {
        if let Some(ref configured) = installation.active_env {
            if self.exists(configured) {
                return Ok(Some(configured.clone()));
            }
            debug!("configured active environment '{configured}' is gone, falling back");
        }
        Ok(self.list()?.into_iter().next().map(EnvName::from))
    }

    /// Create `name` from the master environment.
    pub fn create(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<InstallationPatch, CoreError> {
        validate_env_name(name)?;
        let env_dir = self.layout.env_path(name);
        if env_dir.symlink_metadata().is_ok() {
            return Err(CoreError::EnvExists(name.to_owned()));
        }
        self.layout.initialize()?;
        info!("creating environment '{name}'");

        self.wal.initialize()?;
        let op = self.wal.begin(WalOpKind::CreateEnv, name)?;
        self.wal
            .add_rollback_step(&op, RollbackStep::RemoveDir(env_dir.clone()))?;

        match self.materialize(&env_dir, Phase::CreateEnv, progress, cancel) {
            Ok(report) => {
                self.wal.commit(&op)?;
                info!(
                    "environment '{name}' created: {} files, {} bytes",
                    report.files, report.bytes
                );
                let mut patch = InstallationPatch::default();
                patch
                    .env_methods_set
                    .insert(EnvName::from(name), EnvMethod::Copy);
                Ok(patch)
            }
            Err(e) => {
                warn!("creating environment '{name}' failed, removing it: {e}");
                if let Err(cleanup) = self.wal.rollback(&op) {
                    warn!("cleanup of '{name}' failed: {cleanup}");
                }
                Err(e)
            }
        }
    }

    /// Make `name` the active environment.
    pub fn activate(&self, name: &str) -> Result<InstallationPatch, CoreError> {
        validate_env_name(name)?;
        if !self.exists(name) {
            return Err(CoreError::EnvNotFound(name.to_owned()));
        }
        Ok(InstallationPatch {
            active_env: Some(EnvName::from(name)),
            ..InstallationPatch::default()
        })
    }

    /// Delete `name`, which must not be the resolved active environment.
    ///
    /// The directory is first renamed to a hidden sibling so it leaves the
    /// listing in one step; if the delete is interrupted, WAL recovery
    /// finishes it.
    pub fn delete(
        &self,
        installation: &Installation,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<InstallationPatch, CoreError> {
        validate_env_name(name)?;
        if !self.exists(name) {
            return Err(CoreError::EnvNotFound(name.to_owned()));
        }
        if self.resolve_active(installation)?.is_some_and(|a| a == *name) {
            return Err(CoreError::EnvActive(name.to_owned()));
        }
        info!("deleting environment '{name}'");

        let env_dir = self.layout.env_path(name);
        let trash = self.layout.env_trash_path(name);
        if trash.symlink_metadata().is_ok() {
            fs::remove_dir_all(&trash)?;
        }

        self.wal.initialize()?;
        let op = self.wal.begin(WalOpKind::DeleteEnv, name)?;
        self.wal
            .add_rollback_step(&op, RollbackStep::RemoveDir(trash.clone()))?;
        fs::rename(&env_dir, &trash)?;

        let removed = remove_tree(
            &trash,
            &|p: CopyProgress| progress.emit(p.to_event(Phase::DeleteEnv, "removed")),
            cancel,
        )?;
        self.wal.commit(&op)?;
        debug!("removed {removed} files of '{name}'");

        Ok(InstallationPatch {
            env_methods_removed: vec![EnvName::from(name)],
            ..InstallationPatch::default()
        })
    }

    /// Rebuild `name` from the current master environment. The old
    /// environment is kept aside until the new one is complete and is put
    /// back if recreation fails.
    pub fn recreate(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<CopyReport, CoreError> {
        validate_env_name(name)?;
        let env_dir = self.layout.env_path(name);
        if !env_dir.is_dir() {
            return Err(CoreError::EnvNotFound(name.to_owned()));
        }
        let aside = self.layout.env_aside_path(name);
        if aside.symlink_metadata().is_ok() {
            fs::remove_dir_all(&aside)?;
        }
        info!("recreating environment '{name}'");

        self.wal.initialize()?;
        let op = self.wal.begin(WalOpKind::RecreateEnv, name)?;
        self.wal.add_rollback_step(
            &op,
            RollbackStep::RestoreBackup {
                backup: aside.clone(),
                target: env_dir.clone(),
                return_to: None,
            },
        )?;
        fs::rename(&env_dir, &aside)?;

        match self.materialize(&env_dir, Phase::RecreateEnv, progress, cancel) {
            Ok(report) => {
                self.wal.commit(&op)?;
                if let Err(e) = fs::remove_dir_all(&aside) {
                    warn!("failed to remove previous '{name}' at {}: {e}", aside.display());
                }
                Ok(report)
            }
            Err(e) => {
                warn!("recreating '{name}' failed, restoring previous environment: {e}");
                if let Err(restore) = self.wal.rollback(&op) {
                    warn!("restoring '{name}' failed: {restore}");
                }
                Err(e)
            }
        }
    }

    fn materialize(
        &self,
        env_dir: &Path,
        phase: Phase,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<CopyReport, CoreError> {
        let master = self.layout.master_env_dir();
        let master_site =
            find_site_packages(&master).ok_or_else(|| CoreError::MasterEnvMissing(master.clone()))?;
        let python = self.master_python()?;

        progress.emit(ProgressEvent::indeterminate(
            phase,
            "creating interpreter environment",
        ));
        cancel.check()?;
        self.tooling.create_venv(&python, env_dir, cancel)?;

        let dest_site = match find_site_packages(env_dir) {
            Some(site) => site,
            None => match master_site.strip_prefix(&master) {
                Ok(rel) => env_dir.join(rel),
                Err(_) => return Err(CoreError::MasterEnvMissing(master)),
            },
        };

        let report = copy_tree(
            &master_site,
            &dest_site,
            &self.copy,
            &|p: CopyProgress| progress.emit(p.to_event(phase, "copied")),
            cancel,
        )?;
        resign_binaries(&dest_site);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cradle_runtime::mock::{mock_site_packages_rel, MockTooling};
    use cradle_schema::InstallSource;
    use cradle_store::NoProgress;

    fn master(layout: &InstallLayout) {
        let site = layout.master_env_dir().join(mock_site_packages_rel());
        fs::create_dir_all(site.join("numpy")).unwrap();
        fs::write(site.join("numpy/__init__.py"), "# numpy").unwrap();
        fs::write(site.join("six.py"), "# six").unwrap();
        let python = cradle_store::python_executable(&layout.master_env_dir());
        fs::create_dir_all(python.parent().unwrap()).unwrap();
        fs::write(python, "").unwrap();
    }

    fn installation(root: &Path) -> Installation {
        Installation::new("test", root, InstallSource::Standalone)
    }

    #[test]
    fn create_copies_master_packages() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        master(&layout);
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);

        let patch = mgr.create("default", &NoProgress, &CancelToken::new()).unwrap();
        assert_eq!(
            patch.env_methods_set.get(&EnvName::from("default")),
            Some(&EnvMethod::Copy)
        );
        let site = layout.env_path("default").join(mock_site_packages_rel());
        assert_eq!(fs::read_to_string(site.join("six.py")).unwrap(), "# six");
        assert!(site.join("numpy/__init__.py").is_file());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn create_rejects_bad_and_duplicate_names() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        master(&layout);
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);
        let cancel = CancelToken::new();

        assert!(matches!(
            mgr.create("../evil", &NoProgress, &cancel),
            Err(CoreError::Schema(_))
        ));
        mgr.create("a", &NoProgress, &cancel).unwrap();
        assert!(matches!(
            mgr.create("a", &NoProgress, &cancel),
            Err(CoreError::EnvExists(_))
        ));
    }

    #[test]
    fn list_skips_hidden_entries() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        fs::create_dir_all(layout.env_path("b")).unwrap();
        fs::create_dir_all(layout.env_path("a")).unwrap();
        fs::create_dir_all(layout.env_trash_path("c")).unwrap();
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);
        assert_eq!(mgr.list().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn list_of_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path().join("nowhere"));
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);
        assert!(mgr.list().unwrap().is_empty());
    }

    #[test]
    fn resolve_active_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);
        let mut inst = installation(dir.path());
        inst.active_env = Some(EnvName::from("gone"));

        assert_eq!(mgr.resolve_active(&inst).unwrap(), None);
        fs::create_dir_all(layout.env_path("zeta")).unwrap();
        fs::create_dir_all(layout.env_path("alpha")).unwrap();
        assert_eq!(
            mgr.resolve_active(&inst).unwrap(),
            Some(EnvName::from("alpha"))
        );
        inst.active_env = Some(EnvName::from("zeta"));
        assert_eq!(
            mgr.resolve_active(&inst).unwrap(),
            Some(EnvName::from("zeta"))
        );
    }

    #[test]
    fn delete_refuses_active_and_removes_others() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        fs::create_dir_all(layout.env_path("main/lib")).unwrap();
        fs::create_dir_all(layout.env_path("spare/lib")).unwrap();
        fs::write(layout.env_path("spare").join("lib/x.py"), "x").unwrap();
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);
        let mut inst = installation(dir.path());
        inst.active_env = Some(EnvName::from("main"));
        let cancel = CancelToken::new();

        assert!(matches!(
            mgr.delete(&inst, "main", &NoProgress, &cancel),
            Err(CoreError::EnvActive(_))
        ));
        let patch = mgr.delete(&inst, "spare", &NoProgress, &cancel).unwrap();
        assert_eq!(patch.env_methods_removed, vec![EnvName::from("spare")]);
        assert!(!layout.env_path("spare").exists());
        assert!(!layout.env_trash_path("spare").exists());
        assert!(wal.list_incomplete().unwrap().is_empty());
    }

    #[test]
    fn cancelled_delete_is_finished_by_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        fs::create_dir_all(layout.env_path("old")).unwrap();
        fs::write(layout.env_path("old").join("f"), "x").unwrap();
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);
        let inst = installation(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = mgr.delete(&inst, "old", &NoProgress, &cancel).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!mgr.list().unwrap().contains(&"old".to_owned()));
        assert_eq!(wal.recover().unwrap(), 1);
        assert!(!layout.env_trash_path("old").exists());
    }

    #[test]
    fn activate_requires_existing_env() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        fs::create_dir_all(layout.env_path("gpu")).unwrap();
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);
        assert_eq!(
            mgr.activate("gpu").unwrap().active_env,
            Some(EnvName::from("gpu"))
        );
        assert!(matches!(mgr.activate("cpu"), Err(CoreError::EnvNotFound(_))));
    }

    #[test]
    fn failed_recreate_restores_previous_env() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        master(&layout);
        fs::create_dir_all(layout.env_path("default")).unwrap();
        fs::write(layout.env_path("default").join("marker"), "old").unwrap();
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new().failing_create();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);

        assert!(mgr
            .recreate("default", &NoProgress, &CancelToken::new())
            .is_err());
        assert_eq!(
            fs::read_to_string(layout.env_path("default").join("marker")).unwrap(),
            "old"
        );
        assert!(!layout.env_aside_path("default").exists());
    }

    #[test]
    fn recreate_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let layout = InstallLayout::new(dir.path());
        master(&layout);
        fs::create_dir_all(layout.env_path("default")).unwrap();
        fs::write(layout.env_path("default").join("marker"), "old").unwrap();
        let wal = WriteAheadLog::new(&layout);
        let tooling = MockTooling::new();
        let mgr = EnvManager::new(&layout, &wal, &tooling, CopyOptions::default(), None);

        let report = mgr
            .recreate("default", &NoProgress, &CancelToken::new())
            .unwrap();
        assert_eq!(report.files, 2);
        assert!(!layout.env_path("default").join("marker").exists());
        assert!(!layout.env_aside_path("default").exists());
    }
}
