use crate::concurrency::InstallLock;
use crate::envs::EnvManager;
use crate::plugins::{diff, scan};
use crate::restore::{NodeRestorer, RestoreOutcome};
use crate::snapshot::SnapshotManager;
use crate::update::UpdateOrchestrator;
use crate::CoreError;
use cradle_runtime::mock::{MockDownloader, MockTooling, MockVcs};
use cradle_runtime::{
    select_tooling, Downloader, Extractor, GitCli, HttpDownloader, PythonTooling, TarExtractor,
    Vcs,
};
use cradle_schema::{CradleConfig, PluginDiff, PluginRecord, Snapshot};
use cradle_store::{CancelToken, CopyOptions, InstallLayout, ProgressSink, WriteAheadLog};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The external programs and services the engine delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub tooling: Arc<dyn PythonTooling>,
    pub vcs: Arc<dyn Vcs>,
    pub downloader: Arc<dyn Downloader>,
    pub extractor: Arc<dyn Extractor>,
}

impl Collaborators {
    /// Real tooling. `tooling` is `auto`, `uv`, `venv` or `mock`.
    pub fn system(config: &CradleConfig, tooling: &str) -> Result<Self, CoreError> {
        let git = config
            .tools
            .git
            .clone()
            .unwrap_or_else(|| PathBuf::from("git"));
        Ok(Self {
            tooling: Arc::from(select_tooling(tooling, &config.tools)?),
            vcs: Arc::new(GitCli::new(git)),
            downloader: Arc::new(HttpDownloader::new()),
            extractor: Arc::new(TarExtractor),
        })
    }

    /// In-process stand-ins; nothing is spawned and nothing is fetched.
    pub fn mock() -> Self {
        Self {
            tooling: Arc::new(MockTooling::new()),
            vcs: Arc::new(MockVcs::new()),
            downloader: Arc::new(MockDownloader::new()),
            extractor: Arc::new(TarExtractor),
        }
    }
}

/// Orchestration engine for one installation root.
///
/// Hands out the environment manager, snapshot manager, plugin restorer
/// and update orchestrator, all sharing the installation's layout, WAL and
/// collaborators.
pub struct Engine {
    layout: InstallLayout,
    wal: WriteAheadLog,
    config: CradleConfig,
    collaborators: Collaborators,
}

impl Engine {
    /// Create an engine for `root` with the system tooling.
    pub fn new(root: impl Into<PathBuf>, config: CradleConfig) -> Result<Self, CoreError> {
        let collaborators = Collaborators::system(&config, "auto")?;
        Ok(Self::with_collaborators(root, config, collaborators))
    }

    /// Create an engine with explicit collaborators.
    ///
    /// Incomplete WAL entries left by an interrupted run are rolled back
    /// first, unless another process holds the installation lock.
    pub fn with_collaborators(
        root: impl Into<PathBuf>,
        config: CradleConfig,
        collaborators: Collaborators,
    ) -> Self {
        let layout = InstallLayout::new(root);
        let wal = WriteAheadLog::new(&layout);

        // Recovery mutates the tree; never run it under someone else's lock.
        match InstallLock::try_acquire(&layout) {
            Ok(Some(_lock)) => match wal.recover() {
                Ok(0) => {}
                Ok(n) => info!("recovered {n} interrupted operation(s)"),
                Err(e) => warn!("WAL recovery failed: {e}"),
            },
            Ok(None) => {
                debug!("installation lock held; skipping WAL recovery");
            }
            Err(e) => {
                warn!("installation lock check failed; skipping WAL recovery: {e}");
            }
        }

        Self {
            layout,
            wal,
            config,
            collaborators,
        }
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn config(&self) -> &CradleConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    pub fn envs(&self) -> EnvManager<'_> {
        EnvManager::new(
            &self.layout,
            &self.wal,
            self.collaborators.tooling.as_ref(),
            CopyOptions::with_batch_size(self.config.copy.batch_size),
            self.config.tools.python.as_deref(),
        )
    }

    pub fn snapshots(&self) -> SnapshotManager<'_> {
        SnapshotManager::new(&self.layout, self.collaborators.tooling.as_ref())
    }

    pub fn restorer(&self) -> NodeRestorer<'_> {
        NodeRestorer::new(&self.layout, &self.wal, self.collaborators.vcs.as_ref())
    }

    pub fn updater(&self) -> UpdateOrchestrator<'_> {
        UpdateOrchestrator::new(
            &self.layout,
            &self.wal,
            &self.config,
            self.collaborators.tooling.as_ref(),
            self.collaborators.downloader.as_ref(),
            self.collaborators.extractor.as_ref(),
            self.collaborators.vcs.as_ref(),
        )
    }

    pub fn scan(&self) -> Result<Vec<PluginRecord>, CoreError> {
        scan(&self.layout)
    }

    /// Load snapshot `filename` and diff its plugin inventory against the
    /// live tree.
    pub fn diff_against(&self, filename: &str) -> Result<(Snapshot, PluginDiff), CoreError> {
        let snapshot = self.snapshots().load(filename)?;
        let current = self.scan()?;
        let delta = diff(&snapshot.nodes, &current);
        Ok((snapshot, delta))
    }

    /// Bring the plugin tree back to the state captured in `filename`.
    pub fn restore_from_snapshot(
        &self,
        filename: &str,
        progress: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RestoreOutcome, CoreError> {
        let (_, delta) = self.diff_against(filename)?;
        info!(
            "restoring plugins from {filename}: {} added, {} removed, {} changed",
            delta.added.len(),
            delta.removed.len(),
            delta.changed.len()
        );
        let report = self.restorer().restore(&delta, progress, cancel)?;
        Ok(RestoreOutcome {
            snapshot: filename.to_owned(),
            diff: delta,
            report,
        })
    }
}
