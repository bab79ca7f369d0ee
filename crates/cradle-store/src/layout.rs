use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current layout format version. Incremented on incompatible layout changes.
pub const LAYOUT_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout of one local installation.
///
/// ```text
/// <root>/
///   ComfyUI/                 application tree
///     custom_nodes/          plugins
///       .disabled/           plugins switched off
///   standalone-env/          master interpreter environment
///   envs/<name>/             user environments
///   snapshots/               snapshot files
///   manifest.json            installed release
///   .cradle/                 lock, version marker, write-ahead log
///   .update-tmp/             scratch space while an update runs
/// ```
///
/// Nothing is created until [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct InstallLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct LayoutVersion {
    format_version: u32,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn comfyui_dir(&self) -> PathBuf {
        self.root.join("ComfyUI")
    }

    #[inline]
    pub fn custom_nodes_dir(&self) -> PathBuf {
        self.comfyui_dir().join("custom_nodes")
    }

    /// Holding area for disabled plugins.
    #[inline]
    pub fn disabled_nodes_dir(&self) -> PathBuf {
        self.custom_nodes_dir().join(".disabled")
    }

    #[inline]
    pub fn master_env_dir(&self) -> PathBuf {
        self.root.join("standalone-env")
    }

    #[inline]
    pub fn envs_dir(&self) -> PathBuf {
        self.root.join("envs")
    }

    #[inline]
    pub fn env_path(&self, name: &str) -> PathBuf {
        self.envs_dir().join(name)
    }

    /// Where an environment is parked while it is being deleted.
    #[inline]
    pub fn env_trash_path(&self, name: &str) -> PathBuf {
        self.envs_dir().join(format!(".{name}.deleting"))
    }

    /// Where an environment is parked while it is being recreated.
    #[inline]
    pub fn env_aside_path(&self, name: &str) -> PathBuf {
        self.envs_dir().join(format!(".{name}.previous"))
    }

    #[inline]
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    #[inline]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    #[inline]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(".cradle")
    }

    #[inline]
    pub fn wal_dir(&self) -> PathBuf {
        self.state_dir().join("wal")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join(".lock")
    }

    #[inline]
    pub fn update_tmp_dir(&self) -> PathBuf {
        self.root.join(".update-tmp")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.envs_dir())?;
        fs::create_dir_all(self.snapshots_dir())?;
        fs::create_dir_all(self.wal_dir())?;

        let version_path = self.state_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = LayoutVersion {
                format_version: LAYOUT_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::write_atomic(&version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.state_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: LayoutVersion = serde_json::from_str(&content)?;

        if ver.format_version != LAYOUT_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: LAYOUT_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

/// Locate the interpreter inside an environment directory.
///
/// Returns the conventional path even when it does not exist so callers can
/// report a useful error.
pub fn python_executable(env_root: &Path) -> PathBuf {
    if cfg!(windows) {
        let direct = env_root.join("python.exe");
        if direct.exists() {
            return direct;
        }
        return env_root.join("Scripts").join("python.exe");
    }
    let python3 = env_root.join("bin").join("python3");
    if python3.exists() {
        return python3;
    }
    env_root.join("bin").join("python")
}

/// Locate the package directory of an environment:
/// `lib/python3.*/site-packages` on Unix, `Lib/site-packages` on Windows.
pub fn find_site_packages(env_root: &Path) -> Option<PathBuf> {
    let windows_style = env_root.join("Lib").join("site-packages");
    if windows_style.is_dir() {
        return Some(windows_style);
    }
    let lib = env_root.join("lib");
    let mut candidates: Vec<PathBuf> = fs::read_dir(&lib)
        .ok()?
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().starts_with("python3"))
        .map(|e| e.path().join("site-packages"))
        .filter(|p| p.is_dir())
        .collect();
    candidates.sort();
    candidates.pop()
}
