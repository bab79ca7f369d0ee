use std::path::Path;
use std::process::Command;
use tracing::{debug, warn};
use walkdir::WalkDir;

fn needs_signature(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e == "so" || e == "dylib")
}

/// Ad-hoc re-sign native libraries under `dir` after they were copied.
///
/// Only does work on macOS, where copied binaries can otherwise be refused
/// by the loader. Failures are logged and skipped. Returns the number of
/// files signed.
pub fn resign_binaries(dir: &Path) -> usize {
    if !cfg!(target_os = "macos") {
        return 0;
    }
    let mut signed = 0;
    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && needs_signature(e.path()))
    {
        match Command::new("codesign")
            .args(["--force", "--sign", "-"])
            .arg(entry.path())
            .output()
        {
            Ok(out) if out.status.success() => signed += 1,
            Ok(out) => warn!(
                "codesign failed for {}: {}",
                entry.path().display(),
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => {
                warn!("codesign unavailable: {e}");
                break;
            }
        }
    }
    debug!("re-signed {signed} binaries under {}", dir.display());
    signed
}
