use super::{Context, EXIT_FAILURE, EXIT_SUCCESS};
use cradle_core::InstallLock;
use cradle_runtime::{check_prereqs, format_missing};
use cradle_store::{python_executable, read_manifest, InstallLayout, StoreError, WriteAheadLog};
use std::path::Path;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;
    let layout = ctx.engine.layout();

    check_prereqs_for(ctx, layout, &mut checks, &mut all_pass);

    if layout.comfyui_dir().is_dir() {
        checks.push(Check::pass("application", "Application directory exists"));
        check_installation(ctx, layout, &mut checks, &mut all_pass);
        check_disk_space(layout.root(), &mut checks);
    } else {
        checks.push(Check::info(
            "application",
            &format!("No installation found at {}", layout.root().display()),
        ));
    }

    print_results(&checks, all_pass, ctx.json)
}

fn check_prereqs_for(
    ctx: &Context,
    layout: &InstallLayout,
    checks: &mut Vec<Check>,
    all_pass: &mut bool,
) {
    let master = layout.master_env_dir();
    let master_python = master.is_dir().then(|| python_executable(&master));
    let missing = check_prereqs(&ctx.engine.config().tools, master_python.as_deref());
    if missing.is_empty() {
        checks.push(Check::pass("prereqs", "External tools available"));
    } else {
        *all_pass = false;
        checks.push(Check::fail("prereqs", &format_missing(&missing)));
    }
}

#[allow(clippy::too_many_lines)]
fn check_installation(
    ctx: &Context,
    layout: &InstallLayout,
    checks: &mut Vec<Check>,
    all_pass: &mut bool,
) {
    // Layout version
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("layout_version", "State directory version valid")),
        Err(StoreError::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
            checks.push(Check::info(
                "layout_version",
                "State directory not initialized (run `cradle init`)",
            ));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "layout_version",
                &format!("State directory check failed: {e}"),
            ));
        }
    }

    // Manifest
    match read_manifest(layout) {
        Ok(Some(m)) => checks.push(Check::pass(
            "manifest",
            &format!("Release {} ({}) installed", m.release_tag, m.variant),
        )),
        Ok(None) => checks.push(Check::info("manifest", "No manifest.json (not a release install)")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("manifest", &format!("Cannot read manifest.json: {e}")));
        }
    }

    // Master environment
    if layout.master_env_dir().is_dir() {
        checks.push(Check::pass("master_env", "Master environment present"));
    } else {
        checks.push(Check::warn(
            "master_env",
            "No master environment (standalone-env/); environments cannot be created",
        ));
    }

    // Registry
    match ctx.registry.current() {
        Ok(i) => checks.push(Check::pass(
            "registry",
            &format!("Registered as {} installation '{}'", i.source, i.id),
        )),
        Err(_) => checks.push(Check::info(
            "registry",
            "Installation not registered (run `cradle init`)",
        )),
    }

    // WAL
    let wal = WriteAheadLog::new(layout);
    match wal.list_incomplete() {
        Ok(entries) if entries.is_empty() => {
            checks.push(Check::pass(
                "wal_clean",
                "WAL is clean (no incomplete entries)",
            ));
        }
        Ok(entries) => {
            checks.push(Check::warn(
                "wal_clean",
                &format!(
                    "WAL has {} incomplete entries (will recover on next start)",
                    entries.len()
                ),
            ));
        }
        Err(e) => checks.push(Check::warn("wal_clean", &format!("Cannot read WAL: {e}"))),
    }

    // Lock
    match InstallLock::try_acquire(layout) {
        Ok(Some(_)) => checks.push(Check::pass("install_lock", "Installation lock is free")),
        Ok(None) => checks.push(Check::warn(
            "install_lock",
            "Installation lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "install_lock",
                &format!("Cannot check installation lock: {e}"),
            ));
        }
    }

    // Environments and snapshots
    match ctx.engine.envs().list() {
        Ok(envs) => checks.push(Check::info(
            "environments",
            &format!("{} environment(s)", envs.len()),
        )),
        Err(e) => checks.push(Check::warn(
            "environments",
            &format!("Cannot list environments: {e}"),
        )),
    }
    match ctx.engine.snapshots().list() {
        Ok(snaps) => checks.push(Check::info(
            "snapshots",
            &format!("{} snapshot(s)", snaps.len()),
        )),
        Err(e) => checks.push(Check::warn(
            "snapshots",
            &format!("Cannot list snapshots: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Cradle Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

fn check_disk_space(root: &Path, checks: &mut Vec<Check>) {
    let Ok(avail_bytes) = fs2::available_space(root) else {
        return;
    };
    let avail_mb = avail_bytes / (1024 * 1024);

    // An update briefly holds the old and new release side by side.
    if avail_mb < 1024 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 10 * 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available (updates need room for two releases)"),
        ));
    } else {
        let free_gb = avail_mb / 1024;
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {free_gb} GB available"),
        ));
    }
}
