use super::{json_pretty, Context, EXIT_SUCCESS};
use console::Style;
use cradle_core::{ActionOutcome, CoreError, GitUpdateReport, UpdateReport};
use cradle_schema::{InstallAction, InstallSource, ReleaseDescriptor};
use std::path::Path;

fn read_release(path: &Path) -> Result<ReleaseDescriptor, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read release descriptor {}: {e}", path.display()))?;
    ReleaseDescriptor::from_json(&content)
        .map_err(|e| format!("invalid release descriptor {}: {e}", path.display()))
}

pub fn run(ctx: &Context, release: Option<&Path>, stable: bool) -> Result<u8, String> {
    let installation = ctx.installation()?;
    let release = release.map(read_release).transpose()?;

    let prompt = match (&installation.source, &release) {
        (InstallSource::Standalone, Some(r)) => format!(
            "Update {} from {} to {}?",
            installation.name,
            installation.release_tag.as_deref().unwrap_or("unknown release"),
            r.tag
        ),
        (InstallSource::Git { branch, .. }, _) if stable => {
            format!("Update {} to the newest stable tag of {branch}?", installation.name)
        }
        _ => format!("Update {}?", installation.name),
    };
    if !ctx.confirm(&prompt)? {
        println!("aborted");
        return Ok(EXIT_SUCCESS);
    }

    let action = InstallAction::Update { release };
    let outcome = if stable && matches!(installation.source, InstallSource::Git { .. }) {
        let _lock = ctx.lock()?;
        let bar = ctx.bar("updating repository");
        let result = ctx
            .engine
            .updater()
            .git_update(&installation, true, &bar, &ctx.cancel)
            .map(ActionOutcome::GitUpdated)
            .map_err(CoreError::Update);
        ctx.finish(&installation, &bar, &action, result)?
    } else {
        ctx.dispatch(&installation, &action, "updating")?
    };

    match outcome {
        ActionOutcome::Updated(report) => print_release(ctx, &report)?,
        ActionOutcome::GitUpdated(report) => print_git(ctx, &report)?,
        other => println!("{}", json_pretty(&other)?),
    }
    Ok(EXIT_SUCCESS)
}

fn print_snapshot(safety_snapshot: Option<&str>, failed: bool) {
    match safety_snapshot {
        Some(s) => println!("pre-update snapshot: {s}"),
        None if failed => println!(
            "{}",
            Style::new()
                .yellow()
                .apply_to("pre-update snapshot could not be taken")
        ),
        None => {}
    }
}

fn print_release(ctx: &Context, report: &UpdateReport) -> Result<(), String> {
    if ctx.json {
        println!("{}", json_pretty(report)?);
        return Ok(());
    }
    println!(
        "updated {} -> {}",
        report.previous_release.as_deref().unwrap_or("unknown"),
        report.release_tag
    );
    print_snapshot(report.safety_snapshot.as_deref(), report.snapshot_failed);
    for name in &report.recreated {
        println!("recreated environment {name}");
    }
    for f in &report.env_failures {
        println!(
            "{} environment {} kept its old packages: {}",
            Style::new().yellow().apply_to("warning:"),
            f.name,
            f.error
        );
    }
    if report.cancel_requested {
        println!("cancellation was requested while the update was being applied; it ran to completion");
    }
    Ok(())
}

fn print_git(ctx: &Context, report: &GitUpdateReport) -> Result<(), String> {
    if ctx.json {
        println!("{}", json_pretty(report)?);
        return Ok(());
    }
    let repo = &report.repo;
    if repo.pre_head == repo.post_head {
        println!("already up to date at {}", repo.post_head);
    } else {
        println!("updated {} -> {}", repo.pre_head, repo.post_head);
    }
    if let Some(ref tag) = repo.checked_out_tag {
        println!("checked out {tag}");
    }
    if let Some(ref branch) = repo.backup_branch {
        println!("previous state kept on branch {branch}");
    }
    print_snapshot(report.safety_snapshot.as_deref(), report.snapshot_failed);
    Ok(())
}
