use super::{colorize_enabled, json_pretty, Context, EXIT_SUCCESS};
use crate::SnapshotCommand;
use cradle_core::{ActionOutcome, InstallationRepository};
use cradle_schema::{InstallAction, InstallationPatch, SnapshotSummary};

pub fn run(ctx: &Context, cmd: SnapshotCommand) -> Result<u8, String> {
    match cmd {
        SnapshotCommand::Save { label, env } => save(ctx, &label, env.as_deref()),
        SnapshotCommand::List => list(ctx),
        SnapshotCommand::Show { filename } => show(ctx, &filename),
        SnapshotCommand::Delete { filename } => delete(ctx, &filename),
    }
}

fn save(ctx: &Context, label: &str, env: Option<&str>) -> Result<u8, String> {
    let installation = ctx.installation()?;
    let action = InstallAction::Snapshot {
        label: label.to_owned(),
    };
    let outcome = match env {
        None => ctx.dispatch(&installation, &action, "capturing snapshot")?,
        Some(env) => {
            let _lock = ctx.lock()?;
            let bar = ctx.bar("capturing snapshot");
            let result = ctx
                .engine
                .snapshots()
                .save(env, label, &ctx.cancel)
                .map(ActionOutcome::Snapshot);
            ctx.finish(&installation, &bar, &action, result)?
        }
    };
    let ActionOutcome::Snapshot(summary) = outcome else {
        return Err("snapshot produced no summary".to_owned());
    };

    if ctx.json {
        println!("{}", json_pretty(&summary)?);
    } else {
        println!("saved {}", summary.filename);
        print_summary(&summary);
    }
    Ok(EXIT_SUCCESS)
}

fn print_summary(s: &SnapshotSummary) {
    println!(
        "  {} [{}] env {}: {} packages, {} nodes",
        s.created_at, s.label, s.env_name, s.package_count, s.node_count
    );
}

fn list(ctx: &Context) -> Result<u8, String> {
    let snapshots = ctx.engine.snapshots().list().map_err(|e| e.to_string())?;
    if ctx.json {
        println!("{}", json_pretty(&snapshots)?);
    } else if snapshots.is_empty() {
        println!("no snapshots");
    } else {
        for s in &snapshots {
            println!("{}", s.filename);
            print_summary(s);
        }
    }
    Ok(EXIT_SUCCESS)
}

fn show(ctx: &Context, filename: &str) -> Result<u8, String> {
    let snapshot = ctx
        .engine
        .snapshots()
        .load(filename)
        .map_err(|e| e.to_string())?;
    if ctx.json {
        println!("{}", json_pretty(&snapshot)?);
        return Ok(EXIT_SUCCESS);
    }
    println!("label:   {}", snapshot.label);
    println!("created: {}", snapshot.created_at);
    println!("env:     {}", snapshot.env_name);
    println!("packages ({}):", snapshot.package_count);
    for p in &snapshot.packages {
        println!("  {}=={}", p.name, p.version);
    }
    println!("nodes ({}):", snapshot.node_count);
    for n in &snapshot.nodes {
        println!(
            "  {} {} {} {}",
            n.id,
            n.kind,
            n.version.as_deref().unwrap_or("-"),
            colorize_enabled(n.enabled)
        );
    }
    Ok(EXIT_SUCCESS)
}

fn delete(ctx: &Context, filename: &str) -> Result<u8, String> {
    let installation = ctx.installation()?;
    if !ctx.confirm(&format!("Delete snapshot {filename}?"))? {
        println!("aborted");
        return Ok(EXIT_SUCCESS);
    }
    let _lock = ctx.lock()?;
    ctx.engine
        .snapshots()
        .delete(filename)
        .map_err(|e| e.to_string())?;
    let patch = InstallationPatch {
        node_snapshots_removed: vec![filename.to_owned()],
        ..InstallationPatch::default()
    };
    ctx.registry
        .apply(&installation.id, &patch)
        .map_err(|e| e.to_string())?;

    if ctx.json {
        let payload = serde_json::json!({ "filename": filename, "status": "deleted" });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("deleted {filename}");
    }
    Ok(EXIT_SUCCESS)
}
