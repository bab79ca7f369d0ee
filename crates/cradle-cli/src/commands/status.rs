use super::{json_pretty, Context, EXIT_SUCCESS};
use cradle_core::supported_actions;
use cradle_store::read_manifest;

pub fn run(ctx: &Context) -> Result<u8, String> {
    let installation = ctx.installation()?;
    let manifest = read_manifest(ctx.engine.layout()).map_err(|e| e.to_string())?;

    if ctx.json {
        let payload = serde_json::json!({
            "installation": installation,
            "manifest": manifest,
            "actions": supported_actions(&installation.source),
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("{} ({}, {})", installation.name, installation.id, installation.source);
    println!("root: {}", installation.root.display());
    match manifest {
        Some(m) => println!(
            "release: {} ({}, python {})",
            m.release_tag, m.variant, m.python_version
        ),
        None => println!("release: {}", installation.release_tag.as_deref().unwrap_or("unknown")),
    }
    println!(
        "active environment: {}",
        installation.active_env.as_deref().unwrap_or("none")
    );
    for (name, method) in &installation.env_methods {
        println!("  {name} ({method})");
    }
    let info = &installation.update_info;
    if let Some(ref err) = info.last_error {
        let at = info.last_error_at.as_deref().unwrap_or("unknown time");
        println!("last update failed at {at}: {err}");
    } else if let Some(ref at) = info.last_success_at {
        println!("last update: {at}");
    }
    if let Some(ref prev) = info.previous_release {
        println!("previous release: {prev}");
    }
    if let Some(ref snap) = info.safety_snapshot {
        println!("pre-update snapshot: {snap}");
    } else if info.snapshot_failed {
        println!("pre-update snapshot: failed");
    }
    Ok(EXIT_SUCCESS)
}
