use super::{json_pretty, Context, EXIT_SUCCESS};
use crate::EnvCommand;
use cradle_core::InstallationRepository;
use cradle_schema::{EnvMethod, EnvName, InstallAction, InstallationPatch};

pub fn run(ctx: &Context, cmd: EnvCommand) -> Result<u8, String> {
    match cmd {
        EnvCommand::Create { name } => create(ctx, &name),
        EnvCommand::List => list(ctx),
        EnvCommand::Activate { name } => activate(ctx, &name),
        EnvCommand::Delete { name } => delete(ctx, &name),
        EnvCommand::Recreate { name } => recreate(ctx, &name),
    }
}

fn create(ctx: &Context, name: &str) -> Result<u8, String> {
    let installation = ctx.installation()?;
    let action = InstallAction::CreateEnv { name: name.to_owned() };
    ctx.dispatch(&installation, &action, "creating environment")?;
    if ctx.json {
        let payload = serde_json::json!({ "name": name, "status": "created" });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("created environment '{name}'");
    }
    Ok(EXIT_SUCCESS)
}

fn list(ctx: &Context) -> Result<u8, String> {
    let installation = ctx.installation()?;
    let envs = ctx.engine.envs();
    let names = envs.list().map_err(|e| e.to_string())?;
    let active = envs
        .resolve_active(&installation)
        .map_err(|e| e.to_string())?;

    if ctx.json {
        let entries: Vec<_> = names
            .iter()
            .map(|n| {
                serde_json::json!({
                    "name": n,
                    "method": installation.env_methods.get(&EnvName::from(n.as_str())).map(ToString::to_string),
                    "active": active.as_deref() == Some(n.as_str()),
                })
            })
            .collect();
        println!("{}", json_pretty(&entries)?);
    } else if names.is_empty() {
        println!("no environments (create one with `cradle env create default`)");
    } else {
        for n in &names {
            let marker = if active.as_deref() == Some(n.as_str()) { "*" } else { " " };
            let method = installation
                .env_methods
                .get(&EnvName::from(n.as_str()))
                .map_or_else(|| "unrecorded".to_owned(), ToString::to_string);
            println!("{marker} {n} ({method})");
        }
    }
    Ok(EXIT_SUCCESS)
}

fn activate(ctx: &Context, name: &str) -> Result<u8, String> {
    let installation = ctx.installation()?;
    let action = InstallAction::ActivateEnv { name: name.to_owned() };
    ctx.dispatch(&installation, &action, "activating environment")?;
    if ctx.json {
        let payload = serde_json::json!({ "name": name, "status": "active" });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("'{name}' is now the active environment");
    }
    Ok(EXIT_SUCCESS)
}

fn delete(ctx: &Context, name: &str) -> Result<u8, String> {
    let installation = ctx.installation()?;
    if !ctx.confirm(&format!("Delete environment '{name}'?"))? {
        println!("aborted");
        return Ok(EXIT_SUCCESS);
    }
    let action = InstallAction::DeleteEnv { name: name.to_owned() };
    ctx.dispatch(&installation, &action, "deleting environment")?;
    if ctx.json {
        let payload = serde_json::json!({ "name": name, "status": "deleted" });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("deleted environment '{name}'");
    }
    Ok(EXIT_SUCCESS)
}

fn recreate(ctx: &Context, name: &str) -> Result<u8, String> {
    let installation = ctx.installation()?;
    if !installation.source.is_local() {
        return Err(format!(
            "{} installations do not support recreate-env",
            installation.source
        ));
    }
    if !ctx.confirm(&format!("Rebuild environment '{name}' from the master environment?"))? {
        println!("aborted");
        return Ok(EXIT_SUCCESS);
    }
    let _lock = ctx.lock()?;
    let bar = ctx.bar("recreating environment");
    let report = match ctx.engine.envs().recreate(name, &bar, &ctx.cancel) {
        Ok(r) => {
            bar.ok("environment recreated");
            r
        }
        Err(e) => {
            bar.fail("recreate failed");
            return Err(e.to_string());
        }
    };
    let mut patch = InstallationPatch::default();
    patch.env_methods_set.insert(EnvName::from(name), EnvMethod::Copy);
    ctx.registry
        .apply(&installation.id, &patch)
        .map_err(|e| e.to_string())?;

    if ctx.json {
        let payload = serde_json::json!({
            "name": name,
            "files": report.files,
            "bytes": report.bytes,
            "status": "recreated",
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "recreated environment '{name}' ({} files, {} bytes)",
            report.files, report.bytes
        );
    }
    Ok(EXIT_SUCCESS)
}
