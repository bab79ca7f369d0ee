use super::{json_pretty, Context, EXIT_SUCCESS};
use crate::SourceKind;
use cradle_core::build_installation;
use cradle_schema::InstallSource;

fn source_from(kind: SourceKind, url: Option<String>, branch: String) -> Result<InstallSource, String> {
    let need_url = |what: &str| url.clone().ok_or_else(|| format!("--url is required for {what} installations"));
    Ok(match kind {
        SourceKind::Standalone => InstallSource::Standalone,
        SourceKind::Git => InstallSource::Git {
            repo_url: need_url("git")?,
            branch,
        },
        SourceKind::Cloud => InstallSource::Cloud {
            endpoint: need_url("cloud")?,
        },
        SourceKind::Remote => InstallSource::Remote {
            url: need_url("remote")?,
        },
    })
}

pub fn run(
    ctx: &Context,
    kind: SourceKind,
    url: Option<String>,
    branch: String,
    id: Option<String>,
    force: bool,
) -> Result<u8, String> {
    if ctx.registry.exists() && !force {
        return Err(format!(
            "an installation is already registered at {} (use --force to replace it)",
            ctx.engine.layout().root().display()
        ));
    }
    let source = source_from(kind, url, branch)?;
    let id = id.unwrap_or_else(|| {
        ctx.engine
            .layout()
            .root()
            .file_name()
            .map_or_else(|| "default".to_owned(), |n| n.to_string_lossy().into_owned())
    });

    let _lock = ctx.lock()?;
    let installation =
        build_installation(&ctx.engine, id, source).map_err(|e| e.to_string())?;
    if installation.source.is_local() {
        ctx.engine
            .layout()
            .initialize()
            .map_err(|e| format!("store error: {e}"))?;
    }
    ctx.registry.save(&installation).map_err(|e| e.to_string())?;

    if ctx.json {
        println!("{}", json_pretty(&installation)?);
    } else {
        println!(
            "registered {} installation '{}' ({})",
            installation.source, installation.name, installation.id
        );
        if let Some(ref tag) = installation.release_tag {
            println!("release: {tag}");
        }
        for (name, method) in &installation.env_methods {
            println!("  environment {name} ({method})");
        }
        if let Some(ref active) = installation.active_env {
            println!("active environment: {active}");
        }
    }
    Ok(EXIT_SUCCESS)
}
