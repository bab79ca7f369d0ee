use super::{colorize_enabled, json_pretty, Context, EXIT_SUCCESS};
use crate::NodesCommand;
use console::Style;
use cradle_core::ActionOutcome;
use cradle_schema::{InstallAction, NodeDelta, PluginDiff};

pub fn run(ctx: &Context, cmd: NodesCommand) -> Result<u8, String> {
    match cmd {
        NodesCommand::Scan => scan(ctx),
        NodesCommand::Diff { snapshot } => diff(ctx, &snapshot),
        NodesCommand::Restore { snapshot } => restore(ctx, &snapshot),
    }
}

fn scan(ctx: &Context) -> Result<u8, String> {
    let records = ctx.engine.scan().map_err(|e| e.to_string())?;
    if ctx.json {
        println!("{}", json_pretty(&records)?);
    } else if records.is_empty() {
        println!("no custom nodes installed");
    } else {
        for r in &records {
            println!(
                "{:<40} {:<9} {:<12} {}",
                r.id.as_str(),
                r.kind.to_string(),
                short_version(r.version.as_deref()),
                colorize_enabled(r.enabled)
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

/// Commit hashes are shown abbreviated; registry versions as they are.
fn short_version(version: Option<&str>) -> &str {
    match version {
        Some(v) if v.len() == 40 && v.chars().all(|c| c.is_ascii_hexdigit()) => &v[..12],
        Some(v) => v,
        None => "-",
    }
}

fn describe(delta: &NodeDelta) -> String {
    match delta {
        NodeDelta::Enabled { from, to } => {
            let word = |e: bool| if e { "enabled" } else { "disabled" };
            format!("{} -> {}", word(*from), word(*to))
        }
        NodeDelta::Version { from, to } => format!(
            "version {} -> {}",
            short_version(from.as_deref()),
            short_version(to.as_deref())
        ),
        NodeDelta::Kind { from, to } => format!("kind {from} -> {to}"),
    }
}

fn print_diff(delta: &PluginDiff) {
    if delta.is_empty() {
        println!("custom nodes match the snapshot");
        return;
    }
    let green = Style::new().green();
    let red = Style::new().red();
    let yellow = Style::new().yellow();
    for r in &delta.added {
        println!("{} {} ({})", green.apply_to("+"), r.id, r.kind);
    }
    for r in &delta.removed {
        println!("{} {} ({})", red.apply_to("-"), r.id, r.kind);
    }
    for c in &delta.changed {
        let details: Vec<String> = c.deltas.iter().map(describe).collect();
        println!("{} {}: {}", yellow.apply_to("~"), c.id, details.join(", "));
    }
}

fn diff(ctx: &Context, snapshot: &str) -> Result<u8, String> {
    let (_, delta) = ctx
        .engine
        .diff_against(snapshot)
        .map_err(|e| e.to_string())?;
    if ctx.json {
        println!("{}", json_pretty(&delta)?);
    } else {
        print_diff(&delta);
    }
    Ok(EXIT_SUCCESS)
}

fn restore(ctx: &Context, snapshot: &str) -> Result<u8, String> {
    let installation = ctx.installation()?;
    if !ctx.json {
        let (_, delta) = ctx
            .engine
            .diff_against(snapshot)
            .map_err(|e| e.to_string())?;
        print_diff(&delta);
        if delta.is_empty() {
            return Ok(EXIT_SUCCESS);
        }
    }
    if !ctx.confirm(&format!("Restore custom nodes from {snapshot}?"))? {
        println!("aborted");
        return Ok(EXIT_SUCCESS);
    }
    let action = InstallAction::RestoreNodes {
        snapshot: snapshot.to_owned(),
    };
    let outcome = ctx.dispatch(&installation, &action, "restoring custom nodes")?;
    let ActionOutcome::Restored(restored) = outcome else {
        return Err("restore produced no report".to_owned());
    };

    if ctx.json {
        println!("{}", json_pretty(&restored)?);
        return Ok(EXIT_SUCCESS);
    }
    let report = &restored.report;
    for id in &report.enabled {
        println!("enabled {id}");
    }
    for id in &report.disabled {
        println!("disabled {id}");
    }
    for c in &report.checked_out {
        let how = if c.fetched { " (after fetch)" } else { "" };
        println!("checked out {} at {}{how}", c.id, short_version(Some(&c.commit)));
    }
    for n in &report.skipped {
        println!("skipped {}: {}", n.id, n.detail);
    }
    for n in &report.failed {
        println!("{} {}: {}", Style::new().red().apply_to("failed"), n.id, n.detail);
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_hashes_are_abbreviated() {
        let hash = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(short_version(Some(hash)), "0123456789ab");
        assert_eq!(short_version(Some("1.2.3")), "1.2.3");
        assert_eq!(short_version(None), "-");
    }

    #[test]
    fn enabled_delta_reads_as_state_change() {
        let d = NodeDelta::Enabled {
            from: true,
            to: false,
        };
        assert_eq!(describe(&d), "enabled -> disabled");
    }
}
