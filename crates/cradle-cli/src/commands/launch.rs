use super::{json_pretty, Context, EXIT_FAILURE, EXIT_SUCCESS};
use cradle_core::{launch_command, LaunchCommand};
use std::process::Command;

pub fn run(ctx: &Context, execute: bool) -> Result<u8, String> {
    let installation = ctx.installation()?;
    let command = launch_command(&ctx.engine, &installation).map_err(|e| e.to_string())?;

    if !execute {
        if ctx.json {
            println!("{}", json_pretty(&command)?);
        } else {
            match command {
                LaunchCommand::Process { program, args, cwd } => {
                    println!("cd {} && {} {}", cwd.display(), program.display(), args.join(" "));
                }
                LaunchCommand::Url { url } => println!("{url}"),
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    match command {
        LaunchCommand::Process { program, args, cwd } => {
            tracing::info!("launching {} in {}", program.display(), cwd.display());
            let status = Command::new(&program)
                .args(&args)
                .current_dir(&cwd)
                .status()
                .map_err(|e| format!("failed to start {}: {e}", program.display()))?;
            Ok(status
                .code()
                .and_then(|c| u8::try_from(c).ok())
                .unwrap_or(EXIT_FAILURE))
        }
        LaunchCommand::Url { url } => {
            println!("{} is hosted elsewhere; open {url}", installation.name);
            Ok(EXIT_SUCCESS)
        }
    }
}
