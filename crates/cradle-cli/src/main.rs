mod commands;
mod registry;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use commands::{exit_code_for, Context};
use cradle_core::{install_signal_handler, Collaborators, Engine};
use cradle_schema::CradleConfig;
use registry::JsonFileRepository;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "cradle",
    version,
    about = "Crash-safe environments, snapshots and updates for ComfyUI installations"
)]
struct Cli {
    /// Installation root (the directory holding ComfyUI/ and standalone-env/).
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Configuration file (defaults to $CRADLE_CONFIG or ~/.config/cradle/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Interpreter tooling used to create environments.
    #[arg(long, value_enum, default_value_t = Tooling::Auto, global = true)]
    tooling: Tooling,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Do not ask for confirmation before destructive operations.
    #[arg(short, long, default_value_t = false, global = true)]
    yes: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Tooling {
    Auto,
    Uv,
    Venv,
    Mock,
}

impl Tooling {
    fn name(self) -> &'static str {
        match self {
            Tooling::Auto => "auto",
            Tooling::Uv => "uv",
            Tooling::Venv => "venv",
            Tooling::Mock => "mock",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SourceKind {
    Standalone,
    Git,
    Cloud,
    Remote,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Register the installation at --root.
    Init {
        /// Kind of installation.
        #[arg(long, value_enum, default_value_t = SourceKind::Standalone)]
        source: SourceKind,
        /// Repository URL (git), endpoint (cloud) or address (remote).
        #[arg(long)]
        url: Option<String>,
        /// Branch tracked by a git installation.
        #[arg(long, default_value = "master")]
        branch: String,
        /// Identifier of the record (defaults to the root directory name).
        #[arg(long)]
        id: Option<String>,
        /// Replace an existing record.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Show the installation record and installed release.
    Status,
    /// Manage runtime environments.
    #[command(subcommand)]
    Env(EnvCommand),
    /// Manage snapshots of environment and plugin state.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Inspect and restore custom nodes.
    #[command(subcommand)]
    Nodes(NodesCommand),
    /// Update the installation. Standalone installations need a release descriptor.
    Update {
        /// JSON release descriptor ({"tag", "variant", "urls", ...}).
        #[arg(long)]
        release: Option<PathBuf>,
        /// Git installations: move to the newest stable tag instead of master.
        #[arg(long, default_value_t = false)]
        stable: bool,
    },
    /// Print (or run) the command that starts the installation.
    Launch {
        /// Run the command instead of printing it.
        #[arg(long, default_value_t = false)]
        run: bool,
    },
    /// Run diagnostic checks on the system and installation.
    Doctor,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
    /// Generate man pages in the specified directory.
    ManPages {
        /// Output directory for man pages.
        #[arg(default_value = "man")]
        dir: PathBuf,
    },
}

#[derive(Debug, Subcommand)]
pub enum EnvCommand {
    /// Create an environment from the master environment.
    Create { name: String },
    /// List environments.
    List,
    /// Make an environment the active one.
    Activate { name: String },
    /// Delete an environment.
    Delete { name: String },
    /// Rebuild an environment from the current master environment.
    Recreate { name: String },
}

#[derive(Debug, Subcommand)]
pub enum SnapshotCommand {
    /// Capture packages and custom nodes of the active environment.
    Save {
        /// Free-text label.
        #[arg(default_value = "manual")]
        label: String,
        /// Environment to capture instead of the active one.
        #[arg(long)]
        env: Option<String>,
    },
    /// List snapshots, newest first.
    List,
    /// Show a snapshot's full contents.
    Show { filename: String },
    /// Delete a snapshot file.
    Delete { filename: String },
}

#[derive(Debug, Subcommand)]
pub enum NodesCommand {
    /// List the custom nodes currently installed.
    Scan,
    /// Compare the current custom nodes with a snapshot.
    Diff { snapshot: String },
    /// Bring custom nodes back to the state recorded in a snapshot.
    Restore { snapshot: String },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("CRADLE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let Cli {
        root,
        config,
        tooling,
        json,
        yes,
        command,
        ..
    } = cli;
    let result = match command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
        command => {
            open_context(&root, config.as_deref(), tooling, json, yes).and_then(|ctx| run(&ctx, command))
        }
    };
    finish(result)
}

fn open_context(
    root: &Path,
    config: Option<&Path>,
    tooling: Tooling,
    json: bool,
    yes: bool,
) -> Result<Context, String> {
    let config = load_config(config)?;
    let collaborators =
        Collaborators::system(&config, tooling.name()).map_err(|e| e.to_string())?;
    let cancel = install_signal_handler();
    // Interrupted operations are rolled back here, before any command runs.
    let engine = Engine::with_collaborators(absolute(root), config, collaborators);
    Ok(Context {
        registry: JsonFileRepository::new(engine.layout()),
        engine,
        cancel,
        json,
        yes,
    })
}

fn run(ctx: &Context, command: Commands) -> Result<u8, String> {
    match command {
        Commands::Init {
            source,
            url,
            branch,
            id,
            force,
        } => commands::init::run(ctx, source, url, branch, id, force),
        Commands::Status => commands::status::run(ctx),
        Commands::Env(cmd) => commands::env::run(ctx, cmd),
        Commands::Snapshot(cmd) => commands::snapshot::run(ctx, cmd),
        Commands::Nodes(cmd) => commands::nodes::run(ctx, cmd),
        Commands::Update { release, stable } => {
            commands::update::run(ctx, release.as_deref(), stable)
        }
        Commands::Launch { run } => commands::launch::run(ctx, run),
        Commands::Doctor => commands::doctor::run(ctx),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::ManPages { dir } => commands::man_pages::run::<Cli>(&dir),
    }
}

fn finish(result: Result<u8, String>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::from(exit_code_for(&msg))
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<CradleConfig, String> {
    match path {
        Some(p) => CradleConfig::load(p),
        None => CradleConfig::load_default(),
    }
    .map_err(|e| format!("config error: {e}"))
}

fn absolute(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}
