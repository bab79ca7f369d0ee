pub mod completions;
pub mod doctor;
pub mod env;
pub mod init;
pub mod launch;
pub mod man_pages;
pub mod nodes;
pub mod snapshot;
pub mod status;
pub mod update;

use crate::registry::JsonFileRepository;
use cradle_core::{handle_action, ActionOutcome, CoreError, Engine, InstallLock, InstallationRepository};
use cradle_schema::{InstallAction, Installation};
use cradle_store::{CancelToken, ProgressEvent, ProgressSink};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

/// Everything a command needs: the engine for the selected root, its
/// installation record, and the global flags.
pub struct Context {
    pub engine: Engine,
    pub registry: JsonFileRepository,
    pub cancel: CancelToken,
    pub json: bool,
    pub yes: bool,
}

impl Context {
    pub fn installation(&self) -> Result<Installation, String> {
        self.registry.current().map_err(|e| e.to_string())
    }

    /// Exclusive lock for a mutating command. A held lock is a store error.
    pub fn lock(&self) -> Result<InstallLock, String> {
        InstallLock::acquire_or_fail(self.engine.layout()).map_err(|e| format!("store lock: {e}"))
    }

    pub fn bar(&self, msg: &str) -> PhaseBar {
        if self.json {
            PhaseBar::hidden()
        } else {
            PhaseBar::new(msg)
        }
    }

    /// Ask before a destructive step. Nobody is asked with `--yes`, in JSON
    /// mode, or without a terminal.
    pub fn confirm(&self, prompt: &str) -> Result<bool, String> {
        if self.yes || self.json || !console::user_attended_stderr() {
            return Ok(true);
        }
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .map_err(|e| format!("prompt failed: {e}"))
    }

    /// Run `action` under the installation lock with a progress bar and
    /// persist the resulting patch. A failed update still records its
    /// last-error patch before the error is returned.
    pub fn dispatch(
        &self,
        installation: &Installation,
        action: &InstallAction,
        running: &str,
    ) -> Result<ActionOutcome, String> {
        let _lock = self.lock()?;
        let bar = self.bar(running);
        let result = handle_action(&self.engine, installation, action, &bar, &self.cancel);
        self.finish(installation, &bar, action, result)
    }

    pub fn finish(
        &self,
        installation: &Installation,
        bar: &PhaseBar,
        action: &InstallAction,
        result: Result<ActionOutcome, CoreError>,
    ) -> Result<ActionOutcome, String> {
        match result {
            Ok(outcome) => {
                bar.ok(&format!("{action} finished"));
                self.registry
                    .apply(&installation.id, &outcome.patch())
                    .map_err(|e| e.to_string())?;
                Ok(outcome)
            }
            Err(CoreError::Update(failure)) => {
                bar.fail(&format!("{action} failed"));
                if let Err(e) = self.registry.apply(&installation.id, &failure.patch) {
                    tracing::warn!("could not record update failure: {e}");
                }
                Err(failure.to_string())
            }
            Err(e) => {
                bar.fail(&format!("{action} failed"));
                Err(e.to_string())
            }
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Progress bar fed by engine progress events. Indeterminate events keep
/// the bar where it is and only change the message.
pub struct PhaseBar {
    bar: ProgressBar,
}

impl PhaseBar {
    fn new(msg: &str) -> Self {
        let bar = ProgressBar::new(100);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold} [{bar:30.cyan/blue}] {pos:>3}% {msg}",
            )
            .expect("valid template")
            .progress_chars("=> ")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", " "]),
        );
        bar.set_message(msg.to_owned());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn ok(&self, msg: &str) {
        self.bar
            .set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
        self.bar.finish_with_message(format!("✓ {msg}"));
    }

    pub fn fail(&self, msg: &str) {
        self.bar
            .set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
        self.bar.finish_with_message(format!("✗ {msg}"));
    }
}

impl ProgressSink for PhaseBar {
    fn emit(&self, event: ProgressEvent) {
        self.bar.set_prefix(event.phase.to_string());
        if !event.is_indeterminate() {
            self.bar.set_position(u64::from(event.percent.unsigned_abs()));
        }
        self.bar.set_message(event.status);
    }
}

/// Exit code for an error message produced by a command.
pub fn exit_code_for(msg: &str) -> u8 {
    if msg.starts_with("config error:") || msg.starts_with("schema error:") {
        EXIT_CONFIG_ERROR
    } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
        EXIT_STORE_ERROR
    } else {
        EXIT_FAILURE
    }
}

pub fn colorize_enabled(enabled: bool) -> String {
    use console::Style;
    if enabled {
        Style::new().green().apply_to("enabled").to_string()
    } else {
        Style::new().dim().apply_to("disabled").to_string()
    }
}
