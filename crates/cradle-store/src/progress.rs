//! Typed progress events.
//!
//! Every long-running operation reports through a [`ProgressSink`] with an
//! explicit `{ phase, percent, status }` shape. Sinks are called
//! synchronously on the reporting thread.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::mpsc::Sender;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Snapshot,
    Download,
    Extract,
    Apply,
    RecreateEnv,
    CreateEnv,
    DeleteEnv,
    RestoreNodes,
    GitUpdate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Snapshot => "snapshot",
            Phase::Download => "download",
            Phase::Extract => "extract",
            Phase::Apply => "apply",
            Phase::RecreateEnv => "recreate-env",
            Phase::CreateEnv => "create-env",
            Phase::DeleteEnv => "delete-env",
            Phase::RestoreNodes => "restore-nodes",
            Phase::GitUpdate => "git-update",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    /// 0-100, or -1 when the amount of remaining work is unknown.
    pub percent: i32,
    pub status: String,
}

impl ProgressEvent {
    /// Status text is stripped of control characters so tool output
    /// forwarded as status cannot corrupt a terminal or a log line.
    pub fn new(phase: Phase, percent: i32, status: impl AsRef<str>) -> Self {
        Self {
            phase,
            percent: percent.clamp(-1, 100),
            status: status
                .as_ref()
                .chars()
                .filter(|c| !c.is_control())
                .collect(),
        }
    }

    pub fn indeterminate(phase: Phase, status: impl AsRef<str>) -> Self {
        Self::new(phase, -1, status)
    }

    pub fn is_indeterminate(&self) -> bool {
        self.percent < 0
    }
}

pub trait ProgressSink: Sync {
    fn emit(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Sync,
{
    fn emit(&self, event: ProgressEvent) {
        self(event);
    }
}

/// Forwards events over a channel to a consumer on another thread.
#[derive(Debug, Clone)]
pub struct ChannelSink(pub Sender<ProgressEvent>);

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.0.send(event);
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Per-file progress of a copy or counting delete.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CopyProgress {
    pub copied: usize,
    pub total: usize,
    pub elapsed_secs: f64,
    /// Estimated seconds left; -1.0 before the first file completes.
    pub eta_secs: f64,
}

impl CopyProgress {
    pub fn new(copied: usize, total: usize, elapsed_secs: f64) -> Self {
        let eta_secs = if copied == 0 {
            -1.0
        } else {
            let remaining = total.saturating_sub(copied);
            #[allow(clippy::cast_precision_loss)]
            let eta = elapsed_secs * (remaining as f64 / copied as f64);
            eta
        };
        Self {
            copied,
            total,
            elapsed_secs,
            eta_secs,
        }
    }

    pub fn percent(&self) -> i32 {
        if self.total == 0 {
            return 100;
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let pct = (self.copied.saturating_mul(100) / self.total) as i32;
        pct
    }

    pub fn status(&self, verb: &str) -> String {
        if self.eta_secs < 0.0 {
            format!("{verb} {}/{} files", self.copied, self.total)
        } else {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let eta = self.eta_secs.ceil() as u64;
            format!(
                "{verb} {}/{} files, about {eta}s left",
                self.copied, self.total
            )
        }
    }

    pub fn to_event(&self, phase: Phase, verb: &str) -> ProgressEvent {
        ProgressEvent::new(phase, self.percent(), self.status(verb))
    }
}
