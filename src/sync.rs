use std::path::Path;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Publishes the history file somewhere outside this process. Best effort:
/// the run's own results never depend on it.
pub trait HistorySync: Send + Sync {
    fn publish(&self, history_file: &Path);
}

pub struct NoSync;

impl HistorySync for NoSync {
    fn publish(&self, _history_file: &Path) {}
}

/// Runs a shell command (e.g. a git commit + push script) with
/// `HISTORY_FILE` set. Pushes never overlap.
pub struct CommandSync {
    command: String,
    lock: Arc<Mutex<()>>,
}

impl CommandSync {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

impl HistorySync for CommandSync {
    fn publish(&self, history_file: &Path) {
        let command = self.command.clone();
        let lock = Arc::clone(&self.lock);
        let file = history_file.to_path_buf();

        tokio::spawn(async move {
            let _guard = lock.lock().await;
            let result = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .env("HISTORY_FILE", &file)
                .output()
                .await;
            match result {
                Ok(out) if out.status.success() => info!(file = %file.display(), "history synced"),
                Ok(out) => warn!(
                    status = %out.status,
                    "history sync failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                Err(e) => warn!("history sync could not start: {}", e),
            }
        });
    }
}

/// `CommandSync` when a command is configured, otherwise a no-op.
pub fn from_command(command: Option<&str>) -> Box<dyn HistorySync> {
    match command.map(str::trim).filter(|c| !c.is_empty()) {
        Some(c) => Box::new(CommandSync::new(c)),
        None => Box::new(NoSync),
    }
}
