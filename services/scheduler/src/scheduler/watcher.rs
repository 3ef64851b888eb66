//! Command file reload.
//!
//! Polls the modification time of every watched command file and reloads
//! the ones that changed. Stops when the scheduler shuts down.

use std::path::PathBuf;
use std::time::SystemTime;

use tracing::{debug, warn};

use super::{file_modified, lock, CommandScheduler};

pub(super) async fn watch_command_files(scheduler: CommandScheduler) {
    let interval = scheduler.shared.config.command_file_poll_interval;
    let mut phase_rx = scheduler.shared.phase_tx.subscribe();
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => scheduler.check_command_files(),
            _ = phase_rx.wait_for(|phase| phase.is_stopping()) => {
                debug!("Command file watcher stopping");
                break;
            }
        }
    }
}

impl CommandScheduler {
    fn check_command_files(&self) {
        let watched: Vec<(PathBuf, Option<SystemTime>)> = lock(&self.shared.watched_files)
            .iter()
            .map(|(path, file)| (path.clone(), file.modified))
            .collect();

        for (path, modified) in watched {
            let current = file_modified(&path);
            if current.is_none() || current == modified {
                continue;
            }
            if let Err(e) = self.notify_file_changed(&path) {
                warn!(path = %path.display(), error = %e, "Failed to reload command file");
            }
        }
    }
}
