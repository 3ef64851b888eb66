//! Per-command bookkeeping.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tf_id::CommandId;

/// One submitted command.
///
/// The argument vector never changes after submission. The scheduler
/// accumulates execution time across every run of the command, which is what
/// drives fair dispatch between looping commands.
///
/// Trackers order by id.
#[derive(Debug, Clone)]
pub struct CommandTracker {
    id: CommandId,
    args: Vec<String>,
    command_file: Option<PathBuf>,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    total_exec_time: Duration,
}

impl CommandTracker {
    pub fn new(id: CommandId, args: Vec<String>, command_file: Option<PathBuf>) -> Self {
        Self {
            id,
            args,
            command_file,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            total_exec_time: Duration::ZERO,
        }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Command file this command was loaded from, if any.
    pub fn command_file(&self) -> Option<&Path> {
        self.command_file.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_wall
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn total_exec_time(&self) -> Duration {
        self.total_exec_time
    }

    pub fn add_exec_time(&mut self, elapsed: Duration) {
        self.total_exec_time += elapsed;
    }
}

impl PartialEq for CommandTracker {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for CommandTracker {}

impl PartialOrd for CommandTracker {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CommandTracker {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(id: u32, arg: &str) -> CommandTracker {
        CommandTracker::new(CommandId::new(id), vec![arg.to_string()], None)
    }

    #[test]
    fn test_trackers_sort_by_id() {
        let mut trackers = vec![tracker(3, "c"), tracker(1, "a"), tracker(2, "b")];
        trackers.sort();
        let args: Vec<_> = trackers.iter().map(|t| t.args()[0].as_str()).collect();
        assert_eq!(args, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_exec_time_accumulates() {
        let mut t = tracker(1, "test");
        assert_eq!(t.total_exec_time(), Duration::ZERO);
        t.add_exec_time(Duration::from_millis(250));
        t.add_exec_time(Duration::from_millis(750));
        assert_eq!(t.total_exec_time(), Duration::from_secs(1));
    }

    #[test]
    fn test_command_file_recorded() {
        let t = CommandTracker::new(
            CommandId::new(1),
            vec!["test".into()],
            Some(PathBuf::from("/tmp/cmds.txt")),
        );
        assert_eq!(t.command_file(), Some(Path::new("/tmp/cmds.txt")));
    }
}
