//! Read-only views of the scheduler state.

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Serialize;
use tabled::builder::Builder;
use tabled::settings::{Alignment, Padding, Style};
use tf_id::{CommandId, InvocationId};
use tracing::info;

use super::queue::{CommandQueue, RunningInvocation};
use super::{CommandScheduler, SchedulerResult};
use crate::command::CommandState;
use crate::configuration::Configuration;

/// Snapshot of one running invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationInfo {
    pub invocation_id: InvocationId,
    pub command_id: CommandId,
    pub config_name: String,
    pub command_line: String,
    pub serials: Vec<String>,
    pub elapsed: Duration,
}

impl InvocationInfo {
    fn from_running(invocation_id: InvocationId, running: &RunningInvocation) -> Self {
        let configuration = running.command.configuration();
        Self {
            invocation_id,
            command_id: running.command.command_id(),
            config_name: configuration.name().to_string(),
            command_line: configuration.command_line(),
            serials: running.context.serials(),
            elapsed: running.started_at.elapsed(),
        }
    }
}

impl fmt::Display for InvocationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (command {}): {} on [{}] running {}",
            self.invocation_id,
            self.command_id,
            self.command_line,
            self.serials.join(", "),
            format_time(self.elapsed)
        )
    }
}

/// `Xm:SS`
fn format_time(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}m:{:02}", secs / 60, secs % 60)
}

/// Write `rows` as a borderless table, every column padded to its widest
/// cell plus two spaces.
fn write_table(out: &mut impl Write, rows: &[Vec<String>]) -> std::io::Result<()> {
    let mut builder = Builder::default();
    for row in rows {
        builder.push_record(row.iter().map(String::as_str));
    }

    let mut table = builder.build();
    table
        .with(Style::empty())
        .with(Padding::new(0, 2, 0, 0))
        .with(Alignment::left());
    writeln!(out, "{table}")
}

fn compile_filter(filter: Option<&str>) -> SchedulerResult<Option<Regex>> {
    Ok(filter.map(Regex::new).transpose()?)
}

fn matches_filter(filter: &Option<Regex>, args: &str) -> bool {
    filter.as_ref().is_none_or(|re| re.is_match(args))
}

fn queue_rows(queue: &CommandQueue, now: Instant) -> Vec<Vec<String>> {
    let header = [
        "Id",
        "Config",
        "Created",
        "Exec time",
        "State",
        "Sleep time",
        "Rescheduled",
        "Loop",
    ];
    let mut rows: Vec<Vec<String>> = vec![header.iter().map(|h| h.to_string()).collect()];

    for command in queue.entries() {
        let tracker = queue.tracker(command.command_id());
        let sleep_time = match command.state() {
            CommandState::Sleeping => command
                .sleep_remaining(now)
                .map_or_else(|| "N/A".to_string(), format_time),
            _ => "N/A".to_string(),
        };
        rows.push(vec![
            command.command_id().to_string(),
            command.configuration().name().to_string(),
            format_time(tracker.map(|t| t.age()).unwrap_or_default()),
            format_time(tracker.map(|t| t.total_exec_time()).unwrap_or_default()),
            command.state().to_string(),
            sleep_time,
            command.is_rescheduled().to_string(),
            command.is_loop_mode().to_string(),
        ]);
    }
    rows
}

impl CommandScheduler {
    /// Table of every queued and running command.
    pub fn display_command_queue(&self, out: &mut impl Write) -> SchedulerResult<()> {
        let rows = queue_rows(&self.lock_queue(), Instant::now());
        write_table(out, &rows)?;
        Ok(())
    }

    /// One line per tracked command whose arguments match `filter`.
    pub fn display_commands_info(
        &self,
        out: &mut impl Write,
        filter: Option<&str>,
    ) -> SchedulerResult<()> {
        let filter = compile_filter(filter)?;
        let lines: Vec<String> = self
            .lock_queue()
            .trackers()
            .filter_map(|tracker| {
                let args = tracker.args().join(" ");
                matches_filter(&filter, &args).then(|| {
                    format!(
                        "Command {}: [{}] {}",
                        tracker.id(),
                        format_time(tracker.total_exec_time()),
                        args
                    )
                })
            })
            .collect();

        for line in lines {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }

    /// Write the configuration of every matching command as JSON into the
    /// dump directory. Returns the files written.
    pub fn dump_commands(
        &self,
        out: &mut impl Write,
        filter: Option<&str>,
    ) -> SchedulerResult<Vec<PathBuf>> {
        let filter = compile_filter(filter)?;
        let commands: Vec<(CommandId, Configuration)> = {
            let queue = self.lock_queue();
            queue
                .trackers()
                .filter(|tracker| matches_filter(&filter, &tracker.args().join(" ")))
                .filter_map(|tracker| {
                    queue
                        .configuration_of(tracker.id())
                        .map(|config| (tracker.id(), config.clone()))
                })
                .collect()
        };

        let dump_dir = &self.shared.config.dump_dir;
        std::fs::create_dir_all(dump_dir)?;

        let mut written = Vec::with_capacity(commands.len());
        for (id, configuration) in commands {
            let path = dump_dir.join(format!("command-{id}.json"));
            let json = serde_json::to_vec_pretty(&configuration).map_err(std::io::Error::from)?;
            std::fs::write(&path, json)?;
            writeln!(out, "Saved command dump to {}", path.display())?;
            info!(command_id = %id, path = %path.display(), "Dumped command");
            written.push(path);
        }
        Ok(written)
    }

    /// One line per running invocation.
    pub fn display_invocations_info(&self, out: &mut impl Write) -> SchedulerResult<()> {
        let mut infos: Vec<InvocationInfo> = self
            .lock_queue()
            .running()
            .map(|(id, running)| InvocationInfo::from_running(*id, running))
            .collect();
        infos.sort_by_key(|info| info.command_id);

        for info in infos {
            writeln!(out, "{info}")?;
        }
        Ok(())
    }

    pub fn get_invocation_info(&self, invocation_id: &InvocationId) -> Option<InvocationInfo> {
        self.lock_queue()
            .running_invocation(invocation_id)
            .map(|running| InvocationInfo::from_running(*invocation_id, running))
    }
}
