//! Integration tests for queue and invocation views.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{args, fake_pool, scheduler, test_config, wait_until, ScriptedInvocation};
use tf_scheduler::{CommandScheduler, Configuration, SchedulerError};
use tokio::sync::Notify;

fn render(write: impl FnOnce(&mut Vec<u8>)) -> String {
    let mut out = Vec::new();
    write(&mut out);
    String::from_utf8(out).unwrap()
}

#[tokio::test]
async fn test_display_command_queue() {
    let pool = fake_pool(0);
    let invocation = ScriptedInvocation::succeeding();
    let scheduler = scheduler(&pool, &invocation);
    scheduler.add_command(&args(&["empty"])).unwrap();

    let table = render(|out| scheduler.display_command_queue(out).unwrap());
    assert_eq!(
        table,
        "Id  Config  Created  Exec time  State            Sleep time  Rescheduled  Loop   \n\
         1   empty   0m:00    0m:00      Wait_for_device  N/A         false        false  \n"
    );
}

#[tokio::test]
async fn test_display_commands_info_with_filter() {
    let pool = fake_pool(0);
    let invocation = ScriptedInvocation::succeeding();
    let scheduler = scheduler(&pool, &invocation);
    scheduler.add_command(&args(&["empty"])).unwrap();
    scheduler
        .add_command(&args(&["other", "--serial", "serial3"]))
        .unwrap();

    let all = render(|out| scheduler.display_commands_info(out, None).unwrap());
    assert_eq!(
        all,
        "Command 1: [0m:00] empty\nCommand 2: [0m:00] other --serial serial3\n"
    );

    let filtered = render(|out| {
        scheduler
            .display_commands_info(out, Some("serial[0-9]"))
            .unwrap()
    });
    assert_eq!(filtered, "Command 2: [0m:00] other --serial serial3\n");

    let err = scheduler
        .display_commands_info(&mut Vec::<u8>::new(), Some("("))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::InvalidFilter(_)));
}

#[tokio::test]
async fn test_dump_commands() {
    let dir = tempfile::tempdir().unwrap();
    let pool = fake_pool(0);
    let invocation = ScriptedInvocation::succeeding();
    let scheduler = CommandScheduler::new(
        test_config().with_dump_dir(dir.path()),
        pool.clone(),
        invocation.clone(),
    );
    scheduler
        .add_command(&args(&["dumped", "--test-tag", "nightly"]))
        .unwrap();
    scheduler.add_command(&args(&["skipped"])).unwrap();

    let mut out = Vec::new();
    let written = scheduler.dump_commands(&mut out, Some("dumped")).unwrap();

    assert_eq!(written, vec![dir.path().join("command-1.json")]);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        format!("Saved command dump to {}\n", written[0].display())
    );
    let dumped: Configuration =
        serde_json::from_slice(&std::fs::read(&written[0]).unwrap()).unwrap();
    assert_eq!(dumped.name(), "dumped");
    assert_eq!(
        dumped.command_options().test_tag.as_deref(),
        Some("nightly")
    );
}

#[tokio::test]
async fn test_invocation_info_while_running() {
    let pool = fake_pool(1);
    let gate = Arc::new(Notify::new());
    let invocation = ScriptedInvocation::new({
        let gate = Arc::clone(&gate);
        move |_| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(())
            }
        }
    });
    let scheduler = scheduler(&pool, &invocation);
    scheduler.start().unwrap();

    let invocation_id = scheduler
        .exec_command(common::RecordingListener::new(), &args(&["test", "--test-tag", "adhoc"]))
        .unwrap();
    wait_until(|| invocation.invoke_count() == 1).await;

    let info = scheduler.get_invocation_info(&invocation_id).unwrap();
    assert_eq!(info.invocation_id, invocation_id);
    assert_eq!(info.config_name, "test");
    assert_eq!(info.command_line, "test --test-tag adhoc");
    assert_eq!(info.serials, vec!["serial0"]);

    let listing = render(|out| scheduler.display_invocations_info(out).unwrap());
    assert!(listing.starts_with(&format!("{invocation_id} (command 1): test --test-tag adhoc on [serial0]")));

    let table = render(|out| scheduler.display_command_queue(out).unwrap());
    assert!(table.contains("Executing"));

    gate.notify_one();
    wait_until(|| scheduler.get_invocation_info(&invocation_id).is_none()).await;
    assert_eq!(
        render(|out| scheduler.display_invocations_info(out).unwrap()),
        ""
    );

    scheduler.shutdown();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_commands_size_counts_executing() {
    let pool = fake_pool(1);
    let gate = Arc::new(Notify::new());
    let invocation = ScriptedInvocation::new({
        let gate = Arc::clone(&gate);
        move |_| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(())
            }
        }
    });
    let scheduler = scheduler(&pool, &invocation);
    scheduler.add_command(&args(&["first"])).unwrap();
    scheduler.add_command(&args(&["second"])).unwrap();
    scheduler.start().unwrap();

    wait_until(|| invocation.invoke_count() == 1).await;
    assert_eq!(scheduler.get_all_commands_size(), 2);

    gate.notify_one();
    wait_until(|| invocation.invoke_count() == 2).await;
    assert_eq!(scheduler.get_all_commands_size(), 1);

    gate.notify_one();
    scheduler.shutdown_on_empty();
    assert!(scheduler.join_timeout(Duration::from_secs(5)).await);
    assert_eq!(scheduler.get_all_commands_size(), 0);
}
