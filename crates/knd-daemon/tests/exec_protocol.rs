//! Execution protocol tests: FIFO ordering, cancellation, stream loss,
//! protocol violations, batch staging, and artifact collection.

mod common;

use std::sync::Arc;

use knd_core::error::AgentError;
use knd_core::registry::{KernelId, KernelState};
use knd_core::resource::ResourceRequest;
use knd_daemon::agent::Agent;
use knd_daemon::exec::frame::{AgentFrame, ConsoleStream, ExecutionMode, KernelFrame};
use knd_daemon::exec::{ExecutionOutcome, ExecutionPayload, ExecutionStatus, StagedFile};
use knd_daemon::lifecycle::KernelCreateSpec;
use knd_daemon::upload::ObjectStorageUploader;

use common::{test_config, wait_for, MockRuntime, MockUploader};

fn interactive(code: &str) -> ExecutionPayload {
    ExecutionPayload::Interactive { code: code.into() }
}

type ExecTask = tokio::task::JoinHandle<Result<ExecutionOutcome, AgentError>>;

fn submit(agent: &Arc<Agent>, kernel_id: &KernelId, run_id: &str, payload: ExecutionPayload) -> ExecTask {
    let agent = Arc::clone(agent);
    let kernel_id = kernel_id.clone();
    let run_id = run_id.to_string();
    tokio::spawn(async move { agent.execute(&kernel_id, Some(run_id), payload).await })
}

async fn setup(
    uploader: Option<Arc<dyn ObjectStorageUploader>>,
) -> (Arc<MockRuntime>, Arc<Agent>, KernelId, tempfile::TempDir) {
    let scratch = tempfile::tempdir().expect("tempdir");
    let runtime = MockRuntime::new();
    runtime.add_local_image("demo:latest");
    let agent = Agent::new(test_config(scratch.path()), runtime.clone(), uploader);
    let kernel_id = agent
        .create_kernel(KernelCreateSpec {
            image: "demo:latest".into(),
            resources: ResourceRequest {
                cpu_count: 1,
                accelerators: Vec::new(),
                port_count: 0,
            },
            mounts: Vec::new(),
            service_container_ports: Vec::new(),
        })
        .await
        .expect("create kernel");
    (runtime, agent, kernel_id, scratch)
}

#[tokio::test]
async fn test_fifo_completion_order() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    let first = submit(&agent, &kernel_id, "r1", interactive("1 + 1"));
    let mut channel_one = runtime.next_exec_handle().await;
    match channel_one.next_kernel_frame().await {
        KernelFrame::Start { run_id, mode, code, .. } => {
            assert_eq!(run_id, "r1");
            assert_eq!(mode, ExecutionMode::Interactive);
            assert_eq!(code.as_deref(), Some("1 + 1"));
        }
        other => panic!("expected start frame, got {other:?}"),
    }

    // r2 and r3 arrive while r1 is active: they queue, never interleave.
    let second = submit(&agent, &kernel_id, "r2", interactive("2"));
    let third = submit(&agent, &kernel_id, "r3", interactive("3"));
    {
        let agent = Arc::clone(&agent);
        let kernel_id = kernel_id.clone();
        wait_for("r2 and r3 queued", move || {
            agent.queue_depth(&kernel_id) == 2
        })
        .await;
    }

    channel_one.send_frame(&AgentFrame::Console {
        stream: ConsoleStream::Stdout,
        data: "2\n".into(),
    });
    channel_one.send_frame(&AgentFrame::Finished { exit_code: 0 });
    let outcome_one = first.await.expect("join").expect("r1 outcome");
    assert_eq!(outcome_one.status, ExecutionStatus::Finished { exit_code: 0 });
    assert_eq!(outcome_one.console.len(), 1);
    assert_eq!(outcome_one.console[0].data, "2\n");

    let mut channel_two = runtime.next_exec_handle().await;
    match channel_two.next_kernel_frame().await {
        KernelFrame::Start { run_id, .. } => assert_eq!(run_id, "r2"),
        other => panic!("expected start frame, got {other:?}"),
    }
    channel_two.send_frame(&AgentFrame::Finished { exit_code: 0 });
    let outcome_two = second.await.expect("join").expect("r2 outcome");

    let mut channel_three = runtime.next_exec_handle().await;
    match channel_three.next_kernel_frame().await {
        KernelFrame::Start { run_id, .. } => assert_eq!(run_id, "r3"),
        other => panic!("expected start frame, got {other:?}"),
    }
    channel_three.send_frame(&AgentFrame::Finished { exit_code: 7 });
    let outcome_three = third.await.expect("join").expect("r3 outcome");

    // Completion order equals admission order: tokens strictly increase.
    assert!(outcome_one.ordering_token < outcome_two.ordering_token);
    assert!(outcome_two.ordering_token < outcome_three.ordering_token);
    assert_eq!(outcome_three.status, ExecutionStatus::Finished { exit_code: 7 });
}

#[tokio::test]
async fn test_cancel_queued_request_removes_it() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    let first = submit(&agent, &kernel_id, "r1", interactive("spin"));
    let channel_one = runtime.next_exec_handle().await;

    let second = submit(&agent, &kernel_id, "r2", interactive("2"));
    {
        let agent = Arc::clone(&agent);
        let kernel_id = kernel_id.clone();
        wait_for("r2 queued", move || agent.queue_depth(&kernel_id) == 1).await;
    }
    agent.cancel(&kernel_id, "r2").expect("cancel queued");

    // r2 completes as cancelled without ever opening a channel.
    let outcome_two = second.await.expect("join").expect("r2 outcome");
    assert_eq!(outcome_two.status, ExecutionStatus::Cancelled);
    assert!(outcome_two.console.is_empty());

    channel_one.send_frame(&AgentFrame::Finished { exit_code: 0 });
    let outcome_one = first.await.expect("join").expect("r1 outcome");
    assert_eq!(outcome_one.status, ExecutionStatus::Finished { exit_code: 0 });
}

#[tokio::test]
async fn test_cancel_active_dispatches_next_in_order() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    let first = submit(&agent, &kernel_id, "r1", interactive("spin"));
    let mut channel_one = runtime.next_exec_handle().await;
    let _ = channel_one.next_kernel_frame().await; // start r1

    let second = submit(&agent, &kernel_id, "r2", interactive("2"));
    {
        let agent = Arc::clone(&agent);
        let kernel_id = kernel_id.clone();
        wait_for("r2 queued", move || agent.queue_depth(&kernel_id) == 1).await;
    }

    agent.cancel(&kernel_id, "r1").expect("cancel active");
    // The in-container process is interrupted...
    match channel_one.next_kernel_frame().await {
        KernelFrame::Interrupt => {}
        other => panic!("expected interrupt, got {other:?}"),
    }
    // ...r1 completes as cancelled, and r2 dispatches immediately.
    let outcome_one = first.await.expect("join").expect("r1 outcome");
    assert_eq!(outcome_one.status, ExecutionStatus::Cancelled);

    let mut channel_two = runtime.next_exec_handle().await;
    match channel_two.next_kernel_frame().await {
        KernelFrame::Start { run_id, .. } => assert_eq!(run_id, "r2"),
        other => panic!("expected start frame, got {other:?}"),
    }
    channel_two.send_frame(&AgentFrame::Finished { exit_code: 0 });
    let outcome_two = second.await.expect("join").expect("r2 outcome");
    assert_eq!(outcome_two.status, ExecutionStatus::Finished { exit_code: 0 });
    assert!(outcome_one.ordering_token < outcome_two.ordering_token);
}

#[tokio::test]
async fn test_stream_loss_fails_active_request() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    let first = submit(&agent, &kernel_id, "r1", interactive("spin"));
    let channel_one = runtime.next_exec_handle().await;

    // The container side goes away mid-flight: the caller is notified, not
    // left waiting.
    drop(channel_one);
    let err = first.await.expect("join").expect_err("stream lost");
    assert!(matches!(err, AgentError::StreamLost { .. }));

    // The kernel itself survives and accepts new work.
    assert_eq!(
        agent.kernel(&kernel_id).expect("kernel").state,
        KernelState::Running
    );
}

#[tokio::test]
async fn test_malformed_frame_fails_request_keeps_kernel() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    let first = submit(&agent, &kernel_id, "r1", interactive("1"));
    let channel_one = runtime.next_exec_handle().await;
    channel_one.send_raw(b"definitely not a frame");

    let err = first.await.expect("join").expect_err("protocol violation");
    assert!(matches!(err, AgentError::ProtocolViolation { .. }));

    // The offending execution failed; the kernel did not get torn down.
    assert_eq!(
        agent.kernel(&kernel_id).expect("kernel").state,
        KernelState::Running
    );
    let second = submit(&agent, &kernel_id, "r2", interactive("2"));
    let channel_two = runtime.next_exec_handle().await;
    channel_two.send_frame(&AgentFrame::Finished { exit_code: 0 });
    let outcome = second.await.expect("join").expect("r2 outcome");
    assert_eq!(outcome.status, ExecutionStatus::Finished { exit_code: 0 });
}

#[tokio::test]
async fn test_destroy_fails_queued_and_active_with_session_closed() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    let first = submit(&agent, &kernel_id, "r1", interactive("spin"));
    let _channel_one = runtime.next_exec_handle().await;
    let second = submit(&agent, &kernel_id, "r2", interactive("2"));
    {
        let agent = Arc::clone(&agent);
        let kernel_id = kernel_id.clone();
        wait_for("r2 queued", move || agent.queue_depth(&kernel_id) == 1).await;
    }

    agent.destroy_kernel(&kernel_id).await.expect("destroy");

    let err_one = first.await.expect("join").expect_err("r1 fails");
    let err_two = second.await.expect("join").expect_err("r2 fails");
    assert!(matches!(err_one, AgentError::SessionClosed { .. }));
    assert!(matches!(err_two, AgentError::SessionClosed { .. }));

    // Further submissions are rejected the same way.
    let err = agent
        .execute(&kernel_id, None, interactive("3"))
        .await
        .expect_err("gone");
    assert!(matches!(err, AgentError::SessionClosed { .. }));
}

#[tokio::test]
async fn test_feed_input_reaches_active_run() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    let first = submit(&agent, &kernel_id, "r1", interactive("input()"));
    let mut channel_one = runtime.next_exec_handle().await;
    let _ = channel_one.next_kernel_frame().await; // start

    agent.feed_input(&kernel_id, "hello\n").expect("feed input");
    match channel_one.next_kernel_frame().await {
        KernelFrame::Input { text } => assert_eq!(text, "hello\n"),
        other => panic!("expected input frame, got {other:?}"),
    }

    channel_one.send_frame(&AgentFrame::Finished { exit_code: 0 });
    first.await.expect("join").expect("outcome");
}

#[tokio::test]
async fn test_batch_stages_inputs_and_collects_artifacts() {
    let uploader = MockUploader::new();
    let (runtime, agent, kernel_id, _scratch) =
        setup(Some(uploader.clone() as Arc<dyn ObjectStorageUploader>)).await;

    let payload = ExecutionPayload::Batch {
        build_cmd: Some("make".into()),
        exec_cmd: "./run".into(),
        input_files: vec![StagedFile {
            name: "data/input.csv".into(),
            data: b"a,b\n1,2\n".to_vec(),
        }],
    };
    let task = submit(&agent, &kernel_id, "batch-1", payload);
    let mut channel = runtime.next_exec_handle().await;
    match channel.next_kernel_frame().await {
        KernelFrame::Start {
            mode,
            build_cmd,
            exec_cmd,
            ..
        } => {
            assert_eq!(mode, ExecutionMode::Batch);
            assert_eq!(build_cmd.as_deref(), Some("make"));
            assert_eq!(exec_cmd.as_deref(), Some("./run"));
        }
        other => panic!("expected start frame, got {other:?}"),
    }

    // Inputs were staged into the working directory before the start frame.
    let scratch_dir = agent.kernel(&kernel_id).expect("kernel").scratch_dir;
    let staged = scratch_dir.join("work/data/input.csv");
    assert_eq!(std::fs::read(&staged).expect("staged file"), b"a,b\n1,2\n");

    // The run produces an artifact in the designated output directory.
    let artifact = scratch_dir.join("work/.output/result.bin");
    std::fs::write(&artifact, b"payload").expect("write artifact");

    channel.send_frame(&AgentFrame::BuildFinished { exit_code: 0 });
    channel.send_frame(&AgentFrame::Finished { exit_code: 0 });

    let outcome = task.await.expect("join").expect("outcome");
    assert_eq!(outcome.status, ExecutionStatus::Finished { exit_code: 0 });
    assert_eq!(outcome.build_exit_code, Some(0));
    assert_eq!(outcome.artifacts.len(), 1);
    assert_eq!(outcome.artifacts[0].name, "result.bin");
    assert_eq!(outcome.artifacts[0].external_ref, "ext://artifacts/result.bin");
    assert_eq!(uploader.uploaded(), vec![artifact]);
}

#[tokio::test]
async fn test_batch_limits_rejected_at_admission() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    // One file over the configured per-file size.
    let oversized = ExecutionPayload::Batch {
        build_cmd: None,
        exec_cmd: "./run".into(),
        input_files: vec![StagedFile {
            name: "big.bin".into(),
            data: vec![0u8; 17 * 1024 * 1024],
        }],
    };
    let err = agent
        .execute(&kernel_id, None, oversized)
        .await
        .expect_err("oversized");
    assert!(matches!(err, AgentError::InvalidRequest { .. }));

    // Too many files.
    let too_many = ExecutionPayload::Batch {
        build_cmd: None,
        exec_cmd: "./run".into(),
        input_files: (0..17)
            .map(|index| StagedFile {
                name: format!("f{index}"),
                data: Vec::new(),
            })
            .collect(),
    };
    let err = agent
        .execute(&kernel_id, None, too_many)
        .await
        .expect_err("too many");
    assert!(matches!(err, AgentError::InvalidRequest { .. }));

    // A name escaping the working directory.
    let escaping = ExecutionPayload::Batch {
        build_cmd: None,
        exec_cmd: "./run".into(),
        input_files: vec![StagedFile {
            name: "../outside".into(),
            data: Vec::new(),
        }],
    };
    let err = agent
        .execute(&kernel_id, None, escaping)
        .await
        .expect_err("escaping name");
    assert!(matches!(err, AgentError::InvalidRequest { .. }));

    // Nothing reached the runtime: no exec channel was ever opened.
    assert_eq!(runtime.running_containers().len(), 1);
}

#[tokio::test]
async fn test_execute_on_unknown_kernel_is_session_closed() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let runtime = MockRuntime::new();
    let agent = Agent::new(test_config(scratch.path()), runtime.clone(), None);

    let err = agent
        .execute(&KernelId::from("k-ghost"), None, interactive("1"))
        .await
        .expect_err("unknown kernel");
    assert!(matches!(err, AgentError::SessionClosed { .. }));
}

#[tokio::test]
async fn test_execution_wall_clock_ceiling() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let runtime = MockRuntime::new();
    runtime.add_local_image("demo:latest");
    let mut config = test_config(scratch.path());
    config.exec.exec_timeout_ms = Some(200);
    let agent = Agent::new(config, runtime.clone(), None);
    let kernel_id = agent
        .create_kernel(KernelCreateSpec {
            image: "demo:latest".into(),
            resources: ResourceRequest {
                cpu_count: 1,
                accelerators: Vec::new(),
                port_count: 0,
            },
            mounts: Vec::new(),
            service_container_ports: Vec::new(),
        })
        .await
        .expect("create");

    let task = submit(&agent, &kernel_id, "slow", interactive("while true: pass"));
    let mut channel = runtime.next_exec_handle().await;
    let _ = channel.next_kernel_frame().await; // start

    // The kernel never reports a finished marker; the ceiling interrupts
    // the run instead of leaving the caller waiting forever.
    match channel.next_kernel_frame().await {
        KernelFrame::Interrupt => {}
        other => panic!("expected interrupt, got {other:?}"),
    }
    let outcome = task.await.expect("join").expect("outcome");
    assert_eq!(outcome.status, ExecutionStatus::TimedOut);

    // The kernel survives the timed-out run.
    assert_eq!(
        agent.kernel(&kernel_id).expect("kernel").state,
        KernelState::Running
    );
}

#[tokio::test]
async fn test_restart_fails_pending_executions() {
    let (runtime, agent, kernel_id, _scratch) = setup(None).await;

    let first = submit(&agent, &kernel_id, "r1", interactive("spin"));
    let _channel_one = runtime.next_exec_handle().await;

    agent.restart_kernel(&kernel_id).await.expect("restart");

    // The execution running against the old container fails; it is not
    // silently dropped.
    let err = first.await.expect("join").expect_err("r1 fails");
    assert!(matches!(err, AgentError::SessionClosed { .. }));

    // The restarted kernel accepts new executions with a later token.
    let second = submit(&agent, &kernel_id, "r2", interactive("2"));
    let channel_two = runtime.next_exec_handle().await;
    channel_two.send_frame(&AgentFrame::Finished { exit_code: 0 });
    let outcome = second.await.expect("join").expect("r2 outcome");
    assert_eq!(outcome.status, ExecutionStatus::Finished { exit_code: 0 });
    assert!(outcome.ordering_token >= 1);
}
