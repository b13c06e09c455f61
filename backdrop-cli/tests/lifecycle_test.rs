//! End-to-end worker lifecycle tests against the real `backdrop` binary

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backdrop_config::WorkerConfig;
use backdrop_execution::{
    CancelAck, Coordinator, DataFormat, ExecutionError, Failure, ResultChunk, ResultOutcome,
    Session, TerminalState, WaitOutcome, WorkerId, WorkerState,
};
use futures::StreamExt;

const PATIENCE: Duration = Duration::from_secs(10);

fn coordinator_with(executor: &str, max_workers: usize) -> Arc<Coordinator> {
    Coordinator::new(WorkerConfig {
        max_workers,
        program: Some(PathBuf::from(env!("CARGO_BIN_EXE_backdrop"))),
        args: vec![
            "worker".to_string(),
            "--executor".to_string(),
            executor.to_string(),
        ],
        cancel_grace_period: Duration::from_millis(300),
        ..Default::default()
    })
    .expect("coordinator should start")
}

fn coordinator(max_workers: usize) -> Arc<Coordinator> {
    coordinator_with("script", max_workers)
}

async fn wait_for_state(session: &Session, id: WorkerId, state: WorkerState) {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if session.status(id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker {} never reached {}", id, state);
}

async fn finished(session: &Session, id: WorkerId) -> TerminalState {
    match session.wait(id, Some(PATIENCE)).await.unwrap() {
        WaitOutcome::Finished(outcome) => outcome,
        WaitOutcome::TimedOut => panic!("worker {} did not finish", id),
    }
}

async fn drain(session: &Session, id: WorkerId) -> Vec<Result<ResultChunk, ExecutionError>> {
    let ResultOutcome::Stream(stream) = session.result(id, true).unwrap() else {
        panic!("blocking result must return a stream");
    };
    stream.collect().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_three_chunks_arrive_in_order() {
    let coordinator = coordinator(2);
    let session = coordinator.session();
    let id = session
        .launch(
            "emit-bytes 100 a; emit-bytes 100 b; emit-bytes 100 c; tag COPY 3",
            None,
        )
        .unwrap();

    let items = drain(&session, id).await;
    assert_eq!(items.len(), 4);
    for (item, fill) in items.iter().take(3).zip([b'a', b'b', b'c']) {
        match item {
            Ok(ResultChunk::Data { bytes, format }) => {
                assert_eq!(bytes.len(), 100);
                assert!(bytes.iter().all(|b| *b == fill));
                assert_eq!(*format, DataFormat::Binary);
            }
            other => panic!("expected data, got {:?}", other),
        }
    }
    assert_eq!(
        items[3],
        Ok(ResultChunk::Done {
            tags: vec!["COPY 3".to_string()]
        })
    );

    assert_eq!(
        finished(&session, id).await,
        TerminalState::Completed {
            tags: vec!["COPY 3".to_string()]
        }
    );
    let counters = session.status(id).unwrap().counters;
    assert_eq!(counters.data_chunks, 3);
    assert_eq!(counters.data_bytes, 300);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_max_workers_rejects_then_recovers() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let first = session.launch("sleep 300", None).unwrap();

    assert_eq!(
        session.launch("emit again", None).unwrap_err(),
        ExecutionError::ResourceExhausted { max_workers: 1 }
    );
    assert_eq!(coordinator.stats().totals.rejected, 1);

    assert!(matches!(
        finished(&session, first).await,
        TerminalState::Completed { .. }
    ));

    let second = session.launch("emit again", None).unwrap();
    assert!(matches!(
        finished(&session, second).await,
        TerminalState::Completed { .. }
    ));
    assert_eq!(coordinator.stats().totals.launched, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_progress_is_monotonic() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("count 10 50", None).unwrap();
    wait_for_state(&session, id, WorkerState::Running).await;

    let mut observed = Vec::new();
    loop {
        match session.progress(id) {
            Ok(progress) => observed.push(progress.done),
            Err(ExecutionError::NotRunning(_)) => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(!observed.is_empty());
    assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{:?}", observed);
    assert!(observed.iter().all(|done| *done <= 10));

    let ResultOutcome::Stream(stream) = session.result(id, true).unwrap() else {
        panic!("expected a stream");
    };
    let collected = stream.collect_all().await.unwrap();
    let expected: String = (1..=10).map(|i| format!("{}\n", i)).collect();
    assert_eq!(collected.text(), expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_then_wait_reports_cancelled() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("emit started; sleep 30000", None).unwrap();
    wait_for_state(&session, id, WorkerState::Running).await;

    assert_eq!(session.cancel(id).unwrap(), CancelAck::Requested);
    assert_eq!(finished(&session, id).await, TerminalState::Cancelled);
    assert_eq!(session.cancel(id).unwrap(), CancelAck::AlreadyFinished);

    let items = drain(&session, id).await;
    assert_eq!(items.last(), Some(&Err(ExecutionError::Cancelled(id))));
    assert_eq!(coordinator.stats().totals.cancelled, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_before_handshake() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("sleep 30000", None).unwrap();

    session.cancel(id).unwrap();
    assert_eq!(finished(&session, id).await, TerminalState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_that_ignores_cancel_is_killed() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("ignore-cancel; sleep 30000", None).unwrap();
    wait_for_state(&session, id, WorkerState::Running).await;

    let started = Instant::now();
    session.cancel(id).unwrap();
    assert_eq!(finished(&session, id).await, TerminalState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_crashed_worker_is_aborted() {
    let coordinator = coordinator(2);
    let session = coordinator.session();
    let id = session.launch("emit partial; crash", None).unwrap();

    assert!(matches!(
        finished(&session, id).await,
        TerminalState::Failed(Failure::Aborted { .. })
    ));
    let items = drain(&session, id).await;
    assert!(matches!(
        &items[0],
        Ok(ResultChunk::Data { bytes, .. }) if &bytes[..] == b"partial"
    ));
    assert!(matches!(
        items.last(),
        Some(Err(ExecutionError::WorkerAborted { id: got, .. })) if *got == id
    ));

    let id = session.launch("exit 7", None).unwrap();
    assert!(matches!(
        finished(&session, id).await,
        TerminalState::Failed(Failure::Aborted { reason }) if reason.contains('7')
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_error_is_reported() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session
        .launch("emit partial; fail 22012 division by zero", None)
        .unwrap();

    let items = drain(&session, id).await;
    assert_eq!(items.len(), 2);
    assert_eq!(
        items[1],
        Err(ExecutionError::CommandFailed {
            code: "22012".to_string(),
            message: "division by zero".to_string()
        })
    );
    assert!(matches!(
        finished(&session, id).await,
        TerminalState::Failed(Failure::Command { code, .. }) if code == "22012"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detached_worker_runs_on_and_is_reaped() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("sleep 200; emit unseen", None).unwrap();

    session.detach(id).unwrap();
    session.detach(id).unwrap();
    assert_eq!(
        session.wait(id, None).await.unwrap_err(),
        ExecutionError::Detached(id)
    );
    assert!(matches!(
        session.result(id, true),
        Err(ExecutionError::Detached(_))
    ));
    assert_eq!(session.progress(id).unwrap_err(), ExecutionError::Detached(id));
    assert_eq!(session.cancel(id).unwrap_err(), ExecutionError::Detached(id));

    let summary = session.list().into_iter().find(|s| s.id == id).unwrap();
    assert_eq!(summary.owner, None);

    let deadline = Instant::now() + PATIENCE;
    while coordinator.registry().get(id).is_some() {
        assert!(Instant::now() < deadline, "detached worker was never reaped");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(coordinator.stats().totals.completed, 1);

    // Still detached once reaped
    assert!(matches!(
        session.result(id, true),
        Err(ExecutionError::Detached(_))
    ));
    assert_eq!(
        session.wait(id, None).await.unwrap_err(),
        ExecutionError::Detached(id)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_detach_after_completion_reports_detached() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("emit x", None).unwrap();
    assert!(matches!(
        finished(&session, id).await,
        TerminalState::Completed { .. }
    ));

    session.detach(id).unwrap();
    assert!(matches!(
        session.result(id, true),
        Err(ExecutionError::Detached(_))
    ));
    assert_eq!(
        session.wait(id, None).await.unwrap_err(),
        ExecutionError::Detached(id)
    );
    assert_eq!(session.progress(id).unwrap_err(), ExecutionError::Detached(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_command_error_is_not_an_abort() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let script = format!("fail 22012 {}", "m".repeat(2000));
    let id = session.launch(&script, Some(1024)).unwrap();

    match finished(&session, id).await {
        TerminalState::Failed(Failure::Command { code, message }) => {
            assert_eq!(code, "22012");
            assert!(message.starts_with("mmm"));
        }
        other => panic!("expected a command failure, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_with_short_grace_kills_stubborn_worker() {
    let coordinator = Coordinator::new(WorkerConfig {
        max_workers: 1,
        program: Some(PathBuf::from(env!("CARGO_BIN_EXE_backdrop"))),
        args: vec![
            "worker".to_string(),
            "--executor".to_string(),
            "script".to_string(),
        ],
        cancel_grace_period: Duration::from_secs(60),
        ..Default::default()
    })
    .unwrap();
    let session = coordinator.session();
    let id = session.launch("ignore-cancel; sleep 30000", None).unwrap();
    wait_for_state(&session, id, WorkerState::Running).await;

    let started = Instant::now();
    session
        .cancel_with_grace(id, Duration::from_millis(100))
        .unwrap();
    assert_eq!(finished(&session, id).await, TerminalState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_timeout_leaves_worker_running() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("sleep 30000", None).unwrap();
    wait_for_state(&session, id, WorkerState::Running).await;

    assert_eq!(
        session
            .wait(id, Some(Duration::from_millis(100)))
            .await
            .unwrap(),
        WaitOutcome::TimedOut
    );
    assert_eq!(session.status(id).unwrap().state, WorkerState::Running);
    assert!(matches!(
        session.result(id, false).unwrap(),
        ResultOutcome::StillRunning
    ));

    session.cancel(id).unwrap();
    assert_eq!(finished(&session, id).await, TerminalState::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_result_is_consumed_once() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("emit once", None).unwrap();
    finished(&session, id).await;

    let ResultOutcome::Stream(stream) = session.result(id, false).unwrap() else {
        panic!("finished worker must return a stream");
    };
    assert_eq!(stream.collect_all().await.unwrap().text(), "once");
    assert_eq!(
        session.result(id, true).unwrap_err(),
        ExecutionError::ResultAlreadyConsumed(id)
    );

    session.release(id).unwrap();
    assert_eq!(session.status(id).unwrap_err(), ExecutionError::NotFound(id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_small_queue_carries_large_output() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("emit-bytes 20000 z", Some(1024)).unwrap();

    let ResultOutcome::Stream(stream) = session.result(id, true).unwrap() else {
        panic!("expected a stream");
    };
    let collected = stream.collect_all().await.unwrap();
    assert_eq!(collected.data.len(), 20000);
    assert!(collected.chunks > 1);
    assert!(collected.data.iter().all(|b| *b == b'z'));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_launch_arguments() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    assert!(matches!(
        session.launch("emit x", Some(100)),
        Err(ExecutionError::InvalidArgument(_))
    ));
    assert!(matches!(
        session.launch("", None),
        Err(ExecutionError::InvalidArgument(_))
    ));
    assert_eq!(coordinator.stats().totals.launched, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shell_executor_end_to_end() {
    let coordinator = coordinator_with("shell", 2);
    let session = coordinator.session();

    let id = session
        .launch("printf hello; echo warning >&2", None)
        .unwrap();
    let ResultOutcome::Stream(stream) = session.result(id, true).unwrap() else {
        panic!("expected a stream");
    };
    let collected = stream.collect_all().await.unwrap();
    assert_eq!(collected.text(), "hello");
    assert_eq!(collected.notices, vec!["warning".to_string()]);
    assert_eq!(collected.tags, vec!["EXIT 0".to_string()]);

    let id = session.launch("exit 4", None).unwrap();
    let items = drain(&session, id).await;
    assert!(matches!(
        items.last(),
        Some(Err(ExecutionError::CommandFailed { code, .. })) if code == "4"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_stops_live_workers() {
    let coordinator = coordinator(2);
    let session = coordinator.session();
    let a = session.launch("sleep 30000", None).unwrap();
    let b = session.launch("ignore-cancel; sleep 30000", None).unwrap();
    wait_for_state(&session, b, WorkerState::Running).await;

    assert_eq!(coordinator.shutdown().await, 2);
    assert_eq!(finished(&session, a).await, TerminalState::Cancelled);
    assert_eq!(finished(&session, b).await, TerminalState::Cancelled);
    assert_eq!(coordinator.stats().live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_items_are_streamed_before_exit() {
    let coordinator = coordinator(1);
    let session = coordinator.session();
    let id = session.launch("emit first; sleep 30000", None).unwrap();

    let ResultOutcome::Stream(mut stream) = session.result(id, true).unwrap() else {
        panic!("expected a stream");
    };
    let first = tokio::time::timeout(PATIENCE, stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        first,
        ResultChunk::Data {
            bytes: "first".into(),
            format: DataFormat::Text
        }
    );

    session.cancel(id).unwrap();
    assert_eq!(
        stream.next().await,
        Some(Err(ExecutionError::Cancelled(id)))
    );
}
