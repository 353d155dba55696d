//! Worker-side command protocol behavior over real connections.


use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use test_harness::{master_for, spawn_worker, FakeState};

use drover::client::Exchange;
use drover::config::WorkerDescriptor;
use drover::error::DroverError;
use drover::protocol::{MetricsSnapshot, CONFIRM_PREFIX, ERROR_PREFIX, NO_ACTIVE_PROCESSES};

async fn open(worker: &WorkerDescriptor) -> Exchange {
    Exchange::open(worker, test_harness::TEST_TIMEOUT)
        .await
        .expect("connect to test worker")
}

fn extract_pid(response: &str) -> u32 {
    response
        .split_whitespace()
        .rev()
        .find_map(|tok| tok.parse().ok())
        .expect("response contains a PID")
}

#[tokio::test]
async fn run_then_status_tracks_pid_until_kill() {
    let state = FakeState::shared(10.0, 10.0);
    let (worker, _h) = spawn_worker("W", state).await;
    let mut conn = open(&worker).await;

    let run = conn.send("RUN demo-task --flag").await.unwrap();
    assert!(run.starts_with("Started"));
    let pid = extract_pid(&run);

    let status = conn.send("STATUS").await.unwrap();
    assert!(status.contains(&pid.to_string()));
    assert!(status.contains("demo-task"));

    let kill = conn.send(&format!("KILL {pid}")).await.unwrap();
    assert!(kill.starts_with("Terminated"));

    let status = conn.send("STATUS").await.unwrap();
    assert_eq!(status, NO_ACTIVE_PROCESSES);
}

#[tokio::test]
async fn status_prunes_processes_that_exited_on_their_own() {
    let state = FakeState::shared(10.0, 10.0);
    let (worker, _h) = spawn_worker("W", state.clone()).await;
    let mut conn = open(&worker).await;

    let run = conn.send("RUN demo-task").await.unwrap();
    let pid = extract_pid(&run);

    // The process dies outside the worker's control.
    state.lock().unwrap().procs.get_mut(&pid).unwrap().alive = false;

    let status = conn.send("STATUS").await.unwrap();
    assert_eq!(status, NO_ACTIVE_PROCESSES);
}

#[tokio::test]
async fn failed_run_mutates_nothing() {
    let state = FakeState::shared(10.0, 10.0);
    let (worker, _h) = spawn_worker("W", state.clone()).await;
    let mut conn = open(&worker).await;

    let run = conn.send("RUN failme now").await.unwrap();
    assert!(run.starts_with(ERROR_PREFIX));
    assert_eq!(conn.send("STATUS").await.unwrap(), NO_ACTIVE_PROCESSES);
    assert_eq!(state.lock().unwrap().alive_count(), 0);
}

#[tokio::test]
async fn run_with_unresolved_pid_reports_and_tracks_nothing() {
    let state = FakeState::shared(10.0, 10.0);
    let (worker, _h) = spawn_worker("W", state).await;
    let mut conn = open(&worker).await;

    let run = conn.send("RUN ghost").await.unwrap();
    assert!(run.contains("PID was not found"));
    assert_eq!(conn.send("STATUS").await.unwrap(), NO_ACTIVE_PROCESSES);
}

#[tokio::test]
async fn metrics_returns_the_wire_contract() {
    let state = FakeState::shared(12.3, 45.6);
    state.lock().unwrap().seed(1, "a", 0);
    let (worker, _h) = spawn_worker("W", state).await;
    let mut conn = open(&worker).await;

    let body = conn.send("METRICS").await.unwrap();
    let snap: MetricsSnapshot = serde_json::from_str(&body).unwrap();
    assert_eq!(snap.cpu, 12.3);
    assert_eq!(snap.mem, 45.6);
    assert_eq!(snap.procs, 1);
}

#[tokio::test]
async fn status_all_delegates_to_the_machine_lister() {
    let state = FakeState::shared(10.0, 10.0);
    {
        let mut s = state.lock().unwrap();
        s.seed(1, "a", 0);
        s.seed(2, "b", 0);
    }
    let (worker, _h) = spawn_worker("W", state).await;
    let mut conn = open(&worker).await;

    let listing = conn.send("STATUS ALL").await.unwrap();
    assert!(listing.contains("All processes (2)"));
}

#[tokio::test]
async fn name_and_pids_queries() {
    let state = FakeState::shared(10.0, 10.0);
    state.lock().unwrap().seed(42, "editor", 0);
    let (worker, _h) = spawn_worker("W", state).await;
    let mut conn = open(&worker).await;

    assert_eq!(conn.send("NAME 42").await.unwrap(), "editor");
    assert!(conn.send("NAME 777").await.unwrap().starts_with(ERROR_PREFIX));

    // PIDS reflects only self-started processes, not the seeded one.
    assert_eq!(conn.send("PIDS").await.unwrap(), "[]");
    let run = conn.send("RUN demo-task").await.unwrap();
    let pid = extract_pid(&run);
    let pids: Vec<u32> = serde_json::from_str(&conn.send("PIDS").await.unwrap()).unwrap();
    assert_eq!(pids, vec![pid]);
}

#[tokio::test]
async fn denylisted_process_is_never_killed() {
    let state = FakeState::shared(10.0, 10.0);
    // Elevated priority must not matter: the denylist wins outright.
    state.lock().unwrap().seed(7, "systemd", 10);
    let (worker, _h) = spawn_worker("W", state.clone()).await;
    let mut conn = open(&worker).await;

    let reply = conn.send("KILL 7").await.unwrap();
    assert!(reply.starts_with(ERROR_PREFIX));
    assert!(reply.contains("critical"));
    assert!(state.lock().unwrap().is_alive(7));
}

#[tokio::test]
async fn elevated_kill_proceeds_only_on_yes() {
    let state = FakeState::shared(10.0, 10.0);
    state.lock().unwrap().seed(8, "heavyjob", 5);
    let (worker, _h) = spawn_worker("W", state.clone()).await;
    let mut conn = open(&worker).await;

    let prompt = conn.send("KILL 8").await.unwrap();
    assert!(prompt.starts_with(CONFIRM_PREFIX));

    // Case-insensitive yes proceeds.
    let reply = conn.send("YES").await.unwrap();
    assert!(reply.starts_with("Terminated"));
    assert!(!state.lock().unwrap().is_alive(8));
}

#[tokio::test]
async fn elevated_kill_declined_leaves_process_tracked() {
    let state = FakeState::shared(10.0, 10.0);
    let (worker, _h) = spawn_worker("W", state.clone()).await;
    let mut conn = open(&worker).await;

    let run = conn.send("RUN demo-task").await.unwrap();
    let pid = extract_pid(&run);
    state.lock().unwrap().procs.get_mut(&pid).unwrap().priority = 5;

    let prompt = conn.send(&format!("KILL {pid}")).await.unwrap();
    assert!(prompt.starts_with(CONFIRM_PREFIX));

    let reply = conn.send("nope").await.unwrap();
    assert!(reply.contains("aborted"));
    assert!(state.lock().unwrap().is_alive(pid));

    // Connection stays open and the process is still tracked.
    let status = conn.send("STATUS").await.unwrap();
    assert!(status.contains(&pid.to_string()));
}

#[tokio::test]
async fn unanswered_confirmation_times_out_and_aborts() {
    let state = FakeState::shared(10.0, 10.0);
    state.lock().unwrap().seed(9, "heavyjob", 5);
    let (worker, _h) = spawn_worker("W", state.clone()).await;

    let stream = TcpStream::connect((worker.host.as_str(), worker.port))
        .await
        .unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    write_half.write_all(b"KILL 9\n").await.unwrap();
    let prompt = lines.next_line().await.unwrap().unwrap();
    assert!(prompt.starts_with(CONFIRM_PREFIX));

    // Say nothing; the worker's deadline must fire on its own.
    tokio::time::sleep(test_harness::CONFIRM_TIMEOUT + Duration::from_millis(200)).await;
    let aborted = lines.next_line().await.unwrap().unwrap();
    assert!(aborted.contains("timed out"));
    assert!(state.lock().unwrap().is_alive(9));
}

#[tokio::test]
async fn invalid_commands_keep_the_connection_open() {
    let state = FakeState::shared(10.0, 10.0);
    let (worker, _h) = spawn_worker("W", state).await;
    let mut conn = open(&worker).await;

    let reply = conn.send("FROBNICATE 12").await.unwrap();
    assert!(reply.starts_with(ERROR_PREFIX));

    let reply = conn.send("KILL notanumber").await.unwrap();
    assert!(reply.starts_with(ERROR_PREFIX));

    // Still serving.
    assert_eq!(conn.send("STATUS").await.unwrap(), NO_ACTIVE_PROCESSES);
}

#[tokio::test]
async fn permission_denied_kill_is_reported() {
    let state = FakeState::shared(10.0, 10.0);
    {
        let mut s = state.lock().unwrap();
        s.seed(11, "guarded", 0);
        s.procs.get_mut(&11).unwrap().kill_denied = true;
    }
    let (worker, _h) = spawn_worker("W", state.clone()).await;
    let mut conn = open(&worker).await;

    let reply = conn.send("KILL 11").await.unwrap();
    assert!(reply.starts_with(ERROR_PREFIX));
    assert!(reply.contains("Permission denied"));
    assert!(state.lock().unwrap().is_alive(11));
}

#[tokio::test]
async fn listener_survives_an_aborted_connection() {
    let state = FakeState::shared(10.0, 10.0);
    let (worker, _h) = spawn_worker("W", state).await;

    // An abortive close (RST) surfaces as an error on the worker's
    // side of the connection; the listener must keep accepting.
    let mut stream = TcpStream::connect((worker.host.as_str(), worker.port))
        .await
        .unwrap();
    stream.set_linger(Some(Duration::ZERO)).unwrap();
    stream.write_all(b"STATUS").await.unwrap();
    drop(stream);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut conn = open(&worker).await;
    assert_eq!(conn.send("STATUS").await.unwrap(), NO_ACTIVE_PROCESSES);
}

#[tokio::test]
async fn exit_acknowledges_and_stops_the_worker() {
    let state = FakeState::shared(10.0, 10.0);
    let (worker, handle) = spawn_worker("W", state).await;
    let mut conn = open(&worker).await;

    let reply = conn.send("EXIT").await.unwrap();
    assert!(reply.contains("shutting down"));

    let served = handle.await.unwrap();
    assert!(served.is_ok());
}

#[tokio::test]
async fn master_kill_finds_owner_and_confirms_with_yes() {
    let state1 = FakeState::shared(10.0, 10.0);
    let state2 = FakeState::shared(10.0, 10.0);
    let (w1, _h1) = spawn_worker("Worker-1", state1.clone()).await;
    let (w2, _h2) = spawn_worker("Worker-2", state2.clone()).await;
    let master = master_for(vec![w1.clone(), w2]);

    let mut conn = open(&w1).await;
    let run = conn.send("RUN demo-task").await.unwrap();
    let pid = extract_pid(&run);
    drop(conn);
    state1.lock().unwrap().procs.get_mut(&pid).unwrap().priority = 5;

    let reply = master.kill(pid, true).await.unwrap();
    assert!(reply.starts_with("Terminated"));
    assert!(!state1.lock().unwrap().is_alive(pid));
}

#[tokio::test]
async fn master_kill_without_assume_yes_cancels() {
    let state = FakeState::shared(10.0, 10.0);
    let (w1, _h1) = spawn_worker("Worker-1", state.clone()).await;
    let master = master_for(vec![w1.clone()]);

    let mut conn = open(&w1).await;
    let run = conn.send("RUN demo-task").await.unwrap();
    let pid = extract_pid(&run);
    drop(conn);
    state.lock().unwrap().procs.get_mut(&pid).unwrap().priority = 5;

    let err = master.kill(pid, false).await.unwrap_err();
    assert!(matches!(err, DroverError::Cancelled));
    assert!(state.lock().unwrap().is_alive(pid));
}

#[tokio::test]
async fn master_kill_unknown_pid_is_not_found() {
    let state = FakeState::shared(10.0, 10.0);
    let (w1, _h1) = spawn_worker("Worker-1", state).await;
    let master = master_for(vec![w1]);

    let err = master.kill(424242, true).await.unwrap_err();
    assert!(matches!(err, DroverError::NotFound(424242)));
}
