//! Process Transport Integration Tests
//!
//! Drive the `tether-worker` binary through a supervised child process and
//! check that the bus survives worker crashes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use tether_core::transport::ProcessCommand;
use tether_core::{
    BusError, RestartPolicy, RpcBus, SupervisorTransport, Transport, TransportError,
    METHOD_NOT_FOUND, SERVER_ERROR,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn worker_command() -> ProcessCommand {
    ProcessCommand::new(env!("CARGO_BIN_EXE_tether-worker"))
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation timed out")
}

fn spawn_worker(policy: RestartPolicy) -> (Arc<SupervisorTransport>, RpcBus) {
    let transport = Arc::new(
        SupervisorTransport::spawn_process("calc", worker_command(), policy)
            .expect("worker should spawn"),
    );
    let bus = RpcBus::new(Arc::clone(&transport) as Arc<dyn Transport>);
    (transport, bus)
}

async fn worker_pid(bus: &RpcBus) -> u64 {
    let whoami = within(bus.request("whoami", Value::Null)).await.unwrap();
    whoami["pid"].as_u64().expect("whoami returns a pid")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    within(async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

// =============================================================================
// Request / Response
// =============================================================================

#[tokio::test]
async fn test_basic_calls() {
    let (_transport, bus) = spawn_worker(RestartPolicy::Immediate);

    assert_eq!(
        within(bus.request("ping", Value::Null)).await.unwrap(),
        json!("pong")
    );

    let sum: i64 = within(bus.call("add", &json!({"a": 40, "b": 2})))
        .await
        .unwrap();
    assert_eq!(sum, 42);

    let echoed = within(bus.request("echo", json!({"nested": [1, 2, 3]})))
        .await
        .unwrap();
    assert_eq!(echoed, json!({"nested": [1, 2, 3]}));

    let whoami = within(bus.request("whoami", Value::Null)).await.unwrap();
    assert_eq!(whoami["service"], json!("calc"));

    assert_ok!(within(bus.close()).await);
}

#[tokio::test]
async fn test_remote_errors_are_reported() {
    let (_transport, bus) = spawn_worker(RestartPolicy::Immediate);

    let err = within(bus.request("no_such_method", Value::Null))
        .await
        .unwrap_err();
    let rpc = err.rpc_error().expect("error response");
    assert_eq!(rpc.code, METHOD_NOT_FOUND);
    assert!(err.to_string().starts_with("RPC error: calc.no_such_method:"));

    let err = within(bus.request("fail", json!({"message": "out of coffee"})))
        .await
        .unwrap_err();
    let rpc = err.rpc_error().expect("error response");
    assert_eq!(rpc.code, SERVER_ERROR);
    assert_eq!(rpc.message, "out of coffee");

    // Handler-chosen codes pass through untouched
    let err = within(bus.request("add", json!({"a": i64::MAX, "b": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.rpc_error().map(|e| e.code), Some(-32602));

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let (_transport, bus) = spawn_worker(RestartPolicy::Immediate);

    let params: Vec<Value> = (0..20).map(|i| json!({"a": i, "b": 1000})).collect();
    let calls = params.iter().map(|p| bus.call::<_, i64>("add", p));
    let results = within(futures::future::join_all(calls)).await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), i as i64 + 1000);
    }
    assert_eq!(bus.pending_count(), 0);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_worker_can_call_back_into_supervisor() {
    let (_transport, bus) = spawn_worker(RestartPolicy::Immediate);
    bus.set_request_handler("host.greet", |params: Value| async move {
        let name = params["name"].as_str().unwrap_or("stranger").to_string();
        anyhow::Ok(json!(format!("hello, {name}")))
    });

    let reply = within(bus.request(
        "ask_host",
        json!({"method": "host.greet", "params": {"name": "worker"}}),
    ))
    .await
    .unwrap();
    assert_eq!(reply, json!("hello, worker"));

    bus.close().await.unwrap();
}

// =============================================================================
// Crash Recovery
// =============================================================================

#[tokio::test]
async fn test_crash_rejects_in_flight_call_and_respawns() {
    let (transport, bus) = spawn_worker(RestartPolicy::Immediate);
    let first_pid = worker_pid(&bus).await;

    let err = within(bus.request("crash", Value::Null)).await.unwrap_err();
    assert!(
        matches!(err.transport_error(), Some(TransportError::WorkerCrashed(_))),
        "unexpected error: {err}"
    );
    assert!(err.to_string().starts_with("Transport error during calc.crash:"));

    // Same bus, fresh worker
    let second_pid = worker_pid(&bus).await;
    assert_ne!(first_pid, second_pid);
    assert_eq!(transport.restart_count(), 1);
    assert!(!transport.is_closed());

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_handlers_survive_restart() {
    let (_transport, bus) = spawn_worker(RestartPolicy::Immediate);
    bus.set_request_handler("host.version", |_| async { anyhow::Ok(json!(7)) });

    assert_err!(within(bus.request("crash", Value::Null)).await);

    let version = within(bus.request(
        "ask_host",
        json!({"method": "host.version"}),
    ))
    .await
    .unwrap();
    assert_eq!(version, json!(7));

    bus.close().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_kill_fails_pending_calls() {
    let (transport, bus) = spawn_worker(RestartPolicy::Immediate);
    let pid = worker_pid(&bus).await;

    let slow = bus.request("sleep", json!({"ms": 30_000}));
    let kill = async {
        wait_until(|| bus.pending_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .expect("kill should run");
        assert!(status.success());
    };

    let (result, ()) = within(async { tokio::join!(slow, kill) }).await;
    let err = result.unwrap_err();
    assert!(matches!(
        err.transport_error(),
        Some(TransportError::WorkerCrashed(_))
    ));

    assert_ne!(worker_pid(&bus).await, pid);
    assert_eq!(transport.restart_count(), 1);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_backoff_policy_recovers() {
    let (transport, bus) = spawn_worker(RestartPolicy::Backoff {
        initial_delay_ms: 50,
        max_delay_ms: 200,
        max_restarts: Some(3),
    });
    let first_pid = worker_pid(&bus).await;

    assert_err!(within(bus.request("crash", Value::Null)).await);

    // Calls fail fast while the replacement is pending
    let pid = within(async {
        loop {
            match bus.request("whoami", Value::Null).await {
                Ok(whoami) => break whoami["pid"].as_u64().unwrap(),
                Err(BusError::Transport { .. }) => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    })
    .await;

    assert_ne!(pid, first_pid);
    assert_eq!(transport.restart_count(), 1);

    bus.close().await.unwrap();
}

#[tokio::test]
async fn test_disabled_policy_closes_after_crash() {
    let (transport, bus) = spawn_worker(RestartPolicy::Disabled);
    assert_ok!(within(bus.request("ping", Value::Null)).await);

    assert_err!(within(bus.request("crash", Value::Null)).await);
    wait_until(|| transport.is_closed()).await;

    let err = within(bus.request("ping", Value::Null)).await.unwrap_err();
    assert!(err.transport_error().is_some(), "unexpected error: {err}");
    assert_eq!(transport.restart_count(), 0);

    // Closing an already dead transport is fine
    assert_ok!(bus.close().await);
}

#[tokio::test]
async fn test_clean_worker_exit_closes_transport() {
    let (transport, bus) = spawn_worker(RestartPolicy::Immediate);
    assert_ok!(within(bus.request("ping", Value::Null)).await);

    bus.notify("shutdown", Value::Null).unwrap();
    wait_until(|| transport.is_closed()).await;

    assert_eq!(transport.restart_count(), 0);
    assert_err!(within(bus.request("ping", Value::Null)).await);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_close_rejects_outstanding_requests() {
    let (_transport, bus) = spawn_worker(RestartPolicy::Immediate);
    let bus = Arc::new(bus);

    let caller = Arc::clone(&bus);
    let slow = tokio::spawn(async move { caller.request("sleep", json!({"ms": 30_000})).await });
    wait_until(|| bus.pending_count() == 1).await;

    assert_ok!(within(bus.close()).await);
    let result = within(slow).await.unwrap();
    assert!(result.is_err());

    // Requests after close never reach the transport
    assert!(matches!(
        bus.request("ping", Value::Null).await,
        Err(BusError::Closed)
    ));
    assert_ok!(bus.close().await);
}

#[tokio::test]
async fn test_missing_program_fails_to_spawn() {
    let result = SupervisorTransport::spawn_process(
        "ghost",
        ProcessCommand::new("/nonexistent/tether-worker"),
        RestartPolicy::Immediate,
    );
    assert!(matches!(result, Err(TransportError::SpawnFailed(_))));
}
