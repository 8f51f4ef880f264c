
use std::time::Duration;

use axum::http::StatusCode;
use serde_json::{json, Value};

use mock_controller::{eventually, Behavior, MockController, RunningAgent, WsMode, TEST_AGENT_ID};
use remote_agent::session::{ConnectionState, Transition};
use remote_agent::tasks::{HandlerError, HandlerRegistry};
use remote_agent::AgentError;

fn registry() -> HandlerRegistry {
    HandlerRegistry::builder()
        .handler_fn("echo", |_| async {
            Ok::<_, HandlerError>(json!({"output": "hi"}))
        })
        .handler_fn("slow", |_| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, HandlerError>(json!({"slept": true}))
        })
        .build()
}

/// Task pushed over the WebSocket comes back as a task_result frame.
#[tokio::test]
async fn test_push_task_round_trip() {
    let controller = MockController::start(Behavior {
        on_connect: vec![json!({
            "type": "task",
            "data": {"task_id": "t1", "command": "echo", "payload": {}}
        })],
        ..Behavior::default()
    })
    .await;

    let running = RunningAgent::spawn(controller.agent_config(), registry());

    assert!(
        controller
            .wait_for(Duration::from_secs(5), |r| !r.frames_of("task_result").is_empty())
            .await,
        "task result should arrive over the WebSocket"
    );

    let recorded = controller.recorded().await;
    let result = recorded.frames_of("task_result")[0];
    assert_eq!(result["agent_id"], TEST_AGENT_ID);
    assert_eq!(
        result["data"],
        json!({"task_id": "t1", "status": "completed", "result": {"output": "hi"}})
    );
    assert!(recorded.results.is_empty(), "nothing posted over HTTP");

    assert_eq!(recorded.registrations.len(), 1);
    assert_eq!(recorded.registrations[0]["id"], TEST_AGENT_ID);
    assert!(recorded.authorization.iter().all(|a| a == "Bearer test-token"));
    assert!(recorded.user_agents[0].starts_with("remote-agent/"));
    assert_eq!(recorded.ws_agent_ids, vec![TEST_AGENT_ID.to_string()]);

    assert_eq!(
        running.agent.state().current().await,
        ConnectionState::Connected
    );
    running.stop().await.unwrap();
}

/// A ping frame is answered with exactly one pong.
#[tokio::test]
async fn test_ping_answered_once() {
    let controller = MockController::start(Behavior {
        on_connect: vec![
            json!({"type": "ping", "data": {}}),
            json!({"type": "heartbeat_ack", "data": {}}),
        ],
        ..Behavior::default()
    })
    .await;

    let running = RunningAgent::spawn(controller.agent_config(), registry());

    assert!(
        controller
            .wait_for(Duration::from_secs(5), |r| !r.frames_of("pong").is_empty())
            .await
    );
    // Leave time for a duplicate to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let recorded = controller.recorded().await;
    assert_eq!(recorded.frames_of("pong").len(), 1);
    assert_eq!(recorded.frames_of("pong")[0]["agent_id"], TEST_AGENT_ID);

    running.stop().await.unwrap();
}

/// Heartbeats go over the WebSocket, starting right after the handshake.
#[tokio::test]
async fn test_heartbeat_over_websocket() {
    let controller = MockController::start(Behavior::default()).await;
    let mut config = controller.agent_config();
    config.heartbeat_interval_ms = 60_000;

    let running = RunningAgent::spawn(config, registry());

    assert!(
        controller
            .wait_for(Duration::from_secs(2), |r| !r.frames_of("heartbeat").is_empty())
            .await,
        "immediate heartbeat after connect"
    );

    let recorded = controller.recorded().await;
    let beat = recorded.frames_of("heartbeat")[0];
    assert_eq!(beat["data"]["status"], "online");
    assert!(beat["data"]["timestamp"].is_string());
    // No metrics handler registered.
    assert!(beat["data"].get("metrics").is_none());
    assert!(recorded.http_heartbeats.is_empty());

    running.stop().await.unwrap();
}

/// Connect fails repeatedly: retries are spaced by the reconnect delay, then
/// the session degrades to polling.
#[tokio::test]
async fn test_fallback_to_polling_after_failures() {
    let controller = MockController::start(Behavior {
        ws_mode: WsMode::Reject,
        ..Behavior::default()
    })
    .await;

    let running = RunningAgent::spawn(controller.agent_config(), registry());

    assert!(
        controller
            .wait_for(Duration::from_secs(5), |r| !r.pending_polls.is_empty())
            .await,
        "agent should start polling"
    );
    // Without an upgrade interval there are no further handshake attempts.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let recorded = controller.recorded().await;
    // Initial attempt plus three retries at roughly d, 2d, 3d.
    assert_eq!(recorded.ws_attempts.len(), 4);
    for pair in recorded.ws_attempts.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(90), "gap too short: {:?}", gap);
        assert!(gap < Duration::from_millis(600), "gap too long: {:?}", gap);
    }
    assert!(recorded.pending_polls[0] >= recorded.ws_attempts[3]);

    assert_eq!(
        running.agent.state().current().await,
        ConnectionState::Degraded
    );
    running.stop().await.unwrap();
}

/// While degraded, a periodic upgrade attempt restores the WebSocket.
#[tokio::test]
async fn test_upgrade_from_polling() {
    let controller = MockController::start(Behavior {
        ws_mode: WsMode::Reject,
        ..Behavior::default()
    })
    .await;
    let mut config = controller.agent_config();
    config.transport.fallback_after_failures = 1;
    config.transport.upgrade_interval_ms = Some(200);

    let running = RunningAgent::spawn(config, registry());
    let state = running.agent.state();

    assert!(
        eventually(Duration::from_secs(3), || {
            let state = state.clone();
            async move { state.current().await == ConnectionState::Degraded }
        })
        .await
    );

    controller.update(|b| b.ws_mode = WsMode::Accept).await;

    assert!(
        eventually(Duration::from_secs(3), || {
            let state = state.clone();
            async move { state.current().await == ConnectionState::Connected }
        })
        .await,
        "upgrade should restore the WebSocket"
    );

    running.stop().await.unwrap();
}

/// Repeated read errors each cause one disconnect and one reconnect after the
/// delay, never overlapping attempts.
#[tokio::test]
async fn test_reconnect_is_sequential() {
    let controller = MockController::start(Behavior {
        ws_mode: WsMode::Drop,
        ..Behavior::default()
    })
    .await;
    let mut config = controller.agent_config();
    config.transport.fallback_after_failures = 0;

    let running = RunningAgent::spawn(config, registry());
    let mut transitions = running.agent.state().subscribe();

    assert!(
        controller
            .wait_for(Duration::from_secs(5), |r| r.ws_attempts.len() >= 4)
            .await
    );

    let recorded = controller.recorded().await;
    for pair in recorded.ws_attempts.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_millis(90), "overlapping reconnect: {:?}", gap);
    }

    running.stop().await.unwrap();

    let mut seen: Vec<Transition> = Vec::new();
    while let Ok(t) = transitions.try_recv() {
        seen.push(t);
    }
    // Every drop is followed by exactly one new attempt.
    for pair in seen.windows(2) {
        if pair[0].to == ConnectionState::Disconnected && pair[1].from == ConnectionState::Disconnected {
            assert_eq!(pair[1].to, ConnectionState::Connecting);
        }
    }
    let drops = seen
        .iter()
        .filter(|t| t.from == ConnectionState::Connected)
        .count();
    assert!(drops >= 2, "expected repeated disconnects, saw {:?}", seen);
}

/// Polling with an empty or non-JSON body is not an error.
#[tokio::test]
async fn test_polling_without_tasks_keeps_state() {
    let controller = MockController::start(Behavior {
        pending_bodies: vec![String::new(), "<html>busy</html>".to_string(), "[]".to_string()].into(),
        ..Behavior::default()
    })
    .await;
    let mut config = controller.agent_config();
    config.transport.use_websocket = false;

    let running = RunningAgent::spawn(config, registry());
    let state = running.agent.state();
    assert!(
        eventually(Duration::from_secs(3), || {
            let state = state.clone();
            async move { state.current().await == ConnectionState::Degraded }
        })
        .await
    );
    let mut transitions = state.subscribe();

    let seen = controller.recorded().await.pending_polls.len();
    assert!(
        controller
            .wait_for(Duration::from_secs(3), |r| r.pending_polls.len() >= seen + 4)
            .await
    );

    assert_eq!(
        running.agent.state().current().await,
        ConnectionState::Degraded
    );
    assert!(transitions.try_recv().is_err(), "no transitions while polling");
    assert!(controller.recorded().await.ws_attempts.is_empty());

    running.stop().await.unwrap();
}

/// Tasks fetched by polling are reported over HTTP; heartbeats too.
#[tokio::test]
async fn test_polled_task_reported_over_http() {
    let controller = MockController::start(Behavior {
        pending_bodies: vec![json!({
            "success": true,
            "tasks": [
                {"id": "p1", "type": "echo", "payload": {}},
                {"id": "p2", "type": "missing_type"}
            ]
        })
        .to_string()]
        .into(),
        ..Behavior::default()
    })
    .await;
    let mut config = controller.agent_config();
    config.transport.use_websocket = false;

    let running = RunningAgent::spawn(config, registry());

    assert!(
        controller
            .wait_for(Duration::from_secs(3), |r| r.results.len() >= 2
                && !r.http_heartbeats.is_empty())
            .await
    );

    let recorded = controller.recorded().await;
    let find = |id: &str| -> Value {
        recorded
            .results
            .iter()
            .find(|(task_id, _)| task_id == id)
            .map(|(_, body)| body.clone())
            .unwrap()
    };
    assert_eq!(find("p1"), json!({"status": "completed", "result": {"output": "hi"}}));
    assert_eq!(
        find("p2"),
        json!({"status": "failed", "error": "unknown task type: missing_type"})
    );
    assert_eq!(recorded.http_heartbeats[0]["status"], "online");

    running.stop().await.unwrap();
}

/// A transport failure while polling moves the session to Disconnected, and
/// polling resumes after the delay.
#[tokio::test]
async fn test_polling_failure_disconnects_then_recovers() {
    let controller = MockController::start(Behavior {
        pending_status: StatusCode::BAD_GATEWAY,
        ..Behavior::default()
    })
    .await;
    let mut config = controller.agent_config();
    config.transport.use_websocket = false;

    let running = RunningAgent::spawn(config, registry());
    let state = running.agent.state();

    assert!(
        eventually(Duration::from_secs(3), || {
            let state = state.clone();
            async move { state.current().await == ConnectionState::Disconnected }
        })
        .await
    );

    controller.update(|b| b.pending_status = StatusCode::OK).await;

    assert!(
        eventually(Duration::from_secs(3), || {
            let state = state.clone();
            async move { state.current().await == ConnectionState::Degraded }
        })
        .await
    );

    running.stop().await.unwrap();
}

/// Registration failure is fatal and nothing else starts.
#[tokio::test]
async fn test_registration_failure_is_fatal() {
    let controller = MockController::start(Behavior {
        register_status: StatusCode::UNAUTHORIZED,
        ..Behavior::default()
    })
    .await;

    let running = RunningAgent::spawn(controller.agent_config(), registry());
    let err = running.stop().await.unwrap_err();
    assert!(matches!(err, AgentError::Registration(_)), "got {:?}", err);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let recorded = controller.recorded().await;
    assert_eq!(recorded.registrations.len(), 1);
    assert!(recorded.ws_attempts.is_empty());
    assert!(recorded.pending_polls.is_empty());
}

/// Shutdown waits for running tasks and still delivers their results.
#[tokio::test]
async fn test_shutdown_drains_in_flight_tasks() {
    let controller = MockController::start(Behavior {
        on_connect: vec![json!({
            "type": "task",
            "data": {"task_id": "slow-1", "command": "slow", "payload": {}}
        })],
        ..Behavior::default()
    })
    .await;

    let running = RunningAgent::spawn(controller.agent_config(), registry());
    let agent = running.agent.clone();

    assert!(
        eventually(Duration::from_secs(3), || {
            let agent = agent.clone();
            async move { agent.dispatcher().in_flight() > 0 }
        })
        .await
    );

    running.stop().await.unwrap();

    assert_eq!(agent.dispatcher().in_flight(), 0);
    assert_eq!(agent.state().current().await, ConnectionState::Disconnected);
    assert!(agent.state().is_terminal().await);

    assert!(
        controller
            .wait_for(Duration::from_secs(2), |r| {
                r.frames_of("task_result")
                    .iter()
                    .any(|f| f["data"]["task_id"] == "slow-1")
                    || r.results.iter().any(|(id, _)| id == "slow-1")
            })
            .await,
        "drained task should still be reported"
    );
}

/// A heartbeat stuck collecting metrics does not hold up shutdown.
#[tokio::test]
async fn test_shutdown_not_blocked_by_slow_heartbeat() {
    let controller = MockController::start(Behavior::default()).await;
    let registry = HandlerRegistry::builder()
        .handler_fn("metrics", |_| async {
            tokio::time::sleep(Duration::from_secs(20)).await;
            Ok::<_, HandlerError>(json!({}))
        })
        .build();
    let mut config = controller.agent_config();
    config.heartbeat_interval_ms = 60_000;

    let running = RunningAgent::spawn(config, registry);
    let state = running.agent.state();
    assert!(
        eventually(Duration::from_secs(3), || {
            let state = state.clone();
            async move { state.current().await == ConnectionState::Connected }
        })
        .await
    );
    // The post-handshake heartbeat is now waiting on the metrics handler.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    running.stop().await.unwrap();
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "stop took {:?}",
        started.elapsed()
    );
}

/// While polling, an HTTP heartbeat that cannot reach the controller ends the
/// polling transport without waiting for the next poll.
#[tokio::test]
async fn test_unreachable_heartbeat_disconnects_polling() {
    let controller = MockController::start(Behavior {
        heartbeat_stall: true,
        ..Behavior::default()
    })
    .await;
    let mut config = controller.agent_config();
    config.transport.use_websocket = false;
    config.transport.poll_interval_ms = 60_000;
    config.transport.request_timeout_ms = 200;

    let running = RunningAgent::spawn(config, registry());
    let mut transitions = running.agent.state().subscribe();

    let left_polling = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match transitions.recv().await {
                Ok(t) if t.from == ConnectionState::Degraded
                    && t.to == ConnectionState::Disconnected => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await;
    assert!(
        matches!(left_polling, Ok(true)),
        "heartbeat timeout should end polling"
    );

    let recorded = controller.recorded().await;
    assert!(!recorded.http_heartbeats.is_empty());
    assert!(recorded.pending_polls.len() <= 2);

    running.stop().await.unwrap();
}
