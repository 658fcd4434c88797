mod support;

use std::time::Duration;

use serde_json::json;
use support::{MockServer, closed_port_url, fast_options};
use tokio::time::Instant;
use toolmux_mcp::{
    ClientManager, ConnectionState, ManagerEvent, ManagerOptions, ServerConfig, ToolCallError, TransportError,
};

async fn manager_with_mock(options: ManagerOptions) -> (ClientManager, MockServer) {
    let mock = MockServer::start().await;
    let manager = ClientManager::new(options);
    assert!(manager.add_server(ServerConfig::http("mock", mock.http_url())).await);
    (manager, mock)
}

#[tokio::test]
async fn http_server_tools_are_routed_by_qualified_name() {
    let (manager, mock) = manager_with_mock(fast_options()).await;

    assert_eq!(
        manager.tool_names().await,
        vec!["mcp_mock_echo", "mcp_mock_fail", "mcp_mock_slow"],
        "both catalog pages are discovered"
    );
    let tools = manager.all_tools().await;
    assert_eq!(tools["mcp_mock_echo"].server, "mock");
    assert_eq!(tools["mcp_mock_echo"].tool.name, "echo");
    assert_eq!(tools["mcp_mock_echo"].tool.description, "Echo the given text");

    let result = manager.call_tool("mcp_mock_echo", json!({ "text": "hello" })).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.content.as_deref(), Some("hello"));
    assert_eq!(result.attempts, 1);

    assert_eq!(mock.initializations(), 1);
    assert!(mock.session_echoes() >= 2, "session id is sent after initialize");

    let status = manager.get_status().await;
    assert_eq!(status.total_servers, 1);
    assert_eq!(status.connected_servers, 1);
    assert_eq!(status.total_tools, 3);
    assert_eq!(status.total_resources, 2);
    assert_eq!(status.total_prompts, 1);
    assert_eq!(status.servers["mock"].state, ConnectionState::Connected);

    manager.shutdown().await;
}

#[tokio::test]
async fn stats_count_each_call_once() {
    let (manager, _mock) = manager_with_mock(fast_options()).await;

    for text in ["a", "b"] {
        assert!(manager.call_tool("mcp_mock_echo", json!({ "text": text })).await.success);
    }
    let failed = manager.call_tool("mcp_mock_fail", json!({})).await;
    assert!(!failed.success);

    let stats = manager.get_all_stats().await;
    assert_eq!(stats.global.total_tool_calls, 3);
    assert_eq!(stats.global.successful_calls, 2);
    assert_eq!(stats.global.failed_calls, 1);

    let echo = &stats.tools["mcp_mock_echo"];
    assert_eq!(echo.tool_key, "mcp_mock_echo");
    assert_eq!((echo.total_calls, echo.success_calls, echo.failed_calls), (2, 2, 0));
    assert_eq!(echo.success_rate, 100.0);

    let fail = manager.get_tool_stats("mcp_mock_fail").await.expect("fail stats");
    assert_eq!((fail.total_calls, fail.failed_calls), (1, 1));
    assert!(fail.last_error.as_deref().is_some_and(|error| error.contains("boom")));

    assert!(manager.get_tool_stats("mcp_mock_slow").await.is_none());
    assert_eq!(stats.servers["mock"].connect_count, 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn application_errors_are_not_retried_and_keep_the_server_healthy() {
    let (manager, mock) = manager_with_mock(fast_options()).await;

    let result = manager.call_tool("mcp_mock_fail", json!({})).await;
    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert_eq!(
        result.error,
        Some(ToolCallError::Application {
            tool: "fail".to_string(),
            message: "boom".to_string(),
        })
    );
    assert_eq!(mock.tool_calls(), 1);

    let client = manager.server("mock").await.expect("registered");
    assert_eq!(client.state().await, ConnectionState::Connected);
    assert_eq!(client.stats().await.consecutive_failures, 0);
    assert_eq!(client.circuit_status().await.failure_count, 0);

    manager.shutdown().await;
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let (manager, mock) = manager_with_mock(fast_options()).await;
    mock.fail_next_calls(2);

    let result = manager.call_tool("mcp_mock_echo", json!({ "text": "again" })).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.attempts, 3);
    assert_eq!(mock.tool_calls(), 3);

    let stats = manager.get_tool_stats("mcp_mock_echo").await.expect("echo stats");
    assert_eq!((stats.total_calls, stats.success_calls), (1, 1));

    manager.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_report_the_last_transport_error() {
    let options = ManagerOptions {
        retry_attempts: 1,
        ..fast_options()
    };
    let (manager, mock) = manager_with_mock(options).await;
    mock.fail_next_calls(10);

    let result = manager.call_tool("mcp_mock_echo", json!({ "text": "x" })).await;
    assert!(!result.success);
    assert_eq!(result.attempts, 2);
    assert!(
        matches!(&result.error, Some(ToolCallError::Transport(error)) if error.is_transient()),
        "{:?}",
        result.error
    );

    let client = manager.server("mock").await.expect("registered");
    assert_eq!(client.state().await, ConnectionState::Failing);
    assert_eq!(client.stats().await.consecutive_failures, 1);
    assert_eq!(manager.tool_names().await.len(), 3, "a failing server stays routable");

    let stats = manager.get_tool_stats("mcp_mock_echo").await.expect("echo stats");
    assert_eq!((stats.total_calls, stats.failed_calls), (1, 1));

    mock.fail_next_calls(0);
    assert!(manager.call_tool("mcp_mock_echo", json!({ "text": "y" })).await.success);
    assert_eq!(client.state().await, ConnectionState::Connected);

    manager.shutdown().await;
}

#[tokio::test]
async fn slow_calls_time_out() {
    let options = ManagerOptions {
        call_timeout: Duration::from_millis(200),
        retry_attempts: 0,
        ..fast_options()
    };
    let (manager, _mock) = manager_with_mock(options).await;

    let result = manager.call_tool("mcp_mock_slow", json!({ "ms": 2000 })).await;
    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert!(matches!(
        result.error,
        Some(ToolCallError::Transport(TransportError::Timeout { .. }))
    ));
    assert!(result.duration < Duration::from_secs(2));

    manager.shutdown().await;
}

#[tokio::test]
async fn heartbeat_disconnects_unreachable_servers_and_reconnects_them() {
    let options = ManagerOptions {
        max_reconnect_attempts: 2,
        ..fast_options()
    };
    let (manager, mock) = manager_with_mock(options).await;
    let mut events = manager.subscribe();
    let client = manager.server("mock").await.expect("registered");

    mock.set_online(false);
    manager.heartbeat_tick().await;
    assert_eq!(client.state().await, ConnectionState::Failing);
    assert_eq!(manager.tool_names().await.len(), 3);

    manager.heartbeat_tick().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    assert!(manager.tool_names().await.is_empty());
    assert_eq!(manager.disconnected_servers().await, vec!["mock"]);

    let unrouted = manager.call_tool("mcp_mock_echo", json!({})).await;
    assert!(matches!(unrouted.error, Some(ToolCallError::ToolNotFound { .. })));

    // Still offline: the reconnect attempt fails and nothing changes.
    manager.heartbeat_tick().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    mock.set_online(true);
    manager.heartbeat_tick().await;
    assert_eq!(client.state().await, ConnectionState::Connected);
    assert_eq!(manager.tool_names().await.len(), 3);
    assert_eq!(manager.connected_servers().await, vec!["mock"]);

    let stats = client.stats().await;
    assert_eq!(stats.reconnect_count, 1);
    assert_eq!(stats.connect_count, 2);
    assert_eq!(stats.disconnect_count, 1);
    assert!(stats.last_heartbeat_time.is_none(), "no ping succeeded yet");

    manager.heartbeat_tick().await;
    assert!(client.stats().await.last_heartbeat_time.is_some());

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|event| matches!(event, ManagerEvent::HeartbeatFailed { server, .. } if server == "mock")));
    assert!(seen.contains(&ManagerEvent::Disconnected { server: "mock".into() }));
    assert!(seen.contains(&ManagerEvent::Reconnected { server: "mock".into() }));
    assert!(seen.contains(&ManagerEvent::Connected {
        server: "mock".into(),
        tools: 3,
    }));

    manager.shutdown().await;
}

#[tokio::test]
async fn heartbeat_skips_reconnect_when_disabled() {
    let options = ManagerOptions {
        max_reconnect_attempts: 1,
        auto_reconnect: false,
        ..fast_options()
    };
    let (manager, mock) = manager_with_mock(options).await;
    let client = manager.server("mock").await.expect("registered");

    mock.set_online(false);
    manager.heartbeat_tick().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    mock.set_online(true);
    manager.heartbeat_tick().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    assert_eq!(mock.initializations(), 1);

    assert!(manager.reconnect_server("mock").await);
    assert_eq!(client.state().await, ConnectionState::Connected);

    manager.shutdown().await;
}

#[tokio::test]
async fn background_heartbeat_recovers_a_server() {
    let options = ManagerOptions {
        max_reconnect_attempts: 1,
        ..fast_options()
    };
    let (manager, mock) = manager_with_mock(options).await;
    let client = manager.server("mock").await.expect("registered");
    assert!(manager.start_heartbeat().await);
    assert!(!manager.start_heartbeat().await, "already running");
    assert!(manager.get_status().await.heartbeat_running);

    mock.set_online(false);
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.is_connected().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("heartbeat disconnects the server");

    mock.set_online(true);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !client.is_connected().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("heartbeat reconnects the server");

    manager.stop_heartbeat().await;
    assert!(!manager.is_heartbeat_running().await);
    manager.shutdown().await;
}

#[tokio::test]
async fn reconnect_server_opens_a_new_session() {
    let (manager, mock) = manager_with_mock(fast_options()).await;

    assert!(manager.reconnect_server("mock").await);
    assert!(!manager.reconnect_server("unknown").await);
    assert_eq!(mock.initializations(), 2);
    assert_eq!(mock.deletes(), 1, "the old session is terminated");

    let stats = manager.get_all_stats().await;
    assert_eq!(stats.servers["mock"].reconnect_count, 1);
    assert_eq!(manager.tool_names().await.len(), 3);

    manager.shutdown().await;
}

#[tokio::test]
async fn unreachable_servers_stay_registered() {
    let options = ManagerOptions {
        retry_attempts: 1,
        ..fast_options()
    };
    let manager = ClientManager::new(options);
    assert!(manager.add_server(ServerConfig::http("down", closed_port_url().await)).await);

    let status = manager.get_status().await;
    assert_eq!(status.total_servers, 1);
    assert_eq!(status.connected_servers, 0);
    assert_eq!(status.disconnected_servers, 1);
    assert_eq!(status.servers["down"].state, ConnectionState::Disconnected);
    assert_eq!(manager.get_all_stats().await.servers["down"].connect_count, 0);

    assert!(manager.remove_server("down").await);
    assert_eq!(manager.get_status().await.total_servers, 0);
}

#[tokio::test]
async fn several_servers_share_one_routing_table() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    let manager = ClientManager::new(fast_options());
    assert!(manager.add_server(ServerConfig::http("one", first.http_url())).await);
    assert!(manager.add_server(ServerConfig::http("two", second.http_url())).await);

    assert_eq!(manager.tool_names().await.len(), 6);
    assert!(manager.call_tool("mcp_two_echo", json!({ "text": "2" })).await.success);
    assert_eq!((first.tool_calls(), second.tool_calls()), (0, 1));

    assert!(manager.remove_server("one").await);
    assert!(manager.tool_names().await.iter().all(|name| name.starts_with("mcp_two_")));
    assert_eq!(first.deletes(), 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn changing_the_prefix_renames_routes() {
    let (manager, _mock) = manager_with_mock(fast_options()).await;

    manager
        .configure(ManagerOptions {
            tool_prefix: "ext".to_string(),
            ..fast_options()
        })
        .await;

    assert_eq!(manager.tool_names().await, vec!["ext_mock_echo", "ext_mock_fail", "ext_mock_slow"]);
    assert!(manager.call_tool("ext_mock_echo", json!({ "text": "renamed" })).await.success);
    assert!(manager.get_all_stats().await.tools.contains_key("ext_mock_echo"));

    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_disconnects_everything() {
    let (manager, mock) = manager_with_mock(fast_options()).await;
    manager.start_heartbeat().await;

    manager.shutdown().await;
    manager.shutdown().await;

    assert_eq!(mock.deletes(), 1);
    let status = manager.get_status().await;
    assert_eq!(status.total_servers, 0);
    assert!(!status.heartbeat_running);

    let result = manager.call_tool("mcp_mock_echo", json!({})).await;
    assert_eq!(result.error, Some(ToolCallError::ShuttingDown));
    assert!(!manager.add_server(ServerConfig::http("late", mock.http_url())).await);
}

#[tokio::test]
async fn resources_are_routed_by_uri() {
    let (manager, _mock) = manager_with_mock(fast_options()).await;

    let resources = manager.all_resources().await;
    assert_eq!(resources.keys().collect::<Vec<_>>(), ["mock://logo", "mock://readme"]);
    assert_eq!(resources["mock://readme"].server, "mock");
    assert_eq!(resources["mock://readme"].resource.mime_type.as_deref(), Some("text/plain"));

    let readme = manager.read_resource("mock://readme", None).await;
    assert!(readme.success, "{:?}", readme.error);
    assert_eq!(readme.content.as_deref(), Some("hello from mock"));

    let logo = manager.read_resource("mock://logo", Some("mock")).await;
    assert_eq!(logo.content.as_deref(), Some("[base64]aGVsbG8="));

    let missing = manager.read_resource("mock://missing", None).await;
    assert!(matches!(missing.error, Some(ToolCallError::ResourceNotFound { .. })));
    let explicit = manager.read_resource("mock://missing", Some("mock")).await;
    assert!(matches!(explicit.error, Some(ToolCallError::Application { .. })));
    let unknown = manager.read_resource("mock://readme", Some("nobody")).await;
    assert!(matches!(unknown.error, Some(ToolCallError::ServerNotFound { .. })));

    let client = manager.server("mock").await.expect("registered");
    assert_eq!(client.state().await, ConnectionState::Connected, "remote errors are not transport failures");
    assert!(manager.fetch_resources("mock").await);
    assert!(!manager.fetch_resources("nobody").await);

    manager.shutdown().await;
}

#[tokio::test]
async fn prompts_are_routed_by_qualified_name() {
    let (manager, _mock) = manager_with_mock(fast_options()).await;

    let prompts = manager.all_prompts().await;
    assert_eq!(prompts.keys().collect::<Vec<_>>(), ["mcp_mock_greet"]);
    assert_eq!(prompts["mcp_mock_greet"].prompt.arguments[0].name, "who");

    let qualified = manager.get_prompt("mcp_mock_greet", json!({ "who": "Ada" }), None).await;
    assert!(qualified.success, "{:?}", qualified.error);
    assert_eq!(qualified.content.as_deref(), Some("[user]: Hello, Ada!"));

    let local = manager.get_prompt("greet", json!({ "who": "Bo" }), Some("mock")).await;
    assert_eq!(local.content.as_deref(), Some("[user]: Hello, Bo!"));
    let by_local_name = manager.get_prompt("greet", json!(null), None).await;
    assert!(by_local_name.success);

    let missing = manager.get_prompt("mcp_mock_farewell", json!({}), None).await;
    assert!(matches!(missing.error, Some(ToolCallError::PromptNotFound { .. })));
    assert!(manager.fetch_prompts("mock").await);

    manager
        .configure(ManagerOptions {
            tool_prefix: "ext".to_string(),
            ..fast_options()
        })
        .await;
    assert!(manager.all_prompts().await.contains_key("ext_mock_greet"));

    manager.shutdown().await;
}

#[tokio::test]
async fn servers_without_resources_or_prompts_are_not_asked() {
    let mock = MockServer::start().await;
    mock.hide_resources_and_prompts();
    let manager = ClientManager::new(fast_options());
    assert!(manager.add_server(ServerConfig::http("bare", mock.http_url())).await);

    assert!(manager.all_resources().await.is_empty());
    assert!(manager.all_prompts().await.is_empty());
    assert!(!manager.fetch_resources("bare").await);

    let client = manager.server("bare").await.expect("registered");
    assert!(!client.supports_prompts().await);
    let result = client.read_resource("mock://readme").await;
    assert!(matches!(result.error, Some(ToolCallError::Unsupported { feature: "resources", .. })));

    let routed = manager.read_resource("mock://readme", None).await;
    assert!(matches!(routed.error, Some(ToolCallError::ResourceNotFound { .. })));

    manager.shutdown().await;
}

#[tokio::test]
async fn circuit_breaker_can_be_reset() {
    let mut options = ManagerOptions {
        retry_attempts: 0,
        max_reconnect_attempts: 100,
        ..fast_options()
    };
    options.circuit_breaker.failure_threshold = 2;
    let (manager, mock) = manager_with_mock(options).await;
    mock.fail_next_calls(2);

    for _ in 0..2 {
        assert!(!manager.call_tool("mcp_mock_echo", json!({ "text": "x" })).await.success);
    }
    let rejected = manager.call_tool("mcp_mock_echo", json!({ "text": "x" })).await;
    assert!(rejected.circuit_broken);
    assert_eq!(mock.tool_calls(), 2);

    assert!(manager.reset_circuit_breaker("mock").await);
    assert!(!manager.reset_circuit_breaker("nobody").await);
    let client = manager.server("mock").await.expect("registered");
    assert_eq!(client.circuit_status().await.failure_count, 0);
    assert!(manager.call_tool("mcp_mock_echo", json!({ "text": "x" })).await.success);

    manager.shutdown().await;
}

#[tokio::test]
async fn routes_follow_connection_state_under_concurrent_activity() {
    let options = ManagerOptions {
        max_reconnect_attempts: 1,
        retry_attempts: 1,
        ..fast_options()
    };
    let (manager, mock) = manager_with_mock(options).await;
    let client = manager.server("mock").await.expect("registered");

    for round in 0..8 {
        mock.set_online(round % 3 != 1);
        tokio::join!(
            manager.heartbeat_tick(),
            manager.reconnect_server("mock"),
            manager.call_tool("mcp_mock_echo", json!({ "text": "x" })),
            manager.heartbeat_tick(),
        );

        let connected = client.is_connected().await;
        let routed = manager.tool_names().await;
        assert_eq!(!routed.is_empty(), connected, "round {round}: routes {routed:?}");
        assert_eq!(!manager.all_resources().await.is_empty(), connected, "round {round}");
        assert_eq!(manager.connected_servers().await.is_empty(), !connected, "round {round}");
    }

    manager.shutdown().await;
}

#[tokio::test]
async fn stalled_server_does_not_hold_up_a_healthy_one() {
    let options = ManagerOptions {
        call_timeout: Duration::from_secs(2),
        retry_attempts: 0,
        heartbeat_timeout: Duration::from_millis(300),
        ..fast_options()
    };
    let healthy = MockServer::start().await;
    let stalled = MockServer::start().await;
    let manager = ClientManager::new(options);
    assert!(manager.add_server(ServerConfig::http("healthy", healthy.http_url())).await);
    assert!(manager.add_server(ServerConfig::http("stalled", stalled.http_url())).await);
    stalled.set_stalled(true);

    let pending = tokio::spawn({
        let manager = manager.clone();
        async move { manager.call_tool("mcp_stalled_echo", json!({ "text": "lost" })).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let result = manager.call_tool("mcp_healthy_echo", json!({ "text": "fast" })).await;
    assert!(result.success, "{:?}", result.error);
    assert!(started.elapsed() < Duration::from_secs(1), "healthy call took {:?}", started.elapsed());

    let started = Instant::now();
    manager.heartbeat_tick().await;
    assert!(started.elapsed() < Duration::from_secs(1), "tick took {:?}", started.elapsed());
    assert!(manager.server("healthy").await.expect("registered").stats().await.last_heartbeat_time.is_some());
    assert_eq!(
        manager.server("stalled").await.expect("registered").state().await,
        ConnectionState::Failing
    );

    let lost = pending.await.expect("call task");
    assert!(matches!(
        lost.error,
        Some(ToolCallError::Transport(TransportError::Timeout { .. }))
    ));

    manager.shutdown().await;
}

#[tokio::test]
async fn heartbeat_reconnect_is_bounded_by_the_heartbeat_timeout() {
    let mock = MockServer::start().await;
    mock.set_stalled(true);
    let manager = ClientManager::new(ManagerOptions {
        connect_timeout: Some(Duration::from_millis(300)),
        retry_attempts: 0,
        ..fast_options()
    });
    assert!(manager.add_server(ServerConfig::http("stuck", mock.http_url())).await);
    let client = manager.server("stuck").await.expect("registered");
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    manager
        .configure(ManagerOptions {
            connect_timeout: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_millis(800),
            retry_attempts: 0,
            ..fast_options()
        })
        .await;

    let started = Instant::now();
    manager.heartbeat_tick().await;
    assert!(started.elapsed() < Duration::from_secs(3), "tick took {:?}", started.elapsed());
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    mock.set_stalled(false);
    manager.heartbeat_tick().await;
    assert_eq!(client.state().await, ConnectionState::Connected);
    assert_eq!(manager.tool_names().await.len(), 3);

    manager.shutdown().await;
}
