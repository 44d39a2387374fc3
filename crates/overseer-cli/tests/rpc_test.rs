//! JSON-RPC dispatch tests against a live daemon with a shell agent.

use std::time::Duration;

use overseer_engine::Daemon;
use overseer_kernel::Config;
use serde_json::{json, Value};

// The binary's rpc module is not a library; drive the protocol through
// a daemon + server pair assembled the same way `overseer serve` does.
#[path = "../src/rpc.rs"]
mod rpc;
#[path = "../src/tools.rs"]
mod tools;

use rpc::RpcServer;

async fn test_server() -> (Daemon, RpcServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        max_workers: 2,
        cpu_threshold: 1_000.0,
        memory_reserve: 0,
        data_dir: dir.path().to_path_buf(),
        agent_command: vec!["sh".into(), "-c".into()],
        kill_grace: Duration::from_millis(500),
        ..Config::from_env()
    };
    let daemon = Daemon::start(config).await.unwrap();
    let server = RpcServer::new(daemon.manager());
    (daemon, server, dir)
}

fn frame(id: u64, method: &str, params: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params }).to_string()
}

#[tokio::test]
async fn initialize_reports_server_info_and_tools() {
    let (daemon, server, _dir) = test_server().await;

    let response = server
        .handle_line(&frame(1, "initialize", json!({})))
        .await
        .unwrap();
    let result = response.result.unwrap();
    assert_eq!(result["serverInfo"]["name"], "overseer");
    assert!(result["capabilities"]["tools"].is_object());

    let response = server
        .handle_line(&frame(2, "tools/list", json!({})))
        .await
        .unwrap();
    let tools = response.result.unwrap()["tools"].as_array().unwrap().clone();
    let names: Vec<&str> = tools
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["DelegateTask", "TaskStatus", "TaskLogs", "CancelTask"]);

    daemon.shutdown().await;
}

#[tokio::test]
async fn delegate_status_logs_round_trip() {
    let (daemon, server, _dir) = test_server().await;

    let response = server
        .handle_line(&frame(
            1,
            "tools/call",
            json!({ "name": "DelegateTask", "arguments": { "prompt": "echo rpc-hello" } }),
        ))
        .await
        .unwrap();
    let result = response.result.unwrap();
    let task_id = result["taskId"].as_str().unwrap().to_string();
    assert_eq!(result["status"], "QUEUED");

    // Poll status over the same surface until terminal.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let response = server
            .handle_line(&frame(
                2,
                "tools/call",
                json!({ "name": "TaskStatus", "arguments": { "taskId": task_id } }),
            ))
            .await
            .unwrap();
        let status = response.result.unwrap();
        if status["status"] == "COMPLETED" {
            assert_eq!(status["exitCode"], 0);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never completed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let response = server
        .handle_line(&frame(
            3,
            "tools/call",
            json!({ "name": "TaskLogs", "arguments": { "taskId": task_id } }),
        ))
        .await
        .unwrap();
    let logs = response.result.unwrap();
    assert_eq!(logs["stdout"], json!(["rpc-hello"]));

    daemon.shutdown().await;
}

#[tokio::test]
async fn errors_carry_the_kind_in_data() {
    let (daemon, server, _dir) = test_server().await;

    // Unknown task id.
    let response = server
        .handle_line(&frame(
            1,
            "tools/call",
            json!({ "name": "TaskStatus", "arguments": { "taskId": "ghost" } }),
        ))
        .await
        .unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.data.unwrap()["kind"], "NOT_FOUND");

    // Missing required argument.
    let response = server
        .handle_line(&frame(
            2,
            "tools/call",
            json!({ "name": "DelegateTask", "arguments": {} }),
        ))
        .await
        .unwrap();
    let error = response.error.unwrap();
    assert_eq!(error.code, rpc::INVALID_PARAMS);

    daemon.shutdown().await;
}

#[tokio::test]
async fn protocol_errors_use_standard_codes() {
    let (daemon, server, _dir) = test_server().await;

    // Parse error.
    let response = server.handle_line("this is not json").await.unwrap();
    assert_eq!(response.error.unwrap().code, rpc::PARSE_ERROR);

    // Unknown method.
    let response = server
        .handle_line(&frame(1, "tasks/teleport", json!({})))
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, rpc::METHOD_NOT_FOUND);

    // Wrong jsonrpc version.
    let response = server
        .handle_line(&json!({ "jsonrpc": "1.0", "id": 2, "method": "ping" }).to_string())
        .await
        .unwrap();
    assert_eq!(response.error.unwrap().code, rpc::INVALID_REQUEST);

    // Notifications get no response.
    let response = server
        .handle_line(&json!({ "jsonrpc": "2.0", "method": "ping" }).to_string())
        .await;
    assert!(response.is_none());

    daemon.shutdown().await;
}
