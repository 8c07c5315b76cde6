mod common;

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use agent_console::log_monitor::project_dir_name;
use agent_console_runner::mock::{MockAgent, MockStep};
use axum::http::{Method, StatusCode};
use serde_json::{json, Value};

use common::{kinds, TestApp};

fn append(path: &Path, record: Value) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create log dir");
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .expect("open log");
    writeln!(file, "{record}").expect("write log");
}

fn assistant(stop_reason: &str) -> Value {
    json!({
        "type": "assistant",
        "message": {
            "role": "assistant",
            "content": [{ "type": "text", "text": "working" }],
            "stop_reason": stop_reason
        }
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn completed_cli_session_reports_done_immediately() {
    let app = TestApp::new(MockAgent::new());
    let log = app
        .projects_dir
        .join(project_dir_name("/home/dev/project"))
        .join("cli-session-1.jsonl");
    append(&log, json!({ "type": "user", "message": { "role": "user", "content": "hi" } }));
    append(&log, assistant("end_turn"));

    let (status, _, sse) = app
        .stream(Method::GET, "/v1/chats/cli-session-1/stream", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(kinds(&sse.collect().await), vec!["done"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn running_cli_session_streams_updates() {
    let app = TestApp::new(MockAgent::new());
    let log = app
        .projects_dir
        .join(project_dir_name("/home/dev/project"))
        .join("cli-session-2.jsonl");
    append(&log, assistant("tool_use"));

    let (_, _, sse) = app
        .stream(Method::GET, "/v1/chats/cli-session-2/stream", None)
        .await;
    let reader = tokio::spawn(sse.collect());

    tokio::time::sleep(Duration::from_millis(100)).await;
    append(&log, json!({ "type": "user", "message": { "role": "user", "content": [] } }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    append(&log, assistant("end_turn"));

    let events = reader.await.expect("reader task");
    assert_eq!(kinds(&events), vec!["update", "update", "done"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn live_session_wins_over_log_file() {
    let agent = MockAgent::new()
        .with_session_id("sess-live")
        .with_script(vec![MockStep::text("still going"), MockStep::WaitForCancel]);
    let app = TestApp::new(agent);
    let (_, _, mut sse) = app
        .stream(
            Method::POST,
            "/v1/chats",
            Some(json!({ "folder": app.folder(), "message": "go" })),
        )
        .await;
    sse.next_of("text").await;

    let log = app
        .projects_dir
        .join(project_dir_name(&app.folder()))
        .join("sess-live.jsonl");
    append(&log, assistant("end_turn"));

    let (_, chat) = app.json(Method::GET, "/v1/chats/sess-live", None).await;
    assert_eq!(chat["active"], true);

    let (_, _, live) = app.stream(Method::GET, "/v1/chats/sess-live/stream", None).await;
    app.json(Method::POST, "/v1/chats/sess-live/stop", None).await;
    assert!(live.collect().await.is_empty());

    // Once the run is gone the same key falls back to the log file.
    let (_, _, from_log) = app.stream(Method::GET, "/v1/chats/sess-live/stream", None).await;
    assert_eq!(kinds(&from_log.collect().await), vec!["done"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_session_is_not_found() {
    let app = TestApp::new(MockAgent::new());
    let (status, body) = app.json(Method::GET, "/v1/chats/missing/stream", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:agent-console:error:session_not_found");
    assert_eq!(body["sessionKey"], "missing");
}
