#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_console::config::{LogMonitorConfig, ServiceConfig};
use agent_console::router::{build_router_with_state, AppState};
use agent_console::service::SessionService;
use agent_console::store::FileChatStore;
use agent_console_runner::mock::MockAgent;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    pub agent: MockAgent,
    pub projects_dir: PathBuf,
    workspace: PathBuf,
    _dir: TempDir,
}

impl TestApp {
    pub fn new(agent: MockAgent) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).expect("create workspace");
        let projects_dir = dir.path().join("projects");
        std::fs::create_dir_all(&projects_dir).expect("create projects dir");

        let mut config = ServiceConfig::new(dir.path().join("data"), projects_dir.clone());
        config.log_monitor = LogMonitorConfig {
            poll_interval: Duration::from_millis(20),
            subagent_scan_interval: Duration::from_millis(50),
            inactivity_timeout: Duration::from_millis(500),
            ..LogMonitorConfig::default()
        };
        let store = Arc::new(FileChatStore::new(&config.data_dir));
        let service = SessionService::new(config, store, Arc::new(agent.clone()));
        let (app, state) = build_router_with_state(Arc::new(AppState::new(service)));
        Self {
            app,
            state,
            agent,
            projects_dir,
            workspace,
            _dir: dir,
        }
    }

    pub fn folder(&self) -> String {
        self.workspace.to_string_lossy().into_owned()
    }

    pub async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let request = builder.body(body).expect("request");
        self.app.clone().oneshot(request).await.expect("response")
    }

    pub async fn json(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let response = self.send(method, uri, body).await;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("read body")
            .to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    pub async fn stream(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, HeaderMap, SseReader) {
        let response = self.send(method, uri, body).await;
        let status = response.status();
        let headers = response.headers().clone();
        (status, headers, SseReader::new(response.into_body()))
    }
}

/// Incremental reader for an SSE response body.
pub struct SseReader {
    body: Body,
    buffer: String,
}

impl SseReader {
    fn new(body: Body) -> Self {
        Self {
            body,
            buffer: String::new(),
        }
    }

    /// Next `data:` payload, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<Value> {
        loop {
            if let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                let data = block
                    .lines()
                    .filter_map(|line| line.strip_prefix("data:"))
                    .map(str::trim_start)
                    .collect::<Vec<_>>();
                if data.is_empty() {
                    continue;
                }
                return Some(serde_json::from_str(&data.join("\n")).expect("event json"));
            }
            let frame = tokio::time::timeout(FRAME_TIMEOUT, self.body.frame())
                .await
                .expect("sse frame within timeout");
            match frame {
                None => return None,
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buffer.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Some(Err(err)) => panic!("sse body error: {err}"),
            }
        }
    }

    /// Reads until an event of `kind` arrives and returns it.
    pub async fn next_of(&mut self, kind: &str) -> Value {
        loop {
            let event = self
                .next_event()
                .await
                .unwrap_or_else(|| panic!("stream ended before {kind}"));
            if event["type"] == kind {
                return event;
            }
        }
    }

    pub async fn collect(mut self) -> Vec<Value> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }
}

pub fn kinds(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap_or_default().to_string())
        .collect()
}
