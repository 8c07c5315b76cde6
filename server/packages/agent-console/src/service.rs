use std::path::PathBuf;
use std::sync::Arc;

use agent_console_error::ConsoleError;
use agent_console_runner::{AgentBackend, AgentRequest, ImageSource, Prompt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::bootstrap::{NewChat, TempKeys};
use crate::channel::EventStream;
use crate::config::ServiceConfig;
use crate::driver::Driver;
use crate::log_monitor::{locate_log, watch_log};
use crate::permissions::{respond, PermissionPolicy, PermissionReply, RespondOutcome, SessionPermissionGate};
use crate::registry::{PendingInfo, SessionRegistry};
use crate::store::{ChatRecord, ChatStore};

/// Owns the in-process session state and everything it talks to.
///
/// Built once at startup and shared by the HTTP layer.
#[derive(Debug)]
pub struct SessionService {
    config: ServiceConfig,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn ChatStore>,
    backend: Arc<dyn AgentBackend>,
    temp_keys: TempKeys,
}

#[derive(Debug, Clone)]
pub struct StartChat {
    pub folder: String,
    pub message: String,
    pub images: Vec<ImageSource>,
    pub permissions: Option<PermissionPolicy>,
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SendMessage {
    pub message: String,
    pub images: Vec<ImageSource>,
    pub plugins: Option<Vec<String>>,
}

/// A freshly started run: the key it is registered under and a subscription
/// taken before the agent produced anything.
pub struct SessionStart {
    pub key: String,
    pub events: EventStream,
}

pub enum StreamSource {
    Live(EventStream),
    LogFile { path: PathBuf, events: EventStream },
}

impl StreamSource {
    pub fn into_events(self) -> EventStream {
        match self {
            Self::Live(events) | Self::LogFile { events, .. } => events,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingStatus {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingInfo>,
}

struct RunPlan {
    key: String,
    prompt: Prompt,
    cwd: PathBuf,
    resume: Option<String>,
    policy: PermissionPolicy,
    plugins: Vec<String>,
    new_chat: Option<NewChat>,
}

impl SessionService {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn ChatStore>,
        backend: Arc<dyn AgentBackend>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            store,
            backend,
            temp_keys: TempKeys::default(),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Starts a chat that has no durable id yet. The run is tracked under a
    /// temporary key until the agent reports its session id.
    pub async fn start_chat(&self, request: StartChat) -> Result<SessionStart, ConsoleError> {
        validate_prompt(&request.message, &request.images)?;
        let cwd = existing_folder(&request.folder).await?;
        let policy = request.permissions.unwrap_or_default();
        let key = self.temp_keys.next();
        let new_chat = NewChat {
            folder: request.folder,
            prompt: request.message.clone(),
            permissions: policy,
            plugins: request.plugins.clone(),
        };
        self.launch(RunPlan {
            key,
            prompt: Prompt::with_images(request.message, request.images),
            cwd,
            resume: None,
            policy,
            plugins: request.plugins,
            new_chat: Some(new_chat),
        })
        .await
    }

    /// Continues an existing chat, resuming its latest agent session.
    pub async fn send_message(
        &self,
        key: &str,
        request: SendMessage,
    ) -> Result<SessionStart, ConsoleError> {
        let record = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| ConsoleError::ChatNotFound {
                key: key.to_string(),
            })?;
        validate_prompt(&request.message, &request.images)?;
        let cwd = existing_folder(&record.folder).await?;
        self.launch(RunPlan {
            key: key.to_string(),
            prompt: Prompt::with_images(request.message, request.images),
            cwd,
            resume: record.session_id.clone(),
            policy: record.metadata.permissions,
            plugins: request.plugins.unwrap_or(record.metadata.plugins),
            new_chat: None,
        })
        .await
    }

    async fn launch(&self, plan: RunPlan) -> Result<SessionStart, ConsoleError> {
        // Subscribe before the driver starts so nothing is missed.
        let session = self.registry.register(&plan.key).await;
        let events = session.channel.subscribe();
        let (gate, prompts) = SessionPermissionGate::new(
            self.registry.clone(),
            self.store.clone(),
            session.instance,
            plan.policy,
        );
        let request = AgentRequest {
            prompt: plan.prompt,
            cwd: plan.cwd,
            resume: plan.resume.clone(),
            max_turns: self.config.max_turns,
            plugins: plan.plugins,
            permission_gate: Arc::new(gate),
            cancel: session.cancel.clone(),
        };
        let driver = Driver {
            registry: self.registry.clone(),
            store: self.store.clone(),
            backend: self.backend.clone(),
            session,
            key: plan.key.clone(),
            new_chat: plan.new_chat,
            known_session_id: plan.resume,
            prompts,
        };
        tracing::info!(session_key = %plan.key, backend = self.backend.name(), "starting agent run");
        tokio::spawn(driver.run(request));
        Ok(SessionStart {
            key: plan.key,
            events,
        })
    }

    /// Attaches to a running session, or falls back to tailing the CLI log.
    pub async fn reconnect(&self, key: &str) -> Result<StreamSource, ConsoleError> {
        if let Some(session) = self.registry.lookup(key).await {
            return Ok(StreamSource::Live(session.channel.subscribe()));
        }
        let record = self.store.get(key).await.unwrap_or_else(|err| {
            tracing::debug!(session_key = %key, error = %err, "no readable record for stream");
            None
        });
        let Some(path) = locate_log(&self.config.projects_dir, key, record.as_ref()).await else {
            return Err(ConsoleError::SessionNotFound {
                key: key.to_string(),
            });
        };
        tracing::info!(session_key = %key, path = %path.display(), "streaming from cli session log");
        let watch = watch_log(path.clone(), self.config.log_monitor.clone());
        Ok(StreamSource::LogFile {
            path,
            events: watch.events,
        })
    }

    pub async fn pending(&self, key: &str) -> PendingStatus {
        PendingStatus {
            active: self.registry.is_active(key).await,
            pending: self.registry.pending_info(key).await,
        }
    }

    pub async fn respond(&self, key: &str, reply: PermissionReply) -> RespondOutcome {
        respond(&self.registry, key, reply).await
    }

    pub async fn stop(&self, key: &str) -> bool {
        self.registry.cancel_and_remove(key).await
    }

    pub async fn get_chat(&self, key: &str) -> Result<(ChatRecord, bool), ConsoleError> {
        let record = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| ConsoleError::ChatNotFound {
                key: key.to_string(),
            })?;
        let active = self.registry.is_active(key).await;
        Ok((record, active))
    }

    pub async fn list_chats(&self) -> Result<Vec<ChatRecord>, ConsoleError> {
        self.store.list().await
    }

    pub async fn set_permissions(
        &self,
        key: &str,
        permissions: PermissionPolicy,
    ) -> Result<ChatRecord, ConsoleError> {
        self.store.set_permissions(key, permissions).await
    }

    pub async fn shutdown(&self) {
        self.registry.cancel_all().await;
    }
}

fn validate_prompt(message: &str, images: &[ImageSource]) -> Result<(), ConsoleError> {
    if message.trim().is_empty() && images.is_empty() {
        return Err(ConsoleError::EmptyPrompt);
    }
    Ok(())
}

async fn existing_folder(folder: &str) -> Result<PathBuf, ConsoleError> {
    let path = PathBuf::from(folder);
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => Ok(path),
        _ => Err(ConsoleError::FolderMissing {
            folder: folder.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NormalizedEvent;
    use crate::store::FileChatStore;
    use agent_console_runner::mock::{MockAgent, MockStep};
    use futures::StreamExt;

    fn service(dir: &std::path::Path, agent: MockAgent) -> SessionService {
        let config = ServiceConfig::new(dir.join("data"), dir.join("projects"));
        let store = Arc::new(FileChatStore::new(&config.data_dir));
        SessionService::new(config, store, Arc::new(agent))
    }

    fn start(folder: &std::path::Path, message: &str) -> StartChat {
        StartChat {
            folder: folder.display().to_string(),
            message: message.to_string(),
            images: Vec::new(),
            permissions: None,
            plugins: Vec::new(),
        }
    }

    #[tokio::test]
    async fn rejects_empty_prompt_and_missing_folder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = service(dir.path(), MockAgent::new());
        let err = service.start_chat(start(dir.path(), "  ")).await.err().expect("empty");
        assert!(matches!(err, ConsoleError::EmptyPrompt));
        let err = service
            .start_chat(start(&dir.path().join("nope"), "hi"))
            .await
            .err()
            .expect("missing");
        assert!(matches!(err, ConsoleError::FolderMissing { .. }));
        let err = service
            .send_message(
                "unknown",
                SendMessage {
                    message: "hi".to_string(),
                    images: Vec::new(),
                    plugins: None,
                },
            )
            .await
            .err()
            .expect("not found");
        assert!(matches!(err, ConsoleError::ChatNotFound { .. }));
        assert!(service.registry().active_keys().await.is_empty());
    }

    #[tokio::test]
    async fn new_chat_bootstraps_then_resumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = MockAgent::new().with_session_id("sess-a");
        let service = service(dir.path(), agent.clone());

        let started = service.start_chat(start(dir.path(), "hello")).await.expect("start");
        assert!(started.key.starts_with("pending-"));
        let events = started.events.collect::<Vec<_>>().await;
        assert!(matches!(&events[0], NormalizedEvent::ChatCreated { session_key, .. } if session_key == "sess-a"));
        assert_eq!(events[1], NormalizedEvent::text("echo: hello"));
        assert_eq!(events.last(), Some(&NormalizedEvent::Done));

        let resumed = service
            .send_message(
                "sess-a",
                SendMessage {
                    message: "again".to_string(),
                    images: Vec::new(),
                    plugins: None,
                },
            )
            .await
            .expect("send");
        let events = resumed.events.collect::<Vec<_>>().await;
        assert_eq!(events, vec![NormalizedEvent::text("echo: again"), NormalizedEvent::Done]);
        assert_eq!(agent.invocations()[1].resume.as_deref(), Some("sess-a"));
    }

    #[tokio::test]
    async fn second_send_supersedes_the_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = MockAgent::new()
            .with_session_id("sess-b")
            .on_prompt("wait", vec![MockStep::WaitForCancel]);
        let service = service(dir.path(), agent);
        let first = service.start_chat(start(dir.path(), "hello")).await.expect("start");
        first.events.collect::<Vec<_>>().await;

        let waiting = service
            .send_message(
                "sess-b",
                SendMessage {
                    message: "wait here".to_string(),
                    images: Vec::new(),
                    plugins: None,
                },
            )
            .await
            .expect("send");
        let replacing = service
            .send_message(
                "sess-b",
                SendMessage {
                    message: "replace".to_string(),
                    images: Vec::new(),
                    plugins: None,
                },
            )
            .await
            .expect("send");

        // The superseded run ends without a terminal event of its own.
        let superseded = waiting.events.collect::<Vec<_>>().await;
        assert!(!superseded.iter().any(NormalizedEvent::is_terminal));
        let events = replacing.events.collect::<Vec<_>>().await;
        assert_eq!(events.last(), Some(&NormalizedEvent::Done));
        assert_eq!(service.registry().active_keys().await, Vec::<String>::new());
    }

    #[tokio::test]
    async fn stream_error_ends_with_single_error_event() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = MockAgent::new()
            .with_session_id("sess-c")
            .with_script(vec![MockStep::text("partial"), MockStep::Fail("agent crashed".to_string())]);
        let service = service(dir.path(), agent);
        let started = service.start_chat(start(dir.path(), "go")).await.expect("start");
        let events = started.events.collect::<Vec<_>>().await;
        let terminal = events.iter().filter(|event| event.is_terminal()).count();
        assert_eq!(terminal, 1);
        assert!(matches!(events.last(), Some(NormalizedEvent::Error { message }) if message.contains("agent crashed")));
        let record = service.store().get("sess-c").await.expect("get");
        assert!(record.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn chat_created_precedes_an_immediate_prompt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = MockAgent::new().with_script(vec![MockStep::tool(
            "Write",
            serde_json::json!({"file_path": "early.txt"}),
            serde_json::json!("written"),
        )]);
        let service = service(dir.path(), agent);

        for _ in 0..20 {
            let mut started = service.start_chat(start(dir.path(), "write early")).await.expect("start");
            let mut kinds = Vec::new();
            let mut durable_key = None;
            for _ in 0..3 {
                let event = started.events.next().await.expect("event");
                if let NormalizedEvent::ChatCreated { session_key, .. } = &event {
                    durable_key = Some(session_key.clone());
                }
                kinds.push(event.kind());
            }
            assert_eq!(kinds, vec!["chat_created", "tool_use", "permission_request"]);
            let durable_key = durable_key.expect("durable key");
            assert!(service.pending(&durable_key).await.pending.is_some());
            assert!(service.stop(&durable_key).await);
        }
    }
}
