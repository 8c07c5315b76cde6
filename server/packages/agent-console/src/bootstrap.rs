use std::sync::atomic::{AtomicU64, Ordering};

use agent_console_error::ConsoleError;

use crate::channel::EventChannel;
use crate::events::NormalizedEvent;
use crate::permissions::PermissionPolicy;
use crate::registry::SessionRegistry;
use crate::store::{now_ms, ChatRecord, ChatStore, MetadataPatch};

const TEMP_KEY_PREFIX: &str = "pending-";
const TITLE_MAX_CHARS: usize = 60;

/// Hands out process-unique placeholder keys for chats that have no agent
/// session id yet.
#[derive(Debug, Default)]
pub struct TempKeys {
    counter: AtomicU64,
}

impl TempKeys {
    pub fn next(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{TEMP_KEY_PREFIX}{}-{n}", now_ms())
    }
}

pub fn is_temp_key(key: &str) -> bool {
    key.starts_with(TEMP_KEY_PREFIX)
}

/// What a new chat needs persisted once the agent names its session.
#[derive(Debug, Clone)]
pub struct NewChat {
    pub folder: String,
    pub prompt: String,
    pub permissions: PermissionPolicy,
    pub plugins: Vec<String>,
}

pub fn title_from_prompt(prompt: &str) -> Option<String> {
    let line = prompt.lines().map(str::trim).find(|line| !line.is_empty())?;
    let mut title = line.chars().take(TITLE_MAX_CHARS).collect::<String>();
    if line.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    Some(title)
}

/// Creates the durable record, moves the session from `temp_key` to
/// `session_id` and announces the new key on the channel.
///
/// Must run before any content event of the message that carried the id.
pub async fn complete_bootstrap(
    store: &dyn ChatStore,
    registry: &SessionRegistry,
    channel: &EventChannel,
    temp_key: &str,
    session_id: &str,
    chat: &NewChat,
) -> Result<ChatRecord, ConsoleError> {
    let record = store
        .upsert(
            session_id,
            &chat.folder,
            session_id,
            MetadataPatch {
                title: title_from_prompt(&chat.prompt),
                permissions: Some(chat.permissions),
                plugins: Some(chat.plugins.clone()),
            },
        )
        .await?;
    if !registry.migrate(temp_key, session_id).await {
        tracing::warn!(temp_key = %temp_key, session_key = %session_id, "no session to migrate");
    }
    tracing::info!(temp_key = %temp_key, session_key = %session_id, "chat created");
    channel.send(NormalizedEvent::ChatCreated {
        session_key: session_id.to_string(),
        record: record.clone(),
    });
    Ok(record)
}
