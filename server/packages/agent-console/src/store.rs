use std::path::{Path, PathBuf};

use agent_console_error::ConsoleError;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::permissions::PermissionPolicy;

/// Durable chat metadata. Outlives the process; the in-memory registry only
/// tracks what is running right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub key: String,
    pub folder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub metadata: ChatMetadata,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub session_ids: Vec<String>,
    #[serde(default)]
    pub permissions: PermissionPolicy,
    #[serde(default)]
    pub plugins: Vec<String>,
}

/// Fields to overwrite on upsert; `None` keeps what is stored.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub title: Option<String>,
    pub permissions: Option<PermissionPolicy>,
    pub plugins: Option<Vec<String>>,
}

#[async_trait]
pub trait ChatStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<ChatRecord>, ConsoleError>;

    async fn list(&self) -> Result<Vec<ChatRecord>, ConsoleError>;

    /// Creates or updates the record stored under `key`, recording
    /// `session_id` as its latest agent session.
    async fn upsert(
        &self,
        key: &str,
        folder: &str,
        session_id: &str,
        patch: MetadataPatch,
    ) -> Result<ChatRecord, ConsoleError>;

    async fn touch(&self, key: &str) -> Result<(), ConsoleError>;

    async fn append_session_id(&self, key: &str, session_id: &str) -> Result<(), ConsoleError>;

    async fn set_permissions(
        &self,
        key: &str,
        permissions: PermissionPolicy,
    ) -> Result<ChatRecord, ConsoleError>;
}

/// One JSON file per chat under `<data_dir>/chats`.
///
/// Writes are serialized through a store-wide lock and always re-read the file
/// first, so concurrent updates to one record merge instead of clobbering.
#[derive(Debug)]
pub struct FileChatStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileChatStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join("chats"),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ConsoleError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ConsoleError::InvalidRequest {
                message: format!("invalid chat key: {key}"),
            });
        }
        Ok(self.root.join(format!("{key}.json")))
    }

    async fn read(&self, path: &Path) -> Result<Option<ChatRecord>, ConsoleError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| ConsoleError::store(format!("corrupt record {}: {err}", path.display()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, path: &Path, record: &ChatRecord) -> Result<(), ConsoleError> {
        tokio::fs::create_dir_all(&self.root).await?;
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|err| ConsoleError::store(err.to_string()))?;
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, bytes).await?;
        tokio::fs::rename(&staging, path).await?;
        Ok(())
    }

    /// Read-modify-write of an existing record under the write lock.
    async fn update<F>(&self, key: &str, apply: F) -> Result<ChatRecord, ConsoleError>
    where
        F: FnOnce(&mut ChatRecord) + Send,
    {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read(&path)
            .await?
            .ok_or_else(|| ConsoleError::ChatNotFound {
                key: key.to_string(),
            })?;
        apply(&mut record);
        record.updated_at = now_ms();
        self.write(&path, &record).await?;
        Ok(record)
    }
}

#[async_trait]
impl ChatStore for FileChatStore {
    async fn get(&self, key: &str) -> Result<Option<ChatRecord>, ConsoleError> {
        let path = self.path_for(key)?;
        self.read(&path).await
    }

    async fn list(&self) -> Result<Vec<ChatRecord>, ConsoleError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping unreadable chat record"),
            }
        }
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }

    async fn upsert(
        &self,
        key: &str,
        folder: &str,
        session_id: &str,
        patch: MetadataPatch,
    ) -> Result<ChatRecord, ConsoleError> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock.lock().await;
        let now = now_ms();
        let mut record = self.read(&path).await?.unwrap_or_else(|| ChatRecord {
            key: key.to_string(),
            folder: folder.to_string(),
            session_id: None,
            metadata: ChatMetadata::default(),
            created_at: now,
            updated_at: now,
        });
        record.folder = folder.to_string();
        record.session_id = Some(session_id.to_string());
        push_unique(&mut record.metadata.session_ids, session_id);
        if let Some(title) = patch.title {
            // Never overwrite a title a concurrent writer already set.
            record.metadata.title.get_or_insert(title);
        }
        if let Some(permissions) = patch.permissions {
            record.metadata.permissions = permissions;
        }
        if let Some(plugins) = patch.plugins {
            record.metadata.plugins = plugins;
        }
        record.updated_at = now;
        self.write(&path, &record).await?;
        Ok(record)
    }

    async fn touch(&self, key: &str) -> Result<(), ConsoleError> {
        self.update(key, |_| {}).await.map(|_| ())
    }

    async fn append_session_id(&self, key: &str, session_id: &str) -> Result<(), ConsoleError> {
        let session_id = session_id.to_string();
        self.update(key, move |record| {
            push_unique(&mut record.metadata.session_ids, &session_id);
            record.session_id = Some(session_id);
        })
        .await
        .map(|_| ())
    }

    async fn set_permissions(
        &self,
        key: &str,
        permissions: PermissionPolicy,
    ) -> Result<ChatRecord, ConsoleError> {
        self.update(key, move |record| record.metadata.permissions = permissions)
            .await
    }
}

fn push_unique(ids: &mut Vec<String>, id: &str) {
    if !ids.iter().any(|existing| existing == id) {
        ids.push(id.to_string());
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PolicyMode;

    #[tokio::test]
    async fn upsert_then_append_keeps_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileChatStore::new(dir.path());
        let created = store
            .upsert(
                "s1",
                "/work",
                "s1",
                MetadataPatch {
                    title: Some("list files".to_string()),
                    ..MetadataPatch::default()
                },
            )
            .await
            .expect("upsert");
        assert_eq!(created.metadata.session_ids, vec!["s1".to_string()]);

        store.append_session_id("s1", "s2").await.expect("append");
        store.append_session_id("s1", "s2").await.expect("append twice");
        let record = store.get("s1").await.expect("get").expect("exists");
        assert_eq!(record.session_id.as_deref(), Some("s2"));
        assert_eq!(record.metadata.session_ids, vec!["s1".to_string(), "s2".to_string()]);
        assert_eq!(record.metadata.title.as_deref(), Some("list files"));
        assert_eq!(record.created_at, created.created_at);
    }

    #[tokio::test]
    async fn touch_missing_record_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileChatStore::new(dir.path());
        let err = store.touch("nope").await.expect_err("missing");
        assert!(matches!(err, ConsoleError::ChatNotFound { .. }));
        assert!(store.get("nope").await.expect("get").is_none());
        assert!(store.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn set_permissions_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileChatStore::new(dir.path());
        store
            .upsert("s1", "/work", "s1", MetadataPatch::default())
            .await
            .expect("upsert");
        let policy = PermissionPolicy {
            web_access: PolicyMode::Deny,
            ..PermissionPolicy::default()
        };
        store.set_permissions("s1", policy).await.expect("set");
        let reopened = FileChatStore::new(dir.path());
        let record = reopened.get("s1").await.expect("get").expect("exists");
        assert_eq!(record.metadata.permissions, policy);
    }

    #[tokio::test]
    async fn rejects_path_like_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileChatStore::new(dir.path());
        let err = store.get("../etc/passwd").await.expect_err("invalid");
        assert!(matches!(err, ConsoleError::InvalidRequest { .. }));
    }
}
