use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use agent_console_runner::PermissionDecision;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::channel::EventChannel;

pub const SESSION_ABORTED: &str = "Session was cancelled";

/// A running agent execution, as seen by everything outside its driver.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Distinguishes this run from earlier or later runs under the same key.
    pub instance: u64,
    pub cancel: CancellationToken,
    pub channel: EventChannel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PendingInfo {
    pub tool_name: String,
    pub input: Value,
    pub suggestions: Value,
}

/// An outstanding tool approval. The parked gate holds the receiving half.
#[derive(Debug)]
pub struct PendingPermission {
    pub info: PendingInfo,
    resolver: oneshot::Sender<PermissionDecision>,
}

impl PendingPermission {
    pub fn new(info: PendingInfo) -> (Self, oneshot::Receiver<PermissionDecision>) {
        let (resolver, receiver) = oneshot::channel();
        (Self { info, resolver }, receiver)
    }

    /// Returns false if the waiting side already went away.
    pub fn resolve(self, decision: PermissionDecision) -> bool {
        self.resolver.send(decision).is_ok()
    }

    fn abort(self) {
        let _ = self.resolve(PermissionDecision::deny(SESSION_ABORTED, true));
    }
}

#[derive(Debug, Default)]
struct Tables {
    sessions: HashMap<String, ActiveSession>,
    pending: HashMap<String, PendingPermission>,
}

impl Tables {
    fn key_for_instance(&self, instance: u64) -> Option<String> {
        self.sessions
            .iter()
            .find(|(_, session)| session.instance == instance)
            .map(|(key, _)| key.clone())
    }
}

/// Active sessions and their pending permissions.
///
/// Both tables live behind one lock so a key migration can never be observed
/// half-done.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    tables: Mutex<Tables>,
    next_instance: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh session under `key`, cancelling whatever ran there.
    pub async fn register(&self, key: &str) -> ActiveSession {
        let session = ActiveSession {
            instance: self.next_instance.fetch_add(1, Ordering::SeqCst) + 1,
            cancel: CancellationToken::new(),
            channel: EventChannel::new(),
        };
        let mut tables = self.tables.lock().await;
        if let Some(prior) = tables.sessions.insert(key.to_string(), session.clone()) {
            tracing::info!(session_key = %key, instance = prior.instance, "superseding active session");
            prior.cancel.cancel();
        }
        if let Some(pending) = tables.pending.remove(key) {
            pending.abort();
        }
        tracing::info!(session_key = %key, instance = session.instance, "session registered");
        session
    }

    pub async fn lookup(&self, key: &str) -> Option<ActiveSession> {
        self.tables.lock().await.sessions.get(key).cloned()
    }

    pub async fn is_active(&self, key: &str) -> bool {
        self.tables.lock().await.sessions.contains_key(key)
    }

    pub async fn key_for_instance(&self, instance: u64) -> Option<String> {
        self.tables.lock().await.key_for_instance(instance)
    }

    /// Signals cancellation, removes the entry and denies any pending
    /// permission. Returns whether a session was running.
    pub async fn cancel_and_remove(&self, key: &str) -> bool {
        let mut tables = self.tables.lock().await;
        let pending = tables.pending.remove(key);
        let Some(session) = tables.sessions.remove(key) else {
            debug_assert!(pending.is_none(), "pending permission without session");
            return false;
        };
        session.cancel.cancel();
        if let Some(pending) = pending {
            tracing::info!(session_key = %key, tool = %pending.info.tool_name, "denying pending permission on cancel");
            pending.abort();
        }
        tracing::info!(session_key = %key, instance = session.instance, "session cancelled");
        true
    }

    /// Removes the entry owned by `instance`, wherever it currently lives.
    /// A newer session registered under the same key is left alone.
    pub async fn remove_instance(&self, instance: u64) {
        let mut tables = self.tables.lock().await;
        let Some(key) = tables.key_for_instance(instance) else {
            return;
        };
        tables.sessions.remove(&key);
        if let Some(pending) = tables.pending.remove(&key) {
            pending.abort();
        }
        tracing::debug!(session_key = %key, instance, "session removed");
    }

    /// Parks a permission under the key `instance` currently runs as and
    /// returns that key with the session's channel. Hands the permission back
    /// if the session is gone.
    pub async fn park(
        &self,
        instance: u64,
        pending: PendingPermission,
    ) -> Result<(String, EventChannel), PendingPermission> {
        let mut tables = self.tables.lock().await;
        let Some(key) = tables.key_for_instance(instance) else {
            return Err(pending);
        };
        assert!(
            !tables.pending.contains_key(&key),
            "second pending permission for session {key}"
        );
        let channel = tables.sessions[&key].channel.clone();
        tracing::info!(session_key = %key, tool = %pending.info.tool_name, "permission parked");
        tables.pending.insert(key.clone(), pending);
        Ok((key, channel))
    }

    pub async fn take_pending(&self, key: &str) -> Option<PendingPermission> {
        self.tables.lock().await.pending.remove(key)
    }

    pub async fn pending_info(&self, key: &str) -> Option<PendingInfo> {
        self.tables
            .lock()
            .await
            .pending
            .get(key)
            .map(|pending| pending.info.clone())
    }

    /// Moves the session and its pending permission from `from` to `to` in
    /// one step. Returns false if nothing was registered under `from`.
    pub async fn migrate(&self, from: &str, to: &str) -> bool {
        let mut tables = self.tables.lock().await;
        let Some(session) = tables.sessions.remove(from) else {
            return false;
        };
        let pending = tables.pending.remove(from);
        if let Some(displaced) = tables.sessions.insert(to.to_string(), session) {
            tracing::warn!(session_key = %to, instance = displaced.instance, "migration displaced an active session");
            displaced.cancel.cancel();
            if let Some(stale) = tables.pending.remove(to) {
                stale.abort();
            }
        }
        if let Some(pending) = pending {
            tables.pending.insert(to.to_string(), pending);
        }
        tracing::info!(from = %from, to = %to, "session key migrated");
        true
    }

    pub async fn active_keys(&self) -> Vec<String> {
        self.tables.lock().await.sessions.keys().cloned().collect()
    }

    pub async fn cancel_all(&self) {
        let mut tables = self.tables.lock().await;
        for (_, pending) in tables.pending.drain() {
            pending.abort();
        }
        for (key, session) in tables.sessions.drain() {
            tracing::info!(session_key = %key, "cancelling session for shutdown");
            session.cancel.cancel();
        }
    }
}
