//! Event stream for sessions driven by an external `claude` CLI process.
//!
//! The CLI appends newline-delimited JSON records to a session log. The
//! monitor first probes the tail of that log for a completion marker; if none
//! is found it polls for growth, turning appended records into `update`,
//! `compacting` and `done` events. Sub-agent logs are scanned separately and
//! count as activity. All polling lives inside the returned stream, so
//! dropping the stream stops the watch.

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::channel::EventStream;
use crate::config::LogMonitorConfig;
use crate::events::NormalizedEvent;
use crate::store::ChatRecord;

const SUBAGENT_DIR: &str = "subagents";
const SUBAGENT_PREFIX: &str = "agent-";
const LOG_EXTENSION: &str = "jsonl";

/// A running watch plus a counter of main-log poll ticks.
pub struct LogWatch {
    pub events: EventStream,
    pub poll_ticks: Arc<AtomicU64>,
}

pub fn watch_log(path: PathBuf, config: LogMonitorConfig) -> LogWatch {
    let poll_ticks = Arc::new(AtomicU64::new(0));
    let monitor = Monitor {
        subagent_dir: subagent_dir(&path),
        path,
        config,
        phase: Phase::ProbingTail,
        queue: VecDeque::new(),
        offset: 0,
        carry: Vec::new(),
        subagents: HashMap::new(),
        last_activity: Instant::now(),
        timers: None,
        poll_ticks: poll_ticks.clone(),
    };
    let events = stream::unfold(monitor, |mut monitor| async move {
        let event = monitor.next_event().await?;
        Some((event, monitor))
    })
    .boxed();
    LogWatch { events, poll_ticks }
}

/// `<projects_dir>/<folder with non-alphanumerics as '-'>`
pub fn project_dir_name(folder: &str) -> String {
    folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Finds the CLI log for a chat: the record's latest session under its
/// project directory, else any project holding `<key>.jsonl`.
pub async fn locate_log(
    projects_dir: &Path,
    key: &str,
    record: Option<&ChatRecord>,
) -> Option<PathBuf> {
    if let Some(record) = record {
        if let Some(session_id) = record.session_id.as_deref().filter(|id| is_plain_name(id)) {
            let candidate = projects_dir
                .join(project_dir_name(&record.folder))
                .join(format!("{session_id}.{LOG_EXTENSION}"));
            if tokio::fs::metadata(&candidate).await.is_ok() {
                return Some(candidate);
            }
        }
    }
    if !is_plain_name(key) {
        return None;
    }
    let mut projects = tokio::fs::read_dir(projects_dir).await.ok()?;
    let file_name = format!("{key}.{LOG_EXTENSION}");
    while let Ok(Some(project)) = projects.next_entry().await {
        let candidate = project.path().join(&file_name);
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Some(candidate);
        }
    }
    None
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn subagent_dir(log_path: &Path) -> PathBuf {
    log_path.with_extension("").join(SUBAGENT_DIR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ProbingTail,
    Watching,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordKind {
    Summary,
    Message { complete: bool },
    CompactBoundary,
    Other,
}

fn classify(record: &Value) -> RecordKind {
    let kind = record.get("type").and_then(Value::as_str);
    match kind {
        Some("summary") => RecordKind::Summary,
        Some("system") => {
            if record.get("subtype").and_then(Value::as_str) == Some("compact_boundary") {
                RecordKind::CompactBoundary
            } else {
                RecordKind::Other
            }
        }
        _ if record.get("message").is_some() => RecordKind::Message {
            complete: ends_turn(record),
        },
        _ => RecordKind::Other,
    }
}

/// A stop reason other than `tool_use` means the agent finished its turn.
fn ends_turn(record: &Value) -> bool {
    match record.pointer("/message/stop_reason").and_then(Value::as_str) {
        Some(reason) => reason != "tool_use",
        None => false,
    }
}

struct Timers {
    poll: Interval,
    subagent_scan: Interval,
}

struct Monitor {
    path: PathBuf,
    subagent_dir: PathBuf,
    config: LogMonitorConfig,
    phase: Phase,
    queue: VecDeque<NormalizedEvent>,
    /// Bytes of the main log already consumed.
    offset: u64,
    /// Trailing bytes of an unterminated line, kept for the next read.
    carry: Vec<u8>,
    subagents: HashMap<PathBuf, u64>,
    last_activity: Instant,
    timers: Option<Timers>,
    poll_ticks: Arc<AtomicU64>,
}

impl Monitor {
    async fn next_event(&mut self) -> Option<NormalizedEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            match self.phase {
                Phase::Finished => return None,
                Phase::ProbingTail => self.probe_tail().await,
                Phase::Watching => self.watch_step().await,
            }
        }
    }

    fn finish(&mut self) {
        self.queue.push_back(NormalizedEvent::Done);
        self.phase = Phase::Finished;
        self.timers = None;
    }

    async fn probe_tail(&mut self) {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to stat session log");
                0
            }
        };
        let start = len.saturating_sub(self.config.tail_probe_bytes);
        let tail = match read_range(&self.path, start, len).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to read session log tail");
                Vec::new()
            }
        };
        let text = String::from_utf8_lossy(&tail);
        let mut lines = text.lines().collect::<Vec<_>>();
        if start > 0 && !lines.is_empty() {
            // The window almost certainly starts mid-record.
            lines.remove(0);
        }

        let mut complete = false;
        for line in lines.iter().rev() {
            let Ok(record) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            match classify(&record) {
                RecordKind::Summary => {
                    complete = true;
                    break;
                }
                RecordKind::Message { complete: ended } => {
                    complete = ended;
                    break;
                }
                RecordKind::CompactBoundary | RecordKind::Other => {}
            }
        }

        if complete {
            tracing::info!(path = %self.path.display(), "session log already complete");
            self.finish();
            return;
        }

        self.offset = len;
        // An unterminated last line is still being written; finish it later.
        match tail.iter().rposition(|byte| *byte == b'\n') {
            Some(last_newline) => self.carry = tail[last_newline + 1..].to_vec(),
            None if start == 0 => self.carry = tail.clone(),
            None => {}
        }
        self.subagents = scan_subagents(&self.subagent_dir).await;
        self.last_activity = Instant::now();
        let now = Instant::now();
        let mut poll = interval_at(now + self.config.poll_interval, self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut subagent_scan = interval_at(
            now + self.config.subagent_scan_interval,
            self.config.subagent_scan_interval,
        );
        subagent_scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timers = Some(Timers {
            poll,
            subagent_scan,
        });
        self.phase = Phase::Watching;
        tracing::info!(path = %self.path.display(), offset = len, "watching session log");
    }

    async fn watch_step(&mut self) {
        let Some(timers) = self.timers.as_mut() else {
            self.phase = Phase::Finished;
            return;
        };
        let deadline = self.last_activity + self.config.inactivity_timeout;
        enum Wake {
            Poll,
            Scan,
            Idle,
        }
        let wake = tokio::select! {
            _ = timers.poll.tick() => Wake::Poll,
            _ = timers.subagent_scan.tick() => Wake::Scan,
            _ = tokio::time::sleep_until(deadline) => Wake::Idle,
        };
        match wake {
            Wake::Poll => {
                self.poll_ticks.fetch_add(1, Ordering::SeqCst);
                self.poll_main_log().await;
            }
            Wake::Scan => self.poll_subagents().await,
            Wake::Idle => {
                tracing::info!(path = %self.path.display(), "session log inactive; ending watch");
                self.finish();
            }
        }
    }

    async fn poll_main_log(&mut self) {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                tracing::debug!(path = %self.path.display(), error = %err, "session log unavailable");
                return;
            }
        };
        if len < self.offset {
            tracing::warn!(path = %self.path.display(), len, offset = self.offset, "session log shrank; resuming from end");
            self.offset = len;
            self.carry.clear();
            return;
        }
        if len == self.offset {
            return;
        }

        let appended = match read_range(&self.path, self.offset, len).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to read session log growth");
                return;
            }
        };
        self.offset = len;
        self.last_activity = Instant::now();
        self.carry.extend_from_slice(&appended);

        let Some(last_newline) = self.carry.iter().rposition(|byte| *byte == b'\n') else {
            return;
        };
        let complete_lines = self.carry.drain(..=last_newline).collect::<Vec<u8>>();
        let text = String::from_utf8_lossy(&complete_lines);

        let mut content_changed = false;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<Value>(line) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "skipping unparseable log line");
                    continue;
                }
            };
            match classify(&record) {
                RecordKind::Summary => {
                    self.flush_update(&mut content_changed);
                    self.finish();
                    return;
                }
                RecordKind::CompactBoundary => {
                    self.flush_update(&mut content_changed);
                    self.queue.push_back(NormalizedEvent::Compacting);
                }
                RecordKind::Message { complete } => {
                    content_changed = true;
                    if complete {
                        self.flush_update(&mut content_changed);
                        self.finish();
                        return;
                    }
                }
                RecordKind::Other => {}
            }
        }
        self.flush_update(&mut content_changed);
    }

    fn flush_update(&mut self, content_changed: &mut bool) {
        if *content_changed {
            self.queue.push_back(NormalizedEvent::Update);
            *content_changed = false;
        }
    }

    async fn poll_subagents(&mut self) {
        let sizes = scan_subagents(&self.subagent_dir).await;
        let grew = sizes
            .iter()
            .any(|(path, size)| self.subagents.get(path).map_or(true, |known| size > known));
        self.subagents = sizes;
        if grew {
            tracing::debug!(dir = %self.subagent_dir.display(), "sub-agent activity");
            self.last_activity = Instant::now();
            self.queue.push_back(NormalizedEvent::Update);
        }
    }
}

async fn read_range(path: &Path, start: u64, end: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity(end.saturating_sub(start) as usize);
    file.take(end.saturating_sub(start)).read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn scan_subagents(dir: &Path) -> HashMap<PathBuf, u64> {
    let mut sizes = HashMap::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return sizes;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_agent_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| {
                name.starts_with(SUBAGENT_PREFIX) && name.ends_with(&format!(".{LOG_EXTENSION}"))
            });
        if !is_agent_log {
            continue;
        }
        if let Ok(metadata) = entry.metadata().await {
            sizes.insert(path, metadata.len());
        }
    }
    sizes
}
