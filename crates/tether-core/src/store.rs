//! File-backed run store.
//!
//! Three small surfaces share one base directory:
//! - `runs.json`: lightweight index of every run the engine has seen,
//! - `outcomes.json`: the authoritative outcome registry keyed by run id,
//! - `messages/<key>.json` + `events/<key>.jsonl`: per-identity message
//!   snapshots and the append-only wire-event log.
//!
//! In-memory maps are the source of truth while the process lives; files are
//! rewritten wholesale on change, except the event log which only appends.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tether_types::{RunStatus, StoredMessage, WireEvent};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub identity: String,
    pub run_id: String,
    pub message_id: String,
    pub parent: Option<String>,
    pub task: Option<String>,
    pub label: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seq: u64,
    /// Count of stored message records for this identity.
    #[serde(default)]
    pub records: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_ok: bool,
    pub error: Option<String>,
}

/// Status of a rehydrated run, derived from the outcome registry: no outcome
/// means the run never finished as far as disk knows.
pub fn derive_status(outcome: Option<&RunOutcome>) -> RunStatus {
    match outcome {
        None => RunStatus::Running,
        Some(outcome) if outcome.error.is_none() && outcome.exit_ok => RunStatus::Completed,
        Some(_) => RunStatus::Error,
    }
}

pub struct RunStore {
    base: PathBuf,
    index: RwLock<HashMap<String, RunIndexEntry>>,
    outcomes: RwLock<HashMap<String, RunOutcome>>,
    messages: RwLock<HashMap<String, Vec<StoredMessage>>>,
}

impl RunStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(base.join("messages")).await?;
        fs::create_dir_all(base.join("events")).await?;

        let index = read_json_map::<RunIndexEntry>(&base.join("runs.json")).await;
        let outcomes = read_json_map::<RunOutcome>(&base.join("outcomes.json")).await;

        Ok(Self {
            base,
            index: RwLock::new(index),
            outcomes: RwLock::new(outcomes),
            messages: RwLock::new(HashMap::new()),
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub async fn upsert_run(&self, entry: RunIndexEntry) -> anyhow::Result<()> {
        self.index
            .write()
            .await
            .insert(entry.identity.clone(), entry);
        self.flush_index().await
    }

    /// Update the mutable fields of an existing index entry. Unknown
    /// identities are ignored; the caller registers runs before touching them.
    pub async fn touch_run(
        &self,
        identity: &str,
        status: RunStatus,
        last_seq: u64,
        ended_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        {
            let mut index = self.index.write().await;
            let Some(entry) = index.get_mut(identity) else {
                return Ok(());
            };
            entry.status = status;
            entry.last_seq = last_seq;
            if ended_at.is_some() {
                entry.ended_at = ended_at;
            }
        }
        self.flush_index().await
    }

    pub async fn run_entry(&self, identity: &str) -> Option<RunIndexEntry> {
        self.index.read().await.get(identity).cloned()
    }

    pub async fn list_runs(&self) -> Vec<RunIndexEntry> {
        let mut entries: Vec<_> = self.index.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        entries
    }

    pub async fn set_outcome(&self, run_id: &str, outcome: RunOutcome) -> anyhow::Result<()> {
        self.outcomes
            .write()
            .await
            .insert(run_id.to_string(), outcome);
        self.flush_outcomes().await
    }

    pub async fn outcome(&self, run_id: &str) -> Option<RunOutcome> {
        self.outcomes.read().await.get(run_id).cloned()
    }

    /// Upsert one message record by id: replace in place when the id exists,
    /// otherwise append and bump the identity's record counter.
    pub async fn upsert_message(
        &self,
        identity: &str,
        message: StoredMessage,
    ) -> anyhow::Result<()> {
        let appended = {
            let mut messages = self.messages.write().await;
            let list = match messages.get_mut(identity) {
                Some(list) => list,
                None => {
                    let loaded = self.load_messages_file(identity).await;
                    messages.entry(identity.to_string()).or_insert(loaded)
                }
            };
            match list.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => {
                    *existing = message;
                    false
                }
                None => {
                    list.push(message);
                    true
                }
            }
        };
        self.flush_messages(identity).await?;

        if appended {
            let counted = {
                let mut index = self.index.write().await;
                match index.get_mut(identity) {
                    Some(entry) => {
                        entry.records += 1;
                        true
                    }
                    None => false,
                }
            };
            if counted {
                self.flush_index().await?;
            }
        }
        Ok(())
    }

    pub async fn messages(&self, identity: &str) -> Vec<StoredMessage> {
        if let Some(list) = self.messages.read().await.get(identity) {
            return list.clone();
        }
        let loaded = self.load_messages_file(identity).await;
        self.messages
            .write()
            .await
            .entry(identity.to_string())
            .or_insert(loaded)
            .clone()
    }

    /// Append wire events to the identity's durable event log.
    pub async fn append_events(&self, identity: &str, events: &[WireEvent]) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let path = self.events_path(identity);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open event log {}", path.display()))?;
        let mut chunk = String::new();
        for event in events {
            chunk.push_str(&serde_json::to_string(event)?);
            chunk.push('\n');
        }
        file.write_all(chunk.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn load_events(&self, identity: &str) -> anyhow::Result<Vec<WireEvent>> {
        let path = self.events_path(identity);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path).await?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    async fn load_messages_file(&self, identity: &str) -> Vec<StoredMessage> {
        let path = self.messages_path(identity);
        let Ok(raw) = fs::read_to_string(&path).await else {
            return Vec::new();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    fn messages_path(&self, identity: &str) -> PathBuf {
        self.base
            .join("messages")
            .join(format!("{}.json", file_key(identity)))
    }

    fn events_path(&self, identity: &str) -> PathBuf {
        self.base
            .join("events")
            .join(format!("{}.jsonl", file_key(identity)))
    }

    async fn flush_index(&self) -> anyhow::Result<()> {
        let snapshot = self.index.read().await.clone();
        write_json_file(&self.base.join("runs.json"), &snapshot).await
    }

    async fn flush_outcomes(&self) -> anyhow::Result<()> {
        let snapshot = self.outcomes.read().await.clone();
        write_json_file(&self.base.join("outcomes.json"), &snapshot).await
    }

    async fn flush_messages(&self, identity: &str) -> anyhow::Result<()> {
        let snapshot = self
            .messages
            .read()
            .await
            .get(identity)
            .cloned()
            .unwrap_or_default();
        write_json_file(&self.messages_path(identity), &snapshot).await
    }
}

/// Identity keys may embed parent linkage separators; flatten them for use
/// as file names.
fn file_key(identity: &str) -> String {
    identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn read_json_map<T: for<'de> Deserialize<'de>>(path: &Path) -> HashMap<String, T> {
    let Ok(raw) = fs::read_to_string(path).await else {
        return HashMap::new();
    };
    serde_json::from_str(&raw).unwrap_or_default()
}

async fn write_json_file<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
