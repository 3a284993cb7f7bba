//! Session persistence.
//!
//! `JsonFileStore` keeps one pretty-printed JSON document per session,
//! written through a temp file and renamed into place, plus append-only
//! JSON-lines logs for checkpoints and task executions:
//!
//! ```text
//! <root>/<session-id>.json
//! <root>/<session-id>.checkpoints.jsonl
//! <root>/<session-id>.executions.jsonl
//! ```

use crate::core::TaskResult;
use crate::error::Result;
use crate::session::{Checkpoint, MeshSession, SessionId};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &MeshSession) -> Result<()>;

    async fn load(&self, id: &SessionId) -> Result<Option<MeshSession>>;

    async fn list(&self) -> Result<Vec<SessionId>>;

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Checkpoints in the order they were taken.
    async fn checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>>;

    async fn append_execution(&self, id: &SessionId, result: &TaskResult) -> Result<()>;

    async fn executions(&self, id: &SessionId) -> Result<Vec<TaskResult>>;
}

#[derive(Default)]
struct MemoryInner {
    sessions: HashMap<SessionId, MeshSession>,
    checkpoints: HashMap<SessionId, Vec<Checkpoint>>,
    executions: HashMap<SessionId, Vec<TaskResult>>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, session: &MeshSession) -> Result<()> {
        self.inner
            .write()
            .await
            .sessions
            .insert(session.id, session.clone());
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<MeshSession>> {
        Ok(self.inner.read().await.sessions.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        let mut ids: Vec<SessionId> = self.inner.read().await.sessions.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.inner
            .write()
            .await
            .checkpoints
            .entry(checkpoint.session_id)
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>> {
        Ok(self
            .inner
            .read()
            .await
            .checkpoints
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_execution(&self, id: &SessionId, result: &TaskResult) -> Result<()> {
        self.inner
            .write()
            .await
            .executions
            .entry(*id)
            .or_default()
            .push(result.clone());
        Ok(())
    }

    async fn executions(&self, id: &SessionId) -> Result<Vec<TaskResult>> {
        Ok(self
            .inner
            .read()
            .await
            .executions
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_path(&self, id: &SessionId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    fn checkpoints_path(&self, id: &SessionId) -> PathBuf {
        self.root.join(format!("{}.checkpoints.jsonl", id))
    }

    fn executions_path(&self, id: &SessionId) -> PathBuf {
        self.root.join(format!("{}.executions.jsonl", id))
    }

    async fn ensure_root(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.root).await? {
            debug!(root = %self.root.display(), "Creating session directory");
            tokio::fs::create_dir_all(&self.root).await?;
        }
        Ok(())
    }

    async fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure_root().await?;
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read a JSON-lines log. A torn trailing line is skipped.
    async fn read_lines<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(Vec::new());
        }
        let contents = tokio::fs::read_to_string(path).await?;
        let mut lines = contents.lines().filter(|l| !l.trim().is_empty()).peekable();
        let mut values = Vec::new();
        while let Some(line) = lines.next() {
            match serde_json::from_str(line) {
                Ok(value) => values.push(value),
                Err(e) if lines.peek().is_none() => {
                    warn!(path = %path.display(), error = %e, "Skipping torn log line");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn save(&self, session: &MeshSession) -> Result<()> {
        self.ensure_root().await?;
        let path = self.session_path(&session.id);
        let contents = serde_json::to_string_pretty(session)?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        debug!(session = %session.id, path = %path.display(), "Session saved");
        Ok(())
    }

    async fn load(&self, id: &SessionId) -> Result<Option<MeshSession>> {
        let path = self.session_path(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn list(&self) -> Result<Vec<SessionId>> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = stem.parse::<SessionId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.append_line(&self.checkpoints_path(&checkpoint.session_id), checkpoint)
            .await
    }

    async fn checkpoints(&self, id: &SessionId) -> Result<Vec<Checkpoint>> {
        self.read_lines(&self.checkpoints_path(id)).await
    }

    async fn append_execution(&self, id: &SessionId, result: &TaskResult) -> Result<()> {
        self.append_line(&self.executions_path(id), result).await
    }

    async fn executions(&self, id: &SessionId) -> Result<Vec<TaskResult>> {
        self.read_lines(&self.executions_path(id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentId;
    use chrono::Utc;
    use tempfile::TempDir;

    fn checkpoint(session: &MeshSession, number: u32) -> Checkpoint {
        Checkpoint {
            session_id: session.id,
            number,
            timestamp: Utc::now(),
            session: session.clone(),
            turn_state: None,
            active_agents: Vec::new(),
            pending_messages: 0,
        }
    }

    fn result(task: &str) -> TaskResult {
        TaskResult::success(task.into(), AgentId::from("a"), "ok".to_string(), 1, 10, 0.01, 0.9)
    }

    // ========== MemoryStore Tests ==========

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let session = MeshSession::new(SessionId::new(), "task");
        store.save(&session).await.unwrap();

        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.task, "task");
        assert_eq!(store.list().await.unwrap(), vec![session.id]);
        assert!(store.load(&SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_logs() {
        let store = MemoryStore::new();
        let session = MeshSession::new(SessionId::new(), "task");
        store.append_checkpoint(&checkpoint(&session, 1)).await.unwrap();
        store.append_checkpoint(&checkpoint(&session, 2)).await.unwrap();
        store.append_execution(&session.id, &result("a")).await.unwrap();

        let numbers: Vec<u32> = store
            .checkpoints(&session.id)
            .await
            .unwrap()
            .iter()
            .map(|c| c.number)
            .collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(store.executions(&session.id).await.unwrap().len(), 1);
        assert!(store.checkpoints(&SessionId::new()).await.unwrap().is_empty());
    }

    // ========== JsonFileStore Tests ==========

    #[tokio::test]
    async fn test_file_store_creates_directory_and_roundtrips() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp.path().join("sessions"));
        let session = MeshSession::new(SessionId::new(), "persist me");

        store.save(&session).await.unwrap();
        assert!(store.root().join(format!("{}.json", session.id)).exists());

        let loaded = store.load(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.task, "persist me");
    }

    #[tokio::test]
    async fn test_file_store_overwrites_on_save() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp.path());
        let mut session = MeshSession::new(SessionId::new(), "v1");
        store.save(&session).await.unwrap();
        session.task = "v2".to_string();
        store.save(&session).await.unwrap();

        assert_eq!(store.load(&session.id).await.unwrap().unwrap().task, "v2");
        assert!(!store.root().join(format!("{}.json.tmp", session.id)).exists());
    }

    #[tokio::test]
    async fn test_file_store_list_ignores_logs() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp.path());
        let session = MeshSession::new(SessionId::new(), "t");
        store.save(&session).await.unwrap();
        store.append_checkpoint(&checkpoint(&session, 1)).await.unwrap();
        std::fs::write(temp.path().join("notes.json"), "{}").unwrap();

        assert_eq!(store.list().await.unwrap(), vec![session.id]);
    }

    #[tokio::test]
    async fn test_file_store_list_missing_root() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp.path().join("absent"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.load(&SessionId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_appends_jsonl() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp.path());
        let session = MeshSession::new(SessionId::new(), "t");

        store.append_execution(&session.id, &result("one")).await.unwrap();
        store.append_execution(&session.id, &result("two")).await.unwrap();

        let path = temp.path().join(format!("{}.executions.jsonl", session.id));
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        let executions = store.executions(&session.id).await.unwrap();
        assert_eq!(executions[0].task_id.as_str(), "one");
        assert_eq!(executions[1].task_id.as_str(), "two");
    }

    #[tokio::test]
    async fn test_file_store_skips_torn_trailing_line() {
        let temp = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp.path());
        let session = MeshSession::new(SessionId::new(), "t");
        store.append_execution(&session.id, &result("one")).await.unwrap();

        let path = temp.path().join(format!("{}.executions.jsonl", session.id));
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("{\"task_id\":");
        std::fs::write(&path, contents).unwrap();

        assert_eq!(store.executions(&session.id).await.unwrap().len(), 1);
    }
}
