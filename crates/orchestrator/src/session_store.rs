//! Session Store
//!
//! Durable per-task state with an in-memory fast path. Every mutation is
//! persisted to `<storage>/<id>.json` through a temp file + rename; terminal
//! sessions are moved to `<storage>/archives/<id>_complete.json`.
//!
//! Disk writes are best-effort: a failed write is logged and the cached
//! session stays authoritative for the rest of the process lifetime.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use events::{Event, EventBus};
use flowforge_core::{
    AgentResult, AgentRole, ConversationEntry, FixAttempt, LoggedCall, Requirements, Session,
    Stage,
};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::state_machine::StageMachine;

const ARCHIVE_DIR: &str = "archives";

pub struct SessionStore {
    sessions_dir: PathBuf,
    cache: RwLock<HashMap<Uuid, Session>>,
    event_bus: Option<EventBus>,
}

impl SessionStore {
    pub fn new(sessions_dir: impl AsRef<Path>) -> Self {
        Self {
            sessions_dir: sessions_dir.as_ref().to_path_buf(),
            cache: RwLock::new(HashMap::new()),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    fn session_path(&self, id: Uuid) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", id))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.sessions_dir.join(ARCHIVE_DIR)
    }

    fn archive_path(&self, id: Uuid) -> PathBuf {
        self.archive_dir().join(format!("{}_complete.json", id))
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }

    pub async fn create(&self, target_resource_id: Option<String>) -> Session {
        self.create_at(target_resource_id, Stage::Clarification).await
    }

    /// Fix sessions against an existing workflow start directly at `Build`.
    pub async fn create_at(&self, target_resource_id: Option<String>, stage: Stage) -> Session {
        let mut session = Session::new(target_resource_id);
        session.stage = stage;
        info!(session_id = %session.id, stage = %stage, "Created session");

        self.persist_best_effort(&session).await;
        self.cache.write().await.insert(session.id, session.clone());

        self.emit(Event::SessionCreated {
            session_id: session.id,
            target_resource_id: session.target_resource_id.clone(),
        });
        session
    }

    /// Cached session, else the persisted one. Missing or corrupt files yield `None`.
    pub async fn load(&self, id: Uuid) -> Option<Session> {
        if let Some(session) = self.cache.read().await.get(&id) {
            return Some(session.clone());
        }

        let session = self.read_from_disk(id).await?;
        self.cache.write().await.insert(id, session.clone());
        Some(session)
    }

    async fn read_from_disk(&self, id: Uuid) -> Option<Session> {
        let path = self.session_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                debug!("No session file at {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<Session>(&content) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Corrupt session file, ignoring");
                None
            }
        }
    }

    /// Apply `f` to the session and persist the result.
    async fn mutate<T, F>(&self, id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> Result<T>,
    {
        let (value, snapshot) = {
            let mut cache = self.cache.write().await;
            if !cache.contains_key(&id) {
                let loaded = self
                    .read_from_disk(id)
                    .await
                    .ok_or(OrchestratorError::SessionNotFound(id))?;
                cache.insert(id, loaded);
            }
            let session = cache
                .get_mut(&id)
                .ok_or(OrchestratorError::SessionNotFound(id))?;

            let value = f(session)?;
            session.touch();
            (value, session.clone())
        };

        self.persist_best_effort(&snapshot).await;
        Ok(value)
    }

    async fn read<T, F>(&self, id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&Session) -> T,
    {
        let session = self
            .load(id)
            .await
            .ok_or(OrchestratorError::SessionNotFound(id))?;
        Ok(f(&session))
    }

    /// Returns the previous stage.
    pub async fn update_stage(&self, id: Uuid, stage: Stage) -> Result<Stage> {
        let from = self
            .mutate(id, |session| {
                StageMachine::validate_transition(&session.stage, &stage)?;
                let from = session.stage;
                session.stage = stage;
                Ok(from)
            })
            .await?;

        if from != stage {
            info!(session_id = %id, from = %from, to = %stage, "Stage transition");
            self.emit(Event::StageChanged {
                session_id: id,
                from,
                to: stage,
            });
        }
        Ok(from)
    }

    pub async fn increment_cycle(&self, id: Uuid) -> Result<u32> {
        self.mutate(id, |session| {
            session.cycle += 1;
            Ok(session.cycle)
        })
        .await
    }

    pub async fn add_history(&self, id: Uuid, entry: ConversationEntry) -> Result<()> {
        let removed = self
            .mutate(id, |session| Ok(session.push_history(entry)))
            .await?;
        if removed > 0 {
            debug!(session_id = %id, removed, "Trimmed conversation history");
        }
        Ok(())
    }

    /// Entries written by `role` plus every user entry.
    pub async fn history(
        &self,
        id: Uuid,
        role: Option<AgentRole>,
    ) -> Result<Vec<ConversationEntry>> {
        self.read(id, |session| {
            session
                .history
                .iter()
                .filter(|e| match role {
                    Some(role) => e.agent_role.is_none() || e.agent_role == Some(role),
                    None => true,
                })
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn log_fix_attempt(&self, id: Uuid, attempt: FixAttempt) -> Result<()> {
        self.mutate(id, |session| {
            session.fix_attempts.push(attempt);
            Ok(())
        })
        .await
    }

    pub async fn get_fix_attempts(&self, id: Uuid) -> Result<Vec<FixAttempt>> {
        self.read(id, |session| session.fix_attempts.clone()).await
    }

    pub async fn format_already_tried(&self, id: Uuid) -> Result<String> {
        self.read(id, |session| format_already_tried(&session.fix_attempts))
            .await
    }

    /// Appends the call stamped with the session's current cycle and returns it.
    pub async fn log_call(&self, id: Uuid, call: LoggedCall) -> Result<LoggedCall> {
        self.mutate(id, |session| {
            let stamped = call.in_cycle(session.cycle);
            session.logged_calls.push(stamped.clone());
            Ok(stamped)
        })
        .await
    }

    pub async fn get_calls(&self, id: Uuid, role: Option<AgentRole>) -> Result<Vec<LoggedCall>> {
        self.read(id, |session| {
            session
                .logged_calls
                .iter()
                .filter(|c| role.map_or(true, |r| c.agent_role == r))
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn store_agent_result(&self, id: Uuid, result: AgentResult) -> Result<()> {
        self.mutate(id, |session| {
            session.agent_results.insert(result.agent_role, result);
            Ok(())
        })
        .await
    }

    pub async fn get_agent_result(&self, id: Uuid, role: AgentRole) -> Result<Option<AgentResult>> {
        self.read(id, |session| session.agent_results.get(&role).cloned())
            .await
    }

    pub async fn set_requirements(&self, id: Uuid, requirements: Requirements) -> Result<()> {
        self.mutate(id, |session| {
            session.requirements = Some(requirements);
            Ok(())
        })
        .await
    }

    pub async fn set_target_resource_id(&self, id: Uuid, resource_id: String) -> Result<()> {
        self.mutate(id, |session| {
            session.target_resource_id = Some(resource_id);
            Ok(())
        })
        .await
    }

    pub async fn snapshot(&self, id: Uuid) -> Result<Session> {
        self.read(id, Session::clone).await
    }

    /// Moves the session to the archive store and evicts it from the cache.
    pub async fn archive(&self, id: Uuid) -> Result<PathBuf> {
        let session = self.snapshot(id).await?;

        let archive_dir = self.archive_dir();
        fs::create_dir_all(&archive_dir).await?;
        let path = self.archive_path(id);
        write_json_atomic(&archive_dir, &path, id, &session).await?;

        match fs::remove_file(self.session_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session_id = %id, error = %e, "Failed to remove active session file"),
        }
        self.cache.write().await.remove(&id);

        info!(session_id = %id, stage = %session.stage, path = %path.display(), "Archived session");
        self.emit(Event::SessionArchived {
            session_id: id,
            stage: session.stage,
        });
        Ok(path)
    }

    pub async fn load_archived(&self, id: Uuid) -> Result<Option<Session>> {
        let path = self.archive_path(id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        let session = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::Serialization(format!("Failed to parse archived session: {}", e))
        })?;
        Ok(Some(session))
    }

    async fn persist_best_effort(&self, session: &Session) {
        if let Err(e) = self.persist(session).await {
            warn!(session_id = %session.id, error = %e, "Failed to persist session");
        }
    }

    async fn persist(&self, session: &Session) -> Result<()> {
        fs::create_dir_all(&self.sessions_dir).await?;
        write_json_atomic(
            &self.sessions_dir,
            &self.session_path(session.id),
            session.id,
            session,
        )
        .await
    }
}

/// Write JSON via a `.{id}.tmp` sibling and rename it into place.
async fn write_json_atomic<T: serde::Serialize>(
    dir: &Path,
    path: &Path,
    id: Uuid,
    value: &T,
) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    let temp_path = dir.join(format!(".{}.tmp", id));

    fs::write(&temp_path, content).await.map_err(|e| {
        OrchestratorError::ExecutionFailed(format!(
            "Failed to write temp file {:?}: {}",
            temp_path, e
        ))
    })?;

    fs::rename(&temp_path, path).await.map_err(|e| {
        OrchestratorError::ExecutionFailed(format!(
            "Failed to rename {:?} -> {:?}: {}",
            temp_path, path, e
        ))
    })?;
    Ok(())
}

/// Renders the fix-attempt log as a "do not repeat" prompt block.
pub fn format_already_tried(attempts: &[FixAttempt]) -> String {
    if attempts.is_empty() {
        return String::new();
    }

    let mut out = String::from("## ALREADY TRIED (DO NOT REPEAT!)\n\n");
    for attempt in attempts {
        let _ = writeln!(out, "### Cycle {}: {}", attempt.cycle, attempt.approach);
        let _ = writeln!(out, "- Result: {}", attempt.result.as_str());
        if let Some(error_type) = &attempt.error_type {
            let _ = writeln!(out, "- Error: {}", error_type);
        }
        let _ = writeln!(out, "- Nodes: {}\n", attempt.nodes_affected.join(", "));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowforge_core::{FixResult, MAX_HISTORY_TOKENS};
    use tempfile::TempDir;

    fn setup() -> (TempDir, SessionStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_create_persists_immediately() {
        let (temp_dir, store) = setup();

        let session = store.create(Some("wf-9".to_string())).await;

        assert_eq!(session.stage, Stage::Clarification);
        assert_eq!(session.cycle, 0);
        assert!(temp_dir
            .path()
            .join(format!("{}.json", session.id))
            .exists());
    }

    #[tokio::test]
    async fn test_round_trip_from_disk() {
        let (temp_dir, store) = setup();
        let session = store.create(None).await;
        store
            .add_history(session.id, ConversationEntry::user("build me a workflow"))
            .await
            .unwrap();
        store.update_stage(session.id, Stage::Research).await.unwrap();
        store.increment_cycle(session.id).await.unwrap();

        // Fresh store has an empty cache and must read from disk.
        let reloaded_store = SessionStore::new(temp_dir.path());
        let loaded = reloaded_store.load(session.id).await.unwrap();

        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.stage, Stage::Research);
        assert_eq!(loaded.cycle, 1);
        assert_eq!(loaded.history.len(), 1);
        assert!(loaded.history[0].timestamp <= chrono::Utc::now());
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let (_temp_dir, store) = setup();
        assert!(store.load(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn test_load_corrupt_returns_none() {
        let (temp_dir, store) = setup();
        let id = Uuid::new_v4();
        std::fs::write(temp_dir.path().join(format!("{}.json", id)), "{not json").unwrap();

        assert!(store.load(id).await.is_none());
    }

    #[tokio::test]
    async fn test_mutator_on_unknown_session_fails() {
        let (_temp_dir, store) = setup();
        let id = Uuid::new_v4();

        match store.increment_cycle(id).await {
            Err(OrchestratorError::SessionNotFound(missing)) => assert_eq!(missing, id),
            other => panic!("Expected SessionNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_increment_cycle_returns_new_value() {
        let (_temp_dir, store) = setup();
        let session = store.create(None).await;

        assert_eq!(store.increment_cycle(session.id).await.unwrap(), 1);
        assert_eq!(store.increment_cycle(session.id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invalid_stage_transition_rejected() {
        let (_temp_dir, store) = setup();
        let session = store.create(None).await;

        let result = store.update_stage(session.id, Stage::Build).await;
        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidTransition { .. })
        ));

        let previous = store.update_stage(session.id, Stage::Blocked).await.unwrap();
        assert_eq!(previous, Stage::Clarification);
    }

    #[tokio::test]
    async fn test_history_trim_through_store() {
        let (_temp_dir, store) = setup();
        let session = store.create(None).await;

        store
            .add_history(session.id, ConversationEntry::user("anchor").with_tokens(5))
            .await
            .unwrap();
        for i in 0..20 {
            store
                .add_history(
                    session.id,
                    ConversationEntry::assistant(AgentRole::Qa, format!("report {i}"))
                        .with_tokens(15_000),
                )
                .await
                .unwrap();
        }

        let snapshot = store.snapshot(session.id).await.unwrap();
        assert_eq!(snapshot.history[0].content, "anchor");
        assert!(snapshot.history_tokens() <= MAX_HISTORY_TOKENS);
        assert!(snapshot.history.len() < 21);
    }

    #[tokio::test]
    async fn test_history_role_filter_keeps_user_entries() {
        let (_temp_dir, store) = setup();
        let session = store.create(None).await;
        store
            .add_history(session.id, ConversationEntry::user("request"))
            .await
            .unwrap();
        store
            .add_history(session.id, ConversationEntry::assistant(AgentRole::Builder, "built"))
            .await
            .unwrap();
        store
            .add_history(session.id, ConversationEntry::assistant(AgentRole::Qa, "failed"))
            .await
            .unwrap();

        let builder_view = store
            .history(session.id, Some(AgentRole::Builder))
            .await
            .unwrap();
        assert_eq!(builder_view.len(), 2);
        assert_eq!(builder_view[1].content, "built");
    }

    #[tokio::test]
    async fn test_format_already_tried() {
        let (_temp_dir, store) = setup();
        let session = store.create(None).await;

        assert_eq!(store.format_already_tried(session.id).await.unwrap(), "");

        store
            .log_fix_attempt(
                session.id,
                FixAttempt::new(1, "add auth header", FixResult::Failed)
                    .with_error_type("401 Unauthorized")
                    .with_nodes(vec!["HTTP".to_string()]),
            )
            .await
            .unwrap();
        store
            .log_fix_attempt(
                session.id,
                FixAttempt::new(2, "switch credential", FixResult::Success),
            )
            .await
            .unwrap();

        let block = store.format_already_tried(session.id).await.unwrap();
        assert!(block.starts_with("## ALREADY TRIED (DO NOT REPEAT!)"));
        assert!(block.contains("- Error: 401 Unauthorized"));
        let first = block.find("### Cycle 1: add auth header").unwrap();
        let second = block.find("### Cycle 2: switch credential").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn test_log_call_stamps_cycle_and_filters_by_role() {
        let (_temp_dir, store) = setup();
        let session = store.create(None).await;
        store.increment_cycle(session.id).await.unwrap();

        store
            .log_call(
                session.id,
                LoggedCall::new(
                    "workflow_update_partial",
                    serde_json::json!({}),
                    AgentRole::Builder,
                ),
            )
            .await
            .unwrap();
        store
            .log_call(
                session.id,
                LoggedCall::new("workflow_get", serde_json::json!({}), AgentRole::Qa),
            )
            .await
            .unwrap();

        let builder_calls = store
            .get_calls(session.id, Some(AgentRole::Builder))
            .await
            .unwrap();
        assert_eq!(builder_calls.len(), 1);
        assert_eq!(builder_calls[0].cycle, 1);
        assert!(builder_calls[0].is_mutation());

        assert_eq!(store.get_calls(session.id, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_agent_result_last_write_wins() {
        let (_temp_dir, store) = setup();
        let session = store.create(None).await;

        store
            .store_agent_result(
                session.id,
                AgentResult::failure(AgentRole::Qa, "first", Vec::new()),
            )
            .await
            .unwrap();
        store
            .store_agent_result(
                session.id,
                AgentResult::failure(AgentRole::Qa, "second", Vec::new()),
            )
            .await
            .unwrap();

        let result = store
            .get_agent_result(session.id, AgentRole::Qa)
            .await
            .unwrap()
            .unwrap();
        match result.data {
            flowforge_core::AgentPayload::Failure { error } => assert_eq!(error, "second"),
            other => panic!("Expected failure payload, got {other:?}"),
        }
        assert!(store
            .get_agent_result(session.id, AgentRole::Builder)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_archive_moves_session() {
        let (temp_dir, store) = setup();
        let session = store.create(None).await;
        store.update_stage(session.id, Stage::Blocked).await.unwrap();

        let path = store.archive(session.id).await.unwrap();

        assert_eq!(
            path,
            temp_dir
                .path()
                .join("archives")
                .join(format!("{}_complete.json", session.id))
        );
        assert!(path.exists());
        assert!(!temp_dir
            .path()
            .join(format!("{}.json", session.id))
            .exists());
        assert!(store.load(session.id).await.is_none());

        let archived = store.load_archived(session.id).await.unwrap().unwrap();
        assert_eq!(archived.stage, Stage::Blocked);
    }

    #[tokio::test]
    async fn test_create_at_stage() {
        let (_temp_dir, store) = setup();
        let session = store.create_at(Some("wf-9".to_string()), Stage::Build).await;

        assert_eq!(store.load(session.id).await.unwrap().stage, Stage::Build);
        store.update_stage(session.id, Stage::Validate).await.unwrap();
        assert!(store.update_stage(session.id, Stage::Research).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_archive_keeps_active_session() {
        let (temp_dir, store) = setup();
        let session = store.create(None).await;
        std::fs::write(temp_dir.path().join("archives"), "not a directory").unwrap();

        assert!(store.archive(session.id).await.is_err());

        let active = store.load(session.id).await.unwrap();
        assert_eq!(active.id, session.id);
        assert!(temp_dir
            .path()
            .join(format!("{}.json", session.id))
            .exists());
    }

    #[tokio::test]
    async fn test_event_emitted_on_stage_change() {
        let temp_dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let store = SessionStore::new(temp_dir.path()).with_event_bus(bus.clone());
        let session = store.create(None).await;
        let mut rx = bus.subscribe();

        store.update_stage(session.id, Stage::Decision).await.unwrap();

        match rx.recv().await.unwrap().event {
            Event::StageChanged { from, to, .. } => {
                assert_eq!(from, Stage::Clarification);
                assert_eq!(to, Stage::Decision);
            }
            other => panic!("Expected StageChanged, got {other:?}"),
        }
    }
}
