//! Fix list persistence
//!
//! One `TODO.json` per analysis under `<storage>/analyze/<analysis_id>/`, so an
//! interrupted fix run can be picked up again by analysis id.

use std::path::{Path, PathBuf};

use flowforge_core::TodoList;
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::knowledge::write_atomic;

const TODO_FILE: &str = "TODO.json";

pub struct TodoStore {
    dir: PathBuf,
}

impl TodoStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn todo_path(&self, analysis_id: Uuid) -> PathBuf {
        self.dir.join(analysis_id.to_string()).join(TODO_FILE)
    }

    pub async fn save(&self, todo: &TodoList) -> Result<PathBuf> {
        let path = self.todo_path(todo.analysis_id);
        let content = serde_json::to_string_pretty(todo)?;
        write_atomic(&path, &content).await?;
        debug!(analysis_id = %todo.analysis_id, tasks = todo.tasks.len(), "Saved fix list");
        Ok(path)
    }

    pub async fn load(&self, analysis_id: Uuid) -> Result<Option<TodoList>> {
        let content = match fs::read_to_string(self.todo_path(analysis_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let todo = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::Serialization(format!("Failed to parse fix list: {}", e))
        })?;
        Ok(Some(todo))
    }

    pub async fn remove(&self, analysis_id: Uuid) -> Result<()> {
        match fs::remove_dir_all(self.dir.join(analysis_id.to_string())).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
