//! Knowledge files
//!
//! Append-only learnings log and a section-addressable context document.
//! Only the analyst holds a [`KnowledgeBase`]; build and QA code never write here.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flowforge_core::LearningProposal;
use regex::Regex;
use tokio::fs;
use tracing::info;

use crate::error::{OrchestratorError, Result};

const LEARNINGS_HEADER: &str = "# Learnings\n";
const CONTEXT_HEADER: &str = "# System Context\n";

#[derive(Debug, Clone)]
pub struct KnowledgeBase {
    learnings_path: PathBuf,
    context_path: PathBuf,
    reports_dir: PathBuf,
}

impl KnowledgeBase {
    pub fn new(
        learnings_path: impl Into<PathBuf>,
        context_path: impl Into<PathBuf>,
        reports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            learnings_path: learnings_path.into(),
            context_path: context_path.into(),
            reports_dir: reports_dir.into(),
        }
    }

    pub fn learnings_path(&self) -> &Path {
        &self.learnings_path
    }

    pub fn context_path(&self) -> &Path {
        &self.context_path
    }

    /// Appends a numbered entry and returns its id (`L-NNN`).
    pub async fn append_learning(
        &self,
        learning: &LearningProposal,
        date: NaiveDate,
    ) -> Result<String> {
        let existing = read_or(&self.learnings_path, LEARNINGS_HEADER).await?;
        let id = next_learning_id(&existing);
        let entry = format_learning(&id, learning, date);

        write_atomic(&self.learnings_path, &format!("{}{}", existing, entry)).await?;
        info!(id = %id, title = %learning.title, "Recorded learning");
        Ok(id)
    }

    pub async fn update_context_section(&self, section: &str, content: &str) -> Result<()> {
        let existing = read_or(&self.context_path, CONTEXT_HEADER).await?;
        let updated = replace_section(&existing, section, content);
        write_atomic(&self.context_path, &updated).await?;
        info!(section = %section, "Updated context section");
        Ok(())
    }

    pub async fn write_report(&self, file_name: &str, content: &str) -> Result<PathBuf> {
        let path = self.reports_dir.join(file_name);
        write_atomic(&path, content).await?;
        info!(path = %path.display(), "Wrote report");
        Ok(path)
    }
}

async fn read_or(path: &Path, default: &str) -> Result<String> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(default.to_string()),
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("knowledge");
    let temp_path = dir.join(format!(".{}.tmp", file_name));

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

/// Highest `### L-N:` heading plus one, zero-padded to three digits.
pub fn next_learning_id(existing: &str) -> String {
    let max = Regex::new(r"(?m)^### L-(\d+):")
        .ok()
        .map(|re| {
            re.captures_iter(existing)
                .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);
    format!("L-{:03}", max + 1)
}

fn format_learning(id: &str, learning: &LearningProposal, date: NaiveDate) -> String {
    format!(
        "\n\n### {id}: {title}\n\n\
         **Category:** {category}\n\
         **Severity:** {severity}\n\
         **Added:** {date}\n\n\
         {body}\n\n---",
        title = learning.title,
        category = learning.category,
        severity = learning.severity,
        date = date.format("%Y-%m-%d"),
        body = learning.body,
    )
}

/// Replace `## section` up to the next `## ` heading, or append it.
pub fn replace_section(doc: &str, section: &str, content: &str) -> String {
    let heading = format!("## {}", section);
    let start = doc
        .match_indices(&heading)
        .map(|(i, _)| i)
        .find(|&i| {
            let at_line_start = i == 0 || doc[..i].ends_with('\n');
            let rest = &doc[i + heading.len()..];
            at_line_start && (rest.is_empty() || rest.starts_with('\n') || rest.starts_with('\r'))
        });

    match start {
        Some(start) => {
            let body_start = start + heading.len();
            let end = doc[body_start..]
                .find("\n## ")
                .map(|offset| body_start + offset + 1)
                .unwrap_or(doc.len());
            format!(
                "{}{}\n\n{}\n\n{}",
                &doc[..start],
                heading,
                content.trim_end(),
                &doc[end..]
            )
        }
        None => format!("{}\n{}\n\n{}\n", doc, heading, content.trim_end()),
    }
}
