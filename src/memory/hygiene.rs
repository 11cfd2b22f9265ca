use super::outbox::{OutboxOperation, VectorOutbox};
use super::traits::{MemoryBackend, MemoryCategory};
use crate::config::MemoryConfig;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Minimum gap between passes. Hygiene runs at init, so this mostly keeps
/// a frequently-restarted host from re-scanning every few minutes.
const CADENCE_HOURS: i64 = 8;
const MARKER_FILE: &str = "last_hygiene";

/// Archive category entries are re-stored under.
pub const ARCHIVE_CATEGORY: &str = "archive";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HygieneReport {
    pub archived: u64,
    pub purged: u64,
    pub pruned_conversation: u64,
}

impl HygieneReport {
    pub fn total_actions(&self) -> u64 {
        self.archived + self.purged + self.pruned_conversation
    }
}

/// Run memory hygiene if the cadence window has elapsed.
///
/// Best-effort: callers log and continue on failure. Returns `None` when
/// hygiene is disabled or not yet due.
pub async fn run_if_due(
    config: &MemoryConfig,
    workspace_dir: &Path,
    backend: &dyn MemoryBackend,
    outbox: Option<&VectorOutbox>,
) -> Result<Option<HygieneReport>> {
    if !config.hygiene_enabled || !cadence_elapsed(workspace_dir) {
        return Ok(None);
    }

    let report = run(config, backend, outbox).await?;
    touch_marker(workspace_dir)?;

    if report.total_actions() > 0 {
        tracing::info!(
            archived = report.archived,
            purged = report.purged,
            pruned_conversation = report.pruned_conversation,
            "memory hygiene complete"
        );
    }

    Ok(Some(report))
}

/// One unconditional hygiene pass over every entry.
///
/// Per entry, the first matching rule wins: purge, conversation trim, then
/// archive. Core entries are never archived; already-archived entries only
/// age toward the purge threshold. Removed keys are enqueued as vector
/// deletes so the derived index converges.
pub async fn run(
    config: &MemoryConfig,
    backend: &dyn MemoryBackend,
    outbox: Option<&VectorOutbox>,
) -> Result<HygieneReport> {
    let now = Utc::now();
    let mut report = HygieneReport::default();
    let archive_category = MemoryCategory::Custom(ARCHIVE_CATEGORY.into());

    for entry in backend.list(None, None).await? {
        let Some(age_days) = entry_age_days(&entry.timestamp, now) else {
            continue;
        };

        if config.purge_after_days > 0 && age_days > i64::from(config.purge_after_days) {
            if backend.forget(&entry.key).await? {
                enqueue_delete(outbox, &entry.key);
                report.purged += 1;
            }
            continue;
        }

        if entry.category == MemoryCategory::Conversation
            && config.conversation_retention_days > 0
            && age_days > i64::from(config.conversation_retention_days)
        {
            if backend.forget(&entry.key).await? {
                enqueue_delete(outbox, &entry.key);
                report.pruned_conversation += 1;
            }
            continue;
        }

        if entry.category != MemoryCategory::Core
            && entry.category != archive_category
            && config.archive_after_days > 0
            && age_days > i64::from(config.archive_after_days)
        {
            backend
                .store(
                    &entry.key,
                    &entry.content,
                    archive_category.clone(),
                    entry.session_id.as_deref(),
                )
                .await?;
            report.archived += 1;
        }
    }

    Ok(report)
}

fn enqueue_delete(outbox: Option<&VectorOutbox>, key: &str) {
    if let Some(outbox) = outbox {
        if let Err(error) = outbox.enqueue(key, OutboxOperation::Delete) {
            tracing::warn!(key, %error, "failed to enqueue vector delete during hygiene");
        }
    }
}

fn entry_age_days(timestamp: &str, now: DateTime<Utc>) -> Option<i64> {
    let parsed = DateTime::parse_from_rfc3339(timestamp).ok()?;
    Some(now.signed_duration_since(parsed.with_timezone(&Utc)).num_days())
}

/// The marker is one RFC 3339 line: the instant of the last completed
/// pass. Missing or garbled markers read as "due" — hygiene is idempotent,
/// so a spurious pass beats one that silently never happens again.
fn cadence_elapsed(workspace_dir: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(marker_path(workspace_dir)) else {
        return true;
    };
    match DateTime::parse_from_rfc3339(raw.trim()) {
        Ok(last) => {
            let since = Utc::now().signed_duration_since(last.with_timezone(&Utc));
            since >= Duration::hours(CADENCE_HOURS)
        }
        Err(_) => true,
    }
}

fn touch_marker(workspace_dir: &Path) -> Result<()> {
    let path = marker_path(workspace_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, Utc::now().to_rfc3339())?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

fn marker_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join("state").join(MARKER_FILE)
}
