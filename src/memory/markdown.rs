use super::traits::{
    validate_key, BackendCapabilities, MemoryBackend, MemoryCategory, MemoryEntry,
};
use async_trait::async_trait;
use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Markdown-based memory — plain files as source of truth
///
/// Layout:
///   workspace/MEMORY.md            — curated long-term memory (core)
///   workspace/memory/YYYY-MM-DD.md — daily logs (append-only)
///
/// Entries are `- **key**: content` bullets. The files double as a
/// human-auditable trail, so `forget` never rewrites them and reports
/// `false`.
pub struct MarkdownMemory {
    workspace_dir: PathBuf,
}

impl MarkdownMemory {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }

    fn memory_dir(&self) -> PathBuf {
        self.workspace_dir.join("memory")
    }

    fn core_path(&self) -> PathBuf {
        self.workspace_dir.join("MEMORY.md")
    }

    fn daily_path(&self) -> PathBuf {
        let date = Local::now().format("%Y-%m-%d").to_string();
        self.memory_dir().join(format!("{date}.md"))
    }

    async fn append_to_file(&self, path: &Path, line: &str) -> anyhow::Result<()> {
        fs::create_dir_all(self.memory_dir()).await?;

        let existing = if path.exists() {
            fs::read_to_string(path).await.unwrap_or_default()
        } else {
            String::new()
        };

        let updated = if existing.is_empty() {
            let header = if path == self.core_path() {
                "# Long-Term Memory\n\n".to_string()
            } else {
                let date = Local::now().format("%Y-%m-%d").to_string();
                format!("# Daily Log — {date}\n\n")
            };
            format!("{header}{line}\n")
        } else {
            format!("{existing}{line}\n")
        };

        fs::write(path, updated).await?;
        Ok(())
    }

    /// Parse `- **key**: content` bullets; plain bullets fall back to a
    /// positional key so older files still load.
    fn parse_entries_from_file(
        path: &Path,
        content: &str,
        category: &MemoryCategory,
    ) -> Vec<MemoryEntry> {
        let filename = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown");

        content
            .lines()
            .enumerate()
            .filter_map(|(i, line)| {
                let trimmed = line.trim();
                if trimmed.is_empty() || trimmed.starts_with('#') {
                    return None;
                }

                let body = trimmed.strip_prefix("- ").unwrap_or(trimmed);
                let (key, text) = match body
                    .strip_prefix("**")
                    .and_then(|rest| rest.split_once("**: "))
                {
                    Some((key, text)) => (key.to_string(), text.to_string()),
                    None => (format!("{filename}:{i}"), body.to_string()),
                };

                Some(MemoryEntry {
                    id: format!("{filename}:{i}"),
                    key,
                    content: text,
                    category: category.clone(),
                    timestamp: filename.to_string(),
                    session_id: None,
                    score: None,
                })
            })
            .collect()
    }

    async fn read_all_entries(&self) -> anyhow::Result<Vec<MemoryEntry>> {
        let mut entries = Vec::new();

        let core_path = self.core_path();
        if core_path.exists() {
            let content = fs::read_to_string(&core_path).await?;
            entries.extend(Self::parse_entries_from_file(
                &core_path,
                &content,
                &MemoryCategory::Core,
            ));
        }

        let mem_dir = self.memory_dir();
        if mem_dir.exists() {
            let mut dir = fs::read_dir(&mem_dir).await?;
            while let Some(entry) = dir.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("md") {
                    let content = fs::read_to_string(&path).await?;
                    entries.extend(Self::parse_entries_from_file(
                        &path,
                        &content,
                        &MemoryCategory::Daily,
                    ));
                }
            }
        }

        // Most recent files first; later duplicates of a key shadow earlier ones
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }
}

fn line_of(entry_id: &str) -> usize {
    entry_id
        .rsplit_once(':')
        .and_then(|(_, line)| line.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl MemoryBackend for MarkdownMemory {
    fn name(&self) -> &str {
        "markdown"
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            backend: "markdown",
            supports_session_store: false,
            supports_keyword_rank: true,
            supports_transactions: false,
            supports_outbox: false,
        }
    }

    async fn store(
        &self,
        key: &str,
        content: &str,
        category: MemoryCategory,
        _session_id: Option<&str>,
    ) -> anyhow::Result<()> {
        validate_key(key)?;

        let line = format!("- **{key}**: {content}");
        let path = match category {
            MemoryCategory::Core => self.core_path(),
            _ => self.daily_path(),
        };
        self.append_to_file(&path, &line).await
    }

    async fn recall(
        &self,
        query: &str,
        limit: usize,
        _session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let query_lower = query.to_lowercase();
        let keywords: Vec<&str> = query_lower.split_whitespace().collect();
        if keywords.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let all = self.read_all_entries().await?;
        let mut scored: Vec<MemoryEntry> = all
            .into_iter()
            .filter_map(|mut entry| {
                let content_lower = entry.content.to_lowercase();
                let matched = keywords
                    .iter()
                    .filter(|kw| content_lower.contains(**kw))
                    .count();
                if matched > 0 {
                    #[allow(clippy::cast_precision_loss)]
                    let score = matched as f64 / keywords.len() as f64;
                    entry.score = Some(score);
                    Some(entry)
                } else {
                    None
                }
            })
            .collect();

        // Score first, recency breaks ties (read_all_entries is recency-sorted)
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit);
        Ok(scored)
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<MemoryEntry>> {
        let all = self.read_all_entries().await?;
        // Overwrites append a fresh bullet, so the newest occurrence of a
        // key (latest file, latest line) is the current value
        Ok(all
            .into_iter()
            .filter(|e| e.key == key)
            .max_by_key(|e| (e.timestamp.clone(), line_of(&e.id))))
    }

    async fn list(
        &self,
        category: Option<&MemoryCategory>,
        _session_id: Option<&str>,
    ) -> anyhow::Result<Vec<MemoryEntry>> {
        let all = self.read_all_entries().await?;
        match category {
            Some(cat) => Ok(all.into_iter().filter(|e| &e.category == cat).collect()),
            None => Ok(all),
        }
    }

    async fn forget(&self, _key: &str) -> anyhow::Result<bool> {
        // Append-only audit trail: nothing is removed
        Ok(false)
    }

    async fn count(&self) -> anyhow::Result<usize> {
        Ok(self.read_all_entries().await?.len())
    }

    async fn health_check(&self) -> bool {
        self.workspace_dir.exists()
    }
}
