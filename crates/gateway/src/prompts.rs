//! Instruction-template cache for the ChatGPT Codex backend.
//!
//! The openai-web path wraps requests in an `instructions` envelope whose
//! text is published upstream per model family. Templates are cached on disk
//! under `~/.llmux/cache/` with a 15-minute TTL and revalidated with
//! `If-None-Match`; when the network is down a stale copy (or a built-in
//! default) is served instead.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Fallback instructions when no template was ever fetched.
const DEFAULT_INSTRUCTIONS: &str = "You are a coding assistant. Answer precisely and prefer minimal, correct \
                                    changes over speculation.";

/// Cache entries older than this are revalidated.
const TTL: Duration = Duration::from_secs(15 * 60);

/// Model-family table, checked in order; first prefix match wins.
const FAMILIES: &[(&str, &str)] = &[
    ("gpt-5.2-codex", "gpt-5.2-codex"),
    ("codex-max", "codex-max"),
    ("gpt-5.2", "gpt-5.2"),
    ("gpt-5.1", "gpt-5.1"),
    ("codex", "codex"),
];

/// Map a model name to its template family.
pub fn model_family(model: &str) -> &'static str {
    FAMILIES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|&(_, family)| family)
        .unwrap_or("codex")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheMeta {
    etag: Option<String>,
    /// Upstream template version; a tag change invalidates the ETag.
    tag: String,
    /// Unix milliseconds of the last successful check.
    last_checked: i64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    body: String,
    meta: CacheMeta,
}

impl CacheEntry {
    fn is_fresh(&self, now_ms: i64) -> bool {
        now_ms - self.meta.last_checked < TTL.as_millis() as i64
    }
}

/// Disk-persisted template cache keyed by model family.
pub struct PromptCache {
    dir: PathBuf,
    base_url: String,
    tag: String,
    client: reqwest::Client,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl PromptCache {
    /// A cache rooted at `dir`, fetching templates from
    /// `{base_url}/{tag}/{family}-instructions.md`.
    pub fn new(dir: PathBuf, base_url: String, tag: String, client: reqwest::Client) -> Self {
        Self {
            dir,
            base_url,
            tag,
            client,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The cache at its default location, `~/.llmux/cache`.
    pub fn default_location(base_url: String, tag: String, client: reqwest::Client) -> Self {
        let dir = dirs::home_dir()
            .map(|home| home.join(".llmux").join("cache"))
            .unwrap_or_else(|| PathBuf::from(".llmux/cache"));

        Self::new(dir, base_url, tag, client)
    }

    /// Instruction text for a model, served from cache when fresh.
    pub async fn instructions_for_model(&self, model: &str) -> String {
        let family = model_family(model);
        let now_ms = jiff::Timestamp::now().as_millisecond();

        // Fast path: fresh in memory.
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(family)
                && entry.is_fresh(now_ms)
            {
                return entry.body.clone();
            }
        }

        let mut entries = self.entries.write().await;

        // Someone else may have refreshed while we waited for the lock.
        if let Some(entry) = entries.get(family)
            && entry.is_fresh(now_ms)
        {
            return entry.body.clone();
        }

        let disk = entries.get(family).cloned().or_else(|| self.load_from_disk(family));

        if let Some(entry) = &disk
            && entry.is_fresh(now_ms)
        {
            entries.insert(family.to_string(), entry.clone());
            return entry.body.clone();
        }

        match self.fetch(family, disk.as_ref()).await {
            Ok(Some(mut entry)) => {
                entry.meta.last_checked = now_ms;
                self.persist(family, &entry);
                let body = entry.body.clone();
                entries.insert(family.to_string(), entry);
                body
            }
            // 304: the stale copy is still current; only bump the check time.
            Ok(None) => {
                if let Some(mut entry) = disk {
                    entry.meta.last_checked = now_ms;
                    self.persist(family, &entry);
                    let body = entry.body.clone();
                    entries.insert(family.to_string(), entry);
                    body
                } else {
                    DEFAULT_INSTRUCTIONS.to_string()
                }
            }
            Err(e) => {
                log::warn!("Failed to fetch instructions template for '{family}': {e}");
                disk.map(|entry| entry.body).unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string())
            }
        }
    }

    /// Fetch the template. `Ok(None)` means 304 Not Modified.
    async fn fetch(&self, family: &str, cached: Option<&CacheEntry>) -> reqwest::Result<Option<CacheEntry>> {
        let url = format!("{}/{}/{family}-instructions.md", self.base_url, self.tag);

        let mut request = self.client.get(&url);

        // The ETag only holds within one upstream tag; corrupt metadata or a
        // tag bump invalidates it.
        if let Some(entry) = cached
            && entry.meta.tag == self.tag
            && let Some(etag) = &entry.meta.etag
        {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(None);
        }

        let response = response.error_for_status()?;

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response.text().await?;

        Ok(Some(CacheEntry {
            body,
            meta: CacheMeta {
                etag,
                tag: self.tag.clone(),
                last_checked: 0,
            },
        }))
    }

    fn body_path(&self, family: &str) -> PathBuf {
        self.dir.join(format!("{family}-instructions.md"))
    }

    fn meta_path(&self, family: &str) -> PathBuf {
        self.dir.join(format!("{family}-meta.json"))
    }

    fn load_from_disk(&self, family: &str) -> Option<CacheEntry> {
        let body = std::fs::read_to_string(self.body_path(family)).ok()?;

        let meta = std::fs::read_to_string(self.meta_path(family))
            .ok()
            .and_then(|content| serde_json::from_str::<CacheMeta>(&content).ok())
            // Corrupt metadata: keep the body but force revalidation.
            .unwrap_or(CacheMeta {
                etag: None,
                tag: String::new(),
                last_checked: 0,
            });

        Some(CacheEntry { body, meta })
    }

    fn persist(&self, family: &str, entry: &CacheEntry) {
        if let Err(e) = std::fs::create_dir_all(&self.dir) {
            log::warn!("Failed to create prompt cache dir: {e}");
            return;
        }

        if let Err(e) = std::fs::write(self.body_path(family), &entry.body) {
            log::warn!("Failed to persist instructions template: {e}");
        }

        match serde_json::to_string_pretty(&entry.meta) {
            Ok(meta) => {
                if let Err(e) = std::fs::write(self.meta_path(family), meta) {
                    log::warn!("Failed to persist template metadata: {e}");
                }
            }
            Err(e) => log::warn!("Failed to serialize template metadata: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_table_order() {
        assert_eq!(model_family("gpt-5.2-codex-high"), "gpt-5.2-codex");
        assert_eq!(model_family("gpt-5.2-turbo"), "gpt-5.2");
        assert_eq!(model_family("gpt-5.1"), "gpt-5.1");
        assert_eq!(model_family("codex-max-large"), "codex-max");
        assert_eq!(model_family("codex-mini"), "codex");
        assert_eq!(model_family("anything-else"), "codex");
    }

    #[tokio::test]
    async fn unreachable_upstream_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PromptCache::new(
            dir.path().to_path_buf(),
            // Reserved TEST-NET address; connection fails immediately-ish.
            "http://192.0.2.1:1".to_string(),
            "v1".to_string(),
            reqwest::Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .unwrap(),
        );

        let instructions = cache.instructions_for_model("codex-mini").await;
        assert_eq!(instructions, DEFAULT_INSTRUCTIONS);
    }

    #[tokio::test]
    async fn stale_disk_copy_beats_default_on_network_failure() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(dir.path().join("codex-instructions.md"), "cached template").unwrap();
        std::fs::write(
            dir.path().join("codex-meta.json"),
            r#"{"etag": null, "tag": "v1", "last_checked": 0}"#,
        )
        .unwrap();

        let cache = PromptCache::new(
            dir.path().to_path_buf(),
            "http://192.0.2.1:1".to_string(),
            "v1".to_string(),
            reqwest::Client::builder()
                .timeout(Duration::from_millis(200))
                .build()
                .unwrap(),
        );

        let instructions = cache.instructions_for_model("codex-mini").await;
        assert_eq!(instructions, "cached template");
    }

    #[tokio::test]
    async fn fresh_disk_copy_is_served_without_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let now = jiff::Timestamp::now().as_millisecond();

        std::fs::write(dir.path().join("codex-instructions.md"), "fresh template").unwrap();
        std::fs::write(
            dir.path().join("codex-meta.json"),
            format!(r#"{{"etag": "\"abc\"", "tag": "v1", "last_checked": {now}}}"#),
        )
        .unwrap();

        let cache = PromptCache::new(
            dir.path().to_path_buf(),
            // Never contacted; a panic-on-connect URL would still pass.
            "http://192.0.2.1:1".to_string(),
            "v1".to_string(),
            reqwest::Client::new(),
        );

        assert_eq!(cache.instructions_for_model("codex-mini").await, "fresh template");
    }
}
