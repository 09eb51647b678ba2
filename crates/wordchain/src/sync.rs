use anyhow::{Context, Result};
use common::config::DataPaths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Remote list names and their cache targets. The game must keep working
/// when the network doesn't: every failure degrades to the local files.
const LIST_NAMES: [&str; 2] = ["suggestion", "blue_archive_words"];

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListMeta {
    pub sha256: Option<String>,
    pub updated_at: Option<String>,
    pub count: Option<i64>,
    pub filename: Option<String>,
}

pub type MetaMap = HashMap<String, ListMeta>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub synced: bool,
    pub changed_lists: Vec<String>,
    pub reason: String,
}

impl SyncOutcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            synced: false,
            changed_lists: vec![],
            reason: reason.into(),
        }
    }
}

pub fn load_local_meta(path: &Path) -> MetaMap {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

pub fn save_local_meta(path: &Path, meta: &MetaMap) -> Result<()> {
    let body = serde_json::to_vec_pretty(meta)?;
    atomic_write(path, &body)
}

/// Write-to-temp then rename, so readers never observe a half-written file.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().context("target path has no parent")?;
    std::fs::create_dir_all(dir)?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(tmp.path(), data)?;
    tmp.persist(path)
        .with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

fn cache_target(paths: &DataPaths, list_name: &str) -> PathBuf {
    match list_name {
        "suggestion" => paths.cached_suggestions_file(),
        _ => paths.cached_words_file(),
    }
}

fn non_empty_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

/// Word-file candidates, cache first, bundled fallback second. Paths that
/// don't exist are fine; the index loader skips them.
pub fn effective_word_paths(paths: &DataPaths) -> Vec<PathBuf> {
    let words = if non_empty_file(&paths.cached_words_file()) {
        paths.cached_words_file()
    } else {
        paths.words_file()
    };
    let suggestions = effective_suggestion_path(paths);
    vec![words, suggestions]
}

pub fn effective_suggestion_path(paths: &DataPaths) -> PathBuf {
    if non_empty_file(&paths.cached_suggestions_file()) {
        paths.cached_suggestions_file()
    } else {
        paths.suggestions_file()
    }
}

async fn http_get(
    client: &reqwest::Client,
    url: &str,
    token: Option<&str>,
    timeout: std::time::Duration,
) -> Result<Vec<u8>> {
    let mut req = client.get(url).timeout(timeout);
    if let Some(token) = token {
        req = req.header("X-Wordlist-Token", token);
    }
    let resp = req.send().await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}

/// Refresh the wordlist cache from the remote source.
///
/// Policy: fetch `{base}/meta`, compare each list's remote sha256 to the one
/// recorded locally, download only what changed (or everything with
/// `force`), atomic-write-by-rename, then persist the new meta. Never
/// returns an error for network trouble — the caller just keeps playing from
/// local files.
pub async fn sync_wordlists(
    base_url: Option<&str>,
    token: Option<&str>,
    paths: &DataPaths,
    force: bool,
) -> SyncOutcome {
    let Some(base_url) = base_url.map(|u| u.trim_end_matches('/')) else {
        return SyncOutcome::skipped("no base url");
    };

    let client = reqwest::Client::new();
    let meta_url = format!("{base_url}/meta");
    let remote_meta: MetaMap = match http_get(
        &client,
        &meta_url,
        token,
        std::time::Duration::from_secs(5),
    )
    .await
    .and_then(|body| Ok(serde_json::from_slice(&body)?))
    {
        Ok(meta) => meta,
        Err(e) => {
            tracing::warn!(error = %e, "wordlist meta fetch failed");
            return SyncOutcome::skipped(format!("meta fetch failed: {e}"));
        }
    };

    let local_meta = load_local_meta(&paths.wordlist_meta_file());
    let mut changed_lists = Vec::new();

    for list_name in LIST_NAMES {
        let Some(remote) = remote_meta.get(list_name) else {
            continue;
        };
        let remote_sha = remote.sha256.as_deref().unwrap_or("");
        let local_sha = local_meta
            .get(list_name)
            .and_then(|m| m.sha256.as_deref())
            .unwrap_or("");

        let target = cache_target(paths, list_name);
        let need =
            force || !target.exists() || (!remote_sha.is_empty() && remote_sha != local_sha);
        if !need {
            continue;
        }

        let url = format!("{base_url}/{list_name}.txt");
        match http_get(&client, &url, token, std::time::Duration::from_secs(10)).await {
            Ok(body) if !body.is_empty() => match atomic_write(&target, &body) {
                Ok(()) => changed_lists.push(list_name.to_string()),
                Err(e) => tracing::warn!(list_name, error = %e, "wordlist cache write failed"),
            },
            Ok(_) => tracing::warn!(list_name, "wordlist download was empty, keeping cache"),
            // One failed list doesn't stop the others.
            Err(e) => tracing::warn!(list_name, error = %e, "wordlist download failed"),
        }
    }

    if !changed_lists.is_empty() {
        let mut saved = MetaMap::new();
        for name in LIST_NAMES {
            if let Some(m) = remote_meta.get(name) {
                saved.insert(name.to_string(), m.clone());
            }
        }
        if let Err(e) = save_local_meta(&paths.wordlist_meta_file(), &saved) {
            tracing::warn!(error = %e, "wordlist meta save failed");
        }
    }

    let reason = if changed_lists.is_empty() {
        "up-to-date".to_string()
    } else {
        "ok".to_string()
    };
    SyncOutcome {
        synced: true,
        changed_lists,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> (tempfile::TempDir, DataPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path());
        paths.ensure_dirs().unwrap();
        (dir, paths)
    }

    #[test]
    fn test_atomic_write_round_trip() {
        let (_dir, paths) = temp_paths();
        let target = paths.cached_words_file();
        atomic_write(&target, "기차\n바다\n".as_bytes()).unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "기차\n바다\n");

        // Overwrite is atomic too.
        atomic_write(&target, b"replaced").unwrap();
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "replaced");
    }

    #[test]
    fn test_meta_round_trip() {
        let (_dir, paths) = temp_paths();
        let mut meta = MetaMap::new();
        meta.insert(
            "suggestion".to_string(),
            ListMeta {
                sha256: Some("abc123".to_string()),
                updated_at: None,
                count: Some(42),
                filename: Some("suggestion.txt".to_string()),
            },
        );
        save_local_meta(&paths.wordlist_meta_file(), &meta).unwrap();
        assert_eq!(load_local_meta(&paths.wordlist_meta_file()), meta);
    }

    #[test]
    fn test_load_meta_tolerates_garbage() {
        let (_dir, paths) = temp_paths();
        std::fs::write(paths.wordlist_meta_file(), "{not json").unwrap();
        assert!(load_local_meta(&paths.wordlist_meta_file()).is_empty());
        assert!(load_local_meta(Path::new("/nonexistent/meta.json")).is_empty());
    }

    #[test]
    fn test_effective_paths_prefer_cache() {
        let (_dir, paths) = temp_paths();

        // No cache yet: bundled files win.
        assert_eq!(effective_word_paths(&paths)[0], paths.words_file());
        assert_eq!(effective_suggestion_path(&paths), paths.suggestions_file());

        // Empty cache files still don't count.
        std::fs::write(paths.cached_words_file(), b"").unwrap();
        assert_eq!(effective_word_paths(&paths)[0], paths.words_file());

        std::fs::write(paths.cached_words_file(), "기차\n").unwrap();
        std::fs::write(paths.cached_suggestions_file(), "바다\n").unwrap();
        assert_eq!(effective_word_paths(&paths)[0], paths.cached_words_file());
        assert_eq!(
            effective_suggestion_path(&paths),
            paths.cached_suggestions_file()
        );
    }

    #[tokio::test]
    async fn test_sync_without_base_url_is_disabled() {
        let (_dir, paths) = temp_paths();
        let outcome = sync_wordlists(None, None, &paths, false).await;
        assert!(!outcome.synced);
        assert_eq!(outcome.reason, "no base url");
    }
}
