//! Per-service download cache: a JSON document of completed downloads, read
//! at run start and rewritten atomically after each completion.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::title::Title;

use super::{OrchestratorError, OrchestratorResult};

/// Identity of a download within and across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub service: String,
    pub title: String,
    pub season: u32,
    pub number: u32,
    pub id: String,
}

impl CacheKey {
    pub fn for_title(title: &Title) -> Self {
        Self {
            service: title.service().to_string(),
            title: title.show_title().to_string(),
            season: title.season(),
            number: title.number(),
            id: title.id().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRecord {
    #[serde(flatten)]
    pub key: CacheKey,
    pub filename: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DownloadCache {
    path: PathBuf,
    records: Vec<CacheRecord>,
}

impl DownloadCache {
    /// Loads the cache file; a missing file is an empty cache.
    pub fn load<P: AsRef<Path>>(path: P) -> OrchestratorResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|err| {
                OrchestratorError::Cache(format!("{}: {err}", path.display()))
            })?,
            Err(_) => Vec::new(),
        };
        Ok(Self { path, records })
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.records.iter().any(|record| &record.key == key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn insert(&mut self, key: CacheKey, filename: String) {
        if self.contains(&key) {
            return;
        }
        self.records.push(CacheRecord {
            key,
            filename,
            completed_at: Utc::now(),
        });
    }

    /// Atomic rewrite: serialize next to the live file, then rename over it.
    pub fn persist(&self) -> OrchestratorResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| OrchestratorError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let rendered = serde_json::to_string_pretty(&self.records)
            .map_err(|err| OrchestratorError::Cache(err.to_string()))?;
        let temp = self.path.with_extension("json.tmp");
        fs::write(&temp, rendered).map_err(|source| OrchestratorError::Io {
            path: temp.clone(),
            source,
        })?;
        fs::rename(&temp, &self.path).map_err(|source| OrchestratorError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::title::Episode;

    fn key() -> CacheKey {
        CacheKey {
            service: "CTV".into(),
            title: "Show".into(),
            season: 1,
            number: 3,
            id: "101".into(),
        }
    }

    #[test]
    fn missing_file_is_an_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DownloadCache::load(dir.path().join("cache.json")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_persist_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let mut cache = DownloadCache::load(&path).unwrap();
        cache.insert(key(), "Show.S01E03.mkv".into());
        cache.insert(key(), "Show.S01E03.mkv".into());
        assert_eq!(cache.len(), 1);
        cache.persist().unwrap();

        let reloaded = DownloadCache::load(&path).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.contains(&key()));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn key_identity_tracks_the_documented_tuple() {
        let episode = Episode {
            id: "101".into(),
            service: "CTV".into(),
            title: "Show".into(),
            season: 1,
            number: 3,
            name: "Whatever".into(),
            ..Episode::default()
        };
        let from_title = CacheKey::for_title(&Title::Episode(episode));
        assert_eq!(from_title, key());
    }

    #[test]
    fn corrupt_cache_is_an_error_not_a_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(DownloadCache::load(&path).is_err());
    }
}
