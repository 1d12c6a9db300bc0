use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_TEMPLATE: &str =
    "{title}.S{season:02}E{episode:02}.{name}.{resolution}.{service}.{audio}";

const DEFAULT_MOVIE_TEMPLATE: &str = "{title}.{year}.{resolution}.{service}.{audio}";

/// Global defaults from `config.yaml` at the project root. Every field has a
/// default so a missing file yields a usable configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GlobalConfig {
    pub downloads_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub filename_template: String,
    pub movie_filename_template: String,
    pub season_folders: bool,
    pub threads: u32,
    pub format: String,
    pub muxer: String,
    pub downloader: String,
    pub select_video: String,
    pub select_audio: String,
    pub select_subtitle: String,
    pub drop_video: Option<String>,
    pub drop_audio: Option<String>,
    pub drop_subtitle: Option<String>,
    pub user_agent: String,
    pub cdm: CdmSection,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("downloads"),
            temp_dir: PathBuf::from("tmp"),
            filename_template: DEFAULT_TEMPLATE.to_string(),
            movie_filename_template: DEFAULT_MOVIE_TEMPLATE.to_string(),
            season_folders: true,
            threads: 16,
            format: "mkv".to_string(),
            muxer: "ffmpeg".to_string(),
            downloader: "N_m3u8DL-RE".to_string(),
            select_video: "res=best".to_string(),
            select_audio: "all".to_string(),
            select_subtitle: "all".to_string(),
            drop_video: None,
            drop_audio: None,
            drop_subtitle: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            cdm: CdmSection::default(),
        }
    }
}

impl GlobalConfig {
    /// Per-service overrides merged over the global defaults. CLI overrides
    /// are applied later by the orchestrator and win over both.
    pub fn merged(mut self, overrides: ServiceOverrides) -> Self {
        if let Some(value) = overrides.downloads_dir {
            self.downloads_dir = value;
        }
        if let Some(value) = overrides.filename_template {
            self.filename_template = value;
        }
        if let Some(value) = overrides.movie_filename_template {
            self.movie_filename_template = value;
        }
        if let Some(value) = overrides.season_folders {
            self.season_folders = value;
        }
        if let Some(value) = overrides.threads {
            self.threads = value;
        }
        if let Some(value) = overrides.format {
            self.format = value;
        }
        if let Some(value) = overrides.muxer {
            self.muxer = value;
        }
        if let Some(value) = overrides.downloader {
            self.downloader = value;
        }
        if let Some(value) = overrides.select_video {
            self.select_video = value;
        }
        if let Some(value) = overrides.select_audio {
            self.select_audio = value;
        }
        if let Some(value) = overrides.select_subtitle {
            self.select_subtitle = value;
        }
        if overrides.drop_video.is_some() {
            self.drop_video = overrides.drop_video;
        }
        if overrides.drop_audio.is_some() {
            self.drop_audio = overrides.drop_audio;
        }
        if overrides.drop_subtitle.is_some() {
            self.drop_subtitle = overrides.drop_subtitle;
        }
        if let Some(value) = overrides.user_agent {
            self.user_agent = value;
        }
        if let Some(value) = overrides.cdm {
            self.cdm = value;
        }
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CdmSection {
    /// Base URL of a pywidevine-serve compatible endpoint. When unset, a
    /// local device under `utils/wvd/` is expected and a serve instance on
    /// localhost is assumed.
    pub api: Option<String>,
    pub device: Option<String>,
    pub secret: Option<String>,
}

/// Optional `services/<svc>/config.yaml`. Same keys as the global file, all
/// optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServiceOverrides {
    pub downloads_dir: Option<PathBuf>,
    pub filename_template: Option<String>,
    pub movie_filename_template: Option<String>,
    pub season_folders: Option<bool>,
    pub threads: Option<u32>,
    pub format: Option<String>,
    pub muxer: Option<String>,
    pub downloader: Option<String>,
    pub select_video: Option<String>,
    pub select_audio: Option<String>,
    pub select_subtitle: Option<String>,
    pub drop_video: Option<String>,
    pub drop_audio: Option<String>,
    pub drop_subtitle: Option<String>,
    pub user_agent: Option<String>,
    pub cdm: Option<CdmSection>,
}

/// `services/<svc>/profile.yaml`: stored credentials plus the cached bearer
/// token written back after an authentication flow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_cache: Option<AuthCache>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthCache {
    pub token: String,
    pub expiry: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

impl AuthCache {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

pub fn load_global_config<P: AsRef<Path>>(path: P) -> Result<GlobalConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(GlobalConfig::default());
    }
    parse_yaml(path)
}

pub fn load_service_overrides<P: AsRef<Path>>(path: P) -> Result<ServiceOverrides> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(ServiceOverrides::default());
    }
    parse_yaml(path)
}

pub fn load_profile<P: AsRef<Path>>(path: P) -> Result<Option<Profile>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    parse_yaml(path).map(Some)
}

pub fn save_profile<P: AsRef<Path>>(path: P, profile: &Profile) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            source,
            path: parent.to_path_buf(),
        })?;
    }
    let rendered = serde_yaml::to_string(profile).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })?;
    fs::write(path, rendered).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })
}

fn parse_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_global_config_falls_back_to_defaults() {
        let config = load_global_config("does/not/exist.yaml").unwrap();
        assert_eq!(config.format, "mkv");
        assert_eq!(config.threads, 16);
        assert!(config.season_folders);
    }

    #[test]
    fn service_overrides_win_over_global() {
        let overrides: ServiceOverrides =
            serde_yaml::from_str("format: mp4\nselect_audio: \"lang=en\"\n").unwrap();
        let merged = GlobalConfig::default().merged(overrides);
        assert_eq!(merged.format, "mp4");
        assert_eq!(merged.select_audio, "lang=en");
        assert_eq!(merged.muxer, "ffmpeg");
    }

    #[test]
    fn profile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.yaml");
        let profile = Profile {
            username: Some("user@example.com".into()),
            password: Some("hunter2".into()),
            auth_cache: Some(AuthCache {
                token: "abc".into(),
                expiry: Utc::now() + chrono::Duration::hours(1),
                refresh: None,
            }),
        };
        save_profile(&path, &profile).unwrap();
        let loaded = load_profile(&path).unwrap().unwrap();
        assert_eq!(loaded.username.as_deref(), Some("user@example.com"));
        assert!(!loaded.auth_cache.unwrap().expired(Utc::now()));
    }
}
